//! Control channel client
//!
//! One request is outstanding at a time. A request that gets no reply within
//! the timeout abandons its connection (anything in flight is lost) and, unless
//! it was the last allowed attempt, reconnects before trying again. While the
//! host refuses connections an attempt keeps redialing until its timeout runs
//! out, so a down host costs the same wait as a silent one.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::time::{sleep, sleep_until, timeout_at, Instant};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use stagelink_protocol::{tokens, ControlRequest, Endpoint, Multipart, MultipartCodec, Reply};
use stagelink_utils::{Result, StagelinkError};

/// Default wait for a reply
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2500);

/// Default number of attempts per request
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Wait for the farewell reply during shutdown
const DISCONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Pause between dials while the host refuses connections
const REDIAL_INTERVAL: Duration = Duration::from_millis(100);

/// Trait alias for streams that can be used with Framed
pub trait StreamTrait: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> StreamTrait for T {}

/// Opens connections to the host
pub trait Connector {
    type Stream: AsyncRead + AsyncWrite + Unpin;

    /// Host address for logs and errors
    fn address(&self) -> String;

    /// Open a fresh connection
    fn connect(&mut self) -> impl Future<Output = Result<Self::Stream>>;
}

/// Connector dialing a TCP or Unix socket endpoint
#[derive(Debug, Clone)]
pub struct HostConnector {
    endpoint: Endpoint,
}

impl HostConnector {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }
}

impl Connector for HostConnector {
    type Stream = Box<dyn StreamTrait>;

    fn address(&self) -> String {
        self.endpoint.to_string()
    }

    async fn connect(&mut self) -> Result<Self::Stream> {
        match &self.endpoint {
            Endpoint::Tcp { host, port } => {
                let host = host.trim_start_matches('[').trim_end_matches(']');
                let stream = TcpStream::connect((host, *port)).await.map_err(|e| {
                    StagelinkError::connection(format!("Failed to connect to {}: {}", self.endpoint, e))
                })?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let stream = UnixStream::connect(path).await.map_err(|e| {
                    StagelinkError::connection(format!("Failed to connect to {}: {}", path.display(), e))
                })?;
                Ok(Box::new(stream))
            }
            #[cfg(not(unix))]
            Endpoint::Unix(path) => Err(StagelinkError::connection(format!(
                "Unix sockets are not supported on this platform: {}",
                path.display()
            ))),
        }
    }
}

/// Retry policy for control requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestPolicy {
    /// Attempts before giving up, at least 1
    pub max_retries: u32,
    /// Wait for a reply on each attempt
    pub timeout: Duration,
}

impl Default for RequestPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Result of one send/wait round
enum Attempt {
    Reply(Multipart),
    TimedOut,
    Failed(StagelinkError),
    Cancelled,
}

/// Request/reply client for the host's control endpoint
pub struct ControlChannel<C: Connector> {
    connector: C,
    connection: Option<Framed<C::Stream, MultipartCodec>>,
    policy: RequestPolicy,
    cancel: CancellationToken,
}

impl<C: Connector> ControlChannel<C> {
    /// Create the channel and open the first connection
    ///
    /// A failed dial is not an error here; the first request keeps dialing.
    pub async fn connect(connector: C, policy: RequestPolicy, cancel: CancellationToken) -> Self {
        let mut channel = Self {
            connector,
            connection: None,
            policy,
            cancel,
        };
        let deadline = Instant::now() + policy.timeout;
        match channel.dial(deadline).await {
            Some(Attempt::Failed(e)) => {
                warn!(host = %channel.connector.address(), error = %e, "Failed to open control connection");
            }
            Some(Attempt::TimedOut) => {
                warn!(host = %channel.connector.address(), "Timed out opening control connection");
            }
            _ => {}
        }
        channel
    }

    pub fn address(&self) -> String {
        self.connector.address()
    }

    pub fn policy(&self) -> RequestPolicy {
        self.policy
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Dial once, giving up at `deadline`; `None` once connected
    async fn dial(&mut self, deadline: Instant) -> Option<Attempt> {
        let result = tokio::select! {
            _ = self.cancel.cancelled() => return Some(Attempt::Cancelled),
            result = timeout_at(deadline, self.connector.connect()) => result,
        };

        match result {
            Ok(Ok(stream)) => {
                debug!(host = %self.connector.address(), "Control connection opened");
                self.connection = Some(Framed::new(stream, MultipartCodec::new()));
                None
            }
            Ok(Err(e)) => Some(Attempt::Failed(e)),
            Err(_) => Some(Attempt::TimedOut),
        }
    }

    /// Keep dialing until connected or `deadline` passes
    ///
    /// Returns `None` once connected, otherwise how the attempt ended.
    async fn redial_until(&mut self, deadline: Instant) -> Option<Attempt> {
        loop {
            if self.connection.is_some() {
                return None;
            }
            let failure = self.dial(deadline).await?;
            if !matches!(failure, Attempt::Failed(_)) {
                return Some(failure);
            }

            let now = Instant::now();
            if now >= deadline {
                return Some(failure);
            }
            trace!(host = %self.connector.address(), "Host refused connection, redialing");
            let pause = REDIAL_INTERVAL.min(deadline - now);
            tokio::select! {
                _ = self.cancel.cancelled() => return Some(Attempt::Cancelled),
                _ = sleep(pause) => {}
            }
        }
    }

    /// Send a request and wait for its reply using the channel's policy
    ///
    /// `compose` builds the outbound message and is called again for every
    /// attempt.
    pub async fn request<F>(&mut self, compose: F) -> Result<Multipart>
    where
        F: FnMut() -> Multipart,
    {
        let policy = self.policy;
        self.request_with(policy, compose).await
    }

    /// Like [`ControlChannel::request`] with an explicit policy
    pub async fn request_with<F>(&mut self, policy: RequestPolicy, mut compose: F) -> Result<Multipart>
    where
        F: FnMut() -> Multipart,
    {
        let attempts = policy.max_retries.max(1);

        for attempt in 1..=attempts {
            if self.cancel.is_cancelled() {
                return Err(StagelinkError::Cancelled);
            }
            let deadline = Instant::now() + policy.timeout;

            // The previous attempt, or a previous request, dropped its connection
            let outcome = match self.redial_until(deadline).await {
                Some(failure) => failure,
                None => match self.connection.as_mut() {
                    Some(connection) => {
                        let message = compose();
                        exchange(connection, message, deadline, &self.cancel).await
                    }
                    None => Attempt::Failed(StagelinkError::ConnectionClosed),
                },
            };

            match outcome {
                Attempt::Reply(reply) => return Ok(reply),
                Attempt::Cancelled => return Err(StagelinkError::Cancelled),
                Attempt::TimedOut => {
                    warn!(host = %self.connector.address(), attempt, attempts, "No response from host");
                }
                Attempt::Failed(e) => {
                    warn!(host = %self.connector.address(), attempt, attempts, error = %e, "Control request failed");
                }
            }

            // Abandon the connection without lingering
            self.connection = None;

            // A failed attempt still spends its whole timeout
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(StagelinkError::Cancelled),
                _ = sleep_until(deadline) => {}
            }
        }

        Err(StagelinkError::HostUnreachable {
            address: self.connector.address(),
            attempts,
        })
    }

    /// Announce the notify channel address; the host must answer `ok`
    pub async fn init_notify(&mut self, address: &str) -> Result<()> {
        info!(address, "Announcing notify channel");
        let reply = self
            .request(|| {
                ControlRequest::InitNotifySocket {
                    address: address.to_string(),
                }
                .to_multipart()
            })
            .await?;

        match Reply::parse(&reply) {
            Reply::Ok => Ok(()),
            other => Err(StagelinkError::HandshakeRejected(other.to_string())),
        }
    }

    /// Ask the host to push the full scene
    pub async fn get_stage(&mut self) -> Result<Reply> {
        let reply = self.request(|| ControlRequest::GetStage.to_multipart()).await?;
        Ok(Reply::parse(&reply))
    }

    /// Ask the host to push one layer's current content
    pub async fn get_layer(&mut self, path: &str) -> Result<Reply> {
        let request = ControlRequest::GetLayer {
            path: path.to_string(),
        };
        let reply = self.request(|| request.to_multipart()).await?;
        Ok(Reply::parse(&reply))
    }

    /// Liveness probe, returns the round-trip time including any retries
    pub async fn ping(&mut self) -> Result<Duration> {
        let started = Instant::now();
        let reply = self.request(|| ControlRequest::Ping.to_multipart()).await?;
        match reply.command() {
            Some(tokens::PING) => Ok(started.elapsed()),
            _ => Err(StagelinkError::protocol(format!(
                "unexpected ping reply: {}",
                Reply::parse(&reply)
            ))),
        }
    }

    /// Forward an application command; `true` if the host acknowledged it
    pub async fn send_command(&mut self, name: &str, payload: Option<Bytes>) -> Result<bool> {
        let request = ControlRequest::Command {
            name: name.to_string(),
            payload,
        };
        let reply = Reply::parse(&self.request(|| request.to_multipart()).await?);
        debug!(command = name, %reply, "Host answered command");
        Ok(reply.is_ok())
    }

    /// Tell the host to drop the notify connection
    ///
    /// Runs during shutdown, so it ignores the cancellation token and makes a
    /// single short attempt. Failures are only logged.
    pub async fn disconnect(&mut self) {
        let Some(connection) = self.connection.as_mut() else {
            return;
        };

        let never = CancellationToken::new();
        let deadline = Instant::now() + DISCONNECT_TIMEOUT;
        match exchange(connection, ControlRequest::Disconnect.to_multipart(), deadline, &never).await {
            Attempt::Reply(reply) => debug!(reply = %Reply::parse(&reply), "Host acknowledged disconnect"),
            _ => debug!("Host did not acknowledge disconnect"),
        }
        self.connection = None;
    }
}

/// Send one message and wait for the reply until `deadline`
async fn exchange<S>(
    connection: &mut Framed<S, MultipartCodec>,
    message: Multipart,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Attempt
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let round_trip = async {
        connection
            .send(message)
            .await
            .map_err(|e| StagelinkError::connection(e.to_string()))?;
        match connection.next().await {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(e)) => Err(StagelinkError::connection(e.to_string())),
            None => Err(StagelinkError::ConnectionClosed),
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => Attempt::Cancelled,
        result = timeout_at(deadline, round_trip) => match result {
            Ok(Ok(reply)) => Attempt::Reply(reply),
            Ok(Err(reason)) => Attempt::Failed(reason),
            Err(_) => Attempt::TimedOut,
        },
    }
}

/// Requests a layer's content after an edit notification
pub trait LayerFetcher {
    fn fetch_layer(&mut self, path: &str) -> impl Future<Output = Result<()>>;
}

impl<C: Connector> LayerFetcher for ControlChannel<C> {
    async fn fetch_layer(&mut self, path: &str) -> Result<()> {
        let reply = self.get_layer(path).await?;
        if !reply.is_ok() {
            debug!(path, %reply, "Host did not confirm layer request");
        }
        Ok(())
    }
}
