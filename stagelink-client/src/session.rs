//! Sync session
//!
//! Wires the notify listener, control channel, dispatcher and composer
//! together. Startup binds the notify endpoint, announces it over the control
//! channel and asks for the full scene; the loop then drains pushes and
//! rebuilds the composed document whenever the cache changed.

use std::path::PathBuf;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use stagelink_protocol::Endpoint;
use stagelink_utils::Result;

use crate::cache::LayerCache;
use crate::composer::{DocumentComposer, LayerStore, Rebuild, StageObserver};
use crate::connection::{ChannelRole, Connector, ControlChannel, HostConnector, NotifyListener, RequestPolicy};
use crate::dispatch::{Dispatcher, Outcome};

/// Default pause between sync cycles once the scene is populated
pub const DEFAULT_RENDER_INTERVAL: Duration = Duration::from_millis(1000);

/// Everything a session needs to start
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    /// Host control endpoint
    pub control: Endpoint,
    /// Local endpoint the notify listener binds
    pub notify_bind: Endpoint,
    pub role: ChannelRole,
    /// Directory receiving layer files and the composed document
    pub output_dir: PathBuf,
    /// Adopt a composed document someone else created instead of writing one
    pub existing_document: bool,
    pub policy: RequestPolicy,
    pub render_interval: Duration,
}

impl SessionSettings {
    pub fn new(control: Endpoint, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            control,
            notify_bind: Endpoint::ephemeral_loopback(),
            role: ChannelRole::default(),
            output_dir: output_dir.into(),
            existing_document: false,
            policy: RequestPolicy::default(),
            render_interval: DEFAULT_RENDER_INTERVAL,
        }
    }
}

/// Result of one sync cycle
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StepReport {
    /// Messages dispatched this cycle
    pub outcomes: Vec<Outcome>,
    /// Set when the composed document was rewritten
    pub rebuilt: Option<Rebuild>,
}

/// A connected sync client
pub struct Session<C: Connector> {
    control: ControlChannel<C>,
    notify: NotifyListener,
    dispatcher: Dispatcher,
    composer: DocumentComposer,
    cache: LayerCache,
    observer: Option<Box<dyn StageObserver>>,
    render_interval: Duration,
    cancel: CancellationToken,
}

impl Session<HostConnector> {
    /// Start a session against a real host
    pub async fn connect(settings: SessionSettings, cancel: CancellationToken) -> Result<Self> {
        let connector = HostConnector::new(settings.control.clone());
        Self::start(connector, settings, cancel).await
    }
}

impl<C: Connector> Session<C> {
    /// Bind, handshake and request the initial scene
    ///
    /// Binding and the handshake are fatal on failure. The initial scene
    /// request is not: the host may still push layers later.
    pub async fn start(connector: C, settings: SessionSettings, cancel: CancellationToken) -> Result<Self> {
        let notify = NotifyListener::bind(&settings.notify_bind, settings.role, cancel.child_token()).await?;

        let store = LayerStore::new(&settings.output_dir);
        let composer = if settings.existing_document {
            DocumentComposer::open(store.clone())
        } else {
            DocumentComposer::create(store.clone())?
        };

        let mut control = ControlChannel::connect(connector, settings.policy, cancel.clone()).await;
        let notify_address = notify.address().to_string();
        if let Err(e) = control.init_notify(&notify_address).await {
            error!(host = %control.address(), error = %e, "Handshake failed");
            return Err(e);
        }
        info!(
            host = %control.address(),
            notify = %notify_address,
            role = ?notify.role(),
            "Connected to host"
        );

        match control.get_stage().await {
            Ok(reply) => debug!(%reply, "Initial scene requested"),
            Err(e) => warn!(error = %e, "Initial scene request failed, waiting for pushes"),
        }

        Ok(Self {
            control,
            notify,
            dispatcher: Dispatcher::new(store),
            composer,
            cache: LayerCache::new(),
            observer: None,
            render_interval: settings.render_interval,
            cancel,
        })
    }

    /// Run `observer` after every successful rebuild
    pub fn set_observer(&mut self, observer: impl StageObserver + 'static) {
        self.observer = Some(Box::new(observer));
    }

    pub fn cache(&self) -> &LayerCache {
        &self.cache
    }

    pub fn composer(&self) -> &DocumentComposer {
        &self.composer
    }

    pub fn notify_address(&self) -> &Endpoint {
        self.notify.address()
    }

    pub fn control(&mut self) -> &mut ControlChannel<C> {
        &mut self.control
    }

    /// One sync cycle: drain pending pushes, then rebuild if needed
    ///
    /// While the mirror is empty and there is nothing to rebuild, waits for
    /// the first push (or cancellation) instead of returning empty-handed.
    pub async fn step(&mut self) -> StepReport {
        let mut report = StepReport::default();

        loop {
            let block = self.cache.is_empty() && !self.cache.is_dirty();
            let Some(inbound) = self.notify.poll(block).await else {
                break;
            };
            let outcome = self
                .dispatcher
                .dispatch(inbound, &mut self.cache, &mut self.control)
                .await;
            trace!(?outcome, "Notify message dispatched");
            report.outcomes.push(outcome);
        }

        // A failed rebuild keeps the cache dirty and is retried next cycle
        if let Ok(Some(rebuild)) = self.composer.rebuild(&mut self.cache) {
            if let Some(observer) = self.observer.as_mut() {
                observer.stage_updated(&rebuild.document, rebuild.sublayers);
            }
            report.rebuilt = Some(rebuild);
        }
        report
    }

    /// Loop until cancelled, then say goodbye to the host
    pub async fn run(&mut self) {
        info!(output = %self.composer.store().root().display(), "Sync loop started");

        while !self.cancel.is_cancelled() {
            self.step().await;

            if self.cache.is_empty() && !self.cache.is_dirty() {
                continue;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.render_interval) => {}
            }
        }

        self.control.disconnect().await;
        info!("Sync loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use futures::{SinkExt, StreamExt};
    use stagelink_protocol::{Multipart, MultipartCodec};
    use stagelink_utils::StagelinkError;
    use tokio::io::DuplexStream;
    use tokio::net::TcpStream;
    use tokio_util::codec::Framed;

    /// In-memory control host answering `ok`, or `fail` to the handshake when
    /// `reject` is set; it records the announced notify address.
    #[derive(Default, Clone)]
    struct FakeHost {
        reject: bool,
        announced: Arc<Mutex<Option<String>>>,
        requests: Arc<Mutex<Vec<Multipart>>>,
    }

    impl Connector for FakeHost {
        type Stream = DuplexStream;

        fn address(&self) -> String {
            "tcp://host.test:5555".into()
        }

        async fn connect(&mut self) -> Result<DuplexStream> {
            let (client, host) = tokio::io::duplex(4096);
            let state = self.clone();
            tokio::spawn(async move {
                let mut framed = Framed::new(host, MultipartCodec::new());
                while let Some(Ok(msg)) = framed.next().await {
                    let reply = if msg.command() == Some("initNotifySocket") {
                        let address = String::from_utf8_lossy(&msg.frames()[1]).to_string();
                        *state.announced.lock().unwrap() = Some(address);
                        if state.reject {
                            "fail"
                        } else {
                            "ok"
                        }
                    } else {
                        "ok"
                    };
                    state.requests.lock().unwrap().push(msg);
                    if framed.send(Multipart::from(reply)).await.is_err() {
                        break;
                    }
                }
            });
            Ok(client)
        }
    }

    fn settings(dir: &std::path::Path) -> SessionSettings {
        let mut settings = SessionSettings::new(Endpoint::parse("tcp://host.test:5555").unwrap(), dir);
        settings.render_interval = Duration::from_millis(10);
        settings
    }

    async fn push_to(address: &Endpoint) -> Framed<TcpStream, MultipartCodec> {
        let stream = TcpStream::connect(address.socket_addr().unwrap()).await.unwrap();
        Framed::new(stream, MultipartCodec::new())
    }

    #[tokio::test]
    async fn test_start_announces_and_requests_stage() {
        let tmp = tempfile::tempdir().unwrap();
        let host = FakeHost::default();
        let session = Session::start(host.clone(), settings(tmp.path()), CancellationToken::new())
            .await
            .unwrap();

        let announced = host.announced.lock().unwrap().clone();
        assert_eq!(announced, Some(session.notify_address().to_string()));

        let commands: Vec<String> = host
            .requests
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| m.command().map(str::to_string))
            .collect();
        assert_eq!(commands, vec!["initNotifySocket", "getStage"]);

        // Empty composed document exists before any layer arrives
        assert!(session.composer().document_path().exists());
    }

    #[tokio::test]
    async fn test_existing_document_left_until_first_rebuild() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = settings(tmp.path());
        config.existing_document = true;
        let mut session = Session::start(FakeHost::default(), config, CancellationToken::new())
            .await
            .unwrap();

        let document = session.composer().document_path();
        assert!(!document.exists());

        let mut pusher = push_to(session.notify_address()).await;
        pusher
            .send(Multipart::from_strs(&["layer", "/world", "1", "A"]))
            .await
            .unwrap();
        let report = session.step().await;
        assert!(report.rebuilt.is_some());
        assert!(document.exists());
    }

    #[tokio::test]
    async fn test_rejected_handshake_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let host = FakeHost {
            reject: true,
            ..FakeHost::default()
        };
        let result = Session::start(host, settings(tmp.path()), CancellationToken::new()).await;
        assert!(matches!(result, Err(StagelinkError::HandshakeRejected(_))));
    }

    #[tokio::test]
    async fn test_step_applies_pushes_and_rebuilds() {
        let tmp = tempfile::tempdir().unwrap();
        let mut session = Session::start(FakeHost::default(), settings(tmp.path()), CancellationToken::new())
            .await
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        session.set_observer(move |_: &std::path::Path, layers: usize| sink.lock().unwrap().push(layers));

        let mut pusher = push_to(session.notify_address()).await;
        pusher
            .send(Multipart::from_strs(&["layer", "/world", "5", "#usda 1.0"]))
            .await
            .unwrap();

        // Empty cache: the step waits for the push
        let report = session.step().await;
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.rebuilt.as_ref().map(|r| r.sublayers), Some(1));
        assert_eq!(session.composer().sublayers(), &["/world".to_string()]);
        assert_eq!(*seen.lock().unwrap(), vec![1]);

        // Nothing pending: returns at once, no rebuild
        let report = session.step().await;
        assert!(report.outcomes.is_empty());
        assert_eq!(report.rebuilt, None);
    }

    #[tokio::test]
    async fn test_step_rebuilds_once_per_batch() {
        let tmp = tempfile::tempdir().unwrap();
        let mut session = Session::start(FakeHost::default(), settings(tmp.path()), CancellationToken::new())
            .await
            .unwrap();

        let rebuilds = Arc::new(Mutex::new(0));
        let counter = rebuilds.clone();
        session.set_observer(move |_: &std::path::Path, _: usize| *counter.lock().unwrap() += 1);

        let mut pusher = push_to(session.notify_address()).await;
        for frames in [
            ["layer", "/a", "2", "A"],
            ["layer", "/b", "1", "B"],
            ["layer", "/a", "1", "old"],
        ] {
            pusher.send(Multipart::from_strs(&frames)).await.unwrap();
        }
        // Let the listener queue the whole batch before draining
        tokio::time::sleep(Duration::from_millis(200)).await;

        let report = session.step().await;
        assert_eq!(report.outcomes.len(), 3);
        assert!(matches!(report.outcomes[2], Outcome::Stale { cached: 2, .. }));
        assert_eq!(report.rebuilt.as_ref().map(|r| r.sublayers), Some(2));
        assert_eq!(session.composer().sublayers(), &["/a".to_string(), "/b".to_string()]);
        assert_eq!(*rebuilds.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_step_forwards_layer_edit_to_host() {
        let tmp = tempfile::tempdir().unwrap();
        let host = FakeHost::default();
        let mut session = Session::start(host.clone(), settings(tmp.path()), CancellationToken::new())
            .await
            .unwrap();

        let mut pusher = push_to(session.notify_address()).await;
        pusher
            .send(Multipart::from_strs(&["layerEdit", "/world", "3"]))
            .await
            .unwrap();
        pusher
            .send(Multipart::from_strs(&["layer", "/world", "3", "A"]))
            .await
            .unwrap();

        let mut outcomes = Vec::new();
        while outcomes.len() < 2 {
            outcomes.extend(session.step().await.outcomes);
        }
        assert!(matches!(outcomes[0], Outcome::Fetched { .. }));
        assert!(host
            .requests
            .lock()
            .unwrap()
            .iter()
            .any(|m| m.command() == Some("getLayer /world")));
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel_and_disconnects() {
        let tmp = tempfile::tempdir().unwrap();
        let host = FakeHost::default();
        let cancel = CancellationToken::new();
        let mut session = Session::start(host.clone(), settings(tmp.path()), cancel.clone())
            .await
            .unwrap();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        session.run().await;

        let last = host.requests.lock().unwrap().last().cloned();
        assert_eq!(last, Some(Multipart::from("disconnect")));
    }
}
