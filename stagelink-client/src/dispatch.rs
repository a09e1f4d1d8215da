//! Notify command dispatch
//!
//! Applies host pushes to the layer cache and the files below the output
//! directory. Layer content is written to disk before the cache records it, so
//! a failed write leaves the cached version untouched.

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use stagelink_protocol::{tokens, DecodeError, Multipart, NotifyCommand};

use crate::cache::{Layer, LayerCache, Upsert};
use crate::composer::LayerStore;
use crate::connection::{Inbound, LayerFetcher};

/// Cache key for the full document pushed by `getStage`
pub const ROOT_LAYER_PATH: &str = "/";

/// What dispatching one message did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Layer content stored
    Applied { path: String, timestamp: u64 },
    /// Layer dropped from the cache
    Removed { path: String },
    /// Removal of a path that was not cached
    NotCached { path: String },
    /// Update not newer than the cached version
    Stale { path: String, timestamp: u64, cached: u64 },
    /// Edit notification answered with a layer request
    Fetched { path: String, timestamp: u64 },
    /// The layer request failed; a later push can still deliver the content
    FetchFailed { path: String },
    /// Layer file could not be written
    PersistFailed { path: String },
    /// Unknown command name
    Ignored { command: String },
    /// Malformed `getStage`, answered with a failure description
    Rejected { reason: String },
    /// Malformed message, discarded without an answer
    Dropped { reason: String },
}

impl Outcome {
    /// Acknowledgement for the reply-capable role, `None` to stay silent
    pub fn ack(&self) -> Option<String> {
        match self {
            Outcome::Ignored { .. } => Some(tokens::FAIL.to_string()),
            Outcome::Rejected { reason } => Some(format!("{}: {}", tokens::FAIL, reason)),
            Outcome::PersistFailed { path } => Some(format!("{}: could not write {}", tokens::FAIL, path)),
            Outcome::Dropped { .. } => None,
            _ => Some(tokens::OK.to_string()),
        }
    }

    /// Whether the message changed the cache
    pub fn changed_cache(&self) -> bool {
        matches!(self, Outcome::Applied { .. } | Outcome::Removed { .. })
    }
}

/// Routes notify messages to their handlers
#[derive(Debug, Clone)]
pub struct Dispatcher {
    store: LayerStore,
}

impl Dispatcher {
    pub fn new(store: LayerStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &LayerStore {
        &self.store
    }

    /// Handle one inbound message, answering it if it carries a responder
    pub async fn dispatch<F>(&self, inbound: Inbound, cache: &mut LayerCache, fetcher: &mut F) -> Outcome
    where
        F: LayerFetcher,
    {
        let Inbound { frames, reply } = inbound;
        let outcome = self.handle(&frames, cache, fetcher).await;

        if let Some(responder) = reply {
            if let Some(ack) = outcome.ack() {
                if !responder.send(Multipart::from(ack.as_str())) {
                    debug!("Notify peer left before acknowledgement");
                }
            }
        }
        outcome
    }

    async fn handle<F>(&self, frames: &Multipart, cache: &mut LayerCache, fetcher: &mut F) -> Outcome
    where
        F: LayerFetcher,
    {
        let command = match NotifyCommand::decode(frames) {
            Ok(command) => command,
            Err(DecodeError::UnknownCommand(command)) => {
                warn!(%command, "Unknown notify command");
                return Outcome::Ignored { command };
            }
            Err(e) if e.command() == Some(tokens::GET_STAGE) => {
                warn!(error = %e, "Malformed getStage");
                return Outcome::Rejected { reason: e.to_string() };
            }
            Err(e) => {
                warn!(error = %e, "Dropping malformed notify message");
                return Outcome::Dropped { reason: e.to_string() };
            }
        };
        debug!(command = command.name(), "Notify command received");

        match command {
            NotifyCommand::Layer {
                path,
                timestamp,
                payload,
            } => self.store_layer(path, timestamp, payload, cache),
            NotifyCommand::GetStage { timestamp, payload } => {
                self.store_layer(ROOT_LAYER_PATH.to_string(), timestamp, payload, cache)
            }
            NotifyCommand::LayerEdit { path, timestamp: 0 } => self.remove_layer(path, cache),
            NotifyCommand::LayerEdit { path, timestamp } => {
                self.request_layer(path, timestamp, cache, fetcher).await
            }
            NotifyCommand::LayerRemove { path } => self.remove_layer(path, cache),
        }
    }

    fn store_layer(&self, path: String, timestamp: u64, payload: Bytes, cache: &mut LayerCache) -> Outcome {
        if let Err(e) = LayerStore::relative_path(&path) {
            warn!(error = %e, "Dropping layer with invalid path");
            return Outcome::Dropped { reason: e.to_string() };
        }
        if let Some(cached) = cache.stale_against(&path, timestamp) {
            debug!(path = %path, timestamp, cached, "Discarding outdated layer");
            return Outcome::Stale {
                path,
                timestamp,
                cached,
            };
        }

        if let Err(e) = self.store.write(&path, &payload) {
            error!(path = %path, error = %e, "Failed to persist layer");
            return Outcome::PersistFailed { path };
        }
        match cache.upsert(path.clone(), Layer { timestamp, payload }) {
            Upsert::Inserted => info!(path = %path, timestamp, "Layer added"),
            Upsert::Replaced { previous } => info!(path = %path, timestamp, previous, "Layer updated"),
            Upsert::Stale { cached } => {
                return Outcome::Stale {
                    path,
                    timestamp,
                    cached,
                }
            }
        }
        Outcome::Applied { path, timestamp }
    }

    fn remove_layer(&self, path: String, cache: &mut LayerCache) -> Outcome {
        if let Err(e) = LayerStore::relative_path(&path) {
            warn!(error = %e, "Dropping removal with invalid path");
            return Outcome::Dropped { reason: e.to_string() };
        }
        let cached = cache.remove(&path).is_some();

        // A file may be left over from an earlier session even when uncached
        if let Err(e) = self.store.remove(&path) {
            warn!(path = %path, error = %e, "Failed to delete layer file");
        }
        if !cached {
            debug!(path = %path, "Removal of uncached layer");
            return Outcome::NotCached { path };
        }
        info!(path = %path, "Layer removed");
        Outcome::Removed { path }
    }

    async fn request_layer<F>(&self, path: String, timestamp: u64, cache: &LayerCache, fetcher: &mut F) -> Outcome
    where
        F: LayerFetcher,
    {
        if let Err(e) = LayerStore::relative_path(&path) {
            warn!(error = %e, "Dropping edit with invalid path");
            return Outcome::Dropped { reason: e.to_string() };
        }
        if let Some(cached) = cache.stale_against(&path, timestamp) {
            debug!(path = %path, timestamp, cached, "Edit already applied");
            return Outcome::Stale {
                path,
                timestamp,
                cached,
            };
        }

        info!(path = %path, timestamp, "Layer edited, requesting content");
        match fetcher.fetch_layer(&path).await {
            Ok(()) => Outcome::Fetched { path, timestamp },
            Err(e) => {
                warn!(path = %path, error = %e, "Layer request failed");
                Outcome::FetchFailed { path }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagelink_utils::{Result, StagelinkError};
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingFetcher {
        requested: Vec<String>,
        unreachable: bool,
    }

    impl LayerFetcher for RecordingFetcher {
        async fn fetch_layer(&mut self, path: &str) -> Result<()> {
            self.requested.push(path.to_string());
            if self.unreachable {
                return Err(StagelinkError::HostUnreachable {
                    address: "tcp://host.test:5555".into(),
                    attempts: 3,
                });
            }
            Ok(())
        }
    }

    struct Harness {
        tmp: TempDir,
        dispatcher: Dispatcher,
        cache: LayerCache,
        fetcher: RecordingFetcher,
    }

    impl Harness {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let dispatcher = Dispatcher::new(LayerStore::new(tmp.path()));
            Self {
                tmp,
                dispatcher,
                cache: LayerCache::new(),
                fetcher: RecordingFetcher::default(),
            }
        }

        async fn push(&mut self, frames: &[&str]) -> Outcome {
            let inbound = Inbound::fire_and_forget(Multipart::from_strs(frames));
            self.dispatcher
                .dispatch(inbound, &mut self.cache, &mut self.fetcher)
                .await
        }

        async fn push_with_reply(&mut self, frames: &[&str]) -> (Outcome, Option<Multipart>) {
            let (inbound, mut rx) = Inbound::with_responder(Multipart::from_strs(frames));
            let outcome = self
                .dispatcher
                .dispatch(inbound, &mut self.cache, &mut self.fetcher)
                .await;
            (outcome, rx.try_recv().ok())
        }

        fn file(&self, layer: &str) -> std::path::PathBuf {
            self.tmp.path().join(LayerStore::relative_path(layer).unwrap())
        }
    }

    // ==================== layer Tests ====================

    #[tokio::test]
    async fn test_layer_stored_and_written() {
        let mut h = Harness::new();
        let outcome = h.push(&["layer", "/world", "5", "#usda 1.0 A"]).await;

        assert_eq!(
            outcome,
            Outcome::Applied {
                path: "/world".into(),
                timestamp: 5
            }
        );
        assert_eq!(h.cache.timestamp("/world"), Some(5));
        assert!(h.cache.is_dirty());
        assert_eq!(std::fs::read(h.file("/world")).unwrap(), b"#usda 1.0 A");
    }

    #[tokio::test]
    async fn test_older_layer_discarded() {
        let mut h = Harness::new();
        h.push(&["layer", "/world", "5", "A"]).await;
        h.cache.mark_clean();

        let outcome = h.push(&["layer", "/world", "3", "B"]).await;
        assert_eq!(
            outcome,
            Outcome::Stale {
                path: "/world".into(),
                timestamp: 3,
                cached: 5
            }
        );
        assert!(!h.cache.is_dirty());
        assert_eq!(std::fs::read(h.file("/world")).unwrap(), b"A");
    }

    #[tokio::test]
    async fn test_equal_timestamp_is_stale() {
        let mut h = Harness::new();
        h.push(&["layer", "/world", "5", "A"]).await;
        let outcome = h.push(&["layer", "/world", "5", "B"]).await;
        assert!(matches!(outcome, Outcome::Stale { cached: 5, .. }));
        assert_eq!(std::fs::read(h.file("/world")).unwrap(), b"A");
    }

    #[tokio::test]
    async fn test_newer_layer_replaces() {
        let mut h = Harness::new();
        h.push(&["layer", "/world", "5", "A"]).await;
        h.push(&["layer", "/world", "9", "C"]).await;
        assert_eq!(h.cache.get("/world").unwrap().payload, Bytes::from_static(b"C"));
        assert_eq!(std::fs::read(h.file("/world")).unwrap(), b"C");
    }

    #[tokio::test]
    async fn test_arrival_order_does_not_matter() {
        for order in [[1u64, 4, 2], [4, 2, 1], [2, 1, 4]] {
            let mut h = Harness::new();
            for ts in order {
                let ts = ts.to_string();
                h.push(&["layer", "/p", &ts, &ts]).await;
            }
            assert_eq!(h.cache.timestamp("/p"), Some(4));
            assert_eq!(std::fs::read(h.file("/p")).unwrap(), b"4");
        }
    }

    #[tokio::test]
    async fn test_layer_wrong_frame_count_dropped() {
        let mut h = Harness::new();
        let (outcome, reply) = h.push_with_reply(&["layer", "/world", "5"]).await;
        assert!(matches!(outcome, Outcome::Dropped { .. }));
        assert_eq!(reply, None);
        assert!(h.cache.is_empty());
        assert!(!h.cache.is_dirty());
    }

    #[tokio::test]
    async fn test_layer_with_escaping_path_dropped() {
        let mut h = Harness::new();
        let outcome = h.push(&["layer", "/../etc/passwd", "1", "x"]).await;
        assert!(matches!(outcome, Outcome::Dropped { .. }));
        assert!(h.cache.is_empty());
    }

    #[tokio::test]
    async fn test_persist_failure_leaves_cache_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("blocked");
        std::fs::write(&blocker, b"").unwrap();

        let dispatcher = Dispatcher::new(LayerStore::new(&blocker));
        let mut cache = LayerCache::new();
        let mut fetcher = RecordingFetcher::default();
        let (inbound, mut rx) = Inbound::with_responder(Multipart::from_strs(&["layer", "/a", "1", "x"]));

        let outcome = dispatcher.dispatch(inbound, &mut cache, &mut fetcher).await;
        assert_eq!(outcome, Outcome::PersistFailed { path: "/a".into() });
        assert!(cache.is_empty());
        assert!(!cache.is_dirty());
        assert!(String::from_utf8_lossy(&rx.try_recv().unwrap().frames()[0]).starts_with("fail"));
    }

    // ==================== layerEdit Tests ====================

    #[tokio::test]
    async fn test_edit_newer_requests_layer() {
        let mut h = Harness::new();
        h.push(&["layer", "/world", "5", "A"]).await;

        let outcome = h.push(&["layerEdit", "/world", "7"]).await;
        assert_eq!(
            outcome,
            Outcome::Fetched {
                path: "/world".into(),
                timestamp: 7
            }
        );
        assert_eq!(h.fetcher.requested, vec!["/world".to_string()]);
        // Content arrives later by push
        assert_eq!(h.cache.timestamp("/world"), Some(5));
    }

    #[tokio::test]
    async fn test_edit_uncached_requests_layer() {
        let mut h = Harness::new();
        let outcome = h.push(&["layerEdit", "/new", "1"]).await;
        assert!(matches!(outcome, Outcome::Fetched { .. }));
        assert_eq!(h.fetcher.requested, vec!["/new".to_string()]);
    }

    #[tokio::test]
    async fn test_edit_stale_sends_nothing() {
        let mut h = Harness::new();
        h.push(&["layer", "/world", "5", "A"]).await;

        for ts in ["5", "4"] {
            let outcome = h.push(&["layerEdit", "/world", ts]).await;
            assert!(matches!(outcome, Outcome::Stale { cached: 5, .. }));
        }
        assert!(h.fetcher.requested.is_empty());
    }

    #[tokio::test]
    async fn test_edit_tombstone_removes() {
        let mut h = Harness::new();
        h.push(&["layer", "/world", "5", "A"]).await;
        h.cache.mark_clean();

        let outcome = h.push(&["layerEdit", "/world", "0"]).await;
        assert_eq!(outcome, Outcome::Removed { path: "/world".into() });
        assert!(!h.cache.contains("/world"));
        assert!(h.cache.is_dirty());
        assert!(!h.file("/world").exists());
        assert!(h.fetcher.requested.is_empty());
    }

    #[tokio::test]
    async fn test_tombstone_for_absent_path_is_noop() {
        let mut h = Harness::new();
        let outcome = h.push(&["layerEdit", "/ghost", "0"]).await;
        assert_eq!(outcome, Outcome::NotCached { path: "/ghost".into() });
        assert!(!h.cache.is_dirty());
    }

    #[tokio::test]
    async fn test_tombstone_deletes_leftover_file_for_uncached_path() {
        let mut h = Harness::new();
        // Written by an earlier session into the same output directory
        h.dispatcher.store().write("/world", b"#usda 1.0 old").unwrap();
        assert!(h.file("/world").exists());

        let outcome = h.push(&["layerEdit", "/world", "0"]).await;
        assert_eq!(outcome, Outcome::NotCached { path: "/world".into() });
        assert!(!h.file("/world").exists());
        assert!(!h.cache.is_dirty());
    }

    #[tokio::test]
    async fn test_fetch_failure_is_recoverable() {
        let mut h = Harness::new();
        h.fetcher.unreachable = true;

        let outcome = h.push(&["layerEdit", "/world", "7"]).await;
        assert_eq!(outcome, Outcome::FetchFailed { path: "/world".into() });

        // A later push still applies
        h.fetcher.unreachable = false;
        let outcome = h.push(&["layer", "/world", "7", "B"]).await;
        assert!(outcome.changed_cache());
    }

    #[tokio::test]
    async fn test_edit_invalid_timestamp_dropped() {
        let mut h = Harness::new();
        let outcome = h.push(&["layerEdit", "/world", "soon"]).await;
        assert!(matches!(outcome, Outcome::Dropped { .. }));
        assert!(h.fetcher.requested.is_empty());
    }

    // ==================== layerRemove Tests ====================

    #[tokio::test]
    async fn test_layer_remove() {
        let mut h = Harness::new();
        h.push(&["layer", "/a", "1", "x"]).await;
        assert_eq!(
            h.push(&["layerRemove", "/a"]).await,
            Outcome::Removed { path: "/a".into() }
        );
        assert_eq!(
            h.push(&["layerRemove", "/a"]).await,
            Outcome::NotCached { path: "/a".into() }
        );
    }

    #[tokio::test]
    async fn test_layer_remove_deletes_leftover_file() {
        let mut h = Harness::new();
        h.dispatcher.store().write("/b", b"stale").unwrap();

        let outcome = h.push(&["layerRemove", "/b"]).await;
        assert_eq!(outcome, Outcome::NotCached { path: "/b".into() });
        assert!(!h.file("/b").exists());
    }

    // ==================== getStage Tests ====================

    #[tokio::test]
    async fn test_get_stage_stored_as_root_and_acked() {
        let mut h = Harness::new();
        let (outcome, reply) = h.push_with_reply(&["getStage", "12", "#usda 1.0 stage"]).await;

        assert_eq!(
            outcome,
            Outcome::Applied {
                path: "/".into(),
                timestamp: 12
            }
        );
        assert_eq!(reply, Some(Multipart::from("ok")));
        assert_eq!(std::fs::read(h.file("/")).unwrap(), b"#usda 1.0 stage");
    }

    #[tokio::test]
    async fn test_stale_get_stage_still_acked_ok() {
        let mut h = Harness::new();
        h.push(&["getStage", "12", "new"]).await;
        let (outcome, reply) = h.push_with_reply(&["getStage", "3", "old"]).await;

        assert!(matches!(outcome, Outcome::Stale { .. }));
        assert_eq!(reply, Some(Multipart::from("ok")));
        assert_eq!(std::fs::read(h.file("/")).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_malformed_get_stage_answered_with_reason() {
        let mut h = Harness::new();
        let (outcome, reply) = h.push_with_reply(&["getStage", "12"]).await;

        assert!(matches!(outcome, Outcome::Rejected { .. }));
        let reply = reply.unwrap();
        let text = String::from_utf8_lossy(&reply.frames()[0]).to_string();
        assert!(text.starts_with("fail: "), "got {}", text);
        assert!(h.cache.is_empty());
    }

    // ==================== Unknown Command Tests ====================

    #[tokio::test]
    async fn test_unknown_command_answered_fail() {
        let mut h = Harness::new();
        let (outcome, reply) = h.push_with_reply(&["frobnicate", "x"]).await;

        assert_eq!(
            outcome,
            Outcome::Ignored {
                command: "frobnicate".into()
            }
        );
        assert_eq!(reply, Some(Multipart::from("fail")));
        assert!(h.cache.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_command_in_pull_role_is_silent() {
        let mut h = Harness::new();
        let outcome = h.push(&["frobnicate"]).await;
        assert!(matches!(outcome, Outcome::Ignored { .. }));
    }

    #[test]
    fn test_ack_tokens() {
        assert_eq!(
            Outcome::Removed { path: "/a".into() }.ack().as_deref(),
            Some("ok")
        );
        assert_eq!(
            Outcome::Dropped {
                reason: "x".into()
            }
            .ack(),
            None
        );
        assert_eq!(
            Outcome::Rejected {
                reason: "bad".into()
            }
            .ack()
            .as_deref(),
            Some("fail: bad")
        );
    }
}
