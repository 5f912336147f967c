//! # Delivery Pipeline
//!
//! Drains queued batches for one (table, token) pair and ships them.
//!
//! ## Delivery Run
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         deliver(table, token)                           │
//! │                                                                         │
//! │  is_online? ── no ──► report.offline (nothing drained, nothing reset)  │
//! │       │ yes                                                             │
//! │       ▼                                                                 │
//! │  ┌──► drain_batch ── None ──► done                                     │
//! │  │        │                                                             │
//! │  │        ▼                                                             │
//! │  │   for url in [primary, fallback...]                                 │
//! │  │        POST ── 2xx ──► stop trying                                  │
//! │  │        │                                                             │
//! │  │        ├── success ──► delete_up_to(watermark) ─────────────┐       │
//! │  │        │                                                     │       │
//! │  │        └── every endpoint failed ──► report.failure, done   │       │
//! │  │                                                              │       │
//! │  └──────────────────────────────────────────────────────────────┘       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The pipeline never touches retry state. The worker reads the
//! [`DeliveryReport`] and applies backoff and timer changes itself.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use tally_core::{PersistedBatch, Table};

use crate::store::RecordStore;
use crate::transport::{OfflineMode, RemoteService};

/// Why a run stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryFailure {
    /// Largest Retry-After reported by the endpoints during the attempt.
    pub retry_after: Option<Duration>,
}

/// Outcome of one delivery run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// The transport reported offline; nothing was attempted.
    pub offline: bool,

    /// Batches confirmed and deleted.
    pub delivered_batches: usize,

    /// Records in the confirmed batches.
    pub delivered_records: usize,

    /// Set when a batch could not be delivered to any endpoint.
    pub failure: Option<DeliveryFailure>,
}

impl DeliveryReport {
    fn offline() -> Self {
        DeliveryReport {
            offline: true,
            ..Default::default()
        }
    }

    pub fn succeeded(&self) -> bool {
        self.delivered_batches > 0
    }

    pub fn failed(&self) -> bool {
        self.failure.is_some()
    }
}

/// Drain/send/delete loop over a record store and a remote service.
#[derive(Clone)]
pub struct DeliveryPipeline {
    store: Arc<dyn RecordStore>,
    remote: Arc<dyn RemoteService>,
    offline_mode: Option<Arc<dyn OfflineMode>>,
}

impl DeliveryPipeline {
    pub fn new(
        store: Arc<dyn RecordStore>,
        remote: Arc<dyn RemoteService>,
        offline_mode: Option<Arc<dyn OfflineMode>>,
    ) -> Self {
        DeliveryPipeline {
            store,
            remote,
            offline_mode,
        }
    }

    /// Whether the transport is currently willing to send.
    pub async fn is_online(&self) -> bool {
        self.remote.is_online(self.offline_mode.as_deref()).await
    }

    /// Delivers every queued batch for (table, token) until the queue is
    /// empty or a batch fails.
    pub async fn deliver(
        &self,
        table: Table,
        token: &str,
        endpoints: &[String],
        include_automatic: bool,
    ) -> DeliveryReport {
        if !self.is_online().await {
            debug!(table = %table, token = %token, "Offline, skipping delivery");
            return DeliveryReport::offline();
        }

        let mut report = DeliveryReport::default();

        loop {
            let batch = match self.store.drain_batch(table, token, include_automatic).await {
                Ok(Some(batch)) => batch,
                Ok(None) => break,
                Err(e) => {
                    warn!(table = %table, token = %token, error = %e, "Could not drain batch");
                    break;
                }
            };

            if !batch.is_empty() {
                if let Err(retry_after) = self.send_to_any(endpoints, &batch).await {
                    report.failure = Some(DeliveryFailure { retry_after });
                    break;
                }
            }

            if let Err(e) = self
                .store
                .delete_up_to(batch.watermark, table, token, include_automatic)
                .await
            {
                warn!(
                    table = %table,
                    token = %token,
                    watermark = batch.watermark,
                    error = %e,
                    "Could not remove delivered records"
                );
                break;
            }

            if !batch.is_empty() {
                report.delivered_batches += 1;
                report.delivered_records += batch.count;
                info!(
                    table = %table,
                    token = %token,
                    records = batch.count,
                    "Batch delivered"
                );
            }
        }

        report
    }

    /// Tries each endpoint in order. Returns the largest server hint seen
    /// when none accepted the batch.
    async fn send_to_any(
        &self,
        endpoints: &[String],
        batch: &PersistedBatch,
    ) -> Result<(), Option<Duration>> {
        let mut hint: Option<Duration> = None;

        for url in endpoints {
            match self.remote.send(url, &batch.payload).await {
                Ok(response) if response.is_success() => {
                    debug!(url = %url, status = response.status, "Endpoint accepted batch");
                    return Ok(());
                }
                Ok(response) => {
                    warn!(
                        url = %url,
                        status = response.status,
                        message = %response.message,
                        "Endpoint rejected batch"
                    );
                }
                Err(e) => {
                    if let Some(retry_after) = e.retry_after() {
                        hint = Some(hint.map_or(retry_after, |h| h.max(retry_after)));
                    }
                    warn!(url = %url, error = %e, "Endpoint unreachable");
                }
            }
        }

        Err(hint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{SyncError, SyncResult};
    use crate::store::MemoryStore;
    use crate::transport::{OfflineSwitch, RemoteResponse};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedRemote {
        responses: Mutex<VecDeque<SyncResult<u16>>>,
        requests: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedRemote {
        fn new(responses: Vec<SyncResult<u16>>) -> Arc<Self> {
            Arc::new(ScriptedRemote {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn urls(&self) -> Vec<String> {
            self.requests.lock().unwrap().iter().map(|(u, _)| u.clone()).collect()
        }
    }

    #[async_trait]
    impl RemoteService for ScriptedRemote {
        async fn is_online(&self, offline_mode: Option<&dyn OfflineMode>) -> bool {
            !offline_mode.is_some_and(|m| m.is_offline())
        }

        async fn send(&self, url: &str, body: &str) -> SyncResult<RemoteResponse> {
            self.requests
                .lock()
                .unwrap()
                .push((url.to_string(), body.to_string()));
            let status = self.responses.lock().unwrap().pop_front().unwrap_or(Ok(200))?;
            Ok(RemoteResponse {
                status,
                message: String::new(),
                body: "1".into(),
            })
        }
    }

    fn endpoints() -> Vec<String> {
        vec![
            "https://primary.example.com/track".into(),
            "https://fallback.example.com/track".into(),
        ]
    }

    async fn store_with(records: usize, batch_size: usize) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new(batch_size));
        for n in 0..records {
            store
                .add_record(Table::Events, "abc", &format!(r#"{{"n":{n}}}"#), false)
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_delivers_all_batches() {
        let store = store_with(5, 2).await;
        let remote = ScriptedRemote::new(vec![]);
        let pipeline = DeliveryPipeline::new(store.clone(), remote.clone(), None);

        let report = pipeline.deliver(Table::Events, "abc", &endpoints(), false).await;

        assert_eq!(report.delivered_batches, 3);
        assert_eq!(report.delivered_records, 5);
        assert!(!report.failed());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_falls_back_to_next_endpoint() {
        let store = store_with(1, 50).await;
        let remote = ScriptedRemote::new(vec![Err(SyncError::Io("refused".into())), Ok(200)]);
        let pipeline = DeliveryPipeline::new(store.clone(), remote.clone(), None);

        let report = pipeline.deliver(Table::Events, "abc", &endpoints(), false).await;

        assert!(report.succeeded());
        assert_eq!(remote.urls(), endpoints());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_failure_keeps_records_and_reports_hint() {
        let store = store_with(3, 50).await;
        let remote = ScriptedRemote::new(vec![
            Err(SyncError::service_unavailable(30)),
            Err(SyncError::service_unavailable(90)),
        ]);
        let pipeline = DeliveryPipeline::new(store.clone(), remote.clone(), None);

        let report = pipeline.deliver(Table::Events, "abc", &endpoints(), false).await;

        assert_eq!(
            report.failure,
            Some(DeliveryFailure {
                retry_after: Some(Duration::from_secs(90))
            })
        );
        assert_eq!(store.pending(Table::Events, "abc").await.len(), 3);
    }

    #[tokio::test]
    async fn test_non_success_status_is_failure() {
        let store = store_with(1, 50).await;
        let remote = ScriptedRemote::new(vec![Ok(400), Ok(413)]);
        let pipeline = DeliveryPipeline::new(store.clone(), remote, None);

        let report = pipeline.deliver(Table::Events, "abc", &endpoints(), false).await;

        assert_eq!(report.failure, Some(DeliveryFailure { retry_after: None }));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_offline_touches_nothing() {
        let store = store_with(2, 50).await;
        let remote = ScriptedRemote::new(vec![]);
        let switch: Arc<dyn OfflineMode> = Arc::new(OfflineSwitch::new(true));
        let pipeline = DeliveryPipeline::new(store.clone(), remote.clone(), Some(switch));

        let report = pipeline.deliver(Table::Events, "abc", &endpoints(), false).await;

        assert!(report.offline);
        assert!(remote.urls().is_empty());
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_malformed_only_batch_is_cleared_without_sending() {
        let store = Arc::new(MemoryStore::new(50));
        store.add_record(Table::People, "abc", "{oops", false).await.unwrap();
        let remote = ScriptedRemote::new(vec![]);
        let pipeline = DeliveryPipeline::new(store.clone(), remote.clone(), None);

        let report = pipeline.deliver(Table::People, "abc", &endpoints(), false).await;

        assert_eq!(report, DeliveryReport::default());
        assert!(remote.urls().is_empty());
        assert!(store.is_empty().await);
    }
}
