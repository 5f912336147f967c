//! # Remote Config Checker
//!
//! Per-token feature decisions fetched from the remote config endpoint.
//!
//! ## Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Remote Config Check                                  │
//! │                                                                         │
//! │  host: RemoteConfigCheck::new("abc") ──► subscribe() ──► watch rx      │
//! │       │                                                                 │
//! │       │ Dispatcher::install_remote_config_check                         │
//! │       ▼                                                                 │
//! │  Worker ── deadline passed? ──► RemoteConfigChecker::run("abc")        │
//! │                                       │                                 │
//! │                                       ▼                                 │
//! │                          RemoteConfigSource::fetch("abc")               │
//! │                                       │                                 │
//! │        ┌──────────────────────────────┼─────────────────────────┐      │
//! │        ▼                              ▼                         ▼      │
//! │  Ok(decision)              ServiceUnavailable(t)        other error    │
//! │  cache + publish           propagate: worker sets       log, keep old  │
//! │                            deadline = now + t           decision       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! There is no timer in here. Checks only run when the worker processes a
//! flush or an install and the retry-after deadline has passed.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use tally_core::RemoteConfigDecision;

use crate::error::{SyncError, SyncResult};

/// Where decisions come from.
#[async_trait]
pub trait RemoteConfigSource: Send + Sync {
    /// Fetches the decision for `token`.
    ///
    /// Returns [`SyncError::ServiceUnavailable`] when the server asks the
    /// client to back off.
    async fn fetch(&self, token: &str) -> SyncResult<RemoteConfigDecision>;
}

// =============================================================================
// Check Registration
// =============================================================================

/// A per-token check handed to the worker.
///
/// Subscribe before installing to observe every fetched decision.
#[derive(Debug)]
pub struct RemoteConfigCheck {
    token: String,
    sender: watch::Sender<RemoteConfigDecision>,
}

impl RemoteConfigCheck {
    pub fn new(token: impl Into<String>) -> Self {
        let (sender, _) = watch::channel(RemoteConfigDecision::unresolved());
        RemoteConfigCheck {
            token: token.into(),
            sender,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Receiver that yields every decision the worker caches.
    pub fn subscribe(&self) -> watch::Receiver<RemoteConfigDecision> {
        self.sender.subscribe()
    }

    fn publish(&self, decision: RemoteConfigDecision) {
        self.sender.send_replace(decision);
    }
}

// =============================================================================
// Checker
// =============================================================================

/// A fetched decision and when it arrived.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedDecision {
    pub decision: RemoteConfigDecision,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Installed {
    check: RemoteConfigCheck,
    cached: Option<CachedDecision>,
}

/// Worker-owned cache of installed checks and their latest decisions.
pub struct RemoteConfigChecker {
    source: Option<Arc<dyn RemoteConfigSource>>,
    checks: HashMap<String, Installed>,
}

impl RemoteConfigChecker {
    pub fn new(source: Option<Arc<dyn RemoteConfigSource>>) -> Self {
        RemoteConfigChecker {
            source,
            checks: HashMap::new(),
        }
    }

    /// Registers a check, replacing any earlier one for the same token.
    /// A decision already cached for the token is kept and re-published.
    pub fn install(&mut self, check: RemoteConfigCheck) {
        let token = check.token().to_string();
        let cached = self.checks.remove(&token).and_then(|old| old.cached);

        if let Some(cached) = &cached {
            check.publish(cached.decision.clone());
        }

        debug!(token = %token, "Remote config check installed");
        self.checks.insert(token, Installed { check, cached });
    }

    pub fn is_installed(&self, token: &str) -> bool {
        self.checks.contains_key(token)
    }

    /// The cached decision for `token`, if one was fetched.
    pub fn decision(&self, token: &str) -> Option<&CachedDecision> {
        self.checks.get(token).and_then(|installed| installed.cached.as_ref())
    }

    /// True when a cached decision explicitly enables automatic events.
    pub fn tracks_automatic(&self, token: &str) -> bool {
        self.decision(token)
            .is_some_and(|cached| cached.decision.tracks_automatic())
    }

    /// True when automatic records may be drained for `token`.
    pub fn has_resolved_decision(&self, token: &str) -> bool {
        self.decision(token)
            .is_some_and(|cached| cached.decision.is_resolved())
    }

    /// Fetches and caches the decision for `token`.
    ///
    /// Does nothing without an installed check or a source. Only
    /// [`SyncError::ServiceUnavailable`] is returned; other failures are
    /// logged and the previous decision stays cached.
    pub async fn run(&mut self, token: &str) -> SyncResult<()> {
        let Some(source) = self.source.clone() else {
            return Ok(());
        };
        let Some(installed) = self.checks.get_mut(token) else {
            return Ok(());
        };

        match source.fetch(token).await {
            Ok(decision) => {
                info!(
                    token = %token,
                    automatic = ?decision.should_track_automatic,
                    "Remote config decision fetched"
                );
                installed.check.publish(decision.clone());
                installed.cached = Some(CachedDecision {
                    decision,
                    fetched_at: Utc::now(),
                });
                Ok(())
            }
            Err(e @ SyncError::ServiceUnavailable { .. }) => Err(e),
            Err(e) => {
                warn!(token = %token, error = %e, "Remote config fetch failed");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedSource {
        responses: Mutex<VecDeque<SyncResult<RemoteConfigDecision>>>,
    }

    impl ScriptedSource {
        fn new(responses: Vec<SyncResult<RemoteConfigDecision>>) -> Arc<Self> {
            Arc::new(ScriptedSource {
                responses: Mutex::new(responses.into()),
            })
        }
    }

    #[async_trait]
    impl RemoteConfigSource for ScriptedSource {
        async fn fetch(&self, _token: &str) -> SyncResult<RemoteConfigDecision> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(SyncError::Io("script exhausted".into())))
        }
    }

    fn enabled() -> RemoteConfigDecision {
        RemoteConfigDecision::from_response(json!({"automatic_events": true}))
    }

    #[tokio::test]
    async fn test_run_without_check_is_noop() {
        let source = ScriptedSource::new(vec![Ok(enabled())]);
        let mut checker = RemoteConfigChecker::new(Some(source));

        checker.run("abc").await.unwrap();
        assert!(checker.decision("abc").is_none());
    }

    #[tokio::test]
    async fn test_decision_cached_and_published() {
        let source = ScriptedSource::new(vec![Ok(enabled())]);
        let mut checker = RemoteConfigChecker::new(Some(source));

        let check = RemoteConfigCheck::new("abc");
        let rx = check.subscribe();
        checker.install(check);
        assert!(!checker.tracks_automatic("abc"));

        checker.run("abc").await.unwrap();
        assert!(checker.tracks_automatic("abc"));
        assert!(checker.has_resolved_decision("abc"));
        assert!(rx.borrow().tracks_automatic());
    }

    #[tokio::test]
    async fn test_service_unavailable_propagates() {
        let source = ScriptedSource::new(vec![Err(SyncError::service_unavailable(120))]);
        let mut checker = RemoteConfigChecker::new(Some(source));
        checker.install(RemoteConfigCheck::new("abc"));

        let err = checker.run("abc").await.unwrap_err();
        assert_eq!(err.retry_after(), Some(std::time::Duration::from_secs(120)));
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_previous_decision() {
        let source = ScriptedSource::new(vec![Ok(enabled()), Err(SyncError::Io("reset".into()))]);
        let mut checker = RemoteConfigChecker::new(Some(source));
        checker.install(RemoteConfigCheck::new("abc"));

        checker.run("abc").await.unwrap();
        checker.run("abc").await.unwrap();
        assert!(checker.tracks_automatic("abc"));
    }

    #[tokio::test]
    async fn test_reinstall_republishes_cached_decision() {
        let source = ScriptedSource::new(vec![Ok(enabled())]);
        let mut checker = RemoteConfigChecker::new(Some(source));
        checker.install(RemoteConfigCheck::new("abc"));
        checker.run("abc").await.unwrap();

        let replacement = RemoteConfigCheck::new("abc");
        let rx = replacement.subscribe();
        checker.install(replacement);

        assert!(rx.borrow().tracks_automatic());
        assert!(checker.tracks_automatic("abc"));
    }
}
