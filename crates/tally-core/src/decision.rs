//! # Remote Config Decision
//!
//! The per-token verdict fetched from the remote config endpoint. The
//! worker consults it before persisting automatic events and before
//! draining them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Response key carrying the automatic-events flag.
pub const AUTOMATIC_EVENTS_KEY: &str = "automatic_events";

/// Result of a remote config fetch.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RemoteConfigDecision {
    /// `None` until the server has answered with a boolean.
    pub should_track_automatic: Option<bool>,

    /// The full response body, kept for callers that read other keys.
    pub payloads: Value,
}

impl RemoteConfigDecision {
    /// An unresolved decision.
    pub fn unresolved() -> Self {
        Self::default()
    }

    /// Builds a decision from a parsed response body.
    ///
    /// A missing or non-boolean `automatic_events` leaves the decision
    /// unresolved.
    pub fn from_response(body: Value) -> Self {
        let should_track_automatic = body.get(AUTOMATIC_EVENTS_KEY).and_then(Value::as_bool);
        RemoteConfigDecision {
            should_track_automatic,
            payloads: body,
        }
    }

    /// True only when the server explicitly enabled automatic events.
    pub fn tracks_automatic(&self) -> bool {
        self.should_track_automatic == Some(true)
    }

    pub fn is_resolved(&self) -> bool {
        self.should_track_automatic.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decision_from_response() {
        let decision = RemoteConfigDecision::from_response(json!({
            "automatic_events": true,
            "notifications": []
        }));
        assert!(decision.is_resolved());
        assert!(decision.tracks_automatic());
        assert_eq!(decision.payloads["notifications"], json!([]));
    }

    #[test]
    fn test_disabled_decision() {
        let decision = RemoteConfigDecision::from_response(json!({"automatic_events": false}));
        assert!(decision.is_resolved());
        assert!(!decision.tracks_automatic());
    }

    #[test]
    fn test_missing_flag_stays_unresolved() {
        let decision = RemoteConfigDecision::from_response(json!({"automatic_events": "yes"}));
        assert!(!decision.is_resolved());
        assert!(!decision.tracks_automatic());

        assert!(!RemoteConfigDecision::unresolved().is_resolved());
    }
}
