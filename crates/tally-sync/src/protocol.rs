//! # Worker Commands
//!
//! Messages posted by the [`Dispatcher`](crate::Dispatcher) to a worker's
//! mailbox.
//!
//! ## Command Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Worker Mailbox Commands                            │
//! │                                                                         │
//! │  INGESTION                                                             │
//! │  ─────────                                                             │
//! │  producer ───► EnqueueEvent(EventDescription)                          │
//! │  producer ───► EnqueueProfile(ProfileUpdate)                           │
//! │                                                                         │
//! │  DELIVERY                                                              │
//! │  ────────                                                              │
//! │  producer ───► Flush(FlushRequest { token, check_remote_config })     │
//! │  timer    ───► (delayed flush, raised inside the worker)               │
//! │                                                                         │
//! │  REMOTE CONFIG                                                         │
//! │  ─────────────                                                         │
//! │  host     ───► InstallRemoteConfigCheck(RemoteConfigCheck)             │
//! │                                                                         │
//! │  CONTROL                                                               │
//! │  ───────                                                               │
//! │  host     ───► Barrier(oneshot)   answered once reached                │
//! │  host     ───► Shutdown           terminal                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Commands are processed strictly in posting order. There is no priority
//! between kinds.

use tokio::sync::oneshot;

use tally_core::{EventDescription, FlushRequest, ProfileUpdate};

use crate::remote_config::RemoteConfigCheck;

/// A unit of work for the worker.
#[derive(Debug)]
pub enum Command {
    /// Track an event.
    EnqueueEvent(EventDescription),

    /// Queue a profile update.
    EnqueueProfile(ProfileUpdate),

    /// Deliver everything queued for a token.
    Flush(FlushRequest),

    /// Register a per-token remote config check.
    InstallRemoteConfigCheck(RemoteConfigCheck),

    /// Resolves the sender once every earlier command has been handled.
    Barrier(oneshot::Sender<()>),

    /// Clear the queues and stop. Irreversible.
    Shutdown,
}

impl Command {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::EnqueueEvent(_) => "enqueue_event",
            Command::EnqueueProfile(_) => "enqueue_profile",
            Command::Flush(_) => "flush",
            Command::InstallRemoteConfigCheck(_) => "install_remote_config_check",
            Command::Barrier(_) => "barrier",
            Command::Shutdown => "shutdown",
        }
    }

    /// Token the command is about, if any.
    pub fn token(&self) -> Option<&str> {
        match self {
            Command::EnqueueEvent(event) => Some(&event.token),
            Command::EnqueueProfile(update) => Some(&update.token),
            Command::Flush(request) => Some(&request.token),
            Command::InstallRemoteConfigCheck(check) => Some(check.token()),
            Command::Barrier(_) | Command::Shutdown => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    #[test]
    fn test_command_metadata() {
        let cmd = Command::EnqueueEvent(EventDescription::new("open", Map::new(), "abc", false));
        assert_eq!(cmd.kind(), "enqueue_event");
        assert_eq!(cmd.token(), Some("abc"));

        let cmd = Command::EnqueueProfile(ProfileUpdate::new(json!({"$set": {}}), "xyz"));
        assert_eq!(cmd.token(), Some("xyz"));

        assert_eq!(Command::Shutdown.token(), None);
        assert_eq!(Command::Flush(FlushRequest::new("abc", true)).kind(), "flush");
    }
}
