//! Preview session state machine
//!
//! `Idle → Loading → Ready | Error`. A new request moves any state back to
//! `Loading`; `Ready` and `Error` are terminal for the request that produced
//! them. Transitions that make no sense for the current phase are rejected
//! and leave the session untouched.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use crate::classify::ClassifiedError;

/// Caller-visible phase of a preview
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// No preview requested yet
    #[default]
    Idle,
    /// Boot, mount, install or serve in progress
    Loading,
    /// Preview URL available
    Ready,
    /// Request failed
    Error,
}

/// Pipeline step reported while loading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    Booting,
    Mounting,
    Installing,
    Starting,
    WaitingForServer,
}

impl std::fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineStep::Booting => write!(f, "booting sandbox"),
            PipelineStep::Mounting => write!(f, "mounting files"),
            PipelineStep::Installing => write!(f, "installing dependencies"),
            PipelineStep::Starting => write!(f, "starting server"),
            PipelineStep::WaitingForServer => write!(f, "waiting for server"),
        }
    }
}

/// State of one preview request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewSession {
    /// Request this state belongs to; 0 before the first request
    pub run_id: u64,
    /// Current phase
    pub phase: Phase,
    /// Current step while loading
    pub step: Option<PipelineStep>,
    /// Preview URL once ready
    pub url: Option<String>,
    /// Classified failure once errored
    pub error: Option<ClassifiedError>,
}

impl PreviewSession {
    /// Fresh session with no request
    pub fn idle() -> Self {
        Self::default()
    }

    /// Start a new request, discarding whatever the previous one produced
    pub fn begin(&mut self, run_id: u64) {
        *self = PreviewSession {
            run_id,
            phase: Phase::Loading,
            step: None,
            url: None,
            error: None,
        };
    }

    /// Record progress; only valid while loading
    pub fn advance(&mut self, step: PipelineStep) -> bool {
        if self.phase != Phase::Loading {
            return false;
        }
        self.step = Some(step);
        true
    }

    /// Loading → Ready
    pub fn mark_ready(&mut self, url: impl Into<String>) -> bool {
        if self.phase != Phase::Loading {
            return false;
        }
        self.phase = Phase::Ready;
        self.step = None;
        self.url = Some(url.into());
        true
    }

    /// Loading → Error
    pub fn mark_failed(&mut self, error: ClassifiedError) -> bool {
        if self.phase != Phase::Loading {
            return false;
        }
        self.phase = Phase::Error;
        self.step = None;
        self.error = Some(error);
        true
    }

    pub fn is_loading(&self) -> bool {
        self.phase == Phase::Loading
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, Phase::Ready | Phase::Error)
    }
}

/// Publishes session snapshots to subscribers and drops updates from
/// superseded requests.
#[derive(Debug, Clone)]
pub struct SessionTracker {
    tx: watch::Sender<PreviewSession>,
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(PreviewSession::idle());
        SessionTracker { tx }
    }

    /// Subscribe to session snapshots
    pub fn subscribe(&self) -> watch::Receiver<PreviewSession> {
        self.tx.subscribe()
    }

    /// Current snapshot
    pub fn current(&self) -> PreviewSession {
        self.tx.borrow().clone()
    }

    /// Start request `run_id`
    pub fn begin(&self, run_id: u64) {
        self.tx.send_modify(|s| s.begin(run_id));
    }

    /// Apply `f` if `run_id` is still the active request
    pub fn update<F>(&self, run_id: u64, f: F) -> bool
    where
        F: FnOnce(&mut PreviewSession) -> bool,
    {
        self.tx.send_if_modified(|session| {
            if session.run_id != run_id {
                debug!(run_id, active = session.run_id, "Ignoring update from superseded run");
                return false;
            }
            f(session)
        })
    }

    /// Snapshot of `run_id`, if it is still the active request
    pub fn snapshot(&self, run_id: u64) -> Option<PreviewSession> {
        let session = self.tx.borrow();
        (session.run_id == run_id).then(|| session.clone())
    }
}

/// What the preview panel shows for a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreviewPanel {
    /// Nothing requested; offer to start when files exist
    Empty {
        /// Whether a start action should be offered
        can_start: bool,
    },
    /// Loading spinner
    Spinner {
        /// Progress text
        detail: String,
    },
    /// Embedded preview with refresh and open-in-new-tab actions
    Preview {
        /// Frame source
        url: String,
    },
    /// Error text with a retry action
    Failure {
        /// Rendered message including remediation steps
        message: String,
    },
}

impl PreviewPanel {
    /// Map a session onto the panel the user sees
    pub fn for_session(session: &PreviewSession, has_files: bool) -> Self {
        match session.phase {
            Phase::Idle => PreviewPanel::Empty {
                can_start: has_files,
            },
            Phase::Loading => PreviewPanel::Spinner {
                detail: session
                    .step
                    .map(|s| format!("Starting preview server: {}...", s))
                    .unwrap_or_else(|| "Starting preview server...".to_string()),
            },
            Phase::Ready => match &session.url {
                Some(url) => PreviewPanel::Preview { url: url.clone() },
                None => PreviewPanel::Empty {
                    can_start: has_files,
                },
            },
            Phase::Error => PreviewPanel::Failure {
                message: session
                    .error
                    .as_ref()
                    .map(ClassifiedError::user_message)
                    .unwrap_or_else(|| "Preview failed".to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::classify_message;

    #[test]
    fn test_happy_path() {
        let mut session = PreviewSession::idle();
        assert_eq!(session.phase, Phase::Idle);

        session.begin(1);
        assert!(session.advance(PipelineStep::Installing));
        assert!(session.mark_ready("http://localhost:3000"));
        assert_eq!(session.phase, Phase::Ready);
        assert_eq!(session.step, None);
        assert_eq!(session.url.as_deref(), Some("http://localhost:3000"));
    }

    #[test]
    fn test_terminal_states_reject_transitions() {
        let mut session = PreviewSession::idle();
        assert!(!session.mark_ready("x"));

        session.begin(1);
        assert!(session.mark_failed(classify_message("boom")));
        assert!(!session.mark_ready("x"));
        assert!(!session.advance(PipelineStep::Mounting));
        assert!(session.url.is_none());
    }

    #[test]
    fn test_new_request_restarts_from_error() {
        let mut session = PreviewSession::idle();
        session.begin(1);
        session.mark_failed(classify_message("boom"));

        session.begin(2);
        assert!(session.is_loading());
        assert!(session.error.is_none());
        assert_eq!(session.run_id, 2);
    }

    #[test]
    fn test_tracker_ignores_stale_runs() {
        let tracker = SessionTracker::new();
        let mut rx = tracker.subscribe();

        tracker.begin(1);
        tracker.begin(2);
        assert!(!tracker.update(1, |s| s.mark_ready("old")));
        assert!(tracker.update(2, |s| s.mark_ready("new")));

        assert!(rx.has_changed().unwrap());
        let current = rx.borrow_and_update().clone();
        assert_eq!(current.url.as_deref(), Some("new"));
        assert!(tracker.snapshot(1).is_none());
    }

    #[test]
    fn test_panel_mapping() {
        let mut session = PreviewSession::idle();
        assert_eq!(
            PreviewPanel::for_session(&session, true),
            PreviewPanel::Empty { can_start: true }
        );

        session.begin(1);
        session.advance(PipelineStep::Installing);
        match PreviewPanel::for_session(&session, true) {
            PreviewPanel::Spinner { detail } => assert!(detail.contains("installing")),
            other => panic!("unexpected panel: {:?}", other),
        }

        session.mark_failed(classify_message("storage is not allowed"));
        match PreviewPanel::for_session(&session, true) {
            PreviewPanel::Failure { message } => assert!(message.contains("1. ")),
            other => panic!("unexpected panel: {:?}", other),
        }
    }
}
