//! Relay session lifecycle.
//!
//! A session is one relay attempt for one camera. It is created when a
//! start request arrives and lives until its relay thread reaches a
//! terminal state. The registry holds an `Arc<Session>` under the camera's
//! id for as long as the attempt occupies the camera's slot.
//!
//! ## Session lifecycle
//!
//! ```text
//! start request      -> Requested
//! slot reserved      -> Reserved
//! thread running     -> Resolving   (camera control: GetStreamUri)
//! source resolved    -> Relaying    (relay engine packet loop)
//! end of stream      -> Completed
//! any fatal error    -> Failed(cause)
//! cancellation flag  -> Cancelled
//! ```
//!
//! Terminal states are final. The slot is released before waiters on the
//! terminal state are woken, so a woken waiter always observes a free slot.

pub mod manager;
pub mod registry;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::Deserialize;

use crate::camera::CameraId;
use crate::config::serde_secs;
use crate::error::RelayError;

pub use manager::{SessionManager, StopOutcome};
pub use registry::{InMemoryRegistry, Reservation, SessionRegistry};

/// Default cap on concurrently running sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 32;

/// Default time `stop` waits for a cancelled session to wind down.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Session manager limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum number of concurrently running sessions; `None` is unbounded.
    pub max_sessions: Option<usize>,
    /// How long `stop` and `shutdown` wait for a cancelled session.
    #[serde(with = "serde_secs")]
    pub stop_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: Some(DEFAULT_MAX_SESSIONS),
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

/// Why a session failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// The camera did not yield a media source.
    SourceResolution(String),
    /// The relay engine stopped on an error.
    Relay(RelayError),
    /// The session thread panicked.
    Panicked(String),
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::SourceResolution(reason) => {
                write!(f, "source resolution failed: {reason}")
            }
            FailureCause::Relay(err) => write!(f, "{err}"),
            FailureCause::Panicked(reason) => write!(f, "session thread panicked: {reason}"),
        }
    }
}

/// Session state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Requested,
    Reserved,
    Resolving,
    Relaying,
    Completed,
    Failed(FailureCause),
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed(_) | SessionState::Cancelled
        )
    }

    /// Lowercase state name, as reported by status queries.
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Requested => "requested",
            SessionState::Reserved => "reserved",
            SessionState::Resolving => "resolving",
            SessionState::Relaying => "relaying",
            SessionState::Completed => "completed",
            SessionState::Failed(_) => "failed",
            SessionState::Cancelled => "cancelled",
        }
    }

    pub fn failure(&self) -> Option<&FailureCause> {
        match self {
            SessionState::Failed(cause) => Some(cause),
            _ => None,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Failed(cause) => write!(f, "failed ({cause})"),
            other => f.write_str(other.name()),
        }
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub camera: CameraId,
    pub destination: String,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub packets: u64,
}

#[derive(Debug)]
struct Progress {
    state: SessionState,
    finished_at: Option<DateTime<Utc>>,
    /// Set once the terminal state is recorded and the slot released.
    settled: bool,
}

/// One relay attempt for one camera.
///
/// Shared between the manager, the registry, and the session thread.
/// State lives behind a `parking_lot::Mutex` paired with a `Condvar` so
/// `stop` can wait for the terminal state with a deadline.
#[derive(Debug)]
pub struct Session {
    camera: CameraId,
    destination: String,
    started_at: DateTime<Utc>,
    progress: Mutex<Progress>,
    settled: Condvar,
    cancel: AtomicBool,
    packets: AtomicU64,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub fn new(camera: CameraId, destination: impl Into<String>) -> Self {
        Session {
            camera,
            destination: destination.into(),
            started_at: Utc::now(),
            progress: Mutex::new(Progress {
                state: SessionState::Requested,
                finished_at: None,
                settled: false,
            }),
            settled: Condvar::new(),
            cancel: AtomicBool::new(false),
            packets: AtomicU64::new(0),
            thread: Mutex::new(None),
        }
    }

    pub fn camera(&self) -> &CameraId {
        &self.camera
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn state(&self) -> SessionState {
        self.progress.lock().state.clone()
    }

    /// Packets written to the destination so far.
    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub(crate) fn packet_counter(&self) -> &AtomicU64 {
        &self.packets
    }

    /// Ask the session to stop. Observed before resolution, after
    /// resolution, and between relayed packets.
    pub fn cancel(&self) {
        if !self.cancel.swap(true, Ordering::AcqRel) {
            tracing::debug!(camera = %self.camera, "cancellation requested");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    pub(crate) fn cancel_flag(&self) -> &AtomicBool {
        &self.cancel
    }

    /// Move to a non-terminal state. Ignored once terminal.
    pub(crate) fn transition(&self, state: SessionState) {
        let mut progress = self.progress.lock();
        if progress.state.is_terminal() {
            return;
        }
        tracing::info!(
            camera = %self.camera,
            destination = %self.destination,
            from = progress.state.name(),
            to = state.name(),
            "session state changed"
        );
        progress.state = state;
    }

    /// Record the terminal state. Waiters are not woken until [`settle`].
    ///
    /// [`settle`]: Session::settle
    pub(crate) fn finish(&self, state: SessionState) {
        let mut progress = self.progress.lock();
        if progress.state.is_terminal() {
            return;
        }
        match &state {
            SessionState::Failed(cause) => tracing::error!(
                camera = %self.camera,
                destination = %self.destination,
                from = progress.state.name(),
                cause = %cause,
                packets = self.packets(),
                "session failed"
            ),
            _ => tracing::info!(
                camera = %self.camera,
                destination = %self.destination,
                from = progress.state.name(),
                to = state.name(),
                packets = self.packets(),
                "session finished"
            ),
        }
        progress.state = state;
        progress.finished_at = Some(Utc::now());
    }

    /// Wake everyone waiting in [`wait_settled`](Session::wait_settled).
    pub(crate) fn settle(&self) {
        self.progress.lock().settled = true;
        self.settled.notify_all();
    }

    /// Wait until the session is terminal and its slot released.
    /// Returns `false` if `timeout` elapsed first.
    pub fn wait_settled(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut progress = self.progress.lock();
        while !progress.settled {
            if self.settled.wait_until(&mut progress, deadline).timed_out() {
                return progress.settled;
            }
        }
        true
    }

    pub fn is_settled(&self) -> bool {
        self.progress.lock().settled
    }

    pub(crate) fn set_thread(&self, handle: JoinHandle<()>) {
        *self.thread.lock() = Some(handle);
    }

    /// Join the session thread if it has been started and not yet joined.
    pub(crate) fn join(&self) {
        let handle = self.thread.lock().take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            tracing::warn!(camera = %self.camera, "session thread exited by panic");
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let progress = self.progress.lock();
        SessionSnapshot {
            camera: self.camera.clone(),
            destination: self.destination.clone(),
            state: progress.state.clone(),
            started_at: self.started_at,
            finished_at: progress.finished_at,
            packets: self.packets(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::error::MediaError;

    fn session() -> Session {
        Session::new(CameraId::parse("10.0.0.5").unwrap(), "rtp://10.0.0.9:5000")
    }

    #[test]
    fn new_session_is_requested() {
        let s = session();
        assert_eq!(s.state(), SessionState::Requested);
        assert_eq!(s.packets(), 0);
        assert!(!s.is_cancelled());
        assert!(s.snapshot().finished_at.is_none());
    }

    #[test]
    fn terminal_state_is_final() {
        let s = session();
        s.transition(SessionState::Reserved);
        s.finish(SessionState::Completed);
        s.transition(SessionState::Relaying);
        s.finish(SessionState::Cancelled);

        assert_eq!(s.state(), SessionState::Completed);
        assert!(s.snapshot().finished_at.is_some());
    }

    #[test]
    fn failure_cause_is_reported() {
        let s = session();
        let cause = FailureCause::Relay(RelayError::PacketWrite(MediaError::new("broken pipe")));
        s.finish(SessionState::Failed(cause.clone()));

        let state = s.state();
        assert_eq!(state.name(), "failed");
        assert_eq!(state.failure(), Some(&cause));
        assert_eq!(
            state.to_string(),
            "failed (failed to write packet: broken pipe)"
        );
    }

    #[test]
    fn wait_settled_times_out_while_running() {
        let s = session();
        s.finish(SessionState::Completed);
        // Terminal but not yet settled.
        assert!(!s.wait_settled(Duration::from_millis(20)));
    }

    #[test]
    fn wait_settled_wakes_on_settle() {
        let s = Arc::new(session());
        let worker = {
            let s = s.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                s.finish(SessionState::Cancelled);
                s.settle();
            })
        };

        assert!(s.wait_settled(Duration::from_secs(5)));
        assert_eq!(s.state(), SessionState::Cancelled);
        worker.join().unwrap();
    }

    #[test]
    fn cancel_is_sticky() {
        let s = session();
        s.cancel();
        s.cancel();
        assert!(s.is_cancelled());
        assert!(s.cancel_flag().load(Ordering::Acquire));
    }
}
