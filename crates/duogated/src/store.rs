//! Shared state between the acquisition loop, the verification worker and
//! the control surface.
//!
//! One `StateStore` is created in `main` and cloned (cheaply, it is an `Arc`)
//! into every component. Each buffer has its own lock, held only for a single
//! read or write. Lock order, where two are taken together: session, then
//! results.

use duogate_core::{Clock, Person, SessionPhase, StatusSnapshot};
use duogate_hw::{Frame, OverlayStatus};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Notify};

const STATUS_CHANNEL_CAPACITY: usize = 64;

/// Name shown while no person is active.
pub const IDLE_NAME: &str = "Idle";

/// Identifies one scan session. Incremented on every start.
pub type SessionId = u64;

/// The authoritative record of a scan session. Written only by the worker
/// (and by the control surface at session start/stop).
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationState {
    pub phase: SessionPhase,
    pub barcode_ok: bool,
    pub barcode_expires_at: Option<Instant>,
    pub face_ok: bool,
    pub face_expires_at: Option<Instant>,
    pub active_person: Option<Person>,
    pub display_name: String,
    pub timed_out: bool,
    /// Similarity of the most recent completed face comparison.
    pub last_similarity: Option<f32>,
}

impl VerificationState {
    pub fn idle() -> Self {
        Self {
            phase: SessionPhase::Idle,
            barcode_ok: false,
            barcode_expires_at: None,
            face_ok: false,
            face_expires_at: None,
            active_person: None,
            display_name: IDLE_NAME.to_string(),
            timed_out: false,
            last_similarity: None,
        }
    }

    /// Fresh state for a newly armed session.
    pub fn awaiting_badge() -> Self {
        Self {
            phase: SessionPhase::AwaitingBadge,
            ..Self::idle()
        }
    }

    /// Forget the active person and show the idle name again.
    pub fn clear_person(&mut self) {
        self.active_person = None;
        self.display_name = IDLE_NAME.to_string();
    }

    pub fn authorized(&self) -> bool {
        self.barcode_ok && self.face_ok
    }

    /// Whether the badge factor holds at `now`.
    pub fn barcode_valid_at(&self, now: Instant) -> bool {
        self.barcode_ok && self.barcode_expires_at.is_some_and(|t| now <= t)
    }

    /// Clear every factor whose validity window has closed.
    ///
    /// Losing the badge also drops the face factor and the active person, and
    /// returns the session to waiting for a badge.
    pub fn expire(&mut self, now: Instant) {
        if self.barcode_expires_at.map_or(true, |t| now > t) {
            self.barcode_ok = false;
        }
        if self.face_expires_at.map_or(true, |t| now > t) {
            self.face_ok = false;
        }
        if !self.barcode_ok {
            self.face_ok = false;
            if self.phase == SessionPhase::FaceMatching {
                self.phase = SessionPhase::AwaitingBadge;
                self.clear_person();
            }
        }
    }

    /// The externally visible view of this state.
    pub fn snapshot(&self, running: bool) -> StatusSnapshot {
        let authorized = self.authorized();
        StatusSnapshot {
            running,
            phase: self.phase,
            authorized,
            user: authorized.then(|| self.display_name.clone()),
            face_verified: self.face_ok,
            barcode_verified: self.barcode_ok,
            current_name: self.display_name.clone(),
            badge_timeout_exceeded: self.timed_out,
        }
    }
}

/// Why a preview consumer must stop delivering frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PreviewClosed {
    #[error("preview not requested")]
    NotRequested,
    #[error("capture already taken")]
    Captured,
}

#[derive(Debug, Default)]
struct SessionFlags {
    id: SessionId,
    running: bool,
    stop_requested: bool,
    worker_attached: bool,
}

impl SessionFlags {
    fn active(&self) -> bool {
        self.running && !self.stop_requested
    }
}

#[derive(Debug, Default)]
struct PreviewSignals {
    requested: bool,
    captured: bool,
}

struct Results {
    state: VerificationState,
    published: StatusSnapshot,
}

struct StoreInner {
    frame: Mutex<Option<Frame>>,
    raw_frame: Mutex<Option<Frame>>,
    preview: Mutex<PreviewSignals>,
    capture_notify: Notify,
    session: Mutex<SessionFlags>,
    results: Mutex<Results>,
    last_badge_at: Mutex<Instant>,
    badge_timeout: Duration,
    clock: Arc<dyn Clock>,
    status_tx: broadcast::Sender<StatusSnapshot>,
}

/// Thread-safe holder of frames, verification results and session flags.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<StoreInner>,
}

impl StateStore {
    pub fn new(clock: Arc<dyn Clock>, badge_timeout: Duration) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let now = clock.now();

        Self {
            inner: Arc::new(StoreInner {
                frame: Mutex::new(None),
                raw_frame: Mutex::new(None),
                preview: Mutex::new(PreviewSignals::default()),
                capture_notify: Notify::new(),
                session: Mutex::new(SessionFlags::default()),
                results: Mutex::new(Results {
                    state: VerificationState::idle(),
                    published: StatusSnapshot::default(),
                }),
                last_badge_at: Mutex::new(now),
                badge_timeout,
                clock,
                status_tx,
            }),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    // ---- annotated frame ----

    pub fn set_frame(&self, frame: Frame) {
        *self.inner.frame.lock() = Some(frame);
    }

    pub fn frame(&self) -> Option<Frame> {
        self.inner.frame.lock().clone()
    }

    // ---- raw (preview) frame ----

    pub fn set_raw_frame(&self, frame: Frame) {
        *self.inner.raw_frame.lock() = Some(frame);
    }

    pub fn raw_frame(&self) -> Option<Frame> {
        self.inner.raw_frame.lock().clone()
    }

    // ---- preview signals ----

    /// Open a fresh preview. Any frame frozen by an earlier capture is
    /// discarded so it cannot be embedded for this one.
    pub fn request_preview(&self) {
        {
            let mut preview = self.inner.preview.lock();
            preview.captured = false;
            preview.requested = true;
        }
        *self.inner.raw_frame.lock() = None;
    }

    pub fn stop_preview(&self) {
        self.inner.preview.lock().requested = false;
    }

    pub fn mark_captured(&self) {
        self.inner.preview.lock().captured = true;
        self.inner.capture_notify.notify_waiters();
    }

    /// Consume the one-shot capture signal, returning whether it was set.
    pub fn take_capture(&self) -> bool {
        std::mem::take(&mut self.inner.preview.lock().captured)
    }

    /// Preview frames should still be produced: requested and not yet captured.
    pub fn preview_live(&self) -> bool {
        let preview = self.inner.preview.lock();
        preview.requested && !preview.captured
    }

    /// The frame a preview consumer may deliver right now.
    ///
    /// Fails once capture has been signalled or the preview was revoked, even
    /// if a frame is buffered.
    pub fn preview_frame(&self) -> Result<Option<Frame>, PreviewClosed> {
        {
            let preview = self.inner.preview.lock();
            if !preview.requested {
                return Err(PreviewClosed::NotRequested);
            }
            if preview.captured {
                return Err(PreviewClosed::Captured);
            }
        }
        Ok(self.raw_frame())
    }

    /// Resolve once capture has been signalled.
    pub async fn wait_for_capture(&self) {
        loop {
            // Registered before the check so a concurrent `mark_captured`
            // cannot slip between the two.
            let notified = self.inner.capture_notify.notified();
            if self.inner.preview.lock().captured {
                return;
            }
            notified.await;
        }
    }

    // ---- badge timeout ----

    /// Restart the badge-absence timer.
    pub fn touch_badge_clock(&self) {
        *self.inner.last_badge_at.lock() = self.inner.clock.now();
    }

    pub fn badge_timeout_exceeded(&self) -> bool {
        let last = *self.inner.last_badge_at.lock();
        self.inner.clock.now().saturating_duration_since(last) > self.inner.badge_timeout
    }

    // ---- results ----

    pub fn status(&self) -> StatusSnapshot {
        self.inner.results.lock().published.clone()
    }

    pub fn verification_state(&self) -> VerificationState {
        self.inner.results.lock().state.clone()
    }

    pub fn overlay_status(&self) -> OverlayStatus {
        let running = self.inner.session.lock().running;
        let results = self.inner.results.lock();
        OverlayStatus {
            barcode_ok: results.state.barcode_ok,
            face_ok: results.state.face_ok,
            scanning: running,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusSnapshot> {
        self.inner.status_tx.subscribe()
    }

    /// Replace the verification state of `session`.
    ///
    /// Observers are notified only when the visible snapshot changes. Updates
    /// from a superseded session are dropped.
    pub fn update_results(&self, session: SessionId, state: VerificationState) -> bool {
        let flags = self.inner.session.lock();
        if flags.id != session || !flags.running {
            tracing::debug!(session, current = flags.id, "dropping update from stale session");
            return false;
        }
        self.publish_locked(&flags, state)
    }

    fn publish_locked(&self, flags: &SessionFlags, state: VerificationState) -> bool {
        let snapshot = state.snapshot(flags.running);
        let mut results = self.inner.results.lock();
        results.state = state;
        if snapshot == results.published {
            return false;
        }
        results.published = snapshot.clone();
        // No receivers is fine: nobody is watching.
        let _ = self.inner.status_tx.send(snapshot);
        true
    }

    // ---- session lifecycle ----

    /// Arm a new scan session. No-op while one is already active.
    ///
    /// A stopped session whose worker has not exited yet is concluded here,
    /// since its worker can no longer publish once the id moves on.
    pub fn start_session(&self) -> Option<SessionId> {
        let mut flags = self.inner.session.lock();
        if flags.active() {
            return None;
        }
        if flags.running {
            let mut state = self.inner.results.lock().state.clone();
            conclude(&mut state);
            flags.running = false;
            tracing::info!(session = flags.id, phase = ?state.phase, "stopped session superseded");
            self.publish_locked(&flags, state);
        }
        flags.id += 1;
        flags.running = true;
        flags.stop_requested = false;
        flags.worker_attached = false;
        self.touch_badge_clock();
        self.publish_locked(&flags, VerificationState::awaiting_badge());
        tracing::info!(session = flags.id, "scan session started");
        Some(flags.id)
    }

    /// Request cancellation of the active session.
    ///
    /// Returns false when there is nothing to stop, so repeated calls are
    /// harmless. If no worker has picked the session up yet, the final state
    /// is published here; otherwise the worker publishes it on exit.
    pub fn stop_session(&self) -> bool {
        let mut flags = self.inner.session.lock();
        if !flags.active() {
            return false;
        }
        flags.stop_requested = true;
        tracing::info!(session = flags.id, "scan session stop requested");

        if !flags.worker_attached {
            let mut state = self.inner.results.lock().state.clone();
            conclude(&mut state);
            flags.running = false;
            flags.stop_requested = false;
            self.publish_locked(&flags, state);
        }
        true
    }

    /// The session the acquisition loop should be feeding, if any.
    pub fn armed_session(&self) -> Option<SessionId> {
        let flags = self.inner.session.lock();
        flags.active().then_some(flags.id)
    }

    pub fn session_active(&self, session: SessionId) -> bool {
        let flags = self.inner.session.lock();
        flags.id == session && flags.active()
    }

    /// Claim `session` for a worker. Fails if it was stopped or superseded.
    pub fn attach_worker(&self, session: SessionId) -> bool {
        let mut flags = self.inner.session.lock();
        if flags.id != session || !flags.active() || flags.worker_attached {
            return false;
        }
        flags.worker_attached = true;
        true
    }

    /// Publish the final state of `session` and clear its flags.
    pub fn finish_session(&self, session: SessionId, mut state: VerificationState) {
        let mut flags = self.inner.session.lock();
        if flags.id != session {
            tracing::debug!(session, current = flags.id, "session superseded before finishing");
            return;
        }
        if !flags.running {
            tracing::debug!(session, "session already finished");
            return;
        }
        conclude(&mut state);
        flags.running = false;
        flags.stop_requested = false;
        flags.worker_attached = false;
        tracing::info!(
            session,
            phase = ?state.phase,
            authorized = state.authorized(),
            "scan session finished"
        );
        self.publish_locked(&flags, state);
    }
}

/// A session that ends without reaching a verdict is denied.
fn conclude(state: &mut VerificationState) {
    if !state.phase.is_terminal() {
        state.phase = SessionPhase::Denied;
        state.barcode_ok = false;
        state.face_ok = false;
    }
}
