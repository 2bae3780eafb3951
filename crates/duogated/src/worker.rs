//! The verification worker: one thread per scan session.
//!
//! State machine: `AwaitingBadge → FaceMatching → {Authorized | Denied | TimedOut}`.
//! Every iteration runs detection, then the badge-timeout check, then expiry,
//! in that fixed order.

use crate::config::VerifierSettings;
use crate::pool::{EmbedPoll, EmbedPool, PendingEmbed};
use crate::slot::{FrameTask, TaskSlot};
use crate::store::{SessionId, StateStore, VerificationState};
use duogate_core::{
    first_code, largest_face, BarcodeDecoder, BiometricTemplate, LookupError, Person,
    PersonLookup, SessionPhase,
};
use duogate_hw::Frame;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Everything a worker needs, cloned into each session's thread.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: StateStore,
    pub slot: Arc<TaskSlot>,
    pub decoder: Arc<dyn BarcodeDecoder>,
    pub lookup: Arc<dyn PersonLookup>,
    pub pool: EmbedPool,
    pub settings: VerifierSettings,
}

/// Outcome of one worker iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Finished,
}

/// Per-session verification logic, driven one task at a time.
pub struct Verifier {
    ctx: WorkerContext,
    state: VerificationState,
    last_barcode_scan: Option<Instant>,
    last_face_scan: Option<Instant>,
    pending_face: Option<PendingEmbed>,
}

impl Verifier {
    pub fn new(ctx: WorkerContext) -> Self {
        Self {
            ctx,
            state: VerificationState::awaiting_badge(),
            last_barcode_scan: None,
            last_face_scan: None,
            pending_face: None,
        }
    }

    pub fn state(&self) -> &VerificationState {
        &self.state
    }

    pub fn face_in_flight(&self) -> bool {
        self.pending_face.is_some()
    }

    /// Run one iteration. `task` is `None` when the slot wait timed out;
    /// timeout and expiry still apply.
    pub fn step(&mut self, task: Option<FrameTask>) -> Flow {
        let now = self.ctx.store.clock().now();

        if let Some(task) = task {
            self.detect_badge(&task, now);
            self.dispatch_face(task.frame, task.timestamp, now);
        }
        if self.poll_face(now) {
            return Flow::Finished;
        }

        if self.ctx.store.badge_timeout_exceeded() && !self.state.barcode_ok {
            tracing::warn!("no badge presented before timeout");
            self.state.phase = SessionPhase::TimedOut;
            self.state.timed_out = true;
            self.state.barcode_ok = false;
            self.state.face_ok = false;
            self.pending_face = None;
            return Flow::Finished;
        }

        self.state.expire(now);
        if self.state.phase == SessionPhase::AwaitingBadge {
            // A job for a person who is no longer active must not count.
            self.pending_face = None;
        }
        Flow::Continue
    }

    fn detect_badge(&mut self, task: &FrameTask, now: Instant) {
        if self.state.phase != SessionPhase::AwaitingBadge
            || !throttle_elapsed(self.last_barcode_scan, task.timestamp, self.ctx.settings.barcode_interval)
        {
            return;
        }
        self.last_barcode_scan = Some(task.timestamp);

        let roi = task.frame.crop(&task.roi);
        let decoded = catch_unwind(AssertUnwindSafe(|| {
            self.ctx.decoder.decode(&roi.data, roi.width, roi.height)
        }));
        let codes = match decoded {
            Ok(Ok(codes)) => codes,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "barcode decoder failed; skipping frame");
                return;
            }
            Err(_) => {
                tracing::error!("barcode decoder panicked; skipping frame");
                return;
            }
        };
        let Some(badge) = first_code(&codes) else {
            return;
        };
        tracing::info!(badge, "badge decoded");

        let found = catch_unwind(AssertUnwindSafe(|| self.ctx.lookup.find_person_by_badge(badge)))
            .unwrap_or_else(|_| Err(LookupError::Unavailable("lookup panicked".into())));
        match found {
            Ok(Some(person)) if person.template.is_some() => self.accept_badge(person, now),
            Ok(Some(person)) => {
                tracing::warn!(badge = %person.badge, "person has no usable face template");
                self.reject_badge();
            }
            Ok(None) => {
                tracing::info!(badge, "badge not found");
                self.reject_badge();
            }
            Err(e) => {
                tracing::warn!(badge, error = %e, "person lookup failed");
                self.reject_badge();
            }
        }
    }

    fn accept_badge(&mut self, person: Person, now: Instant) {
        tracing::info!(badge = %person.badge, name = %person.display_name(), "badge accepted");
        self.state.barcode_ok = true;
        self.state.barcode_expires_at = Some(now + self.ctx.settings.valid_for);
        self.state.display_name = person.display_name();
        self.state.active_person = Some(person);
        self.state.last_similarity = None;
        self.state.phase = SessionPhase::FaceMatching;
        self.ctx.store.touch_badge_clock();
    }

    fn reject_badge(&mut self) {
        self.state.barcode_ok = false;
        self.state.barcode_expires_at = None;
        self.state.face_ok = false;
        self.state.clear_person();
        self.state.phase = SessionPhase::AwaitingBadge;
        self.pending_face = None;
    }

    fn active_template(&self) -> Option<&BiometricTemplate> {
        self.state
            .active_person
            .as_ref()
            .and_then(|p| p.template.as_ref())
    }

    fn dispatch_face(&mut self, frame: Frame, timestamp: Instant, now: Instant) {
        if self.pending_face.is_some()
            || self.state.phase != SessionPhase::FaceMatching
            || !self.state.barcode_valid_at(now)
            || self.active_template().is_none()
            || !throttle_elapsed(self.last_face_scan, timestamp, self.ctx.settings.face_interval)
        {
            return;
        }

        match self.ctx.pool.try_submit(frame) {
            Some(pending) => {
                self.last_face_scan = Some(timestamp);
                self.pending_face = Some(pending);
            }
            None => tracing::debug!("embedding pool saturated; retrying next frame"),
        }
    }

    /// Collect a finished embedding job. Returns true on a granted match.
    fn poll_face(&mut self, now: Instant) -> bool {
        let Some(pending) = self.pending_face.as_mut() else {
            return false;
        };
        let result = match pending.poll() {
            EmbedPoll::Pending => return false,
            EmbedPoll::Ready(result) => result,
        };
        self.pending_face = None;

        let faces = match result {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(error = %e, "face embedding failed");
                return false;
            }
        };
        let Some(face) = largest_face(&faces) else {
            tracing::debug!("no face in frame");
            return false;
        };
        let live = match BiometricTemplate::from_raw(face.vector.clone()) {
            Ok(live) => live,
            Err(e) => {
                tracing::warn!(error = %e, "unusable live embedding");
                return false;
            }
        };
        let Some(template) = self.active_template() else {
            return false;
        };
        let Some(similarity) = template.similarity(&live) else {
            tracing::warn!(
                stored = template.dim(),
                live = live.dim(),
                "embedding dimensions differ; check the embedding model"
            );
            return false;
        };
        self.state.last_similarity = Some(similarity);

        if similarity >= self.ctx.settings.similarity_threshold && self.state.barcode_valid_at(now) {
            self.state.face_ok = true;
            self.state.face_expires_at = Some(now + self.ctx.settings.valid_for);
            self.state.phase = SessionPhase::Authorized;
            tracing::info!(name = %self.state.display_name, similarity, "access granted");
            true
        } else {
            self.state.face_ok = false;
            tracing::info!(name = %self.state.display_name, similarity, "face mismatch");
            false
        }
    }

    /// Drive `session` until it is stopped, superseded or reaches a verdict,
    /// then publish its final state.
    pub fn run(mut self, session: SessionId) {
        let store = self.ctx.store.clone();
        let slot = Arc::clone(&self.ctx.slot);
        if !store.attach_worker(session) {
            tracing::debug!(session, "session no longer armed; worker not needed");
            return;
        }
        let _finish = FinishOnPanic {
            store: store.clone(),
            session,
        };
        slot.clear();
        tracing::info!(session, "verification worker started");

        while store.session_active(session) {
            let task = slot.take_timeout(self.ctx.settings.task_wait);
            if !store.session_active(session) {
                break;
            }
            let flow = self.step(task);
            if flow == Flow::Finished {
                break;
            }
            store.update_results(session, self.state.clone());
        }

        store.finish_session(session, self.state);
    }
}

/// Ends the session with its last published state if the worker unwinds.
struct FinishOnPanic {
    store: StateStore,
    session: SessionId,
}

impl Drop for FinishOnPanic {
    fn drop(&mut self) {
        if std::thread::panicking() {
            tracing::error!(session = self.session, "verification worker panicked; ending session");
            self.store
                .finish_session(self.session, self.store.verification_state());
        }
    }
}

fn throttle_elapsed(last: Option<Instant>, at: Instant, interval: Duration) -> bool {
    last.map_or(true, |last| at.saturating_duration_since(last) > interval)
}

/// Keeps at most one worker thread alive and starts one for each newly
/// armed session.
pub struct WorkerSupervisor {
    ctx: WorkerContext,
    current: Option<(SessionId, JoinHandle<()>)>,
}

impl WorkerSupervisor {
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx, current: None }
    }

    /// Make sure a worker is serving `session`.
    pub fn ensure_running(&mut self, session: SessionId) {
        if let Some((id, handle)) = &self.current {
            if !handle.is_finished() {
                if *id != session {
                    tracing::debug!(old = id, new = session, "waiting for previous worker to exit");
                }
                return;
            }
        }
        let finished = self.current.as_ref().map(|(id, _)| *id);
        self.reap();
        if finished == Some(session) {
            // Finished for this session already; nothing to restart.
            return;
        }

        let verifier = Verifier::new(self.ctx.clone());
        match std::thread::Builder::new()
            .name(format!("duogate-worker-{session}"))
            .spawn(move || verifier.run(session))
        {
            Ok(handle) => self.current = Some((session, handle)),
            Err(e) => tracing::error!(session, error = %e, "failed to spawn verification worker"),
        }
    }

    /// Join the current worker if it has exited.
    fn reap(&mut self) {
        if let Some((session, handle)) = self.current.take() {
            if handle.join().is_err() {
                tracing::error!(session, "verification worker panicked");
                let store = &self.ctx.store;
                store.finish_session(session, store.verification_state());
            }
        }
    }

    /// Block until the current worker exits.
    pub fn join(&mut self) {
        self.reap();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::IDLE_NAME;
    use duogate_core::{
        BoundingBox, Clock, DecodeError, EmbedError, FaceDetection, FaceEmbedder, LookupError,
        ManualClock,
    };
    use duogate_hw::Roi;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) const BADGE: &str = "E1234";

    /// Returns scripted decode results, then nothing.
    pub(crate) struct ScriptedDecoder {
        script: Mutex<VecDeque<Result<Vec<String>, DecodeError>>>,
        pub calls: AtomicUsize,
    }

    impl ScriptedDecoder {
        pub(crate) fn new(script: Vec<Result<Vec<String>, DecodeError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn badge_once() -> Self {
            Self::new(vec![Ok(vec![BADGE.to_string()])])
        }
    }

    impl BarcodeDecoder for ScriptedDecoder {
        fn decode(&self, _gray: &[u8], _w: u32, _h: u32) -> Result<Vec<String>, DecodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script.lock().pop_front().unwrap_or(Ok(Vec::new()))
        }
    }

    struct PanickingDecoder;

    impl BarcodeDecoder for PanickingDecoder {
        fn decode(&self, _gray: &[u8], _w: u32, _h: u32) -> Result<Vec<String>, DecodeError> {
            panic!("decoder crashed");
        }
    }

    struct PanickingLookup;

    impl PersonLookup for PanickingLookup {
        fn find_person_by_badge(&self, _badge: &str) -> Result<Option<Person>, LookupError> {
            panic!("lookup crashed");
        }
    }

    pub(crate) struct FixedLookup {
        person: Option<Person>,
        fail: bool,
    }

    impl FixedLookup {
        pub(crate) fn with_template(raw: Vec<f32>) -> Self {
            Self {
                person: Some(Person {
                    badge: BADGE.into(),
                    first_name: "First".into(),
                    last_name: "Last".into(),
                    template: Some(BiometricTemplate::from_raw(raw).unwrap()),
                }),
                fail: false,
            }
        }
    }

    impl PersonLookup for FixedLookup {
        fn find_person_by_badge(&self, badge: &str) -> Result<Option<Person>, LookupError> {
            if self.fail {
                return Err(LookupError::Unavailable("offline".into()));
            }
            Ok(self.person.clone().filter(|p| p.badge == badge))
        }
    }

    /// Returns one face with a fixed vector; counts calls.
    pub(crate) struct FixedEmbedder {
        vector: Vec<f32>,
        pub calls: AtomicUsize,
    }

    impl FixedEmbedder {
        pub(crate) fn new(vector: Vec<f32>) -> Self {
            Self { vector, calls: AtomicUsize::new(0) }
        }
    }

    impl FaceEmbedder for FixedEmbedder {
        fn embed(&self, _gray: &[u8], _w: u32, _h: u32) -> Result<Vec<FaceDetection>, EmbedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.vector.is_empty() {
                return Ok(Vec::new());
            }
            Ok(vec![
                FaceDetection {
                    bbox: BoundingBox { x: 0.0, y: 0.0, width: 4.0, height: 4.0 },
                    vector: vec![0.0; self.vector.len()],
                },
                FaceDetection {
                    bbox: BoundingBox { x: 0.0, y: 0.0, width: 40.0, height: 40.0 },
                    vector: self.vector.clone(),
                },
            ])
        }
    }

    pub(crate) struct Harness {
        pub rt: tokio::runtime::Runtime,
        pub clock: Arc<ManualClock>,
        pub store: StateStore,
        pub decoder: Arc<ScriptedDecoder>,
        pub embedder: Arc<FixedEmbedder>,
        pub ctx: WorkerContext,
    }

    impl Harness {
        pub(crate) fn new(decoder: ScriptedDecoder, lookup: FixedLookup, embedder: FixedEmbedder) -> Self {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let clock = Arc::new(ManualClock::new());
            let store = StateStore::new(clock.clone(), Duration::from_secs(10));
            let decoder = Arc::new(decoder);
            let embedder = Arc::new(embedder);
            let pool = EmbedPool::new(embedder.clone(), rt.handle().clone(), 2);
            let ctx = WorkerContext {
                store: store.clone(),
                slot: Arc::new(TaskSlot::new()),
                decoder: decoder.clone(),
                lookup: Arc::new(lookup),
                pool,
                settings: VerifierSettings {
                    task_wait: Duration::from_millis(20),
                    ..VerifierSettings::default()
                },
            };
            Self { rt, clock, store, decoder, embedder, ctx }
        }

        pub(crate) fn task(&self) -> FrameTask {
            FrameTask {
                frame: Frame::new(vec![0u8; 16 * 16], 16, 16, 0),
                roi: Roi::lower_left_quadrant(16, 16),
                timestamp: self.clock.now(),
            }
        }

        /// Step with fresh tasks at the current clock time until the
        /// in-flight face job resolves or the session finishes.
        pub(crate) fn settle(&self, verifier: &mut Verifier) -> Flow {
            for _ in 0..400 {
                let flow = verifier.step(Some(self.task()));
                if flow == Flow::Finished || !verifier.face_in_flight() {
                    return flow;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            panic!("face job never resolved");
        }
    }

    fn unit(x: f32, y: f32) -> Vec<f32> {
        vec![x, y]
    }

    #[test]
    fn test_scenario_authorized() {
        // Live vector at cos 0.8 to the stored template.
        let h = Harness::new(
            ScriptedDecoder::badge_once(),
            FixedLookup::with_template(unit(1.0, 0.0)),
            FixedEmbedder::new(unit(0.8, 0.6)),
        );
        h.store.start_session();
        let mut v = Verifier::new(h.ctx.clone());

        let first = v.step(Some(h.task()));
        assert!(v.state().barcode_ok);
        assert!(
            v.face_in_flight() || first == Flow::Finished,
            "face match dispatched in the badge tick"
        );

        let flow = if first == Flow::Finished { first } else { h.settle(&mut v) };
        assert_eq!(flow, Flow::Finished);
        let state = v.state();
        assert_eq!(state.phase, SessionPhase::Authorized);
        assert!(state.authorized());
        assert_eq!(state.display_name, "First Last");
        assert!((state.last_similarity.unwrap() - 0.8).abs() < 1e-5);
    }

    #[test]
    fn test_scenario_badge_timeout() {
        let h = Harness::new(
            ScriptedDecoder::new(vec![]),
            FixedLookup::with_template(unit(1.0, 0.0)),
            FixedEmbedder::new(unit(1.0, 0.0)),
        );
        h.store.start_session();
        let mut v = Verifier::new(h.ctx.clone());

        h.clock.advance(Duration::from_secs(9));
        assert_eq!(v.step(Some(h.task())), Flow::Continue);

        h.clock.advance(Duration::from_millis(1001));
        assert_eq!(v.step(None), Flow::Finished);
        let state = v.state();
        assert_eq!(state.phase, SessionPhase::TimedOut);
        assert!(state.timed_out);
        assert!(!state.authorized());
        assert_eq!(h.embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_scenario_face_mismatch_is_retryable() {
        // cos 0.3 < 0.5
        let live = unit(0.3, (1.0f32 - 0.09).sqrt());
        let h = Harness::new(
            ScriptedDecoder::badge_once(),
            FixedLookup::with_template(unit(1.0, 0.0)),
            FixedEmbedder::new(live),
        );
        h.store.start_session();
        let mut v = Verifier::new(h.ctx.clone());

        v.step(Some(h.task()));
        assert_eq!(h.settle(&mut v), Flow::Continue);
        let state = v.state();
        assert!(!state.face_ok);
        assert!(state.barcode_ok);
        assert_eq!(state.phase, SessionPhase::FaceMatching);
        assert!((state.last_similarity.unwrap() - 0.3).abs() < 1e-5);

        // Past the throttle another attempt is made.
        assert_eq!(h.embedder.calls.load(Ordering::SeqCst), 1);
        h.clock.advance(Duration::from_millis(600));
        h.settle(&mut v);
        assert_eq!(h.embedder.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_scenario_stale_badge_blocks_face_match() {
        // The embedder finds no face, so the badge tick leaves face_ok false.
        let h = Harness::new(
            ScriptedDecoder::badge_once(),
            FixedLookup::with_template(unit(1.0, 0.0)),
            FixedEmbedder::new(Vec::new()),
        );
        h.store.start_session();
        let mut v = Verifier::new(h.ctx.clone());

        v.step(Some(h.task()));
        h.settle(&mut v);
        assert!(v.state().barcode_ok);
        let attempts = h.embedder.calls.load(Ordering::SeqCst);

        h.clock.advance(Duration::from_secs(8));
        assert_eq!(v.step(Some(h.task())), Flow::Continue);
        assert!(!v.face_in_flight(), "no face match once the badge expired");
        assert_eq!(h.embedder.calls.load(Ordering::SeqCst), attempts);

        let state = v.state();
        assert!(!state.barcode_ok);
        assert!(!state.face_ok);
        assert_eq!(state.phase, SessionPhase::AwaitingBadge);
        assert!(state.active_person.is_none());
        assert_eq!(state.display_name, IDLE_NAME);
    }

    #[test]
    fn test_badge_validity_window_under_fast_forward() {
        let h = Harness::new(
            ScriptedDecoder::badge_once(),
            FixedLookup::with_template(unit(1.0, 0.0)),
            FixedEmbedder::new(Vec::new()),
        );
        h.store.start_session();
        let mut v = Verifier::new(h.ctx.clone());
        v.step(Some(h.task()));
        h.settle(&mut v);

        for _ in 0..20 {
            h.clock.advance(Duration::from_millis(500));
            v.step(None);
            let elapsed = h.clock.elapsed();
            assert_eq!(
                v.state().barcode_ok,
                elapsed <= Duration::from_secs(7),
                "at {elapsed:?}"
            );
            assert!(!v.state().face_ok || v.state().barcode_ok);
        }
    }

    #[test]
    fn test_unknown_badge_fails_closed_and_continues() {
        let h = Harness::new(
            ScriptedDecoder::new(vec![Ok(vec!["X999".into()])]),
            FixedLookup::with_template(unit(1.0, 0.0)),
            FixedEmbedder::new(unit(1.0, 0.0)),
        );
        h.store.start_session();
        let mut v = Verifier::new(h.ctx.clone());

        assert_eq!(v.step(Some(h.task())), Flow::Continue);
        assert!(!v.state().barcode_ok);
        assert!(v.state().active_person.is_none());
        assert_eq!(v.state().display_name, IDLE_NAME);
        assert_eq!(v.state().phase, SessionPhase::AwaitingBadge);
        assert!(!v.face_in_flight());
    }

    #[test]
    fn test_person_without_template_never_matches() {
        let lookup = FixedLookup {
            person: Some(Person {
                badge: BADGE.into(),
                first_name: "No".into(),
                last_name: "Template".into(),
                template: None,
            }),
            fail: false,
        };
        let h = Harness::new(ScriptedDecoder::badge_once(), lookup, FixedEmbedder::new(unit(1.0, 0.0)));
        h.store.start_session();
        let mut v = Verifier::new(h.ctx.clone());

        v.step(Some(h.task()));
        assert!(!v.state().barcode_ok);
        assert!(!v.face_in_flight());
    }

    #[test]
    fn test_lookup_error_fails_closed() {
        let lookup = FixedLookup { person: None, fail: true };
        let h = Harness::new(ScriptedDecoder::badge_once(), lookup, FixedEmbedder::new(unit(1.0, 0.0)));
        h.store.start_session();
        let mut v = Verifier::new(h.ctx.clone());

        assert_eq!(v.step(Some(h.task())), Flow::Continue);
        assert!(!v.state().barcode_ok);
    }

    #[test]
    fn test_decoder_error_is_a_transient_miss() {
        let h = Harness::new(
            ScriptedDecoder::new(vec![
                Err(DecodeError::Failed("corrupt frame".into())),
                Ok(vec![BADGE.into()]),
            ]),
            FixedLookup::with_template(unit(1.0, 0.0)),
            FixedEmbedder::new(Vec::new()),
        );
        h.store.start_session();
        let mut v = Verifier::new(h.ctx.clone());

        assert_eq!(v.step(Some(h.task())), Flow::Continue);
        assert!(!v.state().barcode_ok);

        h.clock.advance(Duration::from_millis(600));
        v.step(Some(h.task()));
        assert!(v.state().barcode_ok);
    }

    #[test]
    fn test_lookup_panic_fails_closed() {
        let mut h = Harness::new(
            ScriptedDecoder::badge_once(),
            FixedLookup::with_template(unit(1.0, 0.0)),
            FixedEmbedder::new(unit(1.0, 0.0)),
        );
        h.ctx.lookup = Arc::new(PanickingLookup);
        h.store.start_session();
        let mut v = Verifier::new(h.ctx.clone());

        assert_eq!(v.step(Some(h.task())), Flow::Continue);
        assert!(!v.state().barcode_ok);
        assert_eq!(v.state().phase, SessionPhase::AwaitingBadge);
    }

    #[test]
    fn test_decoder_panic_keeps_worker_alive() {
        let mut h = Harness::new(
            ScriptedDecoder::new(vec![]),
            FixedLookup::with_template(unit(1.0, 0.0)),
            FixedEmbedder::new(unit(1.0, 0.0)),
        );
        h.ctx.decoder = Arc::new(PanickingDecoder);
        let session = h.store.start_session().unwrap();
        let mut supervisor = WorkerSupervisor::new(h.ctx.clone());
        supervisor.ensure_running(session);

        for _ in 0..3 {
            h.ctx.slot.offer(h.task());
            std::thread::sleep(Duration::from_millis(30));
        }
        h.clock.advance(Duration::from_secs(30));
        for _ in 0..400 {
            if !h.store.status().running {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        h.store.stop_session();
        supervisor.join();

        let status = h.store.status();
        assert!(!status.running);
        assert_eq!(status.phase, SessionPhase::TimedOut);
        assert!(h.store.armed_session().is_none());
    }

    #[test]
    fn test_worker_panic_still_ends_session() {
        let h = Harness::new(
            ScriptedDecoder::new(vec![]),
            FixedLookup::with_template(unit(1.0, 0.0)),
            FixedEmbedder::new(unit(1.0, 0.0)),
        );
        let session = h.store.start_session().unwrap();
        assert!(h.store.attach_worker(session));

        let store = h.store.clone();
        let crashed = std::thread::spawn(move || {
            let _finish = FinishOnPanic { store, session };
            panic!("worker crashed");
        })
        .join();
        assert!(crashed.is_err());

        let status = h.store.status();
        assert!(!status.running);
        assert_eq!(status.phase, SessionPhase::Denied);
        assert!(h.store.start_session().is_some());
    }

    #[test]
    fn test_barcode_decode_is_throttled() {
        let h = Harness::new(
            ScriptedDecoder::new(vec![]),
            FixedLookup::with_template(unit(1.0, 0.0)),
            FixedEmbedder::new(unit(1.0, 0.0)),
        );
        h.store.start_session();
        let mut v = Verifier::new(h.ctx.clone());

        for _ in 0..5 {
            v.step(Some(h.task()));
        }
        assert_eq!(h.decoder.calls.load(Ordering::SeqCst), 1);

        h.clock.advance(Duration::from_millis(501));
        v.step(Some(h.task()));
        assert_eq!(h.decoder.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_worker_thread_authorizes_and_publishes_once() {
        let h = Harness::new(
            ScriptedDecoder::badge_once(),
            FixedLookup::with_template(unit(1.0, 0.0)),
            FixedEmbedder::new(unit(0.8, 0.6)),
        );
        let mut rx = h.store.subscribe();
        let session = h.store.start_session().unwrap();
        let mut supervisor = WorkerSupervisor::new(h.ctx.clone());
        supervisor.ensure_running(session);

        for _ in 0..400 {
            if !h.store.status().running {
                break;
            }
            h.ctx.slot.offer(h.task());
            std::thread::sleep(Duration::from_millis(5));
        }
        supervisor.join();

        let status = h.store.status();
        assert!(!status.running);
        assert!(status.authorized);
        assert_eq!(status.phase, SessionPhase::Authorized);
        assert_eq!(status.user.as_deref(), Some("First Last"));

        let mut finals = 0;
        while let Ok(snapshot) = rx.try_recv() {
            if snapshot.phase.is_terminal() {
                finals += 1;
            }
        }
        assert_eq!(finals, 1, "exactly one final snapshot");

        // Stopping a finished session changes nothing.
        assert!(!h.store.stop_session());
        assert_eq!(h.store.status(), status);
    }

    #[test]
    fn test_worker_thread_observes_stop() {
        let h = Harness::new(
            ScriptedDecoder::new(vec![]),
            FixedLookup::with_template(unit(1.0, 0.0)),
            FixedEmbedder::new(unit(1.0, 0.0)),
        );
        let session = h.store.start_session().unwrap();
        let mut supervisor = WorkerSupervisor::new(h.ctx.clone());
        supervisor.ensure_running(session);

        std::thread::sleep(Duration::from_millis(30));
        assert!(h.store.stop_session());
        assert!(!h.store.stop_session());
        supervisor.join();

        let status = h.store.status();
        assert!(!status.running);
        assert_eq!(status.phase, SessionPhase::Denied);
        assert!(h.store.armed_session().is_none());
    }

    #[test]
    fn test_restart_after_stop_publishes_one_final_state() {
        let h = Harness::new(
            ScriptedDecoder::new(vec![]),
            FixedLookup::with_template(unit(1.0, 0.0)),
            FixedEmbedder::new(unit(1.0, 0.0)),
        );
        let mut rx = h.store.subscribe();
        let session = h.store.start_session().unwrap();
        let mut supervisor = WorkerSupervisor::new(h.ctx.clone());
        supervisor.ensure_running(session);

        std::thread::sleep(Duration::from_millis(30));
        assert!(h.store.stop_session());
        assert_eq!(h.store.start_session(), Some(session + 1));
        supervisor.join();

        let mut finals = 0;
        while let Ok(snapshot) = rx.try_recv() {
            if snapshot.phase.is_terminal() {
                assert!(!snapshot.running);
                finals += 1;
            }
        }
        assert_eq!(finals, 1, "the stopped session ends exactly once");

        let status = h.store.status();
        assert!(status.running);
        assert_eq!(status.phase, SessionPhase::AwaitingBadge);
        assert_eq!(h.store.armed_session(), Some(session + 1));
    }
}
