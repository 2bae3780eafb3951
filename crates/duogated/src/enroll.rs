//! Enrollment: turn the captured preview frame into a stored face template.

use crate::people::{SqlitePersonStore, StoreError};
use crate::pool::EmbedPool;
use crate::store::StateStore;
use duogate_core::{largest_face, BiometricTemplate, EmbedError, TemplateError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("timed out waiting for a photo to be taken")]
    CaptureTimeout,
    #[error("no preview frame available")]
    NoFrame,
    #[error("face embedding failed: {0}")]
    Embed(#[from] EmbedError),
    #[error("no face detected in the captured frame")]
    NoFace,
    #[error("unusable embedding: {0}")]
    Template(#[from] TemplateError),
    #[error("failed to store person: {0}")]
    Store(#[from] StoreError),
    #[error("storage task failed")]
    TaskFailed,
}

#[derive(Clone)]
pub struct Enroller {
    store: StateStore,
    pool: EmbedPool,
    people: Arc<SqlitePersonStore>,
    timeout: Duration,
    enrolling: Arc<AtomicUsize>,
}

/// Marks an enrollment as in progress until dropped.
struct EnrollingGuard(Arc<AtomicUsize>);

impl EnrollingGuard {
    fn new(count: &Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(count))
    }
}

impl Drop for EnrollingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Enroller {
    pub fn new(
        store: StateStore,
        pool: EmbedPool,
        people: Arc<SqlitePersonStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            pool,
            people,
            timeout,
            enrolling: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wait for the capture signal, then embed the captured frame.
    ///
    /// The capture signal is consumed and the preview stopped on every path.
    pub async fn capture_template(&self) -> Result<BiometricTemplate, EnrollError> {
        let result = self.capture_inner().await;
        self.store.take_capture();
        self.store.stop_preview();
        result
    }

    async fn capture_inner(&self) -> Result<BiometricTemplate, EnrollError> {
        tokio::time::timeout(self.timeout, self.store.wait_for_capture())
            .await
            .map_err(|_| EnrollError::CaptureTimeout)?;

        self.embed_captured().await
    }

    /// Embed the frozen preview frame without touching the capture signal.
    async fn embed_captured(&self) -> Result<BiometricTemplate, EnrollError> {
        let frame = self.store.raw_frame().ok_or(EnrollError::NoFrame)?;
        tracing::debug!(sequence = frame.sequence, "embedding captured frame");

        let faces = self.pool.embed(frame).await?;
        let face = largest_face(&faces).ok_or(EnrollError::NoFace)?;
        let template = BiometricTemplate::from_raw(face.vector.clone())?;
        tracing::info!(dim = template.dim(), "face template captured");
        Ok(template)
    }

    /// Signal capture and return the template of the captured frame.
    ///
    /// A waiting enrollment consumes the capture itself; otherwise the
    /// signal is cleared and the preview stopped here.
    pub async fn take_photo(&self) -> Result<BiometricTemplate, EnrollError> {
        self.store.mark_captured();
        let result = self.embed_captured().await;
        if self.enrolling.load(Ordering::SeqCst) == 0 {
            self.store.take_capture();
            self.store.stop_preview();
        }
        result
    }

    /// Capture a template and store it for `badge`.
    pub async fn enroll(
        &self,
        badge: &str,
        first_name: &str,
        last_name: &str,
    ) -> Result<BiometricTemplate, EnrollError> {
        let _enrolling = EnrollingGuard::new(&self.enrolling);
        let template = self.capture_template().await?;

        let people = Arc::clone(&self.people);
        let (badge, first, last, stored) = (
            badge.to_string(),
            first_name.to_string(),
            last_name.to_string(),
            template.clone(),
        );
        tokio::task::spawn_blocking(move || people.upsert_person(&badge, &first, &last, Some(&stored)))
            .await
            .map_err(|_| EnrollError::TaskFailed)??;

        Ok(template)
    }
}
