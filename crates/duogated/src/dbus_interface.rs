use crate::enroll::{EnrollError, Enroller};
use crate::store::StateStore;
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.duogate.Scanner1";
pub const OBJECT_PATH: &str = "/org/duogate/Scanner1";

/// D-Bus interface for the duogate scanner daemon.
///
/// Bus name: org.duogate.Scanner1
/// Object path: /org/duogate/Scanner1
pub struct ScannerService {
    store: StateStore,
    enroller: Enroller,
}

impl ScannerService {
    pub fn new(store: StateStore, enroller: Enroller) -> Self {
        Self { store, enroller }
    }
}

fn enroll_error(e: EnrollError) -> zbus::fdo::Error {
    match e {
        EnrollError::CaptureTimeout => zbus::fdo::Error::TimedOut(e.to_string()),
        EnrollError::NoFrame | EnrollError::NoFace | EnrollError::Template(_) => {
            zbus::fdo::Error::Failed(e.to_string())
        }
        _ => zbus::fdo::Error::IOError(e.to_string()),
    }
}

#[interface(name = "org.duogate.Scanner1")]
impl ScannerService {
    /// Arm a scan session. Returns false if one is already running.
    async fn start(&self) -> bool {
        let started = self.store.start_session().is_some();
        tracing::info!(started, "start requested");
        started
    }

    /// Cancel the running session. Returns false if none was running.
    async fn stop(&self) -> bool {
        let stopped = self.store.stop_session();
        tracing::info!(stopped, "stop requested");
        stopped
    }

    /// Start when idle, stop when running. Returns whether a session is now armed.
    async fn toggle(&self) -> bool {
        if self.store.armed_session().is_some() {
            self.store.stop_session();
            false
        } else {
            self.store.start_session();
            true
        }
    }

    /// Current status snapshot as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        serde_json::to_string(&self.store.status())
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    async fn request_preview(&self) {
        tracing::info!("preview requested");
        self.store.request_preview();
    }

    async fn stop_preview(&self) {
        self.store.stop_preview();
    }

    /// Latest raw preview frame as `(width, height, grayscale bytes)`.
    ///
    /// Fails once a photo has been taken or the preview was stopped; an
    /// empty frame means no frame has been captured yet.
    async fn preview_frame(&self) -> zbus::fdo::Result<(u32, u32, Vec<u8>)> {
        match self.store.preview_frame() {
            Ok(Some(frame)) => Ok((frame.width, frame.height, frame.data)),
            Ok(None) => Ok((0, 0, Vec::new())),
            Err(closed) => Err(zbus::fdo::Error::Failed(closed.to_string())),
        }
    }

    /// Latest annotated frame (ROI outline and status bar).
    async fn annotated_frame(&self) -> (u32, u32, Vec<u8>) {
        self.store
            .frame()
            .map(|f| (f.width, f.height, f.data))
            .unwrap_or_default()
    }

    /// Freeze the preview and return the captured face template as a
    /// Postgres array literal.
    async fn take_photo(&self) -> zbus::fdo::Result<String> {
        if !self.store.preview_live() {
            return Err(zbus::fdo::Error::Failed("preview is not running".into()));
        }
        let template = self.enroller.take_photo().await.map_err(enroll_error)?;
        Ok(template.to_pg_array())
    }

    /// Start a preview, wait for TakePhoto, and store the resulting template
    /// for `badge`. Returns the stored template literal.
    async fn enroll(
        &self,
        badge: &str,
        first_name: &str,
        last_name: &str,
    ) -> zbus::fdo::Result<String> {
        let badge = badge.trim();
        if badge.is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs("badge must not be empty".into()));
        }
        tracing::info!(badge, "enroll requested");
        self.store.request_preview();
        let template = self
            .enroller
            .enroll(badge, first_name, last_name)
            .await
            .map_err(enroll_error)?;
        Ok(template.to_pg_array())
    }

    /// Emitted whenever the status snapshot changes. Payload is the JSON
    /// returned by `Status`.
    #[zbus(signal)]
    async fn status_changed(emitter: &SignalEmitter<'_>, status: &str) -> zbus::Result<()>;
}

/// Broadcast `snapshot` as a `StatusChanged` signal.
pub async fn emit_status(
    conn: &zbus::Connection,
    snapshot: &duogate_core::StatusSnapshot,
) -> zbus::Result<()> {
    let json = serde_json::to_string(snapshot).map_err(|e| zbus::Error::Failure(e.to_string()))?;
    let emitter = SignalEmitter::new(conn, OBJECT_PATH)?;
    ScannerService::status_changed(&emitter, &json).await
}
