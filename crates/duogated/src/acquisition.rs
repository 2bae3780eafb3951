//! Frame acquisition: pulls frames from the camera, feeds the worker and
//! keeps the preview buffers fresh.

use crate::slot::{FrameTask, TaskSlot};
use crate::store::StateStore;
use crate::worker::WorkerSupervisor;
use duogate_hw::{draw_roi, draw_status_bar, CameraError, Frame, FrameSource, Roi};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const RETRY_BACKOFF: Duration = Duration::from_millis(100);

pub struct AcquisitionLoop {
    store: StateStore,
    slot: Arc<TaskSlot>,
    supervisor: WorkerSupervisor,
    roi: Option<Roi>,
    dims: (u32, u32),
    shutdown: Arc<AtomicBool>,
}

impl AcquisitionLoop {
    pub fn new(
        store: StateStore,
        slot: Arc<TaskSlot>,
        supervisor: WorkerSupervisor,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            slot,
            supervisor,
            roi: None,
            dims: (0, 0),
            shutdown,
        }
    }

    /// Pull frames until shutdown or end of stream, then wait for the
    /// current worker.
    pub fn run<S: FrameSource>(&mut self, source: &mut S) {
        tracing::info!("acquisition loop started");

        while !self.shutdown.load(Ordering::Relaxed) {
            match source.next_frame() {
                Ok(frame) => self.process_frame(frame),
                Err(CameraError::EndOfStream) => {
                    tracing::info!("frame source exhausted");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "frame capture failed; retrying");
                    std::thread::sleep(RETRY_BACKOFF);
                }
            }
        }

        self.store.stop_session();
        self.supervisor.join();
        tracing::info!("acquisition loop exiting");
    }

    /// Handle one captured frame.
    pub fn process_frame(&mut self, frame: Frame) {
        let roi = self.roi_for(frame.width, frame.height);

        if let Some(session) = self.store.armed_session() {
            self.supervisor.ensure_running(session);
            let evicted = self.slot.offer(FrameTask {
                frame: frame.clone(),
                roi,
                timestamp: self.store.clock().now(),
            });
            if evicted {
                tracing::trace!(sequence = frame.sequence, "worker busy; dropped stale task");
            }
        }

        if self.store.preview_live() {
            self.store.set_raw_frame(frame.clone());
        }

        let mut annotated = frame;
        draw_roi(&mut annotated, &roi);
        draw_status_bar(&mut annotated, self.store.overlay_status());
        self.store.set_frame(annotated);
    }

    fn roi_for(&mut self, width: u32, height: u32) -> Roi {
        match self.roi {
            Some(roi) if self.dims == (width, height) => roi,
            _ => {
                let roi = Roi::lower_left_quadrant(width, height);
                tracing::debug!(width, height, ?roi, "frame size changed; recomputed ROI");
                self.roi = Some(roi);
                self.dims = (width, height);
                roi
            }
        }
    }
}
