//! Bounded pool for face-embedding jobs.
//!
//! Jobs run on tokio's blocking threads, capped by a semaphore. The worker
//! submits without waiting and polls the returned handle each iteration, so
//! a slow model never stalls frame consumption.

use duogate_core::{EmbedError, FaceDetection, FaceEmbedder};
use duogate_hw::Frame;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::sync::Semaphore;

type EmbedResult = Result<Vec<FaceDetection>, EmbedError>;

#[derive(Clone)]
pub struct EmbedPool {
    embedder: Arc<dyn FaceEmbedder>,
    runtime: Handle,
    permits: Arc<Semaphore>,
}

/// A dispatched embedding job.
pub struct PendingEmbed {
    rx: oneshot::Receiver<EmbedResult>,
}

pub enum EmbedPoll {
    Pending,
    Ready(EmbedResult),
}

impl EmbedPool {
    pub fn new(embedder: Arc<dyn FaceEmbedder>, runtime: Handle, workers: usize) -> Self {
        Self {
            embedder,
            runtime,
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Dispatch without blocking. `None` if every pool slot is busy.
    pub fn try_submit(&self, frame: Frame) -> Option<PendingEmbed> {
        let permit = Arc::clone(&self.permits).try_acquire_owned().ok()?;
        let (tx, rx) = oneshot::channel();
        let embedder = Arc::clone(&self.embedder);

        self.runtime.spawn_blocking(move || {
            let _permit = permit;
            let result = embedder.embed(&frame.data, frame.width, frame.height);
            // The submitter may have abandoned the job.
            let _ = tx.send(result);
        });

        Some(PendingEmbed { rx })
    }

    /// Run one job to completion, waiting for a free slot.
    pub async fn embed(&self, frame: Frame) -> EmbedResult {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| EmbedError::Cancelled)?;
        let embedder = Arc::clone(&self.embedder);

        self.runtime
            .spawn_blocking(move || {
                let _permit = permit;
                embedder.embed(&frame.data, frame.width, frame.height)
            })
            .await
            .map_err(|_| EmbedError::Cancelled)?
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl PendingEmbed {
    pub fn poll(&mut self) -> EmbedPoll {
        match self.rx.try_recv() {
            Ok(result) => EmbedPoll::Ready(result),
            Err(TryRecvError::Empty) => EmbedPoll::Pending,
            // The job panicked or was torn down.
            Err(TryRecvError::Closed) => EmbedPoll::Ready(Err(EmbedError::Cancelled)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duogate_core::BoundingBox;
    use std::sync::mpsc;
    use std::time::Duration;

    /// Blocks each job until the test releases it.
    struct GatedEmbedder {
        gate: parking_lot::Mutex<mpsc::Receiver<()>>,
    }

    impl FaceEmbedder for GatedEmbedder {
        fn embed(&self, _gray: &[u8], _w: u32, _h: u32) -> Result<Vec<FaceDetection>, EmbedError> {
            let _ = self.gate.lock().recv_timeout(Duration::from_secs(5));
            Ok(vec![FaceDetection {
                bbox: BoundingBox { x: 0.0, y: 0.0, width: 1.0, height: 1.0 },
                vector: vec![1.0],
            }])
        }
    }

    fn frame() -> Frame {
        Frame::new(vec![0u8; 4], 2, 2, 0)
    }

    fn wait_ready(pending: &mut PendingEmbed) -> EmbedResult {
        for _ in 0..500 {
            if let EmbedPoll::Ready(result) = pending.poll() {
                return result;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("embedding job never completed");
    }

    #[test]
    fn test_pool_is_bounded_and_non_blocking() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (release, gate) = mpsc::channel();
        let embedder = Arc::new(GatedEmbedder { gate: parking_lot::Mutex::new(gate) });
        let pool = EmbedPool::new(embedder, rt.handle().clone(), 2);

        let mut first = pool.try_submit(frame()).expect("first slot");
        let mut second = pool.try_submit(frame()).expect("second slot");
        assert!(pool.try_submit(frame()).is_none(), "pool of two is full");
        assert!(matches!(first.poll(), EmbedPoll::Pending));

        release.send(()).unwrap();
        release.send(()).unwrap();
        assert_eq!(wait_ready(&mut first).unwrap().len(), 1);
        assert_eq!(wait_ready(&mut second).unwrap().len(), 1);

        // Permits are returned once jobs finish.
        for _ in 0..500 {
            if pool.available() == 2 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_async_embed() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (release, gate) = mpsc::channel();
        release.send(()).unwrap();
        let embedder = Arc::new(GatedEmbedder { gate: parking_lot::Mutex::new(gate) });
        let pool = EmbedPool::new(embedder, rt.handle().clone(), 1);

        let faces = rt.block_on(pool.embed(frame())).unwrap();
        assert_eq!(faces[0].vector, vec![1.0]);
    }
}
