//! Status subscribers. Each one drains its own broadcast receiver on its own
//! task, so a slow or failing subscriber never holds up the others.

use duogate_core::StatusSnapshot;
use std::fmt::Display;
use std::future::Future;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

/// Drive `handler` with every snapshot published on `rx`.
///
/// Handler errors are logged and the subscriber keeps going. A lagging
/// receiver skips ahead to the newest snapshots.
pub fn spawn_subscriber<F, Fut, E>(
    mut rx: broadcast::Receiver<StatusSnapshot>,
    name: &'static str,
    mut handler: F,
) -> JoinHandle<()>
where
    F: FnMut(StatusSnapshot) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + 'static,
{
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(snapshot) => {
                    if let Err(e) = handler(snapshot).await {
                        tracing::warn!(subscriber = name, error = %e, "status subscriber failed");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(subscriber = name, skipped, "status subscriber lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
        tracing::debug!(subscriber = name, "status subscriber stopped");
    })
}

/// Log every status change.
pub fn spawn_log_subscriber(rx: broadcast::Receiver<StatusSnapshot>) -> JoinHandle<()> {
    spawn_subscriber(rx, "log", |snapshot: StatusSnapshot| async move {
        tracing::info!(
            running = snapshot.running,
            phase = ?snapshot.phase,
            authorized = snapshot.authorized,
            barcode = snapshot.barcode_verified,
            face = snapshot.face_verified,
            name = %snapshot.current_name,
            "status changed"
        );
        Ok::<(), std::convert::Infallible>(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use duogate_core::SessionPhase;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex;

    fn snapshot(name: &str) -> StatusSnapshot {
        StatusSnapshot {
            running: true,
            phase: SessionPhase::AwaitingBadge,
            current_name: name.into(),
            ..StatusSnapshot::default()
        }
    }

    #[tokio::test]
    async fn test_failing_subscriber_does_not_affect_others() {
        let (tx, _) = broadcast::channel(8);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let failing = spawn_subscriber(tx.subscribe(), "failing", |_s| async {
            Err::<(), _>("endpoint unreachable")
        });
        let recording = {
            let seen = Arc::clone(&seen);
            spawn_subscriber(tx.subscribe(), "recording", move |s: StatusSnapshot| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().await.push(s.current_name);
                    Ok::<(), String>(())
                }
            })
        };

        tx.send(snapshot("a")).unwrap();
        tx.send(snapshot("b")).unwrap();
        drop(tx);

        tokio::time::timeout(Duration::from_secs(2), recording)
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), failing)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*seen.lock().await, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_lagged_subscriber_keeps_newest() {
        let (tx, rx) = broadcast::channel(2);
        for name in ["1", "2", "3", "4"] {
            tx.send(snapshot(name)).unwrap();
        }
        drop(tx);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let handle = {
            let seen = Arc::clone(&seen);
            spawn_subscriber(rx, "slow", move |s: StatusSnapshot| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().await.push(s.current_name);
                    Ok::<(), String>(())
                }
            })
        };
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*seen.lock().await, vec!["3".to_string(), "4".to_string()]);
    }
}
