use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::SessionStore;

/// Default period between expiry sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Sweeps expired sessions now and then every `interval` until `cancel` fires.
///
/// Store access is blocking I/O, so each sweep runs on the blocking pool.
pub fn spawn_sweeper(
    store: Arc<SessionStore>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let store = Arc::clone(&store);
                    match tokio::task::spawn_blocking(move || store.sweep_expired()).await {
                        Ok(0) => {}
                        Ok(swept) => info!(swept, "expired upload sessions swept"),
                        Err(e) => warn!(error = %e, "session sweep task failed"),
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
        debug!("session sweeper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryBackend, STORAGE_KEY, StorageBackend};
    use crate::session::tests::sample_session;
    use chrono::Utc;

    #[tokio::test]
    async fn sweeps_on_start_and_stops_on_cancel() {
        let backend = Arc::new(MemoryBackend::new());
        let store = Arc::new(SessionStore::new(backend.clone()));

        let mut stale = sample_session(b"old", 10, 4);
        stale.created_at = Utc::now() - chrono::Duration::hours(25);
        store.save(&stale);
        assert!(backend.read(STORAGE_KEY).unwrap().is_some());

        let cancel = CancellationToken::new();
        let handle = spawn_sweeper(store, Duration::from_millis(20), cancel.clone());

        let swept = tokio::time::timeout(Duration::from_secs(5), async {
            while backend.read(STORAGE_KEY).unwrap().is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(swept.is_ok(), "stale session was never swept");

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn keeps_live_sessions() {
        let store = Arc::new(SessionStore::new(Arc::new(MemoryBackend::new())));
        let live = sample_session(b"new", 10, 4);
        store.save(&live);

        let cancel = CancellationToken::new();
        let handle = spawn_sweeper(Arc::clone(&store), Duration::from_millis(10), cancel.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(store.get(&live.id).is_some());
    }
}
