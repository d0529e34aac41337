//! Background sweep deleting expired tokens.

use chrono::Utc;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::store::{StoreError, TokenStore};

pub struct PurgeDaemon {
    store: Arc<dyn TokenStore>,
    interval: Duration,
}

impl PurgeDaemon {
    pub fn new(store: Arc<dyn TokenStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Spawn the purge loop for the process lifetime.
    ///
    /// Each tick is jittered by ±10% so restart-synchronized fleets do not
    /// sweep the store in lockstep. Cancelling the token stops the loop
    /// cleanly; individual deletes are atomic, so shutdown never leaves a
    /// token half-deleted.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut rng = rand::rngs::StdRng::from_entropy();
            loop {
                let jitter = rng.gen_range(0.9..1.1);
                let tick = self.interval.mul_f64(jitter);
                tokio::select! {
                    () = shutdown.cancelled() => {
                        debug!("token purge loop stopping");
                        return;
                    }
                    () = sleep(tick) => {}
                }
                self.sweep().await;
            }
        })
    }

    /// One purge cycle: list all tokens and delete the expired ones.
    /// A failed delete is logged and skipped, never fatal to the loop.
    pub async fn sweep(&self) {
        let tokens = match self.store.list_by_label(&[]).await {
            Ok(tokens) => tokens,
            Err(err) => {
                error!("token purge list failed: {err}");
                return;
            }
        };

        let now = Utc::now();
        let mut purged = 0usize;
        for token in tokens {
            if !token.is_expired_at(now) {
                continue;
            }
            match self.store.delete(&token.name).await {
                // Already gone counts as purged; logout raced us.
                Ok(()) | Err(StoreError::NotFound(_)) => purged += 1,
                Err(err) => error!("failed to purge expired token {}: {err}", token.name),
            }
        }
        info!("token purge cycle removed {purged} expired tokens");
    }
}
