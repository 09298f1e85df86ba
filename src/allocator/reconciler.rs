//! Background Reconciliation
//!
//! Drives `compute_allocations` on a fixed period and reports utilization. Both
//! loops stop when their cancellation token fires.

use super::policy::AllocationPolicy;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Periodically recomputes the fair-share caps of one allocator.
pub struct Reconciler {
    policy: Arc<dyn AllocationPolicy>,
    period: Duration,
    cancel: CancellationToken,
    epochs: AtomicU64,
}

impl Reconciler {
    /// A zero `period` disables the loop; reconciliation is then driven manually.
    pub fn new(policy: Arc<dyn AllocationPolicy>, period: Duration) -> Arc<Self> {
        Arc::new(Self {
            policy,
            period,
            cancel: CancellationToken::new(),
            epochs: AtomicU64::new(0),
        })
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Number of reconciliation passes run so far.
    pub fn epochs(&self) -> u64 {
        self.epochs.load(Ordering::Relaxed)
    }

    /// Spawns the loop and returns immediately. Returns `None` when disabled.
    pub fn start(self: Arc<Self>) -> Option<JoinHandle<()>> {
        if self.period.is_zero() {
            tracing::info!("Reconciliation loop disabled (period = 0)");
            return None;
        }
        tracing::info!("Starting reconciliation loop every {:?}", self.period);
        Some(tokio::spawn(async move {
            self.run().await;
        }))
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    async fn run(&self) {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Reconciliation loop stopped after {} epochs", self.epochs());
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.policy.compute_allocations() {
                        tracing::error!("Reconciliation failed: {}", e);
                    }
                    self.epochs.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

/// Logs allocator utilization every `period` until `cancel` fires.
pub fn spawn_stats_reporter(
    policy: Arc<dyn AllocationPolicy>,
    period: Duration,
    cancel: CancellationToken,
) -> Option<JoinHandle<()>> {
    if period.is_zero() {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let stats = policy.stats();
                    if stats.total_blocks == 0 {
                        continue;
                    }
                    tracing::info!(
                        "Utilization: {:.3} ({} of {} blocks allocated, {} free)",
                        stats.utilization,
                        stats.allocated_blocks,
                        stats.total_blocks,
                        stats.free_blocks
                    );
                }
            }
        }
    }))
}
