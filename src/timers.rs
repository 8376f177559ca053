//! Periodic background tasks: memory cleanup (reclaim empty/expired
//! channels) and buffer cleanup (drop expired retained messages).
//!
//! Modeled as cancellable tokio tasks rather than dedicated threads, per
//! spec.md §9 — `CancellationToken` lets `TimerGuard::drop` stop both loops
//! without waiting on a join.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::arena::Arena;
use crate::config::BrokerConfig;

/// Holds the handles for the spawned timer tasks; dropping it cancels them.
pub struct TimerGuard {
    cancel: CancellationToken,
    memory_cleanup: Option<JoinHandle<()>>,
    buffer_cleanup: Option<JoinHandle<()>>,
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub fn spawn(arena: Arc<Arena>, config: Arc<BrokerConfig>) -> TimerGuard {
    let cancel = CancellationToken::new();

    let memory_cleanup = config.memory_cleanup_interval.map(|period| {
        let arena = arena.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { memory_cleanup_loop(arena, period, cancel).await })
    });

    let buffer_cleanup = config.buffer_cleanup_interval.map(|period| {
        let arena = arena.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { buffer_cleanup_loop(arena, period, cancel).await })
    });

    TimerGuard {
        cancel,
        memory_cleanup,
        buffer_cleanup,
    }
}

async fn memory_cleanup_loop(arena: Arc<Arena>, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("memory cleanup task cancelled");
                return;
            }
            _ = ticker.tick() => {
                let freed = arena.collect_empty_and_expired(tokio::time::Instant::now(), false);
                if freed > 0 {
                    info!(freed, "memory cleanup reclaimed channels");
                }
            }
        }
    }
}

async fn buffer_cleanup_loop(arena: Arc<Arena>, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("buffer cleanup task cancelled");
                return;
            }
            _ = ticker.tick() => {
                arena.drop_expired_messages(tokio::time::Instant::now());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use bytes::Bytes;

    #[tokio::test(start_paused = true)]
    async fn memory_cleanup_reclaims_deleted_channels() {
        let config = Arc::new(BrokerConfig {
            cleanup_ttl: Duration::from_millis(10),
            memory_cleanup_interval: Some(Duration::from_millis(5)),
            buffer_cleanup_interval: None,
            ..Default::default()
        });
        let arena = Arc::new(Arena::new(config.clone()));
        arena
            .publish(b"chan", Bytes::from_static(b"hi"), None, tokio::time::Instant::now())
            .unwrap();
        arena.delete(b"chan", tokio::time::Instant::now()).unwrap();

        let guard = spawn(arena.clone(), config);
        tokio::time::advance(Duration::from_millis(50)).await;
        tokio::task::yield_now().await;
        assert!(arena.stats(b"chan").is_none());
        drop(guard);
    }
}
