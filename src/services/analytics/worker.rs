//! Bounded worker pool fronting the analytics pricer so the ingest task
//! never awaits a derivation inline.

use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};

use super::{derive, AnalyticsRequest, AnalyticsResult};
use crate::domain::instrument::InstrumentKey;

/// A derivation request tagged with the instrument it's for and a
/// one-shot reply channel, plus the soft deadline the caller should
/// respect when deciding whether the result is still useful.
pub struct DeriveJob {
    pub key: InstrumentKey,
    pub request: AnalyticsRequest,
    pub reply: oneshot::Sender<(InstrumentKey, AnalyticsResult)>,
}

/// Handle to a running worker pool. Cloning shares the same queue.
#[derive(Clone)]
pub struct AnalyticsPool {
    tx: mpsc::Sender<DeriveJob>,
}

impl AnalyticsPool {
    /// Spawn `worker_count` tasks draining a shared bounded queue.
    pub fn spawn(worker_count: usize, soft_deadline: Duration) -> Self {
        let worker_count = worker_count.max(1);
        let (tx, rx) = mpsc::channel(worker_count * 16);
        let rx = std::sync::Arc::new(tokio::sync::Mutex::new(rx));

        for id in 0..worker_count {
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let job = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(job) = job else {
                        log::debug!("analytics worker {id} shutting down: channel closed");
                        break;
                    };
                    let started = Instant::now();
                    let result = derive(job.request);
                    let elapsed = started.elapsed();
                    metrics::histogram!("feed_analytics_latency_ms", elapsed.as_secs_f64() * 1000.0);
                    if elapsed > soft_deadline {
                        log::debug!(
                            "analytics derivation for {} overran soft deadline ({:?} > {:?}), discarding",
                            job.key,
                            elapsed,
                            soft_deadline
                        );
                        continue;
                    }
                    let _ = job.reply.send((job.key, result));
                }
            });
        }

        Self { tx }
    }

    /// Enqueue a derivation request. Drops silently (logging) if the pool
    /// is saturated — a missed derivation this second is picked up next.
    pub fn try_submit(&self, job: DeriveJob) {
        if let Err(e) = self.tx.try_send(job) {
            log::warn!("analytics pool saturated, dropping request: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::analytics::OptionType;

    fn req() -> AnalyticsRequest {
        AnalyticsRequest {
            spot: 100.0,
            strike: 100.0,
            option_type: OptionType::Call,
            t_years: 0.5,
            rate: 0.05,
            dividend_yield: 0.0,
            observed_price: None,
            observed_iv: Some(0.2),
        }
    }

    #[tokio::test]
    async fn pool_round_trips_a_request() {
        let pool = AnalyticsPool::spawn(1, Duration::from_millis(50));
        let (tx, rx) = oneshot::channel();
        pool.try_submit(DeriveJob {
            key: InstrumentKey::normalize("NSE_FO|TEST"),
            request: req(),
            reply: tx,
        });
        let (key, result) = rx.await.expect("worker replies");
        assert_eq!(key.as_str(), "NSE_FO|TEST");
        assert!(result.delta > 0.0);
    }
}
