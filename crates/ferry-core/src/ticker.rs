//! Periodic throughput reporting for an active transfer.
//!
//! The receive loop and the ticker share a [`TransferCounters`]: the loop is
//! the only writer of the counters, the ticker only reads them and keeps its
//! own snapshot of what it has already reported.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Default reporting period
pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_secs(1);

/// Counters written by the receive loop and read by the ticker
#[derive(Debug, Default)]
pub struct TransferCounters {
    completed_chunks: AtomicU64,
    final_chunk_size: AtomicU64,
}

impl TransferCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one full-size chunk
    pub fn record_chunk(&self) {
        self.completed_chunks.fetch_add(1, Ordering::Release);
    }

    /// Record the size of the terminal chunk
    pub fn record_final(&self, len: usize) {
        self.final_chunk_size.store(len as u64, Ordering::Release);
    }

    pub fn completed_chunks(&self) -> u64 {
        self.completed_chunks.load(Ordering::Acquire)
    }

    pub fn final_chunk_size(&self) -> u64 {
        self.final_chunk_size.load(Ordering::Acquire)
    }
}

/// One throughput sample
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThroughputReport {
    /// Number of ticks so far, this one included
    pub tick: u64,

    /// Full chunks completed since the previous tick
    pub delta_chunks: u64,

    /// Bytes per second over the last period
    pub speed: u64,

    /// Bytes per second since the ticker started
    pub average: u64,

    /// Emitted when the ticker was stopped rather than by the timer
    pub last: bool,
}

/// Turns counter readings into reports. Owns the "counted at last tick"
/// snapshot, so only the ticker task ever touches it.
#[derive(Debug)]
pub struct ThroughputMeter {
    chunk_size: u64,
    period: Duration,
    counted: u64,
    tail_counted: bool,
    ticks: u64,
}

impl ThroughputMeter {
    pub fn new(chunk_size: usize, period: Duration) -> Self {
        Self {
            chunk_size: chunk_size as u64,
            period,
            counted: 0,
            tail_counted: false,
            ticks: 0,
        }
    }

    pub fn sample(&mut self, counters: &TransferCounters, last: bool) -> ThroughputReport {
        self.ticks += 1;

        let completed = counters.completed_chunks();
        let delta = completed - self.counted;
        self.counted = completed;
        let tail = counters.final_chunk_size();
        // The final chunk lands in exactly one tick's speed
        let new_tail = if self.tail_counted { 0 } else { tail };
        self.tail_counted |= tail > 0;

        let period = self.period.as_secs_f64();
        let speed = (delta * self.chunk_size + new_tail) as f64 / period;
        let average = (self.counted * self.chunk_size + tail) as f64 / (period * self.ticks as f64);

        ThroughputReport {
            tick: self.ticks,
            delta_chunks: delta,
            speed: speed as u64,
            average: average as u64,
            last,
        }
    }
}

/// Handle to a running ticker task
pub struct Ticker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    period: Duration,
}

impl Ticker {
    /// Spawn the ticker. The first report fires one period after start.
    pub fn start(
        header: String,
        chunk_size: usize,
        period: Duration,
        counters: Arc<TransferCounters>,
        reports: Option<mpsc::UnboundedSender<ThroughputReport>>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut meter = ThroughputMeter::new(chunk_size, period);
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                let last = tokio::select! {
                    biased;
                    _ = token.cancelled() => true,
                    _ = interval.tick() => false,
                };

                let report = meter.sample(&counters, last);
                info!(
                    header = %header,
                    speed = report.speed,
                    average = report.average,
                    "{}: speed {} B/s, average {} B/s",
                    header,
                    report.speed,
                    report.average
                );
                if let Some(tx) = &reports {
                    let _ = tx.send(report);
                }

                if last {
                    break;
                }
            }
        });

        Self {
            cancel,
            handle,
            period,
        }
    }

    /// Ask the ticker to emit its last report and exit. Does not wait.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel and wait up to one period for the task to finish
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if tokio::time::timeout(self.period, &mut self.handle)
            .await
            .is_err()
        {
            debug!("ticker did not finish in time, aborting");
            self.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meter_delta_and_average() {
        let counters = TransferCounters::new();
        let mut meter = ThroughputMeter::new(1024, Duration::from_secs(1));

        for _ in 0..3 {
            counters.record_chunk();
        }
        let first = meter.sample(&counters, false);
        assert_eq!(first.delta_chunks, 3);
        assert_eq!(first.speed, 3 * 1024);
        assert_eq!(first.average, 3 * 1024);

        let idle = meter.sample(&counters, false);
        assert_eq!(idle.delta_chunks, 0);
        assert_eq!(idle.speed, 0);
        assert_eq!(idle.average, 3 * 1024 / 2);
    }

    #[test]
    fn test_meter_counts_final_chunk() {
        let counters = TransferCounters::new();
        let mut meter = ThroughputMeter::new(1024, Duration::from_secs(2));

        counters.record_chunk();
        counters.record_final(100);
        let report = meter.sample(&counters, true);

        assert_eq!(report.speed, (1024 + 100) / 2);
        assert!(report.last);
    }

    #[test]
    fn test_meter_counts_final_chunk_once() {
        let counters = TransferCounters::new();
        let mut meter = ThroughputMeter::new(1024, Duration::from_secs(1));

        counters.record_chunk();
        counters.record_final(100);
        let regular = meter.sample(&counters, false);
        assert_eq!(regular.speed, 1024 + 100);

        let last = meter.sample(&counters, true);
        assert_eq!(last.delta_chunks, 0);
        assert_eq!(last.speed, 0);
        assert_eq!(last.average, (1024 + 100) / 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_reports_then_stops() {
        let counters = Arc::new(TransferCounters::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ticker = Ticker::start(
            "test".into(),
            1024,
            Duration::from_secs(1),
            counters.clone(),
            Some(tx),
        );

        for _ in 0..3 {
            counters.record_chunk();
        }
        let first = rx.recv().await.unwrap();
        assert_eq!(first.tick, 1);
        assert_eq!(first.delta_chunks, 3);
        assert!(!first.last);

        counters.record_chunk();
        counters.record_chunk();
        counters.record_final(100);
        ticker.stop().await;

        let last = rx.recv().await.unwrap();
        assert!(last.last);
        assert_eq!(last.tick, 2);
        assert_eq!(last.speed, 2 * 1024 + 100);
        assert_eq!(last.average, (5 * 1024 + 100) / 2);

        // Task has exited and dropped its sender
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_stopped_before_first_tick() {
        let counters = Arc::new(TransferCounters::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ticker = Ticker::start(
            "quick".into(),
            1024,
            Duration::from_secs(1),
            counters.clone(),
            Some(tx),
        );

        counters.record_final(250);
        ticker.stop().await;

        let only = rx.recv().await.unwrap();
        assert!(only.last);
        assert_eq!(only.tick, 1);
        assert_eq!(only.speed, 250);
        assert_eq!(only.average, 250);
        assert!(rx.recv().await.is_none());
    }
}
