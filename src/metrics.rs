//! Transfer metrics collected on the receiving side of a download.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Per-download counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferMetrics {
    /// Largest single write observed
    pub step_size: usize,
    /// Cumulative bytes recorded
    pub total_bytes: u64,
    /// Number of write operations
    pub write_count: u64,
    /// Time of the first write
    pub start_time: Option<Instant>,
    /// Time since `start_time` as of the last write
    pub elapsed: Duration,
}

impl TransferMetrics {
    /// Elapsed time, only meaningful once at least one write was recorded.
    pub fn elapsed(&self) -> Option<Duration> {
        (self.write_count > 0).then_some(self.elapsed)
    }
}

/// Write-only consumer that discards data and records [`TransferMetrics`].
///
/// Writes may come from several tasks; updates are serialized by one mutex.
/// Chunks are coarse (tens of KiB), so contention is not a concern.
#[derive(Debug, Default)]
pub struct MetricsSink {
    metrics: Mutex<TransferMetrics>,
}

impl MetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one chunk. Returns the number of bytes accepted.
    pub fn write(&self, chunk: &[u8]) -> usize {
        let now = Instant::now();
        let len = chunk.len();

        let mut m = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
        let start = *m.start_time.get_or_insert(now);
        m.total_bytes += len as u64;
        m.write_count += 1;
        m.step_size = m.step_size.max(len);
        m.elapsed = now.duration_since(start);

        len
    }

    /// Copy of the current counters.
    pub fn snapshot(&self) -> TransferMetrics {
        *self.metrics.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_empty_sink() {
        let sink = MetricsSink::new();
        let m = sink.snapshot();
        assert_eq!(m.total_bytes, 0);
        assert_eq!(m.write_count, 0);
        assert!(m.start_time.is_none());
        assert!(m.elapsed().is_none());
    }

    #[test]
    fn test_counts_every_write() {
        let sink = MetricsSink::new();
        let sizes = [32 * 1024, 1, 0, 16_384, 65_536, 7];
        for size in sizes {
            let chunk = vec![0u8; size];
            assert_eq!(sink.write(&chunk), size);
        }

        let m = sink.snapshot();
        assert_eq!(m.write_count, sizes.len() as u64);
        assert_eq!(m.total_bytes, sizes.iter().sum::<usize>() as u64);
        assert_eq!(m.step_size, 65_536);
        assert!(m.elapsed().is_some());
    }

    #[test]
    fn test_start_is_first_write() {
        let sink = MetricsSink::new();
        sink.write(b"a");
        let first = sink.snapshot();
        assert_eq!(first.elapsed, Duration::ZERO);

        std::thread::sleep(Duration::from_millis(5));
        sink.write(b"b");
        let second = sink.snapshot();
        assert_eq!(first.start_time, second.start_time);
        assert!(second.elapsed >= Duration::from_millis(5));
    }

    #[test]
    fn test_concurrent_writers() {
        let sink = Arc::new(MetricsSink::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let sink = Arc::clone(&sink);
                std::thread::spawn(move || {
                    let chunk = [0u8; 1024];
                    for _ in 0..1000 {
                        sink.write(&chunk);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let m = sink.snapshot();
        assert_eq!(m.write_count, 8000);
        assert_eq!(m.total_bytes, 8000 * 1024);
        assert_eq!(m.step_size, 1024);
    }
}
