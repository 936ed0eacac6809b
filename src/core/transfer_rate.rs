use std::cmp::Ordering;
use std::time::Duration;

/// Bytes moved over a period of time. Ordered by throughput.
#[derive(Debug, PartialEq, Clone, Copy, Default)]
pub struct TransferRate {
    pub bytes: u64,
    pub elapsed: Duration,
}

impl TransferRate {
    pub const EMPTY: Self = Self {
        bytes: 0,
        elapsed: Duration::ZERO,
    };

    pub fn new(bytes: u64, elapsed: Duration) -> Self {
        Self { bytes, elapsed }
    }

    pub fn bytes_per_second(&self) -> f64 {
        if self.elapsed.is_zero() {
            return 0.0;
        }
        self.bytes as f64 / self.elapsed.as_secs_f64()
    }
}

impl Eq for TransferRate {}

impl PartialOrd for TransferRate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TransferRate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bytes_per_second().total_cmp(&other.bytes_per_second())
    }
}
