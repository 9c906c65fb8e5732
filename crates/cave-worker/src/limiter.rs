//! [GlobalLimiter] — process-wide concurrency cap sized from host RAM at
//! startup (spec §4.9), so the worker never admits more concurrent
//! executions than the box can plausibly hold regardless of how the queue
//! is drained.

use std::sync::Arc;

use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::info;

const RESERVE_RATIO_SMALL_HOST: f64 = 0.40;
const RESERVE_FIXED_MB_LARGE_HOST: u64 = 1536;
const SMALL_HOST_THRESHOLD_MB: u64 = 4096;
const MB_PER_PERMIT: u64 = 128;
const MIN_PERMITS: usize = 1;
const MAX_PERMITS: usize = 500;

/// Caps total concurrent executions across the whole process (spec §4.9:
/// "derived once at startup from total host memory, never recomputed").
pub struct GlobalLimiter {
    semaphore: Arc<Semaphore>,
    permits: usize,
}

impl GlobalLimiter {
    /// Builds a limiter sized from `total_mem_mb` (spec §4.9 formula):
    /// reserve 40% of host RAM below 4096MB, else a fixed 1536MB; divide
    /// the remainder by 128MB per permit; clamp to [1, 500].
    pub fn from_total_memory_mb(total_mem_mb: u64) -> Self {
        let reserved = if total_mem_mb < SMALL_HOST_THRESHOLD_MB {
            (total_mem_mb as f64 * RESERVE_RATIO_SMALL_HOST) as u64
        } else {
            RESERVE_FIXED_MB_LARGE_HOST
        };
        let usable = total_mem_mb.saturating_sub(reserved);
        let permits = ((usable / MB_PER_PERMIT) as usize).clamp(MIN_PERMITS, MAX_PERMITS);

        info!(total_mem_mb, reserved, permits, "global concurrency limiter sized");

        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
            permits,
        }
    }

    /// Detects total host RAM via `/proc/meminfo` on Linux and falls back
    /// to a conservative default elsewhere.
    pub fn from_host_memory() -> Self {
        Self::from_total_memory_mb(detect_total_memory_mb())
    }

    pub fn capacity(&self) -> usize {
        self.permits
    }

    pub async fn acquire(&self) -> SemaphorePermit<'_> {
        self.semaphore
            .acquire()
            .await
            .expect("global limiter semaphore never closed")
    }
}

#[cfg(target_os = "linux")]
fn detect_total_memory_mb() -> u64 {
    match std::fs::read_to_string("/proc/meminfo") {
        Ok(contents) => parse_mem_total_kb(&contents).map(|kb| kb / 1024).unwrap_or(DEFAULT_HOST_MEM_MB),
        Err(_) => DEFAULT_HOST_MEM_MB,
    }
}

#[cfg(not(target_os = "linux"))]
fn detect_total_memory_mb() -> u64 {
    DEFAULT_HOST_MEM_MB
}

const DEFAULT_HOST_MEM_MB: u64 = 2048;

#[cfg(target_os = "linux")]
fn parse_mem_total_kb(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find(|line| line.starts_with("MemTotal:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_host_reserves_forty_percent() {
        // 2048MB total -> reserve 819MB -> usable 1229MB -> 9 permits.
        let limiter = GlobalLimiter::from_total_memory_mb(2048);
        assert_eq!(limiter.capacity(), 9);
    }

    #[test]
    fn large_host_reserves_fixed_amount() {
        // 8192MB total -> reserve 1536MB -> usable 6656MB -> 52 permits.
        let limiter = GlobalLimiter::from_total_memory_mb(8192);
        assert_eq!(limiter.capacity(), 52);
    }

    #[test]
    fn permits_are_clamped_to_the_documented_range() {
        let tiny = GlobalLimiter::from_total_memory_mb(64);
        assert_eq!(tiny.capacity(), MIN_PERMITS);

        let huge = GlobalLimiter::from_total_memory_mb(10_000_000);
        assert_eq!(huge.capacity(), MAX_PERMITS);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn parses_mem_total_line() {
        let meminfo = "MemTotal:       16384000 kB\nMemFree:        1000 kB\n";
        assert_eq!(parse_mem_total_kb(meminfo), Some(16_384_000));
    }

    #[tokio::test]
    async fn acquire_blocks_once_capacity_is_exhausted() {
        let limiter = GlobalLimiter::from_total_memory_mb(256); // -> 1 permit
        assert_eq!(limiter.capacity(), 1);
        let _first = limiter.acquire().await;
        assert!(tokio::time::timeout(std::time::Duration::from_millis(20), limiter.acquire())
            .await
            .is_err());
    }
}
