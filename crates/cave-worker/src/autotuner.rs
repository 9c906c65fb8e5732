//! [AutoTuner] — pure analyzer producing optimization tips, a recommended
//! memory size, and an estimated savings string from captured metrics (spec
//! §4.8). Standardizes on the three-tuple `(tip, savings, rec_mb)` shape,
//! resolving the two divergent Python definitions this crate's predecessor
//! carried (spec §9 Open Question).

/// Dollar cost per MB-hour used to estimate monthly savings (spec §4.8
/// "Savings"). Not externally configurable: this is a fixed internal
/// pricing assumption, not a tunable knob.
const COST_PER_MB_HOUR: f64 = 0.0000000163;
const HOURS_PER_MONTH: f64 = 730.0;

const WASTE_RATIO_THRESHOLD: f64 = 0.30;
const RISK_RATIO_THRESHOLD: f64 = 0.85;
const CPU_BOUND_THRESHOLD: f64 = 0.8;
const IO_BOUND_CPU_THRESHOLD: f64 = 0.2;
const IO_BOUND_MIN_DURATION_MS: u64 = 500;
const NETWORK_HEAVY_BYTES: u64 = 5 * 1024 * 1024;
const DISK_HEAVY_BYTES: u64 = 10 * 1024 * 1024;

/// Raw metrics captured for one invocation (spec §4.8 Inputs).
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionMetrics {
    pub peak_memory_bytes: u64,
    pub allocated_mb: u32,
    pub duration_ms: u64,
    /// CPU-microseconds across all cores.
    pub cpu_usage_micros: u64,
    pub network_bytes: u64,
    pub disk_bytes: u64,
}

/// Result of [`analyze`]: always the three-tuple shape (spec §4.8, §9).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advice {
    pub tip: Option<String>,
    pub estimated_savings: Option<String>,
    pub recommended_memory_mb: Option<u32>,
}

/// Deterministic, side-effect-free analysis (spec §8: "AutoTuner is pure").
///
/// `allocated_mb = 0` is sanitized to 128 before ratio computation (spec
/// §8 boundary behavior); `peak_memory_bytes = 0` returns an empty
/// [`Advice`].
pub fn analyze(metrics: ExecutionMetrics) -> Advice {
    if metrics.peak_memory_bytes == 0 {
        return Advice::default();
    }

    let allocated_mb = if metrics.allocated_mb == 0 { 128 } else { metrics.allocated_mb };
    let peak_mb = metrics.peak_memory_bytes as f64 / (1024.0 * 1024.0);
    let mem_ratio = peak_mb / allocated_mb as f64;

    let (mut tip, recommended_memory_mb) = memory_verdict(peak_mb, mem_ratio, allocated_mb);

    if let Some(cpu_io_tip) = cpu_io_verdict(&metrics) {
        tip = Some(match tip {
            Some(existing) => format!("{existing} | {cpu_io_tip}"),
            None => cpu_io_tip,
        });
    }

    let estimated_savings = recommended_memory_mb
        .filter(|&rec_mb| rec_mb < allocated_mb)
        .map(|rec_mb| format_savings(allocated_mb, rec_mb));

    Advice {
        tip,
        estimated_savings,
        recommended_memory_mb,
    }
}

fn memory_verdict(peak_mb: f64, mem_ratio: f64, allocated_mb: u32) -> (Option<String>, Option<u32>) {
    if mem_ratio < WASTE_RATIO_THRESHOLD {
        let rec_mb = ((peak_mb * 2.0).round() as u32).max(32);
        if rec_mb < allocated_mb {
            let saved_percent = ((1.0 - rec_mb as f64 / allocated_mb as f64) * 100.0).round() as i64;
            let tip = format!(
                "Resource Waste: actual usage ({peak_mb:.0}MB) is far below the {allocated_mb}MB allocation. Reduce to {rec_mb}MB to save ~{saved_percent}%."
            );
            (Some(tip), Some(rec_mb))
        } else {
            (None, Some(rec_mb))
        }
    } else if mem_ratio > RISK_RATIO_THRESHOLD {
        let rec_mb = (peak_mb * 1.2).round() as u32;
        let tip = format!("Memory Risk: usage ({peak_mb:.0}MB) is close to the {allocated_mb}MB limit. Increase to {rec_mb}MB.");
        (Some(tip), Some(rec_mb))
    } else {
        (None, None)
    }
}

fn cpu_io_verdict(metrics: &ExecutionMetrics) -> Option<String> {
    if metrics.duration_ms == 0 {
        return None;
    }
    let cpu_util = (metrics.cpu_usage_micros as f64 / 1000.0) / metrics.duration_ms as f64;

    if cpu_util > CPU_BOUND_THRESHOLD {
        return Some("CPU Bound".to_string());
    }

    if cpu_util < IO_BOUND_CPU_THRESHOLD && metrics.duration_ms > IO_BOUND_MIN_DURATION_MS {
        return Some(if metrics.network_bytes > NETWORK_HEAVY_BYTES {
            "I/O Bound (network)".to_string()
        } else if metrics.disk_bytes > DISK_HEAVY_BYTES {
            "I/O Bound (disk)".to_string()
        } else {
            "I/O Bound (external latency)".to_string()
        });
    }

    None
}

fn format_savings(allocated_mb: u32, rec_mb: u32) -> String {
    let monthly = (allocated_mb - rec_mb) as f64 * COST_PER_MB_HOUR * HOURS_PER_MONTH;
    format!("${monthly:.2}/month (if rightsized from {allocated_mb}MB to {rec_mb}MB)")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(peak_mb: u32, allocated_mb: u32) -> ExecutionMetrics {
        ExecutionMetrics {
            peak_memory_bytes: peak_mb as u64 * 1024 * 1024,
            allocated_mb,
            duration_ms: 100,
            cpu_usage_micros: 0,
            network_bytes: 0,
            disk_bytes: 0,
        }
    }

    #[test]
    fn zero_peak_memory_yields_no_advice() {
        let advice = analyze(ExecutionMetrics::default());
        assert_eq!(advice, Advice::default());
    }

    #[test]
    fn waste_ratio_recommends_shrinking() {
        let advice = analyze(metrics(50, 1024));
        assert!(advice.tip.as_deref().unwrap().contains("Resource Waste"));
        assert_eq!(advice.recommended_memory_mb, Some(100));
        assert!(advice.estimated_savings.is_some());
    }

    #[test]
    fn risk_ratio_recommends_growing() {
        let advice = analyze(metrics(900, 1024));
        assert!(advice.tip.as_deref().unwrap().contains("Memory Risk"));
        assert_eq!(advice.recommended_memory_mb, Some(1080));
    }

    #[test]
    fn optimal_ratio_has_no_memory_tip() {
        let advice = analyze(metrics(500, 1024));
        assert!(advice.tip.is_none());
        assert!(advice.recommended_memory_mb.is_none());
    }

    #[test]
    fn zero_allocated_mb_is_sanitized_to_128() {
        let advice = analyze(metrics(10, 0));
        // peak/128 ~= 0.078 < 0.30 -> waste verdict against the sanitized 128MB baseline.
        assert!(advice.tip.as_deref().unwrap().contains("Resource Waste"));
    }

    #[test]
    fn cpu_bound_tip_is_appended_with_separator() {
        let mut m = metrics(500, 1024);
        m.cpu_usage_micros = 900_000; // 900ms of CPU over 100ms wall time -> cpu_util=9.0
        let advice = analyze(m);
        assert_eq!(advice.tip.as_deref(), Some("CPU Bound"));
    }

    #[test]
    fn io_bound_network_tip_combines_with_memory_tip() {
        let mut m = metrics(50, 1024);
        m.duration_ms = 600;
        m.cpu_usage_micros = 1_000; // cpu_util ~= 0.0017 < 0.2
        m.network_bytes = 6 * 1024 * 1024;
        let advice = analyze(m);
        let tip = advice.tip.unwrap();
        assert!(tip.contains("Resource Waste"));
        assert!(tip.contains(" | I/O Bound (network)"));
    }

    #[test]
    fn analyze_is_deterministic() {
        let m = metrics(200, 512);
        assert_eq!(analyze(m), analyze(m));
    }
}
