//! Memory consumption probe
//!
//! Buffering stops before the process runs out of memory. The probe
//! reports the fraction of memory in use; the loader compares it against
//! `LoaderConfig::memory_ceiling` before every round.

/// Source of the current memory usage.
pub trait MemoryProbe: Send + Sync {
    /// Fraction of usable memory in use (`0.0..=1.0`), or `None` if unknown.
    fn usage_ratio(&self) -> Option<f64>;
}

/// Probe reading the process resident set and the available system memory.
///
/// Reports `rss / (rss + available)`. On platforms without `/proc` the
/// usage is unknown and never trips the ceiling.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMemoryProbe;

impl SystemMemoryProbe {
    /// Probe for the current process
    pub fn new() -> Self {
        SystemMemoryProbe
    }
}

impl MemoryProbe for SystemMemoryProbe {
    #[cfg(target_os = "linux")]
    fn usage_ratio(&self) -> Option<f64> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
        let rss_kb = parse_kb(&status, "VmRSS:")?;
        let available_kb = parse_kb(&meminfo, "MemAvailable:")?;
        usage_ratio(rss_kb, available_kb)
    }

    #[cfg(not(target_os = "linux"))]
    fn usage_ratio(&self) -> Option<f64> {
        None
    }
}

/// Value in kB of the `/proc`-style line starting with `prefix`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_kb(content: &str, prefix: &str) -> Option<u64> {
    content
        .lines()
        .find(|l| l.starts_with(prefix))
        .and_then(|l| l.split_whitespace().nth(1).and_then(|s| s.parse().ok()))
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn usage_ratio(used_kb: u64, available_kb: u64) -> Option<f64> {
    let total = used_kb.checked_add(available_kb)?;
    if total == 0 {
        return None;
    }
    Some(used_kb as f64 / total as f64)
}
