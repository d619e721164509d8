//! Container-aware sizing of the disk read executor.
//!
//! Reads the cgroup CPU quota so that an executor created inside a container
//! does not spawn one thread per host core.

use std::fs;
use std::sync::OnceLock;

/// Environment variable overriding the default number of I/O threads.
pub const IO_THREADS_ENV: &str = "HYBRID_SHUFFLE_IO_THREADS";

static AVAILABLE_CPUS: OnceLock<usize> = OnceLock::new();

/// Returns the number of CPU cores available to this process.
pub fn available_cpus() -> usize {
    *AVAILABLE_CPUS.get_or_init(detect_cpus)
}

/// Default thread count for an [`IoExecutor`](crate::concurrency::IoExecutor).
pub fn default_io_threads() -> usize {
    parse_positive_env(IO_THREADS_ENV).unwrap_or_else(available_cpus)
}

fn detect_cpus() -> usize {
    let host = num_cpus::get();
    match cpu_quota() {
        // Round fractional quotas up so at least one thread is left.
        Some(quota) if quota > 0.0 && (quota.ceil() as usize) < host => quota.ceil() as usize,
        _ => host,
    }
}

fn parse_positive_env(name: &str) -> Option<usize> {
    let value = std::env::var(name).ok()?;
    let parsed = value.trim().parse::<usize>().ok()?;
    (parsed > 0).then_some(parsed)
}

fn cpu_quota() -> Option<f64> {
    cpu_quota_v2().or_else(cpu_quota_v1)
}

fn cpu_quota_v2() -> Option<f64> {
    let content = fs::read_to_string("/sys/fs/cgroup/cpu.max").ok()?;
    parse_cpu_max(&content)
}

fn cpu_quota_v1() -> Option<f64> {
    let quota = read_i64("/sys/fs/cgroup/cpu/cpu.cfs_quota_us")?;
    let period = read_i64("/sys/fs/cgroup/cpu/cpu.cfs_period_us")?;
    (quota > 0 && period > 0).then(|| quota as f64 / period as f64)
}

fn read_i64(path: &str) -> Option<i64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Parses the cgroup v2 `cpu.max` format: `<quota|max> <period>`.
fn parse_cpu_max(content: &str) -> Option<f64> {
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    let period = parts.next()?.parse::<f64>().ok()?;
    if quota == "max" || period <= 0.0 {
        return None;
    }
    Some(quota.parse::<f64>().ok()? / period)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_max() {
        assert_eq!(parse_cpu_max("200000 100000\n"), Some(2.0));
        assert_eq!(parse_cpu_max("50000 100000"), Some(0.5));
        assert_eq!(parse_cpu_max("max 100000"), None);
        assert_eq!(parse_cpu_max("100000 0"), None);
        assert_eq!(parse_cpu_max(""), None);
    }

    #[test]
    fn test_available_cpus_is_positive() {
        assert!(available_cpus() >= 1);
        assert!(default_io_threads() >= 1);
    }
}
