//! System statistics sampling shared by heartbeats, the resource monitor,
//! and the `system_info` handler.
//!
//! Sources are Linux-native: `/proc/stat` for CPU, `/proc/meminfo` for
//! memory, statvfs(3) for disk. Heartbeats are advisory, so an unavailable
//! source degrades to 0.0 instead of erroring.

use std::path::Path;

/// Aggregate CPU usage sampled from consecutive `/proc/stat` readings.
/// The first sample primes the counters and reports 0.0.
#[derive(Debug, Default)]
pub struct CpuSampler {
    last: Option<CpuTimes>,
}

#[derive(Debug, Clone, Copy)]
struct CpuTimes {
    idle: u64,
    total: u64,
}

impl CpuSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Percent of CPU time spent busy since the previous call.
    pub fn sample(&mut self) -> f64 {
        let Some(now) = read_cpu_times() else {
            return 0.0;
        };
        let percent = match self.last {
            Some(prev) if now.total > prev.total => {
                let total = now.total - prev.total;
                let idle = now.idle.saturating_sub(prev.idle).min(total);
                (total - idle) as f64 / total as f64 * 100.0
            }
            _ => 0.0,
        };
        self.last = Some(now);
        percent
    }
}

fn read_cpu_times() -> Option<CpuTimes> {
    let content = std::fs::read_to_string("/proc/stat").ok()?;
    parse_cpu_line(content.lines().next()?)
}

/// Parse the aggregate `cpu` line of /proc/stat. Idle time counts the idle
/// and iowait columns.
fn parse_cpu_line(line: &str) -> Option<CpuTimes> {
    let mut fields = line.split_whitespace();
    if fields.next()? != "cpu" {
        return None;
    }
    let values: Vec<u64> = fields.filter_map(|f| f.parse().ok()).collect();
    if values.len() < 4 {
        return None;
    }
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    let total: u64 = values.iter().sum();
    Some(CpuTimes { idle, total })
}

/// Percent of physical memory in use, from /proc/meminfo.
pub fn memory_percent() -> f64 {
    std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|content| parse_meminfo(&content))
        .unwrap_or(0.0)
}

fn parse_meminfo(content: &str) -> Option<f64> {
    let mut total = None;
    let mut available = None;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = rest.split_whitespace().next()?.parse::<u64>().ok();
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = rest.split_whitespace().next()?.parse::<u64>().ok();
        }
    }
    let (total, available) = (total?, available?);
    if total == 0 {
        return None;
    }
    Some((total.saturating_sub(available)) as f64 / total as f64 * 100.0)
}

/// Total and free bytes of the filesystem holding `path`, via statvfs(3).
pub fn disk_usage(path: &Path) -> Option<(u64, u64)> {
    use std::os::unix::ffi::OsStrExt;

    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    let frsize = stat.f_frsize as u64;
    Some((stat.f_blocks as u64 * frsize, stat.f_bfree as u64 * frsize))
}

/// Percent of disk space used on the filesystem holding `path`.
pub fn disk_percent(path: &Path) -> f64 {
    match disk_usage(path) {
        Some((total, free)) if total > 0 => (total - free.min(total)) as f64 / total as f64 * 100.0,
        _ => 0.0,
    }
}
