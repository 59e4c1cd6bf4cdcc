//! OS-specific Metric Sampler: per-PID RSS and CPU-percent sampling.
//!
//! Linux reads `/proc/<pid>/stat` twice (spaced by the sampling interval)
//! to turn cumulative jiffies into an instantaneous percentage; other
//! platforms fall back to invoking `ps` with the pid as a discrete argv
//! element, never a shell string.

use std::time::Instant;

use crate::errors::Result;

/// One sample of cumulative CPU ticks for a PID, used to derive a percent
/// from the delta between two samples.
#[derive(Debug, Clone, Copy)]
pub struct CpuTicks {
    pub utime_ticks: u64,
    pub stime_ticks: u64,
    pub sampled_at: Instant,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sample {
    pub rss_bytes: u64,
    pub cpu_percent: f32,
}

/// Reads the current RSS and cumulative CPU ticks for `pid`. Returns `None`
/// for RSS/ticks the platform back end could not determine rather than
/// guessing — callers treat an unreadable PID as "0, logged once."
pub fn read_ticks_and_rss(pid: u32) -> Result<(Option<CpuTicks>, u64)> {
    #[cfg(target_os = "linux")]
    {
        linux::read_ticks_and_rss(pid)
    }
    #[cfg(target_os = "macos")]
    {
        macos::read_ticks_and_rss(pid)
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        other::read_ticks_and_rss(pid)
    }
}

/// Clock ticks per second, used to convert `utime`/`stime` into seconds of
/// CPU time. Cached because `sysconf` is a syscall on every platform that
/// has one.
pub fn clock_ticks_per_sec() -> i64 {
    #[cfg(unix)]
    {
        static TICKS: once_cell::sync::Lazy<i64> = once_cell::sync::Lazy::new(|| unsafe { libc::sysconf(libc::_SC_CLK_TCK) });
        *TICKS
    }
    #[cfg(not(unix))]
    {
        100
    }
}

/// Derives a CPU percent from two ticks samples against wall-clock elapsed
/// time, normalized to a single core and clamped to `[0, 100]`. The first
/// sample for a PID (no `prev`) is exactly 0, per spec.md §4.2/§9.
pub fn cpu_percent_from_ticks(prev: Option<CpuTicks>, current: CpuTicks) -> f32 {
    let Some(prev) = prev else {
        return 0.0;
    };

    let wall_elapsed = current.sampled_at.saturating_duration_since(prev.sampled_at).as_secs_f64();
    if wall_elapsed <= 0.0 {
        return 0.0;
    }

    let tick_delta = (current.utime_ticks + current.stime_ticks)
        .saturating_sub(prev.utime_ticks + prev.stime_ticks) as f64;
    let cpu_seconds = tick_delta / clock_ticks_per_sec() as f64;

    let percent = (cpu_seconds / wall_elapsed) * 100.0;
    percent.clamp(0.0, 100.0) as f32
}

#[cfg(target_os = "linux")]
mod linux {
    use super::CpuTicks;
    use crate::errors::Result;
    use std::time::Instant;

    pub fn read_ticks_and_rss(pid: u32) -> Result<(Option<CpuTicks>, u64)> {
        let stat_path = format!("/proc/{pid}/stat");
        let contents = match std::fs::read_to_string(&stat_path) {
            Ok(c) => c,
            Err(_) => return Ok((None, 0)),
        };

        // Fields after the `(comm)` parenthesized group are space separated
        // and fixed-position; comm itself may contain spaces/parens, so we
        // split on the closing paren first.
        let after_comm = match contents.rsplit_once(')') {
            Some((_, rest)) => rest,
            None => return Ok((None, 0)),
        };
        let fields: Vec<&str> = after_comm.split_whitespace().collect();

        // state is fields[0] after the comm group; utime is the 12th field
        // after state (index 13), stime the 13th (index 14) using 0-based
        // indexing from `state`.
        let utime = fields.get(11).and_then(|f| f.parse::<u64>().ok()).unwrap_or(0);
        let stime = fields.get(12).and_then(|f| f.parse::<u64>().ok()).unwrap_or(0);

        let rss_pages = fields.get(21).and_then(|f| f.parse::<u64>().ok()).unwrap_or(0);
        let page_size = 4096u64;
        let rss_bytes = rss_pages * page_size;

        Ok((
            Some(CpuTicks { utime_ticks: utime, stime_ticks: stime, sampled_at: Instant::now() }),
            rss_bytes,
        ))
    }
}

#[cfg(target_os = "macos")]
mod macos {
    use super::CpuTicks;
    use crate::errors::Result;
    use std::process::Command;
    use std::time::Instant;

    /// `ps` reports cumulative CPU time as `TIME` (`[dd-]hh:mm:ss[.ss]`) and
    /// RSS in KB. Invoked strictly with `pid` as an argv element.
    pub fn read_ticks_and_rss(pid: u32) -> Result<(Option<CpuTicks>, u64)> {
        let output = Command::new("ps").args(["-p", &pid.to_string(), "-o", "rss=,time="]).output()?;

        if !output.status.success() {
            return Ok((None, 0));
        }

        let text = String::from_utf8_lossy(&output.stdout);
        let mut parts = text.split_whitespace();
        let rss_kb: u64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let time_str = parts.next().unwrap_or("0:00");

        let total_seconds = parse_ps_time(time_str);
        let ticks_per_sec = super::clock_ticks_per_sec() as u64;

        Ok((
            Some(CpuTicks { utime_ticks: total_seconds * ticks_per_sec, stime_ticks: 0, sampled_at: Instant::now() }),
            rss_kb * 1024,
        ))
    }

    fn parse_ps_time(s: &str) -> u64 {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [h, m, sec] => {
                let h: u64 = h.parse().unwrap_or(0);
                let m: u64 = m.parse().unwrap_or(0);
                let sec: u64 = sec.split('.').next().unwrap_or("0").parse().unwrap_or(0);
                h * 3600 + m * 60 + sec
            }
            [m, sec] => {
                let m: u64 = m.parse().unwrap_or(0);
                let sec: u64 = sec.split('.').next().unwrap_or("0").parse().unwrap_or(0);
                m * 60 + sec
            }
            _ => 0,
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
mod other {
    use super::CpuTicks;
    use crate::errors::Result;

    /// Windows and any other target: no direct `/proc` equivalent is used
    /// here, and a full WMI/perf-counter integration is out of scope for
    /// this supervisor. Reports "unavailable" rather than guessing.
    pub fn read_ticks_and_rss(_pid: u32) -> Result<(Option<CpuTicks>, u64)> {
        Ok((None, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_is_exactly_zero() {
        assert_eq!(cpu_percent_from_ticks(None, CpuTicks { utime_ticks: 100, stime_ticks: 0, sampled_at: Instant::now() }), 0.0);
    }

    #[test]
    fn percent_is_clamped_to_0_100() {
        let prev = CpuTicks { utime_ticks: 0, stime_ticks: 0, sampled_at: Instant::now() - std::time::Duration::from_secs(1) };
        let current = CpuTicks { utime_ticks: u64::MAX / 2, stime_ticks: 0, sampled_at: Instant::now() };
        let pct = cpu_percent_from_ticks(Some(prev), current);
        assert!((0.0..=100.0).contains(&pct));
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn reads_ticks_for_the_current_process() {
        let pid = std::process::id();
        let (ticks, rss) = read_ticks_and_rss(pid).unwrap();
        assert!(ticks.is_some());
        assert!(rss > 0);
    }
}
