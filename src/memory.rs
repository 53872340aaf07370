//! Resident memory sampling for a child process group (Linux `/proc`)

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Sampling period of the memory watcher
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(50);

/// Sum of `VmRSS` (KB) over every live process in process group `pgid`.
///
/// Returns `None` when nothing could be sampled (no `/proc`, group already gone).
#[cfg(target_os = "linux")]
pub fn group_rss_kb(pgid: i32) -> Option<u64> {
    let entries = std::fs::read_dir("/proc").ok()?;
    let mut total = 0u64;
    let mut seen = false;

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };

        let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
            continue;
        };
        if parse_stat_pgrp(&stat) != Some(pgid) {
            continue;
        }

        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            if let Some(kb) = parse_vm_rss_kb(&status) {
                total += kb;
                seen = true;
            }
        }
    }

    seen.then_some(total)
}

#[cfg(not(target_os = "linux"))]
pub fn group_rss_kb(_pgid: i32) -> Option<u64> {
    None
}

/// Process group id from a `/proc/<pid>/stat` line.
///
/// The command name may contain spaces and parentheses, so fields are
/// counted from the last `)`.
pub fn parse_stat_pgrp(stat: &str) -> Option<i32> {
    let (_, rest) = stat.rsplit_once(')')?;
    // state ppid pgrp ...
    rest.split_whitespace().nth(2)?.parse().ok()
}

/// `VmRSS` in KB from a `/proc/<pid>/status` body
pub fn parse_vm_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|value| value.split_whitespace().next())
        .and_then(|kb| kb.parse().ok())
}

/// Sample the group until its resident memory exceeds `limit_kb`; yields the sampled value.
///
/// The highest sample seen is kept in `peak_kb`. Never resolves when `limit_kb`
/// is `None`, and never samples when `pgid` is `None`.
pub async fn watch_group(pgid: Option<i32>, limit_kb: Option<u64>, peak_kb: &AtomicU64) -> u64 {
    let Some(pgid) = pgid else {
        return std::future::pending().await;
    };

    let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let Some(rss) = group_rss_kb(pgid) else {
            continue;
        };
        peak_kb.fetch_max(rss, Ordering::Relaxed);
        if limit_kb.is_some_and(|limit| rss > limit) {
            return rss;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stat_pgrp() {
        let stat = "4242 (python3) S 4200 4242 4200 0 -1 4194560 1200 0 0 0";
        assert_eq!(parse_stat_pgrp(stat), Some(4242));
    }

    #[test]
    fn test_parse_stat_pgrp_with_parens_in_name() {
        let stat = "77 (weird ) name) R 1 70 70 0 -1";
        assert_eq!(parse_stat_pgrp(stat), Some(70));
    }

    #[test]
    fn test_parse_vm_rss() {
        let status = "Name:\tjava\nVmPeak:\t  400000 kB\nVmRSS:\t   12345 kB\nThreads:\t20\n";
        assert_eq!(parse_vm_rss_kb(status), Some(12345));
        assert_eq!(parse_vm_rss_kb("Name:\tkthreadd\n"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_sample_own_group() {
        let pgid = nix::unistd::getpgrp().as_raw();
        assert!(group_rss_kb(pgid).unwrap_or(0) > 0);
    }

    #[tokio::test]
    async fn test_watch_without_limit_never_fires() {
        let peak = AtomicU64::new(0);
        let fired = tokio::time::timeout(
            Duration::from_millis(120),
            watch_group(Some(1), None, &peak),
        )
        .await;
        assert!(fired.is_err());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_watch_fires_over_limit() {
        let pgid = nix::unistd::getpgrp().as_raw();
        let peak = AtomicU64::new(0);

        let rss = tokio::time::timeout(
            Duration::from_secs(2),
            watch_group(Some(pgid), Some(1), &peak),
        )
        .await
        .unwrap();

        assert!(rss > 1);
        assert!(peak.load(Ordering::Relaxed) >= rss);
    }
}
