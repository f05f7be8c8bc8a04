//! Sliding-window accept counting for the SSH brute-force detector.
//!
//! The arithmetic lives here, outside the probe, so the kernel side stays a
//! thin caller and the window/threshold behavior is testable on the host.
//! The detector counts inbound accepts on the SSH port; correlating them
//! with real authentication failures is the downstream agent's job.

use crate::{IpTrack, IpsConfig};

/// Threshold applied when the configured value is zero.
pub const DEFAULT_FAIL_THRESHOLD: u32 = 5;

/// Window applied when the configured value is zero: 5 minutes.
pub const DEFAULT_TIME_WINDOW_NS: u64 = 300_000_000_000;

impl IpsConfig {
    pub fn effective_threshold(&self) -> u32 {
        if self.fail_threshold == 0 {
            DEFAULT_FAIL_THRESHOLD
        } else {
            self.fail_threshold
        }
    }

    pub fn effective_window_ns(&self) -> u64 {
        if self.time_window_ns == 0 {
            DEFAULT_TIME_WINDOW_NS
        } else {
            self.time_window_ns
        }
    }
}

/// Alert class produced by one counted accept.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Alert {
    /// Counter is below threshold.
    AuthFail,
    /// Threshold reached; the counter has been reset.
    BruteForce,
}

/// Snapshot to emit for one counted accept.
#[derive(Clone, Copy, Debug)]
pub struct Observation {
    pub alert: Alert,
    pub fail_count: u32,
    pub first_seen_ns: u64,
    pub last_seen_ns: u64,
}

/// Count one inbound accept from an already-tracked source IP.
///
/// Resets the window first if it has expired, then increments and applies
/// the threshold. On a brute-force verdict the returned snapshot carries
/// the counters as they stood at the alert, while the stored entry is
/// reset to zero with the window restarted at `now`, so re-alerting for
/// the same source requires a full further threshold of accepts.
pub fn observe_accept(track: &mut IpTrack, cfg: &IpsConfig, now: u64) -> Observation {
    if now.saturating_sub(track.window_start_ns) > cfg.effective_window_ns() {
        track.fail_count = 0;
        track.window_start_ns = now;
        track.first_seen_ns = now;
    }

    track.fail_count += 1;
    track.last_seen_ns = now;

    if track.fail_count >= cfg.effective_threshold() {
        let obs = Observation {
            alert: Alert::BruteForce,
            fail_count: track.fail_count,
            first_seen_ns: track.first_seen_ns,
            last_seen_ns: track.last_seen_ns,
        };
        track.fail_count = 0;
        track.window_start_ns = now;
        obs
    } else {
        Observation {
            alert: Alert::AuthFail,
            fail_count: track.fail_count,
            first_seen_ns: track.first_seen_ns,
            last_seen_ns: track.last_seen_ns,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: u64 = 1_000_000_000;

    fn cfg(threshold: u32, window_s: u64) -> IpsConfig {
        IpsConfig::new(true, threshold, window_s * SEC, false)
    }

    #[test]
    fn test_zero_config_selects_defaults() {
        let zero = IpsConfig::default();
        assert_eq!(zero.effective_threshold(), DEFAULT_FAIL_THRESHOLD);
        assert_eq!(zero.effective_window_ns(), DEFAULT_TIME_WINDOW_NS);
    }

    #[test]
    fn test_counts_up_to_threshold_then_alerts() {
        // The first accept from a new source only seeds the tracker, so
        // with threshold 3 the alert lands on the fourth accept.
        let cfg = cfg(3, 60);
        let mut track = IpTrack::first_accept(0);

        let o1 = observe_accept(&mut track, &cfg, SEC);
        assert_eq!(o1.alert, Alert::AuthFail);
        assert_eq!(o1.fail_count, 1);

        let o2 = observe_accept(&mut track, &cfg, 2 * SEC);
        assert_eq!(o2.alert, Alert::AuthFail);
        assert_eq!(o2.fail_count, 2);

        let o3 = observe_accept(&mut track, &cfg, 3 * SEC);
        assert_eq!(o3.alert, Alert::BruteForce);
        assert_eq!(o3.fail_count, 3);
        assert_eq!(o3.first_seen_ns, 0);
        assert_eq!(o3.last_seen_ns, 3 * SEC);

        // Damped: the stored counter restarted from zero.
        assert_eq!(track.fail_count, 0);
        assert_eq!(track.window_start_ns, 3 * SEC);
    }

    #[test]
    fn test_no_realert_until_full_threshold_again() {
        let cfg = cfg(3, 600);
        let mut track = IpTrack::first_accept(0);
        for i in 1..=3 {
            observe_accept(&mut track, &cfg, i * SEC);
        }
        // Two more accepts stay below threshold after the alert.
        assert_eq!(observe_accept(&mut track, &cfg, 4 * SEC).alert, Alert::AuthFail);
        assert_eq!(observe_accept(&mut track, &cfg, 5 * SEC).alert, Alert::AuthFail);
        let again = observe_accept(&mut track, &cfg, 6 * SEC);
        assert_eq!(again.alert, Alert::BruteForce);
        assert_eq!(again.fail_count, 3);
    }

    #[test]
    fn test_window_expiry_resets_counter() {
        // Accepts at t=0 (seed), 5s, 15s with a 10s window: the 15s accept
        // falls outside [0, 10] and restarts the window instead of alerting.
        let cfg = cfg(3, 10);
        let mut track = IpTrack::first_accept(0);

        let o1 = observe_accept(&mut track, &cfg, 5 * SEC);
        assert_eq!(o1.alert, Alert::AuthFail);
        assert_eq!(o1.fail_count, 1);

        let o2 = observe_accept(&mut track, &cfg, 15 * SEC);
        assert_eq!(o2.alert, Alert::AuthFail);
        assert_eq!(o2.fail_count, 1);
        assert_eq!(o2.first_seen_ns, 15 * SEC);
        assert_eq!(track.window_start_ns, 15 * SEC);
    }

    #[test]
    fn test_window_start_only_moves_forward() {
        let cfg = cfg(2, 10);
        let mut track = IpTrack::first_accept(0);
        let mut last_window = track.window_start_ns;
        for i in 1..50u64 {
            observe_accept(&mut track, &cfg, i * 7 * SEC);
            assert!(track.window_start_ns >= last_window);
            last_window = track.window_start_ns;
        }
    }

    #[test]
    fn test_burst_alert_rate() {
        // 20 counted accepts with threshold 5 yield exactly 4 alerts.
        let cfg = cfg(5, 600);
        let mut track = IpTrack::first_accept(0);
        let mut brute = 0;
        for i in 1..=20u64 {
            if observe_accept(&mut track, &cfg, i * SEC).alert == Alert::BruteForce {
                brute += 1;
            }
        }
        assert_eq!(brute, 4);
    }
}
