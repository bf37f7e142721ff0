//! Status Machine (C4): drives MONITORING -> DEVELOPING -> BREAKING ->
//! VERIFIED. Evaluated inline after every cluster mutation in clustering
//! (C3) and periodically by the monitor (C6) for idle transitions.
//!
//! The transition function is a pure free function of primitive inputs —
//! not a method on a store-backed cluster — specifically so it can be
//! exhaustively unit tested without a database, the same move the
//! reference material's `story_status`/`story_energy` functions make.

use chrono::Duration;

use crate::config::Config;
use crate::types::ClusterStatus;

pub struct StatusInputs {
    pub prev_status: ClusterStatus,
    pub verification_level: usize,
    /// now - first_seen
    pub delta_first: Duration,
    /// now - last_updated
    pub delta_upd: Duration,
    /// true iff the triggering event added a new unique source
    pub is_gaining_sources: bool,
}

/// Implements the status transition table. `last_updated` (not
/// `first_seen`) gates both the BREAKING -> VERIFIED idle-out and the
/// VERIFIED -> BREAKING re-promotion — using `first_seen` there is a known
/// pitfall this implementation deliberately avoids.
pub fn next_status(inputs: &StatusInputs, cfg: &Config) -> ClusterStatus {
    let breaking_window = Duration::from_std(cfg.breaking_window).unwrap();
    let re_promote_window = Duration::from_std(cfg.breaking_re_promote_window).unwrap();
    let idle_timeout = Duration::from_std(cfg.breaking_idle_timeout).unwrap();

    if inputs.verification_level == 1 {
        return ClusterStatus::Monitoring;
    }

    match inputs.prev_status {
        ClusterStatus::Monitoring => {
            if inputs.verification_level == 2 {
                return ClusterStatus::Developing;
            }
            if inputs.verification_level >= 3 && inputs.delta_first < breaking_window {
                return ClusterStatus::Breaking;
            }
            if inputs.verification_level >= 3 {
                return ClusterStatus::Verified;
            }
            ClusterStatus::Developing
        }
        ClusterStatus::Developing => {
            if inputs.verification_level >= 3 && inputs.delta_first < breaking_window {
                ClusterStatus::Breaking
            } else if inputs.verification_level >= 3 {
                ClusterStatus::Verified
            } else {
                ClusterStatus::Developing
            }
        }
        ClusterStatus::Verified => {
            if inputs.verification_level >= 3 && inputs.is_gaining_sources && inputs.delta_upd < re_promote_window {
                ClusterStatus::Breaking
            } else {
                ClusterStatus::Verified
            }
        }
        ClusterStatus::Breaking => {
            if inputs.delta_upd >= idle_timeout {
                ClusterStatus::Verified
            } else if inputs.verification_level >= 3 && inputs.delta_upd < breaking_window {
                ClusterStatus::Breaking
            } else if inputs.verification_level >= 3 {
                ClusterStatus::Verified
            } else {
                ClusterStatus::Breaking
            }
        }
    }
}

/// Derived metadata with no fixed downstream contract; kept as free
/// functions in the same pure-scoring style as the status transition above.
pub fn confidence_score(verification_level: usize, update_count: u32) -> f64 {
    let level_component = (verification_level as f64 / 5.0).min(1.0);
    let stability_component = (update_count as f64 / 10.0).min(1.0);
    (0.7 * level_component + 0.3 * stability_component).min(1.0)
}

pub fn importance_score(verification_level: usize, status: ClusterStatus, entity_count: usize) -> f64 {
    let status_weight = match status {
        ClusterStatus::Breaking => 1.0,
        ClusterStatus::Developing => 0.6,
        ClusterStatus::Verified => 0.4,
        ClusterStatus::Monitoring => 0.2,
    };
    let breadth = (verification_level as f64).sqrt() / 3.0;
    let entity_breadth = (entity_count as f64 / 10.0).min(1.0);
    (status_weight * 0.5 + breadth.min(1.0) * 0.3 + entity_breadth * 0.2).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> Config {
        std::env::set_var("DATABASE_URL", "postgres://test/test");
        Config::from_env().unwrap()
    }

    fn inputs(prev: ClusterStatus, level: usize, first_mins: i64, upd_mins: i64, gaining: bool) -> StatusInputs {
        StatusInputs {
            prev_status: prev,
            verification_level: level,
            delta_first: Duration::minutes(first_mins),
            delta_upd: Duration::minutes(upd_mins),
            is_gaining_sources: gaining,
        }
    }

    #[test]
    fn single_source_is_always_monitoring() {
        let status = next_status(&inputs(ClusterStatus::Breaking, 1, 5, 0, true), &cfg());
        assert_eq!(status, ClusterStatus::Monitoring);
    }

    #[test]
    fn two_sources_promotes_monitoring_to_developing() {
        let status = next_status(&inputs(ClusterStatus::Monitoring, 2, 5, 5, true), &cfg());
        assert_eq!(status, ClusterStatus::Developing);
    }

    #[test]
    fn three_sources_within_window_escalates_to_breaking() {
        let status = next_status(&inputs(ClusterStatus::Developing, 3, 10, 10, true), &cfg());
        assert_eq!(status, ClusterStatus::Breaking);
    }

    #[test]
    fn three_sources_outside_first_seen_window_settles_verified() {
        let status = next_status(&inputs(ClusterStatus::Developing, 3, 45, 45, true), &cfg());
        assert_eq!(status, ClusterStatus::Verified);
    }

    #[test]
    fn breaking_maintains_while_updates_keep_arriving() {
        let status = next_status(&inputs(ClusterStatus::Breaking, 3, 120, 10, true), &cfg());
        assert_eq!(status, ClusterStatus::Breaking);
    }

    #[test]
    fn breaking_idles_out_to_verified_after_ninety_minutes() {
        let status = next_status(&inputs(ClusterStatus::Breaking, 3, 200, 95, false), &cfg());
        assert_eq!(status, ClusterStatus::Verified);
    }

    #[test]
    fn verified_re_promotes_to_breaking_on_fresh_source_after_quiet_period() {
        // Scenario S4: Δ_first is huge (5h+) but Δ_upd resets to ~0 on the new write.
        let status = next_status(&inputs(ClusterStatus::Verified, 4, 300, 0, true), &cfg());
        assert_eq!(status, ClusterStatus::Breaking);
    }

    #[test]
    fn verified_does_not_re_promote_without_gaining_sources() {
        let status = next_status(&inputs(ClusterStatus::Verified, 4, 300, 0, false), &cfg());
        assert_eq!(status, ClusterStatus::Verified);
    }

    #[test]
    fn verified_does_not_re_promote_outside_re_promote_window() {
        let status = next_status(&inputs(ClusterStatus::Verified, 4, 300, 20, true), &cfg());
        assert_eq!(status, ClusterStatus::Verified);
    }

    #[test]
    fn importance_score_ranks_breaking_above_monitoring() {
        let breaking = importance_score(3, ClusterStatus::Breaking, 5);
        let monitoring = importance_score(3, ClusterStatus::Monitoring, 5);
        assert!(breaking > monitoring);
    }
}
