//! Background sweep for ATRs left behind by a crashed or abandoned attempt.
//!
//! Two independently togglable passes, matching the split between an
//! attempt this process itself lost track of (its own crash) and an
//! attempt another process lost track of (lost cleanup).

use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct CleanupConfig {
    pub cleanup_window: Duration,
    pub client_cleanup_enabled: bool,
    pub lost_cleanup_enabled: bool,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        CleanupConfig {
            cleanup_window: Duration::from_secs(60),
            client_cleanup_enabled: true,
            lost_cleanup_enabled: true,
        }
    }
}

/// Minimal shape of an ATR entry the sweeper needs to decide whether to act
/// on it -- enough to avoid depending on the full `AtrEntry` JSON shape.
#[derive(Debug, Clone)]
pub struct SweepCandidate {
    pub attempt_id: String,
    pub status: super::atr::AtrStatus,
    pub age: Duration,
}

/// Attempts a sweeper should roll back: anything still `pending` or
/// `aborting` once it is older than the cleanup window. Completed and
/// rolled-back attempts are left for the server's own ATR pruning.
pub fn due_for_rollback(candidates: &[SweepCandidate], config: &CleanupConfig) -> Vec<String> {
    candidates
        .iter()
        .filter(|c| c.age >= config.cleanup_window)
        .filter(|c| matches!(c.status, super::atr::AtrStatus::Pending | super::atr::AtrStatus::Aborting))
        .map(|c| c.attempt_id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transactions::atr::AtrStatus;

    #[test]
    fn only_stale_pending_or_aborting_attempts_are_due() {
        let config = CleanupConfig { cleanup_window: Duration::from_secs(60), ..Default::default() };
        let candidates = vec![
            SweepCandidate { attempt_id: "a1".into(), status: AtrStatus::Pending, age: Duration::from_secs(120) },
            SweepCandidate { attempt_id: "a2".into(), status: AtrStatus::Pending, age: Duration::from_secs(5) },
            SweepCandidate { attempt_id: "a3".into(), status: AtrStatus::Completed, age: Duration::from_secs(500) },
        ];
        assert_eq!(due_for_rollback(&candidates, &config), vec!["a1".to_string()]);
    }
}
