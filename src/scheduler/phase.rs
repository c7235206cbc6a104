use crate::model::{JobPhase, JobStatus};

/// Derive a job's phase from its task counters and quorum.
///
/// Any failed or unknown instance fails the whole gang, even when enough
/// others are running. The result depends only on the arguments and is
/// recomputed from scratch on every pass.
pub fn derive_phase(status: &JobStatus, min_gang: u32) -> JobPhase {
    if status.total() == 0 {
        return JobPhase::Pending;
    }
    if status.failed > 0 || status.unknown > 0 {
        return JobPhase::Failed;
    }
    if status.succeeded + status.running < min_gang {
        return JobPhase::Scheduling;
    }
    if status.running == 0 && status.pending == 0 && status.succeeded > 0 {
        JobPhase::Succeeded
    } else {
        JobPhase::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(pending: u32, running: u32, succeeded: u32, failed: u32, unknown: u32) -> JobStatus {
        JobStatus {
            phase: JobPhase::Pending,
            pending,
            running,
            succeeded,
            failed,
            unknown,
        }
    }

    #[test]
    fn empty_is_pending() {
        assert_eq!(derive_phase(&counts(0, 0, 0, 0, 0), 3), JobPhase::Pending);
        assert_eq!(derive_phase(&counts(0, 0, 0, 0, 0), 0), JobPhase::Pending);
    }

    #[test]
    fn failure_wins_over_quorum() {
        assert_eq!(derive_phase(&counts(0, 2, 0, 1, 0), 3), JobPhase::Failed);
        assert_eq!(derive_phase(&counts(0, 5, 0, 0, 1), 3), JobPhase::Failed);
    }

    #[test]
    fn below_quorum_is_scheduling() {
        assert_eq!(derive_phase(&counts(2, 3, 0, 0, 0), 4), JobPhase::Scheduling);
        assert_eq!(derive_phase(&counts(5, 0, 0, 0, 0), 1), JobPhase::Scheduling);
    }

    #[test]
    fn quorum_with_work_left_is_running() {
        assert_eq!(derive_phase(&counts(2, 3, 0, 0, 0), 3), JobPhase::Running);
        // a pending straggler keeps the job running after others finished
        assert_eq!(derive_phase(&counts(1, 0, 4, 0, 0), 3), JobPhase::Running);
    }

    #[test]
    fn all_done_is_succeeded() {
        assert_eq!(derive_phase(&counts(0, 0, 5, 0, 0), 3), JobPhase::Succeeded);
        assert_eq!(derive_phase(&counts(0, 0, 1, 0, 0), 0), JobPhase::Succeeded);
    }

    #[test]
    fn ignores_stored_phase() {
        let mut status = counts(0, 3, 0, 0, 0);
        status.phase = JobPhase::Failed;
        assert_eq!(derive_phase(&status, 3), JobPhase::Running);
        assert_eq!(derive_phase(&status, 3), derive_phase(&status, 3));
    }
}
