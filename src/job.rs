use crate::error::{ErrorCode, Result, ScataError};
use scata_protocol::{JobPhase, JobStatus};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobState {
    job: String,
    phase: JobPhase,
    history: Vec<JobPhase>,
}

impl JobState {
    pub fn new(job: &str) -> Self {
        Self {
            job: job.to_string(),
            phase: JobPhase::Pending,
            history: vec![JobPhase::Pending],
        }
    }

    pub fn phase(&self) -> JobPhase {
        self.phase
    }

    /// Every phase entered so far, starting with `Pending`.
    pub fn history(&self) -> &[JobPhase] {
        &self.history
    }

    pub fn transition(&mut self, next: JobPhase) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            return Err(ScataError::new(
                ErrorCode::InvalidTransition,
                format!("Job {} cannot move from {} to {}", self.job, self.phase, next),
            ));
        }
        tracing::info!(job = self.job.as_str(), from = %self.phase, to = %next, "job phase");
        self.phase = next;
        self.history.push(next);
        Ok(())
    }

    pub fn status(&self, progress: impl Into<String>) -> JobStatus {
        JobStatus {
            phase: self.phase,
            progress: progress.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_are_validated() {
        let mut state = JobState::new("j");
        state.transition(JobPhase::Preparing).unwrap();
        let err = state.transition(JobPhase::Merging).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidTransition);
        assert_eq!(state.phase(), JobPhase::Preparing);
        state.transition(JobPhase::Aborted).unwrap();
        assert!(state.transition(JobPhase::Failed).is_err());
        assert_eq!(state.history(), [JobPhase::Pending, JobPhase::Preparing, JobPhase::Aborted]);
        assert_eq!(state.status("stopped").phase, JobPhase::Aborted);
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
