use crate::job::JobStatus;
use crate::CoreError;

pub fn validate_transition(from: JobStatus, to: JobStatus) -> Result<(), CoreError> {
    let valid = matches!(
        (from, to),
        (JobStatus::Pending, JobStatus::Running | JobStatus::Skipped)
            | (JobStatus::Running, JobStatus::Succeeded | JobStatus::Failed)
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_transitions() {
        assert!(validate_transition(JobStatus::Pending, JobStatus::Running).is_ok());
        assert!(validate_transition(JobStatus::Pending, JobStatus::Skipped).is_ok());
        assert!(validate_transition(JobStatus::Running, JobStatus::Succeeded).is_ok());
        assert!(validate_transition(JobStatus::Running, JobStatus::Failed).is_ok());
    }

    #[test]
    fn invalid_transitions() {
        assert!(validate_transition(JobStatus::Pending, JobStatus::Succeeded).is_err());
        assert!(validate_transition(JobStatus::Pending, JobStatus::Failed).is_err());
        assert!(validate_transition(JobStatus::Running, JobStatus::Skipped).is_err());
        assert!(validate_transition(JobStatus::Succeeded, JobStatus::Running).is_err());
        assert!(validate_transition(JobStatus::Skipped, JobStatus::Running).is_err());
        assert!(validate_transition(JobStatus::Failed, JobStatus::Pending).is_err());
    }
}
