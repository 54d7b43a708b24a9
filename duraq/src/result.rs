/// The tri-state result a processor reports for a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The job is done and its record is removed.
    Success,
    /// The job failed but may be retried until the retry limit removes it.
    Fail,
    /// The job failed in a way that must not be retried; it is removed
    /// immediately and the condition is logged.
    Critical,
}

pub type ProcessError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// What a processor returns. An `Err` resolves like [`Outcome::Fail`], with
/// the error logged, so handlers are free to use `?`.
pub type ProcessResult = std::result::Result<Outcome, ProcessError>;

impl From<Outcome> for ProcessResult {
    fn from(outcome: Outcome) -> Self {
        Ok(outcome)
    }
}
