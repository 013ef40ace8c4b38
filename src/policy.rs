use anyhow::Result;
use serde::Deserialize;

/// Decides what happens when recording an event fails.
///
/// Recording is best effort from the caller's side. `LogAndContinue`
/// logs the failure and reports success; `Strict` returns the error so
/// tests and diagnostics can assert on it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    Strict,
    #[default]
    LogAndContinue,
}

impl ErrorPolicy {
    /// Applies the policy to the outcome of one recording operation.
    ///
    /// Returns `Ok(true)` when the operation succeeded, `Ok(false)` when a
    /// failure was swallowed, and `Err` only under `Strict`.
    pub fn apply(self, operation: &'static str, outcome: Result<()>) -> Result<bool> {
        match outcome {
            Ok(()) => Ok(true),
            Err(e) => match self {
                Self::Strict => Err(e),
                Self::LogAndContinue => {
                    tracing::error!(operation, error = %format!("{e:#}"), "dropping analytics event");
                    Ok(false)
                }
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::LogAndContinue => "log_and_continue",
        }
    }
}
