use crate::types::RuleMatch;

/// Platform-level error taxonomy. Anything a student can see is one of the
/// first variants; `Infrastructure` (and the transport variants feeding it)
/// crosses the operator boundary only.
///
/// Compile errors, runtime failures and timeouts of the *student program*
/// are deliberately absent here: they are data in an `ExecutionResult`,
/// never an `Err`.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("unknown language: {0}")]
    UnknownLanguage(String),

    #[error("submission rejected by execution policy")]
    ValidationRejected(Vec<RuleMatch>),

    #[error("daily execution quota exceeded")]
    QuotaExceeded,

    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("invalid language catalog: {0}")]
    InvalidCatalog(String),

    #[error("infrastructure failure: {0}")]
    Infrastructure(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SandboxError {
    /// Message safe to return to a student. Infrastructure detail is
    /// replaced with a generic retry hint; operators get the real error
    /// through logs.
    pub fn student_message(&self) -> String {
        match self {
            SandboxError::UnknownLanguage(lang) => format!("unknown language: {lang}"),
            SandboxError::ValidationRejected(matches) => {
                let categories: Vec<&str> =
                    matches.iter().map(|m| m.category.as_str()).collect();
                format!("submission rejected by execution policy: {}", categories.join(", "))
            }
            SandboxError::QuotaExceeded => {
                "daily execution quota exceeded; try again after the quota resets".to_string()
            }
            SandboxError::PayloadTooLarge(what) => format!("payload too large: {what}"),
            _ => "execution failed due to a temporary platform problem; try again".to_string(),
        }
    }
}

pub type SandboxResult<T> = Result<T, SandboxError>;
