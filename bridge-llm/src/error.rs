use thiserror::Error;

pub type Result<T> = std::result::Result<T, LlmError>;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("invalid chat request: {0}")]
    InvalidInput(String),

    /// Transport failure or a non-2xx answer from the endpoint.
    #[error("chat completion request failed: {0}")]
    Http(String),

    #[error("chat completion timed out after {0}s")]
    Timeout(u64),

    #[error("chat completion response malformed: {0}")]
    ResponseFormat(String),
}

impl LlmError {
    /// Whether the endpoint, rather than the caller, is at fault.
    pub fn is_upstream(&self) -> bool {
        !matches!(self, Self::InvalidInput(_))
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(e: serde_json::Error) -> Self {
        Self::ResponseFormat(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_invalid_input_is_the_callers_fault() {
        assert!(!LlmError::InvalidInput("empty".into()).is_upstream());
        assert!(LlmError::Timeout(30).is_upstream());
        assert_eq!(
            LlmError::Timeout(30).to_string(),
            "chat completion timed out after 30s"
        );
    }
}
