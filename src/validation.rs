use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use validator::Validate;

use crate::error::{RateLimitError, Result};

pub const MAX_IDENTIFIER_LEN: usize = 250;
pub const MAX_LIMIT: u64 = 10_000;
pub const MAX_WINDOW_MS: u64 = 86_400_000;

static IDENTIFIER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9_:\-.]+$").expect("identifier pattern is a valid regex")
});

/// Parameters of one admission check, as supplied by a caller.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CheckParams {
    #[validate(length(min = 1, max = 250))]
    pub identifier: String,
    #[validate(range(min = 1, max = 10000))]
    pub limit: u64,
    #[validate(range(min = 1, max = 86400000))]
    pub window_ms: u64,
}

/// Request validation applied before anything reaches the store.
#[derive(Debug, Clone)]
pub struct RequestValidator {
    max_window_ms: u64,
}

impl Default for RequestValidator {
    fn default() -> Self {
        Self::new(MAX_WINDOW_MS)
    }
}

impl RequestValidator {
    pub fn new(max_window_ms: u64) -> Self {
        Self {
            max_window_ms: max_window_ms.min(MAX_WINDOW_MS),
        }
    }

    pub fn validate_check(&self, identifier: &str, limit: u64, window_ms: u64) -> Result<()> {
        let params = CheckParams {
            identifier: identifier.to_string(),
            limit,
            window_ms,
        };
        self.validate_params(&params)
    }

    pub fn validate_params(&self, params: &CheckParams) -> Result<()> {
        params
            .validate()
            .map_err(|e| RateLimitError::Validation(e.to_string()))?;

        Self::validate_identifier(&params.identifier)?;

        if params.window_ms > self.max_window_ms {
            return Err(RateLimitError::Validation(format!(
                "window_ms {} exceeds the configured maximum of {}",
                params.window_ms, self.max_window_ms
            )));
        }
        Ok(())
    }

    pub fn validate_identifier(identifier: &str) -> Result<()> {
        if identifier.is_empty() || identifier.len() > MAX_IDENTIFIER_LEN {
            return Err(RateLimitError::Validation(format!(
                "identifier must be between 1 and {} characters",
                MAX_IDENTIFIER_LEN
            )));
        }
        if !IDENTIFIER_PATTERN.is_match(identifier) {
            return Err(RateLimitError::Validation(
                "identifier may only contain letters, digits, '_', ':', '-' and '.'".to_string(),
            ));
        }
        Ok(())
    }
}
