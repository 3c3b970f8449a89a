//! Store key layout.
//!
//! ```text
//! {prefix}:{algorithm}:{window_ms}:{identifier}
//! {prefix}:fixed_window:{window_ms}:{identifier}:{window_index}
//! {prefix}:instance:{instance_id}:{algorithm}:{window_ms}:{identifier}[:{window_index}]
//! ```
//!
//! Identifiers may themselves contain `:`, so parsing relies on the fixed
//! positions of the other components rather than on splitting.

use std::fmt;

use crate::algorithms::{fixed_window, Algorithm};
use crate::validation::MAX_IDENTIFIER_LEN;

const INSTANCE_SEGMENT: &str = "instance";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub prefix: String,
    pub algorithm: Algorithm,
    pub window_ms: u64,
    pub identifier: String,
    /// Set only for fixed windows.
    pub window_index: Option<u64>,
    /// Set only for instance-local counters.
    pub instance_id: Option<String>,
}

impl RateLimitKey {
    pub fn new(
        prefix: &str,
        algorithm: Algorithm,
        window_ms: u64,
        identifier: &str,
        now: u64,
    ) -> Self {
        let window_index = match algorithm {
            Algorithm::FixedWindow => Some(fixed_window::window_index(now, window_ms)),
            _ => None,
        };
        Self {
            prefix: prefix.to_string(),
            algorithm,
            window_ms,
            identifier: sanitize_identifier(identifier),
            window_index,
            instance_id: None,
        }
    }

    /// The same counter, scoped to one engine instance.
    pub fn for_instance(&self, instance_id: &str) -> Self {
        Self {
            instance_id: Some(sanitize_identifier(instance_id).replace(':', "_")),
            ..self.clone()
        }
    }

    /// Parse a key produced by this module. Anything else yields `None`.
    pub fn parse(prefix: &str, raw: &str) -> Option<Self> {
        let rest = raw.strip_prefix(prefix)?.strip_prefix(':')?;

        let (instance_id, rest) = match rest.strip_prefix(INSTANCE_SEGMENT) {
            Some(tail) => {
                let tail = tail.strip_prefix(':')?;
                let (id, tail) = tail.split_once(':')?;
                (Some(id.to_string()), tail)
            }
            None => (None, rest),
        };

        let (algorithm, rest) = rest.split_once(':')?;
        let algorithm = Algorithm::ALL
            .into_iter()
            .find(|a| a.as_str() == algorithm)?;

        let (window, rest) = rest.split_once(':')?;
        let window_ms: u64 = window.parse().ok()?;

        let (identifier, window_index) = match algorithm {
            Algorithm::FixedWindow => {
                let (identifier, index) = rest.rsplit_once(':')?;
                (identifier, Some(index.parse().ok()?))
            }
            _ => (rest, None),
        };
        if identifier.is_empty() {
            return None;
        }

        Some(Self {
            prefix: prefix.to_string(),
            algorithm,
            window_ms,
            identifier: identifier.to_string(),
            window_index,
            instance_id,
        })
    }

    /// Coarse `SCAN` pattern for every key that may belong to `identifier`.
    /// Candidates still have to be confirmed with [`RateLimitKey::parse`].
    pub fn scan_pattern(prefix: &str, identifier: &str) -> String {
        let escaped: String = identifier
            .chars()
            .flat_map(|c| match c {
                '*' | '?' | '[' | ']' | '\\' => vec!['\\', c],
                _ => vec![c],
            })
            .collect();
        format!("{}:*{}*", prefix, escaped)
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.prefix)?;
        if let Some(instance) = &self.instance_id {
            write!(f, "{}:{}:", INSTANCE_SEGMENT, instance)?;
        }
        write!(f, "{}:{}:{}", self.algorithm, self.window_ms, self.identifier)?;
        if let Some(index) = self.window_index {
            write!(f, ":{}", index)?;
        }
        Ok(())
    }
}

/// Restrict a key component to `[A-Za-z0-9_:.-]` and bound its length.
pub fn sanitize_identifier(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, ':' | '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_IDENTIFIER_LEN)
        .collect()
}
