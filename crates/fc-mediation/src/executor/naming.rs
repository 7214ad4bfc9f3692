//! Worker naming patterns for thread pools

use std::sync::atomic::{AtomicU64, Ordering};

use crate::{MediationError, Result};

const TOKENS: &[&str] = &["#name#", "#counter#", "#contextId#", "#longName#"];

/// Deterministic worker names from a pattern.
///
/// Supported tokens: `#name#`, `#counter#`, `#contextId#`, `#longName#`.
/// The counter is shared by every pool created through the same namer.
pub struct ThreadNamer {
    pattern: String,
    context_id: String,
    counter: AtomicU64,
}

impl ThreadNamer {
    pub fn new(pattern: &str, context_id: &str) -> Result<Self> {
        validate_pattern(pattern)?;
        Ok(Self {
            pattern: pattern.to_string(),
            context_id: context_id.to_string(),
            counter: AtomicU64::new(0),
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn next_name(&self, name: &str, long_name: &str) -> String {
        let counter = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.pattern
            .replace("#longName#", long_name)
            .replace("#name#", name)
            .replace("#counter#", &counter.to_string())
            .replace("#contextId#", &self.context_id)
    }
}

/// Reject patterns that still contain a `#word#` token after known tokens are removed
fn validate_pattern(pattern: &str) -> Result<()> {
    let mut rest = pattern.to_string();
    for token in TOKENS {
        rest = rest.replace(token, "");
    }

    let bytes = rest.as_bytes();
    for (start, _) in rest.match_indices('#') {
        let word_len = bytes[start + 1..]
            .iter()
            .take_while(|b| b.is_ascii_alphanumeric())
            .count();
        if word_len > 0 && bytes.get(start + 1 + word_len) == Some(&b'#') {
            return Err(MediationError::Config(format!(
                "thread name pattern '{}' contains unknown token '{}'",
                pattern,
                &rest[start..start + word_len + 2]
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pattern() {
        let namer = ThreadNamer::new("FlowCatalyst (#contextId#) thread ##counter# - #name#", "ctx").unwrap();
        assert_eq!(namer.next_name("Aggregator", "Aggregator"), "FlowCatalyst (ctx) thread #1 - Aggregator");
        assert_eq!(namer.next_name("Aggregator", "Aggregator"), "FlowCatalyst (ctx) thread #2 - Aggregator");
    }

    #[test]
    fn test_unknown_token_rejected() {
        assert!(ThreadNamer::new("#name# on #host#", "ctx").is_err());
        assert!(ThreadNamer::new("#longName# #counter#", "ctx").is_ok());
    }
}
