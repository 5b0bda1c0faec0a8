//! Sync summaries returned by handlers.

use std::collections::BTreeMap;
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Count fields reported by a successful sync, e.g. `{"live_channels": 10}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct SyncSummary(BTreeMap<String, u64>);

impl SyncSummary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a count field.
    pub fn with_count(mut self, field: impl Into<String>, count: u64) -> Self {
        self.0.insert(field.into(), count);
        self
    }

    pub fn get(&self, field: &str) -> Option<u64> {
        self.0.get(field).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl fmt::Display for SyncSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "no changes");
        }
        let parts: Vec<String> = self.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        write!(f, "{}", parts.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_display() {
        let summary = SyncSummary::new()
            .with_count("live_channels", 10)
            .with_count("categories", 2);
        assert_eq!(summary.to_string(), "categories=2 live_channels=10");
        assert_eq!(SyncSummary::new().to_string(), "no changes");
    }

    #[test]
    fn test_summary_parses_count_map() {
        let summary: SyncSummary = serde_json::from_str(r#"{"movies": 120}"#).unwrap();
        assert_eq!(summary.get("movies"), Some(120));
        assert_eq!(summary.get("series"), None);
    }
}
