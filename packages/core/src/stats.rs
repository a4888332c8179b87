//! Statistics reported by the queue engine.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::JobId;

/// What a stats query is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatsScope {
    /// The whole server.
    Global,
    /// A single tube.
    Tube(String),
    /// A single job.
    Job(JobId),
}

impl std::fmt::Display for StatsScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatsScope::Global => write!(f, "global"),
            StatsScope::Tube(name) => write!(f, "tube {}", name),
            StatsScope::Job(id) => write!(f, "job {}", id),
        }
    }
}

/// A single statistic. All numeric beanstalkd statistics are integers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatValue {
    Int(u64),
    Float(f64),
    Text(String),
}

impl StatValue {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            StatValue::Int(v) => Some(*v),
            StatValue::Text(s) => s.parse().ok(),
            StatValue::Float(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            StatValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl std::fmt::Display for StatValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatValue::Int(v) => write!(f, "{}", v),
            StatValue::Float(v) => write!(f, "{}", v),
            StatValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<u64> for StatValue {
    fn from(v: u64) -> Self {
        StatValue::Int(v)
    }
}

impl From<&str> for StatValue {
    fn from(v: &str) -> Self {
        StatValue::Text(v.to_string())
    }
}

impl From<String> for StatValue {
    fn from(v: String) -> Self {
        StatValue::Text(v)
    }
}

/// Key/value statistics, ordered by key for stable output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Stats(pub BTreeMap<String, StatValue>);

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning `self` for chaining.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<StatValue>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&StatValue> {
        self.0.get(key)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(StatValue::as_u64)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(StatValue::as_str)
    }

    /// Number of times a job was released (job scope).
    pub fn releases(&self) -> Option<u64> {
        self.get_u64("releases")
    }

    /// Tube a job belongs to (job scope).
    pub fn tube(&self) -> Option<&str> {
        self.get_str("tube")
    }

    /// Number of ready jobs (tube or global scope).
    pub fn ready_jobs(&self) -> Option<u64> {
        self.get_u64("current-jobs-ready")
    }

    /// Age of a job in seconds (job scope).
    pub fn age(&self) -> Option<u64> {
        self.get_u64("age")
    }

    /// Server version (global scope).
    pub fn version(&self) -> Option<String> {
        self.get("version").map(|v| v.to_string())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &StatValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_accessors() {
        let stats = Stats::new()
            .with("releases", 2u64)
            .with("tube", "mail")
            .with("current-jobs-ready", "5");

        assert_eq!(stats.releases(), Some(2));
        assert_eq!(stats.tube(), Some("mail"));
        assert_eq!(stats.ready_jobs(), Some(5));
        assert_eq!(stats.age(), None);
    }

    #[test]
    fn version_is_rendered_whatever_its_shape() {
        let text = Stats::new().with("version", "1.13");
        assert_eq!(text.version().as_deref(), Some("1.13"));

        let mut numeric = Stats::new();
        numeric.0.insert("version".into(), StatValue::Float(1.12));
        assert_eq!(numeric.version().as_deref(), Some("1.12"));
    }

    #[test]
    fn serializes_as_flat_map() {
        let stats = Stats::new().with("id", 3u64).with("state", "ready");
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["id"], 3);
        assert_eq!(json["state"], "ready");
    }
}
