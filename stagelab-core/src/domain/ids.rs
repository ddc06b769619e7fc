use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an optimization or batch job.
///
/// Every checkpoint, progress channel and batch record is keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derive a child job id, e.g. one optimizer job per batch target.
    pub fn child(&self, suffix: &str) -> Self {
        Self(format!("{}:{}", self.0, suffix))
    }

    /// Filesystem-safe stem: sanitized id plus a short BLAKE3 suffix so that
    /// ids differing only in replaced characters never collide.
    pub fn file_stem(&self) -> String {
        let sanitized: String = self
            .0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let hash = blake3::hash(self.0.as_bytes()).to_hex();
        format!("{}-{}", sanitized, &hash.as_str()[..8])
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}
