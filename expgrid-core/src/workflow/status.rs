// Job Status
// Canonical job states and per-backend native status maps

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Backend-agnostic job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CanonicalStatus {
    Unqueued,
    Queued,
    Running,
    Complete,
    Failed,
    Unresolved,
}

impl CanonicalStatus {
    /// States a status-based wait may stop on
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CanonicalStatus::Unqueued
                | CanonicalStatus::Complete
                | CanonicalStatus::Failed
                | CanonicalStatus::Unresolved
        )
    }
}

impl fmt::Display for CanonicalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CanonicalStatus::Unqueued => "UNQUEUED",
            CanonicalStatus::Queued => "QUEUED",
            CanonicalStatus::Running => "RUNNING",
            CanonicalStatus::Complete => "COMPLETE",
            CanonicalStatus::Failed => "FAILED",
            CanonicalStatus::Unresolved => "UNRESOLVED",
        };
        write!(f, "{}", name)
    }
}

/// Partial function from native status strings to canonical states
#[derive(Debug, Clone, Default)]
pub struct StatusMap {
    entries: HashMap<String, CanonicalStatus>,
}

impl StatusMap {
    pub fn new(pairs: &[(&str, CanonicalStatus)]) -> Self {
        Self {
            entries: pairs
                .iter()
                .map(|(native, status)| (native.to_string(), *status))
                .collect(),
        }
    }

    /// Map a native string. Schedulers append detail after the state
    /// (`CANCELLED by 1234`, `FAILED+`), so only the leading word counts.
    pub fn map(&self, native: &str) -> Option<CanonicalStatus> {
        let trimmed = native.trim();
        if let Some(status) = self.entries.get(trimmed) {
            return Some(*status);
        }
        let word: String = trimmed
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect();
        self.entries.get(&word).copied()
    }
}

/// Where a report's canonical status came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusOrigin {
    /// The native string was in the status map
    Mapped,
    /// The backend answered with a string the map does not know
    Unmapped,
    /// The backend could not be asked
    QueryFailed,
    /// Neither the live nor the history endpoint knows the job
    Absent,
}

/// One fresh status query; never cached across polls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: CanonicalStatus,
    /// Native string as the backend reported it
    pub native: Option<String>,
    pub origin: StatusOrigin,
    /// Query failure detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl StatusReport {
    pub fn from_native(map: &StatusMap, native: &str) -> Self {
        match map.map(native) {
            Some(status) => Self {
                status,
                native: Some(native.trim().to_string()),
                origin: StatusOrigin::Mapped,
                detail: None,
            },
            None => Self {
                status: CanonicalStatus::Unresolved,
                native: Some(native.trim().to_string()),
                origin: StatusOrigin::Unmapped,
                detail: None,
            },
        }
    }

    pub fn absent() -> Self {
        Self {
            status: CanonicalStatus::Unqueued,
            native: None,
            origin: StatusOrigin::Absent,
            detail: None,
        }
    }

    pub fn query_failed(detail: impl Into<String>) -> Self {
        Self {
            status: CanonicalStatus::Unresolved,
            native: None,
            origin: StatusOrigin::QueryFailed,
            detail: Some(detail.into()),
        }
    }

    /// Whether a status-based wait may stop here. Unmapped strings and failed
    /// queries report UNRESOLVED but never end the loop.
    pub fn ends_wait(&self) -> bool {
        matches!(self.origin, StatusOrigin::Mapped | StatusOrigin::Absent)
            && self.status.is_terminal()
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.native, self.origin) {
            (Some(native), StatusOrigin::Unmapped) => {
                write!(f, "{} (unrecognized state '{}')", self.status, native)
            }
            (Some(native), _) => write!(f, "{} ({})", self.status, native),
            (None, StatusOrigin::QueryFailed) => write!(
                f,
                "{} (query failed: {})",
                self.status,
                self.detail.as_deref().unwrap_or("unknown error")
            ),
            (None, _) => write!(f, "{}", self.status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_map() -> StatusMap {
        StatusMap::new(&[
            ("R", CanonicalStatus::Running),
            ("COMPLETED", CanonicalStatus::Complete),
            ("CANCELLED", CanonicalStatus::Failed),
        ])
    }

    #[test]
    fn test_map_uses_leading_word() {
        let map = sample_map();
        assert_eq!(map.map(" R\n"), Some(CanonicalStatus::Running));
        assert_eq!(map.map("CANCELLED by 1234"), Some(CanonicalStatus::Failed));
        assert_eq!(map.map("CANCELLED+"), Some(CanonicalStatus::Failed));
        assert_eq!(map.map("REQUEUED"), None);
    }

    #[test]
    fn test_unmapped_status_is_unresolved_but_not_final() {
        let report = StatusReport::from_native(&sample_map(), "BRAND_NEW_STATE");
        assert_eq!(report.status, CanonicalStatus::Unresolved);
        assert_eq!(report.origin, StatusOrigin::Unmapped);
        assert_eq!(report.native.as_deref(), Some("BRAND_NEW_STATE"));
        assert!(!report.ends_wait());
    }

    #[test]
    fn test_query_failure_never_ends_wait() {
        assert!(!StatusReport::query_failed("timeout").ends_wait());
    }

    #[test]
    fn test_terminal_mapped_and_absent_end_wait() {
        assert!(StatusReport::from_native(&sample_map(), "COMPLETED").ends_wait());
        assert!(!StatusReport::from_native(&sample_map(), "R").ends_wait());
        assert!(StatusReport::absent().ends_wait());
    }

    #[test]
    fn test_display() {
        let report = StatusReport::from_native(&sample_map(), "R");
        assert_eq!(report.to_string(), "RUNNING (R)");
        assert_eq!(StatusReport::absent().to_string(), "UNQUEUED");
    }
}
