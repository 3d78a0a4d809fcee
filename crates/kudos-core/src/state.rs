use serde::{Deserialize, Serialize};
use std::{
    fmt::Display,
    time::{SystemTime, UNIX_EPOCH},
};

use crate::{constant::MAX_SUBJECT_LEN, KudosError, KudosResult};

/// Identifies the thing being liked; in practice a page id or slug.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub struct SubjectId(String);

impl SubjectId {
    pub fn new(raw: impl Into<String>) -> KudosResult<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(KudosError::InvalidSubject {
                reason: "subject id is empty".into(),
            }
            .into());
        }
        if trimmed.len() > MAX_SUBJECT_LEN {
            return Err(KudosError::InvalidSubject {
                reason: format!(
                    "subject id is {} bytes, max is {MAX_SUBJECT_LEN}",
                    trimmed.len()
                ),
            }
            .into());
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Page ids are never empty or long, so this cannot fail.
    pub fn from_page_id(id: u32) -> Self {
        Self(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SubjectId {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        SubjectId::new(value)
    }
}

impl From<SubjectId> for String {
    fn from(value: SubjectId) -> Self {
        value.0
    }
}

impl Display for SubjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a liveness upstream reports, before the cache stamps it.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveStatus {
    pub online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, alias = "userName", skip_serializing_if = "Option::is_none")]
    pub broadcaster: Option<String>,
}

impl LiveStatus {
    pub fn offline() -> Self {
        Self::default()
    }
}

/// A liveness status as served to the UI. `fetched_at` is in Unix
/// milliseconds and strictly increases across refreshes of one cache.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LivenessSnapshot {
    pub online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcaster: Option<String>,
    pub fetched_at: u64,
}

impl LivenessSnapshot {
    pub fn from_status(status: LiveStatus, fetched_at: u64) -> Self {
        Self {
            online: status.online,
            title: status.title,
            broadcaster: status.broadcaster,
            fetched_at,
        }
    }

    /// The safe default served when nothing usable is known.
    pub fn offline(fetched_at: u64) -> Self {
        Self::from_status(LiveStatus::offline(), fetched_at)
    }
}

impl Display for LivenessSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.online {
            write!(
                f,
                "LIVE: {} ({})",
                self.title.as_deref().unwrap_or("untitled"),
                self.broadcaster.as_deref().unwrap_or("")
            )
        } else {
            write!(f, "offline")
        }
    }
}

pub(crate) fn time_in_sec(time: SystemTime) -> KudosResult<u64> {
    Ok(time.duration_since(UNIX_EPOCH)?.as_secs())
}

pub(crate) fn time_in_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
