//! Task types and submission priorities.
//!
//! Every background sync the queue knows how to run is one of the eight
//! [`TaskType`] variants. Their wire tags are the `type` field of a
//! [`TaskEnvelope`](crate::TaskEnvelope).

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::envelope::EnvelopeError;

/// Kind of sync work carried by an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Scrape every configured folder of a GIndex provider.
    GindexFullSync,
    /// Scrape one movies folder.
    GindexMovies,
    /// Scrape one series folder.
    GindexSeries,
    /// Scrape one animes folder.
    GindexAnimes,
    /// Sync IPTV categories.
    IptvCategories,
    /// Sync IPTV live channels.
    IptvLive,
    /// Sync IPTV VOD movies.
    IptvMovies,
    /// Sync IPTV series.
    IptvSeries,
}

impl TaskType {
    /// All known task types.
    pub const ALL: &'static [TaskType] = &[
        TaskType::GindexFullSync,
        TaskType::GindexMovies,
        TaskType::GindexSeries,
        TaskType::GindexAnimes,
        TaskType::IptvCategories,
        TaskType::IptvLive,
        TaskType::IptvMovies,
        TaskType::IptvSeries,
    ];

    /// Returns the wire tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::GindexFullSync => "gindex_full_sync",
            TaskType::GindexMovies => "gindex_movies",
            TaskType::GindexSeries => "gindex_series",
            TaskType::GindexAnimes => "gindex_animes",
            TaskType::IptvCategories => "iptv_categories",
            TaskType::IptvLive => "iptv_live",
            TaskType::IptvMovies => "iptv_movies",
            TaskType::IptvSeries => "iptv_series",
        }
    }

    /// Folder-scoped tasks scrape a single path and require a `path` field.
    pub fn requires_path(&self) -> bool {
        matches!(
            self,
            TaskType::GindexMovies | TaskType::GindexSeries | TaskType::GindexAnimes
        )
    }

    /// Returns true for tasks that scrape a GIndex provider.
    pub fn is_gindex(&self) -> bool {
        matches!(
            self,
            TaskType::GindexFullSync
                | TaskType::GindexMovies
                | TaskType::GindexSeries
                | TaskType::GindexAnimes
        )
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(EnvelopeError::EmptyTaskType);
        }

        TaskType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| EnvelopeError::UnknownTaskType(s.to_string()))
    }
}

/// Priority tier a task is submitted at.
///
/// Priority belongs to the submission, not to the envelope: the same task
/// type may be published to different tiers by different call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// All tiers, highest first.
    pub const ALL: &'static [Priority] = &[Priority::High, Priority::Normal, Priority::Low];

    /// Returns the tier name used in queue names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }

    /// Sort rank (0 = served first).
    pub fn rank(&self) -> i16 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }

    /// Inverse of [`Priority::rank`].
    pub fn from_rank(rank: i16) -> Option<Self> {
        match rank {
            0 => Some(Priority::High),
            1 => Some(Priority::Normal),
            2 => Some(Priority::Low),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Priority {
    type Err = PriorityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "normal" | "default" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            _ => Err(PriorityParseError(s.to_string())),
        }
    }
}

#[derive(Debug, Error)]
#[error("Unknown priority: {0}")]
pub struct PriorityParseError(String);
