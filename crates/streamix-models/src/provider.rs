//! Provider sync requests and their fan-out into tasks.
//!
//! A provider sync is never enqueued as one unit. It is expanded at
//! submission time into independent envelopes, one per content path, that
//! may complete, fail or retry without affecting their siblings.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::envelope::TaskEnvelope;
use crate::task::TaskType;

/// GIndex provider with its configured content folders.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct GindexProvider {
    pub id: i64,
    #[serde(default)]
    pub movies_path: Option<String>,
    #[serde(default)]
    pub series_paths: Vec<String>,
    #[serde(default)]
    pub animes_path: Option<String>,
}

impl GindexProvider {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn with_movies_path(mut self, path: impl Into<String>) -> Self {
        self.movies_path = Some(path.into());
        self
    }

    pub fn with_series_path(mut self, path: impl Into<String>) -> Self {
        self.series_paths.push(path.into());
        self
    }

    pub fn with_animes_path(mut self, path: impl Into<String>) -> Self {
        self.animes_path = Some(path.into());
        self
    }

    /// One folder task per non-empty path, or a single full sync when no
    /// path is configured.
    pub fn sync_envelopes(&self) -> Vec<TaskEnvelope> {
        let folders = self
            .movies_path
            .iter()
            .map(|p| (TaskType::GindexMovies, p))
            .chain(self.series_paths.iter().map(|p| (TaskType::GindexSeries, p)))
            .chain(self.animes_path.iter().map(|p| (TaskType::GindexAnimes, p)));

        let envelopes: Vec<TaskEnvelope> = folders
            .filter_map(|(task_type, path)| {
                let path = path.trim();
                (!path.is_empty()).then(|| TaskEnvelope::for_folder(task_type, self.id, path))
            })
            .collect();

        if envelopes.is_empty() {
            vec![TaskEnvelope::for_provider(TaskType::GindexFullSync, self.id)]
        } else {
            envelopes
        }
    }
}

/// IPTV (Xtream-style) provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct IptvProvider {
    pub id: i64,
}

impl IptvProvider {
    pub fn new(id: i64) -> Self {
        Self { id }
    }

    /// Categories, live channels, movies and series, each synced on its own.
    pub fn sync_envelopes(&self) -> Vec<TaskEnvelope> {
        [
            TaskType::IptvCategories,
            TaskType::IptvLive,
            TaskType::IptvMovies,
            TaskType::IptvSeries,
        ]
        .into_iter()
        .map(|task_type| TaskEnvelope::for_provider(task_type, self.id))
        .collect()
    }
}

/// Any provider that can be synced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Provider {
    Gindex(GindexProvider),
    Iptv(IptvProvider),
}

impl Provider {
    pub fn id(&self) -> i64 {
        match self {
            Provider::Gindex(p) => p.id,
            Provider::Iptv(p) => p.id,
        }
    }

    /// Expand into independent task envelopes.
    pub fn sync_envelopes(&self) -> Vec<TaskEnvelope> {
        match self {
            Provider::Gindex(p) => p.sync_envelopes(),
            Provider::Iptv(p) => p.sync_envelopes(),
        }
    }
}

impl From<GindexProvider> for Provider {
    fn from(provider: GindexProvider) -> Self {
        Provider::Gindex(provider)
    }
}

impl From<IptvProvider> for Provider {
    fn from(provider: IptvProvider) -> Self {
        Provider::Iptv(provider)
    }
}
