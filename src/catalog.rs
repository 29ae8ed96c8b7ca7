//! Scene catalog model and the client seam used by the pipeline.

use chrono::{DateTime, NaiveDate, Utc};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::raster::Bounds;

/// Filters for the catalog search. Bounds are WGS84 degrees.
#[derive(Debug, Clone)]
pub struct SceneQuery {
    pub collection: String,
    pub bounds: Bounds,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub max_cloud_cover: f64,
}

/// One catalog result.
#[derive(Debug, Clone)]
pub struct SceneDescriptor {
    pub uuid: String,
    pub acquired: DateTime<Utc>,
    pub ingested: DateTime<Utc>,
    pub cloud_cover: Option<f64>,
}

impl SceneDescriptor {
    /// Date portion of the acquisition timestamp, the value the marker
    /// stores.
    pub fn date(&self) -> NaiveDate {
        self.acquired.date_naive()
    }
}

/// Query results ordered by ingestion time, newest first. The ordering
/// is applied here rather than trusted from the service.
pub struct SceneList {
    scenes: Vec<SceneDescriptor>,
}

impl SceneList {
    pub fn new(mut scenes: Vec<SceneDescriptor>) -> Self {
        scenes.sort_by(|a, b| b.ingested.cmp(&a.ingested));
        Self { scenes }
    }

    pub fn len(&self) -> usize {
        self.scenes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenes.is_empty()
    }

    pub fn scenes(&self) -> &[SceneDescriptor] {
        &self.scenes
    }

    /// Most recently ingested scene together with the result count the
    /// decision procedure keys on.
    pub fn candidate(&self) -> Option<Candidate> {
        self.scenes.first().map(|scene| Candidate {
            uuid: scene.uuid.clone(),
            date: scene.date(),
            matches: self.scenes.len(),
        })
    }
}

/// Input to the new-scene decision: the freshest scene and how many
/// results the query returned alongside it.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub uuid: String,
    pub date: NaiveDate,
    pub matches: usize,
}

/// Catalog client seam. The shipped implementation talks to a STAC API;
/// tests substitute local stubs.
pub trait SceneCatalog {
    /// Scenes matching the query, newest ingestion first.
    async fn query_latest(&self, query: &SceneQuery) -> Result<SceneList>;

    /// Fetch the seven band files for a scene into `dest_dir`, returning
    /// the paths written.
    async fn download_bands(&self, uuid: &str, dest_dir: &Path) -> Result<Vec<PathBuf>>;
}

/// Bounded retry settings for catalog and download calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff: no delay before the first retry, then the
    /// base delay doubling per attempt, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run `op`, retrying transient failures up to the policy limit.
/// Non-transient errors propagate on first occurrence.
pub async fn with_retries<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= policy.max_retries || !error.is_transient() {
                    return Err(error);
                }
                let delay = policy.delay_for_attempt(attempt);
                log::warn!("transient error ({error}), retrying in {delay:?}");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
