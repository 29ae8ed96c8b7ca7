//! Earth Search STAC client and band file downloads.

use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use regex::Regex;
use serde::Deserialize;
use stac::{href_to_url, Item};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::catalog::{
    with_retries, RetryPolicy, SceneCatalog, SceneDescriptor, SceneList, SceneQuery,
};
use crate::config::PipelineConfig;
use crate::error::{Error, Result};

const SEARCH_API: &str = "https://earth-search.aws.element84.com/v1/search";

/// Upper bound on search results per query. The pipeline only consumes
/// the newest scene plus the result count, so one page is enough.
const SEARCH_LIMIT: usize = 10;

/// The seven surface reflectance bands the pipeline consumes, keyed the
/// way Earth Search names its assets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandAsset {
    Blue,
    Green,
    Red,
    Nir,
    Nir08,
    Swir16,
    Swir22,
}

impl BandAsset {
    pub const ALL: [BandAsset; 7] = [
        BandAsset::Blue,
        BandAsset::Green,
        BandAsset::Red,
        BandAsset::Nir,
        BandAsset::Nir08,
        BandAsset::Swir16,
        BandAsset::Swir22,
    ];

    /// Asset key within the STAC item.
    pub fn key(&self) -> &'static str {
        match self {
            Self::Blue => "blue",
            Self::Green => "green",
            Self::Red => "red",
            Self::Nir => "nir",
            Self::Nir08 => "nir08",
            Self::Swir16 => "swir16",
            Self::Swir22 => "swir22",
        }
    }

    /// Band and resolution portion of the local file name.
    pub fn file_suffix(&self) -> &'static str {
        match self {
            Self::Blue => "B02_10m",
            Self::Green => "B03_10m",
            Self::Red => "B04_10m",
            Self::Nir => "B08_10m",
            Self::Nir08 => "B8A_20m",
            Self::Swir16 => "B11_20m",
            Self::Swir22 => "B12_20m",
        }
    }

    pub fn file_name(&self, uuid: &str) -> String {
        format!("{uuid}_{}.tif", self.file_suffix())
    }
}

#[derive(Debug, PartialEq)]
pub struct S3Object {
    pub region: String,
    pub bucket: String,
    pub key: String,
}

impl S3Object {
    /// Split a virtual-hosted S3 URL into region, bucket and key.
    /// Returns `None` for hrefs that do not point at an S3 bucket.
    pub fn from_url(url: &str) -> Option<Self> {
        let re = Regex::new(
            r"https://(?<bucket>[^.]+)\.s3\.(?<region>[^.]+)\.amazonaws\.com/(?<key>.+)",
        )
        .expect("Regex pattern should always compile");

        let captures = re.captures(url)?;
        let (_, [bucket, region, key]) = captures.extract();

        Some(Self {
            region: region.to_string(),
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }
}

/// Catalog client for the Element84 Earth Search STAC API.
pub struct EarthSearchCatalog {
    http: reqwest::Client,
    collection: String,
    aws_profile: Option<String>,
    download_delay: Duration,
    retry: RetryPolicy,
}

impl EarthSearchCatalog {
    pub fn new(collection: &str, aws_profile: Option<String>, download_delay: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            collection: collection.to_string(),
            aws_profile,
            download_delay,
            retry: RetryPolicy::default(),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            &config.collection,
            config.aws_profile.clone(),
            config.download_delay(),
        )
    }

    async fn search_page(&self, query: &SceneQuery) -> Result<SearchPage> {
        let page = self
            .http
            .post(SEARCH_API)
            .json(&search_body(query, SEARCH_LIMIT))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(page)
    }

    async fn fetch_item(&self, uuid: &str) -> Result<Item> {
        let url = format!(
            "https://earth-search.aws.element84.com/v1/collections/{}/items/{uuid}",
            self.collection
        );
        let item = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<Item>()
            .await?;
        Ok(item)
    }

    async fn s3_client(&self, region: &str) -> Client {
        let region = Region::new(region.to_string());
        match &self.aws_profile {
            Some(profile) => {
                let base = aws_config::from_env().profile_name(profile).load().await;
                let config = aws_sdk_s3::config::Builder::from(&base)
                    .region(region)
                    .force_path_style(true)
                    .build();
                Client::from_conf(config)
            }
            None => {
                let config = aws_config::defaults(BehaviorVersion::latest())
                    .no_credentials()
                    .region(region)
                    .load()
                    .await;
                Client::new(&config)
            }
        }
    }

    async fn download_asset(&self, scene: &str, href: &str, output: &Path) -> Result<()> {
        if let Some(object) = S3Object::from_url(href) {
            return with_retries(&self.retry, || self.download_s3(&object, output)).await;
        }
        match href_to_url(href) {
            Some(url) => with_retries(&self.retry, || self.download_http(url.clone(), output)).await,
            None => Err(Error::AssetHref {
                scene: scene.to_string(),
                href: href.to_string(),
            }),
        }
    }

    /// Ranged S3 download that appends to a `.partial` file, so an
    /// interrupted transfer resumes where it stopped.
    async fn download_s3(&self, object: &S3Object, output: &Path) -> Result<()> {
        let client = self.s3_client(&object.region).await;
        let partial = partial_path(output);

        let mut partial_file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(&partial)?;
        let mut byte_count = partial_file.metadata()?.len();

        let head = client
            .head_object()
            .bucket(&object.bucket)
            .key(&object.key)
            .send()
            .await?;
        let total_size = head
            .content_length()
            .ok_or_else(|| Error::MissingSize(object.key.clone()))? as u64;

        if byte_count > 0 && byte_count < total_size {
            let progress = (byte_count as f64 / total_size as f64) * 100.;
            log::info!("resuming {} at {progress:.1}% completion", output.display());
        }

        if byte_count < total_size {
            let range = format!("bytes={}-{}", byte_count, total_size - 1);
            let mut response = client
                .get_object()
                .bucket(&object.bucket)
                .key(&object.key)
                .range(range)
                .send()
                .await?;

            while let Some(bytes) = response.body.try_next().await? {
                let len = bytes.len() as u64;
                partial_file.write_all(&bytes)?;
                byte_count += len;
            }
        }

        if byte_count != total_size {
            return Err(Error::ShortDownload {
                key: object.key.clone(),
                got: byte_count,
                expected: total_size,
            });
        }

        std::fs::rename(&partial, output)?;
        Ok(())
    }

    /// Fallback for assets whose href is a plain HTTP URL rather than an
    /// S3 one. Resumes via a Range request when a partial file exists; a
    /// server that answers the range request with the full body restarts
    /// the transfer from scratch instead of appending it.
    async fn download_http(&self, url: Url, output: &Path) -> Result<()> {
        let partial = partial_path(output);

        let mut partial_file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(&partial)?;
        let mut byte_count = partial_file.metadata()?.len();

        let mut request = self.http.get(url.clone());
        if byte_count > 0 {
            log::info!("resuming {} at byte {byte_count}", output.display());
            request = request.header(reqwest::header::RANGE, format!("bytes={byte_count}-"));
        }

        let response = request.send().await?.error_for_status()?;
        if byte_count > 0 && response.status() != reqwest::StatusCode::PARTIAL_CONTENT {
            log::info!("range not honored, restarting {}", output.display());
            partial_file.set_len(0)?;
            byte_count = 0;
        }
        let expected = response.content_length().map(|length| byte_count + length);

        let mut body = response.bytes_stream();
        while let Some(bytes) = body.try_next().await? {
            partial_file.write_all(&bytes)?;
            byte_count += bytes.len() as u64;
        }

        if let Some(expected) = expected {
            if byte_count != expected {
                return Err(Error::ShortDownload {
                    key: url.to_string(),
                    got: byte_count,
                    expected,
                });
            }
        }

        std::fs::rename(&partial, output)?;
        Ok(())
    }
}

impl SceneCatalog for EarthSearchCatalog {
    async fn query_latest(&self, query: &SceneQuery) -> Result<SceneList> {
        let page = with_retries(&self.retry, || self.search_page(query)).await?;
        let scenes = page
            .features
            .into_iter()
            .map(SearchFeature::into_descriptor)
            .collect();
        Ok(SceneList::new(scenes))
    }

    async fn download_bands(&self, uuid: &str, dest_dir: &Path) -> Result<Vec<PathBuf>> {
        let item = with_retries(&self.retry, || self.fetch_item(uuid)).await?;

        let mut outputs = Vec::with_capacity(BandAsset::ALL.len());
        let mut downloaded = 0usize;
        for band in BandAsset::ALL {
            let output = dest_dir.join(band.file_name(uuid));
            if output.exists() {
                log::info!("band file already present: {}", output.display());
                outputs.push(output);
                continue;
            }

            let asset = item
                .assets
                .get(band.key())
                .ok_or_else(|| Error::MissingAsset {
                    scene: uuid.to_string(),
                    key: band.key().to_string(),
                })?;

            // Pause between transfers so a scene's worth of bands does
            // not hammer the archive.
            if downloaded > 0 && !self.download_delay.is_zero() {
                log::debug!("waiting {}s before next band", self.download_delay.as_secs());
                tokio::time::sleep(self.download_delay).await;
            }

            log::info!("downloading {} asset for {uuid}", band.key());
            self.download_asset(uuid, &asset.href, &output).await?;
            downloaded += 1;
            outputs.push(output);
        }

        Ok(outputs)
    }
}

fn search_body(query: &SceneQuery, limit: usize) -> serde_json::Value {
    serde_json::json!({
        "collections": [query.collection],
        "bbox": [
            query.bounds.west,
            query.bounds.south,
            query.bounds.east,
            query.bounds.north,
        ],
        "datetime": format!("{}T00:00:00Z/{}T23:59:59Z", query.start_date, query.end_date),
        "query": { "eo:cloud_cover": { "lt": query.max_cloud_cover } },
        "sortby": [{ "field": "properties.created", "direction": "desc" }],
        "limit": limit,
    })
}

fn partial_path(output: &Path) -> PathBuf {
    let mut path = output.as_os_str().to_owned();
    path.push(".partial");
    PathBuf::from(path)
}

#[derive(Debug, Deserialize)]
struct SearchPage {
    features: Vec<SearchFeature>,
}

#[derive(Debug, Deserialize)]
struct SearchFeature {
    id: String,
    properties: SearchProperties,
}

#[derive(Debug, Deserialize)]
struct SearchProperties {
    datetime: DateTime<Utc>,
    created: Option<DateTime<Utc>>,
    #[serde(rename = "eo:cloud_cover")]
    cloud_cover: Option<f64>,
}

impl SearchFeature {
    fn into_descriptor(self) -> SceneDescriptor {
        let acquired = self.properties.datetime;
        SceneDescriptor {
            uuid: self.id,
            acquired,
            ingested: self.properties.created.unwrap_or(acquired),
            cloud_cover: self.properties.cloud_cover,
        }
    }
}
