use std::path::PathBuf;
use thiserror::Error;

use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_smithy_runtime_api::client::result::SdkError;
use aws_smithy_runtime_api::http::Response;

pub type Result<T> = std::result::Result<T, Error>;

/// Error type shared across the pipeline, the catalog client and the
/// workspace engine.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("config write error: {0}")]
    TomlWrite(#[from] toml::ser::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("marker file holds {0:?}, expected a YYYY-MM-DD date")]
    MalformedMarker(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("S3 head object error: {0}")]
    S3Head(#[from] SdkError<HeadObjectError, Response>),

    #[error("S3 get object error: {0}")]
    S3Get(#[from] SdkError<GetObjectError, Response>),

    #[error("byte stream error: {0}")]
    ByteStream(#[from] aws_smithy_types::byte_stream::error::Error),

    #[error("scene {scene} has no asset {key:?}")]
    MissingAsset { scene: String, key: String },

    #[error("unusable asset href for scene {scene}: {href}")]
    AssetHref { scene: String, href: String },

    #[error("no content length reported for {0}")]
    MissingSize(String),

    #[error("incomplete download of {key}: {got} of {expected} bytes")]
    ShortDownload { key: String, got: u64, expected: u64 },

    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("unsupported sample format in {0}")]
    UnsupportedSamples(PathBuf),

    #[error("no georeferencing tags in {0}")]
    MissingGeoreferencing(PathBuf),

    #[error("grid size mismatch: expected ({er}, {ec}), got ({ar}, {ac})")]
    SizeMismatch { er: usize, ec: usize, ar: usize, ac: usize },

    #[error("layer {0:?} already exists and overwrite is disabled")]
    LayerExists(String),

    #[error("no such layer: {0:?}")]
    NoSuchLayer(String),

    #[error("no region set; import a band before raster operations")]
    NoRegion,

    #[error("no band rasters matched in {0}")]
    NoBands(PathBuf),

    #[error("output {0:?} already exists and overwrite is disabled")]
    OutputExists(PathBuf),

    #[error("workspace is locked by another session: {0:?}")]
    WorkspaceLocked(PathBuf),
}

impl Error {
    /// Whether a fresh attempt has a chance of succeeding. Protocol and
    /// local errors are final.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(e) => {
                if e.is_timeout() || e.is_connect() {
                    return true;
                }
                match e.status() {
                    Some(status) => status.is_server_error() || status.as_u16() == 429,
                    None => false,
                }
            }
            Error::S3Head(e) => sdk_error_is_transient(e),
            Error::S3Get(e) => sdk_error_is_transient(e),
            Error::ByteStream(_) => true,
            // The partial file survives, so a retry resumes the transfer.
            Error::ShortDownload { .. } => true,
            _ => false,
        }
    }
}

fn sdk_error_is_transient<E>(error: &SdkError<E, Response>) -> bool {
    match error {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => true,
        SdkError::ResponseError(_) => true,
        SdkError::ServiceError(context) => {
            let status = context.raw().status().as_u16();
            status >= 500 || status == 429
        }
        _ => false,
    }
}
