//! Run configuration, read from a TOML file.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use toml;

use crate::error::{Error, Result};
use crate::raster::{Bounds, Compressor};

/// Everything a run needs: directories, catalog filters, the area of
/// interest and the workspace engine settings.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct PipelineConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Marker file name, resolved inside `output_dir`.
    #[serde(default = "default_marker_file")]
    pub marker_file: String,
    /// AWS profile for the download client; unset means anonymous.
    #[serde(default)]
    pub aws_profile: Option<String>,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_max_cloud_cover")]
    pub max_cloud_cover: f64,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// Pause between band downloads, matching the politeness delay the
    /// catalog operator asks for.
    #[serde(default = "default_download_delay_secs")]
    pub download_delay_secs: u64,
    pub bounds: Bounds,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub masking: MaskingSettings,
}

/// Workspace engine knobs, the config-file form of what used to arrive
/// through backend environment variables.
#[derive(Deserialize, Serialize, Clone, Copy, Debug)]
pub struct EngineSettings {
    #[serde(default = "default_true")]
    pub overwrite: bool,
    /// Accepted for config compatibility; the GeoTIFF store writes dense
    /// strips either way.
    #[serde(default = "default_true")]
    pub compress_nulls: bool,
    #[serde(default = "default_compressor")]
    pub compressor: Compressor,
    /// Working cell size in map units.
    #[serde(default = "default_resolution")]
    pub resolution: f64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            overwrite: true,
            compress_nulls: true,
            compressor: Compressor::Deflate,
            resolution: 10.0,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug)]
pub struct MaskingSettings {
    /// Reflectance scale factor handed to the cloud/shadow detector.
    #[serde(default = "default_scale_factor")]
    pub scale_factor: i32,
}

impl Default for MaskingSettings {
    fn default() -> Self {
        Self {
            scale_factor: 10_000,
        }
    }
}

fn default_marker_file() -> String {
    "s2_last_proc_date".to_string()
}

fn default_collection() -> String {
    "sentinel-2-c1-l2a".to_string()
}

fn default_max_cloud_cover() -> f64 {
    30.0
}

fn default_download_delay_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_compressor() -> Compressor {
    Compressor::Deflate
}

fn default_resolution() -> f64 {
    10.0
}

fn default_scale_factor() -> i32 {
    10_000
}

impl PipelineConfig {
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn write<P: AsRef<Path>>(self: &Self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn from_template(table: &toml::Table) -> Self {
        let config: Self = toml::from_str(&table.to_string()).expect("Error serializing template");
        config
    }

    /// Marker file path inside the output directory.
    pub fn marker_path(&self) -> PathBuf {
        self.output_dir.join(&self.marker_file)
    }

    pub fn download_delay(&self) -> Duration {
        Duration::from_secs(self.download_delay_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.bounds.north <= self.bounds.south {
            return Err(Error::Config(format!(
                "bounds north ({}) must exceed south ({})",
                self.bounds.north, self.bounds.south
            )));
        }
        if self.bounds.east <= self.bounds.west {
            return Err(Error::Config(format!(
                "bounds east ({}) must exceed west ({})",
                self.bounds.east, self.bounds.west
            )));
        }
        if self.start_date > self.end_date {
            return Err(Error::Config(format!(
                "start_date {} is after end_date {}",
                self.start_date, self.end_date
            )));
        }
        if !(0.0..=100.0).contains(&self.max_cloud_cover) {
            return Err(Error::Config(format!(
                "max_cloud_cover {} is outside 0..=100",
                self.max_cloud_cover
            )));
        }
        if self.engine.resolution <= 0.0 {
            return Err(Error::Config(format!(
                "engine resolution {} must be positive",
                self.engine.resolution
            )));
        }
        if self.masking.scale_factor <= 0 {
            return Err(Error::Config(format!(
                "masking scale_factor {} must be positive",
                self.masking.scale_factor
            )));
        }
        Ok(())
    }
}

/// Ready-to-edit configuration covering a northern Argentina test area.
pub fn pipeline_config_toml() -> toml::Table {
    toml::toml! {
        input_dir = "./inputs"
        output_dir = "./outputs"
        marker_file = "s2_last_proc_date"

        collection = "sentinel-2-c1-l2a"
        max_cloud_cover = 30.0
        start_date = "2023-01-01"
        end_date = "2023-01-31"
        download_delay_secs = 30

        [bounds]
        north = -22.45
        south = -22.62
        east = -63.72
        west = -63.90

        [engine]
        overwrite = true
        compress_nulls = true
        compressor = "deflate"
        resolution = 10.0

        [masking]
        scale_factor = 10000
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_template() {
        let config = PipelineConfig::from_template(&pipeline_config_toml());
        assert_eq!(config.collection, "sentinel-2-c1-l2a");
        assert_eq!(config.marker_file, "s2_last_proc_date");
        assert_eq!(config.engine.compressor, Compressor::Deflate);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_write_and_read_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sen2-prep.toml");

        let config = PipelineConfig::from_template(&pipeline_config_toml());
        config.write(&path).unwrap();

        let config = PipelineConfig::read(&path).unwrap();
        assert_eq!(config.max_cloud_cover, 30.0);
        assert_eq!(config.download_delay_secs, 30);
        assert_eq!(config.masking.scale_factor, 10_000);
    }

    #[test]
    fn test_defaults_fill_omitted_sections() {
        let minimal = r#"
            input_dir = "./in"
            output_dir = "./out"
            start_date = "2023-01-01"
            end_date = "2023-01-31"

            [bounds]
            north = 1.0
            south = 0.0
            east = 1.0
            west = 0.0
        "#;
        let config: PipelineConfig = toml::from_str(minimal).unwrap();
        assert_eq!(config.collection, "sentinel-2-c1-l2a");
        assert!(config.engine.overwrite);
        assert_eq!(config.engine.resolution, 10.0);
        assert!(config.aws_profile.is_none());
        assert_eq!(config.marker_path(), PathBuf::from("./out/s2_last_proc_date"));
    }

    #[test]
    fn test_swapped_bounds_rejected() {
        let mut config = PipelineConfig::from_template(&pipeline_config_toml());
        config.bounds.north = -23.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reversed_dates_rejected() {
        let mut config = PipelineConfig::from_template(&pipeline_config_toml());
        config.start_date = "2023-03-01".parse().unwrap();
        assert!(config.validate().is_err());
    }
}
