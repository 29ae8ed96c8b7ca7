//! The end-to-end run: query the catalog, decide whether the newest
//! scene is new, download, import, mask, compute indices, export.
//!
//! Steps after the decision run on every pass, so a skipped download
//! still recomputes the indices from the band files already on disk.

use regex::Regex;
use std::fs;
use std::path::PathBuf;

use crate::catalog::{Candidate, SceneCatalog, SceneQuery};
use crate::cloudmask::{self, BandStack};
use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::indices;
use crate::marker::{self, Decision, SceneMarker};
use crate::workspace::Workspace;

/// Import filter for the seven band rasters: 10 m visible/NIR plus the
/// 20 m narrow NIR and SWIR products.
const BAND_IMPORT_PATTERN: &str = r"B(02_1|03_1|04_1|08_1|8A_2|11_2|12_2)0m";

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The query matched nothing inside the search window.
    NoScenes,
    /// Fresh band files were downloaded and processed.
    Processed,
    /// The marker said nothing new; indices recomputed from the files
    /// already on disk.
    Skipped,
}

/// What a finished run did.
#[derive(Debug)]
pub struct RunSummary {
    pub outcome: Outcome,
    pub candidate: Option<Candidate>,
    pub masks_detected: usize,
    pub exports: Vec<PathBuf>,
}

pub async fn run<C: SceneCatalog>(config: &PipelineConfig, catalog: &C) -> Result<RunSummary> {
    config.validate()?;
    bootstrap_directories(config)?;

    let mut ws = Workspace::open(&config.output_dir, config.engine)?;
    log::debug!(
        "engine settings: overwrite={}, compress_nulls={}, compressor={:?}, resolution={}",
        config.engine.overwrite,
        config.engine.compress_nulls,
        config.engine.compressor,
        config.engine.resolution
    );

    let query = SceneQuery {
        collection: config.collection.clone(),
        bounds: config.bounds,
        start_date: config.start_date,
        end_date: config.end_date,
        max_cloud_cover: config.max_cloud_cover,
    };
    let scenes = catalog.query_latest(&query).await?;
    let Some(candidate) = scenes.candidate() else {
        log::info!("no scenes match the search window, nothing to process");
        return Ok(RunSummary {
            outcome: Outcome::NoScenes,
            candidate: None,
            masks_detected: 0,
            exports: vec![],
        });
    };
    log::info!(
        "newest scene {} acquired {} ({} result(s))",
        candidate.uuid,
        candidate.date,
        candidate.matches
    );

    let outcome = match marker::evaluate(&SceneMarker::new(config.marker_path()), &candidate)? {
        Decision::Download => {
            log::info!(
                "proceeding to download and process scene data for date {}",
                candidate.date
            );
            catalog
                .download_bands(&candidate.uuid, &config.input_dir)
                .await?;
            Outcome::Processed
        }
        Decision::Skip => {
            log::info!("no new scene to process");
            Outcome::Skipped
        }
    };

    log::info!("importing bands into the workspace");
    let pattern = Regex::new(BAND_IMPORT_PATTERN).expect("Regex pattern should always compile");
    let imported = ws.import_bands(&config.input_dir, &pattern)?;
    if imported.is_empty() {
        return Err(Error::NoBands(config.input_dir.clone()));
    }

    let blue = bind_band(&ws, "*B02_1*")?;
    let green = bind_band(&ws, "*B03_1*")?;
    let red = bind_band(&ws, "*B04_1*")?;
    let nir = bind_band(&ws, "*B08_1*")?;
    let nir8a = bind_band(&ws, "*B8A_2*")?;
    let swir16 = bind_band(&ws, "*B11_2*")?;
    let swir22 = bind_band(&ws, "*B12_2*")?;

    ws.snap_region_to(&blue)?;

    log::info!("starting cloud and cloud shadow detection");
    let blue_grid = ws.read_raster(&blue)?;
    let green_grid = ws.read_raster(&green)?;
    let red_grid = ws.read_raster(&red)?;
    let nir_grid = ws.read_raster(&nir)?;
    let nir8a_grid = ws.read_raster(&nir8a)?;
    let swir16_grid = ws.read_raster(&swir16)?;
    let swir22_grid = ws.read_raster(&swir22)?;
    let layers = cloudmask::detect(
        &BandStack {
            blue: &blue_grid,
            green: &green_grid,
            red: &red_grid,
            nir: &nir_grid,
            nir8a: &nir8a_grid,
            swir16: &swir16_grid,
            swir22: &swir22_grid,
        },
        config.masking.scale_factor,
    )?;
    if let Some(cloud) = layers.cloud {
        ws.register_vector("cloud_mask", cloud)?;
    }
    if let Some(shadow) = layers.shadow {
        ws.register_vector("shadow_mask", shadow)?;
    }

    let masks = ws.list_vectors("*_mask", Some("s2*"));
    match masks.len() {
        0 => log::info!("no clouds or shadows detected, no mask to be set"),
        1 => {
            log::info!("only {} detected, using it as mask", masks[0]);
            ws.set_exclusion_mask(&masks[0])?;
        }
        _ => {
            log::info!(
                "both {} and {} detected, patching and setting mask",
                masks[0],
                masks[1]
            );
            ws.patch_vectors(&masks, "s2_mask")?;
            ws.set_exclusion_mask("s2_mask")?;
        }
    }

    // Re-read the index inputs so the exclusion mask, if any, applies.
    log::info!("estimating NDVI and NDWI");
    let nir_grid = ws.read_raster(&nir)?;
    let red_grid = ws.read_raster(&red)?;
    let green_grid = ws.read_raster(&green)?;
    ws.register_raster("s2_ndvi", indices::ndvi(&nir_grid, &red_grid)?)?;
    ws.register_raster("s2_ndwi", indices::ndwi(&nir_grid, &green_grid)?)?;

    let mut exports = Vec::with_capacity(2);
    for name in ["s2_ndvi", "s2_ndwi"] {
        let path = config.output_dir.join(format!("{name}.tif"));
        ws.export_raster(name, &path, config.engine.compressor)?;
        log::info!("exported {}", path.display());
        exports.push(path);
    }

    if ws.list_rasters("*MASK*", None).is_empty() {
        log::info!("no mask set, nothing to do");
    } else {
        log::info!("removing active mask");
        ws.remove_mask()?;
    }

    log::info!("closing workspace session");
    Ok(RunSummary {
        outcome,
        candidate: Some(candidate),
        masks_detected: masks.len(),
        exports,
    })
}

fn bootstrap_directories(config: &PipelineConfig) -> Result<()> {
    for dir in [&config.input_dir, &config.output_dir] {
        if dir.exists() {
            log::info!("directory {} already exists", dir.display());
        } else {
            fs::create_dir_all(dir)?;
            log::info!("directory {} created", dir.display());
        }
    }
    Ok(())
}

/// First imported raster matching the band glob. Archives sometimes
/// carry `_double` twins of a band, which the listing excludes.
fn bind_band(workspace: &Workspace, glob: &str) -> Result<String> {
    workspace
        .list_rasters(glob, Some("*_double"))
        .into_iter()
        .next()
        .ok_or_else(|| Error::NoSuchLayer(glob.to_string()))
}
