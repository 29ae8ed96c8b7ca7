//! The working geospatial dataset: a locked session over named raster
//! and vector layers with a shared computational region.
//!
//! Raster reads resolve on the region by nearest neighbor and honor the
//! exclusion mask while one is set, so band math downstream never sees
//! mixed grids. Vector layers are cell footprints on the same extent.

use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::config::EngineSettings;
use crate::error::{Error, Result};
use crate::raster::{self, is_null, Compressor, Grid, Region, NULL};

/// Name of the raster the active exclusion mask registers under. The
/// cleanup step discovers it with a `*MASK*` listing.
pub const MASK_LAYER: &str = "MASK";

const LOCK_FILE: &str = ".sen2prep.lock";

pub struct Workspace {
    root: PathBuf,
    settings: EngineSettings,
    region: Option<Region>,
    rasters: HashMap<String, Grid>,
    vectors: HashMap<String, Grid>,
}

impl Workspace {
    /// Open a session over `root`, creating the directory as needed.
    /// Holds a lock file until dropped; a second open fails.
    pub fn open<P: AsRef<Path>>(root: P, settings: EngineSettings) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let lock_path = root.join(LOCK_FILE);
        let mut lock = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(Error::WorkspaceLocked(lock_path));
            }
            Err(e) => return Err(e.into()),
        };
        write!(lock, "{}", std::process::id())?;

        Ok(Self {
            root,
            settings,
            region: None,
            rasters: HashMap::new(),
            vectors: HashMap::new(),
        })
    }

    pub fn region(&self) -> Option<Region> {
        self.region
    }

    /// Snap the region to a registered raster's native grid.
    pub fn snap_region_to(&mut self, name: &str) -> Result<()> {
        let grid = self
            .rasters
            .get(name)
            .ok_or_else(|| Error::NoSuchLayer(name.to_string()))?;
        self.region = Some(Region::of(grid));
        Ok(())
    }

    /// Import every GeoTIFF in `dir` whose file stem matches `pattern`,
    /// registering each under its stem. The first import pins the region
    /// to that band's extent at the engine resolution.
    pub fn import_bands(&mut self, dir: &Path, pattern: &Regex) -> Result<Vec<String>> {
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("tif") | Some("tiff")
                )
            })
            .filter(|path| {
                path.file_stem()
                    .and_then(|s| s.to_str())
                    .is_some_and(|stem| pattern.is_match(stem))
            })
            .collect();
        paths.sort();

        let mut imported = Vec::with_capacity(paths.len());
        for path in paths {
            let grid = raster::read_geotiff(&path)?;
            if self.region.is_none() {
                self.region = Some(Region::new(grid.bounds(), self.settings.resolution));
            }
            let name = match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) => stem.to_string(),
                None => continue,
            };
            log::info!("imported band {name}");
            self.register_raster(&name, grid)?;
            imported.push(name);
        }
        Ok(imported)
    }

    pub fn register_raster(&mut self, name: &str, grid: Grid) -> Result<()> {
        if self.rasters.contains_key(name) && !self.settings.overwrite {
            return Err(Error::LayerExists(name.to_string()));
        }
        self.rasters.insert(name.to_string(), grid);
        Ok(())
    }

    pub fn register_vector(&mut self, name: &str, footprint: Grid) -> Result<()> {
        if self.vectors.contains_key(name) && !self.settings.overwrite {
            return Err(Error::LayerExists(name.to_string()));
        }
        self.vectors.insert(name.to_string(), footprint);
        Ok(())
    }

    /// Read a raster on the region. While an exclusion mask is set,
    /// cells it blanks come back null.
    pub fn read_raster(&self, name: &str) -> Result<Grid> {
        let grid = self
            .rasters
            .get(name)
            .ok_or_else(|| Error::NoSuchLayer(name.to_string()))?;
        let region = self.region.ok_or(Error::NoRegion)?;

        let mut sampled = grid.sample_on(&region);
        if name != MASK_LAYER {
            if let Some(mask) = self.rasters.get(MASK_LAYER) {
                // The mask may predate a region change; align it too.
                let mask = mask.sample_on(&region);
                let (rows, cols) = sampled.shape();
                for row in 0..rows {
                    for col in 0..cols {
                        if is_null(mask.get(row, col)) {
                            sampled.set(row, col, NULL);
                        }
                    }
                }
            }
        }
        Ok(sampled)
    }

    pub fn read_vector(&self, name: &str) -> Result<Grid> {
        let footprint = self
            .vectors
            .get(name)
            .ok_or_else(|| Error::NoSuchLayer(name.to_string()))?;
        let region = self.region.ok_or(Error::NoRegion)?;
        Ok(footprint.sample_on(&region))
    }

    pub fn list_rasters(&self, pattern: &str, exclude: Option<&str>) -> Vec<String> {
        list_names(self.rasters.keys(), pattern, exclude)
    }

    pub fn list_vectors(&self, pattern: &str, exclude: Option<&str>) -> Vec<String> {
        list_names(self.vectors.keys(), pattern, exclude)
    }

    /// Union of vector footprints, registered as a new vector layer.
    pub fn patch_vectors(&mut self, names: &[String], output: &str) -> Result<()> {
        let region = self.region.ok_or(Error::NoRegion)?;
        let mut combined = Grid::filled(&region, NULL);
        for name in names {
            let footprint = self.read_vector(name)?;
            for row in 0..region.rows {
                for col in 0..region.cols {
                    if !is_null(footprint.get(row, col)) {
                        combined.set(row, col, 1);
                    }
                }
            }
        }
        self.register_vector(output, combined)
    }

    /// Register the exclusion mask from a vector layer: cells inside the
    /// footprint are blanked out of subsequent raster reads.
    pub fn set_exclusion_mask(&mut self, vector: &str) -> Result<()> {
        let footprint = self.read_vector(vector)?;
        let region = self.region.ok_or(Error::NoRegion)?;

        let mut mask = Grid::filled(&region, 1);
        for row in 0..region.rows {
            for col in 0..region.cols {
                if !is_null(footprint.get(row, col)) {
                    mask.set(row, col, NULL);
                }
            }
        }
        self.register_raster(MASK_LAYER, mask)
    }

    /// Drop the active exclusion mask.
    pub fn remove_mask(&mut self) -> Result<()> {
        self.rasters
            .remove(MASK_LAYER)
            .map(|_| ())
            .ok_or_else(|| Error::NoSuchLayer(MASK_LAYER.to_string()))
    }

    /// Export a registered raster as GeoTIFF at its own extent. The
    /// overwrite setting guards existing files.
    pub fn export_raster(&self, name: &str, path: &Path, compressor: Compressor) -> Result<()> {
        let grid = self
            .rasters
            .get(name)
            .ok_or_else(|| Error::NoSuchLayer(name.to_string()))?;
        if path.exists() && !self.settings.overwrite {
            return Err(Error::OutputExists(path.to_path_buf()));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        raster::write_geotiff(path, grid, compressor)
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        let _ = fs::remove_file(self.root.join(LOCK_FILE));
    }
}

fn list_names<'a, I>(names: I, pattern: &str, exclude: Option<&str>) -> Vec<String>
where
    I: Iterator<Item = &'a String>,
{
    let include = glob_to_regex(pattern);
    let exclude = exclude.map(glob_to_regex);

    let mut matched: Vec<String> = names
        .filter(|name| include.is_match(name))
        .filter(|name| exclude.as_ref().is_none_or(|re| !re.is_match(name)))
        .cloned()
        .collect();
    matched.sort();
    matched
}

fn glob_to_regex(pattern: &str) -> Regex {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c if r"\.+()[]{}^$|".contains(c) => {
                re.push('\\');
                re.push(c);
            }
            c => re.push(c),
        }
    }
    re.push('$');
    Regex::new(&re).expect("Glob pattern should always compile")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::Bounds;
    use ndarray::Array2;
    use tempfile::TempDir;

    fn settings() -> EngineSettings {
        EngineSettings {
            resolution: 10.0,
            ..EngineSettings::default()
        }
    }

    fn bounds() -> Bounds {
        Bounds {
            north: 40.0,
            south: 0.0,
            east: 40.0,
            west: 0.0,
        }
    }

    fn band(value: i32) -> Grid {
        Grid::from_array(Array2::from_elem((4, 4), value), bounds())
    }

    fn footprint(cells: &[(usize, usize)]) -> Grid {
        let mut grid = Grid::from_array(Array2::from_elem((4, 4), NULL), bounds());
        for &(row, col) in cells {
            grid.set(row, col, 1);
        }
        grid
    }

    fn open_with_band(dir: &TempDir) -> Workspace {
        let mut ws = Workspace::open(dir.path().join("ws"), settings()).unwrap();
        ws.region = Some(Region::new(bounds(), 10.0));
        ws
    }

    #[test]
    fn test_lock_blocks_second_session() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("ws");

        let first = Workspace::open(&root, settings()).unwrap();
        match Workspace::open(&root, settings()) {
            Err(Error::WorkspaceLocked(_)) => {}
            other => panic!("expected WorkspaceLocked, got {:?}", other.map(|_| ())),
        }

        drop(first);
        assert!(Workspace::open(&root, settings()).is_ok());
    }

    #[test]
    fn test_import_sets_region_and_registers_by_stem() {
        let dir = TempDir::new().unwrap();
        let inputs = dir.path().join("inputs");
        fs::create_dir_all(&inputs).unwrap();

        raster::write_geotiff(
            &inputs.join("S2B_20HMG_20230115_B02_10m.tif"),
            &band(400),
            Compressor::None,
        )
        .unwrap();
        raster::write_geotiff(
            &inputs.join("S2B_20HMG_20230115_B02_10m_double.tif"),
            &band(999),
            Compressor::None,
        )
        .unwrap();
        raster::write_geotiff(&inputs.join("notes.tif"), &band(1), Compressor::None).unwrap();

        let mut ws = Workspace::open(dir.path().join("ws"), settings()).unwrap();
        let pattern = Regex::new(r"B02_10m$").unwrap();
        let imported = ws.import_bands(&inputs, &pattern).unwrap();

        assert_eq!(imported, vec!["S2B_20HMG_20230115_B02_10m".to_string()]);
        let region = ws.region().unwrap();
        assert_eq!((region.rows, region.cols), (4, 4));

        let listed = ws.list_rasters("*B02_1*", Some("*_double*"));
        assert_eq!(listed, imported);
    }

    #[test]
    fn test_overwrite_guard_on_registration() {
        let dir = TempDir::new().unwrap();
        let mut ws = open_with_band(&dir);
        ws.register_raster("layer", band(1)).unwrap();
        ws.register_raster("layer", band(2)).unwrap();

        let mut strict = Workspace::open(dir.path().join("strict"), EngineSettings {
            overwrite: false,
            ..settings()
        })
        .unwrap();
        strict.register_raster("layer", band(1)).unwrap();
        assert!(matches!(
            strict.register_raster("layer", band(2)),
            Err(Error::LayerExists(_))
        ));
    }

    #[test]
    fn test_exclusion_mask_blanks_footprint_cells() {
        let dir = TempDir::new().unwrap();
        let mut ws = open_with_band(&dir);
        ws.register_raster("red", band(500)).unwrap();
        ws.register_vector("cloud_mask", footprint(&[(0, 0), (1, 2)]))
            .unwrap();

        ws.set_exclusion_mask("cloud_mask").unwrap();
        let red = ws.read_raster("red").unwrap();
        assert!(is_null(red.get(0, 0)));
        assert!(is_null(red.get(1, 2)));
        assert_eq!(red.get(3, 3), 500);
        assert_eq!(red.count_non_null(), 14);

        ws.remove_mask().unwrap();
        let red = ws.read_raster("red").unwrap();
        assert_eq!(red.count_non_null(), 16);
    }

    #[test]
    fn test_mask_set_before_region_snap_still_applies() {
        let dir = TempDir::new().unwrap();
        let mut ws = Workspace::open(dir.path().join("ws"), settings()).unwrap();
        ws.region = Some(Region::new(bounds(), 20.0));

        ws.register_raster("red", band(500)).unwrap();
        let mut coarse = Grid::from_array(Array2::from_elem((2, 2), NULL), bounds());
        coarse.set(0, 0, 1);
        ws.register_vector("cloud_mask", coarse).unwrap();
        ws.set_exclusion_mask("cloud_mask").unwrap();

        // Snapping to the 10m band quadruples the region; the mask built
        // on the 20m region must follow it.
        ws.snap_region_to("red").unwrap();
        let red = ws.read_raster("red").unwrap();
        assert_eq!(red.shape(), (4, 4));
        assert!(is_null(red.get(0, 0)));
        assert!(is_null(red.get(1, 1)));
        assert_eq!(red.get(0, 2), 500);
        assert_eq!(red.count_non_null(), 12);
    }

    #[test]
    fn test_remove_mask_twice_errors() {
        let dir = TempDir::new().unwrap();
        let mut ws = open_with_band(&dir);
        ws.register_vector("shadow_mask", footprint(&[(2, 2)]))
            .unwrap();
        ws.set_exclusion_mask("shadow_mask").unwrap();

        ws.remove_mask().unwrap();
        assert!(matches!(ws.remove_mask(), Err(Error::NoSuchLayer(_))));
    }

    #[test]
    fn test_patch_unions_footprints() {
        let dir = TempDir::new().unwrap();
        let mut ws = open_with_band(&dir);
        ws.register_vector("cloud_mask", footprint(&[(0, 0), (0, 1)]))
            .unwrap();
        ws.register_vector("shadow_mask", footprint(&[(0, 1), (3, 3)]))
            .unwrap();

        ws.patch_vectors(
            &["cloud_mask".to_string(), "shadow_mask".to_string()],
            "s2_mask",
        )
        .unwrap();

        let patched = ws.read_vector("s2_mask").unwrap();
        assert_eq!(patched.count_non_null(), 3);

        let masks = ws.list_vectors("*_mask", Some("s2*"));
        assert_eq!(masks, vec!["cloud_mask".to_string(), "shadow_mask".to_string()]);
    }

    #[test]
    fn test_export_respects_overwrite_guard() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("out").join("s2_ndvi.tif");

        let mut ws = Workspace::open(dir.path().join("strict"), EngineSettings {
            overwrite: false,
            ..settings()
        })
        .unwrap();
        ws.region = Some(Region::new(bounds(), 10.0));
        ws.register_raster("s2_ndvi", band(3000)).unwrap();

        ws.export_raster("s2_ndvi", &target, Compressor::Deflate).unwrap();
        assert!(target.exists());
        assert!(matches!(
            ws.export_raster("s2_ndvi", &target, Compressor::Deflate),
            Err(Error::OutputExists(_))
        ));
    }

    #[test]
    fn test_twenty_meter_band_resamples_to_region() {
        let dir = TempDir::new().unwrap();
        let mut ws = open_with_band(&dir);

        // 20m band over the same extent: half the rows and columns.
        let coarse = Grid::from_array(Array2::from_elem((2, 2), 800), bounds());
        ws.register_raster("swir16", coarse).unwrap();

        let read = ws.read_raster("swir16").unwrap();
        assert_eq!(read.shape(), (4, 4));
        assert_eq!(read.get(3, 3), 800);
    }
}
