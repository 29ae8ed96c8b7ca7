//! Threshold-based cloud and shadow detection over the seven imported
//! bands. Produces footprint layers: cells inside a detected feature
//! hold 1, all other cells are null. A layer with no detected cells is
//! not produced at all, which is what drives the mask-count branching
//! downstream.

use crate::error::{Error, Result};
use crate::raster::{is_null, Grid, Region, NULL};

/// The seven reflectance bands the detector reads, all on one region.
pub struct BandStack<'a> {
    pub blue: &'a Grid,
    pub green: &'a Grid,
    pub red: &'a Grid,
    pub nir: &'a Grid,
    pub nir8a: &'a Grid,
    pub swir16: &'a Grid,
    pub swir22: &'a Grid,
}

/// Detected mask layers; absent when no cell matched.
pub struct MaskLayers {
    pub cloud: Option<Grid>,
    pub shadow: Option<Grid>,
}

// Rule thresholds as fractions of the reflectance scale factor. Clouds
// are bright across the visible bands and still reflective in SWIR,
// which keeps snow out. Shadows are dark in both NIR bands and SWIR.
const CLOUD_BLUE_MIN: f64 = 0.18;
const CLOUD_GREEN_MIN: f64 = 0.15;
const CLOUD_RED_MIN: f64 = 0.15;
const CLOUD_SWIR16_MIN: f64 = 0.11;

const SHADOW_NIR_MAX: f64 = 0.12;
const SHADOW_NIR8A_MAX: f64 = 0.12;
const SHADOW_SWIR22_MAX: f64 = 0.10;
const SHADOW_BLUE_MAX: f64 = 0.15;

/// Classify every cell of the stack. `scale_factor` converts the rule
/// fractions to scaled reflectance, matching the band encoding.
pub fn detect(bands: &BandStack, scale_factor: i32) -> Result<MaskLayers> {
    let (rows, cols) = bands.blue.shape();
    for band in [
        bands.green,
        bands.red,
        bands.nir,
        bands.nir8a,
        bands.swir16,
        bands.swir22,
    ] {
        if band.shape() != (rows, cols) {
            let (ar, ac) = band.shape();
            return Err(Error::SizeMismatch { er: rows, ec: cols, ar, ac });
        }
    }

    let t = |frac: f64| (frac * f64::from(scale_factor)).round() as i32;
    let cloud_blue = t(CLOUD_BLUE_MIN);
    let cloud_green = t(CLOUD_GREEN_MIN);
    let cloud_red = t(CLOUD_RED_MIN);
    let cloud_swir16 = t(CLOUD_SWIR16_MIN);
    let shadow_nir = t(SHADOW_NIR_MAX);
    let shadow_nir8a = t(SHADOW_NIR8A_MAX);
    let shadow_swir22 = t(SHADOW_SWIR22_MAX);
    let shadow_blue = t(SHADOW_BLUE_MAX);

    let region = Region::of(bands.blue);
    let mut cloud = Grid::filled(&region, NULL);
    let mut shadow = Grid::filled(&region, NULL);
    let mut cloud_cells = 0usize;
    let mut shadow_cells = 0usize;

    for row in 0..rows {
        for col in 0..cols {
            let blue = bands.blue.get(row, col);
            let green = bands.green.get(row, col);
            let red = bands.red.get(row, col);
            let nir = bands.nir.get(row, col);
            let nir8a = bands.nir8a.get(row, col);
            let swir16 = bands.swir16.get(row, col);
            let swir22 = bands.swir22.get(row, col);

            if [blue, green, red, nir, nir8a, swir16, swir22]
                .iter()
                .any(|v| is_null(*v))
            {
                continue;
            }

            if blue > cloud_blue && green > cloud_green && red > cloud_red && swir16 > cloud_swir16
            {
                cloud.set(row, col, 1);
                cloud_cells += 1;
            }

            if nir < shadow_nir
                && nir8a < shadow_nir8a
                && swir22 < shadow_swir22
                && blue < shadow_blue
            {
                shadow.set(row, col, 1);
                shadow_cells += 1;
            }
        }
    }

    Ok(MaskLayers {
        cloud: (cloud_cells > 0).then_some(cloud),
        shadow: (shadow_cells > 0).then_some(shadow),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::Bounds;
    use ndarray::Array2;

    const SF: i32 = 10_000;

    fn uniform(value: i32) -> Grid {
        let bounds = Bounds {
            north: 20.0,
            south: 0.0,
            east: 20.0,
            west: 0.0,
        };
        Grid::from_array(Array2::from_elem((2, 2), value), bounds)
    }

    struct Owned {
        blue: Grid,
        green: Grid,
        red: Grid,
        nir: Grid,
        nir8a: Grid,
        swir16: Grid,
        swir22: Grid,
    }

    impl Owned {
        fn stack(&self) -> BandStack {
            BandStack {
                blue: &self.blue,
                green: &self.green,
                red: &self.red,
                nir: &self.nir,
                nir8a: &self.nir8a,
                swir16: &self.swir16,
                swir22: &self.swir22,
            }
        }
    }

    fn vegetated() -> Owned {
        Owned {
            blue: uniform(400),
            green: uniform(600),
            red: uniform(500),
            nir: uniform(3000),
            nir8a: uniform(3200),
            swir16: uniform(1500),
            swir22: uniform(800),
        }
    }

    #[test]
    fn test_clear_scene_produces_no_layers() {
        let bands = vegetated();
        let masks = detect(&bands.stack(), SF).unwrap();
        assert!(masks.cloud.is_none());
        assert!(masks.shadow.is_none());
    }

    #[test]
    fn test_bright_swir_reflective_cells_are_cloud() {
        let mut bands = vegetated();
        bands.blue = uniform(2500);
        bands.green = uniform(2400);
        bands.red = uniform(2300);
        bands.swir16 = uniform(1500);

        let masks = detect(&bands.stack(), SF).unwrap();
        let cloud = masks.cloud.unwrap();
        assert_eq!(cloud.get(0, 0), 1);
        assert_eq!(cloud.count_non_null(), 4);
        assert!(masks.shadow.is_none());
    }

    #[test]
    fn test_dark_cells_are_shadow() {
        let mut bands = vegetated();
        bands.nir = uniform(700);
        bands.nir8a = uniform(650);
        bands.swir22 = uniform(400);
        bands.blue = uniform(600);

        let masks = detect(&bands.stack(), SF).unwrap();
        assert!(masks.cloud.is_none());
        let shadow = masks.shadow.unwrap();
        assert_eq!(shadow.count_non_null(), 4);
    }

    #[test]
    fn test_null_cells_are_not_classified() {
        let mut bands = vegetated();
        bands.nir = uniform(700);
        bands.nir8a = uniform(650);
        bands.swir22 = uniform(400);
        bands.blue = uniform(600);
        bands.red.set(0, 0, NULL);

        let masks = detect(&bands.stack(), SF).unwrap();
        let shadow = masks.shadow.unwrap();
        assert!(is_null(shadow.get(0, 0)));
        assert_eq!(shadow.count_non_null(), 3);
    }

    #[test]
    fn test_scale_factor_scales_thresholds() {
        // Same reflectances at 1/10 the scale factor still classify.
        let mut bands = vegetated();
        for band in [
            &mut bands.blue,
            &mut bands.green,
            &mut bands.red,
            &mut bands.nir,
            &mut bands.nir8a,
            &mut bands.swir16,
            &mut bands.swir22,
        ] {
            *band = uniform(250);
        }
        bands.nir = uniform(50);
        bands.nir8a = uniform(50);
        bands.swir22 = uniform(40);
        bands.blue = uniform(60);

        let masks = detect(&bands.stack(), 1000).unwrap();
        assert!(masks.shadow.is_some());
    }
}
