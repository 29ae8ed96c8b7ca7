//! Spectral index computation over scaled surface reflectance.
//!
//! Band values are reflectance scaled by 10000. Outputs carry the same
//! scaling, so results land in [-10000, 10000].

use crate::error::{Error, Result};
use crate::raster::{is_null, Grid, Region, NULL};

/// Reflectance scale factor; values above it are saturated.
const SCALE: i32 = 10_000;

/// Scaled normalized difference `round(10000 * (a - b) / (a + b))`.
///
/// Per cell:
/// - both inputs above [`SCALE`]: fixed output of 10000
/// - both inputs at or below [`SCALE`]: the scaled ratio, rounded half
///   away from zero; null when the denominator is zero
/// - one saturated, one not: null
/// - null in either input: null
pub fn scaled_normalized_difference(band_a: &Grid, band_b: &Grid) -> Result<Grid> {
    check_dimensions(band_a, band_b)?;

    let (rows, cols) = band_a.shape();
    let mut out = Grid::filled(&Region::of(band_a), NULL);

    for row in 0..rows {
        for col in 0..cols {
            let a = band_a.get(row, col);
            let b = band_b.get(row, col);
            if is_null(a) || is_null(b) {
                continue;
            }

            if a > SCALE && b > SCALE {
                out.set(row, col, SCALE);
            } else if a <= SCALE && b <= SCALE {
                let sum = a + b;
                if sum == 0 {
                    continue;
                }
                let ratio = f64::from(a - b) / f64::from(sum);
                out.set(row, col, (ratio * f64::from(SCALE)).round() as i32);
            }
        }
    }
    Ok(out)
}

/// Normalized Difference Vegetation Index from NIR and red.
pub fn ndvi(nir: &Grid, red: &Grid) -> Result<Grid> {
    scaled_normalized_difference(nir, red)
}

/// Normalized Difference Water Index from NIR and green.
pub fn ndwi(nir: &Grid, green: &Grid) -> Result<Grid> {
    scaled_normalized_difference(nir, green)
}

fn check_dimensions(band_a: &Grid, band_b: &Grid) -> Result<()> {
    if band_a.shape() != band_b.shape() {
        let (er, ec) = band_a.shape();
        let (ar, ac) = band_b.shape();
        return Err(Error::SizeMismatch { er, ec, ar, ac });
    }
    Ok(())
}
