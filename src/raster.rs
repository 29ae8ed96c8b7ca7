//! In-memory raster grids and GeoTIFF I/O.

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::{colortype, Compression as TiffCompression, DeflateLevel, TiffEncoder};
use tiff::tags::Tag;

use crate::error::{Error, Result};

/// Cell value marking the absence of data. Cells become null outside the
/// source coverage of a resampled read, under an exclusion mask, or where
/// an index formula has no defined value.
pub const NULL: i32 = i32::MIN;

/// Nodata sentinel written into exported GeoTIFFs in place of [`NULL`].
pub const EXPORT_NODATA: i16 = -32768;

pub fn is_null(value: i32) -> bool {
    value == NULL
}

/// Geographic extent in map units, edges aligned with the grid.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Bounds {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

impl Bounds {
    pub fn width(&self) -> f64 {
        self.east - self.west
    }

    pub fn height(&self) -> f64 {
        self.north - self.south
    }
}

/// Computational region: the extent and cell layout every raster
/// operation aligns to, in the manner of a mapset region.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Region {
    pub bounds: Bounds,
    pub rows: usize,
    pub cols: usize,
}

impl Region {
    /// Region covering `bounds` at the given cell size. Row and column
    /// counts are rounded to the nearest whole cell, never below one.
    pub fn new(bounds: Bounds, resolution: f64) -> Self {
        let rows = (bounds.height() / resolution).round().max(1.0) as usize;
        let cols = (bounds.width() / resolution).round().max(1.0) as usize;
        Self { bounds, rows, cols }
    }

    /// Region matching a grid cell for cell.
    pub fn of(grid: &Grid) -> Self {
        Self {
            bounds: grid.bounds,
            rows: grid.rows(),
            cols: grid.cols(),
        }
    }

    pub fn cell_width(&self) -> f64 {
        self.bounds.width() / self.cols as f64
    }

    pub fn cell_height(&self) -> f64 {
        self.bounds.height() / self.rows as f64
    }
}

/// A single-band integer raster with its geographic extent.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    data: Array2<i32>,
    bounds: Bounds,
}

impl Grid {
    pub fn from_array(data: Array2<i32>, bounds: Bounds) -> Self {
        Self { data, bounds }
    }

    /// Grid filled with a single value over the region.
    pub fn filled(region: &Region, value: i32) -> Self {
        Self {
            data: Array2::from_elem((region.rows, region.cols), value),
            bounds: region.bounds,
        }
    }

    pub fn rows(&self) -> usize {
        self.data.nrows()
    }

    pub fn cols(&self) -> usize {
        self.data.ncols()
    }

    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    pub fn get(&self, row: usize, col: usize) -> i32 {
        self.data[(row, col)]
    }

    pub fn set(&mut self, row: usize, col: usize, value: i32) {
        self.data[(row, col)] = value;
    }

    pub fn data(&self) -> &Array2<i32> {
        &self.data
    }

    /// Number of cells holding a value.
    pub fn count_non_null(&self) -> usize {
        self.data.iter().filter(|v| !is_null(**v)).count()
    }

    /// Read this grid on another region by nearest-neighbor lookup.
    /// Target cells whose center falls outside the source extent are null.
    pub fn sample_on(&self, region: &Region) -> Grid {
        if Region::of(self) == *region {
            return self.clone();
        }

        let src_cell_w = self.bounds.width() / self.cols() as f64;
        let src_cell_h = self.bounds.height() / self.rows() as f64;

        let mut data = Array2::from_elem((region.rows, region.cols), NULL);
        for row in 0..region.rows {
            let y = region.bounds.north - (row as f64 + 0.5) * region.cell_height();
            for col in 0..region.cols {
                let x = region.bounds.west + (col as f64 + 0.5) * region.cell_width();

                let src_col = ((x - self.bounds.west) / src_cell_w).floor();
                let src_row = ((self.bounds.north - y) / src_cell_h).floor();
                if src_row < 0.0 || src_col < 0.0 {
                    continue;
                }
                let (src_row, src_col) = (src_row as usize, src_col as usize);
                if src_row < self.rows() && src_col < self.cols() {
                    data[(row, col)] = self.data[(src_row, src_col)];
                }
            }
        }
        Grid::from_array(data, region.bounds)
    }
}

/// GeoTIFF compression codec for exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Compressor {
    None,
    Lzw,
    Deflate,
    Packbits,
}

/// Read a single-band GeoTIFF into a grid. Accepts unsigned 8/16/32 bit
/// and signed 16/32 bit samples; georeferencing comes from the pixel
/// scale and tiepoint tags. Cells equal to the GDAL nodata value, if the
/// file declares one, are read as null.
pub fn read_geotiff(path: &Path) -> Result<Grid> {
    let file = File::open(path)?;
    let mut decoder = Decoder::new(BufReader::new(file))?.with_limits(Limits::unlimited());

    let (width, height) = decoder.dimensions()?;
    let (rows, cols) = (height as usize, width as usize);

    let scale = match decoder.find_tag(Tag::ModelPixelScaleTag)? {
        Some(value) => value.into_f64_vec()?,
        None => return Err(Error::MissingGeoreferencing(path.to_path_buf())),
    };
    let tiepoint = match decoder.find_tag(Tag::ModelTiepointTag)? {
        Some(value) => value.into_f64_vec()?,
        None => return Err(Error::MissingGeoreferencing(path.to_path_buf())),
    };
    if scale.len() < 2 || tiepoint.len() < 5 {
        return Err(Error::MissingGeoreferencing(path.to_path_buf()));
    }

    let west = tiepoint[3] - tiepoint[0] * scale[0];
    let north = tiepoint[4] + tiepoint[1] * scale[1];
    let bounds = Bounds {
        north,
        south: north - rows as f64 * scale[1],
        east: west + cols as f64 * scale[0],
        west,
    };

    let nodata = match decoder.find_tag(Tag::GdalNodata)? {
        Some(value) => value.into_string()?.trim().parse::<f64>().ok().map(|v| v as i32),
        None => None,
    };

    let values: Vec<i32> = match decoder.read_image()? {
        DecodingResult::U8(buf) => buf.into_iter().map(i32::from).collect(),
        DecodingResult::U16(buf) => buf.into_iter().map(i32::from).collect(),
        DecodingResult::U32(buf) => buf.into_iter().map(|v| v as i32).collect(),
        DecodingResult::I16(buf) => buf.into_iter().map(i32::from).collect(),
        DecodingResult::I32(buf) => buf.into_iter().collect(),
        _ => return Err(Error::UnsupportedSamples(path.to_path_buf())),
    };
    if values.len() != rows * cols {
        return Err(Error::SizeMismatch {
            er: rows,
            ec: cols,
            ar: values.len() / cols.max(1),
            ac: cols,
        });
    }

    let values = match nodata {
        Some(nd) => values
            .into_iter()
            .map(|v| if v == nd { NULL } else { v })
            .collect(),
        None => values,
    };

    let data = Array2::from_shape_vec((rows, cols), values)
        .map_err(|_| Error::SizeMismatch { er: rows, ec: cols, ar: 0, ac: 0 })?;
    Ok(Grid::from_array(data, bounds))
}

/// Write a grid as a single-band signed 16-bit GeoTIFF. Null cells are
/// written as [`EXPORT_NODATA`] and declared in the GDAL nodata tag;
/// other values saturate to the i16 range.
pub fn write_geotiff(path: &Path, grid: &Grid, compressor: Compressor) -> Result<()> {
    let file = File::create(path)?;
    let writer = BufWriter::new(file);

    let (rows, cols) = grid.shape();
    let samples: Vec<i16> = grid
        .data()
        .iter()
        .map(|&v| {
            if is_null(v) {
                EXPORT_NODATA
            } else {
                v.clamp(i32::from(i16::MIN) + 1, i32::from(i16::MAX)) as i16
            }
        })
        .collect();

    let cell_w = grid.bounds().width() / cols as f64;
    let cell_h = grid.bounds().height() / rows as f64;

    let compression = match compressor {
        Compressor::None => TiffCompression::Uncompressed,
        Compressor::Lzw => TiffCompression::Lzw,
        Compressor::Deflate => TiffCompression::Deflate(DeflateLevel::Balanced),
        Compressor::Packbits => TiffCompression::Packbits,
    };

    let mut tiff = TiffEncoder::new(writer)?.with_compression(compression);
    let mut image = tiff.new_image::<colortype::GrayI16>(cols as u32, rows as u32)?;
    image
        .encoder()
        .write_tag(Tag::ModelPixelScaleTag, &[cell_w, cell_h, 0.0][..])?;
    image.encoder().write_tag(
        Tag::ModelTiepointTag,
        &[0.0, 0.0, 0.0, grid.bounds().west, grid.bounds().north, 0.0][..],
    )?;
    image
        .encoder()
        .write_tag(Tag::GdalNodata, format!("{}", EXPORT_NODATA).as_str())?;
    image.write_data(&samples)?;
    Ok(())
}
