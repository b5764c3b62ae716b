use crate::config::TileCompression;
use crate::io::raster::{BandData, PixelBlock};
use crate::types::{TileSpec, TilerError, TilerResult};
use gdal::cpl::CslStringListEntry;
use gdal::raster::{Buffer, GdalType, RasterCreationOptions};
use gdal::{Driver, DriverManager};
use ndarray::Array2;
use std::fs;
use std::path::{Path, PathBuf};

/// Destination for materialized tile pixels
pub trait TileSink: Sync {
    /// Writes `block` as the tile described by `spec` to `path`.
    ///
    /// On error nothing may be left at `path`.
    fn write_tile(
        &self,
        spec: &TileSpec,
        block: &PixelBlock,
        path: &Path,
    ) -> TilerResult<PathBuf>;
}

/// Writes tiles as single GeoTIFF files carrying the source CRS
#[derive(Debug, Clone)]
pub struct GeoTiffTileWriter {
    compression: TileCompression,
    projection_wkt: String,
}

impl GeoTiffTileWriter {
    pub fn new(compression: TileCompression, projection_wkt: impl Into<String>) -> Self {
        Self {
            compression,
            projection_wkt: projection_wkt.into(),
        }
    }

    fn write_dataset(&self, spec: &TileSpec, block: &PixelBlock, path: &Path) -> TilerResult<()> {
        let driver = DriverManager::get_driver_by_name("GTiff")
            .map_err(|e| TilerError::Write(format!("GTiff driver unavailable: {}", e)))?;

        let no_data = &block.no_data;
        match &block.bands {
            BandData::UInt8(bands) => self.write_bands(&driver, spec, bands, no_data, path),
            BandData::UInt16(bands) => self.write_bands(&driver, spec, bands, no_data, path),
            BandData::Int16(bands) => self.write_bands(&driver, spec, bands, no_data, path),
            BandData::UInt32(bands) => self.write_bands(&driver, spec, bands, no_data, path),
            BandData::Int32(bands) => self.write_bands(&driver, spec, bands, no_data, path),
            BandData::Float32(bands) => self.write_bands(&driver, spec, bands, no_data, path),
            BandData::Float64(bands) => self.write_bands(&driver, spec, bands, no_data, path),
        }
    }

    fn write_bands<T: GdalType + Copy>(
        &self,
        driver: &Driver,
        spec: &TileSpec,
        bands: &[Array2<T>],
        no_data: &[Option<f64>],
        path: &Path,
    ) -> TilerResult<()> {
        let (height, width) = bands
            .first()
            .map(|band| band.dim())
            .ok_or_else(|| TilerError::Write(format!("Tile {} has no bands", spec.id)))?;

        let mut options = RasterCreationOptions::new();
        if let Some(compress) = self.compression.gdal_value() {
            options.extend([CslStringListEntry::from(("COMPRESS", compress))]);
        }

        let mut dataset = driver
            .create_with_band_type_with_options::<T, _>(
                path,
                width,
                height,
                bands.len(),
                &options,
            )
            .map_err(|e| TilerError::Write(format!("Failed to create {}: {}", path.display(), e)))?;

        dataset
            .set_geo_transform(&spec.geo_transform.to_gdal())
            .map_err(|e| TilerError::Write(format!("Failed to set geotransform: {}", e)))?;
        if !self.projection_wkt.is_empty() {
            dataset
                .set_projection(&self.projection_wkt)
                .map_err(|e| TilerError::Write(format!("Failed to set projection: {}", e)))?;
        }

        for (index, band) in bands.iter().enumerate() {
            let band_index = index + 1;
            let mut rasterband = dataset
                .rasterband(band_index)
                .map_err(|e| {
                    TilerError::Write(format!("Failed to access band {}: {}", band_index, e))
                })?;

            let flat_data: Vec<T> = band.iter().cloned().collect();
            let mut buffer = Buffer::new((width, height), flat_data);
            rasterband
                .write((0, 0), (width, height), &mut buffer)
                .map_err(|e| {
                    TilerError::Write(format!("Failed to write band {}: {}", band_index, e))
                })?;

            if let Some(value) = no_data.get(index).copied().flatten() {
                rasterband
                    .set_no_data_value(Some(value))
                    .map_err(|e| TilerError::Write(format!("Failed to set nodata: {}", e)))?;
            }
        }

        // GDALClose swallows write errors, so flush explicitly and inspect
        // the CPL error state before closing
        clear_gdal_error();
        dataset.flush_cache();
        check_gdal_error(&format!("Failed to flush {}", path.display()))?;

        drop(dataset);
        check_gdal_error(&format!("Failed to close {}", path.display()))
    }
}

fn clear_gdal_error() {
    unsafe { gdal_sys::CPLErrorReset() };
}

/// Turns a pending GDAL failure on this thread into a write error
fn check_gdal_error(context: &str) -> TilerResult<()> {
    let error_type = unsafe { gdal_sys::CPLGetLastErrorType() };
    if error_type < gdal_sys::CPLErr::CE_Failure {
        return Ok(());
    }

    let message = unsafe {
        let raw = gdal_sys::CPLGetLastErrorMsg();
        if raw.is_null() {
            String::new()
        } else {
            std::ffi::CStr::from_ptr(raw).to_string_lossy().into_owned()
        }
    };
    clear_gdal_error();
    Err(TilerError::Write(format!("{}: {}", context, message)))
}

/// Temporary name a tile is written under before being renamed into place
pub fn staging_path(path: &Path) -> PathBuf {
    let mut staged = path.as_os_str().to_owned();
    staged.push(".partial");
    PathBuf::from(staged)
}

impl TileSink for GeoTiffTileWriter {
    fn write_tile(&self, spec: &TileSpec, block: &PixelBlock, path: &Path) -> TilerResult<PathBuf> {
        let staged = staging_path(path);

        if let Err(e) = self.write_dataset(spec, block, &staged) {
            discard(&staged);
            return Err(e);
        }

        if let Err(e) = fs::rename(&staged, path) {
            discard(&staged);
            return Err(TilerError::Write(format!(
                "Failed to move tile into {}: {}",
                path.display(),
                e
            )));
        }

        log::debug!(
            "Wrote tile {} ({}x{}) to {}",
            spec.id,
            block.width,
            block.height,
            path.display()
        );
        Ok(path.to_path_buf())
    }
}

fn discard(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            log::warn!("Failed to remove partial tile {}: {}", path.display(), e);
        }
    }
}
