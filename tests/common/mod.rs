#![allow(dead_code)]

use gdal::cpl::CslStringListEntry;
use gdal::raster::{Buffer, RasterCreationOptions};
use gdal::spatial_ref::SpatialRef;
use gdal::DriverManager;
use std::path::{Path, PathBuf};

/// UTM 33N, 10 m pixels, origin on the central meridian
pub const UTM_33N_GEOTRANSFORM: [f64; 6] = [500_000.0, 10.0, 0.0, 5_000_000.0, 0.0, -10.0];

pub const NODATA: f64 = 65_535.0;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Deterministic synthetic pixel value
pub fn pixel_value(col: usize, row: usize, band: usize) -> u16 {
    ((row * 7 + col * 3 + band * 1000) % 60_000) as u16
}

/// Description of a synthetic GeoTIFF
pub struct SyntheticRaster {
    pub width: usize,
    pub height: usize,
    pub bands: usize,
    pub epsg: Option<u32>,
    pub geo_transform: Option<[f64; 6]>,
    pub no_data: Option<f64>,
}

impl SyntheticRaster {
    pub fn utm(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            bands: 2,
            epsg: Some(32633),
            geo_transform: Some(UTM_33N_GEOTRANSFORM),
            no_data: Some(NODATA),
        }
    }

    /// Writes a u16 GeoTIFF filled with [`pixel_value`]
    pub fn write(&self, path: &Path) -> PathBuf {
        self.write_with_options(path, &[])
    }

    /// Like [`SyntheticRaster::write`] with GTiff creation options
    pub fn write_with_options(&self, path: &Path, options: &[(&str, &str)]) -> PathBuf {
        let options: RasterCreationOptions =
            options.iter().map(|&entry| CslStringListEntry::from(entry)).collect();
        let driver = DriverManager::get_driver_by_name("GTiff").expect("GTiff driver");
        let mut dataset = driver
            .create_with_band_type_with_options::<u16, _>(
                path,
                self.width,
                self.height,
                self.bands,
                &options,
            )
            .expect("Failed to create synthetic raster");

        if let Some(gt) = self.geo_transform {
            dataset.set_geo_transform(&gt).expect("Failed to set geotransform");
        }
        if let Some(epsg) = self.epsg {
            let wkt = SpatialRef::from_epsg(epsg)
                .and_then(|srs| srs.to_wkt())
                .expect("EPSG lookup");
            dataset.set_projection(&wkt).expect("Failed to set projection");
        }

        for band_index in 0..self.bands {
            let mut band = dataset.rasterband(band_index + 1).expect("band");
            let mut data = Vec::with_capacity(self.width * self.height);
            for row in 0..self.height {
                for col in 0..self.width {
                    data.push(pixel_value(col, row, band_index));
                }
            }
            let mut buffer = Buffer::new((self.width, self.height), data);
            band.write((0, 0), (self.width, self.height), &mut buffer)
                .expect("Failed to write band");
            if let Some(value) = self.no_data {
                band.set_no_data_value(Some(value)).expect("Failed to set nodata");
            }
        }

        path.to_path_buf()
    }
}
