//! CRS detection and pixel to WGS84 coordinate transforms

use crate::io::raster::RasterHandle;
use crate::types::{BoundingBox, GeoTransform, PixelWindow, TilerError, TilerResult, CANONICAL_EPSG};
use gdal::spatial_ref::{AxisMappingStrategy, CoordTransform, SpatialRef};

/// Points sampled per edge when bounding a whole raster
pub const DENSIFY_POINTS_PER_EDGE: usize = 21;

/// Maps pixel coordinates of a raster to `(lat, lon)` in WGS84.
///
/// Implementations are shared between materialization workers and must not
/// keep unsynchronized mutable state.
pub trait PixelTransform: Send + Sync {
    /// Transforms a batch of `(col, row)` pixel coordinates to `(lat, lon)`
    fn transform_pixels(&self, pixels: &[(f64, f64)]) -> TilerResult<Vec<(f64, f64)>>;

    fn pixel_to_lat_lon(&self, col: f64, row: f64) -> TilerResult<(f64, f64)> {
        self.transform_pixels(&[(col, row)])?
            .pop()
            .ok_or_else(|| TilerError::Processing("Transform returned no coordinates".to_string()))
    }

    /// Bounding box of the four transformed window corners
    fn bounding_box(&self, window: &PixelWindow) -> TilerResult<BoundingBox> {
        bounding_box_of(&self.transform_pixels(&window.corners())?, window)
    }

    /// Bounding box of points sampled along every window edge
    fn densified_bounds(
        &self,
        window: &PixelWindow,
        points_per_edge: usize,
    ) -> TilerResult<BoundingBox> {
        bounding_box_of(&self.transform_pixels(&window.edge_points(points_per_edge))?, window)
    }
}

fn bounding_box_of(points: &[(f64, f64)], window: &PixelWindow) -> TilerResult<BoundingBox> {
    BoundingBox::from_points(points).ok_or_else(|| {
        TilerError::UnsupportedProjection(format!(
            "Window {:?} does not map to finite WGS84 coordinates",
            window
        ))
    })
}

/// How native coordinates reach WGS84
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// Native CRS already is EPSG:4326
    Canonical,
    /// Reprojected through GDAL/PROJ from the given source definition
    Reproject { source_wkt: String },
}

/// Pixel to WGS84 transform for one raster
#[derive(Debug, Clone)]
pub struct CrsNormalizer {
    geo_transform: GeoTransform,
    projection: Projection,
    source_name: String,
}

impl CrsNormalizer {
    /// Detects the CRS of an open raster
    pub fn detect(raster: &RasterHandle) -> TilerResult<Self> {
        let geo_transform = raster.geo_transform().copied().ok_or_else(|| {
            TilerError::UnknownCrs(format!("{} has no geotransform", raster.path().display()))
        })?;
        Self::from_wkt(raster.projection_wkt(), geo_transform)
    }

    /// Builds a transform from a WKT (or any GDAL-parseable) CRS definition
    pub fn from_wkt(wkt: &str, geo_transform: GeoTransform) -> TilerResult<Self> {
        if wkt.trim().is_empty() {
            return Err(TilerError::UnknownCrs("raster carries no CRS definition".to_string()));
        }

        let mut srs = SpatialRef::from_definition(wkt)
            .map_err(|e| TilerError::UnknownCrs(format!("unparseable CRS definition: {}", e)))?;
        if let Err(e) = srs.auto_identify_epsg() {
            log::debug!("Could not identify an EPSG code for the source CRS: {}", e);
        }
        let source_name = match (srs.auth_name(), srs.auth_code()) {
            (Ok(authority), Ok(code)) => format!("{}:{}", authority, code),
            _ => "custom CRS".to_string(),
        };

        let projection = if is_canonical(&srs) {
            log::info!("Source CRS {} is already EPSG:{}", source_name, CANONICAL_EPSG);
            Projection::Canonical
        } else {
            let source_wkt = srs
                .to_wkt()
                .map_err(|e| TilerError::UnknownCrs(format!("cannot export CRS as WKT: {}", e)))?;
            // Fail at detection time rather than on the first tile
            build_coord_transform(&source_wkt)?;
            log::info!("Reprojecting {} to EPSG:{}", source_name, CANONICAL_EPSG);
            Projection::Reproject { source_wkt }
        };

        Ok(Self {
            geo_transform,
            projection,
            source_name,
        })
    }

    /// Builds a transform from an EPSG code
    pub fn from_epsg(epsg: u32, geo_transform: GeoTransform) -> TilerResult<Self> {
        let wkt = SpatialRef::from_epsg(epsg)
            .and_then(|srs| srs.to_wkt())
            .map_err(|e| TilerError::UnknownCrs(format!("EPSG:{} is not known: {}", epsg, e)))?;
        Self::from_wkt(&wkt, geo_transform)
    }

    pub fn projection(&self) -> &Projection {
        &self.projection
    }

    pub fn geo_transform(&self) -> &GeoTransform {
        &self.geo_transform
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn is_identity(&self) -> bool {
        self.projection == Projection::Canonical
    }

    /// WGS84 bounds of a whole `width x height` raster, sampled densely along its edges
    pub fn raster_bounds(&self, width: usize, height: usize) -> TilerResult<BoundingBox> {
        let window = PixelWindow { col_start: 0, row_start: 0, col_end: width, row_end: height };
        self.densified_bounds(&window, DENSIFY_POINTS_PER_EDGE)
    }
}

impl PixelTransform for CrsNormalizer {
    fn transform_pixels(&self, pixels: &[(f64, f64)]) -> TilerResult<Vec<(f64, f64)>> {
        let (mut xs, mut ys): (Vec<f64>, Vec<f64>) = pixels
            .iter()
            .map(|&(col, row)| self.geo_transform.apply(col, row))
            .unzip();

        if let Projection::Reproject { source_wkt } = &self.projection {
            // GDAL transforms are not thread safe, so every batch gets its own
            let transform = build_coord_transform(source_wkt)?;
            let mut zs = vec![0.0; xs.len()];
            transform
                .transform_coords(&mut xs, &mut ys, &mut zs)
                .map_err(|e| {
                    TilerError::UnsupportedProjection(format!("coordinate transform failed: {}", e))
                })?;
        }

        // Traditional GIS order: x is longitude, y is latitude
        Ok(xs.into_iter().zip(ys).map(|(lon, lat)| (lat, lon)).collect())
    }
}

/// Detects the native CRS of `raster` and returns its pixel to WGS84 transform
pub fn detect_and_build_transform(raster: &RasterHandle) -> TilerResult<CrsNormalizer> {
    CrsNormalizer::detect(raster)
}

fn is_canonical(srs: &SpatialRef) -> bool {
    let authority = srs.auth_name().ok();
    let code = srs.auth_code().ok();
    authority.as_deref() == Some("EPSG") && code == Some(CANONICAL_EPSG as i32)
}

fn build_coord_transform(source_wkt: &str) -> TilerResult<CoordTransform> {
    let mut source = SpatialRef::from_wkt(source_wkt).map_err(|e| {
        TilerError::UnsupportedProjection(format!("cannot rebuild source CRS: {}", e))
    })?;
    let mut target = SpatialRef::from_epsg(CANONICAL_EPSG).map_err(|e| {
        TilerError::UnsupportedProjection(format!("EPSG:{} unavailable: {}", CANONICAL_EPSG, e))
    })?;

    source.set_axis_mapping_strategy(AxisMappingStrategy::TraditionalGisOrder);
    target.set_axis_mapping_strategy(AxisMappingStrategy::TraditionalGisOrder);

    CoordTransform::new(&source, &target).map_err(|e| {
        TilerError::UnsupportedProjection(format!(
            "cannot build transform to EPSG:{}: {}",
            CANONICAL_EPSG, e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_wgs84_is_identity() {
        let gt = GeoTransform::from_gdal([10.0, 0.01, 0.0, 50.0, 0.0, -0.01]);
        let normalizer = CrsNormalizer::from_epsg(4326, gt).unwrap();
        assert!(normalizer.is_identity());

        let (lat, lon) = normalizer.pixel_to_lat_lon(100.0, 200.0).unwrap();
        assert_abs_diff_eq!(lat, 48.0, epsilon = 1e-12);
        assert_abs_diff_eq!(lon, 11.0, epsilon = 1e-12);
    }

    #[test]
    fn test_utm_is_reprojected() {
        // UTM 33N, false easting 500 km on the central meridian (15E)
        let gt = GeoTransform::from_gdal([500_000.0, 10.0, 0.0, 5_000_000.0, 0.0, -10.0]);
        let normalizer = CrsNormalizer::from_epsg(32633, gt).unwrap();
        assert!(!normalizer.is_identity());

        let (lat, lon) = normalizer.pixel_to_lat_lon(0.0, 0.0).unwrap();
        assert_abs_diff_eq!(lon, 15.0, epsilon = 1e-6);
        assert!(lat > 45.0 && lat < 45.3, "unexpected latitude {}", lat);
    }

    #[test]
    fn test_bbox_is_ordered_for_flipped_rasters() {
        // South-up raster with columns running west
        let gt = GeoTransform::from_gdal([20.0, -0.1, 0.0, -10.0, 0.0, 0.1]);
        let normalizer = CrsNormalizer::from_epsg(4326, gt).unwrap();
        let window = PixelWindow { col_start: 0, row_start: 0, col_end: 10, row_end: 20 };

        let bbox = normalizer.bounding_box(&window).unwrap();
        assert!(bbox.min_lat <= bbox.max_lat);
        assert!(bbox.min_lon <= bbox.max_lon);
        assert_abs_diff_eq!(bbox.min_lon, 19.0, epsilon = 1e-9);
        assert_abs_diff_eq!(bbox.max_lon, 20.0, epsilon = 1e-9);
        assert_abs_diff_eq!(bbox.min_lat, -10.0, epsilon = 1e-9);
        assert_abs_diff_eq!(bbox.max_lat, -8.0, epsilon = 1e-9);
    }

    #[test]
    fn test_reprojected_bbox_is_ordered() {
        let gt = GeoTransform::from_gdal([300_000.0, 30.0, 0.0, 7_000_000.0, 0.0, -30.0]);
        let normalizer = CrsNormalizer::from_epsg(32735, gt).unwrap();
        let window = PixelWindow { col_start: 0, row_start: 0, col_end: 1000, row_end: 800 };

        let corners = normalizer.bounding_box(&window).unwrap();
        let dense = normalizer.densified_bounds(&window, DENSIFY_POINTS_PER_EDGE).unwrap();
        assert!(corners.min_lat <= corners.max_lat && corners.min_lon <= corners.max_lon);
        assert!(dense.contains(&corners, 1e-9));
    }

    #[test]
    fn test_missing_crs_is_unknown() {
        let result = CrsNormalizer::from_wkt("   ", GeoTransform::identity());
        assert!(matches!(result, Err(TilerError::UnknownCrs(_))));

        let result = CrsNormalizer::from_wkt("this is not a CRS", GeoTransform::identity());
        assert!(matches!(result, Err(TilerError::UnknownCrs(_))));
    }

    #[test]
    fn test_transform_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CrsNormalizer>();

        let gt = GeoTransform::from_gdal([500_000.0, 10.0, 0.0, 5_000_000.0, 0.0, -10.0]);
        let normalizer = std::sync::Arc::new(CrsNormalizer::from_epsg(32633, gt).unwrap());
        let expected = normalizer.pixel_to_lat_lon(50.0, 50.0).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let normalizer = normalizer.clone();
                std::thread::spawn(move || normalizer.pixel_to_lat_lon(50.0, 50.0).unwrap())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), expected);
        }
    }
}
