use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// EPSG code of the canonical output CRS (WGS84 geographic)
pub const CANONICAL_EPSG: u32 = 4326;

/// Geographic bounding box in WGS84 degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    /// Smallest box enclosing a set of `(lat, lon)` points.
    ///
    /// Returns `None` for an empty slice or when any coordinate is not finite.
    pub fn from_points(points: &[(f64, f64)]) -> Option<Self> {
        if points.is_empty() {
            return None;
        }

        let mut bbox = BoundingBox {
            min_lat: f64::INFINITY,
            max_lat: f64::NEG_INFINITY,
            min_lon: f64::INFINITY,
            max_lon: f64::NEG_INFINITY,
        };

        for &(lat, lon) in points {
            if !lat.is_finite() || !lon.is_finite() {
                return None;
            }
            bbox.min_lat = bbox.min_lat.min(lat);
            bbox.max_lat = bbox.max_lat.max(lat);
            bbox.min_lon = bbox.min_lon.min(lon);
            bbox.max_lon = bbox.max_lon.max(lon);
        }

        Some(bbox)
    }

    /// True if `other` lies inside this box, allowing `tolerance` degrees of slack
    pub fn contains(&self, other: &BoundingBox, tolerance: f64) -> bool {
        other.min_lat >= self.min_lat - tolerance
            && other.max_lat <= self.max_lat + tolerance
            && other.min_lon >= self.min_lon - tolerance
            && other.max_lon <= self.max_lon + tolerance
    }

    pub fn width_degrees(&self) -> f64 {
        self.max_lon - self.min_lon
    }

    pub fn height_degrees(&self) -> f64 {
        self.max_lat - self.min_lat
    }
}

/// Affine pixel to native-CRS transform, in GDAL coefficient order
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// Maps pixel coordinates onto themselves; used for pure pixel-space planning
    pub fn identity() -> Self {
        Self::from_gdal([0.0, 1.0, 0.0, 0.0, 0.0, 1.0])
    }

    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    /// Native coordinate of pixel corner `(col, row)`
    pub fn apply(&self, col: f64, row: f64) -> (f64, f64) {
        let x = self.top_left_x + col * self.pixel_width + row * self.rotation_x;
        let y = self.top_left_y + col * self.rotation_y + row * self.pixel_height;
        (x, y)
    }

    /// Same scale and rotation, origin moved to pixel `(col, row)`
    pub fn shifted(&self, col: usize, row: usize) -> Self {
        let (x, y) = self.apply(col as f64, row as f64);
        Self {
            top_left_x: x,
            top_left_y: y,
            ..*self
        }
    }
}

/// Half-open pixel rectangle `[col_start, col_end) x [row_start, row_end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelWindow {
    pub col_start: usize,
    pub row_start: usize,
    pub col_end: usize,
    pub row_end: usize,
}

impl PixelWindow {
    pub fn width(&self) -> usize {
        self.col_end - self.col_start
    }

    pub fn height(&self) -> usize {
        self.row_end - self.row_start
    }

    pub fn pixel_count(&self) -> usize {
        self.width() * self.height()
    }

    pub fn contains_pixel(&self, col: usize, row: usize) -> bool {
        (self.col_start..self.col_end).contains(&col)
            && (self.row_start..self.row_end).contains(&row)
    }

    /// Top-left, top-right, bottom-right, bottom-left pixel corners
    pub fn corners(&self) -> [(f64, f64); 4] {
        let (c0, r0) = (self.col_start as f64, self.row_start as f64);
        let (c1, r1) = (self.col_end as f64, self.row_end as f64);
        [(c0, r0), (c1, r0), (c1, r1), (c0, r1)]
    }

    /// Points sampled along the four edges, corners included
    pub fn edge_points(&self, points_per_edge: usize) -> Vec<(f64, f64)> {
        let steps = points_per_edge.max(2) - 1;
        let (c0, r0) = (self.col_start as f64, self.row_start as f64);
        let (c1, r1) = (self.col_end as f64, self.row_end as f64);

        let mut points = Vec::with_capacity(steps * 4);
        for i in 0..steps {
            let t = i as f64 / steps as f64;
            points.push((c0 + (c1 - c0) * t, r0));
            points.push((c1, r0 + (r1 - r0) * t));
            points.push((c1 - (c1 - c0) * t, r1));
            points.push((c0, r1 - (r1 - r0) * t));
        }
        points
    }

    /// Valid for a raster of the given size and non-empty
    pub fn fits_within(&self, width: usize, height: usize) -> bool {
        self.col_start < self.col_end
            && self.row_start < self.row_end
            && self.col_end <= width
            && self.row_end <= height
    }
}

/// One planned grid cell
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TileSpec {
    /// 1-based, raster-scan order
    pub id: usize,
    pub window: PixelWindow,
    pub geo_transform: GeoTransform,
}

/// A tile written to disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileResult {
    pub id: usize,
    pub window: PixelWindow,
    pub bounding_box: BoundingBox,
    pub file_name: String,
    pub file_path: PathBuf,
}

/// Completed processing session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub original_bounding_box: BoundingBox,
    /// Sorted by tile id
    pub tiles: Vec<TileResult>,
    pub tile_width: usize,
    pub tile_height: usize,
    pub overlap_ratio: f64,
    pub storage_location: PathBuf,
}

impl SessionRecord {
    pub fn total_tiles(&self) -> usize {
        self.tiles.len()
    }

    pub fn tile_by_name(&self, file_name: &str) -> Option<&TileResult> {
        self.tiles.iter().find(|tile| tile.file_name == file_name)
    }
}

/// Tile file entry as listed for download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileFileInfo {
    pub file_name: String,
    pub size_bytes: u64,
}

/// Error types for tiling
#[derive(Debug, thiserror::Error)]
pub enum TilerError {
    #[error("Unknown CRS: {0}")]
    UnknownCrs(String),

    #[error("Unsupported projection: {0}")]
    UnsupportedProjection(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Read error: {0}")]
    Read(String),

    #[error("Write error: {0}")]
    Write(String),

    #[error("Empty session: {0}")]
    EmptySession(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Session already finalized: {0}")]
    SessionFinalized(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Processing error: {0}")]
    Processing(String),
}

/// Result type for tiling operations
pub type TilerResult<T> = Result<T, TilerError>;
