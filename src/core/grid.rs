use crate::types::{GeoTransform, PixelWindow, TileSpec, TilerError, TilerResult};
use serde::{Deserialize, Serialize};

/// Tile size and overlap requested by the caller
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridParams {
    /// Tile width in pixels
    pub tile_width: usize,
    /// Tile height in pixels
    pub tile_height: usize,
    /// Fraction of a tile shared with its neighbour, in `[0, 1)`
    pub overlap_ratio: f64,
}

impl GridParams {
    pub fn new(tile_width: usize, tile_height: usize, overlap_ratio: f64) -> TilerResult<Self> {
        let params = Self { tile_width, tile_height, overlap_ratio };
        params.validate()?;
        Ok(params)
    }

    /// Accepts signed sizes as they arrive from form fields and bindings
    pub fn from_signed(tile_width: i64, tile_height: i64, overlap_ratio: f64) -> TilerResult<Self> {
        if tile_width <= 0 || tile_height <= 0 {
            return Err(TilerError::InvalidParameters(format!(
                "Tile dimensions must be positive, got {}x{}",
                tile_width, tile_height
            )));
        }
        Self::new(tile_width as usize, tile_height as usize, overlap_ratio)
    }

    pub fn validate(&self) -> TilerResult<()> {
        if self.tile_width == 0 || self.tile_height == 0 {
            return Err(TilerError::InvalidParameters(format!(
                "Tile dimensions must be positive, got {}x{}",
                self.tile_width, self.tile_height
            )));
        }
        // NaN fails the range check as well
        if !(0.0..1.0).contains(&self.overlap_ratio) {
            return Err(TilerError::InvalidParameters(format!(
                "Overlap must be in [0, 1), got {}",
                self.overlap_ratio
            )));
        }
        Ok(())
    }

    /// Pixel step between consecutive tile origins, `(stride_x, stride_y)`
    pub fn stride(&self) -> (usize, usize) {
        (
            stride_for(self.tile_width, self.overlap_ratio),
            stride_for(self.tile_height, self.overlap_ratio),
        )
    }
}

fn stride_for(tile_size: usize, overlap_ratio: f64) -> usize {
    let stride = (tile_size as f64 * (1.0 - overlap_ratio)).round();
    // A stride of zero would never advance
    stride.max(1.0) as usize
}

/// Plans the pixel windows covering a raster
#[derive(Debug, Clone)]
pub struct GridPlanner {
    params: GridParams,
}

impl GridPlanner {
    pub fn new(params: GridParams) -> TilerResult<Self> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &GridParams {
        &self.params
    }

    /// Number of tile columns and rows for a raster of the given size
    pub fn tile_counts(&self, width: usize, height: usize) -> (usize, usize) {
        let (stride_x, stride_y) = self.params.stride();
        (width.div_ceil(stride_x), height.div_ceil(stride_y))
    }

    /// Windows in row-major order, ids starting at 1.
    ///
    /// The last tile of every row and column is clipped to the raster
    /// boundary, so edge tiles may be smaller than the requested size but
    /// every pixel is covered by at least one tile.
    pub fn plan(&self, width: usize, height: usize, parent: &GeoTransform) -> Vec<TileSpec> {
        let (stride_x, stride_y) = self.params.stride();
        let (tiles_x, tiles_y) = self.tile_counts(width, height);

        log::debug!(
            "Planning {}x{} grid over {}x{} raster (tile {}x{}, stride {}x{})",
            tiles_x,
            tiles_y,
            width,
            height,
            self.params.tile_width,
            self.params.tile_height,
            stride_x,
            stride_y
        );

        let mut specs = Vec::with_capacity(tiles_x * tiles_y);
        for row_start in (0..height).step_by(stride_y) {
            let row_end = row_start.saturating_add(self.params.tile_height).min(height);
            for col_start in (0..width).step_by(stride_x) {
                let col_end = col_start.saturating_add(self.params.tile_width).min(width);
                specs.push(TileSpec {
                    id: specs.len() + 1,
                    window: PixelWindow { col_start, row_start, col_end, row_end },
                    geo_transform: parent.shifted(col_start, row_start),
                });
            }
        }

        specs
    }
}

/// Plans a grid in one call; see [`GridPlanner::plan`]
pub fn plan_grid(
    width: usize,
    height: usize,
    tile_width: usize,
    tile_height: usize,
    overlap_ratio: f64,
    parent: &GeoTransform,
) -> TilerResult<Vec<TileSpec>> {
    let planner = GridPlanner::new(GridParams::new(tile_width, tile_height, overlap_ratio)?)?;
    Ok(planner.plan(width, height, parent))
}
