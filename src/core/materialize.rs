use crate::config::EdgeMode;
use crate::core::crs::PixelTransform;
use crate::io::raster::RasterSource;
use crate::io::tile_writer::TileSink;
use crate::types::{TileResult, TileSpec, TilerError, TilerResult};
use std::path::{Path, PathBuf};

/// File name of the tile with the given id, e.g. `tile_000042.tif`
pub fn tile_file_name(id: usize) -> String {
    format!("tile_{:06}.tif", id)
}

/// Cuts single tiles out of a source raster and writes them to disk.
///
/// One materializer serves every tile of a session; it holds no per-tile
/// state so it can be shared by parallel workers.
pub struct TileMaterializer<'a, T: PixelTransform + ?Sized, W: TileSink + ?Sized> {
    transform: &'a T,
    writer: &'a W,
    destination: PathBuf,
    edge_mode: EdgeMode,
    tile_size: (usize, usize),
}

impl<'a, T: PixelTransform + ?Sized, W: TileSink + ?Sized> TileMaterializer<'a, T, W> {
    pub fn new<P: AsRef<Path>>(transform: &'a T, writer: &'a W, destination: P) -> Self {
        Self {
            transform,
            writer,
            destination: destination.as_ref().to_path_buf(),
            edge_mode: EdgeMode::Clip,
            tile_size: (0, 0),
        }
    }

    /// Pads edge tiles to `tile_width x tile_height` instead of clipping them
    pub fn with_edge_mode(
        mut self,
        edge_mode: EdgeMode,
        tile_width: usize,
        tile_height: usize,
    ) -> Self {
        self.edge_mode = edge_mode;
        self.tile_size = (tile_width, tile_height);
        self
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Reads the window of `spec`, writes it as a tile and returns its result.
    ///
    /// Only this tile's window is held in memory, and only until it is written.
    pub fn materialize<S: RasterSource + ?Sized>(
        &self,
        source: &S,
        spec: &TileSpec,
    ) -> TilerResult<TileResult> {
        let (width, height) = source.dimensions();
        if !spec.window.fits_within(width, height) {
            return Err(TilerError::InvalidParameters(format!(
                "Tile {} window {:?} exceeds {}x{} raster",
                spec.id, spec.window, width, height
            )));
        }

        // Computed first so a projection failure never leaves a file behind
        let bounding_box = self.transform.bounding_box(&spec.window)?;

        let block = source.read_window(&spec.window)?;
        let block = match self.edge_mode {
            EdgeMode::Clip => block,
            EdgeMode::Pad => block.padded(self.tile_size.0, self.tile_size.1),
        };

        let file_name = tile_file_name(spec.id);
        let file_path = self.writer.write_tile(spec, &block, &self.destination.join(&file_name))?;

        log::debug!(
            "Materialized tile {} [{}..{}, {}..{}] -> {}",
            spec.id,
            spec.window.col_start,
            spec.window.col_end,
            spec.window.row_start,
            spec.window.row_end,
            file_name
        );

        Ok(TileResult {
            id: spec.id,
            window: spec.window,
            bounding_box,
            file_name,
            file_path,
        })
    }
}

/// Materializes one tile with clipped edges; see [`TileMaterializer::materialize`]
pub fn materialize<S, T, W>(
    source: &S,
    spec: &TileSpec,
    transform: &T,
    writer: &W,
    destination: &Path,
) -> TilerResult<TileResult>
where
    S: RasterSource + ?Sized,
    T: PixelTransform + ?Sized,
    W: TileSink + ?Sized,
{
    TileMaterializer::new(transform, writer, destination).materialize(source, spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::grid::{GridParams, GridPlanner};
    use crate::io::raster::{BandData, PixelBlock};
    use crate::types::{BoundingBox, GeoTransform, PixelWindow};
    use ndarray::Array2;
    use std::sync::Mutex;

    /// Source that fabricates pixel values and records every read
    struct RecordingSource {
        width: usize,
        height: usize,
        reads: Mutex<Vec<PixelWindow>>,
    }

    impl RecordingSource {
        fn new(width: usize, height: usize) -> Self {
            Self { width, height, reads: Mutex::new(Vec::new()) }
        }
    }

    impl RasterSource for RecordingSource {
        fn dimensions(&self) -> (usize, usize) {
            (self.width, self.height)
        }

        fn band_count(&self) -> usize {
            2
        }

        fn read_window(&self, window: &PixelWindow) -> TilerResult<PixelBlock> {
            self.reads.lock().unwrap().push(*window);
            let band = Array2::from_shape_fn((window.height(), window.width()), |(r, c)| {
                ((window.row_start + r) * self.width + window.col_start + c) as f32
            });
            Ok(PixelBlock {
                width: window.width(),
                height: window.height(),
                bands: BandData::Float32(vec![band.clone(), band]),
                no_data: vec![Some(-1.0), None],
            })
        }
    }

    struct FailingSource;

    impl RasterSource for FailingSource {
        fn dimensions(&self) -> (usize, usize) {
            (64, 64)
        }

        fn band_count(&self) -> usize {
            1
        }

        fn read_window(&self, _window: &PixelWindow) -> TilerResult<PixelBlock> {
            Err(TilerError::Read("corrupt strip".to_string()))
        }
    }

    /// Sink that keeps only block sizes instead of writing files
    #[derive(Default)]
    struct MemorySink {
        written: Mutex<Vec<(usize, usize, usize, usize)>>,
    }

    impl TileSink for MemorySink {
        fn write_tile(
            &self,
            spec: &TileSpec,
            block: &PixelBlock,
            path: &Path,
        ) -> TilerResult<PathBuf> {
            self.written
                .lock()
                .unwrap()
                .push((spec.id, block.width, block.height, block.size_bytes()));
            Ok(path.to_path_buf())
        }
    }

    struct PixelSpace;

    impl PixelTransform for PixelSpace {
        fn transform_pixels(&self, pixels: &[(f64, f64)]) -> TilerResult<Vec<(f64, f64)>> {
            Ok(pixels.iter().map(|&(col, row)| (-row, col)).collect())
        }
    }

    #[test]
    fn test_file_names_are_zero_padded() {
        assert_eq!(tile_file_name(1), "tile_000001.tif");
        assert_eq!(tile_file_name(123456), "tile_123456.tif");
    }

    #[test]
    fn test_reads_only_tile_windows() {
        let (width, height, tile) = (5000, 3000, 256);
        let source = RecordingSource::new(width, height);
        let sink = MemorySink::default();
        let planner = GridPlanner::new(GridParams::new(tile, tile, 0.0).unwrap()).unwrap();
        let specs = planner.plan(width, height, &GeoTransform::identity());

        let materializer = TileMaterializer::new(&PixelSpace, &sink, "/session");
        for spec in specs.iter().take(50) {
            materializer.materialize(&source, spec).unwrap();
        }

        let reads = source.reads.lock().unwrap();
        assert_eq!(reads.len(), 50);
        for (read, spec) in reads.iter().zip(&specs) {
            assert_eq!(read, &spec.window);
            assert!(read.pixel_count() <= tile * tile);
        }

        // Two f32 bands per tile window, never the whole raster
        let max_block = sink.written.lock().unwrap().iter().map(|w| w.3).max().unwrap();
        assert!(max_block <= tile * tile * 2 * 4);
        assert!(max_block < width * height * 2 * 4);
    }

    #[test]
    fn test_result_carries_window_and_bbox() {
        let source = RecordingSource::new(100, 100);
        let sink = MemorySink::default();
        let spec = TileSpec {
            id: 7,
            window: PixelWindow { col_start: 64, row_start: 32, col_end: 100, row_end: 96 },
            geo_transform: GeoTransform::identity().shifted(64, 32),
        };

        let result = materialize(&source, &spec, &PixelSpace, &sink, Path::new("/out")).unwrap();
        assert_eq!(result.id, 7);
        assert_eq!(result.file_name, "tile_000007.tif");
        assert_eq!(result.file_path, PathBuf::from("/out/tile_000007.tif"));
        assert_eq!(result.window, spec.window);
        assert_eq!(
            result.bounding_box,
            BoundingBox { min_lat: -96.0, max_lat: -32.0, min_lon: 64.0, max_lon: 100.0 }
        );
    }

    #[test]
    fn test_pad_mode_writes_full_tiles() {
        let source = RecordingSource::new(100, 100);
        let sink = MemorySink::default();
        let spec = TileSpec {
            id: 4,
            window: PixelWindow { col_start: 64, row_start: 64, col_end: 100, row_end: 100 },
            geo_transform: GeoTransform::identity().shifted(64, 64),
        };

        let result = TileMaterializer::new(&PixelSpace, &sink, "/out")
            .with_edge_mode(EdgeMode::Pad, 64, 64)
            .materialize(&source, &spec)
            .unwrap();

        let written = sink.written.lock().unwrap();
        assert_eq!(written[0].1, 64);
        assert_eq!(written[0].2, 64);
        // The reported footprint stays the real data window
        assert_eq!(result.window.width(), 36);
    }

    #[test]
    fn test_read_failure_writes_nothing() {
        let sink = MemorySink::default();
        let spec = TileSpec {
            id: 1,
            window: PixelWindow { col_start: 0, row_start: 0, col_end: 32, row_end: 32 },
            geo_transform: GeoTransform::identity(),
        };

        let result = materialize(&FailingSource, &spec, &PixelSpace, &sink, Path::new("/out"));
        assert!(matches!(result, Err(TilerError::Read(_))));
        assert!(sink.written.lock().unwrap().is_empty());
    }

    #[test]
    fn test_window_outside_raster_is_rejected() {
        let source = RecordingSource::new(10, 10);
        let sink = MemorySink::default();
        let spec = TileSpec {
            id: 1,
            window: PixelWindow { col_start: 5, row_start: 5, col_end: 15, row_end: 10 },
            geo_transform: GeoTransform::identity(),
        };

        let result = materialize(&source, &spec, &PixelSpace, &sink, Path::new("/out"));
        assert!(matches!(result, Err(TilerError::InvalidParameters(_))));
        assert!(source.reads.lock().unwrap().is_empty());
    }
}
