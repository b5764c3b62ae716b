//! Raster tiling pipeline
//!
//! Flow: CRS detection -> grid planning -> tile materialization -> session
//! bookkeeping. Any failure aborts the whole session and removes its tiles.

use crate::config::TilerConfig;
use crate::core::crs::CrsNormalizer;
use crate::core::grid::{GridParams, GridPlanner};
use crate::core::materialize::TileMaterializer;
use crate::core::session::{InMemorySessionStore, SessionManager, SessionStore};
use crate::io::archive::write_session_archive;
use crate::io::manifest;
use crate::io::raster::{RasterHandle, RasterInput};
use crate::io::tile_writer::GeoTiffTileWriter;
use crate::types::{BoundingBox, SessionRecord, TileFileInfo, TileSpec, TilerError, TilerResult};
use std::fs::{self, File};
use std::io::{Seek, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// Retention is capped at roughly a century
const MAX_RETENTION_SECS: i64 = 100 * 366 * 24 * 60 * 60;

type Materializer<'a> = TileMaterializer<'a, CrsNormalizer, GeoTiffTileWriter>;

/// Entry point of the tiling engine
pub struct Tiler {
    config: TilerConfig,
    sessions: SessionManager,
    pool: Option<rayon::ThreadPool>,
}

impl Tiler {
    /// Tiler with an in-memory session store
    pub fn new(config: TilerConfig) -> TilerResult<Self> {
        Self::with_store(config, Arc::new(InMemorySessionStore::new()))
    }

    pub fn with_store(config: TilerConfig, store: Arc<dyn SessionStore>) -> TilerResult<Self> {
        config.validate()?;
        fs::create_dir_all(&config.tiles_root)?;

        let pool = match config.max_workers {
            Some(workers) if config.parallel => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(workers)
                    .thread_name(|index| format!("rasterlab-tile-{}", index))
                    .build()
                    .map_err(|e| {
                        TilerError::Processing(format!("Failed to build worker pool: {}", e))
                    })?,
            ),
            _ => None,
        };

        log::info!(
            "Tiler ready: tiles in {}, {:?} compression, {:?} edges",
            config.tiles_root.display(),
            config.compression,
            config.edge_mode
        );

        Ok(Self {
            sessions: SessionManager::new(config.tiles_root.clone(), store),
            config,
            pool,
        })
    }

    pub fn config(&self) -> &TilerConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Tiles a raster into a new session and returns its finalized record.
    ///
    /// Parameters are validated before the raster is touched. On any error
    /// the session directory is removed and no session remains registered.
    pub fn process(
        &self,
        input: RasterInput,
        tile_width: i64,
        tile_height: i64,
        overlap_ratio: f64,
    ) -> TilerResult<SessionRecord> {
        let params = GridParams::from_signed(tile_width, tile_height, overlap_ratio)?;
        let planner = GridPlanner::new(params)?;
        let started = Instant::now();

        let label = input.label();
        // Keeps a spooled upload alive until tiling is done
        let (path, _spool) = input.resolve_path()?;

        let raster = RasterHandle::open(&path)?;
        let normalizer = CrsNormalizer::detect(&raster)?;
        let original_bounding_box = normalizer.raster_bounds(raster.width(), raster.height())?;

        let specs = planner.plan(raster.width(), raster.height(), normalizer.geo_transform());
        if specs.is_empty() {
            return Err(TilerError::EmptySession(format!("{} has no pixels", path.display())));
        }
        log::info!(
            "Tiling {} ({}x{}, CRS {}) into {} tiles of {}x{} with overlap {}",
            label,
            raster.width(),
            raster.height(),
            normalizer.source_name(),
            specs.len(),
            params.tile_width,
            params.tile_height,
            params.overlap_ratio
        );

        let session_id = self.sessions.create_session(&label, params)?;
        let writer = GeoTiffTileWriter::new(self.config.compression, raster.projection_wkt());
        let session_dir = self.sessions.tiles_root().join(&session_id);
        let materializer = TileMaterializer::new(&normalizer, &writer, session_dir)
            .with_edge_mode(self.config.edge_mode, params.tile_width, params.tile_height);

        let outcome = self
            .materialize_all(&raster, &path, &specs, &materializer, &session_id)
            .and_then(|_| self.finish_session(&session_id, original_bounding_box));

        match outcome {
            Ok(record) => {
                log::info!(
                    "Session {} done: {} tiles in {:.2}s",
                    session_id,
                    record.total_tiles(),
                    started.elapsed().as_secs_f64()
                );
                Ok(record)
            }
            Err(e) => {
                log::error!("Tiling session {} failed: {}", session_id, e);
                if let Err(cleanup_error) = self.sessions.cleanup(&session_id) {
                    log::warn!("Failed to clean up session {}: {}", session_id, cleanup_error);
                }
                Err(e)
            }
        }
    }

    fn finish_session(
        &self,
        session_id: &str,
        original_bounding_box: BoundingBox,
    ) -> TilerResult<SessionRecord> {
        let record = self.sessions.finalize(session_id, original_bounding_box)?;
        if self.config.write_manifest {
            manifest::write_manifest(&record)?;
        }
        Ok(record)
    }

    fn materialize_all(
        &self,
        raster: &RasterHandle,
        path: &Path,
        specs: &[TileSpec],
        materializer: &Materializer<'_>,
        session_id: &str,
    ) -> TilerResult<()> {
        #[cfg(feature = "parallel")]
        {
            if self.config.parallel && specs.len() > 1 {
                return self.materialize_parallel(path, specs, materializer, session_id);
            }
        }
        #[cfg(not(feature = "parallel"))]
        let _ = path;

        for spec in specs {
            let tile = materializer.materialize(raster, spec)?;
            self.sessions.record_tile(session_id, tile)?;
        }
        Ok(())
    }

    /// Each rayon worker opens its own dataset since GDAL handles cannot be shared
    #[cfg(feature = "parallel")]
    fn materialize_parallel(
        &self,
        path: &Path,
        specs: &[TileSpec],
        materializer: &Materializer<'_>,
        session_id: &str,
    ) -> TilerResult<()> {
        use rayon::prelude::*;

        let run = || {
            specs.par_iter().try_for_each_init(
                || RasterHandle::open(path),
                |raster, spec| {
                    let raster = raster.as_ref().map_err(|e| {
                        TilerError::Read(format!("Worker could not open raster: {}", e))
                    })?;
                    let tile = materializer.materialize(raster, spec)?;
                    self.sessions.record_tile(session_id, tile)
                },
            )
        };

        match &self.pool {
            Some(pool) => pool.install(run),
            None => run(),
        }
    }

    /// Finalized record of a session
    pub fn get_session(&self, session_id: &str) -> TilerResult<SessionRecord> {
        self.sessions.get_session(session_id)
    }

    /// Removes a session and its tiles; `NotFound` for unknown sessions
    pub fn delete_session(&self, session_id: &str) -> TilerResult<()> {
        self.sessions.delete_session(session_id)
    }

    pub fn open_tile_file(&self, session_id: &str, file_name: &str) -> TilerResult<File> {
        self.sessions.open_tile_file(session_id, file_name)
    }

    /// Whole content of one tile file
    pub fn read_tile(&self, session_id: &str, file_name: &str) -> TilerResult<Vec<u8>> {
        let mut bytes = Vec::new();
        std::io::Read::read_to_end(&mut self.open_tile_file(session_id, file_name)?, &mut bytes)?;
        Ok(bytes)
    }

    pub fn list_tiles(&self, session_id: &str) -> TilerResult<Vec<TileFileInfo>> {
        self.sessions.list_tiles(session_id)
    }

    /// Streams a ZIP of the session's tiles into `writer`
    pub fn write_archive<W: Write + Seek>(&self, session_id: &str, writer: W) -> TilerResult<W> {
        let record = self.sessions.get_session(session_id)?;
        write_session_archive(&record, writer)
    }

    pub fn manifest_json(&self, session_id: &str) -> TilerResult<String> {
        manifest::manifest_json(&self.sessions.get_session(session_id)?)
    }

    /// Removes sessions older than the configured retention
    pub fn sweep_expired(&self) -> TilerResult<Vec<String>> {
        match self.config.retention_secs {
            Some(secs) => {
                let secs = i64::try_from(secs).unwrap_or(i64::MAX).min(MAX_RETENTION_SECS);
                let max_age = chrono::Duration::seconds(secs);
                self.sessions.sweep_expired(max_age)
            }
            None => Ok(Vec::new()),
        }
    }

    /// Removes every session; returns how many were removed
    pub fn shutdown(&self) -> TilerResult<usize> {
        let removed = self.sessions.clear()?;
        log::info!("Tiler shut down, removed {} sessions", removed);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiler(dir: &Path) -> Tiler {
        Tiler::new(TilerConfig::with_tiles_root(dir.join("tiles"))).unwrap()
    }

    #[test]
    fn test_new_creates_tiles_root() {
        let dir = tempfile::tempdir().unwrap();
        let tiler = tiler(dir.path());
        assert!(dir.path().join("tiles").is_dir());
        assert_eq!(tiler.sessions().tiles_root(), dir.path().join("tiles"));
    }

    #[test]
    fn test_invalid_parameters_rejected_before_io() {
        let dir = tempfile::tempdir().unwrap();
        let tiler = tiler(dir.path());
        let missing = || RasterInput::Path(dir.path().join("does_not_exist.tif"));

        let cases = [
            (0, 256, 0.0),
            (256, -1, 0.0),
            (256, 256, 1.0),
            (256, 256, -0.1),
            (256, 256, f64::NAN),
        ];
        for (w, h, overlap) in cases {
            let result = tiler.process(missing(), w, h, overlap);
            assert!(
                matches!(result, Err(TilerError::InvalidParameters(_))),
                "({}, {}, {}) gave {:?}",
                w, h, overlap, result
            );
        }

        // Valid parameters reach the missing file
        assert!(matches!(tiler.process(missing(), 256, 256, 0.0), Err(TilerError::Read(_))));
        assert_eq!(fs::read_dir(dir.path().join("tiles")).unwrap().count(), 0);
    }

    #[test]
    fn test_unknown_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let tiler = tiler(dir.path());

        assert!(matches!(tiler.get_session("nope"), Err(TilerError::NotFound(_))));
        assert!(matches!(tiler.delete_session("nope"), Err(TilerError::NotFound(_))));
        assert!(matches!(tiler.list_tiles("nope"), Err(TilerError::NotFound(_))));
        assert!(matches!(tiler.manifest_json("nope"), Err(TilerError::NotFound(_))));
        assert!(matches!(
            tiler.write_archive("nope", std::io::Cursor::new(Vec::new())),
            Err(TilerError::NotFound(_))
        ));
    }

    #[test]
    fn test_dedicated_pool() {
        let dir = tempfile::tempdir().unwrap();
        let config = TilerConfig {
            max_workers: Some(2),
            parallel: true,
            ..TilerConfig::with_tiles_root(dir.path())
        };
        let tiler = Tiler::new(config).unwrap();
        assert_eq!(tiler.pool.as_ref().map(|pool| pool.current_num_threads()), Some(2));
    }

    #[test]
    fn test_sweep_without_retention() {
        let dir = tempfile::tempdir().unwrap();
        let config = TilerConfig {
            retention_secs: None,
            ..TilerConfig::with_tiles_root(dir.path())
        };
        let tiler = Tiler::new(config).unwrap();
        tiler.sessions().create_session("kept", GridParams::new(8, 8, 0.0).unwrap()).unwrap();
        assert!(tiler.sweep_expired().unwrap().is_empty());
        assert_eq!(tiler.shutdown().unwrap(), 1);
    }
}
