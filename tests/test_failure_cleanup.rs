mod common;

use common::SyntheticRaster;
use rasterlab::core::{InMemorySessionStore, SessionSlot, SessionStore};
use gdal::{Dataset, Metadata};
use rasterlab::{RasterInput, Tiler, TilerConfig, TilerError, TilerResult};
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

fn session_dirs(root: &Path) -> usize {
    std::fs::read_dir(root).map(|entries| entries.count()).unwrap_or(0)
}

#[test]
fn test_raster_without_crs_is_rejected() {
    common::init_logging();
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("tiles");
    let tiler = Tiler::new(TilerConfig::with_tiles_root(&root)).unwrap();

    let ungeoreferenced = SyntheticRaster {
        epsg: None,
        geo_transform: None,
        ..SyntheticRaster::utm(64, 64)
    }
    .write(&dir.path().join("plain.tif"));
    let result = tiler.process(RasterInput::Path(ungeoreferenced), 32, 32, 0.0);
    assert!(matches!(result, Err(TilerError::UnknownCrs(_))), "{:?}", result);

    let no_projection = SyntheticRaster { epsg: None, ..SyntheticRaster::utm(64, 64) }
        .write(&dir.path().join("no_projection.tif"));
    let result = tiler.process(RasterInput::Path(no_projection), 32, 32, 0.0);
    assert!(matches!(result, Err(TilerError::UnknownCrs(_))), "{:?}", result);

    assert_eq!(session_dirs(&root), 0);
}

#[test]
fn test_unreadable_upload() {
    common::init_logging();
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("tiles");
    let tiler = Tiler::new(TilerConfig::with_tiles_root(&root)).unwrap();

    let garbage = RasterInput::Bytes {
        data: b"definitely not a GeoTIFF".to_vec(),
        file_name: Some("bad.tif".to_string()),
    };
    assert!(matches!(tiler.process(garbage, 256, 256, 0.0), Err(TilerError::Read(_))));
    assert_eq!(session_dirs(&root), 0);
}

/// Store that blocks the manifest path of every new session
struct ManifestBlockingStore {
    inner: InMemorySessionStore,
}

impl SessionStore for ManifestBlockingStore {
    fn insert(&self, slot: Arc<SessionSlot>) -> TilerResult<()> {
        std::fs::create_dir(slot.storage_location.join("session.json")).unwrap();
        self.inner.insert(slot)
    }

    fn get(&self, session_id: &str) -> Option<Arc<SessionSlot>> {
        self.inner.get(session_id)
    }

    fn remove(&self, session_id: &str) -> Option<Arc<SessionSlot>> {
        self.inner.remove(session_id)
    }

    fn session_ids(&self) -> Vec<String> {
        self.inner.session_ids()
    }
}

#[test]
fn test_failed_session_is_removed() {
    common::init_logging();
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("tiles");
    let raster = SyntheticRaster::utm(128, 128).write(&dir.path().join("scene.tif"));
    let store = Arc::new(ManifestBlockingStore { inner: InMemorySessionStore::new() });
    let tiler = Tiler::with_store(
        TilerConfig {
            write_manifest: true,
            ..TilerConfig::with_tiles_root(&root)
        },
        store.clone(),
    )
    .unwrap();

    let result = tiler.process(RasterInput::Path(raster), 64, 64, 0.0);
    assert!(matches!(result, Err(TilerError::Write(_))), "{:?}", result);

    // Tiles were written, then removed together with the session
    assert!(store.session_ids().is_empty());
    assert_eq!(session_dirs(&root), 0);
}

/// Overwrites one compressed strip of band 1 so decoding it fails
fn corrupt_strip(path: &Path, strip: usize) {
    let (offset, size) = {
        let dataset = Dataset::open(path).expect("reopen raster");
        let band = dataset.rasterband(1).expect("band");
        let item = |key: String| -> u64 {
            band.metadata_item(&key, "TIFF")
                .and_then(|value| value.parse().ok())
                .unwrap_or_else(|| panic!("missing {}", key))
        };
        (item(format!("BLOCK_OFFSET_0_{}", strip)), item(format!("BLOCK_SIZE_0_{}", strip)))
    };

    let mut file = OpenOptions::new().write(true).open(path).expect("open for corruption");
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(&vec![0xFF; size as usize]).unwrap();
}

#[test]
fn test_read_failure_after_tiles_written() {
    common::init_logging();
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("tiles");

    // Four 64-row strips, one per tile row; only the last one is damaged
    let raster = SyntheticRaster { bands: 1, ..SyntheticRaster::utm(64, 256) }.write_with_options(
        &dir.path().join("damaged.tif"),
        &[
            ("COMPRESS", "DEFLATE"),
            ("BLOCKYSIZE", "64"),
        ],
    );
    corrupt_strip(&raster, 3);

    let store = Arc::new(InMemorySessionStore::new());
    let tiler = Tiler::with_store(
        TilerConfig {
            parallel: false,
            ..TilerConfig::with_tiles_root(&root)
        },
        store.clone(),
    )
    .unwrap();

    let result = tiler.process(RasterInput::Path(raster), 64, 64, 0.0);
    assert!(matches!(result, Err(TilerError::Read(_))), "{:?}", result);

    // The first three tiles were written, then removed together with the session
    assert!(store.session_ids().is_empty());
    assert_eq!(session_dirs(&root), 0);
}

#[test]
fn test_invalid_parameters_touch_nothing() {
    common::init_logging();
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("tiles");
    let raster = SyntheticRaster::utm(64, 64).write(&dir.path().join("scene.tif"));
    let tiler = Tiler::new(TilerConfig::with_tiles_root(&root)).unwrap();

    let cases = [(0, 64, 0.0), (64, 0, 0.0), (-5, 64, 0.0), (64, 64, 1.0), (64, 64, 1.5)];
    for (w, h, overlap) in cases {
        let result = tiler.process(RasterInput::Path(raster.clone()), w, h, overlap);
        assert!(matches!(result, Err(TilerError::InvalidParameters(_))));
    }
    assert_eq!(session_dirs(&root), 0);
}
