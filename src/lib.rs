//! rasterlab: georeferenced raster tiling
//!
//! Splits a GeoTIFF (or any GDAL-readable raster) into a grid of
//! overlapping, independently georeferenced GeoTIFF tiles, reports each
//! tile's footprint in WGS84 latitude/longitude and keeps the results in
//! per-request sessions.

pub mod config;
pub mod core;
pub mod io;
pub mod types;

// Re-export main types and functions for easier access
pub use config::{EdgeMode, TileCompression, TilerConfig};
pub use crate::core::{
    detect_and_build_transform, materialize, plan_grid, CrsNormalizer, GridParams, PixelTransform,
    Tiler,
};
pub use crate::io::{RasterHandle, RasterInput};
pub use types::{
    BoundingBox, GeoTransform, PixelWindow, SessionRecord, TileFileInfo, TileResult, TileSpec,
    TilerError, TilerResult,
};

#[cfg(feature = "python")]
mod python {
    use super::*;
    use pyo3::prelude::*;
    use pyo3::types::{PyBytes, PyDict, PyList};

    fn to_py_err(error: TilerError) -> PyErr {
        match error {
            TilerError::InvalidParameters(_) => {
                PyErr::new::<pyo3::exceptions::PyValueError, _>(error.to_string())
            }
            TilerError::NotFound(_) => {
                PyErr::new::<pyo3::exceptions::PyKeyError, _>(error.to_string())
            }
            _ => PyErr::new::<pyo3::exceptions::PyRuntimeError, _>(error.to_string()),
        }
    }

    fn bbox_dict<'py>(py: Python<'py>, bbox: &BoundingBox) -> PyResult<&'py PyDict> {
        let dict = PyDict::new(py);
        dict.set_item("min_lat", bbox.min_lat)?;
        dict.set_item("max_lat", bbox.max_lat)?;
        dict.set_item("min_lon", bbox.min_lon)?;
        dict.set_item("max_lon", bbox.max_lon)?;
        Ok(dict)
    }

    fn record_dict(py: Python<'_>, record: &SessionRecord) -> PyResult<PyObject> {
        let tiles = PyList::empty(py);
        for tile in &record.tiles {
            let entry = PyDict::new(py);
            entry.set_item("id", tile.id)?;
            entry.set_item("file_name", &tile.file_name)?;
            entry.set_item(
                "window",
                (
                    tile.window.col_start,
                    tile.window.row_start,
                    tile.window.col_end,
                    tile.window.row_end,
                ),
            )?;
            entry.set_item("bounding_box", bbox_dict(py, &tile.bounding_box)?)?;
            tiles.append(entry)?;
        }

        let dict = PyDict::new(py);
        dict.set_item("session_id", &record.session_id)?;
        dict.set_item("created_at", record.created_at.to_rfc3339())?;
        dict.set_item("original_bounding_box", bbox_dict(py, &record.original_bounding_box)?)?;
        dict.set_item("tile_width", record.tile_width)?;
        dict.set_item("tile_height", record.tile_height)?;
        dict.set_item("overlap_ratio", record.overlap_ratio)?;
        dict.set_item("total_tiles", record.total_tiles())?;
        dict.set_item("storage_location", record.storage_location.to_string_lossy().into_owned())?;
        dict.set_item("tiles", tiles)?;
        Ok(dict.into())
    }

    /// Python wrapper for Tiler
    #[pyclass(name = "Tiler")]
    struct PyTiler {
        inner: Tiler,
    }

    #[pymethods]
    impl PyTiler {
        #[new]
        #[pyo3(signature = (tiles_dir=None))]
        fn new(tiles_dir: Option<String>) -> PyResult<Self> {
            let mut config = TilerConfig::from_env().map_err(to_py_err)?;
            if let Some(dir) = tiles_dir {
                config.tiles_root = dir.into();
            }
            let inner = Tiler::new(config).map_err(to_py_err)?;
            Ok(PyTiler { inner })
        }

        /// Tiles either a file path or uploaded bytes
        #[pyo3(signature = (
            path=None,
            data=None,
            file_name=None,
            tile_width=256,
            tile_height=256,
            overlap=0.0
        ))]
        fn process(
            &self,
            py: Python<'_>,
            path: Option<String>,
            data: Option<&PyBytes>,
            file_name: Option<String>,
            tile_width: i64,
            tile_height: i64,
            overlap: f64,
        ) -> PyResult<PyObject> {
            let input = match (path, data) {
                (Some(path), None) => RasterInput::Path(path.into()),
                (None, Some(data)) => RasterInput::Bytes {
                    data: data.as_bytes().to_vec(),
                    file_name,
                },
                _ => {
                    return Err(PyErr::new::<pyo3::exceptions::PyValueError, _>(
                        "Exactly one of path or data is required",
                    ))
                }
            };

            let record = py
                .allow_threads(|| self.inner.process(input, tile_width, tile_height, overlap))
                .map_err(to_py_err)?;
            record_dict(py, &record)
        }

        fn get_session(&self, py: Python<'_>, session_id: &str) -> PyResult<PyObject> {
            let record = self.inner.get_session(session_id).map_err(to_py_err)?;
            record_dict(py, &record)
        }

        fn delete_session(&self, session_id: &str) -> PyResult<()> {
            self.inner.delete_session(session_id).map_err(to_py_err)
        }

        fn read_tile<'py>(
            &self,
            py: Python<'py>,
            session_id: &str,
            file_name: &str,
        ) -> PyResult<&'py PyBytes> {
            let bytes = self.inner.read_tile(session_id, file_name).map_err(to_py_err)?;
            Ok(PyBytes::new(py, &bytes))
        }

        /// `(file_name, size_bytes)` for every tile
        fn list_tiles(&self, session_id: &str) -> PyResult<Vec<(String, u64)>> {
            let tiles = self.inner.list_tiles(session_id).map_err(to_py_err)?;
            Ok(tiles.into_iter().map(|t| (t.file_name, t.size_bytes)).collect())
        }

        fn __repr__(&self) -> String {
            format!("Tiler(tiles_dir='{}')", self.inner.config().tiles_root.display())
        }
    }

    /// Python module definition
    #[pymodule]
    fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
        m.add_class::<PyTiler>()?;
        Ok(())
    }
}
