//! Raster input and tile output

pub mod archive;
pub mod manifest;
pub mod raster;
pub mod tile_writer;

pub use archive::{archive_file_name, write_session_archive};
pub use manifest::{manifest_json, write_manifest, MANIFEST_FILE_NAME};
pub use raster::{BandData, PixelBlock, PixelDataType, RasterHandle, RasterInput, RasterSource};
pub use tile_writer::{GeoTiffTileWriter, TileSink};
