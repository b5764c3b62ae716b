use crate::types::{SessionRecord, TilerError, TilerResult};
use std::fs::File;
use std::io::{self, Seek, Write};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Download name of a session's tile bundle
pub fn archive_file_name(session_id: &str) -> String {
    format!("tiles_{}.zip", session_id)
}

/// Writes every tile of `record` into a deflate-compressed ZIP.
///
/// Entries are named by tile file name, in tile id order. Returns the
/// underlying writer once the central directory has been written.
pub fn write_session_archive<W: Write + Seek>(record: &SessionRecord, writer: W) -> TilerResult<W> {
    let mut zip = ZipWriter::new(writer);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    for tile in &record.tiles {
        zip.start_file(tile.file_name.as_str(), options)
            .map_err(|e| TilerError::Archive(format!("Failed to add {}: {}", tile.file_name, e)))?;

        let mut file = File::open(&tile.file_path).map_err(|e| {
            TilerError::NotFound(format!(
                "tile file {} is missing: {}",
                tile.file_path.display(),
                e
            ))
        })?;
        io::copy(&mut file, &mut zip).map_err(|e| {
            TilerError::Archive(format!("Failed to compress {}: {}", tile.file_name, e))
        })?;
    }

    let writer = zip
        .finish()
        .map_err(|e| TilerError::Archive(format!("Failed to finish archive: {}", e)))?;

    log::info!("Archived {} tiles of session {}", record.total_tiles(), record.session_id);
    Ok(writer)
}
