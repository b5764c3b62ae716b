use crate::types::{TilerError, TilerResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// GeoTIFF compression applied to written tiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TileCompression {
    None,
    Lzw,
    Deflate,
}

impl TileCompression {
    /// Value of the GTiff `COMPRESS` creation option
    pub fn gdal_value(&self) -> Option<&'static str> {
        match self {
            TileCompression::None => None,
            TileCompression::Lzw => Some("LZW"),
            TileCompression::Deflate => Some("DEFLATE"),
        }
    }
}

impl FromStr for TileCompression {
    type Err = TilerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(TileCompression::None),
            "lzw" => Ok(TileCompression::Lzw),
            "deflate" => Ok(TileCompression::Deflate),
            other => Err(TilerError::InvalidParameters(format!("Unknown compression: {}", other))),
        }
    }
}

/// What happens to tiles cut short by the raster boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeMode {
    /// Write the clipped window as a smaller tile
    Clip,
    /// Write a full-size tile, filling the missing area with nodata (or zero)
    Pad,
}

impl FromStr for EdgeMode {
    type Err = TilerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "clip" => Ok(EdgeMode::Clip),
            "pad" => Ok(EdgeMode::Pad),
            other => Err(TilerError::InvalidParameters(format!("Unknown edge mode: {}", other))),
        }
    }
}

/// Tiling engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TilerConfig {
    /// Directory holding one sub-directory per session
    pub tiles_root: PathBuf,
    pub compression: TileCompression,
    pub edge_mode: EdgeMode,
    /// Materialize tiles on the rayon pool (needs the `parallel` feature)
    pub parallel: bool,
    /// Size of a dedicated worker pool; `None` uses the global rayon pool
    pub max_workers: Option<usize>,
    /// Sessions older than this are removed by `Tiler::sweep_expired`
    pub retention_secs: Option<u64>,
    /// Write `session.json` next to the tiles
    pub write_manifest: bool,
}

impl Default for TilerConfig {
    fn default() -> Self {
        Self {
            tiles_root: PathBuf::from("tiles"),
            compression: TileCompression::Lzw,
            edge_mode: EdgeMode::Clip,
            parallel: cfg!(feature = "parallel"),
            max_workers: None,
            retention_secs: Some(24 * 60 * 60),
            write_manifest: false,
        }
    }
}

impl TilerConfig {
    /// Config rooted at `tiles_root` with every other field defaulted
    pub fn with_tiles_root<P: Into<PathBuf>>(tiles_root: P) -> Self {
        Self {
            tiles_root: tiles_root.into(),
            ..Self::default()
        }
    }

    /// Defaults overridden by `RASTERLAB_*` environment variables
    pub fn from_env() -> TilerResult<Self> {
        let mut config = Self::default();

        if let Some(dir) = env_var("RASTERLAB_TILES_DIR") {
            config.tiles_root = PathBuf::from(dir);
        }
        if let Some(value) = env_var("RASTERLAB_COMPRESSION") {
            config.compression = value.parse()?;
        }
        if let Some(value) = env_var("RASTERLAB_EDGE_MODE") {
            config.edge_mode = value.parse()?;
        }
        if let Some(value) = env_var("RASTERLAB_PARALLEL") {
            config.parallel = parse_env("RASTERLAB_PARALLEL", &value)?;
        }
        if let Some(value) = env_var("RASTERLAB_MAX_WORKERS") {
            config.max_workers = Some(parse_env("RASTERLAB_MAX_WORKERS", &value)?);
        }
        if let Some(value) = env_var("RASTERLAB_RETENTION_SECS") {
            config.retention_secs = Some(parse_env("RASTERLAB_RETENTION_SECS", &value)?);
        }
        if let Some(value) = env_var("RASTERLAB_WRITE_MANIFEST") {
            config.write_manifest = parse_env("RASTERLAB_WRITE_MANIFEST", &value)?;
        }

        config.validate()?;
        log::debug!("Loaded tiler config from environment: {:?}", config);
        Ok(config)
    }

    pub fn validate(&self) -> TilerResult<()> {
        if self.tiles_root.as_os_str().is_empty() {
            return Err(TilerError::InvalidParameters("tiles_root must not be empty".to_string()));
        }
        if self.max_workers == Some(0) {
            return Err(TilerError::InvalidParameters("max_workers must be at least 1".to_string()));
        }
        if self.parallel && !cfg!(feature = "parallel") {
            log::warn!(
                "Parallel tiling requested but the `parallel` feature is disabled; \
                 tiles will be written sequentially"
            );
        }
        Ok(())
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> TilerResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| {
            TilerError::InvalidParameters(format!("{} has an invalid value: {}", key, value))
        })
}
