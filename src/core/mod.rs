//! Core tiling modules

pub mod crs;
pub mod grid;
pub mod materialize;
pub mod pipeline;
pub mod session;

// Re-export main types
pub use crs::{
    detect_and_build_transform, CrsNormalizer, PixelTransform, Projection, DENSIFY_POINTS_PER_EDGE,
};
pub use grid::{plan_grid, GridParams, GridPlanner};
pub use materialize::{materialize, tile_file_name, TileMaterializer};
pub use pipeline::Tiler;
pub use session::{InMemorySessionStore, SessionManager, SessionSlot, SessionStore};
