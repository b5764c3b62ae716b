use crate::core::grid::GridParams;
use crate::types::{BoundingBox, SessionRecord, TileFileInfo, TileResult, TilerError, TilerResult};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// Mutable state of one session while its tiles are being produced
#[derive(Debug)]
pub struct SessionSlot {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub params: GridParams,
    pub storage_location: PathBuf,
    tiles: Mutex<Vec<TileResult>>,
    record: RwLock<Option<SessionRecord>>,
}

impl SessionSlot {
    fn new(session_id: String, params: GridParams, storage_location: PathBuf) -> Self {
        Self {
            session_id,
            created_at: Utc::now(),
            params,
            storage_location,
            tiles: Mutex::new(Vec::new()),
            record: RwLock::new(None),
        }
    }

    /// The finalized record, if processing completed
    pub fn record(&self) -> Option<SessionRecord> {
        self.record.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn recorded_tiles(&self) -> usize {
        self.tiles.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Registry of sessions, injected into the [`SessionManager`]
pub trait SessionStore: Send + Sync {
    /// Adds a session; fails if the id is already taken
    fn insert(&self, slot: Arc<SessionSlot>) -> TilerResult<()>;

    fn get(&self, session_id: &str) -> Option<Arc<SessionSlot>>;

    fn remove(&self, session_id: &str) -> Option<Arc<SessionSlot>>;

    fn session_ids(&self) -> Vec<String>;
}

/// Process-local session store
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, Arc<SessionSlot>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for InMemorySessionStore {
    fn insert(&self, slot: Arc<SessionSlot>) -> TilerResult<()> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if sessions.contains_key(&slot.session_id) {
            return Err(TilerError::Processing(format!(
                "Session id collision: {}",
                slot.session_id
            )));
        }
        sessions.insert(slot.session_id.clone(), slot);
        Ok(())
    }

    fn get(&self, session_id: &str) -> Option<Arc<SessionSlot>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).get(session_id).cloned()
    }

    fn remove(&self, session_id: &str) -> Option<Arc<SessionSlot>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner).remove(session_id)
    }

    fn session_ids(&self) -> Vec<String> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect()
    }
}

/// Creates, tracks and removes processing sessions and their tile directories
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    tiles_root: PathBuf,
}

impl SessionManager {
    pub fn new<P: Into<PathBuf>>(tiles_root: P, store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            tiles_root: tiles_root.into(),
        }
    }

    /// Manager backed by a fresh [`InMemorySessionStore`]
    pub fn in_memory<P: Into<PathBuf>>(tiles_root: P) -> Self {
        Self::new(tiles_root, Arc::new(InMemorySessionStore::new()))
    }

    pub fn tiles_root(&self) -> &Path {
        &self.tiles_root
    }

    /// Opens a new session and creates its storage directory.
    ///
    /// Ids look like `20240131_154502_scene_3f9c0a1b2c4d`: creation time,
    /// sanitized label and 48 random bits.
    pub fn create_session(&self, label: &str, params: GridParams) -> TilerResult<String> {
        fs::create_dir_all(&self.tiles_root)?;

        let session_id = format!(
            "{}_{}_{}",
            Utc::now().format("%Y%m%d_%H%M%S"),
            sanitize_label(label),
            &uuid::Uuid::new_v4().simple().to_string()[..12]
        );
        let storage_location = self.tiles_root.join(&session_id);

        // Exclusive create: an id collision must never share a directory
        fs::create_dir(&storage_location).map_err(|e| {
            TilerError::Write(format!(
                "Failed to create session directory {}: {}",
                storage_location.display(),
                e
            ))
        })?;

        let slot = Arc::new(SessionSlot::new(session_id.clone(), params, storage_location.clone()));
        if let Err(e) = self.store.insert(slot) {
            remove_dir_if_present(&storage_location)?;
            return Err(e);
        }

        log::info!("Created session {} in {}", session_id, storage_location.display());
        Ok(session_id)
    }

    /// Appends a tile; safe to call from parallel workers in any order
    pub fn record_tile(&self, session_id: &str, tile: TileResult) -> TilerResult<()> {
        let slot = self.slot(session_id)?;
        // Held across the push so finalize cannot take the list in between
        let record = slot.record.read().unwrap_or_else(PoisonError::into_inner);
        if record.is_some() {
            return Err(TilerError::SessionFinalized(session_id.to_string()));
        }
        slot.tiles.lock().unwrap_or_else(PoisonError::into_inner).push(tile);
        Ok(())
    }

    /// Closes a session, sorting its tiles by id
    pub fn finalize(
        &self,
        session_id: &str,
        original_bounding_box: BoundingBox,
    ) -> TilerResult<SessionRecord> {
        let slot = self.slot(session_id)?;
        let mut record_guard = slot.record.write().unwrap_or_else(PoisonError::into_inner);
        if record_guard.is_some() {
            return Err(TilerError::SessionFinalized(session_id.to_string()));
        }

        let mut tiles =
            std::mem::take(&mut *slot.tiles.lock().unwrap_or_else(PoisonError::into_inner));
        if tiles.is_empty() {
            return Err(TilerError::EmptySession(format!(
                "session {} produced no tiles",
                session_id
            )));
        }
        tiles.sort_by_key(|tile| tile.id);

        let record = SessionRecord {
            session_id: slot.session_id.clone(),
            created_at: slot.created_at,
            original_bounding_box,
            tiles,
            tile_width: slot.params.tile_width,
            tile_height: slot.params.tile_height,
            overlap_ratio: slot.params.overlap_ratio,
            storage_location: slot.storage_location.clone(),
        };
        *record_guard = Some(record.clone());

        log::info!("Finalized session {} with {} tiles", session_id, record.total_tiles());
        Ok(record)
    }

    /// Finalized record of a session
    pub fn get_session(&self, session_id: &str) -> TilerResult<SessionRecord> {
        self.slot(session_id)?
            .record()
            .ok_or_else(|| {
                TilerError::NotFound(format!("session {} is still processing", session_id))
            })
    }

    /// Removes a session and its tiles. Idempotent: unknown or already
    /// cleaned sessions are not an error. Only directories of registered
    /// sessions are ever deleted.
    pub fn cleanup(&self, session_id: &str) -> TilerResult<()> {
        if !is_valid_session_id(session_id) {
            log::warn!("Refusing to clean up invalid session id {:?}", session_id);
            return Ok(());
        }

        match self.store.remove(session_id) {
            Some(slot) => {
                remove_dir_if_present(&slot.storage_location)?;
                log::info!("Cleaned up session {}", session_id);
            }
            None => log::debug!("Session {} was already cleaned up", session_id),
        }
        Ok(())
    }

    /// Removes a known session; `NotFound` if it does not exist
    pub fn delete_session(&self, session_id: &str) -> TilerResult<()> {
        self.slot(session_id)?;
        self.cleanup(session_id)
    }

    /// Tile files of a finalized session with their sizes on disk
    pub fn list_tiles(&self, session_id: &str) -> TilerResult<Vec<TileFileInfo>> {
        let record = self.get_session(session_id)?;
        record
            .tiles
            .iter()
            .map(|tile| {
                let metadata = fs::metadata(&tile.file_path).map_err(|e| {
                    TilerError::NotFound(format!("tile file {} is missing: {}", tile.file_name, e))
                })?;
                Ok(TileFileInfo {
                    file_name: tile.file_name.clone(),
                    size_bytes: metadata.len(),
                })
            })
            .collect()
    }

    /// Opens one tile of a finalized session for streaming
    pub fn open_tile_file(&self, session_id: &str, file_name: &str) -> TilerResult<File> {
        let record = self.get_session(session_id)?;
        let tile = record
            .tile_by_name(file_name)
            .ok_or_else(|| {
                TilerError::NotFound(format!("tile {} in session {}", file_name, session_id))
            })?;

        File::open(&tile.file_path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => {
                TilerError::NotFound(format!("tile file {}", tile.file_path.display()))
            }
            _ => TilerError::Io(e),
        })
    }

    /// Cleans up every session created more than `max_age` ago
    pub fn sweep_expired(&self, max_age: Duration) -> TilerResult<Vec<String>> {
        let cutoff = Utc::now() - max_age;
        let mut expired = Vec::new();

        for session_id in self.store.session_ids() {
            let Some(slot) = self.store.get(&session_id) else {
                continue;
            };
            if slot.created_at < cutoff {
                self.cleanup(&session_id)?;
                expired.push(session_id);
            }
        }

        if !expired.is_empty() {
            log::info!("Retention sweep removed {} sessions", expired.len());
        }
        Ok(expired)
    }

    /// Cleans up all sessions, for process shutdown
    pub fn clear(&self) -> TilerResult<usize> {
        let ids = self.store.session_ids();
        for session_id in &ids {
            self.cleanup(session_id)?;
        }
        Ok(ids.len())
    }

    fn slot(&self, session_id: &str) -> TilerResult<Arc<SessionSlot>> {
        if !is_valid_session_id(session_id) {
            return Err(TilerError::NotFound(format!("session {:?}", session_id)));
        }
        self.store
            .get(session_id)
            .ok_or_else(|| TilerError::NotFound(format!("session {}", session_id)))
    }
}

/// Keeps ids usable as a single path component
fn is_valid_session_id(session_id: &str) -> bool {
    !session_id.is_empty()
        && session_id != "."
        && session_id != ".."
        && !session_id.contains(['/', '\\'])
        && !session_id.contains("..")
}

fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .take(40)
        .collect();
    let cleaned = cleaned.trim_matches('_');
    if cleaned.is_empty() {
        "raster".to_string()
    } else {
        cleaned.to_string()
    }
}

fn remove_dir_if_present(path: &Path) -> TilerResult<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(TilerError::Io(e)),
    }
}
