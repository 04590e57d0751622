//! Durable storage for the current and pending sharing configurations.
//!
//! There is exactly one sharing relationship system-wide, so the store is two
//! fixed slots rather than a keyed table. The slots are independent: writing
//! current never touches pending.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::sharing::model::SharingConfig;

pub const CURRENT_FILE: &str = "connection_sharing.json";
pub const PENDING_FILE: &str = "connection_sharing.pending.json";

/// Single-writer storage of the current and pending slots.
///
/// Callers serialise writes themselves (the manager holds its lock around
/// every read-modify-write).
pub trait ConfigStore: Send + Sync {
    /// The current configuration, or the inactive default if none was ever written.
    fn read_current(&self) -> Result<SharingConfig>;
    fn read_pending(&self) -> Result<Option<SharingConfig>>;
    fn write_current(&mut self, cfg: &SharingConfig) -> Result<()>;
    fn write_pending(&mut self, cfg: &SharingConfig) -> Result<()>;
    fn clear_pending(&mut self) -> Result<()>;
}

/// JSON files under a state directory, replaced atomically via rename.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Open (and create if needed) the state directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read_slot(&self, name: &str) -> Result<Option<SharingConfig>> {
        let contents = match fs::read_to_string(self.dir.join(name)) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&contents)?))
    }

    fn write_slot(&self, name: &str, cfg: &SharingConfig) -> Result<()> {
        let path = self.dir.join(name);
        let tmp = self.dir.join(format!("{}.tmp", name));

        let json = serde_json::to_vec_pretty(cfg)?;
        let mut file = File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

impl ConfigStore for JsonFileStore {
    fn read_current(&self) -> Result<SharingConfig> {
        Ok(self.read_slot(CURRENT_FILE)?.unwrap_or_default())
    }

    fn read_pending(&self) -> Result<Option<SharingConfig>> {
        self.read_slot(PENDING_FILE)
    }

    fn write_current(&mut self, cfg: &SharingConfig) -> Result<()> {
        self.write_slot(CURRENT_FILE, cfg)
    }

    fn write_pending(&mut self, cfg: &SharingConfig) -> Result<()> {
        self.write_slot(PENDING_FILE, cfg)
    }

    fn clear_pending(&mut self) -> Result<()> {
        match fs::remove_file(self.dir.join(PENDING_FILE)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory store for state machine tests.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryStore {
    current: Option<SharingConfig>,
    pending: Option<SharingConfig>,
    broken: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

#[cfg(test)]
impl MemoryStore {
    /// While the returned flag is set, every write fails.
    pub fn write_failures(&self) -> std::sync::Arc<std::sync::atomic::AtomicBool> {
        self.broken.clone()
    }

    fn check_writable(&self) -> Result<()> {
        if self.broken.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(std::io::Error::other("disk full").into());
        }
        Ok(())
    }
}

#[cfg(test)]
impl ConfigStore for MemoryStore {
    fn read_current(&self) -> Result<SharingConfig> {
        Ok(self.current.clone().unwrap_or_default())
    }

    fn read_pending(&self) -> Result<Option<SharingConfig>> {
        Ok(self.pending.clone())
    }

    fn write_current(&mut self, cfg: &SharingConfig) -> Result<()> {
        self.check_writable()?;
        self.current = Some(cfg.clone());
        Ok(())
    }

    fn write_pending(&mut self, cfg: &SharingConfig) -> Result<()> {
        self.check_writable()?;
        self.pending = Some(cfg.clone());
        Ok(())
    }

    fn clear_pending(&mut self) -> Result<()> {
        self.check_writable()?;
        self.pending = None;
        Ok(())
    }
}
