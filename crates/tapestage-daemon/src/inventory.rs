//! Tape and drive inventory.
//!
//! The inventory tracks which cartridges exist, where their data files
//! surface once mounted, and how many drives are free. The scheduler
//! reserves a tape before dispatching an executor; reservation implies
//! the cartridge is mounted on a free drive. The executor releases the
//! reservation when its request finishes, leaving the cartridge mounted
//! and the drive idle.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use tapestage_core::types::FileUid;

/// Errors from inventory lookups.
#[derive(Debug, Error)]
pub enum InventoryError {
    /// The tape id is not present in the library.
    #[error("tape {0} is not present in the library")]
    UnknownTape(String),

    /// Filesystem failure while resolving tape data.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Cartridge and drive bookkeeping as seen by the recall core.
pub trait Inventory: Send + Sync {
    /// Path of the tape object holding `uid`'s data on `tape_id`.
    fn tape_path(&self, uid: &FileUid, tape_id: &str) -> Result<PathBuf, InventoryError>;

    /// Starting block of the tape object at `tape_path`.
    ///
    /// Unknown positions order as block zero, which keeps them at the
    /// front of a request instead of failing it.
    fn start_block(&self, tape_path: &Path) -> i64;

    /// Attempts to reserve `tape_id` and a drive for one request
    /// execution. Returns `false` when the tape is unknown, already in
    /// use, or no drive is free.
    fn try_reserve(&self, tape_id: &str) -> bool;

    /// Returns the reservation taken by [`Inventory::try_reserve`]: the
    /// cartridge stays mounted and its drive becomes free.
    fn release(&self, tape_id: &str);
}

/// Inventory over a directory tree of mounted cartridges.
///
/// Every subdirectory of the mount root named like a cartridge id is a
/// mounted tape; the tape object for a file uid lives at a fixed
/// relative path inside it. Start blocks come from a `.startblock`
/// sidecar written by the migration path.
pub struct DirectoryInventory {
    mount_root: PathBuf,
    drives: usize,
    in_use: std::sync::Mutex<HashSet<String>>,
}

impl DirectoryInventory {
    /// Creates an inventory rooted at `mount_root` with `drives`
    /// concurrently usable drives.
    #[must_use]
    pub fn new(mount_root: PathBuf, drives: usize) -> Self {
        Self {
            mount_root,
            drives: drives.max(1),
            in_use: std::sync::Mutex::new(HashSet::new()),
        }
    }

    fn tape_root(&self, tape_id: &str) -> PathBuf {
        self.mount_root.join(tape_id)
    }

    /// Relative location of a uid's tape object inside a cartridge.
    fn object_name(uid: &FileUid) -> String {
        format!(
            "{:08x}-{:08x}-{:08x}-{:016x}",
            uid.fsid_hi, uid.fsid_lo, uid.igen, uid.inum
        )
    }
}

impl Inventory for DirectoryInventory {
    fn tape_path(&self, uid: &FileUid, tape_id: &str) -> Result<PathBuf, InventoryError> {
        let root = self.tape_root(tape_id);
        if !root.is_dir() {
            return Err(InventoryError::UnknownTape(tape_id.to_string()));
        }
        Ok(root.join("data").join(Self::object_name(uid)))
    }

    fn start_block(&self, tape_path: &Path) -> i64 {
        let mut sidecar = tape_path.as_os_str().to_os_string();
        sidecar.push(".startblock");

        std::fs::read_to_string(PathBuf::from(sidecar))
            .ok()
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .unwrap_or(0)
    }

    fn try_reserve(&self, tape_id: &str) -> bool {
        if !self.tape_root(tape_id).is_dir() {
            return false;
        }

        let mut in_use = self.in_use.lock().expect("drive set poisoned");
        if in_use.contains(tape_id) || in_use.len() >= self.drives {
            return false;
        }
        in_use.insert(tape_id.to_string());
        debug!(tape_id, drives_busy = in_use.len(), "tape reserved");
        true
    }

    fn release(&self, tape_id: &str) {
        let mut in_use = self.in_use.lock().expect("drive set poisoned");
        in_use.remove(tape_id);
        debug!(tape_id, drives_busy = in_use.len(), "tape released, drive free");
    }
}
