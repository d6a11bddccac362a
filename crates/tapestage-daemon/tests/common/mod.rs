//! Shared harness for the transparent recall integration tests.
//!
//! Provides in-memory stand-ins for the external collaborators: a
//! scriptable connector, a mock filesystem keyed by file uid, and a
//! tempdir-backed inventory whose tape objects are real files so the
//! executor streams through its production I/O path.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::{Notify, OwnedMutexGuard};

use tapestage_core::DaemonConfig;
use tapestage_core::types::{ConnHandle, FileState, FileUid, RecallEvent};

use tapestage_daemon::connector::{Connector, ConnectorError};
use tapestage_daemon::fs::{FileLockRegistry, FileStat, FsError, FsFile, MigAttr};
use tapestage_daemon::inventory::{Inventory, InventoryError};
use tapestage_daemon::server::{RecallServer, ServerHandle};
use tapestage_daemon::store::{QueueStore, StoreError, StoreLocation};

pub type WriteHook = Box<dyn Fn(&FileUid, u64) + Send + Sync>;

/// One file known to the mock filesystem.
#[derive(Debug, Clone)]
pub struct MockNode {
    pub size: u64,
    pub state: FileState,
    pub tapes: Vec<String>,
    pub regular: bool,
    /// Bytes observed through `write_at`, by offset.
    pub written: Vec<u8>,
    pub attrs_removed: bool,
    pub finished: Vec<FileState>,
}

impl MockNode {
    pub fn migrated(size: u64, tape: &str) -> Self {
        Self {
            size,
            state: FileState::Migrated,
            tapes: vec![tape.to_string()],
            regular: true,
            written: Vec::new(),
            attrs_removed: false,
            finished: Vec::new(),
        }
    }

    pub fn premigrated(size: u64, tape: &str) -> Self {
        Self {
            state: FileState::Premigrated,
            ..Self::migrated(size, tape)
        }
    }

    pub fn resident(size: u64) -> Self {
        Self {
            size,
            state: FileState::Resident,
            tapes: Vec::new(),
            regular: true,
            written: Vec::new(),
            attrs_removed: false,
            finished: Vec::new(),
        }
    }
}

/// Shared state of the mock filesystem.
#[derive(Default)]
pub struct MockFsState {
    files: std::sync::Mutex<HashMap<FileUid, MockNode>>,
    locks: FileLockRegistry,
    write_hook: std::sync::Mutex<Option<WriteHook>>,
    finish_order: std::sync::Mutex<Vec<FileUid>>,
}

impl MockFsState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, uid: FileUid, node: MockNode) {
        self.files.lock().unwrap().insert(uid, node);
    }

    pub fn node(&self, uid: &FileUid) -> Option<MockNode> {
        self.files.lock().unwrap().get(uid).cloned()
    }

    pub fn set_write_hook(&self, hook: WriteHook) {
        *self.write_hook.lock().unwrap() = Some(hook);
    }

    pub fn finish_order(&self) -> Vec<FileUid> {
        self.finish_order.lock().unwrap().clone()
    }
}

struct MockFile {
    fs: Arc<MockFsState>,
    uid: FileUid,
}

#[async_trait]
impl FsFile for MockFile {
    fn stat(&self) -> Result<FileStat, FsError> {
        let files = self.fs.files.lock().unwrap();
        let node = files
            .get(&self.uid)
            .ok_or_else(|| FsError::Io(std::io::Error::from(std::io::ErrorKind::NotFound)))?;
        Ok(FileStat {
            size: node.size,
            mtime_sec: 0,
            mtime_nsec: 0,
            regular: node.regular,
        })
    }

    fn mig_state(&self) -> Result<FileState, FsError> {
        let files = self.fs.files.lock().unwrap();
        let node = files
            .get(&self.uid)
            .ok_or_else(|| FsError::Io(std::io::Error::from(std::io::ErrorKind::NotFound)))?;
        Ok(node.state)
    }

    fn attributes(&self) -> Result<MigAttr, FsError> {
        let files = self.fs.files.lock().unwrap();
        let node = files.get(&self.uid).ok_or(FsError::AttrMissing)?;
        if node.tapes.is_empty() {
            return Err(FsError::AttrMissing);
        }
        Ok(MigAttr {
            tape_ids: node.tapes.clone(),
        })
    }

    async fn lock(&self) -> OwnedMutexGuard<()> {
        self.fs.locks.lock_for(self.uid).lock_owned().await
    }

    fn prepare_recall(&self) -> Result<(), FsError> {
        Ok(())
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize, FsError> {
        if let Some(hook) = self.fs.write_hook.lock().unwrap().as_ref() {
            hook(&self.uid, offset);
        }

        let mut files = self.fs.files.lock().unwrap();
        let node = files
            .get_mut(&self.uid)
            .ok_or_else(|| FsError::Io(std::io::Error::from(std::io::ErrorKind::NotFound)))?;

        let offset = usize::try_from(offset).unwrap();
        let end = offset + data.len();
        if node.written.len() < end {
            node.written.resize(end, 0);
        }
        node.written[offset..end].copy_from_slice(data);
        Ok(data.len())
    }

    fn finish_recall(&self, state: FileState) -> Result<(), FsError> {
        let mut files = self.fs.files.lock().unwrap();
        let node = files
            .get_mut(&self.uid)
            .ok_or_else(|| FsError::Io(std::io::Error::from(std::io::ErrorKind::NotFound)))?;
        node.state = state;
        node.finished.push(state);
        drop(files);

        self.fs.finish_order.lock().unwrap().push(self.uid);
        Ok(())
    }

    fn remove_attributes(&self) -> Result<(), FsError> {
        let mut files = self.fs.files.lock().unwrap();
        if let Some(node) = files.get_mut(&self.uid) {
            node.attrs_removed = true;
            node.tapes.clear();
        }
        Ok(())
    }
}

/// Scriptable connector: tests push events in and read responses out.
pub struct MockConnector {
    fs: Arc<MockFsState>,
    events_tx: mpsc::Sender<RecallEvent>,
    events_rx: tokio::sync::Mutex<mpsc::Receiver<RecallEvent>>,
    responses: std::sync::Mutex<Vec<(FileUid, bool)>>,
    response_notify: Notify,
    next_handle: AtomicI64,
}

impl MockConnector {
    pub fn new(fs: Arc<MockFsState>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(64);
        Arc::new(Self {
            fs,
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
            responses: std::sync::Mutex::new(Vec::new()),
            response_notify: Notify::new(),
            next_handle: AtomicI64::new(1),
        })
    }

    /// Injects a recall event for `uid`.
    pub async fn send_recall(&self, uid: FileUid, to_resident: bool) {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let event = RecallEvent {
            uid,
            filename: None,
            to_resident,
            handle: Some(ConnHandle::new(handle)),
        };
        self.events_tx.send(event).await.unwrap();
    }

    /// Injects a malformed event (inum zero).
    pub async fn send_malformed(&self) {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let event = RecallEvent {
            uid: FileUid::new(1, 1, 1, 0),
            filename: None,
            to_resident: true,
            handle: Some(ConnHandle::new(handle)),
        };
        self.events_tx.send(event).await.unwrap();
    }

    pub fn responses(&self) -> Vec<(FileUid, bool)> {
        self.responses.lock().unwrap().clone()
    }

    /// Waits until at least `count` responses were delivered.
    pub async fn wait_responses(&self, count: usize) -> Vec<(FileUid, bool)> {
        loop {
            let pending = self.response_notify.notified();
            {
                let responses = self.responses.lock().unwrap();
                if responses.len() >= count {
                    return responses.clone();
                }
            }
            pending.await;
        }
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn init_recalls(&self) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn manage_filesystem(&self, _path: &std::path::Path) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn next_event(&self) -> Result<RecallEvent, ConnectorError> {
        let mut rx = self.events_rx.lock().await;
        rx.recv().await.ok_or(ConnectorError::Closed)
    }

    async fn respond(&self, event: &RecallEvent, success: bool) {
        self.responses.lock().unwrap().push((event.uid, success));
        // notify_one stores a permit, so a response landing before the
        // test starts waiting is not lost.
        self.response_notify.notify_one();
    }

    async fn end_recalls(&self) {
        let sentinel = RecallEvent {
            uid: FileUid::new(0, 0, 0, 0),
            filename: None,
            to_resident: false,
            handle: None,
        };
        let _ = self.events_tx.send(sentinel).await;
    }

    fn open_file(&self, event: &RecallEvent) -> Result<Box<dyn FsFile>, ConnectorError> {
        Ok(Box::new(MockFile {
            fs: Arc::clone(&self.fs),
            uid: event.uid,
        }))
    }
}

/// Tempdir-backed inventory with scriptable start blocks.
pub struct MockInventory {
    dir: tempfile::TempDir,
    drives: usize,
    known: std::sync::Mutex<HashSet<String>>,
    in_use: std::sync::Mutex<HashSet<String>>,
    start_blocks: std::sync::Mutex<HashMap<PathBuf, i64>>,
    reservations: std::sync::Mutex<Vec<String>>,
}

impl MockInventory {
    pub fn new(drives: usize) -> Arc<Self> {
        Arc::new(Self {
            dir: tempfile::tempdir().unwrap(),
            drives,
            known: std::sync::Mutex::new(HashSet::new()),
            in_use: std::sync::Mutex::new(HashSet::new()),
            start_blocks: std::sync::Mutex::new(HashMap::new()),
            reservations: std::sync::Mutex::new(Vec::new()),
        })
    }

    fn object_path(&self, tape_id: &str, uid: &FileUid) -> PathBuf {
        self.dir
            .path()
            .join(tape_id)
            .join(format!("{:08x}-{:016x}", uid.igen, uid.inum))
    }

    /// Writes a tape object for `uid` and records its start block.
    pub fn stage(&self, tape_id: &str, uid: FileUid, content: &[u8], start_block: i64) {
        let path = self.object_path(tape_id, &uid);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();

        self.known.lock().unwrap().insert(tape_id.to_string());
        self.start_blocks.lock().unwrap().insert(path, start_block);
    }

    /// Registers a tape with no objects yet.
    pub fn add_tape(&self, tape_id: &str) {
        std::fs::create_dir_all(self.dir.path().join(tape_id)).unwrap();
        self.known.lock().unwrap().insert(tape_id.to_string());
    }

    /// Blocks the tape from being reserved, as if another subsystem
    /// held its drive.
    pub fn hold(&self, tape_id: &str) {
        self.in_use.lock().unwrap().insert(tape_id.to_string());
    }

    /// Releases a [`MockInventory::hold`].
    pub fn unhold(&self, tape_id: &str) {
        self.in_use.lock().unwrap().remove(tape_id);
    }

    /// Tapes reserved over the harness lifetime, in order.
    pub fn reservation_log(&self) -> Vec<String> {
        self.reservations.lock().unwrap().clone()
    }
}

impl Inventory for MockInventory {
    fn tape_path(&self, uid: &FileUid, tape_id: &str) -> Result<PathBuf, InventoryError> {
        if !self.known.lock().unwrap().contains(tape_id) {
            return Err(InventoryError::UnknownTape(tape_id.to_string()));
        }
        Ok(self.object_path(tape_id, uid))
    }

    fn start_block(&self, tape_path: &std::path::Path) -> i64 {
        self.start_blocks
            .lock()
            .unwrap()
            .get(tape_path)
            .copied()
            .unwrap_or(0)
    }

    fn try_reserve(&self, tape_id: &str) -> bool {
        if !self.known.lock().unwrap().contains(tape_id) {
            return false;
        }
        let mut in_use = self.in_use.lock().unwrap();
        if in_use.contains(tape_id) || in_use.len() >= self.drives {
            return false;
        }
        in_use.insert(tape_id.to_string());
        self.reservations.lock().unwrap().push(tape_id.to_string());
        true
    }

    fn release(&self, tape_id: &str) {
        self.in_use.lock().unwrap().remove(tape_id);
    }
}

/// A running recall server over mock collaborators.
pub struct Harness {
    pub fs: Arc<MockFsState>,
    pub connector: Arc<MockConnector>,
    pub inventory: Arc<MockInventory>,
    pub store: Arc<QueueStore>,
    pub handle: ServerHandle,
    pub server: tokio::task::JoinHandle<Result<(), StoreError>>,
}

impl Harness {
    pub fn start(drives: usize) -> Self {
        let fs = MockFsState::new();
        let connector = MockConnector::new(Arc::clone(&fs));
        let inventory = MockInventory::new(drives);
        let store = Arc::new(QueueStore::open(&StoreLocation::Memory).unwrap());

        let config = DaemonConfig {
            recall_workers: 4,
            read_buffer_size: 1024,
            ..DaemonConfig::default()
        };

        let server = RecallServer::new(
            config,
            Arc::clone(&store),
            connector.clone() as Arc<dyn Connector>,
            inventory.clone() as Arc<dyn Inventory>,
        );
        let handle = server.handle();
        let server = tokio::spawn(server.run());

        Self {
            fs,
            connector,
            inventory,
            store,
            handle,
            server,
        }
    }

    pub fn job_count(&self) -> i64 {
        self.store
            .conn()
            .unwrap()
            .query_row("SELECT count(*) FROM JOB_QUEUE", [], |row| row.get(0))
            .unwrap()
    }

    pub fn request_count(&self) -> i64 {
        self.store
            .conn()
            .unwrap()
            .query_row("SELECT count(*) FROM REQUEST_QUEUE", [], |row| row.get(0))
            .unwrap()
    }

    /// Gracefully shuts the server down and checks it exited cleanly.
    pub async fn finish(self) {
        self.handle.shutdown().await;
        tokio::time::timeout(Duration::from_secs(10), self.server)
            .await
            .expect("server shutdown timed out")
            .expect("server task panicked")
            .expect("server returned an error");
    }
}

/// Polls `predicate` until it holds or ten seconds pass.
pub async fn wait_until<F: Fn() -> bool>(predicate: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !predicate() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
