//! Unix-socket connector implementation.
//!
//! Connector clients (the filesystem interposer running next to the
//! application) connect to the recall socket and send one
//! [`RecallRequest`] frame per touched file. The daemon answers with a
//! [`RecallResponse`] frame on the same connection, not necessarily in
//! request order.
//!
//! Internally each accepted connection gets a reader task that decodes
//! frames into [`RecallEvent`]s and a writer task that drains an
//! outbound frame channel. The correlation handle placed into each event
//! indexes a process-wide pending map back to the originating
//! connection's outbound channel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use tapestage_core::protocol::{FrameCodec, RecallRequest, RecallResponse};
use tapestage_core::types::{ConnHandle, FileUid, RecallEvent};

use super::{Connector, ConnectorError, PosixFile};
use crate::fs::{FileLockRegistry, FsFile};

/// Events buffered between socket readers and the event receiver.
const EVENT_QUEUE_DEPTH: usize = 256;

struct Inner {
    events_tx: mpsc::Sender<RecallEvent>,
    pending: std::sync::Mutex<HashMap<i64, mpsc::UnboundedSender<Bytes>>>,
    next_handle: AtomicI64,
}

/// Connector speaking the recall protocol on a Unix domain socket.
pub struct SocketConnector {
    socket_path: PathBuf,
    inner: Arc<Inner>,
    events_rx: tokio::sync::Mutex<mpsc::Receiver<RecallEvent>>,
    locks: Arc<FileLockRegistry>,
    accept_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SocketConnector {
    /// Creates a connector that will listen on `socket_path` once
    /// [`Connector::init_recalls`] runs.
    #[must_use]
    pub fn new(socket_path: PathBuf) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        Self {
            socket_path,
            inner: Arc::new(Inner {
                events_tx,
                pending: std::sync::Mutex::new(HashMap::new()),
                next_handle: AtomicI64::new(1),
            }),
            events_rx: tokio::sync::Mutex::new(events_rx),
            locks: Arc::new(FileLockRegistry::new()),
            accept_task: std::sync::Mutex::new(None),
        }
    }

    /// Socket path this connector serves.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

#[async_trait]
impl Connector for SocketConnector {
    async fn init_recalls(&self) -> Result<(), ConnectorError> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .map_err(|e| ConnectorError::Transport(format!("stale socket: {e}")))?;
        }
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConnectorError::Transport(format!("socket directory: {e}")))?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .map_err(|e| ConnectorError::Transport(format!("bind failed: {e}")))?;
        info!(path = %self.socket_path.display(), "recall socket listening");

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(accept_loop(listener, inner));
        *self
            .accept_task
            .lock()
            .expect("accept task slot poisoned") = Some(task);
        Ok(())
    }

    async fn manage_filesystem(&self, path: &Path) -> Result<(), ConnectorError> {
        if !path.is_dir() {
            return Err(ConnectorError::Transport(format!(
                "managed filesystem {} is not a directory",
                path.display()
            )));
        }
        info!(path = %path.display(), "filesystem registered for transparent recall");
        Ok(())
    }

    async fn next_event(&self) -> Result<RecallEvent, ConnectorError> {
        let mut rx = self.events_rx.lock().await;
        rx.recv().await.ok_or(ConnectorError::Closed)
    }

    async fn respond(&self, event: &RecallEvent, success: bool) {
        let Some(handle) = event.handle else {
            warn!(uid = %event.uid, "response requested for event without handle");
            return;
        };

        let tx = self
            .inner
            .pending
            .lock()
            .expect("pending map poisoned")
            .remove(&handle.as_i64());

        match tx {
            Some(tx) => {
                let frame = RecallResponse::for_event(event, success).encode_frame();
                if tx.send(frame).is_err() {
                    debug!(%handle, uid = %event.uid, "connection gone before response");
                }
            }
            None => debug!(%handle, uid = %event.uid, "no pending context for response"),
        }
    }

    async fn end_recalls(&self) {
        if let Some(task) = self
            .accept_task
            .lock()
            .expect("accept task slot poisoned")
            .take()
        {
            task.abort();
        }

        // Wake the event loop so it can observe the termination flag.
        let sentinel = RecallEvent {
            uid: FileUid::new(0, 0, 0, 0),
            filename: None,
            to_resident: false,
            handle: None,
        };
        let _ = self.inner.events_tx.send(sentinel).await;

        let _ = std::fs::remove_file(&self.socket_path);
        info!("recall socket stopped");
    }

    fn open_file(&self, event: &RecallEvent) -> Result<Box<dyn FsFile>, ConnectorError> {
        let file = PosixFile::open(event, Arc::clone(&self.locks))?;
        Ok(Box::new(file))
    }
}

async fn accept_loop(listener: UnixListener, inner: Arc<Inner>) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                tokio::spawn(handle_connection(stream, Arc::clone(&inner)));
            }
            Err(e) => {
                error!(error = %e, "failed to accept recall connection");
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, inner: Arc<Inner>) {
    debug!("recall client connected");

    let framed = Framed::new(stream, FrameCodec::new());
    let (mut sink, mut frames) = framed.split();

    // Responses can land while the reader half is still mid-frame, so
    // outbound frames go through a channel drained by a writer task.
    let (resp_tx, mut resp_rx) = mpsc::unbounded_channel::<Bytes>();
    let writer = tokio::spawn(async move {
        while let Some(frame) = resp_rx.recv().await {
            if sink.send(frame).await.is_err() {
                break;
            }
        }
    });

    let mut issued: Vec<i64> = Vec::new();
    while let Some(frame) = frames.next().await {
        let payload = match frame {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "recall connection framing error");
                break;
            }
        };

        let request = match RecallRequest::decode_frame(&payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "dropping undecodable recall frame");
                continue;
            }
        };

        let handle = inner.next_handle.fetch_add(1, Ordering::Relaxed);
        inner
            .pending
            .lock()
            .expect("pending map poisoned")
            .insert(handle, resp_tx.clone());
        issued.push(handle);

        let event = RecallEvent {
            uid: request.uid(),
            filename: request.filename.clone(),
            to_resident: request.to_resident,
            handle: Some(ConnHandle::new(handle)),
        };

        if inner.events_tx.send(event).await.is_err() {
            // Event receiver is gone; nothing more to deliver.
            break;
        }
    }

    // Handles that never got a response cannot be delivered to anymore.
    {
        let mut pending = inner.pending.lock().expect("pending map poisoned");
        for handle in issued {
            pending.remove(&handle);
        }
    }

    drop(resp_tx);
    let _ = writer.await;
    debug!("recall client disconnected");
}
