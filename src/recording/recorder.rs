//! Thread-safe recorder front end

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::RecorderConfig;
use crate::properties::StreamProperty;
use crate::storage::NodeId;
use crate::{OniError, Result};

use super::queue::{Priority, PriorityQueue};
use super::stream::{Frame, RecordableStream};
use super::writer::{Message, Writer};

const THREAD_NAME: &str = "oni-recorder";

/// How long terminate waits for the writer while its backlog is not shrinking
const SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(3000);

struct WriterThread {
    handle: JoinHandle<()>,
    done_rx: Receiver<Result<()>>,
}

/// Records attached streams into an ONI file
///
/// Every call only enqueues a message; a single writer thread performs
/// all compression and file I/O, in priority then FIFO order.
pub struct Recorder {
    queue: Arc<PriorityQueue<Message>>,
    streams: DashMap<NodeId, Arc<dyn RecordableStream>>,
    attach_lock: Mutex<()>,
    max_node_id: AtomicU32,
    started: AtomicBool,
    dropped: Arc<AtomicU64>,
    config: RecorderConfig,
    writer: Mutex<Option<WriterThread>>,
}

impl Recorder {
    /// Create the recording file and start the writer thread
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid, the file cannot be
    /// created, or the thread cannot be spawned
    pub fn initialize(path: impl AsRef<Path>, config: RecorderConfig) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref();
        let dropped = Arc::new(AtomicU64::new(0));
        let writer = Writer::create(path, config.clone(), Arc::clone(&dropped))?;
        let queue = Arc::new(PriorityQueue::new());
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);

        let handle = std::thread::Builder::new()
            .name(THREAD_NAME.into())
            .spawn({
                let queue = Arc::clone(&queue);
                move || {
                    let result = writer.run(&queue);
                    if let Err(e) = &result {
                        error!("Recorder writer stopped: {}", e);
                    }
                    done_tx.send(result).ok();
                }
            })?;

        info!("Recording to {}", path.display());

        Ok(Self {
            queue,
            streams: DashMap::new(),
            attach_lock: Mutex::new(()),
            max_node_id: AtomicU32::new(0),
            started: AtomicBool::new(false),
            dropped,
            config,
            writer: Mutex::new(Some(WriterThread { handle, done_rx })),
        })
    }

    fn enqueue(&self, priority: Priority, message: Message) -> Result<()> {
        self.queue
            .push(priority, message)
            .map_err(|_| OniError::Other("recorder is terminated".to_string()))
    }

    fn ensure_attached(&self, node_id: NodeId) -> Result<()> {
        if self.streams.contains_key(&node_id) {
            Ok(())
        } else {
            Err(OniError::BadParameter(format!("node {node_id} is not attached")))
        }
    }

    /// Attach a stream, returning the node id it is recorded under
    ///
    /// The stream's initial properties are recorded right after the node.
    ///
    /// # Errors
    ///
    /// Returns `BadParameter` if the stream is already attached
    pub fn attach(&self, stream: Arc<dyn RecordableStream>, allow_lossy: bool) -> Result<NodeId> {
        let _guard = self.attach_lock.lock();
        let already = self.streams.iter().any(|entry| {
            Arc::as_ptr(entry.value()).cast::<()>() == Arc::as_ptr(&stream).cast::<()>()
        });
        if already {
            return Err(OniError::BadParameter(
                "stream is already attached".to_string(),
            ));
        }

        let node_id = self.max_node_id.fetch_add(1, Ordering::SeqCst) + 1;
        let initial = stream.initial_properties();
        self.enqueue(
            Priority::High,
            Message::Attach {
                node_id,
                stream: Arc::clone(&stream),
                allow_lossy,
            },
        )?;
        self.streams.insert(node_id, stream);

        for property in initial {
            self.enqueue(Priority::High, Message::RecordProperty { node_id, property })?;
        }

        debug!("Queued attach of node {}", node_id);
        Ok(node_id)
    }

    /// Attach a stream using the configured lossy-compression setting
    ///
    /// # Errors
    ///
    /// Returns `BadParameter` if the stream is already attached
    pub fn attach_with_defaults(&self, stream: Arc<dyn RecordableStream>) -> Result<NodeId> {
        self.attach(stream, self.config.allow_lossy_compression)
    }

    /// Stop recording a node
    ///
    /// # Errors
    ///
    /// Returns `BadParameter` if the node is not attached
    pub fn detach(&self, node_id: NodeId) -> Result<()> {
        if self.streams.remove(&node_id).is_none() {
            return Err(OniError::BadParameter(format!(
                "node {node_id} is not attached"
            )));
        }
        self.enqueue(Priority::Normal, Message::Detach { node_id })
    }

    /// Start accepting frames; frames passed to [`Recorder::record`]
    /// before this are ignored
    pub fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    /// Whether [`Recorder::start`] has been called
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Record a frame of an attached node
    ///
    /// # Errors
    ///
    /// Returns `BadParameter` if the node is not attached
    pub fn record(&self, node_id: NodeId, frame: Frame) -> Result<()> {
        self.ensure_attached(node_id)?;
        if !self.is_started() {
            return Ok(());
        }
        self.enqueue(Priority::Normal, Message::Record { node_id, frame })
    }

    /// Record a property change of an attached node
    ///
    /// # Errors
    ///
    /// Returns `BadParameter` if the node is not attached
    pub fn record_property(&self, node_id: NodeId, property: StreamProperty) -> Result<()> {
        self.ensure_attached(node_id)?;
        self.enqueue(
            self.config.property_priority,
            Message::RecordProperty { node_id, property },
        )
    }

    /// Messages the writer dropped because they could not be recorded
    pub fn dropped_messages(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Drain pending messages, finalize the file and stop the writer
    ///
    /// Waits as long as the writer keeps working through its backlog. If
    /// three seconds pass without the backlog shrinking, the writer thread
    /// is detached and `ThreadTimeout` is returned. Calling this more than
    /// once is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the writer's I/O error if it failed, or `ThreadTimeout` if
    /// it stopped making progress
    pub fn terminate(&self) -> Result<()> {
        let Some(writer) = self.writer.lock().take() else {
            return Ok(());
        };

        // A closed queue means the writer already stopped on an error.
        let _ = self.queue.push(Priority::Low, Message::Terminate);
        let mut backlog = self.queue.len();
        let result = loop {
            match writer.done_rx.recv_timeout(SHUTDOWN_TIMEOUT) {
                Ok(result) => break result,
                Err(RecvTimeoutError::Timeout) => {
                    let remaining = self.queue.len();
                    if remaining < backlog {
                        backlog = remaining;
                        continue;
                    }
                    self.queue.close();
                    self.streams.clear();
                    warn!("Recorder writer made no progress within {:?}", SHUTDOWN_TIMEOUT);
                    return Err(OniError::ThreadTimeout(THREAD_NAME.to_string()));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    break Err(OniError::Other("recorder writer thread panicked".to_string()))
                }
            }
        };
        writer
            .handle
            .join()
            .map_err(|_| OniError::Other("recorder writer thread panicked".to_string()))?;
        self.queue.close();
        self.streams.clear();
        info!("Recorder terminated");
        result
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if let Err(e) = self.terminate() {
            error!("Failed to finalize recording: {}", e);
        }
    }
}
