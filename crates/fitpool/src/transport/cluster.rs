//! Cluster client abstraction and the in-process cluster
//!
//! A [`Cluster`] exposes a set of compute engines. Every call returns a
//! [`RemoteFuture`] that resolves to the engine's reply. Calls either target
//! one engine directly or go through a load-balanced queue that any idle
//! engine may take from.

use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use super::TransportError;
use crate::protocol::{WorkerCommand, WorkerId, WorkerMessage};
use crate::worker::{EngineFactory, Worker};

/// What an engine is asked to do
#[derive(Debug, Clone)]
pub enum EngineRequest {
    /// Create the engine-resident worker
    CreateWorker,
    /// Apply a command to the engine-resident worker
    Command(WorkerCommand),
}

/// State of a remote call
#[derive(Debug)]
pub enum RemoteState {
    /// The engine replied (with or without a message)
    Ready(Option<WorkerMessage>),
    /// Still running or queued
    Pending,
    /// The call was dropped (purged, engine gone) and will never reply
    Lost,
}

/// Handle to the eventual reply of a remote call
#[derive(Debug)]
pub struct RemoteFuture {
    rx: oneshot::Receiver<Option<WorkerMessage>>,
}

impl RemoteFuture {
    pub(crate) fn new(rx: oneshot::Receiver<Option<WorkerMessage>>) -> Self {
        Self { rx }
    }

    /// Check the call without waiting
    pub fn poll_state(&mut self) -> RemoteState {
        match self.rx.try_recv() {
            Ok(reply) => RemoteState::Ready(reply),
            Err(oneshot::error::TryRecvError::Empty) => RemoteState::Pending,
            Err(oneshot::error::TryRecvError::Closed) => RemoteState::Lost,
        }
    }

    /// Wait for the reply, at most `timeout`
    pub async fn wait(self, timeout: Duration) -> Option<RemoteState> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(reply)) => Some(RemoteState::Ready(reply)),
            Ok(Err(_)) => Some(RemoteState::Lost),
            Err(_) => None,
        }
    }
}

/// Client of a set of compute engines
pub trait Cluster: Send + Sync {
    /// Engines of the cluster; each hosts at most one worker
    fn engine_ids(&self) -> Vec<WorkerId>;

    /// Call one engine directly
    fn apply(&self, engine: WorkerId, request: EngineRequest)
        -> Result<RemoteFuture, TransportError>;

    /// Queue a call for whichever engine is idle first
    fn apply_balanced(&self, request: EngineRequest) -> Result<RemoteFuture, TransportError>;

    /// Load-balanced calls not yet taken by an engine, purged calls excluded
    fn unassigned(&self) -> usize;

    /// Drop every queued call; their futures become lost
    fn clear(&self);
}

struct EngineCall {
    request: EngineRequest,
    epoch: u64,
    reply: oneshot::Sender<Option<WorkerMessage>>,
}

/// Cluster of tokio engine tasks living in this process
///
/// Each engine has a direct channel and shares one bounded load-balanced
/// channel with the others. Fits run on the blocking thread pool so engines
/// never stall the runtime.
pub struct LocalCluster {
    direct: BTreeMap<WorkerId, mpsc::UnboundedSender<EngineCall>>,
    balanced: mpsc::Sender<EngineCall>,
    epoch: Arc<AtomicU64>,
    /// Load-balanced calls of the current epoch still waiting for an engine
    live: Arc<AtomicUsize>,
    handles: Vec<JoinHandle<()>>,
}

impl LocalCluster {
    /// Spawn `engines` engine tasks on the current runtime
    pub fn spawn<F: EngineFactory>(
        engines: usize,
        queue_capacity: usize,
        timestep: Duration,
        factory: F,
    ) -> Self {
        let factory = Arc::new(factory);
        let (balanced_tx, balanced_rx) = mpsc::channel(queue_capacity.max(1));
        let balanced_rx = Arc::new(Mutex::new(balanced_rx));
        let epoch = Arc::new(AtomicU64::new(0));
        let live = Arc::new(AtomicUsize::new(0));

        let mut direct = BTreeMap::new();
        let mut handles = Vec::with_capacity(engines);
        for i in 0..engines {
            let id = WorkerId(i);
            let (tx, rx) = mpsc::unbounded_channel();
            direct.insert(id, tx);
            handles.push(tokio::spawn(run_engine(
                id,
                Arc::clone(&factory),
                timestep,
                rx,
                Arc::clone(&balanced_rx),
                Arc::clone(&epoch),
                Arc::clone(&live),
            )));
        }

        debug!(engines, queue_capacity, "Local cluster spawned");

        Self {
            direct,
            balanced: balanced_tx,
            epoch,
            live,
            handles,
        }
    }

    fn call(&self, request: EngineRequest) -> (EngineCall, RemoteFuture) {
        let (tx, rx) = oneshot::channel();
        let call = EngineCall {
            request,
            epoch: self.epoch.load(Ordering::Acquire),
            reply: tx,
        };
        (call, RemoteFuture::new(rx))
    }
}

impl Cluster for LocalCluster {
    fn engine_ids(&self) -> Vec<WorkerId> {
        self.direct.keys().copied().collect()
    }

    fn apply(
        &self,
        engine: WorkerId,
        request: EngineRequest,
    ) -> Result<RemoteFuture, TransportError> {
        let tx = self
            .direct
            .get(&engine)
            .ok_or(TransportError::UnknownWorker(engine))?;
        let (call, future) = self.call(request);
        tx.send(call)
            .map_err(|_| TransportError::ChannelClosed(format!("engine {}", engine)))?;
        Ok(future)
    }

    fn apply_balanced(&self, request: EngineRequest) -> Result<RemoteFuture, TransportError> {
        let (call, future) = self.call(request);
        // Counted before the send so an engine can never take it first
        self.live.fetch_add(1, Ordering::AcqRel);
        self.balanced.try_send(call).map_err(|e| {
            release_live(&self.live);
            match e {
                mpsc::error::TrySendError::Full(_) => TransportError::QueueFull {
                    capacity: self.balanced.max_capacity(),
                },
                mpsc::error::TrySendError::Closed(_) => {
                    TransportError::ChannelClosed("load-balanced queue".into())
                }
            }
        })?;
        Ok(future)
    }

    fn unassigned(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    fn clear(&self) {
        let purged = self.epoch.fetch_add(1, Ordering::AcqRel);
        let dropped = self.live.swap(0, Ordering::AcqRel);
        debug!(epoch = purged + 1, dropped, "Cluster queue cleared");
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

async fn run_engine<F: EngineFactory>(
    id: WorkerId,
    factory: Arc<F>,
    timestep: Duration,
    mut direct: mpsc::UnboundedReceiver<EngineCall>,
    balanced: Arc<Mutex<mpsc::Receiver<EngineCall>>>,
    epoch: Arc<AtomicU64>,
    live: Arc<AtomicUsize>,
) {
    let mut worker: Option<Worker<F::Engine>> = None;

    loop {
        let (call, from_queue) = tokio::select! {
            biased;
            call = direct.recv() => (call, false),
            call = async { balanced.lock().await.recv().await } => (call, true),
        };
        let Some(call) = call else {
            break;
        };

        if call.epoch < epoch.load(Ordering::Acquire) {
            trace!(engine = %id, "Skipping purged call");
            continue;
        }
        if from_queue {
            release_live(&live);
        }

        let reply = match call.request {
            EngineRequest::CreateWorker => {
                worker = Some(Worker::new(id, factory.create(id), timestep));
                None
            }
            EngineRequest::Command(command) => match worker.take() {
                None => Some(WorkerMessage::Error {
                    worker: id,
                    index: None,
                    message: format!("no worker on engine {}", id),
                }),
                Some(mut w) => {
                    let outcome = tokio::task::spawn_blocking(move || {
                        let flow = w.handle(command);
                        (w, flow)
                    })
                    .await;
                    match outcome {
                        Ok((w, flow)) => {
                            worker = Some(w);
                            match flow {
                                ControlFlow::Continue(message) => message,
                                ControlFlow::Break(()) => None,
                            }
                        }
                        Err(e) => {
                            error!(engine = %id, error = %e, "Worker panicked, engine left without worker");
                            Some(WorkerMessage::Error {
                                worker: id,
                                index: None,
                                message: format!("worker panicked: {}", e),
                            })
                        }
                    }
                }
            },
        };

        if call.reply.send(reply).is_err() {
            warn!(engine = %id, "Caller dropped the reply handle");
        }
    }

    debug!(engine = %id, "Engine stopped");
}

fn release_live(live: &AtomicUsize) {
    // Already zero when a clear raced the engine
    let _ = live.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
}
