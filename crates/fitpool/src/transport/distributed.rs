//! Distributed transport
//!
//! Every remote call returns a [`RemoteFuture`]. Jobs and pings are kept as
//! pending calls and resolved by [`Transport::drain_results`], which walks
//! them newest first. Calls that never come back are turned into failed
//! results once they are older than the timeout.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::cluster::{Cluster, EngineRequest, LocalCluster, RemoteFuture, RemoteState};
use super::{Transport, TransportError};
use crate::config::{Backend, PoolConfig};
use crate::protocol::{Job, PixelIndex, WorkerCommand, WorkerId, WorkerMessage};
use crate::worker::EngineFactory;

/// What a pending call was issued for
#[derive(Debug, Clone, PartialEq)]
enum CallTag {
    Job(PixelIndex),
    Command {
        worker: WorkerId,
        command: &'static str,
    },
}

struct PendingCall {
    future: RemoteFuture,
    tag: CallTag,
    issued_at: Instant,
}

/// Transport over the engines of a [`Cluster`]
pub struct DistributedTransport<C: Cluster> {
    cluster: C,
    /// Bound on blocking calls (worker creation, broadcasts)
    call_timeout: Duration,
    /// Outstanding calls in submission order
    pending: Vec<PendingCall>,
    /// Replies to blocking calls, surfaced by the next drain
    inbox: Vec<WorkerMessage>,
}

impl DistributedTransport<LocalCluster> {
    /// Spawn an in-process cluster with one engine per configured worker
    pub fn local<F: EngineFactory>(config: &PoolConfig, factory: F) -> Self {
        let cluster = LocalCluster::spawn(
            config.num_workers,
            config.queue_capacity,
            config.timestep,
            factory,
        );
        Self::new(cluster, config)
    }
}

impl<C: Cluster> DistributedTransport<C> {
    pub fn new(cluster: C, config: &PoolConfig) -> Self {
        Self {
            cluster,
            call_timeout: config.timeout,
            pending: Vec::new(),
            inbox: Vec::new(),
        }
    }

    pub fn cluster(&self) -> &C {
        &self.cluster
    }

    /// Calls issued and not yet resolved
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    async fn call_blocking(
        &self,
        worker: WorkerId,
        request: EngineRequest,
        command: &'static str,
    ) -> Result<Option<WorkerMessage>, TransportError> {
        let future = self.cluster.apply(worker, request)?;
        match future.wait(self.call_timeout).await {
            Some(RemoteState::Ready(reply)) => Ok(reply),
            Some(RemoteState::Lost) | Some(RemoteState::Pending) => Err(
                TransportError::ChannelClosed(format!("engine {}", worker)),
            ),
            None => Err(TransportError::Timeout {
                worker,
                command,
                timeout: self.call_timeout,
            }),
        }
    }
}

#[async_trait]
impl<C: Cluster> Transport for DistributedTransport<C> {
    fn backend(&self) -> Backend {
        Backend::Distributed
    }

    fn worker_ids(&self) -> Vec<WorkerId> {
        self.cluster.engine_ids()
    }

    #[instrument(skip(self))]
    async fn start_workers(&mut self) -> Result<(), TransportError> {
        let engines = self.cluster.engine_ids();
        for id in &engines {
            self.call_blocking(*id, EngineRequest::CreateWorker, "create_worker")
                .await?;
        }
        info!(engines = engines.len(), "Remote workers created");
        Ok(())
    }

    async fn broadcast(&mut self, command: WorkerCommand) -> Result<(), TransportError> {
        let name = command.name();
        debug!(command = name, "Broadcasting");
        for id in self.cluster.engine_ids() {
            let reply = self
                .call_blocking(id, EngineRequest::Command(command.clone()), name)
                .await?;
            if let Some(message) = reply {
                self.inbox.push(message);
            }
        }
        Ok(())
    }

    async fn send(
        &mut self,
        worker: WorkerId,
        command: WorkerCommand,
    ) -> Result<(), TransportError> {
        let name = command.name();
        let future = self.cluster.apply(worker, EngineRequest::Command(command))?;
        self.pending.push(PendingCall {
            future,
            tag: CallTag::Command {
                worker,
                command: name,
            },
            issued_at: Instant::now(),
        });
        Ok(())
    }

    async fn submit_job(&mut self, job: Job) -> Result<(), TransportError> {
        let index = job.index.clone();
        let future = self
            .cluster
            .apply_balanced(EngineRequest::Command(WorkerCommand::Test(job)))?;
        self.pending.push(PendingCall {
            future,
            tag: CallTag::Job(index),
            issued_at: Instant::now(),
        });
        Ok(())
    }

    fn pending_count(&self) -> usize {
        self.cluster.unassigned()
    }

    async fn drain_results(&mut self, timeout: Duration) -> Vec<WorkerMessage> {
        let mut messages = std::mem::take(&mut self.inbox);
        let now = Instant::now();

        // Newest calls first
        let mut i = self.pending.len();
        while i > 0 {
            i -= 1;
            let call = &mut self.pending[i];
            let state = call.future.poll_state();
            let expired = now.duration_since(call.issued_at) > timeout;

            let resolved = match (state, &call.tag) {
                (RemoteState::Ready(Some(message)), _) => Some(message),
                (RemoteState::Ready(None), CallTag::Job(index)) => {
                    warn!(%index, "Job call returned nothing");
                    Some(WorkerMessage::Failed)
                }
                (RemoteState::Ready(None), CallTag::Command { .. }) => None,
                (RemoteState::Lost, CallTag::Job(index)) => {
                    info!(%index, "Job call was dropped, assuming failed");
                    Some(WorkerMessage::timed_out(index.clone()))
                }
                (RemoteState::Lost, CallTag::Command { worker, command }) => {
                    debug!(worker = %worker, command, "Command call was dropped");
                    None
                }
                (RemoteState::Pending, _) if !expired => continue,
                (RemoteState::Pending, CallTag::Job(index)) => {
                    info!(%index, ?timeout, "Pixel failed to come back in time, assuming failed");
                    Some(WorkerMessage::timed_out(index.clone()))
                }
                (RemoteState::Pending, CallTag::Command { worker, command }) => {
                    info!(worker = %worker, command, ?timeout, "Worker did not answer in time");
                    None
                }
            };

            self.pending.remove(i);
            if let Some(message) = resolved {
                messages.push(message);
            }
        }

        messages
    }

    #[instrument(skip(self))]
    async fn shutdown(&mut self) -> Result<(), TransportError> {
        let dropped = self.pending.len();
        self.cluster.clear();
        self.pending.clear();
        self.inbox.clear();
        info!(dropped, "Cluster queue cleared");
        Ok(())
    }
}
