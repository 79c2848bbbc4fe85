//! Command handling for a single worker

use std::ops::ControlFlow;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, trace, warn};

use super::engine::{FitEngine, FitError};
use crate::protocol::{WorkerCommand, WorkerId, WorkerMessage};

/// A long-lived worker holding a private engine
///
/// The worker is a pure command interpreter: transports feed it commands and
/// forward whatever message it returns.
pub struct Worker<E> {
    id: WorkerId,
    engine: E,
    timestep: Duration,
    model_slot: Option<String>,
}

impl<E: FitEngine> Worker<E> {
    /// Create a new worker
    pub fn new(id: WorkerId, engine: E, timestep: Duration) -> Self {
        Self {
            id,
            engine,
            timestep,
            model_slot: None,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Idle polling interval
    pub fn timestep(&self) -> Duration {
        self.timestep
    }

    /// Slot the model was created under, if any
    pub fn model_slot(&self) -> Option<&str> {
        self.model_slot.as_deref()
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Apply one command
    ///
    /// Returns `Break` on `StopListening`, otherwise the message to send back
    /// (if the command produces one).
    pub fn handle(&mut self, command: WorkerCommand) -> ControlFlow<(), Option<WorkerMessage>> {
        trace!(worker = %self.id, command = command.name(), "Applying command");

        let id = self.id;
        let reply = match command {
            WorkerCommand::SetupTest(test) => error_reply(id, self.engine.setup_test(&test)),
            WorkerCommand::CreateModel { snapshot, slot } => {
                let outcome = self.engine.create_model(&snapshot, &slot);
                if outcome.is_ok() {
                    self.model_slot = Some(slot);
                }
                error_reply(id, outcome)
            }
            WorkerCommand::SetOptionalNames(names) => {
                error_reply(id, self.engine.set_optional_names(&names))
            }
            WorkerCommand::ChangeTimestep(timestep) => {
                debug!(worker = %self.id, ?timestep, "Changing timestep");
                self.timestep = timestep;
                None
            }
            WorkerCommand::Ping => Some(WorkerMessage::Pong {
                worker: self.id,
                pid: std::process::id(),
                sent_at: Utc::now(),
                message: match &self.model_slot {
                    Some(slot) => format!("listening, model in slot {:?}", slot),
                    None => "listening, no model yet".to_string(),
                },
            }),
            WorkerCommand::Test(job) => match self.engine.fit(&job.index, &job.params) {
                Ok(outcome) => Some(WorkerMessage::Result {
                    worker: Some(self.id),
                    index: job.index,
                    result: Some(outcome.result),
                    is_good: outcome.is_good,
                }),
                Err(e) => {
                    warn!(worker = %self.id, index = %job.index, error = %e, "Fit raised");
                    Some(WorkerMessage::Error {
                        worker: self.id,
                        message: format!("pixel {}: {}", job.index, e),
                        index: Some(job.index),
                    })
                }
            },
            WorkerCommand::StopListening => {
                debug!(worker = %self.id, "Stop listening");
                return ControlFlow::Break(());
            }
        };

        ControlFlow::Continue(reply)
    }
}

fn error_reply(worker: WorkerId, outcome: Result<(), FitError>) -> Option<WorkerMessage> {
    outcome.err().map(|e| WorkerMessage::Error {
        worker,
        index: None,
        message: e.to_string(),
    })
}
