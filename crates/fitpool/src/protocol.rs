//! Messages exchanged between the scheduler and its workers
//!
//! Commands flow scheduler → worker, messages flow worker → scheduler. Both
//! are plain serde enums so a transport can ship them across a process or
//! network boundary unchanged.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Slot name under which workers store the model template
pub const DEFAULT_MODEL_SLOT: &str = "z";

/// Identity of a worker, stable for the lifetime of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier of one unit of work (a pixel coordinate)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PixelIndex(pub Vec<usize>);

impl PixelIndex {
    pub fn new(coordinates: impl Into<Vec<usize>>) -> Self {
        Self(coordinates.into())
    }

    /// Number of navigation dimensions
    pub fn ndim(&self) -> usize {
        self.0.len()
    }
}

impl<const N: usize> From<[usize; N]> for PixelIndex {
    fn from(coordinates: [usize; N]) -> Self {
        Self(coordinates.to_vec())
    }
}

impl fmt::Display for PixelIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, c) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", c)?;
        }
        write!(f, ")")
    }
}

/// Algorithm state needed to run one fit
pub type JobParams = serde_json::Map<String, serde_json::Value>;

/// Serialized convergence test installed on every worker
pub type TestDefinition = serde_json::Value;

/// One fitting job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub index: PixelIndex,
    pub params: JobParams,
}

impl Job {
    pub fn new(index: impl Into<PixelIndex>, params: JobParams) -> Self {
        Self {
            index: index.into(),
            params,
        }
    }
}

/// Serializable model template every worker keeps a private copy of
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    /// Signal the model is fitted against
    pub signal: serde_json::Value,
    /// Component definitions, keyed by component name
    pub components: serde_json::Value,
}

/// Commands sent to workers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "args", rename_all = "snake_case")]
pub enum WorkerCommand {
    /// Install the convergence test
    SetupTest(TestDefinition),
    /// Create the worker's model copy
    CreateModel {
        snapshot: ModelSnapshot,
        slot: String,
    },
    /// Replace the set of optional component names
    SetOptionalNames(BTreeSet<String>),
    /// Change the worker's idle polling interval
    ChangeTimestep(#[serde(with = "crate::config::duration_millis")] Duration),
    /// Liveness probe, answered with a pong
    Ping,
    /// Fit one pixel
    Test(Job),
    /// Stop consuming commands
    StopListening,
}

impl WorkerCommand {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::SetupTest(_) => "setup_test",
            Self::CreateModel { .. } => "create_model",
            Self::SetOptionalNames(_) => "set_optional_names",
            Self::ChangeTimestep(_) => "change_timestep",
            Self::Ping => "ping",
            Self::Test(_) => "test",
            Self::StopListening => "stop_listening",
        }
    }
}

/// Messages returned by workers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Answer to a ping
    Pong {
        worker: WorkerId,
        pid: u32,
        sent_at: DateTime<Utc>,
        message: String,
    },
    /// The worker caught an error while applying a command. `index` names
    /// the pixel when the failing command was a fit.
    Error {
        worker: WorkerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<PixelIndex>,
        message: String,
    },
    /// Outcome of a fit. `worker` is `None` when the result was synthesized
    /// because nothing came back in time.
    Result {
        worker: Option<WorkerId>,
        index: PixelIndex,
        result: Option<serde_json::Value>,
        is_good: bool,
    },
    /// Nothing usable came back
    Failed,
}

impl WorkerMessage {
    /// Failed result for a job that did not return in time
    pub fn timed_out(index: PixelIndex) -> Self {
        Self::Result {
            worker: None,
            index,
            result: None,
            is_good: false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Pong { .. } => "pong",
            Self::Error { .. } => "error",
            Self::Result { .. } => "result",
            Self::Failed => "failed",
        }
    }
}

/// Audit trail entry appended for every accepted result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub index: PixelIndex,
    pub is_good: bool,
    /// Coordinator progress counter at the time the result was accepted
    pub progress: usize,
    pub worker: Option<WorkerId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pixel_index_display() {
        assert_eq!(PixelIndex::new(vec![3, 4]).to_string(), "(3, 4)");
        assert_eq!(PixelIndex::from([7]).to_string(), "(7)");
        assert_eq!(PixelIndex::from([1, 2, 3]).ndim(), 3);
    }

    #[test]
    fn test_timed_out_result_shape() {
        let msg = WorkerMessage::timed_out(PixelIndex::from([1, 1]));
        assert_eq!(
            msg,
            WorkerMessage::Result {
                worker: None,
                index: PixelIndex::from([1, 1]),
                result: None,
                is_good: false,
            }
        );
        assert_eq!(msg.kind(), "result");
    }

    #[test]
    fn test_command_wire_format() {
        let value = serde_json::to_value(WorkerCommand::Ping).unwrap();
        assert_eq!(value, json!({"command": "ping"}));

        let value =
            serde_json::to_value(WorkerCommand::ChangeTimestep(Duration::from_millis(250)))
                .unwrap();
        assert_eq!(value, json!({"command": "change_timestep", "args": 250}));

        let job = Job::new([0, 2], JobParams::new());
        let value = serde_json::to_value(WorkerCommand::Test(job)).unwrap();
        assert_eq!(value["command"], "test");
        assert_eq!(value["args"]["index"], json!([0, 2]));
    }

    #[test]
    fn test_message_wire_format() {
        let value = serde_json::to_value(WorkerMessage::Error {
            worker: WorkerId(2),
            index: None,
            message: "boom".into(),
        })
        .unwrap();
        assert_eq!(
            value,
            json!({"kind": "error", "worker": 2, "message": "boom"})
        );

        let parsed: WorkerMessage = serde_json::from_value(json!({
            "kind": "error",
            "worker": 1,
            "index": [0, 3],
            "message": "did not converge"
        }))
        .unwrap();
        assert!(matches!(
            parsed,
            WorkerMessage::Error { index: Some(ref i), .. } if *i == PixelIndex::from([0, 3])
        ));

        let parsed: WorkerMessage = serde_json::from_value(json!({
            "kind": "result",
            "worker": null,
            "index": [4, 5],
            "result": null,
            "is_good": false
        }))
        .unwrap();
        assert_eq!(parsed, WorkerMessage::timed_out(PixelIndex::from([4, 5])));
    }
}
