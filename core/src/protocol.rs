//! NodeTool worker protocol: outgoing commands and incoming frames
//!
//! Requests go out as `{type, command, data}` envelopes where `type` equals
//! `command`. Incoming frames are MessagePack maps tagged by `"type"`; they are
//! parsed from the generic [`Value`] tree so unknown fields and unknown frame
//! kinds never break decoding.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{NodetoolError, Result};
use crate::registry::{FieldKind, TypeRegistry, TypeShape, TypedRecord};
use crate::value::Value;

pub const RUN_JOB: &str = "run_job";
pub const CANCEL_JOB: &str = "cancel_job";
pub const RUN_JOB_REQUEST: &str = "run_job_request";
pub const CANCEL_JOB_DATA: &str = "cancel_job_data";

/// Register every shape the client sends
pub fn register_builtin_types(registry: &TypeRegistry) -> Result<()> {
    registry.register(
        TypeShape::new(RUN_JOB_REQUEST)
            .required("job_type", FieldKind::String)
            .required("execution_strategy", FieldKind::String)
            .optional("workflow_id", FieldKind::String)
            .optional("workflow_name", FieldKind::String)
            .required("job_id", FieldKind::String)
            .required("inputs", FieldKind::Map)
            .required("user_id", FieldKind::String)
            .required("auth_token", FieldKind::String)
            .optional("api_url", FieldKind::String)
            .required("explicit_types", FieldKind::Bool),
    )?;
    registry.register(
        TypeShape::new(CANCEL_JOB_DATA)
            .required("job_id", FieldKind::String)
            .optional("workflow_id", FieldKind::String),
    )?;
    for command in [RUN_JOB, CANCEL_JOB] {
        registry.register(
            TypeShape::new(command)
                .required("command", FieldKind::String)
                .required("data", FieldKind::Map),
        )?;
    }
    Ok(())
}

/// Registry preloaded with the client's own shapes
pub fn builtin_registry() -> Result<TypeRegistry> {
    let registry = TypeRegistry::new();
    register_builtin_types(&registry)?;
    Ok(registry)
}

/// How a workflow is addressed in a run request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WorkflowRef {
    Id(String),
    Name(String),
}

impl WorkflowRef {
    pub fn as_str(&self) -> &str {
        match self {
            WorkflowRef::Id(s) | WorkflowRef::Name(s) => s,
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            WorkflowRef::Id(id) => Some(id),
            WorkflowRef::Name(_) => None,
        }
    }
}

impl fmt::Display for WorkflowRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowRef::Id(id) => write!(f, "{}", id),
            WorkflowRef::Name(name) => write!(f, "'{}'", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunJobRequest {
    pub workflow: WorkflowRef,
    /// Client-generated correlation id
    pub job_id: String,
    pub inputs: BTreeMap<String, Value>,
    pub execution_strategy: String,
    pub user_id: Option<String>,
    pub auth_token: Option<String>,
    pub api_url: Option<String>,
    pub explicit_types: bool,
}

impl RunJobRequest {
    pub fn to_record(&self) -> TypedRecord {
        let record = TypedRecord::new(RUN_JOB_REQUEST)
            .with("job_type", "workflow")
            .with("execution_strategy", self.execution_strategy.as_str())
            .with("job_id", self.job_id.as_str())
            .with("inputs", Value::Map(self.inputs.clone()))
            .with("user_id", self.user_id.clone().unwrap_or_default())
            .with("auth_token", self.auth_token.clone().unwrap_or_default())
            .with_opt("api_url", self.api_url.clone())
            .with("explicit_types", self.explicit_types);
        match &self.workflow {
            WorkflowRef::Id(id) => record.with("workflow_id", id.as_str()),
            WorkflowRef::Name(name) => record.with("workflow_name", name.as_str()),
        }
    }
}

fn encode_command(registry: &TypeRegistry, command: &str, data: &TypedRecord) -> Result<Vec<u8>> {
    let data = Value::from_payload(registry.lower(data)?);
    registry.encode(&TypedRecord::new(command).with("command", command).with("data", data))
}

pub fn encode_run_job(registry: &TypeRegistry, request: &RunJobRequest) -> Result<Vec<u8>> {
    encode_command(registry, RUN_JOB, &request.to_record())
}

pub fn encode_cancel_job(
    registry: &TypeRegistry,
    job_id: &str,
    workflow_id: Option<&str>,
) -> Result<Vec<u8>> {
    let data = TypedRecord::new(CANCEL_JOB_DATA)
        .with("job_id", job_id)
        .with_opt("workflow_id", workflow_id);
    encode_command(registry, CANCEL_JOB, &data)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Suspended,
}

impl JobStatus {
    pub fn parse(status: &str) -> Option<Self> {
        match status.trim().to_ascii_lowercase().as_str() {
            "queued" | "starting" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" | "error" => Some(Self::Failed),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            "suspended" => Some(Self::Suspended),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// One decoded server frame
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    JobUpdate {
        job_id: Option<String>,
        workflow_id: Option<String>,
        /// `None` for statuses this client does not know
        status: Option<JobStatus>,
        raw_status: String,
        result: Option<BTreeMap<String, Value>>,
        error: Option<String>,
        message: Option<String>,
    },
    NodeUpdate {
        job_id: Option<String>,
        node_id: String,
        node_name: String,
        status: String,
        error: Option<String>,
        result: Option<Value>,
    },
    NodeProgress {
        job_id: Option<String>,
        node_id: String,
        progress: f64,
        total: f64,
    },
    ProgressUpdate {
        job_id: Option<String>,
        node_id: Option<String>,
        progress: f64,
        status_message: Option<String>,
    },
    OutputUpdate {
        job_id: Option<String>,
        node_id: String,
        node_name: String,
        output_name: String,
        value: Value,
    },
    PreviewUpdate {
        job_id: Option<String>,
        node_id: String,
        value: Value,
    },
    Error {
        job_id: Option<String>,
        message: String,
    },
    ConnectionStatus {
        status: String,
        message: Option<String>,
    },
    Text {
        text: String,
    },
    Unknown {
        discriminator: String,
        payload: Value,
    },
}

fn text(value: &Value, keys: &[&str]) -> Option<String> {
    value
        .get_any(keys)
        .and_then(Value::try_string)
        .filter(|s| !s.is_empty())
}

impl ServerMessage {
    /// Interpret a decoded frame. Fails with a protocol error when the frame
    /// has no discriminator or lacks a field its kind cannot do without.
    pub fn from_value(value: Value) -> Result<Self> {
        let discriminator = value
            .discriminator()
            .ok_or_else(|| NodetoolError::protocol("frame has no type discriminator"))?
            .to_string();
        let job_id = text(&value, &["job_id"]);

        let message = match discriminator.as_str() {
            "job_update" => {
                let raw_status = text(&value, &["status"]).ok_or_else(|| {
                    NodetoolError::protocol("job_update without status")
                })?;
                ServerMessage::JobUpdate {
                    job_id,
                    workflow_id: text(&value, &["workflow_id"]),
                    status: JobStatus::parse(&raw_status),
                    raw_status,
                    result: value.get("result").and_then(|r| r.as_map()).cloned(),
                    error: text(&value, &["error"]),
                    message: text(&value, &["message"]),
                }
            }
            "node_update" => ServerMessage::NodeUpdate {
                job_id,
                node_id: text(&value, &["node_id"]).unwrap_or_default(),
                node_name: text(&value, &["node_name", "node_id"]).unwrap_or_default(),
                status: text(&value, &["status"]).unwrap_or_default(),
                error: text(&value, &["error"]),
                result: value.get("result").filter(|r| !r.is_null()).cloned(),
            },
            "node_progress" => ServerMessage::NodeProgress {
                job_id,
                node_id: text(&value, &["node_id"]).unwrap_or_default(),
                progress: value.get("progress").and_then(Value::try_f64).unwrap_or(0.0),
                total: value.get("total").and_then(Value::try_f64).unwrap_or(100.0),
            },
            "progress_update" => ServerMessage::ProgressUpdate {
                job_id,
                node_id: text(&value, &["node_id"]),
                progress: value
                    .get("progress")
                    .and_then(Value::try_f64)
                    .ok_or_else(|| NodetoolError::protocol("progress_update without progress"))?,
                status_message: text(&value, &["status_message"]),
            },
            "output_update" => {
                let node_name = text(&value, &["node_name", "node", "node_id"])
                    .ok_or_else(|| NodetoolError::protocol("output_update without node"))?;
                let output_name = text(&value, &["output_name", "output"])
                    .ok_or_else(|| NodetoolError::protocol("output_update without output name"))?;
                ServerMessage::OutputUpdate {
                    job_id,
                    node_id: text(&value, &["node_id"]).unwrap_or_else(|| node_name.clone()),
                    node_name,
                    output_name,
                    value: value.get("value").cloned().unwrap_or_default(),
                }
            }
            "preview_update" => ServerMessage::PreviewUpdate {
                job_id,
                node_id: text(&value, &["node_id"]).unwrap_or_default(),
                value: value.get("value").cloned().unwrap_or_default(),
            },
            "error" => ServerMessage::Error {
                job_id,
                message: text(&value, &["message", "error"])
                    .unwrap_or_else(|| "unknown server error".to_string()),
            },
            "connection_status" => ServerMessage::ConnectionStatus {
                status: text(&value, &["status"]).unwrap_or_default(),
                message: text(&value, &["message"]),
            },
            "text" => ServerMessage::Text {
                text: text(&value, &["text"]).unwrap_or_default(),
            },
            _ => ServerMessage::Unknown {
                discriminator,
                payload: value,
            },
        };
        Ok(message)
    }

    pub fn job_id(&self) -> Option<&str> {
        match self {
            ServerMessage::JobUpdate { job_id, .. }
            | ServerMessage::NodeUpdate { job_id, .. }
            | ServerMessage::NodeProgress { job_id, .. }
            | ServerMessage::ProgressUpdate { job_id, .. }
            | ServerMessage::OutputUpdate { job_id, .. }
            | ServerMessage::PreviewUpdate { job_id, .. }
            | ServerMessage::Error { job_id, .. } => job_id.as_deref(),
            ServerMessage::ConnectionStatus { .. }
            | ServerMessage::Text { .. }
            | ServerMessage::Unknown { .. } => None,
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            ServerMessage::JobUpdate { .. } => "job_update",
            ServerMessage::NodeUpdate { .. } => "node_update",
            ServerMessage::NodeProgress { .. } => "node_progress",
            ServerMessage::ProgressUpdate { .. } => "progress_update",
            ServerMessage::OutputUpdate { .. } => "output_update",
            ServerMessage::PreviewUpdate { .. } => "preview_update",
            ServerMessage::Error { .. } => "error",
            ServerMessage::ConnectionStatus { .. } => "connection_status",
            ServerMessage::Text { .. } => "text",
            ServerMessage::Unknown { discriminator, .. } => discriminator,
        }
    }
}
