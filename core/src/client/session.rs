//! Per-execution session state and the caller-side handle

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::error::{NodetoolError, Result};
use crate::protocol::{self, JobStatus, ServerMessage, WorkflowRef};
use crate::registry::TypeRegistry;
use crate::transport::Frame;
use crate::value::Value;

pub(crate) const CONNECTION_LOST: &str = "connection lost";
pub(crate) const JOB_CANCELLED: &str = "job cancelled";
pub(crate) const SEND_FAILED: &str = "failed to send execution request";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Events of one session, in receipt order. `Completed` is always last.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Accepted {
        job_id: String,
    },
    Progress {
        fraction: f64,
    },
    NodeUpdated {
        node_id: String,
        node_name: String,
        status: String,
        error: Option<String>,
    },
    Output {
        node_name: String,
        output_name: String,
        value: Value,
    },
    Preview {
        node_id: String,
        value: Value,
    },
    Completed {
        success: bool,
        error: Option<String>,
    },
}

/// Final outcome of a session
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub state: SessionState,
    pub success: bool,
    pub error: Option<String>,
    /// Streamed outputs merged with any carried on the terminal frame
    pub outputs: BTreeMap<String, Value>,
}

impl Completion {
    pub fn into_result(self) -> Result<BTreeMap<String, Value>> {
        match self.state {
            SessionState::Completed => Ok(self.outputs),
            SessionState::Cancelled => Err(NodetoolError::Cancelled),
            _ => Err(NodetoolError::session(
                self.error.unwrap_or_else(|| "unknown error".to_string()),
            )),
        }
    }
}

pub fn output_key(node_name: &str, output_name: &str) -> String {
    format!("{}:{}", node_name, output_name)
}

/// Node name under which terminal `result` outputs are keyed
pub const JOB_RESULT_NODE: &str = "job_result";

/// Key for an entry of a terminal frame's `result`. Those are keyed by the
/// workflow's output names, so plain names land under [`JOB_RESULT_NODE`];
/// keys already in `node:output` form are kept as sent.
pub fn result_key(name: &str) -> String {
    if name.contains(':') {
        name.to_string()
    } else {
        output_key(JOB_RESULT_NODE, name)
    }
}

struct SessionInner {
    job_id: Option<String>,
    state: SessionState,
    progress: f64,
    outputs: BTreeMap<String, Value>,
    error: Option<String>,
    cancel_requested: bool,
    /// Dropped once `Completed` went out so the handle's stream ends
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl SessionInner {
    fn emit(&self, event: SessionEvent) {
        if let Some(events) = &self.events {
            // The caller may have dropped its receiver; state still updates.
            let _ = events.send(event);
        }
    }
}

/// Shared between the router (writer) and the caller's handle (reader)
pub(crate) struct SessionShared {
    correlation_id: String,
    workflow: WorkflowRef,
    inner: Mutex<SessionInner>,
    completion: watch::Sender<Option<Completion>>,
    outgoing: mpsc::UnboundedSender<Frame>,
    registry: TypeRegistry,
}

impl SessionShared {
    pub(crate) fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub(crate) fn workflow(&self) -> &WorkflowRef {
        &self.workflow
    }

    pub(crate) fn job_id(&self) -> Option<String> {
        self.inner.lock().job_id.clone()
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.inner.lock().state.is_terminal()
    }

    /// Server accepted the job under `job_id`
    pub(crate) fn bind(&self, job_id: &str) {
        let mut inner = self.inner.lock();
        if inner.job_id.is_some() || inner.state.is_terminal() {
            return;
        }
        inner.job_id = Some(job_id.to_string());
        inner.state = SessionState::Running;
        inner.emit(SessionEvent::Accepted {
            job_id: job_id.to_string(),
        });
    }

    pub(crate) fn apply(&self, message: &ServerMessage) {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            crate::debug_log!(
                "ignoring {} frame for finished session {}",
                message.kind(),
                self.correlation_id
            );
            return;
        }

        match message {
            ServerMessage::JobUpdate {
                status,
                raw_status,
                result,
                error,
                message,
                ..
            } => match status {
                Some(JobStatus::Queued) | Some(JobStatus::Running) => {
                    if inner.state == SessionState::Pending {
                        inner.state = SessionState::Running;
                    }
                }
                Some(JobStatus::Suspended) => {
                    crate::info_log!("session {} suspended", self.correlation_id);
                }
                Some(JobStatus::Completed) => {
                    self.finish_locked(&mut inner, SessionState::Completed, None, result.as_ref());
                }
                Some(JobStatus::Failed) => {
                    let reason = error
                        .clone()
                        .or_else(|| message.clone())
                        .unwrap_or_else(|| "unknown error".to_string());
                    self.finish_locked(&mut inner, SessionState::Failed, Some(reason), result.as_ref());
                }
                Some(JobStatus::Cancelled) => {
                    self.finish_locked(
                        &mut inner,
                        SessionState::Cancelled,
                        Some(JOB_CANCELLED.to_string()),
                        result.as_ref(),
                    );
                }
                None => {
                    crate::debug_log!("unrecognised job status '{}'", raw_status);
                }
            },
            ServerMessage::NodeUpdate {
                node_id,
                node_name,
                status,
                error,
                ..
            } => inner.emit(SessionEvent::NodeUpdated {
                node_id: node_id.clone(),
                node_name: node_name.clone(),
                status: status.clone(),
                error: error.clone(),
            }),
            ServerMessage::NodeProgress {
                progress, total, ..
            } => {
                if *total > 0.0 {
                    inner.progress = progress / total;
                    let fraction = inner.progress;
                    inner.emit(SessionEvent::Progress { fraction });
                }
            }
            ServerMessage::ProgressUpdate { progress, .. } => {
                inner.progress = *progress;
                inner.emit(SessionEvent::Progress {
                    fraction: *progress,
                });
            }
            ServerMessage::OutputUpdate {
                node_name,
                output_name,
                value,
                ..
            } => {
                inner
                    .outputs
                    .insert(output_key(node_name, output_name), value.clone());
                inner.emit(SessionEvent::Output {
                    node_name: node_name.clone(),
                    output_name: output_name.clone(),
                    value: value.clone(),
                });
            }
            ServerMessage::PreviewUpdate { node_id, value, .. } => {
                inner.emit(SessionEvent::Preview {
                    node_id: node_id.clone(),
                    value: value.clone(),
                })
            }
            ServerMessage::Error { message, .. } => {
                self.finish_locked(&mut inner, SessionState::Failed, Some(message.clone()), None);
            }
            ServerMessage::ConnectionStatus { .. }
            | ServerMessage::Text { .. }
            | ServerMessage::Unknown { .. } => {}
        }
    }

    /// Move to a terminal state. Returns false when already terminal.
    pub(crate) fn finish(&self, state: SessionState, error: Option<String>) -> bool {
        let mut inner = self.inner.lock();
        self.finish_locked(&mut inner, state, error, None)
    }

    /// The connection went away underneath this session
    pub(crate) fn connection_lost(&self) {
        let mut inner = self.inner.lock();
        if inner.cancel_requested {
            self.finish_locked(&mut inner, SessionState::Cancelled, Some(JOB_CANCELLED.to_string()), None);
        } else {
            self.finish_locked(&mut inner, SessionState::Failed, Some(CONNECTION_LOST.to_string()), None);
        }
    }

    fn finish_locked(
        &self,
        inner: &mut SessionInner,
        state: SessionState,
        error: Option<String>,
        terminal_outputs: Option<&BTreeMap<String, Value>>,
    ) -> bool {
        if inner.state.is_terminal() {
            return false;
        }
        if let Some(extra) = terminal_outputs {
            // Keys already streamed win over the terminal frame's copy
            for (key, value) in extra {
                inner
                    .outputs
                    .entry(result_key(key))
                    .or_insert_with(|| value.clone());
            }
        }
        inner.state = state;
        inner.error = error.clone();
        let success = state == SessionState::Completed;

        crate::info_log!(
            "session {} finished: {:?}{}",
            inner.job_id.as_deref().unwrap_or(&self.correlation_id),
            state,
            error
                .as_deref()
                .map(|e| format!(" ({})", e))
                .unwrap_or_default()
        );

        inner.emit(SessionEvent::Completed {
            success,
            error: error.clone(),
        });
        inner.events = None;

        let completion = Completion {
            state,
            success,
            error,
            outputs: inner.outputs.clone(),
        };
        self.completion.send_replace(Some(completion));
        true
    }

    /// Ask the server to stop the job. Best effort.
    pub(crate) fn request_cancel(&self) {
        let job_id = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return;
            }
            inner.cancel_requested = true;
            inner
                .job_id
                .clone()
                .unwrap_or_else(|| self.correlation_id.clone())
        };

        let bytes = match protocol::encode_cancel_job(&self.registry, &job_id, self.workflow.id()) {
            Ok(bytes) => bytes,
            Err(e) => {
                crate::warn_log!("could not encode cancel for job {}: {}", job_id, e);
                return;
            }
        };
        if self.outgoing.send(Frame::Binary(bytes)).is_err() {
            crate::debug_log!("cancel for job {} not sent: connection closed", job_id);
        }
    }
}

pub(crate) fn new_session(
    correlation_id: String,
    workflow: WorkflowRef,
    outgoing: mpsc::UnboundedSender<Frame>,
    registry: TypeRegistry,
) -> (Arc<SessionShared>, SessionHandle) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (completion_tx, completion_rx) = watch::channel(None);
    let shared = Arc::new(SessionShared {
        correlation_id,
        workflow,
        inner: Mutex::new(SessionInner {
            job_id: None,
            state: SessionState::Pending,
            progress: 0.0,
            outputs: BTreeMap::new(),
            error: None,
            cancel_requested: false,
            events: Some(events_tx),
        }),
        completion: completion_tx,
        outgoing,
        registry,
    });
    let handle = SessionHandle {
        shared: shared.clone(),
        events: events_rx,
        completion: completion_rx,
    };
    (shared, handle)
}

/// Caller's view of one workflow execution
pub struct SessionHandle {
    shared: Arc<SessionShared>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    completion: watch::Receiver<Option<Completion>>,
}

impl SessionHandle {
    /// Client-generated correlation id sent with the run request
    pub fn correlation_id(&self) -> &str {
        self.shared.correlation_id()
    }

    /// Server job id, once the job was accepted
    pub fn job_id(&self) -> Option<String> {
        self.shared.job_id()
    }

    pub fn workflow(&self) -> &WorkflowRef {
        self.shared.workflow()
    }

    pub fn state(&self) -> SessionState {
        self.shared.inner.lock().state
    }

    pub fn progress(&self) -> f64 {
        self.shared.inner.lock().progress
    }

    pub fn error(&self) -> Option<String> {
        self.shared.inner.lock().error.clone()
    }

    /// Snapshot of the latest value per `node:output` key
    pub fn latest_outputs(&self) -> BTreeMap<String, Value> {
        self.shared.inner.lock().outputs.clone()
    }

    pub fn latest_output(&self, node_name: &str, output_name: &str) -> Option<Value> {
        self.shared
            .inner
            .lock()
            .outputs
            .get(&output_key(node_name, output_name))
            .cloned()
    }

    /// Next event; `None` after `Completed` has been drained
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    pub fn try_next_event(&mut self) -> Option<SessionEvent> {
        self.events.try_recv().ok()
    }

    /// Request server-side cancellation. The session turns Cancelled when the
    /// server acknowledges or the connection goes away.
    pub fn cancel(&self) {
        self.shared.request_cancel();
    }

    /// Wait until the session finishes or `cancel` fires. Cancelling the wait
    /// notifies the server best-effort and marks the session Cancelled.
    pub async fn wait_for_completion(&self, cancel: &CancellationToken) -> Completion {
        let mut completion = self.completion.clone();
        tokio::select! {
            done = completion.wait_for(Option::is_some) => {
                if let Some(result) = done.ok().and_then(|c| c.clone()) {
                    return result;
                }
            }
            _ = cancel.cancelled() => {
                self.shared.request_cancel();
                self.shared.finish(SessionState::Cancelled, Some(JOB_CANCELLED.to_string()));
            }
        }
        self.current_completion()
    }

    fn current_completion(&self) -> Completion {
        if let Some(done) = self.completion.borrow().clone() {
            return done;
        }
        let inner = self.shared.inner.lock();
        Completion {
            state: inner.state,
            success: inner.state == SessionState::Completed,
            error: inner.error.clone(),
            outputs: inner.outputs.clone(),
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("correlation_id", &self.shared.correlation_id)
            .field("workflow", &self.shared.workflow)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> (Arc<SessionShared>, SessionHandle, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = protocol::builtin_registry().unwrap();
        let (shared, handle) = new_session("corr".into(), WorkflowRef::Id("wf".into()), tx, registry);
        (shared, handle, rx)
    }

    fn output(node: &str, name: &str, value: Value) -> ServerMessage {
        ServerMessage::OutputUpdate {
            job_id: Some("j".into()),
            node_id: node.into(),
            node_name: node.into(),
            output_name: name.into(),
            value,
        }
    }

    fn job_update(status: &str, result: Option<BTreeMap<String, Value>>) -> ServerMessage {
        ServerMessage::JobUpdate {
            job_id: Some("j".into()),
            workflow_id: None,
            status: JobStatus::parse(status),
            raw_status: status.into(),
            result,
            error: None,
            message: None,
        }
    }

    #[test]
    fn test_outputs_overwrite_per_key() {
        let (shared, handle, _rx) = session();
        shared.bind("j");
        shared.apply(&output("out", "image", Value::from(1)));
        shared.apply(&output("out", "image", Value::from(2)));
        shared.apply(&output("out", "mask", Value::from(3)));
        assert_eq!(handle.latest_output("out", "image"), Some(Value::from(2)));
        assert_eq!(handle.latest_outputs().len(), 2);
    }

    #[test]
    fn test_terminal_outputs_do_not_overwrite_streamed_values() {
        let (shared, handle, _rx) = session();
        shared.bind("j");
        shared.apply(&output("out", "image", Value::from("streamed")));
        let result = BTreeMap::from([
            ("out:image".to_string(), Value::from("final")),
            ("text".to_string(), Value::from("hello")),
        ]);
        shared.apply(&job_update("completed", Some(result)));

        let done = handle.completion.borrow().clone().unwrap();
        assert!(done.success);
        assert_eq!(done.outputs["out:image"], Value::from("streamed"));
        assert_eq!(done.outputs["job_result:text"], Value::from("hello"));
        assert!(!done.outputs.contains_key("text"));
    }

    #[test]
    fn test_result_keys_share_the_node_output_form() {
        assert_eq!(result_key("inverted"), "job_result:inverted");
        assert_eq!(result_key("out:image"), "out:image");

        let (shared, handle, _rx) = session();
        shared.bind("j");
        shared.apply(&output(JOB_RESULT_NODE, "inverted", Value::from("streamed")));
        let result = BTreeMap::from([
            ("inverted".to_string(), Value::from("final")),
            ("caption".to_string(), Value::from("a cat")),
        ]);
        shared.apply(&job_update("completed", Some(result)));

        let outputs = handle.latest_outputs();
        assert_eq!(outputs["job_result:inverted"], Value::from("streamed"));
        assert_eq!(outputs["job_result:caption"], Value::from("a cat"));
        assert_eq!(outputs.len(), 2);
    }

    #[test]
    fn test_terminal_is_final_and_completed_is_last() {
        let (shared, mut handle, _rx) = session();
        shared.bind("j");
        shared.apply(&job_update("failed", None));
        shared.apply(&job_update("completed", None));
        shared.apply(&output("out", "x", Value::Null));
        assert_eq!(handle.state(), SessionState::Failed);
        assert_eq!(handle.error().as_deref(), Some("unknown error"));

        let mut events = Vec::new();
        while let Some(event) = handle.try_next_event() {
            events.push(event);
        }
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], SessionEvent::Accepted { .. }));
        assert_eq!(
            events[1],
            SessionEvent::Completed {
                success: false,
                error: Some("unknown error".into())
            }
        );
    }

    #[test]
    fn test_suspended_stays_open_and_node_progress_needs_total() {
        let (shared, mut handle, _rx) = session();
        shared.bind("j");
        shared.apply(&job_update("suspended", None));
        assert_eq!(handle.state(), SessionState::Running);

        shared.apply(&ServerMessage::NodeProgress {
            job_id: None,
            node_id: "n".into(),
            progress: 5.0,
            total: 0.0,
        });
        shared.apply(&ServerMessage::NodeProgress {
            job_id: None,
            node_id: "n".into(),
            progress: 5.0,
            total: 20.0,
        });
        let _accepted = handle.try_next_event();
        assert_eq!(
            handle.try_next_event(),
            Some(SessionEvent::Progress { fraction: 0.25 })
        );
        assert_eq!(handle.try_next_event(), None);
    }

    #[test]
    fn test_cancel_request_sends_cancel_job() {
        let (shared, handle, mut rx) = session();
        shared.bind("j");
        handle.cancel();
        let frame = rx.try_recv().unwrap();
        let bytes = match frame {
            Frame::Binary(bytes) => bytes,
            other => panic!("unexpected {:?}", other),
        };
        let value = crate::registry::decode_value(&bytes).unwrap();
        assert_eq!(value.discriminator(), Some(protocol::CANCEL_JOB));
        assert_eq!(
            value.get("data").and_then(|d| d.get("job_id")).and_then(Value::as_str),
            Some("j")
        );
        assert_eq!(
            value.get("data").and_then(|d| d.get("workflow_id")).and_then(Value::as_str),
            Some("wf")
        );

        // Teardown after a cancel request resolves to Cancelled
        shared.connection_lost();
        assert_eq!(handle.state(), SessionState::Cancelled);
    }

    #[test]
    fn test_connection_lost_fails_session() {
        let (shared, handle, _rx) = session();
        shared.bind("j");
        shared.connection_lost();
        assert_eq!(handle.state(), SessionState::Failed);
        assert_eq!(handle.error().as_deref(), Some(CONNECTION_LOST));
    }

    #[tokio::test]
    async fn test_wait_cancelled_marks_session_cancelled() {
        let (shared, handle, mut rx) = session();
        shared.bind("j");
        shared.apply(&output("out", "text", Value::from("partial")));

        let token = CancellationToken::new();
        token.cancel();
        let done = handle.wait_for_completion(&token).await;
        assert_eq!(done.state, SessionState::Cancelled);
        assert!(!done.success);
        assert_eq!(done.outputs["out:text"], Value::from("partial"));
        assert!(rx.try_recv().is_ok());
        assert!(matches!(done.into_result(), Err(NodetoolError::Cancelled)));
    }

    #[test]
    fn test_completion_into_result() {
        let done = Completion {
            state: SessionState::Failed,
            success: false,
            error: Some("boom".into()),
            outputs: BTreeMap::new(),
        };
        let err = done.into_result().unwrap_err();
        assert_eq!(err.to_string(), "session failed: boom");
    }
}
