//! Session protocol client
//!
//! Owns the single connection to a NodeTool worker and every session running
//! over it. Frames are read on a background task and fanned out to per-session
//! event channels; callers drain those channels through [`SessionHandle`].

mod router;
mod session;


use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::{NodetoolError, Result};
use crate::protocol::{self, RunJobRequest, ServerMessage, WorkflowRef};
use crate::registry::{Decoded, TypeRegistry};
use crate::transport::{Connector, Credentials, Frame, FrameSink, FrameStream, WebSocketConnector};
use crate::value::Value;

use router::Router;

pub use session::{
    output_key, result_key, Completion, SessionEvent, SessionHandle, SessionState, JOB_RESULT_NODE,
};

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

struct ActiveLink {
    generation: u64,
    credentials: Credentials,
    outgoing: mpsc::UnboundedSender<Frame>,
    shutdown: CancellationToken,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

struct ClientState {
    connection: ConnectionState,
    generation: u64,
    link: Option<ActiveLink>,
    router: Router,
}

/// Resets a `Connecting` state left behind by an unfinished `connect`
struct ConnectingGuard<'a> {
    inner: &'a ClientInner,
    generation: u64,
    armed: bool,
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.inner.state.lock();
        if state.generation == self.generation && state.connection == ConnectionState::Connecting {
            state.connection = ConnectionState::Disconnected;
        }
    }
}

struct ClientInner {
    endpoint: String,
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    registry: TypeRegistry,
    /// Serializes connect/disconnect sequences
    lifecycle: AsyncMutex<()>,
    state: Mutex<ClientState>,
}

/// Client for one NodeTool worker connection
#[derive(Clone)]
pub struct NodetoolClient {
    inner: Arc<ClientInner>,
}

impl NodetoolClient {
    /// Client over the WebSocket transport with the built-in wire types
    pub fn new(config: ClientConfig) -> Result<Self> {
        let registry = protocol::builtin_registry()?;
        Self::with_connector(config, Arc::new(WebSocketConnector::new()), registry)
    }

    pub fn with_connector(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        registry: TypeRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let endpoint = config.normalized_ws_url()?;
        protocol::register_builtin_types(&registry)?;

        Ok(Self {
            inner: Arc::new(ClientInner {
                endpoint,
                config,
                connector,
                registry,
                lifecycle: AsyncMutex::new(()),
                state: Mutex::new(ClientState {
                    connection: ConnectionState::Disconnected,
                    generation: 0,
                    link: None,
                    router: Router::default(),
                }),
            }),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.inner.registry
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.lock().connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Sessions that have not reached a terminal state
    pub fn open_sessions(&self) -> usize {
        self.inner.state.lock().router.open_sessions()
    }

    /// Connect with the credentials and timeout from the config
    pub async fn connect_default(&self) -> Result<()> {
        let credentials = self.inner.config.credentials();
        self.connect(credentials, self.inner.config.connect_timeout())
            .await
    }

    /// Open the connection. An existing connection is torn down first. No
    /// retries: a rejected or timed-out handshake is returned to the caller.
    pub async fn connect(&self, credentials: Credentials, timeout: Duration) -> Result<()> {
        let _guard = self.inner.lifecycle.lock().await;

        if let Some(link) = self.inner.detach_link("reconnecting", None) {
            close_link(link).await;
        }

        let generation = {
            let mut state = self.inner.state.lock();
            state.connection = ConnectionState::Connecting;
            state.generation += 1;
            state.generation
        };

        // Falls back to Disconnected on every early exit, including the
        // caller dropping this future mid-handshake.
        let mut pending = ConnectingGuard {
            inner: &self.inner,
            generation,
            armed: true,
        };

        crate::info_log!("connecting to {}", self.inner.endpoint);
        let attempt = self.inner.connector.connect(&self.inner.endpoint, &credentials);
        let connection = match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => {
                crate::warn_log!("connect to {} failed: {}", self.inner.endpoint, e);
                return Err(e.into());
            }
            Err(_) => {
                crate::warn_log!("connect to {} timed out after {:?}", self.inner.endpoint, timeout);
                return Err(NodetoolError::ConnectTimeout { duration: timeout });
            }
        };

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        // Held while spawning so a task that fails at once sees its link.
        let mut state = self.inner.state.lock();
        let writer = tokio::spawn(write_loop(
            Arc::downgrade(&self.inner),
            generation,
            connection.sink,
            outgoing_rx,
            shutdown.clone(),
        ));
        let reader = tokio::spawn(read_loop(
            Arc::downgrade(&self.inner),
            generation,
            connection.stream,
            shutdown.clone(),
        ));
        state.link = Some(ActiveLink {
            generation,
            credentials,
            outgoing,
            shutdown,
            reader,
            writer,
        });
        state.connection = ConnectionState::Connected;
        pending.armed = false;
        crate::info_log!("connected to {}", self.inner.endpoint);
        Ok(())
    }

    /// Tear down the connection. Open sessions fail with "connection lost".
    /// Idempotent.
    pub async fn disconnect(&self) {
        let _guard = self.inner.lifecycle.lock().await;
        if let Some(link) = self.inner.detach_link("disconnect requested", None) {
            close_link(link).await;
            crate::info_log!("disconnected from {}", self.inner.endpoint);
        }
    }

    /// Send a run request and return the session handle in Pending state.
    /// Does not wait for the server.
    pub fn execute_workflow(
        &self,
        workflow: WorkflowRef,
        inputs: BTreeMap<String, Value>,
    ) -> Result<SessionHandle> {
        let mut state = self.inner.state.lock();
        if state.connection != ConnectionState::Connected {
            return Err(NodetoolError::NotConnected);
        }
        let link = state.link.as_ref().ok_or(NodetoolError::NotConnected)?;

        let config = &self.inner.config;
        let request = RunJobRequest {
            workflow: workflow.clone(),
            job_id: Uuid::new_v4().to_string(),
            inputs,
            execution_strategy: config.execution_strategy.clone(),
            user_id: link.credentials.user_id.clone(),
            auth_token: link.credentials.auth_token.clone(),
            api_url: config.api_url.clone(),
            explicit_types: config.explicit_types,
        };
        let bytes = protocol::encode_run_job(&self.inner.registry, &request)?;

        let outgoing = link.outgoing.clone();
        let (shared, handle) = session::new_session(
            request.job_id.clone(),
            workflow,
            outgoing.clone(),
            self.inner.registry.clone(),
        );

        if outgoing.send(Frame::Binary(bytes)).is_err() {
            crate::warn_log!("run request for {} could not be queued", handle.workflow());
            shared.finish(SessionState::Failed, Some(session::SEND_FAILED.to_string()));
            return Ok(handle);
        }

        crate::debug_log!(
            "requested run of {} (correlation {})",
            handle.workflow(),
            handle.correlation_id()
        );
        state.router.sweep();
        state.router.add_pending(shared);
        Ok(handle)
    }

    /// Execute by workflow id
    pub fn execute_workflow_id(
        &self,
        workflow_id: &str,
        inputs: BTreeMap<String, Value>,
    ) -> Result<SessionHandle> {
        self.execute_workflow(WorkflowRef::Id(workflow_id.to_string()), inputs)
    }
}

impl ClientInner {
    /// Remove the live link and fail every open session. Returns the link so
    /// the caller can wait for its tasks outside the state lock. With
    /// `generation` set, only that link is detached.
    fn detach_link(&self, reason: &str, generation: Option<u64>) -> Option<ActiveLink> {
        let (link, sessions) = {
            let mut state = self.state.lock();
            if let Some(generation) = generation {
                if state.link.as_ref().map(|link| link.generation) != Some(generation) {
                    return None;
                }
            }
            state.connection = ConnectionState::Disconnected;
            let link = state.link.take()?;
            (link, state.router.drain())
        };
        link.shutdown.cancel();
        if !sessions.is_empty() {
            crate::info_log!("{}: closing {} open sessions", reason, sessions.len());
        }
        for session in sessions {
            session.connection_lost();
        }
        Some(link)
    }

    /// Transport of `generation` went away on its own
    fn connection_lost(&self, generation: u64, reason: &str) {
        // Tasks of this link are already finishing; dropping their handles
        // detaches them.
        if self.detach_link(reason, Some(generation)).is_some() {
            crate::warn_log!("connection to {} lost: {}", self.endpoint, reason);
        }
    }

    fn handle_frame(&self, frame: Frame) {
        let value = match frame {
            Frame::Binary(bytes) => match self.registry.decode(&bytes, None) {
                Ok(decoded) => Decoded::into_value(decoded),
                Err(e) => {
                    crate::warn_log!("dropping malformed frame: {}", e);
                    return;
                }
            },
            Frame::Text(text) => {
                let mut map = BTreeMap::new();
                map.insert("type".to_string(), Value::from("text"));
                map.insert("text".to_string(), Value::from(text));
                Value::Map(map)
            }
        };

        if self.registry.classify(&value).is_none() {
            crate::warn_log!("dropping frame without type discriminator");
            return;
        }
        let message = match ServerMessage::from_value(value) {
            Ok(message) => message,
            Err(e) => {
                crate::warn_log!("dropping frame: {}", e);
                return;
            }
        };
        self.state.lock().router.dispatch(message);
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(link) = self.state.get_mut().link.take() {
            link.shutdown.cancel();
        }
    }
}

async fn close_link(link: ActiveLink) {
    let ActiveLink {
        outgoing,
        reader,
        writer,
        ..
    } = link;
    drop(outgoing);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        crate::debug_log!("writer did not drain in time");
    }
    let _ = reader.await;
}

async fn read_loop(
    client: std::sync::Weak<ClientInner>,
    generation: u64,
    mut stream: Box<dyn FrameStream>,
    shutdown: CancellationToken,
) {
    let reason = loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => return,
            frame = stream.next() => frame,
        };
        let Some(inner) = client.upgrade() else {
            return;
        };
        match frame {
            Some(Ok(frame)) => inner.handle_frame(frame),
            Some(Err(e)) => break e.to_string(),
            None => break "closed by server".to_string(),
        }
    };
    if let Some(inner) = client.upgrade() {
        inner.connection_lost(generation, &reason);
    }
}

async fn write_loop(
    client: std::sync::Weak<ClientInner>,
    generation: u64,
    mut sink: Box<dyn FrameSink>,
    mut outgoing: mpsc::UnboundedReceiver<Frame>,
    shutdown: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            frame = outgoing.recv() => frame,
            _ = shutdown.cancelled() => None,
        };
        let Some(frame) = frame else {
            break;
        };
        if let Err(e) = sink.send(frame).await {
            if let Some(inner) = client.upgrade() {
                inner.connection_lost(generation, &e.to_string());
            }
            break;
        }
    }
    if let Err(e) = sink.close().await {
        crate::debug_log!("closing sink: {}", e);
    }
}
