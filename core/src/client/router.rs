//! Frame-to-session routing
//!
//! A session starts out pending under its correlation id and moves to the
//! active table once the server names its job id. Finished sessions leave
//! both tables; their ids are remembered for a while so late frames are
//! dropped quietly instead of being reported as unknown.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use super::session::SessionShared;
use crate::error::NodetoolError;
use crate::protocol::ServerMessage;

const FINISHED_CAPACITY: usize = 256;

#[derive(Default)]
pub(crate) struct Router {
    pending: Vec<Arc<SessionShared>>,
    active: HashMap<String, Arc<SessionShared>>,
    finished: VecDeque<String>,
}

impl Router {
    pub(crate) fn add_pending(&mut self, session: Arc<SessionShared>) {
        self.pending.push(session);
    }

    pub(crate) fn open_sessions(&self) -> usize {
        self.pending.len() + self.active.len()
    }

    pub(crate) fn dispatch(&mut self, message: ServerMessage) {
        match &message {
            ServerMessage::ConnectionStatus { status, message } => {
                crate::debug_log!(
                    "connection status: {} {}",
                    status,
                    message.as_deref().unwrap_or_default()
                );
                return;
            }
            ServerMessage::Text { text } => {
                crate::debug_log!("unexpected text frame: {}", text);
                return;
            }
            ServerMessage::Unknown { discriminator, .. } => {
                crate::debug_log!("ignoring '{}' frame", discriminator);
                return;
            }
            _ => {}
        }

        if let Some(session) = self.resolve(&message) {
            session.apply(&message);
        }
        self.sweep();
    }

    fn resolve(&mut self, message: &ServerMessage) -> Option<Arc<SessionShared>> {
        let job_id = match message.job_id() {
            Some(job_id) => job_id,
            None => {
                if self.open_sessions() == 1 {
                    return self
                        .pending
                        .first()
                        .or_else(|| self.active.values().next())
                        .cloned();
                }
                report(NodetoolError::protocol(format!(
                    "{} frame without job id and {} open sessions",
                    message.kind(),
                    self.open_sessions()
                )));
                return None;
            }
        };

        if let Some(session) = self.active.get(job_id) {
            return Some(session.clone());
        }

        // The server echoed our correlation id as the job id
        if let Some(index) = self.pending.iter().position(|s| s.correlation_id() == job_id) {
            return Some(self.bind(index, job_id));
        }

        if let ServerMessage::JobUpdate { workflow_id, .. } = message {
            if let Some(workflow_id) = workflow_id {
                if let Some(index) = self
                    .pending
                    .iter()
                    .position(|s| s.workflow().id() == Some(workflow_id.as_str()))
                {
                    return Some(self.bind(index, job_id));
                }
            }
            if self.pending.len() == 1 {
                crate::debug_log!("binding job {} to the only pending session", job_id);
                return Some(self.bind(0, job_id));
            }
        }

        if self.finished.iter().any(|id| id == job_id) {
            crate::debug_log!("late {} frame for finished job {}", message.kind(), job_id);
            return None;
        }

        report(NodetoolError::protocol(format!(
            "{} frame for unknown job {}",
            message.kind(),
            job_id
        )));
        None
    }

    fn bind(&mut self, index: usize, job_id: &str) -> Arc<SessionShared> {
        let session = self.pending.remove(index);
        session.bind(job_id);
        self.active.insert(job_id.to_string(), session.clone());
        session
    }

    /// Drop finished sessions from both tables
    pub(crate) fn sweep(&mut self) {
        let mut retired = Vec::new();
        self.pending.retain(|s| {
            if s.is_terminal() {
                retired.push(s.correlation_id().to_string());
                false
            } else {
                true
            }
        });
        self.active.retain(|job_id, s| {
            if s.is_terminal() {
                retired.push(job_id.clone());
                false
            } else {
                true
            }
        });
        for id in retired {
            self.remember(id);
        }
    }

    /// Remove every open session, e.g. on connection loss
    pub(crate) fn drain(&mut self) -> Vec<Arc<SessionShared>> {
        let mut drained: Vec<Arc<SessionShared>> = self.pending.drain(..).collect();
        for (job_id, session) in self.active.drain() {
            drained.push(session);
            if self.finished.len() >= FINISHED_CAPACITY {
                self.finished.pop_front();
            }
            self.finished.push_back(job_id);
        }
        drained
    }

    fn remember(&mut self, id: String) {
        if self.finished.len() >= FINISHED_CAPACITY {
            self.finished.pop_front();
        }
        self.finished.push_back(id);
    }
}

fn report(error: NodetoolError) {
    crate::warn_log!("dropping frame: {}", error);
}
