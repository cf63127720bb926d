//! Session registry: at most one non-terminal session per subject.
//!
//! The lock only guards the session map; polling runs in per-session tasks. Terminal
//! sessions stay readable until their result is taken or they are reaped after
//! `reap_grace`.

use crate::abi::{RequestId, SubjectId};
use crate::config::{ConfigError, MonitorConfig};
use crate::gateway::LedgerClient;
use crate::session::{MonitorSession, SessionContext, SessionStatus};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session already active for subject {0}")]
    SessionAlreadyActive(SubjectId),
    #[error("no session for subject {0}")]
    NotFound(SubjectId),
    #[error("session for subject {0} is still pending")]
    StillPending(SubjectId),
}

struct Entry {
    status: watch::Receiver<SessionStatus>,
    cancel: CancellationToken,
    task: JoinHandle<SessionStatus>,
}

impl Entry {
    fn snapshot(&self) -> SessionStatus {
        self.status.borrow().clone()
    }
}

/// Caller-side view of a started session.
pub struct SessionHandle {
    subject: SubjectId,
    status: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    pub fn subject(&self) -> SubjectId {
        self.subject
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Wait until the session is terminal.
    pub async fn wait(&mut self) -> SessionStatus {
        let done = self
            .status
            .wait_for(|s| s.state.is_terminal())
            .await
            .map(|s| (*s).clone());
        match done {
            Ok(s) => s,
            // Sender gone: the last published value is the final one.
            Err(_) => self.status.borrow().clone(),
        }
    }
}

pub struct SessionRegistry {
    ctx: Arc<SessionContext>,
    sessions: Mutex<HashMap<SubjectId, Entry>>,
    shutdown: CancellationToken,
}

impl SessionRegistry {
    pub fn new(client: Arc<dyn LedgerClient>, config: MonitorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            ctx: Arc::new(SessionContext::new(client, config)),
            sessions: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.ctx.config
    }

    /// Start monitoring `subject`. `request_id` is optional and may be discovered later.
    pub async fn start_session(
        &self,
        subject: SubjectId,
        request_id: Option<RequestId>,
    ) -> Result<SessionHandle, RegistryError> {
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(&subject) {
            if !existing.status.borrow().state.is_terminal() {
                return Err(RegistryError::SessionAlreadyActive(subject));
            }
        }
        let cancel = self.shutdown.child_token();
        let (session, status) =
            MonitorSession::new(Arc::clone(&self.ctx), subject, request_id, cancel.clone());
        let task = tokio::spawn(session.run());
        // Replaces a terminal entry for the same subject, if any.
        sessions.insert(
            subject,
            Entry {
                status: status.clone(),
                cancel,
                task,
            },
        );
        Ok(SessionHandle { subject, status })
    }

    /// Latest status; terminal results stay readable until taken or reaped.
    pub async fn status(&self, subject: &SubjectId) -> Result<SessionStatus, RegistryError> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(subject)
            .map(Entry::snapshot)
            .ok_or(RegistryError::NotFound(*subject))
    }

    /// Ask the session to stop before its next poll. No-op for terminal sessions.
    pub async fn cancel(&self, subject: &SubjectId) -> Result<(), RegistryError> {
        let sessions = self.sessions.lock().await;
        let entry = sessions
            .get(subject)
            .ok_or(RegistryError::NotFound(*subject))?;
        if !entry.status.borrow().state.is_terminal() {
            tracing::info!(%subject, "session cancellation requested");
            entry.cancel.cancel();
        }
        Ok(())
    }

    /// Consume a terminal result and retire the session.
    pub async fn take_result(&self, subject: &SubjectId) -> Result<SessionStatus, RegistryError> {
        let mut sessions = self.sessions.lock().await;
        let status = sessions
            .get(subject)
            .map(Entry::snapshot)
            .ok_or(RegistryError::NotFound(*subject))?;
        if !status.state.is_terminal() {
            return Err(RegistryError::StillPending(*subject));
        }
        sessions.remove(subject);
        Ok(status)
    }

    /// Number of sessions still pending.
    pub async fn active_count(&self) -> usize {
        let sessions = self.sessions.lock().await;
        sessions
            .values()
            .filter(|e| !e.status.borrow().state.is_terminal())
            .count()
    }

    /// Retire terminal sessions whose result went uncollected for `reap_grace`.
    pub async fn reap(&self) -> usize {
        let grace = self.ctx.config.reap_grace();
        let now = Instant::now();
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|subject, e| {
            let expired = e
                .status
                .borrow()
                .finished_at
                .map(|t| now.duration_since(t) >= grace)
                .unwrap_or(false);
            if expired {
                tracing::debug!(%subject, "reaping uncollected session");
            }
            !expired
        });
        before - sessions.len()
    }

    /// Periodically [reap](Self::reap) until [shutdown](Self::shutdown).
    pub fn spawn_reaper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = registry.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(every) => {
                        let n = registry.reap().await;
                        if n > 0 {
                            tracing::info!(reaped = n, "reaped terminal sessions");
                        }
                    }
                }
            }
        })
    }

    /// Cancel every session and wait for their tasks to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<SessionStatus>> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().map(|(_, e)| e.task).collect()
        };
        for r in join_all(tasks).await {
            if let Err(e) = r {
                tracing::warn!(reason = %e, "session task ended abnormally");
            }
        }
    }
}
