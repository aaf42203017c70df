//! Validates and executes commands against the editing session, records
//! every invocation in history and drives undo.
//!
//! `execute` and `undo` are serialized by a FIFO execution lock, and
//! sequence numbers are assigned under it, so state changes happen in
//! sequence order. History reads never take the lock.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

use crate::command::params::{validate, BoundParams};
use crate::command::{Applied, ApplyContext, CancelFlag, CommandDef, UndoRecord};
use crate::error::AppError;
use crate::registry::Registry;
use crate::session::EditingSession;

// ── Invocation records ──────────────────────────────────────────

/// Who asked for a command.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Caller {
    Human,
    Agent(String),
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Caller::Human => f.write_str("human"),
            Caller::Agent(id) => write!(f, "agent:{id}"),
        }
    }
}

impl Serialize for Caller {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pending,
    Applied,
    Reverted,
    Failed,
}

/// One execution of a command. Only the dispatcher creates these.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandInvocation {
    pub sequence: u64,
    pub command: String,
    pub params: BoundParams,
    pub timestamp_ms: u64,
    pub caller: Caller,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AppError>,
}

struct HistoryEntry {
    invocation: CommandInvocation,
    undo: Option<UndoRecord>,
}

struct History {
    entries: Vec<HistoryEntry>,
    next_sequence: u64,
}

impl History {
    fn entry_mut(&mut self, sequence: u64) -> Option<&mut HistoryEntry> {
        self.entries
            .iter_mut()
            .rev()
            .find(|e| e.invocation.sequence == sequence)
    }

    /// Record the outcome of a pending invocation and return a snapshot.
    fn settle(
        &mut self,
        sequence: u64,
        outcome: Outcome,
        feedback: Option<String>,
        error: Option<AppError>,
        undo: Option<UndoRecord>,
    ) -> Option<CommandInvocation> {
        let entry = self.entry_mut(sequence)?;
        entry.invocation.outcome = outcome;
        entry.invocation.feedback = feedback;
        entry.invocation.error = error;
        entry.undo = undo;
        Some(entry.invocation.clone())
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

fn timeout_ms(limit: Duration) -> u64 {
    u64::try_from(limit.as_millis()).unwrap_or(u64::MAX)
}

// ── Dispatcher ──────────────────────────────────────────────────

pub struct Dispatcher {
    registry: Arc<Registry>,
    session: Arc<dyn EditingSession>,
    history: Arc<Mutex<History>>,
    exec_lock: Arc<tokio::sync::Mutex<()>>,
    feedback_enabled: bool,
}

/// Everything the blocking apply task needs, owned.
struct ApplyJob {
    def: CommandDef,
    params: BoundParams,
    sequence: u64,
    caller: Caller,
    session: Arc<dyn EditingSession>,
    history: Arc<Mutex<History>>,
    cancel: Arc<CancelFlag>,
    feedback_enabled: bool,
    timeout_ms: u64,
}

impl ApplyJob {
    fn run(self) -> Result<CommandInvocation, AppError> {
        let ctx = ApplyContext::new(self.session.as_ref(), &self.cancel);
        let result = self.def.kind.apply(&ctx, &self.params);
        match result {
            Ok(applied) if self.cancel.finish() => Ok(self.record_applied(applied)),
            Ok(applied) => {
                // Cancelled while the change was being made: take it back.
                // What cannot be taken back stays applied in the history.
                let compensated = match applied.undo.clone() {
                    Some(undo) => match undo.revert(self.session.as_ref()) {
                        Ok(()) => true,
                        Err(e) => {
                            tracing::error!(
                                sequence = self.sequence,
                                command = self.def.identifier,
                                error = %e,
                                "could not compensate timed-out command"
                            );
                            false
                        }
                    },
                    None => false,
                };
                if compensated {
                    Err(self.record_failed(AppError::Timeout {
                        timeout_ms: self.timeout_ms,
                    }))
                } else {
                    tracing::warn!(
                        sequence = self.sequence,
                        command = self.def.identifier,
                        "timed-out command finished and stays applied"
                    );
                    Ok(self.record_applied(applied))
                }
            }
            Err(AppError::Cancelled) if self.cancel.is_cancelled() => Err(self.record_failed(AppError::Timeout {
                timeout_ms: self.timeout_ms,
            })),
            Err(e) => {
                self.cancel.finish();
                Err(self.record_failed(e))
            }
        }
    }

    fn record_applied(&self, applied: Applied) -> CommandInvocation {
        let feedback = self
            .feedback_enabled
            .then(|| self.def.feedback(&self.params, &applied.effect));
        tracing::info!(
            sequence = self.sequence,
            command = self.def.identifier,
            caller = %self.caller,
            "command applied"
        );
        let mut history = self.history.lock();
        history
            .settle(self.sequence, Outcome::Applied, feedback.clone(), None, applied.undo)
            .unwrap_or_else(|| CommandInvocation {
                sequence: self.sequence,
                command: self.def.identifier.to_string(),
                params: self.params.clone(),
                timestamp_ms: now_ms(),
                caller: self.caller.clone(),
                outcome: Outcome::Applied,
                feedback,
                error: None,
            })
    }

    /// Mark the invocation failed and return the error the caller sees.
    fn record_failed(&self, cause: AppError) -> AppError {
        tracing::warn!(
            sequence = self.sequence,
            command = self.def.identifier,
            caller = %self.caller,
            error = %cause,
            "command failed"
        );
        self.history
            .lock()
            .settle(self.sequence, Outcome::Failed, None, Some(cause.clone()), None);
        AppError::CommandExecution {
            command: self.def.identifier.to_string(),
            sequence: self.sequence,
            cause: Box::new(cause),
        }
    }
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, session: Arc<dyn EditingSession>, feedback_enabled: bool) -> Self {
        Self {
            registry,
            session,
            history: Arc::new(Mutex::new(History {
                entries: Vec::new(),
                next_sequence: 1,
            })),
            exec_lock: Arc::new(tokio::sync::Mutex::new(())),
            feedback_enabled,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn session(&self) -> &Arc<dyn EditingSession> {
        &self.session
    }

    /// Validate and apply a command. With a `timeout`, the whole call
    /// (queueing included) is bounded; a call that times out while queued
    /// creates no invocation.
    pub async fn execute(
        &self,
        identifier: &str,
        raw: &Map<String, Value>,
        caller: Caller,
        timeout: Option<Duration>,
    ) -> Result<CommandInvocation, AppError> {
        let def = *self.registry.lookup(identifier)?;
        let params = validate(def.params, raw)?;
        let started = tokio::time::Instant::now();
        let limit_ms = timeout.map_or(0, timeout_ms);

        let lock = self.exec_lock.clone().lock_owned();
        let guard = match timeout {
            Some(limit) => tokio::time::timeout(limit, lock)
                .await
                .map_err(|_| AppError::Timeout { timeout_ms: limit_ms })?,
            None => lock.await,
        };

        let sequence = {
            let mut history = self.history.lock();
            let sequence = history.next_sequence;
            history.next_sequence += 1;
            history.entries.push(HistoryEntry {
                invocation: CommandInvocation {
                    sequence,
                    command: def.identifier.to_string(),
                    params: params.clone(),
                    timestamp_ms: now_ms(),
                    caller: caller.clone(),
                    outcome: Outcome::Pending,
                    feedback: None,
                    error: None,
                },
                undo: None,
            });
            sequence
        };
        tracing::debug!(sequence, command = def.identifier, caller = %caller, "executing");

        let cancel = Arc::new(CancelFlag::new());
        let job = ApplyJob {
            def,
            params,
            sequence,
            caller,
            session: self.session.clone(),
            history: self.history.clone(),
            cancel: cancel.clone(),
            feedback_enabled: self.feedback_enabled,
            timeout_ms: limit_ms,
        };
        // The lock guard travels with the job so the next command cannot start
        // until this one has settled, even if the waiter goes away.
        let mut handle = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            job.run()
        });

        let remaining = timeout.map(|limit| limit.saturating_sub(started.elapsed()));
        let joined = match remaining {
            Some(remaining) => match tokio::time::timeout(remaining, &mut handle).await {
                Ok(joined) => joined,
                Err(_) if cancel.cancel() => {
                    // The job sees the flag and records the failure itself.
                    return Err(AppError::CommandExecution {
                        command: def.identifier.to_string(),
                        sequence,
                        cause: Box::new(AppError::Timeout { timeout_ms: limit_ms }),
                    });
                }
                Err(_) => handle.await,
            },
            None => handle.await,
        };

        joined.unwrap_or_else(|e| {
            let cause = AppError::Io {
                message: format!("apply task failed: {e}"),
            };
            self.history
                .lock()
                .settle(sequence, Outcome::Failed, None, Some(cause.clone()), None);
            Err(AppError::CommandExecution {
                command: def.identifier.to_string(),
                sequence,
                cause: Box::new(cause),
            })
        })
    }

    /// Revert the most recent applied invocation that can be reverted.
    /// Applied commands that cannot be reverted (renders) are passed over;
    /// if nothing else is left, the latest of them is reported.
    pub async fn undo(&self) -> Result<CommandInvocation, AppError> {
        let guard = self.exec_lock.clone().lock_owned().await;

        let (sequence, command, record) = {
            let history = self.history.lock();
            let mut applied = history
                .entries
                .iter()
                .rev()
                .filter(|e| e.invocation.outcome == Outcome::Applied)
                .peekable();
            let latest = applied.peek().ok_or(AppError::NothingToUndo)?;
            let latest = (latest.invocation.sequence, latest.invocation.command.clone());
            let target = applied.find_map(|entry| {
                let supported = self
                    .registry
                    .lookup(&entry.invocation.command)
                    .is_ok_and(|def| def.supports_revert);
                let record = entry.undo.clone().filter(|_| supported)?;
                Some((entry.invocation.sequence, entry.invocation.command.clone(), record))
            });
            match target {
                Some(target) => {
                    if target.0 != latest.0 {
                        tracing::debug!(
                            skipped = %latest.1,
                            sequence = target.0,
                            "undo passes over commands that cannot be reverted"
                        );
                    }
                    target
                }
                None => {
                    return Err(AppError::UndoNotSupported {
                        command: latest.1,
                        sequence: latest.0,
                    })
                }
            }
        };

        let session = self.session.clone();
        let reverted = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            record.revert(session.as_ref())
        })
        .await
        .map_err(|e| AppError::Io {
            message: format!("revert task failed: {e}"),
        })?;
        reverted?;

        let mut history = self.history.lock();
        let entry = history.entry_mut(sequence).ok_or(AppError::NothingToUndo)?;
        entry.invocation.outcome = Outcome::Reverted;
        entry.undo = None;
        tracing::info!(sequence, command = %command, "command reverted");
        Ok(entry.invocation.clone())
    }

    /// Describe what a command would do, without running it.
    pub fn preview(&self, identifier: &str, raw: &Map<String, Value>) -> Result<String, AppError> {
        let def = self.registry.lookup(identifier)?;
        let params = validate(def.params, raw)?;
        let frame_rate = self.session.project()?.frame_rate;
        params.check_timecodes(frame_rate)?;
        Ok(def.preview_text(&params, frame_rate))
    }

    pub fn history(&self) -> Vec<CommandInvocation> {
        self.history
            .lock()
            .entries
            .iter()
            .map(|e| e.invocation.clone())
            .collect()
    }

    pub fn history_for(&self, caller: &Caller) -> Vec<CommandInvocation> {
        self.history
            .lock()
            .entries
            .iter()
            .filter(|e| &e.invocation.caller == caller)
            .map(|e| e.invocation.clone())
            .collect()
    }

    pub fn last_feedback(&self) -> Option<String> {
        self.history
            .lock()
            .entries
            .iter()
            .rev()
            .find_map(|e| e.invocation.feedback.clone())
    }
}
