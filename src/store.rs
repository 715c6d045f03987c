// src/store.rs
//! Durable storage for polls and participant history.
//!
//! The coordinator never awaits the store. Writes go through [`StoreSink`], a single
//! writer task that applies them in submission order, so a poll's row exists before
//! its votes are counted and its votes land before it is closed.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use chrono::Utc;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{PollError, StoreError};
use crate::events::{Outbound, ServerEvent};
use crate::models::{ParticipationEntry, Poll, PollRecord, Role, Tally};

#[async_trait]
pub trait PollStore: Send + Sync {
    /// Human-readable backend name for health and history responses.
    fn backend(&self) -> &'static str;

    async fn ping(&self) -> bool;

    async fn create_poll(&self, poll: &Poll) -> Result<Uuid, StoreError>;

    async fn increment_vote(&self, poll_id: Uuid, option: &str) -> Result<(), StoreError>;

    async fn update_poll_on_close(&self, record: &PollRecord) -> Result<(), StoreError>;

    async fn upsert_participant_history(
        &self,
        name: &str,
        role: Role,
        poll_id: Uuid,
        answer: &str,
    ) -> Result<(), StoreError>;

    /// Most recently created polls first.
    async fn recent_polls(&self, limit: usize) -> Result<Vec<PollRecord>, StoreError>;
}

#[derive(Default)]
struct MemoryInner {
    polls: Vec<PollRecord>,
    participants: HashMap<String, (Role, Vec<ParticipationEntry>)>,
}

/// Process-local store, used when no database is configured.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut MemoryInner) -> R) -> R {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut inner)
    }

    #[cfg(test)]
    pub fn participant_history(&self, name: &str) -> Vec<ParticipationEntry> {
        self.with(|inner| {
            inner
                .participants
                .get(name)
                .map(|(_, entries)| entries.clone())
                .unwrap_or_default()
        })
    }
}

#[async_trait]
impl PollStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "In-memory store"
    }

    async fn ping(&self) -> bool {
        true
    }

    async fn create_poll(&self, poll: &Poll) -> Result<Uuid, StoreError> {
        self.with(|inner| {
            inner.polls.push(PollRecord {
                results: Tally::for_options(&poll.options),
                poll: poll.clone(),
                ended_at: None,
                total_answers: 0,
                total_students: 0,
            })
        });
        Ok(poll.id)
    }

    async fn increment_vote(&self, poll_id: Uuid, option: &str) -> Result<(), StoreError> {
        self.with(|inner| {
            let record = inner
                .polls
                .iter_mut()
                .find(|record| record.poll.id == poll_id)
                .ok_or_else(|| StoreError::PollNotFound(poll_id.to_string()))?;
            record.results.record(option);
            Ok(())
        })
    }

    async fn update_poll_on_close(&self, closed: &PollRecord) -> Result<(), StoreError> {
        self.with(|inner| {
            let record = inner
                .polls
                .iter_mut()
                .find(|record| record.poll.id == closed.poll.id)
                .ok_or_else(|| StoreError::PollNotFound(closed.poll.id.to_string()))?;
            *record = closed.clone();
            Ok(())
        })
    }

    async fn upsert_participant_history(
        &self,
        name: &str,
        role: Role,
        poll_id: Uuid,
        answer: &str,
    ) -> Result<(), StoreError> {
        self.with(|inner| {
            let entry = inner
                .participants
                .entry(name.to_string())
                .or_insert_with(|| (role, Vec::new()));
            entry.0 = role;
            entry.1.push(ParticipationEntry {
                poll_id,
                answer: answer.to_string(),
                timestamp: Utc::now(),
            });
        });
        Ok(())
    }

    async fn recent_polls(&self, limit: usize) -> Result<Vec<PollRecord>, StoreError> {
        Ok(self.with(|inner| inner.polls.iter().rev().take(limit).cloned().collect()))
    }
}

enum StoreOp {
    CreatePoll {
        poll: Poll,
        reply_to: mpsc::UnboundedSender<Outbound>,
    },
    RecordAnswer {
        poll_id: Uuid,
        name: String,
        role: Role,
        option: String,
        reply_to: mpsc::UnboundedSender<Outbound>,
    },
    ClosePoll {
        record: PollRecord,
    },
    Flush(oneshot::Sender<()>),
}

/// Fire-and-forget handle to the store writer task.
#[derive(Clone)]
pub struct StoreSink {
    tx: mpsc::UnboundedSender<StoreOp>,
}

impl StoreSink {
    pub fn spawn(store: Arc<dyn PollStore>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_writer(store, rx));
        (Self { tx }, handle)
    }

    /// Saves a freshly created poll. A failure is reported to `reply_to`.
    pub fn create_poll(&self, poll: Poll, reply_to: mpsc::UnboundedSender<Outbound>) {
        self.submit(StoreOp::CreatePoll { poll, reply_to });
    }

    /// Counts a vote and appends it to the participant's history.
    pub fn record_answer(
        &self,
        poll_id: Uuid,
        name: String,
        role: Role,
        option: String,
        reply_to: mpsc::UnboundedSender<Outbound>,
    ) {
        self.submit(StoreOp::RecordAnswer {
            poll_id,
            name,
            role,
            option,
            reply_to,
        });
    }

    pub fn close_poll(&self, record: PollRecord) {
        self.submit(StoreOp::ClosePoll { record });
    }

    /// Resolves once every write queued before this call has been attempted.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        self.submit(StoreOp::Flush(done_tx));
        let _ = done_rx.await;
    }

    fn submit(&self, op: StoreOp) {
        if self.tx.send(op).is_err() {
            warn!("Store writer has stopped, dropping write");
        }
    }
}

async fn run_writer(store: Arc<dyn PollStore>, mut rx: mpsc::UnboundedReceiver<StoreOp>) {
    while let Some(op) = rx.recv().await {
        match op {
            StoreOp::CreatePoll { poll, reply_to } => match store.create_poll(&poll).await {
                Ok(id) => debug!("Poll {id} saved to {}", store.backend()),
                Err(e) => {
                    warn!("Failed to save poll {}: {e}", poll.id);
                    notify(
                        &reply_to,
                        "The poll is live, but saving it failed. Results will only be kept in memory.",
                    );
                }
            },
            StoreOp::RecordAnswer {
                poll_id,
                name,
                role,
                option,
                reply_to,
            } => {
                let saved = match store.increment_vote(poll_id, &option).await {
                    Ok(()) => store
                        .upsert_participant_history(&name, role, poll_id, &option)
                        .await,
                    Err(e) => Err(e),
                };
                match saved {
                    Ok(()) => debug!("{name} answered {option} (saved to {})", store.backend()),
                    Err(e) => {
                        warn!("Failed to save answer from {name} for poll {poll_id}: {e}");
                        notify(
                            &reply_to,
                            "Your answer was counted, but saving it failed.",
                        );
                    }
                }
            }
            StoreOp::ClosePoll { record } => match store.update_poll_on_close(&record).await {
                Ok(()) => debug!("Poll {} closed in {}", record.poll.id, store.backend()),
                Err(e) => warn!(
                    "Failed to save closed poll {}, keeping it in local history only: {e}",
                    record.poll.id
                ),
            },
            StoreOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Store writer stopped");
}

fn notify(reply_to: &mpsc::UnboundedSender<Outbound>, message: &str) {
    let err = PollError::StoreUnavailable(message.to_string());
    let _ = reply_to.send(Outbound::Event(ServerEvent::from(&err)));
}
