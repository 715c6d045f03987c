// src/coordinator.rs
//! Serializes every inbound event and timer callback onto one task that owns the
//! [`Session`].

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ApiError;
use crate::events::{ClientEvent, Outbound};
use crate::models::{ActivePollView, ConnectionId, PollRecord};
use crate::poll::{Scheduler, Session, SessionSettings};
use crate::store::StoreSink;

pub enum Command {
    Connect {
        id: ConnectionId,
        outbound: mpsc::UnboundedSender<Outbound>,
    },
    Client {
        id: ConnectionId,
        event: ClientEvent,
    },
    Disconnect {
        id: ConnectionId,
    },
    ClosePoll {
        poll_id: Uuid,
    },
    ActivePoll {
        reply: oneshot::Sender<ActivePollView>,
    },
    History {
        reply: oneshot::Sender<Vec<PollRecord>>,
    },
}

/// Delivers poll deadlines back into the mailbox with a tokio timer.
struct TokioScheduler {
    mailbox: mpsc::WeakUnboundedSender<Command>,
}

impl Scheduler for TokioScheduler {
    fn schedule_close(&self, poll_id: Uuid, after: Duration) {
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(mailbox) = mailbox.upgrade() {
                let _ = mailbox.send(Command::ClosePoll { poll_id });
            }
        });
    }
}

#[derive(Clone)]
pub struct CoordinatorHandle {
    mailbox: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
}

impl CoordinatorHandle {
    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn connect(&self, id: ConnectionId, outbound: mpsc::UnboundedSender<Outbound>) {
        self.send(Command::Connect { id, outbound });
    }

    pub fn client_event(&self, id: ConnectionId, event: ClientEvent) {
        self.send(Command::Client { id, event });
    }

    pub fn disconnect(&self, id: ConnectionId) {
        self.send(Command::Disconnect { id });
    }

    pub async fn active_poll(&self) -> Result<ActivePollView, ApiError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ActivePoll { reply });
        rx.await.map_err(|_| ApiError::CoordinatorGone)
    }

    pub async fn history(&self) -> Result<Vec<PollRecord>, ApiError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::History { reply });
        rx.await.map_err(|_| ApiError::CoordinatorGone)
    }

    fn send(&self, command: Command) {
        if self.mailbox.send(command).is_err() {
            debug!("Coordinator has stopped, dropping command");
        }
    }
}

pub fn spawn(settings: SessionSettings, store: StoreSink) -> (CoordinatorHandle, JoinHandle<()>) {
    let (mailbox, rx) = mpsc::unbounded_channel();
    let scheduler = Arc::new(TokioScheduler {
        mailbox: mailbox.downgrade(),
    });
    let session = Session::new(settings, store, scheduler);
    let task = tokio::spawn(run(session, rx));

    let handle = CoordinatorHandle {
        mailbox,
        next_id: Arc::new(AtomicU64::new(1)),
    };
    (handle, task)
}

async fn run(mut session: Session, mut rx: mpsc::UnboundedReceiver<Command>) {
    info!("Coordinator started");
    while let Some(command) = rx.recv().await {
        match command {
            Command::Connect { id, outbound } => session.connect(id, outbound),
            Command::Client { id, event } => session.handle(id, event),
            Command::Disconnect { id } => session.disconnect(id),
            Command::ClosePoll { poll_id } => session.close_poll_if_current(poll_id),
            Command::ActivePoll { reply } => {
                let _ = reply.send(session.active_poll_view());
            }
            Command::History { reply } => {
                let _ = reply.send(session.history());
            }
        }
    }
    info!("Coordinator stopped");
}
