//! Live client sessions and the handle a connection uses to drive one.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::clock::VectorClock;
use crate::coordinator::CoordinatorError;
use crate::oplog::Lsn;
use crate::protocol::ErrorKind;
use crate::stroke::Stroke;
use crate::whiteboard::Command;

pub type SessionId = u64;

/// What the coordinator hands a connection to write.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Pre-encoded frame, shared across every recipient of a broadcast.
    Frame(Arc<str>),
    /// Send an `error` frame and close.
    Close(ErrorKind, String),
}

/// Result of offering a frame to a session's outbound buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Sent,
    Full,
    Gone,
}

/// Coordinator-side state for one connected client.
pub(crate) struct Session {
    pub session_id: SessionId,
    pub whiteboard_id: Uuid,
    pub author: String,
    pub last_acked_lsn: Lsn,
    pub last_heartbeat: Instant,
    outbound: mpsc::Sender<Outbound>,
}

impl Session {
    pub fn new(
        session_id: SessionId,
        whiteboard_id: Uuid,
        author: String,
        outbound: mpsc::Sender<Outbound>,
    ) -> Self {
        Self {
            session_id,
            whiteboard_id,
            author,
            last_acked_lsn: 0,
            last_heartbeat: Instant::now(),
            outbound,
        }
    }

    pub fn deliver(&self, frame: &Arc<str>) -> Delivery {
        match self.outbound.try_send(Outbound::Frame(frame.clone())) {
            Ok(()) => Delivery::Sent,
            Err(TrySendError::Full(_)) => Delivery::Full,
            Err(TrySendError::Closed(_)) => Delivery::Gone,
        }
    }

    /// Best effort: if the buffer is full the connection still sees the
    /// channel close and reports a resync.
    pub fn close(&self, kind: ErrorKind, message: impl Into<String>) {
        let _ = self.outbound.try_send(Outbound::Close(kind, message.into()));
    }

    pub fn touch(&mut self) {
        self.last_heartbeat = Instant::now();
    }
}

/// A connection's end of a session.
///
/// Commands are queued on the whiteboard's mailbox in call order. Dropping
/// the handle leaves the session.
#[derive(Debug)]
pub struct SessionHandle {
    session_id: SessionId,
    whiteboard_id: Uuid,
    author: String,
    mailbox: mpsc::Sender<Command>,
    outbound: mpsc::Receiver<Outbound>,
    left: bool,
}

impl SessionHandle {
    pub(crate) fn new(
        session_id: SessionId,
        whiteboard_id: Uuid,
        author: String,
        mailbox: mpsc::Sender<Command>,
        outbound: mpsc::Receiver<Outbound>,
    ) -> Self {
        Self {
            session_id,
            whiteboard_id,
            author,
            mailbox,
            outbound,
            left: false,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn whiteboard_id(&self) -> Uuid {
        self.whiteboard_id
    }

    /// Author as resolved by membership.
    pub fn author(&self) -> &str {
        &self.author
    }

    pub async fn submit(&self, stroke: Stroke) -> Result<(), CoordinatorError> {
        self.send(Command::Stroke {
            session_id: self.session_id,
            stroke,
        })
        .await
    }

    pub async fn ack(&self, lsn: Lsn) -> Result<(), CoordinatorError> {
        self.send(Command::Ack {
            session_id: self.session_id,
            lsn,
        })
        .await
    }

    pub async fn heartbeat(&self) -> Result<(), CoordinatorError> {
        self.send(Command::Heartbeat {
            session_id: self.session_id,
        })
        .await
    }

    /// Request the strokes missing relative to `clock`.
    pub async fn sync(&self, clock: VectorClock) -> Result<(), CoordinatorError> {
        self.send(Command::Sync {
            session_id: self.session_id,
            clock,
        })
        .await
    }

    pub async fn leave(mut self) -> Result<(), CoordinatorError> {
        self.left = true;
        self.send(Command::Leave {
            session_id: self.session_id,
        })
        .await
    }

    /// Next frame for this session; `None` once the coordinator dropped it.
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.outbound.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Outbound> {
        self.outbound.try_recv().ok()
    }

    async fn send(&self, command: Command) -> Result<(), CoordinatorError> {
        self.mailbox
            .send(command)
            .await
            .map_err(|_| CoordinatorError::Shutdown)
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if !self.left {
            let _ = self.mailbox.try_send(Command::Leave {
                session_id: self.session_id,
            });
        }
    }
}
