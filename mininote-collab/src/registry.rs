//! Session membership and per-document fan-out.
//!
//! Every live connection is a session with its own bounded outbox. A session
//! is a member of at most one document; the document → members index is kept
//! in the same lock as the session table so the two never disagree.
//!
//! ```text
//! broadcast_to(doc, frame, exclude)
//!        │
//!        ▼
//!   members[doc] ── S1 ── outbox (try_send) ──► connection task ──► ws
//!                 ├─ S2 ── outbox (try_send) ──► ...
//!                 └─ S3 (excluded sender)
//! ```
//!
//! Sends never wait on a receiver: a full outbox drops the frame and counts it.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::error::SyncError;
use crate::model::{PrincipalId, SessionId};
use crate::protocol::{Frame, ProtocolError, ServerEvent};

/// Default per-session outbox depth.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 256;

/// What `join` does when the session already belongs to another document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JoinPolicy {
    /// Implicitly leave the previous document.
    #[default]
    Switch,
    /// Fail with `AlreadyJoined`.
    Reject,
}

impl fmt::Display for JoinPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Switch => "switch",
            Self::Reject => "reject",
        })
    }
}

impl FromStr for JoinPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "switch" => Ok(Self::Switch),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown join policy '{other}' (expected switch or reject)")),
        }
    }
}

/// Protocol state of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Joined(Uuid),
}

/// Result of a successful `join`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    /// Already a member of the same document.
    Rejoined,
    /// Left `from` first.
    Switched { from: Uuid },
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub active_sessions: usize,
    pub active_documents: usize,
}

/// Counters are atomics so fan-out only needs the read lock.
#[derive(Default)]
struct AtomicBroadcastStats {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

struct Session {
    principal: Option<PrincipalId>,
    document: Option<Uuid>,
    outbox: mpsc::Sender<Frame>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, Session>,
    members: HashMap<Uuid, HashSet<SessionId>>,
}

impl Inner {
    fn detach(&mut self, session_id: SessionId, document_id: Uuid) {
        if let Some(set) = self.members.get_mut(&document_id) {
            set.remove(&session_id);
            if set.is_empty() {
                self.members.remove(&document_id);
            }
        }
    }
}

/// Registry of live sessions and document membership groups.
pub struct SessionRegistry {
    inner: RwLock<Inner>,
    policy: JoinPolicy,
    outbox_capacity: usize,
    stats: AtomicBroadcastStats,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(JoinPolicy::default(), DEFAULT_OUTBOX_CAPACITY)
    }
}

impl SessionRegistry {
    pub fn new(policy: JoinPolicy, outbox_capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            policy,
            outbox_capacity: outbox_capacity.max(1),
            stats: AtomicBroadcastStats::default(),
        }
    }

    pub fn policy(&self) -> JoinPolicy {
        self.policy
    }

    /// Register a new, unjoined session.
    ///
    /// Returns its id and the receiving end of its outbox. The outbox closes
    /// when the session is disconnected.
    pub async fn connect(&self) -> (SessionId, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(self.outbox_capacity);
        let id = Uuid::new_v4();
        self.inner.write().await.sessions.insert(
            id,
            Session {
                principal: None,
                document: None,
                outbox: tx,
            },
        );
        log::debug!("Session {id} connected");
        (id, rx)
    }

    /// Make `session_id` a member of `document_id` on behalf of `principal`.
    pub async fn join(
        &self,
        session_id: SessionId,
        document_id: Uuid,
        principal: PrincipalId,
    ) -> Result<JoinOutcome, SyncError> {
        let mut inner = self.inner.write().await;
        let session = inner
            .sessions
            .get_mut(&session_id)
            .ok_or(SyncError::UnknownSession(session_id))?;

        let outcome = match session.document {
            Some(current) if current == document_id => JoinOutcome::Rejoined,
            Some(current) if self.policy == JoinPolicy::Reject => {
                return Err(SyncError::AlreadyJoined(current));
            }
            Some(current) => JoinOutcome::Switched { from: current },
            None => JoinOutcome::Joined,
        };

        session.document = Some(document_id);
        session.principal = Some(principal);

        if let JoinOutcome::Switched { from } = outcome {
            inner.detach(session_id, from);
        }
        inner.members.entry(document_id).or_default().insert(session_id);
        Ok(outcome)
    }

    /// Clear the session's membership. Returns the document it left, if any.
    ///
    /// Idempotent: unjoined and unknown sessions are a no-op.
    pub async fn leave(&self, session_id: SessionId) -> Option<Uuid> {
        let mut inner = self.inner.write().await;
        let session = inner.sessions.get_mut(&session_id)?;
        let left = session.document.take()?;
        session.principal = None;
        inner.detach(session_id, left);
        Some(left)
    }

    /// Leave, then forget the session. Dropping its sender closes the outbox.
    pub async fn disconnect(&self, session_id: SessionId) -> Option<Uuid> {
        let mut inner = self.inner.write().await;
        let session = inner.sessions.remove(&session_id)?;
        if let Some(doc) = session.document {
            inner.detach(session_id, doc);
        }
        log::debug!("Session {session_id} disconnected");
        session.document
    }

    pub async fn members_of(&self, document_id: Uuid) -> HashSet<SessionId> {
        self.inner
            .read()
            .await
            .members
            .get(&document_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Joined document and principal of a session.
    pub async fn membership(&self, session_id: SessionId) -> Option<(Uuid, PrincipalId)> {
        let inner = self.inner.read().await;
        let session = inner.sessions.get(&session_id)?;
        session.document.zip(session.principal)
    }

    /// `None` once the session is disconnected.
    pub async fn state(&self, session_id: SessionId) -> Option<SessionState> {
        let inner = self.inner.read().await;
        inner.sessions.get(&session_id).map(|s| match s.document {
            Some(doc) => SessionState::Joined(doc),
            None => SessionState::Connected,
        })
    }

    pub async fn is_member(&self, session_id: SessionId, document_id: Uuid) -> bool {
        self.inner
            .read()
            .await
            .members
            .get(&document_id)
            .is_some_and(|set| set.contains(&session_id))
    }

    /// Queue a frame for one session. Returns whether it was queued.
    pub async fn send_to(&self, session_id: SessionId, frame: Frame) -> bool {
        let inner = self.inner.read().await;
        match inner.sessions.get(&session_id) {
            Some(session) => self.offer(session_id, &session.outbox, frame),
            None => false,
        }
    }

    /// Queue `frame` for every member of `document_id` except `exclude`.
    ///
    /// Returns the number of sessions the frame was queued for.
    pub async fn broadcast_to(
        &self,
        document_id: Uuid,
        frame: Frame,
        exclude: Option<SessionId>,
    ) -> usize {
        let inner = self.inner.read().await;
        let Some(members) = inner.members.get(&document_id) else {
            return 0;
        };

        let mut delivered = 0;
        for &member in members {
            if Some(member) == exclude {
                continue;
            }
            if let Some(session) = inner.sessions.get(&member) {
                if self.offer(member, &session.outbox, frame.clone()) {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Encode `event` once and fan it out.
    pub async fn broadcast_event(
        &self,
        document_id: Uuid,
        event: &ServerEvent,
        exclude: Option<SessionId>,
    ) -> Result<usize, ProtocolError> {
        let frame = event.encode()?;
        Ok(self.broadcast_to(document_id, frame, exclude).await)
    }

    fn offer(&self, session_id: SessionId, outbox: &mpsc::Sender<Frame>, frame: Frame) -> bool {
        match outbox.try_send(frame) {
            Ok(()) => {
                self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Outbox of session {session_id} is full, dropping frame");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("Outbox of session {session_id} is closed");
                false
            }
        }
    }

    pub async fn session_count(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    pub async fn stats(&self) -> BroadcastStats {
        let inner = self.inner.read().await;
        BroadcastStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            active_sessions: inner.sessions.len(),
            active_documents: inner.members.len(),
        }
    }
}
