use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::cleanup::ArtifactLedger;
use crate::pipeline::{PipelineError, PipelineResult};

use super::{OwnerId, Session, SessionToken, UserChoice};

struct SessionSlot {
    session: Session,
    events: mpsc::UnboundedSender<UserChoice>,
    cancel: watch::Sender<bool>,
}

impl SessionSlot {
    fn cancel(&self) {
        let _ = self.cancel.send(true);
    }
}

/// The pipeline task's end of an active session.
#[derive(Debug)]
pub struct SessionHandle {
    pub owner: OwnerId,
    pub token: SessionToken,
    pub events: mpsc::UnboundedReceiver<UserChoice>,
    pub cancel: watch::Receiver<bool>,
    pub ledger: ArtifactLedger,
    pub work_dir: PathBuf,
}

impl SessionHandle {
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

/// Owner-keyed session records split across independently locked shards.
/// Operations on different owners only contend when they hash to the same
/// shard, and then only for the duration of a map access.
pub struct SessionStore {
    shards: Vec<RwLock<HashMap<OwnerId, SessionSlot>>>,
}

impl SessionStore {
    pub fn new(shards: usize) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Self { shards }
    }

    /// Installs `session` as the owner's active session. A session already
    /// held by the owner is cancelled and handed back for cleanup.
    pub fn create(&self, session: Session) -> (SessionHandle, Option<Session>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let handle = SessionHandle {
            owner: session.owner,
            token: session.token,
            events: events_rx,
            cancel: cancel_rx,
            ledger: session.ledger.clone(),
            work_dir: session.work_dir.clone(),
        };
        let slot = SessionSlot {
            session,
            events: events_tx,
            cancel: cancel_tx,
        };
        let previous = self.write(handle.owner).insert(handle.owner, slot);
        let superseded = previous.map(|slot| {
            slot.cancel();
            info!(
                owner = handle.owner,
                token = %slot.session.token,
                "superseded active session"
            );
            slot.session
        });
        (handle, superseded)
    }

    pub fn get(&self, owner: OwnerId) -> Option<Session> {
        self.read(owner)
            .get(&owner)
            .map(|slot| slot.session.clone())
    }

    pub fn current_token(&self, owner: OwnerId) -> Option<SessionToken> {
        self.read(owner).get(&owner).map(|slot| slot.session.token)
    }

    /// Runs `f` against the owner's session if `token` is still the active one.
    pub fn update<T>(
        &self,
        owner: OwnerId,
        token: SessionToken,
        f: impl FnOnce(&mut Session) -> T,
    ) -> PipelineResult<T> {
        let mut shard = self.write(owner);
        match shard.get_mut(&owner) {
            Some(slot) if slot.session.token == token => Ok(f(&mut slot.session)),
            _ => Err(PipelineError::SessionExpired { owner, token }),
        }
    }

    /// Like [`update`](Self::update) but under a shared lock.
    pub fn inspect<T>(
        &self,
        owner: OwnerId,
        token: SessionToken,
        f: impl FnOnce(&Session) -> T,
    ) -> PipelineResult<T> {
        let shard = self.read(owner);
        match shard.get(&owner) {
            Some(slot) if slot.session.token == token => Ok(f(&slot.session)),
            _ => Err(PipelineError::SessionExpired { owner, token }),
        }
    }

    /// Queues a decision event for the pipeline task driving the session.
    pub fn send(
        &self,
        owner: OwnerId,
        token: SessionToken,
        choice: UserChoice,
    ) -> PipelineResult<()> {
        let shard = self.read(owner);
        match shard.get(&owner) {
            Some(slot) if slot.session.token == token => slot
                .events
                .send(choice)
                .map_err(|_| PipelineError::SessionExpired { owner, token }),
            _ => Err(PipelineError::SessionExpired { owner, token }),
        }
    }

    /// Drops the owner's session if `token` still names it. Removing an
    /// already-replaced or already-removed session is a no-op.
    pub fn remove(&self, owner: OwnerId, token: SessionToken) -> Option<Session> {
        let mut shard = self.write(owner);
        match shard.get(&owner) {
            Some(slot) if slot.session.token == token => {
                shard.remove(&owner).map(|slot| slot.session)
            }
            _ => None,
        }
    }

    /// Cancels and removes every session older than `max_age`.
    pub fn sweep_expired(&self, max_age: Duration) -> Vec<Session> {
        let now = Utc::now();
        let mut expired = Vec::new();
        for shard in &self.shards {
            let mut shard = shard.write().unwrap_or_else(PoisonError::into_inner);
            let stale: Vec<OwnerId> = shard
                .iter()
                .filter(|(_, slot)| {
                    (now - slot.session.created_at)
                        .to_std()
                        .map(|age| age >= max_age)
                        .unwrap_or(false)
                })
                .map(|(owner, _)| *owner)
                .collect();
            for owner in stale {
                if let Some(slot) = shard.remove(&owner) {
                    slot.cancel();
                    debug!(owner, token = %slot.session.token, "expired session swept");
                    expired.push(slot.session);
                }
            }
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.read().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn shard_index(&self, owner: OwnerId) -> usize {
        (owner.unsigned_abs() % self.shards.len() as u64) as usize
    }

    fn read(&self, owner: OwnerId) -> RwLockReadGuard<'_, HashMap<OwnerId, SessionSlot>> {
        self.shards[self.shard_index(owner)]
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self, owner: OwnerId) -> RwLockWriteGuard<'_, HashMap<OwnerId, SessionSlot>> {
        self.shards[self.shard_index(owner)]
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(16)
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("shards", &self.shards.len())
            .field("sessions", &self.len())
            .finish()
    }
}
