use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, OnceCell};
use tokio::task::JoinHandle;

use super::doc::DiagramDoc;
use super::protocol::{Participant, ServerFrame};
use super::{document_key, CollabError, DocumentStore, SessionConfig, CLOSE_DOCUMENT_DELETED};
use crate::models::DiagramContent;

/// What a session pushes to one participant's connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(ServerFrame),
    Close { code: u16, reason: String },
}

/// Bounded queue toward one connection. A participant whose queue is full
/// is dropped from the session.
pub type OutboundSender = mpsc::Sender<Outbound>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub sessions: usize,
    pub participants: usize,
}

struct Member {
    participant: Participant,
    tx: OutboundSender,
    /// Set once the snapshot has been queued; relays skip members before that.
    ready: bool,
}

impl Member {
    /// Queues `out`. False when the connection is gone or too far behind.
    fn push(&self, out: Outbound) -> bool {
        self.tx.try_send(out).is_ok()
    }
}

/// One live document. Lock order is replica, then members.
struct Session {
    key: String,
    doc: OnceCell<Mutex<DiagramDoc>>,
    members: Mutex<HashMap<u64, Member>>,
    dirty: AtomicBool,
    closed: AtomicBool,
    write_failures: AtomicU32,
    write_lock: tokio::sync::Mutex<()>,
}

impl Session {
    fn new(key: String) -> Self {
        Self {
            key,
            doc: OnceCell::new(),
            members: Mutex::new(HashMap::new()),
            dirty: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            write_failures: AtomicU32::new(0),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn members(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Member>> {
        self.members.lock().expect("session members lock poisoned")
    }

    fn member_count(&self) -> usize {
        self.members().len()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn drop_laggards(&self, members: &mut HashMap<u64, Member>, lagging: Vec<u64>) {
        for id in lagging {
            if let Some(member) = members.remove(&id) {
                tracing::warn!(
                    document = %self.key,
                    user_id = %member.participant.user_id,
                    "Dropping participant that fell behind"
                );
            }
        }
    }

    /// Sends `frame` to every ready member except `except`. Called with the
    /// replica locked so all members observe one order.
    fn broadcast(&self, frame: &ServerFrame, except: Option<u64>) {
        let mut members = self.members();
        let lagging: Vec<u64> = members
            .iter()
            .filter(|(id, m)| m.ready && Some(**id) != except)
            .filter(|(_, m)| !m.push(Outbound::Frame(frame.clone())))
            .map(|(id, _)| *id)
            .collect();
        self.drop_laggards(&mut members, lagging);
    }

    fn send_to(&self, member_id: u64, frame: ServerFrame) {
        let mut members = self.members();
        let lagging = members
            .get(&member_id)
            .is_some_and(|m| !m.push(Outbound::Frame(frame)));
        if lagging {
            self.drop_laggards(&mut members, vec![member_id]);
        }
    }

    fn announce_peers(&self) {
        let mut participants: Vec<(u64, Participant)> = self
            .members()
            .iter()
            .map(|(id, m)| (*id, m.participant.clone()))
            .collect();
        participants.sort_by_key(|(id, _)| *id);
        let participants = participants.into_iter().map(|(_, p)| p).collect();
        self.broadcast(&ServerFrame::Peers { participants }, None);
    }
}

/// Keeps one shared replica per document while it has participants.
///
/// The first join loads the document from the [`DocumentStore`]; a
/// background flusher writes dirty replicas on an interval; the last leave
/// writes the replica one final time and releases it.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn DocumentStore>,
    config: SessionConfig,
    sessions: tokio::sync::Mutex<HashMap<String, Arc<Session>>>,
    next_member: AtomicU64,
}

impl SessionManager {
    pub fn new(store: Arc<dyn DocumentStore>, config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                config,
                sessions: tokio::sync::Mutex::new(HashMap::new()),
                next_member: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Outbound queue sized for one participant of this manager.
    pub fn outbound_channel(&self) -> (OutboundSender, mpsc::Receiver<Outbound>) {
        mpsc::channel(self.inner.config.outbound_capacity.max(1))
    }

    /// Attaches a participant to `document`, loading it on first join.
    ///
    /// The participant's first frame is a snapshot of the replica. Fails
    /// with [`CollabError::StoreUnavailable`] when the load keeps failing and
    /// with [`CollabError::NotFound`] when the document does not exist and
    /// may not be created.
    pub async fn join(
        &self,
        document: &str,
        participant: Participant,
        tx: OutboundSender,
    ) -> Result<SessionHandle, CollabError> {
        let key = document_key(document)
            .ok_or_else(|| CollabError::InvalidDocument(document.to_string()))?
            .to_string();
        let member_id = self.inner.next_member.fetch_add(1, Ordering::Relaxed);

        let session = {
            let mut sessions = self.inner.sessions.lock().await;
            let session = sessions
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Session::new(key.clone())))
                .clone();
            session.members().insert(
                member_id,
                Member {
                    participant: participant.clone(),
                    tx,
                    ready: false,
                },
            );
            session
        };

        let loaded = session
            .doc
            .get_or_try_init(|| self.load(&key))
            .await;

        let cell = match loaded {
            Ok(cell) => cell,
            Err(e) => {
                self.abandon(&session, member_id).await;
                return Err(e);
            }
        };

        if session.is_closed() {
            self.abandon(&session, member_id).await;
            return Err(CollabError::SessionClosed);
        }

        let queued = {
            let doc = cell.lock().expect("replica lock poisoned");
            let mut members = session.members();
            let queued = members.get_mut(&member_id).is_some_and(|member| {
                member.ready = member.push(Outbound::Frame(ServerFrame::Snapshot(doc.encode_state())));
                member.ready
            });
            if !queued {
                members.remove(&member_id);
            }
            queued
        };
        if !queued {
            return Err(CollabError::SessionClosed);
        }
        session.announce_peers();

        tracing::info!(
            document = %document,
            user_id = %participant.user_id,
            participants = session.member_count(),
            "Participant joined"
        );

        Ok(SessionHandle {
            manager: self.clone(),
            session,
            member_id,
            participant,
        })
    }

    /// Loads the replica for `key`. A document without stored content starts
    /// empty only when the store allows creating it.
    async fn load(&self, key: &str) -> Result<Mutex<DiagramDoc>, CollabError> {
        let attempts = self.inner.config.retry_attempts;
        let content = self
            .with_retry("load", key, attempts, |store, key| store.load_document(key))
            .await?;

        let doc = match content {
            Some(content) => DiagramDoc::from_content(&content),
            None => {
                let creatable = self
                    .with_retry("lookup", key, attempts, |store, key| store.can_create(key))
                    .await?;
                if !creatable {
                    tracing::warn!(document = %key, "Join for unknown document");
                    return Err(CollabError::NotFound(key.to_string()));
                }
                DiagramDoc::new()
            }
        };
        tracing::info!(document = %key, nodes = doc.nodes().len(), "Session loaded");
        Ok(Mutex::new(doc))
    }

    /// Drops a member whose join failed, and the session with it when that
    /// member was the only one.
    async fn abandon(&self, session: &Arc<Session>, member_id: u64) {
        session.members().remove(&member_id);
        let mut sessions = self.inner.sessions.lock().await;
        if session.member_count() == 0 && session.doc.get().is_none() {
            if let Some(current) = sessions.get(&session.key) {
                if Arc::ptr_eq(current, session) {
                    sessions.remove(&session.key);
                }
            }
        }
    }

    /// Runs a store call on the blocking pool, retrying with exponential
    /// backoff.
    async fn with_retry<T, F>(
        &self,
        what: &'static str,
        key: &str,
        attempts: u32,
        op: F,
    ) -> Result<T, CollabError>
    where
        T: Send + 'static,
        F: Fn(&dyn DocumentStore, &str) -> anyhow::Result<T> + Clone + Send + 'static,
    {
        let attempts = attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let store = self.inner.store.clone();
            let owned_key = key.to_string();
            let op = op.clone();
            let result = tokio::task::spawn_blocking(move || op(store.as_ref(), &owned_key)).await;

            match result {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => last_error = format!("{:#}", e),
                Err(e) => last_error = e.to_string(),
            }

            tracing::warn!(
                document = %key,
                operation = what,
                attempt,
                max_attempts = attempts,
                error = %last_error,
                "Store call failed"
            );

            if attempt < attempts {
                let delay = backoff_delay(self.inner.config.retry_base_delay, attempt);
                tokio::time::sleep(delay).await;
            }
        }

        Err(CollabError::StoreUnavailable(last_error))
    }

    /// Writes the replica if it changed since the last write. On failure the
    /// session stays dirty and its failure count goes up.
    async fn flush_session(&self, session: &Arc<Session>, attempts: u32) -> Result<bool, CollabError> {
        let _guard = session.write_lock.lock().await;
        if session.is_closed() {
            return Ok(false);
        }
        let Some(cell) = session.doc.get() else {
            return Ok(false);
        };
        if !session.dirty.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }

        let content: DiagramContent = cell.lock().expect("replica lock poisoned").content();
        let result = self
            .with_retry("save", &session.key, attempts, move |store, key| {
                store.save_document(key, &content)
            })
            .await;

        match result {
            Ok(()) => {
                session.write_failures.store(0, Ordering::SeqCst);
                tracing::debug!(document = %session.key, "Session flushed");
                Ok(true)
            }
            Err(e) => {
                session.dirty.store(true, Ordering::SeqCst);
                session.write_failures.fetch_add(1, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Removes the session from the map if nobody joined in the meantime.
    async fn release_if_idle(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.inner.sessions.lock().await;
        if session.member_count() > 0 || session.dirty.load(Ordering::SeqCst) {
            return false;
        }
        match sessions.get(&session.key) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(&session.key);
                tracing::info!(document = %session.key, "Session released");
                true
            }
            _ => false,
        }
    }

    /// Drops an abandoned session whose writes keep failing. The unsaved
    /// content goes to the error log.
    async fn drop_unwritable(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.inner.sessions.lock().await;
        if session.member_count() > 0 {
            return false;
        }
        match sessions.get(&session.key) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(&session.key);
            }
            _ => return false,
        }
        session.closed.store(true, Ordering::SeqCst);

        let content = session
            .doc
            .get()
            .map(|cell| cell.lock().expect("replica lock poisoned").content())
            .and_then(|content| serde_json::to_string(&content).ok())
            .unwrap_or_default();
        tracing::error!(
            document = %session.key,
            failures = session.write_failures.load(Ordering::SeqCst),
            content = %content,
            "Dropping session after repeated write failures"
        );
        true
    }

    /// Writes every dirty replica once and releases idle sessions.
    pub async fn flush_all(&self) {
        let sessions: Vec<Arc<Session>> = {
            let sessions = self.inner.sessions.lock().await;
            sessions.values().cloned().collect()
        };

        for session in sessions {
            if let Err(e) = self.flush_session(&session, 1).await {
                tracing::warn!(document = %session.key, error = %e, "Periodic flush failed");
                let failures = session.write_failures.load(Ordering::SeqCst);
                if failures >= self.inner.config.max_write_failures {
                    self.drop_unwritable(&session).await;
                }
                continue;
            }
            if session.member_count() == 0 {
                self.release_if_idle(&session).await;
            }
        }
    }

    /// Spawns the periodic flusher.
    pub fn spawn_flusher(&self) -> JoinHandle<()> {
        let manager = self.clone();
        let period = self.inner.config.flush_interval;
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            timer.tick().await;
            loop {
                timer.tick().await;
                manager.flush_all().await;
            }
        })
    }

    /// Final write and release after the last participant left.
    async fn finish(&self, session: &Arc<Session>) {
        if session.is_closed() {
            return;
        }
        match self
            .flush_session(session, self.inner.config.retry_attempts)
            .await
        {
            Ok(_) => {
                self.release_if_idle(session).await;
            }
            Err(e) => {
                tracing::error!(
                    document = %session.key,
                    error = %e,
                    "Final write failed, keeping session resident"
                );
            }
        }
    }

    /// Applies REST-side content to a live replica as a server edit and
    /// relays it. Returns the number of changes made.
    pub async fn reconcile(&self, key: &str, content: &DiagramContent) -> usize {
        let session = {
            let sessions = self.inner.sessions.lock().await;
            sessions.get(key).cloned()
        };
        let Some(session) = session else {
            return 0;
        };
        if session.is_closed() {
            return 0;
        }
        let Some(cell) = session.doc.get() else {
            return 0;
        };

        let mut doc = cell.lock().expect("replica lock poisoned");
        let changes = doc.changes_toward(content);
        if changes.is_empty() {
            return 0;
        }
        let update = doc.write(&changes);
        session.dirty.store(true, Ordering::SeqCst);
        session.broadcast(&ServerFrame::Update(update), None);

        tracing::info!(document = %key, changes = changes.len(), "Reconciled live session with store write");
        changes.len()
    }

    /// Closes the session for `key` and runs `delete` while no write for the
    /// document can start or is still in flight. Participants are closed
    /// without the replica being written back.
    ///
    /// Returns whether a session was resident, and the output of `delete`.
    pub async fn evict_while<F, T>(&self, key: &str, delete: F) -> (bool, T)
    where
        F: Future<Output = T>,
    {
        let mut sessions = self.inner.sessions.lock().await;
        let session = sessions.remove(key);
        if let Some(session) = &session {
            session.closed.store(true, Ordering::SeqCst);
            drop(session.write_lock.lock().await);
        }
        let output = delete.await;
        drop(sessions);

        let Some(session) = session else {
            return (false, output);
        };
        let members = std::mem::take(&mut *session.members());
        for member in members.values() {
            let _ = member.tx.try_send(Outbound::Close {
                code: CLOSE_DOCUMENT_DELETED,
                reason: "Document deleted".to_string(),
            });
        }
        tracing::info!(document = %key, participants = members.len(), "Session evicted");
        (true, output)
    }

    /// [`SessionManager::evict_while`] without a store call.
    pub async fn evict(&self, key: &str) -> bool {
        self.evict_while(key, async {}).await.0
    }

    pub async fn stats(&self) -> SessionStats {
        let sessions = self.inner.sessions.lock().await;
        SessionStats {
            sessions: sessions.len(),
            participants: sessions.values().map(|s| s.member_count()).sum(),
        }
    }

    /// Whether a session for `key` is resident.
    pub async fn is_resident(&self, key: &str) -> bool {
        self.inner.sessions.lock().await.contains_key(key)
    }
}

/// A participant's attachment to a session.
pub struct SessionHandle {
    manager: SessionManager,
    session: Arc<Session>,
    member_id: u64,
    participant: Participant,
}

impl SessionHandle {
    pub fn key(&self) -> &str {
        &self.session.key
    }

    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    /// Queues a frame for this participant only.
    pub fn send(&self, frame: ServerFrame) {
        self.session.send_to(self.member_id, frame);
    }

    /// Merges an update from this participant and relays it to the others.
    ///
    /// The update is staged on a copy of the replica and checked as edits by
    /// this participant. It is all-or-nothing: on any failed check nothing
    /// is merged and the participant gets a `rejected` frame followed by a
    /// fresh snapshot. Returns the number of changes the update made.
    pub fn apply(&self, update: &[u8]) -> Result<usize, CollabError> {
        if self.session.is_closed() {
            return Err(CollabError::SessionClosed);
        }
        let Some(cell) = self.session.doc.get() else {
            return Err(CollabError::SessionClosed);
        };
        if update.is_empty() {
            return Ok(0);
        }

        let mut doc = cell.lock().expect("replica lock poisoned");
        let staged = doc.fork().and_then(|mut staged| {
            staged.apply_update(update)?;
            let changes = doc.admit(&staged, &self.participant.user_id, Utc::now())?;
            Ok((staged, changes))
        });

        let (staged, changes) = match staged {
            Ok(admitted) => admitted,
            Err(e) => {
                tracing::debug!(
                    document = %self.session.key,
                    user_id = %self.participant.user_id,
                    error = %e,
                    "Rejected update"
                );
                self.send(ServerFrame::Rejected {
                    reason: e.to_string(),
                });
                self.send(ServerFrame::Snapshot(doc.encode_state()));
                return Err(e.into());
            }
        };

        // The staged copy is exactly what was checked.
        *doc = staged;
        if !changes.is_empty() {
            self.session.dirty.store(true, Ordering::SeqCst);
        }
        self.session
            .broadcast(&ServerFrame::Update(update.to_vec()), Some(self.member_id));
        Ok(changes.len())
    }

    /// Detaches the participant. Edit marks it held are cleared for everyone
    /// else; the last leave triggers the final write and release.
    pub async fn leave(self) {
        let session = &self.session;
        let user_id = &self.participant.user_id;

        let (remaining, same_user_remains) = {
            let mut members = session.members();
            members.remove(&self.member_id);
            let same_user = members.values().any(|m| &m.participant.user_id == user_id);
            (members.len(), same_user)
        };

        if !session.is_closed() {
            if !same_user_remains {
                if let Some(cell) = session.doc.get() {
                    let mut doc = cell.lock().expect("replica lock poisoned");
                    let changes = doc.release_marks_of(user_id);
                    if !changes.is_empty() {
                        let update = doc.write(&changes);
                        session.dirty.store(true, Ordering::SeqCst);
                        session.broadcast(&ServerFrame::Update(update), None);
                    }
                }
            }
            session.announce_peers();
        }

        tracing::info!(
            document = %session.key,
            user_id = %user_id,
            participants = remaining,
            "Participant left"
        );

        if remaining == 0 {
            self.manager.finish(session).await;
        }
    }
}

/// Delay before attempt `n` (1-based) under exponential backoff.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_millis(200);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(400));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(800));
    }
}
