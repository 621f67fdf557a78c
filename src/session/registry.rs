use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use parking_lot::RwLock;

use crate::change::Topic;

use super::types::{
    ClientSession, RegistryError, RegistryStats, SessionId, SessionInfo, SessionTarget,
    SessionTransport,
};

#[derive(Default)]
struct RegistryInner {
    /// session_id -> session
    sessions: HashMap<SessionId, ClientSession>,
    /// topic -> Set<session_id>
    topic_index: HashMap<Topic, HashSet<SessionId>>,
}

impl RegistryInner {
    fn info(session: &ClientSession) -> SessionInfo {
        SessionInfo {
            id: session.id,
            connected_at: session.connected_at,
            duration_secs: Utc::now()
                .signed_duration_since(session.connected_at)
                .num_seconds(),
            subscriptions: session.subscriptions.iter().cloned().collect(),
        }
    }

    fn target(session: &ClientSession) -> SessionTarget {
        SessionTarget {
            id: session.id,
            transport: session.transport.clone(),
        }
    }
}

/// Authoritative map of connected sessions and their topic subscriptions.
///
/// Sessions and the topic index live behind one lock, so a lookup never
/// observes a session that is half registered or half removed. Lookups copy
/// what they need and release the lock before any transport write.
pub struct SessionRegistry {
    inner: RwLock<RegistryInner>,
    accepting: AtomicBool,
    /// 0 means unlimited
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::with_limit(0)
    }

    pub fn with_limit(max_sessions: usize) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            accepting: AtomicBool::new(true),
            max_sessions,
        }
    }

    /// Register a new session, returning its id and the total session count
    /// including it
    pub fn register(
        &self,
        transport: SessionTransport,
    ) -> Result<(SessionId, usize), RegistryError> {
        if !self.is_accepting() {
            return Err(RegistryError::NotAccepting);
        }

        let mut inner = self.inner.write();

        let current = inner.sessions.len();
        if self.max_sessions > 0 && current >= self.max_sessions {
            return Err(RegistryError::LimitExceeded {
                current,
                max: self.max_sessions,
            });
        }

        let mut session = ClientSession::new(transport);
        while inner.sessions.contains_key(&session.id) {
            session.id = SessionId::new_v4();
        }
        let session_id = session.id;
        inner.sessions.insert(session_id, session);
        let total = inner.sessions.len();
        drop(inner);

        tracing::info!(session_id = %session_id, total_sessions = total, "Session registered");

        Ok((session_id, total))
    }

    /// Remove a session. Unknown ids are ignored so duplicate disconnect
    /// signals are harmless.
    pub fn unregister(&self, session_id: SessionId) -> Option<SessionInfo> {
        let mut inner = self.inner.write();
        let session = inner.sessions.remove(&session_id)?;

        for topic in &session.subscriptions {
            if let Some(ids) = inner.topic_index.get_mut(topic) {
                ids.remove(&session_id);
                if ids.is_empty() {
                    inner.topic_index.remove(topic);
                }
            }
        }
        let total = inner.sessions.len();
        drop(inner);

        let info = RegistryInner::info(&session);
        tracing::info!(
            session_id = %session_id,
            duration_secs = info.duration_secs,
            total_sessions = total,
            "Session unregistered"
        );

        Some(info)
    }

    /// Add topics to a session's subscription set.
    ///
    /// Returns the topics that were newly added; already-held topics and
    /// unknown sessions contribute nothing.
    pub fn subscribe<I>(&self, session_id: SessionId, topics: I) -> Vec<Topic>
    where
        I: IntoIterator<Item = Topic>,
    {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let Some(session) = inner.sessions.get_mut(&session_id) else {
            return Vec::new();
        };

        let mut added = Vec::new();
        for topic in topics {
            if session.subscriptions.insert(topic.clone()) {
                inner
                    .topic_index
                    .entry(topic.clone())
                    .or_default()
                    .insert(session_id);
                added.push(topic);
            }
        }

        if !added.is_empty() {
            tracing::debug!(session_id = %session_id, topics = ?added, "Subscribed to topics");
        }

        added
    }

    /// Remove topics from a session's subscription set.
    ///
    /// Returns the topics that were actually removed.
    pub fn unsubscribe<I>(&self, session_id: SessionId, topics: I) -> Vec<Topic>
    where
        I: IntoIterator<Item = Topic>,
    {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let Some(session) = inner.sessions.get_mut(&session_id) else {
            return Vec::new();
        };

        let mut removed = Vec::new();
        for topic in topics {
            if session.subscriptions.remove(&topic) {
                if let Some(ids) = inner.topic_index.get_mut(&topic) {
                    ids.remove(&session_id);
                    if ids.is_empty() {
                        inner.topic_index.remove(&topic);
                    }
                }
                removed.push(topic);
            }
        }

        if !removed.is_empty() {
            tracing::debug!(session_id = %session_id, topics = ?removed, "Unsubscribed from topics");
        }

        removed
    }

    /// Ids of the sessions that should receive messages for `topic`.
    ///
    /// Every registered session is an implicit member of [`Topic::All`].
    pub fn sessions_for(&self, topic: &Topic) -> HashSet<SessionId> {
        let inner = self.inner.read();
        match topic {
            Topic::All => inner.sessions.keys().copied().collect(),
            _ => inner.topic_index.get(topic).cloned().unwrap_or_default(),
        }
    }

    /// Transport handles for the sessions matching `topic`, copied under the
    /// lock so delivery can proceed without holding it
    pub fn targets_for(&self, topic: &Topic) -> Vec<SessionTarget> {
        let inner = self.inner.read();
        match topic {
            Topic::All => inner.sessions.values().map(RegistryInner::target).collect(),
            _ => inner
                .topic_index
                .get(topic)
                .map(|ids| {
                    ids.iter()
                        .filter_map(|id| inner.sessions.get(id))
                        .map(RegistryInner::target)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    /// Transport handle of a single session
    pub fn target(&self, session_id: SessionId) -> Option<SessionTarget> {
        self.inner
            .read()
            .sessions
            .get(&session_id)
            .map(RegistryInner::target)
    }

    pub fn count(&self) -> usize {
        self.inner.read().sessions.len()
    }

    /// Per-session view for health reporting, oldest session first
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let inner = self.inner.read();
        let mut sessions: Vec<SessionInfo> =
            inner.sessions.values().map(RegistryInner::info).collect();
        sessions.sort_by_key(|s| s.connected_at);
        sessions
    }

    /// Topics currently held by a session, `None` if it is not registered
    pub fn subscriptions_of(&self, session_id: SessionId) -> Option<Vec<Topic>> {
        self.inner
            .read()
            .sessions
            .get(&session_id)
            .map(|s| s.subscriptions().cloned().collect())
    }

    pub fn stats(&self) -> RegistryStats {
        let inner = self.inner.read();
        let topics: BTreeMap<String, usize> = inner
            .topic_index
            .iter()
            .map(|(topic, ids)| (topic.to_string(), ids.len()))
            .collect();

        RegistryStats {
            total_sessions: inner.sessions.len(),
            accepting: self.is_accepting(),
            topics,
        }
    }

    pub fn set_accepting(&self, accepting: bool) {
        let previous = self.accepting.swap(accepting, Ordering::AcqRel);
        if previous != accepting {
            tracing::warn!(accepting = accepting, "Session registration state changed");
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
