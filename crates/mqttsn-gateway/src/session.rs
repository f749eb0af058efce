// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// MQTT-SN session management.
//
// Each connected client has a `Session` owning its topic table, will, sleep
// buffer and a handle to its own broker-bridge connection. The
// `SessionRegistry` maps transport addresses to sessions under a single
// reader/writer lock.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use crate::bridge::BrokerBridge;
use crate::protocol::{Qos, WillTopic};
use crate::topics::{TopicError, TopicTable};

/// Keep-alive and sleep periods are enforced with this tolerance factor.
const EXPIRY_TOLERANCE: f64 = 1.5;

/// Process-unique session identity. A reconnect with a clean session gets a
/// new id even though the client id is the same.
pub type SessionId = u64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Asleep,
    Disconnected,
}

/// Progress of the CONNECT will handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPhase {
    AwaitingWillTopic,
    AwaitingWillMsg,
    Complete,
}

/// Last will registered by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub qos: Qos,
    pub retain: bool,
    pub message: Vec<u8>,
}

/// How a subscription's messages are addressed towards the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryTopic {
    /// Look up (or allocate) a registered id for the concrete topic name.
    Normal,
    /// Fixed predefined id.
    Predefined(u16),
    /// Two-character short name, packed into the topic id field.
    Short(u16),
}

/// Broker message waiting for (or on its way to) the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub delivery: DeliveryTopic,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct SessionInner {
    addr: SocketAddr,
    state: SessionState,
    phase: ConnectPhase,
    topics: TopicTable,
    keep_alive: Duration,
    sleep_duration: Duration,
    last_activity: Instant,
    will: Option<Will>,
    pending_will_topic: Option<WillTopic>,
    buffer: VecDeque<InboundMessage>,
    buffer_capacity: usize,
    dropped: u64,
    next_msg_id: u16,
}

/// State for one MQTT-SN client.
pub struct Session {
    id: SessionId,
    client_id: String,
    bridge: Arc<dyn BrokerBridge>,
    inner: Mutex<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(
        client_id: impl Into<String>,
        addr: SocketAddr,
        topics: TopicTable,
        bridge: Arc<dyn BrokerBridge>,
        buffer_capacity: usize,
    ) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            client_id: client_id.into(),
            bridge,
            inner: Mutex::new(SessionInner {
                addr,
                state: SessionState::Connected,
                phase: ConnectPhase::Complete,
                topics,
                keep_alive: Duration::ZERO,
                sleep_duration: Duration::ZERO,
                last_activity: Instant::now(),
                will: None,
                pending_will_topic: None,
                buffer: VecDeque::new(),
                buffer_capacity: buffer_capacity.max(1),
                dropped: 0,
                next_msg_id: 1,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Session {} lock poisoned, recovering", self.client_id);
            PoisonError::into_inner(poisoned)
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn bridge(&self) -> &Arc<dyn BrokerBridge> {
        &self.bridge
    }

    /// Current transport address.
    pub fn addr(&self) -> SocketAddr {
        self.lock().addr
    }

    fn set_addr(&self, addr: SocketAddr) {
        self.lock().addr = addr;
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn phase(&self) -> ConnectPhase {
        self.lock().phase
    }

    /// Reset the inactivity timer.
    pub fn touch(&self) {
        self.lock().last_activity = Instant::now();
    }

    /// Store the keep-alive period of a CONNECT. An asleep session stays
    /// asleep, buffering, until `wake` hands over its backlog.
    pub fn on_connect(&self, keep_alive_secs: u16) {
        let mut inner = self.lock();
        if inner.state == SessionState::Disconnected {
            inner.state = SessionState::Connected;
        }
        inner.keep_alive = Duration::from_secs(u64::from(keep_alive_secs));
        inner.last_activity = Instant::now();
    }

    // -- topics ------------------------------------------------------------

    pub fn register_topic(&self, name: &str) -> Result<u16, TopicError> {
        self.lock().topics.register(name)
    }

    /// Resolve the id a broker topic is delivered under.
    /// Returns (id, is_predefined, freshly_registered).
    pub fn delivery_id(&self, name: &str) -> Result<(u16, bool, bool), TopicError> {
        let mut inner = self.lock();
        if let Some(id) = inner.topics.predefined_id(name) {
            return Ok((id, true, false));
        }
        if let Some(id) = inner.topics.registered_id(name) {
            return Ok((id, false, false));
        }
        let id = inner.topics.register(name)?;
        Ok((id, false, true))
    }

    pub fn registered_name(&self, id: u16) -> Option<String> {
        self.lock().topics.registered_name(id).map(str::to_string)
    }

    pub fn predefined_name(&self, id: u16) -> Option<String> {
        self.lock().topics.predefined_name(id).map(str::to_string)
    }

    pub fn registered_topic_count(&self) -> usize {
        self.lock().topics.registered_len()
    }

    /// Allocate a gateway-originated message id (never 0).
    pub fn next_msg_id(&self) -> u16 {
        let mut inner = self.lock();
        let id = inner.next_msg_id;
        inner.next_msg_id = match inner.next_msg_id.wrapping_add(1) {
            0 => 1,
            n => n,
        };
        id
    }

    // -- will --------------------------------------------------------------

    /// Start the WILLTOPIC / WILLMSG exchange of a CONNECT.
    pub fn begin_will_handshake(&self) {
        let mut inner = self.lock();
        inner.phase = ConnectPhase::AwaitingWillTopic;
        inner.pending_will_topic = None;
    }

    /// Accept the WILLTOPIC step. Returns the next phase, or `None` if the
    /// session was not waiting for a will topic.
    pub fn accept_will_topic(&self, topic: WillTopic) -> Option<ConnectPhase> {
        let mut inner = self.lock();
        if inner.phase != ConnectPhase::AwaitingWillTopic {
            return None;
        }
        if topic.topic.is_empty() {
            inner.will = None;
            inner.phase = ConnectPhase::Complete;
        } else {
            inner.pending_will_topic = Some(topic);
            inner.phase = ConnectPhase::AwaitingWillMsg;
        }
        Some(inner.phase)
    }

    /// Accept the WILLMSG step. Returns false if not expected.
    pub fn accept_will_msg(&self, message: Vec<u8>) -> bool {
        let mut inner = self.lock();
        if inner.phase != ConnectPhase::AwaitingWillMsg {
            return false;
        }
        let Some(topic) = inner.pending_will_topic.take() else {
            return false;
        };
        inner.will = Some(Will {
            topic: topic.topic,
            qos: topic.qos,
            retain: topic.retain,
            message,
        });
        inner.phase = ConnectPhase::Complete;
        true
    }

    /// WILLTOPICUPD: replace the will topic, keeping the message.
    /// An empty topic removes the will.
    pub fn update_will_topic(&self, topic: WillTopic) {
        let mut inner = self.lock();
        if topic.topic.is_empty() {
            inner.will = None;
            return;
        }
        let message = inner.will.take().map(|w| w.message).unwrap_or_default();
        inner.will = Some(Will {
            topic: topic.topic,
            qos: topic.qos,
            retain: topic.retain,
            message,
        });
    }

    /// WILLMSGUPD: replace the will message. Returns false if no will is set.
    pub fn update_will_msg(&self, message: Vec<u8>) -> bool {
        match self.lock().will.as_mut() {
            Some(will) => {
                will.message = message;
                true
            }
            None => false,
        }
    }

    pub fn will(&self) -> Option<Will> {
        self.lock().will.clone()
    }

    pub fn take_will(&self) -> Option<Will> {
        self.lock().will.take()
    }

    // -- lifecycle -----------------------------------------------------------

    /// CONNECTED -> ASLEEP for `duration`.
    pub fn sleep(&self, duration: Duration) {
        let mut inner = self.lock();
        inner.state = SessionState::Asleep;
        inner.sleep_duration = duration;
        inner.last_activity = Instant::now();
    }

    /// -> DISCONNECTED. A graceful disconnect discards the will.
    pub fn mark_disconnected(&self) {
        let mut inner = self.lock();
        inner.state = SessionState::Disconnected;
        inner.will = None;
        inner.buffer.clear();
    }

    /// ASLEEP -> CONNECTED. Returns the buffered messages in arrival order.
    pub fn wake(&self) -> Vec<InboundMessage> {
        let mut inner = self.lock();
        inner.state = SessionState::Connected;
        inner.last_activity = Instant::now();
        inner.buffer.drain(..).collect()
    }

    /// Buffer `msg` if the session is asleep. Gives it back when it should
    /// be delivered now; drops it when the session is disconnected.
    pub fn buffer_if_asleep(&self, msg: InboundMessage) -> Option<InboundMessage> {
        let mut inner = self.lock();
        match inner.state {
            SessionState::Connected => Some(msg),
            SessionState::Disconnected => None,
            SessionState::Asleep => {
                if inner.buffer.len() >= inner.buffer_capacity {
                    inner.buffer.pop_front();
                    inner.dropped += 1;
                    tracing::warn!(
                        "Sleep buffer of {} full, dropped oldest message ({} dropped so far)",
                        self.client_id,
                        inner.dropped
                    );
                }
                inner.buffer.push_back(msg);
                None
            }
        }
    }

    pub fn buffered_len(&self) -> usize {
        self.lock().buffer.len()
    }

    /// Whether the session outlived its keep-alive or sleep period at `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        let inner = self.lock();
        let period = match inner.state {
            SessionState::Connected => inner.keep_alive,
            SessionState::Asleep => inner.sleep_duration,
            SessionState::Disconnected => return true,
        };
        if period.is_zero() {
            return false;
        }
        now.saturating_duration_since(inner.last_activity) > period.mul_f64(EXPIRY_TOLERANCE)
    }
}

// ---------------------------------------------------------------------------
// Session registry
// ---------------------------------------------------------------------------

/// Result of a CONNECT against the registry.
#[derive(Debug)]
pub struct ConnectOutcome {
    pub session: Arc<Session>,
    /// True when a fresh session was created.
    pub created: bool,
    /// Sessions pushed out of the registry; their bridges must be closed.
    pub retired: Vec<Arc<Session>>,
}

/// Transport address -> session map guarded by one reader/writer lock.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SocketAddr, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<SocketAddr, Arc<Session>>> {
        self.sessions.read().unwrap_or_else(|poisoned| {
            tracing::warn!("Session registry lock poisoned, recovering");
            PoisonError::into_inner(poisoned)
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SocketAddr, Arc<Session>>> {
        self.sessions.write().unwrap_or_else(|poisoned| {
            tracing::warn!("Session registry lock poisoned, recovering");
            PoisonError::into_inner(poisoned)
        })
    }

    /// Lookup only, no creation.
    pub fn resolve(&self, addr: SocketAddr) -> Option<Arc<Session>> {
        self.read().get(&addr).cloned()
    }

    /// Create-or-reuse for a CONNECT. Runs entirely under the exclusive lock
    /// so two racing CONNECTs for one client id cannot both create a session.
    pub fn connect_or_reuse<F>(
        &self,
        client_id: &str,
        addr: SocketAddr,
        clean_session: bool,
        create: F,
    ) -> ConnectOutcome
    where
        F: FnOnce() -> Arc<Session>,
    {
        let mut map = self.write();
        let mut retired = Vec::new();

        let existing = map
            .iter()
            .find(|(_, s)| s.client_id() == client_id)
            .map(|(k, s)| (*k, Arc::clone(s)));

        let (session, created) = match existing {
            Some((old_addr, session)) if !clean_session => {
                map.remove(&old_addr);
                session.set_addr(addr);
                (session, false)
            }
            Some((old_addr, session)) => {
                map.remove(&old_addr);
                retired.push(session);
                (create(), true)
            }
            None => (create(), true),
        };

        if let Some(previous) = map.insert(addr, Arc::clone(&session)) {
            if !Arc::ptr_eq(&previous, &session) {
                retired.push(previous);
            }
        }

        ConnectOutcome {
            session,
            created,
            retired,
        }
    }

    /// Move the session of `client_id` to `addr` (a sleeping client waking up
    /// from a new address). Returns the session and whatever was displaced.
    /// Only an asleep session moves; a session awake elsewhere yields `None`.
    pub fn relocate(
        &self,
        client_id: &str,
        addr: SocketAddr,
    ) -> Option<(Arc<Session>, Vec<Arc<Session>>)> {
        let mut map = self.write();
        let (old_addr, session) = map
            .iter()
            .find(|(_, s)| s.client_id() == client_id)
            .map(|(k, s)| (*k, Arc::clone(s)))?;

        let mut displaced = Vec::new();
        if old_addr != addr {
            if session.state() != SessionState::Asleep {
                return None;
            }
            map.remove(&old_addr);
            session.set_addr(addr);
            if let Some(previous) = map.insert(addr, Arc::clone(&session)) {
                displaced.push(previous);
            }
        }
        Some((session, displaced))
    }

    pub fn find_by_client_id(&self, client_id: &str) -> Option<Arc<Session>> {
        self.read()
            .values()
            .find(|s| s.client_id() == client_id)
            .cloned()
    }

    /// True while `session` is still the entry registered at its address.
    pub fn is_current(&self, session: &Arc<Session>) -> bool {
        self.read()
            .get(&session.addr())
            .is_some_and(|s| Arc::ptr_eq(s, session))
    }

    /// Remove `session` if it is still registered.
    pub fn remove_session(&self, session: &Arc<Session>) -> bool {
        let mut map = self.write();
        let addr = session.addr();
        match map.get(&addr) {
            Some(s) if Arc::ptr_eq(s, session) => {
                map.remove(&addr);
                true
            }
            _ => false,
        }
    }

    pub fn remove(&self, addr: SocketAddr) -> Option<Arc<Session>> {
        self.write().remove(&addr)
    }

    /// Remove sessions whose keep-alive or sleep period ran out.
    pub fn evict_expired(&self, now: Instant) -> Vec<Arc<Session>> {
        let mut map = self.write();
        let expired: Vec<SocketAddr> = map
            .iter()
            .filter(|(_, s)| s.is_expired(now))
            .map(|(&addr, _)| addr)
            .collect();
        expired.iter().filter_map(|addr| map.remove(addr)).collect()
    }

    /// Remove every session (shutdown).
    pub fn drain(&self) -> Vec<Arc<Session>> {
        self.write().drain().map(|(_, s)| s).collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
