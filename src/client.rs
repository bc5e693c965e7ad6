use std::collections::HashMap;

use indexmap::IndexMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::errors::{StreamErrorValue, StreamResult};
use crate::frame::Frame;
use crate::source::{DeathToken, LivenessWatch};
use crate::ticker::TickerHandle;

/// Opaque client identity (spec.md §3 `pid`/id). Grounded in this
/// codebase's `Uuid` newtype (`streamhub::utils::Uuid`) — a thin wrapper
/// so the registry's key type is not literally `uuid::Uuid` everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(Uuid);

impl ClientId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The external caller's own identity (spec.md §4.1 "subscribe(opts)...
/// identity = caller handle"), distinct from the `ClientId` the registry
/// mints per live subscription. Passed in by whatever owns the connection
/// (a socket, a session) so the registry can reject a second `subscribe`
/// from the same caller while the first is still live (spec.md "a second
/// subscribe from the same caller is an error").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallerId(pub String);

impl std::fmt::Display for CallerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Recognized `subscribe(opts)` fields (spec.md §4.1).
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub stream_tag: Option<String>,
    pub buffer_ms: Option<u64>,
    pub send_audio: bool,
    pub send_video: bool,
}

impl SubscribeOptions {
    #[must_use]
    pub fn new() -> Self {
        Self {
            stream_tag: None,
            buffer_ms: None,
            send_audio: true,
            send_video: true,
        }
    }
}

/// Per-client state (spec.md §3 invariant: a client is in exactly one
/// state at a time; `passive` carries a ticker, `active` does not).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Starting,
    Active,
    Passive,
    Paused,
}

/// One entry in the client registry (spec.md §3 "Client entry").
pub struct ClientEntry {
    pub id: ClientId,
    pub caller: CallerId,
    pub stream_tag: Option<String>,
    pub state: ClientState,
    pub ticker: Option<TickerHandle>,
    pub buffer_ms: u64,
    pub send_audio: bool,
    pub send_video: bool,
    pub bytes: u64,
    /// Whether this client has already been sent its cached config frames
    /// while `starting` (spec.md §4.2 step 5: "once").
    pub sent_starting_config: bool,
    /// Set by `start()`. Gates fan-out eligibility: subscribed-but-not-yet-
    /// started clients must not receive any frame (spec.md §5 ordering
    /// guarantee "no frame arrives before start").
    pub started: bool,
    pub sink: mpsc::Sender<Frame>,
    pub monitor: LivenessWatch,
}

impl ClientEntry {
    fn new(
        id: ClientId,
        caller: CallerId,
        opts: SubscribeOptions,
        sink: mpsc::Sender<Frame>,
        monitor: LivenessWatch,
    ) -> Self {
        Self {
            id,
            caller,
            stream_tag: opts.stream_tag,
            state: ClientState::Starting,
            ticker: None,
            buffer_ms: opts.buffer_ms.unwrap_or(0),
            send_audio: opts.send_audio,
            send_video: opts.send_video,
            bytes: 0,
            sent_starting_config: false,
            started: false,
            sink,
            monitor,
        }
    }
}

/// Per-client handle returned from `subscribe`, pairing the id the caller
/// uses in later requests with the death token it must keep alive (or drop
/// to signal its own departure — spec.md §9 "Liveness notifications").
pub struct ClientSubscription {
    pub id: ClientId,
    pub death_token: DeathToken,
}

/// Client registry (spec.md §4.3). Backed by a plain `IndexMap` rather
/// than the teacher's `Arc<Mutex<HashMap>>` (`streamhub::mod::StreamsHub`):
/// the teacher needs concurrent access because its fan-out loop and its
/// event loop run as separate tasks sharing one map, whereas this registry
/// is touched exclusively by the owning actor task, so no synchronization
/// is needed at all.
#[derive(Default)]
pub struct ClientRegistry {
    clients: IndexMap<ClientId, ClientEntry>,
    /// O(1) duplicate-subscribe detection (spec.md §4.1 "a second subscribe
    /// from the same caller is an error"), kept in step with `clients`.
    callers: HashMap<CallerId, ClientId>,
}

impl ClientRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            clients: IndexMap::new(),
            callers: HashMap::new(),
        }
    }

    /// Errors with `AlreadySubscribed` if `caller` already has a live
    /// subscription (spec.md §4.1).
    pub fn insert(
        &mut self,
        caller: CallerId,
        opts: SubscribeOptions,
        sink: mpsc::Sender<Frame>,
    ) -> StreamResult<(ClientId, ClientSubscription)> {
        if self.callers.contains_key(&caller) {
            return Err(StreamErrorValue::AlreadySubscribed(caller.0).into());
        }
        let id = ClientId::new();
        let (monitor_handle, death_token) = crate::source::SourceHandle::new(id.to_string());
        let entry = ClientEntry::new(id, caller.clone(), opts, sink, monitor_handle.liveness);
        self.clients.insert(id, entry);
        self.callers.insert(caller, id);
        Ok((id, ClientSubscription { id, death_token }))
    }

    pub fn remove(&mut self, id: ClientId) -> Option<ClientEntry> {
        let entry = self.clients.shift_remove(&id)?;
        self.callers.remove(&entry.caller);
        Some(entry)
    }

    #[must_use]
    pub fn find(&self, id: ClientId) -> Option<&ClientEntry> {
        self.clients.get(&id)
    }

    pub fn find_mut(&mut self, id: ClientId) -> Option<&mut ClientEntry> {
        self.clients.get_mut(&id)
    }

    pub fn list(&self) -> impl Iterator<Item = &ClientEntry> {
        self.clients.values()
    }

    pub fn list_mut(&mut self) -> impl Iterator<Item = &mut ClientEntry> {
        self.clients.values_mut()
    }

    /// Move every client currently in `from` into `to` (spec.md §4.6: all
    /// `active` clients become `starting` again after a source failover).
    pub fn mass_update_state(&mut self, from: ClientState, to: ClientState) {
        for entry in self.clients.values_mut() {
            if entry.state == from {
                entry.state = to;
                if to == ClientState::Starting {
                    entry.sent_starting_config = false;
                }
            }
        }
    }

    pub fn increment_bytes(&mut self, id: ClientId, n: u64) {
        if let Some(entry) = self.clients.get_mut(&id) {
            entry.bytes += n;
        }
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink() -> mpsc::Sender<Frame> {
        mpsc::channel(8).0
    }

    fn caller(tag: &str) -> CallerId {
        CallerId(tag.to_string())
    }

    #[test]
    fn subscribe_then_unsubscribe_leaves_registry_unchanged() {
        let mut registry = ClientRegistry::new();
        assert_eq!(registry.client_count(), 0);
        let (id, _sub) = registry.insert(caller("a"), SubscribeOptions::new(), sink()).unwrap();
        assert_eq!(registry.client_count(), 1);
        registry.remove(id);
        assert_eq!(registry.client_count(), 0);
    }

    #[test]
    fn new_clients_start_in_starting_state() {
        let mut registry = ClientRegistry::new();
        let (id, _sub) = registry.insert(caller("a"), SubscribeOptions::new(), sink()).unwrap();
        assert_eq!(registry.find(id).unwrap().state, ClientState::Starting);
    }

    #[test]
    fn mass_update_resets_starting_config_flag() {
        let mut registry = ClientRegistry::new();
        let (id, _sub) = registry.insert(caller("a"), SubscribeOptions::new(), sink()).unwrap();
        registry.find_mut(id).unwrap().state = ClientState::Active;
        registry.find_mut(id).unwrap().sent_starting_config = true;

        registry.mass_update_state(ClientState::Active, ClientState::Starting);

        let entry = registry.find(id).unwrap();
        assert_eq!(entry.state, ClientState::Starting);
        assert!(!entry.sent_starting_config);
    }

    #[test]
    fn increment_bytes_accumulates_on_existing_client_only() {
        let mut registry = ClientRegistry::new();
        let (id, _sub) = registry.insert(caller("a"), SubscribeOptions::new(), sink()).unwrap();
        registry.increment_bytes(id, 10);
        registry.increment_bytes(id, 5);
        assert_eq!(registry.find(id).unwrap().bytes, 15);

        registry.remove(id);
        registry.increment_bytes(id, 99); // tolerated no-op, no panic
    }

    #[test]
    fn client_count_matches_live_registrations() {
        let mut registry = ClientRegistry::new();
        let (a, _) = registry.insert(caller("a"), SubscribeOptions::new(), sink()).unwrap();
        let (_b, _) = registry.insert(caller("b"), SubscribeOptions::new(), sink()).unwrap();
        assert_eq!(registry.client_count(), 2);
        registry.remove(a);
        assert_eq!(registry.client_count(), 1);
    }

    #[test]
    fn second_subscribe_from_same_caller_is_rejected() {
        let mut registry = ClientRegistry::new();
        registry.insert(caller("a"), SubscribeOptions::new(), sink()).unwrap();
        let err = registry.insert(caller("a"), SubscribeOptions::new(), sink());
        assert!(err.is_err());
        assert_eq!(registry.client_count(), 1);
    }

    #[test]
    fn caller_can_resubscribe_after_unsubscribing() {
        let mut registry = ClientRegistry::new();
        let (id, _sub) = registry.insert(caller("a"), SubscribeOptions::new(), sink()).unwrap();
        registry.remove(id);
        let second = registry.insert(caller("a"), SubscribeOptions::new(), sink());
        assert!(second.is_ok());
    }
}
