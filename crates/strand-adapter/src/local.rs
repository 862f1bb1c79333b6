use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use strand_core::{BroadcastOptions, Packet, RemoteSocket};

use crate::ack::{AckFn, ClientCountFn};

/// One-shot reply handle for a server-side emit that expects an answer.
pub struct Responder(Box<dyn FnOnce(Value) + Send>);

impl Responder {
    pub fn new(reply: impl FnOnce(Value) + Send + 'static) -> Self {
        Self(Box::new(reply))
    }

    pub fn reply(self, response: Value) {
        (self.0)(response)
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Responder")
    }
}

/// Socket and room bookkeeping of a single process for one namespace.
///
/// Calls are synchronous and must not block.
pub trait LocalAdapter: Send + Sync {
    fn broadcast(&self, packet: &Packet, opts: &BroadcastOptions);

    /// Delivers `packet` and reports the number of targeted clients once,
    /// then every client acknowledgement.
    fn broadcast_with_ack(
        &self,
        packet: &Packet,
        opts: &BroadcastOptions,
        on_client_count: ClientCountFn,
        on_ack: AckFn,
    );

    fn add_sockets(&self, opts: &BroadcastOptions, rooms: &[String]);

    fn del_sockets(&self, opts: &BroadcastOptions, rooms: &[String]);

    fn disconnect_sockets(&self, opts: &BroadcastOptions, close: bool);

    fn fetch_sockets(&self, opts: &BroadcastOptions) -> Vec<RemoteSocket>;

    /// Handles a server-to-server event `[event, args...]` from a peer.
    fn on_server_side_emit(&self, args: Vec<Value>, responder: Option<Responder>);

    /// Whether connection state recovery is enabled for this namespace.
    fn connection_state_recovery(&self) -> bool {
        false
    }
}

/// A socket held by [`MemoryLocalAdapter`].
#[derive(Debug, Clone, PartialEq)]
pub struct LocalSocket {
    pub id: String,
    pub handshake: Value,
    pub rooms: BTreeSet<String>,
    pub data: Value,
    /// What this client answers to acknowledged broadcasts, if anything.
    pub ack_reply: Option<Value>,
    /// Packet payloads delivered to this client.
    pub inbox: Vec<Vec<Value>>,
}

impl LocalSocket {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            handshake: Value::Null,
            rooms: BTreeSet::new(),
            data: Value::Null,
            ack_reply: None,
            inbox: Vec::new(),
        }
    }

    pub fn in_rooms<I, S>(mut self, rooms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rooms.extend(rooms.into_iter().map(Into::into));
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_ack_reply(mut self, reply: Value) -> Self {
        self.ack_reply = Some(reply);
        self
    }

    /// Joined rooms plus the implicit room named after the socket id.
    fn effective_rooms(&self) -> BTreeSet<String> {
        let mut rooms = self.rooms.clone();
        rooms.insert(self.id.clone());
        rooms
    }

    fn is_targeted(&self, opts: &BroadcastOptions) -> bool {
        opts.reaches_rooms(&self.effective_rooms())
    }

    fn to_remote(&self) -> RemoteSocket {
        RemoteSocket {
            id: self.id.clone(),
            handshake: self.handshake.clone(),
            rooms: self.effective_rooms(),
            data: self.data.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct MemoryLocalState {
    sockets: BTreeMap<String, LocalSocket>,
    server_side_events: Vec<Vec<Value>>,
    server_side_reply: Option<Value>,
    disconnected: Vec<String>,
}

/// In-memory [`LocalAdapter`] for tests and the demo node.
#[derive(Debug, Default)]
pub struct MemoryLocalAdapter {
    state: Mutex<MemoryLocalState>,
    recovery: bool,
}

impl MemoryLocalAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_recovery(mut self, enabled: bool) -> Self {
        self.recovery = enabled;
        self
    }

    fn lock(&self) -> MutexGuard<'_, MemoryLocalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn connect(&self, socket: LocalSocket) {
        self.lock().sockets.insert(socket.id.clone(), socket);
    }

    pub fn socket(&self, id: &str) -> Option<LocalSocket> {
        self.lock().sockets.get(id).cloned()
    }

    pub fn socket_count(&self) -> usize {
        self.lock().sockets.len()
    }

    pub fn inbox(&self, id: &str) -> Vec<Vec<Value>> {
        self.lock()
            .sockets
            .get(id)
            .map(|s| s.inbox.clone())
            .unwrap_or_default()
    }

    pub fn rooms_of(&self, id: &str) -> BTreeSet<String> {
        self.lock()
            .sockets
            .get(id)
            .map(|s| s.rooms.clone())
            .unwrap_or_default()
    }

    /// Answer given to peers' server-side emits that expect one.
    pub fn set_server_side_reply(&self, reply: Option<Value>) {
        self.lock().server_side_reply = reply;
    }

    pub fn server_side_events(&self) -> Vec<Vec<Value>> {
        self.lock().server_side_events.clone()
    }

    pub fn disconnected(&self) -> Vec<String> {
        self.lock().disconnected.clone()
    }

    fn for_targeted(&self, opts: &BroadcastOptions, mut f: impl FnMut(&mut LocalSocket)) {
        for socket in self.lock().sockets.values_mut() {
            if socket.is_targeted(opts) {
                f(socket);
            }
        }
    }
}

impl LocalAdapter for MemoryLocalAdapter {
    fn broadcast(&self, packet: &Packet, opts: &BroadcastOptions) {
        self.for_targeted(opts, |socket| socket.inbox.push(packet.data.clone()));
    }

    fn broadcast_with_ack(
        &self,
        packet: &Packet,
        opts: &BroadcastOptions,
        on_client_count: ClientCountFn,
        on_ack: AckFn,
    ) {
        let mut count = 0;
        let mut replies = Vec::new();
        self.for_targeted(opts, |socket| {
            socket.inbox.push(packet.data.clone());
            count += 1;
            if let Some(reply) = &socket.ack_reply {
                replies.push(reply.clone());
            }
        });
        on_client_count(count);
        for reply in replies {
            on_ack(reply);
        }
    }

    fn add_sockets(&self, opts: &BroadcastOptions, rooms: &[String]) {
        self.for_targeted(opts, |socket| socket.rooms.extend(rooms.iter().cloned()));
    }

    fn del_sockets(&self, opts: &BroadcastOptions, rooms: &[String]) {
        self.for_targeted(opts, |socket| {
            for room in rooms {
                socket.rooms.remove(room);
            }
        });
    }

    fn disconnect_sockets(&self, opts: &BroadcastOptions, _close: bool) {
        let mut state = self.lock();
        let targeted: Vec<String> = state
            .sockets
            .values()
            .filter(|s| s.is_targeted(opts))
            .map(|s| s.id.clone())
            .collect();
        for id in targeted {
            state.sockets.remove(&id);
            state.disconnected.push(id);
        }
    }

    fn fetch_sockets(&self, opts: &BroadcastOptions) -> Vec<RemoteSocket> {
        self.lock()
            .sockets
            .values()
            .filter(|s| s.is_targeted(opts))
            .map(LocalSocket::to_remote)
            .collect()
    }

    fn on_server_side_emit(&self, args: Vec<Value>, responder: Option<Responder>) {
        let reply = {
            let mut state = self.lock();
            state.server_side_events.push(args);
            state.server_side_reply.clone()
        };
        if let (Some(responder), Some(reply)) = (responder, reply) {
            responder.reply(reply);
        }
    }

    fn connection_state_recovery(&self) -> bool {
        self.recovery
    }
}
