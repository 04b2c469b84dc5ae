//! A live D-Bus connection: authentication, the receive loop, and
//! dispatch of inbound traffic.
//!
//! One thread per connection reads and decodes messages. Replies wake
//! their waiting caller; signals, method calls and reply callbacks run
//! on worker pools sized per message kind, so slow handlers never stall
//! reception. Sending goes through a single writer lock, which is also
//! where serials are assigned, so frames are never interleaved and
//! serials appear on the wire in increasing order.

use crate::address::BusAddress;
use crate::auth::AuthServer;
use crate::daemon::names::{NameFlags, ReleaseNameReply, RequestNameReply, BUS_NAME};
use crate::de::from_body;
use crate::error::{Error, Result};
use crate::match_rule::MatchRule;
use crate::message::{Message, MessageType};
use crate::ser::to_body;
use crate::transport::{Stream, TransportRegistry};
use crate::value::{ObjectPath, Value};
use crate::wire;

use log::{debug, error, trace, warn};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub mod config;
pub mod object;
pub mod pending;
mod pool;
pub mod proxy;

pub use config::ConnectionConfig;
pub use object::{ExportedObject, Interface};
pub use pending::PendingReply;

use object::{remote, ObjectRegistry, PEER_INTERFACE, UNKNOWN_METHOD};
use pending::{PendingCalls, ReplySlot, Waiter};
use pool::WorkerPool;

pub const BUS_PATH: &str = "/org/freedesktop/DBus";
pub const BUS_INTERFACE: &str = "org.freedesktop.DBus";
const FAILED: &str = "org.freedesktop.DBus.Error.Failed";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    Connected,
    Disconnected,
}

/// The 32 hex digit id of this machine, or a random one fixed for the
/// life of the process when the system has none.
pub fn machine_id() -> String {
    static FALLBACK: OnceLock<String> = OnceLock::new();
    for path in &["/etc/machine-id", "/var/lib/dbus/machine-id"] {
        if let Ok(id) = fs::read_to_string(path) {
            let id = id.trim();
            if id.len() == 32 && id.bytes().all(|b| b.is_ascii_hexdigit()) {
                return id.to_owned();
            }
        }
    }
    FALLBACK
        .get_or_init(|| hex::encode(rand::thread_rng().gen::<[u8; 16]>()))
        .clone()
}

/// Answers `org.freedesktop.DBus.Peer`, which every object implements.
pub(crate) fn peer_call(call: &Message) -> Result<Vec<Value>> {
    match call.member() {
        Some("Ping") => Ok(Vec::new()),
        Some("GetMachineId") => Ok(vec![Value::from(machine_id())]),
        other => Err(remote(
            UNKNOWN_METHOD,
            format!("No such method {}.{}", PEER_INTERFACE, other.unwrap_or("")),
        )),
    }
}

/// The reply a failed method call gets.
pub(crate) fn error_reply(call: &Message, err: &Error) -> Message {
    match err {
        Error::Remote { name, message } => Message::error(call, name, message),
        other => Message::error(call, other.dbus_name(), &other.to_string()),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type SignalHandler = Arc<dyn Fn(&Message) + Send + Sync + 'static>;
type DisconnectListener = Box<dyn FnOnce(&Error) + Send + 'static>;

struct SignalRegistration {
    id: HandlerId,
    rule: MatchRule,
    handler: SignalHandler,
}

struct Outgoing {
    stream: Box<dyn Stream>,
    next_serial: u32,
}

struct Pools {
    signals: WorkerPool,
    method_calls: WorkerPool,
    method_returns: WorkerPool,
    errors: WorkerPool,
}

impl Pools {
    fn new(config: &ConnectionConfig) -> Result<Pools> {
        Ok(Pools {
            signals: WorkerPool::new("dbus-signal", config.signal_workers)?,
            method_calls: WorkerPool::new("dbus-call", config.method_call_workers)?,
            method_returns: WorkerPool::new("dbus-return", config.method_return_workers)?,
            errors: WorkerPool::new("dbus-error", config.error_workers)?,
        })
    }

    fn shutdown(&self) {
        self.signals.shutdown();
        self.method_calls.shutdown();
        self.method_returns.shutdown();
        self.errors.shutdown();
    }
}

struct Inner {
    config: ConnectionConfig,
    guid: String,
    unix_fd: bool,
    outgoing: Mutex<Outgoing>,
    /// Handle used to shut the stream down from any thread.
    control: Mutex<Box<dyn Stream>>,
    state: Mutex<ConnectionState>,
    pending: Arc<PendingCalls>,
    objects: ObjectRegistry,
    signal_handlers: RwLock<Vec<SignalRegistration>>,
    /// Current owners of the well-known names signal handlers filter
    /// on by sender. A name is watched while it has an entry.
    sender_owners: RwLock<HashMap<String, Option<String>>>,
    next_handler: AtomicU64,
    pools: Pools,
    listeners: Mutex<Vec<DisconnectListener>>,
    unique_name: Mutex<Option<String>>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

/// A connection to a bus or directly to a peer. Cloning gives another
/// handle on the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

fn receive_loop(inner: Weak<Inner>, mut reader: Box<dyn Stream>) {
    let cause = loop {
        let result = wire::read_message(&mut *reader);
        let inner = match inner.upgrade() {
            Some(inner) => inner,
            None => return,
        };
        match result {
            Ok(msg) => inner.dispatch(msg),
            Err(err) => break err,
        }
    };
    if let Some(inner) = inner.upgrade() {
        if inner.state() == ConnectionState::Connected {
            error!("receive loop failed: {}", cause);
        }
        inner.disconnect(cause);
    }
    trace!("receive loop done");
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn send_with(&self, mut msg: Message, register: impl FnOnce(u32) -> Result<()>) -> Result<u32> {
        if self.state() == ConnectionState::Disconnected {
            return Err(Error::Disconnected);
        }
        let mut out = self.outgoing.lock();
        let serial = out.next_serial;
        out.next_serial = out.next_serial.checked_add(1).unwrap_or(1);
        msg.serial = serial;
        let data = wire::encode(&msg)?;
        register(serial)?;
        let written = out.stream.write_all(&data).and_then(|_| out.stream.flush());
        drop(out);
        if let Err(err) = written {
            let err = Error::from(err);
            self.pending.take(serial);
            self.disconnect(err.clone());
            return Err(err);
        }
        trace!(
            "sent {} serial {} ({} bytes)",
            msg.message_type.as_str(),
            serial,
            data.len()
        );
        Ok(serial)
    }

    fn send(&self, msg: Message) -> Result<u32> {
        self.send_with(msg, |_| Ok(()))
    }

    fn dispatch(self: &Arc<Self>, msg: Message) {
        trace!(
            "received {} serial {} from {:?}",
            msg.message_type.as_str(),
            msg.serial,
            msg.sender()
        );
        match msg.message_type {
            MessageType::MethodReturn | MessageType::Error => self.dispatch_reply(msg),
            MessageType::Signal => self.dispatch_signal(msg),
            MessageType::MethodCall => {
                let inner = self.clone();
                if !self.pools.method_calls.execute(move || inner.handle_call(msg)) {
                    debug!("method call arrived during shutdown");
                }
            }
        }
    }

    fn dispatch_reply(&self, msg: Message) {
        let serial = match msg.reply_serial() {
            Some(serial) => serial,
            None => return,
        };
        match self.pending.take(serial) {
            Some(Waiter::Slot(slot)) => slot.fulfill(msg.into_result()),
            Some(Waiter::Callback(callback)) => {
                let pool = match msg.message_type {
                    MessageType::Error => &self.pools.errors,
                    _ => &self.pools.method_returns,
                };
                pool.execute(move || callback(msg.into_result()));
            }
            None => warn!("dropping reply to unknown serial {}", serial),
        }
    }

    // Runs on the receive loop, so an owner change is applied before any
    // signal the new owner sends afterwards.
    fn track_owner(&self, msg: &Message) {
        if msg.sender() != Some(BUS_NAME) || msg.member() != Some("NameOwnerChanged") {
            return;
        }
        if let [Value::String(name), _, Value::String(new_owner)] = msg.body.as_slice() {
            if let Some(owner) = self.sender_owners.write().get_mut(name) {
                trace!("{} is now owned by {:?}", name, new_owner);
                *owner = Some(new_owner.clone()).filter(|owner| !owner.is_empty());
            }
        }
    }

    fn dispatch_signal(&self, msg: Message) {
        self.track_owner(&msg);
        let owners = self.sender_owners.read();
        let owner_of = |name: &str| owners.get(name).cloned().flatten();
        let handlers: Vec<SignalHandler> = self
            .signal_handlers
            .read()
            .iter()
            .filter(|reg| reg.rule.matches_resolved(&msg, owner_of))
            .map(|reg| reg.handler.clone())
            .collect();
        drop(owners);
        if handlers.is_empty() {
            trace!("no handler for signal {:?}", msg.member());
            return;
        }
        let msg = Arc::new(msg);
        for handler in handlers {
            let msg = msg.clone();
            self.pools.signals.execute(move || handler(&*msg));
        }
    }

    fn answer(&self, call: &Message) -> Result<Vec<Value>> {
        if call.interface() == Some(PEER_INTERFACE) {
            return peer_call(call);
        }
        let path = call
            .path()
            .ok_or_else(|| Error::MalformedMessage("method call without path".to_owned()))?;
        self.objects.lookup(path)?.invoke(call)
    }

    fn handle_call(&self, call: Message) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.answer(&call)))
            .unwrap_or_else(|_| {
                warn!("handler for {:?} panicked", call.member());
                Err(remote(FAILED, "method handler panicked"))
            });
        if !call.expects_reply() {
            if let Err(err) = result {
                debug!("call {} failed without reply: {}", call.serial, err);
            }
            return;
        }
        let reply = match result {
            Ok(body) => Message::method_return(&call).with_body(body),
            Err(err) => error_reply(&call, &err),
        };
        match self.send(reply) {
            Ok(_) | Err(Error::Disconnected) => (),
            Err(err @ Error::Io(_)) => {
                warn!("could not reply to serial {}: {}", call.serial, err);
            }
            // The reply itself could not be encoded; the caller still
            // gets an answer.
            Err(err) => {
                warn!("reply to serial {} is not sendable: {}", call.serial, err);
                let failed = Message::error(&call, FAILED, &format!("unsendable reply: {}", err));
                if let Err(err) = self.send(failed) {
                    warn!("could not reply to serial {}: {}", call.serial, err);
                }
            }
        }
    }

    /// Moves to `Disconnected` once; later calls do nothing.
    fn disconnect(&self, cause: Error) {
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Disconnected {
                return;
            }
            *state = ConnectionState::Disconnected;
        }
        debug!("connection {} disconnecting: {}", self.guid, cause);
        if let Err(err) = self.control.lock().shutdown() {
            debug!("shutting down transport: {}", err);
        }
        for waiter in self.pending.close() {
            waiter.complete(Err(Error::Disconnected));
        }
        let listeners = std::mem::take(&mut *self.listeners.lock());
        for listener in listeners {
            listener(&cause);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if *self.state.get_mut() != ConnectionState::Disconnected {
            let _ = self.control.get_mut().shutdown();
        }
    }
}

impl Connection {
    /// Connects to the session bus named by `DBUS_SESSION_BUS_ADDRESS`.
    pub fn session() -> Result<Connection> {
        Connection::open(&BusAddress::session()?, ConnectionConfig::default())
    }

    pub fn system() -> Result<Connection> {
        Connection::open(&BusAddress::system()?, ConnectionConfig::default())
    }

    pub fn open(addresses: &[BusAddress], config: ConnectionConfig) -> Result<Connection> {
        Connection::open_with(&TransportRegistry::default(), addresses, config)
    }

    /// Connects to the first reachable address using `registry`'s
    /// transports.
    pub fn open_with(
        registry: &TransportRegistry,
        addresses: &[BusAddress],
        config: ConnectionConfig,
    ) -> Result<Connection> {
        debug!("state {:?}", ConnectionState::Connecting);
        let (stream, provider) = registry.connect(addresses)?;
        Connection::from_stream(stream, provider.supports_fd_passing(), config)
    }

    /// Authenticates as a client over an already connected stream, then
    /// registers with the bus if the config says so.
    pub fn from_stream(
        mut stream: Box<dyn Stream>,
        fd_capable: bool,
        config: ConnectionConfig,
    ) -> Result<Connection> {
        debug!("state {:?}", ConnectionState::Authenticating);
        let outcome = config.auth_client(fd_capable).authenticate(&mut *stream)?;
        let register = config.register_with_bus;
        let conn = Connection::start(stream, outcome.guid, outcome.unix_fd, config)?;
        if register {
            if let Err(err) = conn.hello() {
                let _ = conn.close();
                return Err(err);
            }
        }
        Ok(conn)
    }

    /// Server side of a peer-to-peer connection: authenticates the peer
    /// with `server` and starts dispatching, without any bus registration.
    pub fn accept_peer(
        mut stream: Box<dyn Stream>,
        server: &AuthServer,
        config: ConnectionConfig,
    ) -> Result<Connection> {
        let peer_uid = stream.peer_uid();
        let outcome = server.authenticate(&mut *stream, peer_uid)?;
        Connection::start(
            stream,
            server.guid.clone(),
            outcome.unix_fd,
            config.with_register_with_bus(false),
        )
    }

    fn start(
        stream: Box<dyn Stream>,
        guid: String,
        unix_fd: bool,
        config: ConnectionConfig,
    ) -> Result<Connection> {
        let reader = stream.try_clone_box()?;
        let control = stream.try_clone_box()?;
        let pools = Pools::new(&config)?;
        let inner = Arc::new(Inner {
            config,
            guid,
            unix_fd,
            outgoing: Mutex::new(Outgoing {
                stream,
                next_serial: 1,
            }),
            control: Mutex::new(control),
            state: Mutex::new(ConnectionState::Connected),
            pending: Arc::new(PendingCalls::default()),
            objects: ObjectRegistry::default(),
            signal_handlers: RwLock::new(Vec::new()),
            sender_owners: RwLock::new(HashMap::new()),
            next_handler: AtomicU64::new(1),
            pools,
            listeners: Mutex::new(Vec::new()),
            unique_name: Mutex::new(None),
            receiver: Mutex::new(None),
        });
        let weak = Arc::downgrade(&inner);
        let handle = thread::Builder::new()
            .name("dbus-receive".to_owned())
            .spawn(move || receive_loop(weak, reader))?;
        *inner.receiver.lock() = Some(handle);
        debug!("connection {} connected", inner.guid);
        Ok(Connection { inner })
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// GUID of the server end, from the handshake.
    pub fn guid(&self) -> &str {
        &self.inner.guid
    }

    pub fn supports_unix_fd(&self) -> bool {
        self.inner.unix_fd
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// The `:1.N` name the bus assigned, if registered.
    pub fn unique_name(&self) -> Option<String> {
        self.inner.unique_name.lock().clone()
    }

    /// Number of calls still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Sends any message, assigning it the next serial, which is returned.
    pub fn send(&self, msg: Message) -> Result<u32> {
        self.inner.send(msg)
    }

    fn check_call(msg: &Message) -> Result<()> {
        if msg.message_type != MessageType::MethodCall {
            return Err(Error::MalformedMessage(format!(
                "cannot wait for a reply to a {}",
                msg.message_type.as_str()
            )));
        }
        Ok(())
    }

    /// Sends a call and returns at once; the reply is collected through
    /// the returned handle.
    pub fn call_async(&self, msg: Message) -> Result<PendingReply> {
        Connection::check_call(&msg)?;
        let slot = Arc::new(ReplySlot::default());
        let inner = &self.inner;
        let serial = inner.send_with(msg, |serial| {
            inner.pending.insert(serial, Waiter::Slot(slot.clone()))
        })?;
        Ok(PendingReply::new(serial, slot, inner.pending.clone()))
    }

    /// Sends a call; `callback` runs on the return or error pool when the
    /// reply arrives, or with [`Error::Disconnected`] if it never will.
    pub fn call_with_callback<F>(&self, msg: Message, callback: F) -> Result<u32>
    where
        F: FnOnce(Result<Message>) + Send + 'static,
    {
        Connection::check_call(&msg)?;
        let inner = &self.inner;
        inner.send_with(msg, |serial| {
            inner.pending.insert(serial, Waiter::Callback(Box::new(callback)))
        })
    }

    pub fn call_with_timeout(&self, msg: Message, timeout: Duration) -> Result<Message> {
        self.call_async(msg)?.wait(timeout)
    }

    /// Blocks for the reply, up to the configured default timeout. Error
    /// replies become [`Error::Remote`].
    pub fn call(&self, msg: Message) -> Result<Message> {
        self.call_with_timeout(msg, self.inner.config.default_timeout())
    }

    /// Calls a method with serde arguments and reads the reply the same
    /// way. A tuple of arguments becomes one argument per element.
    pub fn call_method<A, R>(
        &self,
        destination: Option<&str>,
        path: &str,
        interface: Option<&str>,
        member: &str,
        args: A,
    ) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let msg = Message::method_call(destination, path, interface, member)?
            .with_body(to_body(args)?);
        let reply = self.call(msg)?;
        from_body(&reply.body)
    }

    fn bus_call<A: Serialize, R: DeserializeOwned>(&self, member: &str, args: A) -> Result<R> {
        self.call_method(Some(BUS_NAME), BUS_PATH, Some(BUS_INTERFACE), member, args)
    }

    fn hello(&self) -> Result<String> {
        let name: String = self.bus_call("Hello", ())?;
        debug!("registered with the bus as {}", name);
        *self.inner.unique_name.lock() = Some(name.clone());
        Ok(name)
    }

    pub fn request_name(&self, name: &str, flags: NameFlags) -> Result<RequestNameReply> {
        let code: u32 = self.bus_call("RequestName", (name, flags.bits()))?;
        RequestNameReply::from_code(code)
            .ok_or_else(|| Error::MalformedMessage(format!("RequestName replied {}", code)))
    }

    pub fn release_name(&self, name: &str) -> Result<ReleaseNameReply> {
        let code: u32 = self.bus_call("ReleaseName", (name,))?;
        ReleaseNameReply::from_code(code)
            .ok_or_else(|| Error::MalformedMessage(format!("ReleaseName replied {}", code)))
    }

    pub fn add_match(&self, rule: &MatchRule) -> Result<()> {
        self.bus_call("AddMatch", (rule.to_string(),))
    }

    pub fn remove_match(&self, rule: &MatchRule) -> Result<()> {
        self.bus_call("RemoveMatch", (rule.to_string(),))
    }

    pub fn get_name_owner(&self, name: &str) -> Result<String> {
        self.bus_call("GetNameOwner", (name,))
    }

    pub fn name_has_owner(&self, name: &str) -> Result<bool> {
        self.bus_call("NameHasOwner", (name,))
    }

    pub fn list_names(&self) -> Result<Vec<String>> {
        self.bus_call("ListNames", ())
    }

    /// Broadcasts a signal; returns its serial.
    pub fn emit_signal(
        &self,
        path: &str,
        interface: &str,
        member: &str,
        body: Vec<Value>,
    ) -> Result<u32> {
        self.send(Message::signal(path, interface, member)?.with_body(body))
    }

    /// Runs `handler` for every inbound signal matching `rule`. On a bus
    /// the rule is also registered with `AddMatch`, restricted to signals.
    pub fn add_signal_handler<F>(&self, rule: MatchRule, handler: F) -> Result<HandlerId>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let rule = match rule.msg_type {
            Some(_) => rule,
            None => rule.with_type(MessageType::Signal),
        };
        if self.unique_name().is_some() {
            self.add_match(&rule)?;
            if let Some(sender) = rule.sender.as_deref() {
                self.watch_owner(sender)?;
            }
        }
        let id = HandlerId(self.inner.next_handler.fetch_add(1, Ordering::Relaxed));
        self.inner.signal_handlers.write().push(SignalRegistration {
            id,
            rule,
            handler: Arc::new(handler),
        });
        Ok(id)
    }

    /// Returns false if no such handler was registered.
    pub fn remove_signal_handler(&self, id: HandlerId) -> Result<bool> {
        let (rule, still_used) = {
            let mut handlers = self.inner.signal_handlers.write();
            let ix = match handlers.iter().position(|reg| reg.id == id) {
                Some(ix) => ix,
                None => return Ok(false),
            };
            let removed = handlers.remove(ix);
            let still_used = handlers.iter().any(|reg| reg.rule == removed.rule);
            (removed.rule, still_used)
        };
        if !still_used && self.unique_name().is_some() {
            self.remove_match(&rule)?;
            if let Some(sender) = rule.sender.as_deref() {
                self.unwatch_owner(sender)?;
            }
        }
        Ok(true)
    }

    fn owner_changes(name: &str) -> MatchRule {
        MatchRule::new()
            .with_type(MessageType::Signal)
            .with_sender(BUS_NAME)
            .with_interface(BUS_INTERFACE)
            .with_member("NameOwnerChanged")
            .with_arg(0, name)
    }

    // Handlers may filter on a well-known sender, but the bus stamps
    // signals with the owner's unique name, so the owner is tracked.
    fn watch_owner(&self, name: &str) -> Result<()> {
        if name.starts_with(':') || name == BUS_NAME {
            return Ok(());
        }
        if self.inner.sender_owners.read().contains_key(name) {
            return Ok(());
        }
        self.add_match(&Connection::owner_changes(name))?;
        self.inner
            .sender_owners
            .write()
            .entry(name.to_owned())
            .or_insert(None);
        let owner = match self.get_name_owner(name) {
            Ok(owner) => Some(owner),
            Err(Error::Remote { .. }) => None,
            Err(err) => return Err(err),
        };
        debug!("watching {} (owner {:?})", name, owner);
        // An owner set by a NameOwnerChanged meanwhile is newer than the reply.
        if let Some(slot) = self.inner.sender_owners.write().get_mut(name) {
            if slot.is_none() {
                *slot = owner;
            }
        }
        Ok(())
    }

    fn unwatch_owner(&self, name: &str) -> Result<()> {
        let in_use = self
            .inner
            .signal_handlers
            .read()
            .iter()
            .any(|reg| reg.rule.sender.as_deref() == Some(name));
        if in_use || self.inner.sender_owners.write().remove(name).is_none() {
            return Ok(());
        }
        self.remove_match(&Connection::owner_changes(name))
    }

    pub fn export_object(&self, path: &str, object: ExportedObject) -> Result<()> {
        let path = ObjectPath::new(path)?;
        debug!("exporting {}", path);
        self.inner.objects.export(path, object);
        Ok(())
    }

    pub fn unexport_object(&self, path: &str) -> Result<bool> {
        Ok(self.inner.objects.unexport(&ObjectPath::new(path)?))
    }

    /// `listener` runs exactly once, with the cause of the disconnect.
    /// On an already closed connection it runs right away.
    pub fn add_disconnect_listener<F>(&self, listener: F)
    where
        F: FnOnce(&Error) + Send + 'static,
    {
        let mut listeners = self.inner.listeners.lock();
        if self.state() == ConnectionState::Disconnected {
            drop(listeners);
            listener(&Error::Disconnected);
            return;
        }
        listeners.push(Box::new(listener));
    }

    /// Disconnects, fails every pending call with
    /// [`Error::Disconnected`], notifies listeners and joins the
    /// connection's threads. Safe to call more than once.
    pub fn close(&self) -> Result<()> {
        self.inner.disconnect(Error::Disconnected);
        {
            let mut receiver = self.inner.receiver.lock();
            if let Some(handle) = receiver.take() {
                if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                    warn!("receive thread panicked");
                }
            }
        }
        self.inner.pools.shutdown();
        Ok(())
    }
}
