//! A small message bus that can be embedded in a process, so several
//! local peers can talk without the system broker.
//!
//! Each peer gets a reader thread that authenticates it and handles its
//! traffic, and a writer thread fed through a channel, so a peer that
//! stops reading never blocks routing to the others. All routing state
//! sits behind one lock.

use crate::address::BusAddress;
use crate::auth::cookie::Keyring;
use crate::auth::{AuthServer, Mechanism};
use crate::connection::object::UNKNOWN_METHOD;
use crate::connection::{error_reply, peer_call, BUS_INTERFACE, BUS_PATH};
use crate::de::from_body;
use crate::error::{Error, Result};
use crate::match_rule::MatchRule;
use crate::message::{Message, MessageType};
use crate::transport::{generate_guid, Acceptor, Stream, TransportRegistry};
use crate::value::Value;
use crate::wire;

use log::{debug, trace, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub mod names;

use names::{NameEvent, NameFlags, NameRegistry, BUS_NAME};

const PEER_INTERFACE: &str = "org.freedesktop.DBus.Peer";
const ACCESS_DENIED: &str = "org.freedesktop.DBus.Error.AccessDenied";
const SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";
const NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";
const MATCH_RULE_NOT_FOUND: &str = "org.freedesktop.DBus.Error.MatchRuleNotFound";

/// Settings for an [`EmbeddedDaemon`], loadable from TOML like
/// [`ConnectionConfig`](crate::connection::ConnectionConfig).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Mechanisms offered to connecting peers.
    pub auth_mechanisms: Vec<Mechanism>,
    /// Agree to `NEGOTIATE_UNIX_FD`.
    pub unix_fd: bool,
    pub keyring_dir: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            auth_mechanisms: Mechanism::ALL.to_vec(),
            unix_fd: false,
            keyring_dir: None,
        }
    }
}

impl DaemonConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|err| Error::Deserializing(err.to_string()))
    }

    pub fn with_auth_mechanisms(mut self, mechanisms: Vec<Mechanism>) -> Self {
        self.auth_mechanisms = mechanisms;
        self
    }

    pub fn with_keyring_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.keyring_dir = Some(dir.into());
        self
    }

    fn auth_server(&self, guid: &str) -> AuthServer {
        AuthServer {
            guid: guid.to_owned(),
            mechanisms: self.auth_mechanisms.clone(),
            unix_fd: self.unix_fd,
            keyring: match &self.keyring_dir {
                Some(dir) => Keyring::new(dir),
                None => Keyring::default(),
            },
        }
    }
}

struct Peer {
    outbox: Sender<Vec<u8>>,
    matches: Vec<MatchRule>,
}

#[derive(Default)]
struct BusState {
    names: NameRegistry,
    /// Registered peers by unique name.
    peers: HashMap<String, Peer>,
    next_unique: u64,
}

struct Shared {
    guid: String,
    config: DaemonConfig,
    address: BusAddress,
    acceptor: Box<dyn Acceptor>,
    running: AtomicBool,
    started: AtomicBool,
    serial: AtomicU32,
    next_conn: AtomicU64,
    state: Mutex<BusState>,
    /// Shutdown handles of every live peer stream, by connection id.
    streams: Mutex<HashMap<u64, Box<dyn Stream>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

/// A running bus. Clones share the same daemon.
#[derive(Clone)]
pub struct EmbeddedDaemon {
    shared: Arc<Shared>,
}

fn write_loop(mut stream: Box<dyn Stream>, frames: Receiver<Vec<u8>>) {
    for frame in frames {
        if let Err(err) = stream.write_all(&frame).and_then(|_| stream.flush()) {
            debug!("daemon write failed: {}", err);
            let _ = stream.shutdown();
            break;
        }
    }
}

fn deliver(outbox: &Sender<Vec<u8>>, msg: &Message) {
    match wire::encode(msg) {
        Ok(frame) => {
            // A closed outbox means the peer is on its way out.
            let _ = outbox.send(frame);
        }
        Err(err) => warn!("cannot encode {:?}: {}", msg.member(), err),
    }
}

fn denied(call: &Message, text: &str) -> Error {
    Error::Remote {
        name: ACCESS_DENIED.to_owned(),
        message: format!("{} ({:?})", text, call.member()),
    }
}

fn no_owner(name: &str) -> Error {
    Error::Remote {
        name: NAME_HAS_NO_OWNER.to_owned(),
        message: format!("Could not get owner of name '{}': no such name", name),
    }
}

impl Shared {
    fn next_serial(&self) -> u32 {
        loop {
            let serial = self.serial.fetch_add(1, Ordering::Relaxed);
            if serial != 0 {
                return serial;
            }
        }
    }

    /// Stamps a message from the bus itself.
    fn from_bus(&self, mut msg: Message) -> Message {
        msg.serial = self.next_serial();
        msg.fields.sender = Some(BUS_NAME.to_owned());
        msg
    }

    fn bus_signal(
        &self,
        member: &str,
        destination: Option<&str>,
        body: Vec<Value>,
    ) -> Result<Message> {
        let mut msg = Message::signal(BUS_PATH, BUS_INTERFACE, member)?.with_body(body);
        msg.fields.destination = destination.map(str::to_owned);
        Ok(self.from_bus(msg))
    }

    fn broadcast(&self, state: &BusState, msg: &Message) {
        let names = &state.names;
        let owner_of = |name: &str| names.owner(name).map(str::to_owned);
        for (unique, peer) in &state.peers {
            if peer.matches.iter().any(|rule| rule.matches_resolved(msg, &owner_of)) {
                trace!("broadcast {:?} to {}", msg.member(), unique);
                deliver(&peer.outbox, msg);
            }
        }
    }

    fn unicast(&self, state: &BusState, unique: &str, msg: &Message) {
        if let Some(peer) = state.peers.get(unique) {
            deliver(&peer.outbox, msg);
        }
    }

    fn announce(&self, state: &BusState, events: Vec<NameEvent>) {
        for event in events {
            let sent = match event {
                NameEvent::OwnerChanged { name, old, new } => self
                    .bus_signal(
                        "NameOwnerChanged",
                        None,
                        vec![
                            Value::from(name),
                            Value::from(old.unwrap_or_default()),
                            Value::from(new.unwrap_or_default()),
                        ],
                    )
                    .map(|msg| self.broadcast(state, &msg)),
                NameEvent::Acquired { owner, name } => self
                    .bus_signal("NameAcquired", Some(&owner), vec![Value::from(name)])
                    .map(|msg| self.unicast(state, &owner, &msg)),
                NameEvent::Lost { owner, name } => self
                    .bus_signal("NameLost", Some(&owner), vec![Value::from(name)])
                    .map(|msg| self.unicast(state, &owner, &msg)),
            };
            if let Err(err) = sent {
                warn!("cannot announce name change: {}", err);
            }
        }
    }

    fn reply(&self, call: &Message, result: Result<Vec<Value>>, outbox: &Sender<Vec<u8>>) {
        if !call.expects_reply() {
            return;
        }
        let reply = match result {
            Ok(body) => Message::method_return(call).with_body(body),
            Err(err) => error_reply(call, &err),
        };
        deliver(outbox, &self.from_bus(reply));
    }

    fn accept_loop(self: &Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            let stream = match self.acceptor.accept() {
                Ok(stream) => stream,
                Err(Error::Disconnected) => break,
                Err(err) => {
                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                    warn!("daemon accept failed: {}", err);
                    continue;
                }
            };
            if !self.running.load(Ordering::SeqCst) {
                let _ = stream.shutdown();
                break;
            }
            let id = self.next_conn.fetch_add(1, Ordering::Relaxed);
            if let Err(err) = self.spawn_peer(id, stream) {
                warn!("cannot serve connection {}: {}", id, err);
            }
        }
        debug!("daemon at {} stopped accepting", self.address);
    }

    fn spawn_peer(self: &Arc<Self>, id: u64, stream: Box<dyn Stream>) -> Result<()> {
        self.streams.lock().insert(id, stream.try_clone_box()?);
        let shared = self.clone();
        let handle = thread::Builder::new()
            .name(format!("dbus-daemon-peer-{}", id))
            .spawn(move || shared.serve(id, stream))?;
        let mut threads = self.threads.lock();
        threads.retain(|t| !t.is_finished());
        threads.push(handle);
        Ok(())
    }

    fn serve(&self, id: u64, mut stream: Box<dyn Stream>) {
        let mut unique = None;
        if let Err(err) = self.run_peer(id, &mut stream, &mut unique) {
            debug!("connection {} ({:?}) ended: {}", id, unique, err);
        }
        if let Some(control) = self.streams.lock().remove(&id) {
            let _ = control.shutdown();
        }
        if let Some(unique) = unique {
            let mut state = self.state.lock();
            state.peers.remove(&unique);
            let events = state.names.remove_connection(&unique);
            self.announce(&state, events);
        }
    }

    fn run_peer(
        &self,
        id: u64,
        stream: &mut Box<dyn Stream>,
        unique: &mut Option<String>,
    ) -> Result<()> {
        let peer_uid = stream.peer_uid();
        let outcome = self
            .config
            .auth_server(&self.guid)
            .authenticate(&mut **stream, peer_uid)?;
        debug!("connection {} authenticated with {:?}", id, outcome.mechanism);

        let (outbox, frames) = mpsc::channel();
        let writer = stream.try_clone_box()?;
        thread::Builder::new()
            .name(format!("dbus-daemon-write-{}", id))
            .spawn(move || write_loop(writer, frames))?;

        loop {
            let mut msg = wire::read_message(&mut **stream)?;
            let sender = match unique.as_deref() {
                Some(sender) => sender.to_owned(),
                None => {
                    *unique = self.hello(&msg, &outbox)?;
                    continue;
                }
            };
            msg.fields.sender = Some(sender.clone());
            if msg.destination() == Some(BUS_NAME) {
                self.bus_call(&sender, &msg, &outbox);
            } else {
                self.route(&msg, &outbox);
            }
        }
    }

    /// Handles the first message of a peer, which has to be `Hello`.
    fn hello(&self, msg: &Message, outbox: &Sender<Vec<u8>>) -> Result<Option<String>> {
        let is_hello = msg.message_type == MessageType::MethodCall
            && msg.destination() == Some(BUS_NAME)
            && msg.member() == Some("Hello")
            && matches!(msg.interface(), None | Some(BUS_INTERFACE));
        if !is_hello {
            self.reply(
                msg,
                Err(denied(msg, "Client tried to send a message other than Hello")),
                outbox,
            );
            return Ok(None);
        }
        let mut state = self.state.lock();
        state.next_unique += 1;
        let unique = format!(":1.{}", state.next_unique);
        state.peers.insert(
            unique.clone(),
            Peer {
                outbox: outbox.clone(),
                matches: Vec::new(),
            },
        );
        debug!("registered {}", unique);
        let mut call = msg.clone();
        call.fields.sender = Some(unique.clone());
        self.reply(&call, Ok(vec![Value::from(unique.as_str())]), outbox);
        let events = state.names.add_unique(&unique);
        self.announce(&state, events);
        Ok(Some(unique))
    }

    fn route(&self, msg: &Message, outbox: &Sender<Vec<u8>>) {
        let state = self.state.lock();
        let destination = match msg.destination() {
            Some(destination) => destination,
            None => {
                self.broadcast(&state, msg);
                return;
            }
        };
        match state.names.owner(destination).and_then(|u| state.peers.get(u)) {
            Some(peer) => deliver(&peer.outbox, msg),
            None => {
                trace!("nobody owns {}", destination);
                if msg.message_type == MessageType::MethodCall {
                    let err = Error::Remote {
                        name: SERVICE_UNKNOWN.to_owned(),
                        message: format!(
                            "The name {} was not provided by any .service files",
                            destination
                        ),
                    };
                    self.reply(msg, Err(err), outbox);
                }
            }
        }
    }

    fn bus_call(&self, sender: &str, call: &Message, outbox: &Sender<Vec<u8>>) {
        if call.message_type != MessageType::MethodCall {
            trace!("bus ignores {} from {}", call.message_type.as_str(), sender);
            return;
        }
        let result = match call.interface() {
            Some(PEER_INTERFACE) => peer_call(call),
            None | Some(BUS_INTERFACE) => {
                let mut state = self.state.lock();
                let (result, events) = self.bus_method(&mut state, sender, call);
                // The caller sees its reply before the signals it caused.
                self.reply(call, result, outbox);
                self.announce(&state, events);
                return;
            }
            Some(other) => Err(Error::Remote {
                name: UNKNOWN_METHOD.to_owned(),
                message: format!("Unknown interface {}", other),
            }),
        };
        self.reply(call, result, outbox);
    }

    fn bus_method(
        &self,
        state: &mut BusState,
        sender: &str,
        call: &Message,
    ) -> (Result<Vec<Value>>, Vec<NameEvent>) {
        let member = call.member().unwrap_or("");
        let mut events = Vec::new();
        let result = match member {
            "Hello" => Err(denied(call, "Already handled an Hello message")),
            "RequestName" => from_body::<(String, u32)>(&call.body).and_then(|(name, flags)| {
                let flags = NameFlags::from_bits(flags);
                let (reply, changes) = state.names.request_name(sender, &name, flags)?;
                debug!("{} requested {}: {:?}", sender, name, reply);
                events = changes;
                Ok(vec![Value::from(reply.code())])
            }),
            "ReleaseName" => from_body::<(String,)>(&call.body).and_then(|(name,)| {
                let (reply, changes) = state.names.release_name(sender, &name)?;
                events = changes;
                Ok(vec![Value::from(reply.code())])
            }),
            "AddMatch" => from_body::<(String,)>(&call.body).and_then(|(rule,)| {
                let rule = MatchRule::parse(&rule)?;
                if let Some(peer) = state.peers.get_mut(sender) {
                    peer.matches.push(rule);
                }
                Ok(Vec::new())
            }),
            "RemoveMatch" => from_body::<(String,)>(&call.body).and_then(|(rule,)| {
                let rule = MatchRule::parse(&rule)?;
                let removed = state.peers.get_mut(sender).and_then(|peer| {
                    let ix = peer.matches.iter().position(|r| *r == rule)?;
                    Some(peer.matches.remove(ix))
                });
                match removed {
                    Some(_) => Ok(Vec::new()),
                    None => Err(Error::Remote {
                        name: MATCH_RULE_NOT_FOUND.to_owned(),
                        message: "The given match rule wasn't found and can't be removed"
                            .to_owned(),
                    }),
                }
            }),
            "GetNameOwner" => from_body::<(String,)>(&call.body).and_then(|(name,)| {
                if name == BUS_NAME {
                    return Ok(vec![Value::from(BUS_NAME)]);
                }
                match state.names.owner(&name) {
                    Some(owner) => Ok(vec![Value::from(owner)]),
                    None => Err(no_owner(&name)),
                }
            }),
            "NameHasOwner" => from_body::<(String,)>(&call.body).map(|(name,)| {
                let owned = name == BUS_NAME || state.names.owner(&name).is_some();
                vec![Value::from(owned)]
            }),
            "ListNames" => {
                let mut names = vec![BUS_NAME.to_owned()];
                names.extend(state.names.names());
                Ok(vec![Value::from(names)])
            }
            "ListQueuedOwners" => from_body::<(String,)>(&call.body).and_then(|(name,)| {
                match state.names.queued_owners(&name) {
                    Some(owners) => Ok(vec![Value::from(owners)]),
                    None if name.starts_with(':') && state.names.owner(&name).is_some() => {
                        Ok(vec![Value::from(vec![name])])
                    }
                    None => Err(no_owner(&name)),
                }
            }),
            "GetId" => Ok(vec![Value::from(self.guid.as_str())]),
            other => Err(Error::Remote {
                name: UNKNOWN_METHOD.to_owned(),
                message: format!("Unknown method {} on {}", other, BUS_INTERFACE),
            }),
        };
        (result, events)
    }
}

impl EmbeddedDaemon {
    /// Listens on the first usable address, without accepting yet.
    pub fn bind(addresses: &[BusAddress], config: DaemonConfig) -> Result<EmbeddedDaemon> {
        EmbeddedDaemon::bind_with(&TransportRegistry::default(), addresses, config)
    }

    pub fn bind_with(
        registry: &TransportRegistry,
        addresses: &[BusAddress],
        config: DaemonConfig,
    ) -> Result<EmbeddedDaemon> {
        let (acceptor, _) = registry.listen(addresses)?;
        let guid = generate_guid();
        let address = acceptor.local_address().without("guid").with("guid", &guid);
        debug!("daemon listening on {}", address);
        Ok(EmbeddedDaemon {
            shared: Arc::new(Shared {
                guid,
                config,
                address,
                acceptor,
                running: AtomicBool::new(false),
                started: AtomicBool::new(false),
                serial: AtomicU32::new(1),
                next_conn: AtomicU64::new(1),
                state: Mutex::new(BusState::default()),
                streams: Mutex::new(HashMap::new()),
                threads: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Binds `address` and serves it from a background thread.
    pub fn start_in_background(
        address: &BusAddress,
        config: DaemonConfig,
    ) -> Result<EmbeddedDaemon> {
        let daemon = EmbeddedDaemon::bind(std::slice::from_ref(address), config)?;
        daemon.spawn()?;
        Ok(daemon)
    }

    fn begin(&self) -> Result<()> {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return Err(Error::TransportConfiguration(format!(
                "daemon at {} already started",
                self.shared.address
            )));
        }
        self.shared.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Starts accepting on a background thread.
    pub fn spawn(&self) -> Result<()> {
        self.begin()?;
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("dbus-daemon-accept".to_owned())
            .spawn(move || shared.accept_loop())?;
        self.shared.threads.lock().push(handle);
        Ok(())
    }

    /// Accepts on the calling thread until [`EmbeddedDaemon::close`] is
    /// called from elsewhere.
    pub fn start_in_foreground(&self) -> Result<()> {
        self.begin()?;
        self.shared.accept_loop();
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Where peers connect, with the actual port and the bus GUID filled in.
    pub fn address(&self) -> &BusAddress {
        &self.shared.address
    }

    pub fn guid(&self) -> &str {
        &self.shared.guid
    }

    /// Stops accepting, disconnects every peer and waits for the
    /// daemon's threads. Safe to call more than once.
    pub fn close(&self) -> Result<()> {
        let was_running = self.shared.running.swap(false, Ordering::SeqCst);
        self.shared.acceptor.close()?;
        for (_, stream) in self.shared.streams.lock().drain() {
            let _ = stream.shutdown();
        }
        let threads: Vec<_> = self.shared.threads.lock().drain(..).collect();
        let current = thread::current().id();
        for handle in threads {
            if handle.thread().id() != current && handle.join().is_err() {
                warn!("daemon thread panicked");
            }
        }
        if was_running {
            debug!("daemon at {} closed", self.shared.address);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{DaemonConfig, EmbeddedDaemon};
    use crate::address::BusAddress;
    use crate::auth::Mechanism;
    use crate::error::{Error, Result};
    use crate::message::Message;
    use crate::transport::tcp::TcpProvider;
    use crate::transport::TransportProvider;
    use crate::wire;
    use std::io::Write;
    use test_log::test;

    fn tcp_daemon() -> Result<EmbeddedDaemon> {
        let address = BusAddress::parse("tcp:host=127.0.0.1,port=0")?;
        let config = DaemonConfig::default().with_auth_mechanisms(vec![Mechanism::Anonymous]);
        EmbeddedDaemon::start_in_background(&address, config)
    }

    #[test]
    fn config_from_toml() -> Result<()> {
        let config = DaemonConfig::from_toml_str("auth_mechanisms = [\"EXTERNAL\"]\nunix_fd = true")?;
        assert_eq!(config.auth_mechanisms, vec![Mechanism::External]);
        assert!(config.unix_fd);
        assert!(DaemonConfig::from_toml_str("port = 3").is_err());
        Ok(())
    }

    #[test]
    fn lifecycle() -> Result<()> {
        let daemon = tcp_daemon()?;
        assert!(daemon.is_running());
        assert_ne!(daemon.address().get("port"), Some("0"));
        assert_eq!(daemon.address().guid(), Some(daemon.guid()));
        assert!(daemon.spawn().is_err());
        daemon.close()?;
        assert!(!daemon.is_running());
        daemon.close()?;
        Ok(())
    }

    #[test]
    fn first_message_must_be_hello() -> Result<()> {
        let daemon = tcp_daemon()?;
        let mut stream = TcpProvider.connect(daemon.address())?;
        crate::auth::AuthClient {
            mechanisms: vec![Mechanism::Anonymous],
            ..Default::default()
        }
        .authenticate(&mut *stream)?;
        let mut call = Message::method_call(
            Some("org.freedesktop.DBus"),
            "/org/freedesktop/DBus",
            Some("org.freedesktop.DBus"),
            "ListNames",
        )?;
        call.serial = 1;
        stream.write_all(&wire::encode(&call)?)?;
        let reply = wire::read_message(&mut *stream)?;
        assert_eq!(reply.reply_serial(), Some(1));
        match reply.into_result() {
            Err(Error::Remote { name, .. }) => {
                assert_eq!(name, "org.freedesktop.DBus.Error.AccessDenied")
            }
            other => panic!("unexpected {:?}", other),
        }
        daemon.close()?;
        Ok(())
    }
}
