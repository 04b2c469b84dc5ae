//! The byte-stream contract the connection layer runs on.
//!
//! A [`TransportProvider`] knows one transport name (`unix`, `tcp`, ...)
//! and turns addresses of that kind into connected [`Stream`]s or
//! listening [`Acceptor`]s. [`TransportRegistry`] holds the providers and
//! tries the candidate addresses of a bus address list in order.

use crate::address::BusAddress;
use crate::error::{Error, Result};
use log::{debug, trace};
use rand::Rng;

use std::io::{Read, Write};
use std::sync::Arc;

pub mod tcp;
#[cfg(unix)]
pub mod unix;

/// A connected, bidirectional byte stream.
pub trait Stream: Read + Write + Send {
    /// A second handle on the same stream, so reading and writing can
    /// happen on different threads.
    fn try_clone_box(&self) -> Result<Box<dyn Stream>>;

    /// Shuts both directions down, waking any thread blocked in a read.
    fn shutdown(&self) -> Result<()>;

    /// Uid of the process on the other end, when the transport knows it.
    fn peer_uid(&self) -> Option<u32> {
        None
    }
}

pub trait Acceptor: Send + Sync {
    /// Blocks until a peer connects. Fails with [`Error::Disconnected`]
    /// once the acceptor was closed.
    fn accept(&self) -> Result<Box<dyn Stream>>;

    /// Stops accepting; a thread blocked in [`Acceptor::accept`] returns.
    fn close(&self) -> Result<()>;

    /// Address peers can connect to, with any wildcard resolved.
    fn local_address(&self) -> BusAddress;
}

pub trait TransportProvider: Send + Sync {
    fn transport_name(&self) -> &str;

    fn supports_fd_passing(&self) -> bool {
        false
    }

    fn connect(&self, address: &BusAddress) -> Result<Box<dyn Stream>>;

    fn listen(&self, address: &BusAddress) -> Result<Box<dyn Acceptor>>;

    /// Makes up a fresh private address of this transport kind.
    fn create_dynamic_session_address(&self, listening: bool) -> Result<BusAddress>;
}

/// A random 128 bit server GUID in hex.
pub fn generate_guid() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    hex::encode(bytes)
}

/// Whether an [`io::Error`](std::io::Error) only says the socket was
/// already shut down.
pub(crate) fn is_not_connected(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::NotConnected
}

#[derive(Clone)]
pub struct TransportRegistry {
    providers: Vec<Arc<dyn TransportProvider>>,
}

impl Default for TransportRegistry {
    /// The built-in `unix` (where available) and `tcp` providers.
    fn default() -> Self {
        let mut registry = TransportRegistry::empty();
        #[cfg(unix)]
        registry.register(Arc::new(unix::UnixProvider));
        registry.register(Arc::new(tcp::TcpProvider));
        registry
    }
}

impl TransportRegistry {
    pub fn empty() -> TransportRegistry {
        TransportRegistry {
            providers: Vec::new(),
        }
    }

    /// Adds a provider. Earlier providers win when names collide.
    pub fn register(&mut self, provider: Arc<dyn TransportProvider>) {
        self.providers.push(provider);
    }

    pub fn provider(&self, transport: &str) -> Option<Arc<dyn TransportProvider>> {
        self.providers
            .iter()
            .find(|p| p.transport_name() == transport)
            .cloned()
    }

    fn each_candidate<T>(
        &self,
        addresses: &[BusAddress],
        mut attempt: impl FnMut(&Arc<dyn TransportProvider>, &BusAddress) -> Result<T>,
    ) -> Result<(T, Arc<dyn TransportProvider>)> {
        let mut failures = Vec::new();
        for address in addresses {
            let provider = match self.provider(address.transport()) {
                Some(provider) => provider,
                None => {
                    failures.push(format!("{}: no provider", address));
                    continue;
                }
            };
            match attempt(&provider, address) {
                Ok(out) => {
                    debug!("using transport {} for {}", provider.transport_name(), address);
                    return Ok((out, provider));
                }
                Err(err) => {
                    trace!("{} failed: {}", address, err);
                    failures.push(format!("{}: {}", address, err));
                }
            }
        }
        if failures.is_empty() {
            failures.push("no address given".to_owned());
        }
        Err(Error::TransportConfiguration(failures.join("; ")))
    }

    /// Connects to the first candidate that accepts a connection.
    pub fn connect(
        &self,
        addresses: &[BusAddress],
    ) -> Result<(Box<dyn Stream>, Arc<dyn TransportProvider>)> {
        self.each_candidate(addresses, |provider, address| provider.connect(address))
    }

    /// Listens on the first candidate that can be bound.
    pub fn listen(
        &self,
        addresses: &[BusAddress],
    ) -> Result<(Box<dyn Acceptor>, Arc<dyn TransportProvider>)> {
        self.each_candidate(addresses, |provider, address| provider.listen(address))
    }

    pub fn create_dynamic_session_address(
        &self,
        transport: &str,
        listening: bool,
    ) -> Result<BusAddress> {
        self.provider(transport)
            .ok_or_else(|| {
                Error::TransportConfiguration(format!("no provider for {:?}", transport))
            })?
            .create_dynamic_session_address(listening)
    }
}
