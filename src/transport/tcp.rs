//! `tcp:host=...,port=...` transport.

use super::{generate_guid, is_not_connected, Acceptor, Stream, TransportProvider};
use crate::address::BusAddress;
use crate::error::{Error, Result};
use log::debug;

use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};

pub const DEFAULT_HOST: &str = "localhost";

pub struct TcpProvider;

impl Stream for TcpStream {
    fn try_clone_box(&self) -> Result<Box<dyn Stream>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn shutdown(&self) -> Result<()> {
        match TcpStream::shutdown(self, Shutdown::Both) {
            Err(err) if !is_not_connected(&err) => Err(err.into()),
            _ => Ok(()),
        }
    }
}

fn port(address: &BusAddress, default: Option<u16>) -> Result<u16> {
    match address.get("port") {
        Some(port) => port
            .parse()
            .map_err(|_| Error::InvalidAddress(format!("bad port {:?}", port))),
        None => default.ok_or_else(|| {
            Error::TransportConfiguration(format!("{} has no port", address))
        }),
    }
}

struct TcpAcceptor {
    listener: TcpListener,
    host: String,
    closed: AtomicBool,
}

impl Acceptor for TcpAcceptor {
    fn accept(&self) -> Result<Box<dyn Stream>> {
        let (stream, peer) = self.listener.accept()?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Disconnected);
        }
        debug!("accepted tcp connection from {}", peer);
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Wake a thread blocked in accept.
        let local = self.listener.local_addr()?;
        let _ = TcpStream::connect(local);
        Ok(())
    }

    fn local_address(&self) -> BusAddress {
        let port = self
            .listener
            .local_addr()
            .map(|a| a.port().to_string())
            .unwrap_or_default();
        BusAddress::new("tcp")
            .with("host", &self.host)
            .with("port", &port)
    }
}

impl TransportProvider for TcpProvider {
    fn transport_name(&self) -> &str {
        "tcp"
    }

    fn connect(&self, address: &BusAddress) -> Result<Box<dyn Stream>> {
        let host = address.get("host").unwrap_or(DEFAULT_HOST);
        let port = port(address, None)?;
        let stream = TcpStream::connect((host, port))?;
        stream.set_nodelay(true)?;
        debug!("connected to {}:{}", host, port);
        Ok(Box::new(stream))
    }

    fn listen(&self, address: &BusAddress) -> Result<Box<dyn Acceptor>> {
        let host = address.get("host").unwrap_or(DEFAULT_HOST);
        let listener = TcpListener::bind((host, port(address, Some(0))?))?;
        debug!("listening on {}", listener.local_addr()?);
        Ok(Box::new(TcpAcceptor {
            listener,
            host: host.to_owned(),
            closed: AtomicBool::new(false),
        }))
    }

    fn create_dynamic_session_address(&self, listening: bool) -> Result<BusAddress> {
        // Reserve a free port by binding to it once.
        let port = TcpListener::bind((DEFAULT_HOST, 0))?.local_addr()?.port();
        let mut address = BusAddress::new("tcp")
            .with("host", DEFAULT_HOST)
            .with("port", &port.to_string());
        if listening {
            address = address.with("listen", "true");
        }
        Ok(address.with("guid", &generate_guid()))
    }
}
