//! `unix:` transport: `path=`, `abstract=` (Linux), and the listen-only
//! `tmpdir=`/`dir=` forms that pick a fresh socket name.

use super::{generate_guid, is_not_connected, Acceptor, Stream, TransportProvider};
use crate::address::BusAddress;
use crate::error::{Error, Result};
use log::{debug, warn};
use rand::distributions::Uniform;
use rand::Rng;

use std::env;
use std::fs;
use std::net::Shutdown;
use std::os::unix::net::{SocketAddr, UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

pub struct UnixProvider;

impl Stream for UnixStream {
    fn try_clone_box(&self) -> Result<Box<dyn Stream>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn shutdown(&self) -> Result<()> {
        match UnixStream::shutdown(self, Shutdown::Both) {
            Err(err) if !is_not_connected(&err) => Err(err.into()),
            _ => Ok(()),
        }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn peer_uid(&self) -> Option<u32> {
        use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
        getsockopt(self, PeerCredentials).ok().map(|cred| cred.uid())
    }
}

/// `dbus-` followed by ten random capital letters.
fn random_socket_name() -> String {
    let letters: String = rand::thread_rng()
        .sample_iter(Uniform::new_inclusive(b'A', b'Z'))
        .take(10)
        .map(char::from)
        .collect();
    format!("dbus-{}", letters)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn abstract_addr(name: &str) -> Result<SocketAddr> {
    use std::os::linux::net::SocketAddrExt;
    Ok(SocketAddr::from_abstract_name(name.as_bytes())?)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn abstract_addr(_name: &str) -> Result<SocketAddr> {
    Err(Error::TransportConfiguration(
        "abstract sockets are only available on Linux".to_owned(),
    ))
}

enum Location {
    Path(PathBuf),
    Abstract(String),
}

impl Location {
    fn for_connect(address: &BusAddress) -> Result<Location> {
        if let Some(path) = address.get("path") {
            Ok(Location::Path(path.into()))
        } else if let Some(name) = address.get("abstract") {
            Ok(Location::Abstract(name.to_owned()))
        } else {
            Err(Error::TransportConfiguration(format!(
                "{} has neither path nor abstract",
                address
            )))
        }
    }

    fn for_listen(address: &BusAddress) -> Result<Location> {
        if let Some(dir) = address.get("tmpdir").or_else(|| address.get("dir")) {
            return Ok(Location::Path(Path::new(dir).join(random_socket_name())));
        }
        Location::for_connect(address)
    }

    fn socket_addr(&self) -> Result<SocketAddr> {
        match self {
            Location::Path(path) => Ok(SocketAddr::from_pathname(path)?),
            Location::Abstract(name) => abstract_addr(name),
        }
    }

    fn to_address(&self) -> BusAddress {
        match self {
            Location::Path(path) => {
                BusAddress::new("unix").with("path", &path.to_string_lossy())
            }
            Location::Abstract(name) => BusAddress::new("unix").with("abstract", name),
        }
    }
}

struct UnixAcceptor {
    listener: UnixListener,
    location: Location,
    closed: AtomicBool,
}

impl Acceptor for UnixAcceptor {
    fn accept(&self) -> Result<Box<dyn Stream>> {
        let (stream, _) = self.listener.accept()?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Disconnected);
        }
        debug!("accepted unix connection");
        Ok(Box::new(stream))
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Wake a thread blocked in accept, then drop the socket file.
        let _ = UnixStream::connect_addr(&self.location.socket_addr()?);
        if let Location::Path(path) = &self.location {
            if let Err(err) = fs::remove_file(path) {
                warn!("could not remove socket {}: {}", path.display(), err);
            }
        }
        Ok(())
    }

    fn local_address(&self) -> BusAddress {
        self.location.to_address()
    }
}

impl Drop for UnixAcceptor {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl TransportProvider for UnixProvider {
    fn transport_name(&self) -> &str {
        "unix"
    }

    fn connect(&self, address: &BusAddress) -> Result<Box<dyn Stream>> {
        let location = Location::for_connect(address)?;
        let stream = UnixStream::connect_addr(&location.socket_addr()?)?;
        debug!("connected to {}", location.to_address());
        Ok(Box::new(stream))
    }

    fn listen(&self, address: &BusAddress) -> Result<Box<dyn Acceptor>> {
        let location = Location::for_listen(address)?;
        let listener = UnixListener::bind_addr(&location.socket_addr()?)?;
        debug!("listening on {}", location.to_address());
        Ok(Box::new(UnixAcceptor {
            listener,
            location,
            closed: AtomicBool::new(false),
        }))
    }

    fn create_dynamic_session_address(&self, listening: bool) -> Result<BusAddress> {
        let path = env::temp_dir().join(random_socket_name());
        let mut address = BusAddress::new("unix").with("path", &path.to_string_lossy());
        if listening {
            address = address.with("listen", "true");
        }
        Ok(address.with("guid", &generate_guid()))
    }
}

#[cfg(test)]
mod tests {
    use super::{random_socket_name, UnixProvider};
    use crate::address::BusAddress;
    use crate::error::{Error, Result};
    use crate::transport::TransportProvider;
    use std::io::{Read, Write};
    use std::thread;
    use test_log::test;

    #[test]
    fn socket_names() {
        let name = random_socket_name();
        assert_eq!(name.len(), 15);
        assert!(name.starts_with("dbus-"));
        assert!(name[5..].bytes().all(|b| b.is_ascii_uppercase()));
    }

    #[test]
    fn tmpdir_listen_and_connect() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let listen = BusAddress::new("unix").with("tmpdir", &dir.path().to_string_lossy());
        let acceptor = UnixProvider.listen(&listen)?;
        let local = acceptor.local_address();
        let path = local.get("path").map(str::to_owned).expect("no path");
        assert!(path.starts_with(&*dir.path().to_string_lossy()));

        let server = thread::spawn(move || -> Result<Option<u32>> {
            let mut stream = acceptor.accept()?;
            stream.write_all(b"ok")?;
            let uid = stream.peer_uid();
            acceptor.close()?;
            Ok(uid)
        });
        let mut client = UnixProvider.connect(&local)?;
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf)?;
        assert_eq!(&buf, b"ok");
        let uid = server.join().expect("server thread panicked")?;
        if cfg!(target_os = "linux") {
            assert_eq!(uid, Some(nix::unistd::getuid().as_raw()));
        }
        assert!(!std::path::Path::new(&path).exists());
        Ok(())
    }

    #[test]
    fn connect_needs_location() -> Result<()> {
        let addr = BusAddress::parse("unix:guid=abc")?;
        assert!(matches!(
            UnixProvider.connect(&addr).map(|_| ()),
            Err(Error::TransportConfiguration(_))
        ));
        Ok(())
    }

    #[test]
    fn dynamic_address() -> Result<()> {
        let addr = UnixProvider.create_dynamic_session_address(false)?;
        assert!(!addr.is_listening());
        assert!(addr.get("path").map_or(false, |p| p.contains("dbus-")));
        assert!(UnixProvider.create_dynamic_session_address(true)?.is_listening());
        Ok(())
    }
}
