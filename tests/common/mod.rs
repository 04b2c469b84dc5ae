#![allow(dead_code)]

use dbus_core::address::BusAddress;
use dbus_core::connection::object::{ExportedObject, Interface};
use dbus_core::connection::{Connection, ConnectionConfig};
use dbus_core::daemon::{DaemonConfig, EmbeddedDaemon};
use dbus_core::error::Result;
use dbus_core::message::Message;

use std::sync::mpsc::Receiver;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub const WAIT: Duration = Duration::from_secs(5);

/// A daemon on a unix socket in a scratch directory, which also holds
/// the cookie keyring so tests never touch the real one.
pub struct Bus {
    pub daemon: EmbeddedDaemon,
    pub dir: TempDir,
}

impl Bus {
    pub fn start() -> Result<Bus> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("bus");
        let address = BusAddress::new("unix").with("path", &path.to_string_lossy());
        let config = DaemonConfig::default().with_keyring_dir(dir.path().join("keyrings"));
        let daemon = EmbeddedDaemon::start_in_background(&address, config)?;
        Ok(Bus { daemon, dir })
    }

    pub fn config(&self) -> ConnectionConfig {
        ConnectionConfig::default()
            .with_default_timeout(WAIT)
            .with_keyring_dir(self.dir.path().join("keyrings"))
    }

    pub fn connect(&self) -> Result<Connection> {
        Connection::open(std::slice::from_ref(self.daemon.address()), self.config())
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        let _ = self.daemon.close();
    }
}

pub fn calculator() -> ExportedObject {
    ExportedObject::new().with_interface(
        Interface::new("com.acme.Calc")
            .typed_method("Add", |(a, b): (i32, i32)| Ok(a + b))
            .typed_method("Echo", |(s,): (String,)| Ok(s))
            .typed_method("Sleep", |(ms,): (u32,)| {
                thread::sleep(Duration::from_millis(ms.into()));
                Ok(())
            }),
    )
}

/// Waits for the first message on `rx` that `want` accepts.
pub fn wait_for<T>(rx: &Receiver<T>, want: impl Fn(&T) -> bool) -> Option<T> {
    let deadline = Instant::now() + WAIT;
    loop {
        let left = deadline.checked_duration_since(Instant::now())?;
        match rx.recv_timeout(left) {
            Ok(item) if want(&item) => return Some(item),
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

/// The string arguments of a signal.
pub fn string_args(msg: &Message) -> Vec<String> {
    (0..msg.body.len())
        .filter_map(|ix| msg.string_arg(ix).map(str::to_owned))
        .collect()
}
