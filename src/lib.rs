//! A [D-Bus] implementation: the wire format, authentication, connections,
//! and a small bus daemon that can be embedded in a process.
//!
//! Messages live in the [`Message`] type, whose body is a list of
//! dynamically typed [`Value`]s. The [`wire`] module turns messages into
//! bytes and back, in either byte order, enforcing the alignment and size
//! rules of the protocol.
//!
//! Most code does not build bodies by hand. The [`ser`] module turns any
//! `Serialize` type into a body through [`to_body`], and [`from_body`]
//! reads one back into any `Deserialize` type. D-Bus allows the same data
//! to be sent in different shapes, and named structs in particular can go
//! out either as `a{sv}` dictionaries or as strongly typed structs; this
//! is configured via the [`serializer_policy`] module and
//! [`to_body_with_policy`].
//!
//! A [`Connection`] authenticates over a transport (unix socket or TCP
//! out of the box, see [`transport`]), registers with the bus, and from
//! then on multiplexes calls, replies and signals over the one stream.
//! Objects exported on a connection answer method calls and property
//! access. An [`EmbeddedDaemon`] routes between several connections the
//! way the system bus does, which is handy for tests and for private
//! buses.
//!
//! ```no_run
//! use dbus_core::connection::Connection;
//!
//! # fn main() -> dbus_core::error::Result<()> {
//! let bus = Connection::session()?;
//! let names = bus.list_names()?;
//! println!("{} is on a bus with {} names", bus.unique_name().unwrap_or_default(), names.len());
//! # Ok(())
//! # }
//! ```
//!
//! [D-Bus]: https://www.freedesktop.org/wiki/Software/dbus/
//! [`Message`]: crate::message::Message
//! [`Value`]: crate::value::Value
//! [`wire`]: crate::wire
//! [`ser`]: crate::ser
//! [`to_body`]: crate::ser::to_body()
//! [`from_body`]: crate::de::from_body()
//! [`serializer_policy`]: crate::ser::serializer_policy
//! [`to_body_with_policy`]: crate::ser::to_body_with_policy()
//! [`Connection`]: crate::connection::Connection
//! [`transport`]: crate::transport
//! [`EmbeddedDaemon`]: crate::daemon::EmbeddedDaemon

pub mod address;
mod align;
pub mod auth;
pub mod connection;
pub mod daemon;
pub mod de;
pub mod error;
pub mod match_rule;
pub mod message;
pub mod ser;
pub mod signature;
pub mod transport;
pub mod value;
pub mod wire;

pub use address::BusAddress;
pub use connection::{Connection, ConnectionConfig};
pub use daemon::{DaemonConfig, EmbeddedDaemon};
pub use error::{Error, Result};
pub use message::Message;
pub use value::Value;
