//! Calling a remote interface through a declared description of its
//! methods, so argument and reply signatures are checked on both ends.

use super::object::{remote, PROPERTIES_INTERFACE, UNKNOWN_METHOD};
use super::Connection;
use crate::de::from_body;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::ser::serializer_policy::StructSerializationStyle;
use crate::ser::to_body_with_policy;
use crate::signature::Signature;
use crate::value::{ObjectPath, Value};

use serde::de::DeserializeOwned;
use serde::Serialize;

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodSpec {
    pub name: String,
    pub input: Signature,
    pub output: Signature,
}

/// The methods of one interface, with their signatures.
#[derive(Clone, Debug, Default)]
pub struct InterfaceSpec {
    pub name: String,
    methods: BTreeMap<String, MethodSpec>,
}

impl InterfaceSpec {
    pub fn new(name: &str) -> InterfaceSpec {
        InterfaceSpec {
            name: name.to_owned(),
            methods: BTreeMap::new(),
        }
    }

    /// Declares a method; `input` and `output` are signature strings.
    pub fn method(mut self, name: &str, input: &str, output: &str) -> Result<InterfaceSpec> {
        let spec = MethodSpec {
            name: name.to_owned(),
            input: Signature::from_str(input)?,
            output: Signature::from_str(output)?,
        };
        self.methods.insert(name.to_owned(), spec);
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&MethodSpec> {
        self.methods.get(name)
    }
}

/// A declared interface on one remote object.
#[derive(Clone)]
pub struct RemoteInterface {
    conn: Connection,
    destination: Option<String>,
    path: ObjectPath,
    spec: Arc<InterfaceSpec>,
    timeout: Duration,
    style: StructSerializationStyle,
}

fn check(what: &str, member: &str, expected: &Signature, body: &[Value]) -> Result<()> {
    let actual = Signature::from_types(body.iter().map(Value::ty).collect())?;
    if &actual != expected {
        return Err(Error::InvalidSignature(format!(
            "{} of {}: expected {:?}, got {:?}",
            what,
            member,
            expected.to_string(),
            actual.to_string()
        )));
    }
    Ok(())
}

impl RemoteInterface {
    pub fn bind(
        conn: &Connection,
        destination: Option<&str>,
        path: &str,
        spec: InterfaceSpec,
    ) -> Result<RemoteInterface> {
        Ok(RemoteInterface {
            conn: conn.clone(),
            destination: destination.map(str::to_owned),
            path: ObjectPath::new(path)?,
            spec: Arc::new(spec),
            timeout: conn.config().default_timeout(),
            style: StructSerializationStyle::Dict,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> RemoteInterface {
        self.timeout = timeout;
        self
    }

    /// How structs passed to [`RemoteInterface::call`] are encoded;
    /// `a{sv}` unless set.
    pub fn with_struct_style(mut self, style: StructSerializationStyle) -> RemoteInterface {
        self.style = style;
        self
    }

    pub fn spec(&self) -> &InterfaceSpec {
        &self.spec
    }

    fn message(&self, interface: &str, member: &str) -> Result<Message> {
        Message::method_call(
            self.destination.as_deref(),
            self.path.as_str(),
            Some(interface),
            member,
        )
    }

    pub fn call_values(&self, member: &str, args: Vec<Value>) -> Result<Vec<Value>> {
        let method = self.spec.get(member).ok_or_else(|| {
            remote(
                UNKNOWN_METHOD,
                format!("{} declares no method {}", self.spec.name, member),
            )
        })?;
        check("arguments", member, &method.input, &args)?;
        let msg = self.message(&self.spec.name, member)?.with_body(args);
        let reply = self.conn.call_with_timeout(msg, self.timeout)?;
        check("reply", member, &method.output, &reply.body)?;
        Ok(reply.body)
    }

    pub fn call<A, R>(&self, member: &str, args: A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let body = self.call_values(member, to_body_with_policy(args, self.style)?)?;
        from_body(&body)
    }

    pub fn get_property(&self, name: &str) -> Result<Value> {
        let msg = self
            .message(PROPERTIES_INTERFACE, "Get")?
            .with_arg(self.spec.name.as_str())
            .with_arg(name);
        let reply = self.conn.call_with_timeout(msg, self.timeout)?;
        match reply.body.into_iter().next() {
            Some(Value::Variant(value)) => Ok(*value),
            other => Err(Error::Deserializing(format!(
                "Properties.Get replied {:?}",
                other
            ))),
        }
    }

    pub fn set_property(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        let msg = self
            .message(PROPERTIES_INTERFACE, "Set")?
            .with_arg(self.spec.name.as_str())
            .with_arg(name)
            .with_arg(Value::variant(value.into()));
        self.conn.call_with_timeout(msg, self.timeout)?;
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::{InterfaceSpec, RemoteInterface};
    use crate::auth::AuthServer;
    use crate::connection::object::{ExportedObject, Interface};
    use crate::connection::{Connection, ConnectionConfig};
    use crate::error::{Error, Result};
    use crate::ser::serializer_policy::StructSerializationStyle;
    use crate::transport::generate_guid;
    use crate::value::Value;
    use serde::{Deserialize, Serialize};
    use std::os::unix::net::UnixStream;
    use std::thread;
    use test_log::test;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Point {
        x: i32,
        y: i32,
    }

    fn connect(object: ExportedObject) -> Result<(Connection, Connection)> {
        let (a, b) = UnixStream::pair()?;
        let server = thread::spawn(move || -> Result<Connection> {
            let conn = Connection::accept_peer(
                Box::new(b),
                &AuthServer::new(&generate_guid()),
                ConnectionConfig::default(),
            )?;
            conn.export_object("/shapes", object)?;
            Ok(conn)
        });
        let client = Connection::from_stream(
            Box::new(a),
            false,
            ConnectionConfig::default().with_register_with_bus(false),
        )?;
        let server = server.join().expect("server thread panicked")?;
        Ok((client, server))
    }

    fn spec() -> Result<InterfaceSpec> {
        InterfaceSpec::new("com.acme.Shapes")
            .method("Shift", "(ii)i", "a{sv}")?
            .method("Name", "", "s")?
            .method("Broken", "", "s")
    }

    fn shapes() -> ExportedObject {
        ExportedObject::new().with_interface(
            Interface::new("com.acme.Shapes")
                .typed_method("Shift", |(p, by): (Point, i32)| {
                    Ok(Point {
                        x: p.x + by,
                        y: p.y + by,
                    })
                })
                .typed_method("Name", |(): ()| Ok("square".to_owned()))
                .typed_method("Broken", |(): ()| Ok(7u32))
                .property("Sides", 4u32, true),
        )
    }

    #[test]
    fn typed_calls() -> Result<()> {
        let (client, server) = connect(shapes())?;
        let proxy = RemoteInterface::bind(&client, None, "/shapes", spec()?)?
            .with_struct_style(StructSerializationStyle::StronglyTyped);
        let moved: Point = proxy.call("Shift", (Point { x: 1, y: 2 }, 10i32))?;
        assert_eq!(moved, Point { x: 11, y: 12 });
        let name: String = proxy.call("Name", ())?;
        assert_eq!(name, "square");

        assert!(matches!(
            proxy.call_values("Shift", vec![Value::from("wrong")]),
            Err(Error::InvalidSignature(_))
        ));
        assert!(matches!(
            proxy.call_values("Broken", vec![]),
            Err(Error::InvalidSignature(_))
        ));
        match proxy.call_values("Missing", vec![]) {
            Err(Error::Remote { name, .. }) => {
                assert_eq!(name, "org.freedesktop.DBus.Error.UnknownMethod")
            }
            other => panic!("unexpected {:?}", other),
        }
        client.close()?;
        server.close()?;
        Ok(())
    }

    #[test]
    fn properties() -> Result<()> {
        let (client, server) = connect(shapes())?;
        let proxy = RemoteInterface::bind(&client, None, "/shapes", spec()?)?;
        assert_eq!(proxy.get_property("Sides")?, Value::UInt32(4));
        proxy.set_property("Sides", 5u32)?;
        assert_eq!(proxy.get_property("Sides")?, Value::UInt32(5));
        assert!(proxy.set_property("Sides", "five").is_err());
        assert!(proxy.get_property("Corners").is_err());
        client.close()?;
        server.close()?;
        Ok(())
    }
}
