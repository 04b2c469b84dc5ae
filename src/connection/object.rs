//! Objects exported on a connection.
//!
//! An [`Interface`] is a table from member name to handler closure plus
//! a property table; an [`ExportedObject`] groups interfaces under one
//! path. Lookups are plain map accesses.

use crate::de::from_body;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::ser::to_body;
use crate::signature::Type;
use crate::value::{ObjectPath, Value};

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";
pub const PEER_INTERFACE: &str = "org.freedesktop.DBus.Peer";

pub(crate) const UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
pub(crate) const UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";
pub(crate) const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
const UNKNOWN_PROPERTY: &str = "org.freedesktop.DBus.Error.UnknownProperty";
const PROPERTY_READ_ONLY: &str = "org.freedesktop.DBus.Error.PropertyReadOnly";
const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";

pub type MethodHandler = Arc<dyn Fn(&Message) -> Result<Vec<Value>> + Send + Sync + 'static>;

pub(crate) fn remote(name: &str, message: impl Into<String>) -> Error {
    Error::Remote {
        name: name.to_owned(),
        message: message.into(),
    }
}

struct Property {
    value: Value,
    writable: bool,
}

pub struct Interface {
    name: String,
    methods: HashMap<String, MethodHandler>,
    properties: Mutex<BTreeMap<String, Property>>,
}

impl Interface {
    pub fn new(name: &str) -> Interface {
        Interface {
            name: name.to_owned(),
            methods: HashMap::new(),
            properties: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a handler working on raw body values.
    pub fn method<F>(mut self, member: &str, handler: F) -> Interface
    where
        F: Fn(&Message) -> Result<Vec<Value>> + Send + Sync + 'static,
    {
        self.methods.insert(member.to_owned(), Arc::new(handler));
        self
    }

    /// Adds a handler whose arguments and result go through serde, the
    /// same way [`from_body`] and [`to_body`] do.
    pub fn typed_method<A, R, F>(self, member: &str, handler: F) -> Interface
    where
        A: DeserializeOwned,
        R: Serialize,
        F: Fn(A) -> Result<R> + Send + Sync + 'static,
    {
        self.method(member, move |call| {
            let args = from_body::<A>(&call.body)
                .map_err(|err| remote(INVALID_ARGS, err.to_string()))?;
            to_body(handler(args)?)
        })
    }

    pub fn property(self, name: &str, value: impl Into<Value>, writable: bool) -> Interface {
        self.properties.lock().insert(
            name.to_owned(),
            Property {
                value: value.into(),
                writable,
            },
        );
        self
    }

    pub(crate) fn handler(&self, member: &str) -> Option<MethodHandler> {
        self.methods.get(member).cloned()
    }

    pub fn get_property(&self, name: &str) -> Result<Value> {
        self.properties
            .lock()
            .get(name)
            .map(|p| p.value.clone())
            .ok_or_else(|| remote(UNKNOWN_PROPERTY, format!("{}.{}", self.name, name)))
    }

    /// Updates a property from local code; writability only restricts peers.
    pub fn set_property(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        let mut properties = self.properties.lock();
        let property = properties
            .get_mut(name)
            .ok_or_else(|| remote(UNKNOWN_PROPERTY, format!("{}.{}", self.name, name)))?;
        property.value = value.into();
        Ok(())
    }

    fn remote_set(&self, name: &str, value: Value) -> Result<()> {
        let mut properties = self.properties.lock();
        let property = properties
            .get_mut(name)
            .ok_or_else(|| remote(UNKNOWN_PROPERTY, format!("{}.{}", self.name, name)))?;
        if !property.writable {
            return Err(remote(PROPERTY_READ_ONLY, format!("{}.{}", self.name, name)));
        }
        if value.ty() != property.value.ty() {
            return Err(remote(
                INVALID_ARGS,
                format!("{} has type {}, got {}", name, property.value.ty(), value.ty()),
            ));
        }
        property.value = value;
        Ok(())
    }

    fn all_properties(&self) -> Result<Value> {
        let entries: Vec<(Value, Value)> = self
            .properties
            .lock()
            .iter()
            .map(|(name, p)| (Value::from(name.as_str()), Value::variant(p.value.clone())))
            .collect();
        Value::dict(Type::String, Type::Variant, entries)
    }
}

#[derive(Default)]
pub struct ExportedObject {
    interfaces: BTreeMap<String, Arc<Interface>>,
}

impl ExportedObject {
    pub fn new() -> ExportedObject {
        ExportedObject::default()
    }

    pub fn with_interface(mut self, interface: Interface) -> ExportedObject {
        self.interfaces
            .insert(interface.name.clone(), Arc::new(interface));
        self
    }

    pub fn interface(&self, name: &str) -> Option<&Arc<Interface>> {
        self.interfaces.get(name)
    }

    fn find_interface(&self, name: &str) -> Result<&Arc<Interface>> {
        self.interfaces
            .get(name)
            .ok_or_else(|| remote(UNKNOWN_INTERFACE, format!("No such interface {}", name)))
    }

    /// Answers the `org.freedesktop.DBus.Properties` methods.
    fn properties_call(&self, call: &Message) -> Result<Vec<Value>> {
        let member = call.member().unwrap_or("");
        let iface_arg = call
            .string_arg(0)
            .ok_or_else(|| remote(INVALID_ARGS, "interface name expected"))?;
        let iface = self.find_interface(iface_arg)?;
        match member {
            "Get" => {
                let name = call
                    .string_arg(1)
                    .ok_or_else(|| remote(INVALID_ARGS, "property name expected"))?;
                Ok(vec![Value::variant(iface.get_property(name)?)])
            }
            "GetAll" => Ok(vec![iface.all_properties()?]),
            "Set" => {
                let name = call
                    .string_arg(1)
                    .ok_or_else(|| remote(INVALID_ARGS, "property name expected"))?;
                let value = call
                    .body
                    .get(2)
                    .and_then(Value::as_variant)
                    .ok_or_else(|| remote(INVALID_ARGS, "variant value expected"))?;
                iface.remote_set(name, value.clone())?;
                Ok(Vec::new())
            }
            _ => Err(remote(
                UNKNOWN_METHOD,
                format!("No such method {}.{}", PROPERTIES_INTERFACE, member),
            )),
        }
    }

    /// Finds the handler for `call` and runs it.
    pub(crate) fn invoke(&self, call: &Message) -> Result<Vec<Value>> {
        let member = call.member().unwrap_or("");
        match call.interface() {
            Some(PROPERTIES_INTERFACE) => self.properties_call(call),
            Some(name) => {
                let handler = self.find_interface(name)?.handler(member).ok_or_else(|| {
                    remote(UNKNOWN_METHOD, format!("No such method {}.{}", name, member))
                })?;
                handler(call)
            }
            None => {
                let handler = self
                    .interfaces
                    .values()
                    .find_map(|iface| iface.handler(member))
                    .ok_or_else(|| remote(UNKNOWN_METHOD, format!("No such method {}", member)))?;
                handler(call)
            }
        }
    }
}

#[derive(Default)]
pub(crate) struct ObjectRegistry {
    objects: RwLock<HashMap<ObjectPath, Arc<ExportedObject>>>,
}

impl ObjectRegistry {
    pub(crate) fn export(&self, path: ObjectPath, object: ExportedObject) {
        self.objects.write().insert(path, Arc::new(object));
    }

    pub(crate) fn unexport(&self, path: &ObjectPath) -> bool {
        self.objects.write().remove(path).is_some()
    }

    pub(crate) fn lookup(&self, path: &ObjectPath) -> Result<Arc<ExportedObject>> {
        self.objects
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| remote(UNKNOWN_OBJECT, format!("No object at {}", path)))
    }
}
