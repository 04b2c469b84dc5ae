//! Dynamically typed D-Bus values.
//!
//! Every [`Value`] knows its own [`Type`], so a message body can compute
//! its signature from its values. Arrays carry their element type
//! explicitly, which keeps empty arrays encodable.

use crate::error::{Error, Result};
use crate::signature::{Signature, Type};

use serde::de::{self, Deserialize, Deserializer, Visitor};
use serde::ser::{Serialize, Serializer};

use std::fmt::{self, Display};

// Newtype name that lets our own serializer keep the `o` type.
pub(crate) const OBJECT_PATH_TOKEN: &str = "$dbus_core::ObjectPath";

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectPath(String);

impl ObjectPath {
    pub fn new(path: impl Into<String>) -> Result<ObjectPath> {
        let path = path.into();
        if !ObjectPath::is_valid(&path) {
            return Err(Error::InvalidObjectPath(path));
        }
        Ok(ObjectPath(path))
    }

    pub fn root() -> ObjectPath {
        ObjectPath("/".to_owned())
    }

    /// `/`, or `/`-separated non-empty segments of `[A-Za-z0-9_]`.
    pub fn is_valid(path: &str) -> bool {
        if path == "/" {
            return true;
        }
        match path.strip_prefix('/') {
            None => false,
            Some(rest) => rest.split('/').all(|segment| {
                !segment.is_empty()
                    && segment
                        .bytes()
                        .all(|b| b.is_ascii_alphanumeric() || b == b'_')
            }),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `self` equals `namespace` or lies below it.
    pub fn is_in_namespace(&self, namespace: &str) -> bool {
        if namespace == "/" || self.0 == namespace {
            return true;
        }
        self.0.starts_with(namespace) && self.0.as_bytes().get(namespace.len()) == Some(&b'/')
    }
}

impl Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for ObjectPath {
    type Error = Error;

    fn try_from(path: &str) -> Result<ObjectPath> {
        ObjectPath::new(path)
    }
}

impl Serialize for ObjectPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_newtype_struct(OBJECT_PATH_TOKEN, &self.0)
    }
}

struct ObjectPathVisitor;

impl<'de> Visitor<'de> for ObjectPathVisitor {
    type Value = ObjectPath;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an object path")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<ObjectPath, E> {
        ObjectPath::new(v).map_err(E::custom)
    }

    fn visit_newtype_struct<D: Deserializer<'de>>(
        self,
        deserializer: D,
    ) -> std::result::Result<ObjectPath, D::Error> {
        deserializer.deserialize_str(self)
    }
}

impl<'de> Deserialize<'de> for ObjectPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_newtype_struct(OBJECT_PATH_TOKEN, ObjectPathVisitor)
    }
}

/// A homogeneous array. The element type is fixed at construction.
#[derive(Clone, Debug, PartialEq)]
pub struct Array {
    elem: Type,
    items: Vec<Value>,
}

impl Array {
    pub fn new(elem: Type) -> Array {
        Array {
            elem,
            items: Vec::new(),
        }
    }

    pub fn from_values(elem: Type, items: Vec<Value>) -> Result<Array> {
        let mut array = Array::new(elem);
        for item in items {
            array.push(item)?;
        }
        Ok(array)
    }

    // Caller guarantees every item has type `elem`.
    pub(crate) fn from_parts(elem: Type, items: Vec<Value>) -> Array {
        Array { elem, items }
    }

    pub fn push(&mut self, item: Value) -> Result<()> {
        let ty = item.ty();
        if ty != self.elem {
            return Err(Error::InvalidSignature(format!(
                "array of {} cannot hold a {}",
                self.elem, ty
            )));
        }
        self.items.push(item);
        Ok(())
    }

    pub fn elem_type(&self) -> &Type {
        &self.elem
    }

    pub fn items(&self) -> &[Value] {
        &self.items
    }

    pub fn into_items(self) -> Vec<Value> {
        self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Byte(u8),
    Boolean(bool),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    String(String),
    ObjectPath(ObjectPath),
    Signature(Signature),
    /// Index into the out-of-band descriptor list of the message.
    UnixFd(u32),
    Array(Array),
    Struct(Vec<Value>),
    DictEntry(Box<Value>, Box<Value>),
    Variant(Box<Value>),
}

impl Value {
    pub fn ty(&self) -> Type {
        match self {
            Value::Byte(_) => Type::Byte,
            Value::Boolean(_) => Type::Boolean,
            Value::Int16(_) => Type::Int16,
            Value::UInt16(_) => Type::UInt16,
            Value::Int32(_) => Type::Int32,
            Value::UInt32(_) => Type::UInt32,
            Value::Int64(_) => Type::Int64,
            Value::UInt64(_) => Type::UInt64,
            Value::Double(_) => Type::Double,
            Value::String(_) => Type::String,
            Value::ObjectPath(_) => Type::ObjectPath,
            Value::Signature(_) => Type::Signature,
            Value::UnixFd(_) => Type::UnixFd,
            Value::Array(array) => Type::Array(Box::new(array.elem.clone())),
            Value::Struct(members) => Type::Struct(members.iter().map(Value::ty).collect()),
            Value::DictEntry(key, value) => {
                Type::DictEntry(Box::new(key.ty()), Box::new(value.ty()))
            }
            Value::Variant(_) => Type::Variant,
        }
    }

    pub fn array(elem: Type, items: Vec<Value>) -> Result<Value> {
        Ok(Value::Array(Array::from_values(elem, items)?))
    }

    /// Builds an `a{KV}` dictionary.
    pub fn dict(
        key: Type,
        value: Type,
        entries: impl IntoIterator<Item = (Value, Value)>,
    ) -> Result<Value> {
        if !key.is_basic() {
            return Err(Error::InvalidSignature(format!(
                "dict key type {} is not basic",
                key
            )));
        }
        let elem = Type::DictEntry(Box::new(key), Box::new(value));
        let mut array = Array::new(elem);
        for (k, v) in entries {
            array.push(Value::DictEntry(Box::new(k), Box::new(v)))?;
        }
        Ok(Value::Array(array))
    }

    pub fn variant(inner: impl Into<Value>) -> Value {
        Value::Variant(Box::new(inner.into()))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            Value::ObjectPath(p) => Some(p.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> Option<u8> {
        match self {
            Value::Byte(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::UInt32(u) => Some(*u),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int32(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt64(u) => Some(*u),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Array> {
        match self {
            Value::Array(array) => Some(array),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&[Value]> {
        match self {
            Value::Struct(members) => Some(members),
            _ => None,
        }
    }

    pub fn as_variant(&self) -> Option<&Value> {
        match self {
            Value::Variant(inner) => Some(inner),
            _ => None,
        }
    }

    /// Looks up a string key in an `a{s...}` dictionary.
    pub fn dict_get(&self, key: &str) -> Option<&Value> {
        self.as_array()?.items().iter().find_map(|entry| match entry {
            Value::DictEntry(k, v) if k.as_str() == Some(key) => Some(&**v),
            _ => None,
        })
    }
}

macro_rules! value_from {
    ($type:ty, $variant:ident) => {
        impl From<$type> for Value {
            fn from(val: $type) -> Value {
                Value::$variant(val)
            }
        }
    };
}

value_from!(u8, Byte);
value_from!(bool, Boolean);
value_from!(i16, Int16);
value_from!(u16, UInt16);
value_from!(i32, Int32);
value_from!(u32, UInt32);
value_from!(i64, Int64);
value_from!(u64, UInt64);
value_from!(f64, Double);
value_from!(String, String);
value_from!(ObjectPath, ObjectPath);
value_from!(Signature, Signature);

impl From<&str> for Value {
    fn from(val: &str) -> Value {
        Value::String(val.to_owned())
    }
}

impl From<Vec<String>> for Value {
    fn from(val: Vec<String>) -> Value {
        Value::Array(Array::from_parts(
            Type::String,
            val.into_iter().map(Value::String).collect(),
        ))
    }
}

impl From<Vec<u8>> for Value {
    fn from(val: Vec<u8>) -> Value {
        Value::Array(Array::from_parts(
            Type::Byte,
            val.into_iter().map(Value::Byte).collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::{ObjectPath, Value};
    use crate::error::Result;
    use crate::signature::Type;
    use test_log::test;

    #[test]
    fn object_path_validation() {
        for ok in &["/", "/a", "/com/acme/Foo", "/a_b/c1"] {
            assert!(ObjectPath::is_valid(ok), "{} should be valid", ok);
        }
        for bad in &["", "a", "/a/", "//", "/a//b", "/a-b", "/ä"] {
            assert!(!ObjectPath::is_valid(bad), "{} should be invalid", bad);
        }
    }

    #[test]
    fn namespaces() -> Result<()> {
        let path = ObjectPath::new("/com/acme/Foo")?;
        assert!(path.is_in_namespace("/com/acme"));
        assert!(path.is_in_namespace("/com/acme/Foo"));
        assert!(path.is_in_namespace("/"));
        assert!(!path.is_in_namespace("/com/ac"));
        Ok(())
    }

    #[test]
    fn types_of_values() -> Result<()> {
        let dict = Value::dict(
            Type::String,
            Type::Variant,
            vec![("a".into(), Value::variant(1u32))],
        )?;
        assert_eq!(dict.ty().to_string(), "a{sv}");
        let tuple = Value::Struct(vec![1u8.into(), "x".into(), dict]);
        assert_eq!(tuple.ty().to_string(), "(ysa{sv})");
        Ok(())
    }

    #[test]
    fn arrays_are_homogeneous() {
        assert!(Value::array(Type::Int32, vec![1i32.into(), 2u32.into()]).is_err());
        assert!(Value::array(Type::Int32, vec![]).is_ok());
    }

    #[test]
    fn dict_lookup() -> Result<()> {
        let dict = Value::dict(
            Type::String,
            Type::Variant,
            vec![
                ("a".into(), Value::variant(1u32)),
                ("b".into(), Value::variant("x")),
            ],
        )?;
        assert_eq!(
            dict.dict_get("b").and_then(Value::as_variant),
            Some(&Value::from("x"))
        );
        assert!(dict.dict_get("c").is_none());
        Ok(())
    }
}
