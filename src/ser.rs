use crate::error::{Error, Result};
use crate::signature::Type;
use crate::value::{Array, ObjectPath, Value, OBJECT_PATH_TOKEN};

use serde::{ser, Serialize};

pub mod serializer_policy;

use serializer_policy::{DefaultSerializerPolicy, SerializerPolicy, StructSerializationStyle};

/// This is the entry point to the serializer. It turns any
/// `Serialize` value into the arguments of a message body.
///
/// A tuple (or `()`) becomes one argument per element, so
/// `("Hi", 3u32)` yields a body with signature `su`. Anything else
/// becomes a single argument.
///
/// The default serialization policy, [`DefaultSerializerPolicy`],
/// serializes structs with named fields in dictionary style, as
/// `a{sv}` where the keys are the field names and the values are the
/// field values wrapped in variants, which is DBus's mechanism for
/// type erasure. `None` fields are left out of such dictionaries.
///
/// Instead, to always use struct-style serialization, as `zvariant`
/// does, you can use [`StronglyTypedSerializerPolicy`].
///
/// To make these decisions on a struct-by-struct basis, you can
/// create a custom implementation of the [`SerializerPolicy`] trait.
///
/// Sequences take the element type of their elements when all of them
/// agree, and fall back to `av` otherwise (including when empty).
///
/// [`DefaultSerializerPolicy`]: serializer_policy::DefaultSerializerPolicy
/// [`StronglyTypedSerializerPolicy`]: serializer_policy::StronglyTypedSerializerPolicy
/// [`SerializerPolicy`]: serializer_policy::SerializerPolicy
pub fn to_body_with_policy(
    value: impl Serialize,
    config: impl SerializerPolicy,
) -> Result<Vec<Value>> {
    match value.serialize(Serializer { config })? {
        Output::Tuple(values) => Ok(values),
        other => Ok(vec![other.into_value()?]),
    }
}

/// This is a convenience function that simply calls [`to_body_with_policy`]
/// with the default policy.
///
/// [`to_body_with_policy`]: to_body_with_policy
pub fn to_body(value: impl Serialize) -> Result<Vec<Value>> {
    to_body_with_policy(value, DefaultSerializerPolicy)
}

/// Serializes into exactly one value; tuples become structs.
pub fn to_value(value: impl Serialize) -> Result<Value> {
    value
        .serialize(Serializer {
            config: DefaultSerializerPolicy,
        })?
        .into_value()
}

enum Output {
    Value(Value),
    /// A tuple: several arguments at the top level, a struct elsewhere.
    Tuple(Vec<Value>),
    /// `None`, which only a dictionary field can leave out.
    Absent,
}

impl Output {
    fn into_value(self) -> Result<Value> {
        match self {
            Output::Value(value) => Ok(value),
            Output::Tuple(values) if values.is_empty() => Err(Error::Serializing(
                "unit has no representation inside a value".to_owned(),
            )),
            Output::Tuple(values) => Ok(Value::Struct(values)),
            Output::Absent => Err(Error::Serializing(
                "None is only representable as a missing dict field".to_owned(),
            )),
        }
    }
}

// Element type shared by every value, or variants if they disagree.
fn homogeneous(values: Vec<Value>) -> Array {
    let elem = values.first().map(Value::ty);
    match elem {
        Some(elem) if values.iter().all(|v| v.ty() == elem) => Array::from_parts(elem, values),
        _ => Array::from_parts(
            Type::Variant,
            values.into_iter().map(Value::variant).collect(),
        ),
    }
}

fn named_dict(entries: Vec<(&str, Value)>) -> Result<Value> {
    Value::dict(
        Type::String,
        Type::Variant,
        entries
            .into_iter()
            .map(|(name, value)| (Value::from(name), Value::variant(value))),
    )
}

struct Serializer<T: SerializerPolicy> {
    config: T,
}

impl<C: SerializerPolicy> Serializer<C> {
    fn nested(&self) -> Serializer<C> {
        Serializer {
            config: self.config.clone(),
        }
    }
}

fn serialize_nested<C: SerializerPolicy, T: Serialize + ?Sized>(
    config: &C,
    value: &T,
) -> Result<Output> {
    value.serialize(Serializer {
        config: config.clone(),
    })
}

impl<C: SerializerPolicy> ser::Serializer for Serializer<C> {
    type Ok = Output;
    type Error = Error;

    type SerializeSeq = SerializeSeq<C>;
    type SerializeTuple = SerializeTuple<C>;
    type SerializeTupleStruct = SerializeTuple<C>;
    type SerializeTupleVariant = SerializeTupleVariant<C>;
    type SerializeMap = SerializeMap<C>;
    type SerializeStruct = SerializeStruct<C>;
    type SerializeStructVariant = SerializeStructVariant<C>;

    fn serialize_bool(self, val: bool) -> Result<Output> {
        Ok(Output::Value(val.into()))
    }

    fn serialize_i8(self, val: i8) -> Result<Output> {
        Ok(Output::Value((val as i16).into()))
    }

    fn serialize_i16(self, val: i16) -> Result<Output> {
        Ok(Output::Value(val.into()))
    }

    fn serialize_i32(self, val: i32) -> Result<Output> {
        Ok(Output::Value(val.into()))
    }

    fn serialize_i64(self, val: i64) -> Result<Output> {
        Ok(Output::Value(val.into()))
    }

    fn serialize_u8(self, val: u8) -> Result<Output> {
        Ok(Output::Value(val.into()))
    }

    fn serialize_u16(self, val: u16) -> Result<Output> {
        Ok(Output::Value(val.into()))
    }

    fn serialize_u32(self, val: u32) -> Result<Output> {
        Ok(Output::Value(val.into()))
    }

    fn serialize_u64(self, val: u64) -> Result<Output> {
        Ok(Output::Value(val.into()))
    }

    fn serialize_f32(self, val: f32) -> Result<Output> {
        Ok(Output::Value((val as f64).into()))
    }

    fn serialize_f64(self, val: f64) -> Result<Output> {
        Ok(Output::Value(val.into()))
    }

    fn serialize_char(self, val: char) -> Result<Output> {
        Ok(Output::Value((val as u32).into()))
    }

    fn serialize_str(self, val: &str) -> Result<Output> {
        Ok(Output::Value(val.into()))
    }

    fn serialize_bytes(self, val: &[u8]) -> Result<Output> {
        Ok(Output::Value(val.to_vec().into()))
    }

    fn serialize_none(self) -> Result<Output> {
        Ok(Output::Absent)
    }

    fn serialize_some<T>(self, val: &T) -> Result<Output>
    where
        T: Serialize + ?Sized,
    {
        val.serialize(self)
    }

    fn serialize_unit(self) -> Result<Output> {
        Ok(Output::Tuple(Vec::new()))
    }

    fn serialize_unit_struct(self, _: &'static str) -> Result<Output> {
        self.serialize_unit()
    }

    fn serialize_unit_variant(
        self,
        _: &'static str,
        variant_index: u32,
        _: &'static str,
    ) -> Result<Output> {
        variant_index.serialize(self)
    }

    fn serialize_newtype_struct<T>(self, name: &'static str, value: &T) -> Result<Output>
    where
        T: Serialize + ?Sized,
    {
        let inner = value.serialize(self)?;
        if name != OBJECT_PATH_TOKEN {
            return Ok(inner);
        }
        match inner {
            Output::Value(Value::String(path)) => {
                Ok(Output::Value(Value::ObjectPath(ObjectPath::new(path)?)))
            }
            _ => Err(Error::Serializing(
                "object path must serialize as a string".to_owned(),
            )),
        }
    }

    fn serialize_newtype_variant<T>(
        self,
        _: &'static str,
        _: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<Output>
    where
        T: Serialize + ?Sized,
    {
        let item = value.serialize(self.nested())?.into_value()?;
        Ok(Output::Value(named_dict(vec![(variant, item)])?))
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<Self::SerializeSeq> {
        Ok(SerializeSeq {
            items: Vec::with_capacity(len.unwrap_or(0)),
            config: self.config,
        })
    }

    fn serialize_tuple(self, len: usize) -> Result<Self::SerializeTuple> {
        Ok(SerializeTuple {
            items: Vec::with_capacity(len),
            config: self.config,
        })
    }

    fn serialize_tuple_struct(
        self,
        _: &'static str,
        len: usize,
    ) -> Result<Self::SerializeTupleStruct> {
        self.serialize_tuple(len)
    }

    fn serialize_tuple_variant(
        self,
        _: &'static str,
        _: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<Self::SerializeTupleVariant> {
        Ok(SerializeTupleVariant {
            items: Vec::with_capacity(len),
            name: variant,
            config: self.config,
        })
    }

    fn serialize_map(self, _: Option<usize>) -> Result<Self::SerializeMap> {
        Ok(SerializeMap {
            entries: Vec::new(),
            pending_key: None,
            config: self.config,
        })
    }

    fn serialize_struct(self, name: &'static str, len: usize) -> Result<Self::SerializeStruct> {
        let style = self.config.query_struct_name(name);
        Ok(SerializeStruct {
            style,
            fields: Vec::with_capacity(len),
            config: self.config,
        })
    }

    fn serialize_struct_variant(
        self,
        _: &'static str,
        _: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<Self::SerializeStructVariant> {
        Ok(SerializeStructVariant {
            fields: Vec::with_capacity(len),
            name: variant,
            config: self.config,
        })
    }
}

struct SerializeSeq<T: SerializerPolicy> {
    items: Vec<Value>,
    config: T,
}

impl<C: SerializerPolicy> ser::SerializeSeq for SerializeSeq<C> {
    type Ok = Output;
    type Error = Error;

    fn serialize_element<T>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let item = serialize_nested(&self.config, value)?.into_value()?;
        self.items.push(item);
        Ok(())
    }

    fn end(self) -> Result<Output> {
        Ok(Output::Value(Value::Array(homogeneous(self.items))))
    }
}

struct SerializeTuple<T: SerializerPolicy> {
    items: Vec<Value>,
    config: T,
}

impl<C: SerializerPolicy> ser::SerializeTuple for SerializeTuple<C> {
    type Ok = Output;
    type Error = Error;

    fn serialize_element<T>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let item = serialize_nested(&self.config, value)?.into_value()?;
        self.items.push(item);
        Ok(())
    }

    fn end(self) -> Result<Output> {
        Ok(Output::Tuple(self.items))
    }
}

impl<C: SerializerPolicy> ser::SerializeTupleStruct for SerializeTuple<C> {
    type Ok = Output;
    type Error = Error;

    fn serialize_field<T>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        ser::SerializeTuple::serialize_element(self, value)
    }

    fn end(self) -> Result<Output> {
        // A tuple struct is one argument even at the top level.
        Output::Tuple(self.items).into_value().map(Output::Value)
    }
}

struct SerializeTupleVariant<T: SerializerPolicy> {
    items: Vec<Value>,
    name: &'static str,
    config: T,
}

impl<C: SerializerPolicy> ser::SerializeTupleVariant for SerializeTupleVariant<C> {
    type Ok = Output;
    type Error = Error;

    fn serialize_field<T>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let item = serialize_nested(&self.config, value)?.into_value()?;
        self.items.push(item);
        Ok(())
    }

    fn end(self) -> Result<Output> {
        let inner = Output::Tuple(self.items).into_value()?;
        Ok(Output::Value(named_dict(vec![(self.name, inner)])?))
    }
}

struct SerializeMap<T: SerializerPolicy> {
    entries: Vec<(Value, Value)>,
    pending_key: Option<Value>,
    config: T,
}

impl<C: SerializerPolicy> ser::SerializeMap for SerializeMap<C> {
    type Ok = Output;
    type Error = Error;

    fn serialize_key<T>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let key = serialize_nested(&self.config, value)?.into_value()?;
        if !key.ty().is_basic() {
            return Err(Error::Serializing(format!(
                "dict key of type {} is not a basic type",
                key.ty()
            )));
        }
        self.pending_key = Some(key);
        Ok(())
    }

    fn serialize_value<T>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let key = self
            .pending_key
            .take()
            .ok_or_else(|| Error::Serializing("map value without a key".to_owned()))?;
        match serialize_nested(&self.config, value)? {
            // Same treatment as optional struct fields.
            Output::Absent => (),
            other => self.entries.push((key, other.into_value()?)),
        }
        Ok(())
    }

    fn end(self) -> Result<Output> {
        let key_ty = match self.entries.first() {
            Some((key, _)) => key.ty(),
            None => Type::String,
        };
        let value_ty = match self.entries.first() {
            Some((_, value)) if self.entries.iter().all(|(_, v)| v.ty() == value.ty()) => {
                value.ty()
            }
            _ => Type::Variant,
        };
        let boxed = value_ty == Type::Variant;
        let entries = self.entries.into_iter().map(|(key, value)| {
            if boxed && value.ty() != Type::Variant {
                (key, Value::variant(value))
            } else {
                (key, value)
            }
        });
        Ok(Output::Value(Value::dict(key_ty, value_ty, entries)?))
    }
}

struct SerializeStruct<T: SerializerPolicy> {
    style: StructSerializationStyle,
    fields: Vec<(&'static str, Output)>,
    config: T,
}

impl<C: SerializerPolicy> ser::SerializeStruct for SerializeStruct<C> {
    type Ok = Output;
    type Error = Error;

    fn serialize_field<T>(&mut self, name: &'static str, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let item = serialize_nested(&self.config, value)?;
        self.fields.push((name, item));
        Ok(())
    }

    fn end(self) -> Result<Output> {
        match self.style {
            StructSerializationStyle::Dict => {
                let mut entries = Vec::with_capacity(self.fields.len());
                for (name, item) in self.fields {
                    match item {
                        Output::Absent => (),
                        other => entries.push((name, other.into_value()?)),
                    }
                }
                Ok(Output::Value(named_dict(entries)?))
            }
            StructSerializationStyle::StronglyTyped => {
                let members = self
                    .fields
                    .into_iter()
                    .map(|(_, item)| item.into_value())
                    .collect::<Result<Vec<_>>>()?;
                Output::Tuple(members).into_value().map(Output::Value)
            }
        }
    }
}

struct SerializeStructVariant<T: SerializerPolicy> {
    fields: Vec<(&'static str, Value)>,
    name: &'static str,
    config: T,
}

impl<C: SerializerPolicy> ser::SerializeStructVariant for SerializeStructVariant<C> {
    type Ok = Output;
    type Error = Error;

    fn serialize_field<T>(&mut self, name: &'static str, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        match serialize_nested(&self.config, value)? {
            Output::Absent => (),
            other => self.fields.push((name, other.into_value()?)),
        }
        Ok(())
    }

    fn end(self) -> Result<Output> {
        let inner = named_dict(self.fields)?;
        Ok(Output::Value(named_dict(vec![(self.name, inner)])?))
    }
}

#[cfg(test)]
mod tests {
    use crate::error::Result;
    use crate::message::Message;
    use crate::ser::serializer_policy::{
        NamedStructPolicy, StronglyTypedSerializerPolicy, StructSerializationStyle,
    };
    use crate::ser::{to_body, to_body_with_policy, to_value};
    use crate::value::{ObjectPath, Value};
    use crate::wire::encode;
    use serde::Serialize;
    use std::collections::{BTreeMap, HashMap};
    use test_log::test;

    fn body_bytes(body: Vec<Value>) -> Result<(String, Vec<u8>)> {
        let mut msg = Message::method_call(None, "/", None, "X")?.with_body(body);
        msg.serial = 1;
        let sig = msg.body_signature()?.to_string();
        let data = encode(&msg)?;
        let body_len = data[4] as usize;
        Ok((sig, data[data.len() - body_len..].to_vec()))
    }

    #[test]
    fn serialize_int() -> Result<()> {
        let (sig, data) = body_bytes(to_body(37i32)?)?;
        assert_eq!(sig, "i");
        assert_eq!(data, vec![37, 0, 0, 0], "i32 serialized incorrectly");
        Ok(())
    }

    #[test]
    fn serialize_tuple() -> Result<()> {
        let data = ("Hi", 0.2f64, ("Hello", 8.3f64));
        let (sig, bytes) = body_bytes(to_body(&data)?)?;
        assert_eq!(sig, "sd(sd)", "a top-level tuple is a list of arguments");
        assert_eq!(
            bytes,
            vec![
                2u8, 0u8, 0u8, 0u8, 72u8, 105u8, 0u8, 0u8, 154u8, 153u8, 153u8, 153u8, 153u8,
                153u8, 201u8, 63u8, 5u8, 0u8, 0u8, 0u8, 72u8, 101u8, 108u8, 108u8, 111u8, 0u8, 0u8,
                0u8, 0u8, 0u8, 0u8, 0u8, 154u8, 153u8, 153u8, 153u8, 153u8, 153u8, 32u8, 64u8,
            ],
        );
        Ok(())
    }

    #[test]
    fn serialize_struct() -> Result<()> {
        #[derive(Clone, Debug, Serialize)]
        struct StructSerialize {
            pub a: String,
            pub b: f64,
            pub c: (String, f64),
        }

        let data = StructSerialize {
            a: "Hi".to_owned(),
            b: 0.2,
            c: ("Hello".to_owned(), 8.3),
        };
        let value = to_body_with_policy(&data, StronglyTypedSerializerPolicy)?;
        assert_eq!(value.len(), 1);
        assert_eq!(value[0].ty().to_string(), "(sd(sd))");
        let tuple = to_value(("Hi", 0.2f64, ("Hello", 8.3f64)))?;
        assert_eq!(value[0], tuple);
        Ok(())
    }

    #[test]
    fn serialize_dict_simpler() -> Result<()> {
        #[derive(Clone, Debug, Serialize)]
        struct StructSerialize {
            pub a: String,
            pub b: f64,
        }

        let data = StructSerialize {
            a: "Hi".to_owned(),
            b: 0.2,
        };

        let (sig, bytes) = body_bytes(to_body(&data)?)?;
        assert_eq!(sig, "a{sv}");
        assert_eq!(
            bytes,
            vec![
                48, 0, 0, 0, // 48 bytes of array
                0, 0, 0, 0, // pad to 8 to start kv pair
                // 48 bytes start here
                1, 0, 0, 0, // key string is 1 byte
                97, 0, // 'a' with terminating null
                1, // value signature is 1 byte
                115, 0, // 's' for string with terminating null
                0, 0, 0, // padding to begin string length
                2, 0, 0, 0, // string in question is 2 bytes
                72, 105, 0, // "Hi" plus terminating null
                0, 0, 0, 0, 0, // pad to 8 to start kv pair
                1, 0, 0, 0, // key string is 1 byte
                98, 0, // 'b' with terminating null
                1, // signature is 1 byte
                100, 0, // 'd' with terminating null
                0, 0, 0, 0, 0, 0, 0, // pad to 8 for double value
                154, 153, 153, 153, 153, 153, 201, 63, // 0.2
            ],
            "dict serialized incorrectly"
        );
        Ok(())
    }

    #[test]
    fn optional_fields() -> Result<()> {
        #[derive(Clone, Debug, Serialize)]
        struct WithOptionalField {
            a: String,
            b: Option<String>,
            c: String,
        }

        #[derive(Clone, Debug, Serialize)]
        struct WithoutOptionalField {
            a: String,
            c: String,
        }

        let data_with = WithOptionalField {
            a: "a".to_owned(),
            b: None,
            c: "c".to_owned(),
        };
        let data_without = WithoutOptionalField {
            a: "a".to_owned(),
            c: "c".to_owned(),
        };

        assert_eq!(to_body(&data_with)?, to_body(&data_without)?);
        assert!(
            to_body_with_policy(&data_with, StronglyTypedSerializerPolicy).is_err(),
            "a struct member cannot be absent"
        );
        Ok(())
    }

    #[test]
    fn sequences_and_maps() -> Result<()> {
        assert_eq!(to_value(vec![1u32, 2, 3])?.ty().to_string(), "au");
        assert_eq!(to_value(Vec::<u32>::new())?.ty().to_string(), "av");
        assert_eq!(to_value(vec![1u8, 2])?.ty().to_string(), "ay");

        let mut map = BTreeMap::new();
        map.insert("one".to_owned(), 1i64);
        map.insert("two".to_owned(), 2i64);
        let value = to_value(&map)?;
        assert_eq!(value.ty().to_string(), "a{sx}");
        assert_eq!(value.dict_get("two"), Some(&Value::Int64(2)));
        Ok(())
    }

    #[test]
    fn maps_with_mixed_values() -> Result<()> {
        #[derive(Serialize)]
        #[serde(untagged)]
        enum Setting {
            Count(u32),
            Label(String),
        }

        let mut map = HashMap::new();
        map.insert("retries".to_owned(), Setting::Count(3));
        map.insert("name".to_owned(), Setting::Label("eth0".to_owned()));
        let value = to_value(&map)?;
        assert_eq!(value.ty().to_string(), "a{sv}");
        assert_eq!(value.dict_get("retries"), Some(&Value::variant(3u32)));
        assert_eq!(value.dict_get("name"), Some(&Value::variant("eth0")));
        let (sig, _) = body_bytes(vec![value])?;
        assert_eq!(sig, "a{sv}");
        Ok(())
    }

    #[test]
    fn enums() -> Result<()> {
        #[derive(Serialize)]
        enum Mode {
            Off,
            On,
            Level(u8),
        }

        assert_eq!(to_value(Mode::Off)?, Value::UInt32(0));
        assert_eq!(to_value(Mode::On)?, Value::UInt32(1));
        let level = to_value(Mode::Level(3))?;
        assert_eq!(level.ty().to_string(), "a{sv}");
        assert_eq!(level.dict_get("Level"), Some(&Value::variant(3u8)));
        Ok(())
    }

    #[test]
    fn object_paths_keep_their_type() -> Result<()> {
        let path = ObjectPath::new("/com/acme")?;
        assert_eq!(to_value(&path)?, Value::ObjectPath(path));
        assert!(to_body(()).map(|body| body.is_empty())?);
        Ok(())
    }

    #[test]
    fn per_struct_policy() -> Result<()> {
        #[derive(Serialize)]
        struct Point {
            x: i32,
            y: i32,
        }

        #[derive(Serialize)]
        struct Settings {
            name: String,
        }

        let policy = NamedStructPolicy::new().strongly_typed("Point");
        let point = to_body_with_policy(Point { x: 1, y: 2 }, policy.clone())?;
        assert_eq!(point[0].ty().to_string(), "(ii)");
        let settings = Settings {
            name: "n".to_owned(),
        };
        let settings_body = to_body_with_policy(&settings, policy)?;
        assert_eq!(settings_body[0].ty().to_string(), "a{sv}");
        let typed = to_body_with_policy(&settings, StructSerializationStyle::StronglyTyped)?;
        assert_eq!(typed[0].ty().to_string(), "(s)");
        Ok(())
    }
}
