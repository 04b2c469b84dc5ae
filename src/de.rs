use crate::error::{Error, Result};
use crate::message::Message;
use crate::signature::Type;
use crate::value::Value;

use std::convert::TryInto;

use serde::de::{self, DeserializeSeed, EnumAccess, MapAccess, SeqAccess, VariantAccess, Visitor};
use serde::{forward_to_deserialize_any, Deserialize};

/// Deserializes the body of a message. See [`from_body`].
pub fn from_message<'a, T: Deserialize<'a>>(mesg: &'a Message) -> Result<T> {
    from_body(&mesg.body)
}

/// Deserializes a list of body arguments.
///
/// A single argument deserializes as itself. Several arguments
/// deserialize as a tuple (or a strongly typed struct), and an empty
/// body as `()`. Variants are unwrapped wherever they appear, and named
/// structs accept both `a{sv}` dictionaries and D-Bus structs.
pub fn from_body<'a, T: Deserialize<'a>>(body: &'a [Value]) -> Result<T> {
    T::deserialize(BodyDeserializer(body))
}

/// Deserializes a single value.
pub fn from_value<'a, T: Deserialize<'a>>(value: &'a Value) -> Result<T> {
    T::deserialize(Deserializer(value))
}

fn unexpected(value: &Value, wanted: &str) -> Error {
    Error::Deserializing(format!("expected {}, found {}", wanted, value.ty()))
}

struct BodyDeserializer<'de>(&'de [Value]);

impl<'de> BodyDeserializer<'de> {
    fn single(&self) -> Result<Deserializer<'de>> {
        match self.0 {
            [single] => Ok(Deserializer(single)),
            other => Err(Error::Deserializing(format!(
                "expected a single argument, body has {}",
                other.len()
            ))),
        }
    }
}

impl<'de> de::Deserializer<'de> for BodyDeserializer<'de> {
    type Error = Error;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        match self.0 {
            [] => visitor.visit_unit(),
            [single] => Deserializer(single).deserialize_any(visitor),
            many => visitor.visit_seq(StructDeserializer(many.iter())),
        }
    }

    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        if self.0.is_empty() {
            visitor.visit_none()
        } else {
            visitor.visit_some(self)
        }
    }

    fn deserialize_unit<V>(self, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        if !self.0.is_empty() {
            return Err(Error::Deserializing(format!(
                "expected an empty body, found {} arguments",
                self.0.len()
            )));
        }
        visitor.visit_unit()
    }

    fn deserialize_unit_struct<V>(self, _: &'static str, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        self.deserialize_unit(visitor)
    }

    fn deserialize_newtype_struct<V>(self, name: &'static str, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        de::Deserializer::deserialize_newtype_struct(self.single()?, name, visitor)
    }

    fn deserialize_tuple<V>(self, len: usize, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        match self.0 {
            [single @ Value::Struct(_)] if len != 1 => {
                Deserializer(single).deserialize_tuple(len, visitor)
            }
            many => visitor.visit_seq(StructDeserializer(many.iter())),
        }
    }

    fn deserialize_tuple_struct<V>(
        self,
        _: &'static str,
        len: usize,
        visitor: V,
    ) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        self.deserialize_tuple(len, visitor)
    }

    fn deserialize_struct<V>(
        self,
        name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        match self.0 {
            [single] => Deserializer(single).deserialize_struct(name, fields, visitor),
            many => visitor.visit_seq(StructDeserializer(many.iter())),
        }
    }

    fn deserialize_enum<V>(
        self,
        name: &'static str,
        variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        de::Deserializer::deserialize_enum(self.single()?, name, variants, visitor)
    }

    fn deserialize_bytes<V>(self, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        self.single()?.deserialize_bytes(visitor)
    }

    fn deserialize_byte_buf<V>(self, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        self.single()?.deserialize_byte_buf(visitor)
    }

    fn deserialize_char<V>(self, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        self.single()?.deserialize_char(visitor)
    }

    forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 str string
        seq map identifier ignored_any
    }
}

/// Deserializes from one [`Value`], looking through variants.
struct Deserializer<'de>(&'de Value);

impl<'de> Deserializer<'de> {
    fn possible_variant(self) -> Deserializer<'de> {
        let mut value = self.0;
        while let Value::Variant(inner) = value {
            value = inner;
        }
        Deserializer(value)
    }
}

impl<'de> de::Deserializer<'de> for Deserializer<'de> {
    type Error = Error;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        let de = self.possible_variant();
        match de.0 {
            Value::Byte(b) => visitor.visit_u8(*b),
            Value::Boolean(b) => visitor.visit_bool(*b),
            Value::Int16(i) => visitor.visit_i16(*i),
            Value::UInt16(u) => visitor.visit_u16(*u),
            Value::Int32(i) => visitor.visit_i32(*i),
            Value::UInt32(u) => visitor.visit_u32(*u),
            Value::Int64(i) => visitor.visit_i64(*i),
            Value::UInt64(u) => visitor.visit_u64(*u),
            Value::Double(d) => visitor.visit_f64(*d),
            Value::String(s) => visitor.visit_borrowed_str(s),
            Value::ObjectPath(p) => visitor.visit_borrowed_str(p.as_str()),
            Value::Signature(sig) => visitor.visit_string(sig.to_string()),
            Value::UnixFd(ix) => visitor.visit_u32(*ix),
            Value::Array(array) => match array.elem_type() {
                Type::DictEntry(..) => visitor.visit_map(DictDeserializer::new(array.items())),
                _ => visitor.visit_seq(StructDeserializer(array.items().iter())),
            },
            Value::Struct(members) => visitor.visit_seq(StructDeserializer(members.iter())),
            Value::DictEntry(key, val) => {
                let pair = [(**key).clone(), (**val).clone()];
                visitor.visit_seq(OwnedSeq(pair.into_iter()))
            }
            // Unwrapped above
            Value::Variant(_) => Err(unexpected(de.0, "a non-variant value")),
        }
    }

    fn deserialize_char<V>(self, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        let de = self.possible_variant();
        match de.0 {
            Value::UInt32(u) => {
                let c: char = (*u)
                    .try_into()
                    .map_err(|_| Error::Deserializing(format!("{} is not a char", u)))?;
                visitor.visit_char(c)
            }
            other => Err(unexpected(other, "u")),
        }
    }

    fn deserialize_bytes<V>(self, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        self.deserialize_byte_buf(visitor)
    }

    fn deserialize_byte_buf<V>(self, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        let de = self.possible_variant();
        match de.0 {
            Value::Array(array) => {
                let bytes = array
                    .items()
                    .iter()
                    .map(|item| item.as_u8().ok_or_else(|| unexpected(item, "y")))
                    .collect::<Result<Vec<u8>>>()?;
                visitor.visit_byte_buf(bytes)
            }
            other => Err(unexpected(other, "ay")),
        }
    }

    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        // Absence is expressed by a missing dict field, so any value present is `Some`.
        visitor.visit_some(self)
    }

    fn deserialize_unit<V>(self, _visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        Err(unexpected(self.0, "nothing"))
    }

    fn deserialize_unit_struct<V>(self, _: &'static str, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        self.deserialize_unit(visitor)
    }

    fn deserialize_newtype_struct<V>(self, _: &'static str, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_struct<V>(
        self,
        _: &'static str,
        _: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        let de = self.possible_variant();
        match de.0 {
            Value::Struct(members) => visitor.visit_seq(StructDeserializer(members.iter())),
            Value::Array(array) => visitor.visit_map(DictDeserializer::new(array.items())),
            other => Err(unexpected(other, "a struct or a{sv}")),
        }
    }

    fn deserialize_enum<V>(
        self,
        _: &'static str,
        _: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        let de = self.possible_variant();
        match de.0 {
            Value::UInt32(_) | Value::String(_) => visitor.visit_enum(EnumDeserializer {
                tag: de.0,
                content: None,
            }),
            Value::Array(array) => match array.items() {
                [Value::DictEntry(tag, content)] => visitor.visit_enum(EnumDeserializer {
                    tag,
                    content: Some(content),
                }),
                _ => Err(Error::Deserializing(
                    "enum dict must have exactly one entry".to_owned(),
                )),
            },
            other => Err(unexpected(other, "an enum")),
        }
    }

    fn deserialize_ignored_any<V>(self, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        visitor.visit_unit()
    }

    forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 str string
        seq tuple tuple_struct map identifier
    }
}

struct StructDeserializer<'de>(std::slice::Iter<'de, Value>);

impl<'de> SeqAccess<'de> for StructDeserializer<'de> {
    type Error = Error;

    fn next_element_seed<T>(&mut self, seed: T) -> Result<Option<T::Value>>
    where
        T: DeserializeSeed<'de>,
    {
        match self.0.next() {
            Some(value) => Ok(Some(seed.deserialize(Deserializer(value))?)),
            None => Ok(None),
        }
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.0.len())
    }
}

// The two halves of a lone dict entry, which have no borrowed home.
struct OwnedSeq<I: Iterator<Item = Value>>(I);

impl<'de, I: Iterator<Item = Value>> SeqAccess<'de> for OwnedSeq<I> {
    type Error = Error;

    fn next_element_seed<T>(&mut self, seed: T) -> Result<Option<T::Value>>
    where
        T: DeserializeSeed<'de>,
    {
        match self.0.next() {
            Some(value) => Ok(Some(seed.deserialize(OwnedDeserializer(value))?)),
            None => Ok(None),
        }
    }
}

struct OwnedDeserializer(Value);

impl<'de> de::Deserializer<'de> for OwnedDeserializer {
    type Error = Error;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        match self.0 {
            Value::Byte(b) => visitor.visit_u8(b),
            Value::Boolean(b) => visitor.visit_bool(b),
            Value::Int16(i) => visitor.visit_i16(i),
            Value::UInt16(u) => visitor.visit_u16(u),
            Value::Int32(i) => visitor.visit_i32(i),
            Value::UInt32(u) | Value::UnixFd(u) => visitor.visit_u32(u),
            Value::Int64(i) => visitor.visit_i64(i),
            Value::UInt64(u) => visitor.visit_u64(u),
            Value::Double(d) => visitor.visit_f64(d),
            Value::String(s) => visitor.visit_string(s),
            Value::ObjectPath(p) => visitor.visit_string(p.to_string()),
            Value::Signature(sig) => visitor.visit_string(sig.to_string()),
            Value::Variant(inner) => OwnedDeserializer(*inner).deserialize_any(visitor),
            Value::Struct(members) => visitor.visit_seq(OwnedSeq(members.into_iter())),
            Value::Array(array) => visitor.visit_seq(OwnedSeq(array.into_items().into_iter())),
            Value::DictEntry(key, val) => visitor.visit_seq(OwnedSeq(vec![*key, *val].into_iter())),
        }
    }

    forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf option unit unit_struct newtype_struct seq tuple
        tuple_struct map struct enum identifier ignored_any
    }
}

struct DictDeserializer<'de> {
    entries: std::slice::Iter<'de, Value>,
    value: Option<&'de Value>,
}

impl<'de> DictDeserializer<'de> {
    fn new(entries: &'de [Value]) -> Self {
        DictDeserializer {
            entries: entries.iter(),
            value: None,
        }
    }
}

impl<'de> MapAccess<'de> for DictDeserializer<'de> {
    type Error = Error;

    fn next_key_seed<K>(&mut self, seed: K) -> Result<Option<K::Value>>
    where
        K: DeserializeSeed<'de>,
    {
        match self.entries.next() {
            Some(Value::DictEntry(key, value)) => {
                self.value = Some(value);
                Ok(Some(seed.deserialize(Deserializer(key))?))
            }
            Some(other) => Err(unexpected(other, "a dict entry")),
            None => Ok(None),
        }
    }

    fn next_value_seed<V>(&mut self, seed: V) -> Result<V::Value>
    where
        V: DeserializeSeed<'de>,
    {
        let value = self
            .value
            .take()
            .ok_or_else(|| Error::Deserializing("dict value without a key".to_owned()))?;
        seed.deserialize(Deserializer(value))
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.entries.len())
    }
}

struct EnumDeserializer<'de> {
    tag: &'de Value,
    content: Option<&'de Value>,
}

impl<'de> EnumAccess<'de> for EnumDeserializer<'de> {
    type Error = Error;
    type Variant = Self;

    fn variant_seed<V>(self, seed: V) -> Result<(V::Value, Self::Variant)>
    where
        V: DeserializeSeed<'de>,
    {
        seed.deserialize(Deserializer(self.tag)).map(|v| (v, self))
    }
}

impl<'de> EnumDeserializer<'de> {
    fn content(&self) -> Result<Deserializer<'de>> {
        self.content
            .map(Deserializer)
            .ok_or_else(|| Error::Deserializing("enum variant has no content".to_owned()))
    }
}

impl<'de> VariantAccess<'de> for EnumDeserializer<'de> {
    type Error = Error;

    fn unit_variant(self) -> Result<()> {
        Ok(())
    }

    fn newtype_variant_seed<T>(self, seed: T) -> Result<T::Value>
    where
        T: DeserializeSeed<'de>,
    {
        seed.deserialize(self.content()?)
    }

    fn tuple_variant<V>(self, len: usize, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        de::Deserializer::deserialize_tuple(self.content()?, len, visitor)
    }

    fn struct_variant<V>(self, fields: &'static [&'static str], visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        de::Deserializer::deserialize_struct(self.content()?, "", fields, visitor)
    }
}
