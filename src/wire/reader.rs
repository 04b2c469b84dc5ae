use crate::align::align;
use crate::error::{Error, Result};
use crate::signature::{Signature, Type};
use crate::value::{Array, ObjectPath, Value};
use byteorder::ByteOrder;
use log::trace;

use std::marker::PhantomData;
use std::str::from_utf8;

use super::MAX_ARRAY_LENGTH;

// Bounds recursion through nested variants, which the signature
// nesting limits do not cover.
const MAX_VARIANT_DEPTH: usize = 64;

pub(super) struct Reader<'de, B: ByteOrder> {
    data: &'de [u8],
    pub(super) data_ix: usize,
    phantom: PhantomData<B>,
}

fn malformed(what: String) -> Error {
    Error::MalformedMessage(what)
}

impl<'de, B: ByteOrder> Reader<'de, B> {
    pub(super) fn new(data: &'de [u8]) -> Self {
        Self {
            data,
            data_ix: 0,
            phantom: PhantomData,
        }
    }

    pub(super) fn align(&mut self, alignment: usize) -> Result<()> {
        let end = align(self.data_ix, alignment);
        if end > self.data.len() {
            return Err(malformed(format!("truncated in padding at {}", self.data_ix)));
        }
        if self.data[self.data_ix..end].iter().any(|b| *b != 0) {
            return Err(malformed(format!("non-zero padding at {}", self.data_ix)));
        }
        self.data_ix = end;
        Ok(())
    }

    pub(super) fn read(&mut self, len: usize) -> Result<&'de [u8]> {
        let old_ix = self.data_ix;
        let new_ix = old_ix
            .checked_add(len)
            .filter(|ix| *ix <= self.data.len())
            .ok_or_else(|| {
                malformed(format!("truncated: {} bytes wanted at {}", len, old_ix))
            })?;
        self.data_ix = new_ix;
        Ok(&self.data[old_ix..new_ix])
    }

    fn read_fixed<const S: usize>(&mut self) -> Result<&'de [u8]> {
        self.align(S)?;
        self.read(S)
    }

    pub(super) fn get_u8(&mut self) -> Result<u8> {
        Ok(self.read(1)?[0])
    }

    pub(super) fn get_u32(&mut self) -> Result<u32> {
        Ok(B::read_u32(self.read_fixed::<4>()?))
    }

    fn get_str(&mut self) -> Result<&'de str> {
        let size = self.get_u32()? as usize;
        let bytes = self.read(size)?;
        if self.get_u8()? != 0 {
            return Err(malformed("string is not NUL terminated".to_owned()));
        }
        if bytes.contains(&0) {
            return Err(malformed("string contains a NUL byte".to_owned()));
        }
        Ok(from_utf8(bytes)?)
    }

    pub(super) fn get_signature(&mut self) -> Result<Signature> {
        let size = self.get_u8()? as usize;
        let bytes = self.read(size)?;
        if self.get_u8()? != 0 {
            return Err(malformed("signature is not NUL terminated".to_owned()));
        }
        Signature::parse(from_utf8(bytes)?).map_err(|err| malformed(err.to_string()))
    }

    pub(super) fn read_value(&mut self, ty: &Type) -> Result<Value> {
        self.read_value_nested(ty, 0)
    }

    fn read_value_nested(&mut self, ty: &Type, depth: usize) -> Result<Value> {
        let value = match ty {
            Type::Byte => Value::Byte(self.get_u8()?),
            Type::Boolean => match self.get_u32()? {
                0 => Value::Boolean(false),
                1 => Value::Boolean(true),
                other => return Err(malformed(format!("boolean value {}", other))),
            },
            Type::Int16 => Value::Int16(B::read_i16(self.read_fixed::<2>()?)),
            Type::UInt16 => Value::UInt16(B::read_u16(self.read_fixed::<2>()?)),
            Type::Int32 => Value::Int32(B::read_i32(self.read_fixed::<4>()?)),
            Type::UInt32 => Value::UInt32(self.get_u32()?),
            Type::Int64 => Value::Int64(B::read_i64(self.read_fixed::<8>()?)),
            Type::UInt64 => Value::UInt64(B::read_u64(self.read_fixed::<8>()?)),
            Type::Double => Value::Double(B::read_f64(self.read_fixed::<8>()?)),
            Type::String => Value::String(self.get_str()?.to_owned()),
            Type::ObjectPath => {
                let path = self.get_str()?;
                Value::ObjectPath(
                    ObjectPath::new(path).map_err(|err| malformed(err.to_string()))?,
                )
            }
            Type::Signature => Value::Signature(self.get_signature()?),
            Type::UnixFd => Value::UnixFd(self.get_u32()?),
            Type::Array(elem) => {
                let len = self.get_u32()? as usize;
                if len > MAX_ARRAY_LENGTH {
                    return Err(malformed(format!("array of {} bytes", len)));
                }
                self.align(elem.alignment())?;
                let end_ix = self.data_ix + len;
                if end_ix > self.data.len() {
                    return Err(malformed(format!(
                        "array of {} bytes at {} runs past the end",
                        len, self.data_ix
                    )));
                }
                trace!("array of {} at {}, {} bytes", elem, self.data_ix, len);
                let mut items = Vec::new();
                while self.data_ix < end_ix {
                    items.push(self.read_value_nested(elem, depth)?);
                }
                if self.data_ix != end_ix {
                    return Err(malformed(format!(
                        "array element overran: {} > {}",
                        self.data_ix, end_ix
                    )));
                }
                Value::Array(Array::from_parts((**elem).clone(), items))
            }
            Type::Struct(members) => {
                self.align(8)?;
                let mut values = Vec::with_capacity(members.len());
                for member in members {
                    values.push(self.read_value_nested(member, depth)?);
                }
                Value::Struct(values)
            }
            Type::DictEntry(key, val) => {
                self.align(8)?;
                let key = self.read_value_nested(key, depth)?;
                let val = self.read_value_nested(val, depth)?;
                Value::DictEntry(Box::new(key), Box::new(val))
            }
            Type::Variant => {
                if depth >= MAX_VARIANT_DEPTH {
                    return Err(malformed("variants nested too deeply".to_owned()));
                }
                let sig = self.get_signature()?;
                let inner_ty = match sig.types() {
                    [single] => single.clone(),
                    _ => {
                        return Err(malformed(format!(
                            "variant signature {:?} is not a single type",
                            sig.to_string()
                        )))
                    }
                };
                Value::Variant(Box::new(self.read_value_nested(&inner_ty, depth + 1)?))
            }
        };
        Ok(value)
    }
}
