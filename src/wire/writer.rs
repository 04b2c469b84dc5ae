use crate::align::pad_vec;
use crate::error::{Error, Result};
use crate::signature::{Type, MAX_SIGNATURE_LENGTH};
use crate::value::Value;
use byteorder::ByteOrder;
use log::trace;

use std::marker::PhantomData;

use super::MAX_ARRAY_LENGTH;

/// Appends marshalled values to a buffer whose offset 0 is the start of
/// the message (or any other 8-aligned position in it).
pub(super) struct Writer<B: ByteOrder> {
    buf: Vec<u8>,
    phantom: PhantomData<B>,
}

impl<B: ByteOrder> Writer<B> {
    pub(super) fn new() -> Self {
        Self {
            buf: Vec::new(),
            phantom: PhantomData,
        }
    }

    pub(super) fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub(super) fn align(&mut self, alignment: usize) {
        pad_vec(&mut self.buf, alignment);
    }

    pub(super) fn put_u8(&mut self, val: u8) {
        self.buf.push(val);
    }

    pub(super) fn put_u32(&mut self, val: u32) {
        self.align(4);
        let mut bytes = [0u8; 4];
        B::write_u32(&mut bytes, val);
        self.buf.extend_from_slice(&bytes);
    }

    pub(super) fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn put_fixed<const S: usize>(&mut self, write: impl FnOnce(&mut [u8])) {
        self.align(S);
        let mut bytes = [0u8; S];
        write(&mut bytes);
        self.buf.extend_from_slice(&bytes);
    }

    fn put_str(&mut self, s: &str) -> Result<()> {
        if s.as_bytes().contains(&0) {
            return Err(Error::Serializing(format!(
                "string {:?} contains a NUL byte",
                s
            )));
        }
        self.put_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
        Ok(())
    }

    pub(super) fn put_signature(&mut self, sig: &str) -> Result<()> {
        if sig.len() > MAX_SIGNATURE_LENGTH {
            return Err(Error::InvalidSignature(format!(
                "signature {:?} is too long",
                sig
            )));
        }
        self.buf.push(sig.len() as u8);
        self.buf.extend_from_slice(sig.as_bytes());
        self.buf.push(0);
        Ok(())
    }

    pub(super) fn write_value(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::Byte(b) => self.put_u8(*b),
            Value::Boolean(b) => self.put_u32(*b as u32),
            Value::Int16(i) => self.put_fixed::<2>(|out| B::write_i16(out, *i)),
            Value::UInt16(u) => self.put_fixed::<2>(|out| B::write_u16(out, *u)),
            Value::Int32(i) => self.put_fixed::<4>(|out| B::write_i32(out, *i)),
            Value::UInt32(u) => self.put_u32(*u),
            Value::Int64(i) => self.put_fixed::<8>(|out| B::write_i64(out, *i)),
            Value::UInt64(u) => self.put_fixed::<8>(|out| B::write_u64(out, *u)),
            Value::Double(d) => self.put_fixed::<8>(|out| B::write_f64(out, *d)),
            Value::String(s) => self.put_str(s)?,
            Value::ObjectPath(p) => self.put_str(p.as_str())?,
            Value::Signature(sig) => self.put_signature(&sig.to_string())?,
            Value::UnixFd(ix) => self.put_u32(*ix),
            Value::Array(array) => {
                self.align(4);
                let len_ix = self.buf.len();
                self.buf.extend_from_slice(&[0u8; 4]);
                // The length excludes the padding before the first element.
                self.align(array.elem_type().alignment());
                let start = self.buf.len();
                for item in array.items() {
                    self.write_value(item)?;
                }
                let len = self.buf.len() - start;
                if len > MAX_ARRAY_LENGTH {
                    return Err(Error::Serializing(format!(
                        "array of {} bytes exceeds the protocol limit",
                        len
                    )));
                }
                trace!("array of {} at {} is {} bytes", array.elem_type(), start, len);
                B::write_u32(&mut self.buf[len_ix..len_ix + 4], len as u32);
            }
            Value::Struct(members) => {
                if members.is_empty() {
                    return Err(Error::InvalidSignature("empty struct".to_owned()));
                }
                self.align(8);
                for member in members {
                    self.write_value(member)?;
                }
            }
            Value::DictEntry(key, val) => {
                self.align(8);
                self.write_value(key)?;
                self.write_value(val)?;
            }
            Value::Variant(inner) => {
                let sig = inner.ty().to_string();
                Type::parse_single(&sig)?;
                self.put_signature(&sig)?;
                self.write_value(inner)?;
            }
        }
        Ok(())
    }
}
