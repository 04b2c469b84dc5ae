//! Marshalling of whole messages to and from the D-Bus wire format.
//!
//! [`encode`] and [`decode`] work on complete frames. [`read_message`]
//! and [`write_message`] add stream framing on top: the fixed 16-byte
//! prefix of every message is enough to know how many more bytes belong
//! to it.
//!
//! Every value is aligned relative to the start of the message. The
//! body always begins on an 8-byte boundary, so the body is marshalled
//! on its own and appended after the padded header.

use crate::align::align;
use crate::error::{Error, Result};
use crate::message::{
    Endian, Flags, HeaderFields, Message, MessageType, FIELD_DESTINATION, FIELD_ERROR_NAME,
    FIELD_INTERFACE, FIELD_MEMBER, FIELD_PATH, FIELD_REPLY_SERIAL, FIELD_SENDER,
    FIELD_SIGNATURE, FIELD_UNIX_FDS, PROTOCOL_VERSION,
};
use crate::signature::{Signature, Type};
use crate::value::{Array, Value};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use log::trace;

use std::io::{Read, Write};

mod reader;
mod writer;

use reader::Reader;
use writer::Writer;

pub const MAX_MESSAGE_LENGTH: usize = 1 << 27;
pub const MAX_ARRAY_LENGTH: usize = 1 << 26;

/// Size of the part of the header that every message starts with.
pub const FIXED_HEADER_LENGTH: usize = 16;

fn header_fields_type() -> Type {
    Type::Array(Box::new(Type::Struct(vec![Type::Byte, Type::Variant])))
}

pub fn encode(msg: &Message) -> Result<Vec<u8>> {
    match msg.endian {
        Endian::Little => encode_with::<LittleEndian>(msg),
        Endian::Big => encode_with::<BigEndian>(msg),
    }
}

fn header_field_values(fields: &HeaderFields, body_sig: &Signature) -> Vec<Value> {
    let mut out = Vec::new();
    let mut push = |code: u8, value: Value| {
        out.push(Value::Struct(vec![Value::Byte(code), Value::variant(value)]));
    };
    if let Some(path) = &fields.path {
        push(FIELD_PATH, Value::ObjectPath(path.clone()));
    }
    if let Some(interface) = &fields.interface {
        push(FIELD_INTERFACE, Value::from(interface.as_str()));
    }
    if let Some(member) = &fields.member {
        push(FIELD_MEMBER, Value::from(member.as_str()));
    }
    if let Some(error_name) = &fields.error_name {
        push(FIELD_ERROR_NAME, Value::from(error_name.as_str()));
    }
    if let Some(reply_serial) = fields.reply_serial {
        push(FIELD_REPLY_SERIAL, Value::UInt32(reply_serial));
    }
    if let Some(destination) = &fields.destination {
        push(FIELD_DESTINATION, Value::from(destination.as_str()));
    }
    if let Some(sender) = &fields.sender {
        push(FIELD_SENDER, Value::from(sender.as_str()));
    }
    if !body_sig.is_empty() {
        push(FIELD_SIGNATURE, Value::Signature(body_sig.clone()));
    }
    if let Some(unix_fds) = fields.unix_fds {
        push(FIELD_UNIX_FDS, Value::UInt32(unix_fds));
    }
    out
}

fn encode_with<B: ByteOrder>(msg: &Message) -> Result<Vec<u8>> {
    if msg.serial == 0 {
        return Err(Error::MalformedMessage(
            "message has no serial assigned".to_owned(),
        ));
    }
    msg.validate()?;
    let body_sig = msg.body_signature()?;

    let mut body = Writer::<B>::new();
    for value in &msg.body {
        body.write_value(value)?;
    }
    let body = body.into_inner();

    let mut w = Writer::<B>::new();
    w.put_u8(msg.endian.marker());
    w.put_u8(msg.message_type.code());
    w.put_u8(msg.flags.bits());
    w.put_u8(PROTOCOL_VERSION);
    w.put_u32(body.len() as u32);
    w.put_u32(msg.serial);
    let fields = Array::from_values(
        Type::Struct(vec![Type::Byte, Type::Variant]),
        header_field_values(&msg.fields, &body_sig),
    )?;
    w.write_value(&Value::Array(fields))?;
    w.align(8);
    w.extend(&body);

    let out = w.into_inner();
    if out.len() > MAX_MESSAGE_LENGTH {
        return Err(Error::Serializing(format!(
            "message of {} bytes exceeds the protocol limit",
            out.len()
        )));
    }
    trace!(
        "encoded {} serial {} ({} bytes, body {})",
        msg.message_type.as_str(),
        msg.serial,
        out.len(),
        body_sig
    );
    Ok(out)
}

pub fn decode(data: &[u8]) -> Result<Message> {
    if data.len() < FIXED_HEADER_LENGTH {
        return Err(Error::MalformedMessage(format!(
            "{} bytes is shorter than a message header",
            data.len()
        )));
    }
    match Endian::from_marker(data[0]) {
        Some(Endian::Little) => decode_with::<LittleEndian>(data, Endian::Little),
        Some(Endian::Big) => decode_with::<BigEndian>(data, Endian::Big),
        None => Err(Error::MalformedMessage(format!(
            "unknown endian marker {:#04x}",
            data[0]
        ))),
    }
}

fn field_mismatch(code: u8, value: &Value) -> Error {
    Error::MalformedMessage(format!(
        "header field {} has unexpected type {}",
        code,
        value.ty()
    ))
}

fn decode_header_fields(fields: Value) -> Result<(HeaderFields, Signature)> {
    let mut out = HeaderFields::default();
    let mut body_sig = Signature::empty();
    let entries = match fields {
        Value::Array(array) => array.into_items(),
        other => return Err(field_mismatch(0, &other)),
    };
    for entry in entries {
        let (code, value) = match entry {
            Value::Struct(mut members) if members.len() == 2 => {
                let value = members.pop();
                let code = members.pop();
                match (code, value) {
                    (Some(Value::Byte(code)), Some(Value::Variant(value))) => (code, *value),
                    _ => {
                        return Err(Error::MalformedMessage(
                            "header field is not (yv)".to_owned(),
                        ))
                    }
                }
            }
            _ => {
                return Err(Error::MalformedMessage(
                    "header field is not (yv)".to_owned(),
                ))
            }
        };
        match (code, value) {
            (FIELD_PATH, Value::ObjectPath(path)) => out.path = Some(path),
            (FIELD_INTERFACE, Value::String(s)) => out.interface = Some(s),
            (FIELD_MEMBER, Value::String(s)) => out.member = Some(s),
            (FIELD_ERROR_NAME, Value::String(s)) => out.error_name = Some(s),
            (FIELD_REPLY_SERIAL, Value::UInt32(u)) => out.reply_serial = Some(u),
            (FIELD_DESTINATION, Value::String(s)) => out.destination = Some(s),
            (FIELD_SENDER, Value::String(s)) => out.sender = Some(s),
            (FIELD_SIGNATURE, Value::Signature(sig)) => body_sig = sig,
            (FIELD_UNIX_FDS, Value::UInt32(u)) => out.unix_fds = Some(u),
            (FIELD_PATH..=FIELD_UNIX_FDS, value) => return Err(field_mismatch(code, &value)),
            (unknown, _) => trace!("skipping unknown header field {}", unknown),
        }
    }
    Ok((out, body_sig))
}

fn decode_with<B: ByteOrder>(data: &[u8], endian: Endian) -> Result<Message> {
    let mut r = Reader::<B>::new(data);
    r.get_u8()?;
    let kind = r.get_u8()?;
    let message_type = MessageType::from_code(kind)
        .ok_or_else(|| Error::MalformedMessage(format!("unknown message type {}", kind)))?;
    let flags = Flags::from_bits(r.get_u8()?);
    let version = r.get_u8()?;
    if version != PROTOCOL_VERSION {
        return Err(Error::MalformedMessage(format!(
            "unsupported protocol version {}",
            version
        )));
    }
    let body_len = r.get_u32()? as usize;
    let serial = r.get_u32()?;
    if serial == 0 {
        return Err(Error::MalformedMessage("serial is zero".to_owned()));
    }

    let fields = r.read_value(&header_fields_type())?;
    let (fields, body_sig) = decode_header_fields(fields)?;
    r.align(8)?;

    let body_start = r.data_ix;
    if body_start + body_len != data.len() {
        return Err(Error::MalformedMessage(format!(
            "declared body length {} does not match the {} bytes present",
            body_len,
            data.len() - body_start
        )));
    }
    if body_len > 0 && body_sig.is_empty() {
        return Err(Error::MalformedMessage(
            "message has a body but no signature".to_owned(),
        ));
    }
    let mut body = Vec::with_capacity(body_sig.len());
    for ty in body_sig.types() {
        body.push(r.read_value(ty)?);
    }
    if r.data_ix != data.len() {
        return Err(Error::MalformedMessage(format!(
            "{} bytes left over after the body",
            data.len() - r.data_ix
        )));
    }

    let msg = Message {
        endian,
        message_type,
        flags,
        serial,
        fields,
        body,
    };
    msg.validate()?;
    Ok(msg)
}

/// Total frame length announced by the fixed part of a header.
pub fn frame_length(prefix: &[u8]) -> Result<usize> {
    if prefix.len() < FIXED_HEADER_LENGTH {
        return Err(Error::MalformedMessage("short header prefix".to_owned()));
    }
    let (body_len, fields_len) = match Endian::from_marker(prefix[0]) {
        Some(Endian::Little) => (
            LittleEndian::read_u32(&prefix[4..8]),
            LittleEndian::read_u32(&prefix[12..16]),
        ),
        Some(Endian::Big) => (
            BigEndian::read_u32(&prefix[4..8]),
            BigEndian::read_u32(&prefix[12..16]),
        ),
        None => {
            return Err(Error::MalformedMessage(format!(
                "unknown endian marker {:#04x}",
                prefix[0]
            )))
        }
    };
    let total = align(FIXED_HEADER_LENGTH + fields_len as usize, 8) + body_len as usize;
    if total > MAX_MESSAGE_LENGTH {
        return Err(Error::MalformedMessage(format!(
            "announced message length {} exceeds the protocol limit",
            total
        )));
    }
    Ok(total)
}

/// Reads exactly one message from a byte stream.
pub fn read_message<R: Read + ?Sized>(reader: &mut R) -> Result<Message> {
    let mut buf = vec![0u8; FIXED_HEADER_LENGTH];
    reader.read_exact(&mut buf)?;
    let total = frame_length(&buf)?;
    buf.resize(total, 0);
    reader.read_exact(&mut buf[FIXED_HEADER_LENGTH..])?;
    trace!("read frame of {} bytes", total);
    decode(&buf)
}

pub fn write_message<W: Write + ?Sized>(writer: &mut W, msg: &Message) -> Result<()> {
    let data = encode(msg)?;
    writer.write_all(&data)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{decode, encode, frame_length, read_message};
    use crate::error::{Error, Result};
    use crate::message::{Endian, Flags, Message};
    use crate::signature::Type;
    use crate::value::{ObjectPath, Value};
    use std::io::Cursor;
    use test_log::test;

    fn call() -> Result<Message> {
        let mut msg = Message::method_call(None, "/a", None, "B")?;
        msg.serial = 1;
        Ok(msg)
    }

    #[test]
    fn header_bytes() -> Result<()> {
        let data = encode(&call()?)?;
        let expected: Vec<u8> = vec![
            b'l', 1, 0, 1, // endian, method call, flags, version
            0, 0, 0, 0, // body length
            1, 0, 0, 0, // serial
            26, 0, 0, 0, // header fields array length
            1, 1, b'o', 0, // PATH, signature "o"
            2, 0, 0, 0, b'/', b'a', 0, // "/a"
            0, 0, 0, 0, 0, // padding(8)
            3, 1, b's', 0, // MEMBER, signature "s"
            1, 0, 0, 0, b'B', 0, // "B"
            0, 0, 0, 0, 0, 0, // padding(8)
        ];
        assert_eq!(data, expected);
        assert_eq!(decode(&data)?, call()?);
        Ok(())
    }

    #[test]
    fn struct_after_byte_is_padded() -> Result<()> {
        let msg = call()?.with_body(vec![
            Value::Byte(1),
            Value::Struct(vec![Value::Int32(2), Value::Int32(3)]),
        ]);
        let data = encode(&msg)?;
        let body = &data[data.len() - 16..];
        assert_eq!(
            body,
            &[1, 0, 0, 0, 0, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0][..],
            "struct must start at the next 8-byte boundary"
        );
        assert_eq!(decode(&data)?, msg);
        Ok(())
    }

    #[test]
    fn round_trip_everything() -> Result<()> {
        let dict = Value::dict(
            Type::String,
            Type::Variant,
            vec![
                ("a".into(), Value::variant(0.25f64)),
                ("b".into(), Value::variant(vec!["x".to_owned()])),
            ],
        )?;
        let body = vec![
            Value::Byte(0xff),
            Value::Boolean(true),
            Value::Int16(-2),
            Value::UInt16(3),
            Value::Int32(-4),
            Value::UInt32(5),
            Value::Int64(-6),
            Value::UInt64(7),
            Value::Double(8.5),
            Value::from("nine"),
            Value::ObjectPath(ObjectPath::new("/ten")?),
            Value::Signature("a{sv}".parse()?),
            Value::UnixFd(0),
            Value::array(Type::Int64, vec![])?,
            dict,
            Value::Struct(vec![Value::Byte(1), Value::variant(Value::Struct(vec![
                Value::from("deep"),
            ]))]),
        ];
        for endian in &[Endian::Little, Endian::Big] {
            let mut msg = Message::signal("/com/acme/Foo", "com.acme.Foo", "Changed")?
                .with_body(body.clone())
                .with_destination(":1.4")
                .with_flags(Flags::NO_AUTO_START);
            msg.endian = *endian;
            msg.serial = 99;
            msg.fields.sender = Some(":1.2".to_owned());
            msg.fields.unix_fds = Some(1);
            assert_eq!(decode(&encode(&msg)?)?, msg);
        }
        Ok(())
    }

    #[test]
    fn big_endian_integers() -> Result<()> {
        let mut msg = call()?.with_arg(0x0102_0304u32);
        msg.endian = Endian::Big;
        let data = encode(&msg)?;
        assert_eq!(data[0], b'B');
        assert_eq!(&data[data.len() - 4..], &[1, 2, 3, 4]);
        Ok(())
    }

    #[test]
    fn empty_array_length_excludes_padding() -> Result<()> {
        let msg = call()?.with_arg(Value::array(Type::Int64, vec![])?);
        let data = encode(&msg)?;
        // length 0, then padding to 8 for the (absent) first element
        assert_eq!(&data[data.len() - 8..], &[0, 0, 0, 0, 0, 0, 0, 0]);
        Ok(())
    }

    #[test]
    fn rejects_truncated_and_mismatched() -> Result<()> {
        let data = encode(&call()?.with_arg(1u32))?;
        match decode(&data[..data.len() - 1]) {
            Err(Error::MalformedMessage(_)) => (),
            other => panic!("unexpected {:?}", other),
        }
        let mut longer = data.clone();
        longer.extend_from_slice(&[0; 8]);
        assert!(matches!(decode(&longer), Err(Error::MalformedMessage(_))));
        let mut bad_endian = data.clone();
        bad_endian[0] = b'x';
        assert!(matches!(decode(&bad_endian), Err(Error::MalformedMessage(_))));
        let mut bad_padding = data;
        bad_padding[27] = 1;
        assert!(matches!(decode(&bad_padding), Err(Error::MalformedMessage(_))));
        Ok(())
    }

    #[test]
    fn rejects_unserialed_and_invalid_values() -> Result<()> {
        let mut msg = call()?;
        msg.serial = 0;
        assert!(encode(&msg).is_err());
        let msg = call()?.with_arg(Value::Struct(vec![]));
        assert!(matches!(encode(&msg), Err(Error::InvalidSignature(_))));
        Ok(())
    }

    #[test]
    fn stream_framing() -> Result<()> {
        let first = call()?.with_arg("hello");
        let mut second = call()?.with_arg(7u64);
        second.serial = 2;
        let mut stream = encode(&first)?;
        assert_eq!(frame_length(&stream)?, stream.len());
        stream.extend(encode(&second)?);
        let mut cursor = Cursor::new(stream);
        assert_eq!(read_message(&mut cursor)?, first);
        assert_eq!(read_message(&mut cursor)?, second);
        assert!(matches!(read_message(&mut cursor), Err(Error::Io(_))));
        Ok(())
    }
}
