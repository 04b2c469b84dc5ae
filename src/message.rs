use crate::error::{Error, Result};
use crate::signature::Signature;
use crate::value::{ObjectPath, Value};

pub const PROTOCOL_VERSION: u8 = 1;

pub(crate) const FIELD_PATH: u8 = 1;
pub(crate) const FIELD_INTERFACE: u8 = 2;
pub(crate) const FIELD_MEMBER: u8 = 3;
pub(crate) const FIELD_ERROR_NAME: u8 = 4;
pub(crate) const FIELD_REPLY_SERIAL: u8 = 5;
pub(crate) const FIELD_DESTINATION: u8 = 6;
pub(crate) const FIELD_SENDER: u8 = 7;
pub(crate) const FIELD_SIGNATURE: u8 = 8;
pub(crate) const FIELD_UNIX_FDS: u8 = 9;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    pub fn marker(self) -> u8 {
        match self {
            Endian::Little => b'l',
            Endian::Big => b'B',
        }
    }

    pub fn from_marker(marker: u8) -> Option<Endian> {
        match marker {
            b'l' => Some(Endian::Little),
            b'B' => Some(Endian::Big),
            _ => None,
        }
    }
}

impl Default for Endian {
    fn default() -> Self {
        Endian::Little
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

impl MessageType {
    pub fn code(self) -> u8 {
        match self {
            MessageType::MethodCall => 1,
            MessageType::MethodReturn => 2,
            MessageType::Error => 3,
            MessageType::Signal => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<MessageType> {
        match code {
            1 => Some(MessageType::MethodCall),
            2 => Some(MessageType::MethodReturn),
            3 => Some(MessageType::Error),
            4 => Some(MessageType::Signal),
            _ => None,
        }
    }

    /// The spelling used by the `type=` key of match rules.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::MethodCall => "method_call",
            MessageType::MethodReturn => "method_return",
            MessageType::Error => "error",
            MessageType::Signal => "signal",
        }
    }

    pub fn from_name(name: &str) -> Option<MessageType> {
        match name {
            "method_call" => Some(MessageType::MethodCall),
            "method_return" => Some(MessageType::MethodReturn),
            "error" => Some(MessageType::Error),
            "signal" => Some(MessageType::Signal),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Flags(u8);

impl Flags {
    pub const NO_REPLY_EXPECTED: Flags = Flags(0x1);
    pub const NO_AUTO_START: Flags = Flags(0x2);
    pub const ALLOW_INTERACTIVE_AUTHORIZATION: Flags = Flags(0x4);

    pub fn empty() -> Flags {
        Flags(0)
    }

    pub fn from_bits(bits: u8) -> Flags {
        Flags(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }
}

/// Header fields other than the body signature, which is always
/// derived from the body itself.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HeaderFields {
    pub path: Option<ObjectPath>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub reply_serial: Option<u32>,
    pub destination: Option<String>,
    pub sender: Option<String>,
    pub unix_fds: Option<u32>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub endian: Endian,
    pub message_type: MessageType,
    pub flags: Flags,
    /// Zero until the message is handed to a connection.
    pub serial: u32,
    pub fields: HeaderFields,
    pub body: Vec<Value>,
}

impl Message {
    fn with_type(message_type: MessageType) -> Message {
        Message {
            endian: Endian::default(),
            message_type,
            flags: Flags::empty(),
            serial: 0,
            fields: HeaderFields::default(),
            body: Vec::new(),
        }
    }

    pub fn method_call(
        destination: Option<&str>,
        path: &str,
        interface: Option<&str>,
        member: &str,
    ) -> Result<Message> {
        let mut msg = Message::with_type(MessageType::MethodCall);
        msg.fields.destination = destination.map(str::to_owned);
        msg.fields.path = Some(ObjectPath::new(path)?);
        msg.fields.interface = interface.map(str::to_owned);
        msg.fields.member = Some(member.to_owned());
        Ok(msg)
    }

    pub fn signal(path: &str, interface: &str, member: &str) -> Result<Message> {
        let mut msg = Message::with_type(MessageType::Signal);
        msg.fields.path = Some(ObjectPath::new(path)?);
        msg.fields.interface = Some(interface.to_owned());
        msg.fields.member = Some(member.to_owned());
        Ok(msg)
    }

    /// A return addressed to whoever sent `call`.
    pub fn method_return(call: &Message) -> Message {
        let mut msg = Message::with_type(MessageType::MethodReturn);
        msg.endian = call.endian;
        msg.fields.reply_serial = Some(call.serial);
        msg.fields.destination = call.fields.sender.clone();
        msg
    }

    pub fn error(call: &Message, name: &str, text: &str) -> Message {
        let mut msg = Message::with_type(MessageType::Error);
        msg.endian = call.endian;
        msg.fields.reply_serial = Some(call.serial);
        msg.fields.destination = call.fields.sender.clone();
        msg.fields.error_name = Some(name.to_owned());
        msg.body.push(Value::from(text));
        msg
    }

    pub fn with_body(mut self, body: Vec<Value>) -> Message {
        self.body = body;
        self
    }

    pub fn with_arg(mut self, arg: impl Into<Value>) -> Message {
        self.body.push(arg.into());
        self
    }

    pub fn with_destination(mut self, destination: &str) -> Message {
        self.fields.destination = Some(destination.to_owned());
        self
    }

    pub fn with_flags(mut self, flags: Flags) -> Message {
        self.flags.insert(flags);
        self
    }

    pub fn body_signature(&self) -> Result<Signature> {
        Signature::from_types(self.body.iter().map(Value::ty).collect())
    }

    pub fn path(&self) -> Option<&ObjectPath> {
        self.fields.path.as_ref()
    }

    pub fn interface(&self) -> Option<&str> {
        self.fields.interface.as_deref()
    }

    pub fn member(&self) -> Option<&str> {
        self.fields.member.as_deref()
    }

    pub fn error_name(&self) -> Option<&str> {
        self.fields.error_name.as_deref()
    }

    pub fn reply_serial(&self) -> Option<u32> {
        self.fields.reply_serial
    }

    pub fn destination(&self) -> Option<&str> {
        self.fields.destination.as_deref()
    }

    pub fn sender(&self) -> Option<&str> {
        self.fields.sender.as_deref()
    }

    pub fn expects_reply(&self) -> bool {
        self.message_type == MessageType::MethodCall
            && !self.flags.contains(Flags::NO_REPLY_EXPECTED)
    }

    /// The human readable text carried by an error message, if any.
    pub fn error_text(&self) -> &str {
        self.body.first().and_then(Value::as_str).unwrap_or("")
    }

    /// String argument `n` of the body, as used by `argN` match keys.
    pub fn string_arg(&self, n: usize) -> Option<&str> {
        self.body.get(n).and_then(Value::as_str)
    }

    /// Converts an error reply into the matching `Err`.
    pub fn into_result(self) -> Result<Message> {
        if self.message_type == MessageType::Error {
            return Err(Error::Remote {
                name: self.error_name().unwrap_or("").to_owned(),
                message: self.error_text().to_owned(),
            });
        }
        Ok(self)
    }

    /// Checks that every header field mandatory for the message type is present.
    pub fn validate(&self) -> Result<()> {
        let missing = |what: &str| {
            Err(Error::MalformedMessage(format!(
                "{} message without {}",
                self.message_type.as_str(),
                what
            )))
        };
        match self.message_type {
            MessageType::MethodCall => {
                if self.fields.path.is_none() {
                    return missing("path");
                }
                if self.fields.member.is_none() {
                    return missing("member");
                }
            }
            MessageType::MethodReturn => {
                if self.fields.reply_serial.is_none() {
                    return missing("reply serial");
                }
            }
            MessageType::Error => {
                if self.fields.reply_serial.is_none() {
                    return missing("reply serial");
                }
                if self.fields.error_name.is_none() {
                    return missing("error name");
                }
            }
            MessageType::Signal => {
                if self.fields.path.is_none() {
                    return missing("path");
                }
                if self.fields.interface.is_none() {
                    return missing("interface");
                }
                if self.fields.member.is_none() {
                    return missing("member");
                }
            }
        }
        Ok(())
    }
}
