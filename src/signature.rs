//! The D-Bus type signature grammar.
//!
//! A [`Signature`] is an ordered list of complete [`Type`]s. Parsing
//! enforces every rule of the grammar (balanced brackets, dict entries
//! only as array elements, basic dict keys, no empty structs) as well
//! as the length and nesting limits, and [`Display`] re-serializes a
//! parsed signature into exactly the string it came from.

use crate::error::{Error, Result};

use std::fmt::{self, Display, Write};
use std::str::FromStr;

pub const MAX_SIGNATURE_LENGTH: usize = 255;
pub const MAX_ARRAY_DEPTH: usize = 32;
pub const MAX_STRUCT_DEPTH: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Type {
    Byte,
    Boolean,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Double,
    String,
    ObjectPath,
    Signature,
    UnixFd,
    Array(Box<Type>),
    Struct(Vec<Type>),
    DictEntry(Box<Type>, Box<Type>),
    Variant,
}

impl Type {
    fn basic_from_code(code: u8) -> Option<Type> {
        let ty = match code {
            b'y' => Type::Byte,
            b'b' => Type::Boolean,
            b'n' => Type::Int16,
            b'q' => Type::UInt16,
            b'i' => Type::Int32,
            b'u' => Type::UInt32,
            b'x' => Type::Int64,
            b't' => Type::UInt64,
            b'd' => Type::Double,
            b's' => Type::String,
            b'o' => Type::ObjectPath,
            b'g' => Type::Signature,
            b'h' => Type::UnixFd,
            b'v' => Type::Variant,
            _ => return None,
        };
        Some(ty)
    }

    /// The leading type code of this type.
    pub fn code(&self) -> u8 {
        match self {
            Type::Byte => b'y',
            Type::Boolean => b'b',
            Type::Int16 => b'n',
            Type::UInt16 => b'q',
            Type::Int32 => b'i',
            Type::UInt32 => b'u',
            Type::Int64 => b'x',
            Type::UInt64 => b't',
            Type::Double => b'd',
            Type::String => b's',
            Type::ObjectPath => b'o',
            Type::Signature => b'g',
            Type::UnixFd => b'h',
            Type::Array(_) => b'a',
            Type::Struct(_) => b'(',
            Type::DictEntry(_, _) => b'{',
            Type::Variant => b'v',
        }
    }

    /// Wire alignment of a value of this type.
    pub fn alignment(&self) -> usize {
        match self {
            Type::Byte | Type::Signature | Type::Variant => 1,
            Type::Int16 | Type::UInt16 => 2,
            Type::Boolean
            | Type::Int32
            | Type::UInt32
            | Type::String
            | Type::ObjectPath
            | Type::UnixFd
            | Type::Array(_) => 4,
            Type::Int64
            | Type::UInt64
            | Type::Double
            | Type::Struct(_)
            | Type::DictEntry(_, _) => 8,
        }
    }

    /// Basic types are the ones allowed as dict-entry keys.
    pub fn is_basic(&self) -> bool {
        !matches!(
            self,
            Type::Array(_) | Type::Struct(_) | Type::DictEntry(_, _) | Type::Variant
        )
    }

    /// Parses exactly one complete type, as found in a variant.
    pub fn parse_single(s: &str) -> Result<Type> {
        let mut sig = Signature::parse(s)?;
        if sig.0.len() != 1 {
            return Err(Error::InvalidSignature(format!(
                "{:?} is not a single complete type",
                s
            )));
        }
        Ok(sig.0.remove(0))
    }

    fn write_to(&self, out: &mut String) {
        match self {
            Type::Array(elem) => {
                out.push('a');
                elem.write_to(out);
            }
            Type::Struct(members) => {
                out.push('(');
                for member in members {
                    member.write_to(out);
                }
                out.push(')');
            }
            Type::DictEntry(key, value) => {
                out.push('{');
                key.write_to(out);
                value.write_to(out);
                out.push('}');
            }
            basic => out.push(basic.code() as char),
        }
    }
}

impl Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = String::new();
        self.write_to(&mut s);
        f.write_str(&s)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Signature(Vec<Type>);

impl Signature {
    pub fn parse(s: &str) -> Result<Signature> {
        if s.len() > MAX_SIGNATURE_LENGTH {
            return Err(Error::InvalidSignature(format!(
                "signature is {} bytes, limit is {}",
                s.len(),
                MAX_SIGNATURE_LENGTH
            )));
        }
        let mut parser = Parser {
            sig: s.as_bytes(),
            ix: 0,
            array_depth: 0,
            struct_depth: 0,
        };
        let mut types = Vec::new();
        while parser.ix < parser.sig.len() {
            types.push(parser.parse_type(false)?);
        }
        Ok(Signature(types))
    }

    /// Builds a signature from already constructed types, checking that
    /// the result is still a valid signature.
    pub fn from_types(types: Vec<Type>) -> Result<Signature> {
        let sig = Signature(types);
        Signature::parse(&sig.to_string())?;
        Ok(sig)
    }

    pub fn empty() -> Signature {
        Signature(Vec::new())
    }

    pub fn types(&self) -> &[Type] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for ty in &self.0 {
            let mut s = String::new();
            ty.write_to(&mut s);
            f.write_str(&s)?;
        }
        Ok(())
    }
}

impl FromStr for Signature {
    type Err = Error;

    fn from_str(s: &str) -> Result<Signature> {
        Signature::parse(s)
    }
}

impl From<Type> for Signature {
    fn from(ty: Type) -> Signature {
        Signature(vec![ty])
    }
}

struct Parser<'a> {
    sig: &'a [u8],
    ix: usize,
    array_depth: usize,
    struct_depth: usize,
}

impl<'a> Parser<'a> {
    fn invalid(&self, what: &str) -> Error {
        let mut msg = String::new();
        let _ = write!(
            msg,
            "{} at offset {} of {:?}",
            what,
            self.ix,
            String::from_utf8_lossy(self.sig)
        );
        Error::InvalidSignature(msg)
    }

    fn next(&mut self) -> Option<u8> {
        let code = self.sig.get(self.ix).copied();
        self.ix += 1;
        code
    }

    fn parse_type(&mut self, array_element: bool) -> Result<Type> {
        let code = match self.next() {
            Some(code) => code,
            None => return Err(self.invalid("missing type")),
        };
        match code {
            b'a' => {
                self.array_depth += 1;
                if self.array_depth > MAX_ARRAY_DEPTH {
                    return Err(self.invalid("arrays nested too deeply"));
                }
                if self.ix >= self.sig.len() {
                    return Err(self.invalid("array without element type"));
                }
                let elem = self.parse_type(true)?;
                self.array_depth -= 1;
                Ok(Type::Array(Box::new(elem)))
            }
            b'(' => {
                self.enter_struct()?;
                let mut members = Vec::new();
                loop {
                    match self.sig.get(self.ix) {
                        None => return Err(self.invalid("unbalanced struct bracket")),
                        Some(b')') => {
                            self.ix += 1;
                            break;
                        }
                        Some(_) => members.push(self.parse_type(false)?),
                    }
                }
                if members.is_empty() {
                    return Err(self.invalid("empty struct"));
                }
                self.struct_depth -= 1;
                Ok(Type::Struct(members))
            }
            b'{' => {
                if !array_element {
                    return Err(self.invalid("dict entry outside of an array"));
                }
                self.enter_struct()?;
                let key = self.parse_type(false)?;
                if !key.is_basic() {
                    return Err(self.invalid("dict entry key is not a basic type"));
                }
                let value = match self.sig.get(self.ix) {
                    None => return Err(self.invalid("unbalanced dict entry bracket")),
                    Some(b'}') => return Err(self.invalid("dict entry without value type")),
                    Some(_) => self.parse_type(false)?,
                };
                match self.next() {
                    Some(b'}') => (),
                    None => return Err(self.invalid("unbalanced dict entry bracket")),
                    Some(_) => return Err(self.invalid("dict entry with more than two types")),
                }
                self.struct_depth -= 1;
                Ok(Type::DictEntry(Box::new(key), Box::new(value)))
            }
            b')' | b'}' => Err(self.invalid("unbalanced closing bracket")),
            code => match Type::basic_from_code(code) {
                Some(ty) => Ok(ty),
                None => Err(self.invalid(&format!("unknown type code {:?}", code as char))),
            },
        }
    }

    fn enter_struct(&mut self) -> Result<()> {
        self.struct_depth += 1;
        if self.struct_depth > MAX_STRUCT_DEPTH {
            return Err(self.invalid("structs nested too deeply"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Signature, Type};
    use crate::error::{Error, Result};
    use test_log::test;

    #[test]
    fn canonical_round_trip() -> Result<()> {
        for s in &[
            "",
            "y",
            "bnqiuxtdsogh",
            "as",
            "a{sv}",
            "(i(sd)a{oa{sv}})",
            "aay",
            "a(yv)",
            "v",
            "a{ta(ii)}",
        ] {
            let sig = Signature::parse(s)?;
            assert_eq!(&sig.to_string(), s);
        }
        Ok(())
    }

    #[test]
    fn tree_shape() -> Result<()> {
        let sig = Signature::parse("ia{sv}")?;
        assert_eq!(
            sig.types(),
            &[
                Type::Int32,
                Type::Array(Box::new(Type::DictEntry(
                    Box::new(Type::String),
                    Box::new(Type::Variant)
                ))),
            ]
        );
        Ok(())
    }

    #[test]
    fn rejects_bad_signatures() {
        for s in &[
            "z", "(i", "i)", "()", "{sv}", "a", "a{vs}", "a{s}", "a{sii}", "(s{sv})", "a{sv",
        ] {
            match Signature::parse(s) {
                Err(Error::InvalidSignature(_)) => (),
                other => panic!("{:?} parsed unexpectedly: {:?}", s, other),
            }
        }
    }

    #[test]
    fn nesting_limits() {
        let deep_array = "a".repeat(33) + "y";
        assert!(Signature::parse(&deep_array).is_err());
        let ok_array = "a".repeat(32) + "y";
        assert!(Signature::parse(&ok_array).is_ok());

        let deep_struct = "(".repeat(33) + "y" + &")".repeat(33);
        assert!(Signature::parse(&deep_struct).is_err());
    }

    #[test]
    fn single_type() -> Result<()> {
        assert_eq!(Type::parse_single("as")?, Type::Array(Box::new(Type::String)));
        assert!(Type::parse_single("ss").is_err());
        assert!(Type::parse_single("").is_err());
        Ok(())
    }

    #[test]
    fn alignments() -> Result<()> {
        assert_eq!(Type::parse_single("y")?.alignment(), 1);
        assert_eq!(Type::parse_single("q")?.alignment(), 2);
        assert_eq!(Type::parse_single("b")?.alignment(), 4);
        assert_eq!(Type::parse_single("ax")?.alignment(), 4);
        assert_eq!(Type::parse_single("(y)")?.alignment(), 8);
        assert_eq!(Type::parse_single("g")?.alignment(), 1);
        Ok(())
    }
}
