//! Match rules select which messages a connection wants to see.
//!
//! The textual form is the one `AddMatch` takes: comma separated
//! `key='value'` pairs. Every key present in a rule must match for the
//! rule to match, and an empty rule matches everything.

use crate::error::{Error, Result};
use crate::message::{Message, MessageType};
use crate::value::Value;

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::str::FromStr;

/// Highest argument index a rule may test.
pub const MAX_ARG_INDEX: usize = 63;

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct MatchRule {
    pub msg_type: Option<MessageType>,
    pub sender: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub path: Option<String>,
    pub path_namespace: Option<String>,
    pub destination: Option<String>,
    pub args: BTreeMap<usize, String>,
    pub arg_paths: BTreeMap<usize, String>,
    pub arg0_namespace: Option<String>,
}

fn invalid(what: impl Into<String>) -> Error {
    Error::InvalidMatchRule(what.into())
}

// Splits `key='value',...` into pairs. A value is made of quoted runs,
// taken literally (a backslash inside quotes is just a backslash), and
// `\'` outside quotes, which stands for one quote: `'don'\''t'` is
// `don't`. Whitespace around keys, values and commas is ignored.
fn split_pairs(rule: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    let mut chars = rule.chars().peekable();
    loop {
        while chars.peek().map_or(false, |c| c.is_whitespace() || *c == ',') {
            chars.next();
        }
        if chars.peek().is_none() {
            return Ok(pairs);
        }
        let mut key = String::new();
        let mut key_ended = false;
        loop {
            match chars.next() {
                Some('=') => break,
                Some(c) if (c.is_ascii_alphanumeric() || c == '_') && !key_ended => key.push(c),
                Some(c) if c.is_whitespace() => key_ended = true,
                Some(c) => return Err(invalid(format!("unexpected {:?} in key {:?}", c, key))),
                None => return Err(invalid(format!("key {:?} has no value", key))),
            }
        }
        while chars.peek().map_or(false, |c| c.is_whitespace()) {
            chars.next();
        }
        let mut value = String::new();
        let mut quoted = false;
        loop {
            match chars.peek() {
                Some('\'') => {
                    chars.next();
                    loop {
                        match chars.next() {
                            Some('\'') => break,
                            Some(c) => value.push(c),
                            None => {
                                return Err(invalid(format!("value of {:?} is not terminated", key)))
                            }
                        }
                    }
                    quoted = true;
                }
                Some('\\') => {
                    chars.next();
                    if chars.next() != Some('\'') {
                        return Err(invalid(format!("stray backslash in value of {:?}", key)));
                    }
                    value.push('\'');
                    quoted = true;
                }
                None | Some(',') => break,
                Some(c) if c.is_whitespace() => {
                    chars.next();
                }
                Some(c) => return Err(invalid(format!("unexpected {:?} in value of {:?}", c, key))),
            }
        }
        if !quoted {
            return Err(invalid(format!("value of {:?} is not quoted", key)));
        }
        pairs.push((key, value));
    }
}

fn arg_index(digits: &str) -> Option<usize> {
    if digits.is_empty() || digits.len() > 2 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().filter(|ix| *ix <= MAX_ARG_INDEX)
}

impl MatchRule {
    pub fn new() -> MatchRule {
        MatchRule::default()
    }

    pub fn parse(rule: &str) -> Result<MatchRule> {
        let mut out = MatchRule::default();
        for (key, value) in split_pairs(rule)? {
            match key.as_str() {
                "type" => {
                    out.msg_type = Some(
                        MessageType::from_name(&value)
                            .ok_or_else(|| invalid(format!("unknown message type {:?}", value)))?,
                    )
                }
                "sender" => out.sender = Some(value),
                "interface" => out.interface = Some(value),
                "member" => out.member = Some(value),
                "path" => out.path = Some(value),
                "path_namespace" => out.path_namespace = Some(value),
                "destination" => out.destination = Some(value),
                "arg0namespace" => out.arg0_namespace = Some(value),
                other => {
                    let rest = other
                        .strip_prefix("arg")
                        .ok_or_else(|| invalid(format!("unknown key {:?}", other)))?;
                    let (digits, is_path) = match rest.strip_suffix("path") {
                        Some(digits) => (digits, true),
                        None => (rest, false),
                    };
                    let ix = arg_index(digits)
                        .ok_or_else(|| invalid(format!("unknown key {:?}", other)))?;
                    if is_path {
                        out.arg_paths.insert(ix, value);
                    } else {
                        out.args.insert(ix, value);
                    }
                }
            }
        }
        if out.path.is_some() && out.path_namespace.is_some() {
            return Err(invalid("path and path_namespace are mutually exclusive"));
        }
        Ok(out)
    }

    pub fn with_type(mut self, msg_type: MessageType) -> MatchRule {
        self.msg_type = Some(msg_type);
        self
    }

    pub fn with_sender(mut self, sender: &str) -> MatchRule {
        self.sender = Some(sender.to_owned());
        self
    }

    pub fn with_interface(mut self, interface: &str) -> MatchRule {
        self.interface = Some(interface.to_owned());
        self
    }

    pub fn with_member(mut self, member: &str) -> MatchRule {
        self.member = Some(member.to_owned());
        self
    }

    pub fn with_path(mut self, path: &str) -> MatchRule {
        self.path = Some(path.to_owned());
        self
    }

    pub fn with_arg(mut self, ix: usize, value: &str) -> MatchRule {
        self.args.insert(ix, value.to_owned());
        self
    }

    /// Whether `msg` satisfies every filter of this rule.
    pub fn matches(&self, msg: &Message) -> bool {
        self.matches_resolved(msg, |_| None)
    }

    /// Like [`MatchRule::matches`], but a `sender` filter naming a
    /// well-known name also matches messages from that name's current
    /// owner, as looked up by `owner_of`.
    pub fn matches_resolved<F>(&self, msg: &Message, owner_of: F) -> bool
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(msg_type) = self.msg_type {
            if msg.message_type != msg_type {
                return false;
            }
        }
        if let Some(sender) = &self.sender {
            let actual = match msg.sender() {
                Some(actual) => actual,
                None => return false,
            };
            if actual != sender && owner_of(sender).as_deref() != Some(actual) {
                return false;
            }
        }
        if !field_matches(&self.interface, msg.interface())
            || !field_matches(&self.member, msg.member())
            || !field_matches(&self.destination, msg.destination())
            || !field_matches(&self.path, msg.path().map(|p| p.as_str()))
        {
            return false;
        }
        if let Some(namespace) = &self.path_namespace {
            match msg.path() {
                Some(path) if path.is_in_namespace(namespace) => (),
                _ => return false,
            }
        }
        for (ix, expected) in &self.args {
            match msg.body.get(*ix) {
                Some(Value::String(actual)) if actual == expected => (),
                _ => return false,
            }
        }
        for (ix, expected) in &self.arg_paths {
            let actual = match msg.body.get(*ix) {
                Some(Value::String(s)) => s.as_str(),
                Some(Value::ObjectPath(p)) => p.as_str(),
                _ => return false,
            };
            if !arg_path_matches(actual, expected) {
                return false;
            }
        }
        if let Some(namespace) = &self.arg0_namespace {
            match msg.body.first() {
                Some(Value::String(name)) if name_in_namespace(name, namespace) => (),
                _ => return false,
            }
        }
        true
    }
}

fn field_matches(wanted: &Option<String>, actual: Option<&str>) -> bool {
    match wanted {
        None => true,
        Some(wanted) => actual == Some(wanted.as_str()),
    }
}

// Equal, or one of the two ends in `/` and is a prefix of the other.
fn arg_path_matches(actual: &str, expected: &str) -> bool {
    actual == expected
        || (expected.ends_with('/') && actual.starts_with(expected))
        || (actual.ends_with('/') && expected.starts_with(actual))
}

fn name_in_namespace(name: &str, namespace: &str) -> bool {
    name == namespace
        || (name.starts_with(namespace) && name.as_bytes().get(namespace.len()) == Some(&b'.'))
}

fn write_pair(f: &mut fmt::Formatter<'_>, first: &mut bool, key: &str, value: &str) -> fmt::Result {
    if !*first {
        f.write_str(",")?;
    }
    *first = false;
    write!(f, "{}='{}'", key, value.replace('\'', "'\\''"))
}

impl Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        if let Some(msg_type) = self.msg_type {
            write_pair(f, &mut first, "type", msg_type.as_str())?;
        }
        let fields = [
            ("sender", &self.sender),
            ("interface", &self.interface),
            ("member", &self.member),
            ("path", &self.path),
            ("path_namespace", &self.path_namespace),
            ("destination", &self.destination),
        ];
        for (key, value) in fields {
            if let Some(value) = value {
                write_pair(f, &mut first, key, value)?;
            }
        }
        for (ix, value) in &self.args {
            write_pair(f, &mut first, &format!("arg{}", ix), value)?;
        }
        for (ix, value) in &self.arg_paths {
            write_pair(f, &mut first, &format!("arg{}path", ix), value)?;
        }
        if let Some(namespace) = &self.arg0_namespace {
            write_pair(f, &mut first, "arg0namespace", namespace)?;
        }
        Ok(())
    }
}

impl FromStr for MatchRule {
    type Err = Error;

    fn from_str(s: &str) -> Result<MatchRule> {
        MatchRule::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::MatchRule;
    use crate::error::Result;
    use crate::message::{Message, MessageType};
    use crate::value::ObjectPath;
    use test_log::test;

    fn signal() -> Result<Message> {
        let mut msg = Message::signal("/org/example/MyObject", "org.example.MyInterface", "SomethingHappened")?
            .with_arg("some.value")
            .with_arg(ObjectPath::new("/ca/example/foo/bar")?);
        msg.fields.sender = Some(":1.5".to_owned());
        Ok(msg)
    }

    #[test]
    fn parse_and_format() -> Result<()> {
        let rule = MatchRule::parse(
            "type='signal', interface='org.example.MyInterface' ,arg2='with'\\''quote',arg0='some.value'",
        )?;
        assert_eq!(rule.msg_type, Some(MessageType::Signal));
        assert_eq!(rule.interface.as_deref(), Some("org.example.MyInterface"));
        assert_eq!(rule.args.get(&2).map(String::as_str), Some("with'quote"));
        assert_eq!(rule.args.get(&0).map(String::as_str), Some("some.value"));
        assert_eq!(MatchRule::parse(&rule.to_string())?, rule);
        assert_eq!(
            rule.to_string(),
            "type='signal',interface='org.example.MyInterface',arg0='some.value',arg2='with'\\''quote'"
        );
        Ok(())
    }

    #[test]
    fn quoting() -> Result<()> {
        let rule = MatchRule::parse(r"arg0='a\b' , arg1 = 'x' , member='don'\''t'")?;
        assert_eq!(rule.args.get(&0).map(String::as_str), Some(r"a\b"));
        assert_eq!(rule.args.get(&1).map(String::as_str), Some("x"));
        assert_eq!(rule.member.as_deref(), Some("don't"));
        assert_eq!(MatchRule::parse(&rule.to_string())?, rule);
        assert!(MatchRule::parse(r"member=\x").is_err());
        assert!(MatchRule::parse("mem ber='x'").is_err());
        Ok(())
    }

    #[test]
    fn rejects_bad_rules() {
        for bad in &[
            "type='bogus'",
            "colour='red'",
            "member=Foo",
            "member='Foo",
            "arg64='x'",
            "path='/a',path_namespace='/a'",
        ] {
            assert!(MatchRule::parse(bad).is_err(), "{} should be rejected", bad);
        }
        assert_eq!(MatchRule::parse("").ok(), Some(MatchRule::new()));
    }

    #[test]
    fn matching() -> Result<()> {
        let msg = signal()?;
        assert!(MatchRule::new().matches(&msg));
        assert!(MatchRule::parse("interface='org.example.MyInterface'")?.matches(&msg));
        assert!(!MatchRule::parse("interface='org.example.Other'")?.matches(&msg));
        assert!(!MatchRule::parse("type='method_call'")?.matches(&msg));
        assert!(MatchRule::parse("arg0='some.value'")?.matches(&msg));
        assert!(!MatchRule::parse("arg1='some.value'")?.matches(&msg));
        assert!(MatchRule::parse("path_namespace='/org/example'")?.matches(&msg));
        assert!(!MatchRule::parse("path_namespace='/org/ex'")?.matches(&msg));
        assert!(MatchRule::parse("arg1path='/ca/example/'")?.matches(&msg));
        assert!(!MatchRule::parse("arg1path='/ca/example'")?.matches(&msg));
        assert!(MatchRule::parse("arg0namespace='some'")?.matches(&msg));
        assert!(!MatchRule::parse("arg0namespace='som'")?.matches(&msg));
        Ok(())
    }

    #[test]
    fn sender_resolution() -> Result<()> {
        let msg = signal()?;
        let rule = MatchRule::new().with_sender("org.example.Service");
        assert!(!rule.matches(&msg));
        assert!(rule.matches_resolved(&msg, |name| {
            (name == "org.example.Service").then(|| ":1.5".to_owned())
        }));
        assert!(MatchRule::new().with_sender(":1.5").matches(&msg));
        Ok(())
    }
}
