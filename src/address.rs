//! Bus addresses: `transport:key=value,key=value[;transport:...]`.
//!
//! Values may contain `%xx` escapes, which are decoded when parsing and
//! re-applied when formatting.

use crate::error::{Error, Result};
use log::trace;

use std::env;
use std::fmt::{self, Display};
use std::str::FromStr;

pub const SESSION_BUS_ENV: &str = "DBUS_SESSION_BUS_ADDRESS";
pub const SYSTEM_BUS_ENV: &str = "DBUS_SYSTEM_BUS_ADDRESS";
pub const DEFAULT_SYSTEM_BUS_ADDRESS: &str = "unix:path=/var/run/dbus/system_bus_socket";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusAddress {
    transport: String,
    params: Vec<(String, String)>,
}

fn unescape(raw: &str) -> Result<String> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut ix = 0;
    while ix < bytes.len() {
        if bytes[ix] == b'%' {
            let hex = bytes
                .get(ix + 1..ix + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| Error::InvalidAddress(format!("bad escape in {:?}", raw)))?;
            out.push(hex);
            ix += 3;
        } else {
            out.push(bytes[ix]);
            ix += 1;
        }
    }
    String::from_utf8(out).map_err(|_| Error::InvalidAddress(format!("{:?} is not UTF-8", raw)))
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        let optional = b.is_ascii_alphanumeric() || b"-_/.\\*".contains(&b);
        if optional {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02x}", b));
        }
    }
    out
}

impl BusAddress {
    pub fn new(transport: &str) -> BusAddress {
        BusAddress {
            transport: transport.to_owned(),
            params: Vec::new(),
        }
    }

    /// Parses a single address. Use [`BusAddress::parse_all`] for lists.
    pub fn parse(address: &str) -> Result<BusAddress> {
        trace!("parsing bus address {:?}", address);
        let (transport, rest) = address
            .split_once(':')
            .ok_or_else(|| Error::InvalidAddress(format!("{:?} has no transport", address)))?;
        if transport.is_empty() {
            return Err(Error::InvalidAddress(format!(
                "{:?} has an empty transport",
                address
            )));
        }
        let mut out = BusAddress::new(transport);
        for pair in rest.split(',').filter(|pair| !pair.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                Error::InvalidAddress(format!("parameter {:?} has no value", pair))
            })?;
            if key.is_empty() {
                return Err(Error::InvalidAddress(format!("empty key in {:?}", address)));
            }
            if out.get(key).is_some() {
                return Err(Error::InvalidAddress(format!(
                    "parameter {:?} given twice",
                    key
                )));
            }
            out.params.push((key.to_owned(), unescape(value)?));
        }
        Ok(out)
    }

    /// Parses a `;` separated list of candidate addresses, in order.
    pub fn parse_all(addresses: &str) -> Result<Vec<BusAddress>> {
        let out = addresses
            .split(';')
            .filter(|a| !a.trim().is_empty())
            .map(|a| BusAddress::parse(a.trim()))
            .collect::<Result<Vec<_>>>()?;
        if out.is_empty() {
            return Err(Error::InvalidAddress("bus address is blank".to_owned()));
        }
        Ok(out)
    }

    /// Address of the session bus, from the environment.
    pub fn session() -> Result<Vec<BusAddress>> {
        let address = env::var(SESSION_BUS_ENV)
            .map_err(|_| Error::InvalidAddress(format!("{} is not set", SESSION_BUS_ENV)))?;
        BusAddress::parse_all(&address)
    }

    pub fn system() -> Result<Vec<BusAddress>> {
        let address =
            env::var(SYSTEM_BUS_ENV).unwrap_or_else(|_| DEFAULT_SYSTEM_BUS_ADDRESS.to_owned());
        BusAddress::parse_all(&address)
    }

    pub fn transport(&self) -> &str {
        &self.transport
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    /// Sets `key`, replacing an earlier value in place.
    pub fn with(mut self, key: &str, value: &str) -> BusAddress {
        match self.params.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_owned(),
            None => self.params.push((key.to_owned(), value.to_owned())),
        }
        self
    }

    pub fn without(mut self, key: &str) -> BusAddress {
        self.params.retain(|(k, _)| k != key);
        self
    }

    /// Whether this is an address to listen on rather than connect to.
    pub fn is_listening(&self) -> bool {
        self.get("listen").is_some()
    }

    pub fn guid(&self) -> Option<&str> {
        self.get("guid")
    }
}

impl Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.transport)?;
        for (ix, (key, value)) in self.params.iter().enumerate() {
            if ix > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", key, escape(value))?;
        }
        Ok(())
    }
}

impl FromStr for BusAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<BusAddress> {
        BusAddress::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::BusAddress;
    use crate::error::{Error, Result};
    use test_log::test;

    #[test]
    fn parse_single() -> Result<()> {
        let addr = BusAddress::parse("unix:path=/tmp/dbus-test,guid=0123abcd")?;
        assert_eq!(addr.transport(), "unix");
        assert_eq!(addr.get("path"), Some("/tmp/dbus-test"));
        assert_eq!(addr.guid(), Some("0123abcd"));
        assert!(!addr.is_listening());
        assert_eq!(addr.to_string(), "unix:path=/tmp/dbus-test,guid=0123abcd");
        Ok(())
    }

    #[test]
    fn parse_list() -> Result<()> {
        let addrs = BusAddress::parse_all("tcp:host=localhost,port=0,listen=true;unix:abstract=x")?;
        assert_eq!(addrs.len(), 2);
        assert!(addrs[0].is_listening());
        assert_eq!(addrs[0].get("port"), Some("0"));
        assert_eq!(addrs[1].transport(), "unix");
        Ok(())
    }

    #[test]
    fn escapes() -> Result<()> {
        let addr = BusAddress::parse("unix:path=/tmp/a%20b%2cc")?;
        assert_eq!(addr.get("path"), Some("/tmp/a b,c"));
        assert_eq!(BusAddress::parse(&addr.to_string())?, addr);
        assert!(BusAddress::parse("unix:path=%zz").is_err());
        Ok(())
    }

    #[test]
    fn rejects_malformed() {
        for bad in &["", "unix", ":path=/x", "unix:path", "unix:path=/a,path=/b"] {
            match BusAddress::parse_all(bad) {
                Err(Error::InvalidAddress(_)) => (),
                other => panic!("{:?} gave {:?}", bad, other),
            }
        }
    }

    #[test]
    fn builder() {
        let addr = BusAddress::new("tcp")
            .with("host", "127.0.0.1")
            .with("port", "1")
            .with("port", "2")
            .without("host");
        assert_eq!(addr.to_string(), "tcp:port=2");
    }
}
