//! The SASL handshake that precedes binary traffic on every connection.
//!
//! Lines are ASCII and end in CRLF. Both sides read them one byte at a
//! time, so nothing past the final `BEGIN` is ever consumed here and the
//! stream can switch to message framing right away.

use crate::error::{Error, Result};
use log::{debug, trace};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use std::io::{Read, Write};

pub mod cookie;

use cookie::{now_secs, Keyring, DEFAULT_CONTEXT};

const MAX_LINE_LENGTH: usize = 16 * 1024;
/// Upper bound on commands in one handshake.
const MAX_COMMANDS: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mechanism {
    #[serde(rename = "EXTERNAL")]
    External,
    #[serde(rename = "DBUS_COOKIE_SHA1")]
    CookieSha1,
    #[serde(rename = "ANONYMOUS")]
    Anonymous,
}

impl Mechanism {
    /// Preference order for clients.
    pub const ALL: [Mechanism; 3] = [
        Mechanism::External,
        Mechanism::CookieSha1,
        Mechanism::Anonymous,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Mechanism::External => "EXTERNAL",
            Mechanism::CookieSha1 => "DBUS_COOKIE_SHA1",
            Mechanism::Anonymous => "ANONYMOUS",
        }
    }

    pub fn from_name(name: &str) -> Option<Mechanism> {
        Mechanism::ALL.into_iter().find(|m| m.name() == name)
    }
}

fn names(mechanisms: &[Mechanism]) -> String {
    mechanisms
        .iter()
        .map(|m| m.name())
        .collect::<Vec<_>>()
        .join(" ")
}

fn current_uid() -> u32 {
    nix::unistd::getuid().as_raw()
}

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill(&mut bytes[..]);
    hex::encode(bytes)
}

fn sha1_hex(input: &str) -> String {
    hex::encode(Sha1::digest(input.as_bytes()))
}

fn read_line<R: Read + ?Sized>(stream: &mut R) -> Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8];
    loop {
        stream.read_exact(&mut byte)?;
        line.push(byte[0]);
        if line.ends_with(b"\r\n") {
            line.truncate(line.len() - 2);
            break;
        }
        if line.len() > MAX_LINE_LENGTH {
            return Err(Error::AuthenticationFailed("line too long".to_owned()));
        }
    }
    let line = String::from_utf8(line)
        .map_err(|_| Error::AuthenticationFailed("line is not ASCII".to_owned()))?;
    trace!("sasl <- {}", line);
    Ok(line)
}

fn send_line<W: Write + ?Sized>(stream: &mut W, line: &str) -> Result<()> {
    trace!("sasl -> {}", line);
    stream.write_all(line.as_bytes())?;
    stream.write_all(b"\r\n")?;
    stream.flush()?;
    Ok(())
}

/// One line of the handshake, in either direction.
#[derive(Debug, PartialEq)]
enum Command {
    Auth(Option<String>, Option<String>),
    Cancel,
    Begin,
    Data(String),
    Error(String),
    NegotiateUnixFd,
    Rejected(Vec<String>),
    Ok(String),
    AgreeUnixFd,
    Unknown(String),
}

impl Command {
    fn parse(line: &str) -> Command {
        let (word, rest) = match line.split_once(' ') {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };
        let arg = || rest.to_owned();
        match word {
            "AUTH" => {
                let mut parts = rest.split_whitespace();
                Command::Auth(
                    parts.next().map(str::to_owned),
                    parts.next().map(str::to_owned),
                )
            }
            "CANCEL" => Command::Cancel,
            "BEGIN" => Command::Begin,
            "DATA" => Command::Data(arg()),
            "ERROR" => Command::Error(arg()),
            "NEGOTIATE_UNIX_FD" => Command::NegotiateUnixFd,
            "REJECTED" => Command::Rejected(rest.split_whitespace().map(str::to_owned).collect()),
            "OK" => Command::Ok(arg()),
            "AGREE_UNIX_FD" => Command::AgreeUnixFd,
            _ => Command::Unknown(line.to_owned()),
        }
    }
}

fn decode_hex_text(data: &str) -> Option<String> {
    hex::decode(data)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
}

fn failed(what: impl Into<String>) -> Error {
    Error::AuthenticationFailed(what.into())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientOutcome {
    /// GUID the server sent with `OK`.
    pub guid: String,
    pub mechanism: Mechanism,
    /// Whether the server agreed to unix fd passing.
    pub unix_fd: bool,
}

#[derive(Clone, Debug)]
pub struct AuthClient {
    pub mechanisms: Vec<Mechanism>,
    pub negotiate_unix_fd: bool,
    pub keyring: Keyring,
}

impl Default for AuthClient {
    fn default() -> Self {
        AuthClient {
            mechanisms: Mechanism::ALL.to_vec(),
            negotiate_unix_fd: false,
            keyring: Keyring::default(),
        }
    }
}

enum Attempt {
    Done(ClientOutcome),
    Rejected,
}

impl AuthClient {
    /// Runs the client side of the handshake, ending with `BEGIN`.
    pub fn authenticate<S: Read + Write + ?Sized>(&self, stream: &mut S) -> Result<ClientOutcome> {
        stream.write_all(&[0])?;
        send_line(stream, "AUTH")?;
        let offered = match Command::parse(&read_line(stream)?) {
            Command::Rejected(offered) => offered,
            other => return Err(failed(format!("unexpected reply {:?}", other))),
        };
        debug!("server offers {:?}", offered);
        let candidates = self
            .mechanisms
            .iter()
            .copied()
            .filter(|m| offered.iter().any(|o| o == m.name()));
        for mechanism in candidates {
            match self.attempt(stream, mechanism)? {
                Attempt::Done(outcome) => {
                    debug!("authenticated with {}", mechanism.name());
                    return Ok(outcome);
                }
                Attempt::Rejected => debug!("{} rejected", mechanism.name()),
            }
        }
        Err(failed(format!(
            "no acceptable mechanism among {:?}",
            offered
        )))
    }

    fn attempt<S: Read + Write + ?Sized>(
        &self,
        stream: &mut S,
        mechanism: Mechanism,
    ) -> Result<Attempt> {
        let initial = match mechanism {
            Mechanism::Anonymous => hex::encode("dbus_core"),
            Mechanism::External | Mechanism::CookieSha1 => {
                hex::encode(current_uid().to_string())
            }
        };
        send_line(stream, &format!("AUTH {} {}", mechanism.name(), initial))?;
        for _ in 0..MAX_COMMANDS {
            match Command::parse(&read_line(stream)?) {
                Command::Ok(guid) => {
                    let unix_fd = self.negotiate(stream)?;
                    send_line(stream, "BEGIN")?;
                    return Ok(Attempt::Done(ClientOutcome {
                        guid,
                        mechanism,
                        unix_fd,
                    }));
                }
                Command::Data(data) => match self.respond(mechanism, &data) {
                    Ok(Some(response)) => send_line(stream, &format!("DATA {}", response))?,
                    Ok(None) => send_line(stream, "DATA")?,
                    Err(err) => {
                        debug!("cannot answer challenge: {}", err);
                        send_line(stream, "CANCEL")?;
                    }
                },
                Command::Rejected(_) => return Ok(Attempt::Rejected),
                Command::Error(text) => {
                    debug!("server error: {}", text);
                    send_line(stream, "CANCEL")?;
                }
                other => return Err(failed(format!("unexpected reply {:?}", other))),
            }
        }
        Err(failed("too many handshake steps"))
    }

    fn negotiate<S: Read + Write + ?Sized>(&self, stream: &mut S) -> Result<bool> {
        if !self.negotiate_unix_fd {
            return Ok(false);
        }
        send_line(stream, "NEGOTIATE_UNIX_FD")?;
        match Command::parse(&read_line(stream)?) {
            Command::AgreeUnixFd => Ok(true),
            Command::Error(_) => Ok(false),
            other => Err(failed(format!("unexpected reply {:?}", other))),
        }
    }

    /// Answer to a `DATA` challenge, hex encoded.
    fn respond(&self, mechanism: Mechanism, data: &str) -> Result<Option<String>> {
        if mechanism != Mechanism::CookieSha1 {
            return Ok(None);
        }
        let challenge = decode_hex_text(data).ok_or_else(|| failed("undecodable challenge"))?;
        let parts: Vec<&str> = challenge.split(' ').collect();
        let (context, id, server_challenge) = match parts[..] {
            [context, id, server_challenge] => (context, id, server_challenge),
            _ => return Err(failed("challenge does not have three parts")),
        };
        let cookie = self
            .keyring
            .find_cookie(context, id)?
            .ok_or_else(|| failed(format!("no cookie {} in {}", id, context)))?;
        let client_challenge = random_hex(16);
        let hash = sha1_hex(&format!("{}:{}:{}", server_challenge, client_challenge, cookie));
        Ok(Some(hex::encode(format!("{} {}", client_challenge, hash))))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerOutcome {
    pub mechanism: Mechanism,
    pub unix_fd: bool,
}

#[derive(Clone, Debug)]
pub struct AuthServer {
    pub guid: String,
    pub mechanisms: Vec<Mechanism>,
    pub unix_fd: bool,
    pub keyring: Keyring,
}

enum State {
    WaitAuth,
    WaitData { challenge: String, cookie: String },
    WaitBegin(Mechanism),
}

impl AuthServer {
    pub fn new(guid: &str) -> AuthServer {
        AuthServer {
            guid: guid.to_owned(),
            mechanisms: Mechanism::ALL.to_vec(),
            unix_fd: false,
            keyring: Keyring::default(),
        }
    }

    /// Runs the server side until the client sends `BEGIN`. `peer_uid`
    /// is the kernel's view of the client, when the transport has one.
    pub fn authenticate<S: Read + Write + ?Sized>(
        &self,
        stream: &mut S,
        peer_uid: Option<u32>,
    ) -> Result<ServerOutcome> {
        let mut nul = [0u8];
        stream.read_exact(&mut nul)?;
        if nul[0] != 0 {
            return Err(failed("missing credentials byte"));
        }
        let mut state = State::WaitAuth;
        let mut unix_fd = false;
        for _ in 0..MAX_COMMANDS {
            let command = Command::parse(&read_line(stream)?);
            state = match (state, command) {
                (State::WaitAuth, Command::Auth(mechanism, data)) => {
                    self.start(stream, mechanism.as_deref(), data.as_deref(), peer_uid)?
                }
                (State::WaitData { challenge, cookie }, Command::Data(data)) => {
                    if verify_cookie_response(&challenge, &cookie, &data) {
                        send_line(stream, &format!("OK {}", self.guid))?;
                        State::WaitBegin(Mechanism::CookieSha1)
                    } else {
                        self.reject(stream)?
                    }
                }
                (State::WaitBegin(mechanism), Command::Begin) => {
                    debug!("client authenticated with {}", mechanism.name());
                    return Ok(ServerOutcome { mechanism, unix_fd });
                }
                (State::WaitBegin(mechanism), Command::NegotiateUnixFd) => {
                    if self.unix_fd {
                        unix_fd = true;
                        send_line(stream, "AGREE_UNIX_FD")?;
                    } else {
                        send_line(stream, "ERROR \"unix fd passing not supported\"")?;
                    }
                    State::WaitBegin(mechanism)
                }
                (_, Command::Begin) => return Err(failed("BEGIN before OK")),
                (_, Command::Cancel) | (_, Command::Error(_)) => self.reject(stream)?,
                (state, _) => {
                    send_line(stream, "ERROR \"Got invalid command\"")?;
                    state
                }
            };
        }
        Err(failed("too many handshake steps"))
    }

    fn reject<W: Write + ?Sized>(&self, stream: &mut W) -> Result<State> {
        send_line(stream, &format!("REJECTED {}", names(&self.mechanisms)))?;
        Ok(State::WaitAuth)
    }

    fn start<W: Write + ?Sized>(
        &self,
        stream: &mut W,
        mechanism: Option<&str>,
        data: Option<&str>,
        peer_uid: Option<u32>,
    ) -> Result<State> {
        let mechanism = match mechanism
            .and_then(Mechanism::from_name)
            .filter(|m| self.mechanisms.contains(m))
        {
            Some(mechanism) => mechanism,
            None => return self.reject(stream),
        };
        match mechanism {
            Mechanism::Anonymous => {}
            Mechanism::External => {
                let claimed = data
                    .and_then(decode_hex_text)
                    .and_then(|uid| uid.parse::<u32>().ok());
                let ours = current_uid();
                let accepted = claimed == Some(ours) && peer_uid.map_or(true, |p| p == ours);
                if !accepted {
                    debug!("EXTERNAL uid {:?} (peer {:?}) refused", claimed, peer_uid);
                    return self.reject(stream);
                }
            }
            Mechanism::CookieSha1 => {
                let id = now_secs().to_string() + &random_hex(2);
                let challenge = random_hex(16);
                let cookie = random_hex(24);
                self.keyring
                    .add_cookie(DEFAULT_CONTEXT, &id, now_secs(), &cookie)?;
                let payload = format!("{} {} {}", DEFAULT_CONTEXT, id, challenge);
                send_line(stream, &format!("DATA {}", hex::encode(payload)))?;
                return Ok(State::WaitData { challenge, cookie });
            }
        }
        send_line(stream, &format!("OK {}", self.guid))?;
        Ok(State::WaitBegin(mechanism))
    }
}

fn verify_cookie_response(challenge: &str, cookie: &str, data: &str) -> bool {
    let response = match decode_hex_text(data) {
        Some(response) => response,
        None => return false,
    };
    match response.split_once(' ') {
        Some((client_challenge, hash)) => {
            sha1_hex(&format!("{}:{}:{}", challenge, client_challenge, cookie)) == hash
        }
        None => false,
    }
}
