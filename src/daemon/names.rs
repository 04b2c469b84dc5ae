//! Bus name ownership: who owns a name and who is queued for it.
//!
//! Follows the `RequestName`/`ReleaseName` rules of the D-Bus
//! specification. Every mutation returns the [`NameEvent`]s it caused so
//! the daemon can emit the matching signals while still holding its lock.

use crate::error::{Error, Result};

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::ops::BitOr;

pub const BUS_NAME: &str = "org.freedesktop.DBus";
const MAX_NAME_LENGTH: usize = 255;
const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct NameFlags(u32);

impl NameFlags {
    pub const ALLOW_REPLACEMENT: NameFlags = NameFlags(0x1);
    pub const REPLACE_EXISTING: NameFlags = NameFlags(0x2);
    pub const DO_NOT_QUEUE: NameFlags = NameFlags(0x4);

    pub fn empty() -> NameFlags {
        NameFlags(0)
    }

    pub fn from_bits(bits: u32) -> NameFlags {
        NameFlags(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: NameFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for NameFlags {
    type Output = NameFlags;

    fn bitor(self, rhs: NameFlags) -> NameFlags {
        NameFlags(self.0 | rhs.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestNameReply {
    PrimaryOwner = 1,
    InQueue = 2,
    Exists = 3,
    AlreadyOwner = 4,
}

impl RequestNameReply {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<RequestNameReply> {
        match code {
            1 => Some(RequestNameReply::PrimaryOwner),
            2 => Some(RequestNameReply::InQueue),
            3 => Some(RequestNameReply::Exists),
            4 => Some(RequestNameReply::AlreadyOwner),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseNameReply {
    Released = 1,
    NonExistent = 2,
    NotOwner = 3,
}

impl ReleaseNameReply {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<ReleaseNameReply> {
        match code {
            1 => Some(ReleaseNameReply::Released),
            2 => Some(ReleaseNameReply::NonExistent),
            3 => Some(ReleaseNameReply::NotOwner),
            _ => None,
        }
    }
}

/// Something the bus has to announce after a registry change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NameEvent {
    /// Broadcast as `NameOwnerChanged`; `None` is sent as `""`.
    OwnerChanged {
        name: String,
        old: Option<String>,
        new: Option<String>,
    },
    /// Unicast `NameAcquired` to `owner`.
    Acquired { owner: String, name: String },
    /// Unicast `NameLost` to `owner`.
    Lost { owner: String, name: String },
}

/// Whether `name` is a valid well-known bus name like `com.acme.Foo`.
pub fn is_valid_well_known_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH || name.starts_with(':') {
        return false;
    }
    let mut elements = 0;
    for element in name.split('.') {
        elements += 1;
        let valid_chars = element
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
        let starts_ok = element.bytes().next().map_or(false, |b| !b.is_ascii_digit());
        if !valid_chars || !starts_ok {
            return false;
        }
    }
    elements >= 2
}

#[derive(Clone, Debug)]
struct Claim {
    conn: String,
    flags: NameFlags,
}

#[derive(Debug)]
struct Ownership {
    owner: Claim,
    queue: VecDeque<Claim>,
}

#[derive(Debug, Default)]
pub struct NameRegistry {
    uniques: BTreeSet<String>,
    names: BTreeMap<String, Ownership>,
}

fn invalid_args(message: String) -> Error {
    Error::Remote {
        name: INVALID_ARGS.to_owned(),
        message,
    }
}

impl NameRegistry {
    pub fn new() -> NameRegistry {
        NameRegistry::default()
    }

    /// Registers a connection's unique name.
    pub fn add_unique(&mut self, unique: &str) -> Vec<NameEvent> {
        self.uniques.insert(unique.to_owned());
        vec![
            NameEvent::OwnerChanged {
                name: unique.to_owned(),
                old: None,
                new: Some(unique.to_owned()),
            },
            NameEvent::Acquired {
                owner: unique.to_owned(),
                name: unique.to_owned(),
            },
        ]
    }

    /// Unique name of whoever owns `name`, which may itself be unique.
    pub fn owner(&self, name: &str) -> Option<&str> {
        if name.starts_with(':') {
            return self.uniques.get(name).map(String::as_str);
        }
        self.names.get(name).map(|entry| entry.owner.conn.as_str())
    }

    /// Every name with an owner, unique names included.
    pub fn names(&self) -> Vec<String> {
        self.uniques
            .iter()
            .chain(self.names.keys())
            .cloned()
            .collect()
    }

    /// The owner followed by the queue, in order.
    pub fn queued_owners(&self, name: &str) -> Option<Vec<String>> {
        let entry = self.names.get(name)?;
        Some(
            std::iter::once(&entry.owner)
                .chain(entry.queue.iter())
                .map(|claim| claim.conn.clone())
                .collect(),
        )
    }

    pub fn request_name(
        &mut self,
        conn: &str,
        name: &str,
        flags: NameFlags,
    ) -> Result<(RequestNameReply, Vec<NameEvent>)> {
        if name.starts_with(':') || name == BUS_NAME {
            return Err(invalid_args(format!("cannot request name {:?}", name)));
        }
        if !is_valid_well_known_name(name) {
            return Err(invalid_args(format!("{:?} is not a valid bus name", name)));
        }
        let claim = Claim {
            conn: conn.to_owned(),
            flags,
        };
        let entry = match self.names.entry(name.to_owned()) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(slot) => {
                slot.insert(Ownership {
                    owner: claim,
                    queue: VecDeque::new(),
                });
                return Ok((RequestNameReply::PrimaryOwner, acquired(name, None, conn)));
            }
        };

        if entry.owner.conn == conn {
            entry.owner.flags = flags;
            return Ok((RequestNameReply::AlreadyOwner, Vec::new()));
        }

        let replaceable = entry.owner.flags.contains(NameFlags::ALLOW_REPLACEMENT);
        if replaceable && flags.contains(NameFlags::REPLACE_EXISTING) {
            entry.queue.retain(|c| c.conn != conn);
            let old = std::mem::replace(&mut entry.owner, claim);
            let mut events = vec![NameEvent::Lost {
                owner: old.conn.clone(),
                name: name.to_owned(),
            }];
            events.extend(acquired(name, Some(&old.conn), conn));
            if !old.flags.contains(NameFlags::DO_NOT_QUEUE) {
                entry.queue.push_front(old);
            }
            return Ok((RequestNameReply::PrimaryOwner, events));
        }

        if flags.contains(NameFlags::DO_NOT_QUEUE) {
            entry.queue.retain(|c| c.conn != conn);
            return Ok((RequestNameReply::Exists, Vec::new()));
        }
        match entry.queue.iter_mut().find(|c| c.conn == conn) {
            Some(queued) => queued.flags = flags,
            None => entry.queue.push_back(claim),
        }
        Ok((RequestNameReply::InQueue, Vec::new()))
    }

    pub fn release_name(
        &mut self,
        conn: &str,
        name: &str,
    ) -> Result<(ReleaseNameReply, Vec<NameEvent>)> {
        if name.starts_with(':') || name == BUS_NAME {
            return Err(invalid_args(format!("cannot release name {:?}", name)));
        }
        let entry = match self.names.get_mut(name) {
            Some(entry) => entry,
            None => return Ok((ReleaseNameReply::NonExistent, Vec::new())),
        };
        if entry.owner.conn != conn {
            let before = entry.queue.len();
            entry.queue.retain(|c| c.conn != conn);
            if entry.queue.len() == before {
                return Ok((ReleaseNameReply::NotOwner, Vec::new()));
            }
            return Ok((ReleaseNameReply::Released, Vec::new()));
        }

        let mut events = vec![NameEvent::Lost {
            owner: conn.to_owned(),
            name: name.to_owned(),
        }];
        match entry.queue.pop_front() {
            Some(next) => {
                events.extend(acquired(name, Some(conn), &next.conn));
                entry.owner = next;
            }
            None => {
                self.names.remove(name);
                events.push(NameEvent::OwnerChanged {
                    name: name.to_owned(),
                    old: Some(conn.to_owned()),
                    new: None,
                });
            }
        }
        Ok((ReleaseNameReply::Released, events))
    }

    /// Drops everything `conn` owned or waited for, as on disconnect.
    pub fn remove_connection(&mut self, conn: &str) -> Vec<NameEvent> {
        let mut events = Vec::new();
        let touched: Vec<String> = self
            .names
            .iter()
            .filter(|(_, e)| e.owner.conn == conn || e.queue.iter().any(|c| c.conn == conn))
            .map(|(name, _)| name.clone())
            .collect();
        for name in touched {
            if let Ok((_, released)) = self.release_name(conn, &name) {
                // Nobody is left to tell about the loss.
                events.extend(
                    released
                        .into_iter()
                        .filter(|e| !matches!(e, NameEvent::Lost { owner, .. } if owner == conn)),
                );
            }
        }
        if self.uniques.remove(conn) {
            events.push(NameEvent::OwnerChanged {
                name: conn.to_owned(),
                old: Some(conn.to_owned()),
                new: None,
            });
        }
        events
    }
}

fn acquired(name: &str, old: Option<&str>, new: &str) -> Vec<NameEvent> {
    vec![
        NameEvent::OwnerChanged {
            name: name.to_owned(),
            old: old.map(str::to_owned),
            new: Some(new.to_owned()),
        },
        NameEvent::Acquired {
            owner: new.to_owned(),
            name: name.to_owned(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::{
        is_valid_well_known_name, NameEvent, NameFlags, NameRegistry, ReleaseNameReply,
        RequestNameReply,
    };
    use crate::error::{Error, Result};
    use test_log::test;

    const NAME: &str = "com.acme.Foo";

    fn changed(old: Option<&str>, new: Option<&str>) -> NameEvent {
        NameEvent::OwnerChanged {
            name: NAME.to_owned(),
            old: old.map(str::to_owned),
            new: new.map(str::to_owned),
        }
    }

    #[test]
    fn name_syntax() {
        for ok in &["com.acme.Foo", "a.b", "org._x.y-z"] {
            assert!(is_valid_well_known_name(ok), "{}", ok);
        }
        for bad in &["", "com", ":1.2", "com..acme", "com.1acme", "com.acme!", ".com.acme"] {
            assert!(!is_valid_well_known_name(bad), "{}", bad);
        }
    }

    #[test]
    fn first_come_first_served() -> Result<()> {
        let mut names = NameRegistry::new();
        names.add_unique(":1.1");
        names.add_unique(":1.2");
        let (reply, events) = names.request_name(":1.1", NAME, NameFlags::empty())?;
        assert_eq!(reply, RequestNameReply::PrimaryOwner);
        assert_eq!(events[0], changed(None, Some(":1.1")));

        let (reply, _) = names.request_name(":1.2", NAME, NameFlags::DO_NOT_QUEUE)?;
        assert_eq!(reply, RequestNameReply::Exists);
        let (reply, _) = names.request_name(":1.2", NAME, NameFlags::REPLACE_EXISTING)?;
        assert_eq!(reply, RequestNameReply::InQueue, "owner did not allow replacement");
        let (reply, _) = names.request_name(":1.1", NAME, NameFlags::empty())?;
        assert_eq!(reply, RequestNameReply::AlreadyOwner);
        assert_eq!(
            names.queued_owners(NAME),
            Some(vec![":1.1".to_owned(), ":1.2".to_owned()])
        );

        let events = names.remove_connection(":1.1");
        assert!(events.contains(&changed(Some(":1.1"), Some(":1.2"))));
        assert!(events.contains(&NameEvent::Acquired {
            owner: ":1.2".to_owned(),
            name: NAME.to_owned()
        }));
        assert_eq!(names.owner(NAME), Some(":1.2"));
        assert_eq!(names.owner(":1.1"), None);
        Ok(())
    }

    #[test]
    fn replacement() -> Result<()> {
        let mut names = NameRegistry::new();
        names.request_name(":1.1", NAME, NameFlags::ALLOW_REPLACEMENT)?;
        let (reply, events) = names.request_name(":1.2", NAME, NameFlags::REPLACE_EXISTING)?;
        assert_eq!(reply, RequestNameReply::PrimaryOwner);
        assert!(events.contains(&NameEvent::Lost {
            owner: ":1.1".to_owned(),
            name: NAME.to_owned()
        }));
        assert!(events.contains(&changed(Some(":1.1"), Some(":1.2"))));
        assert_eq!(
            names.queued_owners(NAME),
            Some(vec![":1.2".to_owned(), ":1.1".to_owned()])
        );

        let mut names = NameRegistry::new();
        names.request_name(
            ":1.1",
            NAME,
            NameFlags::ALLOW_REPLACEMENT | NameFlags::DO_NOT_QUEUE,
        )?;
        names.request_name(":1.2", NAME, NameFlags::REPLACE_EXISTING)?;
        assert_eq!(names.queued_owners(NAME), Some(vec![":1.2".to_owned()]));
        Ok(())
    }

    #[test]
    fn release() -> Result<()> {
        let mut names = NameRegistry::new();
        assert_eq!(
            names.release_name(":1.1", NAME)?.0,
            ReleaseNameReply::NonExistent
        );
        names.request_name(":1.1", NAME, NameFlags::empty())?;
        names.request_name(":1.3", NAME, NameFlags::empty())?;
        assert_eq!(names.release_name(":1.2", NAME)?.0, ReleaseNameReply::NotOwner);
        assert_eq!(names.release_name(":1.3", NAME)?, (ReleaseNameReply::Released, vec![]));
        let (reply, events) = names.release_name(":1.1", NAME)?;
        assert_eq!(reply, ReleaseNameReply::Released);
        assert!(events.contains(&changed(Some(":1.1"), None)));
        assert_eq!(names.owner(NAME), None);
        Ok(())
    }

    #[test]
    fn reserved_names() {
        let mut names = NameRegistry::new();
        for bad in &[":1.5", "org.freedesktop.DBus", "nodots"] {
            match names.request_name(":1.1", bad, NameFlags::empty()) {
                Err(Error::Remote { name, .. }) => {
                    assert_eq!(name, "org.freedesktop.DBus.Error.InvalidArgs")
                }
                other => panic!("{} gave {:?}", bad, other),
            }
        }
    }
}
