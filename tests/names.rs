mod common;

use common::{string_args, wait_for, Bus, WAIT};
use dbus_core::daemon::names::{NameFlags, ReleaseNameReply, RequestNameReply};
use dbus_core::error::{Error, Result};
use dbus_core::match_rule::MatchRule;
use std::sync::mpsc;
use test_log::test;

const BUS: &str = "org.freedesktop.DBus";

#[test]
fn registration() -> Result<()> {
    let bus = Bus::start()?;
    let a = bus.connect()?;
    let b = bus.connect()?;
    let a_name = a.unique_name().unwrap_or_default();
    let b_name = b.unique_name().unwrap_or_default();
    assert!(a_name.starts_with(":1."), "{}", a_name);
    assert_ne!(a_name, b_name);
    assert_eq!(a.guid(), bus.daemon.guid());

    let names = a.list_names()?;
    assert!(names.contains(&BUS.to_owned()));
    assert!(names.contains(&a_name) && names.contains(&b_name));
    assert_eq!(a.get_name_owner(&b_name)?, b_name);
    assert!(a.name_has_owner(BUS)?);
    let id: String = a.call_method(Some(BUS), "/org/freedesktop/DBus", Some(BUS), "GetId", ())?;
    assert_eq!(id, bus.daemon.guid());
    Ok(())
}

#[test]
fn ownership_queue_and_disconnect() -> Result<()> {
    let bus = Bus::start()?;
    let a = bus.connect()?;
    let b = bus.connect()?;
    let watcher = bus.connect()?;
    let (tx, rx) = mpsc::channel();
    watcher.add_signal_handler(
        MatchRule::new()
            .with_sender(BUS)
            .with_interface(BUS)
            .with_member("NameOwnerChanged"),
        move |msg| {
            let _ = tx.send(string_args(msg));
        },
    )?;
    let a_name = a.unique_name().unwrap_or_default();
    let b_name = b.unique_name().unwrap_or_default();
    let changed = |name: &str, old: &str, new: &str| {
        let want = vec![name.to_owned(), old.to_owned(), new.to_owned()];
        wait_for(&rx, |args| *args == want).is_some()
    };

    assert_eq!(a.request_name("com.acme.Svc", NameFlags::empty())?, RequestNameReply::PrimaryOwner);
    assert!(changed("com.acme.Svc", "", &a_name));
    assert_eq!(a.request_name("com.acme.Svc", NameFlags::empty())?, RequestNameReply::AlreadyOwner);
    assert_eq!(a.request_name("com.acme.Solo", NameFlags::empty())?, RequestNameReply::PrimaryOwner);

    assert_eq!(
        b.request_name("com.acme.Svc", NameFlags::DO_NOT_QUEUE)?,
        RequestNameReply::Exists
    );
    assert_eq!(b.request_name("com.acme.Svc", NameFlags::empty())?, RequestNameReply::InQueue);
    let queue: Vec<String> = b.call_method(
        Some(BUS),
        "/org/freedesktop/DBus",
        Some(BUS),
        "ListQueuedOwners",
        ("com.acme.Svc",),
    )?;
    assert_eq!(queue, vec![a_name.clone(), b_name.clone()]);
    assert_eq!(b.get_name_owner("com.acme.Svc")?, a_name);

    a.close()?;
    let mut expected = vec![
        vec!["com.acme.Svc".to_owned(), a_name.clone(), b_name.clone()],
        vec!["com.acme.Solo".to_owned(), a_name.clone(), String::new()],
        vec![a_name.clone(), a_name.clone(), String::new()],
    ];
    while !expected.is_empty() {
        let args = rx.recv_timeout(WAIT).expect("NameOwnerChanged after disconnect");
        expected.retain(|e| *e != args);
    }
    assert_eq!(b.get_name_owner("com.acme.Svc")?, b_name);

    assert_eq!(b.release_name("com.acme.Svc")?, ReleaseNameReply::Released);
    assert!(changed("com.acme.Svc", &b_name, ""));
    assert_eq!(b.release_name("com.acme.Svc")?, ReleaseNameReply::NonExistent);
    assert!(!b.name_has_owner("com.acme.Svc")?);
    match b.get_name_owner("com.acme.Svc") {
        Err(Error::Remote { name, .. }) => {
            assert_eq!(name, "org.freedesktop.DBus.Error.NameHasNoOwner")
        }
        other => panic!("unexpected {:?}", other),
    }
    Ok(())
}

#[test]
fn replacement_and_acquired_signals() -> Result<()> {
    let bus = Bus::start()?;
    let a = bus.connect()?;
    let b = bus.connect()?;
    let (lost_tx, lost) = mpsc::channel();
    let (acquired_tx, acquired) = mpsc::channel();
    a.add_signal_handler(MatchRule::new().with_sender(BUS).with_member("NameLost"), move |msg| {
        let _ = lost_tx.send(string_args(msg));
    })?;
    b.add_signal_handler(MatchRule::new().with_sender(BUS).with_member("NameAcquired"), move |msg| {
        let _ = acquired_tx.send(string_args(msg));
    })?;

    let flags = NameFlags::ALLOW_REPLACEMENT;
    assert_eq!(a.request_name("com.acme.Svc", flags)?, RequestNameReply::PrimaryOwner);
    assert_eq!(
        b.request_name("com.acme.Svc", NameFlags::REPLACE_EXISTING)?,
        RequestNameReply::PrimaryOwner
    );
    // The two connections see their signals in no particular order.
    let svc = vec!["com.acme.Svc".to_owned()];
    assert!(wait_for(&lost, |args| args == &svc).is_some());
    assert!(wait_for(&acquired, |args| args == &svc).is_some());
    assert_eq!(a.get_name_owner("com.acme.Svc")?, b.unique_name().unwrap_or_default());
    // The replaced owner waits in line.
    assert_eq!(b.release_name("com.acme.Svc")?, ReleaseNameReply::Released);
    assert_eq!(b.get_name_owner("com.acme.Svc")?, a.unique_name().unwrap_or_default());
    Ok(())
}

#[test]
fn reserved_and_invalid_names() -> Result<()> {
    let bus = Bus::start()?;
    let a = bus.connect()?;
    let own_unique = a.unique_name().unwrap_or_default();
    for name in [BUS, own_unique.as_str(), "nodots"] {
        match a.request_name(name, NameFlags::empty()) {
            Err(Error::Remote { name, .. }) => {
                assert_eq!(name, "org.freedesktop.DBus.Error.InvalidArgs")
            }
            other => panic!("{} gave {:?}", name, other),
        }
    }
    Ok(())
}
