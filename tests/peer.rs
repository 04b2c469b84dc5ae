mod common;

use common::{calculator, WAIT};
use dbus_core::address::BusAddress;
use dbus_core::auth::cookie::Keyring;
use dbus_core::auth::{AuthServer, Mechanism};
use dbus_core::connection::proxy::{InterfaceSpec, RemoteInterface};
use dbus_core::connection::{Connection, ConnectionConfig};
use dbus_core::error::{Error, Result};
use dbus_core::transport::tcp::TcpProvider;
use dbus_core::transport::{generate_guid, TransportProvider, TransportRegistry};
use std::sync::Arc;
use std::thread;
use test_log::test;

fn client_config(keyrings: &std::path::Path) -> ConnectionConfig {
    ConnectionConfig::default()
        .with_register_with_bus(false)
        .with_default_timeout(WAIT)
        .with_keyring_dir(keyrings)
}

#[test]
fn direct_connection_with_cookie_auth() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let keyrings = dir.path().join("keyrings");
    let acceptor = TcpProvider.listen(&BusAddress::parse("tcp:host=127.0.0.1,port=0")?)?;
    let address = acceptor.local_address();

    let server_keyrings = keyrings.clone();
    let server = thread::spawn(move || -> Result<Connection> {
        let stream = acceptor.accept()?;
        let mut auth = AuthServer::new(&generate_guid());
        auth.mechanisms = vec![Mechanism::CookieSha1];
        auth.keyring = Keyring::new(&server_keyrings);
        let conn = Connection::accept_peer(stream, &auth, ConnectionConfig::default())?;
        conn.export_object("/calc", calculator())?;
        Ok(conn)
    });

    let config = client_config(&keyrings)
        .with_auth_mechanisms(vec![Mechanism::Anonymous, Mechanism::CookieSha1]);
    let client = Connection::open(&[address], config)?;
    let server = server.join().expect("server thread panicked")?;
    assert_eq!(client.guid(), server.guid());
    assert!(client.unique_name().is_none());
    assert!(!client.supports_unix_fd());

    let spec = InterfaceSpec::new("com.acme.Calc")
        .method("Add", "ii", "i")?
        .method("Echo", "s", "s")?;
    let calc = RemoteInterface::bind(&client, None, "/calc", spec)?;
    let sum: i32 = calc.call("Add", (5i32, 6i32))?;
    assert_eq!(sum, 11);
    let echoed: String = calc.call("Echo", ("back",))?;
    assert_eq!(echoed, "back");
    client.close()?;
    server.close()?;
    Ok(())
}

#[test]
fn no_common_mechanism() -> Result<()> {
    let acceptor = TcpProvider.listen(&BusAddress::parse("tcp:host=127.0.0.1,port=0")?)?;
    let address = acceptor.local_address();
    let server = thread::spawn(move || -> Result<()> {
        let mut stream = acceptor.accept()?;
        let mut auth = AuthServer::new(&generate_guid());
        auth.mechanisms = vec![Mechanism::Anonymous];
        // The client hangs up once it runs out of mechanisms.
        assert!(auth.authenticate(&mut *stream, None).is_err());
        Ok(())
    });
    let config = ConnectionConfig::default()
        .with_register_with_bus(false)
        .with_auth_mechanisms(vec![Mechanism::External]);
    match Connection::open(&[address], config) {
        Err(Error::AuthenticationFailed(_)) => (),
        Err(other) => panic!("unexpected error {:?}", other),
        Ok(_) => panic!("authenticated without a common mechanism"),
    }
    server.join().expect("server thread panicked")
}

#[test]
fn transport_selection() -> Result<()> {
    let acceptor = TcpProvider.listen(&BusAddress::parse("tcp:host=127.0.0.1,port=0")?)?;
    let good = acceptor.local_address();
    let candidates = BusAddress::parse_all(&format!(
        "carrier-pigeon:coop=3;tcp:host=127.0.0.1;{}",
        good
    ))?;

    let mut registry = TransportRegistry::empty();
    match Connection::open_with(&registry, &candidates, ConnectionConfig::default()) {
        Err(Error::TransportConfiguration(why)) => {
            assert!(why.contains("carrier-pigeon"), "{}", why)
        }
        Err(other) => panic!("unexpected error {:?}", other),
        Ok(_) => panic!("connected without any transport"),
    }

    registry.register(Arc::new(TcpProvider));
    let server = thread::spawn(move || -> Result<Connection> {
        let stream = acceptor.accept()?;
        let auth = AuthServer::new(&generate_guid());
        Connection::accept_peer(stream, &auth, ConnectionConfig::default())
    });
    let config = ConnectionConfig::default().with_register_with_bus(false);
    let client = Connection::open_with(&registry, &candidates, config)?;
    let server = server.join().expect("server thread panicked")?;
    assert!(client.is_connected());
    client.close()?;
    server.close()?;
    Ok(())
}
