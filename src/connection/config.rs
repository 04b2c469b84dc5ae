use crate::auth::cookie::Keyring;
use crate::auth::{AuthClient, Mechanism};
use crate::error::{Error, Result};

use serde::{Deserialize, Serialize};

use std::path::PathBuf;
use std::time::Duration;

/// Settings for a [`Connection`](super::Connection).
///
/// Every field has a default, so a TOML file only needs the keys it
/// changes:
///
/// ```toml
/// default_timeout = 5000
/// method_call_workers = 8
/// auth_mechanisms = ["EXTERNAL", "ANONYMOUS"]
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionConfig {
    /// Timeout of synchronous calls, in milliseconds.
    pub default_timeout: u64,
    pub signal_workers: usize,
    pub method_call_workers: usize,
    pub method_return_workers: usize,
    pub error_workers: usize,
    /// Send `Hello` after authenticating. Off for peer-to-peer links.
    pub register_with_bus: bool,
    pub negotiate_unix_fd: bool,
    /// Tried in this order.
    pub auth_mechanisms: Vec<Mechanism>,
    /// Cookie keyring directory, `~/.dbus-keyrings` when unset.
    pub keyring_dir: Option<PathBuf>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            default_timeout: 25_000,
            signal_workers: 1,
            method_call_workers: 4,
            method_return_workers: 1,
            error_workers: 1,
            register_with_bus: true,
            negotiate_unix_fd: false,
            auth_mechanisms: Mechanism::ALL.to_vec(),
            keyring_dir: None,
        }
    }
}

impl ConnectionConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|err| Error::Deserializing(err.to_string()))
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout)
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout.as_millis() as u64;
        self
    }

    pub fn with_signal_workers(mut self, workers: usize) -> Self {
        self.signal_workers = workers;
        self
    }

    pub fn with_method_call_workers(mut self, workers: usize) -> Self {
        self.method_call_workers = workers;
        self
    }

    pub fn with_register_with_bus(mut self, register: bool) -> Self {
        self.register_with_bus = register;
        self
    }

    pub fn with_auth_mechanisms(mut self, mechanisms: Vec<Mechanism>) -> Self {
        self.auth_mechanisms = mechanisms;
        self
    }

    pub fn with_keyring_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.keyring_dir = Some(dir.into());
        self
    }

    pub(crate) fn keyring(&self) -> Keyring {
        match &self.keyring_dir {
            Some(dir) => Keyring::new(dir),
            None => Keyring::default(),
        }
    }

    pub(crate) fn auth_client(&self, fd_capable: bool) -> AuthClient {
        AuthClient {
            mechanisms: self.auth_mechanisms.clone(),
            negotiate_unix_fd: self.negotiate_unix_fd && fd_capable,
            keyring: self.keyring(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionConfig;
    use crate::auth::Mechanism;
    use crate::error::{Error, Result};
    use std::time::Duration;
    use test_log::test;

    #[test]
    fn partial_toml() -> Result<()> {
        let config = ConnectionConfig::from_toml_str(
            r#"
            default_timeout = 500
            method_call_workers = 2
            auth_mechanisms = ["ANONYMOUS"]
            "#,
        )?;
        assert_eq!(config.default_timeout(), Duration::from_millis(500));
        assert_eq!(config.method_call_workers, 2);
        assert_eq!(config.signal_workers, 1);
        assert_eq!(config.auth_mechanisms, vec![Mechanism::Anonymous]);
        assert!(config.register_with_bus);
        Ok(())
    }

    #[test]
    fn bad_toml() {
        for bad in &["default_timeout = \"soon\"", "no_such_key = 1", "auth_mechanisms = [\"PLAIN\"]"] {
            assert!(matches!(
                ConnectionConfig::from_toml_str(bad),
                Err(Error::Deserializing(_))
            ));
        }
    }

    #[test]
    fn fd_negotiation_needs_capable_transport() {
        let mut config = ConnectionConfig::default();
        config.negotiate_unix_fd = true;
        assert!(!config.auth_client(false).negotiate_unix_fd);
        assert!(config.auth_client(true).negotiate_unix_fd);
    }
}
