//! The `~/.dbus-keyrings` store used by DBUS_COOKIE_SHA1.
//!
//! Each context is one file of `id timestamp cookie` lines. Writers take
//! a `<context>.lock` file, write `<context>.temp` and rename it over the
//! keyring so readers never see a half-written file.

use crate::error::{Error, Result};
use log::{debug, trace, warn};

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub const DEFAULT_CONTEXT: &str = "org_freedesktop_general";

/// Cookies older than this are dropped when the keyring is rewritten.
pub const COOKIE_TIMEOUT: u64 = 240;
const EXPIRE_KEYS_TIMEOUT: u64 = 7 * 60;
const MAX_TIME_TRAVEL: u64 = 5 * 60;
const LOCK_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Clone, Debug)]
pub struct Keyring {
    dir: PathBuf,
}

impl Default for Keyring {
    /// `~/.dbus-keyrings` of the current user.
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(std::env::temp_dir);
        Keyring::new(home.join(".dbus-keyrings"))
    }
}

fn check_context(context: &str) -> Result<()> {
    let bad = context.is_empty()
        || context
            .chars()
            .any(|c| c == '/' || c == '\\' || c == '.' || c.is_whitespace());
    if bad {
        return Err(Error::AuthenticationFailed(format!(
            "invalid cookie context {:?}",
            context
        )));
    }
    Ok(())
}

struct LockFile(PathBuf);

impl LockFile {
    fn acquire(path: PathBuf) -> Result<LockFile> {
        let start = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(LockFile(path)),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    if start.elapsed() > LOCK_TIMEOUT {
                        // Whoever held it is gone; break the lock.
                        warn!("breaking stale keyring lock {}", path.display());
                        fs::remove_file(&path)?;
                        continue;
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.0);
    }
}

fn create_private_dir(dir: &Path) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)
}

fn create_private_file(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

struct Entry<'a> {
    id: &'a str,
    timestamp: u64,
    cookie: &'a str,
}

fn parse_line(line: &str) -> Option<Entry<'_>> {
    let mut parts = line.split(' ');
    let id = parts.next()?;
    let timestamp = parts.next()?.parse().ok()?;
    let cookie = parts.next()?;
    Some(Entry {
        id,
        timestamp,
        cookie,
    })
}

impl Keyring {
    pub fn new(dir: impl Into<PathBuf>) -> Keyring {
        Keyring { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read(&self, context: &str) -> Result<String> {
        check_context(context)?;
        match fs::read_to_string(self.dir.join(context)) {
            Ok(contents) => Ok(contents),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(err) => Err(err.into()),
        }
    }

    /// The cookie stored under `id`, unless it is missing or out of date.
    pub fn find_cookie(&self, context: &str, id: &str) -> Result<Option<String>> {
        let now = now_secs();
        let contents = self.read(context)?;
        let found = contents
            .lines()
            .filter_map(parse_line)
            .find(|entry| {
                entry.id == id
                    && entry.timestamp <= now + MAX_TIME_TRAVEL
                    && entry.timestamp + EXPIRE_KEYS_TIMEOUT >= now
            })
            .map(|entry| entry.cookie.to_owned());
        trace!("cookie {} in {}: found={}", id, context, found.is_some());
        Ok(found)
    }

    /// Adds a cookie, dropping the ones that expired relative to
    /// `timestamp`.
    pub fn add_cookie(&self, context: &str, id: &str, timestamp: u64, cookie: &str) -> Result<()> {
        check_context(context)?;
        create_private_dir(&self.dir)?;
        let _lock = LockFile::acquire(self.dir.join(format!("{}.lock", context)))?;

        let contents = self.read(context)?;
        let mut lines: Vec<String> = contents
            .lines()
            .filter(|line| {
                parse_line(line).map_or(false, |entry| {
                    entry.id != id && timestamp.saturating_sub(entry.timestamp) < COOKIE_TIMEOUT
                })
            })
            .map(str::to_owned)
            .collect();
        lines.push(format!("{} {} {}", id, timestamp, cookie));

        let temp = self.dir.join(format!("{}.temp", context));
        let mut file = create_private_file(&temp)?;
        for line in &lines {
            writeln!(file, "{}", line)?;
        }
        file.sync_all()?;
        fs::rename(&temp, self.dir.join(context))?;
        debug!("keyring {} now holds {} cookies", context, lines.len());
        Ok(())
    }
}
