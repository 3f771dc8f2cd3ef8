//! Named read/write locks on a dictionary table, backed by marker files.
//!
//! # Layout
//!
//! ```text
//! data/
//! ├── samples.gord
//! └── .samples.gord.locks/
//!     ├── bucketize.guard                   flock'd while markers are checked
//!     ├── bucketize.write.lock              {"holder": ..., "expires_at_ms": ...}
//!     └── bucketize.read.<token>.lock       one per reader
//! ```
//!
//! A marker whose `expires_at_ms` has passed is stale and treated as absent.
//! Every check-and-create runs while holding the guard, so two processes on
//! one host never interleave their checks. Write markers are also created
//! with create-new semantics.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::LockConfig;
use crate::error::{Error, Result};
use crate::flock::FileLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockKind {
    Read,
    Write,
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKind::Read => write!(f, "read"),
            LockKind::Write => write!(f, "write"),
        }
    }
}

/// Persisted lock record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMarker {
    pub table: String,
    pub name: String,
    pub kind: LockKind,
    pub holder: String,
    pub host: String,
    pub pid: u32,
    pub acquired_at_ms: u64,
    pub expires_at_ms: u64,
}

impl LockMarker {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

/// Lock service for one table.
#[derive(Debug, Clone)]
pub struct TableLocks {
    table: String,
    dir: PathBuf,
    config: LockConfig,
}

impl TableLocks {
    pub fn new(table_path: impl AsRef<Path>, config: LockConfig) -> Self {
        let table_path = table_path.as_ref();
        let file_name = table_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "table".to_string());
        let dir = table_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(format!(".{}.locks", file_name));
        Self {
            table: table_path.display().to_string(),
            dir,
            config,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    pub fn acquire_read(&self, name: &str, timeout: Duration) -> Result<TableLock> {
        self.acquire(name, LockKind::Read, timeout)
    }

    pub fn acquire_write(&self, name: &str, timeout: Duration) -> Result<TableLock> {
        self.acquire(name, LockKind::Write, timeout)
    }

    /// Markers currently held for `name`, stale ones included.
    pub fn markers(&self, name: &str) -> Result<Vec<LockMarker>> {
        let mut markers = Vec::new();
        if let Some(marker) = read_marker(&self.write_marker_path(name))? {
            markers.push(marker);
        }
        for path in self.read_marker_paths(name)? {
            if let Some(marker) = read_marker(&path)? {
                markers.push(marker);
            }
        }
        Ok(markers)
    }

    fn acquire(&self, name: &str, kind: LockKind, timeout: Duration) -> Result<TableLock> {
        validate_name(name)?;
        fs::create_dir_all(&self.dir).map_err(|e| self.lock_io(&self.dir, e))?;

        let token = new_token();
        let deadline = Instant::now() + timeout;
        let mut backoff = self.config.initial_backoff;

        loop {
            if let Some(lock) = self.try_acquire(name, kind, &token)? {
                info!(
                    table = %self.table,
                    name,
                    kind = %kind,
                    holder = %lock.holder,
                    "acquired table lock"
                );
                return Ok(lock);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::LockTimeout {
                    table: self.table.clone(),
                    name: name.to_string(),
                    kind,
                    timeout,
                });
            }
            let delay = backoff.min(deadline - now);
            debug!(table = %self.table, name, kind = %kind, ?delay, "lock busy, retrying");
            std::thread::sleep(delay);
            backoff = (backoff * 2).min(self.config.max_backoff);
        }
    }

    /// One guarded attempt. `None` when the lock is busy.
    fn try_acquire(&self, name: &str, kind: LockKind, token: &str) -> Result<Option<TableLock>> {
        let _guard = self.guard(name)?;
        let now = now_ms();
        let write_path = self.write_marker_path(name);

        if self.live_marker(&write_path, now)?.is_some() {
            return Ok(None);
        }

        let marker_path = match kind {
            LockKind::Write => {
                if self.live_read_markers(name, now)? > 0 {
                    return Ok(None);
                }
                write_path
            }
            LockKind::Read => self.dir.join(format!("{}.read.{}.lock", name, token)),
        };

        let host = hostname();
        let marker = LockMarker {
            table: self.table.clone(),
            name: name.to_string(),
            kind,
            holder: format!("{}:{}", host, token),
            host,
            pid: std::process::id(),
            acquired_at_ms: now,
            expires_at_ms: now + duration_ms(self.config.period),
        };
        match create_marker(&marker_path, &marker) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(self.lock_io(&marker_path, e)),
        }

        // Re-check for a conflicting lock placed while we reclaimed stale
        // markers, by a process that skipped the guard.
        let conflict = match kind {
            LockKind::Write => self.live_read_markers(name, now)? > 0,
            LockKind::Read => self
                .live_marker(&self.write_marker_path(name), now)?
                .is_some(),
        };
        if conflict {
            remove_marker(&marker_path).map_err(|e| self.lock_io(&marker_path, e))?;
            return Ok(None);
        }

        Ok(Some(TableLock {
            table: self.table.clone(),
            name: name.to_string(),
            kind,
            holder: marker.holder,
            marker_path,
            guard_path: self.guard_path(name),
            period: self.config.period,
            expires_at_ms: marker.expires_at_ms,
            released: false,
        }))
    }

    /// The marker at `path` if it is valid. Stale or corrupt markers are
    /// removed.
    fn live_marker(&self, path: &Path, now: u64) -> Result<Option<LockMarker>> {
        match read_marker(path) {
            Ok(Some(marker)) if !marker.is_expired(now) => Ok(Some(marker)),
            Ok(Some(marker)) => {
                warn!(
                    table = %self.table,
                    name = %marker.name,
                    holder = %marker.holder,
                    expired_ms_ago = now - marker.expires_at_ms,
                    "reclaiming stale lock"
                );
                remove_marker(path).map_err(|e| self.lock_io(path, e))?;
                Ok(None)
            }
            Ok(None) => Ok(None),
            Err(Error::Json(err)) => {
                warn!(table = %self.table, path = %path.display(), error = %err, "removing corrupt lock marker");
                remove_marker(path).map_err(|e| self.lock_io(path, e))?;
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn live_read_markers(&self, name: &str, now: u64) -> Result<usize> {
        let mut live = 0;
        for path in self.read_marker_paths(name)? {
            if self.live_marker(&path, now)?.is_some() {
                live += 1;
            }
        }
        Ok(live)
    }

    fn read_marker_paths(&self, name: &str) -> Result<Vec<PathBuf>> {
        let prefix = format!("{}.read.", name);
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.lock_io(&self.dir, e)),
        };
        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| self.lock_io(&self.dir, e))?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if file_name.starts_with(&prefix) && file_name.ends_with(".lock") {
                paths.push(entry.path());
            }
        }
        paths.sort();
        Ok(paths)
    }

    fn guard(&self, name: &str) -> Result<FileLock> {
        let path = self.guard_path(name);
        FileLock::lock(&path).map_err(|e| self.lock_io(&path, e))
    }

    fn guard_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.guard", name))
    }

    fn write_marker_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.write.lock", name))
    }

    fn lock_io(&self, path: &Path, source: io::Error) -> Error {
        Error::LockIo {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A held lock. Released on drop.
#[derive(Debug)]
pub struct TableLock {
    table: String,
    name: String,
    kind: LockKind,
    holder: String,
    marker_path: PathBuf,
    guard_path: PathBuf,
    period: Duration,
    expires_at_ms: u64,
    released: bool,
}

impl TableLock {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> LockKind {
        self.kind
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn expires_at_ms(&self) -> u64 {
        self.expires_at_ms
    }

    /// True while our marker is in place and not expired.
    pub fn is_valid(&self) -> bool {
        if self.released {
            return false;
        }
        match read_marker(&self.marker_path) {
            Ok(Some(marker)) => marker.holder == self.holder && !marker.is_expired(now_ms()),
            _ => false,
        }
    }

    /// Pushes the expiry one lock period into the future.
    pub fn renew(&mut self) -> Result<()> {
        let _guard = self.guard()?;
        let mut marker = self.owned_marker()?;
        let now = now_ms();
        if marker.is_expired(now) {
            return Err(self.lost());
        }
        marker.expires_at_ms = now + duration_ms(self.period);
        replace_marker(&self.marker_path, &marker).map_err(|e| Error::LockIo {
            path: self.marker_path.clone(),
            source: e,
        })?;
        self.expires_at_ms = marker.expires_at_ms;
        debug!(table = %self.table, name = %self.name, expires_at_ms = self.expires_at_ms, "renewed table lock");
        Ok(())
    }

    /// Keeps the lock for `duration`, sleeping at most half a lock period
    /// between renewals so the marker never goes stale while held.
    pub fn hold(&mut self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        let slice = (self.period / 2).max(Duration::from_millis(1));
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep(slice.min(deadline - now));
            self.renew()?;
        }
    }

    /// Removes the marker. Fails with `LockLost` if the marker is gone or
    /// belongs to someone else; the lock counts as released either way.
    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let _guard = self.guard()?;
        self.owned_marker()?;
        remove_marker(&self.marker_path).map_err(|e| Error::LockIo {
            path: self.marker_path.clone(),
            source: e,
        })?;
        debug!(table = %self.table, name = %self.name, kind = %self.kind, "released table lock");
        Ok(())
    }

    fn owned_marker(&self) -> Result<LockMarker> {
        match read_marker(&self.marker_path) {
            Ok(Some(marker)) if marker.holder == self.holder => Ok(marker),
            Ok(_) | Err(Error::Json(_)) => Err(self.lost()),
            Err(err) => Err(err),
        }
    }

    fn guard(&self) -> Result<FileLock> {
        FileLock::lock(&self.guard_path).map_err(|e| Error::LockIo {
            path: self.guard_path.clone(),
            source: e,
        })
    }

    fn lost(&self) -> Error {
        Error::LockLost {
            table: self.table.clone(),
            name: self.name.clone(),
            holder: self.holder.clone(),
        }
    }
}

impl Drop for TableLock {
    fn drop(&mut self) {
        if let Err(err) = self.release_inner() {
            warn!(table = %self.table, name = %self.name, error = %err, "failed to release table lock");
        }
    }
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
        return Err(Error::InvalidConfig(format!("invalid lock name '{}'", name)));
    }
    Ok(())
}

fn read_marker(path: &Path) -> Result<Option<LockMarker>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::LockIo {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

fn create_marker(path: &Path, marker: &LockMarker) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    serde_json::to_writer_pretty(&mut file, marker)?;
    file.write_all(b"\n")?;
    file.sync_all()
}

fn replace_marker(path: &Path, marker: &LockMarker) -> io::Result<()> {
    let tmp = path.with_extension("lock.tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp)?;
    serde_json::to_writer_pretty(&mut file, marker)?;
    file.write_all(b"\n")?;
    file.sync_all()?;
    fs::rename(&tmp, path)
}

fn remove_marker(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(duration_ms)
        .unwrap_or(0)
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn new_token() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    format!(
        "{}-{:08x}-{}",
        std::process::id(),
        nanos,
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

#[cfg(unix)]
pub fn hostname() -> String {
    let mut buf = [0u8; 256];
    let result = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if result != 0 {
        return "localhost".to_string();
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..len]).into_owned()
}

#[cfg(not(unix))]
pub fn hostname() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn locks(dir: &Path) -> TableLocks {
        TableLocks::new(
            dir.join("samples.gord"),
            LockConfig::default().backoff(Duration::from_millis(1), Duration::from_millis(10)),
        )
    }

    #[test]
    fn test_marker_layout_and_contents() {
        let dir = tempfile::tempdir().unwrap();
        let locks = locks(dir.path());
        let lock = locks.acquire_write("bucketize", Duration::from_secs(1)).unwrap();

        assert_eq!(locks.dir(), dir.path().join(".samples.gord.locks"));
        let path = locks.dir().join("bucketize.write.lock");
        let marker: LockMarker = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(marker.kind, LockKind::Write);
        assert_eq!(marker.name, "bucketize");
        assert_eq!(marker.pid, std::process::id());
        assert_eq!(marker.holder, lock.holder());
        assert!(marker.expires_at_ms > marker.acquired_at_ms);

        lock.release().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_readers_share_writers_wait() {
        let dir = tempfile::tempdir().unwrap();
        let locks = locks(dir.path());

        let r1 = locks.acquire_read("data", Duration::from_secs(1)).unwrap();
        let r2 = locks.acquire_read("data", Duration::from_secs(1)).unwrap();
        assert!(r1.is_valid() && r2.is_valid());

        let err = locks
            .acquire_write("data", Duration::from_millis(30))
            .unwrap_err();
        assert!(matches!(err, Error::LockTimeout { kind: LockKind::Write, .. }));

        drop(r1);
        drop(r2);
        let w = locks.acquire_write("data", Duration::from_secs(1)).unwrap();
        assert!(matches!(
            locks.acquire_read("data", Duration::from_millis(30)),
            Err(Error::LockTimeout { kind: LockKind::Read, .. })
        ));
        // Other names are independent.
        locks.acquire_write("other", Duration::from_millis(30)).unwrap();
        drop(w);
    }

    #[test]
    fn test_stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let short = TableLocks::new(
            dir.path().join("samples.gord"),
            LockConfig::default()
                .period(Duration::from_millis(20))
                .backoff(Duration::from_millis(1), Duration::from_millis(5)),
        );
        let mut stale = short.acquire_write("bucketize", Duration::from_secs(1)).unwrap();
        std::thread::sleep(Duration::from_millis(40));
        assert!(!stale.is_valid());

        let fresh = locks(dir.path())
            .acquire_write("bucketize", Duration::from_secs(1))
            .unwrap();
        assert!(fresh.is_valid());
        assert!(matches!(stale.renew(), Err(Error::LockLost { .. })));
        // Releasing the stale handle must not remove the new holder's marker.
        drop(stale);
        assert!(fresh.is_valid());
    }

    #[test]
    fn test_renew_extends_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let locks = TableLocks::new(
            dir.path().join("samples.gord"),
            LockConfig::default().period(Duration::from_millis(200)),
        );
        let mut lock = locks.acquire_write("bucketize", Duration::from_secs(1)).unwrap();
        let before = lock.expires_at_ms();
        std::thread::sleep(Duration::from_millis(20));
        lock.renew().unwrap();
        assert!(lock.expires_at_ms() > before);
        assert!(lock.is_valid());
    }

    #[test]
    fn test_invalid_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let locks = locks(dir.path());
        assert!(locks.acquire_write("", Duration::ZERO).is_err());
        assert!(locks.acquire_write("../escape", Duration::ZERO).is_err());
    }

    #[test]
    fn test_concurrent_writers_are_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let locks = Arc::new(locks(dir.path()));
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let locks = locks.clone();
                let inside = inside.clone();
                let max_inside = max_inside.clone();
                std::thread::spawn(move || {
                    for _ in 0..5 {
                        let lock = locks.acquire_write("bucketize", Duration::from_secs(10)).unwrap();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(5));
                        inside.fetch_sub(1, Ordering::SeqCst);
                        lock.release().unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(locks.markers("bucketize").unwrap().is_empty());
    }

    #[test]
    fn test_hold_outlasts_lock_period() {
        let dir = tempfile::tempdir().unwrap();
        let short = TableLocks::new(
            dir.path().join("samples.gord"),
            LockConfig::default()
                .period(Duration::from_millis(100))
                .backoff(Duration::from_millis(1), Duration::from_millis(10)),
        );
        let mut reader = short.acquire_read("export", Duration::from_secs(1)).unwrap();
        let holder = std::thread::spawn(move || {
            reader.hold(Duration::from_millis(500)).unwrap();
            reader.release()
        });

        // Well past the first expiry the reader must still block writers.
        std::thread::sleep(Duration::from_millis(150));
        let err = locks(dir.path())
            .acquire_write("export", Duration::from_millis(200))
            .unwrap_err();
        assert!(matches!(err, Error::LockTimeout { kind: LockKind::Write, .. }));

        holder.join().unwrap().unwrap();
        locks(dir.path())
            .acquire_write("export", Duration::from_secs(1))
            .unwrap();
    }
}
