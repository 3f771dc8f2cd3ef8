use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Exclusive OS advisory lock on a file, held until drop.
///
/// Serialises lock-marker checks between processes on one host. The lock
/// file is never removed; it only exists to be locked.
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Blocks until the lock is acquired.
    pub fn lock<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Self::acquire(path.as_ref(), true)
    }

    /// Fails with `WouldBlock` if another handle holds the lock.
    pub fn try_lock<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Self::acquire(path.as_ref(), false)
    }

    fn acquire(path: &Path, blocking: bool) -> io::Result<Self> {
        let path = path.to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        Self::os_lock(&file, blocking)?;

        // Holder pid, for debugging only.
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { file, path })
    }

    #[cfg(unix)]
    fn os_lock(file: &File, blocking: bool) -> io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let flags = if blocking { LOCK_EX } else { LOCK_EX | LOCK_NB };
        let fd = file.as_raw_fd();
        loop {
            let result = unsafe { flock(fd, flags) };
            if result == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    #[cfg(windows)]
    fn os_lock(file: &File, blocking: bool) -> io::Result<()> {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::LockFileEx;
        use winapi::um::minwinbase::OVERLAPPED;
        use winapi::um::winnt::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY};

        let mut flags = LOCKFILE_EXCLUSIVE_LOCK;
        if !blocking {
            flags |= LOCKFILE_FAIL_IMMEDIATELY;
        }
        let handle = file.as_raw_handle();
        let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
        let result = unsafe { LockFileEx(handle as *mut _, flags, 0, !0, !0, &mut overlapped) };

        if result == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    fn os_lock(_file: &File, _blocking: bool) -> io::Result<()> {
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Closing the handle releases the lock; truncate so stale pids do
        // not linger in the file.
        let _ = self.file.set_len(0);
    }
}
