use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

pub const LOCK_FILE_NAME: &str = "kiln-server.lock";

/// Exclusive claim on the state directory, released on drop.
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

#[derive(Debug)]
pub enum LockOutcome {
    Acquired(InstanceLock),
    /// Another process holds the lock.
    Held { path: PathBuf },
}

impl InstanceLock {
    pub fn acquire(state_dir: &Path) -> io::Result<LockOutcome> {
        std::fs::create_dir_all(state_dir)?;
        let path = state_dir.join(LOCK_FILE_NAME);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(err) if is_contended(&err) => return Ok(LockOutcome::Held { path }),
            Err(err) => return Err(err),
        }
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(LockOutcome::Acquired(InstanceLock { file, path }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_sees_lock_held_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let first = match InstanceLock::acquire(dir.path()).unwrap() {
            LockOutcome::Acquired(lock) => lock,
            LockOutcome::Held { .. } => panic!("fresh directory reported as held"),
        };
        let pid = std::fs::read_to_string(first.path()).unwrap();
        assert_eq!(pid.trim(), std::process::id().to_string());

        assert!(matches!(
            InstanceLock::acquire(dir.path()).unwrap(),
            LockOutcome::Held { .. }
        ));
        drop(first);
        assert!(matches!(
            InstanceLock::acquire(dir.path()).unwrap(),
            LockOutcome::Acquired(_)
        ));
    }
}
