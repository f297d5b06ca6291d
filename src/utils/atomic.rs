use crate::error::Result;
use atomic_write_file::AtomicWriteFile;
use std::fs;
use std::io::{ErrorKind, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

/// Атомарная запись: временный файл в том же каталоге, fsync, rename.
/// При сбое до rename исходный файл остаётся нетронутым.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = AtomicWriteFile::open(path)?;
    file.write_all(contents)?;
    file.commit()?;
    Ok(())
}

/// Эксклюзивный flock на соседнем файле `<имя>.lock`.
/// Сериализует цикл чтение-изменение-запись между процессами;
/// снимается при drop вместе с дескриптором.
pub struct FileLock {
    _file: fs::File,
}

impl FileLock {
    pub fn exclusive(path: &Path) -> Result<Self> {
        let lock_path = lock_path_for(path);
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;

        loop {
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if rc == 0 {
                return Ok(Self { _file: file });
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != ErrorKind::Interrupted {
                return Err(err.into());
            }
        }
    }
}

pub fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/file.json");
        write_atomic(&path, b"{}").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{}");
    }

    #[test]
    fn test_uncommitted_write_keeps_original() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.json");
        fs::write(&path, "original").unwrap();

        let mut file = AtomicWriteFile::open(&path).unwrap();
        file.write_all(b"half-written").unwrap();
        // Имитация падения процесса между записью и rename
        std::mem::forget(file);

        assert_eq!(fs::read_to_string(&path).unwrap(), "original");
    }

    #[test]
    fn test_file_lock_is_exclusive_between_descriptors() {
        use std::sync::mpsc;
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("classes.json");
        let held = FileLock::exclusive(&path).unwrap();
        assert!(lock_path_for(&path).ends_with("classes.json.lock"));

        let (tx, rx) = mpsc::channel();
        let contender = path.clone();
        let worker = std::thread::spawn(move || {
            let _lock = FileLock::exclusive(&contender).unwrap();
            tx.send(()).unwrap();
        });

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(held);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        worker.join().unwrap();
    }
}
