//! Rotating text log files: a new file starts once the current one exceeds
//! a byte threshold; successive files share a base name with a zero-padded
//! monotonic counter suffix; every file is bracketed with open/close
//! banners so concatenated logs can be re-split.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

struct Inner {
    base_path: PathBuf,
    max_bytes: u64,
    counter: u32,
    file: File,
    written: u64,
}

pub struct RotatingFileSink {
    inner: Mutex<Inner>,
}

impl RotatingFileSink {
    pub fn open(base_path: impl Into<PathBuf>, max_bytes: u64) -> std::io::Result<Self> {
        let base_path = base_path.into();
        let (file, written) = Self::open_counter(&base_path, 0)?;
        Ok(RotatingFileSink {
            inner: Mutex::new(Inner {
                base_path,
                max_bytes,
                counter: 0,
                file,
                written,
            }),
        })
    }

    fn counter_path(base: &PathBuf, counter: u32) -> PathBuf {
        if counter == 0 {
            base.clone()
        } else {
            let mut name = base.as_os_str().to_owned();
            name.push(format!(".{counter:06}"));
            PathBuf::from(name)
        }
    }

    fn open_counter(base: &PathBuf, counter: u32) -> std::io::Result<(File, u64)> {
        let path = Self::counter_path(base, counter);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let banner = format!("---------- Opening logfile: {}\n", path.display());
        file.write_all(banner.as_bytes())?;
        Ok((file, banner.len() as u64))
    }

    pub fn write_line(&self, line: &str) {
        let mut guard = self.inner.lock().unwrap();
        let payload = format!("{line}\n");
        if guard.written + payload.len() as u64 > guard.max_bytes {
            let _ = guard.file.write_all(b"---------- Closing logfile\n");
            let next_counter = guard.counter + 1;
            if let Ok((file, written)) = Self::open_counter(&guard.base_path.clone(), next_counter) {
                guard.counter = next_counter;
                guard.file = file;
                guard.written = written;
            }
        }
        if guard.file.write_all(payload.as_bytes()).is_ok() {
            guard.written += payload.len() as u64;
        }
    }
}

impl Drop for RotatingFileSink {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.inner.lock() {
            let _ = guard.file.write_all(b"---------- Closing logfile\n");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotates_when_threshold_exceeded() {
        let dir = std::env::temp_dir().join(format!("rotlog-test-{}", uuid::Uuid::new_v4()));
        let sink = RotatingFileSink::open(&dir, 64).unwrap();
        for i in 0..20 {
            sink.write_line(&format!("line number {i} padded to push past threshold"));
        }
        drop(sink);
        let rotated = dir.with_file_name(format!(
            "{}.000001",
            dir.file_name().unwrap().to_string_lossy()
        ));
        assert!(rotated.exists(), "expected a rotated file to exist at {rotated:?}");
        let _ = std::fs::remove_file(&dir);
        let _ = std::fs::remove_file(&rotated);
    }
}
