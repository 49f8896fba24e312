//! Per-meeting backend log: a plain text file on disk plus an in-memory
//! ring of the most recent lines for the UI's debug surface.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex as StdMutex;

/// Lines kept in memory. The file itself is unbounded.
pub const LOG_TAIL_CAP: usize = 200;

pub struct BackendLog {
    file: StdMutex<Option<BufWriter<File>>>,
    tail: StdMutex<VecDeque<String>>,
}

impl BackendLog {
    /// Create or truncate the log file. Recording starts reset the log.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            file: StdMutex::new(Some(BufWriter::new(file))),
            tail: StdMutex::new(VecDeque::with_capacity(LOG_TAIL_CAP)),
        })
    }

    pub fn append(&self, line: &str) {
        {
            let mut tail = self.tail.lock().expect("tail lock");
            if tail.len() >= LOG_TAIL_CAP {
                tail.pop_front();
            }
            tail.push_back(line.to_string());
        }
        let mut file = self.file.lock().expect("file lock");
        if let Some(writer) = file.as_mut() {
            let _ = writeln!(writer, "{line}");
            let _ = writer.flush();
        }
    }

    pub fn tail(&self) -> Vec<String> {
        self.tail.lock().expect("tail lock").iter().cloned().collect()
    }

    /// Flush and release the file handle. Appends after close only feed the
    /// in-memory tail.
    pub fn close(&self) {
        if let Some(mut writer) = self.file.lock().expect("file lock").take() {
            let _ = writer.flush();
        }
    }
}

impl Drop for BackendLog {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backend.log");
        let log = BackendLog::open(&path).unwrap();

        log.append("[status] ready");
        log.append("[error] oh no");
        assert_eq!(log.tail(), vec!["[status] ready", "[error] oh no"]);

        log.close();
        let data = std::fs::read_to_string(&path).unwrap();
        assert_eq!(data, "[status] ready\n[error] oh no\n");
    }

    #[test]
    fn test_tail_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let log = BackendLog::open(&dir.path().join("backend.log")).unwrap();
        for i in 0..(LOG_TAIL_CAP + 10) {
            log.append(&format!("line {i}"));
        }
        let tail = log.tail();
        assert_eq!(tail.len(), LOG_TAIL_CAP);
        assert_eq!(tail[0], "line 10");
        assert_eq!(tail.last().unwrap(), &format!("line {}", LOG_TAIL_CAP + 9));
    }

    #[test]
    fn test_open_truncates_previous_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backend.log");
        {
            let log = BackendLog::open(&path).unwrap();
            log.append("old");
        }
        let log = BackendLog::open(&path).unwrap();
        log.append("new");
        log.close();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new\n");
    }
}
