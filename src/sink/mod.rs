use chrono::Local;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use thiserror::Error;

pub const CSV_HEADER: [&str; 4] = ["timestamp", "side", "top", "bottom"];

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("telemetry sink io: {0}")]
    Io(#[from] io::Error),
    #[error("telemetry sink is not open")]
    NotOpen,
}

/// Durable storage for one transfer's records.
pub trait TelemetrySink: Send + 'static {
    fn open(&mut self) -> Result<(), SinkError>;
    fn append(&mut self, record: &[String]) -> Result<(), SinkError>;
    fn close(&mut self) -> Result<(), SinkError>;

    /// Where the current transfer is being written, if that means anything.
    fn location(&self) -> Option<PathBuf> {
        None
    }
}

/// Owns the sink and the streaming flag, keeping `append` between `open`
/// and `close` and closing every opened transfer exactly once.
#[derive(Debug)]
pub struct Recorder<S> {
    sink: S,
    active: bool,
    appended: u64,
}

impl<S: TelemetrySink> Recorder<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            active: false,
            appended: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Records appended during the current (or last) transfer.
    pub fn records_appended(&self) -> u64 {
        self.appended
    }

    pub fn location(&self) -> Option<PathBuf> {
        self.sink.location()
    }

    /// Opens a new transfer. A transfer still running is closed first.
    pub fn start(&mut self) -> Result<(), SinkError> {
        if self.active {
            tracing::warn!("new transfer requested while one is active, closing it");
            self.finish()?;
        }
        self.sink.open()?;
        self.active = true;
        self.appended = 0;
        Ok(())
    }

    /// Returns `Ok(false)` without touching the sink when no transfer is
    /// active.
    pub fn append(&mut self, record: &[String]) -> Result<bool, SinkError> {
        if !self.active {
            return Ok(false);
        }
        self.sink.append(record)?;
        self.appended += 1;
        Ok(true)
    }

    /// Closes the active transfer. `Ok(false)` when there was none.
    pub fn finish(&mut self) -> Result<bool, SinkError> {
        if !self.active {
            return Ok(false);
        }
        self.active = false;
        self.sink.close()?;
        Ok(true)
    }
}

/// Writes each transfer to `<dir>/<prefix>_<YYYYmmdd_HHMMSS>.csv`.
#[derive(Debug)]
pub struct CsvSink {
    dir: PathBuf,
    prefix: String,
    current: Option<(PathBuf, BufWriter<File>)>,
}

impl CsvSink {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            current: None,
        }
    }

    fn create_file(&self) -> io::Result<(PathBuf, File)> {
        fs::create_dir_all(&self.dir)?;
        let stem = format!(
            "{}_{}",
            self.prefix,
            Local::now().format("%Y%m%d_%H%M%S")
        );
        let mut attempt = 0u32;
        loop {
            let name = if attempt == 0 {
                format!("{stem}.csv")
            } else {
                format!("{stem}_{attempt}.csv")
            };
            let path = self.dir.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists && attempt < 1000 => {
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl TelemetrySink for CsvSink {
    fn open(&mut self) -> Result<(), SinkError> {
        if self.current.is_some() {
            self.close()?;
        }
        let (path, file) = self.create_file()?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{}", CSV_HEADER.join(","))?;
        tracing::info!(path = %path.display(), "saving telemetry");
        self.current = Some((path, writer));
        Ok(())
    }

    fn append(&mut self, record: &[String]) -> Result<(), SinkError> {
        let (_, writer) = self.current.as_mut().ok_or(SinkError::NotOpen)?;
        writeln!(writer, "{}", record.join(","))?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        if let Some((path, mut writer)) = self.current.take() {
            writer.flush()?;
            tracing::info!(path = %path.display(), "telemetry file closed");
        }
        Ok(())
    }

    fn location(&self) -> Option<PathBuf> {
        self.current.as_ref().map(|(path, _)| path.clone())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    pub type Journal = Arc<Mutex<Vec<String>>>;

    /// Records every sink call into a shared journal.
    #[derive(Debug, Clone, Default)]
    pub struct JournalSink {
        pub journal: Journal,
        pub fail_open: bool,
    }

    impl TelemetrySink for JournalSink {
        fn open(&mut self) -> Result<(), SinkError> {
            if self.fail_open {
                return Err(SinkError::Io(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "read-only",
                )));
            }
            self.journal.lock().unwrap().push("open".to_string());
            Ok(())
        }

        fn append(&mut self, record: &[String]) -> Result<(), SinkError> {
            self.journal
                .lock()
                .unwrap()
                .push(format!("append:{}", record.join(",")));
            Ok(())
        }

        fn close(&mut self) -> Result<(), SinkError> {
            self.journal.lock().unwrap().push("close".to_string());
            Ok(())
        }
    }
}
