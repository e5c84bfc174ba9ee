use crate::config::{LogFormat, LoggingConfig};
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

pub struct LogGuard {
    file: Option<Arc<Mutex<RotatingFile>>>,
}

/// Append-only log file that moves itself to `<path>.1` once it would grow past
/// `max_bytes`, shifting older backups up and dropping the one past `backup_count`.
struct RotatingFile {
    path: PathBuf,
    file: File,
    written: u64,
    max_bytes: u64,
    backup_count: usize,
}

impl RotatingFile {
    fn open(path: &Path, max_bytes: u64, backup_count: usize) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            written,
            max_bytes,
            backup_count,
        })
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let len = buf.len() as u64;
        if self.max_bytes > 0 && self.written > 0 && self.written + len > self.max_bytes {
            self.rotate()?;
        }
        self.file.write_all(buf)?;
        self.written += len;
        Ok(())
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        if self.backup_count == 0 {
            self.file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.path)?;
            self.written = 0;
            return Ok(());
        }
        for index in (1..self.backup_count).rev() {
            let from = self.backup_path(index);
            if from.exists() {
                std::fs::rename(&from, self.backup_path(index + 1))?;
            }
        }
        std::fs::rename(&self.path, self.backup_path(1))?;
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(format!(".{index}"));
        PathBuf::from(name)
    }
}

struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<RotatingFile>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<RotatingFile>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.file.flush();
            }
        }
        Ok(())
    }
}

/// `--debug` wins, then `RUST_LOG`, then `logging.level`.
pub fn build_filter(config: &LoggingConfig, debug: bool) -> EnvFilter {
    if debug {
        return EnvFilter::new("debug");
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level.to_lowercase()))
}

pub fn init_logging(config: &LoggingConfig, debug: bool) -> Option<LogGuard> {
    let filter = build_filter(config, debug);
    let guard = match open_log_file(config) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = guard.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));

    let installed = match config.format {
        LogFormat::Text => tracing::subscriber::set_global_default(
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(make_writer)
                .finish(),
        ),
        LogFormat::Json => tracing::subscriber::set_global_default(
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(make_writer)
                .finish(),
        ),
    };
    if installed.is_err() {
        return None;
    }
    Some(guard)
}

fn open_log_file(config: &LoggingConfig) -> io::Result<LogGuard> {
    if config.file.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let path = Path::new(&config.file);
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        if std::fs::create_dir_all(dir).is_err() {
            return Ok(LogGuard { file: None });
        }
    }
    let file = RotatingFile::open(path, config.max_bytes, config.backup_count)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_config(path: &Path, max_bytes: u64, backup_count: usize) -> LoggingConfig {
        LoggingConfig {
            file: path.to_str().expect("utf8 path").to_string(),
            max_bytes,
            backup_count,
            ..LoggingConfig::default()
        }
    }

    #[test]
    fn empty_path_disables_the_log_file() {
        let config = LoggingConfig {
            file: "  ".to_string(),
            ..LoggingConfig::default()
        };
        let guard = open_log_file(&config).expect("guard");
        assert!(guard.file.is_none());
    }

    #[test]
    fn log_file_and_parent_directory_are_created() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("logs").join("grok.log");
        let guard = open_log_file(&file_config(&path, 1024, 3)).expect("guard");
        assert!(guard.file.is_some());

        let mut writer = MultiWriter::new(guard.file.clone());
        writer.write_all(b"event=test\n").expect("write");
        writer.flush().expect("flush");
        let written = std::fs::read_to_string(&path).expect("read log");
        assert_eq!(written, "event=test\n");
    }

    #[test]
    fn full_log_file_rotates_and_keeps_backup_count() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("grok.log");
        let guard = open_log_file(&file_config(&path, 16, 2)).expect("guard");
        let mut writer = MultiWriter::new(guard.file.clone());

        for line in ["first-line-0001\n", "second-line-002\n", "third-line-0003\n", "fourth-line-004\n"] {
            writer.write_all(line.as_bytes()).expect("write");
        }
        writer.flush().expect("flush");

        let read = |suffix: &str| {
            std::fs::read_to_string(dir.path().join(format!("grok.log{suffix}"))).expect("read")
        };
        assert_eq!(read(""), "fourth-line-004\n");
        assert_eq!(read(".1"), "third-line-0003\n");
        assert_eq!(read(".2"), "second-line-002\n");
        assert!(!dir.path().join("grok.log.3").exists());
    }

    #[test]
    fn zero_max_bytes_never_rotates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("grok.log");
        let mut file = RotatingFile::open(&path, 0, 3).expect("open");
        for _ in 0..10 {
            file.write_all(b"0123456789\n").expect("write");
        }
        assert_eq!(std::fs::metadata(&path).expect("meta").len(), 110);
        assert!(!dir.path().join("grok.log.1").exists());
    }

    #[test]
    fn debug_flag_overrides_configured_level() {
        let config = LoggingConfig {
            level: "WARN".to_string(),
            ..LoggingConfig::default()
        };
        assert_eq!(build_filter(&config, true).to_string(), "debug");
    }
}
