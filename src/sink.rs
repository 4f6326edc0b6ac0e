use std::{
    ffi::OsString,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use chrono::{SecondsFormat, Utc};

/// Replaces the file content in one step, so readers never see a partial line.
fn replace_file(path: &Path, content: &str) -> io::Result<()> {
    let mut tmp_name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("status"));
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)
}

/// Where each decoded status line ends up.
pub struct StatusSink {
    path: PathBuf,
    console: Option<Box<dyn Write>>,
}

impl StatusSink {
    pub fn new(path: PathBuf, console: bool) -> StatusSink {
        if console {
            return StatusSink::with_console(path, Box::new(io::stdout()));
        }
        StatusSink {
            path,
            console: None,
        }
    }

    /// Mirrors to `console` instead of stdout.
    pub fn with_console(path: PathBuf, console: Box<dyn Write>) -> StatusSink {
        StatusSink {
            path,
            console: Some(console),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn publish(&mut self, line: &str) -> io::Result<()> {
        replace_file(&self.path, line)?;
        if let Some(console) = &mut self.console {
            console.write_all(line.as_bytes())?;
            console.flush()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    Ok { line: String },
    Stale { failures: u32, reason: String },
    Failed { reason: String },
}

impl Health {
    fn render(&self, timestamp: &str) -> String {
        match self {
            Health::Ok { line } => format!("ok {} {}\n", timestamp, line.trim_end()),
            Health::Stale { failures, reason } => {
                format!("stale {} {} {}\n", timestamp, failures, reason)
            }
            Health::Failed { reason } => format!("failed {} {}\n", timestamp, reason),
        }
    }
}

/// Records whether the last cycle succeeded, separately from the status itself.
///
/// The status file keeps its last good reading when cycles fail; this file is what tells a
/// stale reading from a fresh one, and a running daemon from one that has given up.
pub struct HealthFile {
    path: PathBuf,
}

impl HealthFile {
    pub fn new(path: PathBuf) -> HealthFile {
        HealthFile { path }
    }

    pub fn record(&self, health: &Health) -> io::Result<()> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        replace_file(&self.path, &health.render(&now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::RefCell, rc::Rc};
    use tempfile::tempdir;

    #[derive(Clone, Default)]
    struct SharedBuf(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn publish_mirrors_line_to_console() {
        let dir = tempdir().unwrap();
        let out = SharedBuf::default();
        let mut sink =
            StatusSink::with_console(dir.path().join("UPSstat.info"), Box::new(out.clone()));

        sink.publish("Charging(57%,5250mV)\n").unwrap();

        assert_eq!(out.0.borrow().as_slice(), b"Charging(57%,5250mV)\n");
        let content = fs::read_to_string(sink.path()).unwrap();
        assert_eq!(content, "Charging(57%,5250mV)\n");
    }

    #[test]
    fn publish_overwrites_status_file() {
        let dir = tempdir().unwrap();
        let mut sink = StatusSink::new(dir.path().join("UPSstat.info"), false);

        sink.publish("Charging(57%,5250mV)\n").unwrap();
        sink.publish("Charged(100%,5250mV)\n").unwrap();

        let content = fs::read_to_string(sink.path()).unwrap();
        assert_eq!(content, "Charged(100%,5250mV)\n");
        assert!(!dir.path().join("UPSstat.info.tmp").exists());
    }

    #[test]
    fn health_lines() {
        let ts = "2026-10-16T12:00:00Z";
        assert_eq!(
            Health::Ok {
                line: "Charging(57%,5250mV)\n".to_string()
            }
            .render(ts),
            "ok 2026-10-16T12:00:00Z Charging(57%,5250mV)\n"
        );
        assert_eq!(
            Health::Stale {
                failures: 2,
                reason: "no frame".to_string()
            }
            .render(ts),
            "stale 2026-10-16T12:00:00Z 2 no frame\n"
        );
    }

    #[test]
    fn health_file_is_replaced() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("UPSstat.health");
        let health = HealthFile::new(path.clone());

        health
            .record(&Health::Stale {
                failures: 1,
                reason: "no frame".to_string(),
            })
            .unwrap();
        health
            .record(&Health::Failed {
                reason: "device gone".to_string(),
            })
            .unwrap();

        let content = fs::read_to_string(path).unwrap();
        assert!(content.starts_with("failed "));
        assert!(content.ends_with(" device gone\n"));
        assert_eq!(content.lines().count(), 1);
    }
}
