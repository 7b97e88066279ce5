use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::Path,
    sync::{Arc, Mutex},
};

use tracing::{debug, error, info, warn};

/// Severity of a backend diagnostic, most severe first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, derive_more::Display)]
pub enum Severity {
    #[display("INTERNAL_ERROR")]
    InternalError,
    #[display("ERROR")]
    Error,
    #[display("WARNING")]
    Warning,
    #[display("INFO")]
    Info,
    #[display("VERBOSE")]
    Verbose,
}

/// Diagnostics sink handed to a backend.
///
/// Messages less severe than the threshold are dropped. When a log file is attached every
/// message is appended to it as one line, otherwise it goes to `tracing`.
#[derive(Clone, Debug)]
pub struct BackendLogger {
    min_severity: Severity,
    file: Option<Arc<Mutex<File>>>,
}

impl Default for BackendLogger {
    fn default() -> Self {
        Self {
            min_severity: Severity::Info,
            file: None,
        }
    }
}

impl BackendLogger {
    pub fn new(min_severity: Severity) -> Self {
        Self {
            min_severity,
            file: None,
        }
    }

    /// Appends messages to `path`, creating the file if needed.
    pub fn with_file(mut self, path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        self.file = Some(Arc::new(Mutex::new(file)));
        Ok(self)
    }

    pub fn min_severity(&self) -> Severity {
        self.min_severity
    }

    pub fn enabled(&self, severity: Severity) -> bool {
        severity <= self.min_severity
    }

    pub fn log(&self, severity: Severity, message: impl AsRef<str>) {
        if !self.enabled(severity) {
            return;
        }
        let message = message.as_ref();
        if let Some(file) = &self.file {
            let written = file
                .lock()
                .map_err(|_| std::io::Error::other("backend log file lock poisoned"))
                .and_then(|mut f| writeln!(f, "[{severity}] {message}"));
            if let Err(e) = written {
                warn!("cannot write to backend log file: {e}");
            } else {
                return;
            }
        }
        match severity {
            Severity::InternalError | Severity::Error => error!(target: "backend", "{message}"),
            Severity::Warning => warn!(target: "backend", "{message}"),
            Severity::Info => info!(target: "backend", "{message}"),
            Severity::Verbose => debug!(target: "backend", "{message}"),
        }
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.log(Severity::Error, message)
    }

    pub fn warning(&self, message: impl AsRef<str>) {
        self.log(Severity::Warning, message)
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.log(Severity::Info, message)
    }

    pub fn verbose(&self, message: impl AsRef<str>) {
        self.log(Severity::Verbose, message)
    }
}
