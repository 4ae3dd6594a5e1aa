use crate::config::SanitizerConfig;
use log::{debug, warn};
use std::fs;
use std::io;
use std::path::PathBuf;

/// Looks up a sanitizer report produced by a given process.
///
/// A missing report is not an error; most runs do not produce one.
pub trait SanitizerReports {
    fn lookup(&self, pid: u32) -> Option<String>;
}

/// Used when the target is not built with a sanitizer.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSanitizer;

impl SanitizerReports for NoSanitizer {
    fn lookup(&self, _pid: u32) -> Option<String> {
        None
    }
}

/// Reads reports written through `ASAN_OPTIONS=log_path=<dir>/<prefix>`,
/// which the runtime names `<dir>/<prefix>.<pid>`.
#[derive(Debug, Clone)]
pub struct SanitizerLogDirectory {
    log_dir: PathBuf,
    log_prefix: String,
}

impl SanitizerLogDirectory {
    pub fn new(log_dir: impl Into<PathBuf>, log_prefix: impl Into<String>) -> Self {
        Self {
            log_dir: log_dir.into(),
            log_prefix: log_prefix.into(),
        }
    }

    pub fn from_config(config: &SanitizerConfig) -> Self {
        Self::new(&config.log_dir, &config.log_prefix)
    }

    /// Where the runtime writes the report of process `pid`.
    pub fn report_path(&self, pid: u32) -> PathBuf {
        self.log_dir.join(format!("{}.{}", self.log_prefix, pid))
    }
}

impl SanitizerReports for SanitizerLogDirectory {
    fn lookup(&self, pid: u32) -> Option<String> {
        let path = self.report_path(pid);
        match fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => None,
            Ok(bytes) => {
                debug!("Found sanitizer report {:?}", path);
                Some(String::from_utf8_lossy(&bytes).into_owned())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!("Could not read sanitizer report {:?}: {}", path, e);
                None
            }
        }
    }
}
