use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::common::{DEVICES_ALLOW, DEVICES_DENY};
use crate::controller::{ControllerError, DevicesController, DENY_ALL};

/// Single line written into a whitelist file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Write {
    pub cgroup: PathBuf,
    pub file: &'static str,
    pub line: String,
}

/// Legacy controller that remembers writes instead of performing them.
/// Cgroups can be marked as missing to simulate removed cgroups.
#[derive(Debug, Default)]
pub struct RecordingController {
    writes: Mutex<Vec<Write>>,
    missing: Mutex<HashSet<PathBuf>>,
}

impl RecordingController {
    pub fn writes(&self) -> Vec<Write> {
        self.writes
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }

    /// Lines written into cgroup `cgroup`, prefixed with `+` for allow and
    /// `-` for deny
    pub fn lines_for(&self, cgroup: &Path) -> Vec<String> {
        self.writes()
            .into_iter()
            .filter(|w| w.cgroup == cgroup)
            .map(|w| {
                let sign = if w.file == DEVICES_ALLOW { '+' } else { '-' };
                format!("{sign}{}", w.line)
            })
            .collect()
    }

    pub fn clear(&self) {
        self.writes
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clear();
    }

    pub fn mark_missing<P: Into<PathBuf>>(&self, cgroup: P) {
        self.missing
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .insert(cgroup.into());
    }

    fn record(&self, cgroup: &Path, file: &'static str, line: &str) -> Result<(), ControllerError> {
        let missing = self
            .missing
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .contains(cgroup);
        if missing {
            return Err(ControllerError::NotFound {
                path: cgroup.join(file),
            });
        }

        self.writes
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .push(Write {
                cgroup: cgroup.to_path_buf(),
                file,
                line: line.to_owned(),
            });
        Ok(())
    }
}

impl DevicesController for RecordingController {
    fn legacy(&self) -> bool {
        true
    }

    fn allow(&self, cgroup: &Path, line: &str) -> Result<(), ControllerError> {
        self.record(cgroup, DEVICES_ALLOW, line)
    }

    fn deny(&self, cgroup: &Path, line: &str) -> Result<(), ControllerError> {
        self.record(cgroup, DEVICES_DENY, line)
    }

    fn deny_all(&self, cgroup: &Path) -> Result<(), ControllerError> {
        self.record(cgroup, DEVICES_DENY, DENY_ALL)
    }
}
