//! Enforcement of device access in the cgroup devices controller.
//!
//! cgroup v1 exposes a whitelist through the `devices.allow` and
//! `devices.deny` pseudo-files. On cgroup v2 the same is achieved with a BPF
//! program attached to the cgroup, which is installed by the container
//! runtime, so the unified controller does nothing and reports that it is
//! not a legacy one. The device manager uses that to skip all writes.
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

use crate::common::{
    self, get_cgroup_setup, GetCgroupSetupError, WrappedIoError, DEVICES_ALLOW, DEVICES_DENY,
};
use crate::device::Change;

/// Written into `devices.deny` to revoke access to all devices
pub const DENY_ALL: &str = "a";

#[derive(thiserror::Error, Debug)]
pub enum ControllerError {
    #[error("cgroup file {path:?} does not exist")]
    NotFound { path: PathBuf },
    #[error(transparent)]
    Io(WrappedIoError),
}

impl From<WrappedIoError> for ControllerError {
    fn from(err: WrappedIoError) -> Self {
        match err {
            WrappedIoError::Open { err, path } if err.kind() == ErrorKind::NotFound => {
                ControllerError::NotFound { path }
            }
            err => ControllerError::Io(err),
        }
    }
}

#[cfg_attr(test, automock)]
pub trait DevicesController: Send + Sync {
    /// Returns true if access is controlled through the whitelist files
    fn legacy(&self) -> bool;

    /// Grants access described by `line`, e.g. `c 1:3 rw`
    fn allow(&self, cgroup: &Path, line: &str) -> Result<(), ControllerError>;

    /// Revokes access described by `line`
    fn deny(&self, cgroup: &Path, line: &str) -> Result<(), ControllerError>;

    /// Revokes access to all devices
    fn deny_all(&self, cgroup: &Path) -> Result<(), ControllerError>;

    fn apply_changes(&self, cgroup: &Path, changes: &[Change]) -> Result<(), ControllerError> {
        for change in changes {
            match change {
                Change::Deny(line) => self.deny(cgroup, line)?,
                Change::Allow(line) => self.allow(cgroup, line)?,
            }
        }

        Ok(())
    }
}

/// Writes into the v1 whitelist files of the devices controller
#[derive(Debug, Default, Clone, Copy)]
pub struct LegacyController;

impl DevicesController for LegacyController {
    fn legacy(&self) -> bool {
        true
    }

    fn allow(&self, cgroup: &Path, line: &str) -> Result<(), ControllerError> {
        tracing::debug!(?cgroup, line, "allow device");
        common::write_cgroup_file_str(cgroup.join(DEVICES_ALLOW), line)?;
        Ok(())
    }

    fn deny(&self, cgroup: &Path, line: &str) -> Result<(), ControllerError> {
        tracing::debug!(?cgroup, line, "deny device");
        common::write_cgroup_file_str(cgroup.join(DEVICES_DENY), line)?;
        Ok(())
    }

    fn deny_all(&self, cgroup: &Path) -> Result<(), ControllerError> {
        self.deny(cgroup, DENY_ALL)
    }
}

/// Device access on cgroup v2 is enforced by a BPF program managed elsewhere
#[derive(Debug, Default, Clone, Copy)]
pub struct UnifiedController;

impl DevicesController for UnifiedController {
    fn legacy(&self) -> bool {
        false
    }

    fn allow(&self, _cgroup: &Path, _line: &str) -> Result<(), ControllerError> {
        Ok(())
    }

    fn deny(&self, _cgroup: &Path, _line: &str) -> Result<(), ControllerError> {
        Ok(())
    }

    fn deny_all(&self, _cgroup: &Path) -> Result<(), ControllerError> {
        Ok(())
    }

    fn apply_changes(&self, _cgroup: &Path, _changes: &[Change]) -> Result<(), ControllerError> {
        Ok(())
    }
}

/// Picks the controller matching the cgroup setup of this system
pub fn detect_controller() -> Result<Arc<dyn DevicesController>, GetCgroupSetupError> {
    let setup = get_cgroup_setup()?;
    tracing::info!("cgroup setup {} detected", setup);

    if setup.has_legacy_devices() {
        Ok(Arc::new(LegacyController))
    } else {
        Ok(Arc::new(UnifiedController))
    }
}
