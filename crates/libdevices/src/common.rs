use std::{
    fmt::Display,
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use nix::sys::statfs::{statfs, CGROUP2_SUPER_MAGIC, TMPFS_MAGIC};
use procfs::{process::Process, ProcError};

pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";
pub const DEVICES_SUBSYSTEM: &str = "devices";
pub const DEVICES_ALLOW: &str = "devices.allow";
pub const DEVICES_DENY: &str = "devices.deny";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupSetup {
    Hybrid,
    Legacy,
    Unified,
}

impl CgroupSetup {
    /// Returns true if device access is controlled through the v1 whitelist files
    pub fn has_legacy_devices(&self) -> bool {
        matches!(self, CgroupSetup::Legacy | CgroupSetup::Hybrid)
    }
}

impl Display for CgroupSetup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let print = match self {
            CgroupSetup::Hybrid => "hybrid",
            CgroupSetup::Legacy => "legacy",
            CgroupSetup::Unified => "unified",
        };

        write!(f, "{print}")
    }
}

#[derive(thiserror::Error, Debug)]
pub enum WrappedIoError {
    #[error("failed to open {path}: {err}")]
    Open { err: std::io::Error, path: PathBuf },
    #[error("failed to write {data} to {path}: {err}")]
    Write {
        err: std::io::Error,
        path: PathBuf,
        data: String,
    },
    #[error("at {path}: {err}")]
    Other { err: std::io::Error, path: PathBuf },
}

impl WrappedIoError {
    pub fn inner(&self) -> &std::io::Error {
        match self {
            WrappedIoError::Open { err, .. } => err,
            WrappedIoError::Write { err, .. } => err,
            WrappedIoError::Other { err, .. } => err,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            WrappedIoError::Open { path, .. } => path,
            WrappedIoError::Write { path, .. } => path,
            WrappedIoError::Other { path, .. } => path,
        }
    }
}

/// Writes a single line into a cgroup pseudo-file. The file is never created,
/// a missing file means the cgroup (or the controller) does not exist.
#[inline]
pub fn write_cgroup_file_str<P: AsRef<Path>>(path: P, data: &str) -> Result<(), WrappedIoError> {
    let path = path.as_ref();

    fs::OpenOptions::new()
        .create(false)
        .write(true)
        .truncate(false)
        .open(path)
        .wrap_open(path)?
        .write_all(data.as_bytes())
        .wrap_write(path, data)?;

    Ok(())
}

#[derive(thiserror::Error, Debug)]
pub enum GetCgroupSetupError {
    #[error("io error: {0}")]
    WrappedIo(#[from] WrappedIoError),
    #[error("non default cgroup root not supported")]
    NonDefault,
    #[error("failed to detect cgroup setup")]
    FailedToDetect,
}

/// Determines the cgroup setup of the system. Systems typically have one of
/// three setups:
/// - Unified: Pure cgroup v2 system. Device access is enforced by a BPF
///   program attached to the cgroup, the whitelist files do not exist.
/// - Legacy: Pure cgroup v1 system.
/// - Hybrid: cgroup v1 system with an additional unified hierarchy which
///   doesn't have any controllers attached. The devices controller lives in
///   the v1 hierarchy.
pub fn get_cgroup_setup_with_root(root_path: &Path) -> Result<CgroupSetup, GetCgroupSetupError> {
    if !root_path.exists() {
        return Err(GetCgroupSetupError::NonDefault);
    }

    // cgroup2 on the root means unified mode. tmpfs means legacy or hybrid,
    // depending on whether a cgroup2 filesystem is mounted under "unified".
    let stat = statfs(root_path)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))
        .wrap_other(root_path)?;
    if stat.filesystem_type() == CGROUP2_SUPER_MAGIC {
        return Ok(CgroupSetup::Unified);
    }

    if stat.filesystem_type() == TMPFS_MAGIC {
        let unified = root_path.join("unified");
        if unified.exists() {
            let stat = statfs(&unified)
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))
                .wrap_other(&unified)?;
            if stat.filesystem_type() == CGROUP2_SUPER_MAGIC {
                return Ok(CgroupSetup::Hybrid);
            }
        }

        return Ok(CgroupSetup::Legacy);
    }

    Err(GetCgroupSetupError::FailedToDetect)
}

pub fn get_cgroup_setup() -> Result<CgroupSetup, GetCgroupSetupError> {
    get_cgroup_setup_with_root(Path::new(DEFAULT_CGROUP_ROOT))
}

#[derive(thiserror::Error, Debug)]
pub enum MountPointError {
    #[error("failed to read process info from /proc/self: {0}")]
    ReadSelf(ProcError),
    #[error("failed to get mountinfo: {0}")]
    MountInfo(ProcError),
    #[error("could not find mountpoint for {subsystem}")]
    NotFound { subsystem: String },
}

/// Looks up the mount point of a cgroup v1 subsystem in `/proc/self/mountinfo`
pub fn get_subsystem_mount_point(subsystem: &str) -> Result<PathBuf, MountPointError> {
    Process::myself()
        .map_err(MountPointError::ReadSelf)?
        .mountinfo()
        .map_err(MountPointError::MountInfo)?
        .into_iter()
        .find(|m| m.fs_type == "cgroup" && m.mount_point.ends_with(subsystem))
        .map(|m| m.mount_point)
        .ok_or_else(|| MountPointError::NotFound {
            subsystem: subsystem.to_owned(),
        })
}

pub(crate) trait WrapIoResult {
    type Target;

    fn wrap_open<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError>;
    fn wrap_write<P: Into<PathBuf>, D: Into<String>>(
        self,
        path: P,
        data: D,
    ) -> Result<Self::Target, WrappedIoError>;
    fn wrap_other<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError>;
}

impl<T> WrapIoResult for Result<T, std::io::Error> {
    type Target = T;

    fn wrap_open<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError> {
        self.map_err(|err| WrappedIoError::Open {
            err,
            path: path.into(),
        })
    }

    fn wrap_write<P: Into<PathBuf>, D: Into<String>>(
        self,
        path: P,
        data: D,
    ) -> Result<Self::Target, WrappedIoError> {
        self.map_err(|err| WrappedIoError::Write {
            err,
            path: path.into(),
            data: data.into(),
        })
    }

    fn wrap_other<P: Into<PathBuf>>(self, path: P) -> Result<Self::Target, WrappedIoError> {
        self.map_err(|err| WrappedIoError::Other {
            err,
            path: path.into(),
        })
    }
}
