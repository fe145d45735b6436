use std::{
    fmt::Display,
    hash::{Hash, Hasher},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::config::{DeviceConfig, DeviceDescriptor};
use crate::mode::Mode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Char,
    Block,
}

impl DeviceKind {
    /// Letter used by the devices controller
    pub fn as_char(&self) -> char {
        match self {
            DeviceKind::Char => 'c',
            DeviceKind::Block => 'b',
        }
    }
}

impl Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let print = match self {
            DeviceKind::Char => "char",
            DeviceKind::Block => "block",
        };

        write!(f, "{print}")
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("unknown device kind {0:?}")]
pub struct ParseDeviceKindError(String);

impl FromStr for DeviceKind {
    type Err = ParseDeviceKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "char" | "c" => Ok(DeviceKind::Char),
            "block" | "b" => Ok(DeviceKind::Block),
            other => Err(ParseDeviceKindError(other.to_owned())),
        }
    }
}

/// A single write needed to move a cgroup from one mode of a device to another
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Line to be written into `devices.deny`
    Deny(String),
    /// Line to be written into `devices.allow`
    Allow(String),
}

/// Ordered list of cgroup writes. Denials always come before allowances, so
/// that the cgroup never grants the union of the old and the new mode.
pub type Changeset = Vec<Change>;

/// Device node identified by its kind and major and minor numbers.
///
/// Two devices are equal when their identities match, their mode, name and
/// flags are not considered. Managers use this to find their own instance
/// of a device passed in from elsewhere in the hierarchy.
#[derive(Debug, Clone)]
pub struct Device {
    kind: DeviceKind,
    major: String,
    minor: String,
    mode: Mode,
    name: Option<String>,
    inherited: bool,
    inheritable: bool,
}

impl Device {
    pub fn new<S1, S2>(kind: DeviceKind, major: S1, minor: S2, mode: Mode) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self {
            kind,
            major: major.into(),
            minor: minor.into(),
            mode,
            name: None,
            inherited: false,
            inheritable: false,
        }
    }

    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_inheritable(mut self, inheritable: bool) -> Self {
        self.inheritable = inheritable;
        self
    }

    pub fn with_inherited(mut self, inherited: bool) -> Self {
        self.inherited = inherited;
        self
    }

    /// Reconstructs a declared device from its persisted record
    pub fn load(cfg: &DeviceConfig) -> Self {
        Self {
            kind: cfg.kind,
            major: cfg.major.clone(),
            minor: cfg.minor.clone(),
            mode: cfg.mode,
            name: cfg.name.clone(),
            inherited: false,
            inheritable: cfg.inheritable,
        }
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn major(&self) -> &str {
        &self.major
    }

    pub fn minor(&self) -> &str {
        &self.minor
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn inherited(&self) -> bool {
        self.inherited
    }

    pub fn inheritable(&self) -> bool {
        self.inheritable
    }

    pub(crate) fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    pub(crate) fn set_inherited(&mut self, inherited: bool) {
        self.inherited = inherited;
    }

    pub(crate) fn set_inheritable(&mut self, inheritable: bool) {
        self.inheritable = inheritable;
    }

    /// Returns true if both devices refer to the same device node
    pub fn same(&self, kind: DeviceKind, major: &str, minor: &str) -> bool {
        self.kind == kind && self.major == major && self.minor == minor
    }

    /// Device specifier without the access mode, e.g. `c 1:3`
    pub fn specifier(&self) -> String {
        format!("{} {}:{}", self.kind.as_char(), self.major, self.minor)
    }

    /// Changes the mode and returns the cgroup writes that transform
    /// the old mode into the new one.
    pub fn chmod(&mut self, mode: Mode) -> Changeset {
        let (removed, added) = self.mode.diff(mode);
        self.mode = mode;

        let mut changes = Changeset::new();
        if !removed.is_empty() {
            changes.push(Change::Deny(format!("{} {}", self.specifier(), removed)));
        }
        if !added.is_empty() {
            changes.push(Change::Allow(format!("{} {}", self.specifier(), added)));
        }
        changes
    }

    /// Record stored in the owner's configuration
    pub fn dump(&self) -> DeviceConfig {
        DeviceConfig {
            kind: self.kind,
            major: self.major.clone(),
            minor: self.minor.clone(),
            mode: self.mode,
            name: self.name.clone(),
            inheritable: self.inheritable,
        }
    }

    pub fn export(&self) -> DeviceDescriptor {
        DeviceDescriptor {
            kind: self.kind,
            major: self.major.clone(),
            minor: self.minor.clone(),
            mode: self.mode,
            name: self.name.clone(),
            inherited: self.inherited,
            inheritable: self.inheritable,
        }
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.same(other.kind, &other.major, &other.minor)
    }
}

impl Eq for Device {}

impl Hash for Device {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.major.hash(state);
        self.minor.hash(state);
    }
}

impl Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.specifier(), self.mode)
    }
}

/// Devices every root group provides to its descendants
pub fn default_devices() -> Vec<Device> {
    let rw = Mode::READ | Mode::WRITE;

    [
        ("/dev/null", DeviceKind::Char, "1", "3", rw),
        ("/dev/zero", DeviceKind::Char, "1", "5", rw),
        ("/dev/full", DeviceKind::Char, "1", "7", rw),
        ("/dev/random", DeviceKind::Char, "1", "8", rw),
        ("/dev/urandom", DeviceKind::Char, "1", "9", rw),
        ("/dev/tty", DeviceKind::Char, "5", "0", rw),
        ("/dev/console", DeviceKind::Char, "5", "1", rw),
        ("/dev/ptmx", DeviceKind::Char, "5", "2", rw),
        ("/dev/pts/*", DeviceKind::Char, "136", "*", rw),
        ("/dev/net/tun", DeviceKind::Char, "10", "200", rw),
    ]
    .into_iter()
    .map(|(name, kind, major, minor, mode)| {
        Device::new(kind, major, minor, mode)
            .with_name(name)
            .with_inheritable(true)
    })
    .collect()
}
