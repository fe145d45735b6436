use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{ConfigError, DeviceConfig};
use crate::manager::DeviceManager;

/// Position of an owner in the hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OwnerKind {
    /// Top-level group of a pool, it has no parent
    RootGroup,
    Group,
    /// Containers are always leaves
    Container,
}

impl OwnerKind {
    pub fn has_parent(&self) -> bool {
        !matches!(self, OwnerKind::RootGroup)
    }

    pub fn is_group(&self) -> bool {
        matches!(self, OwnerKind::RootGroup | OwnerKind::Group)
    }
}

impl Display for OwnerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let print = match self {
            OwnerKind::RootGroup => "root group",
            OwnerKind::Group => "group",
            OwnerKind::Container => "container",
        };

        write!(f, "{print}")
    }
}

/// Groups and containers as seen by their device managers.
///
/// All owners of one hierarchy must report the same [pool](Owner::pool).
/// Implementations must not call back into any device manager from
/// [`save_config`](Owner::save_config), it runs while the pool is locked.
pub trait Owner: Send + Sync {
    /// Identification used in errors and logs
    fn id(&self) -> &str;

    fn kind(&self) -> OwnerKind;

    /// Name of the pool the owner belongs to
    fn pool(&self) -> &str;

    fn devices(&self) -> &DeviceManager;

    fn parent(&self) -> Option<Arc<dyn Owner>>;

    /// Groups and containers placed directly under this owner
    fn children(&self) -> Vec<Arc<dyn Owner>>;

    /// Absolute path to the owner's cgroup in the given subsystem
    fn cgroup_path(&self, subsystem: &str) -> PathBuf;

    /// Persists the owner's declared devices
    fn save_config(&self, devices: &[DeviceConfig]) -> Result<(), ConfigError>;

    /// Ancestors ordered from the parent up to the root group
    fn parents(&self) -> Vec<Arc<dyn Owner>> {
        let mut parents = Vec::new();
        let mut current = self.parent();

        while let Some(owner) = current {
            current = owner.parent();
            parents.push(owner);
        }

        parents
    }

    /// All owners below this one, parents before their children
    fn descendants(&self) -> Vec<Arc<dyn Owner>> {
        let mut descendants = Vec::new();

        for child in self.children() {
            let below = child.descendants();
            descendants.push(child);
            descendants.extend(below);
        }

        descendants
    }
}
