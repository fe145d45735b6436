//! Groups and containers of a pool.
//!
//! A pool has one root group. Groups hold child groups and containers,
//! parents keep their children alive while children refer to their parent
//! weakly. Cgroups are laid out below the devices mount point as
//! `osctl/pool.<pool>/group.<name>/.../ct.<id>`.
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use crate::common::{
    get_subsystem_mount_point, GetCgroupSetupError, MountPointError, DEFAULT_CGROUP_ROOT,
    DEVICES_SUBSYSTEM,
};
use crate::config::{ConfigError, DeviceConfig, DevicesConfig};
use crate::controller::{detect_controller, DevicesController};
use crate::lock;
use crate::manager::{DeviceError, DeviceManager};
use crate::owner::{Owner, OwnerKind};

#[derive(thiserror::Error, Debug)]
pub enum SetupError {
    #[error("failed to detect cgroup setup: {0}")]
    CgroupSetup(#[from] GetCgroupSetupError),
    #[error("failed to locate the devices controller: {0}")]
    MountPoint(#[from] MountPointError),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Where an owner keeps its cgroup and configuration
#[derive(Debug, Clone)]
struct Location {
    cgroup_root: PathBuf,
    cgroup_dir: PathBuf,
    config_path: Option<PathBuf>,
}

impl Location {
    fn child(&self, dir: String, config_path: Option<PathBuf>) -> Self {
        Self {
            cgroup_root: self.cgroup_root.clone(),
            cgroup_dir: self.cgroup_dir.join(dir),
            config_path,
        }
    }

    fn cgroup_path(&self, subsystem: &str) -> PathBuf {
        self.cgroup_root.join(subsystem).join(&self.cgroup_dir)
    }

    // The last saved configuration is kept in memory when there is no file
    fn save(
        &self,
        saved: &Mutex<Vec<DeviceConfig>>,
        devices: &[DeviceConfig],
    ) -> Result<(), ConfigError> {
        if let Some(path) = &self.config_path {
            DevicesConfig::new(devices.to_vec()).save(path)?;
        }

        *saved.lock().unwrap_or_else(PoisonError::into_inner) = devices.to_vec();
        Ok(())
    }
}

fn load_config(path: Option<&Path>) -> Result<Vec<DeviceConfig>, ConfigError> {
    match path {
        Some(path) if path.exists() => Ok(DevicesConfig::load(path)?.devices),
        _ => Ok(Vec::new()),
    }
}

pub struct Group {
    name: String,
    id: String,
    pool: String,
    parent: Option<Weak<dyn Owner>>,
    children: RwLock<Vec<Arc<dyn Owner>>>,
    location: Location,
    saved: Mutex<Vec<DeviceConfig>>,
    controller: Arc<dyn DevicesController>,
    devices: DeviceManager,
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("pool", &self.pool)
            .field("id", &self.id)
            .finish()
    }
}

impl Group {
    /// Creates the root group of `pool` without any devices. Its cgroups
    /// live below `cgroup_root`, e.g. `/sys/fs/cgroup`.
    pub fn new_root<P: Into<PathBuf>>(
        pool: &str,
        cgroup_root: P,
        controller: Arc<dyn DevicesController>,
    ) -> Arc<Group> {
        let location = Location {
            cgroup_root: cgroup_root.into(),
            cgroup_dir: PathBuf::from("osctl").join(format!("pool.{pool}")),
            config_path: None,
        };

        Self::build(pool, "/", "/".to_owned(), None, location, controller, Vec::new())
    }

    /// Creates the root group with the devices stored in `config_path`. If
    /// there is no stored configuration yet, the group is populated with the
    /// default devices.
    pub fn load_root<P: Into<PathBuf>>(
        pool: &str,
        cgroup_root: P,
        controller: Arc<dyn DevicesController>,
        config_path: Option<PathBuf>,
    ) -> Result<Arc<Group>, DeviceError> {
        let stored = config_path.as_deref().map_or(false, Path::exists);
        let cfg = load_config(config_path.as_deref())?;
        let location = Location {
            cgroup_root: cgroup_root.into(),
            cgroup_dir: PathBuf::from("osctl").join(format!("pool.{pool}")),
            config_path,
        };

        let root = Self::build(pool, "/", "/".to_owned(), None, location, controller, cfg);
        if !stored {
            root.devices.init()?;
        }
        Ok(root)
    }

    /// Creates the root group on this system's cgroup hierarchy, with the
    /// controller matching its cgroup setup
    pub fn load_system_root(
        pool: &str,
        config_path: Option<PathBuf>,
    ) -> Result<Arc<Group>, SetupError> {
        let controller = detect_controller()?;
        let cgroup_root = if controller.legacy() {
            let mount_point = get_subsystem_mount_point(DEVICES_SUBSYSTEM)?;
            match mount_point.parent() {
                Some(root) => root.to_path_buf(),
                None => mount_point.clone(),
            }
        } else {
            PathBuf::from(DEFAULT_CGROUP_ROOT)
        };
        tracing::debug!(pool, ?cgroup_root, "using cgroup root");

        Ok(Self::load_root(pool, cgroup_root, controller, config_path)?)
    }

    /// Creates a group below `parent` which inherits all devices the
    /// parent provides for inheritance
    pub fn new_child(parent: &Arc<Group>, name: &str) -> Result<Arc<Group>, DeviceError> {
        Self::load_child(parent, name, None)
    }

    /// Creates a group below `parent` with declared devices read from
    /// `config_path` and the rest inherited from the parent
    pub fn load_child(
        parent: &Arc<Group>,
        name: &str,
        config_path: Option<PathBuf>,
    ) -> Result<Arc<Group>, DeviceError> {
        let cfg = load_config(config_path.as_deref())?;
        let location = parent.location.child(format!("group.{name}"), config_path);
        let group = Self::build(
            &parent.pool,
            name,
            parent.child_id(name),
            Some(parent),
            location,
            parent.controller.clone(),
            cfg,
        );

        // Cascades must not run between inheriting and joining the parent
        lock::sync::<_, DeviceError, _>(&parent.pool, |token| {
            group.devices.init_locked(token)?;
            parent.add_child(group.clone());
            Ok(group)
        })
    }

    fn build(
        pool: &str,
        name: &str,
        id: String,
        parent: Option<&Arc<Group>>,
        location: Location,
        controller: Arc<dyn DevicesController>,
        cfg: Vec<DeviceConfig>,
    ) -> Arc<Group> {
        let parent = parent.map(|p| {
            let owner: Arc<dyn Owner> = p.clone();
            Arc::downgrade(&owner)
        });

        Arc::new_cyclic(|me: &Weak<Group>| {
            let owner: Weak<dyn Owner> = me.clone();
            Group {
                name: name.to_owned(),
                id,
                pool: pool.to_owned(),
                parent,
                children: RwLock::new(Vec::new()),
                location,
                saved: Mutex::new(cfg.clone()),
                controller: controller.clone(),
                devices: DeviceManager::load(owner, controller, &cfg),
            }
        })
    }

    fn child_id(&self, name: &str) -> String {
        if self.parent.is_none() {
            format!("/{name}")
        } else {
            format!("{}/{name}", self.id)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn add_child(&self, child: Arc<dyn Owner>) {
        self.children
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(child);
    }

    /// Detaches a child group or container
    pub fn remove_child(&self, id: &str) -> Option<Arc<dyn Owner>> {
        let mut children = self.children.write().unwrap_or_else(PoisonError::into_inner);
        let index = children.iter().position(|c| c.id() == id)?;
        Some(children.remove(index))
    }

    /// Copies this group under `parent` with the name `name`. The copy gets
    /// clones of all devices, children are not copied. The copy has no
    /// configuration file of its own.
    pub fn dup(&self, parent: &Arc<Group>, name: &str) -> Result<Arc<Group>, DeviceError> {
        lock::sync::<_, DeviceError, _>(&self.pool, |token| {
            token.check(&parent.pool)?;

            let location = parent.location.child(format!("group.{name}"), None);
            let parent_owner: Arc<dyn Owner> = parent.clone();
            let saved = self.saved.lock().unwrap_or_else(PoisonError::into_inner).clone();

            let group = Arc::new_cyclic(|me: &Weak<Group>| {
                let owner: Weak<dyn Owner> = me.clone();
                Group {
                    name: name.to_owned(),
                    id: parent.child_id(name),
                    pool: self.pool.clone(),
                    parent: Some(Arc::downgrade(&parent_owner)),
                    children: RwLock::new(Vec::new()),
                    location,
                    saved: Mutex::new(saved),
                    controller: self.controller.clone(),
                    devices: self.devices.dup_locked(token, owner),
                }
            });

            parent.add_child(group.clone());
            Ok(group)
        })
    }

    /// Last configuration written by the device manager
    pub fn saved_config(&self) -> Vec<DeviceConfig> {
        self.saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Owner for Group {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> OwnerKind {
        if self.parent.is_some() {
            OwnerKind::Group
        } else {
            OwnerKind::RootGroup
        }
    }

    fn pool(&self) -> &str {
        &self.pool
    }

    fn devices(&self) -> &DeviceManager {
        &self.devices
    }

    fn parent(&self) -> Option<Arc<dyn Owner>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    fn children(&self) -> Vec<Arc<dyn Owner>> {
        self.children
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn cgroup_path(&self, subsystem: &str) -> PathBuf {
        self.location.cgroup_path(subsystem)
    }

    fn save_config(&self, devices: &[DeviceConfig]) -> Result<(), ConfigError> {
        self.location.save(&self.saved, devices)
    }
}

pub struct Container {
    id: String,
    pool: String,
    group: Weak<dyn Owner>,
    location: Location,
    saved: Mutex<Vec<DeviceConfig>>,
    devices: DeviceManager,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("pool", &self.pool)
            .field("id", &self.id)
            .finish()
    }
}

impl Container {
    pub fn new(group: &Arc<Group>, id: &str) -> Result<Arc<Container>, DeviceError> {
        Self::load(group, id, None)
    }

    /// Creates a container in `group`. Declared devices are read from
    /// `config_path`, the rest is inherited from the group.
    pub fn load(
        group: &Arc<Group>,
        id: &str,
        config_path: Option<PathBuf>,
    ) -> Result<Arc<Container>, DeviceError> {
        let cfg = load_config(config_path.as_deref())?;
        let location = group.location.child(format!("ct.{id}"), config_path);
        let group_owner: Arc<dyn Owner> = group.clone();
        let controller = group.controller.clone();

        let ct = Arc::new_cyclic(|me: &Weak<Container>| {
            let owner: Weak<dyn Owner> = me.clone();
            Container {
                id: id.to_owned(),
                pool: group.pool.clone(),
                group: Arc::downgrade(&group_owner),
                location,
                saved: Mutex::new(cfg.clone()),
                devices: DeviceManager::load(owner, controller, &cfg),
            }
        });

        lock::sync::<_, DeviceError, _>(&group.pool, |token| {
            ct.devices.init_locked(token)?;
            group.add_child(ct.clone());
            Ok(ct)
        })
    }

    pub fn saved_config(&self) -> Vec<DeviceConfig> {
        self.saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Owner for Container {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> OwnerKind {
        OwnerKind::Container
    }

    fn pool(&self) -> &str {
        &self.pool
    }

    fn devices(&self) -> &DeviceManager {
        &self.devices
    }

    fn parent(&self) -> Option<Arc<dyn Owner>> {
        self.group.upgrade()
    }

    fn children(&self) -> Vec<Arc<dyn Owner>> {
        Vec::new()
    }

    fn cgroup_path(&self, subsystem: &str) -> PathBuf {
        self.location.cgroup_path(subsystem)
    }

    fn save_config(&self, devices: &[DeviceConfig]) -> Result<(), ConfigError> {
        self.location.save(&self.saved, devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{default_devices, Device, DeviceKind};
    use crate::mode::Mode;
    use crate::test_controller::RecordingController;

    fn root(pool: &str) -> (Arc<RecordingController>, Arc<Group>) {
        let controller = Arc::new(RecordingController::default());
        let root = Group::load_root(pool, "/sys/fs/cgroup", controller.clone(), None).unwrap();
        (controller, root)
    }

    #[test]
    fn test_root_gets_default_devices() {
        let (_, root) = root("hier-defaults");

        assert_eq!(root.kind(), OwnerKind::RootGroup);
        assert_eq!(root.devices().len().unwrap(), default_devices().len());
        assert_eq!(root.saved_config().len(), default_devices().len());
    }

    #[test]
    fn test_reloaded_root_keeps_stored_devices() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("root.json");
        let tun = Device::new(DeviceKind::Char, "10", "200", Mode::READ);
        let controller = Arc::new(RecordingController::default());

        let root = Group::load_root(
            "hier-reload",
            "/sys/fs/cgroup",
            controller.clone(),
            Some(path.clone()),
        )
        .unwrap();
        assert!(path.exists());
        root.devices().remove(&tun).unwrap();
        drop(root);

        let root = Group::load_root("hier-reload", "/sys/fs/cgroup", controller, Some(path)).unwrap();

        assert!(!root.devices().includes(&tun).unwrap());
        assert_eq!(root.devices().len().unwrap(), default_devices().len() - 1);
        assert!(root.devices().devices().unwrap().iter().all(|d| !d.inherited()));
    }

    #[test]
    fn test_cgroup_paths() {
        let (_, root) = root("hier-paths");
        let group = Group::new_child(&root, "web").unwrap();
        let ct = Container::new(&group, "app").unwrap();

        assert_eq!(
            root.cgroup_path(DEVICES_SUBSYSTEM),
            PathBuf::from("/sys/fs/cgroup/devices/osctl/pool.hier-paths")
        );
        assert_eq!(
            ct.cgroup_path(DEVICES_SUBSYSTEM),
            PathBuf::from("/sys/fs/cgroup/devices/osctl/pool.hier-paths/group.web/ct.app")
        );
        assert_eq!(group.id(), "/web");
        assert_eq!(Group::new_child(&group, "api").unwrap().id(), "/web/api");
    }

    #[test]
    fn test_children_inherit_from_parent() {
        let (_, root) = root("hier-inherit");
        let group = Group::new_child(&root, "web").unwrap();
        let ct = Container::new(&group, "app").unwrap();

        let devices = ct.devices().devices().unwrap();
        assert_eq!(devices.len(), default_devices().len());
        assert!(devices.iter().all(Device::inherited));
        assert!(ct.saved_config().is_empty());
        assert_eq!(group.children().len(), 1);
        assert_eq!(ct.parents().len(), 2);
        assert_eq!(root.descendants().len(), 2);
    }

    #[test]
    fn test_load_child_from_config() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("web.json");
        let tun = Device::new(DeviceKind::Char, "10", "200", Mode::READ);
        DevicesConfig::new(vec![tun.dump()]).save(&path).unwrap();

        let (_, root) = root("hier-load");
        let group = Group::load_child(&root, "web", Some(path.clone())).unwrap();

        let held = group.devices().get(&tun).unwrap().unwrap();
        assert!(!held.inherited());
        assert_eq!(held.mode(), Mode::READ);
        assert_eq!(group.devices().len().unwrap(), default_devices().len());

        group.devices().unset_inherit(&held).unwrap();
        assert_eq!(DevicesConfig::load(&path).unwrap().devices.len(), 1);
    }

    #[test]
    fn test_dup_copies_devices() {
        let (_, root) = root("hier-dup");
        let group = Group::new_child(&root, "web").unwrap();
        let tun = Device::new(DeviceKind::Char, "10", "200", Mode::READ);
        group.devices().promote(&tun).unwrap();

        let copy = group.dup(&root, "web-copy").unwrap();
        copy.devices().unset_inherit(&tun).unwrap();

        assert_eq!(copy.id(), "/web-copy");
        assert!(copy.devices().used(&tun).unwrap());
        assert!(group.devices().get(&tun).unwrap().unwrap().inheritable());
        assert!(!copy.devices().get(&tun).unwrap().unwrap().inheritable());
        assert_eq!(root.children().len(), 2);
    }

    #[test]
    fn test_remove_child() {
        let (_, root) = root("hier-remove");
        let group = Group::new_child(&root, "web").unwrap();

        assert!(root.remove_child(group.id()).is_some());
        assert!(root.children().is_empty());
        assert!(root.remove_child(group.id()).is_none());
    }
}
