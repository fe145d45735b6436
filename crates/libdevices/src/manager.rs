//! Device manager of a single owner.
//!
//! Each group and container has its own manager holding the devices the
//! owner may access. Managers of one hierarchy cooperate: groups provide
//! devices to their descendants, which either inherit them or declare them
//! on their own, and access mode changes are pushed down to inherited copies.
//! Every operation runs under the lock of the owner's pool. Public methods
//! acquire it, `*_locked` methods take the token of an already held lock and
//! are used to descend into other managers of the same hierarchy.
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::common::DEVICES_SUBSYSTEM;
use crate::config::{ConfigError, DeviceConfig, DeviceDescriptor};
use crate::controller::{ControllerError, DevicesController};
use crate::device::{default_devices, Changeset, Device, DeviceKind};
use crate::lock::{self, LockError, PoolToken};
use crate::mode::Mode;
use crate::owner::{Owner, OwnerKind};

#[derive(thiserror::Error, Debug)]
pub enum DeviceError {
    #[error("device {device} is not available in {owner}")]
    NotAvailable { device: String, owner: String },
    #[error("device {device} is available in {owner} only with mode {mode}")]
    ModeInsufficient {
        device: String,
        owner: String,
        mode: Mode,
    },
    #[error("{owner} requires device {device} with mode {mode}")]
    DescendantRequiresMode {
        device: String,
        owner: String,
        mode: Mode,
    },
    #[error("device {device} already exists in {owner}")]
    AlreadyExists { device: String, owner: String },
    #[error("device {device} not found in {owner}")]
    NotFound { device: String, owner: String },
    #[error("{operation} is not supported by {kind} {owner}")]
    Unsupported {
        operation: &'static str,
        kind: OwnerKind,
        owner: String,
    },
    #[error("owner of the device manager has been dropped")]
    OwnerDropped,
    #[error("cgroup error: {0}")]
    Controller(#[from] ControllerError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("lock error: {0}")]
    Lock(#[from] LockError),
}

type Result<T> = std::result::Result<T, DeviceError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChmodOpts {
    /// Turn an inherited device into a declared one
    pub promote: bool,
    /// Broaden the mode in parent groups if needed
    pub parents: bool,
    /// Update inherited copies in descendant groups
    pub descendants: bool,
    /// Update inherited copies in containers
    pub containers: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOpts {
    pub descendants: bool,
    pub containers: bool,
}

impl ApplyOpts {
    pub fn recursive() -> Self {
        Self {
            descendants: true,
            containers: true,
        }
    }
}

/// Steps computed by [`DeviceManager::replace`], in the order they are
/// carried out
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub add: Vec<Device>,
    pub promote: Vec<Device>,
    pub chmod: Vec<(Device, Mode)>,
    /// Declared devices that go back to being inherited from the parent
    pub revert: Vec<Device>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty()
            && self.promote.is_empty()
            && self.chmod.is_empty()
            && self.revert.is_empty()
    }
}

#[derive(Debug, Default)]
struct State {
    devices: Vec<Device>,
    // Set once the cgroup has been reset by `apply`, cleared by mutations
    cleared: bool,
}

impl State {
    fn position(&self, device: &Device) -> Option<usize> {
        self.devices.iter().position(|d| d == device)
    }

    fn get(&self, device: &Device) -> Option<&Device> {
        self.devices.iter().find(|d| *d == device)
    }

    fn get_mut(&mut self, device: &Device) -> Option<&mut Device> {
        self.devices.iter_mut().find(|d| **d == *device)
    }
}

pub struct DeviceManager {
    owner: Weak<dyn Owner>,
    controller: Arc<dyn DevicesController>,
    state: Mutex<State>,
}

impl std::fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceManager")
            .field("state", &*self.state())
            .finish()
    }
}

fn not_found(device: &Device, owner: &dyn Owner) -> DeviceError {
    DeviceError::NotFound {
        device: device.specifier(),
        owner: owner.id().to_owned(),
    }
}

impl DeviceManager {
    pub fn new(owner: Weak<dyn Owner>, controller: Arc<dyn DevicesController>) -> Self {
        Self::with_devices(owner, controller, Vec::new())
    }

    pub fn with_devices(
        owner: Weak<dyn Owner>,
        controller: Arc<dyn DevicesController>,
        devices: Vec<Device>,
    ) -> Self {
        Self {
            owner,
            controller,
            state: Mutex::new(State {
                devices,
                cleared: false,
            }),
        }
    }

    /// Creates a manager from the owner's persisted devices
    pub fn load(
        owner: Weak<dyn Owner>,
        controller: Arc<dyn DevicesController>,
        cfg: &[DeviceConfig],
    ) -> Self {
        Self::with_devices(owner, controller, cfg.iter().map(Device::load).collect())
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn owner(&self) -> Result<Arc<dyn Owner>> {
        self.owner.upgrade().ok_or(DeviceError::OwnerDropped)
    }

    /// Returns the owner after making sure it belongs to the locked pool
    fn owner_in(&self, token: &PoolToken) -> Result<Arc<dyn Owner>> {
        let owner = self.owner()?;
        token.check(owner.pool())?;
        Ok(owner)
    }

    fn sync<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&PoolToken) -> Result<T>,
    {
        let owner = self.owner()?;
        lock::sync(owner.pool(), f)
    }

    fn save(&self, owner: &dyn Owner) -> Result<()> {
        let dump = self.dump_unlocked();
        owner.save_config(&dump)?;
        Ok(())
    }

    fn cgroup(&self, owner: &dyn Owner) -> PathBuf {
        owner.cgroup_path(DEVICES_SUBSYSTEM)
    }

    fn dump_unlocked(&self) -> Vec<DeviceConfig> {
        self.state()
            .devices
            .iter()
            .filter(|d| !d.inherited())
            .map(Device::dump)
            .collect()
    }

    /// Returns the manager's own copy of `device`, the pool has to be locked
    pub fn get_locked(&self, token: &PoolToken, device: &Device) -> Result<Option<Device>> {
        self.owner_in(token)?;
        Ok(self.state().get(device).cloned())
    }

    /// Populates a new manager: root groups start with the default device
    /// set, other owners inherit from their parent.
    pub fn init(&self) -> Result<()> {
        self.sync(|token| self.init_locked(token))
    }

    pub fn init_locked(&self, token: &PoolToken) -> Result<()> {
        let owner = self.owner_in(token)?;

        match owner.parent() {
            None => {
                for device in default_devices() {
                    if self.state().position(&device).is_none() {
                        self.add_locked(token, device, None)?;
                    }
                }
                Ok(())
            }
            Some(parent) => self.inherit_all_from_locked(token, parent.as_ref()),
        }
    }

    /// Inherits all inheritable devices of `parent` that are not held yet
    pub fn inherit_all_from(&self, parent: &dyn Owner) -> Result<()> {
        self.sync(|token| self.inherit_all_from_locked(token, parent))
    }

    pub fn inherit_all_from_locked(&self, token: &PoolToken, parent: &dyn Owner) -> Result<()> {
        token.check(parent.pool())?;
        let provided: Vec<Device> = parent
            .devices()
            .state()
            .devices
            .iter()
            .filter(|d| d.inheritable())
            .cloned()
            .collect();

        for device in provided {
            if self.state().position(&device).is_none() {
                self.inherit_locked(token, &device)?;
            }
        }

        Ok(())
    }

    pub fn add_new(
        &self,
        kind: DeviceKind,
        major: &str,
        minor: &str,
        mode: Mode,
        inheritable: bool,
    ) -> Result<()> {
        let device = Device::new(kind, major, minor, mode).with_inheritable(inheritable);
        self.add(device, None)
    }

    /// Adds a device. When `parent` is given, the parent and its ancestors
    /// are made to provide the device first. Whether the hierarchy permits
    /// the device is not checked, see [`check_availability`](Self::check_availability).
    /// The cgroup is configured by the next [`apply`](Self::apply).
    pub fn add(&self, device: Device, parent: Option<&dyn Owner>) -> Result<()> {
        self.sync(|token| self.add_locked(token, device, parent))
    }

    pub fn add_locked(
        &self,
        token: &PoolToken,
        device: Device,
        parent: Option<&dyn Owner>,
    ) -> Result<()> {
        let owner = self.owner_in(token)?;

        if let Some(parent) = parent {
            token.check(parent.pool())?;
            parent.devices().provide_locked(token, &device)?;
        }

        {
            let mut state = self.state();
            if state.position(&device).is_some() {
                return Err(DeviceError::AlreadyExists {
                    device: device.specifier(),
                    owner: owner.id().to_owned(),
                });
            }

            tracing::debug!(owner = owner.id(), device = %device, "add device");
            state.devices.push(device);
            state.cleared = false;
        }

        self.save(owner.as_ref())
    }

    /// Makes sure that this owner and all its ancestors hold `device` with
    /// at least its mode. Missing devices are added as declared and not
    /// inheritable, insufficient modes are broadened. Ancestors are handled
    /// before descendants.
    pub fn provide(&self, device: &Device) -> Result<()> {
        self.sync(|token| self.provide_locked(token, device))
    }

    pub fn provide_locked(&self, token: &PoolToken, device: &Device) -> Result<()> {
        let owner = self.owner_in(token)?;

        if let Some(parent) = owner.parent() {
            token.check(parent.pool())?;
            parent.devices().provide_locked(token, device)?;
        }

        let current = self.state().get(device).map(Device::mode);
        match current {
            Some(mode) if mode.compatible(device.mode()) => Ok(()),
            Some(mode) => {
                self.chmod_locked(token, device, mode | device.mode(), ChmodOpts::default())?;
                Ok(())
            }
            None => {
                let provided = device
                    .clone()
                    .with_inherited(false)
                    .with_inheritable(false);
                self.add_locked(token, provided, None)
            }
        }
    }

    /// Adds a copy of a device provided by a parent group
    pub fn inherit(&self, device: &Device) -> Result<()> {
        self.sync(|token| self.inherit_locked(token, device))
    }

    pub fn inherit_locked(&self, token: &PoolToken, device: &Device) -> Result<()> {
        let owner = self.owner_in(token)?;
        let mut state = self.state();

        if state.position(device).is_some() {
            return Err(DeviceError::AlreadyExists {
                device: device.specifier(),
                owner: owner.id().to_owned(),
            });
        }

        tracing::debug!(owner = owner.id(), device = %device, "inherit device");
        state.devices.push(device.clone().with_inherited(true));
        state.cleared = false;
        Ok(())
    }

    /// Removes the device and revokes access to it. A missing cgroup is
    /// ignored, there is nothing left to revoke.
    pub fn remove(&self, device: &Device) -> Result<()> {
        self.sync(|token| self.remove_locked(token, device))
    }

    pub fn remove_locked(&self, token: &PoolToken, device: &Device) -> Result<()> {
        let owner = self.owner_in(token)?;

        let removed = {
            let mut state = self.state();
            let index = state
                .position(device)
                .ok_or_else(|| not_found(device, owner.as_ref()))?;
            state.cleared = false;
            state.devices.remove(index)
        };
        tracing::debug!(owner = owner.id(), device = %removed, "remove device");

        self.save(owner.as_ref())?;

        if !self.controller.legacy() {
            return Ok(());
        }

        match self
            .controller
            .deny(&self.cgroup(owner.as_ref()), &removed.to_string())
        {
            Err(ControllerError::NotFound { path }) => {
                tracing::warn!(owner = owner.id(), ?path, "devices cgroup does not exist");
                Ok(())
            }
            result => Ok(result?),
        }
    }

    /// Removes the device together with the inherited copies below `owner`.
    /// A declared copy is kept together with everything below it.
    fn withdraw_locked(
        &self,
        token: &PoolToken,
        owner: &dyn Owner,
        device: &Device,
    ) -> Result<()> {
        self.remove_locked(token, device)?;
        Self::remove_inherited_locked(token, owner, device)
    }

    fn remove_inherited_locked(
        token: &PoolToken,
        owner: &dyn Owner,
        device: &Device,
    ) -> Result<()> {
        for child in owner.children() {
            token.check(child.pool())?;
            let manager = child.devices();
            match manager.get_locked(token, device)? {
                Some(held) if held.inherited() => {}
                _ => continue,
            }

            manager.remove_locked(token, device)?;
            Self::remove_inherited_locked(token, child.as_ref(), device)?;
        }

        Ok(())
    }

    /// Changes the access mode of a device and returns the cgroup writes
    /// that were needed for it
    pub fn chmod(&self, device: &Device, mode: Mode, opts: ChmodOpts) -> Result<Changeset> {
        self.sync(|token| self.chmod_locked(token, device, mode, opts))
    }

    pub fn chmod_locked(
        &self,
        token: &PoolToken,
        device: &Device,
        mode: Mode,
        opts: ChmodOpts,
    ) -> Result<Changeset> {
        let owner = self.owner_in(token)?;

        if opts.parents {
            if let Some(parent) = owner.parent() {
                token.check(parent.pool())?;
                parent
                    .devices()
                    .provide_locked(token, &device.clone().with_mode(mode))?;
            }
        }

        let changes = {
            let mut state = self.state();
            let held = state
                .get_mut(device)
                .ok_or_else(|| not_found(device, owner.as_ref()))?;
            let changes = held.chmod(mode);
            if opts.promote && held.inherited() {
                held.set_inherited(false);
            }
            tracing::debug!(owner = owner.id(), device = %held, "chmod device");
            state.cleared = false;
            changes
        };

        self.save(owner.as_ref())?;
        if self.controller.legacy() {
            self.controller
                .apply_changes(&self.cgroup(owner.as_ref()), &changes)?;
        }

        if opts.descendants || opts.containers {
            self.cascade_locked(token, owner.as_ref(), device, mode, &changes, opts)?;
        }

        Ok(changes)
    }

    /// Pushes a new mode into the inherited copies below `owner`. A declared
    /// copy is left alone together with everything below it.
    fn cascade_locked(
        &self,
        token: &PoolToken,
        owner: &dyn Owner,
        device: &Device,
        mode: Mode,
        changes: &Changeset,
        opts: ChmodOpts,
    ) -> Result<()> {
        for child in owner.children() {
            let wanted = match child.kind() {
                OwnerKind::Container => opts.containers,
                OwnerKind::Group | OwnerKind::RootGroup => opts.descendants,
            };
            if !wanted {
                continue;
            }

            token.check(child.pool())?;
            let manager = child.devices();
            match manager.get_locked(token, device)? {
                Some(held) if held.inherited() => {}
                _ => continue,
            }

            manager.update_inherited_mode_locked(token, device, mode, changes)?;
            manager.cascade_locked(token, child.as_ref(), device, mode, changes, opts)?;
        }

        Ok(())
    }

    /// Called on inherited copies when the mode in the parent group changes
    pub fn update_inherited_mode(
        &self,
        device: &Device,
        mode: Mode,
        changes: &Changeset,
    ) -> Result<()> {
        self.sync(|token| self.update_inherited_mode_locked(token, device, mode, changes))
    }

    pub fn update_inherited_mode_locked(
        &self,
        token: &PoolToken,
        device: &Device,
        mode: Mode,
        changes: &Changeset,
    ) -> Result<()> {
        let owner = self.owner_in(token)?;

        {
            let mut state = self.state();
            let held = state
                .get_mut(device)
                .ok_or_else(|| not_found(device, owner.as_ref()))?;
            held.set_mode(mode);
            tracing::debug!(owner = owner.id(), device = %held, "update inherited mode");
            state.cleared = false;
        }

        self.save(owner.as_ref())?;
        if self.controller.legacy() {
            self.controller
                .apply_changes(&self.cgroup(owner.as_ref()), changes)?;
        }

        Ok(())
    }

    /// Turns an inherited device into a declared one
    pub fn promote(&self, device: &Device) -> Result<()> {
        self.sync(|token| self.promote_locked(token, device))
    }

    pub fn promote_locked(&self, token: &PoolToken, device: &Device) -> Result<()> {
        self.update_flags(token, device, |d| d.set_inherited(false))
    }

    /// Allows descendants to inherit the device
    pub fn set_inherit(&self, device: &Device) -> Result<()> {
        self.sync(|token| self.update_flags(token, device, |d| d.set_inheritable(true)))
    }

    pub fn unset_inherit(&self, device: &Device) -> Result<()> {
        self.sync(|token| self.update_flags(token, device, |d| d.set_inheritable(false)))
    }

    fn update_flags<F>(&self, token: &PoolToken, device: &Device, f: F) -> Result<()>
    where
        F: FnOnce(&mut Device),
    {
        let owner = self.owner_in(token)?;

        {
            let mut state = self.state();
            let held = state
                .get_mut(device)
                .ok_or_else(|| not_found(device, owner.as_ref()))?;
            f(held);
            state.cleared = false;
        }

        self.save(owner.as_ref())
    }

    /// Turns a declared device back into an inherited one, taking the mode
    /// the parent group provides. If the parent does not provide the device
    /// for inheritance, the device is removed along with its inherited copies
    /// in descendants. Root groups have no parent to
    /// inherit from and report [`DeviceError::Unsupported`].
    pub fn inherit_promoted(&self, device: &Device) -> Result<()> {
        self.sync(|token| self.inherit_promoted_locked(token, device))
    }

    pub fn inherit_promoted_locked(&self, token: &PoolToken, device: &Device) -> Result<()> {
        let owner = self.owner_in(token)?;
        let parent = owner.parent().ok_or_else(|| DeviceError::Unsupported {
            operation: "inherit_promoted",
            kind: owner.kind(),
            owner: owner.id().to_owned(),
        })?;

        token.check(parent.pool())?;
        let provided = match parent.devices().get_locked(token, device)? {
            Some(provided) if provided.inheritable() => provided,
            _ => {
                tracing::debug!(
                    owner = owner.id(),
                    device = %device,
                    "parent does not provide the device, removing it"
                );
                return self.withdraw_locked(token, owner.as_ref(), device);
            }
        };

        let mode = {
            let mut state = self.state();
            let held = state
                .get_mut(device)
                .ok_or_else(|| not_found(device, owner.as_ref()))?;
            held.set_inherited(true);
            let mode = held.mode();
            state.cleared = false;
            mode
        };
        self.save(owner.as_ref())?;

        if mode != provided.mode() {
            self.chmod_locked(
                token,
                device,
                provided.mode(),
                ChmodOpts {
                    descendants: true,
                    containers: true,
                    ..Default::default()
                },
            )?;
        }

        Ok(())
    }

    /// Checks that `owner` and all its ancestors provide `device` with
    /// `mode`, or the device's own mode if not given. Owners are checked
    /// from `owner` up to the root group, the first failure is reported.
    pub fn check_availability(
        &self,
        device: &Device,
        owner: &Arc<dyn Owner>,
        mode: Option<Mode>,
    ) -> Result<()> {
        self.sync(|token| {
            let requested = mode.unwrap_or_else(|| device.mode());

            for grp in std::iter::once(owner.clone()).chain(owner.parents()) {
                token.check(grp.pool())?;
                let provided = grp.devices().get_locked(token, device)?.ok_or_else(|| {
                    DeviceError::NotAvailable {
                        device: device.specifier(),
                        owner: grp.id().to_owned(),
                    }
                })?;

                if !provided.mode().compatible(requested) {
                    return Err(DeviceError::ModeInsufficient {
                        device: device.specifier(),
                        owner: grp.id().to_owned(),
                        mode: provided.mode(),
                    });
                }
            }

            Ok(())
        })
    }

    /// Checks that no descendant declares `device` with a broader mode than
    /// `mode`. Inherited copies follow the parent and are not considered.
    pub fn check_descendants(&self, device: &Device, mode: Mode) -> Result<()> {
        self.sync(|token| {
            let owner = self.owner_in(token)?;

            for descendant in owner.descendants() {
                token.check(descendant.pool())?;
                match descendant.devices().get_locked(token, device)? {
                    Some(held) if !held.inherited() && !mode.compatible(held.mode()) => {
                        return Err(DeviceError::DescendantRequiresMode {
                            device: device.specifier(),
                            owner: descendant.id().to_owned(),
                            mode: held.mode(),
                        });
                    }
                    _ => {}
                }
            }

            Ok(())
        })
    }

    /// Configures the cgroup to allow exactly the held devices
    pub fn apply(&self, opts: ApplyOpts) -> Result<()> {
        self.sync(|token| self.apply_locked(token, opts))
    }

    pub fn apply_locked(&self, token: &PoolToken, opts: ApplyOpts) -> Result<()> {
        let owner = self.owner_in(token)?;

        if self.controller.legacy() {
            let cgroup = self.cgroup(owner.as_ref());
            let (devices, cleared) = {
                let state = self.state();
                (state.devices.clone(), state.cleared)
            };

            if !cleared {
                self.controller.deny_all(&cgroup)?;
                self.state().cleared = true;
            }

            for device in &devices {
                self.controller.allow(&cgroup, &device.to_string())?;
            }
        }

        for child in owner.children() {
            let wanted = match child.kind() {
                OwnerKind::Container => opts.containers,
                OwnerKind::Group | OwnerKind::RootGroup => opts.descendants,
            };
            if wanted {
                token.check(child.pool())?;
                child.devices().apply_locked(token, opts)?;
            }
        }

        Ok(())
    }

    /// Computes the steps needed to reach `new_devices`, the desired set of
    /// declared devices, without changing anything
    pub fn plan_replace(&self, new_devices: &[Device]) -> Result<ReconcilePlan> {
        self.sync(|token| {
            self.owner_in(token)?;
            Ok(self.plan_unlocked(new_devices))
        })
    }

    fn plan_unlocked(&self, new_devices: &[Device]) -> ReconcilePlan {
        let state = self.state();
        let mut plan = ReconcilePlan::default();

        for cur in &state.devices {
            match new_devices.iter().find(|want| *want == cur) {
                None => {
                    if !cur.inherited() {
                        plan.revert.push(cur.clone());
                    }
                }
                Some(want) if want.mode() != cur.mode() => {
                    plan.chmod.push((cur.clone(), want.mode()));
                }
                Some(want) if want.inherited() && cur.inherited() => {
                    plan.promote.push(cur.clone());
                }
                Some(_) => {}
            }
        }

        for want in new_devices {
            if !state.devices.contains(want) {
                plan.add.push(want.clone().with_inherited(false));
            }
        }

        plan
    }

    /// Replaces declared devices by `new_devices`.
    ///
    /// Devices missing from `new_devices` stop being declared and are
    /// inherited from the parent again. Root groups remove them, and so do
    /// owners whose parent does not provide them, descendants lose their
    /// inherited copies as well. Inherited
    /// devices listed with `inherited` set are promoted, differing modes are
    /// changed and pushed to descendants, unknown devices are added. Whether
    /// parents provide the devices or descendants still need them is not
    /// checked.
    ///
    /// The steps run in a fixed order: additions, promotions, mode changes,
    /// reversions and a final recursive [`apply`](Self::apply). A failure
    /// leaves the steps done so far in place.
    pub fn replace(&self, new_devices: &[Device]) -> Result<ReconcilePlan> {
        self.sync(|token| self.replace_locked(token, new_devices))
    }

    pub fn replace_locked(&self, token: &PoolToken, new_devices: &[Device]) -> Result<ReconcilePlan> {
        let owner = self.owner_in(token)?;
        let plan = self.plan_unlocked(new_devices);

        tracing::info!(
            owner = owner.id(),
            add = plan.add.len(),
            promote = plan.promote.len(),
            chmod = plan.chmod.len(),
            revert = plan.revert.len(),
            "replace devices"
        );

        for device in &plan.add {
            self.add_locked(token, device.clone(), None)?;
        }

        for device in &plan.promote {
            self.promote_locked(token, device)?;
        }

        for (device, mode) in &plan.chmod {
            self.chmod_locked(
                token,
                device,
                *mode,
                ChmodOpts {
                    promote: true,
                    descendants: true,
                    containers: true,
                    ..Default::default()
                },
            )?;
        }

        for device in &plan.revert {
            if owner.kind().has_parent() {
                self.inherit_promoted_locked(token, device)?;
            } else {
                self.withdraw_locked(token, owner.as_ref(), device)?;
            }
        }

        self.apply_locked(token, ApplyOpts::recursive())?;
        Ok(plan)
    }

    /// Finds a device by its kind and numbers
    pub fn find(&self, kind: DeviceKind, major: &str, minor: &str) -> Result<Option<Device>> {
        self.read(|devices| {
            devices
                .iter()
                .find(|d| d.same(kind, major, minor))
                .cloned()
        })
    }

    /// Returns the manager's own instance of `device`, which may differ from
    /// `device` in mode, name and flags
    pub fn get(&self, device: &Device) -> Result<Option<Device>> {
        self.read(|devices| devices.iter().find(|d| *d == device).cloned())
    }

    pub fn includes(&self, device: &Device) -> Result<bool> {
        self.read(|devices| devices.contains(device))
    }

    /// Returns true if the device is held and declared, not just inherited
    pub fn used(&self, device: &Device) -> Result<bool> {
        self.read(|devices| {
            devices
                .iter()
                .find(|d| *d == device)
                .map_or(false, |d| !d.inherited())
        })
    }

    /// Snapshot of all held devices in order
    pub fn devices(&self) -> Result<Vec<Device>> {
        self.read(|devices| devices.to_vec())
    }

    pub fn detect<P>(&self, predicate: P) -> Result<Option<Device>>
    where
        P: Fn(&Device) -> bool,
    {
        self.read(|devices| devices.iter().find(|d| predicate(*d)).cloned())
    }

    pub fn select<P>(&self, predicate: P) -> Result<Vec<Device>>
    where
        P: Fn(&Device) -> bool,
    {
        self.read(|devices| devices.iter().filter(|d| predicate(*d)).cloned().collect())
    }

    pub fn len(&self) -> Result<usize> {
        self.read(|devices| devices.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.read(|devices| devices.is_empty())
    }

    /// All devices with their flags, for clients
    pub fn export(&self) -> Result<Vec<DeviceDescriptor>> {
        self.read(|devices| devices.iter().map(Device::export).collect())
    }

    /// Declared devices as stored in the owner's configuration
    pub fn dump(&self) -> Result<Vec<DeviceConfig>> {
        self.sync(|token| {
            self.owner_in(token)?;
            Ok(self.dump_unlocked())
        })
    }

    fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&[Device]) -> T,
    {
        self.sync(|_| Ok(f(&self.state().devices)))
    }

    /// Copies the manager for a cloned owner. Devices are cloned, the cgroup
    /// of the new owner has never been cleared.
    pub fn dup(&self, new_owner: Weak<dyn Owner>) -> Result<DeviceManager> {
        self.sync(|token| {
            self.owner_in(token)?;
            Ok(self.dup_locked(token, new_owner))
        })
    }

    /// Same as [`dup`](Self::dup), `token` must be the lock of this
    /// manager's pool
    pub fn dup_locked(&self, _token: &PoolToken, new_owner: Weak<dyn Owner>) -> DeviceManager {
        DeviceManager::with_devices(
            new_owner,
            self.controller.clone(),
            self.state().devices.clone(),
        )
    }
}
