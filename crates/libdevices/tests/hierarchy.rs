use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use libdevices::common::DEVICES_SUBSYSTEM;
use libdevices::controller::UnifiedController;
use libdevices::hierarchy::{Container, Group};
use libdevices::test_controller::RecordingController;
use libdevices::{ChmodOpts, Device, DeviceError, DeviceKind, Mode, Owner};
use quickcheck::{Arbitrary, Gen, QuickCheck};

fn tun() -> Device {
    Device::new(DeviceKind::Char, "10", "200", Mode::READ | Mode::WRITE).with_inheritable(true)
}

fn loop_dev() -> Device {
    Device::new(DeviceKind::Block, "7", "0", Mode::READ)
}

fn cascade() -> ChmodOpts {
    ChmodOpts {
        descendants: true,
        containers: true,
        ..Default::default()
    }
}

fn scenario_root(pool: &str) -> (Arc<RecordingController>, Arc<Group>) {
    let controller = Arc::new(RecordingController::default());
    let root = Group::new_root(pool, "/sys/fs/cgroup", controller.clone());
    root.devices().add(tun(), None).unwrap();
    (controller, root)
}

#[test]
fn scenario_a_child_inherits_provided_device() {
    let (_, root) = scenario_root("scenario-a");
    let child = Group::new_child(&root, "child").unwrap();

    child.devices().inherit_all_from(root.as_ref()).unwrap();

    assert!(child.devices().includes(&tun()).unwrap());
    assert!(child.devices().get(&tun()).unwrap().unwrap().inherited());
    assert_eq!(child.devices().len().unwrap(), 1);
}

#[test]
fn scenario_b_mode_change_reaches_inherited_copy() {
    let (controller, root) = scenario_root("scenario-b");
    let child = Group::new_child(&root, "child").unwrap();

    root.devices().chmod(&tun(), Mode::all(), cascade()).unwrap();

    assert_eq!(
        child.devices().get(&tun()).unwrap().unwrap().mode(),
        Mode::all()
    );
    assert_eq!(
        controller.lines_for(&child.cgroup_path(DEVICES_SUBSYSTEM)),
        vec!["+c 10:200 m"]
    );
}

#[test]
fn scenario_c_promoted_device_is_persisted() {
    let (_, root) = scenario_root("scenario-c");
    let child = Group::new_child(&root, "child").unwrap();
    assert!(child.devices().dump().unwrap().is_empty());

    child.devices().promote(&tun()).unwrap();

    assert_eq!(child.devices().dump().unwrap(), vec![tun().dump()]);
    assert!(!child.devices().get(&tun()).unwrap().unwrap().inherited());
    assert_eq!(child.saved_config(), vec![tun().dump()]);
}

#[test]
fn scenario_d_withdrawn_device_reverts_to_inherited() {
    let (_, root) = scenario_root("scenario-d");
    let child = Group::new_child(&root, "child").unwrap();
    let ct = Container::new(&child, "ct").unwrap();
    child
        .devices()
        .add(loop_dev(), Some(root.as_ref() as &dyn Owner))
        .unwrap();
    child
        .devices()
        .chmod(
            &tun(),
            Mode::READ,
            ChmodOpts {
                promote: true,
                descendants: true,
                containers: true,
                ..Default::default()
            },
        )
        .unwrap();

    child.devices().replace(&[loop_dev()]).unwrap();

    let reverted = child.devices().get(&tun()).unwrap().unwrap();
    assert!(reverted.inherited());
    assert_eq!(reverted.mode(), Mode::READ | Mode::WRITE);
    assert_eq!(
        ct.devices().get(&tun()).unwrap().unwrap().mode(),
        Mode::READ | Mode::WRITE
    );
    assert_eq!(child.devices().dump().unwrap(), vec![loop_dev().dump()]);
    assert!(child.devices().get(&loop_dev()).unwrap().is_some());
}

#[test]
fn scenario_d_withdrawn_device_without_provider_is_removed() {
    let (_, root) = scenario_root("scenario-d-removed");
    let child = Group::new_child(&root, "child").unwrap();
    child.devices().promote(&tun()).unwrap();
    root.devices().unset_inherit(&tun()).unwrap();

    child.devices().replace(&[]).unwrap();

    assert!(!child.devices().includes(&tun()).unwrap());
    assert!(child.devices().dump().unwrap().is_empty());
}

#[test]
fn scenario_e_absence_in_parent_is_reported() {
    let (_, root) = scenario_root("scenario-e");
    let group = Group::new_child(&root, "group").unwrap();
    let ct = Container::new(&group, "ct").unwrap();
    group.devices().remove(&tun()).unwrap();
    let at: Arc<dyn Owner> = ct.clone();

    let err = ct
        .devices()
        .check_availability(&tun(), &at, Some(Mode::READ | Mode::WRITE))
        .unwrap_err();

    match err {
        DeviceError::NotAvailable { owner, .. } => assert_eq!(owner, "/group"),
        other => panic!("expected absence, got {other:?}"),
    }
}

#[test]
fn scenario_e_narrow_parent_is_reported() {
    let (_, root) = scenario_root("scenario-e-mode");
    let group = Group::new_child(&root, "group").unwrap();
    let ct = Container::new(&group, "ct").unwrap();
    group
        .devices()
        .chmod(&tun(), Mode::READ, ChmodOpts::default())
        .unwrap();
    let at: Arc<dyn Owner> = ct.clone();

    let err = ct
        .devices()
        .check_availability(&tun(), &at, None)
        .unwrap_err();

    match err {
        DeviceError::ModeInsufficient { owner, mode, .. } => {
            assert_eq!(owner, "/group");
            assert_eq!(mode, Mode::READ);
        }
        other => panic!("expected insufficient mode, got {other:?}"),
    }
}

#[test]
fn replace_is_idempotent() {
    let (controller, root) = scenario_root("replace-idempotent");
    let child = Group::new_child(&root, "child").unwrap();
    Container::new(&child, "ct").unwrap();
    let wanted = vec![tun().with_mode(Mode::READ), loop_dev()];

    assert!(!child.devices().replace(&wanted).unwrap().is_empty());
    controller.clear();

    assert!(child.devices().replace(&wanted).unwrap().is_empty());
    assert!(controller
        .writes()
        .iter()
        .all(|w| w.file == libdevices::common::DEVICES_ALLOW));
}

#[test]
fn unified_hierarchy_skips_enforcement() {
    let root = Group::load_root("unified", "/sys/fs/cgroup", Arc::new(UnifiedController), None)
        .unwrap();
    let ct = Container::new(&root, "ct").unwrap();

    ct.devices().remove(&tun()).unwrap();
    root.devices()
        .replace(&[tun().with_mode(Mode::all())])
        .unwrap();

    assert_eq!(root.devices().len().unwrap(), 1);
}

#[test]
fn concurrent_operations_on_one_pool() {
    let (_, root) = scenario_root("concurrent");
    let group = Group::new_child(&root, "group").unwrap();
    Container::new(&group, "ct").unwrap();

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let root = root.clone();
            let group = group.clone();
            thread::spawn(move || {
                for j in 0..20 {
                    let mode = if (i + j) % 2 == 0 {
                        Mode::all()
                    } else {
                        Mode::READ
                    };
                    root.devices().chmod(&tun(), mode, cascade()).unwrap();
                    group.devices().export().unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let mode = root.devices().get(&tun()).unwrap().unwrap().mode();
    for owner in root.descendants() {
        assert_eq!(owner.devices().get(&tun()).unwrap().unwrap().mode(), mode);
    }
}

#[test]
fn owners_created_during_cascade_follow_parent_mode() {
    for trial in 0..50 {
        let (_, root) = scenario_root(&format!("create-during-cascade-{trial}"));
        let narrowing = {
            let root = root.clone();
            thread::spawn(move || {
                root.devices()
                    .chmod(&tun(), Mode::READ, cascade())
                    .unwrap();
            })
        };

        let mut owners: Vec<Arc<dyn Owner>> = Vec::new();
        for i in 0..20 {
            let group = Group::new_child(&root, &format!("group-{i}")).unwrap();
            owners.push(Container::new(&group, "ct").unwrap());
            owners.push(group);
        }
        narrowing.join().unwrap();

        for owner in owners {
            let held = owner.devices().get(&tun()).unwrap().unwrap();
            assert!(held.inherited());
            assert_eq!(held.mode(), Mode::READ, "{} kept a broader mode", owner.id());
        }
    }
}

const IDENTITIES: [(DeviceKind, &str, &str); 4] = [
    (DeviceKind::Char, "1", "3"),
    (DeviceKind::Char, "10", "200"),
    (DeviceKind::Char, "5", "0"),
    (DeviceKind::Block, "8", "0"),
];

const OWNERS: usize = 5;

fn device(index: u8, mode: Mode) -> Device {
    let (kind, major, minor) = IDENTITIES[index as usize % IDENTITIES.len()];
    Device::new(kind, major, minor, mode)
}

fn any_mode(g: &mut Gen) -> Mode {
    Mode::from_bits_truncate(u8::arbitrary(g))
}

#[derive(Debug, Clone)]
enum Op {
    Add {
        owner: usize,
        device: u8,
        mode: Mode,
        inheritable: bool,
    },
    Inherit {
        owner: usize,
    },
    Chmod {
        owner: usize,
        device: u8,
        mode: Mode,
        promote: bool,
    },
    Replace {
        owner: usize,
        wanted: Vec<(u8, Mode, bool)>,
    },
}

impl Arbitrary for Op {
    fn arbitrary(g: &mut Gen) -> Self {
        let owner = usize::arbitrary(g) % OWNERS;
        match u8::arbitrary(g) % 4 {
            0 => Op::Add {
                owner,
                device: u8::arbitrary(g),
                mode: any_mode(g),
                inheritable: bool::arbitrary(g),
            },
            1 => Op::Inherit { owner },
            2 => Op::Chmod {
                owner,
                device: u8::arbitrary(g),
                mode: any_mode(g),
                promote: bool::arbitrary(g),
            },
            _ => Op::Replace {
                owner,
                wanted: (0..u8::arbitrary(g) % 4)
                    .map(|_| (u8::arbitrary(g), any_mode(g), bool::arbitrary(g)))
                    .collect(),
            },
        }
    }
}

/// Root group with two groups, each holding one container
struct Tree {
    owners: Vec<Arc<dyn Owner>>,
}

impl Tree {
    fn new(pool: &str) -> Tree {
        let controller = Arc::new(RecordingController::default());
        let root = Group::load_root(pool, "/sys/fs/cgroup", controller, None).unwrap();
        let first = Group::new_child(&root, "first").unwrap();
        let second = Group::new_child(&root, "second").unwrap();
        let first_ct = Container::new(&first, "first-ct").unwrap();
        let second_ct = Container::new(&second, "second-ct").unwrap();

        let owners: Vec<Arc<dyn Owner>> = vec![
            root as Arc<dyn Owner>,
            first as Arc<dyn Owner>,
            second as Arc<dyn Owner>,
            first_ct as Arc<dyn Owner>,
            second_ct as Arc<dyn Owner>,
        ];
        Tree { owners }
    }

    // Callers validate against the hierarchy before changing it, as an
    // administrative frontend would. Failed operations are skipped.
    fn run(&self, op: &Op) {
        match op {
            Op::Add {
                owner,
                device: index,
                mode,
                inheritable,
            } => {
                let owner = &self.owners[*owner];
                let parent = owner.parent();
                let dev = device(*index, *mode).with_inheritable(*inheritable);
                let _ = owner.devices().add(dev, parent.as_deref());
            }
            Op::Inherit { owner } => {
                let owner = &self.owners[*owner];
                if let Some(parent) = owner.parent() {
                    owner.devices().inherit_all_from(parent.as_ref()).unwrap();
                }
            }
            Op::Chmod {
                owner,
                device: index,
                mode,
                promote,
            } => {
                let owner = &self.owners[*owner];
                let dev = device(*index, *mode);
                if owner.devices().check_descendants(&dev, *mode).is_err() {
                    return;
                }

                let opts = ChmodOpts {
                    promote: *promote,
                    parents: true,
                    descendants: true,
                    containers: true,
                };
                let _ = owner.devices().chmod(&dev, *mode, opts);
            }
            Op::Replace { owner, wanted } => {
                let owner = &self.owners[*owner];
                let mut devices: Vec<Device> = Vec::new();
                for (index, mode, inherited) in wanted {
                    let dev = device(*index, *mode).with_inherited(*inherited);
                    if !devices.contains(&dev) {
                        devices.push(dev);
                    }
                }

                if self.replace_allowed(owner, &devices) {
                    owner.devices().replace(&devices).unwrap();
                }
            }
        }
    }

    fn replace_allowed(&self, owner: &Arc<dyn Owner>, devices: &[Device]) -> bool {
        let manager = owner.devices();
        let plan = manager.plan_replace(devices).unwrap();
        let parent = owner.parent();

        let provided = |dev: &Device, mode: Mode| match &parent {
            Some(parent) => manager
                .check_availability(dev, parent, Some(mode))
                .is_ok(),
            None => true,
        };

        plan.add.iter().all(|d| provided(d, d.mode()))
            && plan.chmod.iter().all(|(d, mode)| {
                provided(d, *mode) && manager.check_descendants(d, *mode).is_ok()
            })
            && plan.revert.iter().all(|d| match &parent {
                Some(parent) => parent
                    .devices()
                    .get(d)
                    .unwrap()
                    .map_or(false, |p| p.inheritable()),
                None => false,
            })
    }

    /// No owner holds a device with a broader mode than any of its ancestors
    fn descendants_within_ancestors(&self) -> bool {
        self.owners.iter().all(|owner| {
            let parents = owner.parents();
            owner.devices().devices().unwrap().iter().all(|dev| {
                parents.iter().all(|ancestor| {
                    ancestor
                        .devices()
                        .get(dev)
                        .unwrap()
                        .map_or(false, |held| held.mode().compatible(dev.mode()))
                })
            })
        })
    }
}

static TREES: AtomicUsize = AtomicUsize::new(0);

fn operations_keep_descendants_within_ancestors(ops: Vec<Op>) -> bool {
    let pool = format!("prop-{}", TREES.fetch_add(1, Ordering::SeqCst));
    let tree = Tree::new(&pool);

    for op in ops.iter().take(40) {
        tree.run(op);
        if !tree.descendants_within_ancestors() {
            return false;
        }
    }

    true
}

#[test]
fn random_operations_keep_descendants_within_ancestors() {
    QuickCheck::new()
        .tests(200)
        .quickcheck(operations_keep_descendants_within_ancestors as fn(Vec<Op>) -> bool);
}
