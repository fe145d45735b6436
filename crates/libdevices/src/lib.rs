//! Device access control for hierarchies of groups and containers.
//! Groups provide devices to their descendants, which inherit them or declare
//! their own, and the resulting whitelist is enforced by the cgroup devices
//! controller.
#[cfg(test)]
#[macro_use]
extern crate quickcheck;


pub mod common;
pub mod config;
pub mod controller;
pub mod device;
pub mod hierarchy;
pub mod lock;
pub mod manager;
pub mod mode;
pub mod owner;
pub mod test_controller;

pub use device::{Device, DeviceKind};
pub use manager::{ApplyOpts, ChmodOpts, DeviceError, DeviceManager, ReconcilePlan};
pub use mode::Mode;
pub use owner::{Owner, OwnerKind};
