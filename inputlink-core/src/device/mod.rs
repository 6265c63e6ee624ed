//! Receiver-side virtual devices.
//!
//! [`DeviceRegistry`] maps controller numbers to device slots and drives
//! each slot's lifecycle through a platform [`VirtualDeviceCapability`].

pub mod capability;
pub mod registry;

pub use capability::VirtualDeviceCapability;
pub use registry::{
    DeviceRegistry, DeviceSnapshot, DeviceState, DispatchOutcome, RegistryStats,
    DEFAULT_ERROR_COOLDOWN,
};
