//! Platform virtual-device backend contract.

use crate::error::LinkError;
use crate::sample::ControllerSample;

/// Creates, drives and destroys virtual controllers on one platform.
///
/// Selected once at startup. The registry serializes every call for a
/// given controller number and never calls `apply` on a handle after
/// passing it to `destroy`.
pub trait VirtualDeviceCapability: Send + Sync + 'static {
    /// Opaque per-device state owned by the registry.
    type Handle: Send + 'static;

    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Bring up a virtual controller for `controller_number`.
    fn create(&self, controller_number: u32) -> Result<Self::Handle, LinkError>;

    /// Push one sample to the device.
    fn apply(&self, handle: &mut Self::Handle, sample: &ControllerSample)
    -> Result<(), LinkError>;

    /// Tear the device down. Resources count as released even on error.
    fn destroy(&self, handle: Self::Handle) -> Result<(), LinkError>;
}
