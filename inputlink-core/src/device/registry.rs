//! Controller number → virtual device registry.
//!
//! Every controller number has one slot guarded by its own mutex. The
//! sharded map is only used to find or insert a slot; all lifecycle work
//! (ownership, create, apply, destroy) happens under the slot mutex, so
//! calls for one number are serialized across sessions while unrelated
//! numbers never contend.
//!
//! ```text
//!  Unbound ──► Creating ──► Active ──► Released ──► Creating …
//!                 │            │
//!                 ▼            ▼
//!               Error ◄────────┘   (retried after cooldown)
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ReceiverConfig;
use crate::device::capability::VirtualDeviceCapability;
use crate::events::{EventBus, LinkEvent, SessionId};
use crate::sample::{ControllerSample, is_valid_controller_number};

/// Wait before a slot in `Error` retries `create`.
pub const DEFAULT_ERROR_COOLDOWN: Duration = Duration::from_secs(1);

// ── DeviceState ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    Unbound,
    Creating,
    Active,
    Error,
    Released,
}

impl DeviceState {
    /// States that hold one unit of device capacity.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Creating | Self::Active | Self::Error)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unbound => "Unbound",
            Self::Creating => "Creating",
            Self::Active => "Active",
            Self::Error => "Error",
            Self::Released => "Released",
        };
        f.write_str(s)
    }
}

/// Result of routing one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A device was created and the sample applied.
    Created,
    Applied,
    /// `sequence <= last_applied_sequence`; dropped silently.
    Duplicate,
    /// The device limit is reached; no device was created.
    Rejected,
    /// Owned by another live session.
    NotOwner,
    /// In `Error` and the cooldown has not elapsed.
    Cooldown,
    CreateFailed,
    /// `apply` failed; the device was destroyed and the slot is in `Error`.
    ApplyFailed,
    /// The registry is shut down.
    Closed,
    /// The controller number is outside `1..=MAX_CONTROLLER_NUMBER`; no
    /// slot was touched.
    Invalid,
}

// ── Slot ─────────────────────────────────────────────────────────

struct Slot<H> {
    state: DeviceState,
    handle: Option<H>,
    last_applied: u64,
    owner: Option<SessionId>,
    error_since: Option<Instant>,
    /// A rejection was already reported for the current attempt.
    rejected: bool,
}

impl<H> Default for Slot<H> {
    fn default() -> Self {
        Self {
            state: DeviceState::Unbound,
            handle: None,
            last_applied: 0,
            owner: None,
            error_since: None,
            rejected: false,
        }
    }
}

/// Point-in-time view of one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSnapshot {
    pub controller_number: u32,
    pub state: DeviceState,
    pub last_applied_sequence: u64,
    pub owner: Option<SessionId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegistryStats {
    /// Slots in `Active`.
    pub active: usize,
    /// Slots holding capacity (`Creating`, `Active`, `Error`).
    pub live: usize,
    pub applied_total: u64,
    pub duplicate_total: u64,
    pub rejected_total: u64,
    pub create_failures: u64,
    pub apply_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    applied: AtomicU64,
    duplicates: AtomicU64,
    rejected: AtomicU64,
    create_failures: AtomicU64,
    apply_failures: AtomicU64,
}

// ── DeviceRegistry ───────────────────────────────────────────────

pub struct DeviceRegistry<C: VirtualDeviceCapability> {
    capability: C,
    slots: DashMap<u32, Arc<Mutex<Slot<C::Handle>>>>,
    /// Maximum live devices, 0 = unbounded.
    max_devices: usize,
    live: AtomicUsize,
    error_cooldown: Duration,
    closed: AtomicBool,
    counters: Counters,
    events: EventBus,
}

impl<C: VirtualDeviceCapability> DeviceRegistry<C> {
    pub fn new(capability: C, max_devices: usize, events: EventBus) -> Self {
        Self {
            capability,
            slots: DashMap::new(),
            max_devices,
            live: AtomicUsize::new(0),
            error_cooldown: DEFAULT_ERROR_COOLDOWN,
            closed: AtomicBool::new(false),
            counters: Counters::default(),
            events,
        }
    }

    /// Registry sized and tuned by `config`.
    pub fn from_config(capability: C, config: &ReceiverConfig, events: EventBus) -> Self {
        Self::new(capability, config.max_virtual_devices, events)
            .with_error_cooldown(config.error_cooldown())
    }

    pub fn with_error_cooldown(mut self, cooldown: Duration) -> Self {
        self.error_cooldown = cooldown;
        self
    }

    pub fn capability(&self) -> &C {
        &self.capability
    }

    pub fn max_devices(&self) -> usize {
        self.max_devices
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn slot(&self, controller_number: u32) -> Arc<Mutex<Slot<C::Handle>>> {
        self.slots
            .entry(controller_number)
            .or_insert_with(|| Arc::new(Mutex::new(Slot::default())))
            .clone()
    }

    fn existing_slot(&self, controller_number: u32) -> Option<Arc<Mutex<Slot<C::Handle>>>> {
        self.slots.get(&controller_number).map(|s| Arc::clone(&s))
    }

    /// Take one unit of capacity, unless the limit is reached.
    fn try_reserve(&self) -> bool {
        if self.max_devices == 0 {
            self.live.fetch_add(1, Ordering::AcqRel);
            return true;
        }
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.max_devices).then_some(live + 1)
            })
            .is_ok()
    }

    // ── Dispatch ─────────────────────────────────────────────────

    /// Route one validated sample from `session`.
    ///
    /// A number nobody owns is claimed implicitly by `session`.
    pub fn dispatch(&self, session: SessionId, sample: &ControllerSample) -> DispatchOutcome {
        if self.is_closed() {
            return DispatchOutcome::Closed;
        }
        let n = sample.controller_number;
        if !is_valid_controller_number(n) {
            return DispatchOutcome::Invalid;
        }
        let slot = self.slot(n);
        let mut slot = slot.lock();
        // `shutdown` flips the flag before sweeping slots.
        if self.is_closed() {
            return DispatchOutcome::Closed;
        }

        match slot.owner {
            Some(owner) if owner != session => return DispatchOutcome::NotOwner,
            _ => {}
        }

        match slot.state {
            DeviceState::Unbound | DeviceState::Released => {
                if !self.try_reserve() {
                    self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                    if !slot.rejected {
                        slot.rejected = true;
                        warn!(
                            "controller {n}: device limit {} reached, rejected",
                            self.max_devices
                        );
                        self.events.publish(LinkEvent::DeviceRejected {
                            controller_number: n,
                        });
                    }
                    return DispatchOutcome::Rejected;
                }
                slot.rejected = false;
                slot.owner = Some(session);
                slot.last_applied = 0;
                self.create_and_apply(n, &mut slot, sample)
            }
            DeviceState::Error => {
                let cooling = slot
                    .error_since
                    .is_some_and(|since| since.elapsed() < self.error_cooldown);
                if cooling {
                    return DispatchOutcome::Cooldown;
                }
                slot.owner = Some(session);
                self.create_and_apply(n, &mut slot, sample)
            }
            DeviceState::Active => {
                slot.owner = Some(session);
                if sample.sequence <= slot.last_applied {
                    self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                    return DispatchOutcome::Duplicate;
                }
                if self.apply(n, &mut slot, sample) {
                    DispatchOutcome::Applied
                } else {
                    DispatchOutcome::ApplyFailed
                }
            }
            // Only observable while the slot lock is held by create.
            DeviceState::Creating => DispatchOutcome::Cooldown,
        }
    }

    fn create_and_apply(
        &self,
        n: u32,
        slot: &mut Slot<C::Handle>,
        sample: &ControllerSample,
    ) -> DispatchOutcome {
        slot.state = DeviceState::Creating;
        match self.capability.create(n) {
            Ok(handle) => {
                slot.handle = Some(handle);
                slot.state = DeviceState::Active;
                slot.error_since = None;
                info!("controller {n}: virtual device created ({})", self.capability.name());
                self.events.publish(LinkEvent::DeviceCreated {
                    controller_number: n,
                });
            }
            Err(e) => {
                self.counters.create_failures.fetch_add(1, Ordering::Relaxed);
                self.enter_error(n, slot, format!("create failed: {e}"));
                return DispatchOutcome::CreateFailed;
            }
        }

        if sample.sequence <= slot.last_applied {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            return DispatchOutcome::Created;
        }
        if self.apply(n, slot, sample) {
            DispatchOutcome::Created
        } else {
            DispatchOutcome::ApplyFailed
        }
    }

    /// Apply to an active slot. On failure the handle is destroyed and
    /// the slot enters `Error`.
    fn apply(&self, n: u32, slot: &mut Slot<C::Handle>, sample: &ControllerSample) -> bool {
        let Some(handle) = slot.handle.as_mut() else {
            return false;
        };
        match self.capability.apply(handle, sample) {
            Ok(()) => {
                slot.last_applied = sample.sequence;
                self.counters.applied.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.counters.apply_failures.fetch_add(1, Ordering::Relaxed);
                if let Some(handle) = slot.handle.take() {
                    self.destroy(n, handle);
                }
                self.enter_error(n, slot, format!("apply failed: {e}"));
                false
            }
        }
    }

    fn enter_error(&self, n: u32, slot: &mut Slot<C::Handle>, reason: String) {
        warn!("controller {n}: {reason}");
        slot.state = DeviceState::Error;
        slot.error_since = Some(Instant::now());
        self.events.publish(LinkEvent::DeviceErrored {
            controller_number: n,
            reason,
        });
    }

    fn destroy(&self, n: u32, handle: C::Handle) {
        if let Err(e) = self.capability.destroy(handle) {
            warn!("controller {n}: destroy reported {e}");
        }
    }

    /// Destroy the handle, if any, and free the slot's capacity.
    fn teardown(&self, n: u32, slot: &mut Slot<C::Handle>) -> bool {
        let was_live = slot.state.is_live();
        if let Some(handle) = slot.handle.take() {
            self.destroy(n, handle);
        }
        if was_live {
            self.live.fetch_sub(1, Ordering::AcqRel);
            slot.state = DeviceState::Released;
            slot.error_since = None;
            info!("controller {n}: virtual device released");
            self.events.publish(LinkEvent::DeviceReleased {
                controller_number: n,
            });
        }
        was_live
    }

    // ── Ownership ────────────────────────────────────────────────

    /// Make `session` the owner of `controller_number`.
    ///
    /// A device held by another session is destroyed first. Returns the
    /// previous owner if ownership was taken away from someone.
    pub fn claim(&self, controller_number: u32, session: SessionId) -> Option<SessionId> {
        if self.is_closed() || !is_valid_controller_number(controller_number) {
            return None;
        }
        let slot = self.slot(controller_number);
        let mut slot = slot.lock();
        let previous = match slot.owner {
            Some(owner) if owner == session => return None,
            previous => previous,
        };
        if let Some(prev) = previous {
            info!("controller {controller_number}: ownership moves from session {prev} to {session}");
            self.teardown(controller_number, &mut slot);
        }
        slot.rejected = false;
        slot.owner = Some(session);
        previous
    }

    /// Give up `controller_number` if `session` owns it.
    ///
    /// Destroys the device. Releasing a number the session does not own,
    /// or releasing twice, is a no-op.
    pub fn release(&self, controller_number: u32, session: SessionId) -> bool {
        let Some(slot) = self.existing_slot(controller_number) else {
            return false;
        };
        let mut slot = slot.lock();
        if slot.owner != Some(session) {
            return false;
        }
        slot.owner = None;
        slot.rejected = false;
        self.teardown(controller_number, &mut slot);
        true
    }

    /// Numbers currently owned by `session`.
    pub fn owned_by(&self, session: SessionId) -> BTreeSet<u32> {
        self.slot_list()
            .into_iter()
            .filter(|(_, slot)| slot.lock().owner == Some(session))
            .map(|(n, _)| n)
            .collect()
    }

    /// Close the registry and destroy every live device.
    ///
    /// Every later dispatch returns [`DispatchOutcome::Closed`]. Returns
    /// the number of devices torn down.
    pub fn shutdown(&self) -> usize {
        self.closed.store(true, Ordering::Release);
        let mut released = 0;
        for (n, slot) in self.slot_list() {
            let mut slot = slot.lock();
            slot.owner = None;
            if self.teardown(n, &mut slot) {
                released += 1;
            }
        }
        debug!("registry shut down, {released} device(s) released");
        released
    }

    // ── Observability ────────────────────────────────────────────

    /// Clone the slot list so no map shard stays locked while a slot
    /// mutex is taken.
    fn slot_list(&self) -> Vec<(u32, Arc<Mutex<Slot<C::Handle>>>)> {
        self.slots
            .iter()
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect()
    }

    /// Slots ever touched. Bounded by `MAX_CONTROLLER_NUMBER`.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn state_of(&self, controller_number: u32) -> DeviceState {
        self.existing_slot(controller_number)
            .map(|s| s.lock().state)
            .unwrap_or(DeviceState::Unbound)
    }

    /// Every slot, ordered by controller number.
    pub fn snapshot(&self) -> Vec<DeviceSnapshot> {
        let mut out: Vec<_> = self
            .slot_list()
            .into_iter()
            .map(|(n, slot)| {
                let slot = slot.lock();
                DeviceSnapshot {
                    controller_number: n,
                    state: slot.state,
                    last_applied_sequence: slot.last_applied,
                    owner: slot.owner,
                }
            })
            .collect();
        out.sort_by_key(|d| d.controller_number);
        out
    }

    pub fn stats(&self) -> RegistryStats {
        let active = self
            .slot_list()
            .iter()
            .filter(|(_, slot)| slot.lock().state == DeviceState::Active)
            .count();
        RegistryStats {
            active,
            live: self.live.load(Ordering::Acquire),
            applied_total: self.counters.applied.load(Ordering::Relaxed),
            duplicate_total: self.counters.duplicates.load(Ordering::Relaxed),
            rejected_total: self.counters.rejected.load(Ordering::Relaxed),
            create_failures: self.counters.create_failures.load(Ordering::Relaxed),
            apply_failures: self.counters.apply_failures.load(Ordering::Relaxed),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
