// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Power-management core: device state machines, power-node reference
//! counting, requirement arbitration between subsystems, and event delivery.
//!
//! All state lives in a [`Registry`], built once at boot from the chip's
//! topology and then driven by two kinds of input:
//!
//! - Requests from subsystems (`request_device`, `release_device`,
//!   `set_requirement`, `set_max_latency`, notifier registration, suspend and
//!   forced power-down), each of which runs to completion and returns a
//!   status.
//!
//! - Calls to [`Registry::tick`], which drive deferred work: retrying
//!   undelivered notifications, polling devices whose hardware has not
//!   settled yet, and timing out forced power-downs.
//!
//! Nothing here blocks, allocates, or touches hardware directly; the
//! [`Platform`] supplied at construction does the latter.

#![cfg_attr(not(test), no_std)]

use drv_pmc_api::{
    Capabilities, DeviceState, NodeClass, NodeId, PmError, PowerState,
    SubsystemState,
};
use enum_map::{Enum, EnumMap};

mod arena;
mod config;
mod device;
mod fsm;
mod node;
mod notifier;
mod platform;
mod power;
mod requirement;
mod sched;
mod subsystem;
mod topology;
mod trace;

#[cfg(test)]
mod fake;

pub use arena::{Arena, Handle};
pub use config::Config;
pub use device::{Event, Step};
pub use fsm::{Fsm, StateCap, StateTransition};
pub use node::{
    DeviceDesc, DeviceKind, DeviceNode, PowerDesc, PowerNode, Requirement,
    RequirementDesc, Subsystem, SubsystemDesc,
};
pub use platform::{ChannelId, ClockId, Platform, ProtectionRequest, ResetId};
pub use sched::{Scheduler, Slot};
pub use trace::{Trace, TraceBuf, TraceEntry};

use notifier::Notifier;

pub const MAX_POWER_NODES: usize = 16;
pub const MAX_DEVICES: usize = 32;
pub const MAX_SUBSYSTEMS: usize = 8;
pub const MAX_REQUIREMENTS: usize = 96;
pub const MAX_SUBSCRIPTIONS: usize = 16;
pub const MAX_DEVICE_CLOCKS: usize = 4;
pub const MAX_DEVICE_RESETS: usize = 4;
pub const MAX_DEVICE_EDGES: usize = MAX_SUBSYSTEMS;
pub const MAX_SUBSYSTEM_EDGES: usize = MAX_DEVICES;
/// Deepest power tree we accept, counting the node itself.
pub const MAX_POWER_DEPTH: usize = 8;
pub const TRACE_DEPTH: usize = 64;

/// Deferred work, one timer each.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Enum)]
pub enum Task {
    NotifierRetry,
    CompletionPoll,
    ForcePowerDown,
}

pub struct Registry<P: Platform> {
    pub(crate) platform: P,
    pub(crate) config: Config,
    pub(crate) now: u64,
    pub(crate) power: Arena<PowerNode, MAX_POWER_NODES>,
    pub(crate) devices: Arena<DeviceNode, MAX_DEVICES>,
    pub(crate) subsystems: Arena<Subsystem, MAX_SUBSYSTEMS>,
    pub(crate) requirements: Arena<Requirement, MAX_REQUIREMENTS>,
    pub(crate) notifier: Notifier,
    pub(crate) timers: Scheduler<Task>,
    pub(crate) trace: TraceBuf<Trace, TRACE_DEPTH>,
    pub(crate) errors: EnumMap<PmError, u32>,
}

impl<P: Platform> Registry<P> {
    pub fn new(platform: P, config: Config) -> Self {
        Self {
            platform,
            config,
            now: 0,
            power: Arena::new(),
            devices: Arena::new(),
            subsystems: Arena::new(),
            requirements: Arena::new(),
            notifier: Notifier::new(),
            timers: Scheduler::new(),
            trace: TraceBuf::new(Trace::None),
            errors: EnumMap::default(),
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn trace(&self) -> &TraceBuf<Trace, TRACE_DEPTH> {
        &self.trace
    }

    /// Number of times each status code has been returned to a caller.
    pub fn errors(&self) -> &EnumMap<PmError, u32> {
        &self.errors
    }

    /// Time at which `tick` next has something to do, if anything.
    pub fn next_deadline(&self) -> Option<u64> {
        self.timers.next_deadline()
    }

    /// Advances time to `now` and runs whatever deferred work has come due.
    pub fn tick(&mut self, now: u64) {
        self.now = now;
        self.timers.advance(now);

        let due: heapless::Vec<Task, { Task::LENGTH }> =
            self.timers.take_due().collect();
        for task in due {
            match task {
                Task::NotifierRetry => self.retry_deliveries(),
                Task::CompletionPoll => self.poll_parked(),
                Task::ForcePowerDown => self.expire_force_requests(),
            }
        }
    }

    pub fn device_state(&self, device: NodeId) -> Result<DeviceState, PmError> {
        let dev = self.device_handle(device)?;
        Ok(self.devices[dev].node.state)
    }

    /// Returns whether `device` has a transition waiting on hardware.
    pub fn device_busy(&self, device: NodeId) -> Result<bool, PmError> {
        let dev = self.device_handle(device)?;
        Ok(self.devices[dev].is_busy())
    }

    pub fn latency_margin(&self, device: NodeId) -> Result<u32, PmError> {
        let dev = self.device_handle(device)?;
        Ok(self.devices[dev].node.latency_margin)
    }

    pub fn power_state(&self, node: NodeId) -> Result<PowerState, PmError> {
        let h = self.power_handle(node)?;
        Ok(self.power[h].node.state)
    }

    pub fn power_use_count(&self, node: NodeId) -> Result<u32, PmError> {
        let h = self.power_handle(node)?;
        Ok(self.power[h].use_count)
    }

    pub fn subsystem_state(
        &self,
        subsystem: NodeId,
    ) -> Result<SubsystemState, PmError> {
        let sub = self.subsystem_handle(subsystem)?;
        Ok(self.subsystems[sub].state)
    }

    /// Union of the current capabilities of every allocated requirement on
    /// `device`.
    pub fn aggregate_capabilities(
        &self,
        device: NodeId,
    ) -> Result<Capabilities, PmError> {
        let dev = self.device_handle(device)?;
        Ok(self.aggregate_caps(dev))
    }

    pub(crate) fn device_handle(
        &self,
        id: NodeId,
    ) -> Result<Handle<DeviceNode>, PmError> {
        if id.class() != Some(NodeClass::Device) {
            return Err(PmError::InvalidNode);
        }
        self.devices
            .find(|d| d.node.id == id)
            .ok_or(PmError::InvalidNode)
    }

    pub(crate) fn power_handle(
        &self,
        id: NodeId,
    ) -> Result<Handle<PowerNode>, PmError> {
        if id.class() != Some(NodeClass::Power) {
            return Err(PmError::InvalidNode);
        }
        self.power
            .find(|p| p.node.id == id)
            .ok_or(PmError::InvalidNode)
    }

    pub(crate) fn subsystem_handle(
        &self,
        id: NodeId,
    ) -> Result<Handle<Subsystem>, PmError> {
        if id.class() != Some(NodeClass::Subsystem) {
            return Err(PmError::InvalidSubsystem);
        }
        self.subsystems
            .find(|s| s.id == id)
            .ok_or(PmError::InvalidSubsystem)
    }

    /// The edge between `sub` and `dev`, if the topology has one.
    pub(crate) fn find_requirement(
        &self,
        sub: Handle<Subsystem>,
        dev: Handle<DeviceNode>,
    ) -> Option<Handle<Requirement>> {
        self.devices[dev]
            .requirements
            .iter()
            .copied()
            .find(|&r| self.requirements[r].subsystem == sub)
    }

    /// Counts and traces a status on its way out to a caller.
    pub(crate) fn record<T>(
        &mut self,
        r: Result<T, PmError>,
    ) -> Result<T, PmError> {
        if let Err(e) = r {
            self.errors[e] = self.errors[e].wrapping_add(1);
            trace!(self.trace, Trace::Error(e));
        }
        r
    }
}
