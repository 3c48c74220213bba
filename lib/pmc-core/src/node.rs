// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Records kept in the registry's arenas.

use drv_pmc_api::{
    Callback, Capabilities, DeviceState, NodeId, PowerState, SecurityPolicy,
    SubsystemState, UsagePolicy, MAX_LATENCY,
};

use crate::arena::Handle;
use crate::fsm::{self, Fsm};
use crate::platform::{ChannelId, ClockId, ResetId};
use crate::{
    MAX_DEVICE_CLOCKS, MAX_DEVICE_EDGES, MAX_DEVICE_RESETS,
    MAX_SUBSYSTEM_EDGES,
};

/// Identity and state shared by power nodes and devices.
#[derive(Copy, Clone, Debug)]
pub struct Node<S> {
    pub id: NodeId,
    pub state: S,
    pub base_address: u32,
    /// Slack between the tightest wakeup latency anyone asked for and what
    /// the current state actually costs.
    pub latency_margin: u32,
}

impl<S> Node<S> {
    pub fn new(id: NodeId, state: S, base_address: u32) -> Self {
        Self {
            id,
            state,
            base_address,
            latency_margin: MAX_LATENCY,
        }
    }
}

pub struct PowerNode {
    pub node: Node<PowerState>,
    pub parent: Option<Handle<PowerNode>>,
    /// Children currently holding this node on: devices that are powered and
    /// child power nodes that are on.
    pub use_count: u32,
    /// Parent use count we expect to observe once our own request to power
    /// the parent has gone through.
    pub pending_parent_use_count: u32,
    pub up_latency: u32,
    pub down_latency: u32,
    /// Kept on without any user so that an idle device below can meet its
    /// wakeup latency.
    pub latency_hold: bool,
}

impl PowerNode {
    pub fn is_on(&self) -> bool {
        self.node.state == PowerState::On
    }

    /// Time it costs to cycle this node off and back on.
    pub fn cycle_latency(&self) -> u32 {
        self.down_latency.saturating_add(self.up_latency)
    }
}

/// The kinds of device the engine knows how to sequence.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DeviceKind {
    Generic,
    /// A processor core. If `idle_supported`, a forced power-down first asks
    /// the software running on it to idle.
    Core { idle_supported: bool },
    /// A programmable-logic region, possibly nested in another one.
    Region,
    /// A device whose clock divider is shared by everyone holding it, set
    /// from the most demanding QoS but never below `floor`.
    Accelerator { floor: u32 },
    /// An always-on block.
    Memory,
}

impl DeviceKind {
    pub fn fsm(self) -> &'static Fsm {
        match self {
            DeviceKind::Generic | DeviceKind::Accelerator { .. } => &fsm::GENERIC,
            DeviceKind::Core { .. } => &fsm::CORE,
            DeviceKind::Region => &fsm::REGION,
            DeviceKind::Memory => &fsm::SINGLE_STATE,
        }
    }
}

/// Which parts of a device are currently switched on.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct HwState {
    /// Holds a reference on the power parent.
    pub powered: bool,
    pub clocked: bool,
    pub out_of_reset: bool,
}

/// Snapshot of a requirement edge taken before a change, so the change can
/// be undone if the transition it asked for fails later.
#[derive(Copy, Clone, Debug)]
pub struct PendingRequirement {
    pub edge: Handle<Requirement>,
    pub curr: ReqInfo,
    pub next: ReqInfo,
    pub latency_requested: bool,
    pub newly_allocated: bool,
}

/// A device on its way from one settled state to another.
#[derive(Copy, Clone, Debug)]
pub struct Transition {
    pub from: DeviceState,
    pub target: DeviceState,
    /// Hardware stage reached so far.
    pub stage: DeviceState,
    /// Waiting for the completion poll.
    pub parked: bool,
    pub pending: Option<PendingRequirement>,
}

/// Outstanding forced power-down of a core or subsystem.
#[derive(Copy, Clone, Debug)]
pub struct ForceRequest {
    pub initiator: Handle<Subsystem>,
    pub deadline: u64,
    pub restart: bool,
}

pub struct DeviceNode {
    pub node: Node<DeviceState>,
    pub kind: DeviceKind,
    pub fsm: &'static Fsm,
    pub power: Option<Handle<PowerNode>>,
    pub clocks: heapless::Vec<ClockId, MAX_DEVICE_CLOCKS>,
    pub resets: heapless::Vec<ResetId, MAX_DEVICE_RESETS>,
    pub requirements: heapless::Vec<Handle<Requirement>, MAX_DEVICE_EDGES>,
    pub transition: Option<Transition>,
    pub hw: HwState,
    /// Power parent use count expected after our last power request.
    pub expected_power_use_count: u32,
    /// The in-flight transition is a release; free the edge when it lands.
    pub pending_dealloc: bool,
    /// Requirements changed while a transition was in flight; re-arbitrate
    /// once it lands.
    pub recheck: bool,
    /// Clock divider last programmed, for accelerators.
    pub divider: Option<u32>,
    pub parent_region: Option<Handle<DeviceNode>>,
    pub force: Option<ForceRequest>,
}

impl DeviceNode {
    pub fn is_busy(&self) -> bool {
        self.transition.is_some()
    }

    /// Settled states that accept new requirements.
    pub fn is_settleable(&self) -> bool {
        !self.is_busy()
            && matches!(
                self.node.state,
                DeviceState::Unused
                    | DeviceState::Running
                    | DeviceState::RuntimeSuspend
                    | DeviceState::Initializing
            )
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ReqInfo {
    pub caps: Capabilities,
    pub latency: u32,
    pub qos: u32,
}

impl ReqInfo {
    pub fn cleared(qos: u32) -> Self {
        Self {
            caps: Capabilities::empty(),
            latency: MAX_LATENCY,
            qos,
        }
    }
}

/// One subsystem's demand on one device.
pub struct Requirement {
    pub subsystem: Handle<Subsystem>,
    pub device: Handle<DeviceNode>,
    pub curr: ReqInfo,
    /// Scheduled values, applied when the subsystem finishes suspending.
    pub next: ReqInfo,
    pub allocated: bool,
    pub latency_requested: bool,
    pub usage: UsagePolicy,
    pub security: SecurityPolicy,
    pub aperture: u32,
    pub attr_caps: Capabilities,
}

impl Requirement {
    pub fn clear(&mut self, qos: u32) {
        self.curr = ReqInfo::cleared(qos);
        self.next = self.curr;
        self.latency_requested = false;
        self.attr_caps = Capabilities::empty();
    }

    pub fn commit(&mut self) {
        self.next = self.curr;
    }
}

pub struct Subsystem {
    pub id: NodeId,
    pub state: SubsystemState,
    /// Commands from this subsystem arrive over a secure channel.
    pub secure: bool,
    pub idle_supported: bool,
    pub channel: ChannelId,
    pub requirements: heapless::Vec<Handle<Requirement>, MAX_SUBSYSTEM_EDGES>,
    /// Suspend request from another subsystem, not yet delivered.
    pub pending_suspend: Option<Callback>,
    /// Completion report for a forced power-down this subsystem asked for,
    /// not yet delivered.
    pub pending_ack: Option<Callback>,
    pub force: Option<ForceRequest>,
}

/// Boot-time description of a power node.
#[derive(Copy, Clone, Debug)]
pub struct PowerDesc {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub up_latency: u32,
    pub down_latency: u32,
    pub base_address: u32,
}

/// Boot-time description of a device.
#[derive(Copy, Clone, Debug)]
pub struct DeviceDesc<'a> {
    pub id: NodeId,
    pub kind: DeviceKind,
    pub power: Option<NodeId>,
    pub clocks: &'a [ClockId],
    pub resets: &'a [ResetId],
    pub base_address: u32,
    pub parent_region: Option<NodeId>,
}

#[derive(Copy, Clone, Debug)]
pub struct SubsystemDesc {
    pub id: NodeId,
    pub secure: bool,
    pub idle_supported: bool,
    pub channel: ChannelId,
}

#[derive(Copy, Clone, Debug)]
pub struct RequirementDesc {
    pub usage: UsagePolicy,
    pub security: SecurityPolicy,
    pub aperture: u32,
}
