// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! API types for the platform management controller.
//!
//! Everything that crosses the boundary between the power-management core and
//! its clients lives here: node identifiers, capability and event bits, the
//! externally visible device/power/subsystem states, the status codes returned
//! from every operation, and the callback messages sent to subsystems over
//! their notification channels.

#![cfg_attr(not(test), no_std)]

use hubpack::SerializedSize;
use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub use hubpack::error::Error as HubpackError;

/// Latency value meaning "no constraint".
pub const MAX_LATENCY: u32 = u32::MAX;

/// QoS assigned to a requirement that has not asked for anything in
/// particular. Lower values are more demanding.
pub const DEFAULT_QOS: u32 = 100;

/// Identifier of a manageable entity.
///
/// The top byte carries the [`NodeClass`]; the remaining bits are an index
/// that is unique within the class.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize,
    Deserialize,
    SerializedSize,
)]
#[repr(transparent)]
pub struct NodeId(pub u32);

const CLASS_SHIFT: u32 = 24;
const INDEX_MASK: u32 = (1 << CLASS_SHIFT) - 1;

impl NodeId {
    pub const fn new(class: NodeClass, index: u32) -> Self {
        Self(((class as u32) << CLASS_SHIFT) | (index & INDEX_MASK))
    }

    pub const fn power(index: u32) -> Self {
        Self::new(NodeClass::Power, index)
    }

    pub const fn device(index: u32) -> Self {
        Self::new(NodeClass::Device, index)
    }

    pub const fn subsystem(index: u32) -> Self {
        Self::new(NodeClass::Subsystem, index)
    }

    /// Returns the class encoded in this id, or `None` if the class bits are
    /// garbage.
    pub fn class(self) -> Option<NodeClass> {
        num_traits::FromPrimitive::from_u32(self.0 >> CLASS_SHIFT)
    }

    pub fn index(self) -> u32 {
        self.0 & INDEX_MASK
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum NodeClass {
    Power = 1,
    Device = 2,
    Subsystem = 3,
}

/// Functional access level a subsystem needs from a device.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    Serialize,
    Deserialize,
    SerializedSize,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct Capabilities(u32);

bitflags::bitflags! {
    impl Capabilities: u32 {
        const ACCESS = 1 << 0;
        const CONTEXT = 1 << 1;
        const WAKEUP = 1 << 2;
        const UNUSABLE = 1 << 3;
        const SECURE = 1 << 4;
        const COHERENT = 1 << 5;
        const VIRTUALIZED = 1 << 6;
    }
}

impl Capabilities {
    /// Everything a fully running device can offer.
    pub const MAX: Self = Self::ACCESS.union(Self::CONTEXT).union(Self::WAKEUP);

    /// Bits that take part in picking a device state. The remaining bits are
    /// attributes of the access (security, coherency, virtualization) and are
    /// carried along without selecting a state.
    pub const STATE_MASK: Self = Self::MAX.union(Self::UNUSABLE);
}

/// Events a subsystem can subscribe to on a node.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    Serialize,
    Deserialize,
    SerializedSize,
)]
#[repr(transparent)]
pub struct NotifyEvent(u32);

bitflags::bitflags! {
    impl NotifyEvent: u32 {
        const STATE_CHANGE = 1 << 0;
        const ZERO_USERS = 1 << 1;
        const CPU_IDLE_FORCE_POWER_DOWN = 1 << 2;
    }
}

/// Who currently holds a device, relative to the asking subsystem.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct Usage(u32);

bitflags::bitflags! {
    impl Usage: u32 {
        const CURRENT_SUBSYSTEM = 1 << 0;
        const OTHER_SUBSYSTEM = 1 << 1;
    }
}

/// States a device can be observed in.
///
/// Only a subset of these are ever settled states for a given kind of device;
/// the others are stages a device passes through while a transition is in
/// flight.
#[derive(
    Copy,
    Clone,
    Debug,
    FromPrimitive,
    Eq,
    PartialEq,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(u8)]
pub enum DeviceState {
    Unused = 0,
    PowerOn = 1,
    ClockOn = 2,
    ResetOff = 3,
    ResetOn = 4,
    ClockOff = 5,
    PowerOff = 6,
    Suspending = 7,
    Running = 8,
    RuntimeSuspend = 9,
    Initializing = 10,
    PendingPowerDown = 11,
}

#[derive(
    Copy,
    Clone,
    Debug,
    FromPrimitive,
    Eq,
    PartialEq,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(u8)]
pub enum PowerState {
    Off = 0,
    On = 1,
}

#[derive(Copy, Clone, Debug, FromPrimitive, Eq, PartialEq)]
#[repr(u8)]
pub enum SubsystemState {
    Offline = 0,
    Online = 1,
    Suspending = 2,
    Suspended = 3,
    PendingPowerOff = 4,
    PendingRestart = 5,
}

/// How many subsystems may hold a device at once.
#[derive(Copy, Clone, Debug, FromPrimitive, Eq, PartialEq)]
#[repr(u8)]
pub enum UsagePolicy {
    NonShared = 0,
    Shared = 1,
    TimeShared = 2,
}

impl UsagePolicy {
    pub fn is_exclusive(self) -> bool {
        !matches!(self, UsagePolicy::Shared)
    }
}

#[derive(Copy, Clone, Debug, FromPrimitive, Eq, PartialEq)]
#[repr(u8)]
pub enum SecurityPolicy {
    /// Only secure masters may use the device.
    Secure = 0,
    SecureNonSecure = 1,
}

#[derive(
    Copy,
    Clone,
    Debug,
    FromPrimitive,
    Eq,
    PartialEq,
    Serialize,
    Deserialize,
    SerializedSize,
)]
#[repr(u32)]
pub enum SuspendReason {
    PowerUnitRequest = 201,
    Alert = 202,
    SystemShutdown = 203,
}

/// Status codes returned by the power-management core.
#[derive(
    Copy,
    Clone,
    Debug,
    FromPrimitive,
    Eq,
    PartialEq,
    enum_map::Enum,
)]
#[repr(u32)]
pub enum PmError {
    /// Node id does not name an existing node of a usable class.
    InvalidNode = 1,
    InvalidSubsystem,
    InvalidParam,
    /// No requirement edge exists between the subsystem and the device.
    NoRequirement,
    /// The device is in the middle of a transition or in a state that does
    /// not accept new requirements.
    Busy,
    NoAccess,
    /// A non-shared device is already held by another subsystem.
    NodeInUse,
    /// No device state covers the requested capabilities.
    Conflict,
    /// No device state covers the requested capabilities within the
    /// requested wakeup latency.
    LatencyConflict,
    PreconditionFailed,
    NoFreeSlot,
    ClockFailed,
    ResetFailed,
    PowerFailed,
    ProtectionFailed,
    ChannelFailed,
}

impl From<PmError> for u32 {
    fn from(e: PmError) -> Self {
        e as u32
    }
}

/// Reply to a device status query.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct DeviceStatus {
    pub state: u32,
    pub requirement: Capabilities,
    pub usage: Usage,
}

const_assert!(core::mem::size_of::<DeviceStatus>() == 12);

impl DeviceStatus {
    pub fn device_state(&self) -> Option<DeviceState> {
        num_traits::FromPrimitive::from_u32(self.state)
    }
}

/// Messages delivered to a subsystem over its notification channel.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Serialize,
    Deserialize,
    SerializedSize,
)]
pub enum Callback {
    /// A subscribed event occurred on `node`, which is now in `state`.
    Notify {
        node: NodeId,
        event: NotifyEvent,
        state: u32,
    },
    /// Another subsystem asks the receiver to suspend itself.
    InitSuspend {
        initiator: NodeId,
        reason: SuspendReason,
        latency: u32,
        state: u32,
    },
    /// A forced power-down the receiver asked for has finished.
    ForcePowerDownAck {
        node: NodeId,
        status: u32,
        state: u32,
    },
}

/// Encodes `msg` into `out`, returning the number of bytes written.
pub fn serialize_callback(
    out: &mut [u8; Callback::MAX_SIZE],
    msg: &Callback,
) -> Result<usize, HubpackError> {
    hubpack::serialize(out, msg)
}

pub fn deserialize_callback(data: &[u8]) -> Result<Callback, HubpackError> {
    let (msg, _rest) = hubpack::deserialize(data)?;
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;
    use zerocopy::IntoBytes;

    #[test]
    fn node_id_class_roundtrip() {
        let d = NodeId::device(0x42);
        assert_eq!(d.class(), Some(NodeClass::Device));
        assert_eq!(d.index(), 0x42);
        assert_eq!(NodeId::subsystem(3).class(), Some(NodeClass::Subsystem));
        assert_eq!(NodeId(0x7f00_0001).class(), None);
    }

    #[test]
    fn error_codes_start_at_one() {
        assert_eq!(u32::from(PmError::InvalidNode), 1);
        assert_eq!(PmError::from_u32(7), Some(PmError::NodeInUse));
        assert_eq!(PmError::from_u32(0), None);
    }

    #[test]
    fn state_mask_excludes_attributes() {
        let caps = Capabilities::ACCESS | Capabilities::SECURE;
        assert_eq!(caps & Capabilities::STATE_MASK, Capabilities::ACCESS);
        assert!(!Capabilities::STATE_MASK.contains(Capabilities::COHERENT));
    }

    #[test]
    fn device_status_layout() {
        let status = DeviceStatus {
            state: DeviceState::Running as u32,
            requirement: Capabilities::ACCESS | Capabilities::CONTEXT,
            usage: Usage::CURRENT_SUBSYSTEM,
        };
        assert_eq!(
            status.as_bytes(),
            &[8, 0, 0, 0, 3, 0, 0, 0, 1, 0, 0, 0][..]
        );
        assert_eq!(status.device_state(), Some(DeviceState::Running));
    }

    #[test]
    fn notify_callback_encoding() {
        let msg = Callback::Notify {
            node: NodeId::device(5),
            event: NotifyEvent::ZERO_USERS,
            state: DeviceState::Unused as u32,
        };
        let mut buf = [0; Callback::MAX_SIZE];
        let n = serialize_callback(&mut buf, &msg).unwrap();

        #[rustfmt::skip]
        let expected: &[u8] = &[
            // variant
            0,
            // node
            0x05, 0x00, 0x00, 0x02,
            // event
            0x02, 0x00, 0x00, 0x00,
            // state
            0x00, 0x00, 0x00, 0x00,
        ];
        assert_eq!(&buf[..n], expected);
        assert_eq!(deserialize_callback(&buf[..n]).unwrap(), msg);
    }

    #[test]
    fn suspend_reason_is_encoded_by_variant_index() {
        let msg = Callback::InitSuspend {
            initiator: NodeId::subsystem(1),
            reason: SuspendReason::SystemShutdown,
            latency: 0,
            state: 0,
        };
        let mut buf = [0; Callback::MAX_SIZE];
        let n = serialize_callback(&mut buf, &msg).unwrap();
        assert_eq!(buf[0], 1);
        assert_eq!(buf[5], 2);
        assert_eq!(deserialize_callback(&buf[..n]).unwrap(), msg);
    }
}
