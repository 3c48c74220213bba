// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A recording [`Platform`] and a small chip to run it against.
//!
//! Power tree:
//!
//! ```text
//! PD ─┬─ PI ── PX
//!     └─ PC
//! ```
//!
//! PD is kept on by the always-on memory, so it counts `PD_BASE_USERS`
//! users from boot.

use drv_pmc_api::{
    deserialize_callback, Callback, NodeId, NotifyEvent, PmError,
    SecurityPolicy, UsagePolicy,
};

use crate::{
    ChannelId, ClockId, Config, DeviceDesc, DeviceKind, Platform, PowerDesc,
    ProtectionRequest, Registry, RequirementDesc, ResetId, SubsystemDesc,
};

pub const PD: NodeId = NodeId::power(1);
pub const PI: NodeId = NodeId::power(2);
pub const PX: NodeId = NodeId::power(3);
pub const PC: NodeId = NodeId::power(4);

pub const UART: NodeId = NodeId::device(1);
pub const DX: NodeId = NodeId::device(2);
pub const DY: NodeId = NodeId::device(3);
pub const DZ: NodeId = NodeId::device(4);
pub const CORE: NodeId = NodeId::device(5);
pub const MEM: NodeId = NodeId::device(6);
pub const ACCEL: NodeId = NodeId::device(7);
pub const REGION: NodeId = NodeId::device(8);
pub const SUBREGION: NodeId = NodeId::device(9);
/// A core that can't be asked to idle.
pub const RPU: NodeId = NodeId::device(10);

pub const S1: NodeId = NodeId::subsystem(1);
pub const S2: NodeId = NodeId::subsystem(2);
pub const S3: NodeId = NodeId::subsystem(3);

pub const CH1: ChannelId = ChannelId(1);
pub const CH2: ChannelId = ChannelId(2);
pub const CH3: ChannelId = ChannelId(3);

pub const UART_CLK: ClockId = ClockId(1);
pub const UART_RST: ResetId = ResetId(1);
pub const CORE_CLK: ClockId = ClockId(5);
pub const CORE_RST: ResetId = ResetId(5);

pub const ACCEL_FLOOR: u32 = 4;
pub const PD_BASE_USERS: u32 = 1;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Call {
    ClockOn(ClockId),
    ClockOff(ClockId),
    ResetAssert(ResetId),
    ResetRelease(ResetId),
    PowerUp(NodeId),
    PowerDown(NodeId),
    Protection {
        device: NodeId,
        subsystem: NodeId,
        enable: bool,
    },
    Divider {
        device: NodeId,
        divider: u32,
    },
    CoreDown(NodeId),
}

pub struct FakePlatform {
    pub calls: Vec<Call>,
    /// Everything sent over a channel, decoded.
    pub sent: Vec<(ChannelId, Callback)>,
    pub ready: [bool; 4],
    pub settled: bool,
    /// Powering this node up fails.
    pub fail_power_up: Option<NodeId>,
    pub fail_clocks: bool,
    pub fail_protection: bool,
}

impl Default for FakePlatform {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            sent: Vec::new(),
            ready: [true; 4],
            settled: true,
            fail_power_up: None,
            fail_clocks: false,
            fail_protection: false,
        }
    }
}

impl FakePlatform {
    pub fn power_calls(&self) -> Vec<Call> {
        self.calls
            .iter()
            .copied()
            .filter(|c| matches!(c, Call::PowerUp(_) | Call::PowerDown(_)))
            .collect()
    }

    /// Event notifications sent to anyone, in order.
    pub fn notifications(&self) -> Vec<(NodeId, NotifyEvent, u32)> {
        self.sent
            .iter()
            .filter_map(|(_, c)| match *c {
                Callback::Notify { node, event, state } => {
                    Some((node, event, state))
                }
                _ => None,
            })
            .collect()
    }

    pub fn sent_to(&self, channel: ChannelId) -> Vec<Callback> {
        self.sent
            .iter()
            .filter(|(ch, _)| *ch == channel)
            .map(|(_, c)| *c)
            .collect()
    }

    pub fn set_ready(&mut self, channel: ChannelId, ready: bool) {
        self.ready[channel.0 as usize] = ready;
    }

    pub fn last_divider(&self, device: NodeId) -> Option<u32> {
        self.calls.iter().rev().find_map(|c| match *c {
            Call::Divider { device: d, divider } if d == device => {
                Some(divider)
            }
            _ => None,
        })
    }
}

impl Platform for FakePlatform {
    fn clock_request(&mut self, clocks: &[ClockId]) -> Result<(), PmError> {
        if self.fail_clocks {
            return Err(PmError::ClockFailed);
        }
        self.calls.extend(clocks.iter().map(|&c| Call::ClockOn(c)));
        Ok(())
    }

    fn clock_release(&mut self, clocks: &[ClockId]) -> Result<(), PmError> {
        self.calls.extend(clocks.iter().map(|&c| Call::ClockOff(c)));
        Ok(())
    }

    fn reset_assert(&mut self, resets: &[ResetId]) -> Result<(), PmError> {
        self.calls.extend(resets.iter().map(|&r| Call::ResetAssert(r)));
        Ok(())
    }

    fn reset_release(&mut self, resets: &[ResetId]) -> Result<(), PmError> {
        self.calls.extend(resets.iter().map(|&r| Call::ResetRelease(r)));
        Ok(())
    }

    fn power_up(&mut self, node: NodeId) -> Result<(), PmError> {
        if self.fail_power_up == Some(node) {
            return Err(PmError::PowerFailed);
        }
        self.calls.push(Call::PowerUp(node));
        Ok(())
    }

    fn power_down(&mut self, node: NodeId) -> Result<(), PmError> {
        self.calls.push(Call::PowerDown(node));
        Ok(())
    }

    fn protection_configure(
        &mut self,
        req: &ProtectionRequest,
        enable: bool,
    ) -> Result<(), PmError> {
        if enable && self.fail_protection {
            return Err(PmError::ProtectionFailed);
        }
        self.calls.push(Call::Protection {
            device: req.device,
            subsystem: req.subsystem,
            enable,
        });
        Ok(())
    }

    fn set_clock_divider(
        &mut self,
        device: NodeId,
        divider: u32,
    ) -> Result<(), PmError> {
        self.calls.push(Call::Divider { device, divider });
        Ok(())
    }

    fn core_power_down(&mut self, core: NodeId) -> Result<(), PmError> {
        self.calls.push(Call::CoreDown(core));
        Ok(())
    }

    fn hardware_settled(
        &mut self,
        _device: NodeId,
        _stage: drv_pmc_api::DeviceState,
    ) -> bool {
        self.settled
    }

    fn channel_ready(&mut self, channel: ChannelId) -> bool {
        self.ready.get(channel.0 as usize).copied().unwrap_or(false)
    }

    fn channel_send(
        &mut self,
        channel: ChannelId,
        msg: &[u8],
    ) -> Result<(), PmError> {
        let msg =
            deserialize_callback(msg).map_err(|_| PmError::ChannelFailed)?;
        self.sent.push((channel, msg));
        Ok(())
    }
}

fn power(id: NodeId, parent: Option<NodeId>, up: u32, down: u32) -> PowerDesc {
    PowerDesc {
        id,
        parent,
        up_latency: up,
        down_latency: down,
        base_address: 0,
    }
}

fn device(id: NodeId, kind: DeviceKind, power: NodeId) -> DeviceDesc<'static> {
    DeviceDesc {
        id,
        kind,
        power: Some(power),
        clocks: &[],
        resets: &[],
        base_address: 0x1000 * id.index(),
        parent_region: None,
    }
}

fn edge(usage: UsagePolicy, security: SecurityPolicy) -> RequirementDesc {
    RequirementDesc {
        usage,
        security,
        aperture: 0,
    }
}

/// Builds the chip described at the top of this module, with the call log
/// cleared.
pub fn registry() -> Registry<FakePlatform> {
    use SecurityPolicy::{Secure, SecureNonSecure as Any};
    use UsagePolicy::{NonShared, Shared};

    let mut r = Registry::new(FakePlatform::default(), Config::default());

    r.add_power_node(power(PD, None, 10, 10)).unwrap();
    r.add_power_node(power(PI, Some(PD), 40, 20)).unwrap();
    r.add_power_node(power(PX, Some(PI), 10, 10)).unwrap();
    r.add_power_node(power(PC, Some(PD), 10, 10)).unwrap();

    r.add_device(DeviceDesc {
        clocks: &[UART_CLK],
        resets: &[UART_RST],
        ..device(UART, DeviceKind::Generic, PI)
    })
    .unwrap();
    for id in [DX, DY, DZ] {
        r.add_device(device(id, DeviceKind::Generic, PI)).unwrap();
    }
    r.add_device(DeviceDesc {
        clocks: &[CORE_CLK],
        resets: &[CORE_RST],
        ..device(CORE, DeviceKind::Core { idle_supported: true }, PC)
    })
    .unwrap();
    r.add_device(device(MEM, DeviceKind::Memory, PD)).unwrap();
    r.add_device(device(
        ACCEL,
        DeviceKind::Accelerator { floor: ACCEL_FLOOR },
        PI,
    ))
    .unwrap();
    r.add_device(device(REGION, DeviceKind::Region, PX)).unwrap();
    r.add_device(DeviceDesc {
        parent_region: Some(REGION),
        ..device(SUBREGION, DeviceKind::Region, PX)
    })
    .unwrap();
    r.add_device(device(RPU, DeviceKind::Core { idle_supported: false }, PC))
        .unwrap();

    for (id, secure, idle_supported, channel) in [
        (S1, true, true, CH1),
        (S2, false, false, CH2),
        (S3, false, true, CH3),
    ] {
        r.add_subsystem(SubsystemDesc {
            id,
            secure,
            idle_supported,
            channel,
        })
        .unwrap();
    }

    let edges = [
        (S1, UART, edge(Shared, Any)),
        (
            S2,
            UART,
            RequirementDesc {
                aperture: 0x3,
                ..edge(Shared, Any)
            },
        ),
        (S1, DX, edge(NonShared, Any)),
        (S2, DX, edge(NonShared, Any)),
        (S3, DX, edge(NonShared, Secure)),
        (S1, DY, edge(Shared, Secure)),
        (S2, DY, edge(Shared, Any)),
        (S3, DY, edge(Shared, Any)),
        (S1, DZ, edge(Shared, Any)),
        (S2, DZ, edge(Shared, Any)),
        (S3, DZ, edge(Shared, Any)),
        (S1, ACCEL, edge(Shared, Any)),
        (S2, ACCEL, edge(Shared, Any)),
        (S1, MEM, edge(Shared, Any)),
        (S1, REGION, edge(Shared, Any)),
        (S1, CORE, edge(NonShared, Any)),
        (S2, RPU, edge(NonShared, Any)),
        (S3, RPU, edge(NonShared, Any)),
    ];
    for (sub, dev, desc) in edges {
        r.add_requirement(sub, dev, desc).unwrap();
    }

    let p = r.platform_mut();
    p.calls.clear();
    p.sent.clear();
    r
}
