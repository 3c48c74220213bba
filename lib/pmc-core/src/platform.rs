// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hardware-facing side of the core.
//!
//! The core never touches registers. Every effect on the chip goes through
//! an implementation of [`Platform`], which the board support supplies when it
//! builds the registry.

use drv_pmc_api::{DeviceState, NodeId, PmError};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ClockId(pub u32);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ResetId(pub u32);

/// Notification channel of a subsystem (an inter-processor mailbox, in
/// practice).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ChannelId(pub u32);

/// Everything the protection unit driver needs to open or close a
/// subsystem's window onto a device.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ProtectionRequest {
    pub device: NodeId,
    pub subsystem: NodeId,
    pub base_address: u32,
    pub aperture: u32,
    pub secure: bool,
}

pub trait Platform {
    fn clock_request(&mut self, clocks: &[ClockId]) -> Result<(), PmError>;
    fn clock_release(&mut self, clocks: &[ClockId]) -> Result<(), PmError>;

    fn reset_assert(&mut self, resets: &[ResetId]) -> Result<(), PmError>;
    fn reset_release(&mut self, resets: &[ResetId]) -> Result<(), PmError>;

    fn power_up(&mut self, node: NodeId) -> Result<(), PmError>;
    fn power_down(&mut self, node: NodeId) -> Result<(), PmError>;

    /// Opens (`enable`) or closes the protection window described by `req`.
    /// Parts without a protection unit can leave this alone.
    fn protection_configure(
        &mut self,
        _req: &ProtectionRequest,
        _enable: bool,
    ) -> Result<(), PmError> {
        Ok(())
    }

    fn set_clock_divider(
        &mut self,
        _device: NodeId,
        _divider: u32,
    ) -> Result<(), PmError> {
        Ok(())
    }

    /// Runs the direct power-down sequence of a processor core. Clocks and
    /// resets of the core are dealt with by this sequence; the core's power
    /// parent is released by the caller afterwards.
    fn core_power_down(&mut self, _core: NodeId) -> Result<(), PmError> {
        Ok(())
    }

    /// Reports whether the hardware has finished the step that put `device`
    /// into `stage`. Returning `false` parks the transition until the next
    /// completion poll.
    fn hardware_settled(&mut self, _device: NodeId, _stage: DeviceState) -> bool {
        true
    }

    fn channel_ready(&mut self, channel: ChannelId) -> bool;
    fn channel_send(
        &mut self,
        channel: ChannelId,
        msg: &[u8],
    ) -> Result<(), PmError>;
}
