// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Boot-time construction of the node graph.
//!
//! Parents have to be added before their children: power nodes top-down,
//! then devices, then subsystems, then the requirement edges between the
//! last two.

use drv_pmc_api::{DeviceState, NodeClass, PmError, PowerState, SubsystemState};

use crate::arena::Handle;
use crate::node::{
    DeviceDesc, DeviceKind, DeviceNode, HwState, Node, PowerDesc, PowerNode,
    Subsystem, SubsystemDesc,
};
use crate::platform::Platform;
use crate::{Registry, MAX_POWER_DEPTH};

impl<P: Platform> Registry<P> {
    /// Adds a power node, initially off.
    pub fn add_power_node(&mut self, desc: PowerDesc) -> Result<(), PmError> {
        let r = self.add_power_inner(desc);
        self.record(r)
    }

    fn add_power_inner(&mut self, desc: PowerDesc) -> Result<(), PmError> {
        if desc.id.class() != Some(NodeClass::Power) {
            return Err(PmError::InvalidNode);
        }
        if self.power.find(|p| p.node.id == desc.id).is_some() {
            return Err(PmError::InvalidParam);
        }
        let parent = desc.parent.map(|p| self.power_handle(p)).transpose()?;
        if let Some(p) = parent {
            if self.power_depth(p) >= MAX_POWER_DEPTH {
                return Err(PmError::InvalidParam);
            }
        }

        self.power
            .alloc(PowerNode {
                node: Node::new(desc.id, PowerState::Off, desc.base_address),
                parent,
                use_count: 0,
                pending_parent_use_count: 0,
                up_latency: desc.up_latency,
                down_latency: desc.down_latency,
                latency_hold: false,
            })
            .map_err(|_| PmError::NoFreeSlot)?;
        Ok(())
    }

    /// Number of nodes from `h` to the root, both included.
    fn power_depth(&self, h: Handle<PowerNode>) -> usize {
        let mut depth = 0;
        let mut cur = Some(h);
        while let Some(p) = cur {
            depth += 1;
            cur = self.power[p].parent;
        }
        depth
    }

    /// Adds a device in the first state of its table. A device that starts
    /// anywhere but unused is taken to be running already and holds its
    /// power parent from the start.
    pub fn add_device(&mut self, desc: DeviceDesc<'_>) -> Result<(), PmError> {
        let r = self.add_device_inner(desc);
        self.record(r)
    }

    fn add_device_inner(&mut self, desc: DeviceDesc<'_>) -> Result<(), PmError> {
        if desc.id.class() != Some(NodeClass::Device) {
            return Err(PmError::InvalidNode);
        }
        if self.devices.find(|d| d.node.id == desc.id).is_some() {
            return Err(PmError::InvalidParam);
        }
        let power = desc.power.map(|p| self.power_handle(p)).transpose()?;
        let parent_region = match desc.parent_region {
            Some(id) => {
                let h = self.device_handle(id)?;
                if self.devices[h].kind != DeviceKind::Region
                    || desc.kind != DeviceKind::Region
                {
                    return Err(PmError::InvalidParam);
                }
                Some(h)
            }
            None => None,
        };
        let clocks = heapless::Vec::from_slice(desc.clocks)
            .map_err(|_| PmError::InvalidParam)?;
        let resets = heapless::Vec::from_slice(desc.resets)
            .map_err(|_| PmError::InvalidParam)?;

        let fsm = desc.kind.fsm();
        let state = fsm.initial().ok_or(PmError::InvalidParam)?;
        let running = state != DeviceState::Unused;

        let dev = self
            .devices
            .alloc(DeviceNode {
                node: Node::new(desc.id, state, desc.base_address),
                kind: desc.kind,
                fsm,
                power,
                clocks,
                resets,
                requirements: heapless::Vec::new(),
                transition: None,
                hw: HwState {
                    powered: false,
                    clocked: running,
                    out_of_reset: running,
                },
                expected_power_use_count: 0,
                pending_dealloc: false,
                recheck: false,
                divider: None,
                parent_region,
                force: None,
            })
            .map_err(|_| PmError::NoFreeSlot)?;

        if running {
            if let Err(e) = self.device_power_up(dev) {
                self.devices.remove(dev);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Adds a subsystem. It starts out online, holding nothing.
    pub fn add_subsystem(&mut self, desc: SubsystemDesc) -> Result<(), PmError> {
        let r = self.add_subsystem_inner(desc);
        self.record(r)
    }

    fn add_subsystem_inner(
        &mut self,
        desc: SubsystemDesc,
    ) -> Result<(), PmError> {
        if desc.id.class() != Some(NodeClass::Subsystem) {
            return Err(PmError::InvalidSubsystem);
        }
        if self.subsystems.find(|s| s.id == desc.id).is_some() {
            return Err(PmError::InvalidParam);
        }
        self.subsystems
            .alloc(Subsystem {
                id: desc.id,
                state: SubsystemState::Online,
                secure: desc.secure,
                idle_supported: desc.idle_supported,
                channel: desc.channel,
                requirements: heapless::Vec::new(),
                pending_suspend: None,
                pending_ack: None,
                force: None,
            })
            .map_err(|_| PmError::NoFreeSlot)?;
        Ok(())
    }
}
