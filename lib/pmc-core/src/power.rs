// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Power tree reference counting.
//!
//! A power node is on while it has users (powered devices and child nodes
//! that are on) or while it is latency-held. Taking the first reference on a
//! node powers it, and before that its parent, all the way up; dropping the
//! last one powers it off and releases the parent in turn. Both walks are
//! iterative so the depth of the tree doesn't turn into stack depth.

use drv_pmc_api::{DeviceState, NotifyEvent, PmError, PowerState};

use crate::arena::Handle;
use crate::node::{DeviceNode, PowerNode};
use crate::platform::Platform;
use crate::trace::Trace;
use crate::{trace, Registry, MAX_POWER_DEPTH};

impl<P: Platform> Registry<P> {
    /// Takes a reference on `power` on behalf of one of its children,
    /// powering up every ancestor that was off, top-down. On failure all
    /// references taken here are given back.
    pub(crate) fn power_acquire(
        &mut self,
        power: Handle<PowerNode>,
    ) -> Result<(), PmError> {
        let mut chain: heapless::Vec<Handle<PowerNode>, MAX_POWER_DEPTH> =
            heapless::Vec::new();

        let mut cur = Some(power);
        while let Some(h) = cur {
            if chain.push(h).is_err() {
                // Topology construction bounds the depth, so this is
                // bookkeeping gone wrong.
                self.unwind_acquire(&chain);
                return Err(PmError::PowerFailed);
            }
            let node = &mut self.power[h];
            node.use_count += 1;
            if node.is_on() {
                break;
            }
            cur = node.parent;
            if let Some(p) = cur {
                let expected = self.power[p].use_count + 1;
                self.power[h].pending_parent_use_count = expected;
            }
        }

        for i in (0..chain.len()).rev() {
            let h = chain[i];
            let node = &self.power[h];
            if node.is_on() {
                continue;
            }
            let id = node.node.id;
            if let Some(p) = node.parent {
                let parent = &self.power[p];
                if !parent.is_on()
                    || parent.use_count < node.pending_parent_use_count
                {
                    trace!(
                        self.trace,
                        Trace::PowerFailed {
                            node: id,
                            err: PmError::PowerFailed,
                        }
                    );
                    self.unwind_acquire(&chain);
                    return Err(PmError::PowerFailed);
                }
            }
            if let Err(err) = self.platform.power_up(id) {
                trace!(self.trace, Trace::PowerFailed { node: id, err });
                self.unwind_acquire(&chain);
                return Err(err);
            }
            self.set_power_state(h, PowerState::On);
        }
        Ok(())
    }

    /// Gives back the references `power_acquire` took along `chain` (ordered
    /// bottom-up), switching off whatever it had switched on.
    fn unwind_acquire(&mut self, chain: &[Handle<PowerNode>]) {
        for &h in chain {
            let node = &mut self.power[h];
            node.use_count = node.use_count.saturating_sub(1);
        }
        for &h in chain {
            let node = &self.power[h];
            if node.use_count == 0 && !node.latency_hold && node.is_on() {
                let id = node.node.id;
                if self.platform.power_down(id).is_ok() {
                    self.set_power_state(h, PowerState::Off);
                }
            }
        }
    }

    /// Drops a child's reference on `power`. A node losing its last user (and
    /// not latency-held) is switched off and releases its own parent.
    ///
    /// If switching a node off fails, the walk stops there: that node stays on
    /// and keeps its reference on its parent.
    pub(crate) fn power_release(
        &mut self,
        power: Handle<PowerNode>,
    ) -> Result<(), PmError> {
        let mut cur = Some(power);
        while let Some(h) = cur {
            let node = &mut self.power[h];
            node.use_count = node.use_count.saturating_sub(1);
            if node.use_count != 0 || node.latency_hold || !node.is_on() {
                return Ok(());
            }
            let id = node.node.id;
            let parent = node.parent;
            if let Some(p) = parent {
                let expected = self.power[p].use_count.saturating_sub(1);
                self.power[h].pending_parent_use_count = expected;
            }
            if let Err(err) = self.platform.power_down(id) {
                trace!(self.trace, Trace::PowerFailed { node: id, err });
                return Err(err);
            }
            self.set_power_state(h, PowerState::Off);
            cur = parent;
        }
        Ok(())
    }

    fn set_power_state(&mut self, h: Handle<PowerNode>, state: PowerState) {
        let id = self.power[h].node.id;
        self.power[h].node.state = state;
        match state {
            PowerState::On => trace!(self.trace, Trace::PowerUp(id)),
            PowerState::Off => trace!(self.trace, Trace::PowerDown(id)),
        }
        self.notify_event(id, NotifyEvent::STATE_CHANGE);
    }

    /// Keeps `power` on (or lets it go) independent of its users.
    pub(crate) fn set_latency_hold(
        &mut self,
        power: Handle<PowerNode>,
        hold: bool,
    ) -> Result<(), PmError> {
        let node = &self.power[power];
        if node.latency_hold == hold {
            return Ok(());
        }
        let id = node.node.id;
        let parent = node.parent;

        if hold {
            if !node.is_on() {
                if let Some(p) = parent {
                    self.power_acquire(p)?;
                }
                if let Err(err) = self.platform.power_up(id) {
                    trace!(self.trace, Trace::PowerFailed { node: id, err });
                    if let Some(p) = parent {
                        let _ = self.power_release(p);
                    }
                    return Err(err);
                }
                self.set_power_state(power, PowerState::On);
            }
            self.power[power].latency_hold = true;
        } else {
            self.power[power].latency_hold = false;
            let node = &self.power[power];
            if node.use_count == 0 && node.is_on() {
                if let Err(err) = self.platform.power_down(id) {
                    trace!(self.trace, Trace::PowerFailed { node: id, err });
                    return Err(err);
                }
                self.set_power_state(power, PowerState::Off);
                if let Some(p) = parent {
                    self.power_release(p)?;
                }
            }
        }
        trace!(self.trace, Trace::LatencyHold { node: id, hold });
        Ok(())
    }

    /// Re-derives the latency hold on the power parent of `dev`: the parent
    /// stays on while any idle device under it could not absorb a full
    /// off/on cycle within its latency margin.
    pub(crate) fn update_power_hold(
        &mut self,
        dev: Handle<DeviceNode>,
    ) -> Result<(), PmError> {
        let Some(power) = self.devices[dev].power else {
            return Ok(());
        };
        let cycle = self.power[power].cycle_latency();
        let needed = self.devices.iter().any(|(_, d)| {
            d.power == Some(power)
                && !d.is_busy()
                && d.node.state == DeviceState::Unused
                && d.node.latency_margin < cycle
        });
        self.set_latency_hold(power, needed)
    }

    /// Powers the parent of `dev` on its behalf, recording the use count we
    /// expect to see once that has happened.
    pub(crate) fn device_power_up(
        &mut self,
        dev: Handle<DeviceNode>,
    ) -> Result<(), PmError> {
        let d = &self.devices[dev];
        let Some(power) = d.power else {
            return Ok(());
        };
        if d.hw.powered {
            return Ok(());
        }
        let expected = self.power[power].use_count + 1;
        self.devices[dev].expected_power_use_count = expected;
        self.power_acquire(power)?;
        self.devices[dev].hw.powered = true;
        Ok(())
    }

    pub(crate) fn device_power_down(
        &mut self,
        dev: Handle<DeviceNode>,
    ) -> Result<(), PmError> {
        let d = &self.devices[dev];
        let Some(power) = d.power else {
            return Ok(());
        };
        if !d.hw.powered {
            return Ok(());
        }
        let expected = self.power[power].use_count.saturating_sub(1);
        self.devices[dev].expected_power_use_count = expected;
        // The reference is gone even if switching the node off fails.
        self.devices[dev].hw.powered = false;
        self.power_release(power)
    }

    /// Checks, on the poll after a power request, that the parent of `dev`
    /// ended up where we asked it to be.
    pub(crate) fn confirm_power(
        &self,
        dev: Handle<DeviceNode>,
        up: bool,
    ) -> Result<(), PmError> {
        let d = &self.devices[dev];
        let Some(power) = d.power else {
            return Ok(());
        };
        let p = &self.power[power];
        let ok = if up {
            p.is_on() && p.use_count >= d.expected_power_use_count
        } else {
            p.use_count <= d.expected_power_use_count
        };
        if ok {
            Ok(())
        } else {
            Err(PmError::PowerFailed)
        }
    }
}
