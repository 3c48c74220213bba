// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Subsystem lifecycle: suspend and resume, suspend requests between
//! subsystems, forced power-down of cores and whole subsystems, restart.
//!
//! A forced power-down of something that can idle cooperatively starts with
//! a CPU_IDLE_FORCE_POWER_DOWN event and a deadline. The target acknowledges
//! with [`Registry::idle_ack`]; if it doesn't in time, the timeout task runs
//! the forced path anyway. Either way it runs once, and the initiator is told
//! how it went with a `ForcePowerDownAck` callback.

use drv_pmc_api::{
    Callback, DeviceState, NodeClass, NodeId, NotifyEvent, PmError,
    SubsystemState, SuspendReason,
};

use crate::arena::Handle;
use crate::node::{DeviceKind, DeviceNode, ForceRequest, Requirement, Subsystem};
use crate::notifier::Outbox;
use crate::platform::Platform;
use crate::trace::Trace;
use crate::{
    trace, Registry, Task, MAX_DEVICE_EDGES, MAX_SUBSYSTEM_EDGES,
};

impl<P: Platform> Registry<P> {
    pub(crate) fn set_subsystem_state(
        &mut self,
        sub: Handle<Subsystem>,
        state: SubsystemState,
    ) {
        let s = &mut self.subsystems[sub];
        s.state = state;
        let subsystem = s.id;
        trace!(self.trace, Trace::Subsystem { subsystem, state });
    }

    /// Marks `subsystem` as going to sleep. Until it finishes, requirement
    /// changes it makes are only scheduled.
    pub fn begin_suspend(&mut self, subsystem: NodeId) -> Result<(), PmError> {
        let r = self.subsystem_handle(subsystem).and_then(|sub| {
            if self.subsystems[sub].state != SubsystemState::Online {
                return Err(PmError::PreconditionFailed);
            }
            self.set_subsystem_state(sub, SubsystemState::Suspending);
            Ok(())
        });
        self.record(r)
    }

    /// Completes the suspend of `subsystem`, putting the requirements it
    /// scheduled into effect.
    pub fn finish_suspend(&mut self, subsystem: NodeId) -> Result<(), PmError> {
        let r = self.finish_suspend_inner(subsystem);
        self.record(r)
    }

    fn finish_suspend_inner(&mut self, subsystem: NodeId) -> Result<(), PmError> {
        let sub = self.subsystem_handle(subsystem)?;
        if self.subsystems[sub].state != SubsystemState::Suspending {
            return Err(PmError::PreconditionFailed);
        }
        self.set_subsystem_state(sub, SubsystemState::Suspended);

        let mut first_err = None;
        for edge in self.subsystems[sub].requirements.clone() {
            if let Err(e) = self.apply_scheduled(edge) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Moves the scheduled values of `edge` into effect. A device that is
    /// mid-transition picks them up when it lands.
    fn apply_scheduled(
        &mut self,
        edge: Handle<Requirement>,
    ) -> Result<(), PmError> {
        let r = &self.requirements[edge];
        if !r.allocated || r.next == r.curr {
            return Ok(());
        }
        let (dev, caps, qos) = (r.device, r.next.caps, r.next.qos);
        if self.devices[dev].is_busy() {
            let r = &mut self.requirements[edge];
            r.curr.caps = caps;
            r.curr.qos = qos;
            self.devices[dev].recheck = true;
            return Ok(());
        }
        self.set_requirement_inner(edge, caps, qos, false)?;
        Ok(())
    }

    /// Brings `subsystem` back online after (or in the middle of) a suspend.
    pub fn resume(&mut self, subsystem: NodeId) -> Result<(), PmError> {
        let r = self.subsystem_handle(subsystem).and_then(|sub| {
            match self.subsystems[sub].state {
                SubsystemState::Suspending | SubsystemState::Suspended => {
                    self.set_subsystem_state(sub, SubsystemState::Online);
                    Ok(())
                }
                _ => Err(PmError::PreconditionFailed),
            }
        });
        self.record(r)
    }

    /// Asks `target` to suspend itself on behalf of `initiator`. The request
    /// is delivered over the target's channel, now or by the retry task.
    pub fn request_suspend(
        &mut self,
        initiator: NodeId,
        target: NodeId,
        reason: SuspendReason,
        latency: u32,
        state: u32,
    ) -> Result<(), PmError> {
        let r =
            self.request_suspend_inner(initiator, target, reason, latency, state);
        self.record(r)
    }

    fn request_suspend_inner(
        &mut self,
        initiator: NodeId,
        target: NodeId,
        reason: SuspendReason,
        latency: u32,
        state: u32,
    ) -> Result<(), PmError> {
        let init = self.subsystem_handle(initiator)?;
        let tgt = self.subsystem_handle(target)?;
        if init == tgt {
            return Err(PmError::InvalidSubsystem);
        }
        let t = &self.subsystems[tgt];
        if t.state != SubsystemState::Online {
            return Err(PmError::PreconditionFailed);
        }
        if t.pending_suspend.is_some() {
            return Err(PmError::Busy);
        }
        trace!(self.trace, Trace::SuspendRequested { initiator, target });
        self.queue_callback(
            tgt,
            Outbox::Suspend,
            Callback::InitSuspend {
                initiator,
                reason,
                latency,
                state,
            },
        );
        Ok(())
    }

    /// Powers down a core, or a whole subsystem, that belongs to someone
    /// else.
    pub fn force_power_down(
        &mut self,
        initiator: NodeId,
        node: NodeId,
    ) -> Result<(), PmError> {
        let r = self.force_inner(initiator, node, false);
        self.record(r)
    }

    /// Forces `subsystem` down and brings it straight back online with
    /// nothing allocated.
    pub fn restart(
        &mut self,
        initiator: NodeId,
        subsystem: NodeId,
    ) -> Result<(), PmError> {
        let r = match subsystem.class() {
            Some(NodeClass::Subsystem) => {
                self.force_inner(initiator, subsystem, true)
            }
            _ => Err(PmError::InvalidSubsystem),
        };
        self.record(r)
    }

    fn force_inner(
        &mut self,
        initiator: NodeId,
        node: NodeId,
        restart: bool,
    ) -> Result<(), PmError> {
        let init = self.subsystem_handle(initiator)?;
        match node.class() {
            Some(NodeClass::Device) => {
                let dev = self.device_handle(node)?;
                self.force_core(init, dev)
            }
            Some(NodeClass::Subsystem) => {
                let sub = self.subsystem_handle(node)?;
                self.force_subsystem(init, sub, restart)
            }
            _ => Err(PmError::InvalidNode),
        }
    }

    fn force_core(
        &mut self,
        init: Handle<Subsystem>,
        dev: Handle<DeviceNode>,
    ) -> Result<(), PmError> {
        let d = &self.devices[dev];
        let DeviceKind::Core { idle_supported } = d.kind else {
            return Err(PmError::InvalidNode);
        };
        let id = d.node.id;
        if d.force.is_some() {
            return Err(PmError::Busy);
        }
        if self.owners(dev).any(|owner| owner == init) {
            return Err(PmError::NoAccess);
        }
        trace!(
            self.trace,
            Trace::ForcePowerDown {
                initiator: self.subsystems[init].id,
                node: id,
            }
        );

        let running = !d.is_busy() && d.node.state != DeviceState::Unused;
        if idle_supported && running {
            self.change_state(dev, DeviceState::PendingPowerDown, None)?;
            let deadline = self.now + self.config.force_power_down_timeout;
            self.devices[dev].force = Some(ForceRequest {
                initiator: init,
                deadline,
                restart: false,
            });
            self.notify_event(id, NotifyEvent::CPU_IDLE_FORCE_POWER_DOWN);
            self.arm_force_timer();
            return Ok(());
        }

        let r = self.force_core_down(dev);
        self.send_ack(init, id, r);
        r
    }

    fn force_subsystem(
        &mut self,
        init: Handle<Subsystem>,
        sub: Handle<Subsystem>,
        restart: bool,
    ) -> Result<(), PmError> {
        if init == sub {
            return Err(PmError::NoAccess);
        }
        let s = &self.subsystems[sub];
        let id = s.id;
        if s.force.is_some() {
            return Err(PmError::Busy);
        }
        trace!(
            self.trace,
            Trace::ForcePowerDown {
                initiator: self.subsystems[init].id,
                node: id,
            }
        );

        if s.idle_supported && s.state != SubsystemState::Offline {
            let deadline = self.now + self.config.force_power_down_timeout;
            self.subsystems[sub].force = Some(ForceRequest {
                initiator: init,
                deadline,
                restart,
            });
            self.set_subsystem_state(
                sub,
                if restart {
                    SubsystemState::PendingRestart
                } else {
                    SubsystemState::PendingPowerOff
                },
            );
            for core in self.cores_of(sub) {
                let core_id = self.devices[core].node.id;
                self.notify_event(core_id, NotifyEvent::CPU_IDLE_FORCE_POWER_DOWN);
            }
            self.arm_force_timer();
            return Ok(());
        }

        self.force_subsystem_down(sub);
        if restart {
            self.set_subsystem_state(sub, SubsystemState::Online);
        }
        self.send_ack(init, id, Ok(()));
        Ok(())
    }

    /// Reports that a core or subsystem asked to idle has done so, which
    /// finishes its forced power-down.
    pub fn idle_ack(&mut self, node: NodeId) -> Result<(), PmError> {
        let r = self.idle_ack_inner(node);
        self.record(r)
    }

    fn idle_ack_inner(&mut self, node: NodeId) -> Result<(), PmError> {
        match node.class() {
            Some(NodeClass::Device) => {
                let dev = self.device_handle(node)?;
                if self.devices[dev].force.is_none() {
                    return Err(PmError::InvalidParam);
                }
                self.complete_force_core(dev);
            }
            Some(NodeClass::Subsystem) => {
                let sub = self.subsystem_handle(node)?;
                if self.subsystems[sub].force.is_none() {
                    return Err(PmError::InvalidParam);
                }
                self.complete_force_subsystem(sub);
            }
            _ => return Err(PmError::InvalidNode),
        }
        self.arm_force_timer();
        Ok(())
    }

    /// Timeout task: runs the forced path for every target that didn't
    /// acknowledge in time.
    pub(crate) fn expire_force_requests(&mut self) {
        let now = self.now;
        let overdue = |f: &Option<ForceRequest>| {
            f.as_ref().is_some_and(|f| f.deadline <= now)
        };

        for dev in self.devices.handles() {
            if overdue(&self.devices[dev].force) {
                let id = self.devices[dev].node.id;
                trace!(self.trace, Trace::ForceTimeout(id));
                self.complete_force_core(dev);
            }
        }
        for sub in self.subsystems.handles() {
            if overdue(&self.subsystems[sub].force) {
                let id = self.subsystems[sub].id;
                trace!(self.trace, Trace::ForceTimeout(id));
                self.complete_force_subsystem(sub);
            }
        }
        self.arm_force_timer();
    }

    fn complete_force_core(&mut self, dev: Handle<DeviceNode>) {
        let Some(req) = self.devices[dev].force.take() else {
            return;
        };
        let id = self.devices[dev].node.id;
        let r = self.force_core_down(dev);
        let r = self.record(r);
        trace!(self.trace, Trace::ForceComplete(id));
        self.send_ack(req.initiator, id, r);
    }

    fn complete_force_subsystem(&mut self, sub: Handle<Subsystem>) {
        let Some(req) = self.subsystems[sub].force.take() else {
            return;
        };
        let id = self.subsystems[sub].id;
        self.force_subsystem_down(sub);
        if req.restart {
            self.set_subsystem_state(sub, SubsystemState::Online);
        }
        trace!(self.trace, Trace::ForceComplete(id));
        self.send_ack(req.initiator, id, Ok(()));
    }

    /// Takes a core away from its owners and powers it down. An owner left
    /// with no core that is still up goes down with it.
    fn force_core_down(&mut self, dev: Handle<DeviceNode>) -> Result<(), PmError> {
        if self.devices[dev].is_busy() {
            self.abort_transition(dev, PmError::Busy);
        }
        let owners: heapless::Vec<Handle<Subsystem>, MAX_DEVICE_EDGES> =
            self.owners(dev).collect();
        for edge in self.devices[dev].requirements.clone() {
            self.drop_edge(edge);
        }
        let id = self.devices[dev].node.id;
        self.notify_event(id, NotifyEvent::ZERO_USERS);
        let r = self.change_state(dev, DeviceState::Unused, None).map(|_| ());

        for owner in owners {
            let any_core_up = self.cores_of(owner).iter().any(|&core| {
                self.devices[core].node.state != DeviceState::Unused
            });
            if !any_core_up {
                self.force_subsystem_down(owner);
            }
        }
        r
    }

    /// Clears every edge of `sub` without going through the cooperative
    /// release path and takes it offline.
    fn force_subsystem_down(&mut self, sub: Handle<Subsystem>) {
        let edges = self.subsystems[sub].requirements.clone();
        let mut touched: heapless::Vec<Handle<DeviceNode>, MAX_SUBSYSTEM_EDGES> =
            heapless::Vec::new();
        for edge in edges {
            if self.requirements[edge].allocated {
                // Can't overflow: one device per edge.
                let _ = touched.push(self.requirements[edge].device);
            }
            self.drop_edge(edge);
        }
        for dev in touched {
            self.rearbitrate(dev);
        }

        let s = &mut self.subsystems[sub];
        s.pending_suspend = None;
        s.force = None;
        self.set_subsystem_state(sub, SubsystemState::Offline);
    }

    /// Forgets whatever `edge` held, closing its protection window.
    fn drop_edge(&mut self, edge: Handle<Requirement>) {
        if !self.requirements[edge].allocated {
            return;
        }
        // The window is going away regardless.
        let _ = self.configure_protection(edge, false);
        let qos = self.config.default_qos;
        let r = &mut self.requirements[edge];
        r.clear(qos);
        r.allocated = false;
    }

    /// Re-arbitrates `dev` after edges were dropped behind its back.
    fn rearbitrate(&mut self, dev: Handle<DeviceNode>) {
        if self.devices[dev].is_busy() {
            self.devices[dev].recheck = true;
        } else if self.devices[dev].node.state != DeviceState::PendingPowerDown {
            self.update_status_unattended(dev);
        }
        self.update_divider(dev);
        if !self.has_users(dev) {
            let id = self.devices[dev].node.id;
            self.notify_event(id, NotifyEvent::ZERO_USERS);
        }
    }

    fn send_ack(
        &mut self,
        initiator: Handle<Subsystem>,
        node: NodeId,
        r: Result<(), PmError>,
    ) {
        if self.subsystems.get(initiator).is_none() {
            return;
        }
        let status = match r {
            Ok(()) => 0,
            Err(e) => u32::from(e),
        };
        let msg = Callback::ForcePowerDownAck {
            node,
            status,
            state: self.node_state(node),
        };
        self.queue_callback(initiator, Outbox::Ack, msg);
    }

    fn arm_force_timer(&mut self) {
        let devices = self.devices.iter().filter_map(|(_, d)| d.force);
        let subsystems = self.subsystems.iter().filter_map(|(_, s)| s.force);
        match devices.chain(subsystems).map(|f| f.deadline).min() {
            Some(deadline) => self.timers.arm(Task::ForcePowerDown, deadline),
            None => {
                self.timers.disarm(Task::ForcePowerDown);
            }
        }
    }

    /// Subsystems holding `dev`.
    fn owners(
        &self,
        dev: Handle<DeviceNode>,
    ) -> impl Iterator<Item = Handle<Subsystem>> + '_ {
        self.devices[dev]
            .requirements
            .iter()
            .map(|&edge| &self.requirements[edge])
            .filter(|r| r.allocated)
            .map(|r| r.subsystem)
    }

    /// Cores `sub` holds.
    fn cores_of(
        &self,
        sub: Handle<Subsystem>,
    ) -> heapless::Vec<Handle<DeviceNode>, MAX_SUBSYSTEM_EDGES> {
        self.subsystems[sub]
            .requirements
            .iter()
            .map(|&edge| &self.requirements[edge])
            .filter(|r| r.allocated)
            .map(|r| r.device)
            .filter(|&dev| {
                matches!(self.devices[dev].kind, DeviceKind::Core { .. })
            })
            .collect()
    }

    /// Removes an offline subsystem and every edge it has.
    pub fn remove_subsystem(&mut self, subsystem: NodeId) -> Result<(), PmError> {
        let r = self.remove_subsystem_inner(subsystem);
        self.record(r)
    }

    fn remove_subsystem_inner(
        &mut self,
        subsystem: NodeId,
    ) -> Result<(), PmError> {
        let sub = self.subsystem_handle(subsystem)?;
        let s = &self.subsystems[sub];
        let holds_anything = s
            .requirements
            .iter()
            .any(|&edge| self.requirements[edge].allocated);
        if s.state != SubsystemState::Offline || holds_anything {
            return Err(PmError::Busy);
        }

        for edge in self.subsystems[sub].requirements.clone() {
            let dev = self.requirements[edge].device;
            self.devices[dev].requirements.retain(|&e| e != edge);
            self.requirements.remove(edge);
        }
        self.notifier.forget(sub);
        self.subsystems.remove(sub);
        Ok(())
    }
}
