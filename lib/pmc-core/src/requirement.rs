// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Requirement arbitration.
//!
//! Every subsystem that may use a device has one [`Requirement`] edge to it,
//! created at boot. Requesting the device allocates the edge and sets the
//! capabilities the subsystem needs; the device is then moved to the
//! cheapest state of its table that covers the union of all allocated edges
//! and still meets the tightest wakeup latency anyone asked for.
//!
//! Changes are applied optimistically and undone if the resulting state
//! change fails, whether that happens right away or on a later completion
//! poll.

use drv_pmc_api::{
    Capabilities, DeviceState, DeviceStatus, NodeId, NotifyEvent, PmError,
    SecurityPolicy, SubsystemState, Usage, MAX_LATENCY,
};

use crate::arena::Handle;
use crate::device::Step;
use crate::node::{
    DeviceKind, DeviceNode, PendingRequirement, ReqInfo, Requirement,
    RequirementDesc, Subsystem,
};
use crate::platform::{Platform, ProtectionRequest};
use crate::trace::Trace;
use crate::{trace, Registry};

impl<P: Platform> Registry<P> {
    /// Creates the edge between `subsystem` and `device`. The edge starts out
    /// unallocated, asking for nothing.
    pub fn add_requirement(
        &mut self,
        subsystem: NodeId,
        device: NodeId,
        desc: RequirementDesc,
    ) -> Result<(), PmError> {
        let r = self.add_requirement_inner(subsystem, device, desc);
        self.record(r)
    }

    fn add_requirement_inner(
        &mut self,
        subsystem: NodeId,
        device: NodeId,
        desc: RequirementDesc,
    ) -> Result<(), PmError> {
        let sub = self.subsystem_handle(subsystem)?;
        let dev = self.device_handle(device)?;
        if self.find_requirement(sub, dev).is_some() {
            return Err(PmError::InvalidParam);
        }

        let info = ReqInfo::cleared(self.config.default_qos);
        let edge = self
            .requirements
            .alloc(Requirement {
                subsystem: sub,
                device: dev,
                curr: info,
                next: info,
                allocated: false,
                latency_requested: false,
                usage: desc.usage,
                security: desc.security,
                aperture: desc.aperture,
                attr_caps: Capabilities::empty(),
            })
            .map_err(|_| PmError::NoFreeSlot)?;

        if self.devices[dev].requirements.push(edge).is_err() {
            self.requirements.remove(edge);
            return Err(PmError::NoFreeSlot);
        }
        if self.subsystems[sub].requirements.push(edge).is_err() {
            self.devices[dev].requirements.pop();
            self.requirements.remove(edge);
            return Err(PmError::NoFreeSlot);
        }
        Ok(())
    }

    /// Allocates `device` to `subsystem` with the given capabilities and QoS.
    pub fn request_device(
        &mut self,
        subsystem: NodeId,
        device: NodeId,
        caps: Capabilities,
        qos: u32,
    ) -> Result<(), PmError> {
        let r = self.request_inner(subsystem, device, caps, qos);
        self.record(r)
    }

    fn request_inner(
        &mut self,
        subsystem: NodeId,
        device: NodeId,
        caps: Capabilities,
        qos: u32,
    ) -> Result<(), PmError> {
        let sub = self.subsystem_handle(subsystem)?;
        let dev = self.device_handle(device)?;
        self.check_accepts_requests(sub)?;
        if !self.devices[dev].is_settleable() {
            return Err(PmError::Busy);
        }
        let edge = self
            .find_requirement(sub, dev)
            .ok_or(PmError::NoRequirement)?;
        if self.requirements[edge].allocated {
            return Ok(());
        }
        self.check_security(sub, edge, caps)?;
        self.check_sharing(dev, edge)?;

        let r = &mut self.requirements[edge];
        r.allocated = true;
        if caps.contains(Capabilities::SECURE) {
            r.attr_caps |= Capabilities::SECURE;
        }
        // Open the window before the device moves.
        if let Err(e) = self.configure_protection(edge, true) {
            let r = &mut self.requirements[edge];
            r.allocated = false;
            r.attr_caps = Capabilities::empty();
            return Err(e);
        }
        if let Err(e) = self.set_requirement_inner(edge, caps, qos, true) {
            self.undo_allocation(edge);
            return Err(e);
        }

        trace!(
            self.trace,
            Trace::Requested {
                subsystem,
                device,
                caps,
            }
        );
        Ok(())
    }

    /// Changes the capabilities and QoS `subsystem` needs from a device it
    /// has already requested.
    pub fn set_requirement(
        &mut self,
        subsystem: NodeId,
        device: NodeId,
        caps: Capabilities,
        qos: u32,
    ) -> Result<(), PmError> {
        let r = self.allocated_edge(subsystem, device).and_then(|edge| {
            self.set_requirement_inner(edge, caps, qos, false).map(|_| ())
        });
        self.record(r)
    }

    /// Applies new capabilities to an allocated edge and re-arbitrates its
    /// device. A subsystem in the middle of suspending only gets its
    /// scheduled values updated; they take effect when it finishes.
    pub(crate) fn set_requirement_inner(
        &mut self,
        edge: Handle<Requirement>,
        caps: Capabilities,
        qos: u32,
        newly_allocated: bool,
    ) -> Result<Step, PmError> {
        let r = &self.requirements[edge];
        let (sub, dev) = (r.subsystem, r.device);

        if self.subsystems[sub].state == SubsystemState::Suspending {
            let r = &mut self.requirements[edge];
            r.next.caps = caps;
            r.next.qos = qos;
            return Ok(Step::Done);
        }

        let backup = PendingRequirement {
            edge,
            curr: r.curr,
            next: r.next,
            latency_requested: r.latency_requested,
            newly_allocated,
        };
        let r = &mut self.requirements[edge];
        r.curr.caps = caps;
        r.curr.qos = qos;

        match self.update_status(dev, Some(backup)) {
            Ok(step) => {
                let r = &mut self.requirements[edge];
                if caps == Capabilities::UNUSABLE {
                    // Nothing to keep across a suspend.
                    r.next = ReqInfo {
                        caps: Capabilities::empty(),
                        ..r.curr
                    };
                } else {
                    r.commit();
                }
                self.update_divider(dev);
                Ok(step)
            }
            Err(e) => {
                self.restore(&backup);
                Err(e)
            }
        }
    }

    /// Gives `device` back. Releasing a device that isn't allocated to
    /// `subsystem` does nothing.
    pub fn release_device(
        &mut self,
        subsystem: NodeId,
        device: NodeId,
    ) -> Result<(), PmError> {
        let r = self.release_inner(subsystem, device);
        self.record(r)
    }

    fn release_inner(
        &mut self,
        subsystem: NodeId,
        device: NodeId,
    ) -> Result<(), PmError> {
        let sub = self.subsystem_handle(subsystem)?;
        let dev = self.device_handle(device)?;
        let edge = self
            .find_requirement(sub, dev)
            .ok_or(PmError::NoRequirement)?;
        self.check_accepts_requests(sub)?;
        if !self.requirements[edge].allocated {
            return Ok(());
        }
        if self.devices[dev].is_busy() {
            return Err(PmError::Busy);
        }
        self.release_edge(edge)?;
        trace!(self.trace, Trace::Released { subsystem, device });
        Ok(())
    }

    /// Drops everything `edge` asks for and re-arbitrates. The edge itself is
    /// freed once the device has settled in its new state.
    pub(crate) fn release_edge(
        &mut self,
        edge: Handle<Requirement>,
    ) -> Result<(), PmError> {
        let r = &self.requirements[edge];
        let dev = r.device;
        let backup = PendingRequirement {
            edge,
            curr: r.curr,
            next: r.next,
            latency_requested: r.latency_requested,
            newly_allocated: false,
        };
        let r = &mut self.requirements[edge];
        r.curr.caps = Capabilities::empty();
        r.latency_requested = false;

        match self.update_status(dev, Some(backup)) {
            Ok(Step::Done) => self.finalize_release(edge),
            Ok(Step::NeedsCompletion) => {
                self.devices[dev].pending_dealloc = true;
            }
            Err(e) => {
                self.restore(&backup);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Frees a released edge and closes its protection window, announcing it
    /// if the device has no users left.
    pub(crate) fn finalize_release(&mut self, edge: Handle<Requirement>) {
        if let Err(e) = self.configure_protection(edge, false) {
            trace!(self.trace, Trace::Error(e));
        }
        let qos = self.config.default_qos;
        let r = &mut self.requirements[edge];
        let dev = r.device;
        r.clear(qos);
        r.allocated = false;

        self.update_divider(dev);
        if !self.has_users(dev) {
            let id = self.devices[dev].node.id;
            self.notify_event(id, NotifyEvent::ZERO_USERS);
        }
    }

    /// Caps how long `subsystem` is willing to wait for `device` to come
    /// back to full operation.
    pub fn set_max_latency(
        &mut self,
        subsystem: NodeId,
        device: NodeId,
        latency: u32,
    ) -> Result<(), PmError> {
        let r = self.set_max_latency_inner(subsystem, device, latency);
        self.record(r)
    }

    fn set_max_latency_inner(
        &mut self,
        subsystem: NodeId,
        device: NodeId,
        latency: u32,
    ) -> Result<(), PmError> {
        let sub = self.subsystem_handle(subsystem)?;
        let dev = self.device_handle(device)?;
        self.check_accepts_requests(sub)?;
        let edge = self
            .find_requirement(sub, dev)
            .ok_or(PmError::NoRequirement)?;

        let r = &mut self.requirements[edge];
        let backup = PendingRequirement {
            edge,
            curr: r.curr,
            next: r.next,
            latency_requested: r.latency_requested,
            newly_allocated: false,
        };
        r.next.latency = latency;
        r.latency_requested = true;

        if let Err(e) = self.update_status(dev, Some(backup)) {
            self.restore(&backup);
            return Err(e);
        }
        self.requirements[edge].curr.latency = latency;
        Ok(())
    }

    /// State of `device` as seen by `subsystem`.
    pub fn get_device_status(
        &mut self,
        subsystem: NodeId,
        device: NodeId,
    ) -> Result<DeviceStatus, PmError> {
        let r = self.device_status_inner(subsystem, device);
        self.record(r)
    }

    fn device_status_inner(
        &self,
        subsystem: NodeId,
        device: NodeId,
    ) -> Result<DeviceStatus, PmError> {
        let sub = self.subsystem_handle(subsystem)?;
        let dev = self.device_handle(device)?;

        let mut usage = Usage::empty();
        let mut requirement = Capabilities::empty();
        for &edge in &self.devices[dev].requirements {
            let r = &self.requirements[edge];
            if r.subsystem == sub {
                requirement = r.curr.caps;
            }
            if !r.allocated {
                continue;
            }
            usage |= if r.subsystem == sub {
                Usage::CURRENT_SUBSYSTEM
            } else {
                Usage::OTHER_SUBSYSTEM
            };
        }
        Ok(DeviceStatus {
            state: self.devices[dev].node.state as u32,
            requirement,
            usage,
        })
    }

    /// Re-arbitrates `dev` from its allocated edges and moves it to the
    /// resulting state, as picked by [`Fsm::select`](crate::Fsm::select)
    /// with the smallest latency anyone asked for.
    pub(crate) fn update_status(
        &mut self,
        dev: Handle<DeviceNode>,
        pending: Option<PendingRequirement>,
    ) -> Result<Step, PmError> {
        let d = &self.devices[dev];
        if !d.is_settleable() {
            return Err(PmError::Busy);
        }
        let (fsm, state, id) = (d.fsm, d.node.state, d.node.id);
        let caps = self.aggregate_caps(dev) & Capabilities::STATE_MASK;
        let min_latency = self.min_requested_latency(dev);

        let (target, wakeup) = fsm.select(caps, min_latency)?;

        let margin = if min_latency == MAX_LATENCY {
            MAX_LATENCY
        } else {
            min_latency - wakeup
        };
        self.devices[dev].node.latency_margin = margin;
        trace!(
            self.trace,
            Trace::Target {
                device: id,
                state: target,
                margin,
            }
        );

        if target != state {
            return self.change_state(dev, target, pending);
        }
        if state == DeviceState::Unused {
            self.update_power_hold(dev)?;
        }
        Ok(Step::Done)
    }

    /// Union of the current capabilities of the allocated edges of `dev`.
    pub(crate) fn aggregate_caps(&self, dev: Handle<DeviceNode>) -> Capabilities {
        self.allocated_edges(dev)
            .fold(Capabilities::empty(), |acc, r| acc | r.curr.caps)
    }

    fn min_requested_latency(&self, dev: Handle<DeviceNode>) -> u32 {
        self.devices[dev]
            .requirements
            .iter()
            .map(|&edge| &self.requirements[edge])
            .filter(|r| r.latency_requested)
            .map(|r| r.next.latency)
            .min()
            .unwrap_or(MAX_LATENCY)
    }

    fn allocated_edges(
        &self,
        dev: Handle<DeviceNode>,
    ) -> impl Iterator<Item = &Requirement> + '_ {
        self.devices[dev]
            .requirements
            .iter()
            .map(|&edge| &self.requirements[edge])
            .filter(|r| r.allocated)
    }

    pub(crate) fn has_users(&self, dev: Handle<DeviceNode>) -> bool {
        self.allocated_edges(dev).next().is_some()
    }

    /// Reprograms the clock divider of an accelerator from the QoS its users
    /// ask for. Lower QoS values are more demanding and win.
    pub(crate) fn update_divider(&mut self, dev: Handle<DeviceNode>) {
        let DeviceKind::Accelerator { floor } = self.devices[dev].kind else {
            return;
        };
        let divider = self
            .allocated_edges(dev)
            .map(|r| r.curr.qos)
            .min()
            .map_or(floor, |qos| qos.max(floor));

        let d = &self.devices[dev];
        if d.divider == Some(divider) {
            return;
        }
        let id = d.node.id;
        match self.platform.set_clock_divider(id, divider) {
            Ok(()) => {
                self.devices[dev].divider = Some(divider);
                trace!(self.trace, Trace::Divider { device: id, divider });
            }
            Err(e) => trace!(self.trace, Trace::Error(e)),
        }
    }

    /// Takes back an allocation that didn't go through, closing the window
    /// it opened. Does nothing to an edge that is already free.
    pub(crate) fn undo_allocation(&mut self, edge: Handle<Requirement>) {
        if !self.requirements[edge].allocated {
            return;
        }
        if let Err(e) = self.configure_protection(edge, false) {
            trace!(self.trace, Trace::Error(e));
        }
        let r = &mut self.requirements[edge];
        r.allocated = false;
        r.attr_caps = Capabilities::empty();
    }

    fn restore(&mut self, backup: &PendingRequirement) {
        let r = &mut self.requirements[backup.edge];
        r.curr = backup.curr;
        r.next = backup.next;
        r.latency_requested = backup.latency_requested;
    }

    fn allocated_edge(
        &self,
        subsystem: NodeId,
        device: NodeId,
    ) -> Result<Handle<Requirement>, PmError> {
        let sub = self.subsystem_handle(subsystem)?;
        let dev = self.device_handle(device)?;
        self.check_accepts_requests(sub)?;
        self.find_requirement(sub, dev)
            .filter(|&edge| self.requirements[edge].allocated)
            .ok_or(PmError::NoRequirement)
    }

    /// Subsystems on their way down take no new work, and offline ones
    /// have to be restarted first.
    pub(crate) fn check_accepts_requests(
        &self,
        sub: Handle<Subsystem>,
    ) -> Result<(), PmError> {
        match self.subsystems[sub].state {
            SubsystemState::PendingPowerOff | SubsystemState::PendingRestart => {
                Err(PmError::Busy)
            }
            SubsystemState::Offline => Err(PmError::InvalidSubsystem),
            _ => Ok(()),
        }
    }

    /// Secure-only edges need a secure caller, and only those may ask for
    /// secure access.
    fn check_security(
        &self,
        sub: Handle<Subsystem>,
        edge: Handle<Requirement>,
        caps: Capabilities,
    ) -> Result<(), PmError> {
        let secure_caller = self.subsystems[sub].secure;
        let secure_edge = self.requirements[edge].security == SecurityPolicy::Secure;
        if secure_edge && !secure_caller {
            return Err(PmError::NoAccess);
        }
        if caps.contains(Capabilities::SECURE) && !(secure_edge && secure_caller)
        {
            return Err(PmError::NoAccess);
        }
        Ok(())
    }

    /// An exclusive edge can't be allocated alongside any other, in either
    /// direction.
    fn check_sharing(
        &self,
        dev: Handle<DeviceNode>,
        edge: Handle<Requirement>,
    ) -> Result<(), PmError> {
        let mine = self.requirements[edge].usage;
        let clash = self.devices[dev]
            .requirements
            .iter()
            .filter(|&&other| other != edge)
            .map(|&other| &self.requirements[other])
            .any(|r| {
                r.allocated && (mine.is_exclusive() || r.usage.is_exclusive())
            });
        if clash {
            Err(PmError::NodeInUse)
        } else {
            Ok(())
        }
    }

    pub(crate) fn configure_protection(
        &mut self,
        edge: Handle<Requirement>,
        enable: bool,
    ) -> Result<(), PmError> {
        let r = &self.requirements[edge];
        if r.aperture == 0 {
            return Ok(());
        }
        let d = &self.devices[r.device];
        let req = ProtectionRequest {
            device: d.node.id,
            subsystem: self.subsystems[r.subsystem].id,
            base_address: d.node.base_address,
            aperture: r.aperture,
            secure: r.attr_caps.contains(Capabilities::SECURE),
        };
        self.platform.protection_configure(&req, enable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{
        self, Call, ACCEL, DX, DY, DZ, MEM, PI, REGION, S1, S2, S3, UART,
    };
    use drv_pmc_api::{PowerState, DEFAULT_QOS};
    use proptest::prelude::*;

    const RUN: Capabilities = Capabilities::ACCESS;

    /// Protection windows opened and closed so far.
    fn windows(r: &Registry<fake::FakePlatform>) -> Vec<(NodeId, bool)> {
        r.platform()
            .calls
            .iter()
            .filter_map(|c| match *c {
                Call::Protection { device, enable, .. } => Some((device, enable)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn request_brings_device_up() {
        let mut r = fake::registry();
        r.request_device(S1, UART, RUN, DEFAULT_QOS).unwrap();
        assert_eq!(r.device_state(UART).unwrap(), DeviceState::Running);
        assert_eq!(r.aggregate_capabilities(UART).unwrap(), RUN);
        assert_eq!(r.power_state(PI).unwrap(), PowerState::On);

        // Asking again changes nothing.
        r.request_device(S1, UART, Capabilities::empty(), DEFAULT_QOS)
            .unwrap();
        assert_eq!(r.aggregate_capabilities(UART).unwrap(), RUN);
    }

    #[test]
    fn release_brings_device_down() {
        let mut r = fake::registry();
        r.request_device(S1, UART, RUN, DEFAULT_QOS).unwrap();
        r.release_device(S1, UART).unwrap();
        assert_eq!(r.device_state(UART).unwrap(), DeviceState::Unused);
        assert_eq!(r.power_state(PI).unwrap(), PowerState::Off);
        assert_eq!(
            r.aggregate_capabilities(UART).unwrap(),
            Capabilities::empty()
        );

        // Releasing twice is harmless.
        r.release_device(S1, UART).unwrap();
    }

    #[test]
    fn shared_device_follows_union() {
        let mut r = fake::registry();
        r.request_device(S1, DY, Capabilities::UNUSABLE, DEFAULT_QOS)
            .unwrap();
        assert_eq!(r.device_state(DY).unwrap(), DeviceState::RuntimeSuspend);

        r.request_device(S2, DY, RUN, DEFAULT_QOS).unwrap();
        assert_eq!(r.device_state(DY).unwrap(), DeviceState::Running);

        r.release_device(S2, DY).unwrap();
        assert_eq!(r.device_state(DY).unwrap(), DeviceState::RuntimeSuspend);
    }

    #[test]
    fn exclusive_device_refuses_second_user() {
        let mut r = fake::registry();
        r.request_device(S1, DX, RUN, DEFAULT_QOS).unwrap();
        assert_eq!(
            r.request_device(S2, DX, RUN, DEFAULT_QOS),
            Err(PmError::NodeInUse)
        );
        assert_eq!(r.errors()[PmError::NodeInUse], 1);

        r.release_device(S1, DX).unwrap();
        r.request_device(S2, DX, RUN, DEFAULT_QOS).unwrap();
    }

    #[test]
    fn exclusive_rejection_leaves_holder_untouched() {
        let mut r = fake::registry();
        r.request_device(S2, DX, RUN, DEFAULT_QOS).unwrap();
        let before = r.get_device_status(S2, DX).unwrap();
        let calls = r.platform().calls.len();

        assert_eq!(
            r.request_device(S1, DX, RUN, DEFAULT_QOS),
            Err(PmError::NodeInUse)
        );
        assert_eq!(r.get_device_status(S2, DX).unwrap(), before);
        assert_eq!(r.device_state(DX).unwrap(), DeviceState::Running);
        assert_eq!(r.platform().calls.len(), calls);
        let s1 = r.get_device_status(S1, DX).unwrap();
        assert_eq!(s1.usage, Usage::OTHER_SUBSYSTEM);
        assert_eq!(s1.requirement, Capabilities::empty());
    }

    #[test]
    fn secure_and_nonsecure_share_device() {
        let mut r = fake::registry();
        r.request_device(S1, DY, RUN | Capabilities::SECURE, DEFAULT_QOS)
            .unwrap();
        r.request_device(S2, DY, RUN, DEFAULT_QOS).unwrap();
        assert_eq!(
            r.aggregate_capabilities(DY).unwrap(),
            RUN | Capabilities::SECURE
        );
        assert_eq!(r.device_state(DY).unwrap(), DeviceState::Running);
        assert_eq!(
            r.get_device_status(S2, DY).unwrap().usage,
            Usage::CURRENT_SUBSYSTEM | Usage::OTHER_SUBSYSTEM
        );
    }

    #[test]
    fn offline_subsystem_is_refused() {
        let mut r = fake::registry();
        r.request_device(S1, DZ, RUN, DEFAULT_QOS).unwrap();
        let h = r.subsystem_handle(S1).unwrap();
        r.subsystems[h].state = SubsystemState::Offline;

        assert_eq!(
            r.request_device(S1, DY, RUN, DEFAULT_QOS),
            Err(PmError::InvalidSubsystem)
        );
        assert_eq!(
            r.set_requirement(S1, DZ, Capabilities::empty(), DEFAULT_QOS),
            Err(PmError::InvalidSubsystem)
        );
        assert_eq!(
            r.set_max_latency(S1, DZ, 10),
            Err(PmError::InvalidSubsystem)
        );
        assert_eq!(r.release_device(S1, DZ), Err(PmError::InvalidSubsystem));

        assert_eq!(r.subsystem_state(S1).unwrap(), SubsystemState::Offline);
        assert_eq!(r.device_state(DY).unwrap(), DeviceState::Unused);
        assert_eq!(r.device_state(DZ).unwrap(), DeviceState::Running);
    }

    #[test]
    fn security_is_enforced() {
        let mut r = fake::registry();
        // Non-secure caller on a secure-only edge.
        assert_eq!(
            r.request_device(S3, DX, RUN, DEFAULT_QOS),
            Err(PmError::NoAccess)
        );
        // Secure access over a non-secure channel.
        assert_eq!(
            r.request_device(S2, DY, RUN | Capabilities::SECURE, DEFAULT_QOS),
            Err(PmError::NoAccess)
        );
        // Secure caller on a secure-only edge.
        r.request_device(S1, DY, RUN | Capabilities::SECURE, DEFAULT_QOS)
            .unwrap();
        // Attribute bits don't pick a state.
        assert_eq!(r.device_state(DY).unwrap(), DeviceState::Running);
    }

    #[test]
    fn missing_edge_and_bad_ids() {
        let mut r = fake::registry();
        assert_eq!(
            r.request_device(S3, UART, RUN, DEFAULT_QOS),
            Err(PmError::NoRequirement)
        );
        assert_eq!(
            r.request_device(S1, PI, RUN, DEFAULT_QOS),
            Err(PmError::InvalidNode)
        );
        assert_eq!(
            r.request_device(UART, UART, RUN, DEFAULT_QOS),
            Err(PmError::InvalidSubsystem)
        );
        assert_eq!(
            r.set_requirement(S1, UART, RUN, DEFAULT_QOS),
            Err(PmError::NoRequirement)
        );
    }

    #[test]
    fn uncoverable_request_is_rolled_back() {
        let mut r = fake::registry();
        r.region_init_start(REGION).unwrap();
        r.region_init_finish(REGION).unwrap();
        assert_eq!(
            r.request_device(S1, REGION, Capabilities::WAKEUP, DEFAULT_QOS),
            Err(PmError::Conflict)
        );
        let status = r.get_device_status(S1, REGION).unwrap();
        assert_eq!(status.usage, Usage::empty());
        assert_eq!(status.requirement, Capabilities::empty());
    }

    #[test]
    fn failed_bringup_is_rolled_back() {
        let mut r = fake::registry();
        r.platform_mut().fail_clocks = true;
        assert_eq!(
            r.request_device(S1, UART, RUN, DEFAULT_QOS),
            Err(PmError::ClockFailed)
        );
        assert!(!r.has_users(r.device_handle(UART).unwrap()));
        assert_eq!(r.power_use_count(PI).unwrap(), 0);
    }

    #[test]
    fn unusable_schedules_nothing() {
        let mut r = fake::registry();
        r.request_device(S1, UART, RUN, DEFAULT_QOS).unwrap();
        r.set_requirement(S1, UART, Capabilities::UNUSABLE, DEFAULT_QOS)
            .unwrap();
        assert_eq!(r.device_state(UART).unwrap(), DeviceState::RuntimeSuspend);

        let dev = r.device_handle(UART).unwrap();
        let sub = r.subsystem_handle(S1).unwrap();
        let edge = r.find_requirement(sub, dev).unwrap();
        assert_eq!(r.requirements[edge].next.caps, Capabilities::empty());
        assert_eq!(r.requirements[edge].curr.caps, Capabilities::UNUSABLE);
    }

    #[test]
    fn suspending_subsystem_only_schedules() {
        let mut r = fake::registry();
        r.request_device(S1, UART, RUN, DEFAULT_QOS).unwrap();
        let sub = r.subsystem_handle(S1).unwrap();
        r.subsystems[sub].state = SubsystemState::Suspending;

        r.set_requirement(S1, UART, Capabilities::empty(), DEFAULT_QOS)
            .unwrap();
        assert_eq!(r.device_state(UART).unwrap(), DeviceState::Running);
        let dev = r.device_handle(UART).unwrap();
        let edge = r.find_requirement(sub, dev).unwrap();
        assert_eq!(r.requirements[edge].next.caps, Capabilities::empty());
        assert_eq!(r.requirements[edge].curr.caps, RUN);
    }

    #[test]
    fn latency_picks_shallower_state() {
        let mut r = fake::registry();
        // Idle, but must be back within 100: only runtime suspend will do.
        r.set_max_latency(S1, UART, 100).unwrap();
        assert_eq!(r.device_state(UART).unwrap(), DeviceState::RuntimeSuspend);
        assert_eq!(
            r.latency_margin(UART).unwrap(),
            100 - crate::fsm::RESUME_LATENCY
        );

        // Only staying up meets 10.
        r.set_max_latency(S1, UART, 10).unwrap();
        assert_eq!(r.device_state(UART).unwrap(), DeviceState::Running);
        assert_eq!(r.latency_margin(UART).unwrap(), 10);

        r.set_max_latency(S1, UART, MAX_LATENCY).unwrap();
        assert_eq!(r.device_state(UART).unwrap(), DeviceState::Unused);
    }

    #[test]
    fn tight_margin_holds_power() {
        let mut r = fake::registry();
        // Unused can meet 350 by itself, with 50 to spare; PI takes 60 to
        // cycle, so it has to stay up.
        r.set_max_latency(S1, UART, 350).unwrap();
        assert_eq!(r.device_state(UART).unwrap(), DeviceState::Unused);
        assert_eq!(r.latency_margin(UART).unwrap(), 50);
        assert_eq!(r.power_state(PI).unwrap(), PowerState::On);
        assert_eq!(r.power_use_count(PI).unwrap(), 0);

        r.set_max_latency(S1, UART, 1000).unwrap();
        assert_eq!(r.power_state(PI).unwrap(), PowerState::Off);
    }

    #[test]
    fn accelerator_divider_follows_qos() {
        let mut r = fake::registry();
        r.request_device(S1, ACCEL, RUN, 50).unwrap();
        r.request_device(S2, ACCEL, RUN, 20).unwrap();
        assert_eq!(r.platform().last_divider(ACCEL), Some(20));

        // Below the floor.
        r.set_requirement(S2, ACCEL, RUN, 1).unwrap();
        assert_eq!(r.platform().last_divider(ACCEL), Some(fake::ACCEL_FLOOR));

        r.release_device(S2, ACCEL).unwrap();
        assert_eq!(r.platform().last_divider(ACCEL), Some(50));
    }

    #[test]
    fn single_state_device_accepts_anything_it_covers() {
        let mut r = fake::registry();
        r.request_device(S1, MEM, RUN, DEFAULT_QOS).unwrap();
        assert_eq!(r.device_state(MEM).unwrap(), DeviceState::Running);
        r.release_device(S1, MEM).unwrap();
        assert_eq!(r.device_state(MEM).unwrap(), DeviceState::Running);
    }

    #[test]
    fn protection_follows_allocation() {
        let mut r = fake::registry();
        r.request_device(S2, UART, RUN, DEFAULT_QOS).unwrap();
        r.release_device(S2, UART).unwrap();
        assert_eq!(windows(&r), [(UART, true), (UART, false)]);
    }

    #[test]
    fn refused_window_leaves_device_alone() {
        let mut r = fake::registry();
        r.platform_mut().settled = false;
        r.platform_mut().fail_protection = true;
        assert_eq!(
            r.request_device(S2, UART, RUN, DEFAULT_QOS),
            Err(PmError::ProtectionFailed)
        );
        assert!(!r.device_busy(UART).unwrap());
        assert_eq!(r.next_deadline(), None);
        assert!(r.platform().power_calls().is_empty());

        r.tick(1_000);
        assert_eq!(r.device_state(UART).unwrap(), DeviceState::Unused);
        let status = r.get_device_status(S2, UART).unwrap();
        assert_eq!(status.usage, Usage::empty());
        assert_eq!(status.requirement, Capabilities::empty());
    }

    #[test]
    fn failed_parked_request_closes_window() {
        let mut r = fake::registry();
        r.platform_mut().settled = false;
        r.request_device(S2, UART, RUN, DEFAULT_QOS).unwrap();
        assert!(r.device_busy(UART).unwrap());
        assert_eq!(windows(&r), [(UART, true)]);

        r.platform_mut().settled = true;
        r.platform_mut().fail_clocks = true;
        let t = r.next_deadline().unwrap();
        r.tick(t);

        assert_eq!(r.device_state(UART).unwrap(), DeviceState::Unused);
        assert_eq!(windows(&r), [(UART, true), (UART, false)]);
        let status = r.get_device_status(S2, UART).unwrap();
        assert_eq!(status.usage, Usage::empty());
        assert_eq!(status.requirement, Capabilities::empty());
        assert_eq!(r.power_use_count(PI).unwrap(), 0);
        assert_eq!(r.errors()[PmError::ClockFailed], 1);
    }

    #[test]
    fn parked_release_keeps_window_until_it_lands() {
        let mut r = fake::registry();
        r.request_device(S2, UART, RUN, DEFAULT_QOS).unwrap();
        r.platform_mut().settled = false;
        r.release_device(S2, UART).unwrap();
        assert_eq!(windows(&r), [(UART, true)]);

        r.platform_mut().settled = true;
        let t = r.next_deadline().unwrap();
        r.tick(t);
        assert_eq!(windows(&r), [(UART, true), (UART, false)]);
    }

    #[test]
    fn failed_protection_gives_device_back() {
        let mut r = fake::registry();
        r.platform_mut().fail_protection = true;
        assert_eq!(
            r.request_device(S2, UART, RUN, DEFAULT_QOS),
            Err(PmError::ProtectionFailed)
        );
        assert_eq!(r.device_state(UART).unwrap(), DeviceState::Unused);
        assert!(!r.has_users(r.device_handle(UART).unwrap()));
    }

    #[test]
    fn status_reports_usage() {
        let mut r = fake::registry();
        r.request_device(S1, DZ, RUN, DEFAULT_QOS).unwrap();
        let s1 = r.get_device_status(S1, DZ).unwrap();
        assert_eq!(s1.device_state(), Some(DeviceState::Running));
        assert_eq!(s1.requirement, RUN);
        assert_eq!(s1.usage, Usage::CURRENT_SUBSYSTEM);

        r.request_device(S2, DZ, RUN, DEFAULT_QOS).unwrap();
        let s2 = r.get_device_status(S2, DZ).unwrap();
        assert_eq!(
            s2.usage,
            Usage::CURRENT_SUBSYSTEM | Usage::OTHER_SUBSYSTEM
        );
        let s3 = r.get_device_status(S3, DZ).unwrap();
        assert_eq!(s3.usage, Usage::OTHER_SUBSYSTEM);
    }

    #[test]
    fn parked_release_frees_edge_on_completion() {
        let mut r = fake::registry();
        r.request_device(S1, UART, RUN, DEFAULT_QOS).unwrap();
        r.platform_mut().settled = false;

        r.release_device(S1, UART).unwrap();
        assert!(r.device_busy(UART).unwrap());
        assert_eq!(
            r.request_device(S2, UART, RUN, DEFAULT_QOS),
            Err(PmError::Busy)
        );

        r.platform_mut().settled = true;
        let t = r.next_deadline().unwrap();
        r.tick(t);
        assert_eq!(r.device_state(UART).unwrap(), DeviceState::Unused);
        assert!(!r.has_users(r.device_handle(UART).unwrap()));
    }

    fn caps_strategy() -> impl Strategy<Value = Capabilities> {
        prop_oneof![
            Just(Capabilities::empty()),
            Just(Capabilities::UNUSABLE),
            Just(Capabilities::ACCESS),
            Just(Capabilities::ACCESS | Capabilities::CONTEXT),
            Just(Capabilities::MAX),
        ]
    }

    #[derive(Clone, Debug)]
    enum Op {
        Request(usize, Capabilities),
        Set(usize, Capabilities),
        Release(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..3usize, caps_strategy()).prop_map(|(s, c)| Op::Request(s, c)),
            (0..3usize, caps_strategy()).prop_map(|(s, c)| Op::Set(s, c)),
            (0..3usize).prop_map(Op::Release),
        ]
    }

    proptest! {
        #[test]
        fn arbitration_invariants(ops in prop::collection::vec(op_strategy(), 1..24)) {
            let mut r = fake::registry();
            let subs = [S1, S2, S3];
            let devices = [UART, DY, DZ];

            for op in ops {
                for dev in devices {
                    let _ = match op {
                        Op::Request(s, caps) => {
                            r.request_device(subs[s], dev, caps, DEFAULT_QOS)
                        }
                        Op::Set(s, caps) => {
                            r.set_requirement(subs[s], dev, caps, DEFAULT_QOS)
                        }
                        Op::Release(s) => r.release_device(subs[s], dev),
                    };
                }

                for dev in devices {
                    let h = r.device_handle(dev).unwrap();
                    let d = &r.devices[h];
                    // Settled in a table state whose ceiling covers the
                    // union of what everyone holds.
                    prop_assert!(!d.is_busy());
                    prop_assert!(d.fsm.contains(d.node.state));
                    let ceiling = d.fsm.ceiling(d.node.state).unwrap();
                    let held = r.aggregate_caps(h) & Capabilities::STATE_MASK;
                    prop_assert!(ceiling.contains(held));
                    // And the cheapest such state, with no latency asked.
                    let lowest = d.fsm.lowest_state_with(held).unwrap();
                    prop_assert_eq!(d.fsm.states[lowest].state, d.node.state);
                }

                // PI's users are exactly its powered devices.
                let powered = r
                    .devices
                    .iter()
                    .filter(|(_, d)| {
                        d.power == Some(r.power_handle(PI).unwrap()) && d.hw.powered
                    })
                    .count() as u32;
                let pi = r.power_handle(PI).unwrap();
                let children_on = r
                    .power
                    .iter()
                    .filter(|(_, p)| p.parent == Some(pi) && p.is_on())
                    .count() as u32;
                prop_assert_eq!(r.power_use_count(PI).unwrap(), powered + children_on);
                prop_assert_eq!(
                    r.power_state(PI).unwrap() == PowerState::On,
                    powered + children_on > 0
                );
            }
        }

        #[test]
        fn request_then_release_restores_state(
            caps in caps_strategy(),
            qos in 1u32..200,
        ) {
            let mut r = fake::registry();
            let before = r.device_state(UART).unwrap();
            r.request_device(S1, UART, caps, qos).unwrap();
            r.release_device(S1, UART).unwrap();
            prop_assert_eq!(r.device_state(UART).unwrap(), before);
            prop_assert_eq!(r.power_state(PI).unwrap(), PowerState::Off);
        }
    }
}
