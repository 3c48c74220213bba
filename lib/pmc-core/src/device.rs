// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device state engine.
//!
//! Moving a device between two settled states of its [`Fsm`](crate::Fsm) is
//! done in stages: power first, then clocks, then reset on the way up, and
//! the reverse on the way down. Each stage is started by an [`Event`] and
//! reports a [`Step`]. `NeedsCompletion` means the stage has been kicked off
//! in hardware; if the platform says it has already settled we carry on
//! immediately with a `Poll`, otherwise the transition is parked and the
//! completion-poll task picks it up on a later tick.
//!
//! Kinds of device that sequence differently (cores, programmable regions)
//! get their own event handler; everything else uses the generic one.

use drv_pmc_api::{DeviceState, NotifyEvent, PmError};

use crate::arena::Handle;
use crate::node::{DeviceKind, DeviceNode, PendingRequirement, Transition};
use crate::platform::Platform;
use crate::trace::Trace;
use crate::{trace, Registry, Task};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Event {
    /// Power, clock and release a device from scratch.
    BringupAll,
    /// Restore clocks and reset on a device that kept its power.
    BringupClkRst,
    Shutdown,
    /// Gate clocks on a running device.
    RuntimeSuspend,
    /// Hold a core while it is asked to idle ahead of a forced power-down.
    IdleRequest,
    /// The hardware finished the previous stage.
    Poll,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Step {
    Done,
    NeedsCompletion,
}

/// Event that starts the move from `from` to `to`.
fn first_event(from: DeviceState, to: DeviceState) -> Option<Event> {
    match (from, to) {
        (_, DeviceState::Unused) => Some(Event::Shutdown),
        (DeviceState::Unused, _) => Some(Event::BringupAll),
        (
            DeviceState::RuntimeSuspend | DeviceState::Initializing,
            DeviceState::Running,
        ) => Some(Event::BringupClkRst),
        (
            DeviceState::Running,
            DeviceState::RuntimeSuspend | DeviceState::Initializing,
        ) => Some(Event::RuntimeSuspend),
        (
            DeviceState::Running | DeviceState::RuntimeSuspend,
            DeviceState::PendingPowerDown,
        ) => Some(Event::IdleRequest),
        _ => None,
    }
}

impl<P: Platform> Registry<P> {
    /// Moves `dev` to `target`, which must be one of its settled states.
    ///
    /// `pending` is the requirement change that asked for this; it is undone
    /// if the transition fails after having been parked.
    pub(crate) fn change_state(
        &mut self,
        dev: Handle<DeviceNode>,
        target: DeviceState,
        pending: Option<PendingRequirement>,
    ) -> Result<Step, PmError> {
        let d = &self.devices[dev];
        if d.is_busy() {
            return Err(PmError::Busy);
        }
        let from = d.node.state;
        let id = d.node.id;

        if d.fsm.transitions.is_empty() {
            // Nothing to sequence; the state is whatever the table says.
            if !d.fsm.contains(target) {
                return Err(PmError::InvalidParam);
            }
            if from != target {
                self.devices[dev].node.state = target;
                self.notify_event(id, NotifyEvent::STATE_CHANGE);
            }
            return Ok(Step::Done);
        }
        if from == target {
            return Ok(Step::Done);
        }
        if d.fsm.transition(from, target).is_none() {
            return Err(PmError::InvalidParam);
        }
        let event = first_event(from, target).ok_or(PmError::InvalidParam)?;
        self.check_preconditions(dev, target)?;

        self.devices[dev].transition = Some(Transition {
            from,
            target,
            stage: from,
            parked: false,
            pending,
        });
        trace!(
            self.trace,
            Trace::TransitionStart {
                device: id,
                from,
                to: target,
            }
        );

        let step = match self.handle_event(dev, event) {
            Ok(step) => step,
            Err(e) => {
                self.abort_transition(dev, e);
                return Err(e);
            }
        };
        self.drive(dev, step)
    }

    /// Legality rules some kinds of device add on top of their table.
    fn check_preconditions(
        &self,
        dev: Handle<DeviceNode>,
        target: DeviceState,
    ) -> Result<(), PmError> {
        let d = &self.devices[dev];
        if d.kind == DeviceKind::Region
            && matches!(
                target,
                DeviceState::Initializing | DeviceState::Running
            )
        {
            if let Some(parent) = d.parent_region {
                let p = &self.devices[parent];
                let ready = !p.is_busy()
                    && matches!(
                        p.node.state,
                        DeviceState::Running | DeviceState::Initializing
                    );
                if !ready {
                    return Err(PmError::PreconditionFailed);
                }
            }
        }
        Ok(())
    }

    /// Keeps stepping `dev` for as long as the hardware keeps up.
    fn drive(
        &mut self,
        dev: Handle<DeviceNode>,
        mut step: Step,
    ) -> Result<Step, PmError> {
        loop {
            match step {
                Step::Done => {
                    self.complete_transition(dev);
                    return Ok(Step::Done);
                }
                Step::NeedsCompletion => {
                    let id = self.devices[dev].node.id;
                    let stage = self.transition(dev).stage;
                    if !self.platform.hardware_settled(id, stage) {
                        self.park(dev);
                        return Ok(Step::NeedsCompletion);
                    }
                    step = match self.handle_event(dev, Event::Poll) {
                        Ok(step) => step,
                        Err(e) => {
                            self.abort_transition(dev, e);
                            return Err(e);
                        }
                    };
                }
            }
        }
    }

    fn park(&mut self, dev: Handle<DeviceNode>) {
        let id = self.devices[dev].node.id;
        if let Some(t) = self.devices[dev].transition.as_mut() {
            t.parked = true;
        }
        trace!(self.trace, Trace::Parked(id));
        if !self.timers.is_armed(Task::CompletionPoll) {
            let period = self.config.completion_poll_period;
            self.timers.arm_periodic(
                Task::CompletionPoll,
                self.now + period,
                period,
            );
        }
    }

    /// Completion-poll task: gives every parked transition another go, and
    /// stops polling once none are left.
    pub(crate) fn poll_parked(&mut self) {
        for dev in self.devices.handles() {
            let parked = self.devices[dev]
                .transition
                .as_ref()
                .is_some_and(|t| t.parked);
            if !parked {
                continue;
            }
            if let Some(t) = self.devices[dev].transition.as_mut() {
                t.parked = false;
            }
            // A failure has already been traced by `abort_transition`.
            if let Err(e) = self.drive(dev, Step::NeedsCompletion) {
                self.errors[e] = self.errors[e].wrapping_add(1);
            }
        }

        let still_parked = self
            .devices
            .iter()
            .any(|(_, d)| d.transition.as_ref().is_some_and(|t| t.parked));
        if !still_parked {
            self.timers.disarm(Task::CompletionPoll);
        }
    }

    fn transition(&self, dev: Handle<DeviceNode>) -> &Transition {
        match &self.devices[dev].transition {
            Some(t) => t,
            None => panic!("no transition in flight"),
        }
    }

    fn set_stage(&mut self, dev: Handle<DeviceNode>, stage: DeviceState) {
        let id = self.devices[dev].node.id;
        if let Some(t) = self.devices[dev].transition.as_mut() {
            t.stage = stage;
        }
        trace!(self.trace, Trace::Stage { device: id, stage });
    }

    pub(crate) fn handle_event(
        &mut self,
        dev: Handle<DeviceNode>,
        event: Event,
    ) -> Result<Step, PmError> {
        match self.devices[dev].kind {
            DeviceKind::Region => self.region_event(dev, event),
            DeviceKind::Core { .. } => self.core_event(dev, event),
            DeviceKind::Generic
            | DeviceKind::Accelerator { .. }
            | DeviceKind::Memory => self.generic_event(dev, event),
        }
    }

    fn generic_event(
        &mut self,
        dev: Handle<DeviceNode>,
        event: Event,
    ) -> Result<Step, PmError> {
        let t = self.transition(dev);
        let (stage, target) = (t.stage, t.target);

        match (stage, event) {
            (DeviceState::Unused, Event::BringupAll) => {
                self.device_power_up(dev)?;
                self.set_stage(dev, DeviceState::PowerOn);
                Ok(Step::NeedsCompletion)
            }
            (DeviceState::PowerOn, Event::Poll) => {
                self.confirm_power(dev, true)?;
                if target == DeviceState::RuntimeSuspend {
                    // Come up clock-gated.
                    self.device_reset(dev, false)?;
                    self.set_stage(dev, DeviceState::ResetOff);
                } else {
                    self.device_clocks(dev, true)?;
                    self.set_stage(dev, DeviceState::ClockOn);
                }
                Ok(Step::NeedsCompletion)
            }
            (DeviceState::RuntimeSuspend, Event::BringupClkRst) => {
                self.device_clocks(dev, true)?;
                self.set_stage(dev, DeviceState::ClockOn);
                Ok(Step::NeedsCompletion)
            }
            (DeviceState::ClockOn, Event::Poll) => {
                self.device_reset(dev, false)?;
                self.set_stage(dev, DeviceState::ResetOff);
                Ok(Step::NeedsCompletion)
            }
            (DeviceState::ResetOff, Event::Poll) => Ok(Step::Done),
            (DeviceState::Running, Event::RuntimeSuspend) => {
                self.device_clocks(dev, false)?;
                self.set_stage(dev, DeviceState::ClockOff);
                Ok(Step::NeedsCompletion)
            }
            (
                DeviceState::Running | DeviceState::RuntimeSuspend,
                Event::Shutdown,
            ) => {
                self.device_reset(dev, true)?;
                self.set_stage(dev, DeviceState::ResetOn);
                Ok(Step::NeedsCompletion)
            }
            (DeviceState::ResetOn, Event::Poll) => {
                self.device_clocks(dev, false)?;
                self.set_stage(dev, DeviceState::ClockOff);
                Ok(Step::NeedsCompletion)
            }
            (DeviceState::ClockOff, Event::Poll) => {
                if target == DeviceState::RuntimeSuspend {
                    return Ok(Step::Done);
                }
                self.device_power_down(dev)?;
                self.set_stage(dev, DeviceState::PowerOff);
                Ok(Step::NeedsCompletion)
            }
            (DeviceState::PowerOff, Event::Poll) => {
                self.confirm_power(dev, false)?;
                Ok(Step::Done)
            }
            _ => Err(PmError::InvalidParam),
        }
    }

    /// Cores come up like anything else, but go down through their own
    /// power-down sequence, which takes care of clocks and reset. Holding a
    /// core for an idle request touches no hardware.
    fn core_event(
        &mut self,
        dev: Handle<DeviceNode>,
        event: Event,
    ) -> Result<Step, PmError> {
        let stage = self.transition(dev).stage;
        match (stage, event) {
            (
                DeviceState::Running | DeviceState::RuntimeSuspend,
                Event::IdleRequest,
            ) => Ok(Step::Done),
            (
                DeviceState::Running
                | DeviceState::RuntimeSuspend
                | DeviceState::PendingPowerDown,
                Event::Shutdown,
            ) => {
                let id = self.devices[dev].node.id;
                self.platform.core_power_down(id)?;
                let hw = &mut self.devices[dev].hw;
                hw.clocked = false;
                hw.out_of_reset = false;
                self.device_power_down(dev)?;
                self.set_stage(dev, DeviceState::PowerOff);
                Ok(Step::NeedsCompletion)
            }
            _ => self.generic_event(dev, event),
        }
    }

    /// Regions have no clocks or resets of their own to manage; the loader
    /// deals with the fabric. The engine only holds their power while they
    /// are in use.
    fn region_event(
        &mut self,
        dev: Handle<DeviceNode>,
        event: Event,
    ) -> Result<Step, PmError> {
        let stage = self.transition(dev).stage;
        match (stage, event) {
            (DeviceState::Unused, Event::BringupAll) => {
                self.device_power_up(dev)?;
                self.set_stage(dev, DeviceState::PowerOn);
                Ok(Step::NeedsCompletion)
            }
            (DeviceState::PowerOn, Event::Poll) => {
                self.confirm_power(dev, true)?;
                Ok(Step::Done)
            }
            (DeviceState::Initializing, Event::BringupClkRst)
            | (DeviceState::Running, Event::RuntimeSuspend) => Ok(Step::Done),
            (
                DeviceState::Initializing | DeviceState::Running,
                Event::Shutdown,
            ) => {
                self.device_power_down(dev)?;
                self.set_stage(dev, DeviceState::PowerOff);
                Ok(Step::NeedsCompletion)
            }
            (DeviceState::PowerOff, Event::Poll) => {
                self.confirm_power(dev, false)?;
                Ok(Step::Done)
            }
            _ => Err(PmError::InvalidParam),
        }
    }

    fn device_clocks(
        &mut self,
        dev: Handle<DeviceNode>,
        on: bool,
    ) -> Result<(), PmError> {
        let d = &self.devices[dev];
        if d.hw.clocked == on || d.clocks.is_empty() {
            self.devices[dev].hw.clocked = on;
            return Ok(());
        }
        let clocks = d.clocks.clone();
        if on {
            self.platform.clock_request(&clocks)?;
        } else {
            self.platform.clock_release(&clocks)?;
        }
        self.devices[dev].hw.clocked = on;
        Ok(())
    }

    fn device_reset(
        &mut self,
        dev: Handle<DeviceNode>,
        assert: bool,
    ) -> Result<(), PmError> {
        let d = &self.devices[dev];
        if d.hw.out_of_reset != assert || d.resets.is_empty() {
            self.devices[dev].hw.out_of_reset = !assert;
            return Ok(());
        }
        let resets = d.resets.clone();
        if assert {
            self.platform.reset_assert(&resets)?;
        } else {
            self.platform.reset_release(&resets)?;
        }
        self.devices[dev].hw.out_of_reset = !assert;
        Ok(())
    }

    /// Lands the transition in flight on `dev`.
    fn complete_transition(&mut self, dev: Handle<DeviceNode>) {
        let Some(t) = self.devices[dev].transition.take() else {
            return;
        };
        let d = &mut self.devices[dev];
        d.node.state = t.target;
        let id = d.node.id;
        let release = core::mem::replace(&mut d.pending_dealloc, false);
        trace!(
            self.trace,
            Trace::TransitionDone {
                device: id,
                state: t.target,
            }
        );
        self.notify_event(id, NotifyEvent::STATE_CHANGE);

        if release {
            if let Some(p) = t.pending {
                self.finalize_release(p.edge);
            }
        }
        if let Err(e) = self.update_power_hold(dev) {
            trace!(self.trace, Trace::TransitionFailed { device: id, err: e });
        }
        if core::mem::replace(&mut self.devices[dev].recheck, false) {
            self.update_status_unattended(dev);
        }
    }

    /// Re-arbitrates `dev` when no caller is waiting for the outcome. A
    /// failure is counted and traced against the device.
    pub(crate) fn update_status_unattended(&mut self, dev: Handle<DeviceNode>) {
        let r = self.update_status(dev, None);
        if let Err(err) = self.record(r) {
            let id = self.devices[dev].node.id;
            trace!(self.trace, Trace::TransitionFailed { device: id, err });
        }
    }

    /// Abandons the transition in flight on `dev` after a stage failed. A
    /// failed bring-up gives back what it had taken; the requirement change
    /// that asked for the transition is undone.
    pub(crate) fn abort_transition(&mut self, dev: Handle<DeviceNode>, err: PmError) {
        let Some(t) = self.devices[dev].transition.take() else {
            return;
        };
        let id = self.devices[dev].node.id;
        trace!(self.trace, Trace::TransitionFailed { device: id, err });

        if t.from == DeviceState::Unused {
            // Best effort; we are already failing.
            let _ = self.device_reset(dev, true);
            let _ = self.device_clocks(dev, false);
            let _ = self.device_power_down(dev);
        }

        if let Some(p) = t.pending {
            let r = &mut self.requirements[p.edge];
            r.curr = p.curr;
            r.next = p.next;
            r.latency_requested = p.latency_requested;
            if p.newly_allocated {
                self.undo_allocation(p.edge);
            }
        }
        let d = &mut self.devices[dev];
        d.pending_dealloc = false;
        d.recheck = false;
    }

    /// Starts initialization of a programmable region: it gets power and
    /// becomes a valid parent for the regions nested in it.
    pub fn region_init_start(
        &mut self,
        region: drv_pmc_api::NodeId,
    ) -> Result<(), PmError> {
        let r = self.region_change(region, DeviceState::Initializing);
        self.record(r)
    }

    /// Marks a programmable region as loaded and running.
    pub fn region_init_finish(
        &mut self,
        region: drv_pmc_api::NodeId,
    ) -> Result<(), PmError> {
        let r = self.region_change(region, DeviceState::Running);
        self.record(r)
    }

    fn region_change(
        &mut self,
        region: drv_pmc_api::NodeId,
        target: DeviceState,
    ) -> Result<(), PmError> {
        let dev = self.device_handle(region)?;
        if self.devices[dev].kind != DeviceKind::Region {
            return Err(PmError::InvalidParam);
        }
        self.change_state(dev, target, None)?;
        Ok(())
    }
}
