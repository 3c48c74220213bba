// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Event delivery to subsystems.
//!
//! Subsystems subscribe to events on devices and power nodes. When an event
//! fires, each subscriber whose channel is ready gets a [`Callback`] right
//! away; the others have the event folded into a pending mask and the retry
//! task is armed. The retry task also carries suspend requests and forced
//! power-down acknowledgements that could not be sent when they were raised.
//! It keeps running until one pass finds nothing left to send.
//!
//! Offline subscribers only receive the events they registered with `wake`;
//! anything else waits until they come back online.

use drv_pmc_api::{
    serialize_callback, Callback, NodeClass, NodeId, NotifyEvent, PmError,
    SubsystemState,
};
use hubpack::SerializedSize;

use crate::arena::Handle;
use crate::node::Subsystem;
use crate::platform::{ChannelId, Platform};
use crate::trace::Trace;
use crate::{trace, Registry, Task, MAX_SUBSCRIPTIONS};

#[derive(Copy, Clone, Debug)]
pub(crate) struct Subscription {
    pub subsystem: Handle<Subsystem>,
    pub node: NodeId,
    pub events: NotifyEvent,
    /// Events delivered even while the subscriber is offline.
    pub wake: NotifyEvent,
    /// Events that fired but haven't been delivered yet.
    pub pending: NotifyEvent,
}

pub(crate) struct Notifier {
    pub slots: [Option<Subscription>; MAX_SUBSCRIPTIONS],
}

impl Notifier {
    pub const fn new() -> Self {
        Self {
            slots: [None; MAX_SUBSCRIPTIONS],
        }
    }

    fn find(&self, sub: Handle<Subsystem>, node: NodeId) -> Option<usize> {
        self.slots.iter().position(|s| {
            s.as_ref()
                .is_some_and(|s| s.subsystem == sub && s.node == node)
        })
    }

    /// Drops every subscription held by `sub`.
    pub fn forget(&mut self, sub: Handle<Subsystem>) {
        for slot in &mut self.slots {
            if slot.as_ref().is_some_and(|s| s.subsystem == sub) {
                *slot = None;
            }
        }
    }
}

/// Callbacks a subsystem may have waiting for its channel.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Outbox {
    Suspend,
    Ack,
}

impl Subsystem {
    fn outbox(&mut self, which: Outbox) -> &mut Option<Callback> {
        match which {
            Outbox::Suspend => &mut self.pending_suspend,
            Outbox::Ack => &mut self.pending_ack,
        }
    }
}

impl<P: Platform> Registry<P> {
    /// Subscribes `subsystem` to `event` on `node`. Registering again for the
    /// same node adds to the existing subscription.
    pub fn register_notifier(
        &mut self,
        subsystem: NodeId,
        node: NodeId,
        event: NotifyEvent,
        wake: bool,
    ) -> Result<(), PmError> {
        let r = self.register_inner(subsystem, node, event, wake);
        self.record(r)
    }

    fn register_inner(
        &mut self,
        subsystem: NodeId,
        node: NodeId,
        event: NotifyEvent,
        wake: bool,
    ) -> Result<(), PmError> {
        let sub = self.subsystem_handle(subsystem)?;
        match node.class() {
            Some(NodeClass::Device) => {
                self.device_handle(node)?;
            }
            Some(NodeClass::Power) => {
                self.power_handle(node)?;
            }
            _ => return Err(PmError::InvalidNode),
        }
        if event.bits().count_ones() != 1 || !NotifyEvent::all().contains(event)
        {
            return Err(PmError::InvalidParam);
        }
        let wake = if wake { event } else { NotifyEvent::empty() };

        if let Some(i) = self.notifier.find(sub, node) {
            if let Some(s) = self.notifier.slots[i].as_mut() {
                s.events |= event;
                s.wake |= wake;
            }
            return Ok(());
        }
        let slot = self
            .notifier
            .slots
            .iter_mut()
            .find(|s| s.is_none())
            .ok_or(PmError::NoFreeSlot)?;
        *slot = Some(Subscription {
            subsystem: sub,
            node,
            events: event,
            wake,
            pending: NotifyEvent::empty(),
        });
        Ok(())
    }

    /// Drops `event` from the subscription of `subsystem` on `node`. The
    /// subscription goes away with its last event.
    pub fn unregister_notifier(
        &mut self,
        subsystem: NodeId,
        node: NodeId,
        event: NotifyEvent,
    ) -> Result<(), PmError> {
        let r = self.unregister_inner(subsystem, node, event);
        self.record(r)
    }

    fn unregister_inner(
        &mut self,
        subsystem: NodeId,
        node: NodeId,
        event: NotifyEvent,
    ) -> Result<(), PmError> {
        let sub = self.subsystem_handle(subsystem)?;
        let i = self
            .notifier
            .find(sub, node)
            .ok_or(PmError::InvalidParam)?;
        if let Some(s) = self.notifier.slots[i].as_mut() {
            s.events.remove(event);
            s.wake.remove(event);
            s.pending.remove(event);
            if s.events.is_empty() {
                self.notifier.slots[i] = None;
            }
        }
        Ok(())
    }

    /// Events on `node` still waiting to be delivered to `subsystem`.
    pub fn pending_events(
        &self,
        subsystem: NodeId,
        node: NodeId,
    ) -> Result<NotifyEvent, PmError> {
        let sub = self.subsystem_handle(subsystem)?;
        let i = self
            .notifier
            .find(sub, node)
            .ok_or(PmError::InvalidParam)?;
        Ok(self.notifier.slots[i]
            .map_or(NotifyEvent::empty(), |s| s.pending))
    }

    /// Announces `event` on `node` to everyone subscribed to it.
    pub(crate) fn notify_event(&mut self, node: NodeId, event: NotifyEvent) {
        let mut deferred = false;
        for i in 0..MAX_SUBSCRIPTIONS {
            let Some(s) = self.notifier.slots[i] else {
                continue;
            };
            let hit = s.events & event;
            if s.node != node || hit.is_empty() {
                continue;
            }
            let left = self.deliver(&s, hit);
            if !left.is_empty() {
                if let Some(slot) = self.notifier.slots[i].as_mut() {
                    slot.pending |= left;
                }
                deferred = true;
            }
        }
        if deferred {
            self.arm_retry();
        }
    }

    /// Tries to hand `events` to the subscriber of `s`, returning whatever
    /// could not be sent.
    fn deliver(&mut self, s: &Subscription, events: NotifyEvent) -> NotifyEvent {
        let Some(sub) = self.subsystems.get(s.subsystem) else {
            return events;
        };
        let (id, channel) = (sub.id, sub.channel);
        let now = if sub.state == SubsystemState::Offline {
            events & s.wake
        } else {
            events
        };

        let msg = Callback::Notify {
            node: s.node,
            event: now,
            state: self.node_state(s.node),
        };
        let sent = !now.is_empty()
            && self.platform.channel_ready(channel)
            && self.send_callback(channel, &msg).is_ok();

        if sent {
            trace!(
                self.trace,
                Trace::Delivered {
                    subsystem: id,
                    node: s.node,
                    event: now,
                }
            );
            events.difference(now)
        } else {
            trace!(
                self.trace,
                Trace::Deferred {
                    subsystem: id,
                    node: s.node,
                    event: events,
                }
            );
            events
        }
    }

    /// Parks `msg` in one of the outboxes of `sub` and tries to send it.
    /// Anything left there is picked up by the retry task.
    pub(crate) fn queue_callback(
        &mut self,
        sub: Handle<Subsystem>,
        which: Outbox,
        msg: Callback,
    ) {
        *self.subsystems[sub].outbox(which) = Some(msg);
        if self.flush_outbox(sub, which) {
            self.arm_retry();
        }
    }

    /// Sends whatever waits in an outbox of `sub`. Returns whether something
    /// is still waiting.
    fn flush_outbox(&mut self, sub: Handle<Subsystem>, which: Outbox) -> bool {
        let s = &mut self.subsystems[sub];
        let channel = s.channel;
        let Some(msg) = *s.outbox(which) else {
            return false;
        };
        if !self.platform.channel_ready(channel) {
            return true;
        }
        if self.send_callback(channel, &msg).is_err() {
            return true;
        }
        *self.subsystems[sub].outbox(which) = None;
        false
    }

    /// Retry task: one pass over everything that is waiting for a channel.
    pub(crate) fn retry_deliveries(&mut self) {
        let mut outstanding = false;

        for i in 0..MAX_SUBSCRIPTIONS {
            let Some(s) = self.notifier.slots[i] else {
                continue;
            };
            if s.pending.is_empty() {
                continue;
            }
            let left = self.deliver(&s, s.pending);
            if let Some(slot) = self.notifier.slots[i].as_mut() {
                slot.pending = left;
            }
            outstanding |= !left.is_empty();
        }

        for sub in self.subsystems.handles() {
            for which in [Outbox::Suspend, Outbox::Ack] {
                outstanding |= self.flush_outbox(sub, which);
            }
        }

        if !outstanding {
            self.timers.disarm(Task::NotifierRetry);
            trace!(self.trace, Trace::RetryIdle);
        }
    }

    fn arm_retry(&mut self) {
        if self.timers.is_armed(Task::NotifierRetry) {
            return;
        }
        let period = self.config.notifier_retry_period;
        self.timers
            .arm_periodic(Task::NotifierRetry, self.now + period, period);
        trace!(self.trace, Trace::RetryArmed);
    }

    fn send_callback(
        &mut self,
        channel: ChannelId,
        msg: &Callback,
    ) -> Result<(), PmError> {
        let mut buf = [0; Callback::MAX_SIZE];
        let n = serialize_callback(&mut buf, msg)
            .map_err(|_| PmError::ChannelFailed)?;
        self.platform.channel_send(channel, &buf[..n])
    }

    /// State reported alongside an event on `node`.
    pub(crate) fn node_state(&self, node: NodeId) -> u32 {
        if let Ok(dev) = self.device_handle(node) {
            self.devices[dev].node.state as u32
        } else if let Ok(power) = self.power_handle(node) {
            self.power[power].node.state as u32
        } else if let Ok(sub) = self.subsystem_handle(node) {
            self.subsystems[sub].state as u32
        } else {
            0
        }
    }
}
