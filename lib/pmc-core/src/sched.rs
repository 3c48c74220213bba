// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deferred-work timers.
//!
//! The core has a handful of deferred jobs (notifier retries, completion
//! polls for devices waiting on hardware, forced power-down timeouts). Each
//! kind of job gets one timer, keyed by a variant of an `Enum`-deriving type.
//! The owner feeds the current time in through `advance`, then drains what
//! came due with `take_due`.
//!
//! The scheduler does not own a clock. Whoever drives the registry decides
//! what a tick is; `next_deadline` tells them when the next one is needed.

use enum_map::{EnumArray, EnumMap};

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Slot {
    deadline: Option<u64>,
    /// Re-arm this far past the time the timer was found expired.
    period: Option<u64>,
    /// Expired and not yet handed out by `take_due`.
    due: bool,
}

pub struct Scheduler<E: EnumArray<Slot>> {
    slots: EnumMap<E, Slot>,
}

impl<E: EnumArray<Slot> + Copy> Default for Scheduler<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: EnumArray<Slot> + Copy> Scheduler<E> {
    pub fn new() -> Self {
        Self {
            slots: EnumMap::default(),
        }
    }

    /// Arms `which` to expire once, at `at`.
    pub fn arm(&mut self, which: E, at: u64) {
        let slot = &mut self.slots[which];
        slot.deadline = Some(at);
        slot.period = None;
    }

    /// Arms `which` to expire at `at` and then every `period` after each
    /// expiry is noticed, until disarmed.
    pub fn arm_periodic(&mut self, which: E, at: u64, period: u64) {
        let slot = &mut self.slots[which];
        slot.deadline = Some(at);
        slot.period = Some(period);
    }

    /// Disarms `which`, returning whether it was armed. An expiry that
    /// hasn't been taken yet is kept.
    pub fn disarm(&mut self, which: E) -> bool {
        let slot = &mut self.slots[which];
        slot.period = None;
        slot.deadline.take().is_some()
    }

    pub fn is_armed(&self, which: E) -> bool {
        self.slots[which].deadline.is_some()
    }

    pub fn deadline(&self, which: E) -> Option<u64> {
        self.slots[which].deadline
    }

    /// Earliest deadline among armed timers.
    pub fn next_deadline(&self) -> Option<u64> {
        self.slots.values().filter_map(|s| s.deadline).min()
    }

    /// Marks every timer whose deadline is at or before `now` as due. A
    /// periodic timer is re-armed one period after `now`; a one-shot timer
    /// is disarmed.
    pub fn advance(&mut self, now: u64) {
        for slot in self.slots.values_mut() {
            match slot.deadline {
                Some(at) if at <= now => {
                    slot.deadline =
                        slot.period.map(|p| now.saturating_add(p));
                    slot.due = true;
                }
                _ => (),
            }
        }
    }

    /// Hands out each due timer once, in declaration order of `E`. Several
    /// expiries since the last call show up as one.
    pub fn take_due(&mut self) -> impl Iterator<Item = E> + '_ {
        self.slots
            .iter_mut()
            .filter_map(|(e, slot)| core::mem::take(&mut slot.due).then_some(e))
    }
}
