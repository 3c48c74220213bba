// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Declarative device state tables.
//!
//! An [`Fsm`] lists the settled states a kind of device can occupy, ordered
//! from least to most capable, together with the capability ceiling of each
//! state and the transitions between them with their worst-case latency. The
//! last state in the list is the "highest" state; wakeup latency is always
//! measured towards it.

use drv_pmc_api::{Capabilities, DeviceState, PmError, MAX_LATENCY};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StateCap {
    pub state: DeviceState,
    pub caps: Capabilities,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StateTransition {
    pub from: DeviceState,
    pub to: DeviceState,
    pub latency: u32,
}

#[derive(Debug)]
pub struct Fsm {
    pub states: &'static [StateCap],
    pub transitions: &'static [StateTransition],
}

impl Fsm {
    pub fn contains(&self, state: DeviceState) -> bool {
        self.states.iter().any(|s| s.state == state)
    }

    /// State a device of this kind starts out in.
    pub fn initial(&self) -> Option<DeviceState> {
        self.states.first().map(|s| s.state)
    }

    pub fn highest(&self) -> Option<DeviceState> {
        self.states.last().map(|s| s.state)
    }

    pub fn ceiling(&self, state: DeviceState) -> Option<Capabilities> {
        self.states.iter().find(|s| s.state == state).map(|s| s.caps)
    }

    pub fn transition(
        &self,
        from: DeviceState,
        to: DeviceState,
    ) -> Option<&StateTransition> {
        self.transitions.iter().find(|t| t.from == from && t.to == to)
    }

    /// Index of the first (cheapest) state whose ceiling covers `caps`.
    pub fn lowest_state_with(&self, caps: Capabilities) -> Option<usize> {
        self.states.iter().position(|s| s.caps.contains(caps))
    }

    /// Picks the first state in table order that covers `caps` and can get
    /// back to the highest state within `max_wakeup`, along with that wakeup
    /// time. The search never goes below the cheapest covering state.
    ///
    /// In a table whose ceilings never shrink going up, the highest state
    /// covers anything a lower one does and has no wakeup time, so
    /// `LatencyConflict` can only come from a table that breaks that rule.
    pub fn select(
        &self,
        caps: Capabilities,
        max_wakeup: u32,
    ) -> Result<(DeviceState, u32), PmError> {
        let start = self.lowest_state_with(caps).ok_or(PmError::Conflict)?;
        self.states[start..]
            .iter()
            .filter(|s| s.caps.contains(caps))
            .map(|s| (s.state, self.latency_to_highest(s.state)))
            .find(|&(_, wakeup)| wakeup <= max_wakeup)
            .ok_or(PmError::LatencyConflict)
    }

    /// Worst-case time to get from `state` to the highest state. A state with
    /// no declared way up is treated as infinitely slow.
    pub fn latency_to_highest(&self, state: DeviceState) -> u32 {
        match self.highest() {
            Some(top) if top == state => 0,
            Some(top) => self
                .transition(state, top)
                .map_or(MAX_LATENCY, |t| t.latency),
            None => MAX_LATENCY,
        }
    }
}

const UNUSED: StateCap = StateCap {
    state: DeviceState::Unused,
    caps: Capabilities::empty(),
};
const RUNTIME_SUSPEND: StateCap = StateCap {
    state: DeviceState::RuntimeSuspend,
    caps: Capabilities::UNUSABLE,
};
const RUNNING: StateCap = StateCap {
    state: DeviceState::Running,
    caps: Capabilities::MAX.union(Capabilities::UNUSABLE),
};

/// Full bring-up: power, clocks, then reset.
pub const BRINGUP_LATENCY: u32 = 300;
/// Ungating clocks of a runtime-suspended device.
pub const RESUME_LATENCY: u32 = 30;
pub const DEFAULT_LATENCY: u32 = 0;

const fn tr(from: DeviceState, to: DeviceState, latency: u32) -> StateTransition {
    StateTransition { from, to, latency }
}

pub static GENERIC: Fsm = Fsm {
    states: &[UNUSED, RUNTIME_SUSPEND, RUNNING],
    transitions: &[
        tr(DeviceState::Running, DeviceState::Unused, DEFAULT_LATENCY),
        tr(DeviceState::Unused, DeviceState::Running, BRINGUP_LATENCY),
        tr(DeviceState::RuntimeSuspend, DeviceState::Unused, DEFAULT_LATENCY),
        tr(DeviceState::RuntimeSuspend, DeviceState::Running, RESUME_LATENCY),
        tr(DeviceState::Unused, DeviceState::RuntimeSuspend, BRINGUP_LATENCY),
        tr(DeviceState::Running, DeviceState::RuntimeSuspend, DEFAULT_LATENCY),
    ],
};

/// Processor cores. Same as generic devices, plus the state a core sits in
/// while it is being asked to idle ahead of a forced power-down. Arbitration
/// never picks that state: the runtime-suspend state ahead of it covers the
/// same capabilities.
pub static CORE: Fsm = Fsm {
    states: &[
        UNUSED,
        RUNTIME_SUSPEND,
        StateCap {
            state: DeviceState::PendingPowerDown,
            caps: Capabilities::UNUSABLE,
        },
        RUNNING,
    ],
    transitions: &[
        tr(DeviceState::Running, DeviceState::Unused, DEFAULT_LATENCY),
        tr(DeviceState::Unused, DeviceState::Running, BRINGUP_LATENCY),
        tr(DeviceState::RuntimeSuspend, DeviceState::Unused, DEFAULT_LATENCY),
        tr(DeviceState::RuntimeSuspend, DeviceState::Running, RESUME_LATENCY),
        tr(DeviceState::Unused, DeviceState::RuntimeSuspend, BRINGUP_LATENCY),
        tr(DeviceState::Running, DeviceState::RuntimeSuspend, DEFAULT_LATENCY),
        tr(DeviceState::Running, DeviceState::PendingPowerDown, DEFAULT_LATENCY),
        tr(
            DeviceState::RuntimeSuspend,
            DeviceState::PendingPowerDown,
            DEFAULT_LATENCY,
        ),
        tr(DeviceState::PendingPowerDown, DeviceState::Unused, DEFAULT_LATENCY),
    ],
};

/// Programmable-logic regions. A region has to be initialized (by whoever
/// loads it) before it can run, so there is no direct way from unused to
/// running.
pub static REGION: Fsm = Fsm {
    states: &[
        UNUSED,
        StateCap {
            state: DeviceState::Initializing,
            caps: Capabilities::UNUSABLE,
        },
        StateCap {
            state: DeviceState::Running,
            caps: Capabilities::ACCESS
                .union(Capabilities::CONTEXT)
                .union(Capabilities::UNUSABLE),
        },
    ],
    transitions: &[
        tr(DeviceState::Unused, DeviceState::Initializing, DEFAULT_LATENCY),
        tr(DeviceState::Initializing, DeviceState::Running, DEFAULT_LATENCY),
        tr(DeviceState::Initializing, DeviceState::Unused, DEFAULT_LATENCY),
        tr(DeviceState::Running, DeviceState::Initializing, DEFAULT_LATENCY),
        tr(DeviceState::Running, DeviceState::Unused, DEFAULT_LATENCY),
    ],
};

/// Always-on blocks (memories and the like) with nothing to sequence.
pub static SINGLE_STATE: Fsm = Fsm {
    states: &[RUNNING],
    transitions: &[],
};
