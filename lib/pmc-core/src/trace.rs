// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Debug trace ring.
//!
//! A small circular buffer of recent events, kept inside the registry so it
//! can be inspected from a debugger or from tests. Each entry records the
//! source line that produced it. Consecutive identical entries from the same
//! line are folded into one, with a repeat count, so a retry loop can't wipe
//! out the interesting history.
//!
//! Entries are added with the [`trace!`](crate::trace!) macro:
//!
//! ```ignore
//! trace!(self.trace, Trace::Parked(id));
//! ```

use drv_pmc_api::{
    Capabilities, DeviceState, NodeId, NotifyEvent, PmError, SubsystemState,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Trace {
    None,
    Requested {
        subsystem: NodeId,
        device: NodeId,
        caps: Capabilities,
    },
    Released {
        subsystem: NodeId,
        device: NodeId,
    },
    Target {
        device: NodeId,
        state: DeviceState,
        margin: u32,
    },
    TransitionStart {
        device: NodeId,
        from: DeviceState,
        to: DeviceState,
    },
    Stage {
        device: NodeId,
        stage: DeviceState,
    },
    Parked(NodeId),
    TransitionDone {
        device: NodeId,
        state: DeviceState,
    },
    TransitionFailed {
        device: NodeId,
        err: PmError,
    },
    PowerUp(NodeId),
    PowerDown(NodeId),
    PowerFailed {
        node: NodeId,
        err: PmError,
    },
    LatencyHold {
        node: NodeId,
        hold: bool,
    },
    Divider {
        device: NodeId,
        divider: u32,
    },
    Delivered {
        subsystem: NodeId,
        node: NodeId,
        event: NotifyEvent,
    },
    Deferred {
        subsystem: NodeId,
        node: NodeId,
        event: NotifyEvent,
    },
    RetryArmed,
    RetryIdle,
    SuspendRequested {
        initiator: NodeId,
        target: NodeId,
    },
    Subsystem {
        subsystem: NodeId,
        state: SubsystemState,
    },
    ForcePowerDown {
        initiator: NodeId,
        node: NodeId,
    },
    ForceTimeout(NodeId),
    ForceComplete(NodeId),
    Error(PmError),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TraceEntry<T> {
    pub line: u16,
    pub generation: u16,
    pub count: u16,
    pub payload: T,
}

pub struct TraceBuf<T, const N: usize> {
    last: Option<usize>,
    buffer: [TraceEntry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> TraceBuf<T, N> {
    /// Creates an empty ring whose unused slots hold `init`.
    pub fn new(init: T) -> Self {
        Self {
            last: None,
            buffer: [TraceEntry {
                line: 0,
                generation: 0,
                count: 0,
                payload: init,
            }; N],
        }
    }

    pub fn entry(&mut self, line: u16, payload: T) {
        if let Some(prev) = self.last.map(|i| &mut self.buffer[i]) {
            let same = prev.line == line && prev.payload == payload;
            if same && prev.count < u16::MAX {
                prev.count += 1;
                return;
            }
        }

        let slot = match self.last {
            Some(i) if i + 1 < N => i + 1,
            _ => 0,
        };
        let old = &mut self.buffer[slot];
        old.generation = old.generation.wrapping_add(1);
        old.line = line;
        old.count = 1;
        old.payload = payload;
        self.last = Some(slot);
    }

    /// Most recent entry, if any.
    pub fn last(&self) -> Option<&TraceEntry<T>> {
        self.buffer.get(self.last?)
    }

    /// Populated entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &TraceEntry<T>> + '_ {
        let start = match self.last {
            Some(last) => last + 1,
            None => N,
        };
        self.buffer[start.min(N)..]
            .iter()
            .chain(self.buffer[..start.min(N)].iter())
            .filter(|e| e.count != 0)
    }
}

/// Records `$payload` in `$buf`, tagged with the current source line.
#[macro_export]
macro_rules! trace {
    ($buf:expr, $payload:expr) => {
        $buf.entry(line!() as u16, $payload)
    };
}
