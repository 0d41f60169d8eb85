//! Execution events
//!
//! Fired synchronously by the processor: `Stepping` before an instruction's
//! effect, frame and quit events during it, `Stepped` after it.

use std::sync::mpsc;

use serde::Serialize;

/// Something observable happened during execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecutionEvent {
    /// About to execute the instruction at `pc`
    Stepping {
        /// Address of the instruction
        pc: u32,
    },
    /// Finished executing an instruction
    Stepped {
        /// Address of the instruction
        old_pc: u32,
        /// Address execution continues at
        new_pc: u32,
    },
    /// A routine was entered
    FrameEntered {
        /// Routine header address
        address: u32,
        /// Caller resume address
        return_address: u32,
    },
    /// A routine returned or was unwound
    FrameExited {
        /// Routine header address
        address: u32,
        /// Caller resume address
        return_address: u32,
    },
    /// The story executed `quit` (or its main routine returned)
    Quit,
}

/// Receives execution events
pub trait ExecutionObserver {
    /// Called for every event, in order.
    fn on_event(&mut self, event: &ExecutionEvent);
}

impl<F> ExecutionObserver for F
where
    F: FnMut(&ExecutionEvent),
{
    fn on_event(&mut self, event: &ExecutionEvent) {
        self(event)
    }
}

/// Forwards events to a channel; a closed receiver is ignored.
#[derive(Debug, Clone)]
pub struct ChannelObserver(pub mpsc::Sender<ExecutionEvent>);

impl ExecutionObserver for ChannelObserver {
    fn on_event(&mut self, event: &ExecutionEvent) {
        let _ = self.0.send(*event);
    }
}

/// Handle returned when subscribing an [`ExecutionObserver`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub(crate) u32);

/// Registered execution observers
#[derive(Default)]
pub struct EventBus {
    observers: Vec<(SubscriptionId, Box<dyn ExecutionObserver>)>,
    next: u32,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl EventBus {
    /// Register an observer.
    pub fn subscribe(&mut self, observer: Box<dyn ExecutionObserver>) -> SubscriptionId {
        let id = SubscriptionId(self.next);
        self.next = self.next.wrapping_add(1);
        self.observers.push((id, observer));
        id
    }

    /// Remove an observer.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(existing, _)| *existing != id);
        before != self.observers.len()
    }

    /// Whether anyone is listening.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Deliver `event` to every observer.
    #[inline]
    pub fn emit(&mut self, event: ExecutionEvent) {
        for (_, observer) in &mut self.observers {
            observer.on_event(&event);
        }
    }
}
