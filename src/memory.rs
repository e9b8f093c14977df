//! Main memory: a trivial echo sink that closes the request loop so the bus
//! can deliver a line that no peer cache could supply. Block data itself is
//! never simulated, only addresses and coherence state, so there is no byte
//! array or dirty bitmap to model here.

use log::trace;

use crate::event::BusEvent;

pub struct Memory;

impl Memory {
    pub fn new() -> Self {
        Memory
    }

    /// Answer a request forwarded by the bus with a reply of the same kind,
    /// address, pid, and transaction id.
    pub fn on_request(&mut self, ev: BusEvent) -> BusEvent {
        trace!("memory: servicing {:?} {:#x} for {}", ev.kind, ev.addr, ev.pid);
        ev
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}
