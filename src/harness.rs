//! Single-threaded event dispatch loop and component arena.
//!
//! The cache/arbiter/bus/memory modules never call each other directly —
//! each handler returns the actions it wants taken, and this harness drains
//! a central queue, routing each action to the right peer by index. One
//! event is fully drained, including everything it cascades into, before
//! the next `submit` call returns.

use std::collections::VecDeque;

use log::trace;

use crate::arbiter::{Arbiter, ArbiterConfig};
use crate::bus::{Bus, BusConfig, BusOutput};
use crate::cache::{BusCompletion, Cache, CacheAction, CacheConfig};
use crate::error::Result;
use crate::event::{ArbEvent, BusEvent, BusEventKind, Pid, ProcessorCompletion};
use crate::memory::Memory;

/// One hop in the simulation: either a control message bound for the
/// arbiter, a transaction/reply bound for the bus, or a delivery bound for
/// a specific cache.
enum Msg {
    ToArbiter(ArbEvent),
    ArbiterGrant(ArbEvent),
    ToBus(BusEvent),
    Snoop { target: Pid, event: BusEvent },
    Completion { target: Pid, completion: BusCompletion },
    ToMemory(BusEvent),
    MemoryReply(BusEvent),
}

/// A processor op that finished, as reported back out of the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub pid: Pid,
    pub completion: ProcessorCompletion,
}

/// Owns every component and the single queue that connects them.
pub struct Harness {
    caches: Vec<Cache>,
    arbiter: Arbiter,
    bus: Bus,
    memory: Memory,
    queue: VecDeque<Msg>,
    completions: Vec<Completion>,
}

impl Harness {
    pub fn new(cache_configs: Vec<CacheConfig>, arbiter_config: ArbiterConfig, bus_config: BusConfig) -> Result<Self> {
        let caches = cache_configs
            .into_iter()
            .enumerate()
            .map(|(i, cfg)| Cache::new(i as Pid, cfg))
            .collect::<Result<Vec<_>>>()?;

        Ok(Harness {
            caches,
            arbiter: Arbiter::new(arbiter_config),
            bus: Bus::new(bus_config),
            memory: Memory::new(),
            queue: VecDeque::new(),
            completions: Vec::new(),
        })
    }

    pub fn cache_count(&self) -> usize {
        self.caches.len()
    }

    pub fn caches(&self) -> &[Cache] {
        &self.caches
    }

    pub fn arbiter(&self) -> &Arbiter {
        &self.arbiter
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Whether every transaction and message has been fully resolved.
    pub fn is_quiescent(&self) -> bool {
        self.queue.is_empty() && self.bus.is_quiescent()
    }

    /// Feed one processor-issued read or write to `pid`'s cache, and drain
    /// everything it cascades into before returning.
    pub fn submit(&mut self, pid: Pid, kind: BusEventKind, addr: u64) -> Result<()> {
        trace!("harness: submit {:?} {:#x} to cache {}", kind, addr, pid);
        let actions = self.caches[pid as usize].on_processor_op(kind, addr)?;
        self.enqueue_cache_actions(pid, actions);
        self.drain()
    }

    /// Take and clear every processor completion recorded since the last
    /// call.
    pub fn take_completions(&mut self) -> Vec<Completion> {
        std::mem::take(&mut self.completions)
    }

    fn enqueue_cache_actions(&mut self, from: Pid, actions: Vec<CacheAction>) {
        for action in actions {
            match action {
                CacheAction::RequestBus(ev) | CacheAction::ReleaseBus(ev) => {
                    self.queue.push_back(Msg::ToArbiter(ev));
                }
                CacheAction::SendToBus(ev) | CacheAction::SnoopReply(ev) => {
                    self.queue.push_back(Msg::ToBus(ev));
                }
                CacheAction::Complete(completion) => {
                    self.completions.push(Completion { pid: from, completion });
                }
            }
        }
    }

    fn enqueue_bus_outputs(&mut self, outputs: Vec<BusOutput>) {
        for output in outputs {
            match output {
                BusOutput::Snoop { target, event } => self.queue.push_back(Msg::Snoop { target, event }),
                BusOutput::DeliverCompletion { target, completion } => {
                    self.queue.push_back(Msg::Completion { target, completion })
                }
                BusOutput::ForwardToMemory(ev) => self.queue.push_back(Msg::ToMemory(ev)),
            }
        }
    }

    fn drain(&mut self) -> Result<()> {
        while let Some(msg) = self.queue.pop_front() {
            match msg {
                Msg::ToArbiter(ev) => {
                    let grants = self.arbiter.handle_event(ev);
                    for grant in grants {
                        self.queue.push_back(Msg::ArbiterGrant(grant));
                    }
                }
                Msg::ArbiterGrant(ev) => {
                    let pid = ev.pid;
                    let actions = self.caches[pid as usize].on_arbiter_grant(ev)?;
                    self.enqueue_cache_actions(pid, actions);
                }
                Msg::ToBus(ev) => {
                    let outputs = self.bus.on_cache_event(ev);
                    self.enqueue_bus_outputs(outputs);
                }
                Msg::Snoop { target, event } => {
                    let actions = self.caches[target as usize].on_bus_snoop(&event)?;
                    self.enqueue_cache_actions(target, actions);
                }
                Msg::Completion { target, completion } => {
                    let actions = self.caches[target as usize].on_bus_completion(&completion)?;
                    self.enqueue_cache_actions(target, actions);
                }
                Msg::ToMemory(ev) => {
                    let reply = self.memory.on_request(ev);
                    self.queue.push_back(Msg::MemoryReply(reply));
                }
                Msg::MemoryReply(ev) => {
                    let outputs = self.bus.on_memory_reply(ev);
                    self.enqueue_bus_outputs(outputs);
                }
            }
        }
        Ok(())
    }
}
