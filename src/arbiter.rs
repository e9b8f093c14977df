//! Bus arbiter: serialises access to the shared bus under a FIFO or
//! round-robin policy, granting up to `max_bus_transactions` concurrently.

use std::collections::VecDeque;

use log::{debug, trace};

use crate::event::{ArbEvent, ArbEventKind, Pid};

/// Arbitration discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbPolicy {
    Fifo,
    RoundRobin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArbiterConfig {
    pub processor_num: u16,
    pub policy: ArbPolicy,
    /// How many caches may hold a live grant at once.
    pub max_bus_transactions: usize,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        ArbiterConfig {
            processor_num: 1,
            policy: ArbPolicy::Fifo,
            max_bus_transactions: 1,
        }
    }
}

/// Serialises bus access. Tracks pending acquire requests and which pids
/// currently hold a grant; on release, re-runs selection to fill any freed
/// slot.
pub struct Arbiter {
    processor_num: u16,
    policy: ArbPolicy,
    max_bus_transactions: usize,

    pending: VecDeque<Pid>,
    granted: Vec<Pid>,
    next_pid: Pid,

    grants_num: Vec<u64>,
}

impl Arbiter {
    pub fn new(config: ArbiterConfig) -> Self {
        Arbiter {
            processor_num: config.processor_num,
            policy: config.policy,
            max_bus_transactions: config.max_bus_transactions.max(1),
            pending: VecDeque::new(),
            granted: Vec::new(),
            next_pid: 0,
            grants_num: vec![0; config.processor_num as usize],
        }
    }

    /// Per-pid accumulated grant counts, reported at shutdown.
    pub fn grants_num(&self) -> &[u64] {
        &self.grants_num
    }

    pub fn live_grants(&self) -> &[Pid] {
        &self.granted
    }

    /// Handle an AC (acquire) or RL (release) event from a cache.
    pub fn handle_event(&mut self, ev: ArbEvent) -> Vec<ArbEvent> {
        match ev.kind {
            ArbEventKind::Ac => {
                trace!("arbiter: AC from {}", ev.pid);
                self.pending.push_back(ev.pid);
            }
            ArbEventKind::Rl => {
                trace!("arbiter: RL from {}", ev.pid);
                self.granted.retain(|&p| p != ev.pid);
            }
        }
        self.fill_grants()
    }

    fn fill_grants(&mut self) -> Vec<ArbEvent> {
        let mut grants = Vec::new();
        while self.granted.len() < self.max_bus_transactions {
            let Some(pid) = self.next_grantee() else {
                break;
            };
            self.granted.push(pid);
            self.grants_num[pid as usize] += 1;
            debug!("arbiter: granted access to {}", pid);
            grants.push(ArbEvent::new(ArbEventKind::Ac, pid));
        }
        grants
    }

    /// Pop and return the next pid to grant, per the configured policy.
    fn next_grantee(&mut self) -> Option<Pid> {
        match self.policy {
            ArbPolicy::Fifo => self.pending.pop_front(),
            ArbPolicy::RoundRobin => self.next_round_robin(),
        }
    }

    /// Scan `pending` for an entry whose pid matches the cursor, advancing
    /// the cursor each attempt; wraps until either a match is found or
    /// every pid has been tried once.
    fn next_round_robin(&mut self) -> Option<Pid> {
        if self.pending.is_empty() {
            return None;
        }
        for _ in 0..self.processor_num {
            if let Some(idx) = self.pending.iter().position(|&p| p == self.next_pid) {
                let pid = self.pending.remove(idx).unwrap();
                self.next_pid = (self.next_pid + 1) % self.processor_num;
                return Some(pid);
            }
            self.next_pid = (self.next_pid + 1) % self.processor_num;
        }
        None
    }
}
