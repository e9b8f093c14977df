//! In-process synthetic workloads: sequential, random, thread-unique-chunk,
//! shared-chunk, and false-sharing access patterns.
//!
//! Each phase interleaves every cache's share of the phase's accesses
//! round-robin rather than running caches concurrently, matching the
//! harness's single-threaded dispatch loop. This is a demo workload
//! driver, not a trace-file reader — trace parsing is out of scope.

use chrono::Utc;
use rand::Rng;

use crate::error::Result;
use crate::event::{BusEventKind, Pid};
use crate::harness::Harness;

/// One named phase of the workload, reported with its wall-clock duration.
#[derive(Debug, Clone)]
pub struct PhaseReport {
    pub name: &'static str,
    pub elapsed_ms: i64,
    pub ops: usize,
}

/// Drives a fixed sequence of access patterns across every cache in
/// `harness`, returning a timed report per phase.
pub struct DemoWorkload {
    num_caches: u16,
    ops_per_phase: usize,
    chunk_size: u64,
}

impl DemoWorkload {
    pub fn new(num_caches: u16, ops_per_phase: usize, chunk_size: u64) -> Self {
        DemoWorkload {
            num_caches,
            ops_per_phase,
            chunk_size,
        }
    }

    pub fn run(&self, harness: &mut Harness) -> Result<Vec<PhaseReport>> {
        let mut reports = Vec::new();
        reports.push(self.run_phase(harness, "Sequential Read", BusEventKind::PrRd, |_pid, i| i as u64 * 64)?);
        reports.push(self.run_phase(harness, "Sequential Write", BusEventKind::PrWr, |_pid, i| i as u64 * 64)?);
        reports.push(self.run_random_phase(harness, "Random Read", BusEventKind::PrRd)?);
        reports.push(self.run_random_phase(harness, "Random Write", BusEventKind::PrWr)?);
        reports.push(self.run_phase(harness, "Thread-Unique Chunk Read", BusEventKind::PrRd, |pid, i| {
            pid as u64 * self.chunk_size + (i as u64 * 64) % self.chunk_size
        })?);
        reports.push(self.run_phase(harness, "Thread-Unique Chunk Write", BusEventKind::PrWr, |pid, i| {
            pid as u64 * self.chunk_size + (i as u64 * 64) % self.chunk_size
        })?);
        reports.push(self.run_phase(harness, "Shared Chunk Read", BusEventKind::PrRd, |_pid, i| {
            (i as u64 * 64) % self.chunk_size
        })?);
        reports.push(self.run_phase(harness, "False-Sharing Write", BusEventKind::PrWr, |pid, i| {
            ((i as u64 * pid as u64 * 64).wrapping_add(pid as u64 * 8)) % self.chunk_size
        })?);
        Ok(reports)
    }

    fn run_phase(
        &self,
        harness: &mut Harness,
        name: &'static str,
        kind: BusEventKind,
        addr_for: impl Fn(Pid, usize) -> u64,
    ) -> Result<PhaseReport> {
        let started = Utc::now();
        let mut ops = 0;
        for i in 0..self.ops_per_phase {
            for pid in 0..self.num_caches {
                harness.submit(pid, kind, addr_for(pid, i))?;
                ops += 1;
            }
        }
        let elapsed_ms = (Utc::now() - started).num_milliseconds();
        Ok(PhaseReport { name, elapsed_ms, ops })
    }

    fn run_random_phase(&self, harness: &mut Harness, name: &'static str, kind: BusEventKind) -> Result<PhaseReport> {
        let started = Utc::now();
        let mut rng = rand::thread_rng();
        let mut ops = 0;
        for _ in 0..self.ops_per_phase {
            for pid in 0..self.num_caches {
                let addr = rng.gen_range(0..self.chunk_size * self.num_caches.max(1) as u64) & !0x3f;
                harness.submit(pid, kind, addr)?;
                ops += 1;
            }
        }
        let elapsed_ms = (Utc::now() - started).num_milliseconds();
        Ok(PhaseReport { name, elapsed_ms, ops })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::{ArbPolicy, ArbiterConfig};
    use crate::bus::BusConfig;
    use crate::cache::{CacheConfig, Protocol, ReplacementPolicy};

    fn harness(n: u16) -> Harness {
        let cfg = CacheConfig {
            block_size: 64,
            cache_size: 1024,
            associativity: 4,
            replacement_policy: ReplacementPolicy::Lru,
            protocol: Protocol::Msi,
        };
        Harness::new(
            vec![cfg; n as usize],
            ArbiterConfig {
                processor_num: n,
                policy: ArbPolicy::RoundRobin,
                max_bus_transactions: 1,
            },
            BusConfig { processor_num: n, memory_access_time_ns: 100 },
        )
        .unwrap()
    }

    #[test]
    fn runs_every_phase_and_leaves_the_system_quiescent() {
        let mut h = harness(2);
        let workload = DemoWorkload::new(2, 16, 256);
        let reports = workload.run(&mut h).unwrap();
        assert_eq!(reports.len(), 8);
        assert!(h.is_quiescent());
        for r in &reports {
            assert_eq!(r.ops, 16 * 2);
        }
    }
}
