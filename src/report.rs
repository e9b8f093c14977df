//! Shutdown report: per-cache, bus, and arbiter counters printed at the end
//! of a run.

use std::fmt;

use log::info;

use crate::arbiter::Arbiter;
use crate::bus::{Bus, BusStats};
use crate::cache::{Cache, CacheStats};

/// A fully assembled shutdown report.
#[derive(Debug, Clone)]
pub struct Report {
    pub per_cache: Vec<CacheStats>,
    pub grants_num: Vec<u64>,
    pub bus: BusStats,
    pub memory_access_time_ns: u64,
}

impl Report {
    pub fn collect(caches: &[Cache], arbiter: &Arbiter, bus: &Bus) -> Self {
        Report {
            per_cache: caches.iter().map(|c| c.stats()).collect(),
            grants_num: arbiter.grants_num().to_vec(),
            bus: bus.stats(),
            memory_access_time_ns: bus.memory_access_time_ns(),
        }
    }

    /// Log every row of the report at info level and return the same text.
    pub fn log(&self) -> String {
        let text = self.to_string();
        for line in text.lines() {
            info!("{line}");
        }
        text
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "cache\thits\tmisses\tevictions\tinvalidations")?;
        for (pid, s) in self.per_cache.iter().enumerate() {
            writeln!(f, "{pid}\t{}\t{}\t{}\t{}", s.hits, s.misses, s.evictions, s.invalidations)?;
        }
        writeln!(f)?;
        writeln!(f, "arbiter grantsNum\t{}", join_counts(&self.grants_num))?;
        writeln!(f)?;
        writeln!(
            f,
            "bus reqTraffic={} respTraffic={} memoryTraffic={} totalTraffic={}",
            self.bus.req_traffic, self.bus.resp_traffic, self.bus.memory_traffic, self.bus.total_traffic
        )?;
        writeln!(f, "bus memoryAccessTime={}ns", self.memory_access_time_ns)
    }
}

fn join_counts(counts: &[u64]) -> String {
    counts
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join("\t")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::{ArbPolicy, ArbiterConfig};
    use crate::bus::{Bus, BusConfig};
    use crate::cache::{CacheConfig, Protocol, ReplacementPolicy};

    #[test]
    fn report_collects_all_three_sources() {
        let caches = vec![Cache::new(
            0,
            CacheConfig {
                block_size: 64,
                cache_size: 256,
                associativity: 2,
                replacement_policy: ReplacementPolicy::Lru,
                protocol: Protocol::Msi,
            },
        )
        .unwrap()];
        let arbiter = Arbiter::new(ArbiterConfig {
            processor_num: 1,
            policy: ArbPolicy::Fifo,
            max_bus_transactions: 1,
        });
        let bus = Bus::new(BusConfig { processor_num: 1, memory_access_time_ns: 100 });

        let report = Report::collect(&caches, &arbiter, &bus);
        assert_eq!(report.per_cache.len(), 1);
        assert_eq!(report.grants_num.len(), 1);
        assert_eq!(report.memory_access_time_ns, 0, "no memory traffic occurred yet");
        assert!(report.to_string().contains("reqTraffic"));
        assert!(report.to_string().contains("memoryAccessTime"));
    }

    #[test]
    fn memory_access_time_scales_with_memory_traffic() {
        let mut bus = Bus::new(BusConfig {
            processor_num: 1,
            memory_access_time_ns: 100,
        });
        bus.on_cache_event(crate::event::BusEvent::new(
            crate::event::BusEventKind::BusRd,
            0x40,
            0,
            crate::event::make_transaction_id(0, 0),
        ));
        assert_eq!(bus.stats().memory_traffic, 1);
        assert_eq!(bus.memory_access_time_ns(), 100);
    }
}
