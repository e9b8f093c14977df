//! Thin demo binary: builds a harness from a handful of caches, runs the
//! synthetic workload suite against it, and prints the shutdown report.

use coherence_sim::arbiter::{ArbPolicy, ArbiterConfig};
use coherence_sim::bus::BusConfig;
use coherence_sim::cache::{CacheConfig, Protocol, ReplacementPolicy};
use coherence_sim::demo::DemoWorkload;
use coherence_sim::harness::Harness;
use coherence_sim::report::Report;

const NUM_CACHES: u16 = 4;
const OPS_PER_PHASE: usize = 256;
const CHUNK_SIZE: u64 = 4096;

fn main() {
    env_logger::init();

    let cache_config = CacheConfig {
        block_size: 64,
        cache_size: 16384,
        associativity: 4,
        replacement_policy: ReplacementPolicy::Lru,
        protocol: Protocol::Mesi,
    };

    let mut harness = Harness::new(
        vec![cache_config; NUM_CACHES as usize],
        ArbiterConfig {
            processor_num: NUM_CACHES,
            policy: ArbPolicy::RoundRobin,
            max_bus_transactions: 1,
        },
        BusConfig { processor_num: NUM_CACHES, memory_access_time_ns: 100 },
    )
    .expect("configuration should be valid");

    log::info!("starting simulation with {NUM_CACHES} caches");

    let workload = DemoWorkload::new(NUM_CACHES, OPS_PER_PHASE, CHUNK_SIZE);
    match workload.run(&mut harness) {
        Ok(reports) => {
            for r in &reports {
                log::info!("{}: {} ops in {} ms", r.name, r.ops, r.elapsed_ms);
            }
        }
        Err(e) => {
            eprintln!("simulation aborted: {e}");
            std::process::exit(1);
        }
    }

    let report = Report::collect(harness.caches(), harness.arbiter(), harness.bus());
    println!("{report}");
}
