//! Cache controller: MSI/MESI coherence, replacement policy, and
//! outstanding-request coalescing.

use std::collections::VecDeque;
use std::fmt;

use log::{debug, trace, warn};

use crate::error::{Result, SimError};
use crate::event::{make_transaction_id, ArbEvent, ArbEventKind, BusEvent, BusEventKind, Pid, ProcessorCompletion};

/// Coherence protocol a cache runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Msi,
    Mesi,
}

/// Block replacement policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplacementPolicy {
    /// Round-robin: advance a per-set counter regardless of access history.
    Rr,
    /// Evict the line with the smallest `timestamp` (least recently used).
    Lru,
    /// Evict the line with the largest `timestamp` (most recently used).
    Mru,
}

/// Coherence state of a cache line.
///
/// `E` is never reached under `Protocol::Msi` — see `Cache::new`'s
/// construction-time sanity and the invariant tests at the bottom of this
/// module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLineState {
    Modified,
    Exclusive,
    Shared,
    Invalid,
}

/// A single cache line.
///
/// `valid == false` is always logically `Invalid` regardless of `state`
/// ; `state` is only meaningful when `valid` is true.
#[derive(Debug, Clone, Copy)]
pub struct CacheLine {
    pub valid: bool,
    pub address: u64,
    pub dirty: bool,
    pub timestamp: u64,
    pub state: CacheLineState,
}

impl CacheLine {
    fn empty() -> Self {
        CacheLine {
            valid: false,
            address: 0,
            dirty: false,
            timestamp: 0,
            state: CacheLineState::Invalid,
        }
    }
}

/// A processor-issued read or write, as seen by the cache it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorOp {
    pub kind: BusEventKind,
    pub addr: u64,
}

/// A bus transaction this cache has issued and is waiting to see resolved,
/// plus any later same-block processor ops that were coalesced into it
/// instead of issuing their own transaction.
#[derive(Debug, Clone)]
struct OutstandingRequest {
    request: BusEvent,
    primary: ProcessorOp,
    aliases: Vec<ProcessorOp>,
}

/// The result of a bus transaction being resolved, delivered back to the
/// issuing cache.
///
/// Matching the outstanding entry happens on `(kind, pid, addr)` of
/// `request`, so `request.kind` must stay equal to the original request's
/// kind; `supplied_by_cache` carries the one extra bit a MESI install needs
/// (install `E` vs `S`) without overloading `kind` for that lookup.
#[derive(Debug, Clone, Copy)]
pub struct BusCompletion {
    pub request: BusEvent,
    pub supplied_by_cache: bool,
}

/// Everything a cache handler can ask its embedder to do in response to one
/// event. The embedder (harness) is responsible for actually delivering
/// these to the arbiter/bus/generator — the cache never reaches into a
/// peer's state directly.
#[derive(Debug, Clone)]
pub enum CacheAction {
    /// Ask the arbiter for the bus.
    RequestBus(ArbEvent),
    /// Release the bus, once this cache's transaction has resolved.
    ReleaseBus(ArbEvent),
    /// Hand a constructed bus transaction to the bus (after a grant).
    SendToBus(BusEvent),
    /// Reply to a snoop.
    SnoopReply(BusEvent),
    /// Deliver a completed processor op back to whatever issued it.
    Complete(ProcessorCompletion),
}

/// Running counters reported at shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
}

/// Construction-time parameters, with reasonable defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    pub block_size: u64,
    pub cache_size: u64,
    pub associativity: u64,
    pub replacement_policy: ReplacementPolicy,
    pub protocol: Protocol,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            block_size: 64,
            cache_size: 16384,
            associativity: 4,
            replacement_policy: ReplacementPolicy::Lru,
            protocol: Protocol::Msi,
        }
    }
}

/// A single private cache, implementing MSI or MESI with write-allocate,
/// write-back, and a configurable replacement policy.
pub struct Cache {
    pub id: Pid,
    block_size: u64,
    associativity: u64,
    nsets: u64,
    offset_bits: u32,
    policy: ReplacementPolicy,
    protocol: Protocol,

    sets: Vec<Vec<CacheLine>>,
    rr_counters: Vec<usize>,

    timestamp: u64,
    next_txn_counter: u64,

    outstanding: Option<OutstandingRequest>,
    request_queue: VecDeque<BusEvent>,
    pending_ops: VecDeque<ProcessorOp>,
    blocked: bool,

    stats: CacheStats,
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("id", &self.id)
            .field("blocked", &self.blocked)
            .field("stats", &self.stats)
            .finish()
    }
}

impl Cache {
    pub fn new(id: Pid, config: CacheConfig) -> Result<Self> {
        if config.block_size == 0 || !config.block_size.is_power_of_two() {
            return Err(SimError::Config {
                component: "cache",
                reason: format!("blockSize must be a power of two, got {}", config.block_size),
            });
        }
        if config.associativity == 0 || !config.associativity.is_power_of_two() {
            return Err(SimError::Config {
                component: "cache",
                reason: format!(
                    "associativity must be a power of two, got {}",
                    config.associativity
                ),
            });
        }
        let set_bytes = config
            .block_size
            .checked_mul(config.associativity)
            .ok_or_else(|| SimError::Config {
                component: "cache",
                reason: "blockSize * associativity overflowed".to_string(),
            })?;
        if config.cache_size == 0 || config.cache_size % set_bytes != 0 {
            return Err(SimError::Config {
                component: "cache",
                reason: format!(
                    "cacheSize ({}) must be a multiple of blockSize*associativity ({})",
                    config.cache_size, set_bytes
                ),
            });
        }
        let nsets = config.cache_size / set_bytes;
        if !nsets.is_power_of_two() {
            return Err(SimError::Config {
                component: "cache",
                reason: format!(
                    "nsets ({nsets}) must be a power of two for correct set-index masking"
                ),
            });
        }

        let sets = (0..nsets)
            .map(|_| vec![CacheLine::empty(); config.associativity as usize])
            .collect();

        Ok(Cache {
            id,
            block_size: config.block_size,
            associativity: config.associativity,
            nsets,
            offset_bits: config.block_size.trailing_zeros(),
            policy: config.replacement_policy,
            protocol: config.protocol,
            sets,
            rr_counters: vec![0; nsets as usize],
            timestamp: 0,
            next_txn_counter: 0,
            outstanding: None,
            request_queue: VecDeque::new(),
            pending_ops: VecDeque::new(),
            blocked: false,
            stats: CacheStats::default(),
        })
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    /// `cacheLineIdx = addr / blockSize`.
    fn cache_line_idx(&self, addr: u64) -> u64 {
        addr >> self.offset_bits
    }

    /// The full aligned block address for `addr` (low `offset_bits` bits
    /// zeroed).
    fn block_addr(&self, addr: u64) -> u64 {
        (addr >> self.offset_bits) << self.offset_bits
    }

    /// Set index for `addr`. Masking with `1 << (nsbits - 1)` would only ever
    /// select a single bit; the correct mask is `nsets - 1`, which is what
    /// this uses (`nsets` is required to be a power of two in `new`).
    fn set_index(&self, addr: u64) -> usize {
        ((addr >> self.offset_bits) & (self.nsets - 1)) as usize
    }

    fn find_line(&self, addr: u64) -> Option<&CacheLine> {
        let set = &self.sets[self.set_index(addr)];
        let block = self.block_addr(addr);
        set.iter().find(|l| l.valid && l.address == block)
    }

    fn find_line_mut(&mut self, addr: u64) -> Option<&mut CacheLine> {
        let set_idx = self.set_index(addr);
        let block = self.block_addr(addr);
        self.sets[set_idx]
            .iter_mut()
            .find(|l| l.valid && l.address == block)
    }

    fn next_transaction_id(&mut self) -> u64 {
        let c = self.next_txn_counter;
        self.next_txn_counter += 1;
        make_transaction_id(self.id, c)
    }

    /// Pick a victim slot in `addr`'s set: prefer any invalid
    /// line (no eviction counted); otherwise apply the configured
    /// replacement policy.
    fn select_victim(&mut self, addr: u64) -> usize {
        let set_idx = self.set_index(addr);
        if let Some(i) = self.sets[set_idx].iter().position(|l| !l.valid) {
            return i;
        }
        match self.policy {
            ReplacementPolicy::Rr => {
                let slot = self.rr_counters[set_idx];
                self.rr_counters[set_idx] = (slot + 1) % self.associativity as usize;
                slot
            }
            ReplacementPolicy::Lru => self.sets[set_idx]
                .iter()
                .enumerate()
                .min_by_key(|(_, l)| l.timestamp)
                .map(|(i, _)| i)
                .expect("set has at least one line (associativity > 0)"),
            ReplacementPolicy::Mru => self.sets[set_idx]
                .iter()
                .enumerate()
                .max_by_key(|(_, l)| l.timestamp)
                .map(|(i, _)| i)
                .expect("set has at least one line (associativity > 0)"),
        }
    }

    fn install(&mut self, addr: u64, state: CacheLineState) {
        let set_idx = self.set_index(addr);
        let victim = self.select_victim(addr);
        if self.sets[set_idx][victim].valid {
            self.stats.evictions += 1;
            trace!(
                "cache {}: evicting set {} slot {} (was {:?})",
                self.id, set_idx, victim, self.sets[set_idx][victim].state
            );
        }
        self.sets[set_idx][victim] = CacheLine {
            valid: true,
            address: self.block_addr(addr),
            dirty: state == CacheLineState::Modified,
            timestamp: self.timestamp,
            state,
        };
    }

    // ----- processor-facing API -----------------------------------------

    /// Handle a processor-issued op. `kind` must be `PrRd` or `PrWr`.
    pub fn on_processor_op(&mut self, kind: BusEventKind, addr: u64) -> Result<Vec<CacheAction>> {
        if !kind.is_processor_request() {
            return Err(SimError::UnexpectedEventKind {
                cache_id: self.id,
                link: "processorPort",
                kind,
            });
        }
        self.timestamp += 1;
        trace!("cache {}: processor op {:?} {:#x}", self.id, kind, addr);
        self.dispatch_op(kind, addr)
    }

    /// Dispatches on `kind` first (only `PrRd`/`PrWr` are legal here; every
    /// other `BusEventKind` variant is rejected so the match stays
    /// exhaustive over all nine variants), then on the line's state.
    fn dispatch_op(&mut self, kind: BusEventKind, addr: u64) -> Result<Vec<CacheAction>> {
        match kind {
            BusEventKind::PrRd => self.dispatch_read(addr),
            BusEventKind::PrWr => self.dispatch_write(addr),
            other => Err(SimError::UnexpectedEventKind {
                cache_id: self.id,
                link: "processorPort",
                kind: other,
            }),
        }
    }

    fn dispatch_read(&mut self, addr: u64) -> Result<Vec<CacheAction>> {
        match self.find_line(addr).map(|l| l.state) {
            // READ HIT: no bus activity, refresh timestamp.
            Some(CacheLineState::Modified)
            | Some(CacheLineState::Shared)
            | Some(CacheLineState::Exclusive) => {
                self.stats.hits += 1;
                let ts = self.timestamp;
                self.find_line_mut(addr).unwrap().timestamp = ts;
                Ok(vec![CacheAction::Complete(ProcessorCompletion {
                    kind: BusEventKind::PrRd,
                    addr,
                })])
            }

            // READ MISS (no valid line present).
            None => {
                self.stats.misses += 1;
                self.issue_or_queue(BusEventKind::BusRd, BusEventKind::PrRd, addr, true)
            }

            // `find_line` only ever returns a line with `valid == true`, so a
            // state of `Invalid` here means the invariant that backs that
            // filter has already broken elsewhere.
            Some(CacheLineState::Invalid) => Err(SimError::Invariant {
                cache_id: self.id,
                reason: "read hit reported against a cache line in Invalid state".to_string(),
            }),
        }
    }

    fn dispatch_write(&mut self, addr: u64) -> Result<Vec<CacheAction>> {
        match self.find_line(addr).map(|l| l.state) {
            // WRITE HIT in M: no bus activity.
            Some(CacheLineState::Modified) => {
                self.stats.hits += 1;
                let ts = self.timestamp;
                let line = self.find_line_mut(addr).unwrap();
                line.timestamp = ts;
                line.dirty = true;
                Ok(vec![CacheAction::Complete(ProcessorCompletion {
                    kind: BusEventKind::PrWr,
                    addr,
                })])
            }

            // WRITE HIT in E: MESI silently upgrades E->M; MSI never installs
            // E, so reaching it here is an invariant violation.
            Some(CacheLineState::Exclusive) => match self.protocol {
                Protocol::Mesi => {
                    self.stats.hits += 1;
                    let ts = self.timestamp;
                    let line = self.find_line_mut(addr).unwrap();
                    line.state = CacheLineState::Modified;
                    line.dirty = true;
                    line.timestamp = ts;
                    Ok(vec![CacheAction::Complete(ProcessorCompletion {
                        kind: BusEventKind::PrWr,
                        addr,
                    })])
                }
                Protocol::Msi => Err(SimError::Invariant {
                    cache_id: self.id,
                    reason: "cache line in Exclusive state under MSI protocol".to_string(),
                }),
            },

            // WRITE HIT in S: issue BUS_UPGR, no aliasing.
            Some(CacheLineState::Shared) => {
                self.stats.hits += 1;
                self.issue_or_queue(BusEventKind::BusUpgr, BusEventKind::PrWr, addr, false)
            }

            // WRITE MISS (no valid line present).
            None => {
                self.stats.misses += 1;
                self.issue_or_queue(BusEventKind::BusRdx, BusEventKind::PrWr, addr, false)
            }

            // A "hit" against an Invalid line is a bug: `find_line` only
            // returns valid lines, so this state is unreachable in practice.
            Some(CacheLineState::Invalid) => Err(SimError::Invariant {
                cache_id: self.id,
                reason: "write hit reported against a cache line in Invalid state".to_string(),
            }),
        }
    }

    /// Issue a new bus transaction of `txn_kind` for `proc_kind addr`, or —
    /// if this cache already has one outstanding — either coalesce as an
    /// alias (`allow_any_kind_alias` true means any outstanding kind for the
    /// same block is compatible, matching the READ MISS rule; false means
    /// only an outstanding transaction of the exact same `txn_kind`
    /// qualifies, matching the WRITE MISS rule; WRITE HIT-in-S/MESI never
    /// aliases and always queues) or queue behind it.
    fn issue_or_queue(
        &mut self,
        txn_kind: BusEventKind,
        proc_kind: BusEventKind,
        addr: u64,
        allow_any_kind_alias: bool,
    ) -> Result<Vec<CacheAction>> {
        let op = ProcessorOp { kind: proc_kind, addr };

        if self.blocked {
            let cli = self.cache_line_idx(addr);
            let can_alias = self.outstanding.as_ref().is_some_and(|o| {
                o.request.cache_line_idx(self.block_size) == cli
                    && (allow_any_kind_alias || o.request.kind == txn_kind)
            });
            if can_alias {
                debug!(
                    "cache {}: aliasing {:?} {:#x} onto outstanding {:?}",
                    self.id,
                    proc_kind,
                    addr,
                    self.outstanding.as_ref().unwrap().request.kind
                );
                self.outstanding.as_mut().unwrap().aliases.push(op);
                return Ok(vec![]);
            }
            debug!("cache {}: queueing {:?} {:#x} behind outstanding request", self.id, proc_kind, addr);
            self.pending_ops.push_back(op);
            return Ok(vec![]);
        }

        self.issue_new_request(txn_kind, op)
    }

    fn issue_new_request(&mut self, txn_kind: BusEventKind, op: ProcessorOp) -> Result<Vec<CacheAction>> {
        let tid = self.next_transaction_id();
        let request = BusEvent::new(txn_kind, op.addr, self.id, tid);
        self.outstanding = Some(OutstandingRequest {
            request,
            primary: op,
            aliases: Vec::new(),
        });
        self.request_queue.push_back(request);
        self.blocked = true;
        debug!("cache {}: issuing {:?} {:#x} (tid {:#x})", self.id, txn_kind, op.addr, tid);
        Ok(vec![CacheAction::RequestBus(ArbEvent::new(ArbEventKind::Ac, self.id))])
    }

    /// Handle an arbiter grant: move the head of `requestQueue` onto the
    /// bus.
    pub fn on_arbiter_grant(&mut self, ev: ArbEvent) -> Result<Vec<CacheAction>> {
        if ev.pid != self.id {
            return Err(SimError::Invariant {
                cache_id: self.id,
                reason: format!("received arbiter grant addressed to pid {}", ev.pid),
            });
        }
        match self.request_queue.pop_front() {
            Some(bus_ev) => {
                trace!("cache {}: granted bus, sending {:?}", self.id, bus_ev.kind);
                Ok(vec![CacheAction::SendToBus(bus_ev)])
            }
            None => Err(SimError::Invariant {
                cache_id: self.id,
                reason: "granted the bus with an empty request queue".to_string(),
            }),
        }
    }

    /// Inspect a peer's bus transaction and reply.
    pub fn on_bus_snoop(&mut self, ev: &BusEvent) -> Result<Vec<CacheAction>> {
        if !ev.kind.is_bus_transaction() {
            return Err(SimError::UnexpectedEventKind {
                cache_id: self.id,
                link: "busPort (snoop)",
                kind: ev.kind,
            });
        }

        let reply_kind = match ev.kind {
            BusEventKind::BusRd => match self.find_line(ev.addr).map(|l| l.state) {
                Some(CacheLineState::Modified) => {
                    let line = self.find_line_mut(ev.addr).unwrap();
                    line.state = CacheLineState::Shared;
                    line.dirty = false;
                    BusEventKind::Shared
                }
                Some(CacheLineState::Exclusive) => {
                    self.find_line_mut(ev.addr).unwrap().state = CacheLineState::Shared;
                    BusEventKind::Shared
                }
                Some(CacheLineState::Shared) => BusEventKind::Shared,
                Some(CacheLineState::Invalid) | None => BusEventKind::Empty,
            },
            BusEventKind::BusRdx => match self.find_line(ev.addr) {
                Some(line) if line.valid => {
                    self.invalidate(ev.addr);
                    BusEventKind::Shared
                }
                _ => BusEventKind::Empty,
            },
            BusEventKind::BusUpgr => match self.find_line(ev.addr).map(|l| l.state) {
                Some(CacheLineState::Shared) => {
                    self.invalidate(ev.addr);
                    BusEventKind::Shared
                }
                Some(other) => {
                    return Err(SimError::Invariant {
                        cache_id: self.id,
                        reason: format!(
                            "snooped BUS_UPGR while holding the block in {other:?} (violates single-writer invariant)"
                        ),
                    })
                }
                None => BusEventKind::Empty,
            },
            _ => unreachable!("filtered by is_bus_transaction above"),
        };

        Ok(vec![CacheAction::SnoopReply(BusEvent::new(
            reply_kind,
            ev.addr,
            self.id,
            ev.transaction_id,
        ))])
    }

    fn invalidate(&mut self, addr: u64) {
        if let Some(line) = self.find_line_mut(addr) {
            line.valid = false;
            line.state = CacheLineState::Invalid;
            self.stats.invalidations += 1;
        }
    }

    /// Handle this cache's outstanding transaction resolving. It has
    /// resolved. Installs the line, completes the primary op and every
    /// alias, releases the bus, and drains anything that had queued up
    /// behind the now-resolved transaction.
    pub fn on_bus_completion(&mut self, completion: &BusCompletion) -> Result<Vec<CacheAction>> {
        let outstanding = self.outstanding.take().ok_or_else(|| SimError::Invariant {
            cache_id: self.id,
            reason: "received a bus completion with no outstanding request".to_string(),
        })?;

        if outstanding.request.kind != completion.request.kind
            || outstanding.request.pid != completion.request.pid
            || outstanding.request.addr != completion.request.addr
        {
            self.outstanding = Some(outstanding);
            return Err(SimError::Invariant {
                cache_id: self.id,
                reason: "bus completion does not match outstanding request".to_string(),
            });
        }

        match outstanding.request.kind {
            BusEventKind::BusRd => {
                let state = match self.protocol {
                    Protocol::Msi => CacheLineState::Shared,
                    Protocol::Mesi => {
                        if completion.supplied_by_cache {
                            CacheLineState::Shared
                        } else {
                            CacheLineState::Exclusive
                        }
                    }
                };
                self.install(outstanding.request.addr, state);
            }
            BusEventKind::BusRdx => {
                self.install(outstanding.request.addr, CacheLineState::Modified);
            }
            BusEventKind::BusUpgr => {
                let ts = self.timestamp;
                let line = self.find_line_mut(outstanding.request.addr).ok_or_else(|| {
                    SimError::Invariant {
                        cache_id: self.id,
                        reason: "BUS_UPGR resolved but the line is no longer present".to_string(),
                    }
                })?;
                line.state = CacheLineState::Modified;
                line.dirty = true;
                line.timestamp = ts;
            }
            other => {
                return Err(SimError::UnexpectedEventKind {
                    cache_id: self.id,
                    link: "busPort (completion)",
                    kind: other,
                })
            }
        }

        let mut actions = Vec::with_capacity(2 + outstanding.aliases.len());
        actions.push(CacheAction::Complete(ProcessorCompletion {
            kind: outstanding.primary.kind,
            addr: outstanding.primary.addr,
        }));
        for alias in &outstanding.aliases {
            actions.push(CacheAction::Complete(ProcessorCompletion {
                kind: alias.kind,
                addr: alias.addr,
            }));
        }

        self.blocked = false;
        actions.push(CacheAction::ReleaseBus(ArbEvent::new(ArbEventKind::Rl, self.id)));

        actions.extend(self.dispatch_pending()?);
        Ok(actions)
    }

    /// Re-dispatch queued processor ops now that the bus is free. Stops as
    /// soon as one of them issues a new outstanding request (only one may
    /// be in flight at a time).
    fn dispatch_pending(&mut self) -> Result<Vec<CacheAction>> {
        let mut actions = Vec::new();
        while !self.blocked {
            let Some(op) = self.pending_ops.pop_front() else {
                break;
            };
            trace!("cache {}: re-dispatching queued {:?} {:#x}", self.id, op.kind, op.addr);
            actions.extend(self.dispatch_op(op.kind, op.addr)?);
        }
        Ok(actions)
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        if self.outstanding.is_some() || !self.pending_ops.is_empty() {
            warn!(
                "cache {}: dropped with {} outstanding and {} pending ops",
                self.id,
                self.outstanding.is_some() as u8,
                self.pending_ops.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(protocol: Protocol, policy: ReplacementPolicy) -> Cache {
        Cache::new(
            0,
            CacheConfig {
                block_size: 64,
                cache_size: 256,
                associativity: 2,
                replacement_policy: policy,
                protocol,
            },
        )
        .unwrap()
    }

    #[test]
    fn rejects_non_power_of_two_associativity() {
        let err = Cache::new(
            0,
            CacheConfig {
                associativity: 3,
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, SimError::Config { .. }));
    }

    #[test]
    fn read_miss_issues_bus_rd_and_blocks() {
        let mut c = cache(Protocol::Msi, ReplacementPolicy::Lru);
        let actions = c.on_processor_op(BusEventKind::PrRd, 0x100).unwrap();
        assert_eq!(c.stats().misses, 1);
        assert!(c.is_blocked());
        assert!(matches!(actions.as_slice(), [CacheAction::RequestBus(_)]));
    }

    #[test]
    fn read_hit_after_install_does_not_touch_bus() {
        let mut c = cache(Protocol::Msi, ReplacementPolicy::Lru);
        c.on_processor_op(BusEventKind::PrRd, 0x100).unwrap();
        let ev = c.request_queue.front().copied().unwrap();
        c.on_arbiter_grant(ArbEvent::new(ArbEventKind::Ac, 0)).unwrap();
        c.on_bus_completion(&BusCompletion {
            request: ev,
            supplied_by_cache: false,
        })
        .unwrap();
        assert!(!c.is_blocked());

        let actions = c.on_processor_op(BusEventKind::PrRd, 0x100).unwrap();
        assert_eq!(c.stats().hits, 1);
        assert!(matches!(actions.as_slice(), [CacheAction::Complete(_)]));
    }

    #[test]
    fn write_hit_in_shared_issues_upgrade_no_alias() {
        let mut c = cache(Protocol::Msi, ReplacementPolicy::Lru);
        // Force the line into Shared "by hand" via a read-miss + completion
        // that simulates a peer having supplied it.
        c.on_processor_op(BusEventKind::PrRd, 0x40).unwrap();
        let req = c.request_queue.front().copied().unwrap();
        c.on_arbiter_grant(ArbEvent::new(ArbEventKind::Ac, 0)).unwrap();
        c.on_bus_completion(&BusCompletion {
            request: req,
            supplied_by_cache: true,
        })
        .unwrap();

        let actions = c.on_processor_op(BusEventKind::PrWr, 0x40).unwrap();
        assert!(c.is_blocked());
        assert!(matches!(actions.as_slice(), [CacheAction::RequestBus(ev)] if ev.kind == ArbEventKind::Ac));
        let queued = c.request_queue.front().unwrap();
        assert_eq!(queued.kind, BusEventKind::BusUpgr);
    }

    #[test]
    fn read_miss_coalesces_behind_any_outstanding_kind() {
        let mut c = cache(Protocol::Msi, ReplacementPolicy::Lru);
        c.on_processor_op(BusEventKind::PrWr, 0x80).unwrap(); // issues BUS_RDX
        assert_eq!(c.request_queue.front().unwrap().kind, BusEventKind::BusRdx);

        let actions = c.on_processor_op(BusEventKind::PrRd, 0x80).unwrap();
        assert!(actions.is_empty(), "read should alias, not issue a new request");
        assert_eq!(c.outstanding.as_ref().unwrap().aliases.len(), 1);
    }

    #[test]
    fn write_miss_does_not_coalesce_behind_read() {
        let mut c = cache(Protocol::Msi, ReplacementPolicy::Lru);
        c.on_processor_op(BusEventKind::PrRd, 0x80).unwrap(); // issues BUS_RD
        assert_eq!(c.request_queue.front().unwrap().kind, BusEventKind::BusRd);

        let actions = c.on_processor_op(BusEventKind::PrWr, 0x80).unwrap();
        assert!(actions.is_empty(), "write should queue, not alias behind a read");
        assert_eq!(c.outstanding.as_ref().unwrap().aliases.len(), 0);
        assert_eq!(c.pending_ops.len(), 1);
    }

    #[test]
    fn mesi_read_hit_in_exclusive_has_no_bus_activity() {
        let mut c = cache(Protocol::Mesi, ReplacementPolicy::Lru);
        c.on_processor_op(BusEventKind::PrRd, 0x40).unwrap();
        let req = c.request_queue.front().copied().unwrap();
        c.on_arbiter_grant(ArbEvent::new(ArbEventKind::Ac, 0)).unwrap();
        c.on_bus_completion(&BusCompletion {
            request: req,
            supplied_by_cache: false,
        })
        .unwrap();
        assert_eq!(c.find_line(0x40).unwrap().state, CacheLineState::Exclusive);

        let actions = c.on_processor_op(BusEventKind::PrRd, 0x40).unwrap();
        assert!(matches!(actions.as_slice(), [CacheAction::Complete(_)]));
        assert!(!c.is_blocked());
    }

    #[test]
    fn mesi_write_hit_in_exclusive_silently_upgrades() {
        let mut c = cache(Protocol::Mesi, ReplacementPolicy::Lru);
        c.on_processor_op(BusEventKind::PrRd, 0x40).unwrap();
        let req = c.request_queue.front().copied().unwrap();
        c.on_arbiter_grant(ArbEvent::new(ArbEventKind::Ac, 0)).unwrap();
        c.on_bus_completion(&BusCompletion {
            request: req,
            supplied_by_cache: false,
        })
        .unwrap();

        let actions = c.on_processor_op(BusEventKind::PrWr, 0x40).unwrap();
        assert!(matches!(actions.as_slice(), [CacheAction::Complete(_)]));
        assert!(!c.is_blocked(), "silent E->M upgrade must not touch the bus");
        assert_eq!(c.find_line(0x40).unwrap().state, CacheLineState::Modified);
    }

    #[test]
    fn snoop_bus_rdx_on_modified_line_invalidates_and_replies_shared() {
        let mut c = cache(Protocol::Msi, ReplacementPolicy::Lru);
        c.on_processor_op(BusEventKind::PrWr, 0x40).unwrap();
        let req = c.request_queue.front().copied().unwrap();
        c.on_arbiter_grant(ArbEvent::new(ArbEventKind::Ac, 0)).unwrap();
        c.on_bus_completion(&BusCompletion {
            request: req,
            supplied_by_cache: false,
        })
        .unwrap();
        assert_eq!(c.find_line(0x40).unwrap().state, CacheLineState::Modified);

        let snoop = BusEvent::new(BusEventKind::BusRdx, 0x40, 1, make_transaction_id(1, 0));
        let actions = c.on_bus_snoop(&snoop).unwrap();
        assert_eq!(c.stats().invalidations, 1);
        assert!(matches!(
            actions.as_slice(),
            [CacheAction::SnoopReply(r)] if r.kind == BusEventKind::Shared
        ));
        assert!(c.find_line(0x40).is_none());
    }

    #[test]
    fn snoop_empty_reply_when_block_not_present() {
        let mut c = cache(Protocol::Msi, ReplacementPolicy::Lru);
        let snoop = BusEvent::new(BusEventKind::BusRd, 0x40, 1, make_transaction_id(1, 0));
        let actions = c.on_bus_snoop(&snoop).unwrap();
        assert!(matches!(
            actions.as_slice(),
            [CacheAction::SnoopReply(r)] if r.kind == BusEventKind::Empty
        ));
    }

    #[test]
    fn bus_upgr_snoop_while_modified_is_an_invariant_violation() {
        let mut c = cache(Protocol::Msi, ReplacementPolicy::Lru);
        c.on_processor_op(BusEventKind::PrWr, 0x40).unwrap();
        let req = c.request_queue.front().copied().unwrap();
        c.on_arbiter_grant(ArbEvent::new(ArbEventKind::Ac, 0)).unwrap();
        c.on_bus_completion(&BusCompletion {
            request: req,
            supplied_by_cache: false,
        })
        .unwrap();

        let snoop = BusEvent::new(BusEventKind::BusUpgr, 0x40, 1, make_transaction_id(1, 0));
        let err = c.on_bus_snoop(&snoop).unwrap_err();
        assert!(matches!(err, SimError::Invariant { .. }));
    }

    #[test]
    fn round_robin_eviction_on_direct_mapped_matches_lru() {
        // associativity == 1: LRU and RR must behave identically.
        let mut lru = Cache::new(
            0,
            CacheConfig {
                block_size: 64,
                cache_size: 128,
                associativity: 1,
                replacement_policy: ReplacementPolicy::Lru,
                protocol: Protocol::Msi,
            },
        )
        .unwrap();
        let mut rr = Cache::new(
            0,
            CacheConfig {
                block_size: 64,
                cache_size: 128,
                associativity: 1,
                replacement_policy: ReplacementPolicy::Rr,
                protocol: Protocol::Msi,
            },
        )
        .unwrap();

        for addr in [0u64, 128, 0, 128, 0] {
            for c in [&mut lru, &mut rr] {
                c.on_processor_op(BusEventKind::PrRd, addr).unwrap();
                let req = c.request_queue.front().copied().unwrap();
                c.on_arbiter_grant(ArbEvent::new(ArbEventKind::Ac, 0)).unwrap();
                c.on_bus_completion(&BusCompletion {
                    request: req,
                    supplied_by_cache: false,
                })
                .unwrap();
            }
        }
        assert_eq!(lru.stats(), rr.stats());
    }

    #[test]
    fn invalid_line_is_chosen_without_counting_an_eviction() {
        let mut c = cache(Protocol::Msi, ReplacementPolicy::Lru);
        c.on_processor_op(BusEventKind::PrRd, 0x0).unwrap();
        let req = c.request_queue.front().copied().unwrap();
        c.on_arbiter_grant(ArbEvent::new(ArbEventKind::Ac, 0)).unwrap();
        c.on_bus_completion(&BusCompletion {
            request: req,
            supplied_by_cache: false,
        })
        .unwrap();
        assert_eq!(c.stats().evictions, 0);
    }

    #[test]
    fn eviction_accounting_two_set_one_way() {
        // Two sets, one way: addresses 0 and block_size*2 collide in set 0.
        let mut c = Cache::new(
            0,
            CacheConfig {
                block_size: 64,
                cache_size: 128,
                associativity: 1,
                replacement_policy: ReplacementPolicy::Lru,
                protocol: Protocol::Msi,
            },
        )
        .unwrap();

        for addr in [0u64, 128, 0, 128] {
            c.on_processor_op(BusEventKind::PrRd, addr).unwrap();
            let req = c.request_queue.front().copied().unwrap();
            c.on_arbiter_grant(ArbEvent::new(ArbEventKind::Ac, 0)).unwrap();
            c.on_bus_completion(&BusCompletion {
                request: req,
                supplied_by_cache: false,
            })
            .unwrap();
        }

        assert_eq!(c.stats().misses, 4);
        assert_eq!(c.stats().evictions, 2);
    }

    #[test]
    fn alias_coalescing_delivers_one_completion_per_op() {
        let mut c = cache(Protocol::Msi, ReplacementPolicy::Lru);
        let mut total_completions = 0;

        let actions = c.on_processor_op(BusEventKind::PrRd, 0x40).unwrap();
        assert!(matches!(actions.as_slice(), [CacheAction::RequestBus(_)]));

        for _ in 0..3 {
            let actions = c.on_processor_op(BusEventKind::PrRd, 0x40).unwrap();
            assert!(actions.is_empty());
        }

        let req = c.request_queue.front().copied().unwrap();
        c.on_arbiter_grant(ArbEvent::new(ArbEventKind::Ac, 0)).unwrap();
        let actions = c
            .on_bus_completion(&BusCompletion {
                request: req,
                supplied_by_cache: false,
            })
            .unwrap();

        for a in &actions {
            if matches!(a, CacheAction::Complete(_)) {
                total_completions += 1;
            }
        }
        assert_eq!(total_completions, 4);
    }
}
