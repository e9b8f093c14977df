//! Event and transaction-id types shared by the cache, bus, and arbiter.
//!
//! These are plain tagged records — dispatch happens by `match`ing on a
//! fixed set of variants, never by runtime type-downcast.

/// Identifies a processor/cache by its position in the system. Matches the
/// `pid_t pid` field of the original `CacheEvent`, narrowed to the 16 bits
/// the transaction-id encoding allows.
pub type Pid = u16;

/// A 64-bit transaction id with the originating `Pid` in the top 16 bits and
/// a per-cache monotonic counter in the bottom 48.
pub type TransactionId = u64;

const PID_SHIFT: u32 = 48;
const COUNTER_MASK: u64 = (1u64 << PID_SHIFT) - 1;

/// Build a transaction id for `pid`'s `counter`-th issued transaction.
///
/// `counter` is truncated to 48 bits; a cache that issues more than 2^48
/// transactions in one run would wrap, which is not a concern at any
/// simulated scale.
pub fn make_transaction_id(pid: Pid, counter: u64) -> TransactionId {
    ((pid as u64) << PID_SHIFT) | (counter & COUNTER_MASK)
}

/// Recover the originating `Pid` from a transaction id.
pub fn transaction_originator(tid: TransactionId) -> Pid {
    (tid >> PID_SHIFT) as Pid
}

/// The kind of a bus-facing coherence event.
///
/// `PrRd`/`PrWr` are processor-issued ops that a cache turns into `BusRd` /
/// `BusRdx` / `BusUpgr` on a miss or upgrade; `Flush`, `Shared`,
/// `NotShared`, and `Empty` are bus-facing replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusEventKind {
    /// Processor read.
    PrRd,
    /// Processor write.
    PrWr,
    /// Read a block, willing to accept a shared copy.
    BusRd,
    /// Read-with-intent-to-modify; invalidates other copies.
    BusRdx,
    /// Upgrade an already-shared line to modified by invalidating peers.
    BusUpgr,
    /// Supply a block to a requesting cache (modelled as stats only; see
    /// `Cache::on_bus_snoop`).
    Flush,
    /// Responding cache had the line.
    Shared,
    /// Responding cache does not currently have the line.
    NotShared,
    /// No cache had the line; synonymous with `NotShared` in this
    /// implementation (see `Bus::resolve`), kept distinct because the
    /// spec's glossary keeps them as separate named replies.
    Empty,
}

impl BusEventKind {
    /// Whether this kind is a processor-side request (never appears on the
    /// bus itself).
    pub fn is_processor_request(self) -> bool {
        matches!(self, BusEventKind::PrRd | BusEventKind::PrWr)
    }

    /// Whether this kind is one of the three bus transaction kinds that get
    /// a `TransactionId` and participate in `transactionsMap`.
    pub fn is_bus_transaction(self) -> bool {
        matches!(
            self,
            BusEventKind::BusRd | BusEventKind::BusRdx | BusEventKind::BusUpgr
        )
    }

    /// Whether a snoop reply of this kind indicates the snooping cache held
    /// the line (and so the bus should prefer cache-to-cache transfer over
    /// memory fallback).
    pub fn indicates_supplier(self) -> bool {
        matches!(self, BusEventKind::Shared | BusEventKind::Flush)
    }
}

/// A bus-facing coherence event: a processor op once it has missed/upgraded
/// and become a bus transaction, a snoop broadcast, or a snoop reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusEvent {
    pub kind: BusEventKind,
    pub addr: u64,
    pub pid: Pid,
    pub transaction_id: TransactionId,
}

impl BusEvent {
    pub fn new(kind: BusEventKind, addr: u64, pid: Pid, transaction_id: TransactionId) -> Self {
        BusEvent {
            kind,
            addr,
            pid,
            transaction_id,
        }
    }

    /// `cacheLineIdx = addr / blockSize`.
    pub fn cache_line_idx(&self, block_size: u64) -> u64 {
        self.addr / block_size
    }

    pub fn with_kind(&self, kind: BusEventKind) -> Self {
        BusEvent { kind, ..*self }
    }
}

/// Arbiter control event kind: acquire or release exclusive bus access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbEventKind {
    /// Acquire exclusive access to the bus.
    Ac,
    /// Release exclusive access to the bus.
    Rl,
}

/// An arbiter-facing control event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArbEvent {
    pub kind: ArbEventKind,
    pub pid: Pid,
}

impl ArbEvent {
    pub fn new(kind: ArbEventKind, pid: Pid) -> Self {
        ArbEvent { kind, pid }
    }
}

/// A completed processor op, delivered back from the cache to whatever fed
/// it the op in the first place (the generator, out of scope here).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorCompletion {
    pub kind: BusEventKind,
    pub addr: u64,
}
