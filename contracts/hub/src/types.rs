use soroban_sdk::{contracttype, Address, Bytes, BytesN, Vec};

// ---------------------------------------------------------------------------
// Protocol constants
// ---------------------------------------------------------------------------

/// Number of extra decimals carried by every per-second rate, so that rates
/// below one token unit per second are representable.
pub const AMT_PER_SEC_EXTRA_DECIMALS: u32 = 9;

/// `10 ^ AMT_PER_SEC_EXTRA_DECIMALS`. A rate of one token unit per second is
/// `1_000_000_000`.
pub const AMT_PER_SEC_MULTIPLIER: i128 = 1_000_000_000;

/// Maximum number of stream receivers a single account can stream to.
pub const MAX_STREAMS_RECEIVERS: u32 = 100;

/// Maximum number of splits receivers a single account can split to.
pub const MAX_SPLITS_RECEIVERS: u32 = 200;

/// Total weight of a splits configuration. Receivers' weights are relative
/// to it; anything not covered by the configured weights stays with the
/// splitting account.
pub const TOTAL_SPLITS_WEIGHT: u32 = 1_000_000;

/// Cap on the sum of all balances of a single token held by the hub,
/// `2^127 - 1`. Protects the fixed-width cycle accumulators from overflow.
pub const MAX_TOTAL_BALANCE: i128 = i128::MAX;

/// Upper bound of the timestamp domain used by the max-end solver.
pub const MAX_TIMESTAMP: u64 = u32::MAX as u64;

/// Cap on a single receiver's `amt_per_sec`. Keeps every fixed-point product
/// in the engine (rate times cycle length or elapsed seconds) inside `i128`.
pub const MAX_AMT_PER_SEC: i128 = i128::MAX >> 32;

/// Persistent storage TTL thresholds, extended on every write.
pub const TTL_THRESHOLD: u32 = 17280;
pub const TTL_EXTEND_TO: u32 = 120960;

// ---------------------------------------------------------------------------
// Identities
// ---------------------------------------------------------------------------

/// Identifier of an account in the hub ledger.
///
/// The `driver_id` names the registered driver contract that owns the
/// account and is the only caller allowed to mutate it; `sub_account` is an
/// opaque payload the driver assigns however it wants. The derived ordering
/// (driver first, payload second) is the total order receiver lists are
/// sorted by.
#[contracttype]
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub struct AccountId {
    pub driver_id: u32,
    pub sub_account: u128,
}

// ---------------------------------------------------------------------------
// Streams
// ---------------------------------------------------------------------------

/// Configuration of a single stream within a receiver list.
///
/// `start == 0` means "when the configuring update executes" and
/// `duration == 0` means "until the balance runs out". Field order matters:
/// the derived ordering over `(stream_id, amt_per_sec, start, duration)` is
/// part of the receiver-list sort order.
#[contracttype]
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub struct StreamConfig {
    pub stream_id: u32,
    pub amt_per_sec: i128,
    pub start: u64,
    pub duration: u64,
}

/// One entry of a stream receiver list.
#[contracttype]
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub struct StreamReceiver {
    pub account_id: AccountId,
    pub config: StreamConfig,
}

/// Streaming state of one (account, token) pair. A single record carries
/// both roles: the sending side (balance, receiver-list commitment, horizon)
/// and the receiving side (the receivable-cycle cursor).
#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StreamsState {
    /// Commitment to the current receiver list. The list itself is never
    /// stored; callers present it again and it is verified against this.
    pub streams_hash: BytesN<32>,
    /// Hash chain over all past configurations, used to verify squeeze
    /// history.
    pub history_hash: BytesN<32>,
    /// Timestamp of the last `set_streams` for this pair.
    pub update_time: u64,
    /// Funds not yet streamed out as of `update_time`.
    pub balance: i128,
    /// Latest timestamp the balance recorded at `update_time` can fund all
    /// configured streams to.
    pub max_end: u64,
    /// First cycle with unrealized receivable deltas; `0` when none were
    /// ever posted. Never moves backward past a realized cycle.
    pub next_receivable_cycle: u32,
}

/// Difference-array entry of the receivable accrual, stored sparsely per
/// (account, token, cycle). `this_cycle` adjusts the running per-cycle
/// amount starting at its own cycle, `next_cycle` starting at the following
/// one.
#[contracttype]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AmtDelta {
    pub this_cycle: i128,
    pub next_cycle: i128,
}

/// Squeeze cursor of one (receiver, token, sender) triple: the timestamp up
/// to which the cycle `cycle` has already been squeezed. Stale once the
/// current cycle moves past `cycle`.
#[contracttype]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SqueezedState {
    pub cycle: u32,
    pub next_squeezed: u64,
}

/// One link of a sender's configuration history chain, as presented by a
/// squeezing caller. Carries either the full receiver list (then
/// `streams_hash` must be all zeroes) or only the list hash (then the entry
/// verifies but cannot be squeezed from).
#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StreamsHistoryEntry {
    pub streams_hash: BytesN<32>,
    pub receivers: Vec<StreamReceiver>,
    pub update_time: u64,
    pub max_end: u64,
}

// ---------------------------------------------------------------------------
// Splits
// ---------------------------------------------------------------------------

/// One entry of a splits receiver list. `weight` is relative to
/// `TOTAL_SPLITS_WEIGHT`.
#[contracttype]
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub struct SplitsReceiver {
    pub account_id: AccountId,
    pub weight: u32,
}

/// Received funds of one (account, token) pair. `splittable` is pending
/// distribution through the splits graph, `collectable` has been split and
/// is ready for withdrawal.
#[contracttype]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SplitsBalance {
    pub splittable: i128,
    pub collectable: i128,
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// A key-value pair emitted verbatim for off-chain indexers. Never stored.
#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AccountMetadata {
    pub key: Bytes,
    pub value: Bytes,
}

// ---------------------------------------------------------------------------
// Configuration & storage
// ---------------------------------------------------------------------------

/// Global deployment configuration, fixed at `init`.
#[contracttype]
#[derive(Clone, Debug)]
pub struct Config {
    /// Length of one settlement cycle in seconds. Must be greater than 1.
    pub cycle_secs: u32,
}

/// Namespace for all contract storage keys.
#[contracttype]
pub enum DataKey {
    /// Instance storage for the deployment configuration.
    Config,
    /// Instance storage for the sequential driver ID counter.
    NextDriverId,
    /// Persistent storage for a registered driver's address.
    Driver(u32),
    /// Persistent storage for the streaming state of (account, token).
    StreamsState(AccountId, Address),
    /// Persistent storage for one receivable delta of (account, token,
    /// cycle).
    AmtDelta(AccountId, Address, u32),
    /// Persistent storage for the squeeze cursor of (receiver, token,
    /// sender).
    Squeezed(AccountId, Address, AccountId),
    /// Persistent storage for an account's splits-list commitment.
    SplitsHash(AccountId),
    /// Persistent storage for the splittable/collectable balances of
    /// (account, token).
    SplitsBalance(AccountId, Address),
    /// Persistent storage for the total of all balances of one token.
    TotalBalance(Address),
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[soroban_sdk::contracterror]
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
#[repr(u32)]
pub enum HubError {
    /// The caller is not the registered driver of the account's driver ID.
    NotDriver = 1,
    /// No driver is registered under the account's driver ID.
    DriverNotRegistered = 2,
    /// A new receiver list is unsorted, has duplicates, a rate out of
    /// range, or is too long.
    InvalidReceiverList = 3,
    /// The presented current receiver list does not hash to the stored
    /// commitment.
    InvalidCurrentReceivers = 4,
    /// A new splits list is unsorted, has duplicates, a zero weight,
    /// weights above the total, or is too long.
    InvalidSplitsReceivers = 5,
    /// The operation would push a token's total balance above the cap.
    BalanceTooLarge = 6,
    /// The queried timestamp predates the last update.
    InvalidTimestamp = 7,
    /// The presented configuration history does not chain up to the
    /// sender's stored history hash.
    InvalidHistory = 8,
}
