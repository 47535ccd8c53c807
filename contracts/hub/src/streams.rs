//! Streaming engine: cycle model, closed-form accrual, the max-end solver
//! and the difference-array receivable bookkeeping.
//!
//! No code here ever iterates over elapsed time. Streamed amounts are
//! computed in closed form from timestamps, and schedule changes are posted
//! as per-cycle deltas into the receivers' sparse difference arrays, so the
//! cost of every operation is bounded by the number of receivers touched.

use soroban_sdk::{xdr::ToXdr, Address, BytesN, Env, Vec};

use crate::types::{
    AccountId, AmtDelta, DataKey, HubError, SqueezedState, StreamConfig, StreamReceiver,
    StreamsHistoryEntry, StreamsState, AMT_PER_SEC_MULTIPLIER, MAX_AMT_PER_SEC,
    MAX_STREAMS_RECEIVERS, MAX_TIMESTAMP, TTL_EXTEND_TO, TTL_THRESHOLD,
};

// ---------------------------------------------------------------------------
// Time & cycle model
// ---------------------------------------------------------------------------

fn cycle_secs(env: &Env) -> u64 {
    u64::from(crate::read_config(env).cycle_secs)
}

/// Index of the cycle containing `timestamp`.
///
/// Cycle 0 is reserved as the "nothing posted" sentinel of the receivable
/// cursor; ledger timestamps are far past the first cycle for any sane
/// cycle length, so the index of a live cycle is always non-zero.
pub(crate) fn cycle_of(env: &Env, timestamp: u64) -> u32 {
    (timestamp / cycle_secs(env)) as u32
}

fn cycle_start(env: &Env, timestamp: u64) -> u64 {
    timestamp - timestamp % cycle_secs(env)
}

// ---------------------------------------------------------------------------
// Receiver lists: validation & hashing
// ---------------------------------------------------------------------------

pub(crate) fn zero_hash(env: &Env) -> BytesN<32> {
    BytesN::from_array(env, &[0u8; 32])
}

/// Commitment to an ordered receiver list: keccak-256 over its canonical
/// XDR serialisation. The empty list hashes to all zeroes so a fresh
/// account verifies against an empty current list without any storage.
pub(crate) fn hash_streams(env: &Env, receivers: &Vec<StreamReceiver>) -> BytesN<32> {
    if receivers.is_empty() {
        return zero_hash(env);
    }
    let bytes = receivers.clone().to_xdr(env);
    env.crypto().keccak256(&bytes).to_bytes()
}

/// Next link of a configuration history chain.
pub(crate) fn hash_streams_history(
    env: &Env,
    prev_history_hash: &BytesN<32>,
    streams_hash: &BytesN<32>,
    update_time: u64,
    max_end: u64,
) -> BytesN<32> {
    let bytes = (
        prev_history_hash.clone(),
        streams_hash.clone(),
        update_time,
        max_end,
    )
        .to_xdr(env);
    env.crypto().keccak256(&bytes).to_bytes()
}

/// A valid list is strictly ascending (sorted, deduplicated), every rate in
/// `(0, MAX_AMT_PER_SEC]`, and at most `MAX_STREAMS_RECEIVERS` long.
pub(crate) fn validate_stream_receivers(
    receivers: &Vec<StreamReceiver>,
) -> Result<(), HubError> {
    if receivers.len() > MAX_STREAMS_RECEIVERS {
        return Err(HubError::InvalidReceiverList);
    }
    let mut prev: Option<StreamReceiver> = None;
    for receiver in receivers.iter() {
        let rate = receiver.config.amt_per_sec;
        if rate <= 0 || rate > MAX_AMT_PER_SEC {
            return Err(HubError::InvalidReceiverList);
        }
        if let Some(p) = prev {
            if p >= receiver {
                return Err(HubError::InvalidReceiverList);
            }
        }
        prev = Some(receiver);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Closed-form accrual
// ---------------------------------------------------------------------------

/// Amount streamed at `amt_per_sec` over `[start, end)`.
///
/// The formula floors once per cycle segment, exactly like the per-cycle
/// delta encoding below, so sender debits always equal the sum of receiver
/// credits to the token unit. Keep the two in lockstep when touching either.
fn streamed_amt(amt_per_sec: i128, start: u64, end: u64, cycle_secs: u64) -> i128 {
    let started_cycles = (start / cycle_secs) as i128;
    let ended_cycles = (end / cycle_secs) as i128;
    let full_cycle = cycle_secs as i128 * amt_per_sec / AMT_PER_SEC_MULTIPLIER;
    let start_part = (start % cycle_secs) as i128 * amt_per_sec / AMT_PER_SEC_MULTIPLIER;
    let end_part = (end % cycle_secs) as i128 * amt_per_sec / AMT_PER_SEC_MULTIPLIER;
    (ended_cycles - started_cycles) * full_cycle + end_part - start_part
}

/// Active time range of one configured stream, as posted when the update at
/// `update_time` ran with horizon `max_end`. A `duration` is anchored at the
/// configured start, not at the clipped one, so a start in the past does not
/// stretch the window. Returns `start == end` for an empty range.
fn stream_range(config: &StreamConfig, update_time: u64, max_end: u64) -> (u64, u64) {
    let start = if config.start == 0 { update_time } else { config.start };
    let end = if config.duration == 0 {
        max_end
    } else {
        start.saturating_add(config.duration)
    };
    let start = start.max(update_time);
    let end = end.min(max_end).max(start);
    (start, end)
}

fn balance_at_inner(
    env: &Env,
    state: &StreamsState,
    receivers: &Vec<StreamReceiver>,
    timestamp: u64,
) -> i128 {
    let secs = cycle_secs(env);
    let mut balance = state.balance;
    for receiver in receivers.iter() {
        let (start, end) = stream_range(&receiver.config, state.update_time, state.max_end);
        let end = end.min(timestamp);
        if start < end {
            balance -= streamed_amt(receiver.config.amt_per_sec, start, end, secs);
        }
    }
    assert!(balance >= 0, "streaming balance underflow");
    balance
}

/// Balance of (account, token) at `timestamp`, verified against the
/// presented current receiver list.
pub(crate) fn balance_at(
    env: &Env,
    account_id: &AccountId,
    token: &Address,
    receivers: &Vec<StreamReceiver>,
    timestamp: u64,
) -> Result<i128, HubError> {
    let state = load_streams_state(env, account_id, token);
    if hash_streams(env, receivers) != state.streams_hash {
        return Err(HubError::InvalidCurrentReceivers);
    }
    if timestamp < state.update_time {
        return Err(HubError::InvalidTimestamp);
    }
    Ok(balance_at_inner(env, &state, receivers, timestamp))
}

// ---------------------------------------------------------------------------
// Max-end solver
// ---------------------------------------------------------------------------

/// Probes one candidate horizon with the exact range function the ledger
/// posts deltas with, so the solved horizon and the posted schedules can
/// never disagree.
fn is_balance_enough(
    balance: i128,
    receivers: &Vec<StreamReceiver>,
    now: u64,
    cycle_secs: u64,
    candidate_end: u64,
) -> bool {
    let mut spent: i128 = 0;
    for receiver in receivers.iter() {
        let (start, end) = stream_range(&receiver.config, now, candidate_end);
        if start < end {
            spent += streamed_amt(receiver.config.amt_per_sec, start, end, cycle_secs);
            if spent > balance {
                return false;
            }
        }
    }
    true
}

/// Latest timestamp `balance` can fund all `receivers` to, starting at
/// `now`. Binary search over `[now, MAX_TIMESTAMP]`; receivers with future
/// starts or fixed durations make the required funds a piecewise-linear
/// function of the candidate end, which the shared closed form evaluates
/// exactly at every probe.
///
/// Up to two `hints` are tried as initial probes; a hint inside the current
/// bracket replaces one bound, anything else is ignored. Hints only ever
/// change the number of probes, never the result.
pub(crate) fn calc_max_end(
    env: &Env,
    balance: i128,
    receivers: &Vec<StreamReceiver>,
    hints: &Vec<u64>,
    now: u64,
) -> u64 {
    if receivers.is_empty() {
        return MAX_TIMESTAMP;
    }
    let secs = cycle_secs(env);
    if is_balance_enough(balance, receivers, now, secs, MAX_TIMESTAMP) {
        return MAX_TIMESTAMP;
    }
    let mut enough_end = now;
    let mut not_enough_end = MAX_TIMESTAMP;
    let mut hints_used = 0u32;
    for hint in hints.iter() {
        if hints_used >= 2 {
            break;
        }
        hints_used += 1;
        if hint > enough_end && hint < not_enough_end {
            if is_balance_enough(balance, receivers, now, secs, hint) {
                enough_end = hint;
            } else {
                not_enough_end = hint;
            }
        }
    }
    while not_enough_end - enough_end > 1 {
        let mid = enough_end + (not_enough_end - enough_end) / 2;
        if is_balance_enough(balance, receivers, now, secs, mid) {
            enough_end = mid;
        } else {
            not_enough_end = mid;
        }
    }
    enough_end
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

pub(crate) fn load_streams_state(
    env: &Env,
    account_id: &AccountId,
    token: &Address,
) -> StreamsState {
    env.storage()
        .persistent()
        .get(&DataKey::StreamsState(*account_id, token.clone()))
        .unwrap_or_else(|| StreamsState {
            streams_hash: zero_hash(env),
            history_hash: zero_hash(env),
            update_time: 0,
            balance: 0,
            max_end: 0,
            next_receivable_cycle: 0,
        })
}

fn save_streams_state(env: &Env, account_id: &AccountId, token: &Address, state: &StreamsState) {
    let key = DataKey::StreamsState(*account_id, token.clone());
    env.storage().persistent().set(&key, state);
    env.storage()
        .persistent()
        .extend_ttl(&key, TTL_THRESHOLD, TTL_EXTEND_TO);
}

fn load_delta(env: &Env, account_id: &AccountId, token: &Address, cycle: u32) -> AmtDelta {
    env.storage()
        .persistent()
        .get(&DataKey::AmtDelta(*account_id, token.clone(), cycle))
        .unwrap_or_default()
}

fn save_delta(env: &Env, account_id: &AccountId, token: &Address, cycle: u32, delta: &AmtDelta) {
    let key = DataKey::AmtDelta(*account_id, token.clone(), cycle);
    if delta.this_cycle == 0 && delta.next_cycle == 0 {
        env.storage().persistent().remove(&key);
    } else {
        env.storage().persistent().set(&key, delta);
        env.storage()
            .persistent()
            .extend_ttl(&key, TTL_THRESHOLD, TTL_EXTEND_TO);
    }
}

fn remove_delta(env: &Env, account_id: &AccountId, token: &Address, cycle: u32) {
    env.storage()
        .persistent()
        .remove(&DataKey::AmtDelta(*account_id, token.clone(), cycle));
}

// ---------------------------------------------------------------------------
// Delta posting
// ---------------------------------------------------------------------------

/// Single point write of the difference array: adding rate `amt_per_sec`
/// from `timestamp` onward splits into the part the containing cycle still
/// delivers and the part that spills into the next cycle. Truncation is
/// symmetric in the sign of the rate, so a later write with the negated
/// rate cancels this one exactly.
fn add_delta(env: &Env, account_id: &AccountId, token: &Address, timestamp: u64, amt_per_sec: i128) {
    let secs = cycle_secs(env);
    let full_cycle = secs as i128 * amt_per_sec / AMT_PER_SEC_MULTIPLIER;
    let next_cycle = (timestamp % secs) as i128 * amt_per_sec / AMT_PER_SEC_MULTIPLIER;
    let cycle = cycle_of(env, timestamp);
    let mut delta = load_delta(env, account_id, token, cycle);
    delta.this_cycle += full_cycle - next_cycle;
    delta.next_cycle += next_cycle;
    save_delta(env, account_id, token, cycle, &delta);
}

/// Posts rate `amt_per_sec` over `[start, end)` into the receiver's
/// difference array and pulls the receivable cursor back to the first
/// affected cycle if it pointed later (or nowhere).
fn add_delta_range(
    env: &Env,
    account_id: &AccountId,
    token: &Address,
    start: u64,
    end: u64,
    amt_per_sec: i128,
) {
    if start == end {
        return;
    }
    add_delta(env, account_id, token, start, amt_per_sec);
    add_delta(env, account_id, token, end, -amt_per_sec);
    let first_cycle = cycle_of(env, start);
    let mut state = load_streams_state(env, account_id, token);
    if state.next_receivable_cycle == 0 || state.next_receivable_cycle > first_cycle {
        state.next_receivable_cycle = first_cycle;
        save_streams_state(env, account_id, token, &state);
    }
}

// ---------------------------------------------------------------------------
// Streams ledger
// ---------------------------------------------------------------------------

/// Ledger half of a streams update: verifies the presented current list,
/// settles the balance in closed form, applies the (possibly clamped)
/// balance delta, solves the new horizon and reposts the receivers'
/// per-cycle deltas. Token custody is the caller's concern.
///
/// Returns the actually applied balance delta.
pub(crate) fn set_streams(
    env: &Env,
    account_id: &AccountId,
    token: &Address,
    curr_receivers: &Vec<StreamReceiver>,
    balance_delta: i128,
    new_receivers: &Vec<StreamReceiver>,
    max_end_hints: &Vec<u64>,
) -> Result<i128, HubError> {
    let now = env.ledger().timestamp();
    let mut state = load_streams_state(env, account_id, token);
    if hash_streams(env, curr_receivers) != state.streams_hash {
        return Err(HubError::InvalidCurrentReceivers);
    }

    let last_balance = balance_at_inner(env, &state, curr_receivers, now);
    let mut real_delta = balance_delta;
    // A withdrawal of more than is left clamps to withdraw-all.
    if real_delta < -last_balance {
        real_delta = -last_balance;
    }
    let new_balance = last_balance
        .checked_add(real_delta)
        .ok_or(HubError::BalanceTooLarge)?;

    validate_stream_receivers(new_receivers)?;
    let new_max_end = calc_max_end(env, new_balance, new_receivers, max_end_hints, now);

    let old_update_time = state.update_time;
    let old_max_end = state.max_end;

    // Write the sender half first: the account may stream to itself, and the
    // delta posting below must then see the updated record.
    let new_hash = hash_streams(env, new_receivers);
    state.history_hash =
        hash_streams_history(env, &state.history_hash, &new_hash, now, new_max_end);
    state.streams_hash = new_hash;
    state.update_time = now;
    state.balance = new_balance;
    state.max_end = new_max_end;
    save_streams_state(env, account_id, token, &state);

    // Tear down the undelivered tail of the old schedule; what was already
    // delivered up to `now` stays with the receivers.
    for receiver in curr_receivers.iter() {
        let (start, end) = stream_range(&receiver.config, old_update_time, old_max_end);
        let start = start.max(now);
        if start < end {
            add_delta_range(
                env,
                &receiver.account_id,
                token,
                start,
                end,
                -receiver.config.amt_per_sec,
            );
        }
    }
    // Post the new schedule under the new horizon.
    for receiver in new_receivers.iter() {
        let (start, end) = stream_range(&receiver.config, now, new_max_end);
        if start < end {
            add_delta_range(
                env,
                &receiver.account_id,
                token,
                start,
                end,
                receiver.config.amt_per_sec,
            );
        }
    }

    Ok(real_delta)
}

// ---------------------------------------------------------------------------
// Receivable accrual
// ---------------------------------------------------------------------------

fn receivable_range(env: &Env, state: &StreamsState, now: u64) -> (u32, u32) {
    let from_cycle = state.next_receivable_cycle;
    let to_cycle = cycle_of(env, now);
    if from_cycle == 0 || from_cycle > to_cycle {
        (0, 0)
    } else {
        (from_cycle, to_cycle)
    }
}

/// Count of closed cycles with unrealized receivables.
pub(crate) fn receivable_cycles(env: &Env, account_id: &AccountId, token: &Address) -> u32 {
    let state = load_streams_state(env, account_id, token);
    let (from_cycle, to_cycle) = receivable_range(env, &state, env.ledger().timestamp());
    to_cycle - from_cycle
}

/// Walks up to `max_cycles` closed cycles of the receiver's difference
/// array, realizing the accrued amount into its splittable balance. The
/// open current cycle is never walked; it is reachable early only through
/// `squeeze`. If the walk stops short, the running per-cycle amount is
/// folded into the first unvisited cycle so a later call resumes exactly.
///
/// Returns the realized amount and how many receivable cycles remain.
pub(crate) fn receive(
    env: &Env,
    account_id: &AccountId,
    token: &Address,
    max_cycles: u32,
) -> (i128, u32) {
    let now = env.ledger().timestamp();
    let mut state = load_streams_state(env, account_id, token);
    let (from_cycle, to_cycle) = receivable_range(env, &state, now);
    let to_capped = to_cycle.min(from_cycle.saturating_add(max_cycles));
    if from_cycle >= to_capped {
        return (0, to_cycle - from_cycle);
    }

    let mut amt_per_cycle: i128 = 0;
    let mut received: i128 = 0;
    for cycle in from_cycle..to_capped {
        let delta = load_delta(env, account_id, token, cycle);
        remove_delta(env, account_id, token, cycle);
        amt_per_cycle += delta.this_cycle;
        received += amt_per_cycle;
        amt_per_cycle += delta.next_cycle;
    }
    if amt_per_cycle != 0 {
        let mut delta = load_delta(env, account_id, token, to_capped);
        delta.this_cycle += amt_per_cycle;
        save_delta(env, account_id, token, to_capped, &delta);
    }
    state.next_receivable_cycle = to_capped;
    save_streams_state(env, account_id, token, &state);

    assert!(received >= 0, "receivable cycle sum went negative");
    if received > 0 {
        crate::splits::add_splittable(env, account_id, token, received);
    }
    (received, to_cycle - to_capped)
}

/// Read-only twin of [`receive`].
pub(crate) fn receive_result(
    env: &Env,
    account_id: &AccountId,
    token: &Address,
    max_cycles: u32,
) -> (i128, u32) {
    let state = load_streams_state(env, account_id, token);
    let (from_cycle, to_cycle) = receivable_range(env, &state, env.ledger().timestamp());
    let to_capped = to_cycle.min(from_cycle.saturating_add(max_cycles));
    if from_cycle >= to_capped {
        return (0, to_cycle - from_cycle);
    }
    let mut amt_per_cycle: i128 = 0;
    let mut received: i128 = 0;
    for cycle in from_cycle..to_capped {
        let delta = load_delta(env, account_id, token, cycle);
        amt_per_cycle += delta.this_cycle;
        received += amt_per_cycle;
        amt_per_cycle += delta.next_cycle;
    }
    (received, to_cycle - to_capped)
}

// ---------------------------------------------------------------------------
// Squeezing
// ---------------------------------------------------------------------------

/// Realizes what `sender_id` has streamed to `account_id` within the still
/// open current cycle, without waiting for the cycle to close.
///
/// The caller proves the sender's configuration history: `history_hash` is
/// the chain value before the first presented entry, and folding all
/// entries over it must reproduce the sender's stored chain head. The
/// realized amount is offset against the receiver's current-cycle delta so
/// the later cycle-close realization never double counts.
pub(crate) fn squeeze(
    env: &Env,
    account_id: &AccountId,
    token: &Address,
    sender_id: &AccountId,
    history_hash: &BytesN<32>,
    history: &Vec<StreamsHistoryEntry>,
) -> Result<i128, HubError> {
    let amt = squeeze_result(env, account_id, token, sender_id, history_hash, history)?;
    let now = env.ledger().timestamp();
    let curr_cycle = cycle_of(env, now);
    let squeezed_key = DataKey::Squeezed(*account_id, token.clone(), *sender_id);
    env.storage().persistent().set(
        &squeezed_key,
        &SqueezedState {
            cycle: curr_cycle,
            next_squeezed: now,
        },
    );
    env.storage()
        .persistent()
        .extend_ttl(&squeezed_key, TTL_THRESHOLD, TTL_EXTEND_TO);

    if amt > 0 {
        let mut delta = load_delta(env, account_id, token, curr_cycle);
        delta.this_cycle -= amt;
        delta.next_cycle += amt;
        save_delta(env, account_id, token, curr_cycle, &delta);

        let mut state = load_streams_state(env, account_id, token);
        if state.next_receivable_cycle == 0 || state.next_receivable_cycle > curr_cycle {
            state.next_receivable_cycle = curr_cycle;
            save_streams_state(env, account_id, token, &state);
        }
        crate::splits::add_splittable(env, account_id, token, amt);
    }
    Ok(amt)
}

/// Read-only twin of [`squeeze`]: verifies the history and reports the
/// squeezable amount without mutating anything.
pub(crate) fn squeeze_result(
    env: &Env,
    account_id: &AccountId,
    token: &Address,
    sender_id: &AccountId,
    history_hash: &BytesN<32>,
    history: &Vec<StreamsHistoryEntry>,
) -> Result<i128, HubError> {
    let sender_state = load_streams_state(env, sender_id, token);
    verify_history(env, &sender_state, history_hash, history)?;

    let now = env.ledger().timestamp();
    let secs = cycle_secs(env);
    let curr_cycle = cycle_of(env, now);
    let mut start_cap = cycle_start(env, now);
    if let Some(squeezed) = env
        .storage()
        .persistent()
        .get::<DataKey, SqueezedState>(&DataKey::Squeezed(*account_id, token.clone(), *sender_id))
    {
        if squeezed.cycle == curr_cycle && squeezed.next_squeezed > start_cap {
            start_cap = squeezed.next_squeezed;
        }
    }

    // Walk the history newest to oldest. Each entry applies from its own
    // update time up to where the next newer entry took over; hash-only
    // entries verify the chain but cannot be squeezed from.
    let mut amt: i128 = 0;
    let mut end_cap = now;
    let len = history.len();
    for i in 0..len {
        if end_cap <= start_cap {
            break;
        }
        let entry = history.get_unchecked(len - 1 - i);
        if !entry.receivers.is_empty() {
            amt += squeezed_entry_amt(account_id, &entry, start_cap, end_cap, secs);
        }
        end_cap = end_cap.min(entry.update_time);
    }
    Ok(amt)
}

fn verify_history(
    env: &Env,
    sender_state: &StreamsState,
    history_hash: &BytesN<32>,
    history: &Vec<StreamsHistoryEntry>,
) -> Result<(), HubError> {
    let zero = zero_hash(env);
    let mut hash = history_hash.clone();
    for entry in history.iter() {
        let entry_hash = if entry.receivers.is_empty() {
            entry.streams_hash.clone()
        } else {
            if entry.streams_hash != zero {
                return Err(HubError::InvalidHistory);
            }
            hash_streams(env, &entry.receivers)
        };
        hash = hash_streams_history(env, &hash, &entry_hash, entry.update_time, entry.max_end);
    }
    if hash != sender_state.history_hash {
        return Err(HubError::InvalidHistory);
    }
    Ok(())
}

fn squeezed_entry_amt(
    account_id: &AccountId,
    entry: &StreamsHistoryEntry,
    start_cap: u64,
    end_cap: u64,
    cycle_secs: u64,
) -> i128 {
    let mut amt: i128 = 0;
    for receiver in entry.receivers.iter() {
        if receiver.account_id != *account_id {
            continue;
        }
        let (start, end) = stream_range(&receiver.config, entry.update_time, entry.max_end);
        let start = start.max(start_cap);
        let end = end.min(end_cap);
        if start < end {
            amt += streamed_amt(receiver.config.amt_per_sec, start, end, cycle_secs);
        }
    }
    amt
}
