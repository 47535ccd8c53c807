//! Splits graph: weighted fan-out of an account's splittable balance.
//!
//! Configurations are committed by hash only; distribution uses cumulative
//! weights so that the parts handed out plus the remainder reconstruct the
//! split amount exactly, whatever the rounding does per receiver.

use soroban_sdk::{symbol_short, xdr::ToXdr, Address, BytesN, Env, Vec};

use crate::streams::zero_hash;
use crate::types::{
    AccountId, DataKey, HubError, SplitsBalance, SplitsReceiver, MAX_SPLITS_RECEIVERS,
    TOTAL_SPLITS_WEIGHT, TTL_EXTEND_TO, TTL_THRESHOLD,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Commitment to an ordered splits list; the empty list hashes to all
/// zeroes.
pub(crate) fn hash_splits(env: &Env, receivers: &Vec<SplitsReceiver>) -> BytesN<32> {
    if receivers.is_empty() {
        return zero_hash(env);
    }
    let bytes = receivers.clone().to_xdr(env);
    env.crypto().keccak256(&bytes).to_bytes()
}

/// A valid list is strictly ascending by account, every weight non-zero,
/// the weights summing to at most `TOTAL_SPLITS_WEIGHT`, and at most
/// `MAX_SPLITS_RECEIVERS` long.
fn validate_splits_receivers(receivers: &Vec<SplitsReceiver>) -> Result<(), HubError> {
    if receivers.len() > MAX_SPLITS_RECEIVERS {
        return Err(HubError::InvalidSplitsReceivers);
    }
    let mut total_weight: u64 = 0;
    let mut prev: Option<SplitsReceiver> = None;
    for receiver in receivers.iter() {
        if receiver.weight == 0 {
            return Err(HubError::InvalidSplitsReceivers);
        }
        total_weight += u64::from(receiver.weight);
        if total_weight > u64::from(TOTAL_SPLITS_WEIGHT) {
            return Err(HubError::InvalidSplitsReceivers);
        }
        if let Some(p) = prev {
            if p.account_id >= receiver.account_id {
                return Err(HubError::InvalidSplitsReceivers);
            }
        }
        prev = Some(receiver);
    }
    Ok(())
}

pub(crate) fn splits_hash(env: &Env, account_id: &AccountId) -> BytesN<32> {
    env.storage()
        .persistent()
        .get(&DataKey::SplitsHash(*account_id))
        .unwrap_or_else(|| zero_hash(env))
}

/// Validates and commits a new splits configuration. Only the hash is
/// stored; the full list goes out in the event for off-chain
/// reconstruction.
pub(crate) fn set_splits(
    env: &Env,
    account_id: &AccountId,
    receivers: &Vec<SplitsReceiver>,
) -> Result<(), HubError> {
    validate_splits_receivers(receivers)?;
    let hash = hash_splits(env, receivers);
    let key = DataKey::SplitsHash(*account_id);
    env.storage().persistent().set(&key, &hash);
    env.storage()
        .persistent()
        .extend_ttl(&key, TTL_THRESHOLD, TTL_EXTEND_TO);
    env.events().publish(
        (symbol_short!("splits"), *account_id),
        (hash, receivers.clone()),
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Balances
// ---------------------------------------------------------------------------

pub(crate) fn load_balance(env: &Env, account_id: &AccountId, token: &Address) -> SplitsBalance {
    env.storage()
        .persistent()
        .get(&DataKey::SplitsBalance(*account_id, token.clone()))
        .unwrap_or_default()
}

fn save_balance(env: &Env, account_id: &AccountId, token: &Address, balance: &SplitsBalance) {
    let key = DataKey::SplitsBalance(*account_id, token.clone());
    env.storage().persistent().set(&key, balance);
    env.storage()
        .persistent()
        .extend_ttl(&key, TTL_THRESHOLD, TTL_EXTEND_TO);
}

pub(crate) fn add_splittable(env: &Env, account_id: &AccountId, token: &Address, amt: i128) {
    if amt == 0 {
        return;
    }
    let mut balance = load_balance(env, account_id, token);
    balance.splittable = balance
        .splittable
        .checked_add(amt)
        .expect("splittable balance overflow");
    save_balance(env, account_id, token, &balance);
}

/// Zeroes and returns the collectable balance.
pub(crate) fn take_collectable(env: &Env, account_id: &AccountId, token: &Address) -> i128 {
    let mut balance = load_balance(env, account_id, token);
    let amt = balance.collectable;
    if amt > 0 {
        balance.collectable = 0;
        save_balance(env, account_id, token, &balance);
    }
    amt
}

// ---------------------------------------------------------------------------
// Splitting
// ---------------------------------------------------------------------------

/// `floor(amt * weight / TOTAL_SPLITS_WEIGHT)` without the intermediate
/// product leaving `i128`.
fn weight_share(amt: i128, weight: i128) -> i128 {
    let total = i128::from(TOTAL_SPLITS_WEIGHT);
    (amt / total) * weight + (amt % total) * weight / total
}

/// Distributes the splittable balance of (account, token) through the
/// presented current splits list.
///
/// Each receiver gets the cumulative-weight share, so the parts plus the
/// remainder always equal the split amount exactly. Shares of other
/// accounts land in their splittable balances (one level per call, never
/// cascading further); a self-receiver's share and the remainder go
/// straight to the account's collectable balance.
///
/// Returns `(collectable_amt, split_amt)`.
pub(crate) fn split(
    env: &Env,
    account_id: &AccountId,
    token: &Address,
    curr_receivers: &Vec<SplitsReceiver>,
) -> Result<(i128, i128), HubError> {
    if hash_splits(env, curr_receivers) != splits_hash(env, account_id) {
        return Err(HubError::InvalidCurrentReceivers);
    }
    let mut balance = load_balance(env, account_id, token);
    let splittable = balance.splittable;
    if splittable == 0 {
        return Ok((0, 0));
    }

    let mut split_amt: i128 = 0;
    let mut self_amt: i128 = 0;
    let mut cumulative_weight: i128 = 0;
    for receiver in curr_receivers.iter() {
        cumulative_weight += i128::from(receiver.weight);
        let share = weight_share(splittable, cumulative_weight) - split_amt;
        split_amt += share;
        if receiver.account_id == *account_id {
            self_amt += share;
        } else {
            add_splittable(env, &receiver.account_id, token, share);
        }
        env.events().publish(
            (symbol_short!("split"), *account_id, receiver.account_id),
            (token.clone(), share),
        );
    }

    let collectable_amt = splittable - split_amt;
    balance.splittable = 0;
    balance.collectable = balance
        .collectable
        .checked_add(collectable_amt + self_amt)
        .expect("collectable balance overflow");
    save_balance(env, account_id, token, &balance);
    Ok((collectable_amt, split_amt))
}

/// Pure preview of [`split`] for an arbitrary amount.
pub(crate) fn split_result(
    env: &Env,
    account_id: &AccountId,
    curr_receivers: &Vec<SplitsReceiver>,
    amount: i128,
) -> Result<(i128, i128), HubError> {
    if hash_splits(env, curr_receivers) != splits_hash(env, account_id) {
        return Err(HubError::InvalidCurrentReceivers);
    }
    let mut split_amt: i128 = 0;
    let mut cumulative_weight: i128 = 0;
    for receiver in curr_receivers.iter() {
        cumulative_weight += i128::from(receiver.weight);
        split_amt = weight_share(amount, cumulative_weight);
    }
    Ok((amount - split_amt, split_amt))
}
