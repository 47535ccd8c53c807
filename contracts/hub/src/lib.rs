#![no_std]

mod splits;
mod streams;
mod types;

use soroban_sdk::{contract, contractimpl, symbol_short, token, Address, BytesN, Env, Vec};

pub use types::{
    AccountId, AccountMetadata, AmtDelta, Config, DataKey, HubError, SplitsBalance,
    SplitsReceiver, SqueezedState, StreamConfig, StreamReceiver, StreamsHistoryEntry,
    StreamsState, AMT_PER_SEC_EXTRA_DECIMALS, AMT_PER_SEC_MULTIPLIER, MAX_AMT_PER_SEC,
    MAX_SPLITS_RECEIVERS, MAX_STREAMS_RECEIVERS, MAX_TIMESTAMP, MAX_TOTAL_BALANCE,
    TOTAL_SPLITS_WEIGHT, TTL_EXTEND_TO, TTL_THRESHOLD,
};

// ---------------------------------------------------------------------------
// Storage helpers
// ---------------------------------------------------------------------------

pub(crate) fn read_config(env: &Env) -> Config {
    env.storage()
        .instance()
        .get(&DataKey::Config)
        .expect("contract not initialised: missing config")
}

fn read_total_balance(env: &Env, token: &Address) -> i128 {
    env.storage()
        .persistent()
        .get(&DataKey::TotalBalance(token.clone()))
        .unwrap_or(0)
}

fn write_total_balance(env: &Env, token: &Address, total: i128) {
    let key = DataKey::TotalBalance(token.clone());
    env.storage().persistent().set(&key, &total);
    env.storage()
        .persistent()
        .extend_ttl(&key, TTL_THRESHOLD, TTL_EXTEND_TO);
}

fn add_total_balance(env: &Env, token: &Address, amt: i128) -> Result<(), HubError> {
    let total = read_total_balance(env, token)
        .checked_add(amt)
        .filter(|total| *total <= MAX_TOTAL_BALANCE)
        .ok_or(HubError::BalanceTooLarge)?;
    write_total_balance(env, token, total);
    Ok(())
}

fn sub_total_balance(env: &Env, token: &Address, amt: i128) {
    let total = read_total_balance(env, token) - amt;
    assert!(total >= 0, "token total balance underflow");
    write_total_balance(env, token, total);
}

/// Checks that `driver` is the registered driver of the account's driver
/// ID. Every balance-changing entry point goes through this; read-only
/// queries are unrestricted.
fn require_driver(env: &Env, driver: &Address, account_id: &AccountId) -> Result<(), HubError> {
    let registered: Address = env
        .storage()
        .persistent()
        .get(&DataKey::Driver(account_id.driver_id))
        .ok_or(HubError::DriverNotRegistered)?;
    if registered != *driver {
        return Err(HubError::NotDriver);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Contract Implementation
// ---------------------------------------------------------------------------

#[contract]
pub struct FluxoraHub;

#[contractimpl]
impl FluxoraHub {
    /// Initialise the hub with its settlement cycle length.
    ///
    /// This function must be called exactly once before any other contract
    /// operation. `cycle_secs` is the length in seconds of the settlement
    /// cycles that batch receivable accrual; it is fixed for the lifetime
    /// of the deployment, because every stored cycle index and posted
    /// delta is derived from it.
    ///
    /// # Panics
    /// - If called more than once (contract already initialized)
    /// - If `cycle_secs` is not greater than 1
    pub fn init(env: Env, cycle_secs: u32) {
        if env.storage().instance().has(&DataKey::Config) {
            panic!("already initialised");
        }
        assert!(cycle_secs > 1, "cycle_secs must be greater than 1");
        env.storage()
            .instance()
            .set(&DataKey::Config, &Config { cycle_secs });
        env.storage().instance().set(&DataKey::NextDriverId, &0u32);
        env.storage()
            .instance()
            .extend_ttl(TTL_THRESHOLD, TTL_EXTEND_TO);
    }

    /// The settlement cycle length in seconds.
    pub fn cycle_secs(env: Env) -> u32 {
        read_config(&env).cycle_secs
    }

    // -----------------------------------------------------------------------
    // Driver registry
    // -----------------------------------------------------------------------

    /// Register `driver_addr` as a new driver and return its driver ID.
    ///
    /// IDs are assigned sequentially and never reused. The registered
    /// address becomes the only caller allowed to mutate accounts whose
    /// `driver_id` matches; it can later be rotated with
    /// `update_driver_address`. Registration is permissionless but must be
    /// authorized by the address being registered.
    ///
    /// # Events
    /// - Publishes `drv_reg(driver_id, driver_addr)` on success
    pub fn register_driver(env: Env, driver_addr: Address) -> u32 {
        driver_addr.require_auth();
        let driver_id: u32 = env
            .storage()
            .instance()
            .get(&DataKey::NextDriverId)
            .unwrap_or(0);
        env.storage()
            .instance()
            .set(&DataKey::NextDriverId, &(driver_id + 1));
        let key = DataKey::Driver(driver_id);
        env.storage().persistent().set(&key, &driver_addr);
        env.storage()
            .persistent()
            .extend_ttl(&key, TTL_THRESHOLD, TTL_EXTEND_TO);
        env.events()
            .publish((symbol_short!("drv_reg"), driver_id), driver_addr);
        driver_id
    }

    /// The registered address of `driver_id`.
    pub fn driver_address(env: Env, driver_id: u32) -> Result<Address, HubError> {
        env.storage()
            .persistent()
            .get(&DataKey::Driver(driver_id))
            .ok_or(HubError::DriverNotRegistered)
    }

    /// Rotate the registered address of `driver_id` to `new_addr`.
    ///
    /// Requires authorization from the currently registered address. The
    /// new address immediately takes over the whole account ID range of
    /// the driver.
    ///
    /// # Events
    /// - Publishes `drv_upd(driver_id, new_addr)` on success
    pub fn update_driver_address(
        env: Env,
        driver_id: u32,
        new_addr: Address,
    ) -> Result<(), HubError> {
        let current: Address = env
            .storage()
            .persistent()
            .get(&DataKey::Driver(driver_id))
            .ok_or(HubError::DriverNotRegistered)?;
        current.require_auth();
        let key = DataKey::Driver(driver_id);
        env.storage().persistent().set(&key, &new_addr);
        env.storage()
            .persistent()
            .extend_ttl(&key, TTL_THRESHOLD, TTL_EXTEND_TO);
        env.events()
            .publish((symbol_short!("drv_upd"), driver_id), new_addr);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Streams
    // -----------------------------------------------------------------------

    /// Reconfigure the streams of `account_id` for `token`.
    ///
    /// This is the single mutation point of the streaming ledger: it
    /// settles what the old configuration has streamed out so far (in
    /// closed form, never by iterating over elapsed time), applies the
    /// balance change, commits the new receiver list and reposts the
    /// per-cycle deltas of every receiver affected by the change.
    ///
    /// # Parameters
    /// - `driver`: the registered driver of the account; must authorize
    /// - `curr_receivers`: the exact current receiver list; verified
    ///   against the stored commitment
    /// - `balance_delta`: tokens to add (positive, pulled from the driver)
    ///   or withdraw (negative, paid to `transfer_to`); a withdrawal of
    ///   more than is left clamps to withdraw-all
    /// - `new_receivers`: the new list, sorted by (account, config),
    ///   deduplicated, rates in range, at most 100 entries
    /// - `max_end_hints`: up to two optional timestamps seeding the
    ///   max-end search; they can only save work, never change the result
    ///
    /// # Returns
    /// - The actually applied balance delta. Differs from `balance_delta`
    ///   only when a withdrawal was clamped.
    ///
    /// # Errors
    /// - `NotDriver` / `DriverNotRegistered` on authorization failure
    /// - `InvalidCurrentReceivers` if `curr_receivers` does not hash to
    ///   the stored commitment
    /// - `InvalidReceiverList` if `new_receivers` is malformed
    /// - `BalanceTooLarge` if the deposit would push the token total over
    ///   the cap
    ///
    /// # Events
    /// - Publishes `streams(account_id, token)` with the new commitment,
    ///   balance and horizon, and `strm_rcvs(hash)` carrying the full new
    ///   receiver list for off-chain reconstruction
    #[allow(clippy::too_many_arguments)]
    pub fn set_streams(
        env: Env,
        driver: Address,
        account_id: AccountId,
        token: Address,
        curr_receivers: Vec<StreamReceiver>,
        balance_delta: i128,
        new_receivers: Vec<StreamReceiver>,
        max_end_hints: Vec<u64>,
        transfer_to: Address,
    ) -> Result<i128, HubError> {
        driver.require_auth();
        require_driver(&env, &driver, &account_id)?;

        let real_delta = streams::set_streams(
            &env,
            &account_id,
            &token,
            &curr_receivers,
            balance_delta,
            &new_receivers,
            &max_end_hints,
        )?;

        // All ledger state is settled above; only then move real tokens.
        if real_delta > 0 {
            add_total_balance(&env, &token, real_delta)?;
            token::Client::new(&env, &token).transfer(
                &driver,
                &env.current_contract_address(),
                &real_delta,
            );
        } else if real_delta < 0 {
            sub_total_balance(&env, &token, -real_delta);
            token::Client::new(&env, &token).transfer(
                &env.current_contract_address(),
                &transfer_to,
                &(-real_delta),
            );
        }

        let state = streams::load_streams_state(&env, &account_id, &token);
        env.events().publish(
            (symbol_short!("streams"), account_id, token),
            (state.streams_hash.clone(), state.balance, state.max_end),
        );
        env.events().publish(
            (symbol_short!("strm_rcvs"), state.streams_hash),
            new_receivers,
        );
        Ok(real_delta)
    }

    /// Transfer `amt` of `token` from the giving account straight into the
    /// receiver's splittable balance, skipping streaming entirely.
    ///
    /// The tokens are pulled from the driver. Fails with `BalanceTooLarge`
    /// if the token total would exceed the cap.
    ///
    /// # Events
    /// - Publishes `given(account_id, receiver)` with the token and amount
    pub fn give(
        env: Env,
        driver: Address,
        account_id: AccountId,
        receiver: AccountId,
        token: Address,
        amt: i128,
    ) -> Result<(), HubError> {
        driver.require_auth();
        require_driver(&env, &driver, &account_id)?;
        assert!(amt >= 0, "given amount must not be negative");

        add_total_balance(&env, &token, amt)?;
        splits::add_splittable(&env, &receiver, &token, amt);
        if amt > 0 {
            token::Client::new(&env, &token).transfer(&driver, &env.current_contract_address(), &amt);
        }
        env.events().publish(
            (symbol_short!("given"), account_id, receiver),
            (token, amt),
        );
        Ok(())
    }

    /// Streaming state of (account, token): list and history commitments,
    /// last update time, last settled balance, horizon and the receivable
    /// cursor.
    pub fn streams_state(env: Env, account_id: AccountId, token: Address) -> StreamsState {
        streams::load_streams_state(&env, &account_id, &token)
    }

    /// Streaming balance of (account, token) at `timestamp`, verified
    /// against the presented current receiver list.
    ///
    /// # Errors
    /// - `InvalidCurrentReceivers` on a commitment mismatch
    /// - `InvalidTimestamp` if `timestamp` predates the last update
    pub fn balance_at(
        env: Env,
        account_id: AccountId,
        token: Address,
        receivers: Vec<StreamReceiver>,
        timestamp: u64,
    ) -> Result<i128, HubError> {
        streams::balance_at(&env, &account_id, &token, &receivers, timestamp)
    }

    // -----------------------------------------------------------------------
    // Receivable accrual
    // -----------------------------------------------------------------------

    /// Realize closed settlement cycles of (account, token) into its
    /// splittable balance.
    ///
    /// Walks at most `max_cycles` cycles, so a receiver with a long
    /// backlog pays it down over several calls instead of one unbounded
    /// one; anyone may call this on anyone's behalf, funds only ever flow
    /// toward the receiver. Calling with `max_cycles == 0` or with nothing
    /// due is a no-op returning zero.
    ///
    /// # Returns
    /// - The realized amount and the number of receivable cycles left
    ///
    /// # Events
    /// - Publishes `received(account_id)` when anything was realized
    pub fn receive_streams(
        env: Env,
        account_id: AccountId,
        token: Address,
        max_cycles: u32,
    ) -> (i128, u32) {
        let (amt, cycles_left) = streams::receive(&env, &account_id, &token, max_cycles);
        if amt > 0 {
            env.events().publish(
                (symbol_short!("received"), account_id),
                (token, amt, cycles_left),
            );
        }
        (amt, cycles_left)
    }

    /// Read-only preview of `receive_streams`.
    pub fn receive_streams_result(
        env: Env,
        account_id: AccountId,
        token: Address,
        max_cycles: u32,
    ) -> (i128, u32) {
        streams::receive_result(&env, &account_id, &token, max_cycles)
    }

    /// Number of closed cycles (account, token) can currently realize.
    pub fn receivable_streams_cycles(env: Env, account_id: AccountId, token: Address) -> u32 {
        streams::receivable_cycles(&env, &account_id, &token)
    }

    /// Realize what `sender_id` has streamed to `account_id` within the
    /// still open current cycle, without waiting for the cycle to close.
    ///
    /// The caller proves the sender's configuration history:
    /// `history_hash` is the chain value before the first entry of
    /// `history`, and folding all entries over it must reproduce the
    /// sender's stored chain head. Entries carrying their full receiver
    /// list are replayed; hash-only entries verify the chain but are
    /// skipped. Squeezed funds are offset against the current cycle's
    /// delta, so realizing the cycle later never double counts.
    ///
    /// # Errors
    /// - `InvalidHistory` if the presented history does not chain up to
    ///   the sender's stored commitment
    ///
    /// # Events
    /// - Publishes `squeezed(account_id)` when anything was realized
    pub fn squeeze_streams(
        env: Env,
        account_id: AccountId,
        token: Address,
        sender_id: AccountId,
        history_hash: BytesN<32>,
        history: Vec<StreamsHistoryEntry>,
    ) -> Result<i128, HubError> {
        let amt = streams::squeeze(&env, &account_id, &token, &sender_id, &history_hash, &history)?;
        if amt > 0 {
            env.events().publish(
                (symbol_short!("squeezed"), account_id),
                (token, sender_id, amt),
            );
        }
        Ok(amt)
    }

    /// Read-only preview of `squeeze_streams`.
    pub fn squeeze_streams_result(
        env: Env,
        account_id: AccountId,
        token: Address,
        sender_id: AccountId,
        history_hash: BytesN<32>,
        history: Vec<StreamsHistoryEntry>,
    ) -> Result<i128, HubError> {
        streams::squeeze_result(&env, &account_id, &token, &sender_id, &history_hash, &history)
    }

    // -----------------------------------------------------------------------
    // Splits
    // -----------------------------------------------------------------------

    /// Commit a new splits configuration for `account_id`.
    ///
    /// Only the hash is stored; the full list is published in the event.
    /// The configuration applies to whatever is split after this call,
    /// not retroactively.
    ///
    /// # Errors
    /// - `InvalidSplitsReceivers` if the list is unsorted, has duplicates,
    ///   a zero weight, weights summing above the total, or is too long
    pub fn set_splits(
        env: Env,
        driver: Address,
        account_id: AccountId,
        receivers: Vec<SplitsReceiver>,
    ) -> Result<(), HubError> {
        driver.require_auth();
        require_driver(&env, &driver, &account_id)?;
        splits::set_splits(&env, &account_id, &receivers)
    }

    /// Distribute the splittable balance of (account, token) through the
    /// presented current splits list. Permissionless; splitting can only
    /// move funds the way the account configured.
    ///
    /// Each receiver gets `weight / TOTAL_SPLITS_WEIGHT` of the balance,
    /// rounded down; the rounding remainder and the share of the account
    /// itself go to its collectable balance. Receivers' shares land in
    /// their splittable balances and cascade no further within this call.
    ///
    /// # Returns
    /// - `(collectable_amt, split_amt)`: what stayed with the account and
    ///   what went to the receivers; together exactly the split balance
    ///
    /// # Errors
    /// - `InvalidCurrentReceivers` on a commitment mismatch
    pub fn split(
        env: Env,
        account_id: AccountId,
        token: Address,
        curr_receivers: Vec<SplitsReceiver>,
    ) -> Result<(i128, i128), HubError> {
        splits::split(&env, &account_id, &token, &curr_receivers)
    }

    /// Pure preview of `split` for an arbitrary amount.
    pub fn split_result(
        env: Env,
        account_id: AccountId,
        curr_receivers: Vec<SplitsReceiver>,
        amount: i128,
    ) -> Result<(i128, i128), HubError> {
        splits::split_result(&env, &account_id, &curr_receivers, amount)
    }

    /// Splittable balance of (account, token).
    pub fn splittable(env: Env, account_id: AccountId, token: Address) -> i128 {
        splits::load_balance(&env, &account_id, &token).splittable
    }

    /// Collectable balance of (account, token).
    pub fn collectable(env: Env, account_id: AccountId, token: Address) -> i128 {
        splits::load_balance(&env, &account_id, &token).collectable
    }

    /// Withdraw the collectable balance of (account, token) to
    /// `transfer_to`.
    ///
    /// The only outbound token movement besides `set_streams` withdrawals.
    /// State is settled before the transfer.
    ///
    /// # Returns
    /// - The withdrawn amount, zero when nothing was collectable
    ///
    /// # Events
    /// - Publishes `collected(account_id)` with the token and amount
    pub fn collect(
        env: Env,
        driver: Address,
        account_id: AccountId,
        token: Address,
        transfer_to: Address,
    ) -> Result<i128, HubError> {
        driver.require_auth();
        require_driver(&env, &driver, &account_id)?;

        let amt = splits::take_collectable(&env, &account_id, &token);
        if amt > 0 {
            sub_total_balance(&env, &token, amt);
            token::Client::new(&env, &token).transfer(
                &env.current_contract_address(),
                &transfer_to,
                &amt,
            );
        }
        env.events()
            .publish((symbol_short!("collected"), account_id), (token, amt));
        Ok(amt)
    }

    // -----------------------------------------------------------------------
    // Commitments & totals
    // -----------------------------------------------------------------------

    /// Commitment of an ordered stream receiver list; all zeroes for the
    /// empty list.
    pub fn hash_streams(env: Env, receivers: Vec<StreamReceiver>) -> BytesN<32> {
        streams::hash_streams(&env, &receivers)
    }

    /// Next link of a configuration history chain, for callers assembling
    /// squeeze histories off-chain.
    pub fn hash_streams_history(
        env: Env,
        prev_history_hash: BytesN<32>,
        streams_hash: BytesN<32>,
        update_time: u64,
        max_end: u64,
    ) -> BytesN<32> {
        streams::hash_streams_history(&env, &prev_history_hash, &streams_hash, update_time, max_end)
    }

    /// Commitment of an ordered splits receiver list; all zeroes for the
    /// empty list.
    pub fn hash_splits(env: Env, receivers: Vec<SplitsReceiver>) -> BytesN<32> {
        splits::hash_splits(&env, &receivers)
    }

    /// Stored splits commitment of `account_id`.
    pub fn splits_hash(env: Env, account_id: AccountId) -> BytesN<32> {
        splits::splits_hash(&env, &account_id)
    }

    /// Total of all balances of `token` held by the hub: streaming
    /// balances plus everything receivable, splittable and collectable.
    pub fn total_balance(env: Env, token: Address) -> i128 {
        read_total_balance(&env, &token)
    }

    // -----------------------------------------------------------------------
    // Metadata
    // -----------------------------------------------------------------------

    /// Publish arbitrary metadata for `account_id`. Nothing is stored;
    /// off-chain indexers are the only consumer.
    pub fn emit_account_metadata(
        env: Env,
        driver: Address,
        account_id: AccountId,
        metadata: Vec<AccountMetadata>,
    ) -> Result<(), HubError> {
        driver.require_auth();
        require_driver(&env, &driver, &account_id)?;
        env.events()
            .publish((symbol_short!("meta"), account_id), metadata);
        Ok(())
    }
}
