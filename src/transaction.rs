//! Transaction validation
//!
//! Two layers: `check_transaction` needs no chain context, while
//! `check_transaction_inputs` resolves inputs against a ledger view. The
//! contextual checks run cheapest-first and short-circuit, so script
//! evaluation is only reached by transactions that already balance.

use std::collections::HashSet;

use crate::coins::LedgerView;
use crate::error::TxError;
use crate::params::ConsensusParams;
use crate::script::{ScriptVerifier, TxContext};
use crate::types::{Coin, Integer, Natural, Transaction};

/// Context-free structural checks.
///
/// A transaction passes when it has inputs and outputs, every output value
/// sits inside the supply bound (individually and summed), no input is
/// referenced twice, only a coinbase carries the null reference, and the
/// serialized form fits the size bound.
pub fn check_transaction(tx: &Transaction, params: &ConsensusParams) -> Result<(), TxError> {
    if tx.inputs.is_empty() || tx.outputs.is_empty() {
        return Err(TxError::Empty);
    }

    let mut total: Integer = 0;
    for (index, output) in tx.outputs.iter().enumerate() {
        if output.value < 0 || output.value > params.max_money {
            return Err(TxError::OutputValueOutOfRange { index });
        }
        total = total
            .checked_add(output.value)
            .filter(|sum| *sum <= params.max_money)
            .ok_or(TxError::ValueOverflow)?;
    }

    let mut seen = HashSet::with_capacity(tx.inputs.len());
    for (index, input) in tx.inputs.iter().enumerate() {
        if !seen.insert(&input.prevout) {
            return Err(TxError::DuplicateInput { index });
        }
    }

    if !tx.is_coinbase() {
        for (index, input) in tx.inputs.iter().enumerate() {
            if input.prevout.is_null() {
                return Err(TxError::NullPrevout { index });
            }
        }
    }

    let size = tx.serialized_size();
    if size > params.max_tx_size {
        return Err(TxError::Oversized { size });
    }

    Ok(())
}

/// Contextual checks against a ledger view; returns the fee.
///
/// Order is policy, not accident, later checks cost more:
/// 1. every input resolves,
/// 2. coinbase-sourced inputs are mature,
/// 3. input sums stay inside the supply bound,
/// 4. inputs cover outputs,
/// 5. every witness satisfies its locking script.
///
/// Never mutates the view; callers apply spends and additions only after
/// the whole transaction passed.
pub fn check_transaction_inputs<V: LedgerView + ?Sized>(
    tx: &Transaction,
    view: &V,
    spend_height: Natural,
    params: &ConsensusParams,
    verifier: &dyn ScriptVerifier,
) -> Result<Integer, TxError> {
    // Coinbase inputs resolve nothing; their reward is bounded at the
    // block level where fees are known.
    if tx.is_coinbase() {
        return Ok(0);
    }

    let mut coins: Vec<Coin> = Vec::with_capacity(tx.inputs.len());
    for (index, input) in tx.inputs.iter().enumerate() {
        match view.get(&input.prevout)? {
            Some(coin) => coins.push(coin),
            None => return Err(TxError::MissingInput { index }),
        }
    }

    for coin in &coins {
        if coin.is_coinbase {
            let matures_at = coin.height + params.coinbase_maturity;
            if spend_height < matures_at {
                return Err(TxError::PrematureSpend { matures_at });
            }
        }
    }

    let mut total_in: Integer = 0;
    for coin in &coins {
        total_in = total_in
            .checked_add(coin.value)
            .filter(|sum| *sum <= params.max_money)
            .ok_or(TxError::ValueOverflow)?;
    }

    let total_out = tx.total_output_value();
    if total_in < total_out {
        return Err(TxError::NegativeFee);
    }

    for (index, (input, coin)) in tx.inputs.iter().zip(&coins).enumerate() {
        let ctx = TxContext {
            tx,
            input_index: index,
            value: coin.value,
        };
        if !verifier.verify(&coin.lock_script, &input.witness, &ctx) {
            return Err(TxError::ScriptFailure { index });
        }
    }

    Ok(total_in - total_out)
}
