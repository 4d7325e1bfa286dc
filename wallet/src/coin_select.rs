//! Unspent output listing and greedy per-asset coin selection.

use std::collections::{HashMap, HashSet};

use elements::{Address, AssetId, OutPoint, Transaction};
use tracing::warn;

use crate::error::WalletError;
use crate::network::Network;
use crate::store::WalletRepository;
use crate::unblind::UnblindedOutput;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Target {
    pub asset: AssetId,
    pub amount: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeOutput {
    pub address: Address,
    pub asset: AssetId,
    pub value: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CoinSelection {
    pub selected: Vec<UnblindedOutput>,
    pub change: Vec<ChangeOutput>,
}

impl CoinSelection {
    pub fn selected_value(&self, asset: &AssetId) -> u64 {
        self.selected
            .iter()
            .filter(|utxo| utxo.blinding.asset == *asset)
            .map(|utxo| utxo.blinding.value)
            .sum()
    }
}

/// Per-asset totals of `utxos`.
pub fn balances(utxos: &[UnblindedOutput]) -> HashMap<AssetId, u64> {
    let mut totals = HashMap::new();
    for utxo in utxos {
        *totals.entry(utxo.blinding.asset).or_insert(0u64) += utxo.blinding.value;
    }
    totals
}

/// Outputs to wallet scripts with blinding data that no known transaction
/// spends.
pub fn list_unspents(
    store: &dyn WalletRepository,
    network: Network,
) -> Result<Vec<UnblindedOutput>, WalletError> {
    let owned = store.get_account_scripts(network, None)?;
    let mut spent: HashSet<OutPoint> = HashSet::new();
    for (txid, details) in store.list_transactions(network)? {
        let Some(hex) = details.hex else {
            continue;
        };
        let tx: Transaction = match hex::decode(&hex)
            .map_err(WalletError::from)
            .and_then(|bytes| Ok(elements::encode::deserialize(&bytes)?))
        {
            Ok(tx) => tx,
            Err(err) => {
                warn!(%txid, error = %err, "skipping undecodable transaction");
                continue;
            }
        };
        spent.extend(tx.input.iter().map(|input| input.previous_output));
    }
    let mut unspents: Vec<UnblindedOutput> = store
        .list_output_blinding_data(network)?
        .into_iter()
        .filter(|utxo| owned.contains_key(&utxo.script) && !spent.contains(&utxo.outpoint))
        .collect();
    unspents.sort_by(|a, b| a.outpoint.to_string().cmp(&b.outpoint.to_string()));
    Ok(unspents)
}

/// Merge targets sharing an asset, keeping first-seen order.
fn aggregate_targets(targets: &[Target]) -> Result<Vec<Target>, WalletError> {
    let mut merged: Vec<Target> = Vec::new();
    for target in targets {
        if target.amount == 0 {
            return Err(WalletError::InvalidArgument("target amount must be positive"));
        }
        match merged.iter_mut().find(|t| t.asset == target.asset) {
            Some(existing) => {
                existing.amount = existing
                    .amount
                    .checked_add(target.amount)
                    .ok_or(WalletError::InvalidArgument("target amount overflow"))?;
            }
            None => merged.push(*target),
        }
    }
    Ok(merged)
}

/// Greedy selection, largest outputs first, independently per asset. Only
/// outputs of the target asset count towards it. `change_address` is asked
/// for an address whenever an asset needs change.
pub fn select_coins<F>(
    available: &[UnblindedOutput],
    targets: &[Target],
    mut change_address: F,
) -> Result<CoinSelection, WalletError>
where
    F: FnMut(&AssetId) -> Result<Address, WalletError>,
{
    let mut selection = CoinSelection::default();
    for target in aggregate_targets(targets)? {
        let mut candidates: Vec<&UnblindedOutput> = available
            .iter()
            .filter(|utxo| utxo.blinding.asset == target.asset)
            .collect();
        let available_total: u64 = candidates.iter().map(|utxo| utxo.blinding.value).sum();
        if available_total < target.amount {
            return Err(WalletError::InsufficientFunds {
                asset: target.asset.to_string(),
                required: target.amount,
                available: available_total,
            });
        }

        candidates.sort_by(|a, b| b.blinding.value.cmp(&a.blinding.value));
        let mut total = 0u64;
        for utxo in candidates {
            if total >= target.amount {
                break;
            }
            total += utxo.blinding.value;
            selection.selected.push(utxo.clone());
        }

        let change = total - target.amount;
        if change > 0 {
            selection.change.push(ChangeOutput {
                address: change_address(&target.asset)?,
                asset: target.asset,
                value: change,
            });
        }
    }
    Ok(selection)
}
