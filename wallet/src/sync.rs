//! Gap-limit synchronizer.
//!
//! Each `(account, network, chain)` is scanned in batches of `gap_limit`
//! scripts. A script with history moves the next index to just past it and
//! resets the run of unused scripts; the scan ends once a full `gap_limit`
//! run of unused scripts has been seen. Restoration replays the same rule
//! over the scripts listed in a restoration record with a single history
//! pass.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use confidential_wallet::chain_source::{ChainSources, ElectrumChainSource};
//! use confidential_wallet::{MemoryStore, Network, Synchronizer, WalletConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = WalletConfig::default();
//! let source = ElectrumChainSource::connect_with_config(config.chain_source(Network::Liquid)).await?;
//! let sources = ChainSources::new().with(Network::Liquid, Arc::new(source));
//! let store = Arc::new(MemoryStore::new(Network::Liquid));
//! let synchronizer = Synchronizer::new(store, sources, &config);
//! let outcome = synchronizer.sync_account("mainAccount", Network::Liquid).await?;
//! println!("next receive index {}", outcome.next_indices.external);
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use elements::{Script, Txid};
use futures::future::try_join;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::chain_source::{ChainSource, ChainSources};
use crate::config::WalletConfig;
use crate::error::WalletError;
use crate::keys::{AccountDetails, Chain, KeyIndices, ScriptDetails};
use crate::network::Network;
use crate::restoration::{RestorationFile, RestorationRecord};
use crate::store::WalletRepository;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub account: String,
    pub next_indices: KeyIndices,
    /// Every transaction id seen, with its height when confirmed.
    pub transactions: Vec<(Txid, Option<u32>)>,
    /// Script entries that were not stored before this pass.
    pub new_scripts: usize,
}

/// Result of scanning one chain.
#[derive(Debug, Default)]
pub struct ChainScan {
    pub next_index: u32,
    pub transactions: Vec<(Txid, Option<u32>)>,
    pub scripts: Vec<(Script, ScriptDetails)>,
}

/// Scan one chain from `start` until `gap_limit` consecutive scripts have no
/// history. `derive` produces the script entry for an index.
pub async fn scan_chain<F>(
    source: &dyn ChainSource,
    start: u32,
    gap_limit: u32,
    derive: F,
) -> Result<ChainScan, WalletError>
where
    F: Fn(u32) -> Result<(Script, ScriptDetails), WalletError>,
{
    if gap_limit == 0 {
        return Err(WalletError::InvalidArgument("gap limit must be at least 1"));
    }
    let mut scan = ChainScan {
        next_index: start,
        ..Default::default()
    };
    let mut cursor = start;
    let mut unused = 0;
    loop {
        let end = cursor
            .checked_add(gap_limit)
            .ok_or(WalletError::InvalidState("derivation index overflow"))?;
        let batch = (cursor..end).map(&derive).collect::<Result<Vec<_>, _>>()?;
        let scripts: Vec<Script> = batch.iter().map(|(script, _)| script.clone()).collect();
        let histories = source.fetch_histories(&scripts).await?;
        if histories.len() != batch.len() {
            return Err(WalletError::Rpc(format!(
                "history batch answered {} of {} scripts",
                histories.len(),
                batch.len()
            )));
        }

        for (position, history) in (cursor..end).zip(histories) {
            if history.is_empty() {
                unused += 1;
                continue;
            }
            unused = 0;
            scan.next_index = position + 1;
            scan.transactions
                .extend(history.into_iter().map(|entry| (entry.txid, entry.height)));
        }
        scan.scripts.extend(batch);
        cursor = end;
        if unused >= gap_limit {
            return Ok(scan);
        }
    }
}

/// Apply the boundary rule to indices known to have history: the next index
/// is one past the highest used index, never below `current`.
pub fn next_index_after(used: impl IntoIterator<Item = u32>, current: u32) -> u32 {
    used.into_iter()
        .map(|index| index.saturating_add(1))
        .fold(current, u32::max)
}

pub struct Synchronizer {
    store: Arc<dyn WalletRepository>,
    sources: ChainSources,
    gap_limit: u32,
    /// At most one restoration in flight; later callers wait their turn.
    restoration: Arc<Mutex<()>>,
}

impl Synchronizer {
    pub fn new(store: Arc<dyn WalletRepository>, sources: ChainSources, config: &WalletConfig) -> Self {
        Self {
            store,
            sources,
            gap_limit: config.gap_limit,
            restoration: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_gap_limit(mut self, gap_limit: u32) -> Self {
        self.gap_limit = gap_limit;
        self
    }

    pub fn gap_limit(&self) -> u32 {
        self.gap_limit
    }

    /// Scan both chains starting at the stored counters.
    pub async fn sync_account(
        &self,
        account_name: &str,
        network: Network,
    ) -> Result<SyncOutcome, WalletError> {
        let account = self.store.get_account_details(account_name)?;
        let start = account.key_indices(network);
        self.scan_account(&account, network, start).await
    }

    /// Rescan both chains from index zero.
    pub async fn full_sync(
        &self,
        account_name: &str,
        network: Network,
    ) -> Result<SyncOutcome, WalletError> {
        let account = self.store.get_account_details(account_name)?;
        self.scan_account(&account, network, KeyIndices::default())
            .await
    }

    /// Sync every account bound to `network`. A failing account does not
    /// stop the others.
    pub async fn sync_all(
        &self,
        network: Network,
    ) -> Result<Vec<(String, Result<SyncOutcome, WalletError>)>, WalletError> {
        let accounts = self.store.list_accounts()?;
        let scans = accounts
            .iter()
            .filter(|account| account.networks.contains(&network))
            .map(|account| async move {
                let result = self
                    .scan_account(account, network, account.key_indices(network))
                    .await;
                if let Err(err) = &result {
                    warn!(account = %account.name, %network, error = %err, "account sync failed");
                }
                (account.name.clone(), result)
            });
        Ok(futures::future::join_all(scans).await)
    }

    async fn scan_account(
        &self,
        account: &AccountDetails,
        network: Network,
        start: KeyIndices,
    ) -> Result<SyncOutcome, WalletError> {
        let source = self.sources.get(network)?;
        let derive = |chain: Chain| {
            move |index: u32| account.derive_script(network, chain, index)
        };
        let (external, internal) = try_join(
            scan_chain(
                source.as_ref(),
                start.external,
                self.gap_limit,
                derive(Chain::External),
            ),
            scan_chain(
                source.as_ref(),
                start.internal,
                self.gap_limit,
                derive(Chain::Internal),
            ),
        )
        .await?;
        debug!(
            account = %account.name,
            %network,
            external = external.next_index,
            internal = internal.next_index,
            "gap limit reached"
        );

        let indices = KeyIndices {
            external: external.next_index,
            internal: internal.next_index,
        };
        let mut scripts = external.scripts;
        scripts.extend(internal.scripts);
        let mut transactions = external.transactions;
        transactions.extend(internal.transactions);
        self.persist(account, network, scripts, transactions, indices)
    }

    /// Restore the programmable accounts listed for `network` in `file`.
    /// Waits for any restoration already in progress. Each record yields its
    /// own result; a failing record does not stop the ones after it.
    pub async fn restore(
        &self,
        file: &RestorationFile,
        network: Network,
    ) -> Vec<(String, Result<SyncOutcome, WalletError>)> {
        let _guard = self.restoration.lock().await;
        let Some(records) = file.get(&network) else {
            return Vec::new();
        };
        let mut outcomes = Vec::with_capacity(records.len());
        for record in records {
            let result = self.restore_record(record, network).await;
            if let Err(err) = &result {
                warn!(account = %record.account_name, %network, error = %err, "account restoration failed");
            }
            outcomes.push((record.account_name.clone(), result));
        }
        let restored = outcomes.iter().filter(|(_, result)| result.is_ok()).count();
        info!(%network, restored, failed = outcomes.len() - restored, "restoration finished");
        outcomes
    }

    async fn restore_record(
        &self,
        record: &RestorationRecord,
        network: Network,
    ) -> Result<SyncOutcome, WalletError> {
        let account = self.store.get_account_details(&record.account_name)?;
        let source = self.sources.get(network)?;
        let entries = record.script_entries(&account, network)?;
        let scripts: Vec<Script> = entries.iter().map(|(script, _)| script.clone()).collect();
        let histories = source.fetch_histories(&scripts).await?;
        if histories.len() != entries.len() {
            return Err(WalletError::Rpc(format!(
                "history batch answered {} of {} scripts",
                histories.len(),
                entries.len()
            )));
        }

        let mut used: BTreeMap<Chain, Vec<u32>> = BTreeMap::new();
        let mut transactions = Vec::new();
        for ((_, details), history) in entries.iter().zip(histories) {
            if history.is_empty() {
                continue;
            }
            used.entry(details.chain).or_default().push(details.index);
            transactions.extend(history.into_iter().map(|entry| (entry.txid, entry.height)));
        }
        let current = account.key_indices(network);
        let mut indices = KeyIndices::default();
        for chain in Chain::BOTH {
            let used = used.remove(&chain).unwrap_or_default();
            indices.set(chain, next_index_after(used, current.get(chain)));
        }
        self.persist(&account, network, entries, transactions, indices)
    }

    fn persist(
        &self,
        account: &AccountDetails,
        network: Network,
        scripts: Vec<(Script, ScriptDetails)>,
        mut transactions: Vec<(Txid, Option<u32>)>,
        indices: KeyIndices,
    ) -> Result<SyncOutcome, WalletError> {
        transactions.sort();
        transactions.dedup();
        let new_scripts = self.store.update_script_details(network, scripts)?;
        self.store.add_transactions(network, &transactions)?;
        let next_indices = self
            .store
            .update_account_key_index(&account.name, network, indices)?;
        Ok(SyncOutcome {
            account: account.name.clone(),
            next_indices,
            transactions,
            new_scripts,
        })
    }
}
