//! Reactive updater: turns store change notifications into fetch, unblind and
//! persist work.
//!
//! Notifications are drained into batches. Within a batch the network switch
//! refresh, the script subscriptions and the transaction pipeline run
//! concurrently; failures are logged per key and never abort the batch.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Weak};

use elements::{AssetId, Script, Transaction, Txid};
use futures::future::join3;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::assets::{refresh_assets, AssetRegistry};
use crate::chain_source::{ChainSources, StatusCallback};
use crate::config::WalletConfig;
use crate::error::WalletError;
use crate::keys::{Chain, KeyIndices};
use crate::network::Network;
use crate::store::{StoreEvent, TxDetails, WalletRepository};
use crate::unblind::unblind_transactions;

/// Holds the in-flight counter up while a unit of work runs.
struct ProcessingGuard {
    counter: watch::Sender<usize>,
}

impl ProcessingGuard {
    fn new(counter: &watch::Sender<usize>) -> Self {
        counter.send_modify(|count| *count += 1);
        Self {
            counter: counter.clone(),
        }
    }
}

impl Drop for ProcessingGuard {
    fn drop(&mut self) {
        self.counter
            .send_modify(|count| *count = count.saturating_sub(1));
    }
}

/// Store notifications grouped by kind.
#[derive(Debug, Default)]
pub struct EventBatch {
    pub network_changed: Option<Network>,
    pub scripts: Vec<(Network, Script)>,
    pub transactions: BTreeMap<Network, Vec<Txid>>,
}

impl EventBatch {
    pub fn push(&mut self, event: StoreEvent) {
        match event {
            StoreEvent::NetworkChanged(network) => self.network_changed = Some(network),
            StoreEvent::NewScript { network, script } => self.scripts.push((network, script)),
            StoreEvent::NewTransaction { network, txid } => {
                let txids = self.transactions.entry(network).or_default();
                if !txids.contains(&txid) {
                    txids.push(txid);
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.network_changed.is_none() && self.scripts.is_empty() && self.transactions.is_empty()
    }
}

impl FromIterator<StoreEvent> for EventBatch {
    fn from_iter<I: IntoIterator<Item = StoreEvent>>(events: I) -> Self {
        let mut batch = EventBatch::default();
        for event in events {
            batch.push(event);
        }
        batch
    }
}

pub struct Updater {
    store: Arc<dyn WalletRepository>,
    sources: ChainSources,
    registry: Option<Arc<dyn AssetRegistry>>,
    latest_history_window: u32,
    processing: watch::Sender<usize>,
    this: Weak<Updater>,
}

impl Updater {
    pub fn new(
        store: Arc<dyn WalletRepository>,
        sources: ChainSources,
        registry: Option<Arc<dyn AssetRegistry>>,
        config: &WalletConfig,
    ) -> Arc<Self> {
        let (processing, _) = watch::channel(0);
        Arc::new_cyclic(|this| Self {
            store,
            sources,
            registry,
            latest_history_window: config.latest_history_window,
            processing,
            this: this.clone(),
        })
    }

    pub fn is_processing(&self) -> bool {
        *self.processing.borrow() > 0
    }

    /// Resolve once no unit of work is in flight.
    pub async fn wait_for_processing(&self) {
        let mut rx = self.processing.subscribe();
        // the sender lives in self, so the channel cannot close while we wait
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    /// Spawn the notification loop. It runs until the store's event channel closes.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.store.subscribe();
        let updater = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let first = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "updater lagged behind store notifications");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let _guard = ProcessingGuard::new(&updater.processing);
                let mut batch = EventBatch::default();
                batch.push(first);
                while let Ok(event) = events.try_recv() {
                    batch.push(event);
                }
                updater.process_batch(batch).await;
            }
            debug!("store notification channel closed");
        })
    }

    /// Process one batch of notifications to completion.
    pub async fn process_batch(&self, batch: EventBatch) {
        if batch.is_empty() {
            return;
        }
        let _guard = ProcessingGuard::new(&self.processing);
        let network_switch = async {
            if let Some(network) = batch.network_changed {
                self.refresh_latest_history(network).await;
            }
        };
        let subscriptions = async {
            for (network, script) in &batch.scripts {
                if let Err(err) = self.watch_script(*network, script).await {
                    warn!(%network, error = %err, "failed to subscribe to script status");
                }
            }
        };
        let transactions = async {
            for (network, txids) in &batch.transactions {
                if let Err(err) = self.process_transactions(*network, txids).await {
                    warn!(%network, error = %err, "transaction update failed");
                }
            }
        };
        join3(network_switch, subscriptions, transactions).await;
    }

    /// Refresh the history of the most recently used scripts of every account
    /// on `network`.
    pub async fn refresh_latest_history(&self, network: Network) {
        let _guard = ProcessingGuard::new(&self.processing);
        let accounts = match self.store.list_accounts() {
            Ok(accounts) => accounts,
            Err(err) => {
                warn!(%network, error = %err, "failed to list accounts");
                return;
            }
        };
        for account in accounts
            .iter()
            .filter(|account| account.networks.contains(&network))
        {
            if let Err(err) = self.refresh_account_window(&account.name, network).await {
                warn!(account = %account.name, %network, error = %err, "latest history refresh failed");
            }
        }
    }

    async fn refresh_account_window(
        &self,
        account_name: &str,
        network: Network,
    ) -> Result<(), WalletError> {
        let account = self.store.get_account_details(account_name)?;
        let indices = account.key_indices(network);
        let window = self.latest_history_window;
        let scripts: Vec<Script> = self
            .store
            .get_account_scripts(network, Some(account_name))?
            .into_iter()
            .filter(|(_, details)| {
                latest_window(indices, details.chain, window).contains(&details.index)
            })
            .map(|(script, _)| script)
            .collect();
        if scripts.is_empty() {
            return Ok(());
        }
        self.refresh_histories(network, &scripts).await
    }

    /// Fetch the history of `scripts`, record their transactions and advance
    /// the owning accounts' counters past any used script.
    pub async fn refresh_histories(
        &self,
        network: Network,
        scripts: &[Script],
    ) -> Result<(), WalletError> {
        let source = self.sources.get(network)?;
        let histories = source.fetch_histories(scripts).await?;
        let known = self.store.get_account_scripts(network, None)?;

        let mut transactions = Vec::new();
        let mut advances: BTreeMap<String, KeyIndices> = BTreeMap::new();
        for (script, history) in scripts.iter().zip(histories) {
            if history.is_empty() {
                continue;
            }
            transactions.extend(history.into_iter().map(|entry| (entry.txid, entry.height)));
            if let Some(details) = known.get(script) {
                let indices = advances.entry(details.account_name.clone()).or_default();
                let next = indices.get(details.chain).max(details.index + 1);
                indices.set(details.chain, next);
            }
        }
        let changed = self.store.add_transactions(network, &transactions)?;
        for (account, indices) in advances {
            self.store
                .update_account_key_index(&account, network, indices)?;
        }
        debug!(%network, scripts = scripts.len(), changed = changed.len(), "histories refreshed");
        Ok(())
    }

    async fn watch_script(&self, network: Network, script: &Script) -> Result<(), WalletError> {
        let source = self.sources.get(network)?;
        let updater = self.this.clone();
        let watched = script.clone();
        let callback: StatusCallback = Arc::new(move |status: String| {
            let Some(updater) = updater.upgrade() else {
                return;
            };
            let script = watched.clone();
            debug!(%status, "script status changed");
            let guard = ProcessingGuard::new(&updater.processing);
            tokio::spawn(async move {
                let _guard = guard;
                if let Err(err) = updater.refresh_histories(network, &[script]).await {
                    warn!(%network, error = %err, "script history refresh failed");
                }
            });
        });
        source.subscribe_script_status(script, callback).await
    }

    /// Fetch missing raw transactions, unblind the outputs we own, store the
    /// results and cache the headers of confirmed blocks.
    pub async fn process_transactions(
        &self,
        network: Network,
        txids: &[Txid],
    ) -> Result<(), WalletError> {
        let _guard = ProcessingGuard::new(&self.processing);
        let source = self.sources.get(network)?;

        let mut records = Vec::with_capacity(txids.len());
        let mut missing = Vec::new();
        for txid in txids {
            let details = self.store.get_tx_details(network, txid)?.unwrap_or_default();
            if details.hex.is_none() {
                missing.push(*txid);
            }
            records.push((*txid, details));
        }
        if !missing.is_empty() {
            let fetched = source.fetch_transactions(&missing).await.unwrap_or_else(|err| {
                warn!(%network, missing = missing.len(), error = %err, "failed to fetch transactions");
                Vec::new()
            });
            for raw in fetched {
                if let Some((_, details)) = records.iter_mut().find(|(txid, _)| *txid == raw.txid) {
                    details.hex = Some(raw.hex.clone());
                }
                self.store.update_tx_details(
                    network,
                    raw.txid,
                    TxDetails {
                        hex: Some(raw.hex),
                        height: None,
                    },
                )?;
            }
        }

        let mut transactions: Vec<Transaction> = Vec::with_capacity(records.len());
        for (txid, details) in &records {
            let Some(hex) = &details.hex else {
                continue;
            };
            match decode_transaction(hex) {
                Ok(tx) => transactions.push(tx),
                Err(err) => warn!(%txid, error = %err, "failed to decode transaction"),
            }
        }
        let scripts = self.store.get_account_scripts(network, None)?;
        let outputs = unblind_transactions(&transactions, &scripts);
        let assets: Vec<AssetId> = outputs.iter().map(|output| output.blinding.asset).collect();
        if !outputs.is_empty() {
            info!(%network, outputs = outputs.len(), "unblinded wallet outputs");
            self.store.update_outpoint_blinding_data(network, outputs)?;
        }

        let mut heights: Vec<u32> = Vec::new();
        let mut seen = HashSet::new();
        for (_, details) in &records {
            let Some(height) = details.height else {
                continue;
            };
            if seen.insert(height) && self.store.get_block_header(network, height)?.is_none() {
                heights.push(height);
            }
        }
        if !heights.is_empty() {
            match source.fetch_block_headers(&heights).await {
                Ok(headers) => self.store.set_block_headers(network, headers)?,
                Err(err) => warn!(%network, error = %err, "failed to fetch block headers"),
            }
        }

        refresh_assets(self.registry.as_ref(), self.store.as_ref(), network, assets).await;
        Ok(())
    }
}

fn decode_transaction(hex: &str) -> Result<Transaction, WalletError> {
    let bytes = hex::decode(hex)?;
    Ok(elements::encode::deserialize(&bytes)?)
}

/// Windowed scripts for `chain` are `[next - window, next]`. The upper end is
/// the address `next_address` hands out, which has no history yet as far as
/// the counter knows.
pub fn latest_window(
    indices: KeyIndices,
    chain: Chain,
    window: u32,
) -> std::ops::RangeInclusive<u32> {
    let next = indices.get(chain);
    next.saturating_sub(window)..=next
}
