//! Storage port consumed by the wallet engine.
//!
//! Every component receives an `Arc<dyn WalletRepository>`; there is no
//! process-wide store. Mutations are merges: key indices only increase,
//! script entries are only added (their network list may grow), and
//! transaction records keep the freshest known hex and height.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use elements::{AssetId, OutPoint, Script, Txid};
use tokio::sync::broadcast;

use crate::assets::AssetDetails;
use crate::chain_source::BlockHeaderInfo;
use crate::error::WalletError;
use crate::keys::{AccountDetails, KeyIndices, ScriptDetails};
use crate::network::Network;
use crate::unblind::UnblindedOutput;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Persisted state of one transaction. `hex` is fetched lazily.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxDetails {
    pub hex: Option<String>,
    pub height: Option<u32>,
}

impl TxDetails {
    pub fn is_confirmed(&self) -> bool {
        self.height.is_some()
    }
}

/// Change notifications emitted after a write has been applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreEvent {
    NewScript { network: Network, script: Script },
    /// A transaction id was seen for the first time or gained a confirmation height.
    NewTransaction { network: Network, txid: Txid },
    NetworkChanged(Network),
}

pub trait WalletRepository: Send + Sync {
    fn get_account_details(&self, name: &str) -> Result<AccountDetails, WalletError>;

    fn list_accounts(&self) -> Result<Vec<AccountDetails>, WalletError>;

    fn save_account(&self, account: AccountDetails) -> Result<(), WalletError>;

    /// Merge `indices` into the stored counters and return the result.
    fn update_account_key_index(
        &self,
        name: &str,
        network: Network,
        indices: KeyIndices,
    ) -> Result<KeyIndices, WalletError>;

    /// Script entries of `network`, optionally restricted to one account.
    fn get_account_scripts(
        &self,
        network: Network,
        account: Option<&str>,
    ) -> Result<HashMap<Script, ScriptDetails>, WalletError>;

    /// Add script entries. Returns how many scripts were new to `network`.
    fn update_script_details(
        &self,
        network: Network,
        entries: Vec<(Script, ScriptDetails)>,
    ) -> Result<usize, WalletError>;

    /// Record transaction ids with their heights. Returns the ids that were
    /// new or newly confirmed.
    fn add_transactions(
        &self,
        network: Network,
        transactions: &[(Txid, Option<u32>)],
    ) -> Result<Vec<Txid>, WalletError>;

    fn get_tx_details(
        &self,
        network: Network,
        txid: &Txid,
    ) -> Result<Option<TxDetails>, WalletError>;

    fn update_tx_details(
        &self,
        network: Network,
        txid: Txid,
        details: TxDetails,
    ) -> Result<(), WalletError>;

    fn list_transactions(&self, network: Network) -> Result<BTreeMap<Txid, TxDetails>, WalletError>;

    fn get_output_blinding_data(
        &self,
        network: Network,
        outpoint: &OutPoint,
    ) -> Result<Option<UnblindedOutput>, WalletError>;

    fn list_output_blinding_data(
        &self,
        network: Network,
    ) -> Result<Vec<UnblindedOutput>, WalletError>;

    fn update_outpoint_blinding_data(
        &self,
        network: Network,
        outputs: Vec<UnblindedOutput>,
    ) -> Result<(), WalletError>;

    fn get_network(&self) -> Result<Network, WalletError>;

    fn set_network(&self, network: Network) -> Result<(), WalletError>;

    fn get_block_header(
        &self,
        network: Network,
        height: u32,
    ) -> Result<Option<BlockHeaderInfo>, WalletError>;

    fn set_block_headers(
        &self,
        network: Network,
        headers: Vec<BlockHeaderInfo>,
    ) -> Result<(), WalletError>;

    fn get_asset(
        &self,
        network: Network,
        asset: &AssetId,
    ) -> Result<Option<AssetDetails>, WalletError>;

    fn set_asset(
        &self,
        network: Network,
        asset: AssetId,
        details: AssetDetails,
    ) -> Result<(), WalletError>;

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}

#[derive(Default)]
struct NetworkState {
    scripts: HashMap<Script, ScriptDetails>,
    transactions: BTreeMap<Txid, TxDetails>,
    outputs: HashMap<OutPoint, UnblindedOutput>,
    headers: BTreeMap<u32, BlockHeaderInfo>,
    assets: HashMap<AssetId, AssetDetails>,
}

struct StoreState {
    network: Network,
    accounts: BTreeMap<String, AccountDetails>,
    networks: HashMap<Network, NetworkState>,
}

impl StoreState {
    fn network_mut(&mut self, network: Network) -> &mut NetworkState {
        self.networks.entry(network).or_default()
    }
}

/// In-process [`WalletRepository`]. Hosts with durable storage implement the
/// trait over their own key-value backend.
pub struct MemoryStore {
    state: Mutex<StoreState>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Network::Liquid)
    }
}

impl MemoryStore {
    pub fn new(network: Network) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(StoreState {
                network,
                accounts: BTreeMap::new(),
                networks: HashMap::new(),
            }),
            events,
        }
    }

    fn with_state<F, T>(&self, func: F) -> Result<T, WalletError>
    where
        F: FnOnce(&StoreState) -> Result<T, WalletError>,
    {
        let state = self
            .state
            .lock()
            .map_err(|_| WalletError::Storage("store lock poisoned".into()))?;
        func(&state)
    }

    /// Apply a mutation and publish the events it produced once the lock is released.
    fn with_mut<F, T>(&self, func: F) -> Result<T, WalletError>
    where
        F: FnOnce(&mut StoreState, &mut Vec<StoreEvent>) -> Result<T, WalletError>,
    {
        let mut events = Vec::new();
        let mut state = self
            .state
            .lock()
            .map_err(|_| WalletError::Storage("store lock poisoned".into()))?;
        let result = func(&mut state, &mut events)?;
        drop(state);
        for event in events {
            // no receivers is not an error
            let _ = self.events.send(event);
        }
        Ok(result)
    }
}

impl WalletRepository for MemoryStore {
    fn get_account_details(&self, name: &str) -> Result<AccountDetails, WalletError> {
        self.with_state(|state| {
            state
                .accounts
                .get(name)
                .cloned()
                .ok_or_else(|| WalletError::UnknownAccount(name.to_string()))
        })
    }

    fn list_accounts(&self) -> Result<Vec<AccountDetails>, WalletError> {
        self.with_state(|state| Ok(state.accounts.values().cloned().collect()))
    }

    fn save_account(&self, account: AccountDetails) -> Result<(), WalletError> {
        self.with_mut(|state, _| {
            match state.accounts.get_mut(&account.name) {
                Some(existing) => {
                    // identity is immutable; only counters merge
                    for (network, indices) in &account.next_key_index {
                        let merged = existing.key_indices(*network).merge_max(indices);
                        existing.next_key_index.insert(*network, merged);
                    }
                }
                None => {
                    state.accounts.insert(account.name.clone(), account);
                }
            }
            Ok(())
        })
    }

    fn update_account_key_index(
        &self,
        name: &str,
        network: Network,
        indices: KeyIndices,
    ) -> Result<KeyIndices, WalletError> {
        self.with_mut(|state, _| {
            let account = state
                .accounts
                .get_mut(name)
                .ok_or_else(|| WalletError::UnknownAccount(name.to_string()))?;
            let merged = account.key_indices(network).merge_max(&indices);
            account.next_key_index.insert(network, merged);
            Ok(merged)
        })
    }

    fn get_account_scripts(
        &self,
        network: Network,
        account: Option<&str>,
    ) -> Result<HashMap<Script, ScriptDetails>, WalletError> {
        self.with_state(|state| {
            let Some(scripts) = state.networks.get(&network).map(|n| &n.scripts) else {
                return Ok(HashMap::new());
            };
            Ok(scripts
                .iter()
                .filter(|(_, details)| account.map_or(true, |name| details.account_name == name))
                .map(|(script, details)| (script.clone(), details.clone()))
                .collect())
        })
    }

    fn update_script_details(
        &self,
        network: Network,
        entries: Vec<(Script, ScriptDetails)>,
    ) -> Result<usize, WalletError> {
        self.with_mut(|state, events| {
            let mut added = 0;
            for (script, mut details) in entries {
                if !details.networks.contains(&network) {
                    details.networks.push(network);
                }
                for target in details.networks.clone() {
                    let scripts = &mut state.network_mut(target).scripts;
                    match scripts.get_mut(&script) {
                        Some(existing) => {
                            for net in &details.networks {
                                if !existing.networks.contains(net) {
                                    existing.networks.push(*net);
                                }
                            }
                        }
                        None => {
                            scripts.insert(script.clone(), details.clone());
                            if target == network {
                                added += 1;
                            }
                            events.push(StoreEvent::NewScript {
                                network: target,
                                script: script.clone(),
                            });
                        }
                    }
                }
            }
            Ok(added)
        })
    }

    fn add_transactions(
        &self,
        network: Network,
        transactions: &[(Txid, Option<u32>)],
    ) -> Result<Vec<Txid>, WalletError> {
        self.with_mut(|state, events| {
            let records = &mut state.network_mut(network).transactions;
            let mut changed = Vec::new();
            for (txid, height) in transactions {
                let is_new = !records.contains_key(txid);
                let record = records.entry(*txid).or_default();
                let newly_confirmed = height.is_some() && record.height != *height;
                if height.is_some() {
                    record.height = *height;
                }
                if (is_new || newly_confirmed) && !changed.contains(txid) {
                    changed.push(*txid);
                    events.push(StoreEvent::NewTransaction {
                        network,
                        txid: *txid,
                    });
                }
            }
            Ok(changed)
        })
    }

    fn get_tx_details(
        &self,
        network: Network,
        txid: &Txid,
    ) -> Result<Option<TxDetails>, WalletError> {
        self.with_state(|state| {
            Ok(state
                .networks
                .get(&network)
                .and_then(|n| n.transactions.get(txid))
                .cloned())
        })
    }

    fn update_tx_details(
        &self,
        network: Network,
        txid: Txid,
        details: TxDetails,
    ) -> Result<(), WalletError> {
        self.with_mut(|state, _| {
            let record = state
                .network_mut(network)
                .transactions
                .entry(txid)
                .or_default();
            if details.hex.is_some() {
                record.hex = details.hex;
            }
            if details.height.is_some() {
                record.height = details.height;
            }
            Ok(())
        })
    }

    fn list_transactions(&self, network: Network) -> Result<BTreeMap<Txid, TxDetails>, WalletError> {
        self.with_state(|state| {
            Ok(state
                .networks
                .get(&network)
                .map(|n| n.transactions.clone())
                .unwrap_or_default())
        })
    }

    fn get_output_blinding_data(
        &self,
        network: Network,
        outpoint: &OutPoint,
    ) -> Result<Option<UnblindedOutput>, WalletError> {
        self.with_state(|state| {
            Ok(state
                .networks
                .get(&network)
                .and_then(|n| n.outputs.get(outpoint))
                .cloned())
        })
    }

    fn list_output_blinding_data(
        &self,
        network: Network,
    ) -> Result<Vec<UnblindedOutput>, WalletError> {
        self.with_state(|state| {
            Ok(state
                .networks
                .get(&network)
                .map(|n| n.outputs.values().cloned().collect())
                .unwrap_or_default())
        })
    }

    fn update_outpoint_blinding_data(
        &self,
        network: Network,
        outputs: Vec<UnblindedOutput>,
    ) -> Result<(), WalletError> {
        self.with_mut(|state, _| {
            let stored = &mut state.network_mut(network).outputs;
            for output in outputs {
                stored.insert(output.outpoint, output);
            }
            Ok(())
        })
    }

    fn get_network(&self) -> Result<Network, WalletError> {
        self.with_state(|state| Ok(state.network))
    }

    fn set_network(&self, network: Network) -> Result<(), WalletError> {
        self.with_mut(|state, events| {
            if state.network != network {
                state.network = network;
                events.push(StoreEvent::NetworkChanged(network));
            }
            Ok(())
        })
    }

    fn get_block_header(
        &self,
        network: Network,
        height: u32,
    ) -> Result<Option<BlockHeaderInfo>, WalletError> {
        self.with_state(|state| {
            Ok(state
                .networks
                .get(&network)
                .and_then(|n| n.headers.get(&height))
                .cloned())
        })
    }

    fn set_block_headers(
        &self,
        network: Network,
        headers: Vec<BlockHeaderInfo>,
    ) -> Result<(), WalletError> {
        self.with_mut(|state, _| {
            let stored = &mut state.network_mut(network).headers;
            for header in headers {
                stored.insert(header.height, header);
            }
            Ok(())
        })
    }

    fn get_asset(
        &self,
        network: Network,
        asset: &AssetId,
    ) -> Result<Option<AssetDetails>, WalletError> {
        self.with_state(|state| {
            Ok(state
                .networks
                .get(&network)
                .and_then(|n| n.assets.get(asset))
                .cloned())
        })
    }

    fn set_asset(
        &self,
        network: Network,
        asset: AssetId,
        details: AssetDetails,
    ) -> Result<(), WalletError> {
        self.with_mut(|state, _| {
            state.network_mut(network).assets.insert(asset, details);
            Ok(())
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}
