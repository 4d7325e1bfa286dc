//! Electrum-protocol chain source over a persistent WebSocket.
//!
//! Batched lookups are sent as a single JSON-RPC batch; responses are matched
//! to requests by position. Script-status notifications arrive as
//! `blockchain.scripthash.subscribe` notifications and are dispatched to the
//! callback registered for that script hash.
//!
//! # Example
//!
//! ```no_run
//! use confidential_wallet::chain_source::{ChainSource, ElectrumChainSource};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let source = ElectrumChainSource::connect("ws://127.0.0.1:1234").await?;
//! let fee_rate = source.estimate_fee(2).await?;
//! println!("{fee_rate:?} sat/vB");
//! source.close().await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use elements::{BlockHeader, Script, Txid};
use futures::{Stream, StreamExt};
use jsonrpsee::core::client::{ClientT, SubscriptionClientT};
use jsonrpsee::core::params::{ArrayParams, BatchRequestBuilder};
use jsonrpsee::rpc_params;
use jsonrpsee::ws_client::{WsClient, WsClientBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ChainSourceConfig;
use crate::error::WalletError;
use crate::network::Network;

const SCRIPTHASH_SUBSCRIBE: &str = "blockchain.scripthash.subscribe";

/// Invoked with the new status token whenever a watched script changes.
pub type StatusCallback = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryEntry {
    pub txid: Txid,
    /// `None` while unconfirmed.
    pub height: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawTransaction {
    pub txid: Txid,
    pub hex: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeaderInfo {
    pub height: u32,
    pub block_hash: String,
    pub timestamp: u32,
    pub hex: String,
}

impl BlockHeaderInfo {
    pub fn from_hex(height: u32, hex: String) -> Result<Self, WalletError> {
        let bytes = hex::decode(&hex)?;
        let header: BlockHeader = elements::encode::deserialize(&bytes)?;
        Ok(Self {
            height,
            block_hash: header.block_hash().to_string(),
            timestamp: header.time,
            hex,
        })
    }
}

#[derive(Debug, Deserialize)]
struct WireHistoryEntry {
    tx_hash: String,
    height: i64,
}

impl TryFrom<WireHistoryEntry> for HistoryEntry {
    type Error = WalletError;

    fn try_from(entry: WireHistoryEntry) -> Result<Self, Self::Error> {
        let txid = Txid::from_str(&entry.tx_hash)
            .map_err(|e| WalletError::Rpc(format!("invalid tx_hash {}: {e}", entry.tx_hash)))?;
        // 0 and -1 mark mempool entries
        let height = u32::try_from(entry.height).ok().filter(|h| *h > 0);
        Ok(Self { txid, height })
    }
}

/// Electrum script hash: sha256 of the script, byte-reversed, hex encoded.
pub fn script_hash(script: &Script) -> String {
    let mut digest = Sha256::digest(script.as_bytes()).to_vec();
    digest.reverse();
    hex::encode(digest)
}

#[async_trait]
pub trait ChainSource: Send + Sync {
    /// One history list per script, in request order.
    async fn fetch_histories(
        &self,
        scripts: &[Script],
    ) -> Result<Vec<Vec<HistoryEntry>>, WalletError>;

    /// Transactions the server cannot return (unknown or evicted) are left
    /// out; the rest keep request order.
    async fn fetch_transactions(&self, txids: &[Txid]) -> Result<Vec<RawTransaction>, WalletError>;

    /// Headers the server cannot return are left out.
    async fn fetch_block_headers(
        &self,
        heights: &[u32],
    ) -> Result<Vec<BlockHeaderInfo>, WalletError>;

    /// Fee rate in sat/vB for confirmation within `target_blocks`, if the
    /// server has an estimate.
    async fn estimate_fee(&self, target_blocks: u16) -> Result<Option<f64>, WalletError>;

    async fn broadcast_transaction(&self, tx_hex: &str) -> Result<Txid, WalletError>;

    /// Register `callback` for status changes of `script`. Null statuses are
    /// never delivered.
    async fn subscribe_script_status(
        &self,
        script: &Script,
        callback: StatusCallback,
    ) -> Result<(), WalletError>;

    async fn unsubscribe_script_status(&self, script: &Script) -> Result<(), WalletError>;

    /// Release the connection. Safe to call more than once.
    async fn close(&self);
}

/// Chain sources keyed by network.
#[derive(Clone, Default)]
pub struct ChainSources {
    sources: HashMap<Network, Arc<dyn ChainSource>>,
}

impl ChainSources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, network: Network, source: Arc<dyn ChainSource>) -> Self {
        self.insert(network, source);
        self
    }

    pub fn insert(&mut self, network: Network, source: Arc<dyn ChainSource>) {
        self.sources.insert(network, source);
    }

    pub fn get(&self, network: Network) -> Result<Arc<dyn ChainSource>, WalletError> {
        self.sources
            .get(&network)
            .cloned()
            .ok_or(WalletError::NoChainSource(network))
    }

    pub async fn close_all(&self) {
        for source in self.sources.values() {
            source.close().await;
        }
    }
}

impl fmt::Debug for ChainSources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.sources.keys()).finish()
    }
}

type Watchers = Arc<Mutex<HashMap<String, StatusCallback>>>;

pub struct ElectrumChainSource {
    client: RwLock<Option<Arc<WsClient>>>,
    config: ChainSourceConfig,
    closed: AtomicBool,
    watchers: Watchers,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ElectrumChainSource {
    pub async fn connect(endpoint: &str) -> Result<Self, WalletError> {
        Self::connect_with_config(ChainSourceConfig::with_endpoint(endpoint)).await
    }

    pub async fn connect_with_config(config: ChainSourceConfig) -> Result<Self, WalletError> {
        let client = Arc::new(Self::build_client(&config).await?);
        let source = Self {
            client: RwLock::new(Some(client.clone())),
            config,
            closed: AtomicBool::new(false),
            watchers: Arc::new(Mutex::new(HashMap::new())),
            pump: Mutex::new(None),
        };
        source.start_pump(&client).await?;
        info!(endpoint = %source.config.endpoint, "connected to chain source");
        Ok(source)
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    pub async fn is_connected(&self) -> bool {
        match self.client.read().await.as_ref() {
            Some(client) => client.is_connected(),
            None => false,
        }
    }

    async fn build_client(config: &ChainSourceConfig) -> Result<WsClient, WalletError> {
        WsClientBuilder::default()
            .connection_timeout(config.connection_timeout)
            .request_timeout(config.request_timeout)
            .build(&config.endpoint)
            .await
            .map_err(|e| WalletError::Rpc(format!("Failed to connect to {}: {}", config.endpoint, e)))
    }

    /// Current client, reconnecting first if the socket dropped.
    async fn client(&self) -> Result<Arc<WsClient>, WalletError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WalletError::ChainSourceClosed);
        }
        if let Some(client) = self.client.read().await.as_ref() {
            if client.is_connected() {
                return Ok(client.clone());
            }
        }
        self.reconnect().await
    }

    async fn reconnect(&self) -> Result<Arc<WsClient>, WalletError> {
        let mut slot = self.client.write().await;
        // another task may have reconnected while we waited for the lock
        if let Some(client) = slot.as_ref() {
            if client.is_connected() {
                return Ok(client.clone());
            }
        }

        let mut attempts = 0;
        let client = loop {
            attempts += 1;
            match Self::build_client(&self.config).await {
                Ok(client) => break Arc::new(client),
                Err(e) => {
                    if attempts >= self.config.max_reconnect_attempts {
                        return Err(e);
                    }
                    warn!(attempt = attempts, error = %e, "chain source reconnect failed");
                    tokio::time::sleep(self.config.reconnect_delay).await;
                }
            }
        };
        if self.closed.load(Ordering::Acquire) {
            return Err(WalletError::ChainSourceClosed);
        }
        *slot = Some(client.clone());
        drop(slot);

        self.start_pump(&client).await?;
        self.resubscribe(&client).await;
        info!(endpoint = %self.config.endpoint, "reconnected to chain source");
        Ok(client)
    }

    /// Spawn the task that forwards status notifications to callbacks,
    /// replacing the task bound to a previous connection.
    async fn start_pump(&self, client: &WsClient) -> Result<(), WalletError> {
        let notifications = client
            .subscribe_to_method::<(String, Option<String>)>(SCRIPTHASH_SUBSCRIBE)
            .await
            .map_err(|e| WalletError::Rpc(format!("Failed to listen for status updates: {e}")))?;
        let handle = tokio::spawn(forward_status_updates(notifications, self.watchers.clone()));
        if let Ok(mut pump) = self.pump.lock() {
            if let Some(previous) = pump.replace(handle) {
                previous.abort();
            }
        }
        Ok(())
    }

    async fn resubscribe(&self, client: &WsClient) {
        let hashes: Vec<String> = match self.watchers.lock() {
            Ok(watchers) => watchers.keys().cloned().collect(),
            Err(_) => return,
        };
        for hash in hashes {
            let result: Result<Option<String>, _> =
                client.request(SCRIPTHASH_SUBSCRIBE, rpc_params![hash.clone()]).await;
            if let Err(e) = result {
                warn!(%hash, error = %e, "failed to restore script subscription");
            }
        }
    }

    async fn request<R>(&self, method: &str, params: ArrayParams) -> Result<R, WalletError>
    where
        R: DeserializeOwned,
    {
        let client = self.client().await?;
        client
            .request(method, params)
            .await
            .map_err(|e| WalletError::Rpc(format!("{method} failed: {e}")))
    }

    /// Send one batch of `method` calls. The i-th result answers the i-th
    /// params; a per-entry error leaves its neighbours intact.
    async fn batch<R>(
        &self,
        method: &str,
        params: Vec<ArrayParams>,
    ) -> Result<Vec<Result<R, WalletError>>, WalletError>
    where
        R: DeserializeOwned + fmt::Debug + 'static,
    {
        if params.is_empty() {
            return Ok(Vec::new());
        }
        let expected = params.len();
        let mut batch = BatchRequestBuilder::new();
        for p in params {
            batch
                .insert(method, p)
                .map_err(|e| WalletError::Serialization(e.to_string()))?;
        }
        let client = self.client().await?;
        let responses = client
            .batch_request::<R>(batch)
            .await
            .map_err(|e| WalletError::Rpc(format!("{method} batch failed: {e}")))?;
        let results: Vec<Result<R, WalletError>> = responses
            .into_iter()
            .map(|entry| entry.map_err(|e| WalletError::Rpc(format!("{method} failed: {e}"))))
            .collect();
        if results.len() != expected {
            return Err(WalletError::Rpc(format!(
                "{method} batch returned {} results for {expected} requests",
                results.len()
            )));
        }
        Ok(results)
    }
}

#[async_trait]
impl ChainSource for ElectrumChainSource {
    async fn fetch_histories(
        &self,
        scripts: &[Script],
    ) -> Result<Vec<Vec<HistoryEntry>>, WalletError> {
        let params = scripts
            .iter()
            .map(|script| rpc_params![script_hash(script)])
            .collect();
        // histories must line up with the scripts, so any failed entry fails the call
        let histories: Vec<Result<Vec<WireHistoryEntry>, WalletError>> =
            self.batch("blockchain.scripthash.get_history", params).await?;
        histories
            .into_iter()
            .map(|history| -> Result<Vec<HistoryEntry>, WalletError> {
                history?.into_iter().map(HistoryEntry::try_from).collect()
            })
            .collect()
    }

    async fn fetch_transactions(&self, txids: &[Txid]) -> Result<Vec<RawTransaction>, WalletError> {
        let params = txids
            .iter()
            .map(|txid| rpc_params![txid.to_string()])
            .collect();
        let hexes: Vec<Result<String, WalletError>> =
            self.batch("blockchain.transaction.get", params).await?;
        Ok(answered("transaction", txids, hexes)
            .map(|(txid, hex)| RawTransaction { txid: *txid, hex })
            .collect())
    }

    async fn fetch_block_headers(
        &self,
        heights: &[u32],
    ) -> Result<Vec<BlockHeaderInfo>, WalletError> {
        let params = heights.iter().map(|height| rpc_params![height]).collect();
        let hexes: Vec<Result<String, WalletError>> =
            self.batch("blockchain.block.header", params).await?;
        Ok(answered("block header", heights, hexes)
            .filter_map(|(height, hex)| match BlockHeaderInfo::from_hex(*height, hex) {
                Ok(header) => Some(header),
                Err(err) => {
                    warn!(height, error = %err, "undecodable block header");
                    None
                }
            })
            .collect())
    }

    async fn estimate_fee(&self, target_blocks: u16) -> Result<Option<f64>, WalletError> {
        let btc_per_kvb: f64 = self
            .request("blockchain.estimatefee", rpc_params![target_blocks])
            .await?;
        Ok(btc_per_kvb_to_sat_per_vb(btc_per_kvb))
    }

    async fn broadcast_transaction(&self, tx_hex: &str) -> Result<Txid, WalletError> {
        let txid: String = self
            .request("blockchain.transaction.broadcast", rpc_params![tx_hex])
            .await?;
        Txid::from_str(&txid)
            .map_err(|e| WalletError::Rpc(format!("broadcast returned invalid txid {txid}: {e}")))
    }

    async fn subscribe_script_status(
        &self,
        script: &Script,
        callback: StatusCallback,
    ) -> Result<(), WalletError> {
        let hash = script_hash(script);
        self.watchers
            .lock()
            .map_err(|_| WalletError::InvalidState("watchers poisoned"))?
            .insert(hash.clone(), callback);
        let _initial: Option<String> = self
            .request(SCRIPTHASH_SUBSCRIBE, rpc_params![hash])
            .await?;
        Ok(())
    }

    async fn unsubscribe_script_status(&self, script: &Script) -> Result<(), WalletError> {
        let hash = script_hash(script);
        let removed = self
            .watchers
            .lock()
            .map_err(|_| WalletError::InvalidState("watchers poisoned"))?
            .remove(&hash);
        if removed.is_none() {
            return Ok(());
        }
        let _: bool = self
            .request("blockchain.scripthash.unsubscribe", rpc_params![hash])
            .await?;
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut pump) = self.pump.lock() {
            if let Some(handle) = pump.take() {
                handle.abort();
            }
        }
        if let Ok(mut watchers) = self.watchers.lock() {
            watchers.clear();
        }
        // dropping the last handle shuts the background task down
        self.client.write().await.take();
        debug!(endpoint = %self.config.endpoint, "chain source closed");
    }
}

/// Deliver `(script hash, status)` notifications to the callbacks in
/// `watchers` until the stream ends. Null statuses, malformed notifications
/// and unwatched hashes are dropped.
async fn forward_status_updates<S, E>(notifications: S, watchers: Watchers)
where
    S: Stream<Item = Result<(String, Option<String>), E>>,
    E: fmt::Display,
{
    let mut notifications = std::pin::pin!(notifications);
    while let Some(notification) = notifications.next().await {
        let (hash, status) = match notification {
            Ok(params) => params,
            Err(e) => {
                warn!(error = %e, "malformed status notification");
                continue;
            }
        };
        let Some(status) = status else {
            continue;
        };
        let callback = watchers
            .lock()
            .ok()
            .and_then(|watchers| watchers.get(&hash).cloned());
        match callback {
            Some(callback) => callback(status),
            None => debug!(%hash, "status update for unwatched script"),
        }
    }
}

/// Pair each key with its batch entry, logging and skipping the entries the
/// server could not answer.
pub fn answered<'a, K, R>(
    what: &'static str,
    keys: &'a [K],
    results: Vec<Result<R, WalletError>>,
) -> impl Iterator<Item = (&'a K, R)> + 'a
where
    K: fmt::Display,
    R: 'a,
{
    keys.iter()
        .zip(results)
        .filter_map(move |(key, result)| match result {
            Ok(value) => Some((key, value)),
            Err(err) => {
                warn!(%key, error = %err, "chain source has no {what}");
                None
            }
        })
}

/// Electrum reports BTC/kvB and -1 when it has no estimate.
fn btc_per_kvb_to_sat_per_vb(rate: f64) -> Option<f64> {
    (rate.is_finite() && rate > 0.0).then(|| rate * 100_000.0)
}
