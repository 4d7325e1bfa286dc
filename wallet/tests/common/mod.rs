#![allow(dead_code)]

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use confidential_wallet::address::confidential_address;
use confidential_wallet::chain_source::{
    answered, BlockHeaderInfo, ChainSource, ChainSources, HistoryEntry, RawTransaction,
    StatusCallback,
};
use confidential_wallet::keys::{AccountDetails, BlindingSeed, Chain, ScriptDetails};
use confidential_wallet::{MemoryStore, Network, WalletError, WalletRepository};
use elements::bitcoin::bip32::{DerivationPath, Xpriv, Xpub};
use elements::bitcoin::secp256k1::Secp256k1;
use elements::bitcoin::NetworkKind;
use elements::confidential::{Asset, AssetBlindingFactor, Nonce, Value, ValueBlindingFactor};
use elements::{AssetId, LockTime, Script, Transaction, TxOut, TxOutSecrets, TxOutWitness, Txid};
use rand::thread_rng;

pub const NETWORK: Network = Network::Regtest;

/// In-memory chain source answering from scripted histories.
#[derive(Default)]
pub struct MockChainSource {
    histories: Mutex<HashMap<Script, Vec<HistoryEntry>>>,
    transactions: Mutex<HashMap<Txid, String>>,
    headers: Mutex<HashMap<u32, BlockHeaderInfo>>,
    watchers: Mutex<HashMap<Script, StatusCallback>>,
    broadcasts: Mutex<Vec<String>>,
    fee_rate: Mutex<Option<f64>>,
    pub history_requests: AtomicUsize,
}

impl MockChainSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_history(&self, script: &Script, txid: Txid, height: Option<u32>) {
        self.histories
            .lock()
            .unwrap()
            .entry(script.clone())
            .or_default()
            .push(HistoryEntry { txid, height });
    }

    pub fn add_transaction(&self, tx: &Transaction) -> Txid {
        let txid = tx.txid();
        self.transactions
            .lock()
            .unwrap()
            .insert(txid, elements::encode::serialize_hex(tx));
        txid
    }

    pub fn add_header(&self, height: u32) {
        self.headers.lock().unwrap().insert(
            height,
            BlockHeaderInfo {
                height,
                block_hash: format!("{height:064x}"),
                timestamp: 1_700_000_000 + height,
                hex: String::new(),
            },
        );
    }

    pub fn set_fee_rate(&self, rate: Option<f64>) {
        *self.fee_rate.lock().unwrap() = rate;
    }

    pub fn is_watching(&self, script: &Script) -> bool {
        self.watchers.lock().unwrap().contains_key(script)
    }

    /// Deliver a status change to the watcher of `script`, if any.
    pub fn notify(&self, script: &Script, status: &str) -> bool {
        let callback = self.watchers.lock().unwrap().get(script).cloned();
        match callback {
            Some(callback) => {
                callback(status.to_string());
                true
            }
            None => false,
        }
    }

    pub fn broadcasts(&self) -> Vec<String> {
        self.broadcasts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChainSource for MockChainSource {
    async fn fetch_histories(
        &self,
        scripts: &[Script],
    ) -> Result<Vec<Vec<HistoryEntry>>, WalletError> {
        self.history_requests.fetch_add(1, Ordering::SeqCst);
        let histories = self.histories.lock().unwrap();
        Ok(scripts
            .iter()
            .map(|script| histories.get(script).cloned().unwrap_or_default())
            .collect())
    }

    async fn fetch_transactions(&self, txids: &[Txid]) -> Result<Vec<RawTransaction>, WalletError> {
        // answer per entry the way an Electrum batch does
        let entries: Vec<Result<String, WalletError>> = {
            let transactions = self.transactions.lock().unwrap();
            txids
                .iter()
                .map(|txid| {
                    transactions
                        .get(txid)
                        .cloned()
                        .ok_or_else(|| WalletError::Rpc(format!("missing transaction {txid}")))
                })
                .collect()
        };
        Ok(answered("transaction", txids, entries)
            .map(|(txid, hex)| RawTransaction { txid: *txid, hex })
            .collect())
    }

    async fn fetch_block_headers(
        &self,
        heights: &[u32],
    ) -> Result<Vec<BlockHeaderInfo>, WalletError> {
        let entries: Vec<Result<BlockHeaderInfo, WalletError>> = {
            let headers = self.headers.lock().unwrap();
            heights
                .iter()
                .map(|height| {
                    headers
                        .get(height)
                        .cloned()
                        .ok_or_else(|| WalletError::Rpc(format!("no header at {height}")))
                })
                .collect()
        };
        Ok(answered("block header", heights, entries)
            .map(|(_, header)| header)
            .collect())
    }

    async fn estimate_fee(&self, _target_blocks: u16) -> Result<Option<f64>, WalletError> {
        Ok(*self.fee_rate.lock().unwrap())
    }

    async fn broadcast_transaction(&self, tx_hex: &str) -> Result<Txid, WalletError> {
        let bytes = hex::decode(tx_hex)?;
        let tx: Transaction = elements::encode::deserialize(&bytes)?;
        self.broadcasts.lock().unwrap().push(tx_hex.to_string());
        Ok(tx.txid())
    }

    async fn subscribe_script_status(
        &self,
        script: &Script,
        callback: StatusCallback,
    ) -> Result<(), WalletError> {
        self.watchers
            .lock()
            .unwrap()
            .insert(script.clone(), callback);
        Ok(())
    }

    async fn unsubscribe_script_status(&self, script: &Script) -> Result<(), WalletError> {
        self.watchers.lock().unwrap().remove(script);
        Ok(())
    }

    async fn close(&self) {
        self.watchers.lock().unwrap().clear();
    }
}

pub fn sources(source: &Arc<MockChainSource>) -> ChainSources {
    let source: Arc<dyn ChainSource> = source.clone();
    ChainSources::new().with(NETWORK, source)
}

pub fn txid(n: u8) -> Txid {
    Txid::from_str(&hex::encode([n; 32])).unwrap()
}

/// Account-level key pair below `m/84'/1'/0'` of a seed filled with `seed`.
pub fn account_keys(seed: u8) -> (Xpriv, Xpub) {
    let secp = Secp256k1::new();
    let master = Xpriv::new_master(NetworkKind::Test, &[seed; 32]).unwrap();
    let path = DerivationPath::from_str("m/84'/1'/0'").unwrap();
    let account = master.derive_priv(&secp, &path).unwrap();
    (account, Xpub::from_priv(&secp, &account))
}

pub fn fixed_account(name: &str, seed: u8) -> (AccountDetails, Xpriv) {
    let (xpriv, xpub) = account_keys(seed);
    let account = AccountDetails::fixed(
        name,
        xpub,
        BlindingSeed::from_bytes(vec![seed.wrapping_add(100); 32]),
        vec![NETWORK],
    );
    (account, xpriv)
}

pub fn script_at(account: &AccountDetails, chain: Chain, index: u32) -> Script {
    account.derive_script(NETWORK, chain, index).unwrap().0
}

pub fn store_with(accounts: Vec<AccountDetails>) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new(NETWORK));
    for account in accounts {
        store.save_account(account).unwrap();
    }
    store
}

/// Install a debug-level log subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn policy_asset() -> AssetId {
    NETWORK.policy_asset().unwrap()
}

/// Transaction paying `value` to `script`, blinded to the wallet blinding key
/// of that script, followed by an explicit fee output.
pub fn confidential_payment(script: &Script, details: &ScriptDetails, value: u64) -> Transaction {
    let secp = elements::secp256k1_zkp::Secp256k1::new();
    let mut rng = thread_rng();
    let address =
        confidential_address(NETWORK, script, &details.blinding_secret_key().unwrap()).unwrap();
    let spent = [TxOutSecrets::new(
        policy_asset(),
        AssetBlindingFactor::new(&mut rng),
        value + 500,
        ValueBlindingFactor::new(&mut rng),
    )];
    let (output, _, _, _) =
        TxOut::new_not_last_confidential(&mut rng, &secp, value, address, policy_asset(), &spent)
            .unwrap();
    let fee = TxOut {
        asset: Asset::Explicit(policy_asset()),
        value: Value::Explicit(500),
        nonce: Nonce::Null,
        script_pubkey: Script::new(),
        witness: TxOutWitness::default(),
    };
    Transaction {
        version: 2,
        lock_time: LockTime::ZERO,
        input: vec![],
        output: vec![output, fee],
    }
}
