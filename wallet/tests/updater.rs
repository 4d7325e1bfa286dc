mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use confidential_wallet::coin_select::{balances, list_unspents};
use confidential_wallet::keys::{AccountDetails, Chain, KeyIndices};
use confidential_wallet::store::StoreEvent;
use confidential_wallet::updater::EventBatch;
use confidential_wallet::{MemoryStore, Updater, WalletConfig, WalletRepository};
use elements::confidential::{Asset, Nonce, Value};
use elements::{Script, TxOut, TxOutWitness};

struct Harness {
    account: AccountDetails,
    store: Arc<MemoryStore>,
    source: Arc<MockChainSource>,
    updater: Arc<Updater>,
}

fn harness(scripts: u32) -> Harness {
    let (account, _) = fixed_account("main", 11);
    let store = store_with(vec![account.clone()]);
    let entries = (0..scripts)
        .map(|index| account.derive_script(NETWORK, Chain::External, index).unwrap())
        .collect();
    store.update_script_details(NETWORK, entries).unwrap();
    let source = MockChainSource::new();
    let updater = Updater::new(store.clone(), sources(&source), None, &WalletConfig::default());
    Harness {
        account,
        store,
        source,
        updater,
    }
}

fn entry(account: &AccountDetails, index: u32) -> (Script, confidential_wallet::ScriptDetails) {
    account.derive_script(NETWORK, Chain::External, index).unwrap()
}

#[tokio::test]
async fn new_transactions_are_fetched_unblinded_and_dated() {
    init_tracing();
    let h = harness(3);
    let (script, details) = entry(&h.account, 1);
    let tx = confidential_payment(&script, &details, 25_000);
    let txid = h.source.add_transaction(&tx);
    h.source.add_header(120);
    h.store.add_transactions(NETWORK, &[(txid, Some(120))]).unwrap();

    h.updater.process_transactions(NETWORK, &[txid]).await.unwrap();

    let stored = h.store.get_tx_details(NETWORK, &txid).unwrap().unwrap();
    assert!(stored.hex.is_some());
    assert_eq!(stored.height, Some(120));
    let outputs = h.store.list_output_blinding_data(NETWORK).unwrap();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].outpoint.txid, txid);
    assert_eq!(outputs[0].outpoint.vout, 0);
    assert_eq!(outputs[0].blinding.value, 25_000);
    assert_eq!(outputs[0].blinding.asset, policy_asset());
    assert!(outputs[0].blinding.is_confidential());
    let header = h.store.get_block_header(NETWORK, 120).unwrap().unwrap();
    assert_eq!(header.timestamp, 1_700_000_120);
    assert!(h.store.get_asset(NETWORK, &policy_asset()).unwrap().is_some());
    assert!(!h.updater.is_processing());
}

#[tokio::test]
async fn one_bad_transaction_does_not_block_the_rest() {
    let h = harness(2);
    let (script, details) = entry(&h.account, 0);
    let good = h.source.add_transaction(&confidential_payment(&script, &details, 7_000));
    // unknown to the chain source, so its hex never arrives
    let missing = txid(99);
    h.store
        .add_transactions(NETWORK, &[(good, None), (missing, None)])
        .unwrap();

    h.updater
        .process_transactions(NETWORK, &[missing, good])
        .await
        .unwrap();
    assert_eq!(h.store.list_output_blinding_data(NETWORK).unwrap().len(), 1);
    assert!(h
        .store
        .get_tx_details(NETWORK, &missing)
        .unwrap()
        .unwrap()
        .hex
        .is_none());
}

#[tokio::test]
async fn explicit_outputs_to_foreign_scripts_are_not_wallet_coins() {
    let h = harness(1);
    let (script, details) = entry(&h.account, 0);
    let mut tx = confidential_payment(&script, &details, 10_000);
    let mut foreign = vec![0x00, 0x14];
    foreign.extend_from_slice(&[0xee; 20]);
    tx.output.insert(
        1,
        TxOut {
            asset: Asset::Explicit(policy_asset()),
            value: Value::Explicit(99_999_999),
            nonce: Nonce::Null,
            script_pubkey: Script::from(foreign),
            witness: TxOutWitness::default(),
        },
    );
    let txid = h.source.add_transaction(&tx);
    h.store.add_transactions(NETWORK, &[(txid, None)]).unwrap();

    h.updater.process_transactions(NETWORK, &[txid]).await.unwrap();

    let unspents = list_unspents(&*h.store, NETWORK).unwrap();
    let values: Vec<u64> = unspents.iter().map(|utxo| utxo.blinding.value).collect();
    assert_eq!(values, vec![10_000]);
    assert_eq!(balances(&unspents)[&policy_asset()], 10_000);
}

#[tokio::test]
async fn network_switch_refreshes_the_latest_window() {
    let h = harness(4);
    h.store
        .update_account_key_index(
            "main",
            NETWORK,
            KeyIndices {
                external: 2,
                internal: 0,
            },
        )
        .unwrap();
    h.source.add_history(&entry(&h.account, 1).0, txid(5), Some(77));
    // index 2 is the address most recently handed out
    h.source.add_history(&entry(&h.account, 2).0, txid(7), None);
    // outside the window: index 3 was never handed out
    h.source.add_history(&entry(&h.account, 3).0, txid(6), Some(78));

    let batch: EventBatch = [StoreEvent::NetworkChanged(NETWORK)].into_iter().collect();
    h.updater.process_batch(batch).await;

    let transactions = h.store.list_transactions(NETWORK).unwrap();
    assert!(transactions.contains_key(&txid(5)));
    assert!(transactions.contains_key(&txid(7)));
    assert!(!transactions.contains_key(&txid(6)));
    assert_eq!(
        h.store
            .get_account_details("main")
            .unwrap()
            .key_indices(NETWORK)
            .external,
        3
    );
}

#[tokio::test]
async fn script_status_changes_trigger_a_history_refresh() {
    let h = harness(1);
    let (script, _) = entry(&h.account, 0);
    let batch: EventBatch = [StoreEvent::NewScript {
        network: NETWORK,
        script: script.clone(),
    }]
    .into_iter()
    .collect();
    h.updater.process_batch(batch).await;
    assert!(h.source.is_watching(&script));

    h.source.add_history(&script, txid(8), None);
    assert!(h.source.notify(&script, "a1b2"));
    h.updater.wait_for_processing().await;

    assert!(h
        .store
        .list_transactions(NETWORK)
        .unwrap()
        .contains_key(&txid(8)));
    assert_eq!(
        h.store
            .get_account_details("main")
            .unwrap()
            .key_indices(NETWORK)
            .external,
        1
    );
}

#[tokio::test]
async fn started_updater_reacts_to_store_notifications() {
    let h = harness(2);
    let handle = h.updater.start();
    let (script, details) = entry(&h.account, 1);
    let txid = h
        .source
        .add_transaction(&confidential_payment(&script, &details, 3_000));
    h.source.add_header(9);

    h.store.add_transactions(NETWORK, &[(txid, Some(9))]).unwrap();

    let unblinded = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let outputs = h.store.list_output_blinding_data(NETWORK).unwrap();
            if !outputs.is_empty() {
                return outputs;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("updater did not process the notification");
    assert_eq!(unblinded[0].blinding.value, 3_000);

    h.updater.wait_for_processing().await;
    assert!(h.store.get_block_header(NETWORK, 9).unwrap().is_some());
    handle.abort();
}
