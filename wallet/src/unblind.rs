//! Recovery of value, asset and blinding factors from transaction outputs.
//!
//! Results always line up with the outputs they were computed from. A
//! transparent output yields a result with zero blinding factors so callers
//! never branch on confidentiality.

use std::collections::HashMap;

use elements::confidential::{Asset, AssetBlindingFactor, Value, ValueBlindingFactor};
use elements::secp256k1_zkp::{Secp256k1, SecretKey, Verification};
use elements::slip77::MasterBlindingKey;
use elements::{AssetId, OutPoint, Script, Transaction, TxOut, TxOutSecrets};
use thiserror::Error;
use tracing::{debug, warn};

use crate::keys::ScriptDetails;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlindingResult {
    pub value: u64,
    pub asset: AssetId,
    pub asset_blinding_factor: AssetBlindingFactor,
    pub value_blinding_factor: ValueBlindingFactor,
}

impl BlindingResult {
    pub fn transparent(value: u64, asset: AssetId) -> Self {
        Self {
            value,
            asset,
            asset_blinding_factor: AssetBlindingFactor::zero(),
            value_blinding_factor: ValueBlindingFactor::zero(),
        }
    }

    pub fn is_confidential(&self) -> bool {
        self.asset_blinding_factor != AssetBlindingFactor::zero()
            || self.value_blinding_factor != ValueBlindingFactor::zero()
    }

    pub fn to_secrets(&self) -> TxOutSecrets {
        TxOutSecrets::new(
            self.asset,
            self.asset_blinding_factor,
            self.value,
            self.value_blinding_factor,
        )
    }
}

impl From<TxOutSecrets> for BlindingResult {
    fn from(secrets: TxOutSecrets) -> Self {
        Self {
            value: secrets.value,
            asset: secrets.asset,
            asset_blinding_factor: secrets.asset_bf,
            value_blinding_factor: secrets.value_bf,
        }
    }
}

/// An output the wallet can spend, with everything needed to blind a
/// transaction that consumes it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnblindedOutput {
    pub outpoint: OutPoint,
    pub script: Script,
    pub blinding: BlindingResult,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UnblindError {
    #[error("fee output has an empty script")]
    FeeOutput,

    #[error("output is not ours")]
    NotOwned,

    #[error("malformed output: {0}")]
    Malformed(String),
}

impl UnblindError {
    /// Expected outcomes that callers drop without logging.
    pub fn is_benign(&self) -> bool {
        matches!(self, UnblindError::FeeOutput | UnblindError::NotOwned)
    }
}

/// Looks up the blinding private key for an output script.
pub trait BlindingKeySource {
    fn blinding_key(&self, script: &Script) -> Option<SecretKey>;
}

impl BlindingKeySource for MasterBlindingKey {
    fn blinding_key(&self, script: &Script) -> Option<SecretKey> {
        Some(self.blinding_private_key(script))
    }
}

impl BlindingKeySource for HashMap<Script, ScriptDetails> {
    fn blinding_key(&self, script: &Script) -> Option<SecretKey> {
        self.get(script)
            .and_then(|details| details.blinding_secret_key().ok())
    }
}

pub fn unblind_output<C: Verification>(
    secp: &Secp256k1<C>,
    output: &TxOut,
    keys: &impl BlindingKeySource,
) -> Result<BlindingResult, UnblindError> {
    if output.script_pubkey.is_empty() {
        return Err(UnblindError::FeeOutput);
    }
    // ownership first: a transparent output to someone else is not ours either
    let key = keys
        .blinding_key(&output.script_pubkey)
        .ok_or(UnblindError::NotOwned)?;

    let rangeproof = output.witness.rangeproof.is_some();
    let surjection_proof = output.witness.surjection_proof.is_some();
    if !rangeproof && !surjection_proof {
        return match (output.value, output.asset) {
            (Value::Explicit(value), Asset::Explicit(asset)) => {
                Ok(BlindingResult::transparent(value, asset))
            }
            _ => Err(UnblindError::Malformed(
                "commitments without proofs".to_string(),
            )),
        };
    }
    if !rangeproof {
        return Err(UnblindError::Malformed("missing range proof".to_string()));
    }
    if !output.nonce.is_confidential() {
        return Err(UnblindError::Malformed("explicit nonce".to_string()));
    }

    // a rewind failure past this point means the proof was built for another key
    output
        .unblind(secp, key)
        .map(BlindingResult::from)
        .map_err(|_| UnblindError::NotOwned)
}

/// Unblind every output. The result has the same length and order as `outputs`.
pub fn unblind_outputs(
    outputs: &[TxOut],
    keys: &impl BlindingKeySource,
) -> Vec<Result<BlindingResult, UnblindError>> {
    let secp = Secp256k1::verification_only();
    outputs
        .iter()
        .map(|output| unblind_output(&secp, output, keys))
        .collect()
}

/// Flatten the owned outputs of `transactions`, dropping benign failures.
pub fn unblind_transactions<'a, K: BlindingKeySource>(
    transactions: &'a [Transaction],
    keys: &'a K,
) -> Vec<UnblindedOutput> {
    let mut stream = UnblindStream::new(transactions, keys);
    let outputs: Vec<_> = stream.by_ref().collect();
    let summary = stream.summary();
    debug!(
        unblinded = summary.unblinded,
        skipped = summary.skipped,
        failed = summary.failed.len(),
        "unblinded transactions"
    );
    outputs
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UnblindSummary {
    pub unblinded: usize,
    /// Fee outputs and outputs belonging to someone else.
    pub skipped: usize,
    pub failed: Vec<(OutPoint, UnblindError)>,
}

/// Lazily walks the outputs of a set of transactions and yields those that
/// unblind. Counts are available from [`UnblindStream::summary`] once the
/// iterator is exhausted.
pub struct UnblindStream<'a, K> {
    transactions: &'a [Transaction],
    keys: &'a K,
    secp: Secp256k1<elements::secp256k1_zkp::VerifyOnly>,
    tx_index: usize,
    vout: usize,
    current_txid: Option<elements::Txid>,
    summary: UnblindSummary,
}

impl<'a, K: BlindingKeySource> UnblindStream<'a, K> {
    pub fn new(transactions: &'a [Transaction], keys: &'a K) -> Self {
        Self {
            transactions,
            keys,
            secp: Secp256k1::verification_only(),
            tx_index: 0,
            vout: 0,
            current_txid: None,
            summary: UnblindSummary::default(),
        }
    }

    pub fn summary(&self) -> &UnblindSummary {
        &self.summary
    }

    pub fn into_summary(self) -> UnblindSummary {
        self.summary
    }
}

impl<K: BlindingKeySource> Iterator for UnblindStream<'_, K> {
    type Item = UnblindedOutput;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let transactions = self.transactions;
            let tx = transactions.get(self.tx_index)?;
            let Some(output) = tx.output.get(self.vout) else {
                self.tx_index += 1;
                self.vout = 0;
                self.current_txid = None;
                continue;
            };
            let txid = *self.current_txid.get_or_insert_with(|| tx.txid());
            let outpoint = OutPoint::new(txid, self.vout as u32);
            self.vout += 1;

            match unblind_output(&self.secp, output, self.keys) {
                Ok(blinding) => {
                    self.summary.unblinded += 1;
                    return Some(UnblindedOutput {
                        outpoint,
                        script: output.script_pubkey.clone(),
                        blinding,
                    });
                }
                Err(err) if err.is_benign() => self.summary.skipped += 1,
                Err(err) => {
                    warn!(%outpoint, error = %err, "failed to unblind output");
                    self.summary.failed.push((outpoint, err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use elements::confidential::Nonce;
    use elements::secp256k1_zkp::PublicKey;
    use elements::{LockTime, TxOutWitness};
    use rand::thread_rng;

    use super::*;

    fn asset() -> AssetId {
        AssetId::from_str("5ac9f65c0efcc4775e0baec4ec03abdde22473cd3cf33c0419ca290e0751b225")
            .unwrap()
    }

    fn script(byte: u8) -> Script {
        let mut bytes = vec![0x00, 0x14];
        bytes.extend_from_slice(&[byte; 20]);
        Script::from(bytes)
    }

    fn explicit(value: u64, script: Script) -> TxOut {
        TxOut {
            asset: Asset::Explicit(asset()),
            value: Value::Explicit(value),
            nonce: Nonce::Null,
            script_pubkey: script,
            witness: TxOutWitness::default(),
        }
    }

    fn fee(value: u64) -> TxOut {
        explicit(value, Script::new())
    }

    /// SLIP-77 keys restricted to the scripts a wallet has derived.
    struct Owned {
        master: MasterBlindingKey,
        scripts: Vec<Script>,
    }

    impl BlindingKeySource for Owned {
        fn blinding_key(&self, script: &Script) -> Option<SecretKey> {
            self.scripts
                .contains(script)
                .then(|| self.master.blinding_private_key(script))
        }
    }

    /// Confidential output paying a P2WPKH owned by `owner`, blinded to the
    /// SLIP-77 key `master` assigns to that script.
    fn confidential(value: u64, owner: u8, master: &MasterBlindingKey) -> (TxOut, TxOutSecrets) {
        let secp = Secp256k1::new();
        let mut rng = thread_rng();
        let owner_sk = SecretKey::from_slice(&[owner; 32]).unwrap();
        let owner_pk = elements::bitcoin::PublicKey::from_slice(
            &PublicKey::from_secret_key(&secp, &owner_sk).serialize(),
        )
        .unwrap();
        let params = &elements::AddressParams::ELEMENTS;
        let script = elements::Address::p2wpkh(&owner_pk, None, params).script_pubkey();
        let blinding_pk = PublicKey::from_secret_key(&secp, &master.blinding_private_key(&script));
        let address = elements::Address::p2wpkh(&owner_pk, Some(blinding_pk), params);

        let spent = [TxOutSecrets::new(
            asset(),
            AssetBlindingFactor::new(&mut rng),
            value,
            ValueBlindingFactor::new(&mut rng),
        )];
        let (out, abf, vbf, _) =
            TxOut::new_not_last_confidential(&mut rng, &secp, value, address, asset(), &spent)
                .unwrap();
        (out, TxOutSecrets::new(asset(), abf, value, vbf))
    }

    fn transaction(outputs: Vec<TxOut>) -> Transaction {
        Transaction {
            version: 2,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: outputs,
        }
    }

    #[test]
    fn transparent_output_gets_zero_factors() {
        let keys = MasterBlindingKey::from_seed(&[1u8; 32]);
        let results = unblind_outputs(&[explicit(5_000, script(1))], &keys);
        let result = results[0].clone().unwrap();
        assert_eq!(result.value, 5_000);
        assert_eq!(result.asset, asset());
        assert_eq!(result.asset_blinding_factor, AssetBlindingFactor::zero());
        assert_eq!(result.value_blinding_factor, ValueBlindingFactor::zero());
        assert!(!result.is_confidential());
    }

    #[test]
    fn confidential_output_round_trips_with_the_right_key() {
        let keys = MasterBlindingKey::from_seed(&[2u8; 32]);
        let (output, secrets) = confidential(42_000, 2, &keys);
        let result = unblind_outputs(&[output], &keys)[0].clone().unwrap();
        assert_eq!(result.value, 42_000);
        assert_eq!(result.asset, asset());
        assert_eq!(result.to_secrets(), secrets);
    }

    #[test]
    fn foreign_key_is_benign() {
        let ours = MasterBlindingKey::from_seed(&[3u8; 32]);
        let theirs = MasterBlindingKey::from_seed(&[4u8; 32]);
        let (output, _) = confidential(1_000, 3, &theirs);
        let err = unblind_outputs(&[output], &ours)[0].clone().unwrap_err();
        assert_eq!(err, UnblindError::NotOwned);
        assert!(err.is_benign());
    }

    #[test]
    fn fee_output_is_benign() {
        let keys = MasterBlindingKey::from_seed(&[1u8; 32]);
        let err = unblind_outputs(&[fee(250)], &keys)[0].clone().unwrap_err();
        assert_eq!(err, UnblindError::FeeOutput);
        assert!(err.is_benign());
    }

    #[test]
    fn failures_do_not_disturb_neighbours() {
        let keys = MasterBlindingKey::from_seed(&[5u8; 32]);
        let (good, _) = confidential(7, 9, &keys);
        let mut broken = good.clone();
        broken.witness = TxOutWitness::default();
        let outputs = vec![
            explicit(1, script(1)),
            broken,
            explicit(3, script(3)),
            good,
            fee(5),
        ];
        let results = unblind_outputs(&outputs, &keys);
        assert_eq!(results.len(), outputs.len());
        assert_eq!(results[0].as_ref().unwrap().value, 1);
        assert!(matches!(results[1], Err(UnblindError::Malformed(_))));
        assert_eq!(results[2].as_ref().unwrap().value, 3);
        assert_eq!(results[3].as_ref().unwrap().value, 7);
        assert_eq!(results[4], Err(UnblindError::FeeOutput));
    }

    #[test]
    fn unknown_script_is_not_owned() {
        let keys: HashMap<Script, ScriptDetails> = HashMap::new();
        let master = MasterBlindingKey::from_seed(&[6u8; 32]);
        let (output, _) = confidential(10, 6, &master);
        assert_eq!(
            unblind_outputs(&[output], &keys)[0],
            Err(UnblindError::NotOwned)
        );
    }

    #[test]
    fn explicit_output_to_a_foreign_script_is_not_owned() {
        let keys = Owned {
            master: MasterBlindingKey::from_seed(&[9u8; 32]),
            scripts: vec![script(1)],
        };
        let results = unblind_outputs(&[explicit(10, script(1)), explicit(99, script(2))], &keys);
        assert_eq!(results[0].as_ref().unwrap().value, 10);
        assert_eq!(results[1], Err(UnblindError::NotOwned));
    }

    #[test]
    fn stream_flattens_and_summarises() {
        let master = MasterBlindingKey::from_seed(&[7u8; 32]);
        let (mine, _) = confidential(900, 7, &master);
        let other = MasterBlindingKey::from_seed(&[8u8; 32]);
        let (theirs, _) = confidential(100, 8, &other);
        let keys = Owned {
            master,
            scripts: vec![mine.script_pubkey.clone(), script(6)],
        };
        let txs = vec![
            transaction(vec![mine, fee(10)]),
            transaction(vec![theirs, explicit(55, script(5)), explicit(66, script(6))]),
        ];

        let mut stream = UnblindStream::new(&txs, &keys);
        let outputs: Vec<_> = stream.by_ref().collect();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].outpoint, OutPoint::new(txs[0].txid(), 0));
        assert_eq!(outputs[0].blinding.value, 900);
        assert_eq!(outputs[1].outpoint, OutPoint::new(txs[1].txid(), 2));
        assert_eq!(outputs[1].blinding.value, 66);
        let summary = stream.into_summary();
        assert_eq!(summary.unblinded, 2);
        assert_eq!(summary.skipped, 3);
        assert!(summary.failed.is_empty());

        assert_eq!(unblind_transactions(&txs, &keys).len(), 2);
    }
}
