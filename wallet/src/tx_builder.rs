//! Partially signed transaction assembly: build, blind, sign and finalize.
//!
//! The flow is split so hosts can hand the intermediate PSET to external
//! signers:
//!
//! 1. [`prepare_send`] selects coins and builds an unblinded PSET with an
//!    explicit fee output on the policy asset.
//! 2. [`blind`] blinds every output that carries a blinding key and checks
//!    that all of them ended up with proofs.
//! 3. [`sign`] offers the PSET to each signer in turn.
//! 4. [`finalize`] writes the witnesses and extracts the transaction.

use std::collections::HashMap;

use elements::bitcoin::bip32::{ChildNumber, DerivationPath, Fingerprint};
use elements::bitcoin::PublicKey;
use elements::opcodes::all::OP_CSV;
use elements::pset::{Input, Output, PartiallySignedTransaction};
use elements::script::Instruction;
use elements::secp256k1_zkp::Secp256k1;
use elements::{Address, AssetId, OutPoint, Script, Sequence, Transaction, TxOut, Txid};
use rand::thread_rng;
use tracing::{debug, info, warn};

use crate::chain_source::ChainSource;
use crate::coin_select::{list_unspents, select_coins, ChangeOutput, CoinSelection, Target};
use crate::error::WalletError;
use crate::keys::ScriptDetails;
use crate::network::Network;
use crate::signer::{signature_is_valid, Signer};
use crate::store::WalletRepository;
use crate::unblind::{BlindingResult, UnblindedOutput};

const TX_OVERHEAD_VSIZE: u64 = 11;
const P2WPKH_INPUT_VSIZE: u64 = 70;
/// Outpoint, sequence and empty script sig; the witness is added per script.
const P2WSH_INPUT_BASE_VSIZE: u64 = 44;
/// Commitments plus the witness share of a 52-bit range proof and a
/// surjection proof.
const CONFIDENTIAL_OUTPUT_VSIZE: u64 = 1200;
const EXPLICIT_OUTPUT_VSIZE: u64 = 80;
const FEE_OUTPUT_VSIZE: u64 = 45;

/// Upper bound on select-then-estimate rounds in [`prepare_send`].
const MAX_FEE_ROUNDS: usize = 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Recipient {
    pub address: Address,
    pub asset: AssetId,
    pub value: u64,
}

impl Recipient {
    pub fn is_confidential(&self) -> bool {
        self.address.blinding_pubkey.is_some()
    }
}

/// An owned output resolved to everything needed to spend it.
#[derive(Clone, Debug)]
pub struct SpendInput {
    pub outpoint: OutPoint,
    pub prevout: TxOut,
    pub secrets: BlindingResult,
    pub details: ScriptDetails,
    pub public_key: PublicKey,
    /// Account key fingerprint and the `chain/index` path below it.
    pub key_origin: (Fingerprint, DerivationPath),
}

impl SpendInput {
    pub fn witness_script(&self) -> Result<Option<Script>, WalletError> {
        self.details
            .template
            .as_ref()
            .map(|bound| bound.witness_script())
            .transpose()
    }

    fn estimated_vsize(&self) -> Result<u64, WalletError> {
        match self.witness_script()? {
            None => Ok(P2WPKH_INPUT_VSIZE),
            Some(script) => {
                // signature, script push and the empty issuance/peg-in witness markers
                let witness = 1 + 73 + 3 + script.len() as u64 + 3;
                Ok(P2WSH_INPUT_BASE_VSIZE + witness.div_ceil(4))
            }
        }
    }
}

/// Look up the funding transaction, script entry and key origin of each
/// selected output.
pub fn resolve_inputs(
    store: &dyn WalletRepository,
    network: Network,
    selected: &[UnblindedOutput],
) -> Result<Vec<SpendInput>, WalletError> {
    let scripts = store.get_account_scripts(network, None)?;
    selected
        .iter()
        .map(|utxo| {
            let hex = store
                .get_tx_details(network, &utxo.outpoint.txid)?
                .and_then(|details| details.hex)
                .ok_or(WalletError::InvalidState("funding transaction is not cached"))?;
            let tx: Transaction = elements::encode::deserialize(&hex::decode(hex)?)?;
            let prevout = tx
                .output
                .get(utxo.outpoint.vout as usize)
                .cloned()
                .ok_or(WalletError::InvalidState("outpoint index out of range"))?;
            if prevout.script_pubkey != utxo.script {
                return Err(WalletError::InvalidState("outpoint script mismatch"));
            }
            let details = scripts
                .get(&utxo.script)
                .cloned()
                .ok_or(WalletError::InvalidState("spent script is not a wallet script"))?;
            let account = store.get_account_details(&details.account_name)?;
            let public_key = account.derive_public_key(details.chain, details.index)?;
            let path = DerivationPath::from(vec![
                ChildNumber::from_normal_idx(details.chain.index())?,
                ChildNumber::from_normal_idx(details.index)?,
            ]);
            Ok(SpendInput {
                outpoint: utxo.outpoint,
                prevout,
                secrets: utxo.blinding,
                details,
                public_key,
                key_origin: (account.master_public_key.fingerprint(), path),
            })
        })
        .collect()
}

pub fn estimate_vsize(
    inputs: &[SpendInput],
    confidential_outputs: usize,
    explicit_outputs: usize,
) -> Result<u64, WalletError> {
    let mut vsize = TX_OVERHEAD_VSIZE + FEE_OUTPUT_VSIZE;
    for input in inputs {
        vsize += input.estimated_vsize()?;
    }
    vsize += confidential_outputs as u64 * CONFIDENTIAL_OUTPUT_VSIZE;
    vsize += explicit_outputs as u64 * EXPLICIT_OUTPUT_VSIZE;
    Ok(vsize)
}

/// Fee in satoshi for `vsize` virtual bytes at `fee_rate` sat/vB, rounded up.
pub fn fee_for_vsize(vsize: u64, fee_rate: f64) -> u64 {
    (vsize as f64 * fee_rate).ceil() as u64
}

pub fn estimate_fee(
    fee_rate: f64,
    inputs: &[SpendInput],
    confidential_outputs: usize,
    explicit_outputs: usize,
) -> Result<u64, WalletError> {
    Ok(fee_for_vsize(
        estimate_vsize(inputs, confidential_outputs, explicit_outputs)?,
        fee_rate,
    ))
}

/// Ask the chain source for a fee rate, falling back to `fallback` when it
/// has no estimate or cannot be reached.
pub async fn resolve_fee_rate(source: &dyn ChainSource, target_blocks: u16, fallback: f64) -> f64 {
    match source.estimate_fee(target_blocks).await {
        Ok(Some(rate)) if rate.is_finite() && rate > 0.0 => rate,
        Ok(_) => fallback,
        Err(err) => {
            warn!(error = %err, fallback, "fee estimation failed");
            fallback
        }
    }
}

fn output_for(address: &Address, asset: AssetId, value: u64) -> Output {
    let blinding_key = address.blinding_pubkey.map(|inner| PublicKey {
        inner,
        compressed: true,
    });
    let mut output = Output::new_explicit(address.script_pubkey(), value, asset, blinding_key);
    if blinding_key.is_some() {
        output.blinder_index = Some(0);
    }
    output
}

fn check_balance(
    inputs: &[SpendInput],
    outputs: &[(AssetId, u64)],
) -> Result<(), WalletError> {
    let mut balance: HashMap<AssetId, i128> = HashMap::new();
    for input in inputs {
        *balance.entry(input.secrets.asset).or_default() += i128::from(input.secrets.value);
    }
    for (asset, value) in outputs {
        *balance.entry(*asset).or_default() -= i128::from(*value);
    }
    if balance.values().any(|delta| *delta != 0) {
        return Err(WalletError::InvalidArgument("inputs and outputs do not balance"));
    }
    Ok(())
}

/// Unblinded PSET paying `recipients`, then `change`, then an explicit fee
/// output on the network's policy asset.
pub fn build_transaction(
    network: Network,
    recipients: &[Recipient],
    inputs: &[SpendInput],
    change: &[ChangeOutput],
    fee: u64,
) -> Result<PartiallySignedTransaction, WalletError> {
    if recipients.is_empty() {
        return Err(WalletError::InvalidArgument("at least one recipient"));
    }
    if inputs.is_empty() {
        return Err(WalletError::InvalidArgument("at least one input"));
    }
    let policy_asset = network.policy_asset()?;
    let mut amounts: Vec<(AssetId, u64)> = recipients
        .iter()
        .map(|r| (r.asset, r.value))
        .chain(change.iter().map(|c| (c.asset, c.value)))
        .collect();
    amounts.push((policy_asset, fee));
    check_balance(inputs, &amounts)?;

    let mut pset = PartiallySignedTransaction::new_v2();
    for spend in inputs {
        let mut input = Input::from_prevout(spend.outpoint);
        input.witness_utxo = Some(spend.prevout.clone());
        input.witness_script = spend.witness_script()?;
        input
            .bip32_derivation
            .insert(spend.public_key, spend.key_origin.clone());
        pset.add_input(input);
    }
    for recipient in recipients {
        pset.add_output(output_for(&recipient.address, recipient.asset, recipient.value));
    }
    for output in change {
        pset.add_output(output_for(&output.address, output.asset, output.value));
    }
    pset.add_output(Output::new_explicit(Script::new(), fee, policy_asset, None));
    Ok(pset)
}

/// Blind every output that carries a blinding key. `inputs` must line up
/// with the PSET inputs.
pub fn blind(
    pset: &mut PartiallySignedTransaction,
    inputs: &[SpendInput],
) -> Result<(), WalletError> {
    if pset.inputs().len() != inputs.len() {
        return Err(WalletError::Blinding(format!(
            "{} inputs but blinding data for {}",
            pset.inputs().len(),
            inputs.len()
        )));
    }
    let to_blind = pset
        .outputs()
        .iter()
        .filter(|output| output.blinding_key.is_some())
        .count();
    if to_blind == 0 {
        // Explicit outputs cannot balance blinded inputs.
        if inputs.iter().any(|input| input.secrets.is_confidential()) {
            return Err(WalletError::Blinding(
                "confidential inputs need at least one confidential output".into(),
            ));
        }
        return Ok(());
    }

    let secrets = inputs
        .iter()
        .enumerate()
        .map(|(index, input)| (index, input.secrets.to_secrets()))
        .collect();
    let secp = Secp256k1::new();
    pset.blind_last(&mut thread_rng(), &secp, &secrets)
        .map_err(|err| WalletError::Blinding(format!("{err:?}")))?;
    verify_blinded(pset)?;
    debug!(outputs = to_blind, "outputs blinded");
    Ok(())
}

/// Every output with a blinding key must carry both proofs.
pub fn verify_blinded(pset: &PartiallySignedTransaction) -> Result<(), WalletError> {
    for (index, output) in pset.outputs().iter().enumerate() {
        if output.blinding_key.is_none() {
            continue;
        }
        if output.value_rangeproof.is_none() || output.asset_surjection_proof.is_none() {
            return Err(WalletError::IncompleteBlinding(index));
        }
    }
    Ok(())
}

/// Inputs that have neither a signature nor a final witness. Run
/// [`drop_invalid_signatures`] first to count only signatures that verify.
pub fn unsigned_inputs(pset: &PartiallySignedTransaction) -> usize {
    pset.inputs()
        .iter()
        .filter(|input| input.partial_sigs.is_empty() && input.final_script_witness.is_none())
        .count()
}

/// Remove partial signatures that do not sign their input's sighash.
/// Returns how many were removed.
pub fn drop_invalid_signatures(
    pset: &mut PartiallySignedTransaction,
) -> Result<usize, WalletError> {
    let tx = pset
        .extract_tx()
        .map_err(|e| WalletError::Signing(format!("cannot extract transaction: {e}")))?;
    let secp = elements::bitcoin::secp256k1::Secp256k1::verification_only();
    let mut dropped = 0;
    for (index, input) in pset.inputs_mut().iter_mut().enumerate() {
        let current: &Input = input;
        let invalid: Vec<PublicKey> = current
            .partial_sigs
            .iter()
            .filter(|(key, sig)| !signature_is_valid(&secp, &tx, index, current, key, sig))
            .map(|(key, _)| *key)
            .collect();
        for key in invalid {
            warn!(input = index, %key, "dropping invalid signature");
            input.partial_sigs.remove(&key);
            dropped += 1;
        }
    }
    Ok(dropped)
}

/// Offer the PSET to each signer until every input carries a signature that
/// verifies. Signers that add nothing or fail are skipped, and invalid
/// signatures are discarded before the next signer runs.
pub fn sign(
    pset: &mut PartiallySignedTransaction,
    signers: &[&dyn Signer],
) -> Result<(), WalletError> {
    for (position, signer) in signers.iter().enumerate() {
        drop_invalid_signatures(pset)?;
        if unsigned_inputs(pset) == 0 {
            break;
        }
        match signer.sign(pset) {
            Ok(0) => debug!(signer = position, "signer had no matching keys"),
            Ok(added) => debug!(signer = position, added, "signatures added"),
            Err(err) => warn!(signer = position, error = %err, "signer skipped"),
        }
    }
    drop_invalid_signatures(pset)?;
    match unsigned_inputs(pset) {
        0 => Ok(()),
        unsigned => Err(WalletError::SignersExhausted { unsigned }),
    }
}

#[derive(Clone, Debug)]
pub struct FinalizedTransaction {
    pub tx: Transaction,
    pub bytes: Vec<u8>,
}

impl FinalizedTransaction {
    pub fn txid(&self) -> Txid {
        self.tx.txid()
    }

    pub fn hex(&self) -> String {
        hex::encode(&self.bytes)
    }
}

/// Write `[sig, pubkey]` for P2WPKH inputs and `[sig, witness_script]` for
/// programmable inputs, then extract the network transaction.
///
/// Programmable inputs are finalized for templates that need exactly one
/// signature by the derived key. A script containing `OP_CHECKSEQUENCEVERIFY`
/// is refused unless the host set a relative-timelock sequence on the input
/// before signing; templates needing several signatures are finalized by the
/// host from the signed PSET.
pub fn finalize(
    mut pset: PartiallySignedTransaction,
) -> Result<FinalizedTransaction, WalletError> {
    for (index, input) in pset.inputs_mut().iter_mut().enumerate() {
        if input.final_script_witness.is_some() {
            continue;
        }
        let (key, signature) = input
            .partial_sigs
            .iter()
            .next()
            .map(|(key, sig)| (*key, sig.clone()))
            .ok_or_else(|| WalletError::Finalize(format!("input {index} is not signed")))?;
        let last = match &input.witness_script {
            Some(script) => {
                if checks_sequence(script) && !enables_relative_lock(input.sequence) {
                    return Err(WalletError::Finalize(format!(
                        "input {index} script needs a relative timelock sequence"
                    )));
                }
                script.to_bytes()
            }
            None => key.to_bytes(),
        };
        input.final_script_witness = Some(vec![signature, last]);
        input.partial_sigs.clear();
    }
    let tx = pset
        .extract_tx()
        .map_err(|err| WalletError::Finalize(err.to_string()))?;
    let bytes = elements::encode::serialize(&tx);
    Ok(FinalizedTransaction { tx, bytes })
}

fn checks_sequence(script: &Script) -> bool {
    script
        .instructions()
        .any(|ins| matches!(ins, Ok(Instruction::Op(op)) if op == OP_CSV))
}

/// Bit 31 clear means the sequence carries a relative lock time.
fn enables_relative_lock(sequence: Option<Sequence>) -> bool {
    sequence.map_or(false, |seq| seq.0 & (1 << 31) == 0)
}

/// A built, not yet blinded, send.
#[derive(Clone, Debug)]
pub struct PreparedSend {
    pub pset: PartiallySignedTransaction,
    pub inputs: Vec<SpendInput>,
    pub selection: CoinSelection,
    pub fee: u64,
}

/// Select coins for `recipients` plus a fee at `fee_rate`, repeating until
/// the fee covers the transaction the selection produces.
pub fn prepare_send<F>(
    store: &dyn WalletRepository,
    network: Network,
    recipients: &[Recipient],
    mut change_address: F,
    fee_rate: f64,
) -> Result<PreparedSend, WalletError>
where
    F: FnMut(&AssetId) -> Result<Address, WalletError>,
{
    if !(fee_rate.is_finite() && fee_rate > 0.0) {
        return Err(WalletError::InvalidArgument("fee rate must be positive"));
    }
    let policy_asset = network.policy_asset()?;
    let available = list_unspents(store, network)?;
    let recipient_targets: Vec<Target> = recipients
        .iter()
        .map(|r| Target {
            asset: r.asset,
            amount: r.value,
        })
        .collect();

    let mut fee = fee_for_vsize(TX_OVERHEAD_VSIZE + FEE_OUTPUT_VSIZE + P2WPKH_INPUT_VSIZE, fee_rate);
    for _ in 0..MAX_FEE_ROUNDS {
        let mut targets = recipient_targets.clone();
        targets.push(Target {
            asset: policy_asset,
            amount: fee,
        });
        let selection = select_coins(&available, &targets, &mut change_address)?;
        let inputs = resolve_inputs(store, network, &selection.selected)?;

        let confidential = recipients.iter().filter(|r| r.is_confidential()).count()
            + selection
                .change
                .iter()
                .filter(|c| c.address.blinding_pubkey.is_some())
                .count();
        let explicit = recipients.len() + selection.change.len() - confidential;
        let required = estimate_fee(fee_rate, &inputs, confidential, explicit)?;
        if required <= fee {
            let pset = build_transaction(network, recipients, &inputs, &selection.change, fee)?;
            return Ok(PreparedSend {
                pset,
                inputs,
                selection,
                fee,
            });
        }
        debug!(fee, required, "fee below estimate, reselecting");
        fee = required;
    }
    Err(WalletError::InvalidState("fee estimate did not converge"))
}

pub async fn broadcast(
    source: &dyn ChainSource,
    tx: &FinalizedTransaction,
) -> Result<Txid, WalletError> {
    let txid = source.broadcast_transaction(&tx.hex()).await?;
    info!(%txid, bytes = tx.bytes.len(), "transaction broadcast");
    Ok(txid)
}

/// Prepare, blind, sign, finalize and broadcast in one call.
pub async fn send<F>(
    store: &dyn WalletRepository,
    source: &dyn ChainSource,
    network: Network,
    recipients: &[Recipient],
    change_address: F,
    signers: &[&dyn Signer],
    fee_rate: f64,
) -> Result<Txid, WalletError>
where
    F: FnMut(&AssetId) -> Result<Address, WalletError>,
{
    let PreparedSend {
        mut pset, inputs, ..
    } = prepare_send(store, network, recipients, change_address, fee_rate)?;
    blind(&mut pset, &inputs)?;
    sign(&mut pset, signers)?;
    let tx = finalize(pset)?;
    broadcast(source, &tx).await
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use elements::confidential::{Asset, Nonce, Value};
    use elements::TxOutWitness;

    use super::*;
    use crate::keys::Chain;

    const GENERATOR: &str = "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";

    fn key() -> PublicKey {
        PublicKey::from_str(GENERATOR).unwrap()
    }

    fn explicit_input(value: u64, asset: AssetId) -> SpendInput {
        let script = Address::p2wpkh(&key(), None, Network::Regtest.address_params()).script_pubkey();
        SpendInput {
            outpoint: OutPoint::new(Txid::from_str(&hex::encode([1u8; 32])).unwrap(), 0),
            prevout: TxOut {
                asset: Asset::Explicit(asset),
                value: Value::Explicit(value),
                nonce: Nonce::Null,
                script_pubkey: script,
                witness: TxOutWitness::default(),
            },
            secrets: BlindingResult::transparent(value, asset),
            details: ScriptDetails {
                account_name: "main".into(),
                derivation_path: "m/84'/1'/0'/0/0".into(),
                chain: Chain::External,
                index: 0,
                networks: vec![Network::Regtest],
                blinding_private_key: hex::encode([2u8; 32]),
                template: None,
            },
            public_key: key(),
            key_origin: (Fingerprint::from([0u8; 4]), DerivationPath::master()),
        }
    }

    fn explicit_recipient(asset: AssetId, value: u64) -> Recipient {
        Recipient {
            address: Address::p2wpkh(&key(), None, Network::Regtest.address_params()),
            asset,
            value,
        }
    }

    #[test]
    fn build_appends_an_explicit_fee_output() {
        let asset = Network::Regtest.policy_asset().unwrap();
        let inputs = vec![explicit_input(10_000, asset)];
        let pset = build_transaction(
            Network::Regtest,
            &[explicit_recipient(asset, 9_000)],
            &inputs,
            &[],
            1_000,
        )
        .unwrap();
        assert_eq!(pset.inputs().len(), 1);
        assert_eq!(pset.outputs().len(), 2);
        let fee = &pset.outputs()[1];
        assert!(fee.script_pubkey.is_empty());
        assert_eq!(fee.amount, Some(1_000));
        assert_eq!(fee.asset, Some(asset));
        assert!(pset.inputs()[0].witness_utxo.is_some());
        assert_eq!(pset.inputs()[0].bip32_derivation.len(), 1);
    }

    #[test]
    fn unbalanced_build_is_rejected() {
        let asset = Network::Regtest.policy_asset().unwrap();
        let inputs = vec![explicit_input(10_000, asset)];
        assert!(matches!(
            build_transaction(
                Network::Regtest,
                &[explicit_recipient(asset, 9_500)],
                &inputs,
                &[],
                1_000,
            ),
            Err(WalletError::InvalidArgument(_))
        ));
    }

    #[test]
    fn explicit_only_transactions_skip_blinding() {
        let asset = Network::Regtest.policy_asset().unwrap();
        let inputs = vec![explicit_input(5_000, asset)];
        let mut pset = build_transaction(
            Network::Regtest,
            &[explicit_recipient(asset, 4_000)],
            &inputs,
            &[],
            1_000,
        )
        .unwrap();
        blind(&mut pset, &inputs).unwrap();
        assert!(pset.outputs()[0].value_rangeproof.is_none());
    }

    #[test]
    fn unsigned_pset_exhausts_signers() {
        let asset = Network::Regtest.policy_asset().unwrap();
        let inputs = vec![explicit_input(5_000, asset)];
        let mut pset = build_transaction(
            Network::Regtest,
            &[explicit_recipient(asset, 4_000)],
            &inputs,
            &[],
            1_000,
        )
        .unwrap();
        assert!(matches!(
            sign(&mut pset, &[]),
            Err(WalletError::SignersExhausted { unsigned: 1 })
        ));
        assert!(matches!(finalize(pset), Err(WalletError::Finalize(_))));
    }

    #[test]
    fn timelocked_script_needs_a_relative_sequence() {
        use elements::opcodes::all::{OP_CHECKSIG, OP_DROP};
        use elements::script::Builder;

        let asset = Network::Regtest.policy_asset().unwrap();
        let inputs = vec![explicit_input(5_000, asset)];
        let mut pset = build_transaction(
            Network::Regtest,
            &[explicit_recipient(asset, 4_000)],
            &inputs,
            &[],
            1_000,
        )
        .unwrap();
        let script = Builder::new()
            .push_int(144)
            .push_opcode(OP_CSV)
            .push_opcode(OP_DROP)
            .push_slice(&key().to_bytes())
            .push_opcode(OP_CHECKSIG)
            .into_script();
        let input = &mut pset.inputs_mut()[0];
        input.witness_script = Some(script.clone());
        input.partial_sigs.insert(key(), vec![0x30, 0x01]);

        match finalize(pset.clone()) {
            Err(WalletError::Finalize(msg)) => assert!(msg.contains("relative timelock")),
            other => panic!("unexpected result {other:?}"),
        }

        pset.inputs_mut()[0].sequence = Some(Sequence(144));
        let finalized = finalize(pset).unwrap();
        assert_eq!(finalized.tx.input[0].sequence, Sequence(144));
        assert_eq!(
            finalized.tx.input[0].witness.script_witness,
            vec![vec![0x30, 0x01], script.to_bytes()]
        );
    }

    #[test]
    fn confidential_outputs_dominate_the_fee() {
        let asset = Network::Regtest.policy_asset().unwrap();
        let inputs = vec![explicit_input(5_000, asset)];
        let explicit = estimate_fee(1.0, &inputs, 0, 2).unwrap();
        let confidential = estimate_fee(1.0, &inputs, 2, 0).unwrap();
        assert!(confidential > explicit + 2_000);
        assert_eq!(estimate_fee(0.1, &inputs, 0, 1).unwrap(), fee_for_vsize(206, 0.1));
    }

    #[test]
    fn fee_rounds_up() {
        assert_eq!(fee_for_vsize(1001, 0.1), 101);
        assert_eq!(fee_for_vsize(1000, 0.1), 100);
    }
}
