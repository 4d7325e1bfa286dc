//! Signers for partially signed transactions.

use elements::bitcoin::bip32::{Fingerprint, Xpriv};
use elements::bitcoin::secp256k1::{ecdsa, All, Message, Secp256k1, Verification};
use elements::bitcoin::PublicKey;
use elements::hashes::Hash;
use elements::pset::{Input, PartiallySignedTransaction};
use elements::sighash::SighashCache;
use elements::{Address, AddressParams, EcdsaSighashType, Script, Transaction};

use crate::error::WalletError;

pub trait Signer: Send + Sync {
    /// Add signatures for the inputs this signer holds keys for. Returns how
    /// many signatures were added.
    fn sign(&self, pset: &mut PartiallySignedTransaction) -> Result<usize, WalletError>;
}

/// Signs with an account-level extended private key. Inputs are matched by
/// the fingerprint recorded in their key origin.
pub struct SoftwareSigner {
    account_key: Xpriv,
    fingerprint: Fingerprint,
    secp: Secp256k1<All>,
}

impl SoftwareSigner {
    /// `fingerprint` identifies `account_key` in input key origins; use the
    /// fingerprint of the matching account xpub.
    pub fn new(account_key: Xpriv, fingerprint: Fingerprint) -> Self {
        Self {
            account_key,
            fingerprint,
            secp: Secp256k1::new(),
        }
    }

    /// Signer whose origin fingerprint is derived from the key itself.
    pub fn from_account_key(account_key: Xpriv) -> Self {
        let secp = Secp256k1::new();
        let fingerprint = account_key.fingerprint(&secp);
        Self {
            account_key,
            fingerprint,
            secp,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }
}

/// Script code for a segwit v0 input: the witness script for P2WSH, the
/// P2PKH form of the key for P2WPKH.
pub(crate) fn script_code(witness_script: Option<&Script>, key: &PublicKey) -> Script {
    match witness_script {
        Some(script) => script.clone(),
        None => Address::p2pkh(key, None, &AddressParams::ELEMENTS).script_pubkey(),
    }
}

/// Whether `signature` (DER plus sighash flag) is a `SIGHASH_ALL` signature by
/// `key` over input `index` of `tx`.
pub(crate) fn signature_is_valid<C: Verification>(
    secp: &Secp256k1<C>,
    tx: &Transaction,
    index: usize,
    input: &Input,
    key: &PublicKey,
    signature: &[u8],
) -> bool {
    let Some(prevout) = input.witness_utxo.as_ref() else {
        return false;
    };
    let Some((flag, der)) = signature.split_last() else {
        return false;
    };
    if *flag != EcdsaSighashType::All as u8 {
        return false;
    }
    let Ok(signature) = ecdsa::Signature::from_der(der) else {
        return false;
    };
    let code = script_code(input.witness_script.as_ref(), key);
    let sighash =
        SighashCache::new(tx).segwitv0_sighash(index, &code, prevout.value, EcdsaSighashType::All);
    let message = Message::from_digest(sighash.to_byte_array());
    secp.verify_ecdsa(&message, &signature, &key.inner).is_ok()
}

impl Signer for SoftwareSigner {
    fn sign(&self, pset: &mut PartiallySignedTransaction) -> Result<usize, WalletError> {
        let tx = pset
            .extract_tx()
            .map_err(|e| WalletError::Signing(format!("cannot extract transaction: {e}")))?;
        let mut cache = SighashCache::new(&tx);
        let mut added = 0;

        for (index, input) in pset.inputs_mut().iter_mut().enumerate() {
            let Some(prevout) = input.witness_utxo.clone() else {
                continue;
            };
            let origins: Vec<_> = input
                .bip32_derivation
                .iter()
                .filter(|(key, (fingerprint, _))| {
                    *fingerprint == self.fingerprint && !input.partial_sigs.contains_key(*key)
                })
                .map(|(key, (_, path))| (*key, path.clone()))
                .collect();

            for (key, path) in origins {
                let child = self.account_key.derive_priv(&self.secp, &path)?;
                let derived = PublicKey::new(child.private_key.public_key(&self.secp));
                if derived != key {
                    continue;
                }
                let code = script_code(input.witness_script.as_ref(), &key);
                let sighash = cache.segwitv0_sighash(
                    index,
                    &code,
                    prevout.value,
                    EcdsaSighashType::All,
                );
                let message = Message::from_digest(sighash.to_byte_array());
                let signature = self.secp.sign_ecdsa(&message, &child.private_key);
                let mut encoded = signature.serialize_der().to_vec();
                encoded.push(EcdsaSighashType::All as u8);
                input.partial_sigs.insert(key, encoded);
                added += 1;
            }
        }
        Ok(added)
    }
}
