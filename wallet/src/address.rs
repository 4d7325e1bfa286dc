use elements::secp256k1_zkp::{PublicKey, Secp256k1, SecretKey};
use elements::{Address, Script};
use serde::{Deserialize, Serialize};

use crate::error::WalletError;
use crate::keys::{Chain, ScriptDetails};
use crate::network::Network;
use crate::store::WalletRepository;

/// Display form of a script entry. Derived on demand, never persisted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletAddress {
    pub confidential_address: String,
    pub unconfidential_address: String,
    pub blinding_public_key: String,
    pub script: String,
    pub derivation_path: String,
    pub account_name: String,
}

/// Confidential address paying to `script`, blinded to the public half of `blinding_key`.
pub fn confidential_address(
    network: Network,
    script: &Script,
    blinding_key: &SecretKey,
) -> Result<Address, WalletError> {
    let secp = Secp256k1::signing_only();
    let blinder = PublicKey::from_secret_key(&secp, blinding_key);
    Address::from_script(script, Some(blinder), network.address_params()).ok_or_else(|| {
        WalletError::AddressEncoding(format!(
            "script {} has no address form",
            hex::encode(script.as_bytes())
        ))
    })
}

pub fn derive_address(
    network: Network,
    script: &Script,
    details: &ScriptDetails,
) -> Result<WalletAddress, WalletError> {
    let blinding_key = details.blinding_secret_key()?;
    let address = confidential_address(network, script, &blinding_key)?;
    let blinder = address
        .blinding_pubkey
        .ok_or_else(|| WalletError::AddressEncoding("address lost its blinding key".into()))?;
    Ok(WalletAddress {
        confidential_address: address.to_string(),
        unconfidential_address: address.to_unconfidential().to_string(),
        blinding_public_key: hex::encode(blinder.serialize()),
        script: hex::encode(script.as_bytes()),
        derivation_path: details.derivation_path.clone(),
        account_name: details.account_name.clone(),
    })
}

/// Parse `address` and check that it belongs to `network`.
pub fn parse_address(network: Network, address: &str) -> Result<Address, WalletError> {
    Address::parse_with_params(address, network.address_params())
        .map_err(|e| WalletError::AddressEncoding(format!("{address}: {e}")))
}

/// Address at the account's current counter on `chain`. The script entry is
/// persisted; the counter only moves once the script shows history.
pub fn next_address(
    store: &dyn WalletRepository,
    network: Network,
    account_name: &str,
    chain: Chain,
) -> Result<WalletAddress, WalletError> {
    let account = store.get_account_details(account_name)?;
    let index = account.key_indices(network).get(chain);
    let (script, details) = account.derive_script(network, chain, index)?;
    let address = derive_address(network, &script, &details)?;
    store.update_script_details(network, vec![(script, details)])?;
    Ok(address)
}
