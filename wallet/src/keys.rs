use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use elements::bitcoin::bip32::{ChildNumber, DerivationPath, Xpub};
use elements::bitcoin::secp256k1::Secp256k1;
use elements::bitcoin::PublicKey;
use elements::secp256k1_zkp::SecretKey;
use elements::slip77::MasterBlindingKey;
use elements::{Address, Script};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::WalletError;
use crate::network::Network;
use crate::template::{ArgValue, Arguments, ScriptTemplate};

/// External chain `0` hands out receive addresses, internal chain `1` change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    External,
    Internal,
}

impl Chain {
    pub const BOTH: [Chain; 2] = [Chain::External, Chain::Internal];

    pub fn index(&self) -> u32 {
        match self {
            Chain::External => 0,
            Chain::Internal => 1,
        }
    }

    pub fn from_index(index: u32) -> Result<Self, WalletError> {
        match index {
            0 => Ok(Chain::External),
            1 => Ok(Chain::Internal),
            _ => Err(WalletError::KeyDerivation(format!(
                "chain component {index} is neither external nor internal"
            ))),
        }
    }
}

/// Next unused index per chain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyIndices {
    pub external: u32,
    pub internal: u32,
}

impl KeyIndices {
    pub fn get(&self, chain: Chain) -> u32 {
        match chain {
            Chain::External => self.external,
            Chain::Internal => self.internal,
        }
    }

    pub fn set(&mut self, chain: Chain, value: u32) {
        match chain {
            Chain::External => self.external = value,
            Chain::Internal => self.internal = value,
        }
    }

    /// Increase-only merge: counters never move backwards.
    pub fn merge_max(&self, other: &KeyIndices) -> KeyIndices {
        KeyIndices {
            external: self.external.max(other.external),
            internal: self.internal.max(other.internal),
        }
    }
}

/// Seed of the SLIP-77 master blinding key.
/// Zeroized on drop to prevent key material from persisting in memory.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct BlindingSeed(Vec<u8>);

impl BlindingSeed {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn from_hex(hex: &str) -> Result<Self, WalletError> {
        let bytes = hex::decode(hex)?;
        if bytes.is_empty() {
            return Err(WalletError::MissingKeyMaterial("empty blinding seed".into()));
        }
        Ok(Self(bytes))
    }

    pub fn master_blinding_key(&self) -> MasterBlindingKey {
        MasterBlindingKey::from_seed(&self.0)
    }
}

impl fmt::Debug for BlindingSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BlindingSeed(..)")
    }
}

/// Template plus the constructor arguments that are fixed for the whole
/// account. The derived key is added per index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateBinding {
    pub template: ScriptTemplate,
    pub arguments: Arguments,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AccountKind {
    /// Single-signature P2WPKH.
    Fixed,
    /// Derived key is injected as `key_argument` into a script template and
    /// the script is paid to as P2WSH.
    Programmable {
        key_argument: String,
        default_binding: Option<TemplateBinding>,
    },
}

impl AccountKind {
    pub fn is_programmable(&self) -> bool {
        matches!(self, AccountKind::Programmable { .. })
    }
}

#[derive(Clone, Debug)]
pub struct AccountDetails {
    pub name: String,
    pub kind: AccountKind,
    /// Account-level extended public key; scripts derive at `chain/index` below it.
    pub master_public_key: Xpub,
    pub master_blinding_seed: BlindingSeed,
    pub base_derivation_path: String,
    /// Networks sharing this account's scripts. Only legacy fixed accounts
    /// list more than one.
    pub networks: Vec<Network>,
    pub next_key_index: BTreeMap<Network, KeyIndices>,
}

impl AccountDetails {
    pub fn fixed(
        name: impl Into<String>,
        master_public_key: Xpub,
        master_blinding_seed: BlindingSeed,
        networks: Vec<Network>,
    ) -> Self {
        let coin = networks.first().map(Network::coin_type).unwrap_or(1);
        Self {
            name: name.into(),
            kind: AccountKind::Fixed,
            master_public_key,
            master_blinding_seed,
            base_derivation_path: format!("m/84'/{coin}'/0'"),
            networks,
            next_key_index: BTreeMap::new(),
        }
    }

    pub fn programmable(
        name: impl Into<String>,
        master_public_key: Xpub,
        master_blinding_seed: BlindingSeed,
        base_derivation_path: impl Into<String>,
        network: Network,
        key_argument: impl Into<String>,
        default_binding: Option<TemplateBinding>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: AccountKind::Programmable {
                key_argument: key_argument.into(),
                default_binding,
            },
            master_public_key,
            master_blinding_seed,
            base_derivation_path: base_derivation_path.into(),
            networks: vec![network],
            next_key_index: BTreeMap::new(),
        }
    }

    pub fn key_indices(&self, network: Network) -> KeyIndices {
        self.next_key_index
            .get(&network)
            .copied()
            .unwrap_or_default()
    }

    pub fn derivation_path(&self, chain: Chain, index: u32) -> String {
        format!("{}/{}/{}", self.base_derivation_path, chain.index(), index)
    }

    pub fn master_blinding_key(&self) -> MasterBlindingKey {
        self.master_blinding_seed.master_blinding_key()
    }

    pub fn derive_public_key(&self, chain: Chain, index: u32) -> Result<PublicKey, WalletError> {
        let secp = Secp256k1::verification_only();
        let path = [
            ChildNumber::from_normal_idx(chain.index())?,
            ChildNumber::from_normal_idx(index)?,
        ];
        let child = self.master_public_key.derive_pub(&secp, &path)?;
        Ok(PublicKey::new(child.public_key))
    }

    /// Derive the script at `chain/index` using the account's default
    /// template for programmable accounts.
    pub fn derive_script(
        &self,
        network: Network,
        chain: Chain,
        index: u32,
    ) -> Result<(Script, ScriptDetails), WalletError> {
        let binding = match &self.kind {
            AccountKind::Fixed => None,
            AccountKind::Programmable {
                default_binding, ..
            } => Some(default_binding.as_ref().ok_or_else(|| {
                WalletError::MissingKeyMaterial(format!(
                    "account {} has no default script template",
                    self.name
                ))
            })?),
        };
        self.derive_script_with(network, chain, index, binding)
    }

    /// Derive the script at `chain/index`. `binding` is required for
    /// programmable accounts and rejected for fixed ones.
    pub fn derive_script_with(
        &self,
        network: Network,
        chain: Chain,
        index: u32,
        binding: Option<&TemplateBinding>,
    ) -> Result<(Script, ScriptDetails), WalletError> {
        if !self.networks.contains(&network) {
            return Err(WalletError::UnsupportedAccountKind(format!(
                "{} on network {network}",
                self.name
            )));
        }
        let public_key = self.derive_public_key(chain, index)?;
        let (script, networks, template) = match (&self.kind, binding) {
            (AccountKind::Fixed, None) => {
                let script = Address::p2wpkh(&public_key, None, network.address_params())
                    .script_pubkey();
                (script, self.networks.clone(), None)
            }
            (AccountKind::Programmable { key_argument, .. }, Some(binding)) => {
                if binding.template.parameter(key_argument).is_none() {
                    return Err(WalletError::Template(format!(
                        "{} does not declare key parameter {key_argument}",
                        binding.template.name
                    )));
                }
                let mut arguments = binding.arguments.clone();
                arguments.insert(
                    key_argument.clone(),
                    ArgValue::from_bytes(&public_key.to_bytes()),
                );
                let bound = BoundTemplate {
                    template: binding.template.clone(),
                    arguments,
                };
                let script = bound.script_pubkey(network)?;
                (script, vec![network], Some(bound))
            }
            (AccountKind::Fixed, Some(_)) | (AccountKind::Programmable { .. }, None) => {
                return Err(WalletError::UnsupportedAccountKind(self.name.clone()))
            }
        };

        let blinding_key = self.master_blinding_key().blinding_private_key(&script);
        let details = ScriptDetails {
            account_name: self.name.clone(),
            derivation_path: self.derivation_path(chain, index),
            chain,
            index,
            networks,
            blinding_private_key: hex::encode(blinding_key.secret_bytes()),
            template,
        };
        Ok((script, details))
    }
}

/// A template with every constructor argument bound, the key included.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundTemplate {
    pub template: ScriptTemplate,
    pub arguments: Arguments,
}

impl BoundTemplate {
    pub fn witness_script(&self) -> Result<Script, WalletError> {
        self.template.compile(&self.arguments)
    }

    pub fn script_pubkey(&self, network: Network) -> Result<Script, WalletError> {
        let witness_script = self.witness_script()?;
        Ok(Address::p2wsh(&witness_script, None, network.address_params()).script_pubkey())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScriptDetails {
    pub account_name: String,
    pub derivation_path: String,
    pub chain: Chain,
    pub index: u32,
    pub networks: Vec<Network>,
    pub blinding_private_key: String,
    pub template: Option<BoundTemplate>,
}

impl ScriptDetails {
    pub fn blinding_secret_key(&self) -> Result<SecretKey, WalletError> {
        SecretKey::from_str(&self.blinding_private_key)
            .map_err(|err| WalletError::MissingKeyMaterial(format!("blinding key: {err}")))
    }
}

/// Split the trailing `chain/index` components off a full derivation path.
pub fn parse_chain_index(path: &str) -> Result<(Chain, u32), WalletError> {
    let parsed = DerivationPath::from_str(path)?;
    let components: &[ChildNumber] = parsed.as_ref();
    match components {
        [.., ChildNumber::Normal { index: chain }, ChildNumber::Normal { index }] => {
            Ok((Chain::from_index(*chain)?, *index))
        }
        _ => Err(WalletError::KeyDerivation(format!(
            "path {path} does not end in chain/index"
        ))),
    }
}
