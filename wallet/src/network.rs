use std::fmt;
use std::str::FromStr;

use elements::{AddressParams, AssetId};
use serde::{Deserialize, Serialize};

use crate::error::WalletError;

const LIQUID_POLICY_ASSET: &str =
    "6f0279e9ed041c3d710a9f57d0c02928416460c4b722ae3457a11eec381c526d";
const TESTNET_POLICY_ASSET: &str =
    "144c654344aa716d6f3abcc1ca90e5641e4e2a7f633bc09fe3baf64585819a49";
const REGTEST_POLICY_ASSET: &str =
    "5ac9f65c0efcc4775e0baec4ec03abdde22473cd3cf33c0419ca290e0751b225";

/// The networks a wallet can be bound to. Storage keys are namespaced by
/// [`Network::as_str`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Liquid,
    Testnet,
    Regtest,
}

impl Network {
    pub const ALL: [Network; 3] = [Network::Liquid, Network::Testnet, Network::Regtest];

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Liquid => "liquid",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }

    pub fn address_params(&self) -> &'static AddressParams {
        match self {
            Network::Liquid => &AddressParams::LIQUID,
            Network::Testnet => &AddressParams::LIQUID_TESTNET,
            Network::Regtest => &AddressParams::ELEMENTS,
        }
    }

    /// Asset used to pay network fees.
    pub fn policy_asset(&self) -> Result<AssetId, WalletError> {
        let hex = match self {
            Network::Liquid => LIQUID_POLICY_ASSET,
            Network::Testnet => TESTNET_POLICY_ASSET,
            Network::Regtest => REGTEST_POLICY_ASSET,
        };
        AssetId::from_str(hex).map_err(|err| WalletError::Serialization(err.to_string()))
    }

    pub fn coin_type(&self) -> u32 {
        match self {
            Network::Liquid => 1776,
            Network::Testnet | Network::Regtest => 1,
        }
    }

    pub fn is_mainnet(&self) -> bool {
        matches!(self, Network::Liquid)
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = WalletError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "liquid" => Ok(Network::Liquid),
            "testnet" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            other => Err(WalletError::Config(format!("unknown network {other}"))),
        }
    }
}
