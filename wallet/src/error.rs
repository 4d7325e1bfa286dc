use thiserror::Error;

use crate::network::Network;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("missing key material: {0}")]
    MissingKeyMaterial(String),

    #[error("unsupported account kind for {0}")]
    UnsupportedAccountKind(String),

    #[error("template {template} is missing constructor argument {argument}")]
    MissingArgument { template: String, argument: String },

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("script template error: {0}")]
    Template(String),

    #[error("invalid address encoding: {0}")]
    AddressEncoding(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("chain source is closed")]
    ChainSourceClosed,

    #[error("no chain source configured for network {0}")]
    NoChainSource(Network),

    #[error("unknown account {0}")]
    UnknownAccount(String),

    #[error("insufficient funds for asset {asset} (required {required}, available {available})")]
    InsufficientFunds {
        asset: String,
        required: u64,
        available: u64,
    },

    #[error("blinding error: {0}")]
    Blinding(String),

    #[error("output {0} is not fully blinded")]
    IncompleteBlinding(usize),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("all signers exhausted with {unsigned} input(s) still unsigned")]
    SignersExhausted { unsigned: usize },

    #[error("finalize error: {0}")]
    Finalize(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid wallet state: {0}")]
    InvalidState(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

impl From<serde_json::Error> for WalletError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<elements::encode::Error> for WalletError {
    fn from(err: elements::encode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<hex::FromHexError> for WalletError {
    fn from(err: hex::FromHexError) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<elements::bitcoin::bip32::Error> for WalletError {
    fn from(err: elements::bitcoin::bip32::Error) -> Self {
        Self::KeyDerivation(err.to_string())
    }
}

impl From<std::io::Error> for WalletError {
    fn from(err: std::io::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
