pub mod address;
pub mod assets;
pub mod chain_source;
pub mod coin_select;
pub mod config;
pub mod error;
pub mod keys;
pub mod network;
pub mod restoration;
pub mod signer;
pub mod store;
pub mod sync;
pub mod template;
pub mod tx_builder;
pub mod unblind;
pub mod updater;

pub use address::{derive_address, next_address, WalletAddress};
pub use assets::{AssetDetails, AssetRegistry};
pub use chain_source::{ChainSource, ChainSources, ElectrumChainSource};
pub use coin_select::{select_coins, CoinSelection, Target};
pub use config::{ChainSourceConfig, WalletConfig};
pub use error::WalletError;
pub use keys::{AccountDetails, AccountKind, BlindingSeed, Chain, KeyIndices, ScriptDetails};
pub use network::Network;
pub use restoration::{RestorationFile, RestorationRecord};
pub use signer::{Signer, SoftwareSigner};
pub use store::{MemoryStore, StoreEvent, WalletRepository};
pub use sync::{SyncOutcome, Synchronizer};
pub use template::ScriptTemplate;
pub use tx_builder::{FinalizedTransaction, PreparedSend, Recipient};
pub use unblind::{BlindingResult, UnblindedOutput};
pub use updater::Updater;
