//! Asset metadata (name, ticker, precision) for asset ids seen in unblinded outputs.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use elements::AssetId;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::WalletError;
use crate::network::Network;
use crate::store::WalletRepository;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetDetails {
    pub name: String,
    pub ticker: String,
    pub precision: u8,
}

impl AssetDetails {
    /// Metadata of the network's fee asset, known without a registry lookup.
    pub fn policy(network: Network) -> Self {
        let ticker = match network {
            Network::Liquid => "L-BTC",
            Network::Testnet => "tL-BTC",
            Network::Regtest => "rL-BTC",
        };
        Self {
            name: "Liquid Bitcoin".to_string(),
            ticker: ticker.to_string(),
            precision: 8,
        }
    }
}

/// Source of asset metadata, typically an HTTP asset registry owned by the host.
#[async_trait]
pub trait AssetRegistry: Send + Sync {
    async fn fetch_asset(
        &self,
        network: Network,
        asset: &AssetId,
    ) -> Result<Option<AssetDetails>, WalletError>;
}

/// Fetch metadata for assets the store does not know yet. Failures are
/// logged and skipped; the return value counts the assets stored.
pub async fn refresh_assets(
    registry: Option<&Arc<dyn AssetRegistry>>,
    store: &dyn WalletRepository,
    network: Network,
    assets: impl IntoIterator<Item = AssetId>,
) -> usize {
    let policy = network.policy_asset().ok();
    let mut refreshed = 0;
    let mut seen = HashSet::new();
    for asset in assets {
        if !seen.insert(asset) {
            continue;
        }
        match store.get_asset(network, &asset) {
            Ok(Some(_)) => continue,
            Ok(None) => {}
            Err(err) => {
                warn!(%asset, error = %err, "failed to read asset metadata");
                continue;
            }
        }

        let details = if Some(asset) == policy {
            Some(AssetDetails::policy(network))
        } else if let Some(registry) = registry {
            match registry.fetch_asset(network, &asset).await {
                Ok(details) => details,
                Err(err) => {
                    warn!(%asset, error = %err, "asset metadata lookup failed");
                    None
                }
            }
        } else {
            None
        };

        let Some(details) = details else {
            debug!(%asset, "no metadata for asset");
            continue;
        };
        match store.set_asset(network, asset, details) {
            Ok(()) => refreshed += 1,
            Err(err) => warn!(%asset, error = %err, "failed to store asset metadata"),
        }
    }
    refreshed
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::store::MemoryStore;

    struct FlakyRegistry {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AssetRegistry for FlakyRegistry {
        async fn fetch_asset(
            &self,
            _network: Network,
            asset: &AssetId,
        ) -> Result<Option<AssetDetails>, WalletError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if asset.to_string().starts_with("aa") {
                return Err(WalletError::Rpc("registry unavailable".into()));
            }
            Ok(Some(AssetDetails {
                name: "Tether USD".into(),
                ticker: "USDt".into(),
                precision: 8,
            }))
        }
    }

    fn asset(byte: u8) -> AssetId {
        AssetId::from_str(&hex::encode([byte; 32])).unwrap()
    }

    #[tokio::test]
    async fn refresh_is_best_effort() {
        let store = MemoryStore::new(Network::Regtest);
        let registry: Arc<dyn AssetRegistry> = Arc::new(FlakyRegistry {
            calls: AtomicUsize::new(0),
        });
        let policy = Network::Regtest.policy_asset().unwrap();
        let refreshed = refresh_assets(
            Some(&registry),
            &store,
            Network::Regtest,
            [asset(0xaa), asset(0x11), asset(0x11), policy],
        )
        .await;
        assert_eq!(refreshed, 2);
        assert!(store.get_asset(Network::Regtest, &asset(0xaa)).unwrap().is_none());
        assert_eq!(
            store.get_asset(Network::Regtest, &policy).unwrap().unwrap().ticker,
            "rL-BTC"
        );

        // known assets are not fetched again
        let again = refresh_assets(Some(&registry), &store, Network::Regtest, [asset(0x11)]).await;
        assert_eq!(again, 0);
    }
}
