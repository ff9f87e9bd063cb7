use alloy::network::EthereumWallet;
use alloy::providers::{
    fillers::{
        BlobGasFiller, ChainIdFiller, FillProvider, GasFiller, JoinFill, NonceFiller, WalletFiller,
    },
    Identity, RootProvider,
};

use relay::asset::Asset;
use relay::backend::{PayoutBackend, TransferReceipt, TransferStatus};
use relay::chain::ChainBackend;
use relay::error::BackendError;
use relay::exchange::ExchangeBackend;
use relay::pipeline::PayoutPipeline;

use crate::checkout::CheckoutClient;

/// Concrete provider type from `ProviderBuilder::new().wallet(...).connect_http(...)`.
pub type WalletProvider = FillProvider<
    JoinFill<
        JoinFill<
            Identity,
            JoinFill<GasFiller, JoinFill<BlobGasFiller, JoinFill<NonceFiller, ChainIdFiller>>>,
        >,
        WalletFiller<EthereumWallet>,
    >,
    RootProvider,
>;

/// Configuration-selected payout backend. The two paths are not dead
/// code beside each other: exactly one is constructed at startup and
/// both speak the same trait.
pub enum RelayBackend {
    Chain(ChainBackend<WalletProvider>),
    Exchange(ExchangeBackend),
}

impl RelayBackend {
    pub fn kind(&self) -> &'static str {
        match self {
            RelayBackend::Chain(_) => "chain",
            RelayBackend::Exchange(_) => "exchange",
        }
    }

    /// Liveness probe. The chain backend reports the latest block;
    /// the exchange backend has no cheap unauthenticated probe.
    pub async fn health_check(&self) -> Result<Option<u64>, BackendError> {
        match self {
            RelayBackend::Chain(chain) => chain.health_check().await.map(Some),
            RelayBackend::Exchange(_) => Ok(None),
        }
    }
}

impl PayoutBackend for RelayBackend {
    async fn transfer(
        &self,
        destination: &str,
        base_units: u128,
        asset: Asset,
    ) -> Result<TransferReceipt, BackendError> {
        match self {
            RelayBackend::Chain(chain) => chain.transfer(destination, base_units, asset).await,
            RelayBackend::Exchange(exchange) => {
                exchange.transfer(destination, base_units, asset).await
            }
        }
    }

    async fn status(&self, tx_reference: &str) -> Result<TransferStatus, BackendError> {
        match self {
            RelayBackend::Chain(chain) => chain.status(tx_reference).await,
            RelayBackend::Exchange(exchange) => exchange.status(tx_reference).await,
        }
    }
}

/// Shared application state.
pub struct AppState {
    pub pipeline: PayoutPipeline<RelayBackend>,
    pub backend_kind: &'static str,
    /// Checkout-session creation client; absent when the provider
    /// secret key is not configured (webhook-only deployments).
    pub checkout: Option<CheckoutClient>,
    /// Bearer token for the /metrics endpoint.
    pub metrics_token: Option<Vec<u8>>,
}
