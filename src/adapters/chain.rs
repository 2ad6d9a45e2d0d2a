use alloy::primitives::{Address, U256};
use alloy::providers::Provider;
use alloy::sol;
use eyre::{eyre, Result, WrapErr};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::domain::ChainId;
use crate::feeds::MarketUpdate;

sol! {
    #[sol(rpc)]
    interface IUniswapV3Pool {
        function slot0() external view returns (uint160 sqrtPriceX96, int24 tick, uint16 observationIndex, uint16 observationCardinality, uint16 observationCardinalityNext, uint8 feeProtocol, bool unlocked);
    }
}

/// A concentrated-liquidity pool quoted for one token on one venue.
///
/// Parsed from `dex:TOKEN:0xpool:decimals0:decimals1:side`, where `side` is `0`
/// when TOKEN is the pool's token0 and `1` when it is token1. The quote is the
/// price of TOKEN in the pool's other asset.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolSpec {
    pub dex: String,
    pub token: String,
    pub address: Address,
    pub token0_decimals: u8,
    pub token1_decimals: u8,
    pub token_is_token0: bool,
}

impl FromStr for PoolSpec {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').map(str::trim).collect();
        let [dex, token, address, d0, d1, side] = parts.as_slice() else {
            return Err(eyre!("pool spec {:?} needs 6 ':'-separated fields", s));
        };
        Ok(Self {
            dex: dex.to_ascii_lowercase(),
            token: token.to_ascii_uppercase(),
            address: address.parse().wrap_err_with(|| format!("pool address in {:?}", s))?,
            token0_decimals: d0.parse().wrap_err_with(|| format!("decimals0 in {:?}", s))?,
            token1_decimals: d1.parse().wrap_err_with(|| format!("decimals1 in {:?}", s))?,
            token_is_token0: match *side {
                "0" => true,
                "1" => false,
                other => return Err(eyre!("pool side must be 0 or 1, got {:?}", other)),
            },
        })
    }
}

impl PoolSpec {
    /// Price of `token` from a Q64.96 square-root price.
    pub fn quote(&self, sqrt_price_x96: U256) -> Option<f64> {
        let sqrt = sqrt_price_x96.to_string().parse::<f64>().ok()? / 2f64.powi(96);
        // token1 per token0 in whole units
        let price =
            sqrt * sqrt * 10f64.powi(self.token0_decimals as i32 - self.token1_decimals as i32);
        let quote = if self.token_is_token0 { price } else { 1.0 / price };
        (quote.is_finite() && quote > 0.0).then_some(quote)
    }
}

/// Polls pool prices and the chain gas price over JSON-RPC and publishes them as
/// one batch per round.
pub struct ChainPoller<P> {
    provider: P,
    chain: ChainId,
    pools: Vec<PoolSpec>,
    interval: Duration,
    tx: broadcast::Sender<Vec<MarketUpdate>>,
}

impl<P> ChainPoller<P>
where
    P: Provider + Clone + Send + Sync + 'static,
{
    pub fn new(
        provider: P,
        chain: ChainId,
        pools: Vec<PoolSpec>,
        interval: Duration,
        tx: broadcast::Sender<Vec<MarketUpdate>>,
    ) -> Self {
        Self {
            provider,
            chain,
            pools,
            interval,
            tx,
        }
    }

    pub async fn run(self) {
        info!(
            "Chain poller started: {} pools on {} every {:?}",
            self.pools.len(),
            self.chain,
            self.interval
        );
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            ticker.tick().await;
            let batch = self.poll().await;
            if !batch.is_empty() {
                let _ = self.tx.send(batch);
            }
        }
    }

    async fn poll(&self) -> Vec<MarketUpdate> {
        let mut batch = Vec::with_capacity(self.pools.len() + 1);

        match self.provider.get_gas_price().await {
            Ok(wei) => batch.push(MarketUpdate::GasPrice {
                chain: self.chain,
                gwei: wei as f64 / 1e9,
            }),
            Err(e) => warn!("Gas price fetch failed on {}: {:?}", self.chain, e),
        }

        for pool in &self.pools {
            match self.fetch_quote(pool).await {
                Ok(price) => batch.push(MarketUpdate::DexQuote {
                    token: pool.token.clone(),
                    dex: pool.dex.clone(),
                    price,
                }),
                Err(e) => warn!("Quote for {}@{} failed: {:?}", pool.token, pool.dex, e),
            }
        }

        debug!("Chain poll produced {} updates", batch.len());
        batch
    }

    async fn fetch_quote(&self, pool: &PoolSpec) -> Result<f64> {
        let contract = IUniswapV3Pool::new(pool.address, self.provider.clone());
        let slot0 = contract.slot0().call().await?;
        pool.quote(U256::from(slot0.sqrtPriceX96))
            .ok_or_else(|| eyre!("pool {} returned an unusable price", pool.address))
    }
}
