use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{ChainId, PriceData};
use crate::error::{EngineError, EngineResult};

/// One immutable, versioned view of the market. Scans in a cycle all read the same
/// `Arc<MarketSnapshot>`; updates build a fresh one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    /// Random per-store tag. Versions restart at zero with every process, so ids
    /// derived from a snapshot carry both.
    pub session: String,
    pub version: u64,
    /// token -> latest reference price
    pub prices: HashMap<String, PriceData>,
    /// token -> dex -> price
    pub dex_quotes: HashMap<String, BTreeMap<String, f64>>,
    pub volumes: HashMap<String, f64>,
    pub liquidities: HashMap<String, f64>,
    pub gas_prices: HashMap<ChainId, f64>,
    pub last_update: DateTime<Utc>,
}

impl MarketSnapshot {
    pub fn empty() -> Self {
        let session = Uuid::new_v4().simple().to_string();
        Self {
            session: session[..12].to_string(),
            version: 0,
            prices: HashMap::new(),
            dex_quotes: HashMap::new(),
            volumes: HashMap::new(),
            liquidities: HashMap::new(),
            gas_prices: HashMap::new(),
            last_update: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    /// `session.version`, unique across restarts.
    pub fn tag(&self) -> String {
        format!("{}.{}", self.session, self.version)
    }

    pub fn price(&self, token: &str) -> Option<f64> {
        self.prices.get(token).map(|p| p.price)
    }

    pub fn quotes(&self, token: &str) -> Option<&BTreeMap<String, f64>> {
        self.dex_quotes.get(token)
    }

    pub fn liquidity(&self, token: &str) -> Option<f64> {
        self.liquidities.get(token).copied()
    }

    pub fn gas_price(&self, chain: ChainId) -> Option<f64> {
        self.gas_prices.get(&chain).copied()
    }

    fn apply(&mut self, update: &MarketUpdate) {
        match update {
            MarketUpdate::Price(data) => {
                if let Some(volume) = data.volume_24h {
                    self.volumes.insert(data.token.clone(), volume);
                }
                if let Some(liquidity) = data.liquidity {
                    self.liquidities.insert(data.token.clone(), liquidity);
                }
                self.prices.insert(data.token.clone(), data.clone());
            }
            MarketUpdate::DexQuote { token, dex, price } => {
                self.dex_quotes
                    .entry(token.clone())
                    .or_default()
                    .insert(dex.clone(), *price);
            }
            MarketUpdate::Volume { token, volume_24h } => {
                self.volumes.insert(token.clone(), *volume_24h);
            }
            MarketUpdate::Liquidity { token, liquidity } => {
                self.liquidities.insert(token.clone(), *liquidity);
            }
            MarketUpdate::GasPrice { chain, gwei } => {
                self.gas_prices.insert(*chain, *gwei);
            }
        }
    }
}

/// A partial market update coming from a feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MarketUpdate {
    Price(PriceData),
    DexQuote { token: String, dex: String, price: f64 },
    Volume { token: String, volume_24h: f64 },
    Liquidity { token: String, liquidity: f64 },
    GasPrice { chain: ChainId, gwei: f64 },
}

impl MarketUpdate {
    fn validate(&self) -> EngineResult<()> {
        let bad = |msg: String| Err(EngineError::MalformedMarketData(msg));
        match self {
            MarketUpdate::Price(data) => {
                if data.token.is_empty() || data.source.is_empty() {
                    return bad("price without token or source".into());
                }
                if !data.price.is_finite() || data.price <= 0.0 {
                    return bad(format!("{} price {}", data.token, data.price));
                }
                for v in [data.volume_24h, data.liquidity].into_iter().flatten() {
                    if !v.is_finite() || v < 0.0 {
                        return bad(format!("{} negative volume/liquidity {}", data.token, v));
                    }
                }
                Ok(())
            }
            MarketUpdate::DexQuote { token, dex, price } => {
                if token.is_empty() || dex.is_empty() {
                    return bad("quote without token or dex".into());
                }
                if !price.is_finite() || *price <= 0.0 {
                    return bad(format!("{}@{} quote {}", token, dex, price));
                }
                Ok(())
            }
            MarketUpdate::Volume { token, volume_24h: v }
            | MarketUpdate::Liquidity { token, liquidity: v } => {
                if token.is_empty() || !v.is_finite() || *v < 0.0 {
                    return bad(format!("{} value {}", token, v));
                }
                Ok(())
            }
            MarketUpdate::GasPrice { chain, gwei } => {
                if !gwei.is_finite() || *gwei < 0.0 {
                    return bad(format!("chain {} gas {}", chain, gwei));
                }
                Ok(())
            }
        }
    }
}

/// Single owner of the current snapshot.
#[derive(Clone)]
pub struct SnapshotStore {
    tx: Arc<watch::Sender<Arc<MarketSnapshot>>>,
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(MarketSnapshot::empty()));
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> Arc<MarketSnapshot> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<MarketSnapshot>> {
        self.tx.subscribe()
    }

    /// Apply a batch as one new version. A malformed entry rejects the whole batch
    /// and the previous snapshot stays current.
    pub fn update(&self, batch: &[MarketUpdate]) -> EngineResult<u64> {
        if let Err(e) = batch.iter().try_for_each(MarketUpdate::validate) {
            warn!("Rejected market update batch: {}", e);
            return Err(e);
        }

        let mut version = 0;
        self.tx.send_modify(|current| {
            let mut next = MarketSnapshot::clone(current);
            for update in batch {
                next.apply(update);
            }
            next.version = current.version + 1;
            // lastUpdate never goes backwards even if the wall clock does.
            next.last_update = Utc::now().max(current.last_update);
            version = next.version;
            *current = Arc::new(next);
        });
        debug!(version, entries = batch.len(), "Market snapshot updated");
        Ok(version)
    }
}

/// Drains feed batches into the snapshot store.
pub struct MarketFeed {
    rx: broadcast::Receiver<Vec<MarketUpdate>>,
    store: SnapshotStore,
}

impl MarketFeed {
    pub fn new(rx: broadcast::Receiver<Vec<MarketUpdate>>, store: SnapshotStore) -> Self {
        Self { rx, store }
    }

    pub async fn run(mut self) {
        info!("Market feed started");

        loop {
            match self.rx.recv().await {
                Ok(batch) => {
                    // Rejections are logged by the store; the previous view stays.
                    let _ = self.store.update(&batch);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Market feed lagged by {} batches", n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Market data channel closed, market feed shutting down");
                    break;
                }
            }
        }
    }
}
