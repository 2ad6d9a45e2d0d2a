use eyre::{Result, WrapErr};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::config::FeedConfig;
use crate::domain::PriceData;
use crate::feeds::MarketUpdate;

const STREAM_URL: &str = "wss://stream.binance.com:9443/stream";

/// Quote assets stripped from pair symbols to get the snapshot token key.
const QUOTE_ASSETS: [&str; 4] = ["USDT", "USDC", "FDUSD", "BUSD"];

#[derive(Debug, Deserialize)]
struct BinanceTicker {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "c")]
    last_price: String,
    #[serde(rename = "P")]
    price_change_percent: Option<String>,
    /// 24h volume in the quote asset (USD for stablecoin pairs).
    #[serde(rename = "q")]
    quote_volume: Option<String>,
}

/// Reconnect delay, doubling from `reconnect_min_ms` up to `reconnect_max_ms`.
#[derive(Debug, Clone)]
struct Backoff {
    min: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    fn new(config: &FeedConfig) -> Self {
        let min = Duration::from_millis(config.reconnect_min_ms);
        Self {
            min,
            max: Duration::from_millis(config.reconnect_max_ms).max(min),
            next: min,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.next = self.min;
    }
}

/// Latest ticker per token since the last flush.
#[derive(Debug, Default)]
struct PendingBatch {
    by_token: BTreeMap<String, Vec<MarketUpdate>>,
}

impl PendingBatch {
    fn insert(&mut self, token: String, updates: Vec<MarketUpdate>) {
        self.by_token.insert(token, updates);
    }

    fn take(&mut self) -> Option<Vec<MarketUpdate>> {
        if self.by_token.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.by_token).into_values().flatten().collect())
    }
}

/// Streams 24h tickers for the configured pairs. Frames are coalesced per token and
/// published as one batch per window, so the snapshot store sees one version per
/// window instead of one per frame.
pub struct BinanceWsFeed {
    tx: broadcast::Sender<Vec<MarketUpdate>>,
    config: FeedConfig,
}

impl BinanceWsFeed {
    pub fn new(tx: broadcast::Sender<Vec<MarketUpdate>>, config: FeedConfig) -> Self {
        Self { tx, config }
    }

    fn url(&self) -> String {
        let streams: Vec<String> = self
            .config
            .symbols
            .iter()
            .map(|s| format!("{}@ticker", s.to_lowercase()))
            .collect();
        format!("{}?streams={}", STREAM_URL, streams.join("/"))
    }

    /// Reconnects forever. The delay resets once a session delivers a ticker.
    pub async fn run(self) {
        let mut backoff = Backoff::new(&self.config);
        loop {
            if let Err(e) = self.stream_session(&mut backoff).await {
                error!("Binance stream failed: {:?}", e);
            }
            let delay = backoff.next_delay();
            warn!("Reconnecting to Binance in {:?}", delay);
            tokio::time::sleep(delay).await;
        }
    }

    async fn stream_session(&self, backoff: &mut Backoff) -> Result<()> {
        let (ws, _) = connect_async(self.url())
            .await
            .wrap_err("connecting to Binance")?;
        let (mut write, mut read) = ws.split();
        info!(symbols = ?self.config.symbols, "Binance stream connected");

        let mut pending = PendingBatch::default();
        let mut flush = tokio::time::interval(self.config.batch_window());
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = read.next() => {
                    let msg = match frame {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => {
                            self.publish(&mut pending);
                            return Err(e).wrap_err("reading Binance stream");
                        }
                        None => break,
                    };
                    match msg {
                        Message::Text(text) => match parse_ticker(&text) {
                            Some((token, updates)) => {
                                pending.insert(token, updates);
                                backoff.reset();
                            }
                            None => debug!("Ignoring unparseable Binance frame"),
                        },
                        Message::Ping(data) => write
                            .send(Message::Pong(data))
                            .await
                            .wrap_err("answering Binance ping")?,
                        Message::Close(frame) => {
                            info!(?frame, "Binance stream closed by server");
                            break;
                        }
                        _ => {}
                    }
                }
                _ = flush.tick() => {
                    self.publish(&mut pending);
                }
            }
        }

        self.publish(&mut pending);
        Ok(())
    }

    /// Sends whatever is pending as one batch. Returns the number of updates sent.
    fn publish(&self, pending: &mut PendingBatch) -> usize {
        let Some(batch) = pending.take() else {
            return 0;
        };
        let len = batch.len();
        if self.tx.send(batch).is_err() {
            debug!("No market feed subscribed; dropped {} updates", len);
            return 0;
        }
        len
    }
}

/// Token key for a pair symbol: `ETHUSDT` becomes `ETH`.
fn base_asset(symbol: &str) -> &str {
    QUOTE_ASSETS
        .iter()
        .find_map(|q| symbol.strip_suffix(q).filter(|base| !base.is_empty()))
        .unwrap_or(symbol)
}

/// Parses a ticker frame, plain or wrapped in a combined-stream envelope, into its
/// token key and updates.
fn parse_ticker(text: &str) -> Option<(String, Vec<MarketUpdate>)> {
    #[derive(Deserialize)]
    struct Combined {
        data: BinanceTicker,
    }

    let ticker = if let Ok(combined) = serde_json::from_str::<Combined>(text) {
        combined.data
    } else {
        serde_json::from_str::<BinanceTicker>(text).ok()?
    };

    let price = ticker.last_price.parse::<f64>().ok()?;
    let token = base_asset(&ticker.symbol.to_ascii_uppercase()).to_string();
    let volume = ticker.quote_volume.and_then(|v| v.parse::<f64>().ok());

    let mut data = PriceData::new(&token, price, "binance");
    data.price_change_24h = ticker.price_change_percent.and_then(|p| p.parse().ok());
    data.volume_24h = volume;

    let mut batch = vec![MarketUpdate::Price(data)];
    if let Some(volume_24h) = volume {
        batch.push(MarketUpdate::Volume {
            token: token.clone(),
            volume_24h,
        });
    }
    Some((token, batch))
}
