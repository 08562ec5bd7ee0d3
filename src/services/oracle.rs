//! Spot Index Service
//!
//! Polls an external spot feed for index prices, keeps the funding engine's
//! reference-price window fed, and degrades to internal marks when the feed
//! is unreachable.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::models::units::{Price, PRICE_SCALE};
use crate::services::funding::FundingService;
use crate::state::VenueState;

#[derive(Debug, Clone)]
pub struct SpotFeedConfig {
    /// Endpoint template; `{symbol}` is substituted per request. `None`
    /// disables polling entirely.
    pub endpoint: Option<String>,
    pub sync_interval_ms: u64,
    pub request_timeout_ms: u64,
}

#[derive(Debug, serde::Deserialize)]
struct SpotQuote {
    price: String,
}

pub struct SpotIndexService {
    state: Arc<VenueState>,
    funding: Arc<FundingService>,
    client: reqwest::Client,
    config: SpotFeedConfig,
}

impl SpotIndexService {
    pub fn new(
        state: Arc<VenueState>,
        funding: Arc<FundingService>,
        config: SpotFeedConfig,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .unwrap_or_default();
        Self {
            state,
            funding,
            client,
            config,
        }
    }

    /// One sync pass over every symbol. Returns how many spot quotes landed.
    pub async fn sync_once(&self) -> usize {
        let mut updated = 0;
        for symbol in self.state.symbols() {
            match self.fetch_spot(&symbol).await {
                Some(spot) => {
                    self.state.with_market_mut(&symbol, |m| {
                        m.spot_index_price = Some(spot);
                    });
                    self.funding.record_reference_price(&symbol, spot);
                    debug!(symbol = %symbol, spot, "spot index updated");
                    updated += 1;
                }
                None => {
                    // feed down or unset: the mark keeps the volatility
                    // window alive, funding falls back to book imbalance
                    if let Some(mark) = self.state.mark_price(&symbol) {
                        self.funding.record_reference_price(&symbol, mark);
                    }
                }
            }
        }
        updated
    }

    async fn fetch_spot(&self, symbol: &str) -> Option<Price> {
        let template = self.config.endpoint.as_ref()?;
        let url = template.replace("{symbol}", symbol);
        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(symbol, error = %e, "spot feed request failed");
                return None;
            }
        };
        let quote: SpotQuote = match response.json().await {
            Ok(quote) => quote,
            Err(e) => {
                warn!(symbol, error = %e, "spot feed returned malformed payload");
                return None;
            }
        };
        parse_spot_price(&quote.price)
    }

    pub async fn run(self: Arc<Self>) {
        if self.config.endpoint.is_none() {
            info!("spot feed disabled, funding will use book imbalance");
        }
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.sync_interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.sync_once().await;
        }
    }
}

/// Decimal quote string to an exact 1e12 price. Rejects non-positive and
/// unparseable quotes.
fn parse_spot_price(quote: &str) -> Option<Price> {
    let decimal = Decimal::from_str(quote.trim()).ok()?;
    if decimal <= Decimal::ZERO {
        return None;
    }
    (decimal * Decimal::from(PRICE_SCALE)).trunc().to_i64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::units::USD_SCALE;
    use crate::services::funding::FundingConfig;
    use tokio::sync::broadcast;

    #[test]
    fn test_parse_spot_price() {
        assert_eq!(parse_spot_price("1.0"), Some(PRICE_SCALE));
        assert_eq!(parse_spot_price("0.000123"), Some(123_000_000));
        assert_eq!(parse_spot_price(" 2.5 "), Some(2_500_000_000_000));
        assert_eq!(parse_spot_price("0"), None);
        assert_eq!(parse_spot_price("-1"), None);
        assert_eq!(parse_spot_price("nope"), None);
    }

    #[tokio::test]
    async fn test_sync_without_endpoint_feeds_marks() {
        let state = Arc::new(VenueState::new(
            &["MEMEUSD".to_string()],
            USD_SCALE,
            1_000,
        ));
        state.with_market_mut("MEMEUSD", |m| m.record_trade(PRICE_SCALE, 0, 0));
        let (event_tx, _) = broadcast::channel(16);
        let funding = Arc::new(FundingService::new(
            state.clone(),
            event_tx,
            FundingConfig {
                base_interval_ms: 3_600_000,
                min_interval_ms: 900_000,
                max_rate_bp: 75,
                volatile_max_rate_bp: 300,
                volatile_symbols: Vec::new(),
                sample_window: 120,
            },
        ));
        let service = SpotIndexService::new(
            state.clone(),
            funding,
            SpotFeedConfig {
                endpoint: None,
                sync_interval_ms: 1_000,
                request_timeout_ms: 1_000,
            },
        );

        assert_eq!(service.sync_once().await, 0);
        // spot stays unset; the mark kept the sample window alive
        assert_eq!(state.market("MEMEUSD").unwrap().spot_index_price, None);
    }
}
