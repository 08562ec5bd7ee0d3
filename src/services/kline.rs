//! K-line Service
//!
//! OHLCV candles per symbol and interval, generated from internal trades.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

use crate::models::units::{Amount, Price};

const CANDLES_PER_SERIES: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KlineInterval {
    M1,
    M5,
    M15,
    H1,
    H4,
    D1,
}

impl KlineInterval {
    pub const ALL: [KlineInterval; 6] = [
        KlineInterval::M1,
        KlineInterval::M5,
        KlineInterval::M15,
        KlineInterval::H1,
        KlineInterval::H4,
        KlineInterval::D1,
    ];

    pub fn ms(&self) -> i64 {
        match self {
            KlineInterval::M1 => 60_000,
            KlineInterval::M5 => 300_000,
            KlineInterval::M15 => 900_000,
            KlineInterval::H1 => 3_600_000,
            KlineInterval::H4 => 14_400_000,
            KlineInterval::D1 => 86_400_000,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1m" => Some(KlineInterval::M1),
            "5m" => Some(KlineInterval::M5),
            "15m" => Some(KlineInterval::M15),
            "1h" => Some(KlineInterval::H1),
            "4h" => Some(KlineInterval::H4),
            "1d" => Some(KlineInterval::D1),
            _ => None,
        }
    }
}

impl fmt::Display for KlineInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KlineInterval::M1 => "1m",
            KlineInterval::M5 => "5m",
            KlineInterval::M15 => "15m",
            KlineInterval::H1 => "1h",
            KlineInterval::H4 => "4h",
            KlineInterval::D1 => "1d",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kline {
    pub symbol: String,
    pub interval: KlineInterval,
    pub open_time: i64,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
    pub volume: Amount,
    /// False while the bucket is still accepting trades.
    pub is_final: bool,
}

pub struct KlineService {
    candles: DashMap<(String, KlineInterval), VecDeque<Kline>>,
}

impl Default for KlineService {
    fn default() -> Self {
        Self {
            candles: DashMap::new(),
        }
    }
}

impl KlineService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a trade into every interval's current candle.
    pub fn process_trade(&self, symbol: &str, price: Price, size: Amount, timestamp_ms: i64) {
        for interval in KlineInterval::ALL {
            let bucket = timestamp_ms - timestamp_ms.rem_euclid(interval.ms());
            let mut series = self
                .candles
                .entry((symbol.to_string(), interval))
                .or_default();

            match series.back_mut() {
                Some(candle) if candle.open_time == bucket => {
                    candle.high = candle.high.max(price);
                    candle.low = candle.low.min(price);
                    candle.close = price;
                    candle.volume += size;
                }
                _ => {
                    if let Some(last) = series.back_mut() {
                        last.is_final = true;
                    }
                    series.push_back(Kline {
                        symbol: symbol.to_string(),
                        interval,
                        open_time: bucket,
                        open: price,
                        high: price,
                        low: price,
                        close: price,
                        volume: size,
                        is_final: false,
                    });
                    if series.len() > CANDLES_PER_SERIES {
                        series.pop_front();
                    }
                }
            }
        }
    }

    /// Most recent candles, oldest first.
    pub fn get_klines(&self, symbol: &str, interval: KlineInterval, limit: usize) -> Vec<Kline> {
        self.candles
            .get(&(symbol.to_string(), interval))
            .map(|series| {
                let skip = series.len().saturating_sub(limit);
                series.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::units::{AMOUNT_SCALE, PRICE_SCALE};

    #[test]
    fn test_interval_parse_round_trip() {
        for s in ["1m", "5m", "15m", "1h", "4h", "1d"] {
            assert_eq!(KlineInterval::parse(s).unwrap().to_string(), s);
        }
        assert!(KlineInterval::parse("2h").is_none());
    }

    #[test]
    fn test_trades_roll_into_candles() {
        let service = KlineService::new();
        let t0 = 600_000; // exactly on a 1m/5m boundary

        service.process_trade("MEMEUSD", PRICE_SCALE, AMOUNT_SCALE, t0);
        service.process_trade("MEMEUSD", 2 * PRICE_SCALE, AMOUNT_SCALE, t0 + 10_000);
        service.process_trade("MEMEUSD", PRICE_SCALE / 2, AMOUNT_SCALE, t0 + 20_000);

        let klines = service.get_klines("MEMEUSD", KlineInterval::M1, 10);
        assert_eq!(klines.len(), 1);
        let candle = &klines[0];
        assert_eq!(candle.open, PRICE_SCALE);
        assert_eq!(candle.high, 2 * PRICE_SCALE);
        assert_eq!(candle.low, PRICE_SCALE / 2);
        assert_eq!(candle.close, PRICE_SCALE / 2);
        assert_eq!(candle.volume, 3 * AMOUNT_SCALE);
        assert!(!candle.is_final);
    }

    #[test]
    fn test_new_bucket_finalizes_previous() {
        let service = KlineService::new();
        service.process_trade("MEMEUSD", PRICE_SCALE, AMOUNT_SCALE, 0);
        service.process_trade("MEMEUSD", 2 * PRICE_SCALE, AMOUNT_SCALE, 61_000);

        let klines = service.get_klines("MEMEUSD", KlineInterval::M1, 10);
        assert_eq!(klines.len(), 2);
        assert!(klines[0].is_final);
        assert!(!klines[1].is_final);
        // the hour candle is still one bucket
        assert_eq!(service.get_klines("MEMEUSD", KlineInterval::H1, 10).len(), 1);
    }

    #[test]
    fn test_limit_returns_most_recent() {
        let service = KlineService::new();
        for i in 0..5 {
            service.process_trade("MEMEUSD", PRICE_SCALE + i, AMOUNT_SCALE, i * 60_000);
        }
        let klines = service.get_klines("MEMEUSD", KlineInterval::M1, 2);
        assert_eq!(klines.len(), 2);
        assert_eq!(klines[1].close, PRICE_SCALE + 4);
    }
}
