//! Wallet balances.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Balance of one asset split into spendable and held funds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetBalance {
    pub free: Decimal,
    pub lock: Decimal,
}

impl AssetBalance {
    pub fn total(&self) -> Decimal {
        self.free + self.lock
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub balances: BTreeMap<String, AssetBalance>,
}

impl Account {
    pub fn balance(&self, asset: &str) -> AssetBalance {
        self.balances.get(asset).copied().unwrap_or_default()
    }
}

const QUOTE_ASSETS: [&str; 5] = ["USDT", "USDC", "BUSD", "FDUSD", "USD"];

/// Split a pair symbol into `(asset, quote)`, e.g. `BTCUSDT` → `(BTC, USDT)`.
pub fn split_pair(pair: &str) -> (String, String) {
    let upper = pair.to_uppercase();
    for quote in QUOTE_ASSETS {
        if let Some(asset) = upper.strip_suffix(quote) {
            if !asset.is_empty() {
                return (asset.to_string(), quote.to_string());
            }
        }
    }
    (upper, "USDT".to_string())
}
