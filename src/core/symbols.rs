// Symbol Mapping
// Canonical product id <-> exchange-native symbol, identity when unmapped

use std::collections::HashMap;

/// Bidirectional product table. Both lookups are total: an unknown key
/// maps to itself.
#[derive(Debug, Clone, Default)]
pub struct ProductMap {
    to_exchange: HashMap<String, String>,
    to_canonical: HashMap<String, String>,
}

impl ProductMap {
    pub fn new(entries: &HashMap<String, String>) -> Self {
        let mut map = Self::default();
        for (canonical, exchange) in entries {
            map.insert(canonical, exchange);
        }
        map
    }

    pub fn insert(&mut self, canonical: &str, exchange: &str) {
        self.to_exchange.insert(canonical.to_string(), exchange.to_uppercase());
        self.to_canonical.insert(exchange.to_uppercase(), canonical.to_string());
    }

    pub fn to_exchange_symbol(&self, canonical: &str) -> String {
        self.to_exchange
            .get(canonical)
            .cloned()
            .unwrap_or_else(|| canonical.to_string())
    }

    /// Reverse lookup for callers holding raw exchange payloads, exposed via
    /// `DepthFeed::product_map`. Workers stamp events with their own
    /// canonical product and never go through here. Exchange payloads carry
    /// upper-case symbols; lookup is case-insensitive.
    pub fn to_canonical_product(&self, exchange_symbol: &str) -> String {
        self.to_canonical
            .get(&exchange_symbol.to_uppercase())
            .cloned()
            .unwrap_or_else(|| exchange_symbol.to_string())
    }

    pub fn len(&self) -> usize {
        self.to_exchange.len()
    }

    pub fn is_empty(&self) -> bool {
        self.to_exchange.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ProductMap {
        let mut entries = HashMap::new();
        entries.insert("BTC-USDT".to_string(), "btcusdt".to_string());
        ProductMap::new(&entries)
    }

    #[test]
    fn test_round_trip() {
        let map = sample();
        assert_eq!(map.to_exchange_symbol("BTC-USDT"), "BTCUSDT");
        assert_eq!(map.to_canonical_product("BTCUSDT"), "BTC-USDT");
        assert_eq!(map.to_canonical_product("btcusdt"), "BTC-USDT");
    }

    #[test]
    fn test_identity_fallback() {
        let map = sample();
        assert_eq!(map.to_exchange_symbol("DOGEUSDT"), "DOGEUSDT");
        assert_eq!(map.to_canonical_product("XRPUSDT"), "XRPUSDT");
    }
}
