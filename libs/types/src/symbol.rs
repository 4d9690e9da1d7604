//! Symbol canonicalization.
//!
//! Venues disagree about instrument naming: Binance concatenates
//! (`BTCUSDT`), OKX hyphenates and suffixes swaps (`BTC-USDT-SWAP`),
//! Deribit names perpetuals by settlement currency (`BTC-PERPETUAL`).
//! The canonical form everywhere downstream is `BASE-QUOTE`, uppercase.
//!
//! Canonicalization is idempotent: a string already in canonical form maps
//! to itself.

use crate::TypeError;

/// Quote assets recognized when splitting concatenated symbols, longest
/// first so `BTCUSDT` resolves to `BTC-USDT` rather than `BTCUSD-T`.
const QUOTE_ASSETS: &[&str] = &[
    "FDUSD", "USDT", "USDC", "TUSD", "BUSD", "USD", "EUR", "TRY", "BTC", "ETH", "BNB", "DAI",
];

/// Canonicalize a venue-native symbol to `BASE-QUOTE`.
///
/// Handles the three naming schemes the pipeline encounters:
/// - concatenated (`BTCUSDT` -> `BTC-USDT`)
/// - hyphenated with instrument suffix (`BTC-USDT-SWAP` -> `BTC-USDT`)
/// - settlement-currency perpetuals (`BTC-PERPETUAL` -> `BTC-USD`)
pub fn canonical_symbol(raw: &str) -> Result<String, TypeError> {
    let upper = raw.trim().to_ascii_uppercase();
    if upper.is_empty() {
        return Err(TypeError::UnrecognizedSymbol(raw.to_string()));
    }

    if let Some((base, rest)) = upper.split_once('-') {
        // Hyphenated already; keep base and quote, drop instrument suffixes
        // like -SWAP or -240927.
        let quote = rest.split('-').next().unwrap_or(rest);
        if base.is_empty() || quote.is_empty() {
            return Err(TypeError::UnrecognizedSymbol(raw.to_string()));
        }
        if quote == "PERPETUAL" {
            // Deribit inverse perpetuals settle in USD.
            return Ok(format!("{base}-USD"));
        }
        return Ok(format!("{base}-{quote}"));
    }

    for quote in QUOTE_ASSETS {
        if let Some(base) = upper.strip_suffix(quote) {
            if !base.is_empty() {
                return Ok(format!("{base}-{quote}"));
            }
        }
    }

    Err(TypeError::UnrecognizedSymbol(raw.to_string()))
}

/// Render a canonical symbol in a venue's concatenated form (`BTC-USDT` ->
/// `BTCUSDT`). Used when building Binance subscribe frames and REST paths.
pub fn concat_form(canonical: &str) -> String {
    canonical.replace('-', "")
}

/// Render a canonical symbol as an OKX instrument id for the given tier.
pub fn okx_inst_id(canonical: &str, perpetual: bool) -> String {
    if perpetual {
        format!("{canonical}-SWAP")
    } else {
        canonical.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concatenated_symbols_split_on_known_quotes() {
        assert_eq!(canonical_symbol("BTCUSDT").unwrap(), "BTC-USDT");
        assert_eq!(canonical_symbol("ethbtc").unwrap(), "ETH-BTC");
        assert_eq!(canonical_symbol("SOLFDUSD").unwrap(), "SOL-FDUSD");
    }

    #[test]
    fn swap_suffix_is_dropped() {
        assert_eq!(canonical_symbol("BTC-USDT-SWAP").unwrap(), "BTC-USDT");
        assert_eq!(canonical_symbol("ETH-USD-SWAP").unwrap(), "ETH-USD");
    }

    #[test]
    fn deribit_perpetuals_settle_in_usd() {
        assert_eq!(canonical_symbol("BTC-PERPETUAL").unwrap(), "BTC-USD");
    }

    #[test]
    fn canonicalization_is_idempotent() {
        for raw in ["BTCUSDT", "BTC-USDT-SWAP", "BTC-PERPETUAL", "BTC-USDT"] {
            let once = canonical_symbol(raw).unwrap();
            let twice = canonical_symbol(&once).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn unknown_formats_are_rejected() {
        assert!(canonical_symbol("").is_err());
        assert!(canonical_symbol("BTC").is_err());
        assert!(canonical_symbol("-USDT").is_err());
    }

    #[test]
    fn venue_forms_round_trip() {
        assert_eq!(concat_form("BTC-USDT"), "BTCUSDT");
        assert_eq!(okx_inst_id("BTC-USDT", true), "BTC-USDT-SWAP");
        assert_eq!(okx_inst_id("BTC-USDT", false), "BTC-USDT");
    }
}
