//! Record fingerprints.
//!
//! The minimal identity of a record, used by the publisher's dedup cache
//! and as the bus message id for the duplicate window. Two records with the
//! same fingerprint are the same logical observation; re-publishing one is
//! harmless but wasteful, so the publisher drops it.

use types::records::MarketRecord;
use types::time::format_millis;

/// Build the dedup fingerprint for a record.
///
/// The leading tokens (data type, exchange, symbol) keep fingerprints from
/// colliding across kinds or venues that happen to share native ids.
pub fn fingerprint(record: &MarketRecord) -> String {
    let prefix = format!(
        "{}:{}:{}",
        record.data_type().as_str(),
        record.exchange().as_str(),
        record.symbol(),
    );
    match record {
        MarketRecord::Trade(t) => format!("{prefix}:{}", t.trade_id),
        MarketRecord::OrderBook(b) => format!("{prefix}:{}", b.last_update_id),
        MarketRecord::FundingRate(f) => match f.funding_time {
            Some(ft) => format!("{prefix}:{}", format_millis(ft)),
            None => format!("{prefix}:{}", format_millis(f.timestamp)),
        },
        MarketRecord::OpenInterest(o) => format!("{prefix}:{}", format_millis(o.timestamp)),
        MarketRecord::Liquidation(l) => match &l.liquidation_id {
            Some(id) => format!("{prefix}:{id}"),
            None => format!(
                "{prefix}:{}:{}:{}",
                l.side.as_str(),
                l.price,
                format_millis(l.timestamp)
            ),
        },
        MarketRecord::LongShortRatio(r) => format!(
            "{prefix}:{}:{}",
            r.variant.as_str(),
            format_millis(r.timestamp)
        ),
        MarketRecord::VolatilityIndex(v) => format!("{prefix}:{}", format_millis(v.timestamp)),
    }
}
