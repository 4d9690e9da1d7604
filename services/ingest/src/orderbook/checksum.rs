//! OKX book checksum.
//!
//! The venue validates local books with a CRC32 over the top 25 levels:
//! bid and ask `price:size` fields are interleaved best-first
//! (`bid1px:bid1sz:ask1px:ask1sz:bid2px:...`), joined by `:`; when one
//! side runs out the other side's remaining levels follow in order. The
//! CRC is compared as a signed 32-bit integer, which is how the venue
//! transmits it.

use types::records::PriceLevel;

use super::book::LocalBook;

/// Levels per side covered by the venue checksum.
const CHECKSUM_DEPTH: usize = 25;

/// Compute the venue checksum for the current book state.
pub fn okx_checksum(book: &LocalBook) -> i32 {
    let (bids, asks) = book.top_slices(CHECKSUM_DEPTH);
    crc32fast::hash(checksum_string(bids, asks).as_bytes()) as i32
}

/// Build the exact string the CRC runs over.
fn checksum_string(bids: &[PriceLevel], asks: &[PriceLevel]) -> String {
    let mut fields = Vec::with_capacity((bids.len() + asks.len()) * 2);
    let mut bid_iter = bids.iter();
    let mut ask_iter = asks.iter();
    loop {
        match (bid_iter.next(), ask_iter.next()) {
            (None, None) => break,
            (bid, ask) => {
                if let Some(bid) = bid {
                    fields.push(bid.price.to_string());
                    fields.push(bid.quantity.to_string());
                }
                if let Some(ask) = ask {
                    fields.push(ask.price.to_string());
                    fields.push(ask.quantity.to_string());
                }
            }
        }
    }
    fields.join(":")
}
