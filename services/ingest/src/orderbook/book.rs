//! Local order book.
//!
//! Two price-sorted level vectors: bids descending, asks ascending. Diffs
//! touch levels by binary search, so each touched level costs O(log k)
//! to find and the vectors stay sorted by construction. Depth is capped at
//! the configured collection depth after every apply.

use rust_decimal::Decimal;
use types::records::PriceLevel;

#[derive(Debug, Clone)]
pub struct LocalBook {
    /// Descending by price.
    bids: Vec<PriceLevel>,
    /// Ascending by price.
    asks: Vec<PriceLevel>,
    depth_limit: usize,
}

impl LocalBook {
    pub fn new(depth_limit: usize) -> Self {
        Self {
            bids: Vec::new(),
            asks: Vec::new(),
            depth_limit,
        }
    }

    /// Discard state and install a full snapshot.
    pub fn replace(&mut self, bids: &[(Decimal, Decimal)], asks: &[(Decimal, Decimal)]) {
        self.bids.clear();
        self.asks.clear();
        self.apply(bids, asks);
    }

    /// Apply one diff: zero-quantity levels delete, others insert or
    /// update in place.
    pub fn apply(&mut self, bids: &[(Decimal, Decimal)], asks: &[(Decimal, Decimal)]) {
        for &(price, quantity) in bids {
            apply_level(&mut self.bids, price, quantity, SortOrder::Descending);
        }
        for &(price, quantity) in asks {
            apply_level(&mut self.asks, price, quantity, SortOrder::Ascending);
        }
        self.bids.truncate(self.depth_limit);
        self.asks.truncate(self.depth_limit);
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|level| level.price)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|level| level.price)
    }

    /// A crossed book means local state has diverged from the venue.
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid >= ask,
            _ => false,
        }
    }

    /// Top `n` levels per side, cloned for publication.
    pub fn top(&self, n: usize) -> (Vec<PriceLevel>, Vec<PriceLevel>) {
        (
            self.bids.iter().take(n).cloned().collect(),
            self.asks.iter().take(n).cloned().collect(),
        )
    }

    /// Top `n` levels per side as borrowed slices (checksum input).
    pub fn top_slices(&self, n: usize) -> (&[PriceLevel], &[PriceLevel]) {
        (
            &self.bids[..self.bids.len().min(n)],
            &self.asks[..self.asks.len().min(n)],
        )
    }

    pub fn depth(&self) -> (usize, usize) {
        (self.bids.len(), self.asks.len())
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
    }
}

#[derive(Clone, Copy, PartialEq)]
enum SortOrder {
    /// Bids: best (highest) price first.
    Descending,
    /// Asks: best (lowest) price first.
    Ascending,
}

fn apply_level(side: &mut Vec<PriceLevel>, price: Decimal, quantity: Decimal, order: SortOrder) {
    let position = side.binary_search_by(|level| match order {
        SortOrder::Descending => price.cmp(&level.price),
        SortOrder::Ascending => level.price.cmp(&price),
    });
    match position {
        Ok(index) => {
            if quantity.is_zero() {
                side.remove(index);
            } else {
                side[index].quantity = quantity;
            }
        }
        Err(index) => {
            // Deleting an absent level is normal on diff streams.
            if !quantity.is_zero() {
                side.insert(index, PriceLevel::new(price, quantity));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn book_with(bids: &[(Decimal, Decimal)], asks: &[(Decimal, Decimal)]) -> LocalBook {
        let mut book = LocalBook::new(100);
        book.replace(bids, asks);
        book
    }

    #[test]
    fn sides_stay_sorted_after_unordered_inserts() {
        let book = book_with(
            &[(dec!(99), dec!(1)), (dec!(101), dec!(2)), (dec!(100), dec!(3))],
            &[(dec!(105), dec!(1)), (dec!(103), dec!(2)), (dec!(104), dec!(3))],
        );
        let (bids, asks) = book.top(10);
        let bid_prices: Vec<Decimal> = bids.iter().map(|l| l.price).collect();
        let ask_prices: Vec<Decimal> = asks.iter().map(|l| l.price).collect();
        assert_eq!(bid_prices, vec![dec!(101), dec!(100), dec!(99)]);
        assert_eq!(ask_prices, vec![dec!(103), dec!(104), dec!(105)]);
    }

    #[test]
    fn zero_quantity_removes_the_level() {
        let mut book = book_with(&[(dec!(100), dec!(5))], &[(dec!(101), dec!(5))]);
        book.apply(&[(dec!(100), dec!(0))], &[]);
        assert_eq!(book.best_bid(), None);
        assert_eq!(book.best_ask(), Some(dec!(101)));
    }

    #[test]
    fn removing_an_absent_level_is_a_no_op() {
        let mut book = book_with(&[(dec!(100), dec!(5))], &[]);
        book.apply(&[(dec!(98), dec!(0))], &[]);
        assert_eq!(book.depth(), (1, 0));
    }

    #[test]
    fn updates_replace_quantity_in_place() {
        let mut book = book_with(&[(dec!(100), dec!(5))], &[]);
        book.apply(&[(dec!(100), dec!(2.5))], &[]);
        let (bids, _) = book.top(1);
        assert_eq!(bids[0].quantity, dec!(2.5));
        assert_eq!(book.depth(), (1, 0));
    }

    #[test]
    fn depth_is_capped_at_the_limit() {
        let mut book = LocalBook::new(3);
        let bids: Vec<(Decimal, Decimal)> = (1..=10)
            .map(|i| (Decimal::from(i), dec!(1)))
            .collect();
        book.replace(&bids, &[]);
        assert_eq!(book.depth(), (3, 0));
        // The best (highest) bids survive truncation.
        assert_eq!(book.best_bid(), Some(dec!(10)));
    }

    #[test]
    fn crossed_book_is_detected() {
        let book = book_with(&[(dec!(102), dec!(1))], &[(dec!(101), dec!(1))]);
        assert!(book.is_crossed());
        let book = book_with(&[(dec!(100), dec!(1))], &[(dec!(101), dec!(1))]);
        assert!(!book.is_crossed());
    }

    #[test]
    fn replace_discards_previous_state() {
        let mut book = book_with(&[(dec!(100), dec!(1))], &[(dec!(101), dec!(1))]);
        book.replace(&[(dec!(50), dec!(1))], &[(dec!(51), dec!(1))]);
        assert_eq!(book.best_bid(), Some(dec!(50)));
        assert_eq!(book.depth(), (1, 1));
    }
}
