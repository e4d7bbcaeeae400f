//! Time-ordered candle heap for deterministic multi-pair replay.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::models::Candle;

struct Entry {
    seq: u64,
    candle: Candle,
}

impl Entry {
    fn key(&self) -> (i64, u64) {
        (self.candle.time.timestamp_millis(), self.seq)
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Min-heap of candles keyed on open time; equal times pop in insertion order.
#[derive(Default)]
pub struct CandleQueue {
    heap: BinaryHeap<Reverse<Entry>>,
    seq: u64,
}

impl CandleQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candle: Candle) {
        self.heap.push(Reverse(Entry { seq: self.seq, candle }));
        self.seq += 1;
    }

    pub fn pop(&mut self) -> Option<Candle> {
        self.heap.pop().map(|Reverse(entry)| entry.candle)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }
}

impl Extend<Candle> for CandleQueue {
    fn extend<I: IntoIterator<Item = Candle>>(&mut self, iter: I) {
        for candle in iter {
            self.push(candle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn candle(pair: &str, minute: u32) -> Candle {
        Candle {
            pair: pair.to_string(),
            timeframe: "1m".to_string(),
            time: Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).unwrap(),
            open: dec!(1),
            high: dec!(1),
            low: dec!(1),
            close: dec!(1),
            volume: dec!(1),
            complete: true,
        }
    }

    #[test]
    fn test_pops_in_time_then_insertion_order() {
        let mut queue = CandleQueue::new();
        queue.extend(vec![
            candle("ETHUSDT", 2),
            candle("BTCUSDT", 1),
            candle("ETHUSDT", 1),
            candle("BTCUSDT", 0),
        ]);
        assert_eq!(queue.len(), 4);

        let order: Vec<(String, u32)> = std::iter::from_fn(|| queue.pop())
            .map(|c| (c.pair, chrono::Timelike::minute(&c.time)))
            .collect();

        assert_eq!(
            order,
            vec![
                ("BTCUSDT".to_string(), 0),
                ("BTCUSDT".to_string(), 1),
                ("ETHUSDT".to_string(), 1),
                ("ETHUSDT".to_string(), 2),
            ]
        );
        assert_eq!(queue.len(), 0);
    }
}
