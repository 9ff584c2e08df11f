//! Daily fare rollups and the fold that builds them.

use crate::decoder::{SequenceNumber, TripEvent};
use chrono::NaiveDate;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// The running total no longer fits a `Decimal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("fare total overflowed")]
pub struct FareOverflow;

/// Count, sum and extrema of a set of fares.
///
/// Folding is commutative and associative, so totals built from the same
/// fares in any order or grouping are equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FareTotals {
    pub trip_count: u64,
    pub total_fare: Decimal,
    pub max_fare: Option<Decimal>,
    pub min_fare: Option<Decimal>,
}

impl FareTotals {
    /// Adds one fare. On overflow the totals are left unchanged.
    pub fn add(&mut self, fare: Decimal) -> Result<(), FareOverflow> {
        let total_fare = self.total_fare.checked_add(fare).ok_or(FareOverflow)?;
        let trip_count = self.trip_count.checked_add(1).ok_or(FareOverflow)?;
        self.trip_count = trip_count;
        self.total_fare = total_fare;
        self.max_fare = Some(self.max_fare.map_or(fare, |max| max.max(fare)));
        self.min_fare = Some(self.min_fare.map_or(fare, |min| min.min(fare)));
        Ok(())
    }

    pub fn merge(&mut self, other: &FareTotals) -> Result<(), FareOverflow> {
        let total_fare = self
            .total_fare
            .checked_add(other.total_fare)
            .ok_or(FareOverflow)?;
        let trip_count = self
            .trip_count
            .checked_add(other.trip_count)
            .ok_or(FareOverflow)?;
        self.trip_count = trip_count;
        self.total_fare = total_fare;
        self.max_fare = match (self.max_fare, other.max_fare) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        self.min_fare = match (self.min_fare, other.min_fare) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Ok(())
    }

    /// `total_fare / trip_count` rounded to cents, or `None` with no trips.
    pub fn average_fare(&self) -> Option<Decimal> {
        if self.trip_count == 0 {
            return None;
        }
        self.total_fare
            .checked_div(Decimal::from(self.trip_count))
            .map(|avg| avg.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero))
    }
}

/// Result of folding one event into a rollup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Folded,
    Duplicate,
    /// Folding would overflow the date's totals; the event is left out.
    Overflow,
}

/// Aggregate state for one pickup date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyRollup {
    pub date: NaiveDate,
    #[serde(flatten)]
    pub totals: FareTotals,
    /// Last applied sequence number per source partition.
    #[serde(default)]
    pub high_water: BTreeMap<String, SequenceNumber>,
    /// Bumped by the store on every successful write; 0 means never stored.
    #[serde(default)]
    pub version: u64,
}

impl DailyRollup {
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            totals: FareTotals::default(),
            high_water: BTreeMap::new(),
            version: 0,
        }
    }

    pub fn has_applied(&self, event: &TripEvent) -> bool {
        self.high_water
            .get(&event.partition)
            .is_some_and(|mark| event.sequence <= *mark)
    }

    /// Folds `event` in unless its partition's high-water mark already covers it.
    pub fn apply(&mut self, event: &TripEvent) -> Applied {
        debug_assert_eq!(event.pickup_date, self.date);
        if self.has_applied(event) {
            return Applied::Duplicate;
        }
        if self.totals.add(event.fare_amount).is_err() {
            return Applied::Overflow;
        }
        self.high_water
            .insert(event.partition.clone(), event.sequence.clone());
        Applied::Folded
    }
}
