//! Temporal split of the transaction log around a snapshot date
//!
//! Everything on or before the snapshot feeds the features, everything after it
//! feeds the target. No downstream stage ever sees both halves at once.

use crate::error::ClvError;
use crate::ingest::{datetime_lit, CUSTOMER_ID, INVOICE_DATE};
use chrono::{DateTime, Months, NaiveDateTime};
use polars::prelude::*;
use tracing::info;

/// Observation and target windows plus the customers eligible for training
#[derive(Debug, Clone)]
pub struct TemporalSplit {
    /// Latest invoice date across all transactions
    pub date_max: NaiveDateTime,
    /// `date_max` minus the horizon, in calendar months
    pub snapshot_date: NaiveDateTime,
    /// Transactions with `invoice_date <= snapshot_date`
    pub observation: DataFrame,
    /// Transactions with `invoice_date > snapshot_date`
    pub target: DataFrame,
    /// Distinct customers of the observation window, ascending
    pub eligible_customers: Vec<i64>,
}

/// Fixes the snapshot date and partitions transactions into two windows
#[derive(Debug, Clone, Copy)]
pub struct TemporalSplitter {
    horizon_months: u32,
}

impl Default for TemporalSplitter {
    fn default() -> Self {
        Self::new(12)
    }
}

impl TemporalSplitter {
    pub fn new(horizon_months: u32) -> Self {
        Self { horizon_months }
    }

    /// Snapshot for a given `date_max`.
    ///
    /// Uses calendar month arithmetic: the day of month is clamped when the
    /// target month is shorter (2012-02-29 minus 12 months is 2011-02-28).
    pub fn snapshot_for(&self, date_max: NaiveDateTime) -> crate::Result<NaiveDateTime> {
        date_max
            .checked_sub_months(Months::new(self.horizon_months))
            .ok_or_else(|| {
                ClvError::InvalidConfig(format!(
                    "cannot subtract {} months from {}",
                    self.horizon_months, date_max
                ))
            })
    }

    /// Partition an ingested transaction table
    pub fn split(&self, transactions: &DataFrame) -> crate::Result<TemporalSplit> {
        let date_max = latest_invoice_date(transactions)?.ok_or(ClvError::NoTransactions)?;
        let snapshot_date = self.snapshot_for(date_max)?;

        let observation = transactions
            .clone()
            .lazy()
            .filter(col(INVOICE_DATE).lt_eq(datetime_lit(snapshot_date)))
            .collect()?;
        let target = transactions
            .clone()
            .lazy()
            .filter(col(INVOICE_DATE).gt(datetime_lit(snapshot_date)))
            .collect()?;

        if observation.height() == 0 {
            return Err(ClvError::EmptyObservationWindow { snapshot_date });
        }

        let eligible_customers: Vec<i64> = observation
            .clone()
            .lazy()
            .select([col(CUSTOMER_ID).unique().sort(SortOptions::default())])
            .collect()?
            .column(CUSTOMER_ID)?
            .i64()?
            .into_no_null_iter()
            .collect();
        if eligible_customers.is_empty() {
            return Err(ClvError::EmptyCustomerUniverse);
        }

        info!(
            %date_max,
            %snapshot_date,
            observation_rows = observation.height(),
            target_rows = target.height(),
            customers = eligible_customers.len(),
            "Split transactions at snapshot date"
        );

        Ok(TemporalSplit {
            date_max,
            snapshot_date,
            observation,
            target,
            eligible_customers,
        })
    }
}

fn latest_invoice_date(transactions: &DataFrame) -> crate::Result<Option<NaiveDateTime>> {
    if transactions.height() == 0 {
        return Ok(None);
    }
    let latest = transactions
        .clone()
        .lazy()
        .select([col(INVOICE_DATE).max().cast(DataType::Int64)])
        .collect()?;
    Ok(latest
        .column(INVOICE_DATE)?
        .i64()?
        .get(0)
        .and_then(DateTime::from_timestamp_micros)
        .map(|d| d.naive_utc()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::testing::transactions;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn buy<'a>(customer: &'a str, date: &'a str) -> crate::ingest::testing::Line<'a> {
        (customer, customer, date, "P1", "1", "1.0", "France")
    }

    #[test]
    fn test_snapshot_uses_calendar_months() {
        let splitter = TemporalSplitter::new(12);
        assert_eq!(splitter.snapshot_for(at(2012, 2, 29)).unwrap(), at(2011, 2, 28));
        assert_eq!(splitter.snapshot_for(at(2011, 12, 9)).unwrap(), at(2010, 12, 9));
    }

    #[test]
    fn test_boundary_day_belongs_to_observation() {
        let log = transactions(&[
            buy("1", "2010-12-09 12:00:00"),
            buy("2", "2011-12-09 12:00:00"),
        ]);
        let split = TemporalSplitter::default().split(&log).unwrap();

        assert_eq!(split.date_max, at(2011, 12, 9));
        assert_eq!(split.snapshot_date, at(2010, 12, 9));
        assert_eq!(split.observation.height(), 1);
        assert_eq!(split.target.height(), 1);
        assert_eq!(split.eligible_customers, vec![1]);
    }

    #[test]
    fn test_target_only_customer_is_not_eligible() {
        let log = transactions(&[
            buy("7", "2010-01-01 12:00:00"),
            buy("3", "2010-06-01 12:00:00"),
            buy("7", "2010-07-01 12:00:00"),
            buy("9", "2011-12-01 12:00:00"),
        ]);
        let split = TemporalSplitter::default().split(&log).unwrap();
        assert_eq!(split.eligible_customers, vec![3, 7]);
    }

    #[test]
    fn test_empty_observation_window_is_fatal() {
        let log = transactions(&[
            buy("1", "2011-06-01 12:00:00"),
            buy("2", "2011-12-01 12:00:00"),
        ]);
        let result = TemporalSplitter::default().split(&log);
        assert!(matches!(
            result,
            Err(ClvError::EmptyObservationWindow { .. })
        ));
    }

    #[test]
    fn test_no_transactions_is_fatal() {
        let log = transactions(&[]);
        let result = TemporalSplitter::default().split(&log);
        assert!(matches!(result, Err(ClvError::NoTransactions)));
    }
}
