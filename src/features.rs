//! Per-customer feature computation over the observation window

use crate::error::ClvError;
use crate::ingest::{
    datetime_lit, COUNTRY, CUSTOMER_ID, INVOICE_DATE, INVOICE_ID, LINE_TOTAL, PRODUCT_CODE,
    QUANTITY, UNKNOWN_COUNTRY,
};
use crate::split::TemporalSplit;
use chrono::NaiveDateTime;
use polars::prelude::*;
use polars::series::ops::NullBehavior;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Months counted as peak season
pub const PEAK_SEASON_MONTHS: [u32; 2] = [11, 12];

/// Shared bucket for countries outside the top K
pub const OTHER_COUNTRY: &str = "Other";

/// Names of the numeric model inputs, in matrix column order
pub const NUMERIC_FEATURES: [&str; 12] = [
    "recency",
    "frequency",
    "monetary",
    "avg_basket",
    "tenure_days",
    "first_purchase_month",
    "active_months",
    "unique_products",
    "total_items",
    "peak_season_prop",
    "purchase_regularity_std",
    "spending_trend_ratio",
];

/// One row of the feature table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerFeatureVector {
    pub customer_id: i64,
    /// Days between the last purchase and the snapshot
    pub recency: i64,
    /// Distinct invoices
    pub frequency: usize,
    /// Sum of line totals
    pub monetary: f64,
    pub avg_basket: f64,
    /// Days between the first purchase and the snapshot
    pub tenure_days: i64,
    /// Calendar month (1-12) of the first purchase
    pub first_purchase_month: u32,
    /// Distinct year-month periods with a purchase
    pub active_months: usize,
    pub unique_products: usize,
    /// Sum of quantities
    pub total_items: i64,
    pub peak_season_prop: f64,
    pub purchase_regularity_std: f64,
    pub spending_trend_ratio: f64,
    /// First observed country, encoded through a [`CountryVocabulary`]
    pub country: String,
}

impl CustomerFeatureVector {
    /// Numeric features in [`NUMERIC_FEATURES`] order
    pub fn numeric_values(&self) -> [f64; 12] {
        [
            self.recency as f64,
            self.frequency as f64,
            self.monetary,
            self.avg_basket,
            self.tenure_days as f64,
            f64::from(self.first_purchase_month),
            self.active_months as f64,
            self.unique_products as f64,
            self.total_items as f64,
            self.peak_season_prop,
            self.purchase_regularity_std,
            self.spending_trend_ratio,
        ]
    }
}

/// Frozen mapping from raw country to one-hot columns.
///
/// Fitted once on the training population and reused unchanged for every row
/// scored afterwards, so held-out customers never influence the categories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountryVocabulary {
    /// Top-K countries by customer count (ties by name)
    top: Vec<String>,
    /// All categories including [`OTHER_COUNTRY`], sorted by name
    categories: Vec<String>,
}

impl CountryVocabulary {
    /// Keep the `k` most frequent values; everything else becomes "Other".
    ///
    /// Ties in frequency are broken by name.
    pub fn fit<'a, I>(countries: I, k: usize) -> crate::Result<Self>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let observed = df!(COUNTRY => countries.into_iter().collect::<Vec<&str>>())?;
        let ranked = observed
            .lazy()
            .group_by([col(COUNTRY)])
            .agg([len().alias("customers")])
            .sort_by_exprs(
                [col("customers"), col(COUNTRY)],
                SortMultipleOptions::default().with_order_descending_multi([true, false]),
            )
            .limit(IdxSize::try_from(k).unwrap_or(IdxSize::MAX))
            .collect()?;

        let top: Vec<String> = ranked
            .column(COUNTRY)?
            .str()?
            .into_no_null_iter()
            .map(str::to_string)
            .collect();

        let mut categories: Vec<String> = top
            .iter()
            .filter(|c| c.as_str() != OTHER_COUNTRY)
            .cloned()
            .collect();
        categories.push(OTHER_COUNTRY.to_string());
        categories.sort();

        debug!(?top, "Fitted country vocabulary");
        Ok(Self { top, categories })
    }

    /// Countries kept as their own category
    pub fn top_countries(&self) -> &[String] {
        &self.top
    }

    /// Categories in column order
    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    /// Category a raw country falls into
    pub fn category_of<'a>(&'a self, country: &'a str) -> &'a str {
        if self.top.iter().any(|c| c == country) {
            country
        } else {
            OTHER_COUNTRY
        }
    }

    /// `country_<category>` column names
    pub fn column_names(&self) -> Vec<String> {
        self.categories
            .iter()
            .map(|c| format!("country_{c}"))
            .collect()
    }

    /// One-hot indicator row for `country`
    pub fn encode(&self, country: &str) -> Vec<f64> {
        let category = self.category_of(country);
        self.categories
            .iter()
            .map(|c| if c == category { 1.0 } else { 0.0 })
            .collect()
    }
}

const FIRST_PURCHASE: &str = "first_purchase";
const LAST_PURCHASE: &str = "last_purchase";
const PEAK_LINES: &str = "peak_season_lines";
const INVOICE_START: &str = "invoice_start";
const INVOICE_TOTAL: &str = "invoice_total";
const GAP_DAYS: &str = "gap_days";
const LAST_INVOICE_TOTAL: &str = "last_invoice_total";

/// Aggregates the observation window into one feature vector per customer
#[derive(Debug, Default, Clone, Copy)]
pub struct FeatureEngine;

impl FeatureEngine {
    pub fn new() -> Self {
        Self
    }

    /// Feature table for every customer of the split's observation window
    pub fn from_split(&self, split: &TemporalSplit) -> crate::Result<DataFrame> {
        self.feature_frame(&split.observation, split.snapshot_date)
    }

    /// One feature vector per customer, ascending by customer id.
    ///
    /// Rows dated after `snapshot_date` are ignored.
    pub fn build(
        &self,
        observation: &DataFrame,
        snapshot_date: NaiveDateTime,
    ) -> crate::Result<Vec<CustomerFeatureVector>> {
        feature_vectors(&self.feature_frame(observation, snapshot_date)?)
    }

    /// Feature table with `customer_id`, [`NUMERIC_FEATURES`] and `country`,
    /// sorted by customer id.
    pub fn feature_frame(
        &self,
        observation: &DataFrame,
        snapshot_date: NaiveDateTime,
    ) -> crate::Result<DataFrame> {
        let snapshot = datetime_lit(snapshot_date);
        let window = observation
            .clone()
            .lazy()
            .filter(col(INVOICE_DATE).lt_eq(snapshot.clone()));

        let month = col(INVOICE_DATE).dt().month().cast(DataType::Int32);
        let is_peak = PEAK_SEASON_MONTHS
            .iter()
            .map(|m| month.clone().eq(lit(*m as i32)))
            .reduce(|a, b| a.or(b))
            .unwrap_or_else(|| lit(false));
        let year_month = col(INVOICE_DATE).dt().year().cast(DataType::Int32) * lit(100) + month;

        let base = window.clone().group_by_stable([col(CUSTOMER_ID)]).agg([
            col(INVOICE_DATE).min().alias(FIRST_PURCHASE),
            col(INVOICE_DATE).max().alias(LAST_PURCHASE),
            col(INVOICE_ID).n_unique().alias("frequency"),
            col(LINE_TOTAL).sum().alias("monetary"),
            col(PRODUCT_CODE).n_unique().alias("unique_products"),
            col(QUANTITY).sum().alias("total_items"),
            is_peak.cast(DataType::Int64).sum().alias(PEAK_LINES),
            year_month.n_unique().alias("active_months"),
            col(COUNTRY).first().alias(COUNTRY),
        ]);

        // an invoice is dated by its earliest line; ties ordered by invoice id
        let invoices = window
            .group_by_stable([col(CUSTOMER_ID), col(INVOICE_ID)])
            .agg([
                col(INVOICE_DATE).min().alias(INVOICE_START),
                col(LINE_TOTAL).sum().alias(INVOICE_TOTAL),
            ])
            .sort_by_exprs(
                [col(CUSTOMER_ID), col(INVOICE_START), col(INVOICE_ID)],
                SortMultipleOptions::default(),
            )
            .with_columns([col(INVOICE_START)
                .diff(1, NullBehavior::Ignore)
                .over([col(CUSTOMER_ID)])
                .dt()
                .total_days()
                .cast(DataType::Float64)
                .alias(GAP_DAYS)])
            .group_by_stable([col(CUSTOMER_ID)])
            .agg([
                col(GAP_DAYS).std(1).alias("purchase_regularity_std"),
                col(INVOICE_TOTAL).last().alias(LAST_INVOICE_TOTAL),
            ]);

        let features = base
            .left_join(invoices, col(CUSTOMER_ID), col(CUSTOMER_ID))
            .with_columns([
                (snapshot.clone() - col(LAST_PURCHASE))
                    .dt()
                    .total_days()
                    .alias("recency"),
                (snapshot - col(FIRST_PURCHASE))
                    .dt()
                    .total_days()
                    .alias("tenure_days"),
                col(FIRST_PURCHASE).dt().month().alias("first_purchase_month"),
                (col("monetary") / col("frequency").cast(DataType::Float64)).alias("avg_basket"),
                finite_or(
                    col(PEAK_LINES).cast(DataType::Float64)
                        / col("total_items").cast(DataType::Float64),
                    0.0,
                )
                .alias("peak_season_prop"),
                col("purchase_regularity_std")
                    .fill_nan(lit(0.0))
                    .fill_null(lit(0.0)),
            ])
            .with_columns([when(
                col("frequency")
                    .lt(lit(2))
                    .or(col("avg_basket").eq(lit(0.0))),
            )
            .then(lit(1.0))
            .otherwise(finite_or(col(LAST_INVOICE_TOTAL) / col("avg_basket"), 1.0))
            .alias("spending_trend_ratio")])
            .sort_by_exprs([col(CUSTOMER_ID)], SortMultipleOptions::default())
            .select(output_columns())
            .collect()?;

        if features.height() == 0 {
            return Err(ClvError::EmptyCustomerUniverse);
        }
        info!(customers = features.height(), "Computed customer features");
        Ok(features)
    }
}

/// `value` where finite, `fallback` otherwise (NaN, infinity and null)
pub(crate) fn finite_or(value: Expr, fallback: f64) -> Expr {
    when(value.clone().is_finite())
        .then(value)
        .otherwise(lit(fallback))
}

/// Final column order and types of a feature table
fn output_columns() -> Vec<Expr> {
    let mut columns = vec![col(CUSTOMER_ID)];
    columns.extend(NUMERIC_FEATURES.iter().map(|name| {
        let dtype = if INTEGER_FEATURES.contains(name) {
            DataType::Int64
        } else {
            DataType::Float64
        };
        col(*name).cast(dtype)
    }));
    columns.push(col(COUNTRY));
    columns
}

const INTEGER_FEATURES: [&str; 7] = [
    "recency",
    "frequency",
    "tenure_days",
    "first_purchase_month",
    "active_months",
    "unique_products",
    "total_items",
];

/// Convert a feature table (as built by [`FeatureEngine::feature_frame`]) into rows
pub fn feature_vectors(frame: &DataFrame) -> crate::Result<Vec<CustomerFeatureVector>> {
    let ints = |name: &str| -> crate::Result<Vec<i64>> {
        Ok(frame.column(name)?.i64()?.into_iter().map(|v| v.unwrap_or(0)).collect())
    };
    let floats = |name: &str| -> crate::Result<Vec<f64>> {
        Ok(frame.column(name)?.f64()?.into_iter().map(|v| v.unwrap_or(0.0)).collect())
    };

    let customer_id = ints(CUSTOMER_ID)?;
    let recency = ints("recency")?;
    let frequency = ints("frequency")?;
    let monetary = floats("monetary")?;
    let avg_basket = floats("avg_basket")?;
    let tenure_days = ints("tenure_days")?;
    let first_purchase_month = ints("first_purchase_month")?;
    let active_months = ints("active_months")?;
    let unique_products = ints("unique_products")?;
    let total_items = ints("total_items")?;
    let peak_season_prop = floats("peak_season_prop")?;
    let purchase_regularity_std = floats("purchase_regularity_std")?;
    let spending_trend_ratio = floats("spending_trend_ratio")?;
    let country = frame.column(COUNTRY)?.str()?;

    Ok((0..frame.height())
        .map(|i| CustomerFeatureVector {
            customer_id: customer_id[i],
            recency: recency[i],
            frequency: frequency[i].max(0) as usize,
            monetary: monetary[i],
            avg_basket: avg_basket[i],
            tenure_days: tenure_days[i],
            first_purchase_month: first_purchase_month[i].clamp(1, 12) as u32,
            active_months: active_months[i].max(0) as usize,
            unique_products: unique_products[i].max(0) as usize,
            total_items: total_items[i],
            peak_season_prop: peak_season_prop[i],
            purchase_regularity_std: purchase_regularity_std[i],
            spending_trend_ratio: spending_trend_ratio[i],
            country: country.get(i).unwrap_or(UNKNOWN_COUNTRY).to_string(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::testing::{transactions, Line};
    use approx::assert_relative_eq;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
    }

    fn build(lines: &[Line<'_>], snapshot: NaiveDateTime) -> crate::Result<Vec<CustomerFeatureVector>> {
        FeatureEngine::new().build(&transactions(lines), snapshot)
    }

    #[test]
    fn test_base_aggregates() {
        let features = build(
            &[
                ("1", "A1", "2010-11-05 10:00:00", "P1", "2", "10.0", "France"),
                ("1", "A1", "2010-11-05 10:00:00", "P2", "1", "5.0", "France"),
                ("1", "A2", "2010-12-20 10:00:00", "P1", "3", "15.0", "Germany"),
                ("1", "A3", "2011-01-10 10:00:00", "P3", "4", "30.0", "France"),
            ],
            at(2011, 1, 31),
        )
        .unwrap();
        assert_eq!(features.len(), 1);
        let f = &features[0];

        assert_eq!(f.frequency, 3);
        assert_relative_eq!(f.monetary, 60.0);
        assert_relative_eq!(f.avg_basket, 20.0);
        assert_eq!(f.unique_products, 3);
        assert_eq!(f.total_items, 10);
        assert_eq!(f.active_months, 3);
        assert_eq!(f.recency, 21);
        assert_eq!(f.tenure_days, 87);
        assert_eq!(f.first_purchase_month, 11);
        assert_eq!(f.country, "France");
        // 3 peak-season lines over 10 items
        assert_relative_eq!(f.peak_season_prop, 0.3);
        // last invoice 30 vs basket 20
        assert_relative_eq!(f.spending_trend_ratio, 1.5);
        // gaps of 45 and 21 days
        assert_relative_eq!(f.purchase_regularity_std, (288.0f64).sqrt(), epsilon = 1e-9);
    }

    #[test]
    fn test_invoice_is_dated_by_its_earliest_line() {
        // B2's second line is later than B3, but B2 still starts first
        let features = build(
            &[
                ("4", "B1", "2010-03-01 10:00:00", "P1", "1", "10.0", "UK"),
                ("4", "B2", "2010-03-11 10:00:00", "P1", "1", "5.0", "UK"),
                ("4", "B3", "2010-03-21 10:00:00", "P1", "1", "40.0", "UK"),
                ("4", "B2", "2010-04-30 10:00:00", "P2", "1", "5.0", "UK"),
            ],
            at(2011, 1, 31),
        )
        .unwrap();
        let f = &features[0];

        assert_eq!(f.frequency, 3);
        // gaps of 10 and 10 days
        assert_relative_eq!(f.purchase_regularity_std, 0.0);
        // B3 is the latest invoice: 40 / 20
        assert_relative_eq!(f.spending_trend_ratio, 2.0);
    }

    #[test]
    fn test_rows_are_sorted_by_customer_id() {
        let features = build(
            &[
                ("9", "C1", "2010-05-01 10:00:00", "P1", "1", "10.0", "UK"),
                ("2", "C2", "2010-05-02 10:00:00", "P1", "1", "10.0", "Spain"),
                ("5", "C3", "2010-05-03 10:00:00", "P1", "1", "10.0", "EIRE"),
            ],
            at(2011, 1, 31),
        )
        .unwrap();
        let ids: Vec<i64> = features.iter().map(|f| f.customer_id).collect();
        assert_eq!(ids, vec![2, 5, 9]);
        assert_eq!(features[0].country, "Spain");
    }

    #[test]
    fn test_single_invoice_defaults() {
        let features = build(
            &[
                ("5", "B1", "2010-06-01 10:00:00", "P1", "1", "12.0", "Spain"),
                ("5", "B1", "2010-06-01 10:00:00", "P2", "1", "8.0", "Spain"),
            ],
            at(2011, 1, 31),
        )
        .unwrap();
        let f = &features[0];

        assert_eq!(f.frequency, 1);
        assert_relative_eq!(f.purchase_regularity_std, 0.0);
        assert_relative_eq!(f.spending_trend_ratio, 1.0);
        assert!(f.tenure_days >= f.recency && f.recency >= 0);
    }

    #[test]
    fn test_zero_items_and_zero_basket_are_defined() {
        let features = build(
            &[
                ("9", "C1", "2010-12-01 10:00:00", "P1", "0", "0.0", "Spain"),
                ("9", "C2", "2010-12-02 10:00:00", "P1", "0", "0.0", "Spain"),
            ],
            at(2011, 1, 31),
        )
        .unwrap();
        let f = &features[0];

        assert_relative_eq!(f.peak_season_prop, 0.0);
        assert_relative_eq!(f.spending_trend_ratio, 1.0);
        assert!(f.numeric_values().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_same_day_invoices_have_zero_regularity() {
        let features = build(
            &[
                ("3", "D1", "2010-05-01 10:00:00", "P1", "1", "10.0", "UK"),
                ("3", "D2", "2010-05-01 10:00:00", "P1", "1", "10.0", "UK"),
                ("3", "D3", "2010-05-01 10:00:00", "P1", "1", "10.0", "UK"),
            ],
            at(2011, 1, 31),
        )
        .unwrap();
        assert_relative_eq!(features[0].purchase_regularity_std, 0.0);
    }

    #[test]
    fn test_rows_after_snapshot_are_ignored() {
        let features = build(
            &[
                ("1", "E1", "2010-05-01 10:00:00", "P1", "1", "10.0", "UK"),
                ("1", "E2", "2011-06-01 10:00:00", "P1", "1", "999.0", "UK"),
                ("2", "E3", "2011-06-01 10:00:00", "P1", "1", "50.0", "UK"),
            ],
            at(2011, 1, 31),
        )
        .unwrap();
        assert_eq!(features.len(), 1);
        assert_relative_eq!(features[0].monetary, 10.0);
    }

    #[test]
    fn test_empty_observation_is_an_error() {
        let result = build(&[], at(2011, 1, 1));
        assert!(matches!(result, Err(ClvError::EmptyCustomerUniverse)));
    }

    #[test]
    fn test_feature_frame_columns() {
        let frame = FeatureEngine::new()
            .feature_frame(
                &transactions(&[("1", "A1", "2010-05-01 10:00:00", "P1", "1", "10.0", "UK")]),
                at(2011, 1, 31),
            )
            .unwrap();
        let names: Vec<String> = frame
            .get_column_names_owned()
            .into_iter()
            .map(|n| n.to_string())
            .collect();

        let mut expected = vec![CUSTOMER_ID.to_string()];
        expected.extend(NUMERIC_FEATURES.iter().map(|n| n.to_string()));
        expected.push(COUNTRY.to_string());
        assert_eq!(names, expected);
    }

    #[test]
    fn test_vocabulary_keeps_top_k_and_other() {
        let countries = ["UK", "UK", "UK", "France", "France", "Germany", "Spain", "Italy"];
        let vocab = CountryVocabulary::fit(countries.iter().copied(), 2).unwrap();

        assert_eq!(vocab.top_countries(), ["UK".to_string(), "France".to_string()]);
        assert_eq!(
            vocab.column_names(),
            vec!["country_France", "country_Other", "country_UK"]
        );
        assert_eq!(vocab.encode("UK"), vec![0.0, 0.0, 1.0]);
        assert_eq!(vocab.encode("Spain"), vec![0.0, 1.0, 0.0]);
        assert_eq!(vocab.encode("Never Seen"), vec![0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_vocabulary_ties_break_by_name() {
        let countries = ["Spain", "Italy", "Germany"];
        let vocab = CountryVocabulary::fit(countries.iter().copied(), 2).unwrap();
        assert_eq!(
            vocab.top_countries(),
            ["Germany".to_string(), "Italy".to_string()]
        );
    }
}
