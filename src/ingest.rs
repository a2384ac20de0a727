//! Transaction ingestion: type coercion of raw line items
//!
//! The raw table arrives with every column as text. Coercion is non-strict:
//! values that fail to parse become null, and rows with a null customer id,
//! invoice date or amount are dropped and counted.

use crate::error::ClvError;
use chrono::NaiveDateTime;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const CUSTOMER_ID: &str = "customer_id";
pub const INVOICE_ID: &str = "invoice_id";
pub const INVOICE_DATE: &str = "invoice_date";
pub const PRODUCT_CODE: &str = "product_code";
pub const QUANTITY: &str = "quantity";
pub const UNIT_PRICE: &str = "unit_price";
/// `quantity * unit_price` unless the source supplied it
pub const LINE_TOTAL: &str = "line_total";
pub const COUNTRY: &str = "country";

/// Columns of a clean transaction table, in order
pub const TRANSACTION_COLUMNS: [&str; 8] = [
    CUSTOMER_ID,
    INVOICE_ID,
    INVOICE_DATE,
    PRODUCT_CODE,
    QUANTITY,
    UNIT_PRICE,
    LINE_TOTAL,
    COUNTRY,
];

/// Country assigned to rows that carry none
pub const UNKNOWN_COUNTRY: &str = "Unknown";

const DATE_TIME_FORMATS: [&str; 6] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%SZ",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M",
    "%m/%d/%Y %H:%M:%S",
];

const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%m/%d/%Y"];

/// Counters describing what ingestion kept and dropped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub total_rows: usize,
    pub kept_rows: usize,
    pub dropped_customer_id: usize,
    pub dropped_invoice_date: usize,
    pub dropped_amount: usize,
}

impl IngestReport {
    /// Total number of discarded rows
    pub fn dropped(&self) -> usize {
        self.dropped_customer_id + self.dropped_invoice_date + self.dropped_amount
    }
}

/// Clean transaction table plus its ingestion counters
#[derive(Debug, Clone)]
pub struct IngestOutput {
    /// Typed frame with [`TRANSACTION_COLUMNS`]; `invoice_date` is a
    /// microsecond datetime
    pub transactions: DataFrame,
    pub report: IngestReport,
}

/// Datetime literal matching the `invoice_date` column
pub(crate) fn datetime_lit(value: NaiveDateTime) -> Expr {
    lit(value).cast(DataType::Datetime(TimeUnit::Microseconds, None))
}

/// Coerces a raw text table into typed transactions.
///
/// Rows whose customer id or invoice date cannot be parsed are discarded, never
/// repaired. Dropping is not fatal; the counts end up in the [`IngestReport`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TransactionIngestor;

impl TransactionIngestor {
    pub fn new() -> Self {
        Self
    }

    /// Coerce every raw row, keeping input order.
    ///
    /// `customer_id` and `invoice_date` must be present; any other column of
    /// [`TRANSACTION_COLUMNS`] may be missing and is then treated as null.
    pub fn ingest(&self, raw: DataFrame) -> crate::Result<IngestOutput> {
        let names = raw.get_column_names_owned();
        let has = |name: &str| names.iter().any(|n| n.as_str() == name);
        for required in [CUSTOMER_ID, INVOICE_DATE] {
            if !has(required) {
                return Err(ClvError::MissingColumn(required.to_string()));
            }
        }
        let absent: Vec<Expr> = TRANSACTION_COLUMNS
            .iter()
            .filter(|name| !has(name))
            .map(|name| lit(NULL).cast(DataType::String).alias(*name))
            .collect();

        let typed = raw
            .lazy()
            .with_columns(absent)
            .with_columns([
                customer_id_expr(),
                invoice_date_expr(),
                integral(text(QUANTITY).cast(DataType::Float64)).alias(QUANTITY),
                finite(text(UNIT_PRICE).cast(DataType::Float64)).alias(UNIT_PRICE),
                finite(text(LINE_TOTAL).cast(DataType::Float64)).alias(LINE_TOTAL),
                text(INVOICE_ID).fill_null(lit("")).alias(INVOICE_ID),
                text(PRODUCT_CODE).fill_null(lit("")).alias(PRODUCT_CODE),
                country_expr(),
            ])
            .with_columns([coalesce(&[
                col(LINE_TOTAL),
                col(QUANTITY).cast(DataType::Float64) * col(UNIT_PRICE),
            ])
            .alias(LINE_TOTAL)])
            .select(TRANSACTION_COLUMNS.map(col))
            .collect()?;

        let total_rows = typed.height();
        let with_customer = typed
            .lazy()
            .filter(col(CUSTOMER_ID).is_not_null())
            .collect()?;
        let with_date = with_customer
            .clone()
            .lazy()
            .filter(col(INVOICE_DATE).is_not_null())
            .collect()?;
        let transactions = with_date
            .clone()
            .lazy()
            .filter(col(LINE_TOTAL).is_not_null())
            .with_columns([
                col(QUANTITY).fill_null(lit(0i64)),
                col(UNIT_PRICE).fill_null(lit(0.0)),
            ])
            .collect()?;

        let report = IngestReport {
            total_rows,
            kept_rows: transactions.height(),
            dropped_customer_id: total_rows - with_customer.height(),
            dropped_invoice_date: with_customer.height() - with_date.height(),
            dropped_amount: with_date.height() - transactions.height(),
        };
        if report.dropped() > 0 {
            warn!(
                dropped = report.dropped(),
                bad_customer_id = report.dropped_customer_id,
                bad_invoice_date = report.dropped_invoice_date,
                bad_amount = report.dropped_amount,
                "Discarded unparsable transaction rows"
            );
        }
        info!(
            kept = report.kept_rows,
            total = report.total_rows,
            "Ingested transactions"
        );

        Ok(IngestOutput {
            transactions,
            report,
        })
    }
}

/// Trimmed text view of a column
fn text(name: &str) -> Expr {
    col(name)
        .cast(DataType::String)
        .str()
        .strip_chars(lit(NULL))
}

fn finite(value: Expr) -> Expr {
    when(value.clone().is_finite())
        .then(value)
        .otherwise(lit(NULL).cast(DataType::Float64))
}

/// Whole-number floats as `Int64`, anything else null
fn integral(value: Expr) -> Expr {
    when(value.clone().eq(value.clone().floor()))
        .then(value.cast(DataType::Int64))
        .otherwise(lit(NULL).cast(DataType::Int64))
}

/// Integer ids, also accepting integral decimals such as `17850.0`
fn customer_id_expr() -> Expr {
    integral(text(CUSTOMER_ID).cast(DataType::Float64)).alias(CUSTOMER_ID)
}

/// First layout that parses wins; bare dates map to midnight
fn invoice_date_expr() -> Expr {
    let options = |format: &str| StrptimeOptions {
        format: Some(format.into()),
        strict: false,
        exact: true,
        cache: true,
    };
    let datetime = DataType::Datetime(TimeUnit::Microseconds, None);

    let mut candidates: Vec<Expr> = DATE_TIME_FORMATS
        .iter()
        .map(|format| {
            text(INVOICE_DATE).str().to_datetime(
                Some(TimeUnit::Microseconds),
                None,
                options(format),
                lit("raise"),
            )
        })
        .collect();
    candidates.extend(DATE_FORMATS.iter().map(|format| {
        text(INVOICE_DATE)
            .str()
            .to_date(options(format))
            .cast(datetime.clone())
    }));

    coalesce(&candidates).alias(INVOICE_DATE)
}

fn country_expr() -> Expr {
    let country = text(COUNTRY).fill_null(lit(""));
    when(country.clone().eq(lit("")))
        .then(lit(UNKNOWN_COUNTRY))
        .otherwise(country)
        .alias(COUNTRY)
}
