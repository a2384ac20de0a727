//! CSV input and output using Polars
//!
//! Transactions are read with every column as text; typing happens in
//! [`crate::ingest`] so that malformed values are counted instead of aborting
//! the load.

use crate::error::ClvError;
use crate::features::CustomerFeatureVector;
use crate::ingest::{
    COUNTRY, CUSTOMER_ID, INVOICE_DATE, INVOICE_ID, LINE_TOTAL, PRODUCT_CODE, QUANTITY,
    UNIT_PRICE,
};
use crate::segment::{DecileProfile, ScoredCustomer};
use polars::prelude::*;
use std::fs::File;
use std::path::Path;
use tracing::{debug, info};

/// Accepted header spellings per field, canonical name first
const HEADER_ALIASES: [&[&str]; 8] = [
    &[CUSTOMER_ID, "CustomerID", "Customer ID"],
    &[INVOICE_ID, "InvoiceNo", "Invoice"],
    &[INVOICE_DATE, "InvoiceDate"],
    &[PRODUCT_CODE, "StockCode"],
    &[QUANTITY, "Quantity"],
    &[UNIT_PRICE, "UnitPrice", "Price"],
    &[LINE_TOTAL, "TotalAmount"],
    &[COUNTRY, "Country"],
];

/// Load a transaction CSV as raw text columns
///
/// # Arguments
/// * `path` - Path to a CSV file with a header row
///
/// # Returns
/// * A frame whose columns are renamed to the canonical names of
///   [`crate::ingest::TRANSACTION_COLUMNS`]; absent optional columns are left out
pub fn load_transactions(path: impl AsRef<Path>) -> crate::Result<DataFrame> {
    let path = path.as_ref();
    let df = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .try_into_reader_with_file_path(Some(path.to_path_buf()))?
        .finish()?;

    let mut columns = Vec::with_capacity(HEADER_ALIASES.len());
    for aliases in HEADER_ALIASES {
        let canonical = aliases[0];
        match find_column(&df, aliases) {
            Some(found) => columns.push(col(found).alias(canonical)),
            None if canonical == CUSTOMER_ID || canonical == INVOICE_DATE => {
                return Err(ClvError::MissingColumn(canonical.to_string()));
            }
            None => debug!(column = canonical, "Optional column absent"),
        }
    }

    let raw = df.lazy().select(columns).collect()?;
    info!(path = %path.display(), rows = raw.height(), "Loaded transactions");
    Ok(raw)
}

fn find_column<'a>(df: &DataFrame, aliases: &[&'a str]) -> Option<&'a str> {
    let names = df.get_column_names();
    aliases
        .iter()
        .copied()
        .find(|alias| names.iter().any(|n| n.as_str() == *alias))
}

fn write_csv(mut df: DataFrame, path: &Path) -> crate::Result<()> {
    let mut file = File::create(path)?;
    CsvWriter::new(&mut file).finish(&mut df)?;
    debug!(path = %path.display(), rows = df.height(), "Wrote CSV");
    Ok(())
}

/// Write one row per customer with every engineered feature
pub fn write_feature_table(
    features: &[CustomerFeatureVector],
    path: impl AsRef<Path>,
) -> crate::Result<()> {
    let ids: Vec<i64> = features.iter().map(|f| f.customer_id).collect();
    let mut columns = vec![Column::new("customer_id".into(), ids)];

    let rows: Vec<[f64; 12]> = features.iter().map(|f| f.numeric_values()).collect();
    for (j, name) in crate::features::NUMERIC_FEATURES.iter().enumerate() {
        let values: Vec<f64> = rows.iter().map(|r| r[j]).collect();
        columns.push(Column::new((*name).into(), values));
    }

    let countries: Vec<String> = features.iter().map(|f| f.country.clone()).collect();
    columns.push(Column::new("country".into(), countries));

    write_csv(DataFrame::new(columns)?, path.as_ref())
}

/// Write predictions with decile and RFM labels
pub fn write_scored_customers(
    customers: &[ScoredCustomer],
    path: impl AsRef<Path>,
) -> crate::Result<()> {
    let rfm = |f: fn(&crate::segment::RfmScore) -> u8| -> Vec<Option<i32>> {
        customers
            .iter()
            .map(|c| c.rfm.as_ref().map(|r| i32::from(f(r))))
            .collect()
    };

    let df = DataFrame::new(vec![
        Column::new(
            "customer_id".into(),
            customers.iter().map(|c| c.customer_id).collect::<Vec<i64>>(),
        ),
        Column::new(
            "predicted_value".into(),
            customers.iter().map(|c| c.predicted_value).collect::<Vec<f64>>(),
        ),
        Column::new(
            "actual_value".into(),
            customers.iter().map(|c| c.actual_value).collect::<Vec<Option<f64>>>(),
        ),
        Column::new(
            "decile".into(),
            customers
                .iter()
                .map(|c| c.decile.map(i32::from))
                .collect::<Vec<Option<i32>>>(),
        ),
        Column::new("r_score".into(), rfm(|r| r.recency)),
        Column::new("f_score".into(), rfm(|r| r.frequency)),
        Column::new("m_score".into(), rfm(|r| r.monetary)),
        Column::new(
            "rfm_code".into(),
            customers
                .iter()
                .map(|c| c.rfm.map(|r| r.code()))
                .collect::<Vec<Option<String>>>(),
        ),
        Column::new(
            "at_risk".into(),
            customers
                .iter()
                .map(|c| c.rfm.is_some_and(|r| r.is_at_risk()))
                .collect::<Vec<bool>>(),
        ),
    ])?;

    write_csv(df, path.as_ref())
}

/// Write the per-decile profile table
pub fn write_decile_profile(profile: &[DecileProfile], path: impl AsRef<Path>) -> crate::Result<()> {
    let df = DataFrame::new(vec![
        Column::new(
            "decile".into(),
            profile.iter().map(|p| i32::from(p.decile)).collect::<Vec<i32>>(),
        ),
        Column::new(
            "customers".into(),
            profile.iter().map(|p| p.customers as i64).collect::<Vec<i64>>(),
        ),
        Column::new(
            "mean_predicted".into(),
            profile.iter().map(|p| p.mean_predicted).collect::<Vec<f64>>(),
        ),
        Column::new(
            "mean_actual".into(),
            profile.iter().map(|p| p.mean_actual).collect::<Vec<Option<f64>>>(),
        ),
        Column::new(
            "mean_recency".into(),
            profile.iter().map(|p| p.mean_recency).collect::<Vec<f64>>(),
        ),
        Column::new(
            "mean_frequency".into(),
            profile.iter().map(|p| p.mean_frequency).collect::<Vec<f64>>(),
        ),
        Column::new(
            "mean_monetary".into(),
            profile.iter().map(|p| p.mean_monetary).collect::<Vec<f64>>(),
        ),
    ])?;

    write_csv(df, path.as_ref())
}
