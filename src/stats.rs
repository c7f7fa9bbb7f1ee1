//! Descriptive statistics over the in-memory table.
//!
//! Everything here is a pure read on a `DataFrame`; nothing mutates session
//! state. Disk-backed sessions do not get these views.

use crate::table::ops::{is_numeric, quantile_sorted, row_keys};
use crate::{AlchemistError, Result};
use polars::prelude::*;
use serde_json::{json, Value};

/// Resolve an optional column subset against the frame, keeping frame order
/// for `None`. An unknown name is a validation error.
fn selected_columns<'a>(df: &'a DataFrame, columns: Option<&[String]>) -> Result<Vec<&'a Column>> {
    match columns {
        None => Ok(df.get_columns().iter().collect()),
        Some(names) => names
            .iter()
            .map(|name| {
                df.get_columns()
                    .iter()
                    .find(|c| c.name().as_str() == name)
                    .ok_or_else(|| {
                        AlchemistError::Validation(format!("column '{}' not found", name))
                    })
            })
            .collect(),
    }
}

fn check_method(method: Option<&str>, supported: &str) -> Result<()> {
    match method {
        None => Ok(()),
        Some(m) if m.eq_ignore_ascii_case(supported) => Ok(()),
        Some(other) => Err(AlchemistError::Validation(format!(
            "unsupported method '{}', only '{}' is available",
            other, supported
        ))),
    }
}

/// Per-column summary for numeric columns: count, mean, std, min, quartiles,
/// max. Matches the shape of a classic `describe()` table.
///
/// `columns` restricts the scan; non-numeric columns are skipped either way.
pub fn describe(df: &DataFrame, columns: Option<&[String]>) -> Result<Value> {
    let mut summary = serde_json::Map::new();
    for column in selected_columns(df, columns)? {
        if !is_numeric(column.dtype()) {
            continue;
        }
        let values = numeric_values(column.as_materialized_series())?;
        if values.is_empty() {
            summary.insert(
                column.name().to_string(),
                json!({ "count": 0 }),
            );
            continue;
        }
        let mut sorted = values.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let count = values.len();
        let mean = values.iter().sum::<f64>() / count as f64;
        let std = sample_std(&values, mean);
        summary.insert(
            column.name().to_string(),
            json!({
                "count": count,
                "mean": mean,
                "std": std,
                "min": sorted[0],
                "25%": quantile_sorted(&sorted, 0.25),
                "50%": quantile_sorted(&sorted, 0.5),
                "75%": quantile_sorted(&sorted, 0.75),
                "max": sorted[count - 1],
            }),
        );
    }
    Ok(Value::Object(summary))
}

/// Unique counts and most frequent values for string columns.
pub fn categorical(df: &DataFrame, columns: Option<&[String]>, top_n: usize) -> Result<Value> {
    let mut summary = serde_json::Map::new();
    for column in selected_columns(df, columns)? {
        if column.dtype() != &DataType::String {
            continue;
        }
        let series = column.as_materialized_series();
        let strings = series.str()?;
        let mut counts: std::collections::HashMap<&str, u64> = std::collections::HashMap::new();
        for value in strings.into_iter().flatten() {
            *counts.entry(value).or_insert(0) += 1;
        }
        let mut pairs: Vec<(&str, u64)> = counts.into_iter().collect();
        pairs.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        let top_values: Vec<Value> = pairs
            .iter()
            .take(top_n)
            .map(|(value, count)| json!({ "value": value, "count": count }))
            .collect();
        summary.insert(
            column.name().to_string(),
            json!({
                "unique_count": pairs.len(),
                "null_count": column.null_count(),
                "top_values": top_values,
            }),
        );
    }
    Ok(Value::Object(summary))
}

/// Pairwise Pearson correlation over the numeric columns.
///
/// Each pair uses only the rows where both values are present. Pairs with
/// fewer than two such rows, or with a zero-variance side, report null.
pub fn correlate(
    df: &DataFrame,
    columns: Option<&[String]>,
    method: Option<&str>,
) -> Result<Value> {
    check_method(method, "pearson")?;
    let mut names: Vec<String> = Vec::new();
    let mut samples: Vec<Vec<Option<f64>>> = Vec::new();
    for column in selected_columns(df, columns)? {
        if !is_numeric(column.dtype()) {
            continue;
        }
        names.push(column.name().to_string());
        samples.push(optional_values(column.as_materialized_series())?);
    }

    let mut matrix = serde_json::Map::new();
    for (i, left) in names.iter().enumerate() {
        let mut row = serde_json::Map::new();
        for (j, right) in names.iter().enumerate() {
            let value = pearson(&samples[i], &samples[j])
                .map(|r| json!(r))
                .unwrap_or(Value::Null);
            row.insert(right.clone(), value);
        }
        matrix.insert(left.clone(), Value::Object(row));
    }
    Ok(json!({
        "columns": names,
        "matrix": matrix,
    }))
}

/// Dataset health summary: per-column missing ratios, duplicate row count,
/// and columns holding a single distinct value.
pub fn quality_report(df: &DataFrame) -> Result<Value> {
    let rows = df.height();

    let mut missing = serde_json::Map::new();
    let mut missing_cells = 0usize;
    let mut constant_columns: Vec<String> = Vec::new();
    for column in df.get_columns() {
        let nulls = column.null_count();
        missing_cells += nulls;
        let ratio = if rows == 0 {
            0.0
        } else {
            nulls as f64 / rows as f64
        };
        missing.insert(
            column.name().to_string(),
            json!({ "count": nulls, "ratio": ratio }),
        );

        let series = column.as_materialized_series();
        if rows > 0 && series.n_unique()? <= 1 {
            constant_columns.push(column.name().to_string());
        }
    }

    let keys = row_keys(df)?;
    let mut seen = std::collections::HashSet::with_capacity(keys.len());
    let duplicate_rows = keys.iter().filter(|k| !seen.insert(k.as_str())).count();

    Ok(json!({
        "rows": rows,
        "columns": df.width(),
        "missing_cells": missing_cells,
        "missing": missing,
        "duplicate_rows": duplicate_rows,
        "constant_columns": constant_columns,
    }))
}

/// IQR outlier scan over every numeric column.
///
/// Reports the fence bounds and the number of values outside them; columns
/// without numeric values are skipped.
pub fn detect_outliers(
    df: &DataFrame,
    columns: Option<&[String]>,
    method: Option<&str>,
) -> Result<Value> {
    check_method(method, "iqr")?;
    let mut report = serde_json::Map::new();
    for column in selected_columns(df, columns)? {
        if !is_numeric(column.dtype()) {
            continue;
        }
        let values = numeric_values(column.as_materialized_series())?;
        if values.is_empty() {
            continue;
        }
        let mut sorted = values.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let q1 = quantile_sorted(&sorted, 0.25);
        let q3 = quantile_sorted(&sorted, 0.75);
        let iqr = q3 - q1;
        let lower = q1 - 1.5 * iqr;
        let upper = q3 + 1.5 * iqr;
        let outliers = values.iter().filter(|v| **v < lower || **v > upper).count();

        report.insert(
            column.name().to_string(),
            json!({
                "lower_bound": lower,
                "upper_bound": upper,
                "outlier_count": outliers,
            }),
        );
    }
    Ok(Value::Object(report))
}

fn numeric_values(series: &Series) -> Result<Vec<f64>> {
    let cast = series.cast(&DataType::Float64)?;
    Ok(cast
        .f64()?
        .into_iter()
        .flatten()
        .filter(|v| !v.is_nan())
        .collect())
}

fn optional_values(series: &Series) -> Result<Vec<Option<f64>>> {
    let cast = series.cast(&DataType::Float64)?;
    Ok(cast
        .f64()?
        .into_iter()
        .map(|v| v.filter(|x| !x.is_nan()))
        .collect())
}

fn sample_std(values: &[f64], mean: f64) -> Value {
    if values.len() < 2 {
        return Value::Null;
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    json!(var.sqrt())
}

fn pearson(left: &[Option<f64>], right: &[Option<f64>]) -> Option<f64> {
    let pairs: Vec<(f64, f64)> = left
        .iter()
        .zip(right)
        .filter_map(|(l, r)| Some(((*l)?, (*r)?)))
        .collect();
    if pairs.len() < 2 {
        return None;
    }

    let n = pairs.len() as f64;
    let mean_l = pairs.iter().map(|(l, _)| l).sum::<f64>() / n;
    let mean_r = pairs.iter().map(|(_, r)| r).sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_l = 0.0;
    let mut var_r = 0.0;
    for (l, r) in &pairs {
        cov += (l - mean_l) * (r - mean_r);
        var_l += (l - mean_l).powi(2);
        var_r += (r - mean_r).powi(2);
    }
    if var_l == 0.0 || var_r == 0.0 {
        return None;
    }
    Some(cov / (var_l.sqrt() * var_r.sqrt()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn close(value: &Value, expected: f64) -> bool {
        value.as_f64().map(|v| (v - expected).abs() < 1e-9) == Some(true)
    }

    #[test]
    fn test_describe_numeric_columns() {
        let df = df! {
            "x" => [1.0f64, 2.0, 3.0, 4.0, 5.0],
            "label" => ["a", "b", "c", "d", "e"],
        }
        .unwrap();
        let summary = describe(&df, None).unwrap();
        let x = &summary["x"];
        assert_eq!(x["count"], json!(5));
        assert!(close(&x["mean"], 3.0));
        assert!(close(&x["std"], 2.5f64.sqrt()));
        assert!(close(&x["min"], 1.0));
        assert!(close(&x["50%"], 3.0));
        assert!(close(&x["max"], 5.0));
        assert!(summary.get("label").is_none());
    }

    #[test]
    fn test_describe_skips_nulls() {
        let df = df! {
            "x" => [Some(1.0f64), None, Some(3.0)],
        }
        .unwrap();
        let summary = describe(&df, None).unwrap();
        assert_eq!(summary["x"]["count"], json!(2));
        assert!(close(&summary["x"]["mean"], 2.0));
    }

    #[test]
    fn test_describe_single_value_has_null_std() {
        let df = df! { "x" => [7.0f64] }.unwrap();
        let summary = describe(&df, None).unwrap();
        assert!(summary["x"]["std"].is_null());
    }

    #[test]
    fn test_describe_column_subset() {
        let df = df! {
            "x" => [1.0f64, 2.0, 3.0],
            "y" => [10.0f64, 20.0, 30.0],
        }
        .unwrap();
        let columns = vec!["y".to_string()];
        let summary = describe(&df, Some(&columns)).unwrap();
        assert!(summary.get("x").is_none());
        assert!(close(&summary["y"]["mean"], 20.0));
    }

    #[test]
    fn test_unknown_column_is_rejected() {
        let df = df! { "x" => [1.0f64, 2.0] }.unwrap();
        let columns = vec!["missing".to_string()];
        let err = describe(&df, Some(&columns)).unwrap_err();
        assert!(matches!(err, crate::AlchemistError::Validation(_)));
    }

    #[test]
    fn test_correlate_rejects_unknown_method() {
        let df = df! {
            "x" => [1.0f64, 2.0],
            "y" => [2.0f64, 4.0],
        }
        .unwrap();
        let err = correlate(&df, None, Some("spearman")).unwrap_err();
        assert!(matches!(err, crate::AlchemistError::Validation(_)));
        // Case-insensitive match on the supported method.
        assert!(correlate(&df, None, Some("Pearson")).is_ok());
    }

    #[test]
    fn test_detect_outliers_rejects_unknown_method() {
        let df = df! { "x" => [1.0f64, 2.0, 3.0] }.unwrap();
        let err = detect_outliers(&df, None, Some("zscore")).unwrap_err();
        assert!(matches!(err, crate::AlchemistError::Validation(_)));
    }

    #[test]
    fn test_categorical_top_values() {
        let df = df! {
            "city" => [Some("Oslo"), Some("Oslo"), Some("Bergen"), None],
        }
        .unwrap();
        let summary = categorical(&df, None, 5).unwrap();
        let city = &summary["city"];
        assert_eq!(city["unique_count"], json!(2));
        assert_eq!(city["null_count"], json!(1));
        assert_eq!(city["top_values"][0], json!({"value": "Oslo", "count": 2}));
    }

    #[test]
    fn test_correlate_perfectly_linear() {
        let df = df! {
            "x" => [1.0f64, 2.0, 3.0],
            "y" => [2.0f64, 4.0, 6.0],
            "z" => [3.0f64, 1.0, 2.0],
        }
        .unwrap();
        let result = correlate(&df, None, None).unwrap();
        assert!(close(&result["matrix"]["x"]["y"], 1.0));
        assert!(close(&result["matrix"]["x"]["x"], 1.0));
        let xz = result["matrix"]["x"]["z"].as_f64().unwrap();
        assert!(xz.abs() < 1.0);
    }

    #[test]
    fn test_correlate_constant_column_is_null() {
        let df = df! {
            "x" => [1.0f64, 2.0, 3.0],
            "flat" => [5.0f64, 5.0, 5.0],
        }
        .unwrap();
        let result = correlate(&df, None, None).unwrap();
        assert!(result["matrix"]["x"]["flat"].is_null());
    }

    #[test]
    fn test_correlate_uses_pairwise_complete_rows() {
        let df = df! {
            "x" => [Some(1.0f64), Some(2.0), Some(3.0), Some(100.0)],
            "y" => [Some(2.0f64), Some(4.0), Some(6.0), None],
        }
        .unwrap();
        let result = correlate(&df, None, None).unwrap();
        assert!(close(&result["matrix"]["x"]["y"], 1.0));
    }

    #[test]
    fn test_quality_report() {
        let df = df! {
            "a" => [Some(1i64), Some(1), None, Some(1)],
            "b" => [Some("x"), Some("x"), Some("y"), Some("x")],
            "flat" => [Some(9i64), Some(9), Some(9), Some(9)],
        }
        .unwrap();
        let report = quality_report(&df).unwrap();
        assert_eq!(report["rows"], json!(4));
        assert_eq!(report["missing_cells"], json!(1));
        assert_eq!(report["missing"]["a"]["count"], json!(1));
        assert!(close(&report["missing"]["a"]["ratio"], 0.25));
        // Rows 0, 1, 3 are identical so two of them are duplicates.
        assert_eq!(report["duplicate_rows"], json!(2));
        assert_eq!(report["constant_columns"], json!(["flat"]));
    }

    #[test]
    fn test_detect_outliers_iqr() {
        let df = df! {
            "x" => [1.0f64, 2.0, 3.0, 4.0, 5.0, 100.0],
            "label" => ["a", "b", "c", "d", "e", "f"],
        }
        .unwrap();
        let report = detect_outliers(&df, None, None).unwrap();
        assert_eq!(report["x"]["outlier_count"], json!(1));
        assert!(report.get("label").is_none());
    }

    #[test]
    fn test_detect_outliers_empty_column_skipped() {
        let df = df! {
            "x" => [None::<f64>, None, None],
        }
        .unwrap();
        let report = detect_outliers(&df, None, None).unwrap();
        assert!(report.get("x").is_none());
    }
}
