//! Cleaning, transform, and filter operations over the in-memory table.
//!
//! Operation requests deserialize into closed enums, so an unknown operation
//! type is rejected at the boundary instead of being silently skipped. Each
//! operation application returns a JSON result record describing what changed.
//!
//! Error policy inside a batch: an operation-internal failure on one item
//! (a failed type coercion, say) is captured in that operation's result
//! record, while data-access errors such as an unknown column abort the whole
//! batch.

use crate::{expr, AlchemistError, Result};
use polars::chunked_array::cast::CastOptions;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write as _;

/// A single cleaning operation.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CleanOp {
    RemoveDuplicates,
    FillMissing {
        column: String,
        #[serde(default)]
        method: FillMethod,
        #[serde(default)]
        value: Value,
    },
    RemoveMissing {
        #[serde(default)]
        columns: Vec<String>,
        #[serde(default)]
        how: MissingHow,
    },
    ConvertType {
        column: String,
        target_type: TargetType,
    },
    RemoveOutliers {
        column: String,
        #[serde(default)]
        method: OutlierMethod,
    },
    CleanText {
        #[serde(default)]
        columns: Vec<String>,
        #[serde(default)]
        text_operations: Vec<TextOperation>,
        #[serde(default)]
        case_type: CaseType,
    },
    RemoveEmpty {
        #[serde(default)]
        target: EmptyTarget,
    },
}

impl CleanOp {
    pub fn name(&self) -> &'static str {
        match self {
            CleanOp::RemoveDuplicates => "remove_duplicates",
            CleanOp::FillMissing { .. } => "fill_missing",
            CleanOp::RemoveMissing { .. } => "remove_missing",
            CleanOp::ConvertType { .. } => "convert_type",
            CleanOp::RemoveOutliers { .. } => "remove_outliers",
            CleanOp::CleanText { .. } => "clean_text",
            CleanOp::RemoveEmpty { .. } => "remove_empty",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillMethod {
    #[default]
    Mean,
    Median,
    Mode,
    Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingHow {
    #[default]
    Any,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutlierMethod {
    #[default]
    Iqr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyTarget {
    #[default]
    Rows,
    Columns,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TextOperation {
    TrimWhitespace,
    NormalizeCase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseType {
    #[default]
    Lower,
    Upper,
    Title,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    #[serde(alias = "int64", alias = "integer")]
    Int,
    #[serde(alias = "float64")]
    Float,
    #[serde(alias = "string", alias = "str", alias = "text")]
    String,
    #[serde(alias = "boolean")]
    Bool,
}

impl TargetType {
    fn dtype(self) -> DataType {
        match self {
            TargetType::Int => DataType::Int64,
            TargetType::Float => DataType::Float64,
            TargetType::String => DataType::String,
            TargetType::Bool => DataType::Boolean,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            TargetType::Int => "int",
            TargetType::Float => "float",
            TargetType::String => "string",
            TargetType::Bool => "bool",
        }
    }
}

/// A single transform operation.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransformOp {
    CreateColumn {
        new_column: String,
        expression: String,
    },
    RenameColumn {
        old_name: String,
        new_name: String,
    },
    DropColumn {
        #[serde(default)]
        columns: Vec<String>,
    },
    Sort {
        columns: Vec<String>,
        #[serde(default)]
        ascending: Ascending,
    },
    GroupAggregate {
        group_by: Vec<String>,
        aggregations: BTreeMap<String, AggSpec>,
    },
}

/// Sort direction: a single flag for every column, or one flag per column.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Ascending {
    Single(bool),
    PerColumn(Vec<bool>),
}

impl Default for Ascending {
    fn default() -> Self {
        Ascending::Single(true)
    }
}

/// One or more aggregations over a single column.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AggSpec {
    Single(AggFn),
    Many(Vec<AggFn>),
}

impl AggSpec {
    fn functions(&self) -> Vec<AggFn> {
        match self {
            AggSpec::Single(f) => vec![*f],
            AggSpec::Many(fs) => fs.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggFn {
    Sum,
    Mean,
    Median,
    Min,
    Max,
    Count,
    First,
    Last,
    Std,
    Var,
    Nunique,
}

impl AggFn {
    fn as_str(self) -> &'static str {
        match self {
            AggFn::Sum => "sum",
            AggFn::Mean => "mean",
            AggFn::Median => "median",
            AggFn::Min => "min",
            AggFn::Max => "max",
            AggFn::Count => "count",
            AggFn::First => "first",
            AggFn::Last => "last",
            AggFn::Std => "std",
            AggFn::Var => "var",
            AggFn::Nunique => "nunique",
        }
    }

    fn apply(self, e: Expr) -> Expr {
        match self {
            AggFn::Sum => e.sum(),
            AggFn::Mean => e.mean(),
            AggFn::Median => e.median(),
            AggFn::Min => e.min(),
            AggFn::Max => e.max(),
            AggFn::Count => e.count(),
            AggFn::First => e.first(),
            AggFn::Last => e.last(),
            AggFn::Std => e.std(1),
            AggFn::Var => e.var(1),
            AggFn::Nunique => e.n_unique(),
        }
    }
}

/// A single filter predicate; predicates are applied as a conjunction in the
/// order given.
#[derive(Debug, Clone, Deserialize)]
pub struct FilterPredicate {
    pub column: String,
    pub operator: FilterOperator,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    GreaterThan,
    LessThan,
}

impl FilterOperator {
    pub fn as_str(self) -> &'static str {
        match self {
            FilterOperator::Equals => "equals",
            FilterOperator::NotEquals => "not_equals",
            FilterOperator::Contains => "contains",
            FilterOperator::NotContains => "not_contains",
            FilterOperator::GreaterThan => "greater_than",
            FilterOperator::LessThan => "less_than",
        }
    }
}

fn ensure_column(df: &DataFrame, name: &str) -> Result<()> {
    if df.get_column_names().iter().any(|c| c.as_str() == name) {
        Ok(())
    } else {
        Err(AlchemistError::NotFound(format!(
            "column '{}' does not exist",
            name
        )))
    }
}

pub(crate) fn is_numeric(dtype: &DataType) -> bool {
    dtype.is_primitive_numeric()
}

/// Linear-interpolation quantile over an ascending-sorted, non-empty slice.
pub(crate) fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.len() == 1 {
        return sorted[0];
    }
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

/// One stable key per row, used for duplicate detection.
pub(crate) fn row_keys(df: &DataFrame) -> Result<Vec<String>> {
    let columns = df.get_columns();
    let mut keys = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        let mut key = String::new();
        for column in columns {
            let value = column.get(i)?;
            write!(key, "{:?}\u{0}", value)
                .map_err(|e| AlchemistError::Internal(e.to_string()))?;
        }
        keys.push(key);
    }
    Ok(keys)
}

#[derive(Debug, Clone, PartialEq)]
enum FillValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl FillValue {
    fn to_expr(&self) -> Expr {
        match self {
            FillValue::Int(v) => lit(*v),
            FillValue::Float(v) => lit(*v),
            FillValue::Bool(v) => lit(*v),
            FillValue::Text(v) => lit(v.clone()),
        }
    }
}

fn fill_from_json(value: &Value) -> Option<FillValue> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(FillValue::Bool(*b)),
        Value::Number(n) => n
            .as_i64()
            .map(FillValue::Int)
            .or_else(|| n.as_f64().map(FillValue::Float)),
        Value::String(s) => Some(FillValue::Text(s.clone())),
        other => Some(FillValue::Text(other.to_string())),
    }
}

fn fill_from_any(value: &AnyValue) -> Option<FillValue> {
    match value {
        AnyValue::Null => None,
        AnyValue::Boolean(b) => Some(FillValue::Bool(*b)),
        AnyValue::Int8(v) => Some(FillValue::Int(*v as i64)),
        AnyValue::Int16(v) => Some(FillValue::Int(*v as i64)),
        AnyValue::Int32(v) => Some(FillValue::Int(*v as i64)),
        AnyValue::Int64(v) => Some(FillValue::Int(*v)),
        AnyValue::UInt8(v) => Some(FillValue::Int(*v as i64)),
        AnyValue::UInt16(v) => Some(FillValue::Int(*v as i64)),
        AnyValue::UInt32(v) => Some(FillValue::Int(*v as i64)),
        AnyValue::UInt64(v) => Some(FillValue::Int(*v as i64)),
        AnyValue::Float32(v) => Some(FillValue::Float(*v as f64)),
        AnyValue::Float64(v) => Some(FillValue::Float(*v)),
        AnyValue::String(s) => Some(FillValue::Text(s.to_string())),
        AnyValue::StringOwned(s) => Some(FillValue::Text(s.to_string())),
        _ => None,
    }
}

/// Most frequent non-null value; ties broken by the smaller rendered value.
fn series_mode(series: &Series) -> Result<Option<FillValue>> {
    let mut counts: HashMap<String, (u64, FillValue)> = HashMap::new();
    for i in 0..series.len() {
        let any_value = series.get(i)?;
        let Some(fill) = fill_from_any(&any_value) else {
            continue;
        };
        let key = format!("{:?}", any_value);
        counts.entry(key).or_insert((0, fill)).0 += 1;
    }

    let mut best: Option<(u64, String, FillValue)> = None;
    for (key, (count, fill)) in counts {
        let better = match &best {
            None => true,
            Some((best_count, best_key, _)) => {
                count > *best_count || (count == *best_count && key < *best_key)
            }
        };
        if better {
            best = Some((count, key, fill));
        }
    }
    Ok(best.map(|(_, _, fill)| fill))
}

fn null_masks(df: &DataFrame, columns: &[String]) -> Result<Vec<Vec<bool>>> {
    let mut masks = Vec::with_capacity(columns.len());
    for name in columns {
        let series = df.column(name)?.as_materialized_series().clone();
        masks.push(series.is_null().into_no_null_iter().collect());
    }
    Ok(masks)
}

fn keep_rows(df: &DataFrame, keep: &[bool]) -> Result<DataFrame> {
    let mask = BooleanChunked::from_slice("keep".into(), keep);
    df.filter(&mask).map_err(AlchemistError::from)
}

fn all_column_names(df: &DataFrame) -> Vec<String> {
    df.get_column_names()
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_alpha = false;
    for c in s.chars() {
        if c.is_alphabetic() {
            if prev_alpha {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            prev_alpha = true;
        } else {
            out.push(c);
            prev_alpha = false;
        }
    }
    out
}

/// Apply one cleaning operation in place, returning its result record.
pub fn apply_clean_op(df: &mut DataFrame, op: &CleanOp) -> Result<Value> {
    match op {
        CleanOp::RemoveDuplicates => {
            let before = df.height();
            let keys = row_keys(df)?;
            let mut seen = HashSet::with_capacity(keys.len());
            let keep: Vec<bool> = keys.into_iter().map(|k| seen.insert(k)).collect();
            *df = keep_rows(df, &keep)?;
            Ok(json!({
                "operation": "remove_duplicates",
                "removed": before - df.height(),
            }))
        }

        CleanOp::FillMissing {
            column,
            method,
            value,
        } => {
            ensure_column(df, column)?;
            let series = df.column(column)?.as_materialized_series().clone();
            let numeric = is_numeric(series.dtype());

            let fill = match method {
                FillMethod::Mean if numeric => series.mean().map(FillValue::Float),
                FillMethod::Median if numeric => series.median().map(FillValue::Float),
                FillMethod::Mode => series_mode(&series)?.or_else(|| fill_from_json(value)),
                _ => fill_from_json(value),
            };
            let fill = fill.ok_or_else(|| {
                AlchemistError::Validation(format!(
                    "no fill value available for column '{}'",
                    column
                ))
            })?;

            let missing_before = series.null_count();
            *df = df
                .clone()
                .lazy()
                .with_column(col(column.as_str()).fill_null(fill.to_expr()))
                .collect()?;
            let missing_after = df.column(column)?.null_count();

            Ok(json!({
                "operation": "fill_missing",
                "column": column,
                "filled": missing_before - missing_after,
            }))
        }

        CleanOp::RemoveMissing { columns, how } => {
            let subset = if columns.is_empty() {
                all_column_names(df)
            } else {
                for name in columns {
                    ensure_column(df, name)?;
                }
                columns.clone()
            };

            let before = df.height();
            let masks = null_masks(df, &subset)?;
            let keep: Vec<bool> = (0..df.height())
                .map(|i| match how {
                    // any: drop when any subset column is missing
                    MissingHow::Any => masks.iter().all(|m| !m[i]),
                    // all: drop only when every subset column is missing
                    MissingHow::All => masks.is_empty() || masks.iter().any(|m| !m[i]),
                })
                .collect();
            *df = keep_rows(df, &keep)?;

            Ok(json!({
                "operation": "remove_missing",
                "removed": before - df.height(),
            }))
        }

        CleanOp::ConvertType {
            column,
            target_type,
        } => {
            ensure_column(df, column)?;
            let series = df.column(column)?.as_materialized_series().clone();
            let from_type = series.dtype().to_string();

            match series.cast_with_options(&target_type.dtype(), CastOptions::Strict) {
                Ok(cast) => {
                    df.with_column(cast)?;
                    Ok(json!({
                        "operation": "convert_type",
                        "column": column,
                        "from_type": from_type,
                        "to_type": target_type.as_str(),
                    }))
                }
                // Captured per-item; the batch continues and the column is
                // left untouched.
                Err(e) => Ok(json!({
                    "operation": "convert_type",
                    "column": column,
                    "error": e.to_string(),
                })),
            }
        }

        CleanOp::RemoveOutliers { column, method } => {
            ensure_column(df, column)?;
            let series = df.column(column)?.as_materialized_series().clone();
            if !is_numeric(series.dtype()) {
                return Err(AlchemistError::Validation(format!(
                    "outlier removal requires a numeric column, '{}' is {}",
                    column,
                    series.dtype()
                )));
            }

            let OutlierMethod::Iqr = method;
            let cast = series.cast(&DataType::Float64)?;
            let values = cast.f64()?;
            let mut sorted: Vec<f64> = values
                .into_iter()
                .flatten()
                .filter(|v| !v.is_nan())
                .collect();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

            let before = df.height();
            if !sorted.is_empty() {
                let q1 = quantile_sorted(&sorted, 0.25);
                let q3 = quantile_sorted(&sorted, 0.75);
                let iqr = q3 - q1;
                let lower = q1 - 1.5 * iqr;
                let upper = q3 + 1.5 * iqr;

                // Missing values fail the bounds check and are dropped too.
                let keep: Vec<bool> = values
                    .into_iter()
                    .map(|v| v.is_some_and(|x| x >= lower && x <= upper))
                    .collect();
                *df = keep_rows(df, &keep)?;
            }

            Ok(json!({
                "operation": "remove_outliers",
                "column": column,
                "method": "iqr",
                "removed": before - df.height(),
            }))
        }

        CleanOp::CleanText {
            columns,
            text_operations,
            case_type,
        } => {
            for name in columns {
                // Unknown columns are skipped, matching the lenient contract
                // of this operation.
                if ensure_column(df, name).is_err() {
                    continue;
                }
                let series = df.column(name)?.as_materialized_series().clone();
                let cast = series.cast(&DataType::String)?;
                let mut values: Vec<Option<String>> = cast
                    .str()?
                    .into_iter()
                    .map(|v| v.map(str::to_string))
                    .collect();

                for text_op in text_operations {
                    for cell in values.iter_mut().flatten() {
                        *cell = match text_op {
                            TextOperation::TrimWhitespace => cell.trim().to_string(),
                            TextOperation::NormalizeCase => match case_type {
                                CaseType::Lower => cell.to_lowercase(),
                                CaseType::Upper => cell.to_uppercase(),
                                CaseType::Title => title_case(cell),
                            },
                        };
                    }
                }

                df.with_column(Series::new(name.as_str().into(), values))?;
            }

            Ok(json!({
                "operation": "clean_text",
                "columns": columns,
                "text_operations": text_operations,
            }))
        }

        CleanOp::RemoveEmpty { target } => {
            let before = df.shape();
            match target {
                EmptyTarget::Rows => {
                    let masks = null_masks(df, &all_column_names(df))?;
                    let keep: Vec<bool> = (0..df.height())
                        .map(|i| masks.is_empty() || masks.iter().any(|m| !m[i]))
                        .collect();
                    *df = keep_rows(df, &keep)?;
                }
                EmptyTarget::Columns => {
                    let height = df.height();
                    let empty: Vec<String> = all_column_names(df)
                        .into_iter()
                        .filter(|name| {
                            df.column(name)
                                .map(|c| c.null_count() == height)
                                .unwrap_or(false)
                        })
                        .collect();
                    for name in empty {
                        df.drop_in_place(&name)?;
                    }
                }
            }
            let after = df.shape();

            Ok(json!({
                "operation": "remove_empty",
                "target": match target {
                    EmptyTarget::Rows => "rows",
                    EmptyTarget::Columns => "columns",
                },
                "before_shape": [before.0, before.1],
                "after_shape": [after.0, after.1],
                "removed_rows": if matches!(target, EmptyTarget::Rows) { before.0 - after.0 } else { 0 },
                "removed_columns": if matches!(target, EmptyTarget::Columns) { before.1 - after.1 } else { 0 },
            }))
        }
    }
}

/// Apply one transform operation in place, returning its result record.
pub fn apply_transform_op(df: &mut DataFrame, op: &TransformOp) -> Result<Value> {
    match op {
        TransformOp::CreateColumn {
            new_column,
            expression,
        } => {
            let ast = expr::parse(expression)?;
            for name in ast.columns() {
                ensure_column(df, &name)?;
            }
            *df = df
                .clone()
                .lazy()
                .with_column(ast.to_polars().alias(new_column.as_str()))
                .collect()?;
            Ok(json!({
                "operation": "create_column",
                "new_column": new_column,
            }))
        }

        TransformOp::RenameColumn { old_name, new_name } => {
            ensure_column(df, old_name)?;
            df.rename(old_name, new_name.as_str().into())?;
            Ok(json!({
                "operation": "rename_column",
                "old_name": old_name,
                "new_name": new_name,
            }))
        }

        TransformOp::DropColumn { columns } => {
            let mut dropped = Vec::new();
            for name in columns {
                if ensure_column(df, name).is_ok() {
                    df.drop_in_place(name)?;
                    dropped.push(name.clone());
                }
            }
            Ok(json!({
                "operation": "drop_column",
                "dropped": dropped,
            }))
        }

        TransformOp::Sort { columns, ascending } => {
            for name in columns {
                ensure_column(df, name)?;
            }
            let descending: Vec<bool> = match ascending {
                Ascending::Single(asc) => vec![!asc; columns.len()],
                Ascending::PerColumn(flags) => {
                    if flags.len() != columns.len() {
                        return Err(AlchemistError::Validation(format!(
                            "'ascending' has {} flags for {} sort columns",
                            flags.len(),
                            columns.len()
                        )));
                    }
                    flags.iter().map(|asc| !asc).collect()
                }
            };
            *df = df.sort(
                columns.clone(),
                SortMultipleOptions::default()
                    .with_order_descending_multi(descending)
                    .with_maintain_order(true),
            )?;
            Ok(json!({
                "operation": "sort",
                "columns": columns,
            }))
        }

        TransformOp::GroupAggregate {
            group_by,
            aggregations,
        } => {
            if group_by.is_empty() {
                return Err(AlchemistError::Validation(
                    "group_aggregate requires at least one group_by column".to_string(),
                ));
            }
            for name in group_by {
                ensure_column(df, name)?;
            }

            let mut agg_exprs = Vec::new();
            for (name, spec) in aggregations {
                ensure_column(df, name)?;
                for agg_fn in spec.functions() {
                    agg_exprs.push(
                        agg_fn
                            .apply(col(name.as_str()))
                            .alias(format!("{}_{}", name, agg_fn.as_str())),
                    );
                }
            }
            if agg_exprs.is_empty() {
                return Err(AlchemistError::Validation(
                    "group_aggregate requires at least one aggregation".to_string(),
                ));
            }

            let group_exprs: Vec<Expr> = group_by.iter().map(|c| col(c.as_str())).collect();
            let out = df
                .clone()
                .lazy()
                .group_by(group_exprs)
                .agg(agg_exprs)
                .collect()?;
            // Group order out of the engine is unspecified.
            *df = out.sort(
                group_by.clone(),
                SortMultipleOptions::default().with_maintain_order(true),
            )?;

            Ok(json!({
                "operation": "group_aggregate",
                "group_by": group_by,
            }))
        }
    }
}

fn json_value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        other => other.to_string().trim().to_string(),
    }
}

fn json_value_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn cell_text(any_value: &AnyValue) -> Option<String> {
    match any_value {
        AnyValue::Null => None,
        AnyValue::String(s) => Some(s.to_string()),
        AnyValue::StringOwned(s) => Some(s.to_string()),
        other => Some(format!("{}", other)),
    }
}

/// Apply filter predicates as a conjunction and return the filtered rows.
/// The input table is left untouched.
pub fn apply_filters(df: &DataFrame, filters: &[FilterPredicate]) -> Result<DataFrame> {
    let mut current = df.clone();

    for filter in filters {
        ensure_column(&current, &filter.column)?;
        let column = current.column(&filter.column)?.as_materialized_series().clone();
        let needle = json_value_text(&filter.value).to_lowercase();

        let keep: Vec<bool> = match filter.operator {
            FilterOperator::Equals | FilterOperator::NotEquals => {
                let negate = filter.operator == FilterOperator::NotEquals;
                (0..column.len())
                    .map(|i| {
                        let matches = column
                            .get(i)
                            .ok()
                            .and_then(|v| cell_text(&v))
                            .is_some_and(|t| t.to_lowercase() == needle);
                        matches != negate
                    })
                    .collect::<Vec<bool>>()
            }
            FilterOperator::Contains | FilterOperator::NotContains => {
                let negate = filter.operator == FilterOperator::NotContains;
                (0..column.len())
                    .map(|i| {
                        let matches = column
                            .get(i)
                            .ok()
                            .and_then(|v| cell_text(&v))
                            .is_some_and(|t| t.to_lowercase().contains(&needle));
                        matches != negate
                    })
                    .collect::<Vec<bool>>()
            }
            FilterOperator::GreaterThan | FilterOperator::LessThan => {
                let bound = json_value_number(&filter.value).ok_or_else(|| {
                    AlchemistError::Validation(format!(
                        "filter '{}' on column '{}' requires a numeric value",
                        filter.operator.as_str(),
                        filter.column
                    ))
                })?;
                let greater = filter.operator == FilterOperator::GreaterThan;
                let cast = column.cast(&DataType::Float64).map_err(|_| {
                    AlchemistError::Validation(format!(
                        "filter '{}' requires a numeric column, '{}' is {}",
                        filter.operator.as_str(),
                        filter.column,
                        column.dtype()
                    ))
                })?;
                cast.f64()?
                    .into_iter()
                    .map(|v| {
                        v.is_some_and(|x| if greater { x > bound } else { x < bound })
                    })
                    .collect::<Vec<bool>>()
            }
        };

        current = keep_rows(&current, &keep)?;
    }

    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn op(value: Value) -> CleanOp {
        serde_json::from_value(value).unwrap()
    }

    fn transform(value: Value) -> TransformOp {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_unknown_operation_type_is_rejected() {
        let parsed: std::result::Result<CleanOp, _> =
            serde_json::from_value(json!({"type": "defragment"}));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_remove_duplicates_keeps_first() {
        let mut df = df! {
            "a" => [1i64, 1, 2, 1],
            "b" => ["x", "x", "y", "z"],
        }
        .unwrap();
        let result = apply_clean_op(&mut df, &op(json!({"type": "remove_duplicates"}))).unwrap();
        assert_eq!(result["removed"], json!(1));
        assert_eq!(df.height(), 3);
    }

    #[test]
    fn test_fill_missing_mean() {
        let mut df = df! {
            "x" => [Some(1.0f64), None, Some(3.0)],
        }
        .unwrap();
        let result = apply_clean_op(
            &mut df,
            &op(json!({"type": "fill_missing", "column": "x", "method": "mean"})),
        )
        .unwrap();
        assert_eq!(result["filled"], json!(1));
        let values: Vec<f64> = df.column("x").unwrap().f64().unwrap().into_no_null_iter().collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_fill_missing_mode_on_text() {
        let mut df = df! {
            "c" => [Some("a"), Some("b"), Some("a"), None],
        }
        .unwrap();
        apply_clean_op(
            &mut df,
            &op(json!({"type": "fill_missing", "column": "c", "method": "mode"})),
        )
        .unwrap();
        let values: Vec<&str> = df.column("c").unwrap().str().unwrap().into_no_null_iter().collect();
        assert_eq!(values, vec!["a", "b", "a", "a"]);
    }

    #[test]
    fn test_fill_missing_constant_value() {
        let mut df = df! {
            "c" => [Some("x"), None],
        }
        .unwrap();
        apply_clean_op(
            &mut df,
            &op(json!({"type": "fill_missing", "column": "c", "method": "value", "value": "n/a"})),
        )
        .unwrap();
        let values: Vec<&str> = df.column("c").unwrap().str().unwrap().into_no_null_iter().collect();
        assert_eq!(values, vec!["x", "n/a"]);
    }

    #[test]
    fn test_fill_missing_unknown_column_aborts() {
        let mut df = df! { "a" => [1i64] }.unwrap();
        let err = apply_clean_op(
            &mut df,
            &op(json!({"type": "fill_missing", "column": "nope"})),
        )
        .unwrap_err();
        assert!(matches!(err, AlchemistError::NotFound(_)));
    }

    #[test]
    fn test_remove_missing_any_and_all() {
        let mut df = df! {
            "a" => [Some(1i64), None, None],
            "b" => [Some("x"), Some("y"), None],
        }
        .unwrap();
        let result = apply_clean_op(
            &mut df,
            &op(json!({"type": "remove_missing", "how": "all"})),
        )
        .unwrap();
        assert_eq!(result["removed"], json!(1));
        assert_eq!(df.height(), 2);

        let result =
            apply_clean_op(&mut df, &op(json!({"type": "remove_missing"}))).unwrap();
        assert_eq!(result["removed"], json!(1));
        assert_eq!(df.height(), 1);
    }

    #[test]
    fn test_remove_missing_subset() {
        let mut df = df! {
            "a" => [Some(1i64), None],
            "b" => [None::<&str>, None],
        }
        .unwrap();
        apply_clean_op(
            &mut df,
            &op(json!({"type": "remove_missing", "columns": ["a"]})),
        )
        .unwrap();
        assert_eq!(df.height(), 1);
    }

    #[test]
    fn test_convert_type_success_and_captured_error() {
        let mut df = df! {
            "n" => ["1", "2", "3"],
        }
        .unwrap();
        let result = apply_clean_op(
            &mut df,
            &op(json!({"type": "convert_type", "column": "n", "target_type": "int"})),
        )
        .unwrap();
        assert_eq!(result["to_type"], json!("int"));
        assert_eq!(df.column("n").unwrap().dtype(), &DataType::Int64);

        let mut df = df! {
            "n" => ["1", "oops"],
        }
        .unwrap();
        let result = apply_clean_op(
            &mut df,
            &op(json!({"type": "convert_type", "column": "n", "target_type": "int"})),
        )
        .unwrap();
        assert!(result["error"].is_string());
        // Column left untouched on a failed coercion.
        assert_eq!(df.column("n").unwrap().dtype(), &DataType::String);
    }

    #[test]
    fn test_remove_outliers_iqr() {
        let mut df = df! {
            "v" => [1.0f64, 2.0, 3.0, 4.0, 5.0, 100.0],
        }
        .unwrap();
        let result = apply_clean_op(
            &mut df,
            &op(json!({"type": "remove_outliers", "column": "v"})),
        )
        .unwrap();
        assert_eq!(result["removed"], json!(1));
        let values: Vec<f64> = df.column("v").unwrap().f64().unwrap().into_no_null_iter().collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_remove_outliers_rejects_text_column() {
        let mut df = df! { "c" => ["a"] }.unwrap();
        let err = apply_clean_op(
            &mut df,
            &op(json!({"type": "remove_outliers", "column": "c"})),
        )
        .unwrap_err();
        assert!(matches!(err, AlchemistError::Validation(_)));
    }

    #[test]
    fn test_clean_text_trim_and_title() {
        let mut df = df! {
            "name" => [Some("  jane DOE "), None],
        }
        .unwrap();
        apply_clean_op(
            &mut df,
            &op(json!({
                "type": "clean_text",
                "columns": ["name", "missing_col"],
                "text_operations": ["trim_whitespace", "normalize_case"],
                "case_type": "title"
            })),
        )
        .unwrap();
        let col = df.column("name").unwrap();
        assert_eq!(col.str().unwrap().get(0), Some("Jane Doe"));
        // Missing values stay missing rather than becoming text.
        assert_eq!(col.null_count(), 1);
    }

    #[test]
    fn test_remove_empty_rows_and_columns() {
        let mut df = df! {
            "a" => [Some(1i64), None],
            "b" => [Some("x"), None],
            "c" => [None::<i64>, None],
        }
        .unwrap();
        let result =
            apply_clean_op(&mut df, &op(json!({"type": "remove_empty"}))).unwrap();
        assert_eq!(result["removed_rows"], json!(1));
        assert_eq!(df.height(), 1);

        let result = apply_clean_op(
            &mut df,
            &op(json!({"type": "remove_empty", "target": "columns"})),
        )
        .unwrap();
        assert_eq!(result["removed_columns"], json!(1));
        assert_eq!(df.width(), 2);
    }

    #[test]
    fn test_transform_create_column() {
        let mut df = df! {
            "price" => [10.0f64, 20.0],
            "cost" => [4.0f64, 5.0],
        }
        .unwrap();
        apply_transform_op(
            &mut df,
            &transform(json!({
                "type": "create_column",
                "new_column": "margin",
                "expression": "price - cost"
            })),
        )
        .unwrap();
        let values: Vec<f64> = df
            .column("margin")
            .unwrap()
            .f64()
            .unwrap()
            .into_no_null_iter()
            .collect();
        assert_eq!(values, vec![6.0, 15.0]);
    }

    #[test]
    fn test_transform_create_column_unknown_reference() {
        let mut df = df! { "a" => [1i64] }.unwrap();
        let err = apply_transform_op(
            &mut df,
            &transform(json!({
                "type": "create_column",
                "new_column": "b",
                "expression": "a + ghost"
            })),
        )
        .unwrap_err();
        assert!(matches!(err, AlchemistError::NotFound(_)));
    }

    #[test]
    fn test_transform_rename_and_drop() {
        let mut df = df! {
            "a" => [1i64],
            "b" => [2i64],
        }
        .unwrap();
        apply_transform_op(
            &mut df,
            &transform(json!({"type": "rename_column", "old_name": "a", "new_name": "id"})),
        )
        .unwrap();
        assert!(df.column("id").is_ok());

        // Unknown names are ignored.
        let result = apply_transform_op(
            &mut df,
            &transform(json!({"type": "drop_column", "columns": ["b", "ghost"]})),
        )
        .unwrap();
        assert_eq!(result["dropped"], json!(["b"]));
        assert_eq!(df.width(), 1);
    }

    #[test]
    fn test_transform_sort_descending() {
        let mut df = df! {
            "v" => [2i64, 3, 1],
        }
        .unwrap();
        apply_transform_op(
            &mut df,
            &transform(json!({"type": "sort", "columns": ["v"], "ascending": false})),
        )
        .unwrap();
        let values: Vec<i64> = df.column("v").unwrap().i64().unwrap().into_no_null_iter().collect();
        assert_eq!(values, vec![3, 2, 1]);
    }

    #[test]
    fn test_transform_sort_flag_count_mismatch() {
        let mut df = df! { "v" => [1i64] }.unwrap();
        let err = apply_transform_op(
            &mut df,
            &transform(json!({"type": "sort", "columns": ["v"], "ascending": [true, false]})),
        )
        .unwrap_err();
        assert!(matches!(err, AlchemistError::Validation(_)));
    }

    #[test]
    fn test_transform_group_aggregate() {
        let mut df = df! {
            "dept" => ["a", "b", "a", "b"],
            "salary" => [10i64, 20, 30, 40],
        }
        .unwrap();
        apply_transform_op(
            &mut df,
            &transform(json!({
                "type": "group_aggregate",
                "group_by": ["dept"],
                "aggregations": {"salary": ["sum", "mean"]}
            })),
        )
        .unwrap();
        assert_eq!(df.height(), 2);
        let depts: Vec<&str> = df.column("dept").unwrap().str().unwrap().into_no_null_iter().collect();
        assert_eq!(depts, vec!["a", "b"]);
        let sums: Vec<i64> = df
            .column("salary_sum")
            .unwrap()
            .i64()
            .unwrap()
            .into_no_null_iter()
            .collect();
        assert_eq!(sums, vec![40, 60]);
        assert!(df.column("salary_mean").is_ok());
    }

    #[test]
    fn test_filter_equals_case_insensitive() {
        let df = df! {
            "city" => ["Oslo", "OSLO", "Bergen"],
        }
        .unwrap();
        let filters = vec![FilterPredicate {
            column: "city".to_string(),
            operator: FilterOperator::Equals,
            value: json!("oslo"),
        }];
        let out = apply_filters(&df, &filters).unwrap();
        assert_eq!(out.height(), 2);
    }

    #[test]
    fn test_filter_contains_skips_nulls() {
        let df = df! {
            "note" => [Some("alpha"), None, Some("ALPHABET")],
        }
        .unwrap();
        let contains = vec![FilterPredicate {
            column: "note".to_string(),
            operator: FilterOperator::Contains,
            value: json!("alpha"),
        }];
        assert_eq!(apply_filters(&df, &contains).unwrap().height(), 2);

        let not_contains = vec![FilterPredicate {
            column: "note".to_string(),
            operator: FilterOperator::NotContains,
            value: json!("alpha"),
        }];
        // Null rows count as not containing the needle.
        assert_eq!(apply_filters(&df, &not_contains).unwrap().height(), 1);
    }

    #[test]
    fn test_filter_numeric_comparison() {
        let df = df! {
            "age" => [Some(10i64), Some(30), None],
        }
        .unwrap();
        let filters = vec![FilterPredicate {
            column: "age".to_string(),
            operator: FilterOperator::GreaterThan,
            value: json!(20),
        }];
        assert_eq!(apply_filters(&df, &filters).unwrap().height(), 1);
    }

    #[test]
    fn test_filter_conjunction_in_order() {
        let df = df! {
            "kind" => ["a", "a", "b"],
            "n" => [1i64, 5, 9],
        }
        .unwrap();
        let filters = vec![
            FilterPredicate {
                column: "kind".to_string(),
                operator: FilterOperator::Equals,
                value: json!("a"),
            },
            FilterPredicate {
                column: "n".to_string(),
                operator: FilterOperator::LessThan,
                value: json!(3),
            },
        ];
        assert_eq!(apply_filters(&df, &filters).unwrap().height(), 1);
    }

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("jane DOE"), "Jane Doe");
        assert_eq!(title_case("foo-bar"), "Foo-Bar");
        assert_eq!(title_case(""), "");
    }

    #[test]
    fn test_quantile_sorted() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0, 100.0];
        assert_eq!(quantile_sorted(&values, 0.25), 2.25);
        assert_eq!(quantile_sorted(&values, 0.75), 4.75);
        assert_eq!(quantile_sorted(&[7.0], 0.5), 7.0);
    }
}
