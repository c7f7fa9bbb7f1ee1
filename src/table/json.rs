//! JSON boundary for tabular data.
//!
//! All row data leaving the core passes through here exactly once: missing
//! values become explicit JSON nulls (never a NaN sentinel), dates and
//! datetimes become ISO strings, and everything else maps to its natural JSON
//! type. The reverse direction builds a `DataFrame` from JSON records, used by
//! JSON uploads and by client-held preview rows.

use crate::{AlchemistError, Result};
use polars::prelude::*;
use serde_json::Value;

/// Convert a single cell to JSON.
pub fn any_value_to_json(any_value: AnyValue) -> Value {
    match any_value {
        AnyValue::Null => Value::Null,
        AnyValue::Boolean(b) => Value::Bool(b),
        AnyValue::Int8(v) => Value::Number(v.into()),
        AnyValue::Int16(v) => Value::Number(v.into()),
        AnyValue::Int32(v) => Value::Number(v.into()),
        AnyValue::Int64(v) => Value::Number(v.into()),
        AnyValue::UInt8(v) => Value::Number(v.into()),
        AnyValue::UInt16(v) => Value::Number(v.into()),
        AnyValue::UInt32(v) => Value::Number(v.into()),
        AnyValue::UInt64(v) => Value::Number(v.into()),
        AnyValue::Float32(v) => serde_json::Number::from_f64(v as f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        AnyValue::Float64(v) => serde_json::Number::from_f64(v)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        AnyValue::String(s) => Value::String(s.to_string()),
        AnyValue::StringOwned(s) => Value::String(s.to_string()),
        AnyValue::Date(days) => {
            let unix_epoch = chrono::NaiveDate::from_ymd_opt(1970, 1, 1).unwrap();
            let date = unix_epoch + chrono::Duration::days(days as i64);
            Value::String(date.format("%Y-%m-%d").to_string())
        }
        AnyValue::Datetime(value, unit, _) => datetime_to_json(value, unit),
        AnyValue::DatetimeOwned(value, unit, _) => datetime_to_json(value, unit),
        other => Value::String(format!("{}", other)),
    }
}

/// Render an epoch offset in the column's own time unit; out-of-range
/// timestamps become null.
fn datetime_to_json(value: i64, unit: TimeUnit) -> Value {
    let dt = match unit {
        TimeUnit::Nanoseconds => Some(chrono::DateTime::from_timestamp_nanos(value)),
        TimeUnit::Microseconds => chrono::DateTime::from_timestamp_micros(value),
        TimeUnit::Milliseconds => chrono::DateTime::from_timestamp_millis(value),
    };
    match dt {
        Some(dt) => Value::String(dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()),
        None => Value::Null,
    }
}

/// Render a window of rows as JSON objects keyed by column name.
pub fn rows_to_json(df: &DataFrame, offset: usize, limit: usize) -> Result<Vec<Value>> {
    let columns: Vec<String> = df
        .get_column_names()
        .iter()
        .map(|s| s.to_string())
        .collect();
    let col_refs: Vec<&Column> = columns
        .iter()
        .map(|name| df.column(name))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let height = df.height();
    let start = offset.min(height);
    let end = (offset + limit).min(height);

    let mut rows = Vec::with_capacity(end - start);
    for i in start..end {
        let mut row = serde_json::Map::new();
        for (name, column) in columns.iter().zip(&col_refs) {
            let value = match column.get(i) {
                Ok(v) => any_value_to_json(v),
                Err(_) => Value::Null,
            };
            row.insert(name.clone(), value);
        }
        rows.push(Value::Object(row));
    }
    Ok(rows)
}

/// Render the first `n` rows as JSON objects.
pub fn preview_rows(df: &DataFrame, n: usize) -> Result<Vec<Value>> {
    rows_to_json(df, 0, n)
}

/// Build a `DataFrame` from a list of JSON record objects.
///
/// Column order is first-seen order across the records. Column types are
/// inferred from the values: all-integer columns become Int64, other numeric
/// columns Float64, all-boolean columns Boolean, everything else String (with
/// nested values serialized as compact JSON text).
pub fn df_from_records(records: &[Value]) -> Result<DataFrame> {
    let mut order: Vec<String> = Vec::new();
    for record in records {
        let obj = record.as_object().ok_or_else(|| {
            AlchemistError::Parse("expected an array of JSON objects".to_string())
        })?;
        for key in obj.keys() {
            if !order.iter().any(|k| k == key) {
                order.push(key.clone());
            }
        }
    }

    let mut columns: Vec<Column> = Vec::with_capacity(order.len());
    for name in &order {
        let cells: Vec<Option<&Value>> = records
            .iter()
            .map(|r| r.as_object().and_then(|o| o.get(name)))
            .map(|v| match v {
                Some(Value::Null) | None => None,
                Some(other) => Some(other),
            })
            .collect();
        columns.push(infer_column(name, &cells));
    }

    DataFrame::new(columns).map_err(AlchemistError::from)
}

fn infer_column(name: &str, cells: &[Option<&Value>]) -> Column {
    let present: Vec<&Value> = cells.iter().flatten().copied().collect();

    let all_bool = !present.is_empty() && present.iter().all(|v| v.is_boolean());
    if all_bool {
        let values: Vec<Option<bool>> = cells
            .iter()
            .map(|c| c.and_then(|v| v.as_bool()))
            .collect();
        return Series::new(name.into(), values).into();
    }

    let all_int = !present.is_empty() && present.iter().all(|v| v.as_i64().is_some());
    if all_int {
        let values: Vec<Option<i64>> = cells.iter().map(|c| c.and_then(|v| v.as_i64())).collect();
        return Series::new(name.into(), values).into();
    }

    let all_num = !present.is_empty() && present.iter().all(|v| v.as_f64().is_some());
    if all_num {
        let values: Vec<Option<f64>> = cells.iter().map(|c| c.and_then(|v| v.as_f64())).collect();
        return Series::new(name.into(), values).into();
    }

    let values: Vec<Option<String>> = cells
        .iter()
        .map(|c| {
            c.map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
        })
        .collect();
    Series::new(name.into(), values).into()
}

/// Flatten a nested JSON object into dotted column names.
///
/// Nested objects contribute `parent.child` keys; arrays are kept as values
/// (serialized to JSON text by column inference).
pub fn flatten_object(obj: &serde_json::Map<String, Value>) -> serde_json::Map<String, Value> {
    let mut flat = serde_json::Map::new();
    flatten_into(None, obj, &mut flat);
    flat
}

fn flatten_into(
    prefix: Option<&str>,
    obj: &serde_json::Map<String, Value>,
    out: &mut serde_json::Map<String, Value>,
) {
    for (key, value) in obj {
        let name = match prefix {
            Some(p) => format!("{}.{}", p, key),
            None => key.clone(),
        };
        match value {
            Value::Object(nested) => flatten_into(Some(&name), nested, out),
            other => {
                out.insert(name, other.clone());
            }
        }
    }
}
