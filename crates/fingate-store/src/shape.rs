use chrono::{DateTime, Utc};
use fingate_types::{ColumnDescriptor, ColumnType, GatewayResult, QueryResult, ScalarValue};
use postgres::types::{FromSql, Type};
use postgres::{Column, Row};
use tracing::debug;

pub fn column_type(ty: &Type) -> ColumnType {
    if *ty == Type::BOOL {
        ColumnType::Boolean
    } else if *ty == Type::INT2 || *ty == Type::INT4 || *ty == Type::INT8 || *ty == Type::OID {
        ColumnType::Integer
    } else if *ty == Type::FLOAT4 || *ty == Type::FLOAT8 {
        ColumnType::Float
    } else if *ty == Type::NUMERIC {
        ColumnType::Numeric
    } else if *ty == Type::TEXT || *ty == Type::VARCHAR || *ty == Type::BPCHAR || *ty == Type::NAME {
        ColumnType::Text
    } else if *ty == Type::DATE {
        ColumnType::Date
    } else if *ty == Type::TIMESTAMP {
        ColumnType::Timestamp
    } else if *ty == Type::TIMESTAMPTZ {
        ColumnType::TimestampTz
    } else if *ty == Type::JSON || *ty == Type::JSONB {
        ColumnType::Json
    } else {
        ColumnType::Unknown
    }
}

pub(crate) fn describe_columns(columns: &[Column]) -> Vec<ColumnDescriptor> {
    columns
        .iter()
        .map(|c| ColumnDescriptor::new(c.name(), column_type(c.type_())))
        .collect()
}

pub(crate) fn shape_rows(
    columns: &[Column],
    rows: &[Row],
    truncated: bool,
) -> GatewayResult<QueryResult> {
    let descriptors = describe_columns(columns);
    let shaped = rows
        .iter()
        .map(|row| {
            columns
                .iter()
                .zip(&descriptors)
                .enumerate()
                .map(|(idx, (column, descriptor))| decode(row, idx, column, descriptor.column_type))
                .collect()
        })
        .collect();
    QueryResult::new(descriptors, shaped, truncated)
}

fn decode(row: &Row, idx: usize, column: &Column, kind: ColumnType) -> ScalarValue {
    let ty = column.type_();
    let value = match kind {
        ColumnType::Boolean => get(row, idx, ScalarValue::Bool),
        ColumnType::Integer if *ty == Type::INT2 => get(row, idx, |v: i16| ScalarValue::Integer(v.into())),
        ColumnType::Integer if *ty == Type::INT4 => get(row, idx, |v: i32| ScalarValue::Integer(v.into())),
        ColumnType::Integer if *ty == Type::OID => get(row, idx, |v: u32| ScalarValue::Integer(v.into())),
        ColumnType::Integer => get(row, idx, ScalarValue::Integer),
        ColumnType::Float if *ty == Type::FLOAT4 => get(row, idx, |v: f32| ScalarValue::Float(v.into())),
        ColumnType::Float => get(row, idx, ScalarValue::Float),
        ColumnType::Numeric => get(row, idx, ScalarValue::Decimal),
        ColumnType::Text => get(row, idx, ScalarValue::Text),
        ColumnType::Date => get(row, idx, ScalarValue::Date),
        ColumnType::Timestamp => get(row, idx, ScalarValue::Timestamp),
        ColumnType::TimestampTz => get::<DateTime<Utc>, _>(row, idx, ScalarValue::TimestampTz),
        ColumnType::Json => get(row, idx, ScalarValue::Json),
        ColumnType::Unknown => return ScalarValue::Null,
    };
    // NUMERIC NaN and out-of-range values land here; the cell degrades to null.
    value.unwrap_or_else(|err| {
        debug!(column = column.name(), error = %err, "cell could not be decoded");
        ScalarValue::Null
    })
}

fn get<'a, T, F>(row: &'a Row, idx: usize, wrap: F) -> Result<ScalarValue, postgres::Error>
where
    T: FromSql<'a>,
    F: Fn(T) -> ScalarValue,
{
    Ok(row
        .try_get::<_, Option<T>>(idx)?
        .map(wrap)
        .unwrap_or(ScalarValue::Null))
}
