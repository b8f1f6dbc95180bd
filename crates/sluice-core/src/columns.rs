//! Column schema: names, types, inference from raw records.

use serde::{Deserialize, Serialize};

use crate::value::{parse_timestamp, Row};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Bool,
    BigInt,
    Decimal,
    Date,
    Datetime,
    Text,
}

impl ColumnType {
    pub fn is_number(&self) -> bool {
        matches!(self, ColumnType::BigInt | ColumnType::Decimal)
    }

    pub fn is_datetime(&self) -> bool {
        matches!(self, ColumnType::Datetime)
    }

    /// Generic DDL type name. Dialect drivers may override.
    pub fn ddl_type(&self) -> &'static str {
        match self {
            ColumnType::Bool => "boolean",
            ColumnType::BigInt => "bigint",
            ColumnType::Decimal => "numeric",
            ColumnType::Date => "date",
            ColumnType::Datetime => "timestamp",
            ColumnType::Text => "text",
        }
    }

    pub fn from_ddl_type(s: &str) -> ColumnType {
        match s.trim().to_ascii_lowercase().as_str() {
            "boolean" | "bool" => ColumnType::Bool,
            "bigint" | "int" | "integer" | "smallint" => ColumnType::BigInt,
            "numeric" | "decimal" | "double" | "double precision" | "float" | "real" => {
                ColumnType::Decimal
            }
            "date" => ColumnType::Date,
            "timestamp" | "datetime" | "timestamptz" => ColumnType::Datetime,
            _ => ColumnType::Text,
        }
    }

    /// Detect the type a single raw field provides evidence for.
    ///
    /// With `safe` set, numeric strings with leading zeros keep their
    /// text form so identifiers like `007` survive a round trip.
    pub fn detect(raw: &str, safe: bool) -> Option<ColumnType> {
        if raw.is_empty() {
            return None;
        }
        let lower = raw.to_ascii_lowercase();
        if lower == "true" || lower == "false" {
            return Some(ColumnType::Bool);
        }
        let digits = raw.strip_prefix('-').unwrap_or(raw);
        let zero_padded = safe && digits.len() > 1 && digits.starts_with('0') && !digits.contains('.');
        if !zero_padded {
            if raw.parse::<i64>().is_ok() {
                return Some(ColumnType::BigInt);
            }
            if raw.parse::<f64>().is_ok() {
                return Some(ColumnType::Decimal);
            }
        }
        if chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d").is_ok() {
            return Some(ColumnType::Date);
        }
        if parse_timestamp(raw).is_some() {
            return Some(ColumnType::Datetime);
        }
        Some(ColumnType::Text)
    }

    /// Widen two observed types to the narrowest common column type.
    pub fn merge(self, other: ColumnType) -> ColumnType {
        use ColumnType::*;
        match (self, other) {
            (a, b) if a == b => a,
            (BigInt, Decimal) | (Decimal, BigInt) => Decimal,
            (Date, Datetime) | (Datetime, Date) => Datetime,
            _ => Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub typ: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, typ: ColumnType) -> Column {
        Column { name: name.into(), typ }
    }
}

/// An ordered column set. Lookups are case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Columns(pub Vec<Column>);

impl Columns {
    pub fn new(cols: Vec<Column>) -> Columns {
        Columns(cols)
    }

    /// All-text columns from bare names, for drivers that report no types.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Columns {
        Columns(
            names
                .iter()
                .map(|n| Column::new(n.as_ref(), ColumnType::Text))
                .collect(),
        )
    }

    pub fn names(&self) -> Vec<String> {
        self.0.iter().map(|c| c.name.clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&Column> {
        self.0.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Resolve `name` to the stored spelling, falling back to the input.
    pub fn normalize(&self, name: &str) -> String {
        self.get(name)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| name.to_string())
    }

    /// Placeholder column names reported by drivers that cannot see
    /// real headers (`col_0`, `col_1`, ...).
    pub fn is_dummy(&self) -> bool {
        !self.0.is_empty()
            && self.0.iter().enumerate().all(|(i, c)| {
                c.name
                    .strip_prefix("col_")
                    .and_then(|n| n.parse::<usize>().ok())
                    == Some(i)
            })
    }
}

impl std::ops::Deref for Columns {
    type Target = Vec<Column>;

    fn deref(&self) -> &Vec<Column> {
        &self.0
    }
}

impl std::ops::DerefMut for Columns {
    fn deref_mut(&mut self) -> &mut Vec<Column> {
        &mut self.0
    }
}

/// Infer column types from sampled raw CSV records.
pub fn infer_from_records<S: AsRef<str>>(
    names: &[String],
    records: &[Vec<S>],
    safe: bool,
) -> Columns {
    let mut types: Vec<Option<ColumnType>> = vec![None; names.len()];
    for record in records {
        for (i, field) in record.iter().enumerate().take(names.len()) {
            if let Some(observed) = ColumnType::detect(field.as_ref(), safe) {
                types[i] = Some(match types[i] {
                    Some(prior) => prior.merge(observed),
                    None => observed,
                });
            }
        }
    }
    Columns(
        names
            .iter()
            .zip(types)
            .map(|(name, typ)| Column::new(name, typ.unwrap_or(ColumnType::Text)))
            .collect(),
    )
}

/// Per-column checksums over fully-typed rows, matching
/// [`Value::checksum_component`] on the driver side.
pub fn row_checksums(columns: &Columns, rows: &[Row]) -> Vec<u64> {
    let mut sums = vec![0u64; columns.len()];
    for row in rows {
        for (i, value) in row.iter().enumerate().take(sums.len()) {
            sums[i] = sums[i].wrapping_add(value.checksum_component());
        }
    }
    sums
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(fields: &[&str]) -> Vec<String> {
        fields.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn infers_promotion_lattice() {
        let names = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let records = vec![
            rec(&["1", "1.5", "2020-01-01"]),
            rec(&["2", "3", "2020-01-02 10:00:00"]),
            rec(&["", "x", "2020-01-03"]),
        ];
        let cols = infer_from_records(&names, &records, false);
        assert_eq!(cols[0].typ, ColumnType::BigInt);
        assert_eq!(cols[1].typ, ColumnType::Text);
        assert_eq!(cols[2].typ, ColumnType::Datetime);
    }

    #[test]
    fn safe_inference_keeps_zero_padded_text() {
        let names = vec!["id".to_string()];
        let records = vec![rec(&["007"]), rec(&["008"])];
        assert_eq!(
            infer_from_records(&names, &records, true)[0].typ,
            ColumnType::Text
        );
        assert_eq!(
            infer_from_records(&names, &records, false)[0].typ,
            ColumnType::BigInt
        );
    }

    #[test]
    fn normalize_is_case_insensitive() {
        let cols = Columns::new(vec![Column::new("Create_DT", ColumnType::Datetime)]);
        assert_eq!(cols.normalize("create_dt"), "Create_DT");
        assert_eq!(cols.normalize("missing"), "missing");
    }

    #[test]
    fn dummy_detection() {
        assert!(Columns::from_names(&["col_0", "col_1"]).is_dummy());
        assert!(!Columns::from_names(&["col_0", "name"]).is_dummy());
        assert!(!Columns::from_names(&["id"]).is_dummy());
    }
}
