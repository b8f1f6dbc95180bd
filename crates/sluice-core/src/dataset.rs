//! Small eager tables, used for query results and schema samples.

use crate::columns::{infer_from_records, Columns};
use crate::value::{Row, Value};

/// A fully-materialized table. Query results and the schema samples
/// handed to DDL generation are Datasets; streaming data stays in a
/// [`crate::dataflow::Dataflow`].
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub columns: Columns,
    pub rows: Vec<Row>,
    /// Widen ambiguous evidence (zero-padded numbers) to text when
    /// inferring from raw records.
    pub safe_inference: bool,
}

impl Dataset {
    pub fn new(columns: Columns) -> Dataset {
        Dataset { columns, rows: Vec::new(), safe_inference: false }
    }

    /// Infer a schema from raw string records and parse them into
    /// typed rows under it.
    pub fn from_records<S: AsRef<str>>(
        names: &[String],
        records: Vec<Vec<S>>,
        safe_inference: bool,
    ) -> Dataset {
        let columns = infer_from_records(names, &records, safe_inference);
        let rows = records
            .into_iter()
            .map(|record| parse_record(&columns, &record))
            .collect();
        Dataset { columns, rows, safe_inference }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

/// Parse one raw record under an already-decided schema. Records
/// shorter than the schema are padded with nulls.
pub fn parse_record<S: AsRef<str>>(columns: &Columns, record: &[S]) -> Row {
    columns
        .iter()
        .enumerate()
        .map(|(i, col)| match record.get(i) {
            Some(field) => Value::parse_as(col.typ, field.as_ref()),
            None => Value::Null,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::columns::ColumnType;

    #[test]
    fn from_records_parses_under_inferred_schema() {
        let names = vec!["id".to_string(), "name".to_string()];
        let records = vec![
            vec!["1".to_string(), "anna".to_string()],
            vec!["2".to_string(), "ben".to_string()],
        ];
        let ds = Dataset::from_records(&names, records, true);
        assert_eq!(ds.columns[0].typ, ColumnType::BigInt);
        assert_eq!(ds.rows[1][0], Value::Int(2));
        assert_eq!(ds.rows[0][1], Value::Text("anna".into()));
    }

    #[test]
    fn short_records_pad_with_null() {
        let cols = Columns::from_names(&["a", "b"]);
        let row = parse_record(&cols, &["x"]);
        assert_eq!(row, vec![Value::Text("x".into()), Value::Null]);
    }
}
