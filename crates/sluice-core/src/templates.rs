//! Dialect-specific SQL lives in a data-only registry, not in code
//! branches. Templates use `{key}` placeholders filled by [`render`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Generic,
    Postgres,
    Mysql,
    Oracle,
    Snowflake,
    SqlServer,
    Sqlite,
}

#[derive(Debug, Clone)]
pub struct DialectTemplates {
    pub limit: &'static str,
    pub truncate_table: &'static str,
    pub insert_from_table: &'static str,
    /// Per-field cast applied when selecting out of the temp table.
    pub cast_select_field: &'static str,
    /// Substring identifying "already exists" driver errors.
    pub error_filter_table_exists: &'static str,
    /// chrono layout for datetime watermarks.
    pub timestamp_layout: &'static str,
    /// Wrapper turning a formatted datetime into a SQL literal.
    pub timestamp_layout_str: &'static str,
    pub date_layout: &'static str,
    pub date_layout_str: &'static str,
    /// 0 means no practical identifier cap.
    pub max_identifier_length: usize,
}

static GENERIC: DialectTemplates = DialectTemplates {
    limit: "select {fields} from {table} limit {limit}",
    truncate_table: "truncate table {table}",
    insert_from_table: "insert into {tgt_table} ({tgt_fields}) select {src_fields} from {src_table}",
    cast_select_field: "{field}",
    error_filter_table_exists: "already exists",
    timestamp_layout: "%Y-%m-%d %H:%M:%S%.6f",
    timestamp_layout_str: "'{value}'",
    date_layout: "%Y-%m-%d",
    date_layout_str: "'{value}'",
    max_identifier_length: 0,
};

static POSTGRES: DialectTemplates = DialectTemplates {
    cast_select_field: "cast({field} as {type})",
    ..copy_of_generic()
};

static MYSQL: DialectTemplates = DialectTemplates {
    timestamp_layout: "%Y-%m-%d %H:%M:%S",
    ..copy_of_generic()
};

static ORACLE: DialectTemplates = DialectTemplates {
    limit: "select {fields} from {table} where rownum <= {limit}",
    timestamp_layout: "%Y-%m-%d %H:%M:%S",
    timestamp_layout_str: "to_date('{value}', 'YYYY-MM-DD HH24:MI:SS')",
    date_layout: "%Y-%m-%d",
    date_layout_str: "to_date('{value}', 'YYYY-MM-DD')",
    max_identifier_length: 30,
    ..copy_of_generic()
};

static SNOWFLAKE: DialectTemplates = DialectTemplates {
    cast_select_field: "cast({field} as {type})",
    ..copy_of_generic()
};

static SQLSERVER: DialectTemplates = DialectTemplates {
    limit: "select top {limit} {fields} from {table}",
    ..copy_of_generic()
};

// SQLite has no TRUNCATE statement.
static SQLITE: DialectTemplates = DialectTemplates {
    truncate_table: "delete from {table}",
    ..copy_of_generic()
};

const fn copy_of_generic() -> DialectTemplates {
    DialectTemplates {
        limit: "select {fields} from {table} limit {limit}",
        truncate_table: "truncate table {table}",
        insert_from_table: "insert into {tgt_table} ({tgt_fields}) select {src_fields} from {src_table}",
        cast_select_field: "{field}",
        error_filter_table_exists: "already exists",
        timestamp_layout: "%Y-%m-%d %H:%M:%S%.6f",
        timestamp_layout_str: "'{value}'",
        date_layout: "%Y-%m-%d",
        date_layout_str: "'{value}'",
        max_identifier_length: 0,
    }
}

impl Dialect {
    pub fn templates(&self) -> &'static DialectTemplates {
        match self {
            Dialect::Generic => &GENERIC,
            Dialect::Postgres => &POSTGRES,
            Dialect::Mysql => &MYSQL,
            Dialect::Oracle => &ORACLE,
            Dialect::Snowflake => &SNOWFLAKE,
            Dialect::SqlServer => &SQLSERVER,
            Dialect::Sqlite => &SQLITE,
        }
    }

    /// Explicit transaction isolation is rejected by some backends.
    pub fn supports_isolation_level(&self) -> bool {
        !matches!(self, Dialect::Snowflake)
    }

    /// Quote an identifier, part by part for qualified names. Already
    /// quoted identifiers pass through.
    pub fn quote(&self, ident: &str) -> String {
        let (open, close) = match self {
            Dialect::Mysql => ('`', '`'),
            Dialect::SqlServer => ('[', ']'),
            _ => ('"', '"'),
        };
        ident
            .split('.')
            .map(|part| {
                if part.starts_with(open) || part.is_empty() {
                    part.to_string()
                } else {
                    format!("{open}{part}{close}")
                }
            })
            .collect::<Vec<_>>()
            .join(".")
    }
}

/// Fill `{key}` placeholders. Missing keys are left intact.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{key}}}"), value)
    })
}

/// Substitute ISO-8601 date tokens (`{YYYY}`, `{MM}`, ...) in a URL,
/// enabling date-partitioned output paths.
pub fn substitute_date_tokens(url: &str, now: DateTime<Utc>) -> String {
    render(
        url,
        &[
            ("YYYY", &now.format("%Y").to_string()),
            ("YY", &now.format("%y").to_string()),
            ("MM", &now.format("%m").to_string()),
            ("DD", &now.format("%d").to_string()),
            ("HH", &now.format("%H").to_string()),
            ("mm", &now.format("%M").to_string()),
            ("ss", &now.format("%S").to_string()),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn render_fills_placeholders() {
        let sql = render(
            GENERIC.insert_from_table,
            &[
                ("tgt_table", "public.t1"),
                ("src_table", "public.t1_tmp"),
                ("tgt_fields", "\"id\", \"name\""),
                ("src_fields", "\"id\", \"name\""),
            ],
        );
        assert_eq!(
            sql,
            "insert into public.t1 (\"id\", \"name\") select \"id\", \"name\" from public.t1_tmp"
        );
    }

    #[test]
    fn quote_handles_qualified_names() {
        assert_eq!(Dialect::Generic.quote("public.t1"), "\"public\".\"t1\"");
        assert_eq!(Dialect::Mysql.quote("t1"), "`t1`");
        assert_eq!(Dialect::SqlServer.quote("dbo.t1"), "[dbo].[t1]");
    }

    #[test]
    fn date_tokens_substitute() {
        let now = Utc.with_ymd_and_hms(2021, 3, 9, 7, 5, 0).unwrap();
        assert_eq!(
            substitute_date_tokens("s3://b/{YYYY}/{MM}/{DD}/out.csv", now),
            "s3://b/2021/03/09/out.csv"
        );
    }

    #[test]
    fn dialect_limit_variants() {
        let vars = [("fields", "*"), ("table", "t1"), ("limit", "10")];
        assert_eq!(
            render(Dialect::SqlServer.templates().limit, &vars),
            "select top 10 * from t1"
        );
        assert_eq!(
            render(Dialect::Oracle.templates().limit, &vars),
            "select * from t1 where rownum <= 10"
        );
    }
}
