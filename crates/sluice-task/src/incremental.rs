//! Incremental planner: compute the high-watermark from the target.

use anyhow::{Context, Result};
use sluice_core::drivers::DbConn;
use sluice_core::templates::{render, Dialect};
use sluice_core::value::Value;

/// How watermark scalars become SQL literals for the source dialect.
pub(crate) struct WatermarkLayouts {
    pub timestamp_layout: &'static str,
    pub timestamp_layout_str: &'static str,
    pub date_layout: &'static str,
    pub date_layout_str: &'static str,
}

impl WatermarkLayouts {
    pub fn from_dialect(dialect: Dialect) -> WatermarkLayouts {
        let t = dialect.templates();
        WatermarkLayouts {
            timestamp_layout: t.timestamp_layout,
            timestamp_layout_str: t.timestamp_layout_str,
            date_layout: t.date_layout,
            date_layout_str: t.date_layout_str,
        }
    }

    /// Raw values, for boundaries that never become SQL text (file
    /// modification epochs).
    pub fn raw() -> WatermarkLayouts {
        WatermarkLayouts {
            timestamp_layout: "%s",
            timestamp_layout_str: "{value}",
            date_layout: "%Y-%m-%d",
            date_layout_str: "{value}",
        }
    }

    /// ISO-8601 without quoting, the form API connectors resume from.
    pub fn iso_raw() -> WatermarkLayouts {
        WatermarkLayouts {
            timestamp_layout: "%Y-%m-%dT%H:%M:%S",
            timestamp_layout_str: "{value}",
            date_layout: "%Y-%m-%d",
            date_layout_str: "{value}",
        }
    }
}

/// `MAX(update_key)` on the target, formatted per its column type. An
/// absent target table or empty result means a full initial load and
/// yields an empty watermark.
pub(crate) async fn get_incremental_value(
    tgt: &DbConn,
    target_object: &str,
    update_key: &str,
    layouts: &WatermarkLayouts,
) -> Result<String> {
    let sql = format!(
        "select max({}) as max_val from {target_object}",
        tgt.quote(update_key)
    );
    let data = match tgt.query(&sql).await {
        Ok(data) => data,
        // The target does not exist yet; it gets created later.
        Err(err) if format!("{err:#}").contains("exist") => return Ok(String::new()),
        Err(err) => {
            return Err(err.context(format!("could not get max value for {update_key}")))
        }
    };
    if data.rows.is_empty() {
        return Ok(String::new());
    }

    let value = &data.rows[0][0];
    let typ = data.columns[0].typ;
    let formatted = match value {
        Value::Null => return Ok(String::new()),
        Value::Timestamp(ts) => render(
            layouts.timestamp_layout_str,
            &[("value", ts.format(layouts.timestamp_layout).to_string().as_str())],
        ),
        Value::Date(d) => render(
            layouts.date_layout_str,
            &[("value", d.format(layouts.date_layout).to_string().as_str())],
        ),
        _ if typ.is_number() => value.to_csv_field(),
        other => {
            let escaped = other.to_csv_field().replace('\'', "''");
            format!("'{escaped}'")
        }
    };
    Ok(formatted)
}
