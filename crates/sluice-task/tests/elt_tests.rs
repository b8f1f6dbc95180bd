//! End-to-end pipeline tests against the in-repo reference drivers.

use std::path::Path;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use sluice_core::columns::{Column, ColumnType, Columns};
use sluice_core::config::{Config, ConnSpec, Mode, SourceConfig, TargetConfig};
use sluice_core::dataset::Dataset;
use sluice_core::drivers::DatabaseConnection;
use sluice_core::env::RuntimeFlags;
use sluice_core::error::{has_kind, TaskError};
use sluice_core::value::Value;
use sluice_io::{MemoryConnection, ScriptedApiClient};
use sluice_task::{ExecStatus, TaskExecution};

fn conn(url: &str) -> ConnSpec {
    ConnSpec { url: url.to_string(), ..Default::default() }
}

fn file_to_db_config(path: &Path, mode: Mode) -> Config {
    Config {
        source: SourceConfig {
            conn: conn(&format!("file://{}", path.display())),
            ..Default::default()
        },
        target: TargetConfig {
            conn: conn("mem://wh"),
            object: "public.t1".into(),
            mode: Some(mode),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn write_file(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}

fn task_with_target(config: Config, tgt: &Arc<MemoryConnection>) -> TaskExecution {
    let mut task = TaskExecution::with_flags(config, RuntimeFlags::default()).unwrap();
    task.tgt_db = Some(tgt.clone());
    task
}

fn orders_columns() -> Columns {
    Columns::new(vec![
        Column::new("id", ColumnType::BigInt),
        Column::new("name", ColumnType::Text),
        Column::new("create_dt", ColumnType::Datetime),
    ])
}

fn ts(y: i32, m: u32, d: u32) -> Value {
    Value::Timestamp(Utc.with_ymd_and_hms(y, m, d, 10, 0, 0).unwrap())
}

#[tokio::test]
async fn s1_csv_to_db_full_refresh() {
    let dir = tempfile::tempdir().unwrap();
    let csv = write_file(dir.path(), "test1.csv", "id,name\n1,anna\n2,ben\n3,cara\n");
    let tgt = MemoryConnection::isolated("wh");

    let mut task = task_with_target(file_to_db_config(&csv, Mode::FullRefresh), &tgt);
    task.execute().await.unwrap();

    assert_eq!(task.status, ExecStatus::Success);
    assert_eq!(tgt.table_rows("public.t1").unwrap().len(), 3);
    // The staging table is dropped on the way out.
    assert!(!tgt.table_exists("public.t1_tmp").await.unwrap());
    assert_eq!(task.get_count(), 3);
}

#[tokio::test]
async fn s2_truncate_replaces_preexisting_rows() {
    let dir = tempfile::tempdir().unwrap();
    let csv = write_file(dir.path(), "test1.upsert.csv", "id,name\n10,x\n11,y\n");
    let tgt = MemoryConnection::isolated("wh");
    tgt.seed_table(
        "public.t1",
        Columns::new(vec![
            Column::new("id", ColumnType::BigInt),
            Column::new("name", ColumnType::Text),
        ]),
        vec![
            vec![Value::Int(1), Value::Text("old1".into())],
            vec![Value::Int(2), Value::Text("old2".into())],
            vec![Value::Int(3), Value::Text("old3".into())],
        ],
    );

    let mut task = task_with_target(file_to_db_config(&csv, Mode::Truncate), &tgt);
    task.execute().await.unwrap();

    let rows = tgt.table_rows("public.t1").unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0][0], Value::Int(10));
}

#[tokio::test]
async fn s3_db_to_db_upsert_applies_new_and_updated() {
    let src = MemoryConnection::isolated("src");
    let tgt = MemoryConnection::isolated("wh");
    tgt.seed_table(
        "public.t1",
        orders_columns(),
        vec![
            vec![Value::Int(1), Value::Text("a".into()), ts(2020, 12, 1)],
            vec![Value::Int(2), Value::Text("b".into()), ts(2021, 1, 1)],
        ],
    );
    src.seed_table(
        "public.src1",
        orders_columns(),
        vec![
            vec![Value::Int(1), Value::Text("a".into()), ts(2020, 12, 1)],
            vec![Value::Int(2), Value::Text("b2".into()), ts(2021, 2, 1)],
            vec![Value::Int(3), Value::Text("c".into()), ts(2021, 2, 2)],
        ],
    );

    let config = Config {
        source: SourceConfig {
            conn: conn("mem://src"),
            stream: "public.src1".into(),
            primary_key: vec!["id".into()],
            update_key: "create_dt".into(),
            ..Default::default()
        },
        target: TargetConfig {
            conn: conn("mem://wh"),
            object: "public.t1".into(),
            mode: Some(Mode::Incremental),
            ..Default::default()
        },
        ..Default::default()
    };
    let mut task = task_with_target(config, &tgt);
    task.src_db = Some(src.clone());
    task.execute().await.unwrap();

    let mut rows = tgt.table_rows("public.t1").unwrap();
    rows.sort_by_key(|r| match &r[0] {
        Value::Int(i) => *i,
        _ => 0,
    });
    // One new row; the updated row reflects the new values.
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[1][1], Value::Text("b2".into()));
    assert_eq!(rows[2][0], Value::Int(3));
}

#[tokio::test]
async fn s4_db_to_csv_matches_golden() {
    let dir = tempfile::tempdir().unwrap();
    let src = MemoryConnection::isolated("src");
    src.seed_table(
        "public.t1",
        Columns::new(vec![
            Column::new("id", ColumnType::BigInt),
            Column::new("name", ColumnType::Text),
        ]),
        vec![
            vec![Value::Int(1), Value::Text("anna".into())],
            vec![Value::Int(2), Value::Text("ben".into())],
        ],
    );

    let out = dir.path().join("test1.result.csv");
    let config = Config {
        source: SourceConfig {
            conn: conn("mem://src"),
            stream: "public.t1".into(),
            ..Default::default()
        },
        target: TargetConfig {
            conn: conn(&format!("file://{}", out.display())),
            ..Default::default()
        },
        ..Default::default()
    };
    let mut task = TaskExecution::with_flags(config, RuntimeFlags::default()).unwrap();
    task.src_db = Some(src.clone());
    task.execute().await.unwrap();

    let written = std::fs::read_to_string(&out).unwrap();
    assert_eq!(written, "id,name\n1,anna\n2,ben\n");
}

#[tokio::test]
async fn s5_no_new_files_incremental_is_success() {
    let dir = tempfile::tempdir().unwrap();
    let csv = write_file(dir.path(), "t.csv", "id\n1\n");
    let tgt = MemoryConnection::isolated("wh");
    // The prior load's watermark is far in the future, so the file on
    // disk does not qualify as new.
    tgt.seed_table(
        "public.t1",
        Columns::new(vec![
            Column::new("id", ColumnType::BigInt),
            Column::new("_sling_loaded_at", ColumnType::BigInt),
        ]),
        vec![vec![Value::Int(1), Value::Int(32503680000)]],
    );

    let mut config = file_to_db_config(&csv, Mode::Append);
    config.source.update_key = "_sling_loaded_at".into();
    let mut task = task_with_target(config, &tgt);
    task.execute().await.unwrap();

    assert_eq!(task.status, ExecStatus::Success);
    // Nothing was loaded.
    assert_eq!(tgt.table_rows("public.t1").unwrap().len(), 1);
}

#[tokio::test]
async fn s6_cancellation_interrupts_and_drops_temp() {
    let dir = tempfile::tempdir().unwrap();
    let csv = write_file(dir.path(), "t.csv", "id,name\n1,a\n2,b\n");
    let tgt = MemoryConnection::isolated("wh");
    tgt.set_prop("import_delay_ms", "10000");

    let mut task = task_with_target(file_to_db_config(&csv, Mode::FullRefresh), &tgt);
    let cancel = task.cancel_token();
    let handle = tokio::spawn(async move {
        let result = task.execute().await;
        (task.status, result)
    });
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    cancel.cancel();
    let (status, result) = handle.await.unwrap();

    assert_eq!(status, ExecStatus::Error);
    let err = result.unwrap_err();
    assert!(has_kind(&err, |e| matches!(e, TaskError::Interrupted)));
    // The staging table did not survive, and the target was never
    // created.
    assert!(!tgt.table_exists("public.t1_tmp").await.unwrap());
    assert!(!tgt.table_exists("public.t1").await.unwrap());
}

#[tokio::test]
async fn append_with_update_key_filters_by_watermark() {
    let src = MemoryConnection::isolated("src");
    let tgt = MemoryConnection::isolated("wh");
    tgt.seed_table(
        "public.t1",
        orders_columns(),
        vec![vec![Value::Int(1), Value::Text("a".into()), ts(2021, 1, 1)]],
    );
    src.seed_table(
        "public.src1",
        orders_columns(),
        vec![
            vec![Value::Int(1), Value::Text("a".into()), ts(2020, 6, 1)],
            vec![Value::Int(2), Value::Text("b".into()), ts(2021, 3, 1)],
        ],
    );

    let config = Config {
        source: SourceConfig {
            conn: conn("mem://src"),
            stream: "public.src1".into(),
            // No primary key: incremental degrades to append.
            update_key: "create_dt".into(),
            ..Default::default()
        },
        target: TargetConfig {
            conn: conn("mem://wh"),
            object: "public.t1".into(),
            mode: Some(Mode::Append),
            ..Default::default()
        },
        ..Default::default()
    };
    let mut task = task_with_target(config, &tgt);
    task.src_db = Some(src.clone());
    task.execute().await.unwrap();

    // Only the row past the watermark was appended.
    let rows = tgt.table_rows("public.t1").unwrap();
    assert_eq!(rows.len(), 2);
}

#[tokio::test]
async fn atomic_promote_rolls_back_target_on_failure() {
    let dir = tempfile::tempdir().unwrap();
    let csv = write_file(dir.path(), "t.csv", "id,name\n7,new\n");
    let tgt = MemoryConnection::isolated("wh");
    let before = vec![
        vec![Value::Int(1), Value::Text("keep1".into())],
        vec![Value::Int(2), Value::Text("keep2".into())],
    ];
    tgt.seed_table(
        "public.t1",
        Columns::new(vec![
            Column::new("id", ColumnType::BigInt),
            Column::new("name", ColumnType::Text),
        ]),
        before.clone(),
    );
    tgt.set_prop("fail_sql_contains", "insert into");

    let mut task = task_with_target(file_to_db_config(&csv, Mode::Append), &tgt);
    let err = task.execute().await.unwrap_err();
    assert!(format!("{err:#}").contains("execution failed"));
    assert_eq!(task.status, ExecStatus::Error);

    // Target rows equal the pre-task row set; temp is gone.
    assert_eq!(tgt.table_rows("public.t1").unwrap(), before);
    assert!(!tgt.table_exists("public.t1_tmp").await.unwrap());
}

#[tokio::test]
async fn truncate_mode_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let csv = write_file(dir.path(), "t.csv", "id,name\n1,a\n2,b\n");
    let tgt = MemoryConnection::isolated("wh");

    for _ in 0..2 {
        let mut task = task_with_target(file_to_db_config(&csv, Mode::Truncate), &tgt);
        task.execute().await.unwrap();
    }
    assert_eq!(tgt.table_rows("public.t1").unwrap().len(), 2);
}

#[tokio::test]
async fn incremental_sql_source_requires_placeholder() {
    let src = MemoryConnection::isolated("src");
    let tgt = MemoryConnection::isolated("wh");
    src.seed_table(
        "public.src1",
        orders_columns(),
        vec![vec![Value::Int(1), Value::Text("a".into()), ts(2021, 1, 1)]],
    );

    let config = Config {
        source: SourceConfig {
            conn: conn("mem://src"),
            stream: "select * from public.src1".into(),
            primary_key: vec!["id".into()],
            update_key: "create_dt".into(),
            ..Default::default()
        },
        target: TargetConfig {
            conn: conn("mem://wh"),
            object: "public.t1".into(),
            mode: Some(Mode::Incremental),
            ..Default::default()
        },
        ..Default::default()
    };
    let mut task = task_with_target(config, &tgt);
    task.src_db = Some(src.clone());
    let err = task.execute().await.unwrap_err();
    assert!(has_kind(&err, |e| matches!(
        e,
        TaskError::IncrementalPlaceholderMissing
    )));
}

#[tokio::test]
async fn sql_file_source_is_loaded() {
    let dir = tempfile::tempdir().unwrap();
    let sql_path = write_file(dir.path(), "query.sql", "select * from public.src1");
    let src = MemoryConnection::isolated("src");
    let tgt = MemoryConnection::isolated("wh");
    src.seed_table(
        "public.src1",
        Columns::new(vec![Column::new("id", ColumnType::BigInt)]),
        vec![vec![Value::Int(5)]],
    );

    let config = Config {
        source: SourceConfig {
            conn: conn("mem://src"),
            stream: sql_path.display().to_string(),
            ..Default::default()
        },
        target: TargetConfig {
            conn: conn("mem://wh"),
            object: "public.t1".into(),
            mode: Some(Mode::Append),
            ..Default::default()
        },
        ..Default::default()
    };
    let mut task = task_with_target(config, &tgt);
    task.src_db = Some(src.clone());
    task.execute().await.unwrap();
    assert_eq!(tgt.table_rows("public.t1").unwrap(), vec![vec![Value::Int(5)]]);
}

#[tokio::test]
async fn db_sql_task_executes_statement() {
    let tgt = MemoryConnection::isolated("wh");
    tgt.seed_table(
        "public.t1",
        Columns::new(vec![Column::new("id", ColumnType::BigInt)]),
        vec![vec![Value::Int(1)], vec![Value::Int(2)]],
    );

    let config = Config {
        target: TargetConfig {
            conn: conn("mem://wh"),
            object: "truncate table public.t1".into(),
            ..Default::default()
        },
        ..Default::default()
    };
    let mut task = task_with_target(config, &tgt);
    task.execute().await.unwrap();
    assert_eq!(task.status, ExecStatus::Success);
    assert_eq!(tgt.table_rows("public.t1").unwrap().len(), 0);
}

#[tokio::test]
async fn api_to_db_resumes_from_watermark() {
    let api = Arc::new(ScriptedApiClient::new("shop").with_cursor_field("created_at"));
    let mut orders = Dataset::new(Columns::new(vec![
        Column::new("id", ColumnType::BigInt),
        Column::new("created_at", ColumnType::Datetime),
    ]));
    orders.rows = vec![
        vec![Value::Int(1), ts(2021, 1, 5)],
        vec![Value::Int(2), ts(2021, 3, 5)],
    ];
    api.register_stream("orders", orders);

    let tgt = MemoryConnection::isolated("wh");
    tgt.seed_table(
        "public.orders",
        Columns::new(vec![
            Column::new("id", ColumnType::BigInt),
            Column::new("created_at", ColumnType::Datetime),
        ]),
        vec![vec![Value::Int(1), ts(2021, 2, 1)]],
    );

    let config = Config {
        source: SourceConfig {
            conn: conn("airbyte://shop"),
            stream: "orders".into(),
            primary_key: vec!["id".into()],
            update_key: "created_at".into(),
            ..Default::default()
        },
        target: TargetConfig {
            conn: conn("mem://wh"),
            object: "public.orders".into(),
            mode: Some(Mode::Incremental),
            ..Default::default()
        },
        ..Default::default()
    };
    let mut task = task_with_target(config, &tgt);
    task.api = Some(api);
    task.execute().await.unwrap();

    // Only the order past the 2021-02-01 watermark streams, and it
    // upserts alongside the existing row.
    let rows = tgt.table_rows("public.orders").unwrap();
    assert_eq!(rows.len(), 2);
}

#[tokio::test]
async fn pre_sql_runs_before_staging() {
    let dir = tempfile::tempdir().unwrap();
    let csv = write_file(dir.path(), "t.csv", "id\n1\n");
    let tgt = MemoryConnection::isolated("wh");

    let mut config = file_to_db_config(&csv, Mode::Append);
    config.target.options.pre_sql = "create table public.audit (\"id\" bigint)".into();
    let mut task = task_with_target(config, &tgt);
    task.execute().await.unwrap();

    assert!(tgt.table_exists("public.audit").await.unwrap());
    assert_eq!(tgt.table_rows("public.t1").unwrap().len(), 1);
}

#[tokio::test]
async fn add_new_columns_extends_preexisting_target() {
    let dir = tempfile::tempdir().unwrap();
    let csv = write_file(dir.path(), "t.csv", "id,name,extra\n1,a,x\n");
    let tgt = MemoryConnection::isolated("wh");
    tgt.seed_table(
        "public.t1",
        Columns::new(vec![
            Column::new("id", ColumnType::BigInt),
            Column::new("name", ColumnType::Text),
        ]),
        vec![vec![Value::Int(9), Value::Text("old".into())]],
    );

    let mut config = file_to_db_config(&csv, Mode::Append);
    config.target.options.add_new_columns = true;
    let mut task = task_with_target(config, &tgt);
    task.execute().await.unwrap();

    let columns = tgt.get_columns("public.t1").await.unwrap();
    assert_eq!(columns.names(), vec!["id", "name", "extra"]);
    let rows = tgt.table_rows("public.t1").unwrap();
    assert_eq!(rows.len(), 2);
    // The pre-existing row was null-extended.
    assert_eq!(rows[0][2], Value::Null);
}

#[tokio::test]
async fn round_trip_db_to_csv_to_db_preserves_values() {
    let dir = tempfile::tempdir().unwrap();
    let src = MemoryConnection::isolated("src");
    src.seed_table(
        "public.t1",
        orders_columns(),
        vec![
            vec![Value::Int(1), Value::Text("anna".into()), ts(2021, 1, 1)],
            vec![Value::Int(2), Value::Null, ts(2021, 2, 1)],
        ],
    );

    let out = dir.path().join("dump.csv");
    let export = Config {
        source: SourceConfig {
            conn: conn("mem://src"),
            stream: "public.t1".into(),
            ..Default::default()
        },
        target: TargetConfig {
            conn: conn(&format!("file://{}", out.display())),
            ..Default::default()
        },
        ..Default::default()
    };
    let mut task = TaskExecution::with_flags(export, RuntimeFlags::default()).unwrap();
    task.src_db = Some(src.clone());
    task.execute().await.unwrap();

    let tgt = MemoryConnection::isolated("wh");
    let mut task =
        task_with_target(file_to_db_config(&out, Mode::FullRefresh), &tgt);
    task.execute().await.unwrap();

    let rows = tgt.table_rows("public.t1").unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0][0], Value::Int(1));
    assert_eq!(rows[0][2], ts(2021, 1, 1));
    assert_eq!(rows[1][1], Value::Null);
}
