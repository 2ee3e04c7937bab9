#![cfg(feature = "sqlite")]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{init_tracing, unique_db_path};
use sql_registry::prelude::*;

async fn seeded_client(prefix: &str) -> Result<Arc<Client>, SqlRegistryError> {
    let registry = Registry::new();
    registry
        .register(
            prefix,
            DbConfig::sqlite(unique_db_path(prefix))
                .with_max_active(2)
                .with_max_idle(1),
        )
        .await?;
    let client = registry.get(prefix).await?;
    let scope = Scope::new();
    client
        .exec(
            &scope,
            "CREATE TABLE people (id INTEGER PRIMARY KEY, name TEXT NOT NULL, score REAL)",
            &[],
        )
        .await?;
    for (id, name, score) in [(1, "ada", 9.5), (2, "brian", 7.0), (3, "cleo", 8.25)] {
        client
            .exec(
                &scope,
                "INSERT INTO people (id, name, score) VALUES (?1, ?2, ?3)",
                &[
                    RowValues::Int(id),
                    RowValues::Text(name.to_string()),
                    RowValues::Float(score),
                ],
            )
            .await?;
    }
    Ok(client)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn debug_database_end_to_end() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let registry = Registry::new();
    registry
        .register(
            "debug",
            DbConfig::sqlite(unique_db_path("debug"))
                .with_max_active(128)
                .with_max_idle(128)
                .with_idle_timeout(Duration::from_secs(5 * 60))
                .with_timeouts(Duration::from_secs(10)),
        )
        .await?;

    let db = registry.get("debug").await?;
    assert_eq!(db.config().max_idle(), 128);
    assert_eq!(db.config().tran_timeout(), Duration::from_secs(10));

    let scope = Scope::new();
    db.exec(&scope, "CREATE TABLE t (id INTEGER PRIMARY KEY, x INTEGER)", &[])
        .await?;
    let inserted = db
        .exec(
            &scope,
            "INSERT INTO t (id, x) VALUES (?1, ?2)",
            &[RowValues::Int(7), RowValues::Int(0)],
        )
        .await?;
    assert_eq!(inserted.rows_affected, 1);
    assert_eq!(inserted.last_insert_id, Some(7));

    let updated = db
        .exec(&scope, "UPDATE t SET x = 1 WHERE id = ?", &[RowValues::Int(7)])
        .await?;
    assert_eq!(updated.rows_affected, 1);

    let x: i64 = db
        .query_row(&scope, "SELECT x FROM t WHERE id = ?", &[RowValues::Int(7)])
        .await
        .scan_one()?;
    assert_eq!(x, 1);

    let missing = db
        .query_row(&scope, "SELECT x FROM t WHERE id = ?", &[RowValues::Int(999)])
        .await;
    assert!(missing.err().is_none());
    assert!(missing.scan_one::<i64>().unwrap_err().is_no_rows());

    registry.close_all().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn rows_stream_in_order() -> Result<(), Box<dyn std::error::Error>> {
    let client = seeded_client("stream").await?;
    let mut rows = client
        .query(&Scope::new(), "SELECT id, name FROM people ORDER BY id", &[])
        .await?;
    assert_eq!(rows.columns(), ["id".to_string(), "name".to_string()]);
    assert!(rows.is_open());

    let mut names = Vec::new();
    while let Some(record) = rows.next().await {
        let record = record?;
        assert_eq!(record.columns(), rows.columns());
        names.push(record.try_get::<String>("name")?);
    }
    assert_eq!(names, ["ada", "brian", "cleo"]);
    assert!(!rows.is_open());
    assert!(rows.next().await.is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn closing_rows_early_frees_the_connection() -> Result<(), Box<dyn std::error::Error>> {
    let client = seeded_client("early").await?;
    let scope = Scope::new();

    // Pool holds two connections; open and abandon more cursors than that.
    for _ in 0..4 {
        let mut rows = client
            .query(&scope, "SELECT id FROM people ORDER BY id", &[])
            .await?;
        let first = rows.next().await.expect("one row")?;
        assert_eq!(first.try_get_index::<i64>(0)?, 1);
        rows.close();
        assert!(!rows.is_open());
        assert!(rows.next().await.is_none());
    }

    let count: i64 = client
        .query_row(&scope, "SELECT count(*) FROM people", &[])
        .await
        .scan_one()?;
    assert_eq!(count, 3);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn collect_and_typed_scans() -> Result<(), Box<dyn std::error::Error>> {
    let client = seeded_client("collect").await?;
    let scope = Scope::new();

    let records = client
        .query(
            &scope,
            "SELECT name, score FROM people WHERE score > ? ORDER BY score DESC",
            &[RowValues::Float(8.0)],
        )
        .await?
        .collect()
        .await?;
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].get("name"), Some(&RowValues::Text("ada".into())));
    assert_eq!(records[1].try_get::<f64>("score")?, 8.25);

    let (id, name): (i64, String) = client
        .query_row(
            &scope,
            "SELECT id, name FROM people WHERE name = ?",
            &[RowValues::Text("brian".into())],
        )
        .await
        .scan_two()?;
    assert_eq!((id, name.as_str()), (2, "brian"));

    let nullable: Option<String> = client
        .query_row(&scope, "SELECT NULL", &[])
        .await
        .scan_one()?;
    assert_eq!(nullable, None);

    let err = client
        .query_row(&scope, "SELECT name FROM people WHERE id = 1", &[])
        .await
        .scan_one::<i64>()
        .unwrap_err();
    assert!(matches!(err, SqlRegistryError::Scan(_)), "{err}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn driver_failures_carry_kind_and_query() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let client = seeded_client("failures").await?;
    let scope = Scope::new();

    let err = client
        .exec(&scope, "INSERT INTO nowhere VALUES (1)", &[])
        .await
        .unwrap_err();
    match &err {
        SqlRegistryError::OperationError { kind, query, .. } => {
            assert_eq!(*kind, ErrorKind::Db);
            assert_eq!(query, "INSERT INTO nowhere VALUES (1)");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().starts_with("db-err while running"));

    let row = client.query_row(&scope, "SELECT * FROM nowhere", &[]).await;
    assert!(row.err().is_some());
    assert!(matches!(
        row.scan(),
        Err(SqlRegistryError::OperationError { kind: ErrorKind::Row, .. })
    ));

    let err = client
        .query(&scope, "SELECT * FROM nowhere", &[])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SqlRegistryError::OperationError { kind: ErrorKind::Rows, .. }
    ));

    let dup = client
        .exec(
            &scope,
            "INSERT INTO people (id, name) VALUES (?1, ?2)",
            &[RowValues::Int(1), RowValues::Text("again".into())],
        )
        .await
        .unwrap_err();
    assert!(matches!(dup, SqlRegistryError::OperationError { .. }));

    // Failures never close the client.
    assert!(!client.is_closed());
    client.ping(&scope).await?;
    Ok(())
}
