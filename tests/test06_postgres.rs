#![cfg(feature = "postgres")]

//! Runs against a live server named by `SQL_REGISTRY_PG_DSN`, e.g.
//! `host=localhost user=postgres password=postgres dbname=postgres`. Skipped when unset.

mod common;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::init_tracing;
use sql_registry::prelude::*;

fn dsn() -> Option<String> {
    std::env::var("SQL_REGISTRY_PG_DSN").ok().filter(|s| !s.is_empty())
}

fn table_name(prefix: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{prefix}_{nanos}")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn postgres_round_trip() -> Result<(), Box<dyn std::error::Error>> {
    let Some(dsn) = dsn() else {
        return Ok(());
    };
    init_tracing();

    let registry = Registry::new();
    registry
        .register(
            "pg",
            DbConfig::postgres(dsn)
                .with_max_active(4)
                .with_max_idle(1)
                .with_query_timeout(Duration::from_millis(500)),
        )
        .await?;
    let client = registry.get("pg").await?;
    let scope = Scope::new();
    let table = table_name("registry_rt");

    client
        .exec(
            &scope,
            &format!("CREATE TABLE {table} (id INT4 PRIMARY KEY, name TEXT NOT NULL, score FLOAT8, seen TIMESTAMP)"),
            &[],
        )
        .await?;

    let seen = chrono::NaiveDate::from_ymd_opt(2024, 5, 1)
        .and_then(|d| d.and_hms_opt(12, 30, 0))
        .expect("valid timestamp");
    let insert = client
        .prepare(&format!("INSERT INTO {table} (id, name, score, seen) VALUES ($1, $2, $3, $4)"))
        .await?;
    assert_eq!(insert.compiled().expect("compiled").param_count(), 4);
    insert
        .exec(
            &scope,
            &[
                RowValues::Int(1),
                RowValues::Text("ada".into()),
                RowValues::Float(9.5),
                RowValues::Timestamp(seen),
            ],
        )
        .await?;

    let record = client
        .query_row(&scope, &format!("SELECT id, name, score, seen FROM {table} WHERE id = $1"), &[RowValues::Int(1)])
        .await
        .scan()?;
    assert_eq!(record.try_get::<i64>("id")?, 1);
    assert_eq!(record.try_get::<String>("name")?, "ada");
    assert_eq!(record.try_get::<f64>("score")?, 9.5);
    assert_eq!(record.try_get::<chrono::NaiveDateTime>("seen")?, seen);

    let none = client
        .query_row(&scope, &format!("SELECT id FROM {table} WHERE id = $1"), &[RowValues::Int(2)])
        .await;
    assert!(none.scan().unwrap_err().is_no_rows());

    let tx = client.begin(&scope).await?;
    tx.exec(
        &format!("INSERT INTO {table} (id, name) VALUES ($1, $2)"),
        &[RowValues::Int(2), RowValues::Text("brian".into())],
    )
    .await?;
    tx.rollback().await?;
    let count: i64 = client
        .query_row(&scope, &format!("SELECT count(*) FROM {table}"), &[])
        .await
        .scan_one()?;
    assert_eq!(count, 1);

    // pg_sleep outlives the query budget; the server-side cancel frees the connection.
    let err = client
        .query_row(&scope, "SELECT pg_sleep(5)", &[])
        .await
        .scan()
        .unwrap_err();
    assert!(err.is_deadline_exceeded(), "{err}");
    client.ping(&scope).await?;

    client.exec(&scope, &format!("DROP TABLE {table}"), &[]).await?;
    registry.close_all().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn postgres_statement_heals() -> Result<(), Box<dyn std::error::Error>> {
    let Some(dsn) = dsn() else {
        return Ok(());
    };
    let registry = Registry::new();
    registry
        .register("pg-heal", DbConfig::postgres(dsn).with_max_active(2).with_max_idle(1))
        .await?;
    let client = registry.get("pg-heal").await?;
    let scope = Scope::new();
    let table = table_name("registry_heal");

    let stmt = client
        .prepared(&format!("SELECT count(*) FROM {table}"))
        .await;
    assert!(!stmt.is_ready());

    client
        .exec(&scope, &format!("CREATE TABLE {table} (id INT4)"), &[])
        .await?;
    for _ in 0..80 {
        if stmt.is_ready() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(stmt.is_ready());
    let count: i64 = stmt.query_row(&scope, &[]).await.scan_one()?;
    assert_eq!(count, 0);

    client.exec(&scope, &format!("DROP TABLE {table}"), &[]).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn postgres_timeout_cancels_on_the_server() -> Result<(), Box<dyn std::error::Error>> {
    let Some(dsn) = dsn() else {
        return Ok(());
    };
    init_tracing();

    let registry = Registry::new();
    registry
        .register(
            "pg-cancel",
            DbConfig::postgres(dsn)
                .with_max_active(1)
                .with_max_idle(1)
                .with_exec_timeout(Duration::from_millis(300)),
        )
        .await?;
    let client = registry.get("pg-cancel").await?;

    let err = client
        .exec(&Scope::new(), "SELECT pg_sleep(5)", &[])
        .await
        .unwrap_err();
    assert!(err.is_deadline_exceeded(), "{err}");

    // The single connection only frees up this fast if the sleep was cancelled.
    let started = std::time::Instant::now();
    let one: i64 = client
        .query_row(&Scope::with_timeout(Duration::from_secs(3)), "SELECT 1::INT8", &[])
        .await
        .scan_one()?;
    assert_eq!(one, 1);
    assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn postgres_failed_statement_ends_the_transaction() -> Result<(), Box<dyn std::error::Error>> {
    let Some(dsn) = dsn() else {
        return Ok(());
    };
    init_tracing();

    let registry = Registry::new();
    registry
        .register("pg-tx", DbConfig::postgres(dsn).with_max_active(2).with_max_idle(1))
        .await?;
    let client = registry.get("pg-tx").await?;

    let tx = client.begin(&Scope::new()).await?;
    assert!(tx.exec("SELECT 1 / 0", &[]).await.is_err());
    assert!(!tx.is_active());
    assert!(matches!(tx.commit().await.unwrap_err(), SqlRegistryError::TxDone));

    let one: i64 = client
        .query_row(&Scope::new(), "SELECT 1::INT8", &[])
        .await
        .scan_one()?;
    assert_eq!(one, 1);
    Ok(())
}
