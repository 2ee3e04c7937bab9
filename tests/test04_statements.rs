#![cfg(feature = "sqlite")]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{init_tracing, unique_db_path};
use sql_registry::prelude::*;
use sql_registry::{DriverError, RETRY_INTERVAL};

async fn client(prefix: &str) -> Result<Arc<Client>, SqlRegistryError> {
    let registry = Registry::new();
    registry
        .register(
            prefix,
            DbConfig::sqlite(unique_db_path(prefix))
                .with_max_active(4)
                .with_max_idle(1),
        )
        .await?;
    registry.get(prefix).await
}

async fn wait_until_ready(stmt: &Stmt, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if stmt.is_ready() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    stmt.is_ready()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn absent_statement_heals_once_schema_exists() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let client = client("heal").await?;
    let scope = Scope::new();

    let insert = client
        .prepared("INSERT INTO jobs (id, state) VALUES (?1, ?2)")
        .await;
    assert_eq!(insert.state(), StatementState::Absent);
    assert!(insert.compiled().is_none());

    let params = [RowValues::Int(1), RowValues::Text("queued".into())];
    assert!(insert.exec(&scope, &params).await.unwrap_err().is_not_ready());
    assert!(insert.query(&scope, &params).await.unwrap_err().is_not_ready());
    assert!(
        insert
            .query_row(&scope, &params)
            .await
            .scan()
            .unwrap_err()
            .is_not_ready()
    );

    client
        .exec(
            &scope,
            "CREATE TABLE jobs (id INTEGER PRIMARY KEY, state TEXT NOT NULL)",
            &[],
        )
        .await?;

    assert!(wait_until_ready(&insert, RETRY_INTERVAL * 4).await);
    let compiled = insert.compiled().expect("compiled");
    assert_eq!(compiled.param_count(), 2);
    assert_eq!(compiled.sql(), insert.query_text());

    let res = insert.exec(&scope, &params).await?;
    assert_eq!(res.rows_affected, 1);
    let state: String = client
        .query_row(&scope, "SELECT state FROM jobs WHERE id = 1", &[])
        .await
        .scan_one()?;
    assert_eq!(state, "queued");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn compiled_statement_runs_queries() -> Result<(), Box<dyn std::error::Error>> {
    let client = client("compiled").await?;
    let scope = Scope::new();
    client
        .exec(&scope, "CREATE TABLE kv (k TEXT PRIMARY KEY, v INTEGER)", &[])
        .await?;

    let put = client.prepared("INSERT INTO kv (k, v) VALUES (?1, ?2)").await;
    assert!(put.is_ready());
    for (k, v) in [("a", 1), ("b", 2), ("c", 3)] {
        put.exec(&scope, &[RowValues::Text(k.into()), RowValues::Int(v)])
            .await?;
    }

    let lookup = client.prepare("SELECT k, v FROM kv WHERE v >= ? ORDER BY k").await?;
    assert_eq!(
        lookup.compiled().expect("compiled").columns(),
        ["k".to_string(), "v".to_string()]
    );
    let records = lookup
        .query(&scope, &[RowValues::Int(2)])
        .await?
        .collect()
        .await?;
    let keys: Vec<String> = records
        .iter()
        .map(|r| r.try_get::<String>("k"))
        .collect::<Result<_, _>>()?;
    assert_eq!(keys, ["b", "c"]);

    let (k, v): (String, i64) = lookup
        .query_row(&scope, &[RowValues::Int(3)])
        .await
        .scan_two()?;
    assert_eq!((k.as_str(), v), ("c", 3));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn eager_prepare_reports_compile_errors() -> Result<(), Box<dyn std::error::Error>> {
    let client = client("eager").await?;
    let err = client.prepare("SELECT * FROM missing_table").await.unwrap_err();
    assert!(
        matches!(err, SqlRegistryError::OperationError { kind: ErrorKind::Db, ref query, .. } if query == "SELECT * FROM missing_table"),
        "{err}"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_parameter_count_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let client = client("arity").await?;
    let scope = Scope::new();
    client
        .exec(&scope, "CREATE TABLE one (id INTEGER PRIMARY KEY)", &[])
        .await?;
    let stmt = client.prepare("INSERT INTO one (id) VALUES (?)").await?;

    let err = stmt
        .exec(&scope, &[RowValues::Int(1), RowValues::Int(2)])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SqlRegistryError::OperationError {
            kind: ErrorKind::Stmt,
            source: DriverError::Parameter(_),
            ..
        }
    ));
    stmt.exec(&scope, &[RowValues::Int(1)]).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn closed_statement_stops_retrying() -> Result<(), Box<dyn std::error::Error>> {
    let client = client("closed-stmt").await?;
    let scope = Scope::new();

    let stmt = client.prepared("SELECT id FROM later").await;
    stmt.close();
    assert!(stmt.is_closed());

    client
        .exec(&scope, "CREATE TABLE later (id INTEGER PRIMARY KEY)", &[])
        .await?;
    tokio::time::sleep(RETRY_INTERVAL * 2 + Duration::from_millis(500)).await;

    assert_eq!(stmt.state(), StatementState::Absent);
    assert!(matches!(
        stmt.exec(&scope, &[]).await.unwrap_err(),
        SqlRegistryError::Closed(_)
    ));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn transactions_refuse_absent_statements() -> Result<(), Box<dyn std::error::Error>> {
    let client = client("tx-absent").await?;
    let stmt = client.prepared("UPDATE nothing SET x = 1").await;

    let tx = client.begin(&Scope::new()).await?;
    let err = tx.stmt(&stmt).unwrap_err();
    assert!(err.is_not_ready());
    tx.rollback().await?;
    stmt.close();
    Ok(())
}
