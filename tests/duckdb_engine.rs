//! Integration tests against the real in-memory DuckDB engine.

use std::path::Path;
use std::sync::Once;

use arrow_array::{Array, Int32Array, Int64Array, StringArray};
use futures::StreamExt;
use sqldeck::{
    DbSession, ExportFormat, QueryOptions, QueryParam, QueryResponse, WorkbenchConfig,
};

fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with_target(false)
            .compact()
            .try_init();
    });
}

fn workbench() -> DbSession {
    init_logging();
    DbSession::new(WorkbenchConfig::default())
}

fn first_int64(response: &QueryResponse) -> i64 {
    let batch = response.batches.first().expect("at least one batch");
    batch
        .column(0)
        .as_any()
        .downcast_ref::<Int64Array>()
        .expect("int64 column")
        .value(0)
}

fn string_column(response: &QueryResponse, index: usize) -> Vec<String> {
    let mut out = Vec::new();
    for batch in &response.batches {
        let column = batch
            .column(index)
            .as_any()
            .downcast_ref::<StringArray>()
            .expect("string column");
        for i in 0..column.len() {
            if !column.is_null(i) {
                out.push(column.value(i).to_string());
            }
        }
    }
    out
}

async fn write_csv(dir: &Path, name: &str, contents: &str) -> anyhow::Result<std::path::PathBuf> {
    let path = dir.join(name);
    tokio::fs::write(&path, contents).await?;
    Ok(path)
}

#[tokio::test]
async fn select_one_roundtrip() -> anyhow::Result<()> {
    let session = workbench();
    let response = session.fetch_all("SELECT 1 AS one", &QueryOptions::new()).await;

    assert!(response.is_success(), "error: {:?}", response.error);
    assert_eq!(response.total_rows(), 1);
    let schema = response.schema.as_ref().expect("schema");
    assert_eq!(schema.field(0).name(), "one");
    let value = response.batches[0]
        .column(0)
        .as_any()
        .downcast_ref::<Int32Array>()
        .expect("int32 column")
        .value(0);
    assert_eq!(value, 1);
    Ok(())
}

#[tokio::test]
async fn registered_csv_is_queryable_and_replaceable() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let first = write_csv(dir.path(), "v1.csv", "id,name\n1,alpha\n2,beta\n").await?;
    let second = write_csv(dir.path(), "v2.csv", "id,name\n1,a\n2,b\n3,c\n").await?;
    let session = workbench();

    session.register_file_path("people.csv", &first).await?;
    let count = session
        .fetch_all(
            "SELECT count(*) AS n FROM \"people.csv\"",
            &QueryOptions::uncached(),
        )
        .await;
    assert!(count.is_success(), "error: {:?}", count.error);
    assert_eq!(first_int64(&count), 2);

    // same path, new file: old registration must be replaced, not shadowed
    session.register_file_path("people.csv", &second).await?;
    let replaced = session
        .fetch_all(
            "SELECT count(*) AS n FROM \"people.csv\"",
            &QueryOptions::uncached(),
        )
        .await;
    assert_eq!(first_int64(&replaced), 3);
    assert_eq!(session.sources().len(), 1);
    Ok(())
}

#[tokio::test]
async fn reset_leaves_sources_queryable_without_reregistration() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = write_csv(dir.path(), "sales.csv", "amount\n10\n20\n").await?;
    let session = workbench();
    session.register_file_path("sales.csv", &path).await?;

    let before = session
        .fetch_all(
            "SELECT count(*) AS n FROM \"sales.csv\"",
            &QueryOptions::uncached(),
        )
        .await;
    assert_eq!(first_int64(&before), 2);
    let session_id = session.session_id().map(|id| id.to_string());

    session.reset().await?;

    let after = session
        .fetch_all(
            "SELECT count(*) AS n FROM \"sales.csv\"",
            &QueryOptions::uncached(),
        )
        .await;
    assert!(after.is_success(), "error: {:?}", after.error);
    assert_eq!(first_int64(&after), 2);
    assert_eq!(session.session_id().map(|id| id.to_string()), session_id);
    Ok(())
}

#[tokio::test]
async fn unregistered_sources_disappear() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = write_csv(dir.path(), "tmp.csv", "x\n1\n").await?;
    let session = workbench();
    session.register_file_path("tmp.csv", &path).await?;
    session.ensure_open().await?;

    assert!(session.unregister("tmp.csv").await?);
    let gone = session
        .fetch_all("SELECT * FROM \"tmp.csv\"", &QueryOptions::uncached())
        .await;
    assert!(!gone.is_success());
    assert!(session.sources().is_empty());
    Ok(())
}

#[tokio::test]
async fn exec_reports_affected_rows() -> anyhow::Result<()> {
    let session = workbench();
    session
        .exec("CREATE TABLE people (id INTEGER, name VARCHAR)")
        .await?;
    let inserted = session
        .exec("INSERT INTO people VALUES (1, 'alpha'), (2, 'beta'), (3, 'gamma')")
        .await?;
    assert_eq!(inserted, 3);

    let deleted = session.exec("DELETE FROM people WHERE id > 1").await?;
    assert_eq!(deleted, 2);
    Ok(())
}

#[tokio::test]
async fn describe_table_lists_columns() -> anyhow::Result<()> {
    let session = workbench();
    session
        .exec("CREATE TABLE t (id INTEGER, name VARCHAR)")
        .await?;

    let described = session.describe_table("t").await;
    assert!(described.is_success(), "error: {:?}", described.error);
    assert_eq!(described.total_rows(), 2);
    let names = string_column(&described, 0);
    assert_eq!(names, vec!["id", "name"]);
    Ok(())
}

#[tokio::test]
async fn validate_accepts_good_sql_and_rejects_bad() -> anyhow::Result<()> {
    let session = workbench();
    session.exec("CREATE TABLE t (id INTEGER)").await?;

    session.validate_query("SELECT id FROM t").await?;
    assert!(session.validate_query("SELEC 1").await.is_err());
    assert!(session
        .validate_query("SELECT missing FROM nowhere")
        .await
        .is_err());
    Ok(())
}

#[tokio::test]
async fn export_writes_rows_to_disk() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let session = workbench();
    session
        .exec("CREATE TABLE trips (id INTEGER, city VARCHAR)")
        .await?;
    session
        .exec("INSERT INTO trips VALUES (1, 'lisbon'), (2, 'porto'), (3, 'faro')")
        .await?;

    let csv_dest = dir.path().join("trips.csv");
    let written = session
        .export_table("trips", ExportFormat::Csv, &csv_dest)
        .await?;
    assert_eq!(written, 3);
    let contents = tokio::fs::read_to_string(&csv_dest).await?;
    assert!(contents.contains("lisbon"));

    let parquet_dest = dir.path().join("trips.parquet");
    session
        .export_table("trips", ExportFormat::Parquet, &parquet_dest)
        .await?;
    assert!(tokio::fs::metadata(&parquet_dest).await?.len() > 0);
    Ok(())
}

#[tokio::test]
async fn large_results_stream_in_batches() -> anyhow::Result<()> {
    let session = workbench();
    let mut stream = session.run("SELECT * FROM range(5000)", &[]).await?;
    assert_eq!(stream.schema().field(0).name(), "range");

    let mut total = 0;
    while let Some(batch) = stream.next().await {
        total += batch?.num_rows();
    }
    assert_eq!(total, 5000);
    assert_eq!(session.pool_stats().idle, 1);
    Ok(())
}

#[tokio::test]
async fn parameters_bind_positionally() -> anyhow::Result<()> {
    let session = workbench();
    let mut stream = session
        .run(
            "SELECT CAST(? AS BIGINT) + 1 AS answer",
            &[QueryParam::Int(41)],
        )
        .await?;
    let batch = stream.next().await.expect("one batch")?;
    let answer = batch
        .column(0)
        .as_any()
        .downcast_ref::<Int64Array>()
        .expect("int64 column")
        .value(0);
    assert_eq!(answer, 42);
    Ok(())
}

#[tokio::test]
async fn empty_results_keep_their_schema() -> anyhow::Result<()> {
    let session = workbench();
    let response = session
        .fetch_all("SELECT 1 AS one WHERE false", &QueryOptions::new())
        .await;
    assert!(response.is_success(), "error: {:?}", response.error);
    assert_eq!(response.total_rows(), 0);
    let schema = response.schema.as_ref().expect("schema survives emptiness");
    assert_eq!(schema.field(0).name(), "one");
    Ok(())
}

#[tokio::test]
async fn repeat_queries_hit_the_cache() -> anyhow::Result<()> {
    let session = workbench();
    let first = session
        .fetch_all("SELECT * FROM range(10)", &QueryOptions::new())
        .await;
    assert!(first.is_success(), "error: {:?}", first.error);
    assert!(!first.meta.cache_hit);

    let second = session
        .fetch_all("SELECT * FROM range(10)", &QueryOptions::new())
        .await;
    assert!(second.meta.cache_hit);
    assert_eq!(second.meta.row_count, 10);
    assert_eq!(second.total_rows(), 10);
    Ok(())
}

#[tokio::test]
async fn dispose_destroys_engine_state() -> anyhow::Result<()> {
    let session = workbench();
    session.exec("CREATE TABLE scratch (x INTEGER)").await?;
    let first_id = session.session_id().map(|id| id.to_string());

    session.dispose().await;

    let gone = session
        .fetch_all("SELECT * FROM scratch", &QueryOptions::new())
        .await;
    assert!(!gone.is_success(), "in-memory state must not survive dispose");
    let second_id = session.session_id().map(|id| id.to_string());
    assert!(second_id.is_some());
    assert_ne!(first_id, second_id);
    Ok(())
}

#[tokio::test]
async fn suggestions_include_static_keywords() -> anyhow::Result<()> {
    let session = workbench();
    session.ensure_open().await?;

    let suggestions = session.suggest("sel", "sel", None).await;
    assert!(suggestions.iter().any(|s| s.text == "SELECT"));
    Ok(())
}

#[tokio::test]
async fn cancelled_query_reports_cancellation() -> anyhow::Result<()> {
    let session = workbench();
    let token = sqldeck::CancelToken::default();
    token.cancel();

    let response = session
        .fetch_all(
            "SELECT * FROM range(1000000)",
            &QueryOptions::new().with_cancel(token),
        )
        .await;
    assert!(!response.is_success());
    assert!(matches!(
        response.error,
        Some(sqldeck::WorkbenchError::Cancelled)
    ));
    Ok(())
}
