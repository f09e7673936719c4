//! sqlweave - run one statement against a SQLite database.
//!
//! Rows are printed as JSON lines. With `--key`, `--group` or `--one` they are
//! collected through the pipeline and printed as one JSON document instead.

use clap::Parser;
use sqlweave::config::Config;
use sqlweave::db::{Binding, Database, SqliteConnector};
use sqlweave::error::{DbError, DbResult};
use sqlweave::pipeline::Collection;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> DbResult<String> {
    serde_json::to_string(value).map_err(|e| DbError::internal(e.to_string()))
}

/// Print each row as a JSON line while it is read. Autocommit, no retry.
async fn stream_rows(
    db: &Database<SqliteConnector>,
    sql: String,
    params: Vec<Binding>,
) -> DbResult<usize> {
    db.with_connection(move |session| {
        Box::pin(async move {
            let mut procedure = session.prepare(sql);
            for binding in params {
                procedure.push_binding(binding);
            }
            let mut cursor = procedure.fetch().await?;
            let mut count = 0;
            while let Some(row) = cursor.next().await? {
                println!("{}", to_json(&row)?);
                count += 1;
            }
            Ok::<_, DbError>(count)
        })
    })
    .await
}

async fn execute(
    db: &Database<SqliteConnector>,
    sql: String,
    params: Vec<Binding>,
) -> DbResult<(u64, i64)> {
    db.with_session(move |session| {
        let sql = sql.clone();
        let params = params.clone();
        Box::pin(async move {
            let mut procedure = session.prepare(sql);
            for binding in params {
                procedure.push_binding(binding);
            }
            let last_insert_id = procedure.insert().await?;
            Ok::<_, DbError>((procedure.affected_rows(), last_insert_id))
        })
    })
    .await
}

async fn collect(
    db: &Database<SqliteConnector>,
    config: &Config,
) -> Result<Collection, Box<dyn std::error::Error>> {
    let group = config.group_target()?;
    let sql = config.sql.clone();
    let params = config.params.clone();
    let key = config.key.clone();
    let one = config.one;

    let collection = db
        .with_session(move |session| {
            let sql = sql.clone();
            let params = params.clone();
            let key = key.clone();
            let group = group.clone();
            Box::pin(async move {
                let mut procedure = session.prepare(sql);
                for binding in params {
                    procedure.push_binding(binding);
                }
                let pipeline = match (key, one) {
                    (Some(column), true) => procedure.process_one_by(column),
                    (Some(column), false) => procedure.process_all_by(column),
                    (None, true) => procedure.process_one(),
                    (None, false) => procedure.process_all(),
                };
                let pipeline = match group {
                    Some((column, label)) => pipeline.select_value(column).group_into(label),
                    None => pipeline,
                };
                pipeline.collect_all().await
            })
        })
        .await?;
    Ok(collection)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();

    init_tracing(&config);

    let db_config = config.database_config()?;
    info!(
        database = %db_config.connection_string,
        "Starting sqlweave v{}",
        env!("CARGO_PKG_VERSION")
    );
    let db = Database::from_config(&db_config)?;

    let result: Result<(), Box<dyn std::error::Error>> = if config.execute {
        execute(&db, config.sql.clone(), config.params.clone())
            .await
            .map(|(rows_affected, last_insert_id)| {
                println!(
                    "{}",
                    serde_json::json!({
                        "rows_affected": rows_affected,
                        "last_insert_id": last_insert_id,
                    })
                );
            })
            .map_err(Into::into)
    } else if config.collects() {
        match collect(&db, &config).await {
            Ok(collection) => serde_json::to_string_pretty(&collection)
                .map(|json| println!("{}", json))
                .map_err(Into::into),
            Err(e) => Err(e),
        }
    } else {
        stream_rows(&db, config.sql.clone(), config.params.clone())
            .await
            .map(|count| info!(rows = count, "Streamed rows"))
            .map_err(Into::into)
    };

    db.close().await;

    if let Err(e) = result {
        error!(error = %e, "Statement failed");
        if let Some(suggestion) = e.downcast_ref::<DbError>().and_then(DbError::suggestion) {
            eprintln!("Hint: {}", suggestion);
        }
        return Err(e);
    }

    Ok(())
}
