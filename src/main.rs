//! dbcore probe - Main entry point.
//!
//! Opens a client for one database, optionally prints its schema metadata,
//! executes statements through the result streamer and listens for
//! notifications.

use clap::Parser;
use dbcore::config::Config;
use dbcore::db::{Client, QueryResult, ResultStreamer, RetryingStarter, RowReaderRegistry};
use dbcore::models::{QueryTiming, RowResult};
use serde_json::{Map, Value as JsonValue, json};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    // Logs go to stderr so stdout carries only results
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

/// Render one result as a JSON document.
async fn render_result(mut result: QueryResult<QueryTiming>) -> JsonValue {
    let mut rows = Vec::new();
    let mut errors = Vec::new();

    while let Some(item) = result.next_row().await {
        match item {
            RowResult::Row(values) => {
                let mut row = Map::new();
                for (column, value) in result.columns.iter().zip(values) {
                    column.observe_scalar(&value);
                    row.insert(column.display_name().to_string(), value);
                }
                rows.push(JsonValue::Object(row));
            }
            RowResult::Error(e) => errors.push(JsonValue::String(e.to_string())),
        }
    }

    let columns: Vec<JsonValue> = result
        .columns
        .iter()
        .map(|c| {
            json!({
                "name": c.display_name(),
                "type": c.data_type,
                "scalar": c.is_scalar(),
            })
        })
        .collect();

    json!({
        "columns": columns,
        "rows": rows,
        "errors": errors,
        "timing": result.timing().await,
    })
}

async fn run_statements(client: &Client, statements: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let streamer = ResultStreamer::new();

    let consume = async {
        let outcome = async {
            while let Some(result) = streamer.next_result().await {
                let rendered = render_result(result).await;
                println!("{}", serde_json::to_string_pretty(&rendered)?);
                streamer.acknowledge()?;
            }
            Ok::<(), Box<dyn std::error::Error>>(())
        }
        .await;
        if outcome.is_err() {
            // Release the executor if it is waiting on an acknowledgement
            streamer.close();
        }
        outcome
    };

    let (executed, consumed) = tokio::join!(client.execute(statements, &streamer), consume);
    consumed?;
    executed?;
    Ok(())
}

async fn listen(client: &Client, secs: u64) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = CancellationToken::new();
    let listener = client.notification_listener(&shutdown).await?;
    listener.register_callback(|n| {
        let line = json!({
            "channel": n.channel,
            "payload": n.payload,
            "process_id": n.process_id,
        });
        println!("{}", line);
    })?;

    info!(channel = %listener.channel(), secs, "Waiting for notifications");
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }
    shutdown.cancel();
    listener.stop().await;
    Ok(())
}

async fn run(config: &Config, client: &Client) -> Result<(), Box<dyn std::error::Error>> {
    if config.schema {
        let metadata = client.schema_metadata().await?;
        println!("{}", serde_json::to_string_pretty(&metadata)?);
    }

    if !config.statements.is_empty() {
        run_statements(client, &config.statements).await?;
    }

    if let Some(secs) = config.listen {
        listen(client, secs).await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    info!("Starting dbcore v{}", env!("CARGO_PKG_VERSION"));

    let (connection_string, options) = config.client_options()?;
    let mut client = Client::open(&connection_string, options, &RowReaderRegistry::standard()).await?;
    if config.start_attempts > 1 {
        client = client.with_query_starter(Arc::new(RetryingStarter::new(
            config.start_attempts,
            config.retry_backoff(),
        )));
    }

    if !config.schema && config.statements.is_empty() && config.listen.is_none() {
        warn!("Nothing to do: pass --schema, --execute or --listen");
    }

    let result = run(&config, &client).await;
    client.close().await;

    if let Err(e) = result {
        error!(error = %e, "dbcore failed");
        return Err(e);
    }

    info!("Done");
    Ok(())
}
