//! Dataserver - runs the websocket server over a synthetic query engine.
//!
//! This example demonstrates:
//! - Implementing [`QueryEngine`] with one task per sub-query
//! - Streaming partials through a [`PartialSink`]
//! - Stopping work when the connection cancels the operation
//!
//! # Configuration
//!
//! - `DATASERVER_BIND`: listen address (default `0.0.0.0:9000`)
//! - `DATASERVER_FETCH_TTL_SECS`: fetch TTL in seconds (default 900)
//! - `DATASERVER_DELAY_MS`: synthetic latency per sub-query (default 250)
//! - `RUST_LOG`: log filter (default `info`)
//!
//! # Try it
//!
//! ```text
//! $ cargo run --example dataserver
//! $ websocat ws://127.0.0.1:9000/api/data
//! {"_id":"g1","graphType":"line","name":"cpu","start":1700000000,"series":[{"query":"a"},{"query":"b"}]}
//! ```
//!
//! A sub-query containing `"fail": true` reports a partial error.

use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use metrilyx_dataserver::fetch::{channel, FetchError, FetchHandle, FetchReporter, PartialSink};
use metrilyx_dataserver::protocol::GraphRequest;
use metrilyx_dataserver::{DataserverError, QueryEngine, Result, Server, SubmitRequest};
use serde_json::{json, Map, Value};
use tracing_subscriber::EnvFilter;

/// Engine that answers every sub-query with generated datapoints.
struct SyntheticEngine {
    delay: Duration,
}

impl SyntheticEngine {
    fn from_env() -> Result<Self> {
        let delay = env_parse("DATASERVER_DELAY_MS", 250u64)?;
        Ok(Self {
            delay: Duration::from_millis(delay),
        })
    }
}

impl QueryEngine for SyntheticEngine {
    fn submit(&self, request: SubmitRequest) -> Result<FetchHandle> {
        let (handle, reporter) = channel();
        match request {
            SubmitRequest::Graph(request) => {
                tokio::spawn(run_graph(request, reporter, self.delay));
            }
            SubmitRequest::Annotations(_) => {
                let mut payload = Map::new();
                payload.insert("annoEvents".into(), json!([]));
                reporter.complete(Some(payload));
            }
        }
        Ok(handle)
    }
}

enum Outcome {
    Finished(Vec<Option<Value>>),
    Cancelled,
}

async fn run_graph(request: GraphRequest, mut reporter: FetchReporter, delay: Duration) {
    let sub_queries = request
        .series
        .iter()
        .enumerate()
        .map(|(index, query)| {
            let sink = reporter.partials();
            let query = query.clone();
            let start = request.start;
            tokio::spawn(async move {
                tokio::time::sleep(delay * (index as u32 + 1)).await;
                run_sub_query(sink, index, query, start)
            })
        })
        .collect::<Vec<_>>();
    let aborts: Vec<_> = sub_queries.iter().map(|task| task.abort_handle()).collect();

    let outcome = tokio::select! {
        _ = reporter.cancelled() => Outcome::Cancelled,
        results = futures::future::join_all(sub_queries) => {
            Outcome::Finished(results.into_iter().map(|r| r.ok().flatten()).collect())
        }
    };

    match outcome {
        Outcome::Cancelled => {
            tracing::debug!("Synthetic fetch {} cancelled", request.id);
            aborts.iter().for_each(|task| task.abort());
            reporter.fail(FetchError::Cancelled);
        }
        Outcome::Finished(series) => {
            let series: Vec<Value> = series.into_iter().flatten().collect();
            if series.is_empty() {
                reporter.complete(None);
                return;
            }
            let mut payload = Map::new();
            payload.insert("series".into(), Value::Array(series));
            reporter.complete(Some(payload));
        }
    }
}

/// Report one sub-query and return its series for the aggregate.
fn run_sub_query(sink: PartialSink, index: usize, query: Value, start: f64) -> Option<Value> {
    if query.get("fail").and_then(Value::as_bool).unwrap_or(false) {
        sink.partial_error(index, query, FetchError::Backend("synthetic failure".into()));
        return None;
    }

    let datapoints: Vec<Value> = (0..10)
        .map(|i| json!([start + f64::from(i) * 60.0, (index * 10 + i as usize) as f64]))
        .collect();
    let series = json!({
        "alias": format!("series-{}", index),
        "query": query,
        "datapoints": datapoints,
    });

    let mut payload = Map::new();
    payload.insert("series".into(), json!([series.clone()]));
    sink.partial(index, payload);
    Some(series)
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| DataserverError::Engine(format!("invalid {}={}: {}", name, raw, e))),
        Err(_) => Ok(default),
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let engine = match SyntheticEngine::from_env() {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!("Failed to build query engine: {}", e);
            std::process::exit(2);
        }
    };

    let bind: SocketAddr = env_parse("DATASERVER_BIND", SocketAddr::from(([0, 0, 0, 0], 9000)))?;
    let ttl = env_parse("DATASERVER_FETCH_TTL_SECS", 900u64)?;

    Server::builder()
        .bind(bind)
        .fetch_ttl(Duration::from_secs(ttl))
        .build(Arc::new(engine))
        .serve()
        .await?;

    Ok(())
}
