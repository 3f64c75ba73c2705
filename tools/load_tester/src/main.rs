use std::time::{Duration, Instant};

use clap::Parser;
use reqwest::Client;
use serde_json::Value;
use tokio::task::JoinSet;

use platform::{record_counter, record_histogram};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "load_tester",
    version,
    about = "Load generator for the query orchestration API"
)]
struct Args {
    /// Base URL of the orchestrator (e.g. http://127.0.0.1:8080)
    #[arg(long)]
    base_url: String,

    /// Number of worker loops submitting queries
    #[arg(long, default_value_t = 16)]
    concurrency: usize,

    /// Duration to run the test (in seconds)
    #[arg(long, default_value_t = 60)]
    duration_secs: u64,

    /// Query text to submit
    #[arg(long, default_value = "What is the capital of France?")]
    query: String,

    /// Follow each request to its terminal state before submitting the next
    #[arg(long, default_value_t = false)]
    wait_for_completion: bool,
}

/// Terminal disposition of one submitted request, as seen by the fetch
/// endpoint.
enum Outcome {
    Accepted,
    Complete,
    Failed,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = platform::init_tracing("load_tester") {
        eprintln!("failed to init tracing: {e}");
    }

    let client = Client::new();
    let deadline = Instant::now() + Duration::from_secs(args.duration_secs);

    // Each worker owns one request slot, so submission concurrency equals
    // the worker count and needs no extra coordination.
    let mut workers = JoinSet::new();
    for _ in 0..args.concurrency {
        let client = client.clone();
        let args = args.clone();
        workers.spawn(async move {
            let mut driven = 0u64;
            while Instant::now() < deadline {
                match drive_request(&client, &args, deadline).await {
                    Ok(Outcome::Accepted) => record_counter("load_tester_accepted_total", 1),
                    Ok(Outcome::Complete) => record_counter("load_tester_completed_total", 1),
                    Ok(Outcome::Failed) => record_counter("load_tester_failed_total", 1),
                    Err(e) => {
                        record_counter("load_tester_errors_total", 1);
                        eprintln!("request error: {e}");
                    }
                }
                driven += 1;
            }
            driven
        });
    }

    let mut total = 0u64;
    while let Some(joined) = workers.join_next().await {
        total += joined.unwrap_or(0);
    }

    tracing::info!(
        base_url = %args.base_url,
        concurrency = args.concurrency,
        duration_secs = args.duration_secs,
        requests = total,
        "load run finished"
    );
}

/// Submit one query and, when asked, follow it through the fetch endpoint
/// until it reaches a terminal state.
async fn drive_request(client: &Client, args: &Args, deadline: Instant) -> Result<Outcome, String> {
    let started = Instant::now();
    let base = args.base_url.trim_end_matches('/');

    let request_id = submit_query(client, base, &args.query).await?;
    record_counter("load_tester_submissions_total", 1);

    let outcome = if args.wait_for_completion {
        poll_until_terminal(client, base, &request_id, deadline).await?
    } else {
        Outcome::Accepted
    };

    record_histogram(
        "load_tester_request_duration_seconds",
        started.elapsed().as_secs_f64(),
    );
    Ok(outcome)
}

async fn submit_query(client: &Client, base: &str, query: &str) -> Result<String, String> {
    let body = client
        .post(format!("{base}/api/v1/queries"))
        .json(&serde_json::json!({ "query": query }))
        .send()
        .await
        .map_err(|e| format!("submit failed: {e}"))?
        .json::<Value>()
        .await
        .map_err(|e| format!("submit response unreadable: {e}"))?;

    body.get("request_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| format!("submit response missing request_id: {body}"))
}

async fn poll_until_terminal(
    client: &Client,
    base: &str,
    request_id: &str,
    deadline: Instant,
) -> Result<Outcome, String> {
    let fetch_url = format!("{base}/api/v1/queries/{request_id}");

    loop {
        if Instant::now() >= deadline {
            return Err(format!("request {request_id} still processing at shutdown"));
        }
        tokio::time::sleep(Duration::from_millis(250)).await;

        let body = client
            .get(&fetch_url)
            .send()
            .await
            .map_err(|e| format!("fetch failed: {e}"))?
            .json::<Value>()
            .await
            .map_err(|e| format!("fetch response unreadable: {e}"))?;

        match body.get("status").and_then(Value::as_str) {
            Some("processing") => continue,
            Some("complete") => return Ok(Outcome::Complete),
            Some("failed") => return Ok(Outcome::Failed),
            other => return Err(format!("unexpected fetch status {other:?}")),
        }
    }
}
