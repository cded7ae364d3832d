//! `tc`: operator command surface for a running telemetry cache service.
//!
//! - `tc data` prints the latest snapshot of every node.
//! - `tc history <node>` prints one node's retained window.
//! - `tc push` reports a reading the way a sensor node does.
//!
//! Everything goes through the service's HTTP interface; the CLI never holds
//! telemetry state of its own.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use reqwest::blocking::{Client, Response};
use reqwest::Url;
use serde_json::{json, Value};
use telemetry_cache_core::{format_rfc3339, HistoryEntry, NodeKey, Snapshot};
use time::OffsetDateTime;

#[derive(Debug, Parser)]
#[command(name = "tc")]
#[command(about = "Telemetry cache operator CLI")]
pub struct Cli {
    #[arg(long, default_value = "http://127.0.0.1:8000")]
    url: String,

    #[arg(long, default_value_t = 5_000)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Latest reading of every node
    Data(DataArgs),
    /// Retained history of one node, oldest first
    History(HistoryArgs),
    /// Report one reading as a sensor node
    Push(PushArgs),
}

#[derive(Debug, Args)]
pub struct DataArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct HistoryArgs {
    node_id: String,
    /// Keep only the newest N entries
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct PushArgs {
    #[arg(long)]
    node_id: String,
    #[arg(long, allow_negative_numbers = true)]
    temperature: f64,
    #[arg(long, allow_negative_numbers = true)]
    humidity: f64,
}

struct TelemetryClient {
    http: Client,
    base: Url,
}

impl TelemetryClient {
    fn new(base: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base).with_context(|| format!("invalid --url value {base:?}"))?;
        if base.cannot_be_a_base() {
            return Err(anyhow!("--url must be an http(s) base URL, got {base}"));
        }
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http, base })
    }

    fn all_latest(&self) -> Result<BTreeMap<NodeKey, Snapshot>> {
        let url = endpoint(&self.base, &["data"])?;
        let response = self
            .http
            .get(url.clone())
            .send()
            .with_context(|| format!("failed to reach {url}"))?;
        decode(response)
    }

    fn history(&self, node_id: &str) -> Result<Vec<HistoryEntry>> {
        let url = endpoint(&self.base, &["history", node_id])?;
        let response = self
            .http
            .get(url.clone())
            .send()
            .with_context(|| format!("failed to reach {url}"))?;
        decode(response)
    }

    fn push(&self, report: &Value) -> Result<Value> {
        let url = endpoint(&self.base, &["update"])?;
        let response = self
            .http
            .post(url.clone())
            .json(report)
            .send()
            .with_context(|| format!("failed to reach {url}"))?;
        decode(response)
    }
}

/// Executes the parsed CLI.
///
/// # Errors
/// Returns an error when the service is unreachable, answers with a non-2xx
/// status, or returns a body that does not decode.
pub fn run_cli(cli: Cli) -> Result<()> {
    let client = TelemetryClient::new(&cli.url, Duration::from_millis(cli.timeout_ms))?;

    match cli.command {
        Command::Data(args) => {
            let latest = client.all_latest()?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&latest)?);
            } else {
                print!("{}", render_latest_table(&latest));
            }
            Ok(())
        }
        Command::History(args) => {
            let entries = newest(client.history(&args.node_id)?, args.limit);
            if args.json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                print!("{}", render_history_table(&args.node_id, &entries));
            }
            Ok(())
        }
        Command::Push(args) => {
            let ack = client.push(&json!({
                "node_id": args.node_id,
                "temperature": args.temperature,
                "humidity": args.humidity,
            }))?;
            println!("{}", serde_json::to_string_pretty(&ack)?);
            Ok(())
        }
    }
}

fn endpoint(base: &Url, segments: &[&str]) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| anyhow!("--url cannot carry a path: {base}"))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn decode<T: serde::de::DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    let body = response.text().context("failed to read service response")?;

    if !status.is_success() {
        return Err(anyhow!("service returned {status}: {}", error_summary(&body)));
    }

    serde_json::from_str(&body)
        .with_context(|| format!("service response did not decode: {body}"))
}

fn error_summary(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return body.trim().to_string();
    };
    match (
        value["error"]["code"].as_str(),
        value["error"]["message"].as_str(),
    ) {
        (Some(code), Some(message)) => format!("{code}: {message}"),
        _ => body.trim().to_string(),
    }
}

fn newest(mut entries: Vec<HistoryEntry>, limit: Option<usize>) -> Vec<HistoryEntry> {
    match limit {
        Some(limit) => entries.split_off(entries.len().saturating_sub(limit)),
        None => entries,
    }
}

/// Integer node ids sort numerically ahead of other ids, which sort as text.
fn compare_node_keys(lhs: &NodeKey, rhs: &NodeKey) -> Ordering {
    match (lhs.as_str().parse::<i64>(), rhs.as_str().parse::<i64>()) {
        (Ok(left), Ok(right)) => left.cmp(&right).then_with(|| lhs.cmp(rhs)),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => lhs.cmp(rhs),
    }
}

fn timestamp_cell(value: OffsetDateTime) -> String {
    format_rfc3339(value).unwrap_or_else(|_| "-".to_string())
}

fn render_latest_table(latest: &BTreeMap<NodeKey, Snapshot>) -> String {
    if latest.is_empty() {
        return "no nodes have reported yet\n".to_string();
    }

    let mut rows: Vec<(&NodeKey, &Snapshot)> = latest.iter().collect();
    rows.sort_by(|(lhs, _), (rhs, _)| compare_node_keys(lhs, rhs));

    let mut out = format!(
        "{:<16} {:>12} {:>12} timestamp\n{}\n",
        "node_id",
        "temperature",
        "humidity",
        "-".repeat(68)
    );
    for (node_id, snapshot) in rows {
        out.push_str(&format!(
            "{:<16} {:>12.2} {:>12.2} {}\n",
            node_id.as_str(),
            snapshot.reading.temperature,
            snapshot.reading.humidity,
            timestamp_cell(snapshot.timestamp)
        ));
    }
    out
}

fn render_history_table(node_id: &str, entries: &[HistoryEntry]) -> String {
    if entries.is_empty() {
        return format!("no history for node {node_id}\n");
    }

    let mut out = format!(
        "node: {node_id} ({} entries)\n{:<24} {:>12} {:>12}\n{}\n",
        entries.len(),
        "timestamp",
        "temperature",
        "humidity",
        "-".repeat(50)
    );
    for entry in entries {
        out.push_str(&format!(
            "{:<24} {:>12.2} {:>12.2}\n",
            timestamp_cell(entry.timestamp),
            entry.temperature,
            entry.humidity
        ));
    }
    out
}
