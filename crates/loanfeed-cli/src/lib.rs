//! Collaborators around the loanfeed core: the marketplace listing client,
//! the CLI surface, and the delay-accounted collection loop.
//!
//! The core crates only require a reporting instant, raw listings, and a
//! live gateway; everything here can be swapped without touching them.

#![allow(clippy::missing_errors_doc)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use loanfeed_core::LoanRecord;
use loanfeed_store_sqlite::{ingest, IngestOutcome, SqliteGateway};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_BASE_URL: &str = "https://api.lendingclub.com/api/investor/v1";

/// Environment fallback for the marketplace API token.
pub const TOKEN_ENV_VAR: &str = "LOANFEED_API_TOKEN";

#[derive(Debug, Parser)]
#[command(name = "loanfeed")]
#[command(about = "Lending marketplace listing collector")]
pub struct Cli {
    /// Path to the database to write to.
    #[arg(long, short = 'd', default_value = "./loanfeed.sqlite3")]
    pub db: PathBuf,

    /// The minimum amount of time, in seconds, between API requests.
    #[arg(long, short = 's', default_value_t = 60)]
    pub delay: u64,

    /// When specified, also writes logs to this path.
    #[arg(long, short = 'l')]
    pub log: Option<PathBuf>,

    /// The number of requests to make. 0 will run indefinitely.
    #[arg(long, short = 'n', default_value_t = 0)]
    pub number_requests: u64,

    /// The marketplace API token; falls back to LOANFEED_API_TOKEN.
    #[arg(long, short = 't')]
    pub token: Option<String>,

    /// Listing endpoint base URL.
    #[arg(long, default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    /// Request the full listing book rather than only the newest loans.
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    pub show_all: bool,
}

/// One polling cycle's API snapshot, as returned by the listing endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ListingsPayload {
    #[serde(rename = "asOfDate")]
    pub as_of_date: String,
    pub loans: Vec<serde_json::Map<String, serde_json::Value>>,
}

/// Blocking client for the marketplace listing endpoint.
pub struct ListingsClient {
    http: reqwest::blocking::Client,
    base_url: String,
    token: String,
}

impl ListingsClient {
    pub fn new(base_url: String, token: String) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build http client")?;

        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    /// Fetches the current listing snapshot. A non-success status is logged
    /// and yields `None`, which callers treat as "abort this cycle".
    pub fn get_listed_loans(&self, show_all: bool) -> Result<Option<ListingsPayload>> {
        let url = format!("{}/loans/listing", self.base_url);
        let response = self
            .http
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, self.token.as_str())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .query(&[("showAll", show_all)])
            .send()
            .with_context(|| format!("request to {url} failed"))?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!("listing request returned {status}");
            return Ok(None);
        }

        let payload = response
            .json::<ListingsPayload>()
            .context("failed to decode listing payload")?;
        Ok(Some(payload))
    }
}

/// Result of one polling cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Ingested(IngestOutcome),
    Aborted,
}

/// Normalizes every listing in a payload against the shared reporting
/// instant. One malformed listing fails the whole batch; partially
/// normalized snapshots are never ingested.
pub fn build_records(payload: &ListingsPayload) -> Result<Vec<LoanRecord>> {
    payload
        .loans
        .iter()
        .map(|listing| {
            LoanRecord::from_listing(&payload.as_of_date, listing).map_err(anyhow::Error::from)
        })
        .collect::<Result<Vec<_>>>()
        .context("failed to normalize listings")
}

/// Runs one fetch-normalize-ingest cycle.
pub fn run_cycle(
    client: &ListingsClient,
    gateway: &mut SqliteGateway,
    show_all: bool,
) -> Result<CycleOutcome> {
    let Some(payload) = client.get_listed_loans(show_all)? else {
        tracing::warn!("aborting cycle: no API response");
        return Ok(CycleOutcome::Aborted);
    };

    let records = build_records(&payload)?;
    let outcome = ingest(gateway, &payload.as_of_date, &records)?;
    Ok(CycleOutcome::Ingested(outcome))
}

/// Executes the parsed CLI: migrates the database, then polls until the
/// requested number of cycles has run, sleeping only the remainder of the
/// configured delay after each cycle's own run time.
pub fn run_cli(cli: Cli) -> Result<()> {
    init_logging(cli.log.as_deref())?;

    let token = resolve_token(cli.token)?;
    let client = ListingsClient::new(cli.base_url, token)?;
    let mut gateway = SqliteGateway::open(&cli.db);
    gateway.migrate()?;

    let delay = Duration::from_secs(cli.delay);
    let mut request_count: u64 = 0;

    loop {
        let started = Instant::now();
        match run_cycle(&client, &mut gateway, cli.show_all) {
            Ok(CycleOutcome::Ingested(IngestOutcome::Recorded { loans })) => {
                tracing::info!("cycle complete: {loans} loans recorded");
            }
            Ok(CycleOutcome::Ingested(IngestOutcome::AlreadyRecorded)) => {
                tracing::info!("cycle complete: snapshot already recorded");
            }
            Ok(CycleOutcome::Aborted) => {}
            Err(err) => {
                // A failed cycle loses only its own snapshot; the next tick
                // retries wholesale.
                tracing::error!("cycle failed: {err:#}");
            }
        }

        request_count += 1;
        if cli.number_requests != 0 && request_count >= cli.number_requests {
            break;
        }

        let elapsed = started.elapsed();
        if elapsed < delay {
            std::thread::sleep(delay - elapsed);
        }
    }

    Ok(())
}

fn resolve_token(flag: Option<String>) -> Result<String> {
    if let Some(token) = flag {
        if !token.trim().is_empty() {
            return Ok(token);
        }
    }

    match std::env::var(TOKEN_ENV_VAR) {
        Ok(token) if !token.trim().is_empty() => Ok(token),
        _ => Err(anyhow!(
            "an API token is required (--token or {TOKEN_ENV_VAR})"
        )),
    }
}

fn init_logging(log_path: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("failed to create log directory {}", parent.display())
                    })?;
                }
            }

            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;

            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .try_init()
                .map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
        }
        None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init()
            .map_err(|err| anyhow!("failed to install tracing subscriber: {err}")),
    }
}
