use clap::Parser;
use serde_json::{json, Map, Value};

use loanfeed_cli::{build_records, Cli, ListingsPayload};
use loanfeed_core::{CoercionKind, ATTRIBUTES, AS_OF_DATE, FUNDED_AMOUNT, IDENTITY};
use loanfeed_store_sqlite::{ingest, IngestOutcome, SqliteGateway};

fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("expected Ok(..), got error: {err}"),
    }
}

fn fixture_listing(identity: i64) -> Map<String, Value> {
    let mut listing = Map::new();
    for (name, kind) in ATTRIBUTES {
        if *name == AS_OF_DATE {
            continue;
        }
        let value = match kind {
            CoercionKind::Timestamp => json!("2024-01-01T00:00:00Z"),
            CoercionKind::Integer => json!(11),
            CoercionKind::Real => json!("425.50"),
            CoercionKind::Text => json!("sample"),
        };
        listing.insert((*name).to_string(), value);
    }
    listing.insert(IDENTITY.to_string(), json!(identity));
    listing.insert("loanAmount".to_string(), json!("10000"));
    listing.insert(FUNDED_AMOUNT.to_string(), json!("2500"));
    listing
}

#[test]
fn cli_defaults_match_the_collector_contract() {
    let cli = must_ok(Cli::try_parse_from(["loanfeed"]));
    assert_eq!(cli.db.to_string_lossy(), "./loanfeed.sqlite3");
    assert_eq!(cli.delay, 60);
    assert_eq!(cli.number_requests, 0);
    assert_eq!(cli.log, None);
    assert_eq!(cli.token, None);
    assert!(cli.show_all);
}

#[test]
fn cli_accepts_the_full_flag_surface() {
    let cli = must_ok(Cli::try_parse_from([
        "loanfeed",
        "--db",
        "/tmp/loans.sqlite3",
        "--delay",
        "300",
        "--log",
        "/tmp/loanfeed.log",
        "--number-requests",
        "5",
        "--token",
        "secret",
        "--show-all",
        "false",
    ]));

    assert_eq!(cli.delay, 300);
    assert_eq!(cli.number_requests, 5);
    assert_eq!(cli.token.as_deref(), Some("secret"));
    assert!(!cli.show_all);
}

#[test]
fn payload_decodes_with_api_field_names() {
    let payload: ListingsPayload = must_ok(serde_json::from_value(json!({
        "asOfDate": "2024-01-01T00:00:00Z",
        "loans": [fixture_listing(501)],
    })));

    assert_eq!(payload.as_of_date, "2024-01-01T00:00:00Z");
    assert_eq!(payload.loans.len(), 1);
}

#[test]
fn snapshot_round_trips_through_normalization_and_the_store() {
    let payload = ListingsPayload {
        as_of_date: "2024-01-01T00:00:00Z".to_string(),
        loans: vec![fixture_listing(501), fixture_listing(502)],
    };

    let records = must_ok(build_records(&payload));
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].identity(), Some(501));
    assert_eq!(records[0].funded_amount(), Some(2500.0));

    let mut gateway = SqliteGateway::open(":memory:");
    must_ok(gateway.migrate());

    let first = must_ok(ingest(&mut gateway, &payload.as_of_date, &records));
    assert_eq!(first, IngestOutcome::Recorded { loans: 2 });

    // The same snapshot again is the idempotent no-op path.
    let second = must_ok(ingest(&mut gateway, &payload.as_of_date, &records));
    assert_eq!(second, IngestOutcome::AlreadyRecorded);

    let dates: i64 = must_ok(gateway.query_one("SELECT COUNT(*) FROM rawLoanDates", &[]));
    let raw: i64 = must_ok(gateway.query_one("SELECT COUNT(*) FROM rawLoans", &[]));
    let funded: i64 = must_ok(gateway.query_one("SELECT COUNT(*) FROM loansFundedAsOfDate", &[]));
    assert_eq!((dates, raw, funded), (1, 2, 2));
}

#[test]
fn a_malformed_listing_fails_the_whole_batch() {
    let mut broken = fixture_listing(503);
    broken.remove("annualInc");

    let payload = ListingsPayload {
        as_of_date: "2024-01-01T00:00:00Z".to_string(),
        loans: vec![fixture_listing(501), broken],
    };

    assert!(build_records(&payload).is_err());
}
