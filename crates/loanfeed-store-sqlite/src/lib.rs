#![allow(clippy::missing_errors_doc)]

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use loanfeed_core::{
    parse_instant, CoercionKind, FieldValue, LoanRecord, ATTRIBUTES, AS_OF_DATE, FUNDED_AMOUNT,
    IDENTITY,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection};

/// Owns one sqlite connection's lifecycle: acquired lazily on first use,
/// released deterministically on scope exit, and discarded after any
/// statement failure so a corrupted connection state is never reused.
///
/// Not thread-safe; one gateway serves one logical unit of work at a time
/// (every method takes `&mut self`).
pub struct SqliteGateway {
    path: PathBuf,
    conn: Option<Connection>,
}

impl SqliteGateway {
    /// Creates a gateway for the database at `path` without connecting yet.
    #[must_use]
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            conn: None,
        }
    }

    fn connection(&mut self) -> Result<&mut Connection> {
        if self.conn.is_none() {
            let conn = Connection::open(&self.path).with_context(|| {
                format!("failed to open sqlite database at {}", self.path.display())
            })?;

            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA busy_timeout = 5000;",
            )
            .context("failed to configure sqlite pragmas")?;

            self.conn = Some(conn);
        }

        self.conn
            .as_mut()
            .ok_or_else(|| anyhow!("sqlite connection unavailable"))
    }

    /// Releases the connection. The next statement reconnects lazily.
    pub fn close(&mut self) {
        self.conn = None;
    }

    /// Creates the three loanfeed tables when absent. Idempotent.
    pub fn migrate(&mut self) -> Result<()> {
        let ddl = schema_ddl();
        let outcome = self.connection()?.execute_batch(&ddl);
        match outcome {
            Ok(()) => Ok(()),
            Err(err) => {
                self.close();
                Err(err).context("failed to apply loanfeed schema")
            }
        }
    }

    /// Executes one statement. On failure the connection is released before
    /// the error is surfaced; autocommit mode means there is nothing left to
    /// roll back once it is gone.
    pub fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        let outcome = self
            .connection()?
            .execute(sql, params_from_iter(params.iter()));
        match outcome {
            Ok(affected) => Ok(affected),
            Err(err) => {
                self.close();
                Err(err).with_context(|| format!("statement failed: {sql}"))
            }
        }
    }

    /// Runs a query expected to yield one row and reads its first column.
    pub fn query_one<T: rusqlite::types::FromSql>(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<T> {
        let outcome =
            self.connection()?
                .query_row(sql, params_from_iter(params.iter()), |row| row.get(0));
        match outcome {
            Ok(value) => Ok(value),
            Err(err) => {
                self.close();
                Err(err).with_context(|| format!("query failed: {sql}"))
            }
        }
    }

    /// Runs a query and collects every row's columns.
    pub fn query_all(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Vec<SqlValue>>> {
        let conn = self.connection()?;
        let outcome = (|| -> rusqlite::Result<Vec<Vec<SqlValue>>> {
            let mut stmt = conn.prepare(sql)?;
            let column_count = stmt.column_count();
            let mut rows = stmt.query(params_from_iter(params.iter()))?;

            let mut collected = Vec::new();
            while let Some(row) = rows.next()? {
                let mut values = Vec::with_capacity(column_count);
                for idx in 0..column_count {
                    values.push(row.get::<_, SqlValue>(idx)?);
                }
                collected.push(values);
            }
            Ok(collected)
        })();

        match outcome {
            Ok(collected) => Ok(collected),
            Err(err) => {
                self.close();
                Err(err).with_context(|| format!("query failed: {sql}"))
            }
        }
    }

    /// Executes one statement once per parameter row, inside a single
    /// transaction.
    pub fn execute_many(&mut self, sql: &str, rows: &[Vec<SqlValue>]) -> Result<usize> {
        let conn = self.connection()?;
        let outcome = (|| -> rusqlite::Result<usize> {
            let tx = conn.transaction()?;
            let mut affected = 0;
            {
                let mut stmt = tx.prepare(sql)?;
                for row in rows {
                    affected += stmt.execute(params_from_iter(row.iter()))?;
                }
            }
            tx.commit()?;
            Ok(affected)
        })();

        match outcome {
            Ok(affected) => Ok(affected),
            Err(err) => {
                self.close();
                Err(err).with_context(|| format!("batch statement failed: {sql}"))
            }
        }
    }

    /// Runs `operations` inside one transaction: committed on `Ok`, rolled
    /// back and the connection released on `Err`.
    pub fn transaction<T>(
        &mut self,
        operations: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let conn = self.connection()?;
        let outcome = (|| -> Result<T> {
            let tx = match conn.transaction() {
                Ok(tx) => tx,
                Err(err) => return Err(err).context("failed to begin transaction"),
            };

            match operations(&tx) {
                Ok(value) => {
                    if let Err(err) = tx.commit() {
                        return Err(err).context("failed to commit transaction");
                    }
                    Ok(value)
                }
                Err(err) => {
                    // Dropping the transaction rolls it back.
                    drop(tx);
                    Err(err)
                }
            }
        })();

        match outcome {
            Ok(value) => Ok(value),
            Err(err) => {
                self.close();
                Err(err)
            }
        }
    }
}

impl Drop for SqliteGateway {
    fn drop(&mut self) {
        self.close();
    }
}

/// Converts a coerced field into its sqlite parameter value.
#[must_use]
pub fn to_sql_value(field: &Option<FieldValue>) -> SqlValue {
    match field {
        None => SqlValue::Null,
        Some(FieldValue::Int(value)) => SqlValue::Integer(*value),
        Some(FieldValue::Real(value)) => SqlValue::Real(*value),
        Some(FieldValue::Text(value)) => SqlValue::Text(value.clone()),
    }
}

fn raw_loans_columns() -> impl Iterator<Item = (&'static str, CoercionKind)> {
    ATTRIBUTES
        .iter()
        .copied()
        .filter(|(name, _)| *name != AS_OF_DATE && *name != FUNDED_AMOUNT)
}

/// DDL for the three tables. The `rawLoans` column list is generated from
/// the attribute schema so the positional layout cannot drift from the
/// coercion order.
#[must_use]
pub fn schema_ddl() -> String {
    let mut columns = Vec::new();
    for (name, kind) in raw_loans_columns() {
        let sql_type = match kind {
            CoercionKind::Timestamp | CoercionKind::Integer => "INTEGER",
            CoercionKind::Real => "REAL",
            CoercionKind::Text => "TEXT",
        };
        if name == IDENTITY {
            columns.push(format!("  \"{name}\" {sql_type} PRIMARY KEY"));
        } else {
            columns.push(format!("  \"{name}\" {sql_type}"));
        }
    }

    format!(
        "CREATE TABLE IF NOT EXISTS rawLoanDates (
  asOfDate INTEGER PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS rawLoans (
{}
);

CREATE TABLE IF NOT EXISTS loansFundedAsOfDate (
  asOfDate INTEGER NOT NULL,
  fundedAmount REAL,
  id INTEGER NOT NULL,
  PRIMARY KEY (asOfDate, id)
);
",
        columns.join(",\n")
    )
}

/// Positional insert for `rawLoans`, ignoring rows whose loan id was already
/// recorded by an earlier snapshot.
#[must_use]
pub fn raw_loans_insert_sql() -> String {
    let placeholders = vec!["?"; raw_loans_columns().count()].join(",");
    format!("INSERT OR IGNORE INTO rawLoans VALUES ({placeholders})")
}

/// Result of one ingestion attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Recorded { loans: usize },
    AlreadyRecorded,
}

/// Records one snapshot exactly once.
///
/// When the reporting instant is already present the whole call is a logged
/// no-op. Otherwise the date marker, every raw loan row, and every funding
/// row are written in a single all-or-nothing transaction: the marker and
/// raw rows ignore conflicts (re-observation across cycles is expected), the
/// funding rows fail hard on a duplicate `(asOfDate, id)` pair. Any failure
/// rolls everything back, releases the connection, and surfaces the error;
/// the next scheduled cycle is unaffected.
pub fn ingest(
    gateway: &mut SqliteGateway,
    reporting_instant: &str,
    loans: &[LoanRecord],
) -> Result<IngestOutcome> {
    let epoch = parse_instant(reporting_instant)
        .with_context(|| format!("invalid reporting instant {reporting_instant:?}"))?;

    let recorded: i64 = gateway.query_one(
        "SELECT COUNT(*) FROM rawLoanDates WHERE asOfDate = ?1",
        &[SqlValue::Integer(epoch)],
    )?;
    if recorded > 0 {
        tracing::info!("{reporting_instant} already exists");
        return Ok(IngestOutcome::AlreadyRecorded);
    }

    let raw_insert = raw_loans_insert_sql();
    gateway
        .transaction(|tx| {
            // Another process may have inserted the marker since the check.
            tx.execute(
                "INSERT OR IGNORE INTO rawLoanDates (asOfDate) VALUES (?1)",
                params![epoch],
            )?;

            let mut raw_stmt = tx.prepare(&raw_insert)?;
            for loan in loans {
                let row: Vec<SqlValue> = loan.raw_loans_row().iter().map(to_sql_value).collect();
                raw_stmt.execute(params_from_iter(row))?;
            }

            let mut funded_stmt = tx.prepare(
                "INSERT INTO loansFundedAsOfDate (asOfDate, fundedAmount, id) VALUES (?1, ?2, ?3)",
            )?;
            for loan in loans {
                let (instant, funded, identity) = loan.funded_row();
                funded_stmt.execute(params![instant, funded, identity])?;
            }

            Ok(())
        })
        .with_context(|| format!("failed to record snapshot {reporting_instant}"))?;

    tracing::info!("{reporting_instant} added {} loans", loans.len());
    Ok(IngestOutcome::Recorded { loans: loans.len() })
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use serde_json::{json, Map, Value};

    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    const JAN_1: &str = "2024-01-01T00:00:00Z";
    const JAN_2: &str = "2024-01-02T00:00:00Z";
    const JAN_1_EPOCH: i64 = 1_704_067_200;

    fn fixture_listing(identity: i64, funded: &str) -> Map<String, Value> {
        let mut listing = Map::new();
        for (name, kind) in ATTRIBUTES {
            if *name == AS_OF_DATE {
                continue;
            }
            let value = match kind {
                CoercionKind::Timestamp => json!(JAN_1),
                CoercionKind::Integer => json!(3),
                CoercionKind::Real => json!("250.75"),
                CoercionKind::Text => json!("sample"),
            };
            listing.insert((*name).to_string(), value);
        }
        listing.insert(IDENTITY.to_string(), json!(identity));
        listing.insert("loanAmount".to_string(), json!("10000"));
        listing.insert(FUNDED_AMOUNT.to_string(), json!(funded));
        listing
    }

    fn fixture_record(instant: &str, identity: i64, funded: &str) -> LoanRecord {
        must_ok(LoanRecord::from_listing(
            instant,
            &fixture_listing(identity, funded),
        ))
    }

    fn memory_gateway() -> SqliteGateway {
        let mut gateway = SqliteGateway::open(":memory:");
        must_ok(gateway.migrate());
        gateway
    }

    fn temp_db_path(tag: &str) -> PathBuf {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_nanos());
        std::env::temp_dir().join(format!(
            "loanfeed-{tag}-{}-{stamp}.sqlite3",
            std::process::id()
        ))
    }

    fn table_count(gateway: &mut SqliteGateway, table: &str) -> i64 {
        must_ok(gateway.query_one(&format!("SELECT COUNT(*) FROM {table}"), &[]))
    }

    #[test]
    fn migrate_is_idempotent() {
        let mut gateway = memory_gateway();
        must_ok(gateway.migrate());
        assert_eq!(table_count(&mut gateway, "rawLoanDates"), 0);
    }

    #[test]
    fn schema_and_insert_stay_aligned_with_the_attribute_table() {
        let ddl = schema_ddl();
        // Keyword column names must be quoted.
        assert!(ddl.contains("\"desc\" TEXT"));
        assert!(ddl.contains("\"id\" INTEGER PRIMARY KEY"));

        let placeholders = raw_loans_insert_sql().matches('?').count();
        assert_eq!(placeholders, ATTRIBUTES.len() - 2);
    }

    #[test]
    fn ingest_records_one_snapshot_across_all_three_tables() {
        let mut gateway = memory_gateway();
        let loans = vec![fixture_record(JAN_1, 501, "2500")];

        let outcome = must_ok(ingest(&mut gateway, JAN_1, &loans));
        assert_eq!(outcome, IngestOutcome::Recorded { loans: 1 });

        assert_eq!(table_count(&mut gateway, "rawLoanDates"), 1);
        assert_eq!(table_count(&mut gateway, "rawLoans"), 1);

        let funded = must_ok(gateway.query_all(
            "SELECT asOfDate, fundedAmount, id FROM loansFundedAsOfDate",
            &[],
        ));
        assert_eq!(
            funded,
            vec![vec![
                SqlValue::Integer(JAN_1_EPOCH),
                SqlValue::Real(2500.0),
                SqlValue::Integer(501),
            ]]
        );
    }

    #[test]
    fn reingesting_the_same_instant_is_a_no_op() {
        let mut gateway = memory_gateway();
        let loans = vec![fixture_record(JAN_1, 501, "2500")];
        must_ok(ingest(&mut gateway, JAN_1, &loans));

        // Same instant, even with a different batch, changes nothing.
        let outcome = must_ok(ingest(&mut gateway, JAN_1, &[]));
        assert_eq!(outcome, IngestOutcome::AlreadyRecorded);

        assert_eq!(table_count(&mut gateway, "rawLoanDates"), 1);
        assert_eq!(table_count(&mut gateway, "rawLoans"), 1);
        assert_eq!(table_count(&mut gateway, "loansFundedAsOfDate"), 1);
    }

    #[test]
    fn overlapping_listings_across_instants_are_tolerated() {
        let mut gateway = memory_gateway();
        must_ok(ingest(
            &mut gateway,
            JAN_1,
            &[fixture_record(JAN_1, 501, "2500")],
        ));
        must_ok(ingest(
            &mut gateway,
            JAN_2,
            &[fixture_record(JAN_2, 501, "5000")],
        ));

        // The static row is kept from the first observation; the funding
        // series grows per instant.
        assert_eq!(table_count(&mut gateway, "rawLoans"), 1);
        assert_eq!(table_count(&mut gateway, "rawLoanDates"), 2);
        assert_eq!(table_count(&mut gateway, "loansFundedAsOfDate"), 2);
    }

    #[test]
    fn duplicate_funded_pair_rolls_back_the_whole_snapshot() {
        let path = temp_db_path("rollback");
        let mut gateway = SqliteGateway::open(&path);
        must_ok(gateway.migrate());

        // Two records with the same identity collide in
        // loansFundedAsOfDate after the raw insert already succeeded.
        let loans = vec![
            fixture_record(JAN_1, 501, "2500"),
            fixture_record(JAN_1, 501, "2600"),
        ];
        assert!(ingest(&mut gateway, JAN_1, &loans).is_err());

        // The connection was released; the next call reconnects and sees no
        // trace of the failed snapshot, marker included.
        assert_eq!(table_count(&mut gateway, "rawLoanDates"), 0);
        assert_eq!(table_count(&mut gateway, "rawLoans"), 0);
        assert_eq!(table_count(&mut gateway, "loansFundedAsOfDate"), 0);

        drop(gateway);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn failed_statement_releases_the_connection_and_recovers() {
        let path = temp_db_path("recover");
        let mut gateway = SqliteGateway::open(&path);
        must_ok(gateway.migrate());

        assert!(gateway.execute("INSERT INTO noSuchTable VALUES (1)", &[]).is_err());
        assert_eq!(table_count(&mut gateway, "rawLoanDates"), 0);

        drop(gateway);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn execute_many_batches_rows() {
        let mut gateway = memory_gateway();
        let rows = vec![
            vec![SqlValue::Integer(1)],
            vec![SqlValue::Integer(2)],
            vec![SqlValue::Integer(3)],
        ];
        let affected = must_ok(gateway.execute_many(
            "INSERT OR IGNORE INTO rawLoanDates (asOfDate) VALUES (?1)",
            &rows,
        ));
        assert_eq!(affected, 3);
        assert_eq!(table_count(&mut gateway, "rawLoanDates"), 3);
    }
}
