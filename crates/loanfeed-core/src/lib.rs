use std::cell::OnceCell;

use serde_json::{Map, Value};
use time::format_description::well_known::{Iso8601, Rfc3339};
use time::OffsetDateTime;

/// One day, in epoch seconds. Funding velocity is normalized to this unit.
pub const ONE_DAY_SECS: i64 = 60 * 60 * 24;

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum LoanError {
    #[error("malformed timestamp: {0}")]
    MalformedTimestamp(String),
    #[error("coercion failed: {0}")]
    Coercion(String),
    #[error("missing field: {0}")]
    MissingField(String),
    #[error("identity mismatch: trajectory holds {expected:?}, record has {actual:?}")]
    IdentityMismatch {
        expected: Option<i64>,
        actual: Option<i64>,
    },
}

/// A typed attribute value after coercion. Absence is represented by the
/// surrounding `Option`, never by a zero value of the target type.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i64),
    Real(f64),
    Text(String),
}

impl FieldValue {
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            Self::Real(_) | Self::Text(_) => None,
        }
    }

    #[must_use]
    pub fn as_real(&self) -> Option<f64> {
        match self {
            Self::Real(value) => Some(*value),
            Self::Int(_) | Self::Text(_) => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            Self::Int(_) | Self::Real(_) => None,
        }
    }
}

/// The coercion applied to one attribute of a raw listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoercionKind {
    Timestamp,
    Integer,
    Real,
    Text,
}

impl CoercionKind {
    /// Applies this coercion to a raw JSON value.
    ///
    /// # Errors
    /// Returns [`LoanError::MalformedTimestamp`] or [`LoanError::Coercion`]
    /// when a present, non-falsy value cannot be converted.
    pub fn apply(self, raw: &Value) -> Result<Option<FieldValue>, LoanError> {
        match self {
            Self::Timestamp => coerce_timestamp(raw).map(|v| v.map(FieldValue::Int)),
            Self::Integer => coerce_integer(raw).map(|v| v.map(FieldValue::Int)),
            Self::Real => coerce_real(raw).map(|v| v.map(FieldValue::Real)),
            Self::Text => coerce_text(raw).map(|v| v.map(FieldValue::Text)),
        }
    }
}

pub const AS_OF_DATE: &str = "asOfDate";
pub const FUNDED_AMOUNT: &str = "fundedAmount";
pub const IDENTITY: &str = "id";
pub const LOAN_AMOUNT: &str = "loanAmount";

/// The fixed attribute schema of a loan listing.
///
/// Order is significant: it defines the positional column layout of the
/// bulk-insert row built by [`LoanRecord::raw_loans_row`]. The table is
/// process-wide and never rebuilt per record.
pub const ATTRIBUTES: &[(&str, CoercionKind)] = &[
    ("acceptD", CoercionKind::Timestamp),
    ("accNowDelinq", CoercionKind::Integer),
    ("accOpenPast24Mths", CoercionKind::Integer),
    ("addrState", CoercionKind::Text),
    ("addrZip", CoercionKind::Text),
    ("annualInc", CoercionKind::Real),
    ("avgCurBal", CoercionKind::Integer),
    ("asOfDate", CoercionKind::Timestamp),
    ("bcOpenToBuy", CoercionKind::Integer),
    ("bcUtil", CoercionKind::Real),
    ("chargeoffWithin12Mths", CoercionKind::Integer),
    ("collections12MthsExMed", CoercionKind::Integer),
    ("creditPullD", CoercionKind::Timestamp),
    ("delinq2Yrs", CoercionKind::Integer),
    ("delinqAmnt", CoercionKind::Real),
    ("desc", CoercionKind::Text),
    ("dti", CoercionKind::Real),
    ("earliestCrLine", CoercionKind::Timestamp),
    ("empLength", CoercionKind::Integer),
    ("empTitle", CoercionKind::Text),
    ("expD", CoercionKind::Timestamp),
    ("expDefaultRate", CoercionKind::Real),
    ("ficoRangeHigh", CoercionKind::Integer),
    ("ficoRangeLow", CoercionKind::Integer),
    ("fundedAmount", CoercionKind::Real),
    ("grade", CoercionKind::Text),
    ("homeOwnership", CoercionKind::Text),
    ("id", CoercionKind::Integer),
    ("ilsExpD", CoercionKind::Timestamp),
    ("initialListStatus", CoercionKind::Text),
    ("inqLast6Mths", CoercionKind::Integer),
    ("installment", CoercionKind::Real),
    ("intRate", CoercionKind::Real),
    ("investorCount", CoercionKind::Integer),
    ("isIncV", CoercionKind::Text),
    ("listD", CoercionKind::Timestamp),
    ("loanAmount", CoercionKind::Real),
    ("memberId", CoercionKind::Integer),
    ("mortAcc", CoercionKind::Integer),
    ("moSinOldIlAcct", CoercionKind::Integer),
    ("moSinOldRevTlOp", CoercionKind::Integer),
    ("moSinRcntRevTlOp", CoercionKind::Integer),
    ("moSinRcntTl", CoercionKind::Integer),
    ("mthsSinceLastDelinq", CoercionKind::Integer),
    ("mthsSinceLastMajorDerog", CoercionKind::Integer),
    ("mthsSinceLastRecord", CoercionKind::Integer),
    ("mthsSinceRecentBc", CoercionKind::Integer),
    ("mthsSinceRecentBcDlq", CoercionKind::Integer),
    ("mthsSinceRecentInq", CoercionKind::Integer),
    ("mthsSinceRecentRevolDelinq", CoercionKind::Integer),
    ("numAcctsEver120Ppd", CoercionKind::Integer),
    ("numActvBcTl", CoercionKind::Integer),
    ("numActvRevTl", CoercionKind::Integer),
    ("numBcSats", CoercionKind::Integer),
    ("numBcTl", CoercionKind::Integer),
    ("numIlTl", CoercionKind::Integer),
    ("numOpRevTl", CoercionKind::Integer),
    ("numRevAccts", CoercionKind::Integer),
    ("numRevTlBalGt0", CoercionKind::Integer),
    ("numSats", CoercionKind::Integer),
    ("numTl120dpd2m", CoercionKind::Integer),
    ("numTl30dpd", CoercionKind::Integer),
    ("numTl90gDpd24m", CoercionKind::Integer),
    ("numTlOpPast12m", CoercionKind::Integer),
    ("openAcc", CoercionKind::Integer),
    ("pctTlNvrDlq", CoercionKind::Integer),
    ("percentBcGt75", CoercionKind::Real),
    ("pubRec", CoercionKind::Integer),
    ("pubRecBankruptcies", CoercionKind::Integer),
    ("purpose", CoercionKind::Text),
    ("reviewStatus", CoercionKind::Text),
    ("reviewStatusD", CoercionKind::Timestamp),
    ("revolBal", CoercionKind::Real),
    ("revolUtil", CoercionKind::Real),
    ("serviceFeeRate", CoercionKind::Real),
    ("subGrade", CoercionKind::Text),
    ("taxLiens", CoercionKind::Integer),
    ("term", CoercionKind::Integer),
    ("totalAcc", CoercionKind::Integer),
    ("totalBalExMort", CoercionKind::Integer),
    ("totalBcLimit", CoercionKind::Integer),
    ("totalIlHighCreditLimit", CoercionKind::Integer),
    ("totalRevHiLim", CoercionKind::Integer),
    ("totCollAmt", CoercionKind::Integer),
    ("totCurBal", CoercionKind::Integer),
    ("totHiCredLim", CoercionKind::Integer),
];

/// Position of an attribute in [`ATTRIBUTES`], if it exists.
#[must_use]
pub fn position(name: &str) -> Option<usize> {
    ATTRIBUTES.iter().position(|(attr, _)| *attr == name)
}

/// A raw `0`, `0.0`, `""`, `false`, or empty container coerces to null under
/// every kind. This loses real zero values by contract; the rule is kept for
/// compatibility with data persisted under it.
fn is_falsy(raw: &Value) -> bool {
    match raw {
        Value::Null => true,
        Value::Bool(flag) => !*flag,
        Value::Number(number) => number.as_f64() == Some(0.0),
        Value::String(text) => text.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(entries) => entries.is_empty(),
    }
}

fn value_preview(raw: &Value) -> String {
    let rendered = raw.to_string();
    match rendered.char_indices().nth(64) {
        Some((cut, _)) => format!("{}...", &rendered[..cut]),
        None => rendered,
    }
}

/// Parses a reporting instant string to epoch seconds.
///
/// Accepts RFC3339 with any numeric offset, falling back to ISO-8601.
///
/// # Errors
/// Returns [`LoanError::MalformedTimestamp`] when the string parses under
/// neither format.
pub fn parse_instant(value: &str) -> Result<i64, LoanError> {
    OffsetDateTime::parse(value, &Rfc3339)
        .or_else(|_| OffsetDateTime::parse(value, &Iso8601::DEFAULT))
        .map(OffsetDateTime::unix_timestamp)
        .map_err(|err| LoanError::MalformedTimestamp(format!("{value}: {err}")))
}

/// Coerces a raw timestamp value to epoch seconds. An integer epoch passes
/// through unchanged; a non-empty string is parsed; a falsy value is null.
///
/// # Errors
/// Returns [`LoanError::MalformedTimestamp`] for unparseable strings and
/// non-integer, non-string shapes.
pub fn coerce_timestamp(raw: &Value) -> Result<Option<i64>, LoanError> {
    if is_falsy(raw) {
        return Ok(None);
    }

    match raw {
        Value::Number(number) => number
            .as_i64()
            .map(Some)
            .ok_or_else(|| LoanError::MalformedTimestamp(value_preview(raw))),
        Value::String(text) => parse_instant(text).map(Some),
        _ => Err(LoanError::MalformedTimestamp(value_preview(raw))),
    }
}

/// Coerces a raw value to an integer; null is preserved, floats truncate
/// toward zero.
///
/// # Errors
/// Returns [`LoanError::Coercion`] when a present value is not numeric.
#[allow(clippy::cast_possible_truncation)]
pub fn coerce_integer(raw: &Value) -> Result<Option<i64>, LoanError> {
    if is_falsy(raw) {
        return Ok(None);
    }

    match raw {
        Value::Bool(_) => Ok(Some(1)),
        Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                Ok(Some(int))
            } else {
                number
                    .as_f64()
                    .map(|real| Some(real.trunc() as i64))
                    .ok_or_else(|| LoanError::Coercion(value_preview(raw)))
            }
        }
        Value::String(text) => text
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| LoanError::Coercion(format!("not an integer: {text}"))),
        _ => Err(LoanError::Coercion(value_preview(raw))),
    }
}

/// Coerces a raw value to a real number; null is preserved.
///
/// # Errors
/// Returns [`LoanError::Coercion`] when a present value is not numeric.
pub fn coerce_real(raw: &Value) -> Result<Option<f64>, LoanError> {
    if is_falsy(raw) {
        return Ok(None);
    }

    match raw {
        Value::Bool(_) => Ok(Some(1.0)),
        Value::Number(number) => number
            .as_f64()
            .map(Some)
            .ok_or_else(|| LoanError::Coercion(value_preview(raw))),
        Value::String(text) => text
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| LoanError::Coercion(format!("not a number: {text}"))),
        _ => Err(LoanError::Coercion(value_preview(raw))),
    }
}

/// Coerces a raw value to text; null is preserved.
///
/// # Errors
/// Returns [`LoanError::Coercion`] for non-scalar shapes.
pub fn coerce_text(raw: &Value) -> Result<Option<String>, LoanError> {
    if is_falsy(raw) {
        return Ok(None);
    }

    match raw {
        Value::String(text) => Ok(Some(text.clone())),
        Value::Number(number) => Ok(Some(number.to_string())),
        Value::Bool(_) => Ok(Some("true".to_string())),
        _ => Err(LoanError::Coercion(value_preview(raw))),
    }
}

/// One loan's full attribute set as observed at a single reporting instant.
///
/// Acts as sanitation and transport from the marketplace API response to the
/// database: every schema attribute is present after construction, with null
/// meaning "omitted by the API", and the record is immutable thereafter.
#[derive(Debug, Clone, PartialEq)]
pub struct LoanRecord {
    instant: i64,
    values: Vec<Option<FieldValue>>,
}

impl LoanRecord {
    /// Builds a record from the batch's reporting instant and one raw
    /// listing object.
    ///
    /// # Errors
    /// Returns [`LoanError::MalformedTimestamp`] when the instant does not
    /// parse, [`LoanError::MissingField`] when the listing lacks a schema
    /// key, and coercion errors for unconvertible values. A malformed loan is
    /// never silently dropped; the whole batch construction fails instead.
    pub fn from_listing(
        reporting_instant: &str,
        listing: &Map<String, Value>,
    ) -> Result<Self, LoanError> {
        let instant = parse_instant(reporting_instant)?;
        let mut values = Vec::with_capacity(ATTRIBUTES.len());

        for (name, kind) in ATTRIBUTES {
            if *name == AS_OF_DATE {
                values.push(Some(FieldValue::Int(instant)));
                continue;
            }

            let raw = listing
                .get(*name)
                .ok_or_else(|| LoanError::MissingField((*name).to_string()))?;
            values.push(kind.apply(raw)?);
        }

        Ok(Self { instant, values })
    }

    /// The reporting instant shared by the record's ingestion batch, as
    /// epoch seconds.
    #[must_use]
    pub fn reporting_instant(&self) -> i64 {
        self.instant
    }

    #[must_use]
    pub fn identity(&self) -> Option<i64> {
        self.get(IDENTITY).and_then(FieldValue::as_int)
    }

    #[must_use]
    pub fn funded_amount(&self) -> Option<f64> {
        self.get(FUNDED_AMOUNT).and_then(FieldValue::as_real)
    }

    #[must_use]
    pub fn loan_amount(&self) -> Option<f64> {
        self.get(LOAN_AMOUNT).and_then(FieldValue::as_real)
    }

    /// Looks up one attribute by schema name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        position(name)
            .and_then(|idx| self.values.get(idx))
            .and_then(Option::as_ref)
    }

    /// All attribute values in schema order.
    #[must_use]
    pub fn values(&self) -> &[Option<FieldValue>] {
        &self.values
    }

    /// Positional row for the `rawLoans` table: every attribute except
    /// `asOfDate` and `fundedAmount`, in schema order.
    #[must_use]
    pub fn raw_loans_row(&self) -> Vec<Option<FieldValue>> {
        ATTRIBUTES
            .iter()
            .zip(&self.values)
            .filter(|((name, _), _)| *name != AS_OF_DATE && *name != FUNDED_AMOUNT)
            .map(|(_, value)| value.clone())
            .collect()
    }

    /// Row for the `loansFundedAsOfDate` table.
    #[must_use]
    pub fn funded_row(&self) -> (i64, Option<f64>, Option<i64>) {
        (self.instant, self.funded_amount(), self.identity())
    }

    /// Static attribute values: the schema row with the time-varying slots
    /// (`asOfDate`, `fundedAmount`) left null. Copied into a trajectory from
    /// its first record.
    fn static_values(&self) -> Vec<Option<FieldValue>> {
        ATTRIBUTES
            .iter()
            .zip(&self.values)
            .map(|((name, _), value)| {
                if *name == AS_OF_DATE || *name == FUNDED_AMOUNT {
                    None
                } else {
                    value.clone()
                }
            })
            .collect()
    }
}

/// Sorted views over a trajectory's observations, built lazily and cached
/// until the next `load` invalidates them.
#[derive(Debug)]
struct TrajectoryView {
    /// Present funded amounts, ascending by value (not by time).
    amounts: Vec<f64>,
    /// Reporting instants, ascending.
    dates: Vec<i64>,
}

impl TrajectoryView {
    fn build(observations: &[(i64, Option<f64>)]) -> Self {
        let mut amounts: Vec<f64> = observations
            .iter()
            .filter_map(|(_, amount)| *amount)
            .collect();
        amounts.sort_by(f64::total_cmp);

        let mut dates: Vec<i64> = observations.iter().map(|(date, _)| *date).collect();
        dates.sort_unstable();

        Self { amounts, dates }
    }
}

/// One loan's funding observations accumulated across reporting instants.
///
/// Holds the static attributes copied from the first loaded record plus a
/// deduplicated `(instant, fundedAmount)` series. Once populated, a
/// trajectory stays bound to its identity; build a new instance to reset.
#[derive(Debug, Default)]
pub struct LoanTrajectory {
    statics: Vec<Option<FieldValue>>,
    identity: Option<i64>,
    populated: bool,
    observations: Vec<(i64, Option<f64>)>,
    view: OnceCell<TrajectoryView>,
}

impl LoanTrajectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads records into the trajectory, in input order.
    ///
    /// The first record ever loaded establishes the identity and static
    /// attributes. A record whose reporting instant was already observed is
    /// skipped with a warning, never merged or overwritten.
    ///
    /// # Errors
    /// Returns [`LoanError::IdentityMismatch`] when a record's identity
    /// disagrees with the trajectory's. Records loaded before the offending
    /// one remain loaded.
    pub fn load(&mut self, records: &[LoanRecord]) -> Result<(), LoanError> {
        // Cached views are stale from here on; rebuilt on next read.
        self.view = OnceCell::new();

        for record in records {
            if self.populated {
                if record.identity() != self.identity {
                    return Err(LoanError::IdentityMismatch {
                        expected: self.identity,
                        actual: record.identity(),
                    });
                }
            } else {
                self.statics = record.static_values();
                self.identity = record.identity();
                self.populated = true;
            }

            let instant = record.reporting_instant();
            if self.observations.iter().any(|(date, _)| *date == instant) {
                tracing::warn!("skipping {instant}: has already been loaded");
                continue;
            }

            self.observations.push((instant, record.funded_amount()));
        }

        Ok(())
    }

    #[must_use]
    pub fn identity(&self) -> Option<i64> {
        self.identity
    }

    #[must_use]
    pub fn observations(&self) -> &[(i64, Option<f64>)] {
        &self.observations
    }

    /// Looks up a static attribute by schema name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        position(name)
            .and_then(|idx| self.statics.get(idx))
            .and_then(Option::as_ref)
    }

    #[must_use]
    pub fn loan_amount(&self) -> Option<f64> {
        self.get(LOAN_AMOUNT).and_then(FieldValue::as_real)
    }

    fn view(&self) -> &TrajectoryView {
        self.view
            .get_or_init(|| TrajectoryView::build(&self.observations))
    }

    /// Smallest observed funded amount, ordered by value rather than by
    /// time. The two orderings differ whenever funding ever decreases; the
    /// value ordering is the contract here.
    #[must_use]
    pub fn amount_start(&self) -> Option<f64> {
        self.view().amounts.first().copied()
    }

    /// Largest observed funded amount, ordered by value rather than by time.
    #[must_use]
    pub fn amount_end(&self) -> Option<f64> {
        self.view().amounts.last().copied()
    }

    /// Difference between the total loan amount and the starting funded
    /// amount.
    #[must_use]
    pub fn amount_left(&self) -> Option<f64> {
        Some(self.loan_amount()? - self.amount_start()?)
    }

    #[must_use]
    pub fn date_start(&self) -> Option<i64> {
        self.view().dates.first().copied()
    }

    #[must_use]
    pub fn date_end(&self) -> Option<i64> {
        self.view().dates.last().copied()
    }

    /// Epoch seconds between the first and last observation.
    #[must_use]
    pub fn date_difference(&self) -> Option<i64> {
        Some(self.date_end()? - self.date_start()?)
    }

    /// Fraction of the loan amount funded by the end observation, or zero
    /// when the funded amount never changed across observations.
    ///
    /// "Never changed" is an exact comparison: both bounds come from
    /// identical parses of the same field, so no epsilon applies.
    #[must_use]
    pub fn funded_rate(&self) -> Option<f64> {
        let start = self.amount_start()?;
        let end = self.amount_end()?;

        if end - start == 0.0 {
            return Some(0.0);
        }

        Some(end / self.loan_amount()?)
    }

    /// Funding rate normalized to a per-calendar-day unit, so loans observed
    /// over windows of different lengths are comparable. Zero when the
    /// observation window has no extent.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn funding_velocity_score(&self) -> Option<f64> {
        let difference = self.date_difference()?;
        if difference == 0 {
            return Some(0.0);
        }

        let rate = self.funded_rate()?;
        Some(rate * (ONE_DAY_SECS as f64 / difference as f64))
    }
}
