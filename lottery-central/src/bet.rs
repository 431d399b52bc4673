//! Bet records and their text encodings.
//!
//! A bet travels in two shapes: the pipe-delimited wire line
//! (`agency|first_name|last_name|document|birth_date|number`) and the
//! comma-separated row written by the file-backed store. Both go through
//! [`BetRecord::from_fields`] so the record invariants are checked in one place.

use std::fmt;

use chrono::NaiveDate;
use thiserror::Error;

/// Identifier of a betting agency. Valid agencies are numbered from 1.
pub type AgencyId = u32;

/// Date format used for birth dates on the wire and on disk.
pub const BIRTH_DATE_FORMAT: &str = "%Y-%m-%d";

const WIRE_SEPARATOR: char = '|';
const ROW_SEPARATOR: char = ',';

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BetParseError {
    #[error("expected 6 fields, found {0}")]
    FieldCount(usize),
    #[error("field `{0}` is empty")]
    EmptyField(&'static str),
    #[error("field `{0}` contains a separator character")]
    Separator(&'static str),
    #[error("invalid agency id `{0}`")]
    Agency(String),
    #[error("document `{0}` is not a non-negative integer")]
    Document(String),
    #[error("birth date `{0}` is not in YYYY-MM-DD format")]
    BirthDate(String),
    #[error("number `{0}` is not a non-negative integer")]
    Number(String),
    #[error("bet belongs to agency {found}, connection is bound to agency {expected}")]
    ForeignAgency { expected: AgencyId, found: AgencyId },
}

/// A single validated bet. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BetRecord {
    pub agency: AgencyId,
    pub first_name: String,
    pub last_name: String,
    /// Kept as text so leading zeros survive.
    pub document: String,
    pub birth_date: NaiveDate,
    pub number: u64,
}

impl BetRecord {
    /// Parses a wire line such as `1|Ana|Diaz|30904465|1999-03-17|7574`.
    pub fn parse_wire(line: &str) -> Result<Self, BetParseError> {
        let fields: Vec<&str> = line.split(WIRE_SEPARATOR).collect();
        Self::from_fields(&fields)
    }

    /// Parses a row written by [`BetRecord::to_row`].
    pub fn parse_row(line: &str) -> Result<Self, BetParseError> {
        let fields: Vec<&str> = line.split(ROW_SEPARATOR).collect();
        Self::from_fields(&fields)
    }

    /// Builds a record from its six raw fields, in wire order.
    pub fn from_fields(fields: &[&str]) -> Result<Self, BetParseError> {
        let [agency, first_name, last_name, document, birth_date, number] = fields else {
            return Err(BetParseError::FieldCount(fields.len()));
        };

        let agency = non_empty("agency", agency)?;
        let first_name = non_empty("first_name", first_name)?;
        let last_name = non_empty("last_name", last_name)?;
        let document = non_empty("document", document)?;
        let birth_date = non_empty("birth_date", birth_date)?;
        let number = non_empty("number", number)?;

        Ok(Self {
            agency: parse_agency(agency)?,
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            document: parse_document(document)?,
            birth_date: NaiveDate::parse_from_str(birth_date, BIRTH_DATE_FORMAT)
                .map_err(|_| BetParseError::BirthDate(birth_date.to_string()))?,
            number: number
                .parse()
                .map_err(|_| BetParseError::Number(number.to_string()))?,
        })
    }

    pub fn to_wire(&self) -> String {
        self.join(WIRE_SEPARATOR)
    }

    pub fn to_row(&self) -> String {
        self.join(ROW_SEPARATOR)
    }

    fn join(&self, separator: char) -> String {
        format!(
            "{agency}{s}{first}{s}{last}{s}{document}{s}{birth}{s}{number}",
            agency = self.agency,
            first = self.first_name,
            last = self.last_name,
            document = self.document,
            birth = self.birth_date.format(BIRTH_DATE_FORMAT),
            number = self.number,
            s = separator,
        )
    }
}

impl fmt::Display for BetRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "agency {} document {} number {}",
            self.agency, self.document, self.number
        )
    }
}

/// Bets carried by one `bets` message, plus the lines that failed to parse.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BetBatch {
    pub bets: Vec<BetRecord>,
    pub rejected: Vec<RejectedLine>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedLine {
    pub line: String,
    pub reason: BetParseError,
}

impl BetBatch {
    pub fn new(bets: Vec<BetRecord>) -> Self {
        Self {
            bets,
            rejected: Vec::new(),
        }
    }

    /// Parses wire lines, keeping the good ones and recording the rest.
    /// Blank lines are skipped rather than rejected.
    pub fn parse_lines<'a, I>(lines: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut batch = Self::default();
        for line in lines {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match BetRecord::parse_wire(line) {
                Ok(bet) => batch.bets.push(bet),
                Err(reason) => batch.rejected.push(RejectedLine {
                    line: line.to_string(),
                    reason,
                }),
            }
        }
        batch
    }

    /// Moves every bet that does not belong to `agency` into the rejected list.
    pub fn retain_agency(&mut self, agency: AgencyId) {
        let (own, foreign): (Vec<_>, Vec<_>) =
            self.bets.drain(..).partition(|bet| bet.agency == agency);
        self.bets = own;
        self.rejected.extend(foreign.into_iter().map(|bet| RejectedLine {
            line: bet.to_wire(),
            reason: BetParseError::ForeignAgency {
                expected: agency,
                found: bet.agency,
            },
        }));
    }

    /// Lottery numbers of the accepted bets, in order. These double as the
    /// bet identifiers echoed back in acknowledgements.
    pub fn numbers(&self) -> Vec<u64> {
        self.bets.iter().map(|bet| bet.number).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.bets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bets.len()
    }
}

/// Parses an agency id. Zero is not a valid agency.
pub fn parse_agency(raw: &str) -> Result<AgencyId, BetParseError> {
    match raw.trim().parse::<AgencyId>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(BetParseError::Agency(raw.to_string())),
    }
}

fn parse_document(raw: &str) -> Result<String, BetParseError> {
    if raw.bytes().all(|b| b.is_ascii_digit()) {
        Ok(raw.to_string())
    } else {
        Err(BetParseError::Document(raw.to_string()))
    }
}

fn non_empty<'a>(name: &'static str, raw: &'a str) -> Result<&'a str, BetParseError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        Err(BetParseError::EmptyField(name))
    } else if trimmed.contains([WIRE_SEPARATOR, ROW_SEPARATOR]) {
        Err(BetParseError::Separator(name))
    } else {
        Ok(trimmed)
    }
}

#[cfg(test)]
pub(crate) fn sample(agency: AgencyId, number: u64) -> BetRecord {
    BetRecord {
        agency,
        first_name: "Santiago".into(),
        last_name: "Lorca".into(),
        document: format!("0{}", 30_904_465 + u64::from(agency)),
        birth_date: NaiveDate::from_ymd_opt(1999, 3, 17).expect("valid date"),
        number,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wire_line() {
        let bet = BetRecord::parse_wire("3|Ana|Diaz|00123|1999-03-17|7574").expect("valid bet");
        assert_eq!(bet.agency, 3);
        assert_eq!(bet.first_name, "Ana");
        assert_eq!(bet.document, "00123");
        assert_eq!(
            bet.birth_date,
            NaiveDate::from_ymd_opt(1999, 3, 17).expect("valid date")
        );
        assert_eq!(bet.number, 7574);
        assert_eq!(bet.to_wire(), "3|Ana|Diaz|00123|1999-03-17|7574");
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert_eq!(
            BetRecord::parse_wire("1|Ana|Diaz|123|1999-03-17"),
            Err(BetParseError::FieldCount(5))
        );
        assert_eq!(
            BetRecord::parse_wire("1|Ana|Diaz|123|1999-03-17|7|extra"),
            Err(BetParseError::FieldCount(7))
        );
    }

    #[test]
    fn rejects_invalid_fields() {
        assert_eq!(
            BetRecord::parse_wire("1||Diaz|123|1999-03-17|7"),
            Err(BetParseError::EmptyField("first_name"))
        );
        assert_eq!(
            BetRecord::parse_wire("1|Ana|Diaz, Jr|123|1999-03-17|7"),
            Err(BetParseError::Separator("last_name"))
        );
        assert!(matches!(
            BetRecord::parse_wire("0|Ana|Diaz|123|1999-03-17|7"),
            Err(BetParseError::Agency(_))
        ));
        assert!(matches!(
            BetRecord::parse_wire("1|Ana|Diaz|12a|1999-03-17|7"),
            Err(BetParseError::Document(_))
        ));
        assert!(matches!(
            BetRecord::parse_wire("1|Ana|Diaz|123|17/03/1999|7"),
            Err(BetParseError::BirthDate(_))
        ));
        assert!(matches!(
            BetRecord::parse_wire("1|Ana|Diaz|123|1999-03-17|-7"),
            Err(BetParseError::Number(_))
        ));
    }

    #[test]
    fn batch_keeps_good_lines_and_records_bad_ones() {
        let batch = BetBatch::parse_lines(
            "1|Ana|Diaz|123|1999-03-17|7\n1|Bad|Line|123\n\n1|Luis|Paz|456|2001-01-02|13\n"
                .lines(),
        );
        assert_eq!(batch.numbers(), vec![7, 13]);
        assert_eq!(batch.rejected.len(), 1);
        assert_eq!(batch.rejected[0].line, "1|Bad|Line|123");
        assert_eq!(batch.rejected[0].reason, BetParseError::FieldCount(4));
    }

    #[test]
    fn retain_agency_rejects_foreign_bets() {
        let mut batch = BetBatch::new(vec![sample(1, 7), sample(2, 8), sample(1, 9)]);
        batch.retain_agency(1);
        assert_eq!(batch.numbers(), vec![7, 9]);
        assert_eq!(
            batch.rejected[0].reason,
            BetParseError::ForeignAgency {
                expected: 1,
                found: 2
            }
        );
    }

    #[test]
    fn row_encoding_preserves_leading_zeros() {
        let bet = sample(2, 13);
        let parsed = BetRecord::parse_row(&bet.to_row()).expect("row parses");
        assert_eq!(parsed, bet);
        assert!(parsed.document.starts_with('0'));
    }
}
