//! Core domain model and record-cleaning rules for ADIT.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "adit-core";

/// One listing-table row-group: the ordered cell texts belonging to a single
/// logical record, with the group's detail-page href (when present) inserted
/// at element 0.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RowGroup {
    pub cells: Vec<String>,
}

impl RowGroup {
    pub fn new(cells: Vec<String>) -> Self {
        Self { cells }
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Absolute detail URL for this group, built from element 0.
    pub fn detail_url(&self, base_url: &str) -> Option<String> {
        self.cells
            .first()
            .map(|detail_ref| format!("{base_url}{detail_ref}"))
    }
}

/// The three listing-table fields a record needs before its detail page is
/// fetched. Construction validates the positional layout; malformed groups
/// yield `None` and are skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialRecord {
    pub url: String,
    pub date_added: String,
    pub term: String,
}

impl PartialRecord {
    /// Cell 0 is the detail ref, cell 3 the raw date-added text, cell 6 the
    /// raw multi-line term block.
    pub fn from_row_group(group: &RowGroup, base_url: &str) -> Option<Self> {
        if group.cells.len() < 7 {
            return None;
        }
        Some(Self {
            url: group.detail_url(base_url)?,
            date_added: group.cells[3].clone(),
            term: group.cells[6].clone(),
        })
    }
}

impl std::fmt::Display for PartialRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.url)
    }
}

/// A fully-scraped record, all fields raw text exactly as parsed. A parse
/// miss leaves the field empty rather than failing the record.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawRecord {
    pub url: String,
    pub university: String,
    pub program: String,
    pub degree: String,
    pub term: String,
    pub date_added: String,
    pub status: String,
    pub status_date: String,
    pub comments: String,
    pub origin: String,
    pub gpa: String,
    pub gre_quant: String,
    pub gre_verbal: String,
    pub gre_aw: String,
}

impl RawRecord {
    /// Seed a record from the listing-table fields; the detail fetch fills
    /// in the rest.
    pub fn seeded(partial: &PartialRecord) -> Self {
        Self {
            url: partial.url.clone(),
            date_added: partial.date_added.clone(),
            term: partial.term.clone(),
            ..Self::default()
        }
    }
}

/// Cleaned record. Required fields stay `String`; optional fields use `None`
/// as the explicit-absent marker and are never an empty string or a known
/// sentinel literal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub url: String,
    pub university: String,
    pub program: String,
    pub degree: String,
    pub term: String,
    pub date_added: String,
    pub status: String,
    pub status_date: String,
    pub origin: String,
    pub comments: Option<String>,
    pub gpa: Option<String>,
    pub gre_quant: Option<String>,
    pub gre_verbal: Option<String>,
    pub gre_aw: Option<String>,
}

#[derive(Debug, Error)]
pub enum CleanError {
    /// The raw term block had no line containing "fall" or "spring"; the
    /// upstream page is malformed and the run must surface it.
    #[error("no term line containing 'fall' or 'spring' in {0:?}")]
    MissingTerm(String),
}

// Sentinel literals the listing site emits for unreported optional fields.
const GPA_SENTINEL: &str = "0.00";
const GRE_SENTINEL: &str = "0";
const GRE_AW_SENTINEL: &str = "0.00";

fn strip_whitespace(value: &str) -> String {
    value.chars().filter(|c| *c != '\n' && *c != '\t').collect()
}

/// First non-empty line of the block containing "fall" or "spring",
/// case-insensitively.
fn extract_term(block: &str) -> Option<String> {
    block
        .split('\n')
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .find(|line| {
            let lower = line.to_lowercase();
            lower.contains("fall") || lower.contains("spring")
        })
        .map(ToString::to_string)
}

fn digits_and_slashes(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '/')
        .collect()
}

fn optional(value: String, sentinel: &str) -> Option<String> {
    if value == sentinel {
        None
    } else {
        Some(value)
    }
}

/// Transform one raw record into its canonical form. Pure; the only failure
/// mode is a term block with no extractable season line.
pub fn clean_record(raw: &RawRecord) -> Result<CanonicalRecord, CleanError> {
    let term =
        extract_term(&raw.term).ok_or_else(|| CleanError::MissingTerm(raw.term.clone()))?;

    let comments = strip_whitespace(&raw.comments);
    let comments = if comments.is_empty() { None } else { Some(comments) };

    Ok(CanonicalRecord {
        url: strip_whitespace(&raw.url),
        university: strip_whitespace(&raw.university),
        program: strip_whitespace(&raw.program),
        degree: strip_whitespace(&raw.degree),
        term: strip_whitespace(&term),
        date_added: strip_whitespace(&raw.date_added),
        status: strip_whitespace(&raw.status),
        status_date: digits_and_slashes(&raw.status_date),
        origin: strip_whitespace(&raw.origin),
        comments,
        gpa: optional(strip_whitespace(&raw.gpa), GPA_SENTINEL),
        gre_quant: optional(strip_whitespace(&raw.gre_quant), GRE_SENTINEL),
        gre_verbal: optional(strip_whitespace(&raw.gre_verbal), GRE_SENTINEL),
        gre_aw: optional(strip_whitespace(&raw.gre_aw), GRE_AW_SENTINEL),
    })
}

/// Clean a batch in order, propagating the first malformed-term failure.
pub fn clean_records(raw: &[RawRecord]) -> Result<Vec<CanonicalRecord>, CleanError> {
    raw.iter().map(clean_record).collect()
}

/// Derived numeric record id: the trailing path segment of the detail URL.
/// Unparseable ids yield `None` so callers can fail open.
pub fn result_id_from_url(url: &str) -> Option<i32> {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .and_then(|segment| segment.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_with_term(term: &str) -> RawRecord {
        RawRecord {
            url: "https://example.test/result/123".into(),
            university: "MIT".into(),
            program: "Computer Science".into(),
            degree: "PhD".into(),
            term: term.into(),
            date_added: "January 1, 2026".into(),
            status: "Accepted".into(),
            status_date: "Accepted on 01/01/2026 via E-mail".into(),
            comments: "good luck\nall".into(),
            origin: "International".into(),
            gpa: "3.80".into(),
            gre_quant: "165".into(),
            gre_verbal: "160".into(),
            gre_aw: "4.50".into(),
        }
    }

    #[test]
    fn term_extraction_keeps_first_matching_line() {
        let raw = raw_with_term("\n  Accepted\n Fall 2026 \n Spring 2027 \n");
        let cleaned = clean_record(&raw).unwrap();
        assert_eq!(cleaned.term, "Fall 2026");
    }

    #[test]
    fn missing_term_line_is_a_validation_error() {
        let raw = raw_with_term("\nAccepted\nSummer 2026\n");
        let err = clean_record(&raw).unwrap_err();
        assert!(matches!(err, CleanError::MissingTerm(_)));
    }

    #[test]
    fn status_date_keeps_only_digits_and_slashes() {
        let cleaned = clean_record(&raw_with_term("Fall 2026")).unwrap();
        assert_eq!(cleaned.status_date, "01/01/2026");
        assert!(cleaned.status_date.chars().all(|c| c.is_ascii_digit() || c == '/'));
    }

    #[test]
    fn sentinel_values_become_absent() {
        let mut raw = raw_with_term("Fall 2026");
        raw.comments = String::new();
        raw.gpa = "0.00".into();
        raw.gre_quant = "0".into();
        raw.gre_verbal = "0".into();
        raw.gre_aw = "0.00".into();

        let cleaned = clean_record(&raw).unwrap();
        assert_eq!(cleaned.comments, None);
        assert_eq!(cleaned.gpa, None);
        assert_eq!(cleaned.gre_quant, None);
        assert_eq!(cleaned.gre_verbal, None);
        assert_eq!(cleaned.gre_aw, None);
    }

    #[test]
    fn reported_metrics_are_kept_verbatim() {
        let cleaned = clean_record(&raw_with_term("Fall 2026")).unwrap();
        assert_eq!(cleaned.gpa.as_deref(), Some("3.80"));
        assert_eq!(cleaned.gre_quant.as_deref(), Some("165"));
    }

    #[test]
    fn newlines_and_tabs_are_stripped_everywhere() {
        let mut raw = raw_with_term("Fall 2026");
        raw.university = "Massachusetts\n\tInstitute".into();
        let cleaned = clean_record(&raw).unwrap();
        assert_eq!(cleaned.university, "MassachusettsInstitute");
        assert_eq!(cleaned.comments.as_deref(), Some("good luckall"));
    }

    #[test]
    fn batch_cleaning_propagates_the_first_failure() {
        let ok = raw_with_term("Fall 2026");
        let bad = raw_with_term("no season here");
        assert!(clean_records(&[ok.clone(), bad]).is_err());
        assert_eq!(clean_records(&[ok]).unwrap().len(), 1);
    }

    #[test]
    fn partial_record_requires_seven_cells() {
        let short = RowGroup::new(vec!["/result/1".into(), "a".into()]);
        assert!(PartialRecord::from_row_group(&short, "https://x").is_none());

        let full = RowGroup::new(vec![
            "/result/801".into(),
            "MIT CS".into(),
            "PhD".into(),
            "January 1, 2026".into(),
            "Accepted".into(),
            "notes".into(),
            "Fall 2026\nAccepted".into(),
        ]);
        let partial = PartialRecord::from_row_group(&full, "https://x").unwrap();
        assert_eq!(partial.url, "https://x/result/801");
        assert_eq!(partial.date_added, "January 1, 2026");
        assert_eq!(partial.term, "Fall 2026\nAccepted");
    }

    #[test]
    fn result_id_parses_trailing_segment() {
        assert_eq!(result_id_from_url("https://x/result/999"), Some(999));
        assert_eq!(result_id_from_url("https://x/result/999/"), Some(999));
        assert_eq!(result_id_from_url("https://x/result/latest"), None);
    }
}
