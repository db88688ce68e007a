//! PostgreSQL persistence for admissions records: the NDJSON wire format,
//! the idempotent loader, and the incremental-watermark queries.

use std::collections::HashSet;
use std::path::Path;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;
use tokio::io::AsyncBufReadExt;
use tracing::{info, warn};

use adit_core::result_id_from_url;

pub const CRATE_NAME: &str = "adit-store";

/// One line of the loader's NDJSON input. Field names are the wire contract;
/// absent values ride as JSON nulls. `application status date` is carried on
/// the wire (and participates in the completeness check) but has no column
/// of its own.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireRecord {
    pub university: Option<String>,
    pub program: Option<String>,
    pub comments: Option<String>,
    #[serde(rename = "date added")]
    pub date_added: Option<String>,
    pub url: Option<String>,
    #[serde(rename = "application status")]
    pub status: Option<String>,
    #[serde(rename = "application status date")]
    pub status_date: Option<String>,
    pub term: Option<String>,
    #[serde(rename = "US/International")]
    pub origin: Option<String>,
    #[serde(rename = "GPA")]
    pub gpa: Option<String>,
    #[serde(rename = "GRE")]
    pub gre_quant: Option<String>,
    #[serde(rename = "GRE V")]
    pub gre_verbal: Option<String>,
    #[serde(rename = "GRE AW")]
    pub gre_aw: Option<String>,
    pub degree: Option<String>,
    #[serde(rename = "llm-generated-program")]
    pub llm_generated_program: Option<String>,
    #[serde(rename = "llm-generated-university")]
    pub llm_generated_university: Option<String>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Outcome of one wire line: inserted, dropped by the uniqueness constraint,
/// or skipped before it reached the insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineOutcome {
    Inserted,
    Conflicted,
    Skipped,
}

/// A line is loadable only when none of its JSON values is the empty string.
/// Nulls pass: an explicitly-absent optional field is not an incomplete
/// record.
pub fn line_is_complete(value: &serde_json::Value) -> bool {
    match value.as_object() {
        Some(map) => !map.values().any(|v| v.as_str() == Some("")),
        None => false,
    }
}

/// Dates ride the wire as "January 1, 2026"; anything else loads as null.
pub fn parse_date_added(raw: Option<&str>) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw?, "%B %d, %Y").ok()
}

/// GPA/GRE strings coerce to doubles; unparseable values load as null.
pub fn parse_metric(raw: Option<&str>) -> Option<f64> {
    raw?.parse().ok()
}

const CREATE_ADMISSIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS admissions (
    p_id SERIAL PRIMARY KEY,
    university TEXT,
    program TEXT,
    comments TEXT,
    date_added DATE,
    url TEXT,
    status TEXT,
    term TEXT,
    us_or_international TEXT,
    gpa DOUBLE PRECISION,
    gre DOUBLE PRECISION,
    gre_v DOUBLE PRECISION,
    gre_aw DOUBLE PRECISION,
    degree TEXT,
    llm_generated_program TEXT,
    llm_generated_university TEXT,
    result_page INTEGER
)
"#;

const CREATE_URL_INDEX: &str =
    "CREATE UNIQUE INDEX IF NOT EXISTS admissions_url_key ON admissions (url)";

const INSERT_ADMISSION: &str = r#"
INSERT INTO admissions (
    university, program, comments, date_added, url,
    status, term, us_or_international, gpa, gre, gre_v,
    gre_aw, degree, llm_generated_program,
    llm_generated_university, result_page
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
ON CONFLICT (url) DO NOTHING
"#;

/// Handle on the admissions table. The pool connects lazily; the schema is
/// ensured once per process, on first load.
#[derive(Debug)]
pub struct AdmissionsStore {
    pool: PgPool,
    schema_ready: tokio::sync::OnceCell<()>,
}

impl AdmissionsStore {
    pub fn connect_lazy(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new().connect_lazy(database_url)?;
        Ok(Self {
            pool,
            schema_ready: tokio::sync::OnceCell::new(),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(CREATE_ADMISSIONS_TABLE).execute(&self.pool).await?;
                sqlx::query(CREATE_URL_INDEX).execute(&self.pool).await?;
                Ok::<_, StoreError>(())
            })
            .await?;
        Ok(())
    }

    /// Highest ingested result id, the incremental watermark. Store trouble
    /// degrades to `None` (next run becomes a full sweep) rather than failing.
    pub async fn max_result_id(&self) -> Option<i32> {
        match sqlx::query_scalar::<_, Option<i32>>("SELECT MAX(result_page) FROM admissions")
            .fetch_one(&self.pool)
            .await
        {
            Ok(max) => max,
            Err(err) => {
                warn!(error = %err, "could not read result-id watermark");
                None
            }
        }
    }

    /// All stored record URLs. Degrades to the empty set on store trouble;
    /// the unique index still guards against re-inserts.
    pub async fn existing_urls(&self) -> HashSet<String> {
        match sqlx::query_scalar::<_, Option<String>>("SELECT url FROM admissions")
            .fetch_all(&self.pool)
            .await
        {
            Ok(urls) => urls.into_iter().flatten().collect(),
            Err(err) => {
                warn!(error = %err, "could not read existing urls");
                HashSet::new()
            }
        }
    }

    /// Stream an NDJSON file into the admissions table. Blank lines and
    /// lines with any empty-string value are skipped; duplicate URLs are
    /// silently dropped by the unique index. All inserts share one
    /// transaction with a single commit. Returns the number of rows
    /// actually inserted.
    pub async fn load_jsonl(&self, path: impl AsRef<Path>) -> Result<u64, StoreError> {
        self.ensure_schema().await?;

        let path = path.as_ref();
        let file = tokio::fs::File::open(path).await.map_err(|source| StoreError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut lines = tokio::io::BufReader::new(file).lines();

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        let mut conflicted = 0u64;
        let mut skipped = 0u64;

        loop {
            let line = lines.next_line().await.map_err(|source| StoreError::Io {
                path: path.display().to_string(),
                source,
            })?;
            let Some(line) = line else { break };
            match insert_wire_line(&mut tx, &line).await? {
                LineOutcome::Inserted => inserted += 1,
                LineOutcome::Conflicted => conflicted += 1,
                LineOutcome::Skipped => skipped += 1,
            }
        }

        tx.commit().await?;
        info!(
            path = %path.display(),
            inserted,
            conflicted,
            skipped,
            "admissions load committed"
        );
        Ok(inserted)
    }
}

async fn insert_wire_line(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    line: &str,
) -> Result<LineOutcome, StoreError> {
    if line.trim().is_empty() {
        return Ok(LineOutcome::Skipped);
    }
    let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
        warn!(line, "unparseable wire line; skipping");
        return Ok(LineOutcome::Skipped);
    };
    if !line_is_complete(&value) {
        return Ok(LineOutcome::Skipped);
    }
    let Ok(record) = serde_json::from_value::<WireRecord>(value) else {
        warn!(line, "wire line does not match the record shape; skipping");
        return Ok(LineOutcome::Skipped);
    };

    let result_page = record.url.as_deref().and_then(result_id_from_url);
    let result = sqlx::query(INSERT_ADMISSION)
        .bind(&record.university)
        .bind(&record.program)
        .bind(&record.comments)
        .bind(parse_date_added(record.date_added.as_deref()))
        .bind(&record.url)
        .bind(&record.status)
        .bind(&record.term)
        .bind(&record.origin)
        .bind(parse_metric(record.gpa.as_deref()))
        .bind(parse_metric(record.gre_quant.as_deref()))
        .bind(parse_metric(record.gre_verbal.as_deref()))
        .bind(parse_metric(record.gre_aw.as_deref()))
        .bind(&record.degree)
        .bind(&record.llm_generated_program)
        .bind(&record.llm_generated_university)
        .bind(result_page)
        .execute(&mut **tx)
        .await?;

    if result.rows_affected() == 0 {
        Ok(LineOutcome::Conflicted)
    } else {
        Ok(LineOutcome::Inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire_json(url: &str) -> serde_json::Value {
        serde_json::json!({
            "university": "MIT",
            "program": "Computer Science",
            "comments": null,
            "date added": "January 1, 2026",
            "url": url,
            "application status": "Accepted",
            "application status date": "01/01/2026",
            "term": "Fall 2026",
            "US/International": "International",
            "GPA": "3.80",
            "GRE": "165",
            "GRE V": "160",
            "GRE AW": "4.50",
            "degree": "PhD",
            "llm-generated-program": "Computer Science",
            "llm-generated-university": "Massachusetts Institute of Technology"
        })
    }

    #[test]
    fn complete_lines_allow_nulls_but_not_empty_strings() {
        let complete = wire_json("https://x/result/1");
        assert!(line_is_complete(&complete));

        let mut with_empty = wire_json("https://x/result/1");
        with_empty["university"] = serde_json::json!("");
        assert!(!line_is_complete(&with_empty));

        assert!(!line_is_complete(&serde_json::json!(["not", "an", "object"])));
    }

    #[test]
    fn wire_record_round_trips_the_contract_field_names() {
        let record: WireRecord = serde_json::from_value(wire_json("https://x/result/7")).unwrap();
        assert_eq!(record.url.as_deref(), Some("https://x/result/7"));
        assert_eq!(record.status.as_deref(), Some("Accepted"));
        assert_eq!(record.origin.as_deref(), Some("International"));
        assert_eq!(record.comments, None);

        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("application status").is_some());
        assert!(json.get("US/International").is_some());
        assert!(json.get("llm-generated-university").is_some());
        assert_eq!(json["comments"], serde_json::Value::Null);
    }

    #[test]
    fn date_added_parses_long_form_or_loads_null() {
        assert_eq!(
            parse_date_added(Some("January 1, 2026")),
            NaiveDate::from_ymd_opt(2026, 1, 1)
        );
        assert_eq!(parse_date_added(Some("01/01/2026")), None);
        assert_eq!(parse_date_added(Some("")), None);
        assert_eq!(parse_date_added(None), None);
    }

    #[test]
    fn metrics_coerce_to_doubles_or_load_null() {
        assert_eq!(parse_metric(Some("3.80")), Some(3.80));
        assert_eq!(parse_metric(Some("165")), Some(165.0));
        assert_eq!(parse_metric(Some("n/a")), None);
        assert_eq!(parse_metric(None), None);
    }

    #[test]
    fn result_page_derives_from_the_url_tail() {
        let record: WireRecord = serde_json::from_value(wire_json("https://x/result/4321")).unwrap();
        assert_eq!(record.url.as_deref().and_then(result_id_from_url), Some(4321));
    }
}
