//! Listing/detail fetchers, bounded concurrent runner, and incremental
//! filtering for the admissions board scraper.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use futures::stream::{self, StreamExt};
use scraper::{Html, Selector};
use thiserror::Error;
use tracing::{debug, warn};

use adit_core::{result_id_from_url, PartialRecord, RawRecord, RowGroup};

pub const CRATE_NAME: &str = "adit-scrape";

pub const DEFAULT_BASE_URL: &str = "https://www.thegradcafe.com";

/// 21 records per listing page; 2000 pages covers the board's history.
pub const DEFAULT_LISTING_PAGES: u32 = 2000;

/// A polite ceiling against the remote site. Raise with care.
pub const DEFAULT_POOL_SIZE: usize = 10;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Path substrings disallowed by the site's robots.txt.
const DISALLOWED_PATHS: &[&str] = &["/cgi-bin/", "/index-ad-test.php"];

/// Presenting as a standard Chrome browser keeps the board from serving the
/// degraded bot markup.
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Whether a URL touches a path the static deny-list forbids.
pub fn is_restricted_path(url: &str) -> bool {
    DISALLOWED_PATHS.iter().any(|path| url.contains(path))
}

#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    pub base_url: String,
    pub listing_pages: u32,
    pub workers: usize,
    pub timeout: Duration,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            listing_pages: DEFAULT_LISTING_PAGES,
            workers: DEFAULT_POOL_SIZE,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Execute `worker` over every input with at most `workers` calls in flight.
/// Each worker yields a batch; failures are logged with their input and
/// dropped so one bad page never aborts the run. Output order is
/// unspecified.
pub async fn run_pool<I, T, F, Fut>(inputs: Vec<I>, workers: usize, worker: F) -> Vec<T>
where
    I: std::fmt::Display,
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<Vec<T>, FetchError>>,
{
    stream::iter(inputs)
        .map(|input| {
            let label = input.to_string();
            let fut = worker(input);
            async move {
                match fut.await {
                    Ok(batch) => batch,
                    Err(err) => {
                        warn!(input = %label, error = %err, "fetch task failed; skipping");
                        Vec::new()
                    }
                }
            }
        })
        .buffer_unordered(workers.max(1))
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .flatten()
        .collect()
}

/// Single-result variant of [`run_pool`]: workers yield a record or nothing;
/// only `Some` results are collected.
pub async fn run_pool_filter<I, T, F, Fut>(inputs: Vec<I>, workers: usize, worker: F) -> Vec<T>
where
    I: std::fmt::Display,
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<Option<T>, FetchError>>,
{
    run_pool(inputs, workers, |input| {
        let fut = worker(input);
        async move { fut.await.map(|item| item.into_iter().collect()) }
    })
    .await
}

/// Parse one listing page's `<table>` into row-groups. A `<tr>` with no
/// attributes starts a new record; attributed rows continue the current one.
/// The row's anchor href, when present, lands at the group's element 0.
pub fn parse_listing_table(html: &str) -> Vec<RowGroup> {
    let document = Html::parse_document(html);
    let (Ok(table_sel), Ok(tr_sel), Ok(td_sel), Ok(a_sel)) = (
        Selector::parse("table"),
        Selector::parse("tr"),
        Selector::parse("td"),
        Selector::parse("a"),
    ) else {
        return Vec::new();
    };

    let Some(table) = document.select(&table_sel).next() else {
        return Vec::new();
    };

    let mut groups = Vec::new();
    let mut current: Vec<String> = Vec::new();
    // skip(1) drops the header row
    for row in table.select(&tr_sel).skip(1) {
        if row.value().attrs().next().is_none() {
            if !current.is_empty() {
                groups.push(RowGroup::new(std::mem::take(&mut current)));
            }
        }

        if let Some(href) = row
            .select(&a_sel)
            .next()
            .and_then(|a| a.value().attr("href"))
        {
            current.insert(0, href.to_string());
        }
        current.extend(row.select(&td_sel).map(|td| td.text().collect::<String>()));
    }
    if !current.is_empty() {
        groups.push(RowGroup::new(current));
    }
    groups
}

fn assign_detail_field(record: &mut RawRecord, index: usize, value: String) {
    match index {
        0 => record.university = value,
        1 => record.program = value,
        2 => record.degree = value,
        3 => record.origin = value,
        4 => record.status = value,
        5 => record.status_date = value,
        6 => record.gpa = value,
        8 => record.comments = value,
        _ => {}
    }
}

/// Parse a detail page's `<dl>` entries into the seeded record. Entries map
/// to fields by position; entry 7 is the GRE block whose three `<li>` items
/// carry quant/verbal/AW values in `<b>` tags. A missing value node leaves
/// its field unset. Pages with no entries yield `None`.
pub fn parse_detail_entries(html: &str, partial: &PartialRecord) -> Option<RawRecord> {
    let document = Html::parse_document(html);
    let (Ok(dl_sel), Ok(div_sel), Ok(dd_sel), Ok(li_b_sel)) = (
        Selector::parse("dl"),
        Selector::parse("div"),
        Selector::parse("dd"),
        Selector::parse("li b"),
    ) else {
        return None;
    };

    let dl = document.select(&dl_sel).next()?;
    let entries: Vec<_> = dl.select(&div_sel).collect();
    if entries.is_empty() {
        return None;
    }

    let mut record = RawRecord::seeded(partial);
    for (index, entry) in entries.iter().enumerate() {
        if index == 7 {
            let scores: Vec<String> = entry
                .select(&li_b_sel)
                .map(|b| b.text().collect::<String>())
                .collect();
            if let [quant, verbal, aw] = scores.as_slice() {
                record.gre_quant = quant.clone();
                record.gre_verbal = verbal.clone();
                record.gre_aw = aw.clone();
            }
            continue;
        }
        if let Some(dd) = entry.select(&dd_sel).next() {
            assign_detail_field(&mut record, index, dd.text().collect::<String>());
        }
    }
    Some(record)
}

/// Drop row-groups that are already stored. A group survives the watermark
/// check when its result id fails to parse; the known-URL check is the
/// backstop for those. With neither bound set this is a no-op.
pub fn filter_unseen(
    rows: Vec<RowGroup>,
    base_url: &str,
    min_result_id: Option<i32>,
    known_urls: &HashSet<String>,
) -> Vec<RowGroup> {
    if min_result_id.is_none() && known_urls.is_empty() {
        return rows;
    }
    rows.into_iter()
        .filter(|group| {
            let Some(url) = group.detail_url(base_url) else {
                return false;
            };
            if known_urls.contains(&url) {
                return false;
            }
            match (min_result_id, result_id_from_url(&url)) {
                (Some(min), Some(id)) => id >= min,
                _ => true,
            }
        })
        .collect()
}

/// Two-phase scraper over the admissions board: listing pages are fanned out
/// through the worker pool, surviving row-groups are hydrated from their
/// detail pages.
#[derive(Debug)]
pub struct Scraper {
    client: reqwest::Client,
    config: ScrapeConfig,
}

impl Scraper {
    pub fn new(config: ScrapeConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(BROWSER_USER_AGENT)
            .build()
            .context("building reqwest client")?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ScrapeConfig {
        &self.config
    }

    async fn fetch_html(&self, url: &str) -> Result<String, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(resp.text().await?)
    }

    /// Fetch and parse one listing page. Deny-listed URLs short-circuit to an
    /// empty result without touching the network; parse misses degrade to an
    /// empty result as well.
    pub async fn fetch_listing_page(&self, page: u32) -> Result<Vec<RowGroup>, FetchError> {
        let url = format!("{}/survey/?page={page}", self.config.base_url);
        if is_restricted_path(&url) {
            return Ok(Vec::new());
        }
        let html = self.fetch_html(&url).await?;
        Ok(parse_listing_table(&html))
    }

    /// Fetch one detail page and fill the seeded record.
    pub async fn fetch_detail_page(
        &self,
        partial: PartialRecord,
    ) -> Result<Option<RawRecord>, FetchError> {
        if is_restricted_path(&partial.url) {
            return Ok(None);
        }
        let html = self.fetch_html(&partial.url).await?;
        Ok(parse_detail_entries(&html, &partial))
    }

    /// Run the full two-phase scrape: all listing pages, incremental filter,
    /// then the detail pool. Duplicate detail URLs within the sweep are
    /// collapsed to their first occurrence.
    pub async fn scrape(
        &self,
        min_result_id: Option<i32>,
        known_urls: &HashSet<String>,
    ) -> Vec<RawRecord> {
        let pages: Vec<u32> = (1..=self.config.listing_pages).collect();
        let rows = run_pool(pages, self.config.workers, |page| {
            self.fetch_listing_page(page)
        })
        .await;
        debug!(row_groups = rows.len(), "listing sweep complete");

        let rows = filter_unseen(rows, &self.config.base_url, min_result_id, known_urls);

        let mut seen = HashSet::new();
        let partials: Vec<PartialRecord> = rows
            .iter()
            .filter_map(|group| PartialRecord::from_row_group(group, &self.config.base_url))
            .filter(|partial| seen.insert(partial.url.clone()))
            .collect();

        let records = run_pool_filter(partials, self.config.workers, |partial| {
            self.fetch_detail_page(partial)
        })
        .await;
        debug!(records = records.len(), "detail sweep complete");
        records
    }
}
