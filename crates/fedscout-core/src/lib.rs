//! Core domain model and relevance scoring for fedscout.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "fedscout-core";

/// Neutral score assigned when the query is blank, so unfiltered browsing
/// still ranks records sensibly instead of collapsing to zero.
pub const NEUTRAL_SCORE: f64 = 0.7;

/// Hard bounds on every computed relevance score.
pub const MIN_SCORE: f64 = 0.10;
pub const MAX_SCORE: f64 = 0.95;

/// External providers of opportunity listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    GrantsGov,
    SamGov,
    Usaspending,
}

impl Source {
    pub const ALL: [Source; 3] = [Source::GrantsGov, Source::SamGov, Source::Usaspending];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::GrantsGov => "grants-gov",
            Source::SamGov => "sam-gov",
            Source::Usaspending => "usaspending",
        }
    }

    /// Tie-break preference during dedup. Lower sorts first. This is a tunable
    /// policy, not a measured data-quality ranking.
    pub fn priority(&self) -> u8 {
        match self {
            Source::GrantsGov => 0,
            Source::SamGov => 1,
            Source::Usaspending => 2,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for Source {}

#[derive(Debug, Error)]
#[error("unknown opportunity source: {0}")]
pub struct UnknownSource(pub String);

impl FromStr for Source {
    type Err = UnknownSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "grants-gov" | "grants_gov" | "grantsgov" => Ok(Source::GrantsGov),
            "sam-gov" | "sam_gov" | "samgov" => Ok(Source::SamGov),
            "usaspending" | "usa-spending" => Ok(Source::Usaspending),
            other => Err(UnknownSource(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpportunityStatus {
    Active,
    Closed,
}

impl OpportunityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpportunityStatus::Active => "active",
            OpportunityStatus::Closed => "closed",
        }
    }

    /// Persisted statuses are one of the two known strings; anything else is
    /// treated as active rather than failing the read path.
    pub fn from_db(value: &str) -> Self {
        if value.eq_ignore_ascii_case("closed") {
            OpportunityStatus::Closed
        } else {
            OpportunityStatus::Active
        }
    }
}

/// Canonical normalized grant/award record produced by the pipeline.
///
/// `matching_score` is query-dependent and recomputed on every aggregation
/// pass; it is never persisted as authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: String,
    pub source: Source,
    pub external_id: String,
    pub title: String,
    pub description: String,
    pub agency: String,
    pub agency_code: Option<String>,
    pub program: Option<String>,
    pub opportunity_type: Option<String>,
    pub status: OpportunityStatus,
    pub award_floor_cents: Option<i64>,
    pub award_ceiling_cents: Option<i64>,
    pub estimated_funding_cents: Option<i64>,
    pub post_date: Option<DateTime<Utc>>,
    pub close_date: Option<DateTime<Utc>>,
    pub archive_date: Option<DateTime<Utc>>,
    pub eligibility: Option<String>,
    pub applicant_types: Vec<String>,
    pub funding_categories: Vec<String>,
    pub keywords: Vec<String>,
    pub tags: Vec<String>,
    pub matching_score: f64,
    pub data_freshness: DateTime<Utc>,
    pub last_verified: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Opportunity {
    /// Stable identifier: `{source}-{external_id}`.
    pub fn compose_id(source: Source, external_id: &str) -> String {
        format!("{}-{}", source.as_str(), external_id)
    }

    /// Deterministic fallback external id for providers that omit one,
    /// derived from the source and normalized title so re-fetches of the
    /// same listing map to the same row.
    pub fn fallback_external_id(source: Source, title: &str) -> String {
        let seed = format!("{}:{}", source.as_str(), normalize_text(title));
        Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes()).to_string()
    }
}

/// Per-source failure attached to a partial or total aggregation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFailure {
    pub source: Source,
    pub message: String,
}

/// Aggregated search outcome returned to callers and stored in the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub records: Vec<Opportunity>,
    pub source_count: usize,
    pub partial_data: bool,
    pub errors: Vec<SourceFailure>,
    pub from_cache: bool,
}

#[derive(Debug, Error)]
pub enum SearchError {
    /// The live-data feature flag is off. Callers must see this rather than
    /// an empty result that looks like a valid answer.
    #[error("live opportunity data is disabled")]
    LiveDataDisabled,
    /// Every configured source exhausted its retries.
    #[error("all opportunity sources failed ({})", .0.len())]
    AllSourcesFailed(Vec<SourceFailure>),
}

/// Per-run record counters reported in audit log entries and summaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionCounts {
    pub fetched: u32,
    pub inserted: u32,
    pub updated: u32,
    pub skipped: u32,
    pub failed: u32,
}

impl IngestionCounts {
    pub fn absorb(&mut self, other: &IngestionCounts) {
        self.fetched += other.fetched;
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// Convert an upstream dollar amount to minor units, rounding half away from
/// zero. Negative and non-finite inputs are treated as unknown.
pub fn dollars_to_cents(amount: f64) -> Option<i64> {
    if !amount.is_finite() || amount < 0.0 {
        return None;
    }
    Some((amount * 100.0).round() as i64)
}

/// Lowercase and strip punctuation, collapsing runs of whitespace.
pub fn normalize_text(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Deterministic lexical relevance score for a record against a query.
///
/// Tokenizes the query on whitespace; each token contributes containment
/// weights (title 0.4, description 0.3, agency/program 0.2, tags 0.3). The
/// final score blends token coverage (0.6) with the weighted sum (0.4) and is
/// clamped to `[MIN_SCORE, MAX_SCORE]`. Blank queries yield `NEUTRAL_SCORE`.
pub fn relevance_score(record: &Opportunity, query: &str) -> f64 {
    let tokens: Vec<String> = query
        .split_whitespace()
        .map(|t| t.to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    if tokens.is_empty() {
        return NEUTRAL_SCORE;
    }

    let title = record.title.to_lowercase();
    let description = record.description.to_lowercase();
    let agency_text = format!(
        "{} {}",
        record.agency.to_lowercase(),
        record.program.as_deref().unwrap_or("").to_lowercase()
    );
    let tags: Vec<String> = record.tags.iter().map(|t| t.to_lowercase()).collect();

    let mut matched_tokens = 0usize;
    let mut weighted_sum = 0.0f64;
    for token in &tokens {
        let mut token_weight = 0.0f64;
        if title.contains(token.as_str()) {
            token_weight += 0.4;
        }
        if description.contains(token.as_str()) {
            token_weight += 0.3;
        }
        if agency_text.contains(token.as_str()) {
            token_weight += 0.2;
        }
        if tags.iter().any(|t| t.contains(token.as_str())) {
            token_weight += 0.3;
        }
        if token_weight > 0.0 {
            matched_tokens += 1;
        }
        weighted_sum += token_weight;
    }

    let total = tokens.len() as f64;
    let coverage = matched_tokens as f64 / total;
    let weighted = weighted_sum / total;
    (0.6 * coverage + 0.4 * weighted).clamp(MIN_SCORE, MAX_SCORE)
}
