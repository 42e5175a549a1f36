//! Source adapter contract + one adapter per external opportunity provider.
//!
//! Upstream payloads are inconsistent (wrapped vs bare arrays, renamed fields,
//! stringly-typed numbers), so every adapter parses into the loosely-typed
//! `RawOpportunity` first and normalizes into the strict `Opportunity` at the
//! boundary. Records that cannot produce a title or an identifier are dropped,
//! never fabricated.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use fedscout_core::{
    dollars_to_cents, relevance_score, Opportunity, OpportunityStatus, Source,
};
use fedscout_storage::{HttpFetcher, SourceError};
use serde_json::{json, Value as JsonValue};

pub const CRATE_NAME: &str = "fedscout-adapters";

/// Unvalidated intermediate shape shared by all providers. Every field is
/// optional; validation happens once in `transform_raw`.
#[derive(Debug, Clone, Default)]
pub struct RawOpportunity {
    pub external_id: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub agency: Option<String>,
    pub agency_code: Option<String>,
    pub program: Option<String>,
    pub opportunity_type: Option<String>,
    pub status: Option<String>,
    pub award_floor: Option<f64>,
    pub award_ceiling: Option<f64>,
    pub estimated_funding: Option<f64>,
    pub post_date: Option<String>,
    pub close_date: Option<String>,
    pub archive_date: Option<String>,
    pub eligibility: Option<String>,
    pub applicant_types: Vec<String>,
    pub funding_categories: Vec<String>,
    pub keywords: Vec<String>,
    pub tags: Vec<String>,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> Source;

    /// Fetch raw listings for a query from the provider's endpoint.
    async fn fetch(
        &self,
        http: &HttpFetcher,
        query: &str,
    ) -> Result<Vec<RawOpportunity>, SourceError>;

    /// Normalize one raw record; `None` means the record was not minimally
    /// valid and is dropped.
    fn transform(&self, raw: RawOpportunity, observed_at: DateTime<Utc>) -> Option<Opportunity> {
        transform_raw(self.source(), raw, observed_at)
    }

    /// Fetch, normalize, and attach a provisional relevance score.
    async fn fetch_records(
        &self,
        http: &HttpFetcher,
        query: &str,
    ) -> Result<Vec<Opportunity>, SourceError> {
        let raws = self.fetch(http, query).await?;
        let observed_at = Utc::now();
        Ok(raws
            .into_iter()
            .filter_map(|raw| self.transform(raw, observed_at))
            .map(|mut record| {
                record.matching_score = relevance_score(&record, query);
                record
            })
            .collect())
    }
}

pub fn adapter_for_source(source: Source) -> Arc<dyn SourceAdapter> {
    match source {
        Source::GrantsGov => Arc::new(GrantsGovAdapter::new()),
        Source::SamGov => Arc::new(SamGovAdapter::from_env()),
        Source::Usaspending => Arc::new(UsaspendingAdapter::new()),
    }
}

pub fn default_adapters() -> Vec<Arc<dyn SourceAdapter>> {
    Source::ALL.iter().map(|s| adapter_for_source(*s)).collect()
}

fn transform_raw(
    source: Source,
    raw: RawOpportunity,
    observed_at: DateTime<Utc>,
) -> Option<Opportunity> {
    let title = raw
        .title
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());
    let external = raw
        .external_id
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty());
    if title.is_none() && external.is_none() {
        return None;
    }
    let title = title.unwrap_or_default();
    let external_id =
        external.unwrap_or_else(|| Opportunity::fallback_external_id(source, &title));

    let close_date = raw.close_date.as_deref().and_then(parse_flexible_date);
    let archive_date = raw.archive_date.as_deref().and_then(parse_flexible_date);
    let status = resolve_status(raw.status.as_deref(), close_date, observed_at);

    Some(Opportunity {
        id: Opportunity::compose_id(source, &external_id),
        source,
        external_id,
        title,
        description: raw.description.unwrap_or_default(),
        agency: raw.agency.unwrap_or_default(),
        agency_code: raw.agency_code,
        program: raw.program,
        opportunity_type: raw.opportunity_type,
        status,
        award_floor_cents: raw.award_floor.and_then(dollars_to_cents),
        award_ceiling_cents: raw.award_ceiling.and_then(dollars_to_cents),
        estimated_funding_cents: raw.estimated_funding.and_then(dollars_to_cents),
        post_date: raw.post_date.as_deref().and_then(parse_flexible_date),
        close_date,
        archive_date,
        eligibility: raw.eligibility,
        applicant_types: raw.applicant_types,
        funding_categories: raw.funding_categories,
        keywords: raw.keywords,
        tags: raw.tags,
        matching_score: 0.0,
        data_freshness: observed_at,
        last_verified: observed_at,
        updated_at: observed_at,
    })
}

fn resolve_status(
    raw_status: Option<&str>,
    close_date: Option<DateTime<Utc>>,
    observed_at: DateTime<Utc>,
) -> OpportunityStatus {
    if let Some(status) = raw_status {
        let status = status.trim().to_lowercase();
        match status.as_str() {
            "closed" | "archived" | "cancelled" | "canceled" | "inactive" | "no" => {
                return OpportunityStatus::Closed
            }
            "posted" | "forecasted" | "active" | "open" | "yes" => {
                return OpportunityStatus::Active
            }
            _ => {}
        }
    }
    match close_date {
        Some(close) if close < observed_at => OpportunityStatus::Closed,
        _ => OpportunityStatus::Active,
    }
}

fn parse_flexible_date(input: &str) -> Option<DateTime<Utc>> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    for fmt in ["%Y-%m-%d", "%m/%d/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|n| n.and_utc());
        }
    }
    None
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

fn json_str(value: &JsonValue, path: &[&str]) -> Option<String> {
    let node = json_at(value, path)?;
    let text = match node {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    match json_at(value, path)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => {
            let cleaned: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect();
            cleaned.parse::<f64>().ok()
        }
        _ => None,
    }
}

fn json_string_list(value: &JsonValue, path: &[&str]) -> Vec<String> {
    match json_at(value, path) {
        Some(JsonValue::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Some(JsonValue::String(s)) => s
            .split(['|', ';', ','])
            .map(|part| part.trim().to_string())
            .filter(|part| !part.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

fn json_array<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a Vec<JsonValue>> {
    json_at(value, path)?.as_array()
}

/// Grants.gov `search2` API: hits arrive wrapped under `data.oppHits` or, in
/// older responses, as a bare `oppHits` array.
#[derive(Debug, Clone)]
pub struct GrantsGovAdapter {
    base_url: String,
}

impl Default for GrantsGovAdapter {
    fn default() -> Self {
        Self {
            base_url: "https://api.grants.gov/v1/api".to_string(),
        }
    }
}

impl GrantsGovAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn parse_payload(&self, payload: &JsonValue) -> Vec<RawOpportunity> {
        let hits = json_array(payload, &["data", "oppHits"])
            .or_else(|| json_array(payload, &["oppHits"]))
            .map(|v| v.as_slice())
            .unwrap_or_default();
        hits.iter().map(|hit| self.parse_hit(hit)).collect()
    }

    fn parse_hit(&self, hit: &JsonValue) -> RawOpportunity {
        RawOpportunity {
            external_id: json_str(hit, &["number"]).or_else(|| json_str(hit, &["id"])),
            title: json_str(hit, &["title"]).or_else(|| json_str(hit, &["oppTitle"])),
            description: json_str(hit, &["synopsis"])
                .or_else(|| json_str(hit, &["description"])),
            agency: json_str(hit, &["agencyName"]).or_else(|| json_str(hit, &["agency"])),
            agency_code: json_str(hit, &["agencyCode"]),
            program: json_str(hit, &["alnist"]).or_else(|| json_str(hit, &["cfdaList"])),
            opportunity_type: json_str(hit, &["docType"]).or_else(|| json_str(hit, &["oppType"])),
            status: json_str(hit, &["oppStatus"]),
            award_floor: json_f64(hit, &["awardFloor"]),
            award_ceiling: json_f64(hit, &["awardCeiling"]),
            estimated_funding: json_f64(hit, &["estimatedFunding"]),
            post_date: json_str(hit, &["openDate"]).or_else(|| json_str(hit, &["postedDate"])),
            close_date: json_str(hit, &["closeDate"]),
            archive_date: json_str(hit, &["archiveDate"]),
            eligibility: json_str(hit, &["eligibility"]),
            applicant_types: json_string_list(hit, &["applicantTypes"]),
            funding_categories: json_string_list(hit, &["fundingCategories"]),
            keywords: json_string_list(hit, &["keywords"]),
            tags: json_string_list(hit, &["fundingInstruments"]),
        }
    }
}

#[async_trait]
impl SourceAdapter for GrantsGovAdapter {
    fn source(&self) -> Source {
        Source::GrantsGov
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        query: &str,
    ) -> Result<Vec<RawOpportunity>, SourceError> {
        let body = json!({
            "keyword": query,
            "rows": 100,
            "oppStatuses": "forecasted|posted|closed",
        });
        let url = format!("{}/search2", self.base_url);
        let payload = http.post_json(self.source(), &url, &body).await?;
        Ok(self.parse_payload(&payload))
    }
}

/// SAM.gov opportunities API: rows under `opportunitiesData`, api key passed
/// as a query parameter.
#[derive(Debug, Clone)]
pub struct SamGovAdapter {
    base_url: String,
    api_key: Option<String>,
}

impl SamGovAdapter {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            base_url: "https://api.sam.gov/opportunities/v2".to_string(),
            api_key,
        }
    }

    pub fn from_env() -> Self {
        Self::new(std::env::var("SAM_GOV_API_KEY").ok())
    }

    fn parse_payload(&self, payload: &JsonValue) -> Vec<RawOpportunity> {
        let rows = json_array(payload, &["opportunitiesData"])
            .or_else(|| payload.as_array())
            .map(|v| v.as_slice())
            .unwrap_or_default();
        rows.iter().map(|row| self.parse_row(row)).collect()
    }

    fn parse_row(&self, row: &JsonValue) -> RawOpportunity {
        RawOpportunity {
            external_id: json_str(row, &["noticeId"])
                .or_else(|| json_str(row, &["solicitationNumber"])),
            title: json_str(row, &["title"]),
            description: json_str(row, &["description"]),
            agency: json_str(row, &["fullParentPathName"])
                .or_else(|| json_str(row, &["departmentName"]))
                .or_else(|| json_str(row, &["organizationName"])),
            agency_code: json_str(row, &["fullParentPathCode"])
                .or_else(|| json_str(row, &["organizationCode"])),
            program: json_str(row, &["classificationCode"]),
            opportunity_type: json_str(row, &["type"])
                .or_else(|| json_str(row, &["baseType"])),
            status: json_str(row, &["active"]),
            award_floor: None,
            award_ceiling: json_f64(row, &["award", "amount"]),
            estimated_funding: json_f64(row, &["award", "amount"]),
            post_date: json_str(row, &["postedDate"]),
            close_date: json_str(row, &["responseDeadLine"])
                .or_else(|| json_str(row, &["responseDeadline"])),
            archive_date: json_str(row, &["archiveDate"]),
            eligibility: json_str(row, &["typeOfSetAsideDescription"]),
            applicant_types: json_string_list(row, &["typeOfSetAside"]),
            funding_categories: json_string_list(row, &["naicsCodes"]),
            keywords: Vec::new(),
            tags: Vec::new(),
        }
    }
}

#[async_trait]
impl SourceAdapter for SamGovAdapter {
    fn source(&self) -> Source {
        Source::SamGov
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        query: &str,
    ) -> Result<Vec<RawOpportunity>, SourceError> {
        let url = format!("{}/search", self.base_url);
        let mut params: Vec<(&str, &str)> = vec![("keywords", query), ("limit", "100")];
        if let Some(key) = self.api_key.as_deref() {
            params.push(("api_key", key));
        }
        let payload = http.get_json(self.source(), &url, &params).await?;
        Ok(self.parse_payload(&payload))
    }
}

/// USAspending award search: rows under `results`, spreadsheet-style field
/// names with spaces.
#[derive(Debug, Clone)]
pub struct UsaspendingAdapter {
    base_url: String,
}

impl Default for UsaspendingAdapter {
    fn default() -> Self {
        Self {
            base_url: "https://api.usaspending.gov/api/v2".to_string(),
        }
    }
}

impl UsaspendingAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn parse_payload(&self, payload: &JsonValue) -> Vec<RawOpportunity> {
        let rows = json_array(payload, &["results"])
            .map(|v| v.as_slice())
            .unwrap_or_default();
        rows.iter().map(|row| self.parse_row(row)).collect()
    }

    fn parse_row(&self, row: &JsonValue) -> RawOpportunity {
        RawOpportunity {
            external_id: json_str(row, &["Award ID"])
                .or_else(|| json_str(row, &["generated_internal_id"]))
                .or_else(|| json_str(row, &["internal_id"])),
            title: json_str(row, &["Description"])
                .or_else(|| json_str(row, &["Recipient Name"])),
            description: json_str(row, &["Description"]),
            agency: json_str(row, &["Awarding Agency"])
                .or_else(|| json_str(row, &["awarding_agency_name"])),
            agency_code: json_str(row, &["Awarding Sub Agency"]),
            program: json_str(row, &["CFDA Number"]),
            opportunity_type: json_str(row, &["Award Type"]),
            status: None,
            award_floor: None,
            award_ceiling: None,
            estimated_funding: json_f64(row, &["Award Amount"])
                .or_else(|| json_f64(row, &["award_amount"])),
            post_date: json_str(row, &["Start Date"]),
            close_date: json_str(row, &["End Date"]),
            archive_date: None,
            eligibility: None,
            applicant_types: Vec::new(),
            funding_categories: Vec::new(),
            keywords: Vec::new(),
            tags: Vec::new(),
        }
    }
}

#[async_trait]
impl SourceAdapter for UsaspendingAdapter {
    fn source(&self) -> Source {
        Source::Usaspending
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        query: &str,
    ) -> Result<Vec<RawOpportunity>, SourceError> {
        let body = json!({
            "filters": {
                "keywords": [query],
                "award_type_codes": ["02", "03", "04", "05"],
            },
            "fields": [
                "Award ID", "Recipient Name", "Description", "Awarding Agency",
                "Awarding Sub Agency", "Award Amount", "Start Date", "End Date",
                "Award Type", "CFDA Number",
            ],
            "limit": 100,
        });
        let url = format!("{}/search/spending_by_award/", self.base_url);
        let payload = http.post_json(self.source(), &url, &body).await?;
        Ok(self.parse_payload(&payload))
    }
}
