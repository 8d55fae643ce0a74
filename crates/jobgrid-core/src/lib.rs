//! Core domain model for the jobgrid listing catalog.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobgrid-core";

/// Unvalidated listing extracted from a source page, prior to entity
/// resolution. `source_url` is the sole dedup key for the whole pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawListing {
    pub title: String,
    pub description: String,
    pub company_name: String,
    pub location_name: String,
    pub category_name: String,
    pub source_url: String,
    pub source_site: String,
    pub employment_type: Option<String>,
    pub salary_min: Option<f64>,
    pub salary_max: Option<f64>,
    pub posted_at: Option<DateTime<Utc>>,
}

impl RawListing {
    /// A listing enters the pipeline only with a non-empty source URL,
    /// title, and company name. Anything else is filtered out upstream and
    /// counted in the raw total alone.
    pub fn is_ingestible(&self) -> bool {
        !self.source_url.trim().is_empty()
            && !self.title.trim().is_empty()
            && !self.company_name.trim().is_empty()
    }
}

/// State/country applied when a location row is first created for a city.
/// Subsequent sightings of the same city never re-derive these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationDefaults {
    pub state: String,
    pub country: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: Uuid,
    pub city: String,
    pub state: String,
    pub country: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCategory {
    pub id: Uuid,
    pub name: String,
}

/// Fully resolved record ready for insertion into the jobs table. Created
/// exactly once per distinct source URL; never mutated by later runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJobRecord {
    pub title: String,
    pub description: String,
    pub company_id: Uuid,
    pub location_id: Uuid,
    pub category_id: Uuid,
    pub source_url: String,
    pub source_site: String,
    pub employment_type: Option<String>,
    pub salary_min: Option<f64>,
    pub salary_max: Option<f64>,
    pub posted_at: Option<DateTime<Utc>>,
}

/// Case-insensitive natural-key form shared by every resolution path.
/// Collapses interior whitespace so "Acme  Pte Ltd" and "acme pte ltd"
/// resolve to the same entity.
pub fn natural_key(name: &str) -> String {
    name.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(title: &str, company: &str, url: &str) -> RawListing {
        RawListing {
            title: title.to_string(),
            description: String::new(),
            company_name: company.to_string(),
            location_name: "Singapore".to_string(),
            category_name: "Technology".to_string(),
            source_url: url.to_string(),
            source_site: "jobstreet".to_string(),
            employment_type: None,
            salary_min: None,
            salary_max: None,
            posted_at: None,
        }
    }

    #[test]
    fn ingestible_requires_url_title_and_company() {
        assert!(listing("Engineer", "Acme", "https://x/1").is_ingestible());
        assert!(!listing("", "Acme", "https://x/1").is_ingestible());
        assert!(!listing("Engineer", "  ", "https://x/1").is_ingestible());
        assert!(!listing("Engineer", "Acme", "").is_ingestible());
    }

    #[test]
    fn natural_key_is_case_and_whitespace_insensitive() {
        assert_eq!(natural_key("Acme  Pte Ltd"), "acme pte ltd");
        assert_eq!(natural_key("ACME PTE LTD"), natural_key("acme pte ltd"));
    }
}
