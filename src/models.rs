use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CleanerError, Result};

/// Headers requested for every metadata fetch
pub const METADATA_HEADERS: &[&str] = &[
    "From",
    "Subject",
    "Date",
    "List-Unsubscribe",
    "List-Unsubscribe-Post",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub id: String,
    pub sender_email: String,
    pub sender_name: String,
    pub sender_domain: String,
    pub subject: String,
    pub date: Option<DateTime<Utc>>,
    pub size_estimate: u64,
    pub list_unsubscribe: Option<String>,
    pub list_unsubscribe_post: Option<String>,
    pub labels: Vec<String>,
}

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}$").unwrap()
});

static DOMAIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[A-Za-z0-9](?:[A-Za-z0-9\-]{0,61}[A-Za-z0-9])?\.)+[A-Za-z]{2,}$").unwrap()
});

static RELATIVE_AGE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[1-9][0-9]{0,3}[dmy]$").unwrap());

static SIZE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[1-9][0-9]{0,5}[KkMm]?$").unwrap());

static DATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]{4}/(0[1-9]|1[0-2])/(0[1-9]|[12][0-9]|3[01])$").unwrap());

const CATEGORIES: &[&str] = &["primary", "social", "promotions", "updates", "forums"];

/// Accepts either a full address or a bare domain
pub fn validate_sender(sender: &str) -> Result<()> {
    let sender = sender.trim();
    if EMAIL_RE.is_match(sender) || DOMAIN_RE.is_match(sender) {
        Ok(())
    } else {
        Err(CleanerError::ValidationError(format!(
            "'{}' is not a valid email address or domain",
            sender
        )))
    }
}

/// Optional narrowing applied to every candidate query
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryFilters {
    /// Relative age such as `30d`, `6m`, `1y`
    pub older_than: Option<String>,
    /// Size such as `5M` or `500K`
    pub larger_than: Option<String>,
    pub category: Option<String>,
    /// `YYYY/MM/DD`
    pub after: Option<String>,
    /// `YYYY/MM/DD`
    pub before: Option<String>,
}

impl QueryFilters {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        fn check(field: &str, value: &Option<String>, re: &Regex) -> Result<()> {
            match value {
                Some(v) if !re.is_match(v) => Err(CleanerError::ValidationError(format!(
                    "Invalid {} filter: '{}'",
                    field, v
                ))),
                _ => Ok(()),
            }
        }

        check("older_than", &self.older_than, &RELATIVE_AGE_RE)?;
        check("larger_than", &self.larger_than, &SIZE_RE)?;
        check("after", &self.after, &DATE_RE)?;
        check("before", &self.before, &DATE_RE)?;

        if let Some(category) = &self.category {
            if !CATEGORIES.contains(&category.to_lowercase().as_str()) {
                return Err(CleanerError::ValidationError(format!(
                    "Invalid category filter: '{}'",
                    category
                )));
            }
        }
        Ok(())
    }

    /// Render as Gmail search operators
    pub fn to_query(&self) -> String {
        let mut parts = Vec::new();
        if let Some(v) = &self.older_than {
            parts.push(format!("older_than:{}", v));
        }
        if let Some(v) = &self.larger_than {
            parts.push(format!("larger:{}", v));
        }
        if let Some(v) = &self.category {
            parts.push(format!("category:{}", v.to_lowercase()));
        }
        if let Some(v) = &self.after {
            parts.push(format!("after:{}", v));
        }
        if let Some(v) = &self.before {
            parts.push(format!("before:{}", v));
        }
        parts.join(" ")
    }

    /// Combine a base query with these filters
    pub fn apply(&self, base: &str) -> String {
        let filters = self.to_query();
        match (base.trim().is_empty(), filters.is_empty()) {
            (true, _) => filters,
            (false, true) => base.trim().to_string(),
            (false, false) => format!("{} {}", base.trim(), filters),
        }
    }
}
