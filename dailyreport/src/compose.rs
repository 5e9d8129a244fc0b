use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::article::ArticleSummary;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ComposeError {
    #[error("no successful summaries to compose")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub title: String,
    pub summary: String,
    pub url: String,
    pub published_at: Option<DateTime<Utc>>,
}

/// All entries from one origin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSection {
    pub origin: String,
    pub name: String,
    pub entries: Vec<ReportEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportDocument {
    pub title: String,
    pub generated_at: DateTime<Utc>,
    pub sections: Vec<ReportSection>,
}

impl ReportDocument {
    pub fn entry_count(&self) -> usize {
        self.sections.iter().map(|s| s.entries.len()).sum()
    }
}

/// Builds the report structure from summaries. No I/O.
#[derive(Debug, Clone)]
pub struct ReportComposer {
    title: String,
    /// Origin ids, highest priority first
    priority: Vec<String>,
    names: HashMap<String, String>,
}

impl ReportComposer {
    pub fn new(title: impl Into<String>, priority: Vec<String>) -> Self {
        Self { title: title.into(), priority, names: HashMap::new() }
    }

    /// Display name for an origin, its id otherwise
    pub fn with_name(mut self, origin: impl Into<String>, name: impl Into<String>) -> Self {
        self.names.insert(origin.into(), name.into());
        self
    }

    fn rank(&self, origin: &str) -> usize {
        self.priority.iter().position(|o| o == origin).unwrap_or(self.priority.len())
    }

    /// Successful summaries sorted newest first. Equal (or missing)
    /// timestamps fall back to source priority, then URL.
    pub fn ordered<'a>(&self, summaries: &'a [ArticleSummary]) -> Vec<&'a ArticleSummary> {
        let mut ok: Vec<&ArticleSummary> = summaries.iter().filter(|s| s.is_ok()).collect();
        ok.sort_by(|a, b| {
            let (a, b) = (&a.article, &b.article);
            let by_time = match (a.published_at, b.published_at) {
                (Some(x), Some(y)) => y.cmp(&x),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            by_time
                .then_with(|| self.rank(&a.origin).cmp(&self.rank(&b.origin)))
                .then_with(|| a.origin.cmp(&b.origin))
                .then_with(|| a.url.cmp(&b.url))
        });
        ok
    }

    pub fn compose(
        &self,
        summaries: &[ArticleSummary],
        generated_at: DateTime<Utc>,
    ) -> Result<ReportDocument, ComposeError> {
        let ordered = self.ordered(summaries);
        if ordered.is_empty() {
            return Err(ComposeError::Empty);
        }

        let mut sections: Vec<ReportSection> = Vec::new();
        for summary in ordered {
            let origin = &summary.article.origin;
            let entry = ReportEntry {
                title: summary.article.title.clone(),
                summary: summary.text.clone(),
                url: summary.article.url.clone(),
                published_at: summary.article.published_at,
            };
            match sections.iter_mut().find(|s| &s.origin == origin) {
                Some(section) => section.entries.push(entry),
                None => sections.push(ReportSection {
                    origin: origin.clone(),
                    name: self.names.get(origin).cloned().unwrap_or_else(|| origin.clone()),
                    entries: vec![entry],
                }),
            }
        }

        // Sections follow source priority
        sections.sort_by(|a, b| {
            self.rank(&a.origin)
                .cmp(&self.rank(&b.origin))
                .then_with(|| a.origin.cmp(&b.origin))
        });

        Ok(ReportDocument { title: self.title.clone(), generated_at, sections })
    }
}
