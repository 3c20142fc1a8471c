//! Keyword-weighted topic classification.
//!
//! A lexicon maps category names to a weight and a keyword list:
//!
//! ```json
//! {
//!   "dechets": { "weight": 2, "keywords": ["tri", "collecte"] },
//!   "energie": { "weight": 1, "keywords": ["solaire"] }
//! }
//! ```
//!
//! Each category scores `weight * whole-word keyword hits`. The highest score
//! wins and ties go to the category listed first.

use crate::error::LexiconError;
use crate::models::UNKNOWN;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize)]
struct CategoryRule {
    weight: f64,
    keywords: Vec<String>,
}

#[derive(Debug, Clone)]
struct CompiledCategory {
    name: String,
    weight: f64,
    patterns: Vec<Regex>,
}

/// Parsed lexicon with categories kept in document order.
#[derive(Debug, Clone)]
pub struct CategoryLexicon {
    categories: Vec<CompiledCategory>,
}

impl CategoryLexicon {
    pub fn from_json_str(raw: &str) -> Result<Self, LexiconError> {
        let parsed: Value = serde_json::from_str(raw)?;
        let Value::Object(entries) = parsed else {
            return Err(LexiconError::NotAMapping);
        };

        let mut categories = Vec::with_capacity(entries.len());
        for (name, value) in entries {
            let rule: CategoryRule = serde_json::from_value(value).map_err(|error| {
                LexiconError::MalformedCategory {
                    category: name.clone(),
                    details: error.to_string(),
                }
            })?;

            let patterns = rule
                .keywords
                .iter()
                .map(|keyword| Regex::new(&format!(r"\b{}\b", regex::escape(keyword))))
                .collect::<Result<Vec<_>, _>>()?;

            categories.push(CompiledCategory {
                name,
                weight: rule.weight,
                patterns,
            });
        }

        Ok(Self { categories })
    }

    pub fn from_path(path: &Path) -> Result<Self, LexiconError> {
        let raw = fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    /// Scores per category, in lexicon order.
    pub fn scores(&self, text: &str) -> Vec<(&str, f64)> {
        self.categories
            .iter()
            .map(|category| {
                let hits: usize = category
                    .patterns
                    .iter()
                    .map(|pattern| pattern.find_iter(text).count())
                    .sum();
                (category.name.as_str(), category.weight * hits as f64)
            })
            .collect()
    }

    /// Best category, or `None` for an empty lexicon. Text matching nothing
    /// still gets the first category since every score is zero.
    pub fn best_category(&self, text: &str) -> Option<&str> {
        let mut best: Option<(&str, f64)> = None;
        for (name, score) in self.scores(text) {
            match best {
                Some((_, best_score)) if score <= best_score => {}
                _ => best = Some((name, score)),
            }
        }
        best.map(|(name, _)| name)
    }
}

/// Classifier that never fails: a missing or malformed lexicon degrades every
/// answer to `"unknown"` so indexing carries on.
#[derive(Debug, Clone)]
pub struct CategoryClassifier {
    lexicon: Option<CategoryLexicon>,
}

impl CategoryClassifier {
    pub fn new(lexicon: CategoryLexicon) -> Self {
        Self {
            lexicon: Some(lexicon),
        }
    }

    /// Loads and caches the lexicon once.
    pub fn load(path: &Path) -> Self {
        match CategoryLexicon::from_path(path) {
            Ok(lexicon) => {
                if lexicon.is_empty() {
                    warn!(path = %path.display(), "category lexicon is empty, chunks will be labelled unknown");
                } else {
                    info!(path = %path.display(), categories = lexicon.len(), "loaded category lexicon");
                }
                Self::new(lexicon)
            }
            Err(error) => {
                warn!(path = %path.display(), %error, "category lexicon unavailable, chunks will be labelled unknown");
                Self::unavailable()
            }
        }
    }

    pub fn unavailable() -> Self {
        Self { lexicon: None }
    }

    pub fn is_available(&self) -> bool {
        self.lexicon.is_some()
    }

    pub fn classify(&self, text: &str) -> String {
        self.lexicon
            .as_ref()
            .and_then(|lexicon| lexicon.best_category(text))
            .unwrap_or(UNKNOWN)
            .to_string()
    }
}
