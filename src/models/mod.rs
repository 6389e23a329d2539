//! Domain models for the classification pipeline.
//!
//! An `Utterance` is one distinct chat text attributed to a date, a
//! `Classification` is what the LLM (or the local fallback) says about it,
//! and a `KeywordRecord` is the row the two combine into. The
//! `CategoryCatalog` is loaded once at startup and read-only afterwards.

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::error::CatalogError;

/// A distinct chat text observed on a specific date, with the number of
/// times it occurred inside the processing window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utterance {
    pub text: String,
    pub observed_on: NaiveDate,
    pub occurrences: i64,
}

/// The keyword and category assigned to one utterance.
///
/// `via_fallback` is set when the LLM could not be reached (or kept
/// misbehaving) and the classification was derived locally instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub keyword: String,
    pub category_id: i32,
    pub via_fallback: bool,
}

/// One row of the derived keyword table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordRecord {
    pub query_text: String,
    pub keyword: String,
    pub category_id: i32,
    pub query_count: i64,
    /// Date the utterance was observed in the chat store.
    pub created_at: NaiveDate,
    /// Wall-clock stamp of the run that produced this row. All rows of one
    /// run share it, which keeps the (text, date) insert key stable.
    pub batch_created_at: NaiveDateTime,
}

impl KeywordRecord {
    /// Combine an utterance and its classification into an insert-ready row.
    pub fn assemble(
        utterance: Utterance,
        classification: Classification,
        batch_created_at: NaiveDateTime,
    ) -> Self {
        Self {
            query_text: utterance.text,
            keyword: classification.keyword,
            category_id: classification.category_id,
            query_count: utterance.occurrences,
            created_at: utterance.observed_on,
            batch_created_at,
        }
    }
}

/// Immutable mapping of legal category ids to names, with one designated
/// fallback id for everything the taxonomy does not recognize.
#[derive(Debug, Clone)]
pub struct CategoryCatalog {
    categories: BTreeMap<i32, String>,
    fallback_id: i32,
}

impl CategoryCatalog {
    /// Build a catalog. The catalog must be non-empty and must contain the
    /// fallback id; anything else is a startup error.
    pub fn new(categories: BTreeMap<i32, String>, fallback_id: i32) -> Result<Self, CatalogError> {
        if categories.is_empty() {
            return Err(CatalogError::Empty);
        }
        if !categories.contains_key(&fallback_id) {
            return Err(CatalogError::MissingFallback(fallback_id));
        }
        Ok(Self {
            categories,
            fallback_id,
        })
    }

    pub fn contains(&self, category_id: i32) -> bool {
        self.categories.contains_key(&category_id)
    }

    /// Map an id onto the catalog, substituting the fallback for unknowns.
    pub fn resolve(&self, category_id: i32) -> i32 {
        if self.contains(category_id) {
            category_id
        } else {
            self.fallback_id
        }
    }

    pub fn fallback_id(&self) -> i32 {
        self.fallback_id
    }

    pub fn name(&self, category_id: i32) -> Option<&str> {
        self.categories.get(&category_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }
}
