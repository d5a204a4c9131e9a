//! An in-memory [`SearchIndex`] for tests.
//!
//! Models the parts of the real engine the domain relies on: upsert /
//! delete by id, exact filters, and full-text matching over the
//! searchable attributes with a one-edit typo tolerance.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::search::{OfferDoc, OfferQuery, SearchError, SearchIndex};

#[derive(Default)]
pub struct MemoryIndex {
    docs: Mutex<HashMap<String, OfferDoc>>,
    settings_pushed: Mutex<bool>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.docs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.lock().unwrap().is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.docs.lock().unwrap().contains_key(id)
    }
}

#[async_trait]
impl SearchIndex for MemoryIndex {
    async fn ensure_settings(&self) -> Result<(), SearchError> {
        *self.settings_pushed.lock().unwrap() = true;
        Ok(())
    }

    async fn upsert(&self, docs: &[OfferDoc]) -> Result<(), SearchError> {
        let mut stored = self.docs.lock().unwrap();
        for doc in docs {
            stored.insert(doc.id.clone(), doc.clone());
        }
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<(), SearchError> {
        let mut stored = self.docs.lock().unwrap();
        for id in ids {
            stored.remove(id);
        }
        Ok(())
    }

    async fn search(
        &self,
        query: &OfferQuery,
    ) -> Result<Vec<OfferDoc>, SearchError> {
        let stored = self.docs.lock().unwrap();
        let mut hits: Vec<OfferDoc> = stored
            .values()
            .filter(|doc| {
                query
                    .service_slug
                    .as_deref()
                    .is_none_or(|slug| doc.service_slug == slug)
            })
            .filter(|doc| {
                query
                    .country_code
                    .as_deref()
                    .is_none_or(|code| doc.country_code == code)
            })
            .filter(|doc| match query.q.as_deref() {
                None => true,
                Some(q) => fuzzy_matches(doc, q),
            })
            .cloned()
            .collect();
        hits.sort_by(|a, b| a.id.cmp(&b.id));
        hits.truncate(if query.limit == 0 { 20 } else { query.limit });
        Ok(hits)
    }
}

/// Full-text match over the searchable attributes with one-edit typo
/// tolerance, mimicking the real engine's behavior closely enough for
/// the aggregate queries to be exercised.
fn fuzzy_matches(doc: &OfferDoc, q: &str) -> bool {
    let needle = q.trim().to_ascii_lowercase();
    if needle.is_empty() {
        return true;
    }
    [
        doc.service_name.as_str(),
        doc.service_slug.as_str(),
        doc.country_name.as_str(),
        doc.country_code.as_str(),
        doc.provider.as_str(),
        doc.display_name.as_str(),
    ]
    .iter()
    .any(|haystack| {
        let haystack = haystack.to_ascii_lowercase();
        haystack.contains(&needle)
            || haystack
                .split_whitespace()
                .any(|word| edit_distance_at_most_one(word, &needle))
    })
}

fn edit_distance_at_most_one(a: &str, b: &str) -> bool {
    let (a, b): (Vec<char>, Vec<char>) =
        (a.chars().collect(), b.chars().collect());
    let (short, long) = if a.len() <= b.len() { (&a, &b) } else { (&b, &a) };
    match long.len() - short.len() {
        0 => {
            // At most one substitution.
            short
                .iter()
                .zip(long.iter())
                .filter(|(x, y)| x != y)
                .count()
                <= 1
        }
        1 => {
            // One insertion.
            let mut skipped = false;
            let (mut i, mut j) = (0, 0);
            while i < short.len() && j < long.len() {
                if short[i] == long[j] {
                    i += 1;
                    j += 1;
                } else if skipped {
                    return false;
                } else {
                    skipped = true;
                    j += 1;
                }
            }
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn edit_distance() {
        assert!(edit_distance_at_most_one("telegram", "telegram"));
        assert!(edit_distance_at_most_one("telegram", "telegrm"));
        assert!(edit_distance_at_most_one("telegram", "telegran"));
        assert!(!edit_distance_at_most_one("telegram", "telegra-m-x"));
        assert!(!edit_distance_at_most_one("telegram", "viber"));
    }
}
