use std::collections::{HashMap, HashSet};

use crate::types::DEFAULT_TAG;

/// Secondary index from a tag to the URLs requested under it, used for bulk invalidation.
#[derive(Debug)]
pub struct TagIndex {
    tags: HashMap<String, HashSet<String>>,
}

impl Default for TagIndex {
    fn default() -> Self {
        let mut tags = HashMap::new();
        tags.insert(DEFAULT_TAG.to_owned(), HashSet::new());
        Self { tags }
    }
}

impl TagIndex {
    pub fn insert(&mut self, tag: &str, url: &str) {
        self.tags
            .entry(tag.to_owned())
            .or_default()
            .insert(url.to_owned());
    }

    /// Forgets that `url` was requested under `tag`.
    pub fn remove(&mut self, tag: &str, url: &str) {
        if let Some(urls) = self.tags.get_mut(tag) {
            urls.remove(url);
            if urls.is_empty() && tag != DEFAULT_TAG {
                self.tags.remove(tag);
            }
        }
    }

    /// Removes `tag`, returning every URL that was listed under it.
    ///
    /// The default tag is emptied instead of removed.
    pub fn take(&mut self, tag: &str) -> HashSet<String> {
        if tag == DEFAULT_TAG {
            return self.tags.get_mut(tag).map(std::mem::take).unwrap_or_default();
        }
        self.tags.remove(tag).unwrap_or_default()
    }

    pub fn urls(&self, tag: &str) -> Option<&HashSet<String>> {
        self.tags.get(tag)
    }

    /// Number of known tags.
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
