//! Document selector: which documents the worker is told about.

use conduit_types::DocumentFilterConfig;
use globset::{Glob, GlobMatcher};
use url::Url;

#[derive(Debug, Clone)]
struct DocumentFilter {
    scheme: Option<String>,
    language: Option<String>,
    pattern: Option<GlobMatcher>,
}

impl DocumentFilter {
    fn matches(&self, uri: &Url, language_id: &str) -> bool {
        if let Some(scheme) = &self.scheme
            && scheme != uri.scheme()
        {
            return false;
        }
        if let Some(language) = &self.language
            && language != language_id
        {
            return false;
        }
        match &self.pattern {
            None => true,
            Some(glob) => match uri.to_file_path() {
                Ok(path) if uri.scheme() == "file" => glob.is_match(path),
                _ => glob.is_match(uri.path()),
            },
        }
    }
}

/// A list of filters; a document is selected when any filter admits it.
#[derive(Debug, Clone, Default)]
pub struct DocumentSelector {
    filters: Vec<DocumentFilter>,
}

impl DocumentSelector {
    /// Compile configured filters. Patterns were validated when the config
    /// was built, so a glob that still fails to compile is skipped with a
    /// warning rather than widening the filter.
    #[must_use]
    pub fn from_config(filters: &[DocumentFilterConfig]) -> Self {
        let filters = filters
            .iter()
            .filter_map(|filter| {
                let pattern = match filter.pattern() {
                    None => None,
                    Some(pattern) => match Glob::new(pattern) {
                        Ok(glob) => Some(glob.compile_matcher()),
                        Err(e) => {
                            tracing::warn!("Skipping document filter with bad glob: {e}");
                            return None;
                        }
                    },
                };
                Some(DocumentFilter {
                    scheme: filter.scheme().map(str::to_string),
                    language: filter.language().map(str::to_string),
                    pattern,
                })
            })
            .collect();
        Self { filters }
    }

    #[must_use]
    pub fn matches(&self, uri: &Url, language_id: &str) -> bool {
        self.filters.iter().any(|f| f.matches(uri, language_id))
    }
}
