//! Hierarchical keyword filter.
//!
//! A title passes a [`FilterSpec`] when every level contains at least one
//! keyword found in the title. Matching is case-insensitive substring
//! containment, so "tv" also matches "smart tv" and "tvs".

use crate::config::FilterSpec;

/// Returns true if the title satisfies every level of the filter.
///
/// A filter without levels matches everything.
pub fn matches(title: &str, spec: &FilterSpec) -> bool {
    if spec.is_empty() {
        return true;
    }

    let title = title.to_lowercase();
    spec.levels().iter().all(|level| {
        level
            .folded_keywords()
            .iter()
            .any(|keyword| !keyword.is_empty() && title.contains(keyword.as_str()))
    })
}
