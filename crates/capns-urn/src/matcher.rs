//! Best-match selection over an ordered set of registered URNs.

use crate::CapUrn;

/// An ordered collection of `(CapUrn, T)` candidates with the fabric's
/// selection rules baked in: among candidates whose URN
/// [`accepts`](CapUrn::accepts) a request, the highest
/// [`specificity`](CapUrn::specificity) wins and insertion order breaks
/// ties (first inserted wins).
///
/// The linear scan is deliberate: registries are small and the scan keeps
/// the selection rules obvious. A tag-index can replace it behind the same
/// API if a registry ever grows past that.
#[derive(Debug, Clone, Default)]
pub struct CapMatcher<T> {
    entries: Vec<(CapUrn, T)>,
}

impl<T> CapMatcher<T> {
    pub fn new() -> Self {
        CapMatcher {
            entries: Vec::new(),
        }
    }

    /// Append a candidate. Insertion order is significant for tie-breaks.
    pub fn insert(&mut self, urn: CapUrn, value: T) {
        self.entries.push((urn, value));
    }

    /// Remove every candidate with this exact (canonical-equal) URN.
    /// Returns how many were removed.
    pub fn remove(&mut self, urn: &CapUrn) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(u, _)| u != urn);
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CapUrn, &T)> {
        self.entries.iter().map(|(u, v)| (u, v))
    }

    /// The single most specific candidate accepting `request`, if any.
    pub fn find_best_match(&self, request: &CapUrn) -> Option<(&CapUrn, &T)> {
        let mut best: Option<(&CapUrn, &T)> = None;
        for (urn, value) in &self.entries {
            if !urn.accepts(request) {
                continue;
            }
            // strict `>` keeps the first-inserted candidate on ties
            match best {
                Some((best_urn, _)) if urn.specificity() <= best_urn.specificity() => {}
                _ => best = Some((urn, value)),
            }
        }
        best
    }

    /// All candidates accepting `request`, most specific first; insertion
    /// order breaks ties.
    pub fn find_all_matches(&self, request: &CapUrn) -> Vec<(&CapUrn, &T)> {
        let mut matches: Vec<(usize, &CapUrn, &T)> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, (urn, _))| urn.accepts(request))
            .map(|(i, (urn, value))| (i, urn, value))
            .collect();
        matches.sort_by(|a, b| {
            b.1.specificity()
                .cmp(&a.1.specificity())
                .then(a.0.cmp(&b.0))
        });
        matches.into_iter().map(|(_, urn, value)| (urn, value)).collect()
    }
}
