//! Derivation of the visible note list.
//!
//! `derive` is a pure function of (snapshot, view state). It is rerun from
//! the canonical snapshot on every change, never patched incrementally.

use std::cmp::Ordering;

use indexmap::IndexSet;
use time::OffsetDateTime;

use crate::app::state::{CategoryFilter, ViewState};
use crate::config::SortDirection;
use crate::model::NoteRecord;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DerivedView {
    /// The filtered, sorted notes to render.
    pub notes: Vec<NoteRecord>,
    /// `All` followed by every distinct non-empty category of the
    /// unfiltered snapshot, in order of first appearance.
    pub categories: Vec<CategoryFilter>,
}

impl DerivedView {
    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    pub fn has_category(&self, category: &str) -> bool {
        self.categories
            .iter()
            .any(|filter| matches!(filter, CategoryFilter::Named(name) if name == category))
    }
}

pub fn derive(snapshot: &[NoteRecord], view: &ViewState) -> DerivedView {
    let needle = view.search_text().to_lowercase();
    let category = view.selected_category();
    let status = view.status_filter();

    let mut notes: Vec<NoteRecord> = snapshot
        .iter()
        .filter(|note| note.matches_folded(&needle))
        .filter(|note| category.admits(note))
        .filter(|note| status.admits(note))
        .cloned()
        .collect();
    sort_by_creation(&mut notes, view.sort_direction());

    DerivedView {
        notes,
        categories: enumerate_categories(snapshot),
    }
}

pub fn enumerate_categories(snapshot: &[NoteRecord]) -> Vec<CategoryFilter> {
    let seen: IndexSet<&str> = snapshot.iter().filter_map(NoteRecord::category).collect();
    std::iter::once(CategoryFilter::All)
        .chain(seen.into_iter().map(CategoryFilter::named))
        .collect()
}

/// Stable sort on creation time. Unresolved timestamps count as the
/// latest possible instant; ties keep snapshot order in both directions.
pub fn sort_by_creation(notes: &mut [NoteRecord], direction: SortDirection) {
    notes.sort_by(|a, b| {
        let ordering = compare_created(a.created_at, b.created_at);
        match direction {
            SortDirection::Ascending => ordering,
            SortDirection::Descending => ordering.reverse(),
        }
    });
}

fn compare_created(a: Option<OffsetDateTime>, b: Option<OffsetDateTime>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
    }
}
