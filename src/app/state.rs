use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};
use thiserror::Error;

use crate::config::{AppConfig, SortDirection};
use crate::model::NoteRecord;

/// Holds the latest full snapshot of the signed-in user's notes.
///
/// The only writer is the subscription feed inside this crate. Replacing
/// the snapshot swaps one `Arc` so readers see either the old set or the
/// new one, and raises a change flag for the single downstream consumer.
#[derive(Debug)]
pub struct LocalStore {
    notes: Arc<[NoteRecord]>,
    revision: u64,
    pending: Option<u64>,
}

impl Default for LocalStore {
    fn default() -> Self {
        Self {
            notes: Arc::from(Vec::new()),
            revision: 0,
            pending: None,
        }
    }
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<[NoteRecord]> {
        Arc::clone(&self.notes)
    }

    pub fn notes(&self) -> &[NoteRecord] {
        &self.notes
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    pub(crate) fn replace(&mut self, notes: Vec<NoteRecord>) -> u64 {
        self.notes = Arc::from(notes);
        self.revision += 1;
        self.pending = Some(self.revision);
        self.revision
    }

    /// Takes the pending change notification, if any.
    pub fn take_change(&mut self) -> Option<u64> {
        self.pending.take()
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum StatusFilter {
    #[default]
    All,
    Pending,
    Completed,
}

impl StatusFilter {
    pub fn admits(self, note: &NoteRecord) -> bool {
        match self {
            StatusFilter::All => true,
            StatusFilter::Pending => !note.completed,
            StatusFilter::Completed => note.completed,
        }
    }
}

/// Either no restriction or one exact category label.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum CategoryFilter {
    #[default]
    All,
    Named(String),
}

impl CategoryFilter {
    pub fn named(category: impl Into<String>) -> Self {
        CategoryFilter::Named(category.into())
    }

    pub fn admits(&self, note: &NoteRecord) -> bool {
        match self {
            CategoryFilter::All => true,
            CategoryFilter::Named(category) => note.category == *category,
        }
    }
}

impl fmt::Display for CategoryFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CategoryFilter::All => f.write_str("all"),
            CategoryFilter::Named(category) => f.write_str(category),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ViewError {
    #[error("no note uses category '{0}'")]
    UnknownCategory(String),
}

/// User-controlled view parameters. Session-local, never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewState {
    search_text: String,
    selected_category: CategoryFilter,
    status_filter: StatusFilter,
    sort_direction: SortDirection,
}

impl ViewState {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            status_filter: config.default_status,
            sort_direction: config.default_sort,
            ..Self::default()
        }
    }

    pub fn search_text(&self) -> &str {
        &self.search_text
    }

    pub fn selected_category(&self) -> &CategoryFilter {
        &self.selected_category
    }

    pub fn status_filter(&self) -> StatusFilter {
        self.status_filter
    }

    pub fn sort_direction(&self) -> SortDirection {
        self.sort_direction
    }

    pub fn set_search_text(&mut self, text: impl Into<String>) {
        self.search_text = text.into();
    }

    pub fn set_status_filter(&mut self, status: StatusFilter) {
        self.status_filter = status;
    }

    pub fn set_sort_direction(&mut self, direction: SortDirection) {
        self.sort_direction = direction;
    }

    pub fn toggle_sort(&mut self) {
        self.sort_direction = self.sort_direction.toggled();
    }

    /// Selects `filter` if it is `All` or one of `available`.
    pub fn select_category(
        &mut self,
        filter: CategoryFilter,
        available: &[CategoryFilter],
    ) -> Result<(), ViewError> {
        if let CategoryFilter::Named(name) = &filter {
            if !available.contains(&filter) {
                return Err(ViewError::UnknownCategory(name.clone()));
            }
        }
        self.selected_category = filter;
        Ok(())
    }
}
