use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};
use thiserror::Error;
use time::{Date, OffsetDateTime};

/// Store-assigned document identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NoteId(String);

impl NoteId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The fixed swatch set a note can be painted with.
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
    IntoStaticStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum NoteColor {
    #[default]
    White,
    Rose,
    Peach,
    Lemon,
    Mint,
    Sky,
    Periwinkle,
    Lavender,
    Orchid,
}

impl NoteColor {
    pub fn hex(self) -> &'static str {
        match self {
            NoteColor::White => "#fff",
            NoteColor::Rose => "#ffadad",
            NoteColor::Peach => "#ffd6a5",
            NoteColor::Lemon => "#fdffb6",
            NoteColor::Mint => "#caffbf",
            NoteColor::Sky => "#9bf6ff",
            NoteColor::Periwinkle => "#a0c4ff",
            NoteColor::Lavender => "#bdb2ff",
            NoteColor::Orchid => "#ffc6ff",
        }
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        let hex = hex.trim();
        NoteColor::iter().find(|color| color.hex().eq_ignore_ascii_case(hex))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteRecord {
    pub id: NoteId,
    pub owner_id: UserId,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub color: NoteColor,
    #[serde(default)]
    pub deadline: Option<Date>,
    #[serde(default)]
    pub completed: bool,
    /// `None` until the store has resolved the server timestamp.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
}

impl NoteRecord {
    /// The category label, or `None` for uncategorized notes.
    pub fn category(&self) -> Option<&str> {
        if self.category.is_empty() {
            None
        } else {
            Some(&self.category)
        }
    }

    pub fn has_resolved_timestamp(&self) -> bool {
        self.created_at.is_some()
    }

    /// Case-folded substring match over title and content. `needle` must
    /// already be lowercased.
    pub fn matches_folded(&self, needle: &str) -> bool {
        if needle.is_empty() {
            return true;
        }
        self.title.to_lowercase().contains(needle) || self.content.to_lowercase().contains(needle)
    }

    pub fn to_draft(&self) -> NoteDraft {
        NoteDraft {
            title: self.title.clone(),
            content: self.content.clone(),
            category: self.category.clone(),
            color: self.color,
            deadline: self.deadline,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum DraftField {
    Title,
    Content,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{} must not be empty", join_fields(.0))]
    Empty(Vec<DraftField>),
}

fn join_fields(fields: &[DraftField]) -> String {
    fields
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" and ")
}

/// The user-editable fields of a note, as submitted for create or update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NoteDraft {
    pub title: String,
    pub content: String,
    pub category: String,
    pub color: NoteColor,
    pub deadline: Option<Date>,
}

impl NoteDraft {
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_color(mut self, color: NoteColor) -> Self {
        self.color = color;
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Date>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Deadlines only keep the calendar day; the time of day is dropped.
    pub fn with_deadline_at(self, at: OffsetDateTime) -> Self {
        self.with_deadline(Some(at.date()))
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut missing = Vec::new();
        if self.title.trim().is_empty() {
            missing.push(DraftField::Title);
        }
        if self.content.trim().is_empty() {
            missing.push(DraftField::Content);
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::Empty(missing))
        }
    }

    /// Validates and returns the draft as it should be written.
    pub fn normalized(mut self) -> Result<Self, ValidationError> {
        self.validate()?;
        let category = self.category.trim();
        if category.len() != self.category.len() {
            self.category = category.to_owned();
        }
        Ok(self)
    }
}
