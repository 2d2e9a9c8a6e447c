pub mod app;
pub mod auth;
pub mod cli;
pub mod config;
pub mod highlight;
pub mod model;
pub mod remote;
pub mod search;
pub mod storage;
pub mod subscription;

pub use app::{MutationGateway, NoteFeed};
pub use config::{AppConfig, ConfigLoader, ConfigPaths};
pub use model::{NoteColor, NoteDraft, NoteId, NoteRecord, UserId};
