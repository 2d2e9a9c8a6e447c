//! SQLite-backed document store.
//!
//! Plays the remote store role for the client: note documents scoped by
//! owner, owner-checked writes, and live queries that push the full result
//! set whenever the database changes.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use rusqlite::config::DbConfig;
use rusqlite::{params, Connection, OptionalExtension, Row};
use time::format_description::{self, FormatItem};
use time::{Date, OffsetDateTime};

use crate::config::{ConfigPaths, StorageOptions};
use crate::model::{NoteColor, NoteDraft, NoteId, NoteRecord, UserId};
use crate::remote::{
    LiveQuery, NotePatch, RemoteStore, StoreError, SubscriptionError, WatchId,
};

mod live;
mod schema;

use self::live::LiveQueryHub;

static DATE_FORMAT: Lazy<Vec<FormatItem<'static>>> = Lazy::new(|| {
    format_description::parse("[year]-[month]-[day]").expect("valid date format description")
});

const NOTE_COLUMNS: &str =
    "id, owner_id, title, content, category, color, deadline, completed, created_at";

#[derive(Debug, Clone)]
pub struct AccountRow {
    pub id: UserId,
    pub email: String,
    pub password_hash: String,
    pub created_at: Option<OffsetDateTime>,
}

#[derive(Clone)]
pub struct StorageHandle {
    db_path: Arc<PathBuf>,
    options: Arc<StorageOptions>,
    live: LiveQueryHub,
}

impl StorageHandle {
    pub fn connect(&self) -> Result<Connection> {
        open_connection(&self.db_path, &self.options)
    }

    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.connect()?;
        f(&conn)
    }

    pub fn database_path(&self) -> &Path {
        &self.db_path
    }

    pub fn fetch_owner_notes(&self, owner: &UserId) -> Result<Vec<NoteRecord>> {
        self.with_connection(|conn| fetch_owner_notes_on(conn, owner))
    }

    pub fn fetch_note(&self, id: &NoteId) -> Result<Option<NoteRecord>> {
        self.with_connection(|conn| {
            let sql = format!("SELECT {NOTE_COLUMNS} FROM notes WHERE id = ?1");
            conn.query_row(&sql, params![id.as_str()], note_from_row)
                .optional()
                .with_context(|| format!("fetching note {id}"))
        })
    }

    /// Like `fetch_note`, but only finds documents owned by `owner`.
    pub fn fetch_owned_note(&self, owner: &UserId, id: &NoteId) -> Result<Option<NoteRecord>> {
        self.with_connection(|conn| {
            let sql = format!("SELECT {NOTE_COLUMNS} FROM notes WHERE id = ?1 AND owner_id = ?2");
            conn.query_row(&sql, params![id.as_str(), owner.as_str()], note_from_row)
                .optional()
                .with_context(|| format!("fetching note {id}"))
        })
    }

    /// Inserts a document with the given creation time. `None` leaves the
    /// timestamp unresolved, as for documents imported without one.
    pub fn insert_note_at(
        &self,
        owner: &UserId,
        draft: &NoteDraft,
        created_at: Option<OffsetDateTime>,
    ) -> Result<NoteId> {
        let id = NoteId::generate();
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO notes (id, owner_id, title, content, category, color, deadline, completed, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8)",
                params![
                    id.as_str(),
                    owner.as_str(),
                    draft.title,
                    draft.content,
                    draft.category,
                    draft.color.hex(),
                    draft.deadline.map(format_date),
                    created_at.map(to_micros),
                ],
            )
            .context("inserting note")?;
            Ok(())
        })?;
        Ok(id)
    }

    /// Creates an account unless the email is already registered.
    pub fn insert_account(&self, email: &str, password_hash: &str) -> Result<Option<UserId>> {
        let id = UserId::generate();
        self.with_connection(|conn| {
            let inserted = conn
                .execute(
                    "INSERT INTO accounts (id, email, password_hash, created_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(email) DO NOTHING",
                    params![
                        id.as_str(),
                        email,
                        password_hash,
                        to_micros(OffsetDateTime::now_utc())
                    ],
                )
                .context("inserting account")?;
            Ok(if inserted == 0 { None } else { Some(id) })
        })
    }

    pub fn find_account_by_email(&self, email: &str) -> Result<Option<AccountRow>> {
        self.find_account("email", email)
    }

    pub fn find_account_by_id(&self, id: &UserId) -> Result<Option<AccountRow>> {
        self.find_account("id", id.as_str())
    }

    fn find_account(&self, column: &str, value: &str) -> Result<Option<AccountRow>> {
        self.with_connection(|conn| {
            let sql = format!(
                "SELECT id, email, password_hash, created_at FROM accounts WHERE {column} = ?1"
            );
            conn.query_row(&sql, params![value], |row| {
                Ok(AccountRow {
                    id: UserId::new(row.get::<_, String>(0)?),
                    email: row.get(1)?,
                    password_hash: row.get(2)?,
                    created_at: from_micros(row.get(3)?),
                })
            })
            .optional()
            .with_context(|| format!("looking up account by {column}"))
        })
    }

    fn scoped_write<P: rusqlite::Params>(
        &self,
        owner: &UserId,
        id: &NoteId,
        sql: &str,
        params: P,
    ) -> Result<(), StoreError> {
        let conn = self.connect()?;
        let touched = conn
            .execute(sql, params)
            .with_context(|| format!("writing note {id}"))?;
        if touched > 0 {
            return Ok(());
        }
        let holder: Option<String> = conn
            .query_row(
                "SELECT owner_id FROM notes WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .context("checking note ownership")?;
        match holder {
            None => Err(StoreError::NotFound(id.clone())),
            Some(holder) if holder != owner.as_str() => {
                Err(StoreError::PermissionDenied(id.clone()))
            }
            Some(_) => Ok(()),
        }
    }
}

impl RemoteStore for StorageHandle {
    fn watch_owner(&self, owner: &UserId) -> Result<LiveQuery, SubscriptionError> {
        self.live.register(owner)
    }

    fn unwatch(&self, id: WatchId) {
        self.live.unregister(id);
    }

    fn insert(&self, owner: &UserId, draft: &NoteDraft) -> Result<NoteId, StoreError> {
        let id = self.insert_note_at(owner, draft, Some(OffsetDateTime::now_utc()))?;
        Ok(id)
    }

    fn patch(&self, owner: &UserId, id: &NoteId, patch: &NotePatch) -> Result<(), StoreError> {
        match patch {
            NotePatch::Fields(draft) => self.scoped_write(
                owner,
                id,
                "UPDATE notes
                 SET title = ?1, content = ?2, category = ?3, color = ?4, deadline = ?5
                 WHERE id = ?6 AND owner_id = ?7",
                params![
                    draft.title,
                    draft.content,
                    draft.category,
                    draft.color.hex(),
                    draft.deadline.map(format_date),
                    id.as_str(),
                    owner.as_str(),
                ],
            ),
            NotePatch::Completed(completed) => self.scoped_write(
                owner,
                id,
                "UPDATE notes SET completed = ?1 WHERE id = ?2 AND owner_id = ?3",
                params![i64::from(*completed), id.as_str(), owner.as_str()],
            ),
        }
    }

    fn delete(&self, owner: &UserId, id: &NoteId) -> Result<(), StoreError> {
        self.scoped_write(
            owner,
            id,
            "DELETE FROM notes WHERE id = ?1 AND owner_id = ?2",
            params![id.as_str(), owner.as_str()],
        )
    }
}

pub(crate) fn fetch_owner_notes_on(conn: &Connection, owner: &UserId) -> Result<Vec<NoteRecord>> {
    let sql = format!(
        "SELECT {NOTE_COLUMNS}
         FROM notes
         WHERE owner_id = ?1
         ORDER BY created_at IS NULL DESC, created_at DESC, rowid DESC"
    );
    let mut stmt = conn.prepare(&sql).context("preparing owner notes query")?;
    let records = stmt
        .query_map(params![owner.as_str()], note_from_row)?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("fetching notes for {owner}"))?;
    Ok(records)
}

fn note_from_row(row: &Row<'_>) -> rusqlite::Result<NoteRecord> {
    let id = NoteId::new(row.get::<_, String>(0)?);
    let color_hex: String = row.get(5)?;
    let color = NoteColor::from_hex(&color_hex).unwrap_or_else(|| {
        tracing::warn!(note = %id, color = %color_hex, "color outside palette, using default");
        NoteColor::default()
    });
    let deadline = row
        .get::<_, Option<String>>(6)?
        .and_then(|raw| match parse_date(&raw) {
            Ok(date) => Some(date),
            Err(err) => {
                tracing::warn!(note = %id, %raw, ?err, "ignoring unparseable deadline");
                None
            }
        });
    Ok(NoteRecord {
        owner_id: UserId::new(row.get::<_, String>(1)?),
        title: row.get(2)?,
        content: row.get(3)?,
        category: row.get(4)?,
        color,
        deadline,
        completed: row.get::<_, i64>(7)? != 0,
        created_at: row.get::<_, Option<i64>>(8)?.and_then(from_micros),
        id,
    })
}

/// Calendar dates are stored and shown as `YYYY-MM-DD`.
pub(crate) fn parse_date(raw: &str) -> Result<Date, time::error::Parse> {
    Date::parse(raw, DATE_FORMAT.as_slice())
}

pub(crate) fn format_date(date: Date) -> String {
    date.format(DATE_FORMAT.as_slice())
        .unwrap_or_else(|_| date.to_string())
}

fn to_micros(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000) as i64
}

fn from_micros(micros: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(micros) * 1_000).ok()
}

pub fn init(paths: &ConfigPaths, storage: &StorageOptions) -> Result<StorageHandle> {
    let db_path = if storage.database_path.as_os_str().is_empty() {
        paths.database_path.clone()
    } else {
        storage.database_path.clone()
    };
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating data directory {}", parent.display()))?;
    }
    let conn = open_connection(&db_path, storage)?;
    schema::apply(&conn)?;
    let options = Arc::new(storage.clone());
    let db_path = Arc::new(db_path);
    Ok(StorageHandle {
        live: LiveQueryHub::new(db_path.clone(), options.clone()),
        db_path,
        options,
    })
}

pub(crate) fn open_connection(db_path: &Path, storage: &StorageOptions) -> Result<Connection> {
    let conn = Connection::open(db_path)
        .with_context(|| format!("opening database {}", db_path.display()))?;
    prepare_connection(&conn, storage)?;
    Ok(conn)
}

fn prepare_connection(conn: &Connection, storage: &StorageOptions) -> Result<()> {
    conn.set_db_config(DbConfig::SQLITE_DBCONFIG_ENABLE_FKEY, true)
        .context("enabling foreign keys")?;
    conn.busy_timeout(storage.busy_timeout())
        .context("setting busy timeout")?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .context("setting journal_mode=WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("setting synchronous=NORMAL")?;
    conn.pragma_update(
        None,
        "wal_autocheckpoint",
        storage.wal_autocheckpoint.to_string(),
    )
    .context("setting wal_autocheckpoint")?;
    Ok(())
}
