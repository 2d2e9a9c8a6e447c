//! Session collaborator: who is signed in, and a stream of changes to that.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use crate::model::UserId;
use crate::storage::StorageHandle;

const MIN_PASSWORD_LEN: usize = 6;
const SESSION_TMP_EXTENSION: &str = "json.tmp";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    SignedIn(UserId),
    SignedOut,
}

pub trait AuthProvider: Send + Sync {
    fn current_user_id(&self) -> Option<UserId>;

    /// A fresh receiver that sees every session change from now on.
    fn session_events(&self) -> Receiver<SessionEvent>;
}

/// In-process session state with broadcast of sign-in/sign-out.
#[derive(Default)]
pub struct SessionHub {
    current: RwLock<Option<UserId>>,
    listeners: Mutex<Vec<Sender<SessionEvent>>>,
}

impl SessionHub {
    pub fn new(initial: Option<UserId>) -> Self {
        Self {
            current: RwLock::new(initial),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn sign_in(&self, user: UserId) {
        *self.current.write() = Some(user.clone());
        self.broadcast(SessionEvent::SignedIn(user));
    }

    pub fn sign_out(&self) {
        let previous = self.current.write().take();
        if previous.is_some() {
            self.broadcast(SessionEvent::SignedOut);
        }
    }

    fn broadcast(&self, event: SessionEvent) {
        self.listeners
            .lock()
            .retain(|listener| listener.send(event.clone()).is_ok());
    }
}

impl AuthProvider for SessionHub {
    fn current_user_id(&self) -> Option<UserId> {
        self.current.read().clone()
    }

    fn session_events(&self) -> Receiver<SessionEvent> {
        let (tx, rx) = unbounded();
        self.listeners.lock().push(tx);
        rx
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("email and password are required")]
    MissingCredentials,

    #[error("'{0}' is not a valid email address")]
    InvalidEmail(String),

    #[error("password must be at least {} characters", MIN_PASSWORD_LEN)]
    WeakPassword,

    #[error("an account already exists for {0}")]
    EmailInUse(String),

    #[error("wrong email or password")]
    InvalidCredentials,

    #[error("hashing password: {0}")]
    Hash(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub user_id: UserId,
    pub email: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionRecord {
    user_id: UserId,
    email: String,
    #[serde(with = "time::serde::rfc3339")]
    signed_in_at: OffsetDateTime,
}

/// Email/password accounts kept next to the notes, with the signed-in
/// session persisted to a small JSON file between runs.
pub struct LocalAuth {
    storage: StorageHandle,
    session_file: PathBuf,
    hub: SessionHub,
    account: RwLock<Option<Account>>,
}

impl LocalAuth {
    pub fn open(storage: StorageHandle, session_file: PathBuf) -> Result<Self, AuthError> {
        let account = restore_session(&storage, &session_file)?;
        let hub = SessionHub::new(account.as_ref().map(|acc| acc.user_id.clone()));
        Ok(Self {
            storage,
            session_file,
            hub,
            account: RwLock::new(account),
        })
    }

    pub fn current_account(&self) -> Option<Account> {
        self.account.read().clone()
    }

    /// Registers a new account. Does not sign in.
    pub fn sign_up(&self, email: &str, password: &str) -> Result<UserId, AuthError> {
        let email = check_credentials(email, password)?;
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AuthError::WeakPassword);
        }
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|err| AuthError::Hash(err.to_string()))?
            .to_string();
        let user_id = self
            .storage
            .insert_account(email, &hash)?
            .ok_or_else(|| AuthError::EmailInUse(email.to_owned()))?;
        tracing::info!(user = %user_id, "account created");
        Ok(user_id)
    }

    pub fn sign_in(&self, email: &str, password: &str) -> Result<Account, AuthError> {
        let email = check_credentials(email, password)?;
        let row = self
            .storage
            .find_account_by_email(email)?
            .ok_or(AuthError::InvalidCredentials)?;
        let parsed =
            PasswordHash::new(&row.password_hash).map_err(|err| AuthError::Hash(err.to_string()))?;
        if Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_err()
        {
            return Err(AuthError::InvalidCredentials);
        }

        let account = Account {
            user_id: row.id,
            email: row.email,
        };
        write_session(&self.session_file, &account)?;
        *self.account.write() = Some(account.clone());
        self.hub.sign_in(account.user_id.clone());
        tracing::info!(user = %account.user_id, "signed in");
        Ok(account)
    }

    pub fn sign_out(&self) -> Result<(), AuthError> {
        match fs::remove_file(&self.session_file) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(AuthError::Storage(anyhow::Error::new(err).context(format!(
                    "removing session file {}",
                    self.session_file.display()
                ))))
            }
        }
        if let Some(account) = self.account.write().take() {
            tracing::info!(user = %account.user_id, "signed out");
        }
        self.hub.sign_out();
        Ok(())
    }
}

impl AuthProvider for LocalAuth {
    fn current_user_id(&self) -> Option<UserId> {
        self.hub.current_user_id()
    }

    fn session_events(&self) -> Receiver<SessionEvent> {
        self.hub.session_events()
    }
}

fn check_credentials<'a>(email: &'a str, password: &str) -> Result<&'a str, AuthError> {
    let email = email.trim();
    if email.is_empty() || password.is_empty() {
        return Err(AuthError::MissingCredentials);
    }
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(email),
        _ => Err(AuthError::InvalidEmail(email.to_owned())),
    }
}

fn restore_session(storage: &StorageHandle, path: &Path) -> Result<Option<Account>, AuthError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(AuthError::Storage(
                anyhow::Error::new(err).context(format!("reading session {}", path.display())),
            ))
        }
    };
    let record: SessionRecord = match serde_json::from_str(&raw) {
        Ok(record) => record,
        Err(err) => {
            tracing::warn!(?err, "discarding unreadable session file");
            let _ = fs::remove_file(path);
            return Ok(None);
        }
    };
    if storage.find_account_by_id(&record.user_id)?.is_none() {
        tracing::warn!(user = %record.user_id, "session account no longer exists");
        let _ = fs::remove_file(path);
        return Ok(None);
    }
    tracing::debug!(user = %record.user_id, since = %record.signed_in_at, "restored session");
    Ok(Some(Account {
        user_id: record.user_id,
        email: record.email,
    }))
}

fn write_session(path: &Path, account: &Account) -> Result<(), AuthError> {
    let record = SessionRecord {
        user_id: account.user_id.clone(),
        email: account.email.clone(),
        signed_in_at: OffsetDateTime::now_utc(),
    };
    let persist = || -> anyhow::Result<()> {
        use anyhow::Context;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let json = serde_json::to_vec_pretty(&record).context("serializing session")?;
        let tmp = path.with_extension(SESSION_TMP_EXTENSION);
        fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    };
    persist().map_err(AuthError::Storage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::init_storage;
    use assert_matches::assert_matches;

    #[test]
    fn hub_broadcasts_to_every_listener() {
        let hub = SessionHub::new(None);
        let first = hub.session_events();
        let second = hub.session_events();

        hub.sign_in(UserId::new("u1"));
        hub.sign_out();
        hub.sign_out();

        for rx in [first, second] {
            let events: Vec<_> = rx.try_iter().collect();
            assert_eq!(
                events,
                vec![SessionEvent::SignedIn(UserId::new("u1")), SessionEvent::SignedOut]
            );
        }
        assert_eq!(hub.current_user_id(), None);
    }

    #[test]
    fn sign_up_checks_credentials() -> anyhow::Result<()> {
        let (temp, storage) = init_storage()?;
        let auth = LocalAuth::open(storage, temp.path().join("session.json"))?;

        assert_matches!(auth.sign_up("", "secret1"), Err(AuthError::MissingCredentials));
        assert_matches!(auth.sign_up("nobody", "secret1"), Err(AuthError::InvalidEmail(_)));
        assert_matches!(auth.sign_up("a@b.c", "short"), Err(AuthError::WeakPassword));
        auth.sign_up("a@b.c", "secret1")?;
        assert_matches!(auth.sign_up("A@B.C", "secret2"), Err(AuthError::EmailInUse(_)));
        assert_eq!(auth.current_user_id(), None);
        Ok(())
    }

    #[test]
    fn session_survives_reopen_until_sign_out() -> anyhow::Result<()> {
        let (temp, storage) = init_storage()?;
        let session_file = temp.path().join("state/session.json");
        let auth = LocalAuth::open(storage.clone(), session_file.clone())?;
        let user = auth.sign_up("ada@example.com", "lovelace")?;

        assert_matches!(
            auth.sign_in("ada@example.com", "wrong-password"),
            Err(AuthError::InvalidCredentials)
        );
        let events = auth.session_events();
        let account = auth.sign_in("ada@example.com", "lovelace")?;
        assert_eq!(account.user_id, user);
        assert_eq!(events.try_recv()?, SessionEvent::SignedIn(user.clone()));

        let reopened = LocalAuth::open(storage.clone(), session_file.clone())?;
        assert_eq!(reopened.current_user_id(), Some(user));

        reopened.sign_out()?;
        assert!(!session_file.exists());
        let after = LocalAuth::open(storage, session_file)?;
        assert_eq!(after.current_account(), None);
        Ok(())
    }
}
