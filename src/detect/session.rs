use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Authenticated user session.
///
/// The loop never logs in; it only reads the bearer credential and reacts to
/// its expiry.
pub trait Session: Send + Sync {
    /// Current bearer credential, if any.
    fn bearer_token(&self) -> Option<String>;

    fn is_authenticated(&self) -> bool {
        self.bearer_token().is_some()
    }

    /// Display name of the signed-in user.
    fn user(&self) -> Option<String> {
        None
    }

    /// Forget the credential after the service rejected it.
    fn invalidate(&self);
}

/// Session backed by a token handed to the process (config, env, token file).
#[derive(Debug, Default)]
pub struct TokenSession {
    token: RwLock<Option<String>>,
    user: Option<String>,
}

impl TokenSession {
    pub fn new(token: Option<String>, user: Option<String>) -> Self {
        let token = token
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        Self {
            token: RwLock::new(token),
            user,
        }
    }

    /// Read the token from a file holding the raw token (trailing newline allowed).
    pub fn from_token_file(path: &Path, user: Option<String>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read token file {}", path.display()))?;
        let session = Self::new(Some(raw), user);
        if !session.is_authenticated() {
            return Err(anyhow!("token file {} is empty", path.display()));
        }
        Ok(session)
    }

    fn read(&self) -> RwLockReadGuard<'_, Option<String>> {
        self.token.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Option<String>> {
        self.token.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Session for TokenSession {
    fn bearer_token(&self) -> Option<String> {
        self.read().clone()
    }

    fn user(&self) -> Option<String> {
        self.user.clone()
    }

    fn invalidate(&self) {
        if self.write().take().is_some() {
            log::info!("session credential cleared");
        }
    }
}
