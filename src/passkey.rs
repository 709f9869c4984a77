//! Password gate in front of the note store.
//!
//! The gate starts in [`GateState::Unknown`]. A stored password hash, or a
//! passkey reported by the server, moves it to `NeedsUnlock`; a server with no
//! passkey moves it to `NeedsSetup`. Only a verified password, checked
//! locally against the stored hash or remotely when no hash exists yet,
//! reaches `Unlocked`.
//!
//! The stored hash is `<salt hex>$<sha256(salt || password) hex>` under the
//! `passwordHash` config key.

use std::sync::{Arc, Mutex};

use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::api::{ApiError, NotesApi};
use crate::database::{Database, PASSWORD_HASH_KEY};
use crate::error::{BoardError, BoardResult};
use crate::validation::validate_password;

const SALT_LEN: usize = 16;

/// Where the gate stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GateState {
    #[default]
    Unknown,
    NeedsSetup,
    NeedsUnlock,
    Unlocked,
}

/// Result of checking a candidate password.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// Matched the stored hash; no network call was made
    ValidLocal,
    /// Accepted by the server; the hash is now stored
    ValidRemote,
    Invalid,
}

impl Verification {
    pub fn is_valid(&self) -> bool {
        !matches!(self, Verification::Invalid)
    }
}

/// Result of first-time passkey setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupOutcome {
    Created,
    /// A passkey already exists; continue with the unlock flow
    AlreadySet,
}

/// Salted SHA-256 of `password`, hex encoded.
pub fn hash_password(salt: &[u8], password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// Build a storable hash with a fresh random salt.
pub fn make_password_hash(password: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    format!("{}${}", hex::encode(salt), hash_password(&salt, password))
}

/// Check `password` against a value produced by [`make_password_hash`].
///
/// A malformed stored value never matches.
pub fn password_matches(stored: &str, password: &str) -> bool {
    let Some((salt_hex, hash_hex)) = stored.split_once('$') else {
        return false;
    };
    let Ok(salt) = hex::decode(salt_hex) else {
        return false;
    };
    hash_password(&salt, password) == hash_hex
}

/// Gate state plus the local hash and remote passkey checks behind it.
pub struct PasswordGate {
    db: Arc<Mutex<Database>>,
    api: Arc<dyn NotesApi>,
    state: GateState,
}

impl PasswordGate {
    pub fn new(db: Arc<Mutex<Database>>, api: Arc<dyn NotesApi>) -> Self {
        Self {
            db,
            api,
            state: GateState::Unknown,
        }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn is_unlocked(&self) -> bool {
        self.state == GateState::Unlocked
    }

    /// Whether a password hash is stored on this device
    pub fn has_local_hash(&self) -> BoardResult<bool> {
        Ok(self.db.lock()?.get_config(PASSWORD_HASH_KEY)?.is_some())
    }

    /// Resolve which form the user should see.
    ///
    /// A stored hash answers without a network call. An unlocked gate stays
    /// unlocked.
    pub async fn refresh_state(&mut self, token: Option<&str>) -> BoardResult<GateState> {
        if self.state == GateState::Unlocked {
            return Ok(self.state);
        }
        if self.has_local_hash()? {
            self.state = GateState::NeedsUnlock;
            return Ok(self.state);
        }

        let token = token.ok_or(BoardError::AuthRequired)?;
        self.state = match self.api.get_passkey(token).await {
            Ok(_) => GateState::NeedsUnlock,
            Err(ApiError::PasskeyNotFound) => GateState::NeedsSetup,
            Err(e) => {
                tracing::warn!(error = %e, "Could not check passkey status");
                return Err(e.into());
            }
        };
        tracing::debug!(state = ?self.state, "Resolved password gate state");
        Ok(self.state)
    }

    /// Check a candidate password.
    ///
    /// With a stored hash the answer is local and final. Without one the
    /// server decides; on success the hash is stored so later checks stay
    /// offline. A rejected or unrecognised answer is `Invalid`, while a
    /// network failure is returned as an error so the caller can offer a
    /// retry instead of a re-prompt.
    pub async fn verify_password(
        &mut self,
        token: Option<&str>,
        password: &str,
    ) -> BoardResult<Verification> {
        let stored = self.db.lock()?.get_config(PASSWORD_HASH_KEY)?;

        if let Some(stored) = stored {
            let verification = if password_matches(&stored, password) {
                Verification::ValidLocal
            } else {
                Verification::Invalid
            };
            self.settle(verification);
            return Ok(verification);
        }

        let token = token.ok_or(BoardError::AuthRequired)?;
        let verification = match self.api.verify_passkey(token, password).await {
            Ok(_) => {
                self.store_hash(password)?;
                Verification::ValidRemote
            }
            Err(ApiError::WrongPassword) => Verification::Invalid,
            Err(ApiError::Network(message)) => return Err(BoardError::Network(message)),
            Err(ApiError::AuthRequired) => return Err(BoardError::AuthRequired),
            Err(e) => {
                tracing::warn!(error = %e, "Remote password check failed");
                Verification::Invalid
            }
        };
        self.settle(verification);
        Ok(verification)
    }

    /// Create passkey key material for a new password.
    pub async fn setup_passkey(
        &mut self,
        token: &str,
        password: &str,
    ) -> BoardResult<SetupOutcome> {
        validate_password(password)?;

        match self.api.create_passkey(token, password).await {
            Ok(_) => {
                self.store_hash(password)?;
                self.state = GateState::Unlocked;
                tracing::info!("Passkey created");
                Ok(SetupOutcome::Created)
            }
            Err(ApiError::AlreadySet) => {
                self.state = GateState::NeedsUnlock;
                tracing::debug!("Passkey already set, falling back to unlock");
                Ok(SetupOutcome::AlreadySet)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drop the stored hash, e.g. after the server refused a password the
    /// gate had accepted.
    pub fn forget_local_hash(&mut self) -> BoardResult<()> {
        self.db.lock()?.delete_config(PASSWORD_HASH_KEY)?;
        if self.state == GateState::Unlocked {
            self.state = GateState::NeedsUnlock;
        }
        Ok(())
    }

    /// Return to the unlock prompt.
    pub fn lock(&mut self) {
        if self.state == GateState::Unlocked {
            self.state = GateState::NeedsUnlock;
        }
    }

    /// Forget everything, as after logout.
    pub fn reset(&mut self) {
        self.state = GateState::Unknown;
    }

    fn store_hash(&self, password: &str) -> BoardResult<()> {
        self.db
            .lock()?
            .set_config(PASSWORD_HASH_KEY, &make_password_hash(password))
    }

    fn settle(&mut self, verification: Verification) {
        self.state = if verification.is_valid() {
            GateState::Unlocked
        } else {
            GateState::NeedsUnlock
        };
    }
}
