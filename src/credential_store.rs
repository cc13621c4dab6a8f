//! On-disk credential store: an ordered list of `(username, salted_uid_hash)`
//! pairs, persisted as a JSON array of two-element string arrays.
//!
//! A username may appear more than once (one entry per enrolled UID), so this
//! is deliberately a `Vec`, not a `HashMap`: order must survive a rewrite
//! except for the specific entries an `ADDUSER`/`DELUSER` adds or removes.
//! Writes are atomic (write to a sibling temp file, then rename over the
//! target) so a crash mid-write never leaves a half-written file behind. The
//! Coordinator only ever *reads* this file, reloading when its mtime
//! advances; the write path here is exercised by the session handler after
//! it has dropped to the peer's privileges (see `privilege.rs`), so that
//! filesystem permissions — not socket reachability — gate who may mutate
//! authorizations.

use argon2::Argon2;
use password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[derive(Debug, thiserror::Error)]
pub enum CredentialStoreError {
    #[error("reading credential file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("writing credential file '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("credential file '{path}' is not a JSON array of [user, hash] pairs: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// One `(username, salted_hash)` pair as persisted.
pub type CredentialEntry = (String, String);

/// A loaded, in-memory view of the credential file.
///
/// `Coordinator` owns one of these and calls [`CredentialStore::reload_if_changed`]
/// before consulting it, so an external rewrite (an enrolling session, or an
/// administrator editing the file by hand) is picked up on the next lookup
/// without requiring the daemon to restart.
pub struct CredentialStore {
    path: PathBuf,
    entries: Vec<CredentialEntry>,
    last_mtime: Option<SystemTime>,
}

impl CredentialStore {
    /// Open the credential file at `path`. A missing, unreadable, or
    /// malformed file is not a startup failure: per §7 it is treated as an
    /// empty store and the daemon keeps serving (every `WaitAuth` then
    /// answers `NOAUTH`). Callers that want to surface the reason should log
    /// the returned error and proceed with the (empty) store regardless.
    pub fn open(path: impl Into<PathBuf>) -> (Self, Option<CredentialStoreError>) {
        let path = path.into();
        let mut store = CredentialStore {
            path,
            entries: Vec::new(),
            last_mtime: None,
        };
        let err = store.reload().err();
        (store, err)
    }

    fn reload(&mut self) -> Result<(), CredentialStoreError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => {
                let parsed: Vec<CredentialEntry> =
                    serde_json::from_slice(&bytes).map_err(|source| CredentialStoreError::Parse {
                        path: self.path.clone(),
                        source,
                    })?;
                self.entries = parsed;
                self.last_mtime = mtime_of(&self.path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.entries = Vec::new();
                self.last_mtime = None;
                Ok(())
            }
            Err(source) => Err(CredentialStoreError::Read {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Reload the file if its mtime has advanced since the last read.
    /// Returns whether a reload happened, so the caller can invalidate any
    /// cache that depends on credential contents (`SPEC_FULL.md` invariant 2).
    ///
    /// On a malformed file this leaves the store empty and still reports
    /// `reloaded = true`, matching the "treat as empty, keep serving" error
    /// disposition in §7 — the error itself is swallowed by the caller if it
    /// chooses to (the Coordinator does).
    pub fn reload_if_changed(&mut self) -> Result<bool, CredentialStoreError> {
        let current_mtime = mtime_of(&self.path);
        if current_mtime == self.last_mtime {
            return Ok(false);
        }
        match self.reload() {
            Ok(()) => Ok(true),
            Err(e) => {
                self.entries = Vec::new();
                self.last_mtime = current_mtime;
                Err(e)
            }
        }
    }

    /// All currently-loaded entries, in file order.
    pub fn entries(&self) -> &[CredentialEntry] {
        &self.entries
    }

    /// Hash a UID with a freshly generated salt, producing a single
    /// self-describing PHC string (algorithm + salt + digest).
    pub fn hash_uid(uid: &str) -> String {
        let salt = SaltString::generate(&mut rand::thread_rng());
        Argon2::default()
            .hash_password(uid.as_bytes(), &salt)
            .expect("argon2 hashing of a bounded-length UID never fails")
            .to_string()
    }

    /// Verify `uid` against a previously stored PHC hash string. Recomputes
    /// using the salt embedded in `stored`; a malformed `stored` value is
    /// treated as a non-match rather than an error.
    pub fn verify_uid(uid: &str, stored: &str) -> bool {
        let Ok(hash) = PasswordHash::new(stored) else {
            return false;
        };
        Argon2::default().verify_password(uid.as_bytes(), &hash).is_ok()
    }

    /// Atomically overwrite the credential file with `entries`, preserving
    /// their given order. Intended to run after the caller has already
    /// dropped to the peer's privileges; file permissions alone decide
    /// whether this succeeds.
    pub fn write_entries_atomic(
        path: &Path,
        entries: &[CredentialEntry],
    ) -> Result<(), CredentialStoreError> {
        let serialized =
            serde_json::to_string_pretty(entries).expect("serializing credential entries never fails");
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, serialized).map_err(|source| CredentialStoreError::Write {
            path: tmp_path.clone(),
            source,
        })?;
        std::fs::rename(&tmp_path, path).map_err(|source| CredentialStoreError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn mtime_of(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).ok().and_then(|m| m.modified().ok())
}
