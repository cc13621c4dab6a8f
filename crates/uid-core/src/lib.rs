//! Normalization and translation of RFID/NFC transponder UIDs.
//!
//! A UID, as produced by a reader backend, is whatever bytes the hardware
//! handed back. Before it ever reaches the coordinator it is normalized:
//! stripped of anything that isn't a hex digit, upper-cased, and capped to a
//! sane length. This crate owns exactly that normalization step plus the
//! optional translation table applied afterwards.

use std::collections::HashMap;
use std::fmt;

/// Maximum length of a normalized UID, in characters.
pub const MAX_UID_LEN: usize = 256;

/// A normalized UID: uppercase hex digits only, non-empty, `<= MAX_UID_LEN`.
///
/// The only way to construct one is [`Uid::normalize`], so any `Uid` in hand
/// has already been sanitized.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uid(String);

impl Uid {
    /// Normalize raw reader output into a [`Uid`]: strip non-hex characters,
    /// upper-case what remains, and truncate to [`MAX_UID_LEN`].
    ///
    /// Returns `None` if nothing hex-like survives the strip.
    pub fn normalize(raw: &str) -> Option<Uid> {
        let mut out = String::with_capacity(raw.len().min(MAX_UID_LEN));
        for c in raw.chars() {
            if c.is_ascii_hexdigit() {
                out.push(c.to_ascii_uppercase());
            }
            if out.len() == MAX_UID_LEN {
                break;
            }
        }
        if out.is_empty() { None } else { Some(Uid(out)) }
    }

    /// Build a `Uid` from a string already known to be normalized.
    ///
    /// Intended for tests and for round-tripping values stored in the
    /// credential file; panics (in debug) on non-normalized input would be
    /// excessive here, so this simply normalizes again defensively.
    pub fn from_normalized(s: impl Into<String>) -> Uid {
        let s = s.into();
        Uid::normalize(&s).unwrap_or(Uid(String::new()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Uid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A configured rewrite table applied to UIDs after normalization and before
/// they enter the merged active set.
///
/// Entries are keyed and valued by normalized UID text. A UID with no entry
/// passes through unchanged.
#[derive(Debug, Clone, Default)]
pub struct TranslationTable(HashMap<String, String>);

impl TranslationTable {
    pub fn new() -> Self {
        TranslationTable(HashMap::new())
    }

    /// Build a table from raw (pre-normalization) key/value pairs, e.g. as
    /// loaded from configuration. Both sides are normalized independently;
    /// a pair where either side normalizes to nothing is skipped.
    pub fn from_raw_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut map = HashMap::new();
        for (k, v) in pairs {
            if let (Some(from), Some(to)) =
                (Uid::normalize(k.as_ref()), Uid::normalize(v.as_ref()))
            {
                map.insert(from.into_string(), to.into_string());
            }
        }
        TranslationTable(map)
    }

    /// Rewrite `uid` if a translation entry exists for it; otherwise return
    /// it unchanged.
    pub fn apply(&self, uid: Uid) -> Uid {
        match self.0.get(uid.as_str()) {
            Some(to) => Uid::from_normalized(to.clone()),
            None => uid,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}
