//! String interning for zero-cost cloning of repeated strings
//!
//! A partitioned stream carries the same topic name on every record. Ten
//! thousand records from `platform-events` would mean ten thousand string
//! allocations if [`Message`](crate::Message) stored a plain `String`.
//! Interning stores each unique string once and hands out a small integer
//! key, so cloning a message copies 4 bytes instead of the topic name.
//!
//! Interned strings are never evicted. That is the right trade-off here:
//! the set of topic names and consumer groups a process touches is small
//! and stable for its lifetime.

use lasso::{Key, Spur, ThreadedRodeo};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::OnceLock;

/// Global string interner, lazily initialized. Thread-safe via lasso's
/// ThreadedRodeo.
static INTERNER: OnceLock<ThreadedRodeo> = OnceLock::new();

fn interner() -> &'static ThreadedRodeo {
    INTERNER.get_or_init(ThreadedRodeo::new)
}

/// An interned string reference
///
/// Stores a small integer key (4 bytes) instead of a full String.
/// Cloning is just copying the key.
///
/// # Thread Safety
///
/// `InternedStr` is `Send + Sync`; the underlying interner is thread-safe.
#[derive(Clone, Copy)]
pub struct InternedStr {
    key: Spur,
}

impl InternedStr {
    /// Intern a string, returning the existing key if it was seen before.
    #[inline]
    pub fn new(s: &str) -> Self {
        Self {
            key: interner().get_or_intern(s),
        }
    }

    /// Intern an owned String without an extra borrow.
    #[inline]
    pub fn from_string(s: String) -> Self {
        Self {
            key: interner().get_or_intern(s),
        }
    }

    /// Get the string slice.
    #[inline]
    pub fn as_str(&self) -> &'static str {
        // The interner lives for 'static and keys are never removed
        interner().resolve(&self.key)
    }

    /// Get the raw key (for debugging).
    #[inline]
    pub fn key(&self) -> u32 {
        self.key.into_usize() as u32
    }

    /// Number of unique strings interned process-wide.
    pub fn interned_count() -> usize {
        interner().len()
    }
}

impl Deref for InternedStr {
    type Target = str;

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl AsRef<str> for InternedStr {
    #[inline]
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Debug for InternedStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl fmt::Display for InternedStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl PartialEq for InternedStr {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        // Same key = same string
        self.key == other.key
    }
}

impl Eq for InternedStr {}

impl PartialOrd for InternedStr {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InternedStr {
    #[inline]
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_str().cmp(other.as_str())
    }
}

impl PartialEq<str> for InternedStr {
    #[inline]
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl PartialEq<&str> for InternedStr {
    #[inline]
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

impl PartialEq<String> for InternedStr {
    #[inline]
    fn eq(&self, other: &String) -> bool {
        self.as_str() == other
    }
}

impl Hash for InternedStr {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Hash the key, not the string
        self.key.hash(state);
    }
}

impl From<&str> for InternedStr {
    #[inline]
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for InternedStr {
    #[inline]
    fn from(s: String) -> Self {
        Self::from_string(s)
    }
}

impl From<InternedStr> for String {
    #[inline]
    fn from(s: InternedStr) -> Self {
        s.as_str().to_owned()
    }
}
