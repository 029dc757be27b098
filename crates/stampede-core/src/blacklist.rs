//! Routes exempt from coalescing.

use crate::request::{normalize_path, Method};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;

/// Static set of `(method, path)` pairs that are never coalesced.
///
/// Membership is an exact match on method and normalized path; query and
/// body play no part.
#[derive(Debug, Clone, Default)]
pub struct Blacklist {
    entries: HashSet<(Method, String)>,
}

impl Blacklist {
    /// Creates an empty blacklist.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a blacklist builder.
    pub fn builder() -> BlacklistBuilder {
        BlacklistBuilder::default()
    }

    /// Returns true if requests for `method` and `path` must bypass coalescing.
    pub fn is_excluded(&self, method: &Method, path: &str) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let normalized = normalize_path(path);
        self.entries.contains(&(method.clone(), normalized))
    }

    /// Number of excluded routes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is excluded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over the excluded routes.
    pub fn iter(&self) -> impl Iterator<Item = (&Method, &str)> {
        self.entries.iter().map(|(m, p)| (m, p.as_str()))
    }

    fn insert(&mut self, method: Method, path: &str) -> bool {
        self.entries.insert((method, normalize_path(path)))
    }
}

impl<P: AsRef<str>> FromIterator<(Method, P)> for Blacklist {
    fn from_iter<I: IntoIterator<Item = (Method, P)>>(iter: I) -> Self {
        let mut blacklist = Blacklist::new();
        for (method, path) in iter {
            blacklist.insert(method, path.as_ref());
        }
        blacklist
    }
}

/// Declarative registration of excluded routes, run during setup.
///
/// # Example
///
/// ```
/// use stampede_core::{Blacklist, Method};
///
/// let blacklist = Blacklist::builder()
///     .exclude(Method::Get, "/blacklisted")
///     .exclude(Method::Post, "/payments")
///     .build();
///
/// assert!(blacklist.is_excluded(&Method::Get, "/blacklisted"));
/// assert!(!blacklist.is_excluded(&Method::Post, "/blacklisted"));
/// ```
#[derive(Debug, Default)]
pub struct BlacklistBuilder {
    blacklist: Blacklist,
}

impl BlacklistBuilder {
    /// Excludes `(method, path)` from coalescing.
    pub fn exclude(mut self, method: Method, path: impl AsRef<str>) -> Self {
        if self.blacklist.insert(method.clone(), path.as_ref()) {
            tracing::info!(
                method = %method,
                path = %path.as_ref(),
                "Route excluded from coalescing"
            );
        }
        self
    }

    /// Finishes registration.
    pub fn build(self) -> Blacklist {
        self.blacklist
    }
}

/// A blacklist that can be extended while traffic is flowing.
///
/// Updates build a new snapshot and swap it in; readers keep whatever
/// snapshot they loaded and never observe a half-applied update.
#[derive(Debug, Clone, Default)]
pub struct SharedBlacklist {
    current: Arc<RwLock<Arc<Blacklist>>>,
}

impl SharedBlacklist {
    /// Wraps an initial blacklist.
    pub fn new(initial: Blacklist) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(initial))),
        }
    }

    /// Returns the current snapshot.
    pub fn snapshot(&self) -> Arc<Blacklist> {
        Arc::clone(&self.current.read())
    }

    /// Checks membership against the current snapshot.
    pub fn is_excluded(&self, method: &Method, path: &str) -> bool {
        self.snapshot().is_excluded(method, path)
    }

    /// Adds a route. Returns false if it was already excluded.
    pub fn exclude(&self, method: Method, path: &str) -> bool {
        let mut current = self.current.write();
        if current.is_excluded(&method, path) {
            return false;
        }
        let mut next = Blacklist::clone(&current);
        next.insert(method.clone(), path);
        *current = Arc::new(next);
        tracing::info!(method = %method, path = %path, "Route excluded from coalescing");
        true
    }

    /// Removes a route. Returns false if it was not excluded.
    pub fn remove(&self, method: &Method, path: &str) -> bool {
        let mut current = self.current.write();
        let key = (method.clone(), normalize_path(path));
        if !current.entries.contains(&key) {
            return false;
        }
        let mut next = Blacklist::clone(&current);
        next.entries.remove(&key);
        *current = Arc::new(next);
        true
    }
}

impl From<Blacklist> for SharedBlacklist {
    fn from(blacklist: Blacklist) -> Self {
        Self::new(blacklist)
    }
}
