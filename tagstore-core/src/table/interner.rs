//! String interning shared by all sub tables of a table

use crate::meta::{self, SyncPolicy};
use crate::{Result, StrRef, TagStoreError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error};

/// Persisted form of the interning table
#[derive(Debug, Default, Serialize, Deserialize)]
struct StringRefMap {
    mapping: BTreeMap<String, StrRef>,
}

#[derive(Debug, Default)]
struct InternerState {
    by_ref: HashMap<StrRef, String>,
    by_str: HashMap<String, StrRef>,
}

/// Bidirectional string <-> [`StrRef`] mapping, persisted on every mint
///
/// A failed persist drops the references it tried to add and poisons the
/// interner: every later mint returns [`TagStoreError::Fatal`].
pub struct StringInterner {
    path: PathBuf,
    sync: SyncPolicy,
    state: RwLock<InternerState>,
    poisoned: AtomicBool,
}

impl StringInterner {
    /// Load the interning table at `path`, empty if it was never written
    pub fn open(path: PathBuf, sync: SyncPolicy) -> Result<Self> {
        let mut state = InternerState::default();
        if let Some(stored) = meta::read_safe::<StringRefMap>(&path)? {
            for (string, str_ref) in stored.mapping {
                if state.by_ref.insert(str_ref, string.clone()).is_some() {
                    return Err(TagStoreError::Corruption(format!(
                        "String reference {} is minted twice in {:?}",
                        str_ref, path
                    )));
                }
                state.by_str.insert(string, str_ref);
            }
        }
        debug!("Loaded {} string references from {:?}", state.by_ref.len(), path);

        Ok(Self {
            path,
            sync,
            state: RwLock::new(state),
            poisoned: AtomicBool::new(false),
        })
    }

    /// Number of minted strings
    pub fn len(&self) -> usize {
        self.state.read().by_ref.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Return the reference of every string, minting the unknown ones
    pub fn mint<S: AsRef<str>>(&self, strings: &[S]) -> Result<Vec<StrRef>> {
        self.check_poisoned()?;
        {
            let state = self.state.read();
            let known: Option<Vec<StrRef>> = strings
                .iter()
                .map(|s| state.by_str.get(s.as_ref()).copied())
                .collect();
            if let Some(refs) = known {
                return Ok(refs);
            }
        }

        let mut state = self.state.write();
        // A concurrent minter may have failed while we waited for the lock.
        self.check_poisoned()?;
        let first_new = state.by_ref.len() as StrRef + 1;
        let mut did_mint = false;
        let mut result = Vec::with_capacity(strings.len());
        for s in strings {
            let s = s.as_ref();
            if let Some(&str_ref) = state.by_str.get(s) {
                result.push(str_ref);
                continue;
            }
            let str_ref = state.by_ref.len() as StrRef + 1;
            state.by_str.insert(s.to_string(), str_ref);
            state.by_ref.insert(str_ref, s.to_string());
            result.push(str_ref);
            did_mint = true;
        }
        if did_mint {
            // TODO: append only the new references instead of rewriting the whole table.
            let stored = StringRefMap {
                mapping: state
                    .by_str
                    .iter()
                    .map(|(s, r)| (s.clone(), *r))
                    .collect(),
            };
            if let Err(e) = meta::write_safe(&self.path, &stored, self.sync) {
                let last_new = state.by_ref.len() as StrRef;
                for str_ref in first_new..=last_new {
                    if let Some(s) = state.by_ref.remove(&str_ref) {
                        state.by_str.remove(&s);
                    }
                }
                if e.is_fatal() {
                    error!("String interner at {:?} poisoned", self.path);
                    self.poisoned.store(true, Ordering::Release);
                }
                return Err(e);
            }
            debug!("Minted string references, {} in total", state.by_ref.len());
        }
        Ok(result)
    }

    /// Look up the string of every reference, `None` for unknown references
    pub fn resolve(&self, refs: &[StrRef]) -> Vec<Option<String>> {
        let state = self.state.read();
        refs.iter().map(|r| state.by_ref.get(r).cloned()).collect()
    }

    /// Reference of a string without minting it
    pub fn lookup(&self, s: &str) -> Option<StrRef> {
        self.state.read().by_str.get(s).copied()
    }

    fn check_poisoned(&self) -> Result<()> {
        if self.is_poisoned() {
            return Err(TagStoreError::Fatal(format!(
                "String interner at {:?} is in an unrecoverable state after a failed write",
                self.path
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_mint_and_resolve() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("STR_REF.pb");
        let interner = StringInterner::open(path.clone(), SyncPolicy::None).unwrap();
        assert!(interner.is_empty());

        assert_eq!(interner.mint(&["hello", "a world", "this"]).unwrap(), vec![1, 2, 3]);
        assert_eq!(interner.resolve(&[1]), vec![Some("hello".to_string())]);

        assert_eq!(
            interner.mint(&["is", "hello", "a world", "great"]).unwrap(),
            vec![4, 1, 2, 5]
        );
        assert_eq!(
            interner
                .mint(&["is", "great", "hello", "xx", "is", "hello", "GOOG", "PL"])
                .unwrap(),
            vec![4, 5, 1, 6, 4, 1, 7, 8]
        );
        assert_eq!(interner.resolve(&[5, 99]), vec![Some("great".to_string()), None]);

        let reopened = StringInterner::open(path, SyncPolicy::None).unwrap();
        assert_eq!(reopened.len(), 8);
        assert_eq!(
            reopened.resolve(&[5, 1]),
            vec![Some("great".to_string()), Some("hello".to_string())]
        );
        assert_eq!(
            reopened
                .mint(&["is", "great", "hello", "xx", "is", "hello", "FB"])
                .unwrap(),
            vec![4, 5, 1, 6, 4, 1, 9]
        );
    }

    #[test]
    fn test_duplicate_new_strings_in_one_batch() {
        let temp_dir = TempDir::new().unwrap();
        let interner =
            StringInterner::open(temp_dir.path().join("STR_REF.pb"), SyncPolicy::None).unwrap();
        assert_eq!(interner.mint(&["x", "y", "x", "y"]).unwrap(), vec![1, 2, 1, 2]);
        assert_eq!(interner.len(), 2);
        assert_eq!(interner.lookup("y"), Some(2));
        assert_eq!(interner.lookup("z"), None);
    }

    #[test]
    fn test_no_write_without_new_strings() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("STR_REF.pb");
        let interner = StringInterner::open(path.clone(), SyncPolicy::None).unwrap();
        assert!(interner.mint::<&str>(&[]).unwrap().is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn test_failed_persist_poisons() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("STR_REF.pb");
        let interner = StringInterner::open(path.clone(), SyncPolicy::None).unwrap();
        assert_eq!(interner.mint(&["US"]).unwrap(), vec![1]);

        // A directory where the table file lives makes the next persist fail.
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        assert!(interner.mint(&["X", "US"]).unwrap_err().is_fatal());
        assert!(interner.is_poisoned());
        assert_eq!(interner.resolve(&[1, 2]), vec![Some("US".to_string()), None]);
        assert_eq!(interner.lookup("X"), None);
        assert_eq!(interner.len(), 1);

        // Even strings that are already known are refused now.
        assert!(interner.mint(&["US"]).unwrap_err().is_fatal());
    }
}
