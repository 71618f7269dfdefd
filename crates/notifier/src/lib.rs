#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! An observable key/value tree. Every mutation is applied to an in-memory
//! tree and published as a discrete change record, in the exact order it
//! occurred, to every registered subscriber. Used by the scheduler to expose
//! its full public state (submissions, statuses, datasets) to external
//! mirrors without the core depending on any particular transport.

use std::{
    collections::HashMap,
    fmt::{Display, Formatter},
    sync::{Arc, Mutex},
};

use tracing::warn;

/// All the errors that can occur when mutating the notifier's tree.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A path segment did not resolve to a nested object.
    #[error("path segment '{segment}' does not resolve to an object")]
    NotAnObject {
        /// The offending path segment.
        segment: Key,
    },

    /// The key to delete was not present at the given path.
    #[error("key '{key}' not found at the given path")]
    NotFound {
        /// The key that was looked up.
        key: Key,
    },
}

/// A single segment of a path into the tree, or the final key of a mutation.
/// Run entries are addressed by their `rid`; every other field is addressed
/// by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Key {
    /// A run identifier.
    Rid(u64),
    /// A named field.
    Name(String),
}

impl Display for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Key::Rid(rid) => write!(f, "{rid}"),
            Key::Name(name) => write!(f, "{name}"),
        }
    }
}

impl From<u64> for Key {
    fn from(rid: u64) -> Self {
        Key::Rid(rid)
    }
}

impl From<&str> for Key {
    fn from(name: &str) -> Self {
        Key::Name(name.to_string())
    }
}

impl From<String> for Key {
    fn from(name: String) -> Self {
        Key::Name(name)
    }
}

/// A value stored in the tree. Primitive variants are kept distinct (rather
/// than folded into a single JSON blob) so equality assertions in tests don't
/// depend on an incidental numeric representation; `Opaque` carries anything
/// the core itself never interprets (an experiment descriptor, a repository
/// message).
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Value {
    /// The absence of a value.
    Null,
    /// A boolean value.
    Bool(bool),
    /// A signed integer value.
    I64(i64),
    /// A floating point value, used for `due_date` (seconds since epoch).
    F64(f64),
    /// A string value.
    String(String),
    /// An opaque value the core carries but never inspects.
    Opaque(serde_json::Value),
    /// A nested object.
    Object(HashMap<Key, Value>),
}

impl Value {
    /// Builds an empty object.
    pub fn object() -> Self {
        Value::Object(HashMap::new())
    }

    fn as_object_mut(&mut self) -> Option<&mut HashMap<Key, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }
}

/// The kind of mutation a `ChangeRecord` describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Action {
    /// A key was assigned a value.
    SetItem,
    /// A key was removed.
    DelItem,
}

impl Display for Action {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::SetItem => f.write_str("setitem"),
            Action::DelItem => f.write_str("delitem"),
        }
    }
}

/// A single, wire-observable mutation of the notifier's tree.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    /// Whether this is an insertion/update or a removal.
    pub action: Action,
    /// The path from the tree root to the object the key was mutated in.
    pub path: Vec<Key>,
    /// The key that was mutated within that object.
    pub key: Key,
    /// The new value, present only for `SetItem`.
    pub value: Option<Value>,
}

type Subscriber = dyn Fn(&ChangeRecord) + Send + Sync;

/// An observable key/value tree. Cheaply cloneable; every clone shares the
/// same underlying tree and subscriber list.
#[derive(Clone, Default)]
pub struct Notifier {
    tree: Arc<Mutex<Value>>,
    subscribers: Arc<Mutex<Vec<Arc<Subscriber>>>>,
}

impl Notifier {
    /// Creates a new, empty notifier.
    pub fn new() -> Self {
        Self {
            tree: Arc::new(Mutex::new(Value::object())),
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Registers a subscriber. All mutations made after this call returns are
    /// delivered to it, in order; mutations that happened before are not
    /// replayed.
    pub fn subscribe(&self, sink: impl Fn(&ChangeRecord) + Send + Sync + 'static) {
        self.subscribers
            .lock()
            .expect("notifier subscribers lock poisoned")
            .push(Arc::new(sink));
    }

    /// Assigns `value` at `key` under `path`, creating the record and
    /// publishing it to every subscriber. `path` must already resolve to a
    /// nested object (the root counts as the empty path).
    pub fn set(&self, path: &[Key], key: Key, value: Value) -> Result<(), Error> {
        {
            let mut tree = self.tree.lock().expect("notifier tree lock poisoned");
            let object = Self::navigate_mut(&mut tree, path).map_err(|err| {
                warn!(%key, error = %err, "set failed to navigate to the target object");
                err
            })?;
            let _ = object.insert(key.clone(), value.clone());
        }

        self.publish(ChangeRecord {
            action: Action::SetItem,
            path: path.to_vec(),
            key,
            value: Some(value),
        });
        Ok(())
    }

    /// Removes `key` under `path`, publishing the resulting record.
    pub fn delete(&self, path: &[Key], key: Key) -> Result<(), Error> {
        {
            let mut tree = self.tree.lock().expect("notifier tree lock poisoned");
            let object = Self::navigate_mut(&mut tree, path).map_err(|err| {
                warn!(%key, error = %err, "delete failed to navigate to the target object");
                err
            })?;
            if object.remove(&key).is_none() {
                warn!(%key, "delete found no value to remove at the given path");
                return Err(Error::NotFound { key });
            }
        }

        self.publish(ChangeRecord {
            action: Action::DelItem,
            path: path.to_vec(),
            key,
            value: None,
        });
        Ok(())
    }

    /// Returns a clone of the value at `key` under `path`, if present.
    pub fn get(&self, path: &[Key], key: &Key) -> Option<Value> {
        let tree = self.tree.lock().expect("notifier tree lock poisoned");
        let mut current = &*tree;
        for segment in path {
            current = current.as_object_like()?.get(segment)?;
        }
        current.as_object_like()?.get(key).cloned()
    }

    fn navigate_mut<'a>(root: &'a mut Value, path: &[Key]) -> Result<&'a mut HashMap<Key, Value>, Error> {
        let mut current = root;
        for segment in path {
            let object = current.as_object_mut().ok_or_else(|| Error::NotAnObject {
                segment: segment.clone(),
            })?;
            current = object
                .entry(segment.clone())
                .or_insert_with(Value::object);
        }
        current.as_object_mut().ok_or_else(|| Error::NotAnObject {
            segment: path.last().cloned().unwrap_or(Key::Name("<root>".into())),
        })
    }

    fn publish(&self, record: ChangeRecord) {
        let subscribers = self.subscribers.lock().expect("notifier subscribers lock poisoned").clone();
        for subscriber in subscribers.iter() {
            subscriber(&record);
        }
    }
}

impl Value {
    fn as_object_like(&self) -> Option<&HashMap<Key, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn set_publishes_in_order() {
        let notifier = Notifier::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        notifier.subscribe(move |record| seen_clone.lock().unwrap().push(record.clone()));

        notifier
            .set(&[], Key::Rid(1), Value::object())
            .expect("set at root must succeed");
        notifier
            .set(&[Key::Rid(1)], Key::Name("status".into()), Value::String("pending".into()))
            .expect("set under rid must succeed");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].action, Action::SetItem);
        assert_eq!(seen[0].key, Key::Rid(1));
        assert_eq!(seen[1].path, vec![Key::Rid(1)]);
        assert_eq!(seen[1].value, Some(Value::String("pending".into())));
    }

    #[test]
    fn delete_emits_delitem_and_removes_value() {
        let notifier = Notifier::new();
        notifier.set(&[], Key::Rid(7), Value::I64(42)).unwrap();
        assert_eq!(notifier.get(&[], &Key::Rid(7)), Some(Value::I64(42)));

        notifier.delete(&[], Key::Rid(7)).unwrap();
        assert_eq!(notifier.get(&[], &Key::Rid(7)), None);
    }

    #[test]
    fn delete_unknown_key_is_an_error() {
        let notifier = Notifier::new();
        let err = notifier.delete(&[], Key::Rid(1)).unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn subscriber_registered_after_a_mutation_does_not_see_it() {
        let notifier = Notifier::new();
        notifier.set(&[], Key::Rid(1), Value::object()).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        notifier.subscribe(move |record| seen_clone.lock().unwrap().push(record.clone()));

        assert!(seen.lock().unwrap().is_empty());
    }
}
