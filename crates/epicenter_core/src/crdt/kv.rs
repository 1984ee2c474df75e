//! Workspace-wide settings.
//!
//! Each key holds one JSON-encoded [`KvEntry`] scalar carrying both the
//! definition and the value. Changing a default and resetting the value is
//! therefore a single atomic write that concurrent peers resolve as a whole.

use std::collections::BTreeMap;

use yrs::{Any, Map, MapRef, Observable, Out, ReadTxn, Subscription, TransactionMut};

use super::types::{KvDefinition, KvEntry};
use super::workspace_doc::{KV_MAP, WorkspaceDocument};
use crate::error::{EpicenterError, Result};
use crate::field::Value;

/// A change reported by [`KvHelper::observe`]. `entry` is `None` when the
/// key was removed.
#[derive(Debug, Clone, PartialEq)]
pub struct KvChange {
    pub key: String,
    pub entry: Option<KvEntry>,
}

#[derive(Clone)]
pub struct KvHelper {
    document: WorkspaceDocument,
    map: MapRef,
}

impl KvHelper {
    pub(crate) fn new(document: WorkspaceDocument) -> Self {
        let map = document.root_map(KV_MAP);
        Self { document, map }
    }

    /// Declare a setting.
    ///
    /// The field must have a default or be nullable so that every key always
    /// holds a valid value. An existing value that is still valid under the
    /// new field is kept; otherwise it is reset in the same write.
    pub fn define(&self, key: &str, definition: KvDefinition) -> Result<()> {
        if key.is_empty() {
            return Err(EpicenterError::validation("key", "key must not be empty"));
        }
        let fallback = definition.field.fallback().ok_or_else(|| {
            EpicenterError::validation(key, "setting needs a default or must be nullable")
        })?;
        definition.field.validate(key, &fallback)?;

        let mut txn = self.document.write_txn();
        let current = read_entry(&txn, &self.map, key);
        let value = match &current {
            Some(entry) if definition.field.validate(key, &entry.value).is_ok() => {
                entry.value.clone()
            }
            _ => fallback,
        };
        let entry = KvEntry {
            name: definition.name,
            icon: definition.icon,
            description: definition.description,
            field: definition.field,
            value,
        };
        if current.as_ref() != Some(&entry) {
            write_entry(&mut txn, &self.map, key, &entry)?;
        }
        Ok(())
    }

    pub fn entry(&self, key: &str) -> Result<KvEntry> {
        let txn = self.document.read_txn();
        read_entry(&txn, &self.map, key).ok_or_else(|| EpicenterError::KeyNotFound(key.to_string()))
    }

    pub fn get(&self, key: &str) -> Result<Value> {
        self.entry(key).map(|entry| entry.value)
    }

    /// Validate and store a value.
    pub fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut txn = self.document.write_txn();
        let mut entry = read_entry(&txn, &self.map, key)
            .ok_or_else(|| EpicenterError::KeyNotFound(key.to_string()))?;
        entry.field.validate(key, &value)?;
        if entry.value != value {
            entry.value = value;
            write_entry(&mut txn, &self.map, key, &entry)?;
        }
        Ok(())
    }

    /// Restore the field's default (or null).
    pub fn reset(&self, key: &str) -> Result<()> {
        let entry = self.entry(key)?;
        let fallback = entry.field.fallback().unwrap_or(Value::Null);
        self.set(key, fallback)
    }

    /// Every setting, ordered by key.
    pub fn list(&self) -> BTreeMap<String, KvEntry> {
        let txn = self.document.read_txn();
        self.map
            .keys(&txn)
            .filter_map(|key| read_entry(&txn, &self.map, key).map(|e| (key.to_string(), e)))
            .collect()
    }

    pub fn observe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&[KvChange]) + Send + Sync + 'static,
    {
        let map = self.map.clone();
        self.map.observe(move |txn, event| {
            let mut keys: Vec<String> = event.keys(txn).keys().map(|k| k.to_string()).collect();
            keys.sort();
            let changes: Vec<KvChange> = keys
                .into_iter()
                .map(|key| {
                    let entry = read_entry(txn, &map, &key);
                    KvChange { key, entry }
                })
                .collect();
            callback(&changes);
        })
    }

    /// Store an entry verbatim after validating its value. Used when
    /// rebuilding a document from a snapshot.
    pub(crate) fn restore(&self, key: &str, entry: &KvEntry) -> Result<()> {
        entry.field.validate(key, &entry.value)?;
        let mut txn = self.document.write_txn();
        write_entry(&mut txn, &self.map, key, entry)
    }
}

fn read_entry<T: ReadTxn>(txn: &T, map: &MapRef, key: &str) -> Option<KvEntry> {
    match map.get(txn, key)? {
        Out::Any(Any::String(json)) => match serde_json::from_str(&json) {
            Ok(entry) => Some(entry),
            Err(e) => {
                log::warn!("Ignoring unreadable setting '{}': {}", key, e);
                None
            }
        },
        _ => None,
    }
}

fn write_entry(txn: &mut TransactionMut, map: &MapRef, key: &str, entry: &KvEntry) -> Result<()> {
    let json = serde_json::to_string(entry)?;
    map.insert(txn, key, json);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::Field;
    use std::sync::{Arc, Mutex};

    fn kv() -> KvHelper {
        WorkspaceDocument::new("blog", 0).kv()
    }

    fn theme() -> KvDefinition {
        KvDefinition::new("Theme", Field::select(["light", "dark"]).with_default(Value::text("light")))
    }

    #[test]
    fn test_define_sets_default() {
        let kv = kv();
        kv.define("theme", theme()).unwrap();
        assert_eq!(kv.get("theme").unwrap(), Value::text("light"));
    }

    #[test]
    fn test_define_requires_fallback() {
        let kv = kv();
        let err = kv
            .define("count", KvDefinition::new("Count", Field::number()))
            .unwrap_err();
        assert!(matches!(err, EpicenterError::Validation { .. }));
        assert!(kv.get("count").is_err());
    }

    #[test]
    fn test_set_validates() {
        let kv = kv();
        kv.define("theme", theme()).unwrap();
        kv.set("theme", Value::text("dark")).unwrap();
        assert!(kv.set("theme", Value::text("blue")).is_err());
        assert_eq!(kv.get("theme").unwrap(), Value::text("dark"));
        assert!(kv.set("missing", Value::Null).is_err());
    }

    #[test]
    fn test_redefine_keeps_valid_value_and_resets_invalid() {
        let kv = kv();
        kv.define("theme", theme()).unwrap();
        kv.set("theme", Value::text("dark")).unwrap();

        kv.define(
            "theme",
            KvDefinition::new("Theme", Field::select(["light", "dark", "sepia"]).with_default(Value::text("sepia"))),
        )
        .unwrap();
        assert_eq!(kv.get("theme").unwrap(), Value::text("dark"));

        kv.define(
            "theme",
            KvDefinition::new("Theme", Field::select(["sepia"]).with_default(Value::text("sepia"))),
        )
        .unwrap();
        assert_eq!(kv.get("theme").unwrap(), Value::text("sepia"));
    }

    #[test]
    fn test_reset_and_list() {
        let kv = kv();
        kv.define("theme", theme()).unwrap();
        kv.define("motto", KvDefinition::new("Motto", Field::text().nullable()))
            .unwrap();
        kv.set("theme", Value::text("dark")).unwrap();
        kv.reset("theme").unwrap();

        let all = kv.list();
        assert_eq!(all.keys().collect::<Vec<_>>(), vec!["motto", "theme"]);
        assert_eq!(all["theme"].value, Value::text("light"));
        assert_eq!(all["motto"].value, Value::Null);
    }

    #[test]
    fn test_observe_reports_new_value() {
        let kv = kv();
        kv.define("theme", theme()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _sub = kv.observe(move |changes| {
            seen_clone.lock().unwrap().extend(changes.iter().cloned())
        });

        kv.set("theme", Value::text("dark")).unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].entry.as_ref().unwrap().value, Value::text("dark"));
    }
}
