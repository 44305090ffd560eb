//! In-memory record store served by the `serve` subcommand.

use std::{collections::BTreeMap, sync::Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    codec::{AnyValue, Payload, Registry},
    wire::Command,
};

/// A keyed record. `value` is `None` when the key holds nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: String,
    pub value: Option<String>,
}

impl Record {
    pub fn new(key: impl Into<String>, value: Option<String>) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }

    pub fn key(key: impl Into<String>) -> Self {
        Self::new(key, None)
    }
}

impl Payload for Record {
    const TYPE_ID: &'static str = "record";
}

#[derive(Default)]
pub struct RecordStore {
    data: Mutex<BTreeMap<String, String>>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every type this store understands.
    pub fn registry() -> Registry {
        Registry::new().with::<Record>()
    }

    /// Applies one command.
    ///
    /// LOAD replies with the stored value, SAVE with the value now stored and
    /// DELETE with the value it removed. A SAVE without a value is declined.
    pub fn apply(&self, command: Command, record: Record) -> Option<Record> {
        let mut data = match self.data.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Record { key, value } = record;

        match command {
            Command::Load => {
                let value = data.get(&key).cloned();
                Some(Record { key, value })
            }
            Command::Save => {
                let Some(value) = value else {
                    warn!(%key, "save without a value, declining");
                    return None;
                };
                data.insert(key.clone(), value.clone());
                Some(Record::new(key, Some(value)))
            }
            Command::Delete => {
                let value = data.remove(&key);
                Some(Record { key, value })
            }
        }
    }

    /// Entry point matching the service handler signature.
    pub fn handle(&self, command: Command, value: AnyValue) -> Option<AnyValue> {
        match value.downcast::<Record>() {
            Ok(record) => {
                debug!(%command, key = %record.key, "record request");
                let reply = self.apply(command, *record)?;
                Some(Box::new(reply))
            }
            Err(_) => {
                warn!(%command, "record store received a foreign value");
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        match self.data.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
