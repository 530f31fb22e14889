use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

/// String key/value storage that lives as long as the session, not the
/// process installation.
pub trait EphemeralStore {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String);
    fn remove(&self, key: &str);
}

/// Clones share their contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryEphemeralStore {
    values: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryEphemeralStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EphemeralStore for MemoryEphemeralStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: String) {
        self.values.lock().insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) {
        self.values.lock().remove(key);
    }
}
