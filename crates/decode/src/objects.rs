use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use vox_transport::AudioRef;

#[derive(Debug, Clone)]
pub struct ObjectEntry {
    pub bytes: Arc<[u8]>,
    pub name: String,
}

/// Registry of short-lived in-memory references to selected files.
///
/// References handed out here are only meaningful to the registry instance that
/// created them. A full reload starts with a fresh registry, so references
/// restored from a session snapshot become stale and must be rebuilt from the
/// durable byte store.
#[derive(Debug, Clone, Default)]
pub struct ObjectUrls {
    entries: Arc<Mutex<HashMap<String, ObjectEntry>>>,
}

impl ObjectUrls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, bytes: Arc<[u8]>, name: &str) -> AudioRef {
        let suffix = rand::thread_rng().r#gen::<u64>();
        let key = format!("{}vox/{suffix:016x}", AudioRef::OBJECT_SCHEME);
        self.entries.lock().insert(
            key.clone(),
            ObjectEntry {
                bytes,
                name: name.to_string(),
            },
        );
        AudioRef::Object(key)
    }

    /// `None` for remote references and for object references this registry
    /// does not know (revoked, or created before a reload).
    pub fn resolve(&self, reference: &AudioRef) -> Option<ObjectEntry> {
        match reference {
            AudioRef::Object(key) => self.entries.lock().get(key).cloned(),
            AudioRef::Remote(_) => None,
        }
    }

    pub fn is_live(&self, reference: &AudioRef) -> bool {
        match reference {
            AudioRef::Object(key) => self.entries.lock().contains_key(key),
            AudioRef::Remote(_) => true,
        }
    }

    pub fn revoke(&self, reference: &AudioRef) {
        if let AudioRef::Object(key) = reference {
            self.entries.lock().remove(key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_resolve_revoke() {
        let objects = ObjectUrls::new();
        let reference = objects.create(Arc::from(&b"RIFF"[..]), "take.wav");

        assert!(reference.is_object());
        let entry = objects.resolve(&reference).expect("live");
        assert_eq!(entry.name, "take.wav");
        assert_eq!(&entry.bytes[..], b"RIFF");

        objects.revoke(&reference);
        assert!(objects.resolve(&reference).is_none());
        assert!(!objects.is_live(&reference));
    }

    #[test]
    fn test_references_do_not_survive_a_new_registry() {
        let before = ObjectUrls::new();
        let reference = before.create(Arc::from(&b"data"[..]), "a.wav");

        let after_reload = ObjectUrls::new();
        assert!(after_reload.resolve(&reference).is_none());
    }

    #[test]
    fn test_remote_references_are_always_live() {
        let objects = ObjectUrls::new();
        let remote = AudioRef::from("/api/download/mixed-track?id=1");
        assert!(objects.is_live(&remote));
        assert!(objects.resolve(&remote).is_none());
    }
}
