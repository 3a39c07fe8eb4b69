pub mod sqlite;

use hashbrown::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    Message(String),
}

pub type PersistResult<T> = Result<T, PersistError>;

/// Key/value store the queue is saved into.
///
/// Values are opaque serialized strings; the queue owns the format.
pub trait PersistenceAdapter: Send {
    fn get(&self, key: &str) -> PersistResult<Option<String>>;
    fn set(&mut self, key: &str, value: &str) -> PersistResult<()>;
    fn remove(&mut self, _key: &str) -> PersistResult<()> {
        Ok(())
    }
}

/// Volatile adapter, mostly for tests and ephemeral sessions.
#[derive(Debug, Default, Clone)]
pub struct MemoryAdapter {
    entries: HashMap<String, String>,
    writes: usize,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `set` calls.
    pub fn writes(&self) -> usize {
        self.writes
    }
}

impl PersistenceAdapter for MemoryAdapter {
    fn get(&self, key: &str) -> PersistResult<Option<String>> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> PersistResult<()> {
        self.entries.insert(key.to_string(), value.to_string());
        self.writes += 1;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> PersistResult<()> {
        self.entries.remove(key);
        Ok(())
    }
}
