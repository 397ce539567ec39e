pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::sync::Arc;

use dialflow_core::config::{StoreBackend, StoreConfig};
use dialflow_core::error::{DialflowError, Result};
use dialflow_core::flow::FlowDefinition;
use dialflow_core::traits::{ConversationStore, FlowStore};
use dialflow_core::types::Version;

/// Flow and conversation stores sharing one backend.
pub struct Stores {
    pub flows: Arc<dyn FlowStore>,
    pub conversations: Arc<dyn ConversationStore>,
}

impl Stores {
    pub fn memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            flows: store.clone(),
            conversations: store,
        }
    }
}

/// Open the backend named in the configuration.
pub fn open(config: &StoreConfig) -> Result<Stores> {
    match config.backend {
        StoreBackend::Memory => Ok(Stores::memory()),
        StoreBackend::Sqlite => {
            let store = Arc::new(SqliteStore::open(&config.resolved_path())?);
            Ok(Stores {
                flows: store.clone(),
                conversations: store,
            })
        }
    }
}

/// A published version must directly follow the one it replaces.
pub(crate) fn check_successor(definition: &FlowDefinition, current: Option<Version>) -> Result<()> {
    let expected = current.map(Version::next).unwrap_or_else(Version::initial);
    if definition.version != expected {
        return Err(DialflowError::InvalidState(format!(
            "flow {} cannot publish v{} after {}",
            definition.id,
            definition.version,
            current
                .map(|v| format!("v{}", v))
                .unwrap_or_else(|| "nothing".into())
        )));
    }
    Ok(())
}
