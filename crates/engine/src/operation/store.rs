//! Operation persistence

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use super::model::{Operation, OperationState};
use crate::record::Key;

/// Error type for operation store operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OperationStoreError {
    #[error("operation not found: {0}")]
    NotFound(Uuid),

    #[error("operation already exists: {0}")]
    AlreadyExists(Uuid),

    /// The update would move the operation backwards or out of a terminal state
    #[error("operation {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: OperationState,
        to: OperationState,
    },

    #[error("operation store unavailable: {0}")]
    Unavailable(String),
}

/// Storage for batch operations
#[async_trait]
pub trait OperationStore: Send + Sync + 'static {
    /// Insert operations; all or none
    async fn insert(&self, operations: Vec<Operation>) -> Result<(), OperationStoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Operation>, OperationStoreError>;

    /// Up to `limit` operations in `state`, oldest first
    async fn fetch_in_state(
        &self,
        state: OperationState,
        limit: usize,
    ) -> Result<Vec<Operation>, OperationStoreError>;

    /// Replace an operation, enforcing monotone state transitions
    ///
    /// An update that keeps the state is accepted for non-terminal operations.
    async fn update(&self, operation: Operation) -> Result<(), OperationStoreError>;

    /// Operations targeting a process instance, oldest first
    async fn list_by_target(&self, target_key: Key) -> Result<Vec<Operation>, OperationStoreError>;

    /// Operations created by one batch request, oldest first
    async fn list_by_batch(&self, batch_id: Uuid) -> Result<Vec<Operation>, OperationStoreError>;
}

#[derive(Default)]
struct Operations {
    /// Insertion order
    entries: Vec<Operation>,
    index: HashMap<Uuid, usize>,
}

impl Operations {
    fn get_mut(&mut self, id: &Uuid) -> Option<&mut Operation> {
        let slot = *self.index.get(id)?;
        self.entries.get_mut(slot)
    }

    fn matching(&self, predicate: impl Fn(&Operation) -> bool) -> Vec<Operation> {
        self.entries.iter().filter(|op| predicate(op)).cloned().collect()
    }
}

/// In-memory [`OperationStore`]
#[derive(Default)]
pub struct InMemoryOperationStore {
    operations: RwLock<Operations>,
}

impl InMemoryOperationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.operations.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All operations, oldest first
    pub fn all(&self) -> Vec<Operation> {
        self.operations.read().entries.clone()
    }
}

#[async_trait]
impl OperationStore for InMemoryOperationStore {
    async fn insert(&self, operations: Vec<Operation>) -> Result<(), OperationStoreError> {
        let mut stored = self.operations.write();
        let mut ids = HashSet::new();
        if let Some(existing) = operations
            .iter()
            .find(|op| stored.index.contains_key(&op.id) || !ids.insert(op.id))
        {
            return Err(OperationStoreError::AlreadyExists(existing.id));
        }
        for operation in operations {
            let slot = stored.entries.len();
            stored.index.insert(operation.id, slot);
            stored.entries.push(operation);
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Operation>, OperationStoreError> {
        let stored = self.operations.read();
        Ok(stored
            .index
            .get(&id)
            .and_then(|slot| stored.entries.get(*slot))
            .cloned())
    }

    async fn fetch_in_state(
        &self,
        state: OperationState,
        limit: usize,
    ) -> Result<Vec<Operation>, OperationStoreError> {
        Ok(self
            .operations
            .read()
            .entries
            .iter()
            .filter(|op| op.state == state)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn update(&self, operation: Operation) -> Result<(), OperationStoreError> {
        let mut stored = self.operations.write();
        let current = stored
            .get_mut(&operation.id)
            .ok_or(OperationStoreError::NotFound(operation.id))?;

        let unchanged = current.state == operation.state && !current.state.is_terminal();
        if !unchanged && !current.state.can_transition_to(operation.state) {
            return Err(OperationStoreError::InvalidTransition {
                id: operation.id,
                from: current.state,
                to: operation.state,
            });
        }
        *current = operation;
        Ok(())
    }

    async fn list_by_target(&self, target_key: Key) -> Result<Vec<Operation>, OperationStoreError> {
        Ok(self.operations.read().matching(|op| op.target_key == target_key))
    }

    async fn list_by_batch(&self, batch_id: Uuid) -> Result<Vec<Operation>, OperationStoreError> {
        Ok(self.operations.read().matching(|op| op.batch_id == batch_id))
    }
}

impl std::fmt::Debug for InMemoryOperationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryOperationStore")
            .field("operations", &self.len())
            .finish()
    }
}
