//! Process-local collaborators backed by `tokio::sync::RwLock`.

use async_trait::async_trait;
use invoicemem_core::{AuditSink, AuditStep, Error, Memory, MemoryStore, Result};
use tokio::sync::RwLock;
use tracing::debug;

/// Memories kept in insertion order.
#[derive(Debug, Default)]
pub struct InMemoryMemoryStore {
    memories: RwLock<Vec<Memory>>,
}

impl InMemoryMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with memories, as if each had been saved in order.
    #[must_use]
    pub fn with_memories(memories: Vec<Memory>) -> Self {
        Self {
            memories: RwLock::new(memories),
        }
    }

    pub async fn len(&self) -> usize {
        self.memories.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.memories.read().await.is_empty()
    }
}

fn scoped_to(memory: &Memory, vendor_id: &str) -> bool {
    memory.vendor_id() == Some(vendor_id)
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn find_memories_by_vendor(&self, vendor_id: &str) -> Result<Vec<Memory>> {
        let memories = self.memories.read().await;
        Ok(memories
            .iter()
            .filter(|m| !m.archived && m.vendor_id().is_none_or(|v| v == vendor_id))
            .cloned()
            .collect())
    }

    async fn list_memories_by_vendor(&self, vendor_id: &str) -> Result<Vec<Memory>> {
        let memories = self.memories.read().await;
        Ok(memories
            .iter()
            .filter(|m| scoped_to(m, vendor_id))
            .cloned()
            .collect())
    }

    async fn find_memory(&self, id: &str) -> Result<Option<Memory>> {
        Ok(self.memories.read().await.iter().find(|m| m.id == id).cloned())
    }

    async fn save_memory(&self, memory: &Memory) -> Result<()> {
        let mut memories = self.memories.write().await;
        if let Some(stored) = memories.iter_mut().find(|m| m.id == memory.id) {
            let version = stored.version + 1;
            *stored = memory.clone();
            stored.version = version;
        } else {
            memories.push(memory.clone());
        }
        debug!(memory_id = %memory.id, "Saved memory");
        Ok(())
    }

    async fn update_memory(&self, memory: &Memory) -> Result<u64> {
        let mut memories = self.memories.write().await;
        let stored = memories
            .iter_mut()
            .find(|m| m.id == memory.id)
            .ok_or_else(|| Error::NotFound(memory.id.clone()))?;
        if stored.version != memory.version {
            return Err(Error::VersionConflict {
                id: memory.id.clone(),
                expected: memory.version,
                actual: stored.version,
            });
        }
        let version = memory.version + 1;
        *stored = memory.clone();
        stored.version = version;
        Ok(version)
    }
}

/// Append-only audit log. Batches are validated before anything is appended.
#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    steps: RwLock<Vec<AuditStep>>,
}

impl InMemoryAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.steps.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.steps.read().await.is_empty()
    }
}

fn check_step(step: &AuditStep) -> Result<()> {
    if step.id.trim().is_empty() {
        return Err(Error::Store("audit step without id".to_string()));
    }
    Ok(())
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn record_audit_step(&self, step: &AuditStep) -> Result<()> {
        check_step(step)?;
        self.steps.write().await.push(step.clone());
        Ok(())
    }

    async fn record_audit_steps(&self, steps: &[AuditStep]) -> Result<()> {
        steps.iter().try_for_each(check_step)?;
        self.steps.write().await.extend_from_slice(steps);
        debug!(count = steps.len(), "Recorded audit batch");
        Ok(())
    }

    async fn get_audit_trail(&self, invoice_id: &str) -> Result<Vec<AuditStep>> {
        let steps = self.steps.read().await;
        Ok(steps
            .iter()
            .filter(|s| s.trail_key() == invoice_id)
            .cloned()
            .collect())
    }
}
