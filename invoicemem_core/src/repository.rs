use async_trait::async_trait;

use crate::Result;
use crate::audit::AuditStep;
use crate::memory::Memory;

/// Keyed memory store with read-your-writes consistency.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Active (non-archived) memories scoped to the vendor, plus memories
    /// without a vendor scope, in insertion order.
    async fn find_memories_by_vendor(&self, vendor_id: &str) -> Result<Vec<Memory>>;

    /// Every memory scoped to the vendor, archived ones included.
    async fn list_memories_by_vendor(&self, vendor_id: &str) -> Result<Vec<Memory>>;

    async fn find_memory(&self, id: &str) -> Result<Option<Memory>>;

    /// Insert or overwrite unconditionally. A new record keeps
    /// `memory.version`; an overwrite bumps the stored version.
    async fn save_memory(&self, memory: &Memory) -> Result<()>;

    /// Overwrite only if the stored version equals `memory.version`.
    ///
    /// Returns the new version, or [`crate::Error::VersionConflict`] when
    /// another writer got there first.
    async fn update_memory(&self, memory: &Memory) -> Result<u64>;
}

/// Append-only audit log keyed by invoice id.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record_audit_step(&self, step: &AuditStep) -> Result<()>;

    /// All-or-nothing append of a batch, order preserved.
    async fn record_audit_steps(&self, steps: &[AuditStep]) -> Result<()>;

    async fn get_audit_trail(&self, invoice_id: &str) -> Result<Vec<AuditStep>>;
}
