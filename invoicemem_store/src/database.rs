//! sea-orm backed store and audit sink (SQLite or Postgres).

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use invoicemem_core::{AuditOperation, AuditSink, AuditStep, Error, Memory, MemoryStore, Result};
use sea_orm::ActiveValue::NotSet;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, Database, DatabaseConnection, DbErr,
    EntityTrait, QueryFilter, QueryOrder, Schema, Set, TransactionTrait,
};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::entity::{audit_steps, memories};

fn is_table_already_exists_error(err: &DbErr) -> bool {
    err.to_string().contains("table") && err.to_string().contains("already exists")
}

#[allow(clippy::needless_pass_by_value)]
fn store_err(err: DbErr) -> Error {
    Error::Store(err.to_string())
}

fn to_column_version(version: u64) -> Result<i64> {
    i64::try_from(version).map_err(|_| Error::InvalidMemory(format!("version {version} out of range")))
}

fn from_column_version(version: i64) -> u64 {
    u64::try_from(version).unwrap_or_default()
}

/// Memory store and audit sink sharing one connection.
#[derive(Debug, Clone)]
pub struct DatabaseStore {
    db: DatabaseConnection,
}

impl DatabaseStore {
    /// Connect and create the tables if they do not exist yet.
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        info!("Connecting to database: {}", database_url);
        let db = Database::connect(database_url).await?;
        Self::from_connection(db).await
    }

    pub async fn from_connection(db: DatabaseConnection) -> anyhow::Result<Self> {
        let backend = db.get_database_backend();
        let schema = Schema::new(backend);
        let statements = [
            schema.create_table_from_entity(memories::Entity),
            schema.create_table_from_entity(audit_steps::Entity),
        ];
        for stmt in &statements {
            match db.execute_unprepared(&backend.build(stmt).to_string()).await {
                Ok(_) => {}
                Err(e) if is_table_already_exists_error(&e) => {
                    info!("Table already exists, skipping creation");
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!("DatabaseStore initialized");
        Ok(Self { db })
    }

    #[must_use]
    pub const fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    fn memory_from_model(model: memories::Model) -> Result<Memory> {
        let mut memory: Memory = serde_json::from_str(&model.payload)?;
        memory.version = from_column_version(model.version);
        memory.archived = model.archived;
        Ok(memory)
    }

    /// Columns shared by inserts and updates. `id` and `created_at` are left unset.
    fn memory_columns(memory: &Memory, version: i64) -> Result<memories::ActiveModel> {
        Ok(memories::ActiveModel {
            id: NotSet,
            vendor_id: Set(memory.vendor_id().map(str::to_string)),
            memory_type: Set(memory.memory_type().as_str().to_string()),
            confidence: Set(memory.confidence),
            archived: Set(memory.archived),
            version: Set(version),
            payload: Set(serde_json::to_string(memory)?),
            created_at: NotSet,
            updated_at: Set(Utc::now()),
        })
    }

    fn step_model(step: &AuditStep) -> Result<audit_steps::ActiveModel> {
        if step.id.trim().is_empty() {
            return Err(Error::Store("audit step without id".to_string()));
        }
        Ok(audit_steps::ActiveModel {
            seq: NotSet,
            step_id: Set(step.id.clone()),
            invoice_id: Set(step.trail_key().to_string()),
            timestamp: Set(step.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)),
            operation: Set(step.operation.as_str().to_string()),
            description: Set(step.description.clone()),
            input: Set(serde_json::to_string(&step.input)?),
            output: Set(serde_json::to_string(&step.output)?),
            actor: Set(step.actor.clone()),
            duration: Set(i64::try_from(step.duration).unwrap_or(i64::MAX)),
        })
    }

    fn step_from_model(model: audit_steps::Model) -> Result<AuditStep> {
        let timestamp = DateTime::parse_from_rfc3339(&model.timestamp)
            .map_err(|e| Error::Store(format!("bad audit timestamp '{}': {e}", model.timestamp)))?
            .with_timezone(&Utc);
        Ok(AuditStep {
            id: model.step_id,
            timestamp,
            operation: model.operation.parse::<AuditOperation>()?,
            description: model.description,
            input: serde_json::from_str::<Map<String, Value>>(&model.input)?,
            output: serde_json::from_str::<Map<String, Value>>(&model.output)?,
            actor: model.actor,
            duration: u64::try_from(model.duration).unwrap_or_default(),
        })
    }
}

#[async_trait]
impl MemoryStore for DatabaseStore {
    async fn find_memories_by_vendor(&self, vendor_id: &str) -> Result<Vec<Memory>> {
        let models = memories::Entity::find()
            .filter(memories::Column::Archived.eq(false))
            .filter(
                sea_orm::Condition::any()
                    .add(memories::Column::VendorId.eq(vendor_id))
                    .add(memories::Column::VendorId.is_null()),
            )
            .order_by_asc(memories::Column::CreatedAt)
            .order_by_asc(memories::Column::Id)
            .all(&self.db)
            .await
            .map_err(store_err)?;
        models.into_iter().map(Self::memory_from_model).collect()
    }

    async fn list_memories_by_vendor(&self, vendor_id: &str) -> Result<Vec<Memory>> {
        let models = memories::Entity::find()
            .filter(memories::Column::VendorId.eq(vendor_id))
            .order_by_asc(memories::Column::CreatedAt)
            .order_by_asc(memories::Column::Id)
            .all(&self.db)
            .await
            .map_err(store_err)?;
        models.into_iter().map(Self::memory_from_model).collect()
    }

    async fn find_memory(&self, id: &str) -> Result<Option<Memory>> {
        memories::Entity::find_by_id(id.to_owned())
            .one(&self.db)
            .await
            .map_err(store_err)?
            .map(Self::memory_from_model)
            .transpose()
    }

    async fn save_memory(&self, memory: &Memory) -> Result<()> {
        let existing = memories::Entity::find_by_id(memory.id.clone())
            .one(&self.db)
            .await
            .map_err(store_err)?;

        if let Some(row) = existing {
            let mut model = Self::memory_columns(memory, row.version + 1)?;
            model.id = Set(row.id);
            model.update(&self.db).await.map_err(store_err)?;
        } else {
            let mut model = Self::memory_columns(memory, to_column_version(memory.version)?)?;
            model.id = Set(memory.id.clone());
            model.created_at = Set(memory.created_at);
            memories::Entity::insert(model)
                .exec(&self.db)
                .await
                .map_err(store_err)?;
        }
        debug!(memory_id = %memory.id, "Saved memory");
        Ok(())
    }

    async fn update_memory(&self, memory: &Memory) -> Result<u64> {
        let expected = to_column_version(memory.version)?;
        let next = expected + 1;
        let updated = memories::Entity::update_many()
            .set(Self::memory_columns(memory, next)?)
            .filter(memories::Column::Id.eq(memory.id.as_str()))
            .filter(memories::Column::Version.eq(expected))
            .exec(&self.db)
            .await
            .map_err(store_err)?;

        if updated.rows_affected == 1 {
            return Ok(from_column_version(next));
        }
        match memories::Entity::find_by_id(memory.id.clone())
            .one(&self.db)
            .await
            .map_err(store_err)?
        {
            None => Err(Error::NotFound(memory.id.clone())),
            Some(row) => Err(Error::VersionConflict {
                id: memory.id.clone(),
                expected: memory.version,
                actual: from_column_version(row.version),
            }),
        }
    }
}

#[async_trait]
impl AuditSink for DatabaseStore {
    async fn record_audit_step(&self, step: &AuditStep) -> Result<()> {
        audit_steps::Entity::insert(Self::step_model(step)?)
            .exec(&self.db)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn record_audit_steps(&self, steps: &[AuditStep]) -> Result<()> {
        if steps.is_empty() {
            return Ok(());
        }
        let models = steps
            .iter()
            .map(Self::step_model)
            .collect::<Result<Vec<_>>>()?;

        let txn = self.db.begin().await.map_err(store_err)?;
        for model in models {
            if let Err(e) = audit_steps::Entity::insert(model).exec(&txn).await {
                warn!(error = %e, "Audit batch rejected, rolling back");
                txn.rollback().await.map_err(store_err)?;
                return Err(store_err(e));
            }
        }
        txn.commit().await.map_err(store_err)?;
        debug!(count = steps.len(), "Recorded audit batch");
        Ok(())
    }

    async fn get_audit_trail(&self, invoice_id: &str) -> Result<Vec<AuditStep>> {
        audit_steps::Entity::find()
            .filter(audit_steps::Column::InvoiceId.eq(invoice_id))
            .order_by_asc(audit_steps::Column::Seq)
            .all(&self.db)
            .await
            .map_err(store_err)?
            .into_iter()
            .map(Self::step_from_model)
            .collect()
    }
}
