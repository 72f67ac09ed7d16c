//! Persisted skill memory.

use std::sync::Arc;

use async_trait::async_trait;
use warden_core::SkillMemory;

use crate::store::{get_json, DurableStore, StoreError};

/// Where approved corrections land.
#[async_trait]
pub trait SkillStore: Send + Sync {
    async fn load(&self, skill_name: &str) -> Result<Option<SkillMemory>, StoreError>;

    async fn save(&self, memory: &SkillMemory) -> Result<(), StoreError>;
}

/// Skill memory under `skills/{name}` in the durable store.
#[derive(Clone)]
pub struct DurableSkillStore {
    store: Arc<dyn DurableStore>,
}

impl DurableSkillStore {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }

    fn key(skill_name: &str) -> String {
        format!("skills/{}", skill_name)
    }
}

#[async_trait]
impl SkillStore for DurableSkillStore {
    async fn load(&self, skill_name: &str) -> Result<Option<SkillMemory>, StoreError> {
        get_json(self.store.as_ref(), &Self::key(skill_name)).await
    }

    async fn save(&self, memory: &SkillMemory) -> Result<(), StoreError> {
        let value = serde_json::to_value(memory)?;
        self.store
            .set(&Self::key(&memory.skill_name), value, None)
            .await?;
        tracing::info!(
            skill = %memory.skill_name,
            revision = memory.revision,
            "Skill memory saved"
        );
        Ok(())
    }
}
