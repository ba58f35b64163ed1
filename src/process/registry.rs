/// Versioned process definition registry using ArcSwap
///
/// Holds every deployed definition, compiled and ready to execute. Reads are
/// lock-free; a deploy clones the map, adds the new versions and swaps the
/// pointer, so running instances never block on a deployment.

use crate::error::{EngineError, EngineResult};
use crate::process::graph::ProcessGraph;
use crate::process::parser;
use crate::process::types::{Deployment, ProcessDefinition};
use crate::storage::ProcessStorage;
use arc_swap::ArcSwap;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Definition plus its compiled graph
#[derive(Debug)]
pub struct CompiledDefinition {
    pub definition: ProcessDefinition,
    pub graph: ProcessGraph,
}

impl CompiledDefinition {
    fn compile(definition: ProcessDefinition) -> EngineResult<Self> {
        let graph = ProcessGraph::build(&definition.model)?;
        Ok(Self { definition, graph })
    }
}

/// Lock-free definition store
#[derive(Debug)]
pub struct DefinitionRegistry {
    /// Key: definition id, Value: compiled definition
    definitions: ArcSwap<HashMap<String, Arc<CompiledDefinition>>>,

    /// Persistent storage for deployments
    storage: ProcessStorage,

    /// Serializes version assignment across concurrent deploys
    deploy_lock: Mutex<()>,
}

impl DefinitionRegistry {
    pub fn new(storage: ProcessStorage) -> Self {
        Self {
            definitions: ArcSwap::new(Arc::new(HashMap::new())),
            storage,
            deploy_lock: Mutex::new(()),
        }
    }

    /// Load every persisted definition into memory
    ///
    /// Called during application startup.
    pub async fn init_from_storage(&self) -> anyhow::Result<()> {
        let stored = self.storage.load_definitions().await?;
        let mut compiled = HashMap::with_capacity(stored.len());

        for definition in stored {
            let id = definition.id.clone();
            let entry = CompiledDefinition::compile(definition)
                .map_err(|e| anyhow::anyhow!("Stored definition '{}' no longer compiles: {}", id, e))?;
            compiled.insert(id, Arc::new(entry));
        }

        self.definitions.store(Arc::new(compiled));
        tracing::info!(
            "📥 Initialized definition registry with {} definitions",
            self.definitions.load().len()
        );
        Ok(())
    }

    /// Deploy a resource (BPMN XML or JSON)
    ///
    /// Every process in the resource becomes a new definition whose version is
    /// one above the highest deployed version of the same key.
    pub async fn deploy(&self, name: &str, bytes: &[u8]) -> EngineResult<Deployment> {
        tracing::info!("📦 Deploying resource '{}' ({} bytes)", name, bytes.len());

        let models = parser::parse_resource(bytes)?;

        let mut keys = HashSet::new();
        for model in &models {
            if !keys.insert(model.key.as_str()) {
                return Err(EngineError::Parse(format!(
                    "process key '{}' is defined twice in '{}'",
                    model.key, name
                )));
            }
            // Validate before taking the lock; compiled again below with the final ids
            ProcessGraph::build(model)?;
        }

        let _guard = self.deploy_lock.lock().await;

        let deployment = Deployment {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            deploy_time: chrono::Utc::now(),
        };

        let current = self.definitions.load_full();
        let mut compiled = Vec::with_capacity(models.len());
        for model in models {
            let version = current
                .values()
                .filter(|entry| entry.definition.key == model.key)
                .map(|entry| entry.definition.version)
                .max()
                .unwrap_or(0)
                + 1;

            let definition = ProcessDefinition {
                id: ProcessDefinition::definition_id(&model.key, version, &deployment.id),
                key: model.key.clone(),
                version,
                name: model.name.clone(),
                description: model.description.clone(),
                resource_name: name.to_string(),
                deployment_id: deployment.id.clone(),
                suspended: false,
                model,
            };
            compiled.push(CompiledDefinition::compile(definition)?);
        }

        let definitions: Vec<ProcessDefinition> =
            compiled.iter().map(|entry| entry.definition.clone()).collect();
        self.storage.save_deployment(&deployment, &definitions).await?;

        let mut next = (*current).clone();
        for entry in compiled {
            tracing::info!(
                "🔥 Deployed process '{}' version {} as {}",
                entry.definition.key,
                entry.definition.version,
                entry.definition.id
            );
            next.insert(entry.definition.id.clone(), Arc::new(entry));
        }
        self.definitions.store(Arc::new(next));

        Ok(deployment)
    }

    /// Highest version deployed under `key`
    pub fn latest(&self, key: &str) -> EngineResult<Arc<CompiledDefinition>> {
        self.definitions
            .load()
            .values()
            .filter(|entry| entry.definition.key == key)
            .max_by_key(|entry| entry.definition.version)
            .cloned()
            .ok_or_else(|| EngineError::DefinitionNotFound(key.to_string()))
    }

    /// Definition by id (any version)
    pub fn get(&self, definition_id: &str) -> EngineResult<Arc<CompiledDefinition>> {
        self.definitions
            .load()
            .get(definition_id)
            .cloned()
            .ok_or_else(|| EngineError::DefinitionNotFound(definition_id.to_string()))
    }

    /// Latest version of every key, ordered by key ascending
    pub fn list_latest_per_key(&self) -> Vec<Arc<CompiledDefinition>> {
        let mut latest: BTreeMap<String, Arc<CompiledDefinition>> = BTreeMap::new();

        for entry in self.definitions.load().values() {
            let key = &entry.definition.key;
            let newer = latest
                .get(key)
                .map_or(true, |seen| seen.definition.version < entry.definition.version);
            if newer {
                latest.insert(key.clone(), Arc::clone(entry));
            }
        }

        latest.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &str = r#"{
        "key": "approval",
        "name": "Approval",
        "nodes": [
            {"id": "start", "type": "startEvent"},
            {"id": "approve", "type": "userTask", "assignee": "${startUserId}"},
            {"id": "end", "type": "endEvent"}
        ],
        "flows": [
            {"id": "f1", "source": "start", "target": "approve"},
            {"id": "f2", "source": "approve", "target": "end"}
        ]
    }"#;

    async fn registry() -> DefinitionRegistry {
        DefinitionRegistry::new(ProcessStorage::in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn redeploying_a_key_bumps_the_version() {
        let registry = registry().await;

        let first = registry.deploy("approval.json", SIMPLE.as_bytes()).await.unwrap();
        assert_eq!(registry.latest("approval").unwrap().definition.version, 1);

        let second = registry.deploy("approval.json", SIMPLE.as_bytes()).await.unwrap();
        assert_ne!(first.id, second.id);

        let latest = registry.latest("approval").unwrap();
        assert_eq!(latest.definition.version, 2);
        assert_eq!(latest.definition.deployment_id, second.id);

        // older version stays resolvable by id
        let v1_id = ProcessDefinition::definition_id("approval", 1, &first.id);
        assert_eq!(registry.get(&v1_id).unwrap().definition.version, 1);
    }

    #[tokio::test]
    async fn listing_returns_latest_per_key_sorted() {
        let registry = registry().await;
        let other = SIMPLE.replace("\"approval\"", "\"expense\"");

        registry.deploy("a.json", SIMPLE.as_bytes()).await.unwrap();
        registry.deploy("b.json", other.as_bytes()).await.unwrap();
        registry.deploy("a.json", SIMPLE.as_bytes()).await.unwrap();

        let listed: Vec<(String, i32)> = registry
            .list_latest_per_key()
            .iter()
            .map(|e| (e.definition.key.clone(), e.definition.version))
            .collect();
        assert_eq!(
            listed,
            vec![("approval".to_string(), 2), ("expense".to_string(), 1)]
        );
    }

    #[tokio::test]
    async fn definitions_survive_a_reload_from_storage() {
        let storage = ProcessStorage::in_memory().await.unwrap();
        let registry = DefinitionRegistry::new(storage.clone());
        registry.deploy("approval.json", SIMPLE.as_bytes()).await.unwrap();

        let reloaded = DefinitionRegistry::new(storage);
        reloaded.init_from_storage().await.unwrap();
        assert_eq!(reloaded.latest("approval").unwrap().definition.version, 1);
    }

    #[tokio::test]
    async fn concurrent_deploys_never_share_a_version() {
        let registry = Arc::new(registry().await);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.deploy("approval.json", SIMPLE.as_bytes()).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let mut versions: Vec<i32> = registry
            .definitions
            .load()
            .values()
            .map(|e| e.definition.version)
            .collect();
        versions.sort();
        assert_eq!(versions, (1..=8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn malformed_resource_is_not_stored() {
        let registry = registry().await;
        let err = registry.deploy("bad.json", b"{\"key\": \"x\", \"nodes\": []}").await.unwrap_err();
        assert!(matches!(err, EngineError::Parse(_)));
        assert!(matches!(registry.latest("x"), Err(EngineError::DefinitionNotFound(_))));
    }
}
