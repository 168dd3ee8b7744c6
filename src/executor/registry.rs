//! Stage registry: stage name → executor.
//!
//! Supports direct registration of constructed executors and lazy
//! factories resolved on first lookup. The registry is assembled once at
//! controller construction and not mutated afterwards; a missing stage is
//! reported by the controller as a stage failure, never a panic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::StageExecutor;
use super::llm::{GenericLlmStage, LlmExecutor};
use crate::llm::LlmProvider;
use crate::stage::Stage;

type ExecutorFactory = Box<dyn Fn() -> Arc<dyn StageExecutor> + Send + Sync>;

#[derive(Default)]
pub struct StageRegistry {
    factories: HashMap<Stage, ExecutorFactory>,
    resolved: Mutex<HashMap<Stage, Arc<dyn StageExecutor>>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructed executor.
    pub fn register(&mut self, stage: Stage, executor: Arc<dyn StageExecutor>) {
        self.resolved
            .lock()
            .expect("registry lock poisoned")
            .insert(stage, executor);
        self.factories.remove(&stage);
    }

    /// Register a factory built lazily on first lookup.
    pub fn register_factory<F>(&mut self, stage: Stage, factory: F)
    where
        F: Fn() -> Arc<dyn StageExecutor> + Send + Sync + 'static,
    {
        self.factories.insert(stage, Box::new(factory));
        self.resolved
            .lock()
            .expect("registry lock poisoned")
            .remove(&stage);
    }

    /// Look up the executor for a stage. O(1); `None` when nothing is
    /// registered under the name.
    pub fn get(&self, stage: Stage) -> Option<Arc<dyn StageExecutor>> {
        let mut resolved = self.resolved.lock().expect("registry lock poisoned");
        if let Some(executor) = resolved.get(&stage) {
            return Some(executor.clone());
        }
        let executor = self.factories.get(&stage)?();
        resolved.insert(stage, executor.clone());
        Some(executor)
    }

    pub fn registered_stages(&self) -> Vec<Stage> {
        let resolved = self.resolved.lock().expect("registry lock poisoned");
        let mut stages: Vec<Stage> = Stage::all()
            .iter()
            .filter(|s| resolved.contains_key(*s) || self.factories.contains_key(*s))
            .copied()
            .collect();
        stages.dedup();
        stages
    }

    /// Registry with a generic LLM executor behind every stage — the
    /// default wiring when no bespoke executors are installed.
    pub fn with_llm_defaults(provider: Arc<dyn LlmProvider>) -> Self {
        let mut registry = Self::new();
        for stage in Stage::all() {
            let stage = *stage;
            let provider = provider.clone();
            registry.register_factory(stage, move || {
                Arc::new(LlmExecutor::new(GenericLlmStage::new(stage), provider.clone()))
            });
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedProvider;

    #[test]
    fn test_empty_registry_returns_none() {
        let registry = StageRegistry::new();
        assert!(registry.get(Stage::Intake).is_none());
    }

    #[test]
    fn test_factory_resolves_lazily_and_caches() {
        use std::sync::atomic::{AtomicU32, Ordering};
        static BUILT: AtomicU32 = AtomicU32::new(0);

        let provider: Arc<dyn LlmProvider> = Arc::new(ScriptedProvider::new(vec![]));
        let mut registry = StageRegistry::new();
        let p = provider.clone();
        registry.register_factory(Stage::Intake, move || {
            BUILT.fetch_add(1, Ordering::SeqCst);
            Arc::new(LlmExecutor::new(GenericLlmStage::new(Stage::Intake), p.clone()))
        });

        assert_eq!(BUILT.load(Ordering::SeqCst), 0);
        registry.get(Stage::Intake).unwrap();
        registry.get(Stage::Intake).unwrap();
        assert_eq!(BUILT.load(Ordering::SeqCst), 1, "factory must run once");
    }

    #[test]
    fn test_llm_defaults_cover_all_stages() {
        let provider: Arc<dyn LlmProvider> = Arc::new(ScriptedProvider::new(vec![]));
        let registry = StageRegistry::with_llm_defaults(provider);
        for stage in Stage::all() {
            let executor = registry.get(*stage).unwrap();
            assert_eq!(executor.descriptor().stage, *stage);
        }
        assert_eq!(registry.registered_stages().len(), 8);
    }

    #[test]
    fn test_direct_registration_overrides_factory() {
        let provider: Arc<dyn LlmProvider> = Arc::new(ScriptedProvider::new(vec![]));
        let mut registry = StageRegistry::with_llm_defaults(provider.clone());
        let replacement: Arc<dyn StageExecutor> = Arc::new(LlmExecutor::new(
            GenericLlmStage::new(Stage::Spec),
            provider,
        ));
        registry.register(Stage::Spec, replacement.clone());
        let looked_up = registry.get(Stage::Spec).unwrap();
        assert!(Arc::ptr_eq(&looked_up, &replacement));
    }
}
