//! Step workload trait and workload registry.
//!
//! A workload performs the actual unit of work of a plain step (calling a
//! model, a tool, a retrieval backend, ...). The pipeline only builds the
//! step's input, awaits the workload, and records what it returns.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use stepflow_types::Result;

use crate::node::StepNode;
use crate::settings::RunSettings;

/// Run-scoped data handed to every workload invocation.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    /// Session/thread correlation id of the run.
    pub thread_id: String,
    /// Agent id of the workflow.
    pub namespace: String,
    pub settings: RunSettings,
}

// ---------------------------------------------------------------------------
// StepWorkload trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait StepWorkload: Send + Sync {
    /// The workload type this implementation serves (e.g. "sdk", "rag").
    fn workload_type(&self) -> &str;

    /// Perform one visit of `step`. Called once per visit; must not hold on
    /// to `input` beyond the call.
    async fn invoke(
        &self,
        step: &StepNode,
        input: &Map<String, Value>,
        session: &SessionContext,
    ) -> Result<Value>;
}

// ---------------------------------------------------------------------------
// WorkloadRegistry
// ---------------------------------------------------------------------------

#[derive(Default, Clone)]
pub struct WorkloadRegistry {
    workloads: HashMap<String, Arc<dyn StepWorkload>>,
    fallback: Option<Arc<dyn StepWorkload>>,
}

impl WorkloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, workload: impl StepWorkload + 'static) {
        let t = workload.workload_type().to_string();
        self.workloads.insert(t, Arc::new(workload));
    }

    /// Register `workload` under an explicit type name.
    pub fn register_as(&mut self, workload_type: impl Into<String>, workload: Arc<dyn StepWorkload>) {
        self.workloads.insert(workload_type.into(), workload);
    }

    /// Used for any workload type without a registered workload.
    pub fn with_fallback(mut self, workload: impl StepWorkload + 'static) -> Self {
        self.fallback = Some(Arc::new(workload));
        self
    }

    pub fn resolve(&self, workload_type: &str) -> Option<Arc<dyn StepWorkload>> {
        self.workloads
            .get(workload_type)
            .or(self.fallback.as_ref())
            .cloned()
    }

    pub fn has(&self, workload_type: &str) -> bool {
        self.workloads.contains_key(workload_type)
    }
}

impl std::fmt::Debug for WorkloadRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.workloads.keys().collect();
        types.sort();
        f.debug_struct("WorkloadRegistry")
            .field("workloads", &types)
            .field("fallback", &self.fallback.as_ref().map(|w| w.workload_type().to_string()))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Built-in workloads
// ---------------------------------------------------------------------------

/// Returns the step input unchanged. Useful for dry runs.
pub struct EchoWorkload;

#[async_trait]
impl StepWorkload for EchoWorkload {
    fn workload_type(&self) -> &str {
        "echo"
    }

    async fn invoke(
        &self,
        _step: &StepNode,
        input: &Map<String, Value>,
        _session: &SessionContext,
    ) -> Result<Value> {
        Ok(Value::Object(input.clone()))
    }
}

/// A registry that echoes every step.
pub fn default_registry() -> WorkloadRegistry {
    let mut reg = WorkloadRegistry::new();
    reg.register(EchoWorkload);
    reg.with_fallback(EchoWorkload)
}
