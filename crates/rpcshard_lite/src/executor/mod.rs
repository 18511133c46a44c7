//! Stateful executor instances.
//!
//! An executor *kind* (for example `DO_COUNTER`) is declared once with an
//! [`ExecutorDefinition`]. Instances of a kind are addressed by name and
//! created lazily by the [`InstanceRegistry`]; each one runs an
//! [`ExecutorAdapter`] behind a single-writer mailbox.

mod adapter;
mod registry;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::info;

use crate::procedure::ProcedureTable;
use crate::router::AddressingExtractor;

pub use adapter::{EmitReport, ExecutorAdapter, InstanceContext};
pub use registry::{InstanceHandle, InstanceRegistry, InstanceResolver};

/// Identity of one executor instance: `(kind, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceKey {
    pub kind: String,
    pub name: String,
}

impl InstanceKey {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// Everything the gateway needs to know about one executor kind.
pub struct ExecutorDefinition {
    kind: String,
    addressing: Arc<dyn AddressingExtractor>,
    procedures: Arc<ProcedureTable>,
}

impl ExecutorDefinition {
    pub fn new(
        kind: impl Into<String>,
        addressing: impl AddressingExtractor + 'static,
        procedures: ProcedureTable,
    ) -> Self {
        Self {
            kind: kind.into(),
            addressing: Arc::new(addressing),
            procedures: Arc::new(procedures),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn addressing(&self) -> &dyn AddressingExtractor {
        self.addressing.as_ref()
    }

    pub fn procedures(&self) -> &Arc<ProcedureTable> {
        &self.procedures
    }
}

impl fmt::Debug for ExecutorDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorDefinition")
            .field("kind", &self.kind)
            .field("procedures", &self.procedures.len())
            .finish()
    }
}

/// All executor kinds known to this process, keyed by namespace.
#[derive(Debug, Default)]
pub struct ExecutorCatalog {
    definitions: HashMap<String, Arc<ExecutorDefinition>>,
}

impl ExecutorCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: ExecutorDefinition) -> &mut Self {
        info!(
            kind = %definition.kind(),
            procedures = definition.procedures().len(),
            "Registered executor kind"
        );
        self.definitions
            .insert(definition.kind().to_owned(), Arc::new(definition));
        self
    }

    pub fn get(&self, kind: &str) -> Option<&Arc<ExecutorDefinition>> {
        self.definitions.get(kind)
    }
}
