//! Document model registry: reducer lookup by document type.
//!
//! The registry is an explicit object constructed at startup and passed by
//! reference into the reactor and executor. There is no global lookup.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::document::{Document, DocumentState, Operation, Scope};
use crate::error::ReducerError;

/// Input to a reducer: the action to apply to one scope of a document.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub action_type: String,
    pub input: Value,
    pub scope: Scope,
}

impl Action {
    pub fn new(action_type: impl Into<String>, input: Value, scope: Scope) -> Self {
        Action {
            action_type: action_type.into(),
            input,
            scope,
        }
    }

    pub fn global(action_type: impl Into<String>, input: Value) -> Self {
        Self::new(action_type, input, Scope::Global)
    }

    pub fn local(action_type: impl Into<String>, input: Value) -> Self {
        Self::new(action_type, input, Scope::Local)
    }
}

/// What a reducer produced for one action: the next per-scope state. The
/// executor turns this into a finalized [`Operation`] record.
#[derive(Debug, Clone)]
pub struct Reduced {
    pub state: Value,
}

/// A document model: the reducer and initial state for one document type.
///
/// Reducers are pure and deterministic; they are the sole authority for the
/// resulting state (and therefore the operation hash). The core never
/// reinterprets action semantics.
pub trait DocumentModel: Send + Sync {
    fn document_type(&self) -> &str;

    fn initial_state(&self) -> DocumentState;

    /// Applies `action` to the document and returns the next state of the
    /// action's scope.
    fn reduce(&self, document: &Document, action: &Action) -> Result<Reduced, ReducerError>;
}

/// Lookup table from document type to model, built once at startup.
#[derive(Clone, Default)]
pub struct ModelRegistry {
    models: HashMap<String, Arc<dyn DocumentModel>>,
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("document_types", &self.models.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ModelRegistry {
    pub fn builder() -> ModelRegistryBuilder {
        ModelRegistryBuilder::default()
    }

    pub fn get(&self, document_type: &str) -> Result<&Arc<dyn DocumentModel>, ReducerError> {
        self.models
            .get(document_type)
            .ok_or_else(|| ReducerError::UnknownDocumentType(document_type.to_string()))
    }

    pub fn contains(&self, document_type: &str) -> bool {
        self.models.contains_key(document_type)
    }

    pub fn document_types(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(|s| s.as_str())
    }

    /// Applies the registered reducer for the document's type.
    pub fn reduce(&self, document: &Document, action: &Action) -> Result<Reduced, ReducerError> {
        self.get(&document.header.document_type)?
            .reduce(document, action)
    }
}

#[derive(Default)]
pub struct ModelRegistryBuilder {
    models: HashMap<String, Arc<dyn DocumentModel>>,
}

impl ModelRegistryBuilder {
    /// Registers a model. A later registration for the same document type
    /// replaces the earlier one.
    pub fn register(mut self, model: Arc<dyn DocumentModel>) -> Self {
        self.models.insert(model.document_type().to_string(), model);
        self
    }

    pub fn build(self) -> ModelRegistry {
        ModelRegistry {
            models: self.models,
        }
    }
}

/// Extracts an [`Operation`] record from a reduced action, hashing the
/// resulting state. `index` and `skip` are assigned by the caller.
pub fn finalize_operation(action: &Action, reduced: &Reduced, index: u64, skip: u64) -> Operation {
    Operation {
        index,
        skip,
        scope: action.scope,
        branch: crate::document::MAIN_BRANCH.to_string(),
        op_type: action.action_type.clone(),
        input: action.input.clone(),
        hash: crate::document::hash_state(&reduced.state),
        timestamp_utc_ms: crate::document::timestamp_now_ms(),
        attachments: Vec::new(),
        resulting_state: Some(reduced.state.clone()),
        context: None,
    }
}
