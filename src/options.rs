// src/options.rs
// Engine options shared by queries and aggregation pipelines.

use std::collections::HashMap;
use std::sync::Arc;

use bson::{Bson, Document};

use crate::collation::Collation;
use crate::error::{Result, SiftError};

/// How input documents are treated on their way through a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessingMode {
    /// Borrow the caller's documents; the engine materializes copies only
    /// at the output boundary. Caller memory is never mutated.
    CloneOff,
    /// Deep-copy every document at ingress.
    CloneInput,
    /// Borrow until a stage first writes to a document, then copy.
    #[default]
    CopyInput,
}

/// Host-provided evaluator backing `$where` and `$function`.
///
/// The engine never embeds a script runtime; embedders that want
/// script-valued operators supply one and flip `script_enabled`.
pub trait ScriptEvaluator: Send + Sync {
    /// Evaluate `source` with the given arguments. For `$where` the single
    /// argument is the candidate document; truthiness of the returned value
    /// decides the match.
    fn call(&self, source: &str, args: &[Bson]) -> Result<Bson>;
}

/// A caller-registered expression operator. Arguments arrive evaluated, in
/// positional order.
pub type CustomOperator = Arc<dyn Fn(&[Bson]) -> Result<Bson> + Send + Sync>;

/// Named in-memory collections visible to `$lookup`, `$graphLookup`,
/// `$unionWith`-style stages through their `from` field.
#[derive(Clone, Default)]
pub struct Context {
    collections: HashMap<String, Arc<Vec<Document>>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a named collection.
    pub fn insert(&mut self, name: impl Into<String>, docs: Vec<Document>) {
        self.collections.insert(name.into(), Arc::new(docs));
    }

    pub fn collection(&self, name: &str) -> Option<Arc<Vec<Document>>> {
        self.collections.get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("collections", &self.collections.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Options accepted by every engine entry point.
#[derive(Clone)]
pub struct Options {
    pub collation: Option<Collation>,
    pub processing_mode: ProcessingMode,
    /// Name of the identity field, `_id` unless overridden.
    pub id_key: String,
    /// Pre-populated `$$variable` bindings.
    pub variables: HashMap<String, Bson>,
    /// Gate for `$where` / `$function`.
    pub script_enabled: bool,
    pub context: Context,
    custom_operators: HashMap<String, CustomOperator>,
    script_evaluator: Option<Arc<dyn ScriptEvaluator>>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            collation: None,
            processing_mode: ProcessingMode::default(),
            id_key: "_id".to_string(),
            variables: HashMap::new(),
            script_enabled: false,
            context: Context::new(),
            custom_operators: HashMap::new(),
            script_evaluator: None,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collation(mut self, collation: Collation) -> Self {
        self.collation = Some(collation);
        self
    }

    pub fn with_processing_mode(mut self, mode: ProcessingMode) -> Self {
        self.processing_mode = mode;
        self
    }

    pub fn with_id_key(mut self, id_key: impl Into<String>) -> Self {
        self.id_key = id_key.into();
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Bson) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    /// Register a named collection for `$lookup`-family stages.
    pub fn with_collection(mut self, name: impl Into<String>, docs: Vec<Document>) -> Self {
        self.context.insert(name, docs);
        self
    }

    /// Register a custom expression operator. Names must start with `$`.
    pub fn with_operator(
        mut self,
        name: impl Into<String>,
        operator: CustomOperator,
    ) -> Self {
        self.custom_operators.insert(name.into(), operator);
        self
    }

    pub fn with_scripts_enabled(mut self, enabled: bool) -> Self {
        self.script_enabled = enabled;
        self
    }

    pub fn with_script_evaluator(mut self, evaluator: Arc<dyn ScriptEvaluator>) -> Self {
        self.script_evaluator = Some(evaluator);
        self
    }

    pub(crate) fn custom_operator(&self, name: &str) -> Option<&CustomOperator> {
        self.custom_operators.get(name)
    }

    /// The script hook, or the reason it is unavailable. Both the flag and
    /// the hook are required; checking happens at construction time so
    /// script-disabled specs fail before any document is pulled.
    pub(crate) fn script(&self, operator: &'static str) -> Result<&Arc<dyn ScriptEvaluator>> {
        if !self.script_enabled {
            return Err(SiftError::ScriptDisabled(operator));
        }
        self.script_evaluator
            .as_ref()
            .ok_or(SiftError::ScriptDisabled(operator))
    }

    pub(crate) fn collation(&self) -> Option<&Collation> {
        self.collation.as_ref()
    }
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("collation", &self.collation)
            .field("processing_mode", &self.processing_mode)
            .field("id_key", &self.id_key)
            .field("variables", &self.variables.keys().collect::<Vec<_>>())
            .field("script_enabled", &self.script_enabled)
            .field("context", &self.context)
            .field(
                "custom_operators",
                &self.custom_operators.keys().collect::<Vec<_>>(),
            )
            .finish()
    }
}
