//! Step handler registry
//!
//! The registry maps step names to handlers. Workers resolve the handler of
//! every claimed step here by exact name match.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::formatter::StateFormatter;
use crate::step::{ExecutionResult, Step, StepError};

/// Everything a handler gets to see of the step it executes
pub struct StepContext {
    step: Step,
    formatter: Arc<dyn StateFormatter>,
    worker_id: String,
}

impl StepContext {
    pub fn new(step: Step, formatter: Arc<dyn StateFormatter>, worker_id: impl Into<String>) -> Self {
        Self {
            step,
            formatter,
            worker_id: worker_id.into(),
        }
    }

    /// The claimed step, with this execution already counted
    pub fn step(&self) -> &Step {
        &self.step
    }

    pub fn into_step(self) -> Step {
        self.step
    }

    /// Identity of the executing worker
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn formatter(&self) -> &dyn StateFormatter {
        self.formatter.as_ref()
    }

    /// Decode the step state
    pub fn state<T: DeserializeOwned>(&self) -> Result<T, StepError> {
        Ok(self.formatter().decode_opt(self.step.state.as_deref())?)
    }

    /// Decode the arguments of the last activation
    pub fn activation_args<T: DeserializeOwned>(&self) -> Result<T, StepError> {
        Ok(self
            .formatter()
            .decode_opt(self.step.activation_args.as_deref())?)
    }
}

impl fmt::Debug for StepContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepContext")
            .field("step", &self.step)
            .field("formatter", &self.formatter.name())
            .field("worker_id", &self.worker_id)
            .finish()
    }
}

/// Code that executes steps of one name
///
/// Returning `Err(StepError::FailCurrentStep)` fails the step; any other error
/// reruns it with its state unchanged.
#[async_trait]
pub trait StepHandler: Send + Sync + 'static {
    async fn execute(&self, ctx: StepContext) -> Result<ExecutionResult, StepError>;
}

/// A handler that carries the step name it serves
///
/// # Example
///
/// ```ignore
/// struct SendInvoice;
///
/// impl NamedStepHandler for SendInvoice {
///     const NAME: &'static str = "send-invoice";
/// }
///
/// registry.register_named(SendInvoice);
/// ```
pub trait NamedStepHandler: StepHandler {
    const NAME: &'static str;
}

/// Adapter for closure handlers
struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> StepHandler for FnHandler<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ExecutionResult, StepError>> + Send + 'static,
{
    async fn execute(&self, ctx: StepContext) -> Result<ExecutionResult, StepError> {
        (self.0)(ctx).await
    }
}

/// Registry of step handlers keyed by step name
#[derive(Clone, Default)]
pub struct StepHandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl StepHandlerRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `name`, replacing any earlier registration
    pub fn register(&mut self, name: impl Into<String>, handler: impl StepHandler) {
        self.register_arc(name, Arc::new(handler));
    }

    /// Register a shared handler instance
    pub fn register_arc(&mut self, name: impl Into<String>, handler: Arc<dyn StepHandler>) {
        let name = name.into();
        if self.handlers.insert(name.clone(), handler).is_some() {
            warn!(step_name = %name, "replaced step handler registration");
        }
    }

    /// Register a closure as handler
    ///
    /// # Example
    ///
    /// ```ignore
    /// registry.register_fn("OneStep", |ctx| async move {
    ///     let value: i32 = ctx.state()?;
    ///     Ok(ctx.step().done())
    /// });
    /// ```
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ExecutionResult, StepError>> + Send + 'static,
    {
        self.register(name, FnHandler(handler));
    }

    /// Register a handler under its own name
    pub fn register_named<H: NamedStepHandler>(&mut self, handler: H) {
        self.register(H::NAME, handler);
    }

    /// Find the handler for a step name
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Check if a step name has a handler
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Get the number of registered handlers
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Get all registered step names
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for StepHandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepHandlerRegistry")
            .field("names", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
