//! Command handler registry.
//!
//! Commands are registered by type string, not hardcoded in a match, so new
//! capabilities plug in without touching the dispatch core. The registry
//! makes no policy decisions about authentication, ordering, or
//! cancellation; that belongs to the client invoking it.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use serde_json::Value;

use alfred_protocol::Params;

pub mod builtin;

type HandlerFuture = Pin<Box<dyn Future<Output = Params> + Send>>;

/// A named command handler: a total async mapping from a parameter record to
/// a result record. Failures are reported through the result's `error`
/// field, never by panicking or tearing down the session.
pub type Handler = Arc<dyn Fn(Params) -> HandlerFuture + Send + Sync>;

#[derive(Default)]
pub struct Registry {
    handlers: RwLock<HashMap<String, Handler>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with the built-in handlers.
    pub fn with_builtins() -> Arc<Self> {
        let registry = Self::new();
        builtin::register_builtins(&registry);
        Arc::new(registry)
    }

    /// Add a handler for a command type, replacing any previous one.
    pub fn register<F, Fut>(&self, kind: impl Into<String>, handler: F)
    where
        F: Fn(Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Params> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |params| Box::pin(handler(params)));
        self.handlers.write().unwrap().insert(kind.into(), handler);
    }

    /// Run the handler for a command type. An unknown type synthesizes a
    /// failure result rather than erroring.
    pub async fn handle(&self, kind: &str, params: Params) -> Params {
        let handler = self.handlers.read().unwrap().get(kind).cloned();
        match handler {
            Some(handler) => handler(params).await,
            None => failure(format!("unknown command type: {kind}")),
        }
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.read().unwrap().contains_key(kind)
    }

    /// Registered command types, sorted for stable display.
    pub fn list(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.handlers.read().unwrap().keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

/// A failed result record.
pub fn failure(error: impl Into<String>) -> Params {
    let mut result = Params::new();
    result.insert("success".into(), Value::Bool(false));
    result.insert("error".into(), Value::String(error.into()));
    result
}

/// A successful result record; handlers add their own fields to it.
pub fn success() -> Params {
    let mut result = Params::new();
    result.insert("success".into(), Value::Bool(true));
    result
}
