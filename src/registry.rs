//! Server-side handler registry.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, RpcError};
use crate::frame::MAX_SHORT_FIELD;
use crate::server::RequestContext;

/// A server-side handler. Invoked from the dispatch task with the request
/// context and a borrowed payload view; eventually calls
/// [`RequestContext::respond`] exactly once (or not at all for oneway
/// requests).
pub type Handler = Arc<dyn Fn(RequestContext, &[u8]) + Send + Sync + 'static>;

/// Mapping from method name to handler.
///
/// Registration is only permitted before the server starts; `freeze` makes
/// the registry read-only for the rest of its life.
pub struct HandlerRegistry {
    handlers: HashMap<String, Handler>,
    frozen: bool,
}

impl HandlerRegistry {
    pub fn new() -> HandlerRegistry {
        HandlerRegistry {
            handlers: HashMap::new(),
            frozen: false,
        }
    }

    /// Bind `handler` under `method`. Duplicate names are rejected with
    /// `AlreadyExists`; any registration after `freeze` fails with
    /// `InvalidState`.
    pub fn register(&mut self, method: &str, handler: Handler) -> Result<()> {
        if self.frozen {
            return Err(RpcError::InvalidState(
                "handlers cannot be registered after the server has started",
            ));
        }
        if method.is_empty() {
            return Err(RpcError::InvalidArgument("empty method name".to_string()));
        }
        if method.len() > MAX_SHORT_FIELD {
            return Err(RpcError::InvalidArgument(format!(
                "method of {} bytes exceeds the {MAX_SHORT_FIELD}-byte limit",
                method.len()
            )));
        }
        if self.handlers.contains_key(method) {
            return Err(RpcError::AlreadyExists(method.to_string()));
        }
        self.handlers.insert(method.to_string(), handler);
        Ok(())
    }

    /// Make the registry read-only.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn lookup(&self, method: &str) -> Option<Handler> {
        self.handlers.get(method).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Handler {
        Arc::new(|_ctx, _payload| {})
    }

    #[test]
    fn registers_and_looks_up() {
        let mut registry = HandlerRegistry::new();
        registry.register("echo", noop()).unwrap();
        assert!(registry.lookup("echo").is_some());
        assert!(registry.lookup("missing").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register("echo", noop()).unwrap();
        assert!(matches!(
            registry.register("echo", noop()),
            Err(RpcError::AlreadyExists(_))
        ));
    }

    #[test]
    fn registration_after_freeze_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register("echo", noop()).unwrap();
        registry.freeze();
        assert!(matches!(
            registry.register("other", noop()),
            Err(RpcError::InvalidState(_))
        ));
        // Lookups keep working on a frozen registry.
        assert!(registry.lookup("echo").is_some());
    }

    #[test]
    fn rejects_unusable_method_names() {
        let mut registry = HandlerRegistry::new();
        assert!(matches!(
            registry.register("", noop()),
            Err(RpcError::InvalidArgument(_))
        ));
        assert!(matches!(
            registry.register(&"m".repeat(256), noop()),
            Err(RpcError::InvalidArgument(_))
        ));
    }
}
