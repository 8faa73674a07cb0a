use shared::EventKind;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use crate::handlers::EventHandler;

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("no handler registered for subscribed event type {0}")]
    MissingHandler(String),
    #[error("handler {handler} registered twice for {kind}")]
    Duplicate { kind: String, handler: &'static str },
}

/// Ordered handler chains keyed by event kind, plus a chain that runs
/// after the specific handlers of every event.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<EventKind, Vec<Arc<dyn EventHandler>>>,
    every_event: Vec<Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: EventKind, handler: Arc<dyn EventHandler>) -> &mut Self {
        self.handlers.entry(kind).or_default().push(handler);
        self
    }

    pub fn register_for_all(&mut self, handler: Arc<dyn EventHandler>) -> &mut Self {
        self.every_event.push(handler);
        self
    }

    pub fn handlers_for(&self, kind: &EventKind) -> Vec<Arc<dyn EventHandler>> {
        self.handlers
            .get(kind)
            .into_iter()
            .flatten()
            .chain(self.every_event.iter())
            .cloned()
            .collect()
    }

    /// Run once at startup, before the dispatcher is built.
    pub fn validate(&self, subscribed: &[EventKind]) -> Result<(), RegistryError> {
        for kind in subscribed {
            if self.handlers.get(kind).map_or(true, |chain| chain.is_empty()) {
                return Err(RegistryError::MissingHandler(kind.to_string()));
            }
        }

        for (kind, chain) in self.handlers.iter().map(|(k, c)| (k, c.iter().chain(self.every_event.iter()))) {
            let mut seen = Vec::new();
            for handler in chain {
                if seen.contains(&handler.name()) {
                    return Err(RegistryError::Duplicate {
                        kind: kind.to_string(),
                        handler: handler.name(),
                    });
                }
                seen.push(handler.name());
            }
        }

        Ok(())
    }
}
