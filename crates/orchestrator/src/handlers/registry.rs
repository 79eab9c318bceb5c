use dashmap::DashMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::{HandlerDescriptor, HandlerStatus, ManagedHandler};
use crate::request::Request;

/// Managed handlers by name
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<ManagedHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any handler with the same name
    pub fn register(&self, handler: Arc<ManagedHandler>) -> Option<Arc<ManagedHandler>> {
        let name = handler.name().to_string();
        let replaced = self.handlers.insert(name.clone(), handler);
        if replaced.is_some() {
            warn!(handler = %name, "Replaced existing handler registration");
        } else {
            info!(handler = %name, "Handler registered");
        }
        replaced
    }

    pub fn get(&self, name: &str) -> Option<Arc<ManagedHandler>> {
        self.handlers.get(name).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, name: &str) -> Option<Arc<ManagedHandler>> {
        self.handlers.remove(name).map(|(_, handler)| handler)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// All handlers, sorted by name
    pub fn all(&self) -> Vec<Arc<ManagedHandler>> {
        let mut handlers: Vec<_> = self
            .handlers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        handlers.sort_by(|a, b| a.name().cmp(b.name()));
        handlers
    }

    /// Descriptors of handlers that accept `request`, sorted by name
    pub fn available_for(&self, request: &Request) -> Vec<HandlerDescriptor> {
        self.all()
            .into_iter()
            .filter(|handler| handler.can_handle(request))
            .map(|handler| handler.descriptor())
            .collect()
    }

    pub fn descriptors(&self) -> Vec<HandlerDescriptor> {
        self.all().iter().map(|handler| handler.descriptor()).collect()
    }

    pub fn statuses(&self) -> Vec<HandlerStatus> {
        self.all().iter().map(|handler| handler.status()).collect()
    }
}
