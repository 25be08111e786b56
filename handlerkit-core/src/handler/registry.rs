//! Name → handler store backing the registry backend
//!
//! The registry is constructed explicitly, populated at startup and shared
//! by reference (`Arc<HandlerRegistry>`). Entries are never removed
//! automatically.

use super::tool::ToolHandler;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Registry errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A handler with this name already exists
    Duplicate(String),
    /// No handler with this name
    NotFound(String),
    /// Name is empty or otherwise unusable
    InvalidName(String),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::Duplicate(name) => {
                write!(f, "Handler '{}' is already registered", name)
            }
            RegistryError::NotFound(name) => {
                write!(f, "Handler '{}' not found", name)
            }
            RegistryError::InvalidName(name) => {
                write!(f, "Invalid handler name '{}'", name)
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Registry of named handlers
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, ToolHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler
    ///
    /// Fails if a handler with the same name already exists.
    pub fn register(&self, name: impl Into<String>, handler: ToolHandler) -> Result<(), RegistryError> {
        let name = validate_name(name.into())?;
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        tracing::debug!(handler = %name, "Registered handler");
        handlers.insert(name, handler);
        Ok(())
    }

    /// Register or overwrite a handler, returning the previous one
    pub fn replace(
        &self,
        name: impl Into<String>,
        handler: ToolHandler,
    ) -> Result<Option<ToolHandler>, RegistryError> {
        let name = validate_name(name.into())?;
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let previous = handlers.insert(name.clone(), handler);
        if previous.is_some() {
            tracing::debug!(handler = %name, "Replaced handler");
        }
        Ok(previous)
    }

    /// Get a handler by name
    pub fn get(&self, name: &str) -> Option<ToolHandler> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Get a handler by name, failing with `NotFound`
    pub fn require(&self, name: &str) -> Result<ToolHandler, RegistryError> {
        self.get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Check if a handler is registered
    pub fn contains(&self, name: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

fn validate_name(name: String) -> Result<String, RegistryError> {
    if name.trim().is_empty() {
        return Err(RegistryError::InvalidName(name));
    }
    Ok(name)
}
