//! Component lifecycle container.
//!
//! Everything long-lived that must be released at exit registers here. The
//! container asks each component to shut down exactly once, keeps going
//! past failures, and reports them all together.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::errors::{BoxError, ShutdownError};
use crate::errors::ErrorList;

/// Anything with a description and a shutdown.
#[async_trait]
pub trait Component: Send + Sync {
    fn describe(&self) -> String;
    async fn shutdown(&self) -> Result<(), BoxError>;
}

/// Append-only registry of components behind one coarse lock.
pub struct ComponentContainer {
    name: String,
    components: Mutex<Vec<Arc<dyn Component>>>,
}

impl ComponentContainer {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            components: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, component: Arc<dyn Component>) {
        match self.components.lock() {
            Ok(mut list) => list.push(component),
            Err(poisoned) => poisoned.into_inner().push(component),
        }
    }

    pub fn len(&self) -> usize {
        self.components.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shut down every registered component in registration order, then
    /// clear the registry. A second call finds nothing to do.
    pub async fn shutdown_all(&self) -> Result<(), ErrorList<ShutdownError>> {
        // Taken under the lock; the async shutdowns run without holding it.
        let components = match self.components.lock() {
            Ok(mut list) => std::mem::take(&mut *list),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };

        let mut errors = ErrorList::new();
        for component in components {
            let description = component.describe();
            match component.shutdown().await {
                Ok(()) => tracing::debug!(component = %description, "component shut down"),
                Err(source) => {
                    tracing::warn!(component = %description, error = %source, "component shutdown failed");
                    errors.push(ShutdownError {
                        component: description,
                        source,
                    });
                }
            }
        }
        errors.into_result()
    }
}

#[async_trait]
impl Component for ComponentContainer {
    fn describe(&self) -> String {
        self.name.clone()
    }

    async fn shutdown(&self) -> Result<(), BoxError> {
        self.shutdown_all().await.map_err(|e| Box::new(e) as BoxError)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
