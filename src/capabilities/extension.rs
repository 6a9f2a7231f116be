//! User extensions
//!
//! Extensions are registered by namespace and only booted the first time a script
//! reaches for `ext.<namespace>`. Booting publishes the extension's methods to the
//! sandbox policy.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

use super::registry::CapabilityRegistry;
use crate::engine::{Object, ObjectError, SecurityPolicy, Value};

/// Class name of the extension directory inside scripts
pub const DIRECTORY_CLASS: &str = "ext";

/// A user-supplied capability module
pub trait Extension: Send + Sync {
    /// Name under which scripts reach the extension (`ext.<namespace>`)
    fn namespace(&self) -> &str;

    /// Build the object scripts call into
    fn boot(&self) -> anyhow::Result<Arc<dyn Object>>;

    /// Declare the methods scripts may call, keyed by the booted object's class name
    fn register_methods(&self, registry: &mut CapabilityRegistry) -> anyhow::Result<()>;
}

#[derive(Debug, Error)]
pub enum ExtensionError {
    #[error("Extension \"{0}\" is not registered.")]
    NotFound(String),

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/* ===================== Directory ===================== */

/// Lazy-booting proxy over the registered extensions
pub struct ExtensionDirectory {
    extensions: HashMap<String, Arc<dyn Extension>>,
    /// Booted instances; the lock also serializes booting
    booted: Mutex<HashMap<String, Arc<dyn Object>>>,
    registry: Mutex<CapabilityRegistry>,
    policy: Arc<SecurityPolicy>,
}

impl ExtensionDirectory {
    /// `registry` should already hold the built-in capabilities, since every boot
    /// replaces the policy's method list with the registry contents.
    pub fn new(
        extensions: impl IntoIterator<Item = Arc<dyn Extension>>,
        registry: CapabilityRegistry,
        policy: Arc<SecurityPolicy>,
    ) -> Self {
        let extensions = extensions
            .into_iter()
            .map(|ext| (ext.namespace().to_string(), ext))
            .collect();

        Self {
            extensions,
            booted: Mutex::new(HashMap::new()),
            registry: Mutex::new(registry),
            policy,
        }
    }

    pub fn is_registered(&self, namespace: &str) -> bool {
        self.extensions.contains_key(namespace)
    }

    pub fn is_booted(&self, namespace: &str) -> bool {
        self.booted.lock().contains_key(namespace)
    }

    /// Registered namespaces, sorted
    pub fn namespaces(&self) -> Vec<String> {
        let mut namespaces: Vec<String> = self.extensions.keys().cloned().collect();
        namespaces.sort();
        namespaces
    }

    pub fn registry(&self) -> CapabilityRegistry {
        self.registry.lock().clone()
    }

    /// Booted instance for `namespace`, booting it on first use
    pub fn resolve(&self, namespace: &str) -> Result<Arc<dyn Object>, ExtensionError> {
        let extension = self
            .extensions
            .get(namespace)
            .ok_or_else(|| ExtensionError::NotFound(namespace.to_string()))?;

        let mut booted = self.booted.lock();
        if let Some(instance) = booted.get(namespace) {
            return Ok(Arc::clone(instance));
        }

        info!(namespace, "Booting extension");
        let instance = extension.boot()?;

        // Registered into a copy so a failure leaves the shared registry untouched
        let methods = {
            let mut registry = self.registry.lock();
            let mut staged = registry.clone();
            extension.register_methods(&mut staged)?;
            *registry = staged;
            registry.snapshot()
        };
        debug!(namespace, classes = methods.len(), "Publishing allowed methods");
        self.policy.set_allowed_methods(methods);

        booted.insert(namespace.to_string(), Arc::clone(&instance));
        Ok(instance)
    }
}

impl Object for ExtensionDirectory {
    fn class_name(&self) -> &str {
        DIRECTORY_CLASS
    }

    fn get_property(&self, name: &str) -> Result<Value, ObjectError> {
        match self.resolve(name) {
            Ok(instance) => Ok(Value::Object(instance)),
            Err(ExtensionError::NotFound(ns)) => Err(ObjectError::Runtime(format!(
                "Extension \"{}\" is not registered.",
                ns
            ))),
            Err(ExtensionError::Failed(err)) => Err(ObjectError::Host(err)),
        }
    }

    fn call_method(
        &self,
        name: &str,
        _args: Vec<Value>,
        _output: &mut String,
    ) -> Result<Value, ObjectError> {
        Err(ObjectError::Runtime(format!(
            "Method \"{}\" does not exist on the \"{}\" object.",
            name, DIRECTORY_CLASS
        )))
    }
}
