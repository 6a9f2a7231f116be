//! Script runtime
//!
//! Boots once on first use, then for every execution:
//! 1. Hash the script and compile it unless the hash is already stored
//! 2. Assign a fresh run id
//! 3. Render the compiled template with the built-ins, `ext`, `input` and `runId`
//! 4. Collect the value `return` stored under the run id

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::capabilities::{
    builtin_registry, builtins, Extension, ExtensionDirectory, DIRECTORY_CLASS,
};
use crate::compiler::Compiler;
use crate::config::RuntimeConfig;
use crate::engine::{Engine, EngineOptions, Object, ReturnSink, SecurityPolicy, Template, Value};
use crate::error::ScriptError;
use crate::store::{ArtifactStore, FsArtifactStore};


/// Context key holding the caller's input
pub const INPUT_KEY: &str = "input";
/// Context key holding the run id; scripts may never assign it
pub const CORRELATION_KEY: &str = "runId";
/// Context key of the extension directory
pub const EXTENSIONS_KEY: &str = "ext";
/// Tags a compiled script may use
pub const ALLOWED_TAGS: &[&str] = &["if", "set", "return", "for", "do"];

/// Outcome of one execution
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnResult {
    pub output: String,
    /// Value written by `return`, if the script reached one
    pub return_value: Option<Value>,
    pub run_id: u64,
}

/// SHA-256 of the script text, lowercase hex
pub fn hash_source(source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn short_hash(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

/* ===================== Correlation ===================== */

/// Values written by `return`, keyed by run id
#[derive(Debug, Default)]
struct CorrelationTable {
    values: Mutex<HashMap<u64, Value>>,
}

impl CorrelationTable {
    fn take(&self, run_id: u64) -> Option<Value> {
        self.values.lock().remove(&run_id)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.values.lock().len()
    }
}

impl ReturnSink for CorrelationTable {
    fn store(&self, correlation: &Value, value: Value) {
        match correlation.as_i64().and_then(|id| u64::try_from(id).ok()) {
            Some(run_id) => {
                self.values.lock().insert(run_id, value);
            }
            None => warn!(?correlation, "Discarding returned value without a run id"),
        }
    }
}

/* ===================== Runtime ===================== */

/// Everything built at boot
struct Booted {
    compiler: Compiler,
    engine: Engine,
    /// Built-ins and `ext`, shared by every execution
    context: BTreeMap<String, Value>,
}

pub struct Runtime {
    store: Arc<dyn ArtifactStore>,
    strict_variables: bool,
    extensions: Mutex<Vec<Arc<dyn Extension>>>,
    booted: Mutex<Option<Arc<Booted>>>,
    /// Hashes known to be in the store
    compiled: RwLock<HashSet<String>>,
    next_run_id: AtomicU64,
    returns: Arc<CorrelationTable>,
}

impl Runtime {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            store,
            strict_variables: true,
            extensions: Mutex::new(Vec::new()),
            booted: Mutex::new(None),
            compiled: RwLock::new(HashSet::new()),
            next_run_id: AtomicU64::new(1),
            returns: Arc::new(CorrelationTable::default()),
        }
    }

    /// Filesystem-backed runtime rooted at the configured cache directory
    pub fn from_config(config: &RuntimeConfig) -> Result<Self, ScriptError> {
        let store = FsArtifactStore::new(&config.cache_directory)?;
        Ok(Self::new(Arc::new(store)).with_strict_variables(config.strict_variables))
    }

    pub fn with_strict_variables(mut self, strict: bool) -> Self {
        self.strict_variables = strict;
        self
    }

    pub fn with_extension(self, extension: impl Extension + 'static) -> Self {
        self.add_extension(extension);
        self
    }

    /// Register an extension. Returns `false` once booted: the compiler and policy
    /// are already built, so the extension is ignored.
    pub fn add_extension(&self, extension: impl Extension + 'static) -> bool {
        let booted = self.booted.lock();
        if booted.is_some() {
            warn!(
                namespace = extension.namespace(),
                "Runtime already booted, ignoring extension"
            );
            return false;
        }

        debug!(namespace = extension.namespace(), "Registered extension");
        self.extensions.lock().push(Arc::new(extension));
        true
    }

    pub fn is_booted(&self) -> bool {
        self.booted.lock().is_some()
    }

    /// Execute a script with `input` bound as `input`
    pub fn run(&self, script: &str, input: JsonValue) -> Result<ReturnResult, ScriptError> {
        let booted = self.boot()?;
        let hash = hash_source(script);
        self.ensure_compiled(&booted, script, &hash)?;

        let run_id = self.next_run_id.fetch_add(1, Ordering::SeqCst);
        debug!(run_id, hash = short_hash(&hash), "Executing script");

        let mut context = booted.context.clone();
        context.insert(INPUT_KEY.to_string(), Value::from(input));
        context.insert(
            CORRELATION_KEY.to_string(),
            Value::Int(i64::try_from(run_id).unwrap_or(i64::MAX)),
        );

        let rendered = self.render(&booted, &hash, context);
        // Consumed whether or not the render succeeded
        let return_value = self.returns.take(run_id);

        match rendered {
            Ok(output) => Ok(ReturnResult {
                output,
                return_value,
                run_id,
            }),
            Err(err) => {
                warn!(run_id, error = %err, "Script failed");
                Err(err)
            }
        }
    }

    /// Compile a script without executing or storing it
    pub fn compile(&self, script: &str) -> Result<String, ScriptError> {
        let booted = self.boot()?;
        Ok(booted.compiler.compile(script)?)
    }

    fn boot(&self) -> Result<Arc<Booted>, ScriptError> {
        let mut state = self.booted.lock();
        if let Some(booted) = state.as_ref() {
            return Ok(Arc::clone(booted));
        }

        let extensions = self.extensions.lock().clone();
        let namespaces: HashSet<String> = extensions
            .iter()
            .map(|ext| ext.namespace().to_string())
            .collect();
        info!(extensions = namespaces.len(), "Booting script runtime");

        let registry = builtin_registry();
        let policy = Arc::new(SecurityPolicy::new(
            ALLOWED_TAGS.iter().copied(),
            registry.snapshot(),
            HashMap::from([(DIRECTORY_CLASS.to_string(), namespaces)]),
        ));
        let directory = Arc::new(ExtensionDirectory::new(
            extensions,
            registry,
            Arc::clone(&policy),
        ));

        let options = EngineOptions {
            strict_variables: self.strict_variables,
            correlation_key: CORRELATION_KEY.to_string(),
        };
        let sink: Arc<dyn ReturnSink> = self.returns.clone();
        let engine = Engine::new(options, policy).with_return_sink(sink);

        let mut context = BTreeMap::new();
        let mut identifiers = Vec::new();
        for builtin in builtins() {
            identifiers.push(builtin.name);
            context.insert(builtin.name.to_string(), Value::Object(builtin.object));
        }
        let directory: Arc<dyn Object> = directory;
        context.insert(EXTENSIONS_KEY.to_string(), Value::Object(directory));
        identifiers.push(EXTENSIONS_KEY);

        let compiler = Compiler::new(identifiers, CORRELATION_KEY);

        let index = self.store.list()?;
        debug!(artifacts = index.len(), "Loaded compiled script index");
        self.compiled.write().extend(index);

        let booted = Arc::new(Booted {
            compiler,
            engine,
            context,
        });
        *state = Some(Arc::clone(&booted));
        Ok(booted)
    }

    fn ensure_compiled(&self, booted: &Booted, script: &str, hash: &str) -> Result<(), ScriptError> {
        if self.compiled.read().contains(hash) {
            debug!(hash = short_hash(hash), "Compiled script cache hit");
            return Ok(());
        }

        let compiled = booted.compiler.compile(script)?;
        self.store.write(hash, &compiled)?;
        self.compiled.write().insert(hash.to_string());
        info!(hash = short_hash(hash), "Compiled script");
        Ok(())
    }

    fn render(
        &self,
        booted: &Booted,
        hash: &str,
        context: BTreeMap<String, Value>,
    ) -> Result<String, ScriptError> {
        let template: Arc<Template> = match booted.engine.cached(hash) {
            Some(template) => template,
            None => {
                let source = self.store.read(hash)?;
                booted.engine.load(hash, &source)?
            }
        };

        Ok(booted.engine.render(&template, context)?)
    }
}
