//! Sandboxed block template engine
//!
//! A small Twig-flavoured engine: text, `{{ }}` prints and the tags `set`, `if`, `for`,
//! `do` and `return`. Every template is checked against a [`SecurityPolicy`] before it
//! renders, and host objects are only reachable through allowed methods and properties.

pub mod ast;
mod parser;
pub mod policy;
mod render;
pub mod value;

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

use ast::{visit_exprs, visit_nodes, ExprKind, Node};
pub use policy::SecurityPolicy;
pub use value::{Object, ObjectError, Value, ValueMap};

/* ===================== Error Types ===================== */

/// Engine failure tagged by kind. Lines are 1-based.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{message} (line {line})")]
    Syntax { message: String, line: usize },

    #[error("{message} (line {line})")]
    Security { message: String, line: usize },

    #[error("{message} (line {line})")]
    Runtime { message: String, line: usize },

    /// Host object failure, carried without any template context
    #[error(transparent)]
    Host(anyhow::Error),
}

impl EngineError {
    pub fn runtime(message: impl Into<String>, line: usize) -> Self {
        EngineError::Runtime {
            message: message.into(),
            line,
        }
    }

    /// Message without location, `None` for host failures
    pub fn message(&self) -> Option<&str> {
        match self {
            EngineError::Syntax { message, .. }
            | EngineError::Security { message, .. }
            | EngineError::Runtime { message, .. } => Some(message),
            EngineError::Host(_) => None,
        }
    }

    pub fn line(&self) -> Option<usize> {
        match self {
            EngineError::Syntax { line, .. }
            | EngineError::Security { line, .. }
            | EngineError::Runtime { line, .. } => Some(*line),
            EngineError::Host(_) => None,
        }
    }
}

/* ===================== Options ===================== */

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Undefined variables and missing keys are errors instead of `null`
    pub strict_variables: bool,
    /// Context variable whose value keys values written by `return`
    pub correlation_key: String,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            strict_variables: true,
            correlation_key: "runId".to_string(),
        }
    }
}

/// Receives values written by `{% return %}`
pub trait ReturnSink: Send + Sync {
    fn store(&self, correlation: &Value, value: Value);
}

/* ===================== Template ===================== */

/// A parsed template plus the names the sandbox checks before rendering
#[derive(Debug, Clone)]
pub struct Template {
    nodes: Vec<Node>,
    tags: Vec<(&'static str, usize)>,
    filters: Vec<(String, usize)>,
    functions: Vec<(String, usize)>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, EngineError> {
        let nodes = parser::parse_template(source)?;

        let mut tags = Vec::new();
        visit_nodes(&nodes, &mut |node| {
            if let Some(tag) = node.tag() {
                tags.push((tag, node.line()));
            }
        });

        let mut filters = Vec::new();
        let mut functions = Vec::new();
        visit_exprs(&nodes, &mut |expr| match &expr.kind {
            ExprKind::Filter { name, .. } => filters.push((name.clone(), expr.line)),
            ExprKind::FunctionCall { name, .. } => functions.push((name.clone(), expr.line)),
            _ => {}
        });

        Ok(Self {
            nodes,
            tags,
            filters,
            functions,
        })
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn tags(&self) -> &[(&'static str, usize)] {
        &self.tags
    }

    pub fn filters(&self) -> &[(String, usize)] {
        &self.filters
    }

    pub fn functions(&self) -> &[(String, usize)] {
        &self.functions
    }
}

/* ===================== Engine ===================== */

pub struct Engine {
    options: EngineOptions,
    policy: Arc<SecurityPolicy>,
    returns: Option<Arc<dyn ReturnSink>>,
    templates: RwLock<HashMap<String, Arc<Template>>>,
}

impl Engine {
    pub fn new(options: EngineOptions, policy: Arc<SecurityPolicy>) -> Self {
        Self {
            options,
            policy,
            returns: None,
            templates: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_return_sink(mut self, sink: Arc<dyn ReturnSink>) -> Self {
        self.returns = Some(sink);
        self
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn policy(&self) -> &Arc<SecurityPolicy> {
        &self.policy
    }

    /// Previously loaded template
    pub fn cached(&self, name: &str) -> Option<Arc<Template>> {
        self.templates.read().get(name).cloned()
    }

    /// Parse `source` and cache it under `name`
    pub fn load(&self, name: &str, source: &str) -> Result<Arc<Template>, EngineError> {
        if let Some(template) = self.cached(name) {
            return Ok(template);
        }

        debug!(template = name, "Parsing template");
        let template = Arc::new(Template::parse(source)?);
        self.templates
            .write()
            .insert(name.to_string(), Arc::clone(&template));

        Ok(template)
    }

    /// Render a template. The sandbox check runs first, so a forbidden tag fails
    /// before any output is produced.
    pub fn render(
        &self,
        template: &Template,
        context: BTreeMap<String, Value>,
    ) -> Result<String, EngineError> {
        self.policy.check_security(template)?;
        render::Renderer::new(self, context).render(template.nodes())
    }

    /// Parse and render without caching
    pub fn render_str(
        &self,
        source: &str,
        context: BTreeMap<String, Value>,
    ) -> Result<String, EngineError> {
        let template = Template::parse(source)?;
        self.render(&template, context)
    }

    fn return_sink(&self) -> Option<&Arc<dyn ReturnSink>> {
        self.returns.as_ref()
    }
}
