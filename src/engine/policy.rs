//! Sandbox security policy
//!
//! Tags, filters and functions are checked once per render against the parsed
//! template. Methods and properties are checked on every call, keyed by the class
//! name the object reports.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use super::{EngineError, Template};

#[derive(Debug, Default)]
pub struct SecurityPolicy {
    allowed_tags: HashSet<String>,
    allowed_filters: HashSet<String>,
    allowed_functions: HashSet<String>,
    /// Class name => lowercased method names
    allowed_methods: RwLock<HashMap<String, HashSet<String>>>,
    /// Class name => property names
    allowed_properties: HashMap<String, HashSet<String>>,
}

impl SecurityPolicy {
    pub fn new<I, S>(
        allowed_tags: I,
        allowed_methods: HashMap<String, HashSet<String>>,
        allowed_properties: HashMap<String, HashSet<String>>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_tags: allowed_tags.into_iter().map(Into::into).collect(),
            allowed_filters: HashSet::new(),
            allowed_functions: HashSet::new(),
            allowed_methods: RwLock::new(lowercase_methods(allowed_methods)),
            allowed_properties,
        }
    }

    /// Replace the method allow-list wholesale
    pub fn set_allowed_methods(&self, methods: HashMap<String, HashSet<String>>) {
        *self.allowed_methods.write() = lowercase_methods(methods);
    }

    pub fn allowed_methods(&self) -> HashMap<String, HashSet<String>> {
        self.allowed_methods.read().clone()
    }

    pub fn is_tag_allowed(&self, tag: &str) -> bool {
        self.allowed_tags.contains(tag)
    }

    /// Verify the tags, filters and functions a template uses
    pub fn check_security(&self, template: &Template) -> Result<(), EngineError> {
        if let Some((tag, line)) = template
            .tags()
            .iter()
            .find(|(tag, _)| !self.allowed_tags.contains(*tag))
        {
            return Err(security(format!("Tag \"{}\" is not allowed.", tag), *line));
        }

        if let Some((filter, line)) = template
            .filters()
            .iter()
            .find(|(name, _)| !self.allowed_filters.contains(name))
        {
            return Err(security(format!("Filter \"{}\" is not allowed.", filter), *line));
        }

        if let Some((function, line)) = template
            .functions()
            .iter()
            .find(|(name, _)| !self.allowed_functions.contains(name))
        {
            return Err(security(
                format!("Function \"{}\" is not allowed.", function),
                *line,
            ));
        }

        Ok(())
    }

    pub fn check_method_allowed(
        &self,
        class: &str,
        method: &str,
        line: usize,
    ) -> Result<(), EngineError> {
        let method_lower = method.to_lowercase();
        let allowed = self
            .allowed_methods
            .read()
            .get(class)
            .is_some_and(|methods| methods.contains(&method_lower));

        if allowed {
            return Ok(());
        }

        Err(security(
            format!(
                "Calling \"{}\" method on a \"{}\" object is not allowed.",
                method, class
            ),
            line,
        ))
    }

    pub fn check_property_allowed(
        &self,
        class: &str,
        property: &str,
        line: usize,
    ) -> Result<(), EngineError> {
        let allowed = self
            .allowed_properties
            .get(class)
            .is_some_and(|properties| properties.contains(property));

        if allowed {
            return Ok(());
        }

        Err(security(
            format!(
                "Calling \"{}\" property on a \"{}\" object is not allowed.",
                property, class
            ),
            line,
        ))
    }
}

fn lowercase_methods(methods: HashMap<String, HashSet<String>>) -> HashMap<String, HashSet<String>> {
    methods
        .into_iter()
        .map(|(class, names)| {
            let names = names.iter().map(|m| m.to_lowercase()).collect();
            (class, names)
        })
        .collect()
}

fn security(message: String, line: usize) -> EngineError {
    EngineError::Security { message, line }
}
