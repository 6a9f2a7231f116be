//! Capability registry
//!
//! Maps a capability's class name to the methods scripts may call on it. The map only
//! grows; registering a class again replaces that class's entry.

use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    methods: HashMap<String, HashSet<String>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow `methods` on objects reporting `class` as their class name
    pub fn register<I, S>(&mut self, class: impl Into<String>, methods: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.methods
            .insert(class.into(), methods.into_iter().map(Into::into).collect());
        self
    }

    /// Method names compare case-insensitively, as the sandbox does
    pub fn allows(&self, class: &str, method: &str) -> bool {
        let method = method.to_lowercase();
        self.methods
            .get(class)
            .is_some_and(|methods| methods.iter().any(|m| m.to_lowercase() == method))
    }

    pub fn snapshot(&self) -> HashMap<String, HashSet<String>> {
        self.methods.clone()
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }
}
