//! Built-in capability modules
//!
//! Each module is bound into every script's context under its name and declares a
//! static method table, which seeds the capability registry at boot.

pub mod array;
pub mod debug;
pub mod string;

use std::sync::Arc;

use super::registry::CapabilityRegistry;
use crate::engine::{Object, ObjectError, Value};

pub use array::ArrayFunctions;
pub use debug::DebugFunctions;
pub use string::StringFunctions;

/// A built-in module: context name, allowed methods and the object itself
pub struct Builtin {
    pub name: &'static str,
    pub methods: &'static [&'static str],
    pub object: Arc<dyn Object>,
}

/// All built-in modules, in context order
pub fn builtins() -> Vec<Builtin> {
    vec![
        Builtin {
            name: string::NAME,
            methods: string::METHODS,
            object: Arc::new(StringFunctions),
        },
        Builtin {
            name: array::NAME,
            methods: array::METHODS,
            object: Arc::new(ArrayFunctions),
        },
        Builtin {
            name: debug::NAME,
            methods: debug::METHODS,
            object: Arc::new(DebugFunctions),
        },
    ]
}

/// Registry holding every built-in method table
pub fn builtin_registry() -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();
    for builtin in builtins() {
        registry.register(builtin.name, builtin.methods.iter().copied());
    }
    registry
}

/* ===================== Argument Helpers ===================== */

fn arg<'a>(args: &'a [Value], index: usize, function: &str) -> Result<&'a Value, ObjectError> {
    args.get(index).ok_or_else(|| {
        ObjectError::Runtime(format!(
            "Too few arguments to {}(), {} passed and at least {} expected",
            function,
            args.len(),
            index + 1
        ))
    })
}

/// String argument; numbers and booleans are converted the way they print
fn string_arg(args: &[Value], index: usize, function: &str) -> Result<String, ObjectError> {
    match arg(args, index, function)? {
        value @ (Value::Str(_) | Value::Int(_) | Value::Float(_) | Value::Bool(_)) => {
            value.to_display().map_err(ObjectError::Runtime)
        }
        other => Err(type_error(function, index, "string", other)),
    }
}

fn type_error(function: &str, index: usize, expected: &str, given: &Value) -> ObjectError {
    ObjectError::Runtime(format!(
        "{}(): Argument #{} must be of type {}, {} given",
        function,
        index + 1,
        expected,
        given.type_name()
    ))
}

fn unknown_method(class: &str, method: &str) -> ObjectError {
    ObjectError::Runtime(format!(
        "Method \"{}\" does not exist on the \"{}\" object.",
        method, class
    ))
}
