//! `array` capability

use super::{arg, type_error, unknown_method};
use crate::engine::{Object, ObjectError, Value};

pub const NAME: &str = "array";
pub const METHODS: &[&str] = &["keys", "count"];

#[derive(Debug, Default)]
pub struct ArrayFunctions;

impl Object for ArrayFunctions {
    fn class_name(&self) -> &str {
        NAME
    }

    fn call_method(
        &self,
        name: &str,
        args: Vec<Value>,
        _output: &mut String,
    ) -> Result<Value, ObjectError> {
        match name.to_lowercase().as_str() {
            "keys" => match arg(&args, 0, "array.keys")? {
                Value::List(items) => Ok(Value::List(
                    (0..items.len()).map(|i| Value::Int(i as i64)).collect(),
                )),
                Value::Map(entries) => Ok(Value::List(
                    entries.keys().map(|k| Value::Str(k.clone())).collect(),
                )),
                other => Err(type_error("array.keys", 0, "array", other)),
            },
            "count" => match arg(&args, 0, "array.count")? {
                Value::List(items) => Ok(Value::Int(items.len() as i64)),
                Value::Map(entries) => Ok(Value::Int(entries.len() as i64)),
                other => Err(type_error("array.count", 0, "array", other)),
            },
            _ => Err(unknown_method(NAME, name)),
        }
    }
}
