//! `debug` capability: dumps written into the script output

use super::{arg, unknown_method};
use crate::engine::value::format_float;
use crate::engine::{Object, ObjectError, Value};

pub const NAME: &str = "debug";
pub const METHODS: &[&str] = &["dump", "dd", "varDump"];

#[derive(Debug, Default)]
pub struct DebugFunctions;

impl Object for DebugFunctions {
    fn class_name(&self) -> &str {
        NAME
    }

    fn call_method(
        &self,
        name: &str,
        args: Vec<Value>,
        output: &mut String,
    ) -> Result<Value, ObjectError> {
        match name.to_lowercase().as_str() {
            "dump" => {
                dump(arg(&args, 0, "debug.dump")?, output)?;
                Ok(Value::Null)
            }
            // Dump, then stop the script
            "dd" => {
                dump(arg(&args, 0, "debug.dd")?, output)?;
                Err(ObjectError::Halt)
            }
            "vardump" => {
                var_dump(arg(&args, 0, "debug.varDump")?, 0, output);
                Ok(Value::Null)
            }
            _ => Err(unknown_method(NAME, name)),
        }
    }
}

/// Pretty JSON followed by a newline
fn dump(value: &Value, output: &mut String) -> Result<(), ObjectError> {
    let text = match value {
        Value::Object(obj) => format!("object({})", obj.class_name()),
        other => serde_json::to_string_pretty(&other.to_json())
            .map_err(|e| ObjectError::Runtime(format!("Failed to dump value: {}", e)))?,
    };
    output.push_str(&text);
    output.push('\n');
    Ok(())
}

/// Typed, length-annotated dump
fn var_dump(value: &Value, indent: usize, output: &mut String) {
    let pad = " ".repeat(indent);
    match value {
        Value::Null => output.push_str("NULL\n"),
        Value::Bool(b) => output.push_str(&format!("bool({})\n", b)),
        Value::Int(i) => output.push_str(&format!("int({})\n", i)),
        Value::Float(f) => output.push_str(&format!("float({})\n", format_float(*f))),
        Value::Str(s) => output.push_str(&format!("string({}) \"{}\"\n", s.len(), s)),
        Value::List(items) => {
            output.push_str(&format!("array({}) {{\n", items.len()));
            for (i, item) in items.iter().enumerate() {
                output.push_str(&format!("{}  [{}]=>\n{}  ", pad, i, pad));
                var_dump(item, indent + 2, output);
            }
            output.push_str(&format!("{}}}\n", pad));
        }
        Value::Map(entries) => {
            output.push_str(&format!("array({}) {{\n", entries.len()));
            for (key, item) in entries {
                output.push_str(&format!("{}  [\"{}\"]=>\n{}  ", pad, key, pad));
                var_dump(item, indent + 2, output);
            }
            output.push_str(&format!("{}}}\n", pad));
        }
        Value::Object(obj) => output.push_str(&format!("object({})\n", obj.class_name())),
    }
}
