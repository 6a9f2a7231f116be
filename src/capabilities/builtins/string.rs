//! `str` capability: string predicates and replacement

use super::{arg, string_arg, type_error, unknown_method};
use crate::engine::{Object, ObjectError, Value};

pub const NAME: &str = "str";
pub const METHODS: &[&str] = &["contains", "startsWith", "endsWith", "replace"];

#[derive(Debug, Default)]
pub struct StringFunctions;

impl Object for StringFunctions {
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
            "contains" => {
                let (haystack, needle) = pair(&args, "str.contains")?;
                Ok(Value::Bool(haystack.contains(needle.as_str())))
            }
            "startswith" => {
                let (haystack, needle) = pair(&args, "str.startsWith")?;
                Ok(Value::Bool(haystack.starts_with(needle.as_str())))
            }
            "endswith" => {
                let (haystack, needle) = pair(&args, "str.endsWith")?;
                Ok(Value::Bool(haystack.ends_with(needle.as_str())))
            }
            "replace" => replace(&args).map(Value::Str),
            _ => Err(unknown_method(NAME, name)),
        }
    }
}

fn pair(args: &[Value], function: &str) -> Result<(String, String), ObjectError> {
    Ok((
        string_arg(args, 0, function)?,
        string_arg(args, 1, function)?,
    ))
}

/// `replace(search, replace, subject)`
///
/// A list of searches is replaced pairwise by a list of replacements (missing ones
/// are empty) or entirely by a single replacement string. Empty searches are skipped.
fn replace(args: &[Value]) -> Result<String, ObjectError> {
    const FUNCTION: &str = "str.replace";

    let mut subject = string_arg(args, 2, FUNCTION)?;

    let pairs: Vec<(String, String)> = match (arg(args, 0, FUNCTION)?, arg(args, 1, FUNCTION)?) {
        (Value::List(searches), Value::List(replacements)) => {
            let replacements = string_list(replacements, 1)?;
            string_list(searches, 0)?
                .into_iter()
                .enumerate()
                .map(|(i, search)| (search, replacements.get(i).cloned().unwrap_or_default()))
                .collect()
        }
        (Value::List(searches), _) => {
            let replacement = string_arg(args, 1, FUNCTION)?;
            string_list(searches, 0)?
                .into_iter()
                .map(|search| (search, replacement.clone()))
                .collect()
        }
        (_, Value::List(_)) => {
            return Err(ObjectError::Runtime(format!(
                "{}(): Argument #2 must be of type string when argument #1 is a string",
                FUNCTION
            )))
        }
        _ => vec![(string_arg(args, 0, FUNCTION)?, string_arg(args, 1, FUNCTION)?)],
    };

    for (search, replacement) in pairs {
        if !search.is_empty() {
            subject = subject.replace(&search, &replacement);
        }
    }

    Ok(subject)
}

fn string_list(items: &[Value], index: usize) -> Result<Vec<String>, ObjectError> {
    items
        .iter()
        .map(|item| match item {
            Value::List(_) | Value::Map(_) | Value::Object(_) => {
                Err(type_error("str.replace", index, "string", item))
            }
            other => other.to_display().map_err(ObjectError::Runtime),
        })
        .collect()
}
