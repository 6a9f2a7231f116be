//! Tree-walking renderer

use std::cmp::Ordering;
use std::collections::BTreeMap;

use tracing::debug;

use super::ast::{BinaryOp, Expr, ExprKind, Node, TestName, UnaryOp};
use super::value::{Number, ObjectError, Value, ValueMap};
use super::{Engine, EngineError};

/// Largest list a `..` range may produce
const MAX_RANGE_LEN: u64 = 1_000_000;

/// Why evaluation stopped before the end of the template
enum Interrupt {
    Error(EngineError),
    /// `return` or a capability asked to stop; output so far is kept
    Halt,
}

impl From<EngineError> for Interrupt {
    fn from(err: EngineError) -> Self {
        Interrupt::Error(err)
    }
}

type Eval<T> = Result<T, Interrupt>;

fn runtime(message: impl Into<String>, line: usize) -> Interrupt {
    Interrupt::Error(EngineError::runtime(message, line))
}

fn object_error(err: ObjectError, line: usize) -> Interrupt {
    match err {
        ObjectError::Runtime(message) => runtime(message, line),
        ObjectError::Halt => Interrupt::Halt,
        ObjectError::Host(err) => Interrupt::Error(EngineError::Host(err)),
    }
}

/// Result of reading an attribute or key
enum Lookup {
    Found(Value),
    /// Missing, with the message strict mode reports
    Missing(String),
}

impl Lookup {
    fn found(self) -> Option<Value> {
        match self {
            Lookup::Found(value) => Some(value),
            Lookup::Missing(_) => None,
        }
    }
}

/* ===================== Renderer ===================== */

pub(super) struct Renderer<'e> {
    engine: &'e Engine,
    /// Innermost scope last; the first entry is the render context
    scopes: Vec<BTreeMap<String, Value>>,
    /// Correlation value of the render context, fixed before any script code runs
    correlation: Value,
    output: String,
}

impl<'e> Renderer<'e> {
    pub(super) fn new(engine: &'e Engine, context: BTreeMap<String, Value>) -> Self {
        let correlation = context
            .get(&engine.options().correlation_key)
            .cloned()
            .unwrap_or_default();

        Self {
            engine,
            scopes: vec![context],
            correlation,
            output: String::new(),
        }
    }

    pub(super) fn render(mut self, nodes: &[Node]) -> Result<String, EngineError> {
        match self.render_nodes(nodes) {
            Ok(()) | Err(Interrupt::Halt) => Ok(self.output),
            Err(Interrupt::Error(err)) => Err(err),
        }
    }

    fn strict(&self) -> bool {
        self.engine.options().strict_variables
    }

    /* ---------- Scopes ---------- */

    fn lookup_var(&self, name: &str) -> Option<Value> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name))
            .cloned()
    }

    /// Update the innermost scope that already holds `name`, else define it locally
    fn assign(&mut self, name: &str, value: Value) {
        if let Some(scope) = self
            .scopes
            .iter_mut()
            .rev()
            .find(|scope| scope.contains_key(name))
        {
            scope.insert(name.to_string(), value);
            return;
        }
        self.bind_local(name, value);
    }

    fn bind_local(&mut self, name: &str, value: Value) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), value);
        }
    }

    /* ---------- Statements ---------- */

    fn render_nodes(&mut self, nodes: &[Node]) -> Eval<()> {
        for node in nodes {
            self.render_node(node)?;
        }
        Ok(())
    }

    fn render_node(&mut self, node: &Node) -> Eval<()> {
        match node {
            Node::Text(text) => self.output.push_str(text),
            Node::Print { expr, line } => {
                let value = self.eval(expr)?;
                let text = value.to_display().map_err(|m| runtime(m, *line))?;
                self.output.push_str(&text);
            }
            Node::Set {
                targets, values, ..
            } => {
                let values = values
                    .iter()
                    .map(|expr| self.eval(expr))
                    .collect::<Eval<Vec<_>>>()?;
                for (name, value) in targets.iter().zip(values) {
                    self.assign(name, value);
                }
            }
            Node::If {
                branches,
                otherwise,
                ..
            } => {
                for (test, body) in branches {
                    if self.eval(test)?.is_truthy() {
                        return self.render_nodes(body);
                    }
                }
                if let Some(body) = otherwise {
                    self.render_nodes(body)?;
                }
            }
            Node::For {
                key,
                value,
                iterable,
                body,
                otherwise,
                ..
            } => self.render_for(key.as_deref(), value, iterable, body, otherwise.as_deref())?,
            Node::Do { expr, .. } => {
                self.eval(expr)?;
            }
            Node::Return { expr, .. } => {
                let value = self.eval(expr)?;
                self.store_return(value);
                return Err(Interrupt::Halt);
            }
        }
        Ok(())
    }

    fn render_for(
        &mut self,
        key: Option<&str>,
        value: &str,
        iterable: &Expr,
        body: &[Node],
        otherwise: Option<&[Node]>,
    ) -> Eval<()> {
        // Anything that is not a sequence or mapping iterates zero times
        let items: Vec<(Value, Value)> = match self.eval(iterable)? {
            Value::List(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, v)| (Value::Int(i as i64), v))
                .collect(),
            Value::Map(entries) => entries
                .into_iter()
                .map(|(k, v)| (Value::Str(k), v))
                .collect(),
            _ => Vec::new(),
        };

        if items.is_empty() {
            if let Some(body) = otherwise {
                self.render_nodes(body)?;
            }
            return Ok(());
        }

        let length = items.len();
        self.scopes.push(BTreeMap::new());

        let mut result = Ok(());
        for (index0, (k, v)) in items.into_iter().enumerate() {
            if let Some(key) = key {
                self.bind_local(key, k);
            }
            self.bind_local(value, v);
            self.bind_local("loop", loop_variable(index0, length));

            result = self.render_nodes(body);
            if result.is_err() {
                break;
            }
        }

        self.scopes.pop();
        result
    }

    fn store_return(&mut self, value: Value) {
        match self.engine.return_sink() {
            Some(sink) => sink.store(&self.correlation, value),
            None => debug!("No return sink configured, discarding returned value"),
        }
    }

    /* ---------- Expressions ---------- */

    fn eval(&mut self, expr: &Expr) -> Eval<Value> {
        let line = expr.line;

        match &expr.kind {
            ExprKind::Null => Ok(Value::Null),
            ExprKind::Bool(b) => Ok(Value::Bool(*b)),
            ExprKind::Int(i) => Ok(Value::Int(*i)),
            ExprKind::Float(f) => Ok(Value::Float(*f)),
            ExprKind::Str(s) => Ok(Value::Str(s.clone())),
            ExprKind::Array(items) => {
                let items = items
                    .iter()
                    .map(|item| self.eval(item))
                    .collect::<Eval<Vec<_>>>()?;
                Ok(Value::List(items))
            }
            ExprKind::Hash(entries) => {
                let mut map = ValueMap::new();
                for (key, value) in entries {
                    let key = self.eval(key)?;
                    let key = key.to_display().map_err(|m| runtime(m, line))?;
                    let value = self.eval(value)?;
                    map.insert(key, value);
                }
                Ok(Value::Map(map))
            }
            ExprKind::Name(name) => match self.lookup_var(name) {
                Some(value) => Ok(value),
                None if self.strict() => {
                    Err(runtime(format!("Variable \"{}\" does not exist.", name), line))
                }
                None => Ok(Value::Null),
            },
            ExprKind::Attribute { object, name } => {
                let target = self.eval(object)?;
                let lookup = self.attribute(&target, &Value::Str(name.clone()), "an attribute", line)?;
                self.resolve(lookup, line)
            }
            ExprKind::Subscript { object, index } => {
                let target = self.eval(object)?;
                let key = self.eval(index)?;
                let lookup = self.attribute(&target, &key, "a key", line)?;
                self.resolve(lookup, line)
            }
            ExprKind::MethodCall {
                object,
                method,
                args,
            } => {
                let target = self.eval(object)?;
                let args = args
                    .iter()
                    .map(|arg| self.eval(arg))
                    .collect::<Eval<Vec<_>>>()?;
                self.call_method(target, method, args, line)
            }
            ExprKind::FunctionCall { name, .. } => {
                Err(runtime(format!("Unknown \"{}\" function.", name), line))
            }
            ExprKind::Filter { name, .. } => {
                Err(runtime(format!("Unknown \"{}\" filter.", name), line))
            }
            ExprKind::Test {
                operand,
                name,
                negated,
            } => {
                let result = self.test(operand, *name, line)?;
                Ok(Value::Bool(result != *negated))
            }
            ExprKind::Unary { op, operand } => {
                let value = self.eval(operand)?;
                unary(*op, value).map_err(|m| runtime(m, line))
            }
            ExprKind::Binary { op, left, right } => self.binary(*op, left, right, line),
            ExprKind::Conditional {
                test,
                then_e,
                else_e,
            } => {
                if self.eval(test)?.is_truthy() {
                    self.eval(then_e)
                } else {
                    self.eval(else_e)
                }
            }
        }
    }

    fn resolve(&self, lookup: Lookup, line: usize) -> Eval<Value> {
        match lookup {
            Lookup::Found(value) => Ok(value),
            Lookup::Missing(message) if self.strict() => Err(runtime(message, line)),
            Lookup::Missing(_) => Ok(Value::Null),
        }
    }

    /// Evaluate without raising for undefined names or missing keys (`None`)
    fn lookup(&mut self, expr: &Expr) -> Eval<Option<Value>> {
        match &expr.kind {
            ExprKind::Name(name) => Ok(self.lookup_var(name)),
            ExprKind::Attribute { object, name } => {
                let Some(target) = self.lookup(object)? else {
                    return Ok(None);
                };
                let key = Value::Str(name.clone());
                Ok(self.attribute(&target, &key, "an attribute", expr.line)?.found())
            }
            ExprKind::Subscript { object, index } => {
                let Some(target) = self.lookup(object)? else {
                    return Ok(None);
                };
                let key = self.eval(index)?;
                Ok(self.attribute(&target, &key, "a key", expr.line)?.found())
            }
            _ => self.eval(expr).map(Some),
        }
    }

    fn attribute(&self, target: &Value, key: &Value, noun: &str, line: usize) -> Eval<Lookup> {
        let name = key.to_display().unwrap_or_default();

        let lookup = match target {
            Value::Map(entries) => match entries.get(&name) {
                Some(value) => Lookup::Found(value.clone()),
                None => Lookup::Missing(missing_key(&name, entries.keys().cloned().collect())),
            },
            Value::List(items) => {
                let index = match key {
                    Value::Int(i) => Some(*i),
                    Value::Str(s) => s.parse::<i64>().ok(),
                    _ => None,
                };
                match index
                    .and_then(|i| usize::try_from(i).ok())
                    .and_then(|i| items.get(i))
                {
                    Some(value) => Lookup::Found(value.clone()),
                    None => Lookup::Missing(missing_key(
                        &name,
                        (0..items.len()).map(|i| i.to_string()).collect(),
                    )),
                }
            }
            Value::Object(obj) => {
                self.engine
                    .policy()
                    .check_property_allowed(obj.class_name(), &name, line)?;
                let value = obj.get_property(&name).map_err(|e| object_error(e, line))?;
                Lookup::Found(value)
            }
            Value::Null => Lookup::Missing(format!(
                "Impossible to access {} (\"{}\") on a null variable.",
                noun, name
            )),
            other => Lookup::Missing(format!(
                "Impossible to access {} (\"{}\") on a {} variable (\"{}\").",
                noun,
                name,
                other.type_name(),
                other.to_display().unwrap_or_default()
            )),
        };

        Ok(lookup)
    }

    fn call_method(&mut self, target: Value, method: &str, args: Vec<Value>, line: usize) -> Eval<Value> {
        match target {
            Value::Object(obj) => {
                self.engine
                    .policy()
                    .check_method_allowed(obj.class_name(), method, line)?;
                obj.call_method(method, args, &mut self.output)
                    .map_err(|e| object_error(e, line))
            }
            Value::Null if !self.strict() => Ok(Value::Null),
            Value::Null => Err(runtime(
                format!("Impossible to invoke a method (\"{}\") on a null variable.", method),
                line,
            )),
            Value::List(_) | Value::Map(_) => Err(runtime(
                format!(
                    "Impossible to invoke a method (\"{}\") on a sequence/mapping.",
                    method
                ),
                line,
            )),
            other => Err(runtime(
                format!(
                    "Impossible to invoke a method (\"{}\") on a {} variable (\"{}\").",
                    method,
                    other.type_name(),
                    other.to_display().unwrap_or_default()
                ),
                line,
            )),
        }
    }

    fn test(&mut self, operand: &Expr, name: TestName, line: usize) -> Eval<bool> {
        if name == TestName::Defined {
            return Ok(self.lookup(operand)?.is_some());
        }

        let value = self.eval(operand)?;
        let result = match name {
            TestName::Defined => true,
            TestName::Null => value.is_null(),
            TestName::Empty => is_empty(&value),
            TestName::Iterable => matches!(value, Value::List(_) | Value::Map(_)),
            TestName::Even | TestName::Odd => {
                let n = integer(&value).ok_or_else(|| {
                    runtime(
                        format!("Unsupported operand types: {} % int", value.type_name()),
                        line,
                    )
                })?;
                (n % 2 == 0) == (name == TestName::Even)
            }
        };

        Ok(result)
    }

    fn binary(&mut self, op: BinaryOp, left: &Expr, right: &Expr, line: usize) -> Eval<Value> {
        match op {
            BinaryOp::Or => {
                if self.eval(left)?.is_truthy() {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(self.eval(right)?.is_truthy()))
            }
            BinaryOp::And => {
                if !self.eval(left)?.is_truthy() {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(self.eval(right)?.is_truthy()))
            }
            BinaryOp::Coalesce => match self.lookup(left)? {
                Some(value) if !value.is_null() => Ok(value),
                _ => self.eval(right),
            },
            _ => {
                let l = self.eval(left)?;
                let r = self.eval(right)?;
                binary_values(op, l, r).map_err(|m| runtime(m, line))
            }
        }
    }
}

/* ===================== Operators ===================== */

fn loop_variable(index0: usize, length: usize) -> Value {
    let mut map = ValueMap::new();
    map.insert("index".to_string(), Value::Int(index0 as i64 + 1));
    map.insert("index0".to_string(), Value::Int(index0 as i64));
    map.insert("revindex".to_string(), Value::Int((length - index0) as i64));
    map.insert("revindex0".to_string(), Value::Int((length - index0 - 1) as i64));
    map.insert("first".to_string(), Value::Bool(index0 == 0));
    map.insert("last".to_string(), Value::Bool(index0 + 1 == length));
    map.insert("length".to_string(), Value::Int(length as i64));
    Value::Map(map)
}

fn missing_key(key: &str, keys: Vec<String>) -> String {
    if keys.is_empty() {
        return format!(
            "Key \"{}\" does not exist as the sequence/mapping is empty.",
            key
        );
    }
    format!(
        "Key \"{}\" for sequence/mapping with keys \"{}\" does not exist.",
        key,
        keys.join(", ")
    )
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Str(s) => s.is_empty(),
        Value::List(items) => items.is_empty(),
        Value::Map(entries) => entries.is_empty(),
        Value::Int(_) | Value::Float(_) | Value::Object(_) => false,
    }
}

/// Integer view, truncating floats
fn integer(value: &Value) -> Option<i64> {
    match value.as_number()? {
        Number::Int(i) => Some(i),
        Number::Float(f) if f.is_finite() => Some(f.trunc() as i64),
        Number::Float(_) => None,
    }
}

fn operands(symbol: &str, l: &Value, r: &Value) -> Result<(Number, Number), String> {
    match (l.as_number(), r.as_number()) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(format!(
            "Unsupported operand types: {} {} {}",
            l.type_name(),
            symbol,
            r.type_name()
        )),
    }
}

fn unary(op: UnaryOp, value: Value) -> Result<Value, String> {
    match op {
        UnaryOp::Not => Ok(Value::Bool(!value.is_truthy())),
        UnaryOp::Neg => match value.as_number() {
            Some(Number::Int(i)) => Ok(i
                .checked_neg()
                .map(Value::Int)
                .unwrap_or(Value::Float(-(i as f64)))),
            Some(Number::Float(f)) => Ok(Value::Float(-f)),
            None => Err(format!("Unsupported operand types: -{}", value.type_name())),
        },
        UnaryOp::Pos => value
            .as_number()
            .map(Number::into_value)
            .ok_or_else(|| format!("Unsupported operand types: +{}", value.type_name())),
    }
}

fn binary_values(op: BinaryOp, l: Value, r: Value) -> Result<Value, String> {
    let value = match op {
        BinaryOp::Or => Value::Bool(l.is_truthy() || r.is_truthy()),
        BinaryOp::And => Value::Bool(l.is_truthy() && r.is_truthy()),
        BinaryOp::Coalesce => {
            if l.is_null() {
                r
            } else {
                l
            }
        }
        BinaryOp::Eq => Value::Bool(l.loose_eq(&r)),
        BinaryOp::Ne => Value::Bool(!l.loose_eq(&r)),
        BinaryOp::Lt => Value::Bool(compare(&l, &r)? == Ordering::Less),
        BinaryOp::Gt => Value::Bool(compare(&l, &r)? == Ordering::Greater),
        BinaryOp::Le => Value::Bool(compare(&l, &r)? != Ordering::Greater),
        BinaryOp::Ge => Value::Bool(compare(&l, &r)? != Ordering::Less),
        BinaryOp::In => Value::Bool(contains(&r, &l)),
        BinaryOp::NotIn => Value::Bool(!contains(&r, &l)),
        BinaryOp::StartsWith => Value::Bool(match (&l, &r) {
            (Value::Str(a), Value::Str(b)) => a.starts_with(b.as_str()),
            _ => false,
        }),
        BinaryOp::EndsWith => Value::Bool(match (&l, &r) {
            (Value::Str(a), Value::Str(b)) => a.ends_with(b.as_str()),
            _ => false,
        }),
        BinaryOp::Range => range(&l, &r)?,
        BinaryOp::Concat => Value::Str(l.to_display()? + &r.to_display()?),
        BinaryOp::Add => arithmetic("+", &l, &r, i64::checked_add, |a, b| a + b)?,
        BinaryOp::Sub => arithmetic("-", &l, &r, i64::checked_sub, |a, b| a - b)?,
        BinaryOp::Mul => arithmetic("*", &l, &r, i64::checked_mul, |a, b| a * b)?,
        BinaryOp::Div => divide(&l, &r)?,
        BinaryOp::FloorDiv => floor_divide(&l, &r)?,
        BinaryOp::Mod => modulo(&l, &r)?,
        BinaryOp::Pow => power(&l, &r)?,
    };
    Ok(value)
}

fn arithmetic(
    symbol: &str,
    l: &Value,
    r: &Value,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value, String> {
    let value = match operands(symbol, l, r)? {
        (Number::Int(a), Number::Int(b)) => int_op(a, b)
            .map(Value::Int)
            .unwrap_or_else(|| Value::Float(float_op(a as f64, b as f64))),
        (a, b) => Value::Float(float_op(a.as_f64(), b.as_f64())),
    };
    Ok(value)
}

fn divide(l: &Value, r: &Value) -> Result<Value, String> {
    let (a, b) = operands("/", l, r)?;
    if b.as_f64() == 0.0 {
        return Err("Division by zero.".to_string());
    }
    if let (Number::Int(x), Number::Int(y)) = (a, b) {
        if x.checked_rem(y) == Some(0) {
            if let Some(q) = x.checked_div(y) {
                return Ok(Value::Int(q));
            }
        }
    }
    Ok(Value::Float(a.as_f64() / b.as_f64()))
}

fn floor_divide(l: &Value, r: &Value) -> Result<Value, String> {
    let (a, b) = operands("//", l, r)?;
    if b.as_f64() == 0.0 {
        return Err("Division by zero.".to_string());
    }
    if let (Number::Int(x), Number::Int(y)) = (a, b) {
        if let (Some(q), Some(rem)) = (x.checked_div(y), x.checked_rem(y)) {
            let q = if rem != 0 && ((x < 0) != (y < 0)) { q - 1 } else { q };
            return Ok(Value::Int(q));
        }
    }
    Ok(Value::Int((a.as_f64() / b.as_f64()).floor() as i64))
}

fn modulo(l: &Value, r: &Value) -> Result<Value, String> {
    let unsupported = || {
        format!(
            "Unsupported operand types: {} % {}",
            l.type_name(),
            r.type_name()
        )
    };
    let a = integer(l).ok_or_else(unsupported)?;
    let b = integer(r).ok_or_else(unsupported)?;
    if b == 0 {
        return Err("Modulo by zero.".to_string());
    }
    Ok(Value::Int(a.checked_rem(b).unwrap_or(0)))
}

fn power(l: &Value, r: &Value) -> Result<Value, String> {
    let value = match operands("**", l, r)? {
        (Number::Int(base), Number::Int(exp)) => u32::try_from(exp)
            .ok()
            .and_then(|exp| base.checked_pow(exp))
            .map(Value::Int)
            .unwrap_or_else(|| Value::Float((base as f64).powf(exp as f64))),
        (a, b) => Value::Float(a.as_f64().powf(b.as_f64())),
    };
    Ok(value)
}

fn compare(l: &Value, r: &Value) -> Result<Ordering, String> {
    let unsupported = || {
        format!(
            "Unsupported comparison between {} and {}.",
            l.type_name(),
            r.type_name()
        )
    };

    match (l, r) {
        (Value::List(_) | Value::Map(_) | Value::Object(_), _)
        | (_, Value::List(_) | Value::Map(_) | Value::Object(_)) => Err(unsupported()),
        (Value::Str(a), Value::Str(b)) => match (l.as_number(), r.as_number()) {
            (Some(x), Some(y)) => Ok(compare_numbers(x, y)),
            _ => Ok(a.cmp(b)),
        },
        _ => match (l.as_number(), r.as_number()) {
            (Some(x), Some(y)) => Ok(compare_numbers(x, y)),
            _ => Ok(l.to_display()?.cmp(&r.to_display()?)),
        },
    }
}

fn compare_numbers(a: Number, b: Number) -> Ordering {
    match (a, b) {
        (Number::Int(x), Number::Int(y)) => x.cmp(&y),
        _ => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::List(items) => items.iter().any(|item| needle.loose_eq(item)),
        Value::Map(entries) => entries.values().any(|item| needle.loose_eq(item)),
        Value::Str(s) => match needle {
            Value::Str(_) | Value::Int(_) | Value::Float(_) => needle
                .to_display()
                .map(|n| s.contains(n.as_str()))
                .unwrap_or(false),
            _ => false,
        },
        _ => false,
    }
}

fn range(l: &Value, r: &Value) -> Result<Value, String> {
    if let (Some(Number::Int(start)), Some(Number::Int(end))) = (l.as_number(), r.as_number()) {
        if start.abs_diff(end) >= MAX_RANGE_LEN {
            return Err("Range is too large.".to_string());
        }
        let items = if start <= end {
            (start..=end).map(Value::Int).collect()
        } else {
            (end..=start).rev().map(Value::Int).collect()
        };
        return Ok(Value::List(items));
    }

    let single_char = |v: &Value| {
        let s = v.as_str()?;
        let mut chars = s.chars();
        let c = chars.next()?;
        chars.next().is_none().then_some(c)
    };

    match (single_char(l), single_char(r)) {
        (Some(start), Some(end)) => {
            let items = if start <= end {
                (start..=end).map(|c| Value::Str(c.to_string())).collect()
            } else {
                (end..=start).rev().map(|c| Value::Str(c.to_string())).collect()
            };
            Ok(Value::List(items))
        }
        _ => Err(format!(
            "Range bounds must be integers or single characters, got {} and {}.",
            l.type_name(),
            r.type_name()
        )),
    }
}

