//! PEST-based parser for the block template syntax
//!
//! Tags are parsed flat by the grammar and nested here, which keeps error messages
//! about unbalanced blocks in one place.

use std::collections::BTreeSet;
use std::iter::Peekable;
use std::sync::LazyLock;
use std::vec::IntoIter;

use pest::error::{ErrorVariant, InputLocation, LineColLocation};
use pest::iterators::{Pair, Pairs};
use pest::pratt_parser::{Assoc, Op, PrattParser};
use pest::Parser;
use pest_derive::Parser;

use super::ast::{BinaryOp, Expr, ExprKind, Node, TestName, UnaryOp};
use super::EngineError;

/* ===================== PEST Parser ===================== */

#[derive(Parser)]
#[grammar = "engine/template.pest"]
struct TemplateParser;

static PRATT: LazyLock<PrattParser<Rule>> = LazyLock::new(|| {
    PrattParser::new()
        .op(Op::infix(Rule::op_or, Assoc::Left))
        .op(Op::infix(Rule::op_and, Assoc::Left))
        .op(Op::infix(Rule::op_eq, Assoc::Left)
            | Op::infix(Rule::op_ne, Assoc::Left)
            | Op::infix(Rule::op_lt, Assoc::Left)
            | Op::infix(Rule::op_gt, Assoc::Left)
            | Op::infix(Rule::op_le, Assoc::Left)
            | Op::infix(Rule::op_ge, Assoc::Left)
            | Op::infix(Rule::op_in, Assoc::Left)
            | Op::infix(Rule::op_not_in, Assoc::Left)
            | Op::infix(Rule::op_starts_with, Assoc::Left)
            | Op::infix(Rule::op_ends_with, Assoc::Left))
        .op(Op::infix(Rule::op_range, Assoc::Left))
        .op(Op::infix(Rule::op_add, Assoc::Left) | Op::infix(Rule::op_sub, Assoc::Left))
        .op(Op::infix(Rule::op_concat, Assoc::Left))
        .op(Op::prefix(Rule::op_not))
        .op(Op::infix(Rule::op_mul, Assoc::Left)
            | Op::infix(Rule::op_div, Assoc::Left)
            | Op::infix(Rule::op_floor_div, Assoc::Left)
            | Op::infix(Rule::op_mod, Assoc::Left))
        .op(Op::infix(Rule::op_pow, Assoc::Right))
        .op(Op::infix(Rule::op_coalesce, Assoc::Right))
        .op(Op::prefix(Rule::op_neg) | Op::prefix(Rule::op_pos))
        .op(Op::postfix(Rule::method_call)
            | Op::postfix(Rule::attribute)
            | Op::postfix(Rule::subscript)
            | Op::postfix(Rule::filter)
            | Op::postfix(Rule::test))
});

type ParseResult<T> = Result<T, EngineError>;

/// Translate a grammar failure into an engine syntax error
///
/// Failures at the end of the input mean a tag was never closed; anything else
/// names the offending text and the deduplicated set of things that could follow.
fn syntax_error(err: pest::error::Error<Rule>, source: &str) -> EngineError {
    let line = match err.line_col {
        LineColLocation::Pos((line, _)) => line,
        LineColLocation::Span((line, _), _) => line,
    };
    let position = match err.location {
        InputLocation::Pos(position) => position,
        InputLocation::Span((start, _)) => start,
    };
    let rest = source.get(position..).unwrap_or_default();

    if rest.trim().is_empty() {
        return syntax("Unexpected end of template, unclosed tag.", line);
    }

    let found: String = rest
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .chars()
        .take(20)
        .collect();

    let message = match &err.variant {
        ErrorVariant::ParsingError { positives, .. } if !positives.is_empty() => {
            let labels: BTreeSet<&'static str> = positives.iter().map(rule_label).collect();
            let labels: Vec<&str> = labels.into_iter().collect();
            format!(
                "Unexpected \"{}\", expected {}.",
                found,
                join_alternatives(&labels)
            )
        }
        ErrorVariant::ParsingError { .. } => format!("Unexpected \"{}\".", found),
        ErrorVariant::CustomError { message } => message.clone(),
    };

    syntax(message, line)
}

/// Human readable rule names for syntax errors
fn rule_label(rule: &Rule) -> &'static str {
    match rule {
        Rule::EOI => "end of template",
        Rule::expression | Rule::infix_expr | Rule::arguments => "expression",
        Rule::identifier | Rule::name => "name",
        Rule::tag | Rule::print_tag => "tag",
        Rule::keyword
        | Rule::set_tag
        | Rule::if_tag
        | Rule::elseif_tag
        | Rule::else_tag
        | Rule::endif_tag
        | Rule::for_tag
        | Rule::endfor_tag
        | Rule::do_tag
        | Rule::return_tag
        | Rule::unknown_tag => "tag name",
        Rule::kw_set => "\"set\"",
        Rule::kw_if => "\"if\"",
        Rule::kw_elseif => "\"elseif\"",
        Rule::kw_else => "\"else\"",
        Rule::kw_endif => "\"endif\"",
        Rule::kw_for => "\"for\"",
        Rule::kw_in => "\"in\"",
        Rule::kw_endfor => "\"endfor\"",
        Rule::kw_do => "\"do\"",
        Rule::kw_return => "\"return\"",
        Rule::kw_is | Rule::test => "\"is\"",
        Rule::kw_not | Rule::op_not => "\"not\"",
        Rule::conditional => "\"?\"",
        Rule::op_or
        | Rule::op_and
        | Rule::op_coalesce
        | Rule::op_eq
        | Rule::op_ne
        | Rule::op_le
        | Rule::op_ge
        | Rule::op_lt
        | Rule::op_gt
        | Rule::op_not_in
        | Rule::op_in
        | Rule::op_starts_with
        | Rule::op_ends_with
        | Rule::op_range
        | Rule::op_add
        | Rule::op_sub
        | Rule::op_concat
        | Rule::op_floor_div
        | Rule::op_div
        | Rule::op_pow
        | Rule::op_mul
        | Rule::op_mod
        | Rule::op_neg
        | Rule::op_pos => "operator",
        Rule::method_call | Rule::attribute => "\".\"",
        Rule::subscript => "\"[\"",
        Rule::filter => "\"|\"",
        Rule::string | Rule::dq_inner | Rule::sq_inner => "string",
        Rule::hash_entry | Rule::hash_key => "hash key",
        _ => "value",
    }
}

/// `a`, `a or b`, `a, b or c`
fn join_alternatives(labels: &[&str]) -> String {
    match labels {
        [] => String::new(),
        [only] => (*only).to_string(),
        [init @ .., last] => format!("{} or {}", init.join(", "), last),
    }
}

fn syntax(message: impl Into<String>, line: usize) -> EngineError {
    EngineError::Syntax {
        message: message.into(),
        line,
    }
}

fn line_of(pair: &Pair<Rule>) -> usize {
    pair.line_col().0
}

fn is_keyword(rule: Rule) -> bool {
    matches!(
        rule,
        Rule::kw_set
            | Rule::kw_if
            | Rule::kw_elseif
            | Rule::kw_else
            | Rule::kw_endif
            | Rule::kw_for
            | Rule::kw_in
            | Rule::kw_endfor
            | Rule::kw_do
            | Rule::kw_return
            | Rule::kw_is
    )
}

/// Children of a pair without keyword tokens
fn significant(pair: Pair<Rule>) -> impl Iterator<Item = Pair<Rule>> {
    pair.into_inner().filter(|p| !is_keyword(p.as_rule()))
}

/* ===================== Public API ===================== */

/// Parse template source into a node list
pub fn parse_template(source: &str) -> ParseResult<Vec<Node>> {
    let mut pairs =
        TemplateParser::parse(Rule::template, source).map_err(|err| syntax_error(err, source))?;
    let Some(template) = pairs.next() else {
        return Ok(Vec::new());
    };

    let items = template
        .into_inner()
        .filter(|p| !matches!(p.as_rule(), Rule::EOI | Rule::comment))
        .map(build_item)
        .collect::<ParseResult<Vec<Item>>>()?;

    let mut items = items.into_iter().peekable();
    let (nodes, stray) = build_nodes(&mut items, &[])?;

    match stray {
        Some(item) => Err(unexpected(&item)),
        None => Ok(nodes),
    }
}

/* ===================== Flat Items ===================== */

/// One top-level piece of the template before blocks are nested
#[derive(Debug)]
enum Item {
    Node(Node),
    If {
        test: Expr,
        line: usize,
    },
    ElseIf {
        test: Expr,
        line: usize,
    },
    Else {
        line: usize,
    },
    EndIf {
        line: usize,
    },
    For {
        key: Option<String>,
        value: String,
        iterable: Expr,
        line: usize,
    },
    EndFor {
        line: usize,
    },
}

impl Item {
    fn tag_name(&self) -> &'static str {
        match self {
            Item::Node(_) => "",
            Item::If { .. } => "if",
            Item::ElseIf { .. } => "elseif",
            Item::Else { .. } => "else",
            Item::EndIf { .. } => "endif",
            Item::For { .. } => "for",
            Item::EndFor { .. } => "endfor",
        }
    }

    fn line(&self) -> usize {
        match self {
            Item::Node(node) => node.line(),
            Item::If { line, .. }
            | Item::ElseIf { line, .. }
            | Item::Else { line }
            | Item::EndIf { line }
            | Item::For { line, .. }
            | Item::EndFor { line } => *line,
        }
    }
}

fn unexpected(item: &Item) -> EngineError {
    syntax(format!("Unexpected \"{}\" tag.", item.tag_name()), item.line())
}

fn build_item(pair: Pair<Rule>) -> ParseResult<Item> {
    match pair.as_rule() {
        Rule::text => Ok(Item::Node(Node::Text(pair.as_str().to_string()))),
        Rule::print_tag => {
            let line = line_of(&pair);
            let expr = build_expression(first_inner(pair)?)?;
            Ok(Item::Node(Node::Print { expr, line }))
        }
        Rule::tag => build_tag(first_inner(pair)?),
        other => Err(syntax(format!("Unexpected template content: {:?}", other), line_of(&pair))),
    }
}

fn first_inner(pair: Pair<Rule>) -> ParseResult<Pair<Rule>> {
    let line = line_of(&pair);
    let rule = pair.as_rule();
    significant(pair)
        .next()
        .ok_or_else(|| syntax(format!("Empty {:?}", rule), line))
}

fn build_tag(pair: Pair<Rule>) -> ParseResult<Item> {
    let line = line_of(&pair);

    match pair.as_rule() {
        Rule::set_tag => {
            let mut targets = Vec::new();
            let mut values = Vec::new();
            for part in significant(pair) {
                match part.as_rule() {
                    Rule::identifier => targets.push(part.as_str().to_string()),
                    _ => values.push(build_expression(part)?),
                }
            }
            if targets.len() != values.len() {
                return Err(syntax(
                    "When using set, you must have the same number of variables and assignments.",
                    line,
                ));
            }
            Ok(Item::Node(Node::Set {
                targets,
                values,
                line,
            }))
        }
        Rule::if_tag => Ok(Item::If {
            test: build_expression(first_inner(pair)?)?,
            line,
        }),
        Rule::elseif_tag => Ok(Item::ElseIf {
            test: build_expression(first_inner(pair)?)?,
            line,
        }),
        Rule::else_tag => Ok(Item::Else { line }),
        Rule::endif_tag => Ok(Item::EndIf { line }),
        Rule::for_tag => {
            let mut names = Vec::new();
            let mut iterable = None;
            for part in significant(pair) {
                match part.as_rule() {
                    Rule::identifier => names.push(part.as_str().to_string()),
                    _ => iterable = Some(build_expression(part)?),
                }
            }
            let iterable = iterable.ok_or_else(|| syntax("Missing iterable in for loop", line))?;
            let (key, value) = match names.len() {
                1 => (None, names.remove(0)),
                2 => {
                    let value = names.remove(1);
                    (Some(names.remove(0)), value)
                }
                _ => return Err(syntax("Invalid for loop variables", line)),
            };
            Ok(Item::For {
                key,
                value,
                iterable,
                line,
            })
        }
        Rule::endfor_tag => Ok(Item::EndFor { line }),
        Rule::do_tag => Ok(Item::Node(Node::Do {
            expr: build_expression(first_inner(pair)?)?,
            line,
        })),
        Rule::return_tag => Ok(Item::Node(Node::Return {
            expr: build_expression(first_inner(pair)?)?,
            line,
        })),
        Rule::unknown_tag => {
            let name = first_inner(pair)?.as_str().to_string();
            Err(syntax(format!("Unknown \"{}\" tag.", name), line))
        }
        other => Err(syntax(format!("Unexpected tag rule: {:?}", other), line)),
    }
}

/* ===================== Block Nesting ===================== */

type ItemStream = Peekable<IntoIter<Item>>;

/// Collect nodes until one of `end_tags` (returned) or the end of input (`None`)
fn build_nodes(items: &mut ItemStream, end_tags: &[&str]) -> ParseResult<(Vec<Node>, Option<Item>)> {
    let mut nodes = Vec::new();

    while let Some(item) = items.next() {
        match item {
            Item::Node(node) => nodes.push(node),
            Item::If { test, line } => nodes.push(build_if(items, test, line)?),
            Item::For {
                key,
                value,
                iterable,
                line,
            } => nodes.push(build_for(items, key, value, iterable, line)?),
            other if end_tags.contains(&other.tag_name()) => return Ok((nodes, Some(other))),
            other => return Err(unexpected(&other)),
        }
    }

    Ok((nodes, None))
}

fn unclosed(tag: &str, line: usize) -> EngineError {
    syntax(
        format!("Unexpected end of template, unclosed \"{}\" block.", tag),
        line,
    )
}

fn build_if(items: &mut ItemStream, test: Expr, line: usize) -> ParseResult<Node> {
    let mut branches = Vec::new();
    let mut current = test;

    loop {
        let (body, end) = build_nodes(items, &["elseif", "else", "endif"])?;
        branches.push((current, body));

        match end {
            Some(Item::ElseIf { test, .. }) => current = test,
            Some(Item::Else { .. }) => {
                let (otherwise, end) = build_nodes(items, &["endif"])?;
                if end.is_none() {
                    return Err(unclosed("if", line));
                }
                return Ok(Node::If {
                    branches,
                    otherwise: Some(otherwise),
                    line,
                });
            }
            Some(_) => {
                return Ok(Node::If {
                    branches,
                    otherwise: None,
                    line,
                })
            }
            None => return Err(unclosed("if", line)),
        }
    }
}

fn build_for(
    items: &mut ItemStream,
    key: Option<String>,
    value: String,
    iterable: Expr,
    line: usize,
) -> ParseResult<Node> {
    let (body, end) = build_nodes(items, &["else", "endfor"])?;

    let otherwise = match end {
        Some(Item::Else { .. }) => {
            let (otherwise, end) = build_nodes(items, &["endfor"])?;
            if end.is_none() {
                return Err(unclosed("for", line));
            }
            Some(otherwise)
        }
        Some(_) => None,
        None => return Err(unclosed("for", line)),
    };

    Ok(Node::For {
        key,
        value,
        iterable,
        body,
        otherwise,
        line,
    })
}

/* ===================== Expressions ===================== */

fn build_expression(pair: Pair<Rule>) -> ParseResult<Expr> {
    match pair.as_rule() {
        Rule::expression => {
            let line = line_of(&pair);
            let mut inner = pair.into_inner();
            let test = match inner.next() {
                Some(first) => build_expression(first)?,
                None => return Err(syntax("Empty expression", line)),
            };
            let Some(conditional) = inner.next() else {
                return Ok(test);
            };
            let mut branches = conditional.into_inner();
            let (Some(then_p), Some(else_p)) = (branches.next(), branches.next()) else {
                return Err(syntax("Incomplete conditional expression", line));
            };
            Ok(Expr::new(
                ExprKind::Conditional {
                    test: Box::new(test),
                    then_e: Box::new(build_expression(then_p)?),
                    else_e: Box::new(build_expression(else_p)?),
                },
                line,
            ))
        }
        Rule::infix_expr => build_infix(pair.into_inner()),
        _ => build_primary(pair),
    }
}

fn build_infix(pairs: Pairs<Rule>) -> ParseResult<Expr> {
    PRATT
        .map_primary(build_primary)
        .map_prefix(|op, operand| {
            let line = line_of(&op);
            let op = match op.as_rule() {
                Rule::op_not => UnaryOp::Not,
                Rule::op_neg => UnaryOp::Neg,
                _ => UnaryOp::Pos,
            };
            Ok(Expr::new(
                ExprKind::Unary {
                    op,
                    operand: Box::new(operand?),
                },
                line,
            ))
        })
        .map_postfix(|operand, op| build_postfix(operand?, op))
        .map_infix(|left, op, right| {
            let left = left?;
            let line = left.line;
            let op = binary_op(op.as_rule())
                .ok_or_else(|| syntax(format!("Unknown operator \"{}\"", op.as_str()), line))?;
            Ok(Expr::new(
                ExprKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right?),
                },
                line,
            ))
        })
        .parse(pairs)
}

fn binary_op(rule: Rule) -> Option<BinaryOp> {
    let op = match rule {
        Rule::op_or => BinaryOp::Or,
        Rule::op_and => BinaryOp::And,
        Rule::op_eq => BinaryOp::Eq,
        Rule::op_ne => BinaryOp::Ne,
        Rule::op_lt => BinaryOp::Lt,
        Rule::op_gt => BinaryOp::Gt,
        Rule::op_le => BinaryOp::Le,
        Rule::op_ge => BinaryOp::Ge,
        Rule::op_in => BinaryOp::In,
        Rule::op_not_in => BinaryOp::NotIn,
        Rule::op_starts_with => BinaryOp::StartsWith,
        Rule::op_ends_with => BinaryOp::EndsWith,
        Rule::op_range => BinaryOp::Range,
        Rule::op_add => BinaryOp::Add,
        Rule::op_sub => BinaryOp::Sub,
        Rule::op_concat => BinaryOp::Concat,
        Rule::op_mul => BinaryOp::Mul,
        Rule::op_div => BinaryOp::Div,
        Rule::op_floor_div => BinaryOp::FloorDiv,
        Rule::op_mod => BinaryOp::Mod,
        Rule::op_pow => BinaryOp::Pow,
        Rule::op_coalesce => BinaryOp::Coalesce,
        _ => return None,
    };
    Some(op)
}

fn build_postfix(operand: Expr, op: Pair<Rule>) -> ParseResult<Expr> {
    let line = line_of(&op);
    let rule = op.as_rule();
    let mut inner = op.into_inner();

    let kind = match rule {
        Rule::attribute => ExprKind::Attribute {
            object: Box::new(operand),
            name: next_str(&mut inner, line)?,
        },
        Rule::method_call => ExprKind::MethodCall {
            object: Box::new(operand),
            method: next_str(&mut inner, line)?,
            args: build_arguments(inner.next())?,
        },
        Rule::subscript => {
            let index = inner
                .next()
                .ok_or_else(|| syntax("Missing subscript", line))?;
            ExprKind::Subscript {
                object: Box::new(operand),
                index: Box::new(build_expression(index)?),
            }
        }
        Rule::filter => ExprKind::Filter {
            operand: Box::new(operand),
            name: next_str(&mut inner, line)?,
            args: build_arguments(inner.next())?,
        },
        Rule::test => {
            let parts: Vec<Pair<Rule>> = inner.filter(|p| p.as_rule() != Rule::kw_is).collect();
            let negated = parts.iter().any(|p| p.as_rule() == Rule::kw_not);
            let name = parts
                .iter()
                .find(|p| p.as_rule() == Rule::identifier)
                .map(|p| p.as_str())
                .unwrap_or_default();
            let test = TestName::from_name(name)
                .ok_or_else(|| syntax(format!("Unknown \"{}\" test.", name), line))?;
            ExprKind::Test {
                operand: Box::new(operand),
                name: test,
                negated,
            }
        }
        other => return Err(syntax(format!("Unexpected postfix rule: {:?}", other), line)),
    };

    Ok(Expr::new(kind, line))
}

fn next_str(inner: &mut Pairs<Rule>, line: usize) -> ParseResult<String> {
    inner
        .next()
        .map(|p| p.as_str().to_string())
        .ok_or_else(|| syntax("Missing name", line))
}

fn build_arguments(pair: Option<Pair<Rule>>) -> ParseResult<Vec<Expr>> {
    match pair {
        Some(args) => args.into_inner().map(build_expression).collect(),
        None => Ok(Vec::new()),
    }
}

fn build_primary(pair: Pair<Rule>) -> ParseResult<Expr> {
    let line = line_of(&pair);

    let kind = match pair.as_rule() {
        Rule::expression | Rule::infix_expr => return build_expression(pair),
        Rule::null_lit => ExprKind::Null,
        Rule::boolean => ExprKind::Bool(pair.as_str() == "true"),
        Rule::integer => match pair.as_str().parse::<i64>() {
            Ok(i) => ExprKind::Int(i),
            Err(_) => ExprKind::Float(
                pair.as_str()
                    .parse::<f64>()
                    .map_err(|e| syntax(format!("Invalid number: {}", e), line))?,
            ),
        },
        Rule::float => ExprKind::Float(
            pair.as_str()
                .parse::<f64>()
                .map_err(|e| syntax(format!("Invalid number: {}", e), line))?,
        ),
        Rule::string => ExprKind::Str(unescape(first_inner(pair)?.as_str())),
        Rule::identifier => ExprKind::Name(pair.as_str().to_string()),
        Rule::function_call => {
            let mut inner = pair.into_inner();
            ExprKind::FunctionCall {
                name: next_str(&mut inner, line)?,
                args: build_arguments(inner.next())?,
            }
        }
        Rule::array => ExprKind::Array(
            pair.into_inner()
                .map(build_expression)
                .collect::<ParseResult<_>>()?,
        ),
        Rule::hash => {
            let mut entries = Vec::new();
            for entry in pair.into_inner() {
                let mut parts = entry.into_inner();
                let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
                    return Err(syntax("Invalid hash entry", line));
                };
                entries.push((build_hash_key(key)?, build_expression(value)?));
            }
            ExprKind::Hash(entries)
        }
        other => return Err(syntax(format!("Unexpected expression rule: {:?}", other), line)),
    };

    Ok(Expr::new(kind, line))
}

/// Bare identifiers used as hash keys are string keys
fn build_hash_key(pair: Pair<Rule>) -> ParseResult<Expr> {
    let key = first_inner(pair)?;
    if key.as_rule() == Rule::identifier {
        return Ok(Expr::new(ExprKind::Str(key.as_str().to_string()), line_of(&key)));
    }
    build_primary(key)
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();

    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }

    out
}
