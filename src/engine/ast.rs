//! Abstract Syntax Tree node types
//!
//! Lines are 1-based and refer to the template source.

/// Template node
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Literal text, written to the output unchanged
    Text(String),
    /// `{{ expr }}`
    Print { expr: Expr, line: usize },
    /// `{% set a, b = x, y %}`
    Set {
        targets: Vec<String>,
        values: Vec<Expr>,
        line: usize,
    },
    /// `{% if %}` … `{% elseif %}` … `{% else %}` … `{% endif %}`
    If {
        branches: Vec<(Expr, Vec<Node>)>,
        otherwise: Option<Vec<Node>>,
        line: usize,
    },
    /// `{% for [key,] value in iterable %}` … `{% else %}` … `{% endfor %}`
    For {
        key: Option<String>,
        value: String,
        iterable: Expr,
        body: Vec<Node>,
        otherwise: Option<Vec<Node>>,
        line: usize,
    },
    /// `{% do expr %}`
    Do { expr: Expr, line: usize },
    /// `{% return expr %}`
    Return { expr: Expr, line: usize },
}

impl Node {
    /// Tag name checked against the sandbox policy (`None` for text and prints)
    pub fn tag(&self) -> Option<&'static str> {
        match self {
            Node::Text(_) | Node::Print { .. } => None,
            Node::Set { .. } => Some("set"),
            Node::If { .. } => Some("if"),
            Node::For { .. } => Some("for"),
            Node::Do { .. } => Some("do"),
            Node::Return { .. } => Some("return"),
        }
    }

    pub fn line(&self) -> usize {
        match self {
            Node::Text(_) => 0,
            Node::Print { line, .. }
            | Node::Set { line, .. }
            | Node::If { line, .. }
            | Node::For { line, .. }
            | Node::Do { line, .. }
            | Node::Return { line, .. } => *line,
        }
    }
}

/// Expression with the line it starts on
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub line: usize,
}

impl Expr {
    pub fn new(kind: ExprKind, line: usize) -> Self {
        Self { kind, line }
    }
}

/// Expression AST node
#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(Vec<Expr>),
    Hash(Vec<(Expr, Expr)>),
    Name(String),
    /// `object.name`
    Attribute { object: Box<Expr>, name: String },
    /// `object[index]`
    Subscript { object: Box<Expr>, index: Box<Expr> },
    /// `object.method(args)`
    MethodCall {
        object: Box<Expr>,
        method: String,
        args: Vec<Expr>,
    },
    /// `name(args)`
    FunctionCall { name: String, args: Vec<Expr> },
    /// `operand|name(args)`
    Filter {
        operand: Box<Expr>,
        name: String,
        args: Vec<Expr>,
    },
    /// `operand is [not] name`
    Test {
        operand: Box<Expr>,
        name: TestName,
        negated: bool,
    },
    Unary { op: UnaryOp, operand: Box<Expr> },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Conditional {
        test: Box<Expr>,
        then_e: Box<Expr>,
        else_e: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Pos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    In,
    NotIn,
    StartsWith,
    EndsWith,
    Range,
    Add,
    Sub,
    Concat,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    Coalesce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestName {
    Defined,
    Null,
    Empty,
    Even,
    Odd,
    Iterable,
}

impl TestName {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "defined" => Some(TestName::Defined),
            "null" | "none" => Some(TestName::Null),
            "empty" => Some(TestName::Empty),
            "even" => Some(TestName::Even),
            "odd" => Some(TestName::Odd),
            "iterable" => Some(TestName::Iterable),
            _ => None,
        }
    }
}

/// Walk every expression of a node list, children first
pub fn visit_exprs<'a>(nodes: &'a [Node], f: &mut dyn FnMut(&'a Expr)) {
    for node in nodes {
        match node {
            Node::Text(_) => {}
            Node::Print { expr, .. } | Node::Do { expr, .. } | Node::Return { expr, .. } => {
                visit_expr(expr, f)
            }
            Node::Set { values, .. } => values.iter().for_each(|e| visit_expr(e, f)),
            Node::If {
                branches,
                otherwise,
                ..
            } => {
                for (test, body) in branches {
                    visit_expr(test, f);
                    visit_exprs(body, f);
                }
                if let Some(body) = otherwise {
                    visit_exprs(body, f);
                }
            }
            Node::For {
                iterable,
                body,
                otherwise,
                ..
            } => {
                visit_expr(iterable, f);
                visit_exprs(body, f);
                if let Some(body) = otherwise {
                    visit_exprs(body, f);
                }
            }
        }
    }
}

fn visit_expr<'a>(expr: &'a Expr, f: &mut dyn FnMut(&'a Expr)) {
    match &expr.kind {
        ExprKind::Null
        | ExprKind::Bool(_)
        | ExprKind::Int(_)
        | ExprKind::Float(_)
        | ExprKind::Str(_)
        | ExprKind::Name(_) => {}
        ExprKind::Array(items) => items.iter().for_each(|e| visit_expr(e, f)),
        ExprKind::Hash(entries) => {
            for (k, v) in entries {
                visit_expr(k, f);
                visit_expr(v, f);
            }
        }
        ExprKind::Attribute { object, .. } => visit_expr(object, f),
        ExprKind::Subscript { object, index } => {
            visit_expr(object, f);
            visit_expr(index, f);
        }
        ExprKind::MethodCall { object, args, .. } => {
            visit_expr(object, f);
            args.iter().for_each(|e| visit_expr(e, f));
        }
        ExprKind::FunctionCall { args, .. } => args.iter().for_each(|e| visit_expr(e, f)),
        ExprKind::Filter { operand, args, .. } => {
            visit_expr(operand, f);
            args.iter().for_each(|e| visit_expr(e, f));
        }
        ExprKind::Test { operand, .. } | ExprKind::Unary { operand, .. } => visit_expr(operand, f),
        ExprKind::Binary { left, right, .. } => {
            visit_expr(left, f);
            visit_expr(right, f);
        }
        ExprKind::Conditional {
            test,
            then_e,
            else_e,
        } => {
            visit_expr(test, f);
            visit_expr(then_e, f);
            visit_expr(else_e, f);
        }
    }
    f(expr);
}

/// Walk every node of a tree, parents first
pub fn visit_nodes<'a>(nodes: &'a [Node], f: &mut dyn FnMut(&'a Node)) {
    for node in nodes {
        f(node);
        match node {
            Node::If {
                branches,
                otherwise,
                ..
            } => {
                for (_, body) in branches {
                    visit_nodes(body, f);
                }
                if let Some(body) = otherwise {
                    visit_nodes(body, f);
                }
            }
            Node::For {
                body, otherwise, ..
            } => {
                visit_nodes(body, f);
                if let Some(body) = otherwise {
                    visit_nodes(body, f);
                }
            }
            _ => {}
        }
    }
}
