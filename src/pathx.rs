// Copyright (c) 2025 ETH Zurich
// Fabian Schuiki <fschuiki@iis.ee.ethz.ch>

//! Path expressions.
//!
//! This module implements the XPath subset every public API resolves
//! paths with: location steps with axes and predicates, relational
//! and arithmetic operators, variables, and the handful of functions
//! (`count`, `glob`, `label`, `last`, `position`, `regexp`, `not`).
//!
//! Expressions are parsed by hand with a character cursor; syntax
//! errors carry the expression annotated with `|=|` at the point of
//! failure.

use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use itertools::Itertools;

use crate::error::{Error, Result};
use crate::rx::Regex;
use crate::tree::{NodeId, Tree};

/// The result of evaluating an expression.
#[derive(Clone, Debug)]
pub enum Value {
    /// An ordered node-set without duplicates.
    Nodes(Vec<NodeId>),
    String(String),
    Number(i64),
    Bool(bool),
    Regexp(Rc<Regex>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Nodes(_) => "nodeset",
            Value::String(_) => "string",
            Value::Number(_) => "number",
            Value::Bool(_) => "boolean",
            Value::Regexp(_) => "regexp",
        }
    }
}

/// Variable bindings; values are captured at definition time.
#[derive(Debug, Default)]
pub struct SymbolTable {
    vars: IndexMap<String, Value>,
}

impl SymbolTable {
    pub fn new() -> SymbolTable {
        SymbolTable::default()
    }

    /// Bind `name` to a captured value.
    pub fn define(&mut self, name: &str, value: Value) {
        self.vars.insert(name.to_string(), value);
    }

    /// Remove a binding; returns whether it existed.
    pub fn undefine(&mut self, name: &str) -> bool {
        self.vars.shift_remove(name).is_some()
    }

    fn lookup(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Axis {
    SelfAxis,
    Child,
    Descendant,
    DescendantOrSelf,
    Parent,
    Ancestor,
    Root,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum NameTest {
    /// Match any labeled node.
    Any,
    /// Match a specific label.
    Name(String),
}

#[derive(Clone, Debug)]
struct Step {
    axis: Axis,
    test: NameTest,
    preds: Vec<Expr>,
}

#[derive(Clone, Debug)]
struct LocPath {
    absolute: bool,
    steps: Vec<Step>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Op {
    Or,
    And,
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    ReMatch,
    ReNoMatch,
    Plus,
    Minus,
    Mult,
    Div,
    Mod,
    Union,
}

#[derive(Clone, Debug)]
enum Expr {
    Binary(Op, Box<Expr>, Box<Expr>),
    Literal(String),
    Number(i64),
    Var(String),
    Call(String, Vec<Expr>),
    Path(LocPath),
    /// A primary expression continued by location steps, e.g.
    /// `$hosts/ipaddr`.
    Filter(Box<Expr>, LocPath),
}

/// A parsed path expression.
#[derive(Clone, Debug)]
pub struct PathExpr {
    src: String,
    ast: Expr,
}

impl fmt::Display for PathExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.src)
    }
}

/// Parse a path expression.
pub fn parse(src: &str) -> Result<PathExpr> {
    let mut p = Parser {
        src,
        bytes: src.as_bytes(),
        pos: 0,
    };
    p.skip_ws();
    let ast = p.parse_or()?;
    p.skip_ws();
    if p.pos != p.bytes.len() {
        return Err(p.error("trailing garbage"));
    }
    Ok(PathExpr {
        src: src.to_string(),
        ast,
    })
}

struct Parser<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, _why: &str) -> Error {
        Error::Pathx {
            details: format!("{}|=|{}", &self.src[..self.pos], &self.src[self.pos..]),
            pos: self.pos,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn looking_at(&mut self, word: &str) -> bool {
        if self.src[self.pos..].starts_with(word) {
            self.pos += word.len();
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\n')) {
            self.pos += 1;
        }
    }

    /// A keyword is a word not glued to further name characters.
    fn looking_at_keyword(&mut self, word: &str) -> bool {
        let end = self.pos + word.len();
        if self.src[self.pos..].starts_with(word)
            && !self
                .bytes
                .get(end)
                .copied()
                .map(is_name_char)
                .unwrap_or(false)
        {
            self.pos = end;
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        loop {
            self.skip_ws();
            if self.looking_at_keyword("or") {
                self.skip_ws();
                let right = self.parse_and()?;
                left = Expr::Binary(Op::Or, Box::new(left), Box::new(right));
            } else {
                return Ok(left);
            }
        }
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_equality()?;
        loop {
            self.skip_ws();
            if self.looking_at_keyword("and") {
                self.skip_ws();
                let right = self.parse_equality()?;
                left = Expr::Binary(Op::And, Box::new(left), Box::new(right));
            } else {
                return Ok(left);
            }
        }
    }

    fn parse_equality(&mut self) -> Result<Expr> {
        let left = self.parse_relational()?;
        self.skip_ws();
        let op = if self.looking_at("!=") {
            Op::Neq
        } else if self.looking_at("=~") {
            Op::ReMatch
        } else if self.looking_at("!~") {
            Op::ReNoMatch
        } else if self.looking_at("=") {
            Op::Eq
        } else {
            return Ok(left);
        };
        self.skip_ws();
        let right = self.parse_relational()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn parse_relational(&mut self) -> Result<Expr> {
        let left = self.parse_additive()?;
        self.skip_ws();
        let op = if self.looking_at("<=") {
            Op::Le
        } else if self.looking_at(">=") {
            Op::Ge
        } else if self.looking_at("<") {
            Op::Lt
        } else if self.looking_at(">") {
            Op::Gt
        } else {
            return Ok(left);
        };
        self.skip_ws();
        let right = self.parse_additive()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            self.skip_ws();
            let op = if self.looking_at("+") {
                Op::Plus
            } else if self.looking_at("-") {
                Op::Minus
            } else {
                return Ok(left);
            };
            self.skip_ws();
            let right = self.parse_multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        let mut left = self.parse_union()?;
        loop {
            self.skip_ws();
            let op = if self.looking_at("*") {
                Op::Mult
            } else if self.looking_at_keyword("div") {
                Op::Div
            } else if self.looking_at_keyword("mod") {
                Op::Mod
            } else {
                return Ok(left);
            };
            self.skip_ws();
            let right = self.parse_union()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_union(&mut self) -> Result<Expr> {
        let mut left = self.parse_primary()?;
        loop {
            self.skip_ws();
            if self.looking_at("|") {
                self.skip_ws();
                let right = self.parse_primary()?;
                left = Expr::Binary(Op::Union, Box::new(left), Box::new(right));
            } else {
                return Ok(left);
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        self.skip_ws();
        match self.peek() {
            Some(b'(') => {
                self.pos += 1;
                let e = self.parse_or()?;
                self.skip_ws();
                if !self.looking_at(")") {
                    return Err(self.error("expected `)`"));
                }
                Ok(e)
            }
            Some(q @ (b'"' | b'\'')) => {
                self.pos += 1;
                let start = self.pos;
                while let Some(c) = self.peek() {
                    if c == q {
                        let lit = self.src[start..self.pos].to_string();
                        self.pos += 1;
                        return Ok(Expr::Literal(lit));
                    }
                    self.pos += 1;
                }
                Err(self.error("unterminated string"))
            }
            Some(b'$') => {
                self.pos += 1;
                let name = self.parse_name()?;
                let var = Expr::Var(name);
                if self.peek() == Some(b'/') {
                    self.pos += 1;
                    if self.peek() == Some(b'/') {
                        self.pos += 1;
                        let mut path = self.parse_location_path_relative()?;
                        path.steps.insert(
                            0,
                            Step {
                                axis: Axis::DescendantOrSelf,
                                test: NameTest::Any,
                                preds: Vec::new(),
                            },
                        );
                        return Ok(Expr::Filter(Box::new(var), path));
                    }
                    let path = self.parse_location_path_relative()?;
                    return Ok(Expr::Filter(Box::new(var), path));
                }
                Ok(var)
            }
            Some(c) if c.is_ascii_digit() => {
                let start = self.pos;
                while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                    self.pos += 1;
                }
                let n: i64 = self.src[start..self.pos]
                    .parse()
                    .map_err(|_| self.error("bad number"))?;
                Ok(Expr::Number(n))
            }
            Some(b'/' | b'.' | b'*') => Ok(Expr::Path(self.parse_location_path()?)),
            Some(_) => {
                // A name: either a function call or a relative path.
                let save = self.pos;
                let name = self.parse_name()?;
                self.skip_ws();
                if self.peek() == Some(b'(') && is_function(&name) {
                    self.pos += 1;
                    let mut args = Vec::new();
                    self.skip_ws();
                    if self.peek() != Some(b')') {
                        loop {
                            args.push(self.parse_or()?);
                            self.skip_ws();
                            if self.looking_at(",") {
                                self.skip_ws();
                            } else {
                                break;
                            }
                        }
                    }
                    if !self.looking_at(")") {
                        return Err(self.error("expected `)`"));
                    }
                    Ok(Expr::Call(name, args))
                } else {
                    self.pos = save;
                    Ok(Expr::Path(self.parse_location_path()?))
                }
            }
            None => Err(self.error("unexpected end of expression")),
        }
    }

    fn parse_location_path(&mut self) -> Result<LocPath> {
        let mut steps = Vec::new();
        let absolute = self.peek() == Some(b'/');
        if absolute {
            self.pos += 1;
            if self.peek() == Some(b'/') {
                self.pos += 1;
                steps.push(Step {
                    axis: Axis::DescendantOrSelf,
                    test: NameTest::Any,
                    preds: Vec::new(),
                });
                // `//` alone is not a valid path.
                if self.at_path_end() {
                    return Err(self.error("expected a step"));
                }
            } else if self.at_path_end() {
                // A bare `/` selects the root.
                return Ok(LocPath {
                    absolute,
                    steps,
                });
            }
        }
        loop {
            steps.push(self.parse_step()?);
            if self.peek() == Some(b'/') {
                self.pos += 1;
                if self.peek() == Some(b'/') {
                    self.pos += 1;
                    steps.push(Step {
                        axis: Axis::DescendantOrSelf,
                        test: NameTest::Any,
                        preds: Vec::new(),
                    });
                }
            } else {
                break;
            }
        }
        Ok(LocPath { absolute, steps })
    }

    /// A relative path continuing a filter expression.
    fn parse_location_path_relative(&mut self) -> Result<LocPath> {
        let mut steps = Vec::new();
        loop {
            steps.push(self.parse_step()?);
            if self.peek() == Some(b'/') {
                self.pos += 1;
                if self.peek() == Some(b'/') {
                    self.pos += 1;
                    steps.push(Step {
                        axis: Axis::DescendantOrSelf,
                        test: NameTest::Any,
                        preds: Vec::new(),
                    });
                }
            } else {
                break;
            }
        }
        Ok(LocPath {
            absolute: false,
            steps,
        })
    }

    fn at_path_end(&self) -> bool {
        match self.peek() {
            None => true,
            Some(c) => matches!(c, b' ' | b'\t' | b'\n' | b']' | b')' | b',' | b'=' | b'!' | b'<' | b'>' | b'|' | b'+'),
        }
    }

    fn parse_step(&mut self) -> Result<Step> {
        if self.looking_at("..") {
            return Ok(Step {
                axis: Axis::Parent,
                test: NameTest::Any,
                preds: self.parse_predicates()?,
            });
        }
        if self.peek() == Some(b'.') {
            self.pos += 1;
            return Ok(Step {
                axis: Axis::SelfAxis,
                test: NameTest::Any,
                preds: self.parse_predicates()?,
            });
        }
        let axis = self.parse_axis()?;
        let test = if self.peek() == Some(b'*') {
            self.pos += 1;
            NameTest::Any
        } else {
            NameTest::Name(self.parse_name()?)
        };
        Ok(Step {
            axis,
            test,
            preds: self.parse_predicates()?,
        })
    }

    fn parse_axis(&mut self) -> Result<Axis> {
        const AXES: [(&str, Axis); 7] = [
            ("self", Axis::SelfAxis),
            ("child", Axis::Child),
            ("descendant-or-self", Axis::DescendantOrSelf),
            ("descendant", Axis::Descendant),
            ("parent", Axis::Parent),
            ("ancestor", Axis::Ancestor),
            ("root", Axis::Root),
        ];
        for (name, axis) in AXES {
            let end = self.pos + name.len();
            if self.src[self.pos..].starts_with(name) && self.src[end..].starts_with("::") {
                self.pos = end + 2;
                return Ok(axis);
            }
        }
        Ok(Axis::Child)
    }

    fn parse_predicates(&mut self) -> Result<Vec<Expr>> {
        let mut preds = Vec::new();
        while self.peek() == Some(b'[') {
            self.pos += 1;
            self.skip_ws();
            let e = self.parse_or()?;
            self.skip_ws();
            if !self.looking_at("]") {
                return Err(self.error("expected `]`"));
            }
            preds.push(e);
        }
        Ok(preds)
    }

    fn parse_name(&mut self) -> Result<String> {
        let mut name = String::new();
        while let Some(c) = self.src[self.pos..].chars().next() {
            if c == '\\' {
                self.pos += 1;
                match self.src[self.pos..].chars().next() {
                    Some(e) => {
                        name.push(e);
                        self.pos += e.len_utf8();
                    }
                    None => return Err(self.error("dangling escape")),
                }
            } else if !c.is_ascii() || is_name_char(c as u8) {
                name.push(c);
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
        if name.is_empty() {
            return Err(self.error("expected a name"));
        }
        Ok(name)
    }
}

fn is_name_char(c: u8) -> bool {
    !matches!(
        c,
        b'/' | b'[' | b']' | b'(' | b')' | b'=' | b'!' | b'<' | b'>' | b'+' | b'*' | b','
            | b'|' | b'"' | b'\'' | b'$' | b' ' | b'\t' | b'\n'
    )
}

fn is_function(name: &str) -> bool {
    matches!(
        name,
        "last" | "position" | "count" | "label" | "glob" | "regexp" | "not"
    )
}

/// Evaluation context: the tree, the node relative paths start at,
/// and the variables.
pub struct Ctx<'a> {
    pub tree: &'a Tree,
    pub start: NodeId,
    pub symtab: &'a SymbolTable,
}

/// Position information while a predicate runs.
#[derive(Clone, Copy)]
struct PredCtx {
    node: NodeId,
    position: usize,
    size: usize,
}

impl PathExpr {
    /// Evaluate to an arbitrary value.
    pub fn eval(&self, ctx: &Ctx) -> Result<Value> {
        eval_expr(&self.ast, ctx, None)
    }

    /// Evaluate to a node-set; anything else is a path error.
    pub fn nodes(&self, ctx: &Ctx) -> Result<Vec<NodeId>> {
        match self.eval(ctx)? {
            Value::Nodes(ns) => Ok(ns
                .into_iter()
                .filter(|&n| ctx.tree.contains(n))
                .collect()),
            other => Err(Error::Pathx {
                details: format!("{} evaluates to a {}", self.src, other.kind()),
                pos: 0,
            }),
        }
    }

    /// The visible (labeled) nodes of the node-set.
    pub fn matches(&self, ctx: &Ctx) -> Result<Vec<NodeId>> {
        Ok(self
            .nodes(ctx)?
            .into_iter()
            .filter(|&n| !ctx.tree.hidden(n))
            .collect())
    }

    /// Expect exactly one match.
    pub fn find_one(&self, ctx: &Ctx) -> Result<NodeId> {
        let ns = self.nodes(ctx)?;
        match ns.len() {
            0 => Err(Error::NoMatch(self.src.clone())),
            1 => Ok(ns[0]),
            _ => Err(Error::TooManyMatches(self.src.clone())),
        }
    }

    /// Create the node the path denotes, along with every missing
    /// ancestor. Only pure location paths with child steps and at
    /// most one positional predicate per step can be expanded.
    pub fn expand_tree(
        &self,
        tree: &mut Tree,
        start: NodeId,
        symtab: &SymbolTable,
    ) -> Result<NodeId> {
        // Fast path: the node may already exist.
        {
            let ctx = Ctx {
                tree,
                start,
                symtab,
            };
            let existing = self.nodes(&ctx)?;
            match existing.len() {
                1 => return Ok(existing[0]),
                0 => {}
                _ => return Err(Error::TooManyMatches(self.src.clone())),
            }
        }
        let (mut at, steps) = match &self.ast {
            Expr::Path(path) => {
                let at = if path.absolute { tree.origin() } else { start };
                (at, &path.steps)
            }
            // `$var/rest`: the variable must name exactly one node.
            Expr::Filter(base, path) => {
                let ctx = Ctx {
                    tree,
                    start,
                    symtab,
                };
                let v = eval_expr(base, &ctx, None)?;
                match v {
                    Value::Nodes(ns) if ns.len() == 1 => (ns[0], &path.steps),
                    Value::Nodes(_) => {
                        return Err(Error::TooManyMatches(self.src.clone()));
                    }
                    other => {
                        return Err(Error::Pathx {
                            details: format!("cannot expand a {}", other.kind()),
                            pos: 0,
                        });
                    }
                }
            }
            _ => {
                return Err(Error::Pathx {
                    details: format!("cannot expand tree for {}", self.src),
                    pos: 0,
                });
            }
        };
        for step in steps {
            let label = match (&step.axis, &step.test) {
                (Axis::Child, NameTest::Name(name)) => name.clone(),
                _ => {
                    return Err(Error::Pathx {
                        details: format!("cannot expand tree for {}", self.src),
                        pos: 0,
                    });
                }
            };
            let index = match step.preds.as_slice() {
                [] => None,
                [Expr::Number(n)] if *n >= 1 => Some(*n as usize),
                _ => {
                    return Err(Error::Pathx {
                        details: format!("cannot expand tree for {}", self.src),
                        pos: 0,
                    });
                }
            };
            let existing: Vec<NodeId> = tree
                .children(at)
                .iter()
                .copied()
                .filter(|&c| tree.label(c) == Some(label.as_str()))
                .collect();
            at = match index {
                None => match existing.len() {
                    0 => tree.append(at, Some(&label), None),
                    _ => existing[0],
                },
                Some(i) if i <= existing.len() => existing[i - 1],
                Some(i) if i == existing.len() + 1 => tree.append(at, Some(&label), None),
                Some(_) => {
                    return Err(Error::NoMatch(self.src.clone()));
                }
            };
        }
        Ok(at)
    }

    /// Whether this is a plain location path (usable with `expand_tree`).
    pub fn is_location_path(&self) -> bool {
        matches!(self.ast, Expr::Path(_))
    }
}

fn eval_expr(expr: &Expr, ctx: &Ctx, pred: Option<PredCtx>) -> Result<Value> {
    match expr {
        Expr::Literal(s) => Ok(Value::String(s.clone())),
        Expr::Number(n) => Ok(Value::Number(*n)),
        Expr::Var(name) => match ctx.symtab.lookup(name) {
            Some(Value::Nodes(ns)) => Ok(Value::Nodes(
                ns.iter().copied().filter(|&n| ctx.tree.contains(n)).collect(),
            )),
            Some(v) => Ok(v.clone()),
            None => Err(Error::Pathx {
                details: format!("undefined variable ${}", name),
                pos: 0,
            }),
        },
        Expr::Call(name, args) => eval_call(name, args, ctx, pred),
        Expr::Path(path) => Ok(Value::Nodes(eval_path(path, ctx, pred)?)),
        Expr::Filter(base, path) => {
            let ns = match eval_expr(base, ctx, pred)? {
                Value::Nodes(ns) => ns,
                other => {
                    return Err(Error::Pathx {
                        details: format!("cannot take steps from a {}", other.kind()),
                        pos: 0,
                    });
                }
            };
            let start: Vec<NodeId> = ns
                .into_iter()
                .filter(|&n| ctx.tree.contains(n))
                .collect();
            Ok(Value::Nodes(eval_steps(&path.steps, start, ctx)?))
        }
        Expr::Binary(op, a, b) => eval_binary(*op, a, b, ctx, pred),
    }
}

fn eval_call(name: &str, args: &[Expr], ctx: &Ctx, pred: Option<PredCtx>) -> Result<Value> {
    let arity_err = |want: usize| Error::Pathx {
        details: format!("{}() expects {} argument(s)", name, want),
        pos: 0,
    };
    match name {
        "last" => {
            let p = pred.ok_or_else(|| Error::Pathx {
                details: "last() outside a predicate".into(),
                pos: 0,
            })?;
            Ok(Value::Number(p.size as i64))
        }
        "position" => {
            let p = pred.ok_or_else(|| Error::Pathx {
                details: "position() outside a predicate".into(),
                pos: 0,
            })?;
            Ok(Value::Number(p.position as i64))
        }
        "count" => {
            let [arg] = args else { return Err(arity_err(1)) };
            match eval_expr(arg, ctx, pred)? {
                Value::Nodes(ns) => Ok(Value::Number(ns.len() as i64)),
                other => Err(Error::Pathx {
                    details: format!("count() on a {}", other.kind()),
                    pos: 0,
                }),
            }
        }
        "label" => {
            let p = pred.ok_or_else(|| Error::Pathx {
                details: "label() outside a predicate".into(),
                pos: 0,
            })?;
            Ok(Value::String(
                ctx.tree.label(p.node).unwrap_or("").to_string(),
            ))
        }
        "not" => {
            let [arg] = args else { return Err(arity_err(1)) };
            let v = eval_expr(arg, ctx, pred)?;
            Ok(Value::Bool(!truthy(&v)))
        }
        "regexp" => {
            let [arg] = args else { return Err(arity_err(1)) };
            match eval_expr(arg, ctx, pred)? {
                Value::String(s) => Ok(Value::Regexp(Regex::parse(&s).map_err(|e| {
                    Error::Pathx {
                        details: e.to_string(),
                        pos: 0,
                    }
                })?)),
                other => Err(Error::Pathx {
                    details: format!("regexp() on a {}", other.kind()),
                    pos: 0,
                }),
            }
        }
        "glob" => {
            let [arg] = args else { return Err(arity_err(1)) };
            match eval_expr(arg, ctx, pred)? {
                Value::String(s) => Ok(Value::Regexp(
                    Regex::parse(&glob_to_regex(&s)).map_err(|e| Error::Pathx {
                        details: e.to_string(),
                        pos: 0,
                    })?,
                )),
                other => Err(Error::Pathx {
                    details: format!("glob() on a {}", other.kind()),
                    pos: 0,
                }),
            }
        }
        _ => Err(Error::Pathx {
            details: format!("unknown function {}()", name),
            pos: 0,
        }),
    }
}

/// Translate a shell glob into an anchored regex source.
fn glob_to_regex(glob: &str) -> String {
    let mut out = String::new();
    for c in glob.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => out.push('['),
            ']' => out.push(']'),
            c if ".{}()\\+|^$".contains(c) => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Nodes(ns) => !ns.is_empty(),
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => *n != 0,
        Value::Bool(b) => *b,
        Value::Regexp(_) => true,
    }
}

fn as_number(v: &Value, tree: &Tree) -> Result<i64> {
    let fail = |what: &str| Error::Pathx {
        details: format!("expected a number, got a {}", what),
        pos: 0,
    };
    match v {
        Value::Number(n) => Ok(*n),
        Value::String(s) => s.parse().map_err(|_| fail("string")),
        Value::Nodes(ns) => {
            let one = ns.first().ok_or_else(|| fail("empty nodeset"))?;
            tree.value(*one)
                .ok_or_else(|| fail("valueless node"))?
                .parse()
                .map_err(|_| fail("node value"))
        }
        other => Err(fail(other.kind())),
    }
}

fn eval_binary(op: Op, a: &Expr, b: &Expr, ctx: &Ctx, pred: Option<PredCtx>) -> Result<Value> {
    match op {
        Op::Or => {
            let va = eval_expr(a, ctx, pred)?;
            if truthy(&va) {
                return Ok(Value::Bool(true));
            }
            let vb = eval_expr(b, ctx, pred)?;
            Ok(Value::Bool(truthy(&vb)))
        }
        Op::And => {
            let va = eval_expr(a, ctx, pred)?;
            if !truthy(&va) {
                return Ok(Value::Bool(false));
            }
            let vb = eval_expr(b, ctx, pred)?;
            Ok(Value::Bool(truthy(&vb)))
        }
        Op::Eq | Op::Neq => {
            let va = eval_expr(a, ctx, pred)?;
            let vb = eval_expr(b, ctx, pred)?;
            let eq = values_equal(&va, &vb, ctx.tree);
            Ok(Value::Bool(if op == Op::Eq { eq } else { !eq }))
        }
        Op::Lt | Op::Le | Op::Gt | Op::Ge => {
            let na = as_number(&eval_expr(a, ctx, pred)?, ctx.tree)?;
            let nb = as_number(&eval_expr(b, ctx, pred)?, ctx.tree)?;
            Ok(Value::Bool(match op {
                Op::Lt => na < nb,
                Op::Le => na <= nb,
                Op::Gt => na > nb,
                _ => na >= nb,
            }))
        }
        Op::ReMatch | Op::ReNoMatch => {
            let va = eval_expr(a, ctx, pred)?;
            let vb = eval_expr(b, ctx, pred)?;
            let re = match vb {
                Value::Regexp(re) => re,
                Value::String(s) => Regex::parse(&s).map_err(|e| Error::Pathx {
                    details: e.to_string(),
                    pos: 0,
                })?,
                other => {
                    return Err(Error::Pathx {
                        details: format!("cannot match against a {}", other.kind()),
                        pos: 0,
                    });
                }
            };
            let matched = match &va {
                Value::String(s) => re.matches(s),
                Value::Nodes(ns) => ns
                    .iter()
                    .any(|&n| ctx.tree.value(n).map(|v| re.matches(v)).unwrap_or(false)),
                other => {
                    return Err(Error::Pathx {
                        details: format!("cannot match a {}", other.kind()),
                        pos: 0,
                    });
                }
            };
            Ok(Value::Bool(if op == Op::ReMatch {
                matched
            } else {
                !matched
            }))
        }
        Op::Plus | Op::Minus | Op::Mult | Op::Div | Op::Mod => {
            let na = as_number(&eval_expr(a, ctx, pred)?, ctx.tree)?;
            let nb = as_number(&eval_expr(b, ctx, pred)?, ctx.tree)?;
            if nb == 0 && matches!(op, Op::Div | Op::Mod) {
                return Err(Error::Pathx {
                    details: "division by zero".into(),
                    pos: 0,
                });
            }
            Ok(Value::Number(match op {
                Op::Plus => na + nb,
                Op::Minus => na - nb,
                Op::Mult => na * nb,
                Op::Div => na / nb,
                _ => na % nb,
            }))
        }
        Op::Union => {
            let va = eval_expr(a, ctx, pred)?;
            let vb = eval_expr(b, ctx, pred)?;
            match (va, vb) {
                (Value::Nodes(xs), Value::Nodes(ys)) => Ok(Value::Nodes(
                    xs.into_iter().chain(ys).unique().collect(),
                )),
                (va, vb) => Err(Error::Pathx {
                    details: format!("cannot union a {} and a {}", va.kind(), vb.kind()),
                    pos: 0,
                }),
            }
        }
    }
}

fn values_equal(a: &Value, b: &Value, tree: &Tree) -> bool {
    match (a, b) {
        (Value::Nodes(ns), other) | (other, Value::Nodes(ns)) if !matches!(other, Value::Nodes(_)) => {
            let rhs = match other {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return false,
            };
            ns.iter().any(|&n| tree.value(n) == Some(rhs.as_str()))
        }
        (Value::Nodes(xs), Value::Nodes(ys)) => xs.iter().any(|&x| {
            ys.iter()
                .any(|&y| tree.value(x).is_some() && tree.value(x) == tree.value(y))
        }),
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => x == y,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::String(x), Value::Number(y)) | (Value::Number(y), Value::String(x)) => {
            x.parse::<i64>().map(|x| x == *y).unwrap_or(false)
        }
        _ => false,
    }
}

fn eval_path(path: &LocPath, ctx: &Ctx, pred: Option<PredCtx>) -> Result<Vec<NodeId>> {
    let start = if path.absolute {
        ctx.tree.origin()
    } else {
        match pred {
            // Inside a predicate, relative paths start at the node
            // under test.
            Some(p) => p.node,
            None => ctx.start,
        }
    };
    eval_steps(&path.steps, vec![start], ctx)
}

fn eval_steps(steps: &[Step], start: Vec<NodeId>, ctx: &Ctx) -> Result<Vec<NodeId>> {
    let mut set = start;
    for step in steps {
        let mut next: Vec<NodeId> = Vec::new();
        for &node in &set {
            let candidates = axis_candidates(step.axis, node, ctx.tree);
            let mut kept: Vec<NodeId> = candidates
                .into_iter()
                .filter(|&c| test_matches(&step.test, c, ctx.tree, step.axis))
                .collect();
            for p in &step.preds {
                let size = kept.len();
                let mut filtered = Vec::new();
                for (i, &cand) in kept.iter().enumerate() {
                    let pctx = PredCtx {
                        node: cand,
                        position: i + 1,
                        size,
                    };
                    let v = eval_expr(p, ctx, Some(pctx))?;
                    let keep = match v {
                        Value::Number(n) => n == (i + 1) as i64,
                        other => truthy(&other),
                    };
                    if keep {
                        filtered.push(cand);
                    }
                }
                kept = filtered;
            }
            for k in kept {
                if !next.contains(&k) {
                    next.push(k);
                }
            }
        }
        set = next;
    }
    Ok(set)
}

fn axis_candidates(axis: Axis, node: NodeId, tree: &Tree) -> Vec<NodeId> {
    match axis {
        Axis::SelfAxis => vec![node],
        Axis::Child => tree.children(node).to_vec(),
        Axis::Parent => {
            if node == tree.origin() {
                Vec::new()
            } else {
                vec![tree.parent(node)]
            }
        }
        Axis::Ancestor => {
            let mut out = Vec::new();
            let mut at = node;
            while at != tree.origin() {
                at = tree.parent(at);
                out.push(at);
            }
            out
        }
        Axis::Root => vec![tree.origin()],
        Axis::Descendant | Axis::DescendantOrSelf => {
            let mut out = Vec::new();
            if axis == Axis::DescendantOrSelf {
                out.push(node);
            }
            let mut stack: Vec<NodeId> = tree.children(node).iter().rev().copied().collect();
            while let Some(at) = stack.pop() {
                out.push(at);
                stack.extend(tree.children(at).iter().rev());
            }
            out
        }
    }
}

fn test_matches(test: &NameTest, node: NodeId, tree: &Tree, axis: Axis) -> bool {
    match test {
        NameTest::Any => {
            // Hidden nodes never match a wildcard on forward axes,
            // but `..`, `.` and ancestors may land on them.
            match axis {
                Axis::Child | Axis::Descendant => !tree.hidden(node),
                _ => true,
            }
        }
        NameTest::Name(name) => tree.label(node) == Some(name.as_str()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn fixture() -> (Tree, SymbolTable) {
        let mut t = Tree::new();
        let files = t.append(t.origin(), Some("files"), None);
        let etc = t.append(files, Some("etc"), None);
        let hosts = t.append(etc, Some("hosts"), None);
        for (ip, name) in [("127.0.0.1", "localhost"), ("10.0.0.1", "gw")] {
            let e = t.append(hosts, Some("entry"), None);
            t.append(e, Some("ipaddr"), Some(ip));
            t.append(e, Some("canonical"), Some(name));
        }
        (t, SymbolTable::new())
    }

    fn eval_nodes(t: &Tree, sym: &SymbolTable, expr: &str) -> Vec<NodeId> {
        let p = parse(expr).unwrap();
        p.nodes(&Ctx {
            tree: t,
            start: t.origin(),
            symtab: sym,
        })
        .unwrap()
    }

    #[test]
    fn absolute_and_wildcard_steps() {
        let (t, sym) = fixture();
        assert_eq!(eval_nodes(&t, &sym, "/files/etc/hosts/entry").len(), 2);
        assert_eq!(eval_nodes(&t, &sym, "/files/etc/hosts/*").len(), 2);
        assert_eq!(eval_nodes(&t, &sym, "/files//ipaddr").len(), 2);
    }

    #[test]
    fn positional_predicates() {
        let (t, sym) = fixture();
        let first = eval_nodes(&t, &sym, "/files/etc/hosts/entry[1]/ipaddr");
        assert_eq!(t.value(first[0]), Some("127.0.0.1"));
        let last = eval_nodes(&t, &sym, "/files/etc/hosts/entry[last()]/ipaddr");
        assert_eq!(t.value(last[0]), Some("10.0.0.1"));
    }

    #[test]
    fn value_predicates() {
        let (t, sym) = fixture();
        let gw = eval_nodes(
            &t,
            &sym,
            "/files/etc/hosts/entry[ipaddr = '10.0.0.1']/canonical",
        );
        assert_eq!(t.value(gw[0]), Some("gw"));
        let none = eval_nodes(&t, &sym, "/files/etc/hosts/entry[ipaddr = '1.2.3.4']");
        assert!(none.is_empty());
    }

    #[test]
    fn regexp_match_predicate() {
        let (t, sym) = fixture();
        let m = eval_nodes(
            &t,
            &sym,
            "/files/etc/hosts/entry[ipaddr =~ regexp('10\\..*')]",
        );
        assert_eq!(m.len(), 1);
        let g = eval_nodes(&t, &sym, "/files/etc/hosts/entry[ipaddr =~ glob('10.*')]");
        assert_eq!(g.len(), 1);
    }

    #[test]
    fn arithmetic_and_booleans() {
        let (t, sym) = fixture();
        let e = eval_nodes(
            &t,
            &sym,
            "/files/etc/hosts/entry[position() = last() - 0]",
        );
        assert_eq!(e.len(), 1);
        let both = eval_nodes(
            &t,
            &sym,
            "/files/etc/hosts/entry[count(ipaddr) = 1 and count(nope) = 0]",
        );
        assert_eq!(both.len(), 2);
    }

    #[test]
    fn variables_capture_nodesets() {
        let (t, mut sym) = fixture();
        let entries = eval_nodes(&t, &sym, "/files/etc/hosts/entry");
        sym.define("e", Value::Nodes(entries));
        let via_var = eval_nodes(&t, &sym, "$e/ipaddr");
        assert_eq!(via_var.len(), 2);
    }

    #[test]
    fn syntax_error_is_annotated() {
        let err = parse("/files/hosts[").unwrap_err();
        match err {
            Error::Pathx { details, pos } => {
                assert_eq!(details, "/files/hosts[|=|");
                assert_eq!(pos, 13);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn expand_tree_creates_ancestors() {
        let (mut t, sym) = fixture();
        let p = parse("/files/etc/fstab/1/spec").unwrap();
        let origin = t.origin();
        let node = p.expand_tree(&mut t, origin, &sym).unwrap();
        assert_eq!(t.path_of(node), "/files/etc/fstab/1/spec");
        // Expanding again returns the same node.
        let again = p.expand_tree(&mut t, origin, &sym).unwrap();
        assert_eq!(node, again);
    }

    #[test]
    fn expand_tree_with_position() {
        let (mut t, sym) = fixture();
        let origin = t.origin();
        let p = parse("/files/etc/hosts/entry[3]").unwrap();
        let node = p.expand_tree(&mut t, origin, &sym).unwrap();
        assert_eq!(t.path_of(node), "/files/etc/hosts/entry[3]");
        let p = parse("/files/etc/hosts/entry[9]").unwrap();
        assert!(p.expand_tree(&mut t, origin, &sym).is_err());
    }

    #[test]
    fn expand_tree_rejects_functions() {
        let (mut t, sym) = fixture();
        let origin = t.origin();
        let p = parse("/files/etc/hosts/entry[last()]").unwrap();
        // Exists, so fine; a missing node with last() must fail.
        p.expand_tree(&mut t, origin, &sym).unwrap();
        let p = parse("/files/nope/entry[last()]").unwrap();
        assert!(p.expand_tree(&mut t, origin, &sym).is_err());
    }

    #[test]
    fn parent_and_ancestor_axes() {
        let (t, sym) = fixture();
        let up = eval_nodes(&t, &sym, "/files/etc/hosts/entry[1]/ipaddr/..");
        assert_eq!(t.label(up[0]), Some("entry"));
        let anc = eval_nodes(
            &t,
            &sym,
            "/files/etc/hosts/entry[1]/ipaddr/ancestor::hosts",
        );
        assert_eq!(anc.len(), 1);
    }
}
