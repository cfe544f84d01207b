//! Dependency analyzer: per-cell `provides` and `requires` name sets,
//! computed from the syntax tree without executing anything.
//!
//! Rules (module scope is the cell's top level; compound-statement bodies at
//! the top level are still module scope):
//!
//! * `provides` — assignment targets (plain, chained, unpacking, augmented),
//!   walrus targets, `def`/`class` names, imported aliases, and `for` loop
//!   targets.
//! * `requires` — every free name read that is neither a builtin nor bound
//!   earlier in the same cell at the same scope. Free reads inside nested
//!   function/class/lambda bodies count, unless shadowed by a parameter or a
//!   binding earlier in the nested scope or the cell.
//! * Attribute and subscript stores (`x.a = …`, `x[i] = …`) put `x` in
//!   `requires`, never in `provides` — the documented limit of static
//!   mutation reasoning.
//!
//! A cell that fails to parse gets empty sets; it still runs (so the
//! evaluator reports the error) but can never be a dependency of later
//! cells.

pub mod builtins;

use std::collections::HashSet;

use core_cell::Analysis;
use core_lang::ast::{Expr, ExprKind, Module, Param, Stmt, StmtKind};
use core_lang::parse_source;
use tracing::trace;

pub use builtins::{BUILTINS, is_builtin};

/// Analyze one code cell's source. Parse failures yield the empty analysis.
pub fn analyze(source: &str) -> Analysis {
    match parse_source(source) {
        Ok(module) => analyze_module(&module),
        Err(err) => {
            trace!(target: "analyze", %err, "cell not analyzable, empty sets");
            Analysis::default()
        }
    }
}

/// Analyze an already-parsed module.
pub fn analyze_module(module: &Module) -> Analysis {
    let mut analyzer = Analyzer::new();
    analyzer.walk_body(&module.body);
    Analysis::new(analyzer.provides, analyzer.requires)
}

struct Analyzer {
    provides: std::collections::BTreeSet<String>,
    requires: std::collections::BTreeSet<String>,
    /// Scope stack; index 0 is module scope. Each entry holds the names
    /// bound so far in that scope, in statement order.
    scopes: Vec<HashSet<String>>,
}

impl Analyzer {
    fn new() -> Self {
        Self {
            provides: Default::default(),
            requires: Default::default(),
            scopes: vec![HashSet::new()],
        }
    }

    fn at_module_scope(&self) -> bool {
        self.scopes.len() == 1
    }

    /// Record a read of `name` in the current scope chain.
    fn read(&mut self, name: &str) {
        if self.scopes.iter().any(|scope| scope.contains(name)) {
            return;
        }
        if is_builtin(name) {
            return;
        }
        self.requires.insert(name.to_string());
    }

    /// Record a binding of `name` in the innermost scope.
    fn bind(&mut self, name: &str) {
        if self.at_module_scope() {
            self.provides.insert(name.to_string());
        }
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string());
        }
    }

    fn walk_body(&mut self, body: &[Stmt]) {
        for stmt in body {
            self.walk_stmt(stmt);
        }
    }

    fn walk_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Expr(expr) => self.walk_expr(expr),
            StmtKind::Assign { targets, value } => {
                // Right-hand side evaluates first: `x = x + 1` reads x free.
                self.walk_expr(value);
                for target in targets {
                    self.bind_target(target);
                }
            }
            StmtKind::AugAssign { target, value, .. } => {
                self.walk_expr(value);
                match &target.kind {
                    ExprKind::Name(name) => {
                        // Augmented assignment both reads and rebinds.
                        self.read(name);
                        self.bind(name);
                    }
                    _ => self.bind_target(target),
                }
            }
            StmtKind::If { branches, orelse } => {
                for (test, body) in branches {
                    self.walk_expr(test);
                    self.walk_body(body);
                }
                self.walk_body(orelse);
            }
            StmtKind::While { test, body } => {
                self.walk_expr(test);
                self.walk_body(body);
            }
            StmtKind::For { target, iter, body } => {
                self.walk_expr(iter);
                self.bind_target(target);
                self.walk_body(body);
            }
            StmtKind::FuncDef { name, params, body } => {
                // Defaults evaluate at definition time, in the defining scope.
                for param in params {
                    if let Some(default) = &param.default {
                        self.walk_expr(default);
                    }
                }
                self.bind(name);
                self.walk_nested(params, body);
            }
            StmtKind::ClassDef { name, bases, body } => {
                for base in bases {
                    self.walk_expr(base);
                }
                self.bind(name);
                self.walk_nested(&[], body);
            }
            StmtKind::Return(value) => {
                if let Some(value) = value {
                    self.walk_expr(value);
                }
            }
            StmtKind::Pass | StmtKind::Break | StmtKind::Continue => {}
            StmtKind::Import(aliases) => {
                for alias in aliases {
                    self.bind(alias.binds());
                }
            }
            StmtKind::ImportFrom { names, star, .. } => {
                // `import *` binds nothing trackable; the module path itself
                // is not a free name.
                if !*star {
                    for alias in names {
                        self.bind(alias.binds());
                    }
                }
            }
            StmtKind::Del(targets) => {
                for target in targets {
                    // Deleting reads the binding; it never provides.
                    self.walk_expr(target);
                }
            }
        }
    }

    /// Walk a nested function/class body in its own scope.
    fn walk_nested(&mut self, params: &[Param], body: &[Stmt]) {
        let mut scope = HashSet::new();
        for param in params {
            scope.insert(param.name.clone());
        }
        self.scopes.push(scope);
        self.walk_body(body);
        self.scopes.pop();
    }

    fn bind_target(&mut self, target: &Expr) {
        match &target.kind {
            ExprKind::Name(name) => self.bind(name),
            ExprKind::Tuple(items) | ExprKind::List(items) => {
                for item in items {
                    self.bind_target(item);
                }
            }
            ExprKind::Starred(inner) => self.bind_target(inner),
            ExprKind::Attribute { value, .. } => {
                // Mutation through an attribute: the base is a dependency
                // but the cell provides nothing new.
                self.walk_expr(value);
            }
            ExprKind::Subscript { value, index } => {
                self.walk_expr(value);
                self.walk_expr(index);
            }
            _ => self.walk_expr(target),
        }
    }

    fn walk_expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Name(name) => self.read(name),
            ExprKind::None_
            | ExprKind::Bool(_)
            | ExprKind::Int(_)
            | ExprKind::Float(_)
            | ExprKind::Str(_) => {}
            ExprKind::Tuple(items) | ExprKind::List(items) => {
                for item in items {
                    self.walk_expr(item);
                }
            }
            ExprKind::Dict(pairs) => {
                for (key, value) in pairs {
                    self.walk_expr(key);
                    self.walk_expr(value);
                }
            }
            ExprKind::Unary { operand, .. } => self.walk_expr(operand),
            ExprKind::Binary { left, right, .. } => {
                self.walk_expr(left);
                self.walk_expr(right);
            }
            ExprKind::BoolChain { values, .. } => {
                for value in values {
                    self.walk_expr(value);
                }
            }
            ExprKind::Compare { left, comparisons } => {
                self.walk_expr(left);
                for (_, comparator) in comparisons {
                    self.walk_expr(comparator);
                }
            }
            ExprKind::Call { func, args, kwargs } => {
                self.walk_expr(func);
                for arg in args {
                    self.walk_expr(arg);
                }
                for (_name, value) in kwargs {
                    // Keyword names are labels, not reads.
                    self.walk_expr(value);
                }
            }
            ExprKind::Attribute { value, .. } => self.walk_expr(value),
            ExprKind::Subscript { value, index } => {
                self.walk_expr(value);
                self.walk_expr(index);
            }
            ExprKind::IfElse { test, body, orelse } => {
                self.walk_expr(test);
                self.walk_expr(body);
                self.walk_expr(orelse);
            }
            ExprKind::Lambda { params, body } => {
                for param in params {
                    if let Some(default) = &param.default {
                        self.walk_expr(default);
                    }
                }
                let mut scope = HashSet::new();
                for param in params {
                    scope.insert(param.name.clone());
                }
                self.scopes.push(scope);
                self.walk_expr(body);
                self.scopes.pop();
            }
            ExprKind::Named { name, value } => {
                // Walrus: the value evaluates first, then the name binds in
                // the current scope (module scope contributes to provides).
                self.walk_expr(value);
                self.bind(name);
            }
            ExprKind::ListComp {
                element,
                target,
                iter,
                cond,
            } => {
                // The iterable evaluates in the enclosing scope; the loop
                // target is scoped to the comprehension.
                self.walk_expr(iter);
                self.scopes.push(HashSet::new());
                self.bind_target(target);
                self.walk_expr(element);
                if let Some(cond) = cond {
                    self.walk_expr(cond);
                }
                self.scopes.pop();
            }
            ExprKind::Starred(inner) => self.walk_expr(inner),
        }
    }
}
