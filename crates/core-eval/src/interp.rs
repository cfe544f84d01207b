//! Tree-walking interpreter for the embedded dialect.
//!
//! Executes one cell's statements against the persistent global namespace.
//! Python-flavoured semantics where the dialect overlaps Python: RHS-first
//! assignment, short-circuit boolean chains returning operands, floor
//! division toward negative infinity, `NameError` on unresolved reads. A
//! wall-clock deadline is polled on statement and loop boundaries so runaway
//! cells surface as `Timeout` records instead of hanging the pass.

use std::collections::HashMap;
use std::rc::Rc;
use std::time::Instant;

use core_lang::ast::{BoolOp, CmpOp, Expr, ExprKind, Module, Param, Stmt, StmtKind, UnaryOp};
use core_lang::token::Op;

use crate::error::RunError;
use crate::value::{Builtin, Function, ModuleDef, RichValue, Value, range_len, to_json};

/// Captured output streams for one `run` call. Nothing written during the
/// call reaches the process streams.
#[derive(Debug, Default)]
pub struct CellIo {
    pub stdout: String,
    pub stderr: String,
}

const MAX_CALL_DEPTH: usize = 200;
const MAX_RANGE_MATERIALIZE: i64 = 10_000_000;
const DEADLINE_POLL_MASK: u64 = 0xFF;

type RunResult<T> = Result<T, RunError>;

enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

enum Scope {
    Module,
    Local(HashMap<String, Value>),
}

/// Execute a parsed module against `globals`, returning the value of the
/// final expression statement when there is one.
pub fn execute_module(
    globals: &mut HashMap<String, Value>,
    module: &Module,
    io: &mut CellIo,
    deadline: Option<Instant>,
) -> RunResult<Option<Value>> {
    let mut interp = Interp {
        globals,
        io,
        deadline,
        steps: 0,
        call_depth: 0,
    };
    let mut scope = Scope::Module;
    let mut last_value = None;

    for (index, stmt) in module.body.iter().enumerate() {
        let is_last = index + 1 == module.body.len();
        if is_last && let StmtKind::Expr(expr) = &stmt.kind {
            last_value = Some(interp.eval(expr, &mut scope)?);
            break;
        }
        match interp.exec_stmt(stmt, &mut scope)? {
            Flow::Normal => {}
            // `return` is rejected at its statement; loop control written
            // outside a loop surfaces here.
            Flow::Break => {
                return Err(RunError::runtime("'break' outside loop", stmt.line, 0));
            }
            Flow::Continue => {
                return Err(RunError::runtime(
                    "'continue' not properly in loop",
                    stmt.line,
                    0,
                ));
            }
            Flow::Return(_) => unreachable!("'return' is rejected at its statement"),
        }
    }
    Ok(last_value)
}

struct Interp<'a> {
    globals: &'a mut HashMap<String, Value>,
    io: &'a mut CellIo,
    deadline: Option<Instant>,
    steps: u64,
    call_depth: usize,
}

impl<'a> Interp<'a> {
    /// Deadline poll, amortized over `DEADLINE_POLL_MASK + 1` steps.
    fn tick(&mut self, line: usize) -> RunResult<()> {
        self.steps = self.steps.wrapping_add(1);
        if self.steps & DEADLINE_POLL_MASK == 0
            && let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(RunError::timeout(line));
        }
        Ok(())
    }

    fn load(&mut self, name: &str, scope: &Scope, line: usize, col: usize) -> RunResult<Value> {
        if let Scope::Local(locals) = scope
            && let Some(value) = locals.get(name)
        {
            return Ok(value.clone());
        }
        if let Some(value) = self.globals.get(name) {
            return Ok(value.clone());
        }
        if let Some(builtin) = Builtin::lookup(name) {
            return Ok(Value::Builtin(builtin));
        }
        Err(RunError::name(
            format!("name '{name}' is not defined"),
            line,
            col,
        ))
    }

    fn store(&mut self, name: &str, value: Value, scope: &mut Scope) {
        match scope {
            Scope::Module => {
                self.globals.insert(name.to_string(), value);
            }
            Scope::Local(locals) => {
                locals.insert(name.to_string(), value);
            }
        }
    }

    // -----------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------

    fn exec_block(&mut self, body: &[Stmt], scope: &mut Scope) -> RunResult<Flow> {
        for stmt in body {
            match self.exec_stmt(stmt, scope)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt, scope: &mut Scope) -> RunResult<Flow> {
        self.tick(stmt.line)?;
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.eval(expr, scope)?;
                Ok(Flow::Normal)
            }
            StmtKind::Assign { targets, value } => {
                let value = self.eval(value, scope)?;
                for target in targets {
                    self.assign_target(target, value.clone(), scope)?;
                }
                Ok(Flow::Normal)
            }
            StmtKind::AugAssign { target, op, value } => {
                let base_op = op.aug_base().expect("parser guarantees an augmented op");
                let current = self.eval(target, scope)?;
                let rhs = self.eval(value, scope)?;
                let result = self.binop(base_op, current, rhs, stmt.line, target.col)?;
                self.assign_target(target, result, scope)?;
                Ok(Flow::Normal)
            }
            StmtKind::If { branches, orelse } => {
                for (test, body) in branches {
                    if self.eval(test, scope)?.truthy() {
                        return self.exec_block(body, scope);
                    }
                }
                self.exec_block(orelse, scope)
            }
            StmtKind::While { test, body } => {
                loop {
                    self.tick(stmt.line)?;
                    if !self.eval(test, scope)?.truthy() {
                        break;
                    }
                    match self.exec_block(body, scope)? {
                        Flow::Normal | Flow::Continue => {}
                        Flow::Break => break,
                        ret @ Flow::Return(_) => return Ok(ret),
                    }
                }
                Ok(Flow::Normal)
            }
            StmtKind::For { target, iter, body } => {
                let iterable = self.eval(iter, scope)?;
                let items = self.iter_values(iterable, iter.line, iter.col)?;
                for item in items {
                    self.tick(stmt.line)?;
                    self.assign_target(target, item, scope)?;
                    match self.exec_block(body, scope)? {
                        Flow::Normal | Flow::Continue => {}
                        Flow::Break => break,
                        ret @ Flow::Return(_) => return Ok(ret),
                    }
                }
                Ok(Flow::Normal)
            }
            StmtKind::FuncDef { name, params, body } => {
                let function = self.make_function(name, params, body, scope)?;
                self.store(name, function, scope);
                Ok(Flow::Normal)
            }
            StmtKind::ClassDef { name, .. } => Err(RunError::other(
                format!("class definitions are not supported by the embedded evaluator: '{name}'"),
                stmt.line,
                0,
            )),
            StmtKind::Return(value) => {
                if self.call_depth == 0 {
                    return Err(RunError::runtime("'return' outside function", stmt.line, 0));
                }
                let value = match value {
                    Some(expr) => self.eval(expr, scope)?,
                    None => Value::None,
                };
                Ok(Flow::Return(value))
            }
            StmtKind::Pass => Ok(Flow::Normal),
            StmtKind::Break => Ok(Flow::Break),
            StmtKind::Continue => Ok(Flow::Continue),
            StmtKind::Import(aliases) => {
                for alias in aliases {
                    if alias.name == "math" {
                        self.store(alias.binds(), make_math_module(), scope);
                    } else {
                        return Err(RunError::other(
                            format!("No module named '{}'", alias.name),
                            stmt.line,
                            0,
                        ));
                    }
                }
                Ok(Flow::Normal)
            }
            StmtKind::ImportFrom {
                module,
                names,
                star,
            } => {
                if module != "math" {
                    return Err(RunError::other(
                        format!("No module named '{module}'"),
                        stmt.line,
                        0,
                    ));
                }
                if *star {
                    return Err(RunError::other(
                        "`from math import *` is not supported",
                        stmt.line,
                        0,
                    ));
                }
                let math = make_math_module();
                let Value::Module(module_def) = &math else {
                    unreachable!("make_math_module returns a module");
                };
                for alias in names {
                    let Some(value) = module_def.attrs.get(alias.name.as_str()) else {
                        return Err(RunError::other(
                            format!("cannot import name '{}' from 'math'", alias.name),
                            stmt.line,
                            0,
                        ));
                    };
                    self.store(alias.binds(), value.clone(), scope);
                }
                Ok(Flow::Normal)
            }
            StmtKind::Del(targets) => {
                for target in targets {
                    self.delete_target(target, scope)?;
                }
                Ok(Flow::Normal)
            }
        }
    }

    fn make_function(
        &mut self,
        name: &str,
        params: &[Param],
        body: &[Stmt],
        scope: &mut Scope,
    ) -> RunResult<Value> {
        // Defaults evaluate once, at definition time.
        let mut defaults = Vec::with_capacity(params.len());
        for param in params {
            defaults.push(match &param.default {
                Some(expr) => Some(self.eval(expr, scope)?),
                None => None,
            });
        }
        Ok(Value::Func(Rc::new(Function {
            name: name.to_string(),
            params: params.to_vec(),
            defaults,
            body: body.to_vec(),
        })))
    }

    fn delete_target(&mut self, target: &Expr, scope: &mut Scope) -> RunResult<()> {
        match &target.kind {
            ExprKind::Name(name) => {
                let removed = match scope {
                    Scope::Local(locals) if locals.contains_key(name) => {
                        locals.remove(name).is_some()
                    }
                    _ => self.globals.remove(name).is_some(),
                };
                if !removed {
                    return Err(RunError::name(
                        format!("name '{name}' is not defined"),
                        target.line,
                        target.col,
                    ));
                }
                Ok(())
            }
            ExprKind::Subscript { value, index } => {
                let base = self.eval(value, scope)?;
                let key = self.eval(index, scope)?;
                match base {
                    Value::List(items) => {
                        let mut items = items.borrow_mut();
                        let idx = self.list_index(&key, items.len(), target.line, target.col)?;
                        items.remove(idx);
                        Ok(())
                    }
                    Value::Dict(pairs) => {
                        let mut pairs = pairs.borrow_mut();
                        let before = pairs.len();
                        pairs.retain(|(k, _)| !k.py_eq(&key));
                        if pairs.len() == before {
                            return Err(RunError::runtime(
                                format!("KeyError: {}", key.repr()),
                                target.line,
                                target.col,
                            ));
                        }
                        Ok(())
                    }
                    other => Err(RunError::runtime(
                        format!("'{}' object doesn't support item deletion", other.type_name()),
                        target.line,
                        target.col,
                    )),
                }
            }
            _ => Err(RunError::runtime(
                "cannot delete this expression",
                target.line,
                target.col,
            )),
        }
    }

    fn assign_target(&mut self, target: &Expr, value: Value, scope: &mut Scope) -> RunResult<()> {
        match &target.kind {
            ExprKind::Name(name) => {
                self.store(name, value, scope);
                Ok(())
            }
            ExprKind::Tuple(items) | ExprKind::List(items) => {
                if items.iter().any(|i| matches!(i.kind, ExprKind::Starred(_))) {
                    return Err(RunError::other(
                        "starred assignment targets are not supported",
                        target.line,
                        target.col,
                    ));
                }
                let values = self.iter_values(value, target.line, target.col)?;
                if values.len() != items.len() {
                    let message = if values.len() < items.len() {
                        format!(
                            "not enough values to unpack (expected {}, got {})",
                            items.len(),
                            values.len()
                        )
                    } else {
                        format!("too many values to unpack (expected {})", items.len())
                    };
                    return Err(RunError::runtime(message, target.line, target.col));
                }
                for (item, value) in items.iter().zip(values) {
                    self.assign_target(item, value, scope)?;
                }
                Ok(())
            }
            ExprKind::Subscript {
                value: base,
                index,
            } => {
                let base = self.eval(base, scope)?;
                let key = self.eval(index, scope)?;
                match base {
                    Value::List(items) => {
                        let mut items = items.borrow_mut();
                        let idx = self.list_index(&key, items.len(), target.line, target.col)?;
                        items[idx] = value;
                        Ok(())
                    }
                    Value::Dict(pairs) => {
                        let mut pairs = pairs.borrow_mut();
                        if let Some(slot) = pairs.iter_mut().find(|entry| entry.0.py_eq(&key)) {
                            slot.1 = value;
                        } else {
                            pairs.push((key, value));
                        }
                        Ok(())
                    }
                    other => Err(RunError::runtime(
                        format!(
                            "'{}' object does not support item assignment",
                            other.type_name()
                        ),
                        target.line,
                        target.col,
                    )),
                }
            }
            ExprKind::Attribute { value: base, attr } => {
                let base = self.eval(base, scope)?;
                Err(RunError::runtime(
                    format!(
                        "cannot set attribute '{attr}' on '{}' object",
                        base.type_name()
                    ),
                    target.line,
                    target.col,
                ))
            }
            _ => Err(RunError::runtime(
                "cannot assign to this expression",
                target.line,
                target.col,
            )),
        }
    }

    fn list_index(&self, key: &Value, len: usize, line: usize, col: usize) -> RunResult<usize> {
        let Some(raw) = key.as_int() else {
            return Err(RunError::runtime(
                format!(
                    "list indices must be integers, not {}",
                    key.type_name()
                ),
                line,
                col,
            ));
        };
        let idx = if raw < 0 { raw + len as i64 } else { raw };
        if idx < 0 || idx as usize >= len {
            return Err(RunError::runtime("list index out of range", line, col));
        }
        Ok(idx as usize)
    }

    // -----------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------

    fn eval(&mut self, expr: &Expr, scope: &mut Scope) -> RunResult<Value> {
        match &expr.kind {
            ExprKind::None_ => Ok(Value::None),
            ExprKind::Bool(b) => Ok(Value::Bool(*b)),
            ExprKind::Int(i) => Ok(Value::Int(*i)),
            ExprKind::Float(f) => Ok(Value::Float(*f)),
            ExprKind::Str(s) => Ok(Value::str_value(s.clone())),
            ExprKind::Name(name) => self.load(name, scope, expr.line, expr.col),
            ExprKind::Tuple(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item, scope)?);
                }
                Ok(Value::tuple(values))
            }
            ExprKind::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item, scope)?);
                }
                Ok(Value::list(values))
            }
            ExprKind::Dict(pairs) => {
                let mut values: Vec<(Value, Value)> = Vec::with_capacity(pairs.len());
                for (key, value) in pairs {
                    let key = self.eval(key, scope)?;
                    let value = self.eval(value, scope)?;
                    if let Some(slot) = values.iter_mut().find(|entry| entry.0.py_eq(&key)) {
                        slot.1 = value;
                    } else {
                        values.push((key, value));
                    }
                }
                Ok(Value::dict(values))
            }
            ExprKind::Unary { op, operand } => {
                let value = self.eval(operand, scope)?;
                self.unary(*op, value, expr.line, expr.col)
            }
            ExprKind::Binary { op, left, right } => {
                let left = self.eval(left, scope)?;
                let right = self.eval(right, scope)?;
                self.binop(*op, left, right, expr.line, expr.col)
            }
            ExprKind::BoolChain { op, values } => {
                let mut last = Value::None;
                for (index, value) in values.iter().enumerate() {
                    last = self.eval(value, scope)?;
                    let is_last = index + 1 == values.len();
                    if is_last {
                        break;
                    }
                    match op {
                        BoolOp::And if !last.truthy() => break,
                        BoolOp::Or if last.truthy() => break,
                        _ => {}
                    }
                }
                Ok(last)
            }
            ExprKind::Compare { left, comparisons } => {
                let mut prev = self.eval(left, scope)?;
                for (op, comparator) in comparisons {
                    let next = self.eval(comparator, scope)?;
                    if !self.compare(*op, &prev, &next, expr.line, expr.col)? {
                        return Ok(Value::Bool(false));
                    }
                    prev = next;
                }
                Ok(Value::Bool(true))
            }
            ExprKind::Call { func, args, kwargs } => {
                let callee = self.eval(func, scope)?;
                let mut arg_values = Vec::with_capacity(args.len());
                for arg in args {
                    arg_values.push(self.eval(arg, scope)?);
                }
                let mut kwarg_values = Vec::with_capacity(kwargs.len());
                for (name, value) in kwargs {
                    kwarg_values.push((name.clone(), self.eval(value, scope)?));
                }
                self.call_value(callee, arg_values, kwarg_values, expr.line, expr.col)
            }
            ExprKind::Attribute { value, attr } => {
                let base = self.eval(value, scope)?;
                self.attr_get(base, attr, expr.line, expr.col)
            }
            ExprKind::Subscript { value, index } => {
                let base = self.eval(value, scope)?;
                let key = self.eval(index, scope)?;
                self.index_get(base, key, expr.line, expr.col)
            }
            ExprKind::IfElse { test, body, orelse } => {
                if self.eval(test, scope)?.truthy() {
                    self.eval(body, scope)
                } else {
                    self.eval(orelse, scope)
                }
            }
            ExprKind::Lambda { params, body } => {
                let body_stmt = Stmt {
                    line: body.line,
                    kind: StmtKind::Return(Some((**body).clone())),
                };
                self.make_function("<lambda>", params, &[body_stmt], scope)
            }
            ExprKind::Named { name, value } => {
                let value = self.eval(value, scope)?;
                self.store(name, value.clone(), scope);
                Ok(value)
            }
            ExprKind::ListComp {
                element,
                target,
                iter,
                cond,
            } => {
                let iterable = self.eval(iter, scope)?;
                let items = self.iter_values(iterable, iter.line, iter.col)?;
                // The comprehension target shadows, then restores, any
                // same-named binding in the enclosing scope.
                let names = collect_target_names(target);
                let saved: Vec<(String, Option<Value>)> = names
                    .iter()
                    .map(|n| (n.clone(), self.peek_binding(n, scope)))
                    .collect();
                let mut out = Vec::new();
                let result = (|| -> RunResult<()> {
                    for item in items {
                        self.tick(expr.line)?;
                        self.assign_target(target, item, scope)?;
                        if let Some(cond) = cond
                            && !self.eval(cond, scope)?.truthy()
                        {
                            continue;
                        }
                        out.push(self.eval(element, scope)?);
                    }
                    Ok(())
                })();
                for (name, old) in saved {
                    match old {
                        Some(value) => self.store(&name, value, scope),
                        None => {
                            match scope {
                                Scope::Local(locals) => {
                                    locals.remove(&name);
                                }
                                Scope::Module => {
                                    self.globals.remove(&name);
                                }
                            };
                        }
                    }
                }
                result?;
                Ok(Value::list(out))
            }
            ExprKind::Starred(_) => Err(RunError::runtime(
                "starred expressions are only valid in assignment targets",
                expr.line,
                expr.col,
            )),
        }
    }

    fn peek_binding(&self, name: &str, scope: &Scope) -> Option<Value> {
        match scope {
            Scope::Local(locals) => locals.get(name).cloned(),
            Scope::Module => self.globals.get(name).cloned(),
        }
    }

    fn unary(&mut self, op: UnaryOp, value: Value, line: usize, col: usize) -> RunResult<Value> {
        match op {
            UnaryOp::Not => Ok(Value::Bool(!value.truthy())),
            UnaryOp::Neg => match value {
                Value::Int(i) => Ok(Value::Int(-i)),
                Value::Float(f) => Ok(Value::Float(-f)),
                Value::Bool(b) => Ok(Value::Int(-i64::from(b))),
                other => Err(RunError::runtime(
                    format!("bad operand type for unary -: '{}'", other.type_name()),
                    line,
                    col,
                )),
            },
            UnaryOp::Pos => match value {
                Value::Int(_) | Value::Float(_) => Ok(value),
                Value::Bool(b) => Ok(Value::Int(i64::from(b))),
                other => Err(RunError::runtime(
                    format!("bad operand type for unary +: '{}'", other.type_name()),
                    line,
                    col,
                )),
            },
            UnaryOp::Invert => match value.as_int() {
                Some(i) => Ok(Value::Int(!i)),
                None => Err(RunError::runtime(
                    format!("bad operand type for unary ~: '{}'", value.type_name()),
                    line,
                    col,
                )),
            },
        }
    }

    fn binop(&mut self, op: Op, left: Value, right: Value, line: usize, col: usize) -> RunResult<Value> {
        use Op::*;
        let type_error = |op_text: &str, l: &Value, r: &Value| {
            RunError::runtime(
                format!(
                    "unsupported operand type(s) for {op_text}: '{}' and '{}'",
                    l.type_name(),
                    r.type_name()
                ),
                line,
                col,
            )
        };

        match op {
            Plus => match (&left, &right) {
                (Value::Str(a), Value::Str(b)) => {
                    Ok(Value::str_value(format!("{a}{b}")))
                }
                (Value::List(a), Value::List(b)) => {
                    let mut out = a.borrow().clone();
                    out.extend(b.borrow().iter().cloned());
                    Ok(Value::list(out))
                }
                (Value::Tuple(a), Value::Tuple(b)) => {
                    let mut out = a.as_ref().clone();
                    out.extend(b.iter().cloned());
                    Ok(Value::tuple(out))
                }
                _ => self
                    .numeric_binop(op, &left, &right, line, col)
                    .ok_or_else(|| type_error("+", &left, &right))?,
            },
            Star => match (&left, &right) {
                (Value::Str(s), other) | (other, Value::Str(s)) if other.as_int().is_some() => {
                    let n = other.as_int().unwrap_or(0).max(0) as usize;
                    Ok(Value::str_value(s.repeat(n)))
                }
                (Value::List(items), other) | (other, Value::List(items))
                    if other.as_int().is_some() =>
                {
                    let n = other.as_int().unwrap_or(0).max(0) as usize;
                    let base = items.borrow();
                    let mut out = Vec::with_capacity(base.len() * n);
                    for _ in 0..n {
                        out.extend(base.iter().cloned());
                    }
                    Ok(Value::list(out))
                }
                _ => self
                    .numeric_binop(op, &left, &right, line, col)
                    .ok_or_else(|| type_error("*", &left, &right))?,
            },
            Minus | Slash | SlashSlash | Percent | StarStar => self
                .numeric_binop(op, &left, &right, line, col)
                .ok_or_else(|| {
                    let text = match op {
                        Minus => "-",
                        Slash => "/",
                        SlashSlash => "//",
                        Percent => "%",
                        _ => "**",
                    };
                    type_error(text, &left, &right)
                })?,
            Amp | Pipe | Caret | Shl | Shr => {
                let (Some(a), Some(b)) = (left.as_int(), right.as_int()) else {
                    let text = match op {
                        Amp => "&",
                        Pipe => "|",
                        Caret => "^",
                        Shl => "<<",
                        _ => ">>",
                    };
                    return Err(type_error(text, &left, &right));
                };
                let result = match op {
                    Amp => a & b,
                    Pipe => a | b,
                    Caret => a ^ b,
                    Shl => {
                        if !(0..64).contains(&b) {
                            return Err(RunError::runtime("shift count out of range", line, col));
                        }
                        a.checked_shl(b as u32).ok_or_else(|| {
                            RunError::runtime("shift result too large", line, col)
                        })?
                    }
                    _ => {
                        if !(0..64).contains(&b) {
                            return Err(RunError::runtime("shift count out of range", line, col));
                        }
                        a >> b
                    }
                };
                Ok(Value::Int(result))
            }
            other => Err(RunError::runtime(
                format!("operator {other:?} cannot be used here"),
                line,
                col,
            )),
        }
    }

    /// Numeric arithmetic with int/float promotion. Returns `None` when the
    /// operands are not numeric so the caller can raise a typed error.
    fn numeric_binop(
        &mut self,
        op: Op,
        left: &Value,
        right: &Value,
        line: usize,
        col: usize,
    ) -> Option<RunResult<Value>> {
        let both_int = matches!(left, Value::Int(_) | Value::Bool(_))
            && matches!(right, Value::Int(_) | Value::Bool(_));
        let (a, b) = (left.as_float()?, right.as_float()?);

        if both_int {
            let (ai, bi) = (left.as_int()?, right.as_int()?);
            let result = match op {
                Op::Plus => ai.checked_add(bi).map(Value::Int),
                Op::Minus => ai.checked_sub(bi).map(Value::Int),
                Op::Star => ai.checked_mul(bi).map(Value::Int),
                Op::Slash => {
                    if bi == 0 {
                        return Some(Err(RunError::runtime("division by zero", line, col)));
                    }
                    return Some(Ok(Value::Float(a / b)));
                }
                Op::SlashSlash => {
                    if bi == 0 {
                        return Some(Err(RunError::runtime(
                            "integer division or modulo by zero",
                            line,
                            col,
                        )));
                    }
                    Some(Value::Int(ai.div_euclid(bi)))
                }
                Op::Percent => {
                    if bi == 0 {
                        return Some(Err(RunError::runtime(
                            "integer division or modulo by zero",
                            line,
                            col,
                        )));
                    }
                    Some(Value::Int(ai.rem_euclid(bi)))
                }
                Op::StarStar => {
                    if bi >= 0 {
                        // Oversized exponents fall through to the overflow
                        // error below, not a type error.
                        u32::try_from(bi)
                            .ok()
                            .and_then(|exp| ai.checked_pow(exp))
                            .map(Value::Int)
                    } else {
                        return Some(Ok(Value::Float(a.powf(b))));
                    }
                }
                _ => return None,
            };
            return Some(result.ok_or_else(|| {
                RunError::runtime("integer result out of range", line, col)
            }));
        }

        let result = match op {
            Op::Plus => Value::Float(a + b),
            Op::Minus => Value::Float(a - b),
            Op::Star => Value::Float(a * b),
            Op::Slash => {
                if b == 0.0 {
                    return Some(Err(RunError::runtime("float division by zero", line, col)));
                }
                Value::Float(a / b)
            }
            Op::SlashSlash => {
                if b == 0.0 {
                    return Some(Err(RunError::runtime("float floor division by zero", line, col)));
                }
                Value::Float((a / b).floor())
            }
            Op::Percent => {
                if b == 0.0 {
                    return Some(Err(RunError::runtime("float modulo", line, col)));
                }
                Value::Float(a - b * (a / b).floor())
            }
            Op::StarStar => Value::Float(a.powf(b)),
            _ => return None,
        };
        Some(Ok(result))
    }

    fn compare(&mut self, op: CmpOp, left: &Value, right: &Value, line: usize, col: usize) -> RunResult<bool> {
        match op {
            CmpOp::Eq => Ok(left.py_eq(right)),
            CmpOp::Ne => Ok(!left.py_eq(right)),
            CmpOp::Is => Ok(values_identical(left, right)),
            CmpOp::IsNot => Ok(!values_identical(left, right)),
            CmpOp::In => self.contains(right, left, line, col),
            CmpOp::NotIn => Ok(!self.contains(right, left, line, col)?),
            CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
                let Some(ordering) = order_values(left, right) else {
                    let symbol = match op {
                        CmpOp::Lt => "<",
                        CmpOp::Le => "<=",
                        CmpOp::Gt => ">",
                        _ => ">=",
                    };
                    return Err(RunError::runtime(
                        format!(
                            "'{symbol}' not supported between instances of '{}' and '{}'",
                            left.type_name(),
                            right.type_name()
                        ),
                        line,
                        col,
                    ));
                };
                Ok(match op {
                    CmpOp::Lt => ordering.is_lt(),
                    CmpOp::Le => ordering.is_le(),
                    CmpOp::Gt => ordering.is_gt(),
                    _ => ordering.is_ge(),
                })
            }
        }
    }

    fn contains(&mut self, container: &Value, needle: &Value, line: usize, col: usize) -> RunResult<bool> {
        match container {
            Value::Str(haystack) => match needle {
                Value::Str(sub) => Ok(haystack.contains(sub.as_str())),
                other => Err(RunError::runtime(
                    format!(
                        "'in <string>' requires string as left operand, not {}",
                        other.type_name()
                    ),
                    line,
                    col,
                )),
            },
            Value::List(items) => Ok(items.borrow().iter().any(|v| v.py_eq(needle))),
            Value::Tuple(items) => Ok(items.iter().any(|v| v.py_eq(needle))),
            Value::Dict(pairs) => Ok(pairs.borrow().iter().any(|(k, _)| k.py_eq(needle))),
            Value::Range { start, stop, step } => match needle.as_int() {
                Some(n) => {
                    let within = if *step > 0 {
                        n >= *start && n < *stop && (n - start) % step == 0
                    } else if *step < 0 {
                        n <= *start && n > *stop && (start - n) % (-step) == 0
                    } else {
                        false
                    };
                    Ok(within)
                }
                None => Ok(false),
            },
            other => Err(RunError::runtime(
                format!("argument of type '{}' is not iterable", other.type_name()),
                line,
                col,
            )),
        }
    }

    fn iter_values(&mut self, value: Value, line: usize, col: usize) -> RunResult<Vec<Value>> {
        match value {
            Value::List(items) => Ok(items.borrow().clone()),
            Value::Tuple(items) => Ok(items.as_ref().clone()),
            Value::Str(s) => Ok(s.chars().map(|c| Value::str_value(c.to_string())).collect()),
            Value::Dict(pairs) => Ok(pairs.borrow().iter().map(|(k, _)| k.clone()).collect()),
            Value::Range { start, stop, step } => {
                let len = range_len(start, stop, step);
                if len > MAX_RANGE_MATERIALIZE {
                    return Err(RunError::other(
                        format!("range of {len} items is too large to iterate"),
                        line,
                        col,
                    ));
                }
                let mut out = Vec::with_capacity(len as usize);
                let mut current = start;
                for _ in 0..len {
                    out.push(Value::Int(current));
                    current += step;
                }
                Ok(out)
            }
            other => Err(RunError::runtime(
                format!("'{}' object is not iterable", other.type_name()),
                line,
                col,
            )),
        }
    }

    fn index_get(&mut self, base: Value, key: Value, line: usize, col: usize) -> RunResult<Value> {
        match base {
            Value::List(items) => {
                let items = items.borrow();
                let idx = self.list_index(&key, items.len(), line, col)?;
                Ok(items[idx].clone())
            }
            Value::Tuple(items) => {
                let idx = self.list_index(&key, items.len(), line, col)?;
                Ok(items[idx].clone())
            }
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                let idx = self.list_index(&key, chars.len(), line, col)?;
                Ok(Value::str_value(chars[idx].to_string()))
            }
            Value::Dict(pairs) => {
                let pairs = pairs.borrow();
                pairs
                    .iter()
                    .find(|(k, _)| k.py_eq(&key))
                    .map(|(_, v)| v.clone())
                    .ok_or_else(|| {
                        RunError::runtime(format!("KeyError: {}", key.repr()), line, col)
                    })
            }
            Value::Range { start, stop, step } => {
                let len = range_len(start, stop, step);
                let idx = self.list_index(&key, len as usize, line, col)?;
                Ok(Value::Int(start + step * idx as i64))
            }
            other => Err(RunError::runtime(
                format!("'{}' object is not subscriptable", other.type_name()),
                line,
                col,
            )),
        }
    }

    fn attr_get(&mut self, base: Value, attr: &str, line: usize, col: usize) -> RunResult<Value> {
        if let Value::Module(module) = &base {
            return module.attrs.get(attr).cloned().ok_or_else(|| {
                RunError::runtime(
                    format!("module '{}' has no attribute '{attr}'", module.name),
                    line,
                    col,
                )
            });
        }

        let method: Option<&'static str> = match (&base, attr) {
            (Value::Str(_), "upper") => Some("upper"),
            (Value::Str(_), "lower") => Some("lower"),
            (Value::Str(_), "strip") => Some("strip"),
            (Value::Str(_), "split") => Some("split"),
            (Value::Str(_), "join") => Some("join"),
            (Value::Str(_), "replace") => Some("replace"),
            (Value::Str(_), "startswith") => Some("startswith"),
            (Value::Str(_), "endswith") => Some("endswith"),
            (Value::List(_), "append") => Some("append"),
            (Value::List(_), "pop") => Some("pop"),
            (Value::List(_), "extend") => Some("extend"),
            (Value::List(_), "sort") => Some("sort"),
            (Value::List(_), "count") => Some("count"),
            (Value::List(_), "index") => Some("index"),
            (Value::Dict(_), "get") => Some("get"),
            (Value::Dict(_), "keys") => Some("keys"),
            (Value::Dict(_), "values") => Some("values"),
            (Value::Dict(_), "items") => Some("items"),
            _ => None,
        };
        match method {
            Some(name) => Ok(Value::Method(Rc::new((base, name)))),
            None => Err(RunError::runtime(
                format!("'{}' object has no attribute '{attr}'", base.type_name()),
                line,
                col,
            )),
        }
    }

    // -----------------------------------------------------------------
    // Calls
    // -----------------------------------------------------------------

    fn call_value(
        &mut self,
        callee: Value,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        line: usize,
        col: usize,
    ) -> RunResult<Value> {
        match callee {
            Value::Builtin(builtin) => self.call_builtin(builtin, args, kwargs, line, col),
            Value::Method(method) => self.call_method(&method.0, method.1, args, line, col),
            Value::Func(function) => self.call_function(function, args, kwargs, line, col),
            other => Err(RunError::runtime(
                format!("'{}' object is not callable", other.type_name()),
                line,
                col,
            )),
        }
    }

    fn call_function(
        &mut self,
        function: Rc<Function>,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        line: usize,
        col: usize,
    ) -> RunResult<Value> {
        if self.call_depth >= MAX_CALL_DEPTH {
            return Err(RunError::runtime("maximum recursion depth exceeded", line, col));
        }
        if args.len() > function.params.len() {
            return Err(RunError::runtime(
                format!(
                    "{}() takes {} positional arguments but {} were given",
                    function.name,
                    function.params.len(),
                    args.len()
                ),
                line,
                col,
            ));
        }

        let mut locals = HashMap::new();
        let mut args = args.into_iter();
        for (index, param) in function.params.iter().enumerate() {
            if let Some(value) = args.next() {
                if kwargs.iter().any(|(name, _)| name == &param.name) {
                    return Err(RunError::runtime(
                        format!(
                            "{}() got multiple values for argument '{}'",
                            function.name, param.name
                        ),
                        line,
                        col,
                    ));
                }
                locals.insert(param.name.clone(), value);
                continue;
            }
            if let Some((_, value)) = kwargs.iter().find(|(name, _)| name == &param.name) {
                locals.insert(param.name.clone(), value.clone());
                continue;
            }
            if let Some(Some(default)) = function.defaults.get(index) {
                locals.insert(param.name.clone(), default.clone());
                continue;
            }
            return Err(RunError::runtime(
                format!(
                    "{}() missing 1 required positional argument: '{}'",
                    function.name, param.name
                ),
                line,
                col,
            ));
        }
        for (name, _) in &kwargs {
            if !function.params.iter().any(|p| &p.name == name) {
                return Err(RunError::runtime(
                    format!(
                        "{}() got an unexpected keyword argument '{name}'",
                        function.name
                    ),
                    line,
                    col,
                ));
            }
        }

        self.call_depth += 1;
        let mut scope = Scope::Local(locals);
        let flow = self.exec_block(&function.body, &mut scope);
        self.call_depth -= 1;
        match flow? {
            Flow::Return(value) => Ok(value),
            Flow::Normal => Ok(Value::None),
            Flow::Break | Flow::Continue => Err(RunError::runtime(
                "'break' or 'continue' outside loop",
                line,
                col,
            )),
        }
    }

    fn call_method(
        &mut self,
        receiver: &Value,
        name: &'static str,
        args: Vec<Value>,
        line: usize,
        col: usize,
    ) -> RunResult<Value> {
        let arity = |expected: std::ops::RangeInclusive<usize>, got: usize| -> RunResult<()> {
            if expected.contains(&got) {
                Ok(())
            } else {
                Err(RunError::runtime(
                    format!("{name}() takes {expected:?} arguments but {got} were given"),
                    line,
                    col,
                ))
            }
        };

        match (receiver, name) {
            (Value::Str(s), "upper") => {
                arity(0..=0, args.len())?;
                Ok(Value::str_value(s.to_uppercase()))
            }
            (Value::Str(s), "lower") => {
                arity(0..=0, args.len())?;
                Ok(Value::str_value(s.to_lowercase()))
            }
            (Value::Str(s), "strip") => {
                arity(0..=0, args.len())?;
                Ok(Value::str_value(s.trim()))
            }
            (Value::Str(s), "split") => {
                arity(0..=1, args.len())?;
                let parts: Vec<Value> = match args.first() {
                    None => s
                        .split_whitespace()
                        .map(|p| Value::str_value(p))
                        .collect(),
                    Some(Value::Str(sep)) => {
                        s.split(sep.as_str()).map(Value::str_value).collect()
                    }
                    Some(other) => {
                        return Err(RunError::runtime(
                            format!("must be str, not {}", other.type_name()),
                            line,
                            col,
                        ));
                    }
                };
                Ok(Value::list(parts))
            }
            (Value::Str(sep), "join") => {
                arity(1..=1, args.len())?;
                let items = self.iter_values(args[0].clone(), line, col)?;
                let mut parts = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::Str(s) => parts.push(s.as_ref().clone()),
                        other => {
                            return Err(RunError::runtime(
                                format!(
                                    "sequence item: expected str instance, {} found",
                                    other.type_name()
                                ),
                                line,
                                col,
                            ));
                        }
                    }
                }
                Ok(Value::str_value(parts.join(sep)))
            }
            (Value::Str(s), "replace") => {
                arity(2..=2, args.len())?;
                match (&args[0], &args[1]) {
                    (Value::Str(from), Value::Str(to)) => {
                        Ok(Value::str_value(s.replace(from.as_str(), to.as_str())))
                    }
                    _ => Err(RunError::runtime("replace arguments must be str", line, col)),
                }
            }
            (Value::Str(s), "startswith") => {
                arity(1..=1, args.len())?;
                match &args[0] {
                    Value::Str(prefix) => Ok(Value::Bool(s.starts_with(prefix.as_str()))),
                    other => Err(RunError::runtime(
                        format!("startswith first arg must be str, not {}", other.type_name()),
                        line,
                        col,
                    )),
                }
            }
            (Value::Str(s), "endswith") => {
                arity(1..=1, args.len())?;
                match &args[0] {
                    Value::Str(suffix) => Ok(Value::Bool(s.ends_with(suffix.as_str()))),
                    other => Err(RunError::runtime(
                        format!("endswith first arg must be str, not {}", other.type_name()),
                        line,
                        col,
                    )),
                }
            }
            (Value::List(items), "append") => {
                arity(1..=1, args.len())?;
                items.borrow_mut().push(args.into_iter().next().expect("one arg"));
                Ok(Value::None)
            }
            (Value::List(items), "pop") => {
                arity(0..=1, args.len())?;
                let mut items = items.borrow_mut();
                let idx = match args.first() {
                    Some(key) => self.list_index(key, items.len(), line, col)?,
                    None => {
                        if items.is_empty() {
                            return Err(RunError::runtime("pop from empty list", line, col));
                        }
                        items.len() - 1
                    }
                };
                Ok(items.remove(idx))
            }
            (Value::List(items), "extend") => {
                arity(1..=1, args.len())?;
                let extra = self.iter_values(args[0].clone(), line, col)?;
                items.borrow_mut().extend(extra);
                Ok(Value::None)
            }
            (Value::List(items), "sort") => {
                arity(0..=0, args.len())?;
                let mut snapshot = items.borrow().clone();
                let mut failed = None;
                snapshot.sort_by(|a, b| match order_values(a, b) {
                    Some(ordering) => ordering,
                    None => {
                        failed = Some((a.type_name(), b.type_name()));
                        std::cmp::Ordering::Equal
                    }
                });
                if let Some((a, b)) = failed {
                    return Err(RunError::runtime(
                        format!("'<' not supported between instances of '{b}' and '{a}'"),
                        line,
                        col,
                    ));
                }
                *items.borrow_mut() = snapshot;
                Ok(Value::None)
            }
            (Value::List(items), "count") => {
                arity(1..=1, args.len())?;
                let count = items.borrow().iter().filter(|v| v.py_eq(&args[0])).count();
                Ok(Value::Int(count as i64))
            }
            (Value::List(items), "index") => {
                arity(1..=1, args.len())?;
                items
                    .borrow()
                    .iter()
                    .position(|v| v.py_eq(&args[0]))
                    .map(|i| Value::Int(i as i64))
                    .ok_or_else(|| {
                        RunError::runtime(
                            format!("{} is not in list", args[0].repr()),
                            line,
                            col,
                        )
                    })
            }
            (Value::Dict(pairs), "get") => {
                arity(1..=2, args.len())?;
                let found = pairs
                    .borrow()
                    .iter()
                    .find(|(k, _)| k.py_eq(&args[0]))
                    .map(|(_, v)| v.clone());
                Ok(found.unwrap_or_else(|| args.get(1).cloned().unwrap_or(Value::None)))
            }
            (Value::Dict(pairs), "keys") => {
                arity(0..=0, args.len())?;
                Ok(Value::list(
                    pairs.borrow().iter().map(|(k, _)| k.clone()).collect(),
                ))
            }
            (Value::Dict(pairs), "values") => {
                arity(0..=0, args.len())?;
                Ok(Value::list(
                    pairs.borrow().iter().map(|(_, v)| v.clone()).collect(),
                ))
            }
            (Value::Dict(pairs), "items") => {
                arity(0..=0, args.len())?;
                Ok(Value::list(
                    pairs
                        .borrow()
                        .iter()
                        .map(|(k, v)| Value::tuple(vec![k.clone(), v.clone()]))
                        .collect(),
                ))
            }
            _ => Err(RunError::runtime(
                format!("'{}' object has no method '{name}'", receiver.type_name()),
                line,
                col,
            )),
        }
    }

    fn call_builtin(
        &mut self,
        builtin: Builtin,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        line: usize,
        col: usize,
    ) -> RunResult<Value> {
        let type_err = |message: String| RunError::runtime(message, line, col);
        let arity = |expected: std::ops::RangeInclusive<usize>| -> RunResult<()> {
            if expected.contains(&args.len()) {
                Ok(())
            } else {
                Err(RunError::runtime(
                    format!(
                        "{}() takes {:?} arguments but {} were given",
                        builtin.name(),
                        expected,
                        args.len()
                    ),
                    line,
                    col,
                ))
            }
        };
        // Only print accepts keyword arguments.
        if !kwargs.is_empty() && builtin != Builtin::Print {
            return Err(type_err(format!(
                "{}() takes no keyword arguments",
                builtin.name()
            )));
        }

        match builtin {
            Builtin::Print => {
                let mut sep = " ".to_string();
                let mut end = "\n".to_string();
                for (name, value) in &kwargs {
                    match name.as_str() {
                        "sep" => sep = value.str_form(),
                        "end" => end = value.str_form(),
                        other => {
                            return Err(type_err(format!(
                                "'{other}' is an invalid keyword argument for print()"
                            )));
                        }
                    }
                }
                let text: Vec<String> = args.iter().map(Value::str_form).collect();
                self.io.stdout.push_str(&text.join(&sep));
                self.io.stdout.push_str(&end);
                Ok(Value::None)
            }
            Builtin::Len => {
                arity(1..=1)?;
                let len = match &args[0] {
                    Value::Str(s) => s.chars().count() as i64,
                    Value::List(items) => items.borrow().len() as i64,
                    Value::Tuple(items) => items.len() as i64,
                    Value::Dict(pairs) => pairs.borrow().len() as i64,
                    Value::Range { start, stop, step } => range_len(*start, *stop, *step),
                    other => {
                        return Err(type_err(format!(
                            "object of type '{}' has no len()",
                            other.type_name()
                        )));
                    }
                };
                Ok(Value::Int(len))
            }
            Builtin::Repr => {
                arity(1..=1)?;
                Ok(Value::str_value(args[0].repr()))
            }
            Builtin::Str => {
                arity(0..=1)?;
                Ok(Value::str_value(
                    args.first().map(Value::str_form).unwrap_or_default(),
                ))
            }
            Builtin::Int => {
                arity(1..=1)?;
                match &args[0] {
                    Value::Int(i) => Ok(Value::Int(*i)),
                    Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
                    Value::Float(f) => Ok(Value::Int(f.trunc() as i64)),
                    Value::Str(s) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| {
                        type_err(format!(
                            "invalid literal for int() with base 10: {}",
                            Value::str_value(s.as_str().to_string()).repr()
                        ))
                    }),
                    other => Err(type_err(format!(
                        "int() argument must be a string or a number, not '{}'",
                        other.type_name()
                    ))),
                }
            }
            Builtin::Float => {
                arity(1..=1)?;
                match &args[0] {
                    Value::Float(f) => Ok(Value::Float(*f)),
                    Value::Int(i) => Ok(Value::Float(*i as f64)),
                    Value::Bool(b) => Ok(Value::Float(if *b { 1.0 } else { 0.0 })),
                    Value::Str(s) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| {
                        type_err(format!("could not convert string to float: '{s}'"))
                    }),
                    other => Err(type_err(format!(
                        "float() argument must be a string or a number, not '{}'",
                        other.type_name()
                    ))),
                }
            }
            Builtin::Bool => {
                arity(0..=1)?;
                Ok(Value::Bool(args.first().map(Value::truthy).unwrap_or(false)))
            }
            Builtin::Abs => {
                arity(1..=1)?;
                match &args[0] {
                    Value::Int(i) => Ok(Value::Int(i.abs())),
                    Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
                    Value::Float(f) => Ok(Value::Float(f.abs())),
                    other => Err(type_err(format!(
                        "bad operand type for abs(): '{}'",
                        other.type_name()
                    ))),
                }
            }
            Builtin::Min | Builtin::Max => {
                if args.is_empty() {
                    return Err(type_err(format!(
                        "{}() expected at least 1 argument, got 0",
                        builtin.name()
                    )));
                }
                let candidates = if args.len() == 1 {
                    self.iter_values(args[0].clone(), line, col)?
                } else {
                    args.clone()
                };
                if candidates.is_empty() {
                    return Err(type_err(format!("{}() arg is an empty sequence", builtin.name())));
                }
                let mut best = candidates[0].clone();
                for candidate in &candidates[1..] {
                    let Some(ordering) = order_values(candidate, &best) else {
                        return Err(type_err(format!(
                            "'<' not supported between instances of '{}' and '{}'",
                            candidate.type_name(),
                            best.type_name()
                        )));
                    };
                    let better = if builtin == Builtin::Min {
                        ordering.is_lt()
                    } else {
                        ordering.is_gt()
                    };
                    if better {
                        best = candidate.clone();
                    }
                }
                Ok(best)
            }
            Builtin::Sum => {
                arity(1..=2)?;
                let items = self.iter_values(args[0].clone(), line, col)?;
                let mut total = args.get(1).cloned().unwrap_or(Value::Int(0));
                for item in items {
                    total = self.binop(Op::Plus, total, item, line, col)?;
                }
                Ok(total)
            }
            Builtin::Sorted => {
                arity(1..=1)?;
                let mut items = self.iter_values(args[0].clone(), line, col)?;
                let mut failed = None;
                items.sort_by(|a, b| match order_values(a, b) {
                    Some(ordering) => ordering,
                    None => {
                        failed = Some((a.type_name(), b.type_name()));
                        std::cmp::Ordering::Equal
                    }
                });
                if let Some((a, b)) = failed {
                    return Err(type_err(format!(
                        "'<' not supported between instances of '{b}' and '{a}'"
                    )));
                }
                Ok(Value::list(items))
            }
            Builtin::Range => {
                arity(1..=3)?;
                let ints: Vec<i64> = args
                    .iter()
                    .map(|a| {
                        a.as_int().ok_or_else(|| {
                            type_err(format!(
                                "'{}' object cannot be interpreted as an integer",
                                a.type_name()
                            ))
                        })
                    })
                    .collect::<RunResult<_>>()?;
                let (start, stop, step) = match ints.as_slice() {
                    [stop] => (0, *stop, 1),
                    [start, stop] => (*start, *stop, 1),
                    [start, stop, step] => (*start, *stop, *step),
                    _ => unreachable!("arity checked"),
                };
                if step == 0 {
                    return Err(type_err("range() arg 3 must not be zero".to_string()));
                }
                Ok(Value::Range { start, stop, step })
            }
            Builtin::Enumerate => {
                arity(1..=2)?;
                let start = match args.get(1) {
                    Some(v) => v.as_int().ok_or_else(|| {
                        type_err(format!(
                            "'{}' object cannot be interpreted as an integer",
                            v.type_name()
                        ))
                    })?,
                    None => 0,
                };
                let items = self.iter_values(args[0].clone(), line, col)?;
                Ok(Value::list(
                    items
                        .into_iter()
                        .enumerate()
                        .map(|(i, v)| Value::tuple(vec![Value::Int(start + i as i64), v]))
                        .collect(),
                ))
            }
            Builtin::Zip => {
                let mut columns = Vec::with_capacity(args.len());
                for arg in &args {
                    columns.push(self.iter_values(arg.clone(), line, col)?);
                }
                let shortest = columns.iter().map(Vec::len).min().unwrap_or(0);
                let mut rows = Vec::with_capacity(shortest);
                for i in 0..shortest {
                    rows.push(Value::tuple(
                        columns.iter().map(|c| c[i].clone()).collect(),
                    ));
                }
                Ok(Value::list(rows))
            }
            Builtin::Round => {
                arity(1..=2)?;
                let Some(x) = args[0].as_float() else {
                    return Err(type_err(format!(
                        "type {} doesn't define __round__ method",
                        args[0].type_name()
                    )));
                };
                match args.get(1) {
                    None => Ok(Value::Int(round_half_even(x))),
                    Some(digits) => {
                        let Some(d) = digits.as_int() else {
                            return Err(type_err(format!(
                                "'{}' object cannot be interpreted as an integer",
                                digits.type_name()
                            )));
                        };
                        let factor = 10f64.powi(d as i32);
                        Ok(Value::Float((x * factor).round() / factor))
                    }
                }
            }
            Builtin::Type => {
                arity(1..=1)?;
                Ok(Value::str_value(format!("<class '{}'>", args[0].type_name())))
            }
            Builtin::Display => {
                arity(1..=1)?;
                Ok(Value::Rich(Rc::new(RichValue::Prepared(args[0].clone()))))
            }
            Builtin::Html | Builtin::Markdown | Builtin::Latex | Builtin::Svg => {
                arity(1..=1)?;
                let Value::Str(text) = &args[0] else {
                    return Err(type_err(format!(
                        "{}() argument must be str, not '{}'",
                        builtin.name(),
                        args[0].type_name()
                    )));
                };
                let text = text.as_ref().clone();
                let rich = match builtin {
                    Builtin::Html => RichValue::Html(text),
                    Builtin::Markdown => RichValue::Markdown(text),
                    Builtin::Latex => RichValue::Latex(text),
                    _ => RichValue::Svg(text),
                };
                Ok(Value::Rich(Rc::new(rich)))
            }
            Builtin::Json => {
                arity(1..=1)?;
                let text = match &args[0] {
                    Value::Str(s) => s.as_ref().clone(),
                    other => to_json(other).ok_or_else(|| {
                        type_err(format!(
                            "Object of type {} is not JSON serializable",
                            other.type_name()
                        ))
                    })?,
                };
                Ok(Value::Rich(Rc::new(RichValue::Json(text))))
            }
            Builtin::MathSqrt => {
                arity(1..=1)?;
                let x = self.math_arg(&args[0], line, col)?;
                if x < 0.0 {
                    return Err(type_err("math domain error".to_string()));
                }
                Ok(Value::Float(x.sqrt()))
            }
            Builtin::MathFloor => {
                arity(1..=1)?;
                Ok(Value::Int(self.math_arg(&args[0], line, col)?.floor() as i64))
            }
            Builtin::MathCeil => {
                arity(1..=1)?;
                Ok(Value::Int(self.math_arg(&args[0], line, col)?.ceil() as i64))
            }
            Builtin::MathFabs => {
                arity(1..=1)?;
                Ok(Value::Float(self.math_arg(&args[0], line, col)?.abs()))
            }
            Builtin::MathPow => {
                arity(2..=2)?;
                let x = self.math_arg(&args[0], line, col)?;
                let y = self.math_arg(&args[1], line, col)?;
                Ok(Value::Float(x.powf(y)))
            }
            Builtin::MathLog => {
                arity(1..=2)?;
                let x = self.math_arg(&args[0], line, col)?;
                if x <= 0.0 {
                    return Err(type_err("math domain error".to_string()));
                }
                match args.get(1) {
                    None => Ok(Value::Float(x.ln())),
                    Some(base) => {
                        let base = self.math_arg(base, line, col)?;
                        Ok(Value::Float(x.log(base)))
                    }
                }
            }
            Builtin::MathSin => {
                arity(1..=1)?;
                Ok(Value::Float(self.math_arg(&args[0], line, col)?.sin()))
            }
            Builtin::MathCos => {
                arity(1..=1)?;
                Ok(Value::Float(self.math_arg(&args[0], line, col)?.cos()))
            }
        }
    }

    fn math_arg(&self, value: &Value, line: usize, col: usize) -> RunResult<f64> {
        value.as_float().ok_or_else(|| {
            RunError::runtime(
                format!("must be real number, not {}", value.type_name()),
                line,
                col,
            )
        })
    }
}

fn values_identical(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::None, Value::None) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Int(a), Value::Int(b)) => a == b,
        (Value::Str(a), Value::Str(b)) => Rc::ptr_eq(a, b) || a == b,
        (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
        (Value::Tuple(a), Value::Tuple(b)) => Rc::ptr_eq(a, b),
        (Value::Dict(a), Value::Dict(b)) => Rc::ptr_eq(a, b),
        (Value::Func(a), Value::Func(b)) => Rc::ptr_eq(a, b),
        (Value::Module(a), Value::Module(b)) => a.name == b.name,
        (Value::Builtin(a), Value::Builtin(b)) => a == b,
        _ => false,
    }
}

fn order_values(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    use std::cmp::Ordering;
    match (left, right) {
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        (Value::List(a), Value::List(b)) => {
            let (a, b) = (a.borrow(), b.borrow());
            order_sequences(&a, &b)
        }
        (Value::Tuple(a), Value::Tuple(b)) => order_sequences(a, b),
        _ => {
            let (a, b) = (left.as_float()?, right.as_float()?);
            a.partial_cmp(&b).or(Some(Ordering::Equal))
        }
    }
}

fn order_sequences(a: &[Value], b: &[Value]) -> Option<std::cmp::Ordering> {
    for (x, y) in a.iter().zip(b.iter()) {
        match order_values(x, y)? {
            std::cmp::Ordering::Equal => continue,
            other => return Some(other),
        }
    }
    Some(a.len().cmp(&b.len()))
}

/// Banker's rounding, matching Python's `round()`.
fn round_half_even(x: f64) -> i64 {
    let floor = x.floor();
    let diff = x - floor;
    if diff > 0.5 {
        floor as i64 + 1
    } else if diff < 0.5 {
        floor as i64
    } else if (floor as i64) % 2 == 0 {
        floor as i64
    } else {
        floor as i64 + 1
    }
}

fn collect_target_names(target: &Expr) -> Vec<String> {
    let mut names = Vec::new();
    fn walk(expr: &Expr, names: &mut Vec<String>) {
        match &expr.kind {
            ExprKind::Name(name) => names.push(name.clone()),
            ExprKind::Tuple(items) | ExprKind::List(items) => {
                for item in items {
                    walk(item, names);
                }
            }
            ExprKind::Starred(inner) => walk(inner, names),
            _ => {}
        }
    }
    walk(target, &mut names);
    names
}

pub fn make_math_module() -> Value {
    let mut attrs: HashMap<&'static str, Value> = HashMap::new();
    attrs.insert("pi", Value::Float(std::f64::consts::PI));
    attrs.insert("e", Value::Float(std::f64::consts::E));
    attrs.insert("tau", Value::Float(std::f64::consts::TAU));
    attrs.insert("sqrt", Value::Builtin(Builtin::MathSqrt));
    attrs.insert("floor", Value::Builtin(Builtin::MathFloor));
    attrs.insert("ceil", Value::Builtin(Builtin::MathCeil));
    attrs.insert("fabs", Value::Builtin(Builtin::MathFabs));
    attrs.insert("pow", Value::Builtin(Builtin::MathPow));
    attrs.insert("log", Value::Builtin(Builtin::MathLog));
    attrs.insert("sin", Value::Builtin(Builtin::MathSin));
    attrs.insert("cos", Value::Builtin(Builtin::MathCos));
    Value::Module(Rc::new(ModuleDef {
        name: "math",
        attrs,
    }))
}
