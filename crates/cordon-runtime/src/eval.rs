//! Tree-walking evaluator for the policy-gated dialect subset.
//!
//! Every executed statement and every call increments the step counter;
//! crossing `max_steps` aborts the run with a `StepLimitError` that user
//! code cannot catch. The checker runs before evaluation, so constructs
//! arriving here are either policy-approved or reported as unsupported.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use cordon_core::value::SerializeLimits;
use rustpython_parser::ast::{self, Expr, Ranged, Stmt};
use serde_json::Value as Json;

use crate::builtins::{call_builtin, iter_items};
use crate::caps::CapCallError;
use crate::context::RunCtx;
use crate::error::ExecError;
use crate::parse::LineIndex;
use crate::value::{Dict, RangeObj, Value};

/// Lexically chained variable scope.
pub struct Scope {
    vars: RefCell<HashMap<String, Value>>,
    parent: Option<Rc<Scope>>,
}

impl Scope {
    pub fn root() -> Rc<Scope> {
        Rc::new(Scope {
            vars: RefCell::new(HashMap::new()),
            parent: None,
        })
    }

    pub fn child(parent: &Rc<Scope>) -> Rc<Scope> {
        Rc::new(Scope {
            vars: RefCell::new(HashMap::new()),
            parent: Some(Rc::clone(parent)),
        })
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        if let Some(v) = self.vars.borrow().get(name) {
            return Some(v.clone());
        }
        self.parent.as_ref()?.get(name)
    }

    pub fn set(&self, name: impl Into<String>, value: Value) {
        self.vars.borrow_mut().insert(name.into(), value);
    }

    /// Local bindings of this scope only (no parents), insertion-agnostic.
    pub fn locals(&self) -> Vec<(String, Value)> {
        let vars = self.vars.borrow();
        let mut out: Vec<(String, Value)> = vars
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

/// A user-defined function or lambda.
pub struct UserFn {
    pub name: String,
    pub params: Vec<Param>,
    pub body: FnBody,
    pub closure: Rc<Scope>,
}

pub struct Param {
    pub name: String,
    pub default: Option<Value>,
}

pub enum FnBody {
    Block(Rc<Vec<Stmt>>),
    Expr(Rc<Expr>),
}

enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

/// Lazy iteration source; ranges never materialise.
enum ValueIter {
    Vec(std::vec::IntoIter<Value>),
    Range { range: RangeObj, i: u64, len: u64 },
}

impl Iterator for ValueIter {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        match self {
            ValueIter::Vec(it) => it.next(),
            ValueIter::Range { range, i, len } => {
                if i >= len {
                    return None;
                }
                let v = range.start + range.step * *i as i64;
                *i += 1;
                Some(Value::Int(v))
            }
        }
    }
}

pub struct Interp<'a> {
    pub ctx: Rc<RefCell<RunCtx>>,
    globals: HashMap<String, Value>,
    index: &'a LineIndex,
    max_steps: u64,
    pub steps: u64,
    depth: u32,
    max_depth: u32,
}

impl<'a> Interp<'a> {
    pub fn new(
        ctx: Rc<RefCell<RunCtx>>,
        globals: HashMap<String, Value>,
        index: &'a LineIndex,
        max_steps: u64,
        max_recursion: u32,
    ) -> Self {
        Self {
            ctx,
            globals,
            index,
            max_steps,
            steps: 0,
            depth: 0,
            max_depth: max_recursion,
        }
    }

    /// Execute a module body in the given scope.
    pub fn run_module(&mut self, suite: &[Stmt], scope: &Rc<Scope>) -> Result<(), ExecError> {
        match self.exec_block(suite, scope)? {
            Flow::Normal => Ok(()),
            Flow::Return(_) => Err(ExecError::new("SyntaxError", "'return' outside function")),
            Flow::Break | Flow::Continue => {
                Err(ExecError::new("SyntaxError", "'break' outside loop"))
            }
        }
    }

    fn line(&self, range: rustpython_parser::text_size::TextRange) -> u32 {
        self.index.location(u32::from(range.start()) as usize).0
    }

    fn step(&mut self) -> Result<(), ExecError> {
        self.steps += 1;
        if self.steps > self.max_steps {
            return Err(ExecError::step_limit(self.max_steps));
        }
        Ok(())
    }

    fn exec_block(&mut self, stmts: &[Stmt], scope: &Rc<Scope>) -> Result<Flow, ExecError> {
        for stmt in stmts {
            match self.exec_stmt(stmt, scope)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt, scope: &Rc<Scope>) -> Result<Flow, ExecError> {
        let line = self.line(stmt.range());
        self.step().map_err(|e| e.at_line(line))?;
        self.exec_stmt_inner(stmt, scope).map_err(|e| e.at_line(line))
    }

    fn exec_stmt_inner(&mut self, stmt: &Stmt, scope: &Rc<Scope>) -> Result<Flow, ExecError> {
        match stmt {
            Stmt::Expr(s) => {
                self.eval_expr(&s.value, scope)?;
                Ok(Flow::Normal)
            }
            Stmt::Assign(s) => {
                let value = self.eval_expr(&s.value, scope)?;
                for target in &s.targets {
                    self.assign_target(target, value.clone(), scope)?;
                }
                Ok(Flow::Normal)
            }
            Stmt::AugAssign(s) => {
                let rhs = self.eval_expr(&s.value, scope)?;
                match s.target.as_ref() {
                    Expr::Name(name) => {
                        let current = self
                            .lookup(name.id.as_str(), scope)
                            .ok_or_else(|| ExecError::name_error(name.id.as_str()))?;
                        let updated = self.binop(&s.op, current, rhs)?;
                        scope.set(name.id.as_str(), updated);
                    }
                    Expr::Subscript(sub) => {
                        let obj = self.eval_expr(&sub.value, scope)?;
                        let idx = self.eval_expr(&sub.slice, scope)?;
                        let current = self.index_get(&obj, &idx)?;
                        let updated = self.binop(&s.op, current, rhs)?;
                        self.index_set(&obj, idx, updated)?;
                    }
                    _ => {
                        return Err(ExecError::type_error(
                            "augmented assignment target is not assignable",
                        ));
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::AnnAssign(s) => {
                if let Some(value) = &s.value {
                    let v = self.eval_expr(value, scope)?;
                    self.assign_target(&s.target, v, scope)?;
                }
                Ok(Flow::Normal)
            }
            Stmt::If(s) => {
                if self.eval_expr(&s.test, scope)?.truthy() {
                    self.exec_block(&s.body, scope)
                } else {
                    self.exec_block(&s.orelse, scope)
                }
            }
            Stmt::While(s) => {
                let mut broke = false;
                loop {
                    self.step()?;
                    if !self.eval_expr(&s.test, scope)?.truthy() {
                        break;
                    }
                    match self.exec_block(&s.body, scope)? {
                        Flow::Normal | Flow::Continue => {}
                        Flow::Break => {
                            broke = true;
                            break;
                        }
                        flow @ Flow::Return(_) => return Ok(flow),
                    }
                }
                if !broke && !s.orelse.is_empty() {
                    return self.exec_block(&s.orelse, scope);
                }
                Ok(Flow::Normal)
            }
            Stmt::For(s) => {
                let iterable = self.eval_expr(&s.iter, scope)?;
                let mut iter = self.value_iter(&iterable)?;
                let mut broke = false;
                while let Some(item) = iter.next() {
                    self.step()?;
                    self.assign_target(&s.target, item, scope)?;
                    match self.exec_block(&s.body, scope)? {
                        Flow::Normal | Flow::Continue => {}
                        Flow::Break => {
                            broke = true;
                            break;
                        }
                        flow @ Flow::Return(_) => return Ok(flow),
                    }
                }
                if !broke && !s.orelse.is_empty() {
                    return self.exec_block(&s.orelse, scope);
                }
                Ok(Flow::Normal)
            }
            Stmt::FunctionDef(s) => {
                let params = self.build_params(&s.args, scope)?;
                let func = UserFn {
                    name: s.name.as_str().to_owned(),
                    params,
                    body: FnBody::Block(Rc::new(s.body.clone())),
                    closure: Rc::clone(scope),
                };
                scope.set(s.name.as_str(), Value::Func(Rc::new(func)));
                Ok(Flow::Normal)
            }
            Stmt::Return(s) => {
                let value = match &s.value {
                    Some(v) => self.eval_expr(v, scope)?,
                    None => Value::None,
                };
                Ok(Flow::Return(value))
            }
            Stmt::Assert(s) => {
                if self.eval_expr(&s.test, scope)?.truthy() {
                    return Ok(Flow::Normal);
                }
                let message = match &s.msg {
                    Some(m) => self.eval_expr(m, scope)?.py_str(),
                    None => String::new(),
                };
                Err(ExecError::new("AssertionError", message))
            }
            Stmt::Try(s) => self.exec_try(s, scope),
            Stmt::Pass(_) => Ok(Flow::Normal),
            Stmt::Break(_) => Ok(Flow::Break),
            Stmt::Continue(_) => Ok(Flow::Continue),
            Stmt::With(_) | Stmt::AsyncWith(_) => {
                Err(ExecError::not_supported("the 'with' statement"))
            }
            Stmt::ClassDef(_) => Err(ExecError::not_supported("class definitions")),
            Stmt::Match(_) => Err(ExecError::not_supported("the 'match' statement")),
            _ => Err(ExecError::not_supported("this statement")),
        }
    }

    fn exec_try(&mut self, s: &ast::StmtTry, scope: &Rc<Scope>) -> Result<Flow, ExecError> {
        let body_result = self.exec_block(&s.body, scope);

        let settled: Result<Flow, ExecError> = match body_result {
            Ok(Flow::Normal) => {
                if s.orelse.is_empty() {
                    Ok(Flow::Normal)
                } else {
                    self.exec_block(&s.orelse, scope)
                }
            }
            Ok(flow) => Ok(flow),
            Err(err) if err.catchable => {
                let mut handled = None;
                for handler in &s.handlers {
                    let ast::ExceptHandler::ExceptHandler(h) = handler;
                    if !handler_matches(h.type_.as_deref(), &err.kind) {
                        continue;
                    }
                    if let Some(alias) = &h.name {
                        scope.set(alias.as_str(), Value::str(&err.message));
                    }
                    handled = Some(self.exec_block(&h.body, scope));
                    break;
                }
                handled.unwrap_or(Err(err))
            }
            Err(err) => Err(err),
        };

        if !s.finalbody.is_empty() {
            match self.exec_block(&s.finalbody, scope)? {
                Flow::Normal => {}
                // A control-flow escape from `finally` wins over the body.
                flow => return Ok(flow),
            }
        }
        settled
    }

    fn build_params(
        &mut self,
        args: &ast::Arguments,
        scope: &Rc<Scope>,
    ) -> Result<Vec<Param>, ExecError> {
        if args.vararg.is_some() || args.kwarg.is_some() || !args.kwonlyargs.is_empty() {
            return Err(ExecError::not_supported("starred parameters"));
        }
        let mut params = Vec::new();
        for arg in args.posonlyargs.iter().chain(&args.args) {
            let default = match &arg.default {
                Some(d) => Some(self.eval_expr(d, scope)?),
                None => None,
            };
            params.push(Param {
                name: arg.def.arg.as_str().to_owned(),
                default,
            });
        }
        Ok(params)
    }

    pub fn eval_expr(&mut self, expr: &Expr, scope: &Rc<Scope>) -> Result<Value, ExecError> {
        match expr {
            Expr::Constant(e) => constant_value(&e.value),
            Expr::Name(e) => self
                .lookup(e.id.as_str(), scope)
                .ok_or_else(|| ExecError::name_error(e.id.as_str())),
            Expr::BinOp(e) => {
                let left = self.eval_expr(&e.left, scope)?;
                let right = self.eval_expr(&e.right, scope)?;
                self.binop(&e.op, left, right)
            }
            Expr::UnaryOp(e) => {
                let operand = self.eval_expr(&e.operand, scope)?;
                match e.op {
                    ast::UnaryOp::Not => Ok(Value::Bool(!operand.truthy())),
                    ast::UnaryOp::UAdd => match operand {
                        Value::Int(_) | Value::Float(_) => Ok(operand),
                        Value::Bool(b) => Ok(Value::Int(i64::from(b))),
                        other => Err(unary_type_error("+", &other)),
                    },
                    ast::UnaryOp::USub => match operand {
                        Value::Int(i) => {
                            i.checked_neg().map(Value::Int).ok_or_else(ExecError::overflow)
                        }
                        Value::Float(f) => Ok(Value::Float(-f)),
                        Value::Bool(b) => Ok(Value::Int(-i64::from(b))),
                        other => Err(unary_type_error("-", &other)),
                    },
                    ast::UnaryOp::Invert => match operand {
                        Value::Int(i) => Ok(Value::Int(!i)),
                        Value::Bool(b) => Ok(Value::Int(!i64::from(b))),
                        other => Err(unary_type_error("~", &other)),
                    },
                }
            }
            Expr::BoolOp(e) => {
                let mut last = Value::None;
                match e.op {
                    ast::BoolOp::And => {
                        for value in &e.values {
                            last = self.eval_expr(value, scope)?;
                            if !last.truthy() {
                                return Ok(last);
                            }
                        }
                    }
                    ast::BoolOp::Or => {
                        for value in &e.values {
                            last = self.eval_expr(value, scope)?;
                            if last.truthy() {
                                return Ok(last);
                            }
                        }
                    }
                }
                Ok(last)
            }
            Expr::Compare(e) => {
                let mut current = self.eval_expr(&e.left, scope)?;
                for (op, comparator) in e.ops.iter().zip(&e.comparators) {
                    let right = self.eval_expr(comparator, scope)?;
                    if !self.compare(op, &current, &right)? {
                        return Ok(Value::Bool(false));
                    }
                    current = right;
                }
                Ok(Value::Bool(true))
            }
            Expr::IfExp(e) => {
                if self.eval_expr(&e.test, scope)?.truthy() {
                    self.eval_expr(&e.body, scope)
                } else {
                    self.eval_expr(&e.orelse, scope)
                }
            }
            Expr::List(e) => {
                let items = self.eval_elements(&e.elts, scope)?;
                Ok(Value::list(items))
            }
            Expr::Tuple(e) => {
                let items = self.eval_elements(&e.elts, scope)?;
                Ok(Value::tuple(items))
            }
            Expr::Set(e) => {
                let mut out: Vec<Value> = Vec::new();
                for item in self.eval_elements(&e.elts, scope)? {
                    if !out.iter().any(|x| x.py_eq(&item)) {
                        out.push(item);
                    }
                }
                Ok(Value::Set(Rc::new(RefCell::new(out))))
            }
            Expr::Dict(e) => {
                let mut dict = Dict::default();
                for (key, value) in e.keys.iter().zip(&e.values) {
                    let Some(key) = key else {
                        return Err(ExecError::not_supported("dict unpacking"));
                    };
                    let k = self.eval_expr(key, scope)?;
                    let v = self.eval_expr(value, scope)?;
                    dict.insert(k, v);
                }
                Ok(Value::Dict(Rc::new(RefCell::new(dict))))
            }
            Expr::Subscript(e) => {
                let obj = self.eval_expr(&e.value, scope)?;
                if let Expr::Slice(slice) = e.slice.as_ref() {
                    self.slice_get(&obj, slice, scope)
                } else {
                    let idx = self.eval_expr(&e.slice, scope)?;
                    self.index_get(&obj, &idx)
                }
            }
            Expr::Attribute(e) => {
                let Expr::Name(base) = e.value.as_ref() else {
                    return Err(ExecError::attribute_error(
                        "only root.attr attribute access is allowed",
                    ));
                };
                let root = self
                    .lookup(base.id.as_str(), scope)
                    .ok_or_else(|| ExecError::name_error(base.id.as_str()))?;
                match root {
                    Value::Root(proxy) => proxy
                        .get_attr(e.attr.as_str())
                        .map_err(ExecError::attribute_error),
                    other => Err(ExecError::attribute_error(format!(
                        "'{}' object has no attribute '{}'",
                        other.type_name(),
                        e.attr.as_str()
                    ))),
                }
            }
            Expr::Call(e) => {
                let callee = self.eval_expr(&e.func, scope)?;
                let mut args = Vec::with_capacity(e.args.len());
                for arg in &e.args {
                    if matches!(arg, Expr::Starred(_)) {
                        return Err(ExecError::not_supported("starred call arguments"));
                    }
                    args.push(self.eval_expr(arg, scope)?);
                }
                let mut kwargs = Vec::with_capacity(e.keywords.len());
                for kw in &e.keywords {
                    let Some(name) = &kw.arg else {
                        return Err(ExecError::not_supported("** call arguments"));
                    };
                    kwargs.push((name.as_str().to_owned(), self.eval_expr(&kw.value, scope)?));
                }
                let line = self.line(e.range);
                self.call_value(callee, args, kwargs, line)
            }
            Expr::Lambda(e) => {
                let params = self.build_params(&e.args, scope)?;
                Ok(Value::Func(Rc::new(UserFn {
                    name: "<lambda>".into(),
                    params,
                    body: FnBody::Expr(Rc::new(e.body.as_ref().clone())),
                    closure: Rc::clone(scope),
                })))
            }
            Expr::ListComp(e) => {
                let items = self.collect_comp(&e.generators, &e.elt, scope)?;
                Ok(Value::list(items))
            }
            Expr::GeneratorExp(e) => {
                // The dialect is eager: generator expressions materialise.
                let items = self.collect_comp(&e.generators, &e.elt, scope)?;
                Ok(Value::list(items))
            }
            Expr::SetComp(e) => {
                let items = self.collect_comp(&e.generators, &e.elt, scope)?;
                let mut out: Vec<Value> = Vec::new();
                for item in items {
                    if !out.iter().any(|x| x.py_eq(&item)) {
                        out.push(item);
                    }
                }
                Ok(Value::Set(Rc::new(RefCell::new(out))))
            }
            Expr::DictComp(e) => {
                let comp_scope = Scope::child(scope);
                let mut dict = Dict::default();
                let mut sink = |interp: &mut Self, sc: &Rc<Scope>| {
                    let k = interp.eval_expr(&e.key, sc)?;
                    let v = interp.eval_expr(&e.value, sc)?;
                    dict.insert(k, v);
                    Ok(())
                };
                self.run_generators(&e.generators, 0, &comp_scope, &mut sink)?;
                Ok(Value::Dict(Rc::new(RefCell::new(dict))))
            }
            Expr::JoinedStr(e) => {
                let mut out = String::new();
                for part in &e.values {
                    match part {
                        Expr::FormattedValue(fv) => {
                            out.push_str(&self.eval_expr(&fv.value, scope)?.py_str());
                        }
                        other => out.push_str(&self.eval_expr(other, scope)?.py_str()),
                    }
                }
                Ok(Value::str(out))
            }
            Expr::FormattedValue(e) => {
                Ok(Value::str(self.eval_expr(&e.value, scope)?.py_str()))
            }
            Expr::NamedExpr(e) => {
                let value = self.eval_expr(&e.value, scope)?;
                let Expr::Name(target) = e.target.as_ref() else {
                    return Err(ExecError::type_error("invalid assignment target"));
                };
                scope.set(target.id.as_str(), value.clone());
                Ok(value)
            }
            Expr::Slice(_) => Err(ExecError::not_supported("slice expressions here")),
            Expr::Starred(_) => Err(ExecError::not_supported("starred expressions")),
            _ => Err(ExecError::not_supported("this expression")),
        }
    }

    fn eval_elements(
        &mut self,
        elts: &[Expr],
        scope: &Rc<Scope>,
    ) -> Result<Vec<Value>, ExecError> {
        let mut out = Vec::with_capacity(elts.len());
        for elt in elts {
            if matches!(elt, Expr::Starred(_)) {
                return Err(ExecError::not_supported("starred expressions"));
            }
            out.push(self.eval_expr(elt, scope)?);
        }
        Ok(out)
    }

    fn collect_comp(
        &mut self,
        generators: &[ast::Comprehension],
        elt: &Expr,
        scope: &Rc<Scope>,
    ) -> Result<Vec<Value>, ExecError> {
        let comp_scope = Scope::child(scope);
        let mut out = Vec::new();
        let mut sink = |interp: &mut Self, sc: &Rc<Scope>| {
            out.push(interp.eval_expr(elt, sc)?);
            Ok(())
        };
        self.run_generators(generators, 0, &comp_scope, &mut sink)?;
        Ok(out)
    }

    fn run_generators(
        &mut self,
        generators: &[ast::Comprehension],
        gi: usize,
        scope: &Rc<Scope>,
        sink: &mut dyn FnMut(&mut Self, &Rc<Scope>) -> Result<(), ExecError>,
    ) -> Result<(), ExecError> {
        if gi == generators.len() {
            return sink(self, scope);
        }
        let g = &generators[gi];
        let iterable = self.eval_expr(&g.iter, scope)?;
        let mut iter = self.value_iter(&iterable)?;
        while let Some(item) = iter.next() {
            self.step()?;
            self.assign_target(&g.target, item, scope)?;
            let mut keep = true;
            for cond in &g.ifs {
                if !self.eval_expr(cond, scope)?.truthy() {
                    keep = false;
                    break;
                }
            }
            if keep {
                self.run_generators(generators, gi + 1, scope, sink)?;
            }
        }
        Ok(())
    }

    fn lookup(&self, name: &str, scope: &Rc<Scope>) -> Option<Value> {
        scope.get(name).or_else(|| self.globals.get(name).cloned())
    }

    fn value_iter(&self, value: &Value) -> Result<ValueIter, ExecError> {
        match value {
            Value::Range(r) => Ok(ValueIter::Range {
                range: **r,
                i: 0,
                len: r.len(),
            }),
            other => Ok(ValueIter::Vec(iter_items(other)?.into_iter())),
        }
    }

    fn assign_target(
        &mut self,
        target: &Expr,
        value: Value,
        scope: &Rc<Scope>,
    ) -> Result<(), ExecError> {
        match target {
            Expr::Name(e) => {
                scope.set(e.id.as_str(), value);
                Ok(())
            }
            Expr::Tuple(e) => self.unpack(&e.elts, value, scope),
            Expr::List(e) => self.unpack(&e.elts, value, scope),
            Expr::Subscript(e) => {
                let obj = self.eval_expr(&e.value, scope)?;
                if matches!(e.slice.as_ref(), Expr::Slice(_)) {
                    return Err(ExecError::not_supported("slice assignment"));
                }
                let idx = self.eval_expr(&e.slice, scope)?;
                self.index_set(&obj, idx, value)
            }
            Expr::Attribute(_) => Err(ExecError::type_error(
                "attribute assignment is not allowed",
            )),
            _ => Err(ExecError::type_error("invalid assignment target")),
        }
    }

    fn unpack(
        &mut self,
        targets: &[Expr],
        value: Value,
        scope: &Rc<Scope>,
    ) -> Result<(), ExecError> {
        let items = iter_items(&value)?;
        if items.len() != targets.len() {
            return Err(ExecError::value_error(format!(
                "expected {} values to unpack, got {}",
                targets.len(),
                items.len()
            )));
        }
        for (target, item) in targets.iter().zip(items) {
            self.assign_target(target, item, scope)?;
        }
        Ok(())
    }

    fn call_value(
        &mut self,
        callee: Value,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        line: u32,
    ) -> Result<Value, ExecError> {
        self.step()?;
        match callee {
            Value::Builtin(b) => call_builtin(b, &args, &kwargs, &self.ctx),
            Value::Func(f) => self.call_user_fn(&f, args, kwargs, line),
            Value::Capability(c) => c.call(&args, &kwargs).map_err(|e| match e {
                CapCallError::Budget(b) => ExecError::budget(b),
                CapCallError::App(m) => ExecError::capability(m),
            }),
            Value::RootFn(f) => {
                if !kwargs.is_empty() {
                    return Err(ExecError::type_error(format!(
                        "{}() takes no keyword arguments",
                        f.name()
                    )));
                }
                let limits = SerializeLimits::default();
                let json_args: Vec<Json> =
                    args.iter().map(|v| v.to_safe_json(&limits)).collect();
                f.call(&json_args).map_err(ExecError::capability)
            }
            other => Err(ExecError::type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }

    fn call_user_fn(
        &mut self,
        func: &Rc<UserFn>,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        line: u32,
    ) -> Result<Value, ExecError> {
        if self.depth + 1 > self.max_depth {
            return Err(ExecError::recursion());
        }
        if args.len() > func.params.len() {
            return Err(ExecError::type_error(format!(
                "{}() takes {} positional arguments but {} were given",
                func.name,
                func.params.len(),
                args.len()
            )));
        }

        let call_scope = Scope::child(&func.closure);
        for (param, value) in func.params.iter().zip(args.iter()) {
            call_scope.set(&param.name, value.clone());
        }
        let bound = args.len();
        for (name, value) in &kwargs {
            let known = func.params.iter().position(|p| &p.name == name);
            match known {
                Some(i) if i < bound => {
                    return Err(ExecError::type_error(format!(
                        "{}() got multiple values for argument '{name}'",
                        func.name
                    )));
                }
                Some(_) => call_scope.set(name.as_str(), value.clone()),
                None => {
                    return Err(ExecError::type_error(format!(
                        "{}() got an unexpected keyword argument '{name}'",
                        func.name
                    )));
                }
            }
        }
        for param in &func.params {
            if call_scope.vars.borrow().contains_key(&param.name) {
                continue;
            }
            match &param.default {
                Some(d) => call_scope.set(&param.name, d.clone()),
                None => {
                    return Err(ExecError::type_error(format!(
                        "{}() missing required argument: '{}'",
                        func.name, param.name
                    )));
                }
            }
        }

        self.depth += 1;
        let result = match &func.body {
            FnBody::Block(stmts) => match self.exec_block(stmts, &call_scope) {
                Ok(Flow::Return(v)) => Ok(v),
                Ok(_) => Ok(Value::None),
                Err(e) => Err(e),
            },
            FnBody::Expr(expr) => self.eval_expr(expr, &call_scope),
        };
        self.depth -= 1;

        result.map_err(|mut e| {
            e.frames.insert(
                0,
                format!("  File \"<sandbox>\", line {line}, in {}", func.name),
            );
            e
        })
    }

    fn binop(&mut self, op: &ast::Operator, a: Value, b: Value) -> Result<Value, ExecError> {
        use ast::Operator as Op;
        let err = || {
            ExecError::type_error(format!(
                "unsupported operand type(s): '{}' and '{}'",
                a.type_name(),
                b.type_name()
            ))
        };
        match op {
            Op::Add => match (&a, &b) {
                (Value::Int(x), Value::Int(y)) => {
                    x.checked_add(*y).map(Value::Int).ok_or_else(ExecError::overflow)
                }
                (Value::Float(x), Value::Float(y)) => Ok(Value::Float(x + y)),
                (Value::Int(x), Value::Float(y)) => Ok(Value::Float(*x as f64 + y)),
                (Value::Float(x), Value::Int(y)) => Ok(Value::Float(x + *y as f64)),
                (Value::Str(x), Value::Str(y)) => Ok(Value::str(format!("{x}{y}"))),
                (Value::List(x), Value::List(y)) => {
                    let mut out = x.borrow().clone();
                    out.extend(y.borrow().iter().cloned());
                    Ok(Value::list(out))
                }
                (Value::Tuple(x), Value::Tuple(y)) => {
                    let mut out = x.as_ref().clone();
                    out.extend(y.iter().cloned());
                    Ok(Value::tuple(out))
                }
                _ => Err(err()),
            },
            Op::Sub => match (&a, &b) {
                (Value::Int(x), Value::Int(y)) => {
                    x.checked_sub(*y).map(Value::Int).ok_or_else(ExecError::overflow)
                }
                (Value::Float(x), Value::Float(y)) => Ok(Value::Float(x - y)),
                (Value::Int(x), Value::Float(y)) => Ok(Value::Float(*x as f64 - y)),
                (Value::Float(x), Value::Int(y)) => Ok(Value::Float(x - *y as f64)),
                _ => Err(err()),
            },
            Op::Mult => match (&a, &b) {
                (Value::Int(x), Value::Int(y)) => {
                    x.checked_mul(*y).map(Value::Int).ok_or_else(ExecError::overflow)
                }
                (Value::Float(x), Value::Float(y)) => Ok(Value::Float(x * y)),
                (Value::Int(x), Value::Float(y)) => Ok(Value::Float(*x as f64 * y)),
                (Value::Float(x), Value::Int(y)) => Ok(Value::Float(x * *y as f64)),
                (Value::Str(s), Value::Int(n)) | (Value::Int(n), Value::Str(s)) => {
                    Ok(Value::str(s.repeat((*n).max(0) as usize)))
                }
                (Value::List(l), Value::Int(n)) | (Value::Int(n), Value::List(l)) => {
                    let src = l.borrow();
                    let mut out = Vec::new();
                    for _ in 0..(*n).max(0) {
                        out.extend(src.iter().cloned());
                    }
                    Ok(Value::list(out))
                }
                (Value::Tuple(t), Value::Int(n)) | (Value::Int(n), Value::Tuple(t)) => {
                    let mut out = Vec::new();
                    for _ in 0..(*n).max(0) {
                        out.extend(t.iter().cloned());
                    }
                    Ok(Value::tuple(out))
                }
                _ => Err(err()),
            },
            Op::Div => {
                let (x, y) = to_floats(&a, &b).ok_or_else(err)?;
                if y == 0.0 {
                    return Err(ExecError::zero_division());
                }
                Ok(Value::Float(x / y))
            }
            Op::FloorDiv => match (&a, &b) {
                (Value::Int(x), Value::Int(y)) => {
                    if *y == 0 {
                        return Err(ExecError::zero_division());
                    }
                    Ok(Value::Int(floor_div(*x, *y)))
                }
                _ => {
                    let (x, y) = to_floats(&a, &b).ok_or_else(err)?;
                    if y == 0.0 {
                        return Err(ExecError::zero_division());
                    }
                    Ok(Value::Float((x / y).floor()))
                }
            },
            Op::Mod => match (&a, &b) {
                (Value::Int(x), Value::Int(y)) => {
                    if *y == 0 {
                        return Err(ExecError::zero_division());
                    }
                    Ok(Value::Int(floor_mod(*x, *y)))
                }
                _ => {
                    let (x, y) = to_floats(&a, &b).ok_or_else(err)?;
                    if y == 0.0 {
                        return Err(ExecError::zero_division());
                    }
                    Ok(Value::Float(x - y * (x / y).floor()))
                }
            },
            Op::Pow => match (&a, &b) {
                (Value::Int(x), Value::Int(y)) if *y >= 0 => {
                    let exp = u32::try_from(*y).map_err(|_| ExecError::overflow())?;
                    x.checked_pow(exp).map(Value::Int).ok_or_else(ExecError::overflow)
                }
                _ => {
                    let (x, y) = to_floats(&a, &b).ok_or_else(err)?;
                    Ok(Value::Float(x.powf(y)))
                }
            },
            Op::BitOr => int_bitop(&a, &b, err, |x, y| x | y),
            Op::BitAnd => int_bitop(&a, &b, err, |x, y| x & y),
            Op::BitXor => int_bitop(&a, &b, err, |x, y| x ^ y),
            Op::LShift => match (&a, &b) {
                (Value::Int(x), Value::Int(y)) => {
                    if *y < 0 {
                        return Err(ExecError::value_error("negative shift count"));
                    }
                    x.checked_shl(u32::try_from(*y).map_err(|_| ExecError::overflow())?)
                        .map(Value::Int)
                        .ok_or_else(ExecError::overflow)
                }
                _ => Err(err()),
            },
            Op::RShift => match (&a, &b) {
                (Value::Int(x), Value::Int(y)) => {
                    if *y < 0 {
                        return Err(ExecError::value_error("negative shift count"));
                    }
                    x.checked_shr(u32::try_from(*y).map_err(|_| ExecError::overflow())?)
                        .map(Value::Int)
                        .ok_or_else(ExecError::overflow)
                }
                _ => Err(err()),
            },
            Op::MatMult => Err(ExecError::not_supported("the @ operator")),
        }
    }

    fn compare(&mut self, op: &ast::CmpOp, a: &Value, b: &Value) -> Result<bool, ExecError> {
        use ast::CmpOp;
        let ordering_err = |sym: &str| {
            ExecError::type_error(format!(
                "'{sym}' not supported between instances of '{}' and '{}'",
                a.type_name(),
                b.type_name()
            ))
        };
        match op {
            CmpOp::Eq => Ok(a.py_eq(b)),
            CmpOp::NotEq => Ok(!a.py_eq(b)),
            CmpOp::Lt => a
                .py_cmp(b)
                .map(|o| o == std::cmp::Ordering::Less)
                .ok_or_else(|| ordering_err("<")),
            CmpOp::LtE => a
                .py_cmp(b)
                .map(|o| o != std::cmp::Ordering::Greater)
                .ok_or_else(|| ordering_err("<=")),
            CmpOp::Gt => a
                .py_cmp(b)
                .map(|o| o == std::cmp::Ordering::Greater)
                .ok_or_else(|| ordering_err(">")),
            CmpOp::GtE => a
                .py_cmp(b)
                .map(|o| o != std::cmp::Ordering::Less)
                .ok_or_else(|| ordering_err(">=")),
            CmpOp::In => self.contains(b, a),
            CmpOp::NotIn => self.contains(b, a).map(|c| !c),
            CmpOp::Is => Ok(identical(a, b)),
            CmpOp::IsNot => Ok(!identical(a, b)),
        }
    }

    fn contains(&mut self, container: &Value, item: &Value) -> Result<bool, ExecError> {
        match container {
            Value::List(l) => Ok(l.borrow().iter().any(|x| x.py_eq(item))),
            Value::Tuple(t) => Ok(t.iter().any(|x| x.py_eq(item))),
            Value::Set(s) => Ok(s.borrow().iter().any(|x| x.py_eq(item))),
            Value::Dict(d) => Ok(d.borrow().contains_key(item)),
            Value::Str(s) => match item {
                Value::Str(needle) => Ok(s.contains(needle.as_ref())),
                other => Err(ExecError::type_error(format!(
                    "'in <string>' requires string as left operand, not '{}'",
                    other.type_name()
                ))),
            },
            Value::Range(r) => match item {
                Value::Int(i) => Ok(r.iter().any(|x| x == *i)),
                _ => Ok(false),
            },
            other => Err(ExecError::type_error(format!(
                "argument of type '{}' is not iterable",
                other.type_name()
            ))),
        }
    }

    fn index_get(&mut self, obj: &Value, idx: &Value) -> Result<Value, ExecError> {
        match obj {
            Value::List(l) => {
                let items = l.borrow();
                let i = normalize_index(idx, items.len())?;
                items.get(i).cloned().ok_or_else(ExecError::index_error)
            }
            Value::Tuple(t) => {
                let i = normalize_index(idx, t.len())?;
                t.get(i).cloned().ok_or_else(ExecError::index_error)
            }
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                let i = normalize_index(idx, chars.len())?;
                chars
                    .get(i)
                    .map(|c| Value::str(c.to_string()))
                    .ok_or_else(ExecError::index_error)
            }
            Value::Dict(d) => d
                .borrow()
                .get(idx)
                .ok_or_else(|| ExecError::key_error(&idx.py_repr())),
            other => Err(ExecError::type_error(format!(
                "'{}' object is not subscriptable",
                other.type_name()
            ))),
        }
    }

    fn index_set(&mut self, obj: &Value, idx: Value, value: Value) -> Result<(), ExecError> {
        match obj {
            Value::List(l) => {
                let mut items = l.borrow_mut();
                let len = items.len();
                let i = normalize_index(&idx, len)?;
                match items.get_mut(i) {
                    Some(slot) => {
                        *slot = value;
                        Ok(())
                    }
                    None => Err(ExecError::index_error()),
                }
            }
            Value::Dict(d) => {
                let mut dict = d.borrow_mut();
                if dict.frozen {
                    return Err(ExecError::type_error("frozen dict is read-only"));
                }
                dict.insert(idx, value);
                Ok(())
            }
            Value::Tuple(_) => Err(ExecError::type_error(
                "'tuple' object does not support item assignment",
            )),
            other => Err(ExecError::type_error(format!(
                "'{}' object does not support item assignment",
                other.type_name()
            ))),
        }
    }

    fn slice_get(
        &mut self,
        obj: &Value,
        slice: &ast::ExprSlice,
        scope: &Rc<Scope>,
    ) -> Result<Value, ExecError> {
        let eval_bound = |interp: &mut Self, bound: &Option<Box<Expr>>| -> Result<Option<i64>, ExecError> {
            match bound {
                None => Ok(None),
                Some(e) => match interp.eval_expr(e, scope)? {
                    Value::Int(i) => Ok(Some(i)),
                    Value::None => Ok(None),
                    other => Err(ExecError::type_error(format!(
                        "slice indices must be integers, not '{}'",
                        other.type_name()
                    ))),
                },
            }
        };
        let lower = eval_bound(self, &slice.lower)?;
        let upper = eval_bound(self, &slice.upper)?;
        let step = eval_bound(self, &slice.step)?.unwrap_or(1);
        if step == 0 {
            return Err(ExecError::value_error("slice step cannot be zero"));
        }

        match obj {
            Value::List(l) => Ok(Value::list(slice_items(&l.borrow(), lower, upper, step))),
            Value::Tuple(t) => Ok(Value::tuple(slice_items(t, lower, upper, step))),
            Value::Str(s) => {
                let chars: Vec<Value> = s.chars().map(|c| Value::str(c.to_string())).collect();
                let picked = slice_items(&chars, lower, upper, step);
                Ok(Value::str(
                    picked.iter().map(Value::py_str).collect::<String>(),
                ))
            }
            other => Err(ExecError::type_error(format!(
                "'{}' object is not subscriptable",
                other.type_name()
            ))),
        }
    }
}

fn handler_matches(type_: Option<&Expr>, kind: &str) -> bool {
    match type_ {
        None => true,
        Some(Expr::Name(name)) => {
            let n = name.id.as_str();
            n == kind || n == "Exception"
        }
        // `except (A, B):` matches any member of the tuple.
        Some(Expr::Tuple(t)) => t.elts.iter().any(|e| handler_matches(Some(e), kind)),
        Some(_) => false,
    }
}

fn identical(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::List(x), Value::List(y)) => Rc::ptr_eq(x, y),
        (Value::Tuple(x), Value::Tuple(y)) => Rc::ptr_eq(x, y),
        (Value::Dict(x), Value::Dict(y)) => Rc::ptr_eq(x, y),
        (Value::Set(x), Value::Set(y)) => Rc::ptr_eq(x, y),
        (Value::Func(x), Value::Func(y)) => Rc::ptr_eq(x, y),
        _ => a.py_eq(b),
    }
}

fn unary_type_error(op: &str, value: &Value) -> ExecError {
    ExecError::type_error(format!(
        "bad operand type for unary {op}: '{}'",
        value.type_name()
    ))
}

fn to_floats(a: &Value, b: &Value) -> Option<(f64, f64)> {
    let f = |v: &Value| match v {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        Value::Bool(b) => Some(f64::from(*b)),
        _ => None,
    };
    Some((f(a)?, f(b)?))
}

fn int_bitop(
    a: &Value,
    b: &Value,
    err: impl Fn() -> ExecError,
    f: impl Fn(i64, i64) -> i64,
) -> Result<Value, ExecError> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(Value::Int(f(*x, *y))),
        _ => Err(err()),
    }
}

/// Floor division rounding toward negative infinity.
fn floor_div(x: i64, y: i64) -> i64 {
    let q = x / y;
    if (x % y != 0) && ((x < 0) != (y < 0)) {
        q - 1
    } else {
        q
    }
}

/// Modulo whose sign follows the divisor.
fn floor_mod(x: i64, y: i64) -> i64 {
    let r = x % y;
    if r != 0 && ((r < 0) != (y < 0)) {
        r + y
    } else {
        r
    }
}

fn normalize_index(idx: &Value, len: usize) -> Result<usize, ExecError> {
    let i = match idx {
        Value::Int(i) => *i,
        Value::Bool(b) => i64::from(*b),
        other => {
            return Err(ExecError::type_error(format!(
                "indices must be integers, not '{}'",
                other.type_name()
            )));
        }
    };
    let adjusted = if i < 0 { i + len as i64 } else { i };
    usize::try_from(adjusted).map_err(|_| ExecError::index_error())
}

fn slice_items(items: &[Value], lower: Option<i64>, upper: Option<i64>, step: i64) -> Vec<Value> {
    let len = items.len() as i64;
    let clamp = |v: i64| -> i64 {
        let v = if v < 0 { v + len } else { v };
        v.clamp(0, len)
    };
    if step > 0 {
        let start = clamp(lower.unwrap_or(0));
        let stop = clamp(upper.unwrap_or(len));
        let mut out = Vec::new();
        let mut i = start;
        while i < stop {
            out.push(items[i as usize].clone());
            i += step;
        }
        out
    } else {
        let start = match lower {
            Some(v) => {
                let v = if v < 0 { v + len } else { v };
                v.min(len - 1)
            }
            None => len - 1,
        };
        let stop = match upper {
            Some(v) => {
                let v = if v < 0 { v + len } else { v };
                v.max(-1)
            }
            None => -1,
        };
        let mut out = Vec::new();
        let mut i = start;
        while i > stop && i >= 0 {
            out.push(items[i as usize].clone());
            i += step;
        }
        out
    }
}

fn constant_value(constant: &ast::Constant) -> Result<Value, ExecError> {
    match constant {
        ast::Constant::None => Ok(Value::None),
        ast::Constant::Bool(b) => Ok(Value::Bool(*b)),
        ast::Constant::Int(i) => i
            .to_string()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| ExecError::overflow()),
        ast::Constant::Float(f) => Ok(Value::Float(*f)),
        ast::Constant::Str(s) => Ok(Value::str(s)),
        ast::Constant::Bytes(b) => Ok(Value::str(String::from_utf8_lossy(b))),
        ast::Constant::Tuple(items) => {
            let converted: Result<Vec<Value>, ExecError> =
                items.iter().map(constant_value).collect();
            Ok(Value::tuple(converted?))
        }
        _ => Err(ExecError::not_supported("this literal")),
    }
}
