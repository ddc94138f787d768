//! Static policy checker.
//!
//! Walks the parsed program exactly once and rejects on the first
//! violation, carrying 1-based source coordinates. The message strings are
//! stable: the locale layer canonicalises them by exact/pattern match.

use std::collections::BTreeSet;

use cordon_core::policy::Policy;
use rustpython_parser::ast::{self, Expr, Ranged, Stmt};
use rustpython_parser::text_size::TextRange;

use crate::parse::LineIndex;

/// First policy violation found in traversal order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub message: String,
    pub lineno: u32,
    pub col: u32,
}

pub struct PolicyChecker<'a> {
    policy: &'a Policy,
    index: &'a LineIndex,
    node_count: u64,
    loop_depth: u32,
    comp_depth: u32,
    iter_names: BTreeSet<String>,
}

impl<'a> PolicyChecker<'a> {
    pub fn new(policy: &'a Policy, index: &'a LineIndex, known_iter_names: BTreeSet<String>) -> Self {
        Self {
            policy,
            index,
            node_count: 0,
            loop_depth: 0,
            comp_depth: 0,
            iter_names: known_iter_names,
        }
    }

    /// Check a whole program; returns the traversal node count on success.
    pub fn check(mut self, program: &[Stmt]) -> Result<u64, Violation> {
        for stmt in program {
            self.visit_stmt(stmt)?;
        }
        Ok(self.node_count)
    }

    fn deny(&self, message: impl Into<String>, range: TextRange) -> Violation {
        let (lineno, col) = self.index.location(u32::from(range.start()) as usize);
        Violation {
            message: message.into(),
            lineno,
            col,
        }
    }

    fn count_node(&mut self, range: TextRange) -> Result<(), Violation> {
        self.node_count += 1;
        if self.node_count > self.policy.max_ast_nodes {
            return Err(self.deny("AST node limit exceeded", range));
        }
        Ok(())
    }

    fn visit_stmt(&mut self, stmt: &Stmt) -> Result<(), Violation> {
        match stmt {
            Stmt::Import(s) => return Err(self.deny("import is not allowed", s.range)),
            Stmt::ImportFrom(s) => return Err(self.deny("import is not allowed", s.range)),
            Stmt::Global(s) => return Err(self.deny("global is not allowed", s.range)),
            Stmt::Nonlocal(s) => return Err(self.deny("nonlocal is not allowed", s.range)),
            Stmt::Delete(s) => return Err(self.deny("del is not allowed", s.range)),
            Stmt::Raise(s) => return Err(self.deny("raise is not allowed", s.range)),
            Stmt::AsyncFunctionDef(s) => return Err(self.deny("async is not allowed", s.range)),
            Stmt::AsyncFor(s) => return Err(self.deny("async is not allowed", s.range)),
            Stmt::AsyncWith(s) => return Err(self.deny("async is not allowed", s.range)),

            Stmt::ClassDef(s) => {
                if !self.policy.allow_class {
                    return Err(self.deny("class is not allowed", s.range));
                }
                self.count_node(s.range)?;
                for base in &s.bases {
                    self.visit_expr(base)?;
                }
                for kw in &s.keywords {
                    self.visit_expr(&kw.value)?;
                }
                for stmt in &s.body {
                    self.visit_stmt(stmt)?;
                }
            }
            Stmt::FunctionDef(s) => {
                if !self.policy.allow_def {
                    return Err(self.deny("def is not allowed", s.range));
                }
                self.count_node(s.range)?;
                self.visit_arguments(&s.args)?;
                for stmt in &s.body {
                    self.visit_stmt(stmt)?;
                }
            }
            Stmt::Try(s) => {
                if !self.policy.allow_try {
                    return Err(self.deny("try/except is not allowed", s.range));
                }
                self.count_node(s.range)?;
                for stmt in &s.body {
                    self.visit_stmt(stmt)?;
                }
                for handler in &s.handlers {
                    let ast::ExceptHandler::ExceptHandler(h) = handler;
                    if let Some(t) = &h.type_ {
                        self.visit_expr(t)?;
                    }
                    for stmt in &h.body {
                        self.visit_stmt(stmt)?;
                    }
                }
                for stmt in s.orelse.iter().chain(&s.finalbody) {
                    self.visit_stmt(stmt)?;
                }
            }
            Stmt::With(s) => {
                if !self.policy.allow_with {
                    return Err(self.deny("with is not allowed", s.range));
                }
                self.count_node(s.range)?;
                for item in &s.items {
                    self.visit_expr(&item.context_expr)?;
                    if let Some(vars) = &item.optional_vars {
                        self.visit_expr(vars)?;
                    }
                }
                for stmt in &s.body {
                    self.visit_stmt(stmt)?;
                }
            }
            Stmt::For(s) => {
                if !self.policy.allow_loops {
                    return Err(self.deny("loops are not allowed", s.range));
                }
                if self.policy.restrict_loop_iterables && !self.is_allowed_iter(&s.iter) {
                    return Err(self.deny("loop iterable is not allowed", s.range));
                }
                self.loop_depth += 1;
                if self.loop_depth > self.policy.max_loop_nesting {
                    return Err(self.deny("loop nesting too deep", s.range));
                }
                self.count_node(s.range)?;
                self.visit_expr(&s.target)?;
                self.visit_expr(&s.iter)?;
                for stmt in s.body.iter().chain(&s.orelse) {
                    self.visit_stmt(stmt)?;
                }
                self.loop_depth -= 1;
            }
            Stmt::While(s) => {
                if !self.policy.allow_loops {
                    return Err(self.deny("loops are not allowed", s.range));
                }
                self.loop_depth += 1;
                if self.loop_depth > self.policy.max_loop_nesting {
                    return Err(self.deny("loop nesting too deep", s.range));
                }
                self.count_node(s.range)?;
                self.visit_expr(&s.test)?;
                for stmt in s.body.iter().chain(&s.orelse) {
                    self.visit_stmt(stmt)?;
                }
                self.loop_depth -= 1;
            }
            Stmt::Assign(s) => {
                // Track names bound to permitted iterable expressions so
                // later loops may iterate over them.
                if s.targets.len() == 1
                    && let Expr::Name(target) = &s.targets[0]
                {
                    if self.is_allowed_iter(&s.value) {
                        self.iter_names.insert(target.id.as_str().to_owned());
                    } else {
                        self.iter_names.remove(target.id.as_str());
                    }
                }
                self.count_node(s.range)?;
                for target in &s.targets {
                    self.visit_expr(target)?;
                }
                self.visit_expr(&s.value)?;
            }
            Stmt::AugAssign(s) => {
                self.count_node(s.range)?;
                self.visit_expr(&s.target)?;
                self.visit_expr(&s.value)?;
            }
            Stmt::AnnAssign(s) => {
                self.count_node(s.range)?;
                self.visit_expr(&s.target)?;
                self.visit_expr(&s.annotation)?;
                if let Some(value) = &s.value {
                    self.visit_expr(value)?;
                }
            }
            Stmt::If(s) => {
                self.count_node(s.range)?;
                self.visit_expr(&s.test)?;
                for stmt in s.body.iter().chain(&s.orelse) {
                    self.visit_stmt(stmt)?;
                }
            }
            Stmt::Return(s) => {
                self.count_node(s.range)?;
                if let Some(value) = &s.value {
                    self.visit_expr(value)?;
                }
            }
            Stmt::Assert(s) => {
                self.count_node(s.range)?;
                self.visit_expr(&s.test)?;
                if let Some(msg) = &s.msg {
                    self.visit_expr(msg)?;
                }
            }
            Stmt::Expr(s) => {
                self.count_node(s.range)?;
                self.visit_expr(&s.value)?;
            }
            Stmt::Pass(s) => self.count_node(s.range)?,
            Stmt::Break(s) => self.count_node(s.range)?,
            Stmt::Continue(s) => self.count_node(s.range)?,
            other => {
                // Statement forms with no dedicated rule (e.g. match) are
                // counted and left for the evaluator to accept or reject.
                self.count_node(other.range())?;
            }
        }
        Ok(())
    }

    fn visit_arguments(&mut self, args: &ast::Arguments) -> Result<(), Violation> {
        for arg in args.posonlyargs.iter().chain(&args.args).chain(&args.kwonlyargs) {
            if let Some(default) = &arg.default {
                self.visit_expr(default)?;
            }
        }
        Ok(())
    }

    fn visit_expr(&mut self, expr: &Expr) -> Result<(), Violation> {
        match expr {
            Expr::Yield(e) => return Err(self.deny("yield is not allowed", e.range)),
            Expr::YieldFrom(e) => return Err(self.deny("yield is not allowed", e.range)),
            Expr::Await(e) => return Err(self.deny("await is not allowed", e.range)),

            Expr::Lambda(e) => {
                if !self.policy.allow_lambda {
                    return Err(self.deny("lambda is not allowed", e.range));
                }
                self.count_node(e.range)?;
                self.visit_arguments(&e.args)?;
                self.visit_expr(&e.body)?;
            }
            Expr::Subscript(e) => {
                if !self.policy.allow_subscript {
                    return Err(self.deny("subscript is not allowed", e.range));
                }
                self.count_node(e.range)?;
                self.visit_expr(&e.value)?;
                self.visit_expr(&e.slice)?;
            }
            Expr::Name(e) => {
                let id = e.id.as_str();
                if id.starts_with("__")
                    && id.ends_with("__")
                    && !self.policy.allow_dunder_names.contains(id)
                {
                    return Err(self.deny("dunder names are not allowed", e.range));
                }
                self.count_node(e.range)?;
            }
            Expr::Attribute(e) => {
                let attr = e.attr.as_str();
                if attr.starts_with("__") && attr.ends_with("__") {
                    return Err(self.deny("dunder attribute is not allowed", e.range));
                }
                let Expr::Name(base) = e.value.as_ref() else {
                    return Err(
                        self.deny("only root.attr attribute access is allowed", e.range)
                    );
                };
                let root = base.id.as_str();
                let allowed = self
                    .policy
                    .attr_allowlist
                    .get(root)
                    .is_some_and(|set| set.contains(attr));
                if !allowed {
                    return Err(self.deny(
                        format!("attribute '{root}.{attr}' is not allowed"),
                        e.range,
                    ));
                }
                self.count_node(e.range)?;
                self.visit_expr(&e.value)?;
            }
            Expr::Call(e) => {
                match e.func.as_ref() {
                    Expr::Name(func) => {
                        let name = func.id.as_str();
                        if !self.policy.call_name_allowlist.contains(name) {
                            return Err(
                                self.deny(format!("call '{name}' is not allowed"), e.range)
                            );
                        }
                        if (name == "list" || name == "tuple")
                            && let Some(first) = e.args.first()
                            && let Some(size) = self.range_size(first)
                            && size > self.policy.max_const_alloc_elems
                        {
                            return Err(
                                self.deny("suspicious constant allocation", e.range)
                            );
                        }
                    }
                    // root.attr(...) is validated by the attribute rule.
                    Expr::Attribute(_) => {}
                    _ => {
                        return Err(self.deny(
                            "only f(...) or root.attr(...) calls are allowed",
                            e.range,
                        ));
                    }
                }
                self.count_node(e.range)?;
                self.visit_expr(&e.func)?;
                for arg in &e.args {
                    self.visit_expr(arg)?;
                }
                for kw in &e.keywords {
                    self.visit_expr(&kw.value)?;
                }
            }
            Expr::BinOp(e) => {
                if matches!(e.op, ast::Operator::Mult) {
                    let a_len = const_len(&e.left);
                    let b_len = const_len(&e.right);
                    let a_int = self.const_int(&e.left);
                    let b_int = self.const_int(&e.right);
                    let limit = self.policy.max_const_alloc_elems;
                    if let (Some(len), Some(n)) = (a_len, b_int)
                        && len.saturating_mul(n.max(0) as u64) > limit
                    {
                        return Err(self.deny("suspicious constant allocation", e.range));
                    }
                    if let (Some(len), Some(n)) = (b_len, a_int)
                        && len.saturating_mul(n.max(0) as u64) > limit
                    {
                        return Err(self.deny("suspicious constant allocation", e.range));
                    }
                }
                self.count_node(e.range)?;
                self.visit_expr(&e.left)?;
                self.visit_expr(&e.right)?;
            }
            Expr::List(e) => {
                if e.elts.len() as u64 > self.policy.max_literal_elems {
                    return Err(self.deny("literal too large", e.range));
                }
                self.count_node(e.range)?;
                for elt in &e.elts {
                    self.visit_expr(elt)?;
                }
            }
            Expr::Tuple(e) => {
                if e.elts.len() as u64 > self.policy.max_literal_elems {
                    return Err(self.deny("literal too large", e.range));
                }
                self.count_node(e.range)?;
                for elt in &e.elts {
                    self.visit_expr(elt)?;
                }
            }
            Expr::Set(e) => {
                if e.elts.len() as u64 > self.policy.max_literal_elems {
                    return Err(self.deny("literal too large", e.range));
                }
                self.count_node(e.range)?;
                for elt in &e.elts {
                    self.visit_expr(elt)?;
                }
            }
            Expr::Dict(e) => {
                if e.keys.len() as u64 > self.policy.max_literal_elems {
                    return Err(self.deny("literal too large", e.range));
                }
                self.count_node(e.range)?;
                for key in e.keys.iter().flatten() {
                    self.visit_expr(key)?;
                }
                for value in &e.values {
                    self.visit_expr(value)?;
                }
            }
            Expr::ListComp(e) => {
                self.enter_comprehension(e.range, &e.generators)?;
                self.visit_expr(&e.elt)?;
                self.visit_generators(&e.generators)?;
                self.comp_depth -= 1;
            }
            Expr::SetComp(e) => {
                self.enter_comprehension(e.range, &e.generators)?;
                self.visit_expr(&e.elt)?;
                self.visit_generators(&e.generators)?;
                self.comp_depth -= 1;
            }
            Expr::DictComp(e) => {
                self.enter_comprehension(e.range, &e.generators)?;
                self.visit_expr(&e.key)?;
                self.visit_expr(&e.value)?;
                self.visit_generators(&e.generators)?;
                self.comp_depth -= 1;
            }
            Expr::GeneratorExp(e) => {
                self.enter_comprehension(e.range, &e.generators)?;
                self.visit_expr(&e.elt)?;
                self.visit_generators(&e.generators)?;
                self.comp_depth -= 1;
            }
            Expr::BoolOp(e) => {
                self.count_node(e.range)?;
                for value in &e.values {
                    self.visit_expr(value)?;
                }
            }
            Expr::NamedExpr(e) => {
                self.count_node(e.range)?;
                self.visit_expr(&e.target)?;
                self.visit_expr(&e.value)?;
            }
            Expr::UnaryOp(e) => {
                self.count_node(e.range)?;
                self.visit_expr(&e.operand)?;
            }
            Expr::IfExp(e) => {
                self.count_node(e.range)?;
                self.visit_expr(&e.test)?;
                self.visit_expr(&e.body)?;
                self.visit_expr(&e.orelse)?;
            }
            Expr::Compare(e) => {
                self.count_node(e.range)?;
                self.visit_expr(&e.left)?;
                for comparator in &e.comparators {
                    self.visit_expr(comparator)?;
                }
            }
            Expr::FormattedValue(e) => {
                self.count_node(e.range)?;
                self.visit_expr(&e.value)?;
            }
            Expr::JoinedStr(e) => {
                self.count_node(e.range)?;
                for value in &e.values {
                    self.visit_expr(value)?;
                }
            }
            Expr::Starred(e) => {
                self.count_node(e.range)?;
                self.visit_expr(&e.value)?;
            }
            Expr::Slice(e) => {
                self.count_node(e.range)?;
                for part in [&e.lower, &e.upper, &e.step].into_iter().flatten() {
                    self.visit_expr(part)?;
                }
            }
            Expr::Constant(e) => self.count_node(e.range)?,
            other => self.count_node(other.range())?,
        }
        Ok(())
    }

    fn enter_comprehension(
        &mut self,
        range: TextRange,
        generators: &[ast::Comprehension],
    ) -> Result<(), Violation> {
        if !self.policy.allow_comprehension {
            return Err(self.deny("comprehension is not allowed", range));
        }
        self.comp_depth += 1;
        if self.comp_depth > self.policy.max_comp_nesting {
            return Err(self.deny("comprehension nesting too deep", range));
        }
        if self.policy.restrict_loop_iterables {
            for g in generators {
                if !self.is_allowed_iter(&g.iter) {
                    return Err(self.deny("comprehension iterable is not allowed", range));
                }
            }
        }
        self.count_node(range)
    }

    fn visit_generators(&mut self, generators: &[ast::Comprehension]) -> Result<(), Violation> {
        for g in generators {
            self.visit_expr(&g.target)?;
            self.visit_expr(&g.iter)?;
            for cond in &g.ifs {
                self.visit_expr(cond)?;
            }
        }
        Ok(())
    }

    fn is_allowed_iter(&self, expr: &Expr) -> bool {
        match expr {
            Expr::Name(e) if self.policy.allow_loop_iter_names => {
                self.iter_names.contains(e.id.as_str())
            }
            Expr::Call(e) => {
                if let Expr::Name(func) = e.func.as_ref() {
                    self.policy.loop_iter_allowlist.contains(func.id.as_str())
                } else {
                    false
                }
            }
            Expr::List(_) | Expr::Tuple(_) => self.policy.allow_loop_iter_literals,
            _ => false,
        }
    }

    /// Fold an integer-valued constant expression. Supports unary +/-,
    /// binary + - * // and **; a power with |base| >= 2 and exponent > 30
    /// folds to the allocation limit sentinel. Anything unfoldable yields
    /// `None`, which leaves allocation checks silent.
    fn const_int(&self, expr: &Expr) -> Option<i64> {
        match expr {
            Expr::Constant(c) => match &c.value {
                ast::Constant::Int(i) => i.to_string().parse::<i64>().ok(),
                _ => None,
            },
            Expr::UnaryOp(u) => {
                let v = self.const_int(&u.operand)?;
                match u.op {
                    ast::UnaryOp::UAdd => Some(v),
                    ast::UnaryOp::USub => v.checked_neg(),
                    _ => None,
                }
            }
            Expr::BinOp(b) => {
                let x = self.const_int(&b.left)?;
                let y = self.const_int(&b.right)?;
                match b.op {
                    ast::Operator::Add => x.checked_add(y),
                    ast::Operator::Sub => x.checked_sub(y),
                    ast::Operator::Mult => x.checked_mul(y),
                    ast::Operator::FloorDiv if y != 0 => Some(x.div_euclid(y)),
                    ast::Operator::Pow if y >= 0 => {
                        if x.abs() >= 2 && y > 30 {
                            return Some(self.policy.max_const_alloc_elems.saturating_add(1) as i64);
                        }
                        x.checked_pow(u32::try_from(y).ok()?)
                    }
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// Statically-evaluable element count of a `range(...)` call.
    fn range_size(&self, expr: &Expr) -> Option<u64> {
        let Expr::Call(call) = expr else {
            return None;
        };
        let Expr::Name(func) = call.func.as_ref() else {
            return None;
        };
        if func.id.as_str() != "range" {
            return None;
        }
        let args = &call.args;
        match args.len() {
            1 => {
                let stop = self.const_int(&args[0])?;
                Some(stop.max(0) as u64)
            }
            n if n >= 2 => {
                let start = self.const_int(&args[0])?;
                let stop = self.const_int(&args[1])?;
                let step = if n >= 3 { self.const_int(&args[2])? } else { 1 };
                if step == 0 {
                    return None;
                }
                let adjust = if step > 0 { step - 1 } else { step + 1 };
                let span = stop.checked_sub(start)?.checked_add(adjust)?;
                Some((span / step).max(0) as u64)
            }
            _ => None,
        }
    }
}

/// Statically-known length of a literal sequence or string constant.
fn const_len(expr: &Expr) -> Option<u64> {
    match expr {
        Expr::List(e) => Some(e.elts.len() as u64),
        Expr::Tuple(e) => Some(e.elts.len() as u64),
        Expr::Constant(c) => match &c.value {
            ast::Constant::Str(s) => Some(s.chars().count() as u64),
            ast::Constant::Bytes(b) => Some(b.len() as u64),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_program;

    fn check(policy: &Policy, code: &str) -> Result<u64, Violation> {
        let suite = parse_program(code).unwrap();
        let index = LineIndex::new(code);
        PolicyChecker::new(policy, &index, BTreeSet::new()).check(&suite)
    }

    fn check_msg(policy: &Policy, code: &str) -> String {
        check(policy, code).unwrap_err().message
    }

    fn permissive() -> Policy {
        Policy::default_permissive()
    }

    #[test]
    fn rejects_imports() {
        let p = permissive();
        assert_eq!(check_msg(&p, "import os"), "import is not allowed");
        assert_eq!(check_msg(&p, "from os import path"), "import is not allowed");
    }

    #[test]
    fn rejects_banned_statements() {
        let p = permissive();
        assert_eq!(check_msg(&p, "x = 1\ndel x"), "del is not allowed");
        assert_eq!(check_msg(&p, "raise 1"), "raise is not allowed");
        assert_eq!(check_msg(&p, "def f():\n    pass"), "def is not allowed");
        assert_eq!(check_msg(&p, "f = lambda x: x"), "lambda is not allowed");
        assert_eq!(check_msg(&p, "class C:\n    pass"), "class is not allowed");
        assert_eq!(
            check_msg(&p, "try:\n    x = 1\nexcept:\n    pass"),
            "try/except is not allowed"
        );
    }

    #[test]
    fn syntax_switches_enable_constructs() {
        let p = Policy {
            allow_def: true,
            allow_lambda: true,
            ..permissive()
        };
        assert!(check(&p, "def f(x):\n    return x\n").is_ok());
        assert!(check(&p, "f = lambda x: x\n").is_ok());
    }

    #[test]
    fn rejects_dunder_names_outside_allowlist() {
        let p = permissive();
        assert!(check(&p, "__result__ = 1").is_ok());
        assert_eq!(
            check_msg(&p, "x = __class__"),
            "dunder names are not allowed"
        );
    }

    #[test]
    fn rejects_attribute_access_outside_allowlist() {
        let mut p = permissive();
        assert_eq!(
            check_msg(&p, "x = math.sin(1)"),
            "attribute 'math.sin' is not allowed"
        );
        p.attr_allowlist
            .entry("math".into())
            .or_default()
            .insert("sin".into());
        assert!(check(&p, "x = math.sin(1)").is_ok());
        assert_eq!(
            check_msg(&p, "x = math.cos(1)"),
            "attribute 'math.cos' is not allowed"
        );
    }

    #[test]
    fn rejects_chained_attribute_bases() {
        let p = permissive();
        assert_eq!(
            check_msg(&p, "x = a.b.c"),
            "only root.attr attribute access is allowed"
        );
    }

    #[test]
    fn rejects_dunder_attributes() {
        let p = permissive();
        assert_eq!(
            check_msg(&p, "x = a.__dict__"),
            "dunder attribute is not allowed"
        );
    }

    #[test]
    fn rejects_calls_outside_allowlist() {
        let p = permissive();
        assert_eq!(check_msg(&p, "x = frob(1)"), "call 'frob' is not allowed");
        assert!(check(&p, "x = len([1, 2])").is_ok());
    }

    #[test]
    fn rejects_computed_callees() {
        let p = Policy {
            allow_subscript: true,
            ..permissive()
        };
        assert_eq!(
            check_msg(&p, "xs = [1]\nx = xs[0]()"),
            "only f(...) or root.attr(...) calls are allowed"
        );
    }

    #[test]
    fn loop_iterable_gating() {
        let p = permissive();
        assert!(check(&p, "for i in range(3):\n    pass\n").is_ok());
        assert!(check(&p, "for i in [1, 2]:\n    pass\n").is_ok());
        assert_eq!(
            check_msg(&p, "x = 3\nfor i in x:\n    pass\n"),
            "loop iterable is not allowed"
        );
    }

    #[test]
    fn bound_iter_names_are_tracked() {
        let p = permissive();
        assert!(check(&p, "xs = [1, 2]\nfor i in xs:\n    pass\n").is_ok());
        // Rebinding to a non-iterable expression forgets the name.
        assert_eq!(
            check_msg(&p, "xs = [1]\nxs = 3\nfor i in xs:\n    pass\n"),
            "loop iterable is not allowed"
        );
    }

    #[test]
    fn known_input_iter_names_seed_the_tracker() {
        let p = permissive();
        let code = "for i in xs:\n    pass\n";
        let suite = parse_program(code).unwrap();
        let index = LineIndex::new(code);
        let known: BTreeSet<String> = ["xs".to_string()].into();
        assert!(PolicyChecker::new(&p, &index, known).check(&suite).is_ok());
    }

    #[test]
    fn loop_nesting_limit() {
        let p = permissive();
        let code = "\
for a in range(2):
    for b in range(2):
        for c in range(2):
            for d in range(2):
                pass
";
        assert_eq!(check_msg(&p, code), "loop nesting too deep");
    }

    #[test]
    fn comprehension_rules() {
        let p = permissive();
        assert!(check(&p, "xs = [i for i in range(4)]\n").is_ok());
        assert_eq!(
            check_msg(&p, "y = 3\nxs = [i for i in y]\n"),
            "comprehension iterable is not allowed"
        );
        let no_comp = Policy {
            allow_comprehension: false,
            ..permissive()
        };
        assert_eq!(
            check_msg(&no_comp, "xs = [i for i in range(4)]\n"),
            "comprehension is not allowed"
        );
    }

    #[test]
    fn literal_size_limit() {
        let p = Policy {
            max_literal_elems: 3,
            ..permissive()
        };
        assert!(check(&p, "xs = [1, 2, 3]").is_ok());
        assert_eq!(check_msg(&p, "xs = [1, 2, 3, 4]"), "literal too large");
        assert_eq!(check_msg(&p, "xs = (1, 2, 3, 4)"), "literal too large");
        assert_eq!(
            check_msg(&p, "xs = {1: 1, 2: 2, 3: 3, 4: 4}"),
            "literal too large"
        );
    }

    #[test]
    fn suspicious_constant_allocation_via_mult() {
        let p = permissive();
        assert_eq!(
            check_msg(&p, "x = [0] * 2000000"),
            "suspicious constant allocation"
        );
        assert_eq!(
            check_msg(&p, "x = 2000000 * 'ab'"),
            "suspicious constant allocation"
        );
        assert!(check(&p, "x = [0] * 10").is_ok());
    }

    #[test]
    fn suspicious_constant_allocation_via_list_range() {
        let p = permissive();
        assert_eq!(
            check_msg(&p, "x = list(range(2000000))"),
            "suspicious constant allocation"
        );
        assert!(check(&p, "x = list(range(10))").is_ok());
        assert_eq!(
            check_msg(&p, "x = tuple(range(0, 4000000, 2))"),
            "suspicious constant allocation"
        );
    }

    #[test]
    fn constant_folding_handles_powers() {
        let p = permissive();
        // 2 ** 40 folds to the huge sentinel.
        assert_eq!(
            check_msg(&p, "x = [0] * (2 ** 40)"),
            "suspicious constant allocation"
        );
        // Unfoldable sizes stay silent.
        assert!(check(&p, "n = 5\nx = list(range(3))\n").is_ok());
    }

    #[test]
    fn ast_node_limit() {
        let p = Policy {
            max_ast_nodes: 5,
            ..permissive()
        };
        assert_eq!(
            check_msg(&p, "a = 1\nb = 2\nc = 3\nd = 4\n"),
            "AST node limit exceeded"
        );
    }

    #[test]
    fn violation_reports_one_based_location() {
        let p = permissive();
        let v = check(&p, "x = 1\nimport os\n").unwrap_err();
        assert_eq!(v.lineno, 2);
        assert_eq!(v.col, 1);
    }

    #[test]
    fn node_count_is_reported() {
        let p = permissive();
        let n = check(&p, "x = 1\n").unwrap();
        assert!(n >= 2);
    }
}
