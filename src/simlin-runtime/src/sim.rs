// Copyright 2026 The Simlin Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::rc::Rc;

use float_cmp::approx_eq;
use serde::Serialize;

use crate::ast::{self, BinaryOp, UnaryOp};
use crate::common::{Ident, Result};
use crate::model::Model;
use crate::project::{MAIN_MODEL, Project};
use crate::variable::{Table, Variable};
use crate::{datamodel, sim_err};

const TIME_OFF: usize = 0;

#[derive(Clone, Debug, PartialEq)]
pub struct Specs {
    pub start: f64,
    pub stop: f64,
    pub dt: f64,
    pub save_step: f64,
}

impl Specs {
    pub fn from(specs: &datamodel::SimSpecs) -> Self {
        Specs {
            start: specs.start,
            stop: specs.stop,
            dt: specs.dt,
            save_step: specs.save_step(),
        }
    }
}

type BuiltinFn = crate::builtins::BuiltinFn<Expr>;

/// An expression lowered against the flat slab: every variable
/// reference is an absolute offset into a row.
#[derive(PartialEq, Clone, Debug)]
pub enum Expr {
    Const(f64),
    Var(usize), // offset
    App(BuiltinFn),
    EvalModule(Ident),
    Op2(BinaryOp, Box<Expr>, Box<Expr>),
    Op1(UnaryOp, Box<Expr>),
    If(Box<Expr>, Box<Expr>, Box<Expr>),
    AssignCurr(usize, Box<Expr>),
    AssignNext(usize, Box<Expr>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StepPart {
    Initials,
    Flows,
    Stocks,
}

struct Context<'a> {
    instance: &'a Instance,
    ident: &'a str,
    specs: &'a Specs,
}

impl Context<'_> {
    fn get_offset(&self, ident: &str) -> Expr {
        match self.instance.lookup_offset(ident) {
            Some(off) => Expr::Var(off),
            None => {
                tracing::warn!(
                    module = %self.instance.name,
                    variable = self.ident,
                    reference = ident,
                    "unresolved reference, reading as NaN"
                );
                Expr::Const(f64::NAN)
            }
        }
    }

    fn lower(&self, expr: &ast::Expr) -> Result<Expr> {
        let expr = match expr {
            ast::Expr::Const(_, n) => Expr::Const(*n),
            ast::Expr::Var(id) => match id.as_str() {
                "time" => Expr::Var(TIME_OFF),
                "dt" => Expr::Const(self.specs.dt),
                "initial_time" => Expr::Const(self.specs.start),
                "final_time" => Expr::Const(self.specs.stop),
                _ => self.get_offset(id),
            },
            ast::Expr::App(id, orig_args) => {
                let args: Result<Vec<Expr>> = orig_args.iter().map(|e| self.lower(e)).collect();
                let mut args = args?;

                macro_rules! check_arity {
                    ($builtin_fn:tt, 0) => {{
                        if !args.is_empty() {
                            return sim_err!(BadBuiltinArgs, self.ident.to_string());
                        }

                        BuiltinFn::$builtin_fn
                    }};
                    ($builtin_fn:tt, 1) => {{
                        if args.len() != 1 {
                            return sim_err!(BadBuiltinArgs, self.ident.to_string());
                        }

                        let a = args.remove(0);
                        BuiltinFn::$builtin_fn(Box::new(a))
                    }};
                    ($builtin_fn:tt, 2) => {{
                        if args.len() != 2 {
                            return sim_err!(BadBuiltinArgs, self.ident.to_string());
                        }

                        let b = args.remove(1);
                        let a = args.remove(0);
                        BuiltinFn::$builtin_fn(Box::new(a), Box::new(b))
                    }};
                    ($builtin_fn:tt, 2, 3) => {{
                        if args.len() == 2 {
                            let b = args.remove(1);
                            let a = args.remove(0);
                            BuiltinFn::$builtin_fn(Box::new(a), Box::new(b), None)
                        } else if args.len() == 3 {
                            let c = args.remove(2);
                            let b = args.remove(1);
                            let a = args.remove(0);
                            BuiltinFn::$builtin_fn(Box::new(a), Box::new(b), Some(Box::new(c)))
                        } else {
                            return sim_err!(BadBuiltinArgs, self.ident.to_string());
                        }
                    }};
                }

                let builtin = match id.as_str() {
                    "lookup" => {
                        if args.len() != 2 {
                            return sim_err!(BadBuiltinArgs, self.ident.to_string());
                        }
                        if let ast::Expr::Var(ident) = &orig_args[0] {
                            let index = args.remove(1);
                            BuiltinFn::Lookup(ident.clone(), Box::new(index))
                        } else {
                            return sim_err!(BadBuiltinArgs, self.ident.to_string());
                        }
                    }
                    "abs" => check_arity!(Abs, 1),
                    "arccos" => check_arity!(Arccos, 1),
                    "arcsin" => check_arity!(Arcsin, 1),
                    "arctan" => check_arity!(Arctan, 1),
                    "cos" => check_arity!(Cos, 1),
                    "exp" => check_arity!(Exp, 1),
                    "inf" => check_arity!(Inf, 0),
                    "int" => check_arity!(Int, 1),
                    "ln" => check_arity!(Ln, 1),
                    "log10" => check_arity!(Log10, 1),
                    "max" => check_arity!(Max, 2),
                    "min" => check_arity!(Min, 2),
                    "pi" => check_arity!(Pi, 0),
                    "pulse" => check_arity!(Pulse, 2, 3),
                    "safediv" => check_arity!(SafeDiv, 2, 3),
                    "sin" => check_arity!(Sin, 1),
                    "sqrt" => check_arity!(Sqrt, 1),
                    "tan" => check_arity!(Tan, 1),
                    _ => {
                        return sim_err!(UnknownBuiltin, format!("{}: {}", self.ident, id));
                    }
                };
                Expr::App(builtin)
            }
            ast::Expr::Paren(e) => self.lower(e)?,
            ast::Expr::Op1(op, l) => {
                let l = self.lower(l)?;
                match op {
                    UnaryOp::Negative => {
                        Expr::Op2(BinaryOp::Sub, Box::new(Expr::Const(0.0)), Box::new(l))
                    }
                    UnaryOp::Positive => l,
                    UnaryOp::Not => Expr::Op1(UnaryOp::Not, Box::new(l)),
                }
            }
            ast::Expr::Op2(op, l, r) => {
                let l = self.lower(l)?;
                let r = self.lower(r)?;
                Expr::Op2(*op, Box::new(l), Box::new(r))
            }
            ast::Expr::If(cond, t, f) => {
                let cond = self.lower(cond)?;
                let t = self.lower(t)?;
                let f = self.lower(f)?;
                Expr::If(Box::new(cond), Box::new(t), Box::new(f))
            }
        };

        Ok(expr)
    }

    fn fold_flows(&self, flows: &[String]) -> Option<Expr> {
        let mut loads = flows.iter().map(|flow| self.get_offset(flow));

        let first = loads.next()?;
        Some(loads.fold(first, |acc, flow| {
            Expr::Op2(BinaryOp::Add, Box::new(acc), Box::new(flow))
        }))
    }

    fn build_stock_update_expr(&self, stock_off: usize, inflows: &[Ident], outflows: &[Ident]) -> Expr {
        let inflows = self.fold_flows(inflows).unwrap_or(Expr::Const(0.0));
        let outflows = self.fold_flows(outflows).unwrap_or(Expr::Const(0.0));

        let dt_update = Expr::Op2(
            BinaryOp::Mul,
            Box::new(Expr::Op2(
                BinaryOp::Sub,
                Box::new(inflows),
                Box::new(outflows),
            )),
            Box::new(Expr::Const(self.specs.dt)),
        );

        Expr::Op2(
            BinaryOp::Add,
            Box::new(Expr::Var(stock_off)),
            Box::new(dt_update),
        )
    }
}

fn non_negative(expr: Expr) -> Expr {
    Expr::App(BuiltinFn::Max(Box::new(expr), Box::new(Expr::Const(0.0))))
}

// constants only need computing once, in the initials phase.  leaving
// them out of the flows lets a value set right after reset persist
// for the whole run.
fn is_const(expr: &ast::Expr) -> bool {
    match expr {
        ast::Expr::Const(_, _) => true,
        ast::Expr::Paren(e) | ast::Expr::Op1(_, e) => is_const(e),
        _ => false,
    }
}

fn lower_var(ctx: &Context, var: &Variable, part: StepPart) -> Result<Vec<Expr>> {
    let instance = ctx.instance;
    let ident = var.ident();

    // if this variable is overridden by a module input, our expression is easy
    if let Some(src) = instance.refs.get(ident) {
        if part == StepPart::Stocks {
            return Ok(vec![]);
        }
        let off = instance.local_offset(ident)?;
        let rhs = match src {
            Some(src_off) => Expr::Var(*src_off),
            None => Expr::Const(f64::NAN),
        };
        return Ok(vec![Expr::AssignCurr(off, Box::new(rhs))]);
    }

    let exprs = match var {
        Variable::Module { ident, .. } => vec![Expr::EvalModule(ident.clone())],
        Variable::Stock {
            ast,
            inflows,
            outflows,
            non_negative: is_non_negative,
            ..
        } => {
            let off = instance.local_offset(ident)?;
            match part {
                StepPart::Initials => {
                    let ast = match ast {
                        Some(ast) => ast,
                        None => return sim_err!(EmptyEquation, ident.to_owned()),
                    };
                    vec![Expr::AssignCurr(off, Box::new(ctx.lower(ast)?))]
                }
                StepPart::Stocks => {
                    let update = ctx.build_stock_update_expr(off, inflows, outflows);
                    let update = if *is_non_negative {
                        non_negative(update)
                    } else {
                        update
                    };
                    vec![Expr::AssignNext(off, Box::new(update))]
                }
                StepPart::Flows => vec![],
            }
        }
        Variable::Var {
            ast,
            table,
            is_flow,
            non_negative: is_non_negative,
            ..
        } => {
            let off = instance.local_offset(ident)?;
            let ast = match ast {
                Some(ast) => ast,
                None => return sim_err!(EmptyEquation, ident.to_owned()),
            };
            let expr = ctx.lower(ast)?;
            let expr = if table.is_some() {
                Expr::App(BuiltinFn::Lookup(ident.to_owned(), Box::new(expr)))
            } else {
                expr
            };
            let expr = if *is_flow && *is_non_negative {
                non_negative(expr)
            } else {
                expr
            };
            vec![Expr::AssignCurr(off, Box::new(expr))]
        }
    };

    Ok(exprs)
}

fn topo_sort<'out>(
    all_deps: &'out HashMap<Ident, BTreeSet<Ident>>,
    runlist: Vec<&'out str>,
) -> Vec<&'out str> {
    let allowed: HashSet<&str> = runlist.iter().cloned().collect();
    let mut result: Vec<&'out str> = Vec::with_capacity(runlist.len());
    let mut used: HashSet<&str> = HashSet::new();

    // We want to do a postorder, recursive traversal of variables to ensure
    // dependencies are calculated before the variables that reference them.
    // By this point, we have already errored out if we have e.g. a cycle
    fn add<'a>(
        all_deps: &'a HashMap<Ident, BTreeSet<Ident>>,
        allowed: &HashSet<&str>,
        result: &mut Vec<&'a str>,
        used: &mut HashSet<&'a str>,
        ident: &'a str,
    ) {
        if used.contains(ident) || !allowed.contains(ident) {
            return;
        }
        used.insert(ident);
        if let Some(deps) = all_deps.get(ident) {
            for dep in deps.iter() {
                add(all_deps, allowed, result, used, dep)
            }
        }
        result.push(ident);
    }

    for ident in runlist.into_iter() {
        add(all_deps, &allowed, &mut result, &mut used, ident)
    }

    result
}

/// The runtime counterpart of a module: an instance of a model with
/// its own block of the shared slab.  Instances form an owned tree
/// mirroring the module hierarchy.
#[derive(Clone, Debug, PartialEq)]
pub struct Instance {
    name: Ident,
    model_name: Ident,
    // module idents from the root down to this instance
    path: Vec<Ident>,
    shift: usize,
    n_vars: usize,
    offsets: BTreeMap<Ident, usize>,
    modules: BTreeMap<Ident, Instance>,
    sym_refs: BTreeMap<Ident, String>,
    refs: BTreeMap<Ident, Option<usize>>,
    tables: BTreeMap<Ident, Table>,
    runlist_initials: Vec<Expr>,
    runlist_flows: Vec<Expr>,
    runlist_stocks: Vec<Expr>,
}

impl Instance {
    fn new(
        project: &Project,
        model: &Rc<Model>,
        name: &str,
        path: Vec<Ident>,
        shift: usize,
        sym_refs: BTreeMap<Ident, String>,
    ) -> Result<Self> {
        let is_root = path.is_empty();

        // the root claims offset 0 for time
        let mut n_local = if is_root { 1 } else { 0 };
        let mut offsets: BTreeMap<Ident, usize> = BTreeMap::new();
        for (ident, var) in model.variables.iter() {
            if var.is_module() {
                continue;
            }
            offsets.insert(ident.clone(), n_local);
            n_local += 1;
        }

        let mut modules: BTreeMap<Ident, Instance> = BTreeMap::new();
        let mut child_shift = shift + n_local;
        for (ident, var) in model.variables.iter() {
            if let Variable::Module { model_name, .. } = var {
                let child_model = match project.models.get(model_name) {
                    Some(model) => model,
                    None => return sim_err!(BadModelName, model_name.clone()),
                };
                let mut child_path = path.clone();
                child_path.push(ident.clone());
                let child_refs = model.sym_refs.get(ident).cloned().unwrap_or_default();
                let child = Instance::new(
                    project,
                    child_model,
                    ident,
                    child_path,
                    child_shift,
                    child_refs,
                )?;
                child_shift += child.n_vars;
                modules.insert(ident.clone(), child);
            }
        }

        let tables = model
            .tables
            .iter()
            .filter_map(|id| {
                let table = model.variables.get(id)?.table()?;
                Some((id.clone(), table.clone()))
            })
            .collect();

        Ok(Instance {
            name: name.to_owned(),
            model_name: model.name.clone(),
            path,
            shift,
            n_vars: child_shift - shift,
            offsets,
            modules,
            sym_refs,
            refs: BTreeMap::new(),
            tables,
            runlist_initials: vec![],
            runlist_flows: vec![],
            runlist_stocks: vec![],
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn n_vars(&self) -> usize {
        self.n_vars
    }

    pub fn child(&self, ident: &str) -> Option<&Instance> {
        self.modules.get(ident)
    }

    /// the resolved absolute offset feeding module input `dst`, if the
    /// input is connected.  `Some(None)` is a connection whose source
    /// could not be resolved.
    pub fn input_ref(&self, dst: &str) -> Option<Option<usize>> {
        self.refs.get(dst).copied()
    }

    fn local_offset(&self, ident: &str) -> Result<usize> {
        match self.offsets.get(ident) {
            Some(off) => Ok(self.shift + off),
            None => sim_err!(DoesNotExist, ident.to_owned()),
        }
    }

    /// Resolves a (possibly dotted) path to an absolute offset into the
    /// slab, starting in this instance's scope.
    pub fn lookup_offset(&self, id: &str) -> Option<usize> {
        if id == "time" {
            return Some(TIME_OFF);
        }
        let id = id.strip_prefix('.').unwrap_or(id);
        if let Some(off) = self.offsets.get(id) {
            return Some(self.shift + off);
        }
        if id.is_empty() {
            // a module's own name stands for its default output
            return self.offsets.get(&self.name).map(|off| self.shift + off);
        }
        let (first, rest) = match id.find('.') {
            Some(pos) => (&id[..pos], &id[pos + 1..]),
            None => (id, ""),
        };
        self.modules.get(first)?.lookup_offset(rest)
    }

    fn find_mut(&mut self, path: &[Ident]) -> Option<&mut Instance> {
        match path.split_first() {
            None => Some(self),
            Some((first, rest)) => self.modules.get_mut(first)?.find_mut(rest),
        }
    }

    fn collect_refs(
        &self,
        root: &Instance,
        parent: Option<&Instance>,
        out: &mut Vec<(Vec<Ident>, Ident, Option<usize>)>,
    ) {
        for (dst, src) in self.sym_refs.iter() {
            let ctx = if src.starts_with('.') {
                root
            } else {
                parent.unwrap_or(root)
            };
            let off = ctx.lookup_offset(src);
            if off.is_none() {
                tracing::warn!(
                    module = %self.name,
                    input = %dst,
                    reference = %src,
                    "unresolved module input, reading as NaN"
                );
            }
            out.push((self.path.clone(), dst.clone(), off));
        }
        for child in self.modules.values() {
            child.collect_refs(root, Some(self), out);
        }
    }

    /// fills in every instance's `refs`: absolute references from the
    /// root, relative ones from the instance's parent.
    fn resolve_all_symbolic_refs(&mut self) {
        let mut resolved = Vec::new();
        self.collect_refs(self, None, &mut resolved);
        for (path, dst, off) in resolved.into_iter() {
            if let Some(instance) = self.find_mut(&path) {
                instance.refs.insert(dst, off);
            }
        }
    }

    fn build_runlists(&mut self, project: &Project, specs: &Specs) -> Result<()> {
        for child in self.modules.values_mut() {
            child.build_runlists(project, specs)?;
        }

        let model = match project.models.get(&self.model_name) {
            Some(model) => Rc::clone(model),
            None => return sim_err!(BadModelName, self.model_name.clone()),
        };

        let var_names: Vec<&str> = model.variables.keys().map(|s| s.as_str()).collect();
        let is_input = |id: &str| self.refs.contains_key(id);

        let build_runlist = |part: StepPart| -> Result<Vec<Expr>> {
            let runlist: Vec<&str> = match part {
                StepPart::Initials => topo_sort(&model.initial_deps, var_names.clone()),
                StepPart::Flows => {
                    let runlist = var_names
                        .iter()
                        .cloned()
                        .filter(|id| {
                            let v = &model.variables[*id];
                            if is_input(*id) {
                                return true;
                            }
                            match v {
                                Variable::Stock { .. } => false,
                                Variable::Var {
                                    ast: Some(ast),
                                    table: None,
                                    ..
                                } => !is_const(ast),
                                _ => true,
                            }
                        })
                        .collect();
                    topo_sort(&model.dt_deps, runlist)
                }
                StepPart::Stocks => var_names
                    .iter()
                    .cloned()
                    .filter(|id| {
                        let v = &model.variables[*id];
                        !is_input(*id) && (v.is_stock() || v.is_module())
                    })
                    .collect(),
            };

            let mut exprs = Vec::with_capacity(runlist.len());
            for ident in runlist.into_iter() {
                let ctx = Context {
                    instance: self,
                    ident,
                    specs,
                };
                exprs.extend(lower_var(&ctx, &model.variables[ident], part)?);
            }
            Ok(exprs)
        };

        let runlist_initials = build_runlist(StepPart::Initials)?;
        let runlist_flows = build_runlist(StepPart::Flows)?;
        let runlist_stocks = build_runlist(StepPart::Stocks)?;

        if tracing::enabled!(tracing::Level::TRACE) {
            for expr in runlist_flows.iter() {
                tracing::trace!(module = %self.name, "flow: {}", pretty(expr));
            }
        }

        self.runlist_initials = runlist_initials;
        self.runlist_flows = runlist_flows;
        self.runlist_stocks = runlist_stocks;

        Ok(())
    }

    fn calc(&self, step_part: StepPart, dt: f64, curr: &mut [f64], next: &mut [f64]) {
        let runlist = match step_part {
            StepPart::Initials => &self.runlist_initials,
            StepPart::Flows => &self.runlist_flows,
            StepPart::Stocks => &self.runlist_stocks,
        };

        let mut step = ModuleEvaluator {
            step_part,
            dt,
            curr,
            next,
            instance: self,
        };

        for expr in runlist.iter() {
            step.eval(expr);
        }
    }

    fn var_names(&self, prefix: &str, names: &mut Vec<String>) {
        for ident in self.offsets.keys() {
            names.push(format!("{}{}", prefix, ident));
        }
        for (ident, child) in self.modules.iter() {
            child.var_names(&format!("{}{}.", prefix, ident), names);
        }
    }
}

fn is_truthy(n: f64) -> bool {
    let is_false = approx_eq!(f64, n, 0.0);
    !is_false
}

struct ModuleEvaluator<'a> {
    step_part: StepPart,
    dt: f64,
    curr: &'a mut [f64],
    next: &'a mut [f64],
    instance: &'a Instance,
}

impl ModuleEvaluator<'_> {
    fn eval(&mut self, expr: &Expr) -> f64 {
        match expr {
            Expr::Const(n) => *n,
            Expr::EvalModule(ident) => {
                if let Some(child) = self.instance.modules.get(ident) {
                    child.calc(self.step_part, self.dt, self.curr, self.next);
                }
                0.0
            }
            Expr::Var(off) => self.curr[*off],
            Expr::AssignCurr(off, r) => {
                let rhs = self.eval(r);
                self.curr[*off] = rhs;
                0.0
            }
            Expr::AssignNext(off, r) => {
                let rhs = self.eval(r);
                self.next[*off] = rhs;
                0.0
            }
            Expr::If(cond, t, f) => {
                let cond: f64 = self.eval(cond);
                if is_truthy(cond) {
                    self.eval(t)
                } else {
                    self.eval(f)
                }
            }
            Expr::Op1(op, l) => {
                let l = self.eval(l);
                match op {
                    UnaryOp::Not => (!is_truthy(l)) as i8 as f64,
                    UnaryOp::Negative => -l,
                    UnaryOp::Positive => l,
                }
            }
            Expr::Op2(op, l, r) => {
                let l = self.eval(l);
                let r = self.eval(r);
                match op {
                    BinaryOp::Add => l + r,
                    BinaryOp::Sub => l - r,
                    BinaryOp::Exp => l.powf(r),
                    BinaryOp::Mul => l * r,
                    BinaryOp::Div => l / r,
                    BinaryOp::Mod => l.rem_euclid(r),
                    BinaryOp::Gt => (l > r) as i8 as f64,
                    BinaryOp::Gte => (l >= r) as i8 as f64,
                    BinaryOp::Lt => (l < r) as i8 as f64,
                    BinaryOp::Lte => (l <= r) as i8 as f64,
                    BinaryOp::Eq => approx_eq!(f64, l, r) as i8 as f64,
                    BinaryOp::Neq => !approx_eq!(f64, l, r) as i8 as f64,
                    BinaryOp::And => (is_truthy(l) && is_truthy(r)) as i8 as f64,
                    BinaryOp::Or => (is_truthy(l) || is_truthy(r)) as i8 as f64,
                }
            }
            Expr::App(builtin) => match builtin {
                BuiltinFn::Abs(a) => self.eval(a).abs(),
                BuiltinFn::Cos(a) => self.eval(a).cos(),
                BuiltinFn::Sin(a) => self.eval(a).sin(),
                BuiltinFn::Tan(a) => self.eval(a).tan(),
                BuiltinFn::Arccos(a) => self.eval(a).acos(),
                BuiltinFn::Arcsin(a) => self.eval(a).asin(),
                BuiltinFn::Arctan(a) => self.eval(a).atan(),
                BuiltinFn::Exp(a) => self.eval(a).exp(),
                BuiltinFn::Inf => f64::INFINITY,
                BuiltinFn::Pi => std::f64::consts::PI,
                BuiltinFn::Int(a) => self.eval(a).floor(),
                BuiltinFn::Ln(a) => self.eval(a).ln(),
                BuiltinFn::Log10(a) => self.eval(a).log10(),
                BuiltinFn::SafeDiv(a, b, default) => {
                    let a = self.eval(a);
                    let b = self.eval(b);

                    if b != 0.0 {
                        a / b
                    } else if let Some(c) = default {
                        self.eval(c)
                    } else {
                        0.0
                    }
                }
                BuiltinFn::Sqrt(a) => self.eval(a).sqrt(),
                BuiltinFn::Min(a, b) => {
                    let a = self.eval(a);
                    let b = self.eval(b);
                    // we can't use std::cmp::min here, becuase f64 is only
                    // PartialOrd
                    if a < b { a } else { b }
                }
                BuiltinFn::Max(a, b) => {
                    let a = self.eval(a);
                    let b = self.eval(b);
                    if a > b { a } else { b }
                }
                BuiltinFn::Lookup(id, index) => {
                    let index = self.eval(index);
                    match self.instance.tables.get(id) {
                        Some(table) => crate::builtins::lookup(&table.data, index),
                        None => f64::NAN,
                    }
                }
                BuiltinFn::Pulse(a, b, c) => {
                    let time = self.curr[TIME_OFF];
                    let volume = self.eval(a);
                    let first_pulse = self.eval(b);
                    let interval = match c {
                        Some(c) => self.eval(c),
                        None => 0.0,
                    };

                    crate::builtins::pulse(self.dt, time, volume, first_pulse, interval)
                }
            },
        }
    }
}

pub fn pretty(expr: &Expr) -> String {
    match expr {
        Expr::Const(n) => format!("{}", n),
        Expr::Var(off) => format!("curr[{}]", off),
        Expr::App(builtin) => match builtin {
            BuiltinFn::Lookup(table, idx) => format!("lookup({}, {})", table, pretty(idx)),
            BuiltinFn::Abs(l) => format!("abs({})", pretty(l)),
            BuiltinFn::Arccos(l) => format!("arccos({})", pretty(l)),
            BuiltinFn::Arcsin(l) => format!("arcsin({})", pretty(l)),
            BuiltinFn::Arctan(l) => format!("arctan({})", pretty(l)),
            BuiltinFn::Cos(l) => format!("cos({})", pretty(l)),
            BuiltinFn::Exp(l) => format!("exp({})", pretty(l)),
            BuiltinFn::Inf => "∞".to_string(),
            BuiltinFn::Int(l) => format!("int({})", pretty(l)),
            BuiltinFn::Ln(l) => format!("ln({})", pretty(l)),
            BuiltinFn::Log10(l) => format!("log10({})", pretty(l)),
            BuiltinFn::Max(l, r) => format!("max({}, {})", pretty(l), pretty(r)),
            BuiltinFn::Min(l, r) => format!("min({}, {})", pretty(l), pretty(r)),
            BuiltinFn::Pi => "𝜋".to_string(),
            BuiltinFn::Pulse(a, b, c) => {
                let c = match c.as_ref() {
                    Some(c) => pretty(c),
                    None => "0".to_owned(),
                };
                format!("pulse({}, {}, {})", pretty(a), pretty(b), c)
            }
            BuiltinFn::SafeDiv(a, b, c) => format!(
                "safediv({}, {}, {})",
                pretty(a),
                pretty(b),
                c.as_ref().map(|c| pretty(c)).unwrap_or_else(|| "<None>".to_string())
            ),
            BuiltinFn::Sin(l) => format!("sin({})", pretty(l)),
            BuiltinFn::Sqrt(l) => format!("sqrt({})", pretty(l)),
            BuiltinFn::Tan(l) => format!("tan({})", pretty(l)),
        },
        Expr::EvalModule(module) => format!("eval<{}>()", module),
        Expr::Op2(op, l, r) => {
            let op: &str = match op {
                BinaryOp::Add => "+",
                BinaryOp::Sub => "-",
                BinaryOp::Exp => "^",
                BinaryOp::Mul => "*",
                BinaryOp::Div => "/",
                BinaryOp::Mod => "%",
                BinaryOp::Gt => ">",
                BinaryOp::Gte => ">=",
                BinaryOp::Lt => "<",
                BinaryOp::Lte => "<=",
                BinaryOp::Eq => "==",
                BinaryOp::Neq => "!=",
                BinaryOp::And => "&&",
                BinaryOp::Or => "||",
            };

            format!("({} {} {})", pretty(l), op, pretty(r))
        }
        Expr::Op1(op, l) => {
            let op: &str = match op {
                UnaryOp::Not => "!",
                UnaryOp::Negative => "-",
                UnaryOp::Positive => "+",
            };
            format!("{}{}", op, pretty(l))
        }
        Expr::If(cond, l, r) => {
            format!("if {} then {} else {}", pretty(cond), pretty(l), pretty(r))
        }
        Expr::AssignCurr(off, rhs) => format!("curr[{}] := {}", off, pretty(rhs)),
        Expr::AssignNext(off, rhs) => format!("next[{}] := {}", off, pretty(rhs)),
    }
}

/// A saved time series for one variable.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Series {
    pub name: String,
    pub time: Vec<f64>,
    pub values: Vec<f64>,
}

/// The runtime for a compiled project: the root of the instance tree
/// plus the one slab of history shared by every instance in it.
#[derive(Clone, Debug)]
pub struct Simulation {
    root: Instance,
    specs: Specs,
    n_vars: usize,
    n_save_steps: usize,
    save_every: usize,
    step_num: usize,
    // one large allocation, (n_save_steps + 1) rows of n_vars
    slab: Vec<f64>,
    // scratch row the stocks phase writes into
    next: Vec<f64>,
}

impl Simulation {
    pub fn new(project: &Project) -> Result<Self> {
        let model = match project.main_model() {
            Some(model) => model,
            None => {
                return sim_err!(
                    NotSimulatable,
                    format!("no model named '{}' to simulate", MAIN_MODEL)
                );
            }
        };

        let x_specs = project.run_specs();
        x_specs.validate()?;
        let specs = Specs::from(x_specs);

        let mut root = Instance::new(project, model, MAIN_MODEL, vec![], 0, BTreeMap::new())?;
        root.resolve_all_symbolic_refs();
        root.build_runlists(project, &specs)?;

        let n_vars = root.n_vars;
        let mut sim = Simulation {
            root,
            specs,
            n_vars,
            n_save_steps: 0,
            save_every: 1,
            step_num: 0,
            slab: vec![],
            next: vec![0.0; n_vars],
        };
        sim.reset();

        Ok(sim)
    }

    /// Reallocates the slab for the whole time span and runs the
    /// initials phase into row 0.
    pub fn reset(&mut self) {
        let spec = &self.specs;
        let n_save_steps = ((spec.stop - spec.start) / spec.save_step + 1.0) as usize;
        let save_every = std::cmp::max(1, (spec.save_step / spec.dt + 0.5).floor() as usize);

        self.n_save_steps = n_save_steps;
        self.save_every = save_every;
        self.step_num = 0;
        self.slab = vec![0.0; self.n_vars * (n_save_steps + 1)];
        self.next.iter_mut().for_each(|v| *v = 0.0);

        let n_vars = self.n_vars;
        let curr = &mut self.slab[0..n_vars];
        curr[TIME_OFF] = self.specs.start;
        self.root
            .calc(StepPart::Initials, self.specs.dt, curr, &mut self.next);

        tracing::debug!(
            n_vars,
            n_save_steps,
            save_every,
            start = self.specs.start,
            "reset simulation"
        );
    }

    fn curr_row(&self) -> usize {
        self.step_num.div_ceil(self.save_every)
    }

    fn curr_time(&self) -> f64 {
        self.slab[self.curr_row() * self.n_vars + TIME_OFF]
    }

    // integrates until the current time passes `end`, or every save row
    // is filled.  Stopping between save points leaves the partial state
    // in the pending row.
    fn run(&mut self, end: Option<f64>) {
        let n_vars = self.n_vars;
        let dt = self.specs.dt;
        let max_steps = self.n_save_steps * self.save_every;

        while self.step_num < max_steps {
            let row = self.curr_row();
            let curr_time = self.slab[row * n_vars + TIME_OFF];
            if let Some(end) = end {
                if curr_time > end {
                    break;
                }
            }

            {
                let curr = &mut self.slab[row * n_vars..(row + 1) * n_vars];
                self.root.calc(StepPart::Flows, dt, curr, &mut self.next);
                self.next.copy_from_slice(curr);
                self.root.calc(StepPart::Stocks, dt, curr, &mut self.next);
            }
            self.next[TIME_OFF] = curr_time + dt;
            self.step_num += 1;

            // when the step isn't a multiple of save_every this
            // overwrites the intermediate state in the current row
            let next_row = self.curr_row();
            self.slab[next_row * n_vars..(next_row + 1) * n_vars].copy_from_slice(&self.next);
        }

        // ensure flows and auxiliaries in the current row reflect its stocks
        let row = self.curr_row();
        let curr = &mut self.slab[row * n_vars..(row + 1) * n_vars];
        self.root.calc(StepPart::Flows, dt, curr, &mut self.next);
    }

    /// Steps the integrator while the current time is <= `end_time`,
    /// returning the current time.
    pub fn run_to(&mut self, end_time: f64) -> f64 {
        tracing::debug!(end_time, step_num = self.step_num, "run_to");
        self.run(Some(end_time));
        self.curr_time()
    }

    /// Runs until every save row is filled; the equivalent of
    /// `run_to(stop + dt/2)` when save_step is a multiple of dt.
    pub fn run_to_end(&mut self) -> f64 {
        tracing::debug!(stop = self.specs.stop, step_num = self.step_num, "run_to_end");
        self.run(None);
        self.curr_time()
    }

    /// Overrides a value in the current row.  Only defined on a freshly
    /// reset simulation: once stepping has begun this is an error.
    pub fn set_value(&mut self, name: &str, value: f64) -> Result<()> {
        if self.step_num != 0 {
            return sim_err!(
                AlreadyStepped,
                format!("can't set '{}' after the simulation has started", name)
            );
        }
        let off = match self.root.lookup_offset(name) {
            Some(off) => off,
            None => return sim_err!(UnresolvedReference, name.to_owned()),
        };
        let row = self.curr_row();
        self.slab[row * self.n_vars + off] = value;
        Ok(())
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        let off = self.root.lookup_offset(name)?;
        let save_num = self.step_num / self.save_every;
        Some(self.slab[save_num * self.n_vars + off])
    }

    /// every saved row's time and value for `name`
    pub fn series(&self, name: &str) -> Option<Series> {
        let off = self.root.lookup_offset(name)?;
        let save_num = self.step_num / self.save_every;
        let (time, values): (Vec<f64>, Vec<f64>) = self
            .slab
            .chunks(self.n_vars)
            .take(save_num)
            .map(|row| (row[TIME_OFF], row[off]))
            .unzip();
        Some(Series {
            name: name.to_owned(),
            time,
            values,
        })
    }

    pub fn lookup_offset(&self, name: &str) -> Option<usize> {
        self.root.lookup_offset(name)
    }

    /// every addressable variable, as dotted paths from the root
    pub fn var_names(&self) -> Vec<String> {
        let mut names = vec!["time".to_owned()];
        self.root.var_names("", &mut names);
        names
    }

    pub fn root(&self) -> &Instance {
        &self.root
    }

    pub fn specs(&self) -> &Specs {
        &self.specs
    }

    pub fn n_vars(&self) -> usize {
        self.n_vars
    }

    pub fn n_save_steps(&self) -> usize {
        self.n_save_steps
    }

    pub fn save_every(&self) -> usize {
        self.save_every
    }

    pub fn step_num(&self) -> usize {
        self.step_num
    }

    pub fn time(&self) -> f64 {
        self.curr_time()
    }

    pub fn debug_runlists(&self) -> String {
        fn print(instance: &Instance, out: &mut String) {
            out.push_str(&format!("\nMODULE: {} ({})\n", instance.name, instance.model_name));
            for (title, runlist) in [
                ("initials", &instance.runlist_initials),
                ("flows", &instance.runlist_flows),
                ("stocks", &instance.runlist_stocks),
            ] {
                out.push_str(&format!("{}:\n", title));
                for expr in runlist.iter() {
                    out.push_str(&format!("\t{}\n", pretty(expr)));
                }
            }
            for child in instance.modules.values() {
                print(child, out);
            }
        }
        let mut out = String::new();
        print(&self.root, &mut out);
        out
    }
}

#[cfg(test)]
use crate::ast::Expr as AstExpr;
#[cfg(test)]
use crate::common::ErrorCode;
#[cfg(test)]
use crate::testutils::{x_aux, x_flow, x_model, x_module, x_project, x_specs, x_stock, x_table};

#[cfg(test)]
fn compile(specs: datamodel::SimSpecs, models: Vec<datamodel::Model>) -> Simulation {
    let project = Project::new(x_project(specs, models)).unwrap();
    Simulation::new(&project).unwrap()
}

#[cfg(test)]
fn stock_and_flow(dt: f64, save_step: f64) -> Simulation {
    compile(
        x_specs(0.0, 2.0, dt, save_step),
        vec![x_model(
            "main",
            vec![
                x_aux("rate", AstExpr::num(1.0)),
                x_stock("stock", AstExpr::num(10.0), &["inflow"], &[]),
                x_flow("inflow", AstExpr::var("rate")),
            ],
        )],
    )
}

#[test]
fn test_offsets() {
    let sim = stock_and_flow(1.0, 1.0);
    assert_eq!(4, sim.n_vars());
    assert_eq!(Some(0), sim.lookup_offset("time"));
    assert_eq!(Some(1), sim.lookup_offset("inflow"));
    assert_eq!(Some(2), sim.lookup_offset("rate"));
    assert_eq!(Some(3), sim.lookup_offset("stock"));
    assert_eq!(Some(3), sim.lookup_offset(".stock"));
    assert_eq!(None, sim.lookup_offset("missing"));
    assert_eq!(
        vec!["time", "inflow", "rate", "stock"],
        sim.var_names()
    );
}

#[test]
fn test_decimation() {
    let mut sim = stock_and_flow(0.25, 1.0);
    assert_eq!(3, sim.n_save_steps());
    assert_eq!(4, sim.save_every());

    sim.run_to_end();
    assert_eq!(12, sim.step_num());
    assert_eq!(sim.n_save_steps(), sim.step_num() / sim.save_every());

    let series = sim.series("stock").unwrap();
    assert_eq!(vec![0.0, 1.0, 2.0], series.time);
    assert_eq!(vec![10.0, 11.0, 12.0], series.values);
    assert!(sim.series("missing").is_none());
    assert!(sim.value("missing").is_none());
}

#[test]
fn test_run_to() {
    let mut sim = stock_and_flow(0.25, 1.0);
    assert_eq!(0.0, sim.time());
    assert_eq!(Some(10.0), sim.value("stock"));
    assert!(sim.series("stock").unwrap().values.is_empty());

    // stepping stops at the first micro-step past the end time, even
    // between saved rows
    assert_eq!(0.75, sim.run_to(0.5));
    assert_eq!(3, sim.step_num());
    assert_eq!(0.75, sim.time());
    assert_eq!(Some(10.0), sim.value("stock"));
    assert!(sim.series("stock").unwrap().values.is_empty());

    // already past the end: nothing to do
    assert_eq!(0.75, sim.run_to(0.5));
    assert_eq!(3, sim.step_num());

    assert_eq!(1.0, sim.run_to(0.75));
    assert_eq!(4, sim.step_num());
    assert_eq!(Some(11.0), sim.value("stock"));
    assert_eq!(vec![10.0], sim.series("stock").unwrap().values);

    // running past the end never overflows the slab, and partial runs
    // land on the same rows as a single run
    sim.run_to(100.0);
    assert_eq!(12, sim.step_num());
    assert_eq!(vec![10.0, 11.0, 12.0], sim.series("stock").unwrap().values);
}

#[test]
fn test_set_value() {
    let mut sim = stock_and_flow(1.0, 1.0);
    sim.set_value("rate", 2.0).unwrap();
    sim.run_to_end();
    assert_eq!(
        vec![10.0, 12.0, 14.0],
        sim.series("stock").unwrap().values
    );

    let err = sim.set_value("rate", 3.0).unwrap_err();
    assert_eq!(ErrorCode::AlreadyStepped, err.code);

    sim.reset();
    assert_eq!(Some(1.0), sim.value("rate"));
    let err = sim.set_value("nope", 3.0).unwrap_err();
    assert_eq!(ErrorCode::UnresolvedReference, err.code);
}

#[test]
fn test_reset_is_repeatable() {
    let mut sim = compile(
        x_specs(0.0, 10.0, 0.125, 0.5),
        vec![x_model(
            "main",
            vec![
                x_aux(
                    "smoothed",
                    AstExpr::app("smth3", vec![AstExpr::var("raw"), AstExpr::num(2.0)]),
                ),
                x_aux(
                    "raw",
                    AstExpr::app("sin", vec![AstExpr::var("time")]),
                ),
            ],
        )],
    );
    sim.run_to_end();
    let first = sim.series("smoothed").unwrap();
    sim.reset();
    assert_eq!(0, sim.step_num());
    sim.run_to_end();
    let second = sim.series("smoothed").unwrap();

    let bits = |v: &[f64]| v.iter().map(|n| n.to_bits()).collect::<Vec<_>>();
    assert_eq!(21, first.values.len());
    assert_eq!(bits(&first.values), bits(&second.values));
    assert_eq!(bits(&first.time), bits(&second.time));
}

#[test]
fn test_smth1() {
    let mut sim = compile(
        x_specs(0.0, 3.0, 1.0, 1.0),
        vec![x_model(
            "main",
            vec![
                x_aux("raw", AstExpr::num(10.0)),
                x_aux(
                    "smoothed",
                    AstExpr::app(
                        "smth1",
                        vec![AstExpr::var("raw"), AstExpr::num(2.0), AstExpr::num(0.0)],
                    ),
                ),
            ],
        )],
    );
    sim.run_to_end();
    assert_eq!(
        vec![0.0, 5.0, 7.5, 8.75],
        sim.series("smoothed").unwrap().values
    );
    assert_eq!(
        vec![0.0, 5.0, 7.5, 8.75],
        sim.series("$·smoothed·0·smth1.output").unwrap().values
    );
}

#[test]
fn test_absolute_and_relative_inputs() {
    let child = x_model(
        "child",
        vec![
            x_aux("input", AstExpr::num(0.0)),
            x_aux(
                "output",
                AstExpr::op2(BinaryOp::Mul, AstExpr::var("input"), AstExpr::num(2.0)),
            ),
        ],
    );
    let middle = x_model(
        "middle",
        vec![
            x_aux("x", AstExpr::num(7.0)),
            x_module("inner_abs", "child", &[(".x", "inner_abs.input")]),
            x_module("inner_rel", "child", &[("x", "inner_rel.input")]),
        ],
    );
    let main = x_model(
        "main",
        vec![
            x_aux(
                "x",
                AstExpr::op2(BinaryOp::Add, AstExpr::var("time"), AstExpr::num(5.0)),
            ),
            x_module("a_outer", "middle", &[]),
        ],
    );
    let mut sim = compile(x_specs(0.0, 1.0, 1.0, 1.0), vec![main, middle, child]);

    let outer = sim.root().child("a_outer").unwrap();
    assert_eq!(Some(Some(1)), outer.child("inner_abs").unwrap().input_ref("input"));
    let middle_x = sim.lookup_offset("a_outer.x");
    assert_eq!(middle_x, outer.child("inner_rel").unwrap().input_ref("input").unwrap());

    // the rooted source is computed before the module that reads it,
    // even though "a_outer" sorts first
    sim.run_to_end();
    assert_eq!(
        vec![10.0, 12.0],
        sim.series("a_outer.inner_abs.output").unwrap().values
    );
    assert_eq!(vec![14.0, 14.0], sim.series("a_outer.inner_rel.output").unwrap().values);
}

#[test]
fn test_tables_and_pulse() {
    let mut sim = compile(
        x_specs(0.0, 4.0, 1.0, 1.0),
        vec![x_model(
            "main",
            vec![
                x_table("ramp", AstExpr::var("time"), &[0.0, 2.0], &[0.0, 10.0]),
                x_aux(
                    "via_lookup",
                    AstExpr::app("lookup", vec![AstExpr::var("ramp"), AstExpr::num(1.5)]),
                ),
                x_aux(
                    "once",
                    AstExpr::app("pulse", vec![AstExpr::num(10.0), AstExpr::num(2.0)]),
                ),
                x_aux(
                    "repeating",
                    AstExpr::app(
                        "pulse",
                        vec![AstExpr::num(10.0), AstExpr::num(1.0), AstExpr::num(2.0)],
                    ),
                ),
            ],
        )],
    );
    sim.run_to_end();
    assert_eq!(
        vec![0.0, 5.0, 10.0, 10.0, 10.0],
        sim.series("ramp").unwrap().values
    );
    assert_eq!(vec![7.5; 5], sim.series("via_lookup").unwrap().values);
    assert_eq!(
        vec![0.0, 0.0, 10.0, 0.0, 0.0],
        sim.series("once").unwrap().values
    );
    assert_eq!(
        vec![0.0, 10.0, 0.0, 10.0, 0.0],
        sim.series("repeating").unwrap().values
    );
}

#[test]
fn test_non_negative_stock() {
    let mut drain = x_stock("tank", AstExpr::num(1.0), &[], &["leak"]);
    if let datamodel::Variable::Stock(stock) = &mut drain {
        stock.non_negative = true;
    }
    let mut sim = compile(
        x_specs(0.0, 2.0, 1.0, 1.0),
        vec![x_model(
            "main",
            vec![drain, x_flow("leak", AstExpr::num(3.0))],
        )],
    );
    sim.run_to_end();
    assert_eq!(vec![1.0, 0.0, 0.0], sim.series("tank").unwrap().values);
}

#[test]
fn test_runlist_rendering() {
    let sim = stock_and_flow(1.0, 1.0);
    let runlists = sim.debug_runlists();
    assert!(runlists.contains("MODULE: main (main)"));
    assert!(runlists.contains("next[3] := (curr[3] + ((curr[1] - 0) * 1))"));
    assert!(runlists.contains("curr[1] := curr[2]"));
}

#[test]
fn test_not_simulatable() {
    let project = Project::new(x_project(
        x_specs(0.0, 1.0, 1.0, 1.0),
        vec![x_model("main", vec![x_aux("a", AstExpr::num(1.0))])],
    ))
    .unwrap();
    let mut project = project;
    project.models.remove(MAIN_MODEL);
    let err = Simulation::new(&project).unwrap_err();
    assert_eq!(ErrorCode::NotSimulatable, err.code);
}
