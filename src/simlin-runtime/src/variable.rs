// Copyright 2026 The Simlin Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use std::collections::BTreeSet;

use crate::ast::{Expr, Visitor};
use crate::builtins::{is_builtin_fn, is_builtin_fn_or_time};
use crate::common::{EquationResult, Ident, canonicalize};
use crate::{datamodel, eqn_err};

#[derive(Clone, PartialEq, Debug)]
pub struct Table {
    pub data: Vec<(f64, f64)>,
}

impl Table {
    /// validates a graphical function, computing x points from the
    /// x scale when they weren't given explicitly.
    pub fn new(gf: &datamodel::GraphicalFunction) -> EquationResult<Self> {
        let x: Vec<f64> = match (&gf.x_points, &gf.x_scale) {
            (Some(x_points), _) => x_points.clone(),
            (None, Some(x_scale)) => {
                let x_min = x_scale.min;
                let x_max = x_scale.max;
                let size = gf.y_points.len() as f64;
                if gf.y_points.len() == 1 {
                    vec![x_min]
                } else {
                    gf.y_points
                        .iter()
                        .enumerate()
                        .map(|(i, _)| ((i as f64) / (size - 1.0)) * (x_max - x_min) + x_min)
                        .collect()
                }
            }
            (None, None) => {
                return eqn_err!(InvalidTable, "no x points or x scale".to_owned());
            }
        };
        let y = &gf.y_points;

        if x.is_empty() {
            return eqn_err!(InvalidTable, "empty table".to_owned());
        }
        if x.len() != y.len() {
            return eqn_err!(
                InvalidTable,
                format!("{} x points but {} y points", x.len(), y.len())
            );
        }
        if x.iter().chain(y.iter()).any(|n| !n.is_finite()) {
            return eqn_err!(InvalidTable, "non-finite point".to_owned());
        }
        if x.windows(2).any(|pair| pair[1] < pair[0]) {
            return eqn_err!(InvalidTable, "x points must be non-decreasing".to_owned());
        }

        let data: Vec<(f64, f64)> = x.into_iter().zip(y.iter().copied()).collect();

        Ok(Table { data })
    }
}

/// Where a module input's value comes from, in the scope that
/// instantiates the module.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ModuleInputSrc {
    // resolved starting at the instantiating (parent) scope
    Relative(Ident),
    // resolved starting at the root of the whole model tree
    Absolute(Ident),
}

impl ModuleInputSrc {
    pub fn ident(&self) -> &str {
        match self {
            ModuleInputSrc::Relative(ident) => ident,
            ModuleInputSrc::Absolute(ident) => ident,
        }
    }

    /// the symbolic reference, where a leading '.' marks an absolute path
    pub fn path(&self) -> String {
        match self {
            ModuleInputSrc::Relative(ident) => ident.clone(),
            ModuleInputSrc::Absolute(ident) => format!(".{}", ident),
        }
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct ModuleInput {
    // the Variable in the instantiating model we will use for input
    pub src: ModuleInputSrc,
    // the Variable identifier in the module's model we will override
    pub dst: Ident,
}

#[derive(Clone, PartialEq, Debug)]
pub enum Variable {
    Stock {
        ident: Ident,
        ast: Option<Expr>,
        eqn: String,
        inflows: Vec<Ident>,
        outflows: Vec<Ident>,
        non_negative: bool,
        deps: BTreeSet<Ident>,
    },
    Var {
        ident: Ident,
        ast: Option<Expr>,
        eqn: String,
        table: Option<Table>,
        is_flow: bool,
        non_negative: bool,
        deps: BTreeSet<Ident>,
    },
    Module {
        ident: Ident,
        model_name: Ident,
        inputs: Vec<ModuleInput>,
        deps: BTreeSet<Ident>,
    },
}

impl Variable {
    pub fn ident(&self) -> &str {
        match self {
            Variable::Stock { ident: name, .. } => name.as_str(),
            Variable::Var { ident: name, .. } => name.as_str(),
            Variable::Module { ident: name, .. } => name.as_str(),
        }
    }

    pub fn ast(&self) -> Option<&Expr> {
        match self {
            Variable::Stock { ast: Some(ast), .. } => Some(ast),
            Variable::Var { ast: Some(ast), .. } => Some(ast),
            _ => None,
        }
    }

    pub(crate) fn ast_mut(&mut self) -> Option<&mut Expr> {
        match self {
            Variable::Stock { ast: Some(ast), .. } => Some(ast),
            Variable::Var { ast: Some(ast), .. } => Some(ast),
            _ => None,
        }
    }

    pub fn is_stock(&self) -> bool {
        matches!(self, Variable::Stock { .. })
    }

    pub fn is_module(&self) -> bool {
        matches!(self, Variable::Module { .. })
    }

    pub fn table(&self) -> Option<&Table> {
        match self {
            Variable::Var { table, .. } => table.as_ref(),
            _ => None,
        }
    }

    pub fn direct_deps(&self) -> &BTreeSet<Ident> {
        match self {
            Variable::Stock { deps, .. } => deps,
            Variable::Var { deps, .. } => deps,
            Variable::Module { deps, .. } => deps,
        }
    }

    /// recompute the dependency set from the (possibly rewritten)
    /// expression tree or module connections.
    pub(crate) fn update_deps(&mut self) {
        match self {
            Variable::Stock { ast, deps, .. } | Variable::Var { ast, deps, .. } => {
                *deps = ast.as_ref().map(identifier_set).unwrap_or_default();
            }
            Variable::Module { inputs, deps, .. } => {
                *deps = inputs
                    .iter()
                    .filter_map(|input| match &input.src {
                        ModuleInputSrc::Relative(src) => Some(src.clone()),
                        ModuleInputSrc::Absolute(_) => None,
                    })
                    .collect();
            }
        }
    }

    /// orders a module after root variables its subtree reads through
    /// absolute references.  No-op for anything but a module.
    pub(crate) fn add_module_deps<I: IntoIterator<Item = Ident>>(&mut self, srcs: I) {
        if let Variable::Module { deps, .. } = self {
            deps.extend(srcs);
        }
    }
}

// loaders may hand us references by display name ("Birth Rate")
fn canonicalize_idents(expr: &mut Expr) {
    match expr {
        Expr::Const(_, _) => (),
        Expr::Var(id) => *id = canonicalize(id),
        Expr::App(func, args) => {
            *func = canonicalize(func);
            args.iter_mut().for_each(canonicalize_idents);
        }
        Expr::Paren(e) | Expr::Op1(_, e) => canonicalize_idents(e),
        Expr::Op2(_, l, r) => {
            canonicalize_idents(l);
            canonicalize_idents(r);
        }
        Expr::If(cond, t, f) => {
            canonicalize_idents(cond);
            canonicalize_idents(t);
            canonicalize_idents(f);
        }
    }
}

// the expression tree for a variable: the tree we were handed, or a
// numeric literal equation.
fn get_ast(ident: &str, ast: &Option<Expr>, eqn: &str) -> EquationResult<Expr> {
    if let Some(ast) = ast {
        let mut ast = ast.clone();
        canonicalize_idents(&mut ast);
        return Ok(ast);
    }
    let eqn = eqn.trim();
    match eqn.parse::<f64>() {
        Ok(n) => Ok(Expr::Const(eqn.to_owned(), n)),
        Err(_) if eqn.is_empty() => eqn_err!(EmptyEquation, ident.to_owned()),
        Err(_) => eqn_err!(
            EmptyEquation,
            format!("'{}' needs an expression tree", eqn)
        ),
    }
}

fn parse_table(
    ident: &str,
    gf: &Option<datamodel::GraphicalFunction>,
) -> Option<Table> {
    let gf = gf.as_ref()?;
    match Table::new(gf) {
        Ok(table) => Some(table),
        Err(err) => {
            tracing::warn!(
                variable = ident,
                error = %err,
                "invalid graphical function, falling back to a plain variable"
            );
            None
        }
    }
}

pub fn resolve_module_input(
    ident: &str,
    orig_src: &str,
    orig_dst: &str,
) -> EquationResult<Option<ModuleInput>> {
    let input_prefix = format!("{}.", ident);
    let src = canonicalize(orig_src);
    let dst = canonicalize(orig_dst);

    // Stella has a bug where if you have one module feeding into another,
    // it writes identical tags to both.  So skip the tag that is non-local
    // but don't report it as an error
    if src.starts_with(&input_prefix) {
        return Ok(None);
    }

    let dst = match dst.strip_prefix(&input_prefix) {
        Some(dst) if !dst.is_empty() => dst.to_owned(),
        _ => return eqn_err!(BadModuleInputDst, orig_dst.to_owned()),
    };

    let src = match src.strip_prefix('.') {
        Some(src) => ModuleInputSrc::Absolute(src.to_owned()),
        None => ModuleInputSrc::Relative(src),
    };

    Ok(Some(ModuleInput { src, dst }))
}

fn canonical_list(idents: &[Ident]) -> Vec<Ident> {
    idents.iter().map(|id| canonicalize(id)).collect()
}

/// Builds a compiled variable from its definition.  Dependencies are
/// left empty; the owning model fills them in once builtin calls have
/// been desugared.
pub fn parse_var(v: &datamodel::Variable) -> EquationResult<Variable> {
    match v {
        datamodel::Variable::Stock(v) => {
            let ident = canonicalize(&v.ident);
            let ast = get_ast(&ident, &v.ast, &v.equation)?;
            Ok(Variable::Stock {
                ident,
                ast: Some(ast),
                eqn: v.equation.clone(),
                inflows: canonical_list(&v.inflows),
                outflows: canonical_list(&v.outflows),
                non_negative: v.non_negative,
                deps: BTreeSet::new(),
            })
        }
        datamodel::Variable::Flow(v) => {
            let ident = canonicalize(&v.ident);
            let table = parse_table(&ident, &v.gf);
            let ast = if table.is_some() && v.ast.is_none() && v.equation.trim().is_empty() {
                Expr::var("time")
            } else {
                get_ast(&ident, &v.ast, &v.equation)?
            };
            Ok(Variable::Var {
                ident,
                ast: Some(ast),
                eqn: v.equation.clone(),
                table,
                is_flow: true,
                non_negative: v.non_negative,
                deps: BTreeSet::new(),
            })
        }
        datamodel::Variable::Aux(v) => {
            let ident = canonicalize(&v.ident);
            let table = parse_table(&ident, &v.gf);
            let ast = if table.is_some() && v.ast.is_none() && v.equation.trim().is_empty() {
                Expr::var("time")
            } else {
                get_ast(&ident, &v.ast, &v.equation)?
            };
            Ok(Variable::Var {
                ident,
                ast: Some(ast),
                eqn: v.equation.clone(),
                table,
                is_flow: false,
                non_negative: false,
                deps: BTreeSet::new(),
            })
        }
        datamodel::Variable::Module(v) => {
            let ident = canonicalize(&v.ident);
            let inputs: EquationResult<Vec<Option<ModuleInput>>> = v
                .references
                .iter()
                .map(|mi| resolve_module_input(&ident, &mi.src, &mi.dst))
                .collect();
            let inputs: Vec<ModuleInput> = inputs?.into_iter().flatten().collect();

            Ok(Variable::Module {
                ident,
                model_name: v.model_name.clone(),
                inputs,
                deps: BTreeSet::new(),
            })
        }
    }
}

struct IdentifierSetVisitor {
    identifiers: BTreeSet<Ident>,
}

impl Visitor<()> for IdentifierSetVisitor {
    fn walk(&mut self, e: &Expr) {
        match e {
            Expr::Const(_, _) => (),
            Expr::Var(id) => {
                if !is_builtin_fn_or_time(id) {
                    self.identifiers.insert(id.clone());
                }
            }
            Expr::App(func, args) => {
                if !is_builtin_fn(func) {
                    self.identifiers.insert(func.clone());
                }
                for arg in args.iter() {
                    self.walk(arg);
                }
            }
            Expr::Paren(e) => self.walk(e),
            Expr::Op1(_, l) => self.walk(l),
            Expr::Op2(_, l, r) => {
                self.walk(l);
                self.walk(r);
            }
            Expr::If(cond, t, f) => {
                self.walk(cond);
                self.walk(t);
                self.walk(f);
            }
        }
    }
}

pub fn identifier_set(e: &Expr) -> BTreeSet<Ident> {
    let mut id_visitor = IdentifierSetVisitor {
        identifiers: BTreeSet::new(),
    };
    id_visitor.walk(e);
    id_visitor.identifiers
}

#[test]
fn test_identifier_sets() {
    use crate::ast::BinaryOp;
    let cases: &[(Expr, &[&str])] = &[
        (Expr::var("a"), &["a"]),
        (Expr::var("time"), &[]),
        (Expr::num(1.0), &[]),
        (
            Expr::op2(BinaryOp::Add, Expr::var("a"), Expr::var("b.output")),
            &["a", "b.output"],
        ),
        (
            Expr::app("max", vec![Expr::var("a"), Expr::var("dt")]),
            &["a"],
        ),
        (
            Expr::If(
                Box::new(Expr::var("c")),
                Box::new(Expr::Paren(Box::new(Expr::var("t")))),
                Box::new(Expr::Op1(
                    crate::ast::UnaryOp::Negative,
                    Box::new(Expr::var("f")),
                )),
            ),
            &["c", "t", "f"],
        ),
    ];

    for (expr, expected) in cases.iter() {
        let expected: BTreeSet<Ident> = expected.iter().map(|s| s.to_string()).collect();
        assert_eq!(expected, identifier_set(expr));
    }
}

#[test]
fn test_table_validation() {
    use datamodel::{GraphicalFunction, GraphicalFunctionScale};
    let gf = |x: Option<Vec<f64>>, y: Vec<f64>| GraphicalFunction {
        x_points: x,
        y_points: y,
        x_scale: Some(GraphicalFunctionScale { min: 0.0, max: 2.0 }),
    };

    let table = Table::new(&gf(None, vec![0.0, 10.0, 20.0])).unwrap();
    assert_eq!(vec![(0.0, 0.0), (1.0, 10.0), (2.0, 20.0)], table.data);

    let table = Table::new(&gf(Some(vec![0.0, 0.5, 3.0]), vec![1.0, 2.0, 3.0])).unwrap();
    assert_eq!(vec![(0.0, 1.0), (0.5, 2.0), (3.0, 3.0)], table.data);

    let bad = vec![
        gf(Some(vec![]), vec![]),
        gf(Some(vec![0.0, 1.0]), vec![1.0]),
        gf(Some(vec![1.0, 0.0]), vec![1.0, 2.0]),
        gf(Some(vec![0.0, f64::NAN]), vec![1.0, 2.0]),
        GraphicalFunction {
            x_points: None,
            y_points: vec![1.0],
            x_scale: None,
        },
    ];
    for gf in bad.iter() {
        let err = Table::new(gf).unwrap_err();
        assert_eq!(crate::common::ErrorCode::InvalidTable, err.code);
    }
}

#[test]
fn test_table_fallback() {
    let aux = datamodel::Variable::Aux(datamodel::Aux {
        ident: "Effect".to_owned(),
        equation: "".to_owned(),
        ast: Some(Expr::var("time")),
        gf: Some(datamodel::GraphicalFunction {
            x_points: Some(vec![2.0, 1.0]),
            y_points: vec![0.0, 1.0],
            x_scale: None,
        }),
    });
    let var = parse_var(&aux).unwrap();
    assert_eq!("effect", var.ident());
    assert!(var.table().is_none());
    assert_eq!(Some(&Expr::var("time")), var.ast());
}

#[test]
fn test_resolve_module_input() {
    let input = resolve_module_input("smoothed", "Raw Value", "smoothed.input").unwrap();
    assert_eq!(
        Some(ModuleInput {
            src: ModuleInputSrc::Relative("raw_value".to_owned()),
            dst: "input".to_owned(),
        }),
        input
    );

    let input = resolve_module_input("smoothed", ".rate", "smoothed.delay_time").unwrap();
    let input = input.unwrap();
    assert_eq!(ModuleInputSrc::Absolute("rate".to_owned()), input.src);
    assert_eq!(".rate", input.src.path());

    assert_eq!(
        None,
        resolve_module_input("smoothed", "smoothed.output", "smoothed.input").unwrap()
    );

    let err = resolve_module_input("smoothed", "raw", "other.input").unwrap_err();
    assert_eq!(crate::common::ErrorCode::BadModuleInputDst, err.code);
}

#[test]
fn test_literal_equations() {
    let stock = datamodel::Variable::Stock(datamodel::Stock {
        ident: "Population".to_owned(),
        equation: " 100 ".to_owned(),
        ast: None,
        inflows: vec!["Births".to_owned()],
        outflows: vec![],
        non_negative: false,
    });
    let var = parse_var(&stock).unwrap();
    assert_eq!(Some(&Expr::Const("100".to_owned(), 100.0)), var.ast());
    if let Variable::Stock { inflows, .. } = &var {
        assert_eq!(&vec!["births".to_owned()], inflows);
    }

    let aux = datamodel::Variable::Aux(datamodel::Aux {
        ident: "a".to_owned(),
        equation: "b * 2".to_owned(),
        ast: None,
        gf: None,
    });
    let err = parse_var(&aux).unwrap_err();
    assert_eq!(crate::common::ErrorCode::EmptyEquation, err.code);
}

#[test]
fn test_canonical_references() {
    let aux = datamodel::Variable::Aux(datamodel::Aux {
        ident: "Births".to_owned(),
        equation: "".to_owned(),
        ast: Some(Expr::app(
            "MAX",
            vec![Expr::var("Birth Rate"), Expr::var("\"Floor\"")],
        )),
        gf: None,
    });
    let mut var = parse_var(&aux).unwrap();
    var.update_deps();
    let expected: BTreeSet<Ident> = ["birth_rate", "floor"].iter().map(|s| s.to_string()).collect();
    assert_eq!(&expected, var.direct_deps());
}
