// Copyright 2026 The Simlin Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use crate::ast::{Expr, print_eqn};
use crate::builtins::is_builtin_fn;
use crate::common::{EquationError, Ident};
use crate::stdlib::{self, stdlib_args};
use crate::{datamodel, eqn_err};

/// Rewrites calls to stateful builtins (`smth1`, `delay3`, ...) into
/// references to the output of an implicitly instantiated stdlib
/// module, recording the variables it had to synthesize.
pub struct BuiltinVisitor<'a> {
    variable_name: &'a str,
    vars: Vec<datamodel::Variable>,
    n: usize,
}

impl<'a> BuiltinVisitor<'a> {
    pub fn new(variable_name: &'a str) -> Self {
        Self {
            variable_name,
            vars: Default::default(),
            n: 0,
        }
    }

    fn walk(&mut self, expr: Expr) -> std::result::Result<Expr, EquationError> {
        use crate::ast::Expr::*;
        use std::mem;
        let result: Expr = match expr {
            Const(_, _) => expr,
            Var(_) => expr,
            App(func, args) => {
                let args: std::result::Result<Vec<Expr>, EquationError> =
                    args.into_iter().map(|e| self.walk(e)).collect();
                let args = args?;
                if is_builtin_fn(&func) {
                    return Ok(App(func, args));
                }

                let stdlib_model_inputs = match stdlib_args(&func) {
                    Some(inputs) if stdlib::MODEL_NAMES.contains(&func.as_str()) => inputs,
                    _ => {
                        return eqn_err!(UnknownBuiltin, func);
                    }
                };
                if args.is_empty() || args.len() > stdlib_model_inputs.len() {
                    return eqn_err!(
                        BadBuiltinArgs,
                        format!(
                            "{} takes 1 to {} arguments, not {}",
                            func,
                            stdlib_model_inputs.len(),
                            args.len()
                        )
                    );
                }

                let ident_args: Vec<Ident> = args
                    .into_iter()
                    .enumerate()
                    .map(|(i, arg)| {
                        if let Expr::Var(id) = arg {
                            id
                        } else {
                            let id = format!("$·{}·{}·arg{}", self.variable_name, self.n, i);
                            let eqn = print_eqn(&arg);
                            let x_var = datamodel::Variable::Aux(datamodel::Aux {
                                ident: id.clone(),
                                equation: eqn,
                                ast: Some(arg),
                                gf: None,
                            });
                            self.vars.push(x_var);
                            id
                        }
                    })
                    .collect();

                let module_name = format!("$·{}·{}·{}", self.variable_name, self.n, func);
                let references: Vec<_> = ident_args
                    .into_iter()
                    .enumerate()
                    .map(|(i, src)| datamodel::ModuleReference {
                        src,
                        dst: format!("{}.{}", module_name, stdlib_model_inputs[i]),
                    })
                    .collect();
                let x_module = datamodel::Variable::Module(datamodel::Module {
                    ident: module_name.clone(),
                    model_name: stdlib::model_name(&func),
                    references,
                });
                let module_output_name = format!("{}.output", module_name);
                tracing::debug!(
                    variable = self.variable_name,
                    module = %module_name,
                    "instantiated implicit {} module",
                    func
                );
                self.vars.push(x_module);

                self.n += 1;
                Var(module_output_name)
            }
            Paren(mut e) => {
                *e = self.walk(mem::take(&mut *e))?;
                Paren(e)
            }
            Op1(op, mut r) => {
                *r = self.walk(mem::take(&mut *r))?;
                Op1(op, r)
            }
            Op2(op, mut l, mut r) => {
                *l = self.walk(mem::take(&mut *l))?;
                *r = self.walk(mem::take(&mut *r))?;
                Op2(op, l, r)
            }
            If(mut cond, mut t, mut f) => {
                *cond = self.walk(mem::take(&mut *cond))?;
                *t = self.walk(mem::take(&mut *t))?;
                *f = self.walk(mem::take(&mut *f))?;
                If(cond, t, f)
            }
        };

        Ok(result)
    }
}

pub fn instantiate_implicit_modules(
    variable_name: &str,
    ast: Expr,
) -> std::result::Result<(Expr, Vec<datamodel::Variable>), EquationError> {
    let mut builtin_visitor = BuiltinVisitor::new(variable_name);
    let ast = builtin_visitor.walk(ast)?;
    Ok((ast, builtin_visitor.vars))
}

#[cfg(test)]
fn count_kinds(vars: &[datamodel::Variable]) -> (usize, usize) {
    let modules = vars
        .iter()
        .filter(|v| matches!(v, datamodel::Variable::Module(_)))
        .count();
    let auxes = vars
        .iter()
        .filter(|v| matches!(v, datamodel::Variable::Aux(_)))
        .count();
    (modules, auxes)
}

#[test]
fn test_identifier_args() {
    let ast = Expr::app("smth1", vec![Expr::var("raw"), Expr::var("smoothing_time")]);
    let (ast, vars) = instantiate_implicit_modules("smoothed", ast).unwrap();

    assert_eq!(Expr::var("$·smoothed·0·smth1.output"), ast);
    assert_eq!((1, 0), count_kinds(&vars));
    if let datamodel::Variable::Module(module) = &vars[0] {
        assert_eq!("$·smoothed·0·smth1", module.ident);
        assert_eq!("stdlib·smth1", module.model_name);
        assert_eq!(
            vec![
                datamodel::ModuleReference {
                    src: "raw".to_owned(),
                    dst: "$·smoothed·0·smth1.input".to_owned(),
                },
                datamodel::ModuleReference {
                    src: "smoothing_time".to_owned(),
                    dst: "$·smoothed·0·smth1.delay_time".to_owned(),
                },
            ],
            module.references
        );
    } else {
        panic!("expected a module");
    }
}

#[test]
fn test_expression_args() {
    use crate::ast::BinaryOp;
    let ast = Expr::op2(
        BinaryOp::Mul,
        Expr::num(2.0),
        Expr::app(
            "delay3",
            vec![
                Expr::op2(BinaryOp::Add, Expr::var("a"), Expr::var("b")),
                Expr::num(5.0),
                Expr::var("init"),
            ],
        ),
    );
    let (ast, vars) = instantiate_implicit_modules("delayed", ast).unwrap();

    assert_eq!("(2 * $·delayed·0·delay3.output)", print_eqn(&ast));
    assert_eq!((1, 2), count_kinds(&vars));

    let idents: Vec<&str> = vars.iter().map(|v| v.get_ident()).collect();
    assert_eq!(
        vec!["$·delayed·0·arg0", "$·delayed·0·arg1", "$·delayed·0·delay3"],
        idents
    );
    if let datamodel::Variable::Aux(aux) = &vars[0] {
        assert_eq!("(a + b)", aux.equation);
    } else {
        panic!("expected an aux");
    }
}

#[test]
fn test_nested_calls() {
    // the inner call is desugared first, so the outer call's argument
    // becomes a plain reference to the inner module's output
    let ast = Expr::app(
        "smth1",
        vec![
            Expr::app("delay1", vec![Expr::var("x"), Expr::num(2.0)]),
            Expr::var("t"),
        ],
    );
    let (ast, vars) = instantiate_implicit_modules("y", ast).unwrap();
    assert_eq!(Expr::var("$·y·1·smth1.output"), ast);
    assert_eq!((2, 1), count_kinds(&vars));

    if let datamodel::Variable::Module(module) = &vars[2] {
        assert_eq!("$·y·0·delay1.output", module.references[0].src);
    } else {
        panic!("expected a module");
    }
}

#[test]
fn test_primitive_and_unknown_builtins() {
    let ast = Expr::app("max", vec![Expr::var("a"), Expr::num(0.0)]);
    let (out, vars) = instantiate_implicit_modules("v", ast.clone()).unwrap();
    assert_eq!(ast, out);
    assert!(vars.is_empty());

    let err = instantiate_implicit_modules("v", Expr::app("smth9", vec![Expr::var("a")]))
        .unwrap_err();
    assert_eq!(crate::common::ErrorCode::UnknownBuiltin, err.code);
    assert_eq!(Some("smth9".to_owned()), err.details);

    let err = instantiate_implicit_modules(
        "v",
        Expr::app(
            "trend",
            vec![Expr::var("a"), Expr::var("b"), Expr::var("c"), Expr::var("d")],
        ),
    )
    .unwrap_err();
    assert_eq!(crate::common::ErrorCode::BadBuiltinArgs, err.code);
}
