// Copyright 2026 The Simlin Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! The canned sub-models that stateful builtins like `smth1(...)` are
//! desugared into.  Every model exposes `input`, `delay_time` and
//! `initial_value` as inputs and an `output` variable.

use crate::ast::{BinaryOp, Expr};
use crate::datamodel::{Aux, Flow, Model, Stock, Variable};

pub const MODEL_NAMES: [&str; 5] = ["delay1", "delay3", "smth1", "smth3", "trend"];

pub const MODEL_PREFIX: &str = "stdlib·";

/// the stdlib inputs, in the positional order callers pass them
pub fn stdlib_args(name: &str) -> Option<&'static [&'static str]> {
    let args: &'static [&'static str] = match name {
        "smth1" | "smth3" | "delay1" | "delay3" | "trend" => {
            &["input", "delay_time", "initial_value"]
        }
        _ => {
            return None;
        }
    };
    Some(args)
}

pub fn model_name(func: &str) -> String {
    format!("{}{}", MODEL_PREFIX, func)
}

fn var(id: &str) -> Expr {
    Expr::var(id)
}

fn num(n: f64) -> Expr {
    Expr::num(n)
}

fn sub(l: Expr, r: Expr) -> Expr {
    Expr::op2(BinaryOp::Sub, l, r)
}

fn mul(l: Expr, r: Expr) -> Expr {
    Expr::op2(BinaryOp::Mul, l, r)
}

fn div(l: Expr, r: Expr) -> Expr {
    Expr::op2(BinaryOp::Div, l, r)
}

fn aux(ident: &str, ast: Expr) -> Variable {
    Variable::Aux(Aux {
        ident: ident.to_owned(),
        equation: crate::ast::print_eqn(&ast),
        ast: Some(ast),
        gf: None,
    })
}

fn flow(ident: &str, ast: Expr) -> Variable {
    Variable::Flow(Flow {
        ident: ident.to_owned(),
        equation: crate::ast::print_eqn(&ast),
        ast: Some(ast),
        gf: None,
        non_negative: false,
    })
}

fn stock(ident: &str, ast: Expr, inflows: &[&str], outflows: &[&str]) -> Variable {
    Variable::Stock(Stock {
        ident: ident.to_owned(),
        equation: crate::ast::print_eqn(&ast),
        ast: Some(ast),
        inflows: inflows.iter().map(|s| s.to_string()).collect(),
        outflows: outflows.iter().map(|s| s.to_string()).collect(),
        non_negative: false,
    })
}

fn inputs(initial_value: Expr) -> Vec<Variable> {
    vec![
        aux("input", num(0.0)),
        aux("delay_time", num(1.0)),
        aux("initial_value", initial_value),
    ]
}

fn model(name: &str, mut variables: Vec<Variable>, initial_value: Expr) -> Model {
    let mut all = inputs(initial_value);
    all.append(&mut variables);
    Model {
        name: model_name(name),
        sim_specs: None,
        variables: all,
    }
}

fn smth1() -> Model {
    model(
        "smth1",
        vec![
            stock("output", var("initial_value"), &["flow"], &[]),
            flow(
                "flow",
                div(sub(var("input"), var("output")), var("delay_time")),
            ),
        ],
        var("input"),
    )
}

fn smth3() -> Model {
    let stage_time = || div(var("delay_time"), num(3.0));
    model(
        "smth3",
        vec![
            stock("stock_1", var("initial_value"), &["flow_1"], &[]),
            stock("stock_2", var("initial_value"), &["flow_2"], &[]),
            stock("output", var("initial_value"), &["flow_3"], &[]),
            flow("flow_1", div(sub(var("input"), var("stock_1")), stage_time())),
            flow(
                "flow_2",
                div(sub(var("stock_1"), var("stock_2")), stage_time()),
            ),
            flow("flow_3", div(sub(var("stock_2"), var("output")), stage_time())),
        ],
        var("input"),
    )
}

fn delay1() -> Model {
    model(
        "delay1",
        vec![
            stock(
                "contents",
                mul(var("initial_value"), var("delay_time")),
                &["input"],
                &["output"],
            ),
            flow("output", div(var("contents"), var("delay_time"))),
        ],
        var("input"),
    )
}

fn delay3() -> Model {
    let stage_time = || div(var("delay_time"), num(3.0));
    let stage_initial = || mul(var("initial_value"), stage_time());
    model(
        "delay3",
        vec![
            stock("stock_1", stage_initial(), &["input"], &["flow_1"]),
            stock("stock_2", stage_initial(), &["flow_1"], &["flow_2"]),
            stock("stock_3", stage_initial(), &["flow_2"], &["output"]),
            flow("flow_1", div(var("stock_1"), stage_time())),
            flow("flow_2", div(var("stock_2"), stage_time())),
            flow("output", div(var("stock_3"), stage_time())),
        ],
        var("input"),
    )
}

fn trend() -> Model {
    let initial_average = div(
        var("input"),
        Expr::op2(
            BinaryOp::Add,
            num(1.0),
            mul(var("initial_value"), var("delay_time")),
        ),
    );
    model(
        "trend",
        vec![
            stock("average", initial_average, &["change_in_average"], &[]),
            flow(
                "change_in_average",
                div(sub(var("input"), var("average")), var("delay_time")),
            ),
            aux(
                "output",
                Expr::app(
                    "safediv",
                    vec![
                        sub(var("input"), var("average")),
                        mul(var("average"), var("delay_time")),
                    ],
                ),
            ),
        ],
        // the initial trend is a rate, not a level
        num(0.0),
    )
}

/// returns the stdlib model backing the builtin `name`, e.g. `smth1`
pub fn get(name: &str) -> Option<Model> {
    let model = match name {
        "delay1" => delay1(),
        "delay3" => delay3(),
        "smth1" => smth1(),
        "smth3" => smth3(),
        "trend" => trend(),
        _ => return None,
    };
    Some(model)
}

#[test]
fn test_stdlib_models() {
    for name in MODEL_NAMES.iter() {
        let model = get(name).unwrap();
        assert_eq!(format!("stdlib·{}", name), model.name);
        let idents: Vec<&str> = model.variables.iter().map(|v| v.get_ident()).collect();
        for input in stdlib_args(name).unwrap() {
            assert!(idents.contains(input), "{} missing {}", name, input);
        }
        assert!(idents.contains(&"output"), "{} missing output", name);
    }
    assert!(get("smth9").is_none());
    assert!(stdlib_args("abs").is_none());
}
