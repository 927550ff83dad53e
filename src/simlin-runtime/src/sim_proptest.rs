// Copyright 2026 The Simlin Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Property-based tests for the runtime using proptest.
//!
//! These tests verify that:
//! 1. running to the end fills every save row exactly once
//! 2. offsets are unique across the whole instance tree

use std::collections::HashSet;

use proptest::prelude::*;

use crate::ast::{BinaryOp, Expr};
use crate::datamodel;
use crate::project::Project;
use crate::sim::Simulation;
use crate::testutils::{x_aux, x_flow, x_model, x_module, x_project, x_specs, x_stock};

fn dt_strategy() -> impl Strategy<Value = f64> {
    prop_oneof![Just(1.0), Just(0.5), Just(0.25), Just(0.125), Just(0.1)]
}

// (start, stop, dt, save_step), with save_step >= dt
fn time_spec_strategy() -> impl Strategy<Value = (f64, f64, f64, f64)> {
    (
        -50i32..50,
        dt_strategy(),
        prop_oneof![
            (1usize..6).prop_map(|k| k as f64),
            (10i32..40).prop_map(|n| n as f64 / 10.0),
        ],
        0i32..200,
    )
        .prop_map(|(start, dt, save_mult, len)| {
            let start = start as f64;
            let save_step = dt * save_mult;
            let stop = start + len as f64 * dt;
            (start, stop, dt, save_step)
        })
}

fn simple_project(specs: datamodel::SimSpecs) -> datamodel::Project {
    x_project(
        specs,
        vec![x_model(
            "main",
            vec![
                x_stock("population", Expr::num(100.0), &["births"], &[]),
                x_flow(
                    "births",
                    Expr::op2(
                        BinaryOp::Mul,
                        Expr::var("population"),
                        Expr::var("birth_rate"),
                    ),
                ),
                x_aux("birth_rate", Expr::num(0.01)),
            ],
        )],
    )
}

// a chain of `depth` nested models, `n_smooth` desugared builtins in
// the root and `n_aux` plain auxes at every level
fn nested_project(n_aux: usize, n_smooth: usize, depth: usize) -> datamodel::Project {
    let mut models = vec![];
    for level in 0..depth {
        let mut vars: Vec<datamodel::Variable> = (0..n_aux)
            .map(|i| x_aux(&format!("aux_{}", i), Expr::num(i as f64)))
            .collect();
        vars.push(x_aux("input", Expr::num(0.0)));
        if level + 1 < depth {
            vars.push(x_module(
                "next",
                &format!("level_{}", level + 1),
                &[("aux_0", "next.input"), (".aux_0", "next.aux_0")],
            ));
        }
        models.push(x_model(&format!("level_{}", level), vars));
    }

    let mut main: Vec<datamodel::Variable> = (0..n_aux)
        .map(|i| x_aux(&format!("aux_{}", i), Expr::num(i as f64)))
        .collect();
    for i in 0..n_smooth {
        main.push(x_aux(
            &format!("smoothed_{}", i),
            Expr::app(
                "smth3",
                vec![
                    Expr::op2(BinaryOp::Add, Expr::var("aux_0"), Expr::num(1.0)),
                    Expr::num(2.0),
                ],
            ),
        ));
    }
    if depth > 0 {
        main.push(x_module("child", "level_0", &[("aux_0", "child.input")]));
    }
    models.push(x_model("main", main));

    x_project(x_specs(0.0, 1.0, 1.0, 1.0), models)
}

proptest! {
    #[test]
    fn run_to_end_fills_every_save_row((start, stop, dt, save_step) in time_spec_strategy()) {
        let specs = x_specs(start, stop, dt, save_step);
        prop_assume!(specs.validate().is_ok());

        let project = Project::new(simple_project(specs)).unwrap();
        let mut sim = Simulation::new(&project).unwrap();

        sim.run_to_end();
        prop_assert_eq!(sim.n_save_steps(), sim.step_num() / sim.save_every());
        prop_assert_eq!(0, sim.step_num() % sim.save_every());

        let series = sim.series("population").unwrap();
        prop_assert_eq!(sim.n_save_steps(), series.time.len());
        prop_assert_eq!(start, series.time[0]);
        for pair in series.time.windows(2) {
            prop_assert!(pair[1] > pair[0]);
        }

        // a second run after reset sees the same state
        sim.reset();
        prop_assert_eq!(0, sim.step_num());
        prop_assert_eq!(Some(start), sim.value("time"));
        prop_assert_eq!(Some(100.0), sim.value("population"));
    }

    #[test]
    fn offsets_are_injective(n_aux in 1usize..6, n_smooth in 0usize..4, depth in 0usize..4) {
        let project = Project::new(nested_project(n_aux, n_smooth, depth)).unwrap();
        let sim = Simulation::new(&project).unwrap();

        let names = sim.var_names();
        prop_assert_eq!(sim.n_vars(), names.len());

        let mut seen = HashSet::new();
        for name in names.iter() {
            let off = sim.lookup_offset(name);
            prop_assert!(off.is_some(), "{} unresolved", name);
            let off = off.unwrap();
            prop_assert!(off < sim.n_vars());
            prop_assert_eq!(name == "time", off == 0, "{} at {}", name, off);
            prop_assert!(seen.insert(off), "{} shares offset {}", name, off);
        }
    }
}
