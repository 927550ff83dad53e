// Copyright 2026 The Simlin Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use float_cmp::approx_eq;
use rand::seq::SliceRandom;
use serde_json::{Value, json};

use simlin_runtime::datamodel;
use simlin_runtime::{ErrorCode, Project, Simulation, compile_json};

fn specs(start: f64, stop: f64, dt: f64, save_step: f64) -> Value {
    json!({"start": start, "stop": stop, "dt": dt, "save_step": save_step})
}

fn project(sim_specs: Value, models: Value) -> String {
    json!({"name": "test", "sim_specs": sim_specs, "models": models}).to_string()
}

fn var(id: &str) -> Value {
    json!({"var": id})
}

fn num(n: f64) -> Value {
    json!({"const": [format!("{}", n), n]})
}

fn op2(op: &str, l: Value, r: Value) -> Value {
    json!({"op2": [op, l, r]})
}

fn app(func: &str, args: Vec<Value>) -> Value {
    json!({"app": [func, args]})
}

fn compile(json: &str) -> Simulation {
    match compile_json(json) {
        Ok(sim) => sim,
        Err(err) => panic!("compile failed: {}", err),
    }
}

fn assert_series(expected: &[f64], sim: &Simulation, name: &str) {
    let series = sim.series(name).unwrap();
    assert_eq!(expected.len(), series.values.len(), "{}: {:?}", name, series.values);
    for (i, (expected, actual)) in expected.iter().zip(series.values.iter()).enumerate() {
        assert!(
            approx_eq!(f64, *expected, *actual, epsilon = 1e-9),
            "{}[{}]: expected {} got {}",
            name,
            i,
            expected,
            actual
        );
    }
}

fn population_model() -> Value {
    json!([{
        "name": "main",
        "variables": [
            {"type": "stock", "ident": "Population", "equation": "100", "inflows": ["births"]},
            {"type": "flow", "ident": "Births", "ast": op2("mul", var("population"), var("birth_rate"))},
            {"type": "aux", "ident": "Birth Rate", "equation": "0.5"}
        ]
    }])
}

#[test]
fn decimates_saved_rows() {
    let mut sim = compile(&project(specs(0.0, 3.0, 0.25, 1.0), population_model()));
    assert_eq!(4, sim.save_every());
    assert_eq!(4, sim.n_save_steps());

    sim.run_to_end();
    assert_eq!(sim.n_save_steps(), sim.step_num() / sim.save_every());

    let series = sim.series("population").unwrap();
    assert_eq!(vec![0.0, 1.0, 2.0, 3.0], series.time);

    // 4 quarter-steps of 12.5% growth per saved row
    let per_row = 1.125f64.powi(4);
    let expected: Vec<f64> = (0..4).map(|i| 100.0 * per_row.powi(i)).collect();
    assert_series(&expected, &sim, "population");
}

#[test]
fn reset_round_trips_bit_identical() {
    let mut sim = compile(&project(specs(0.0, 20.0, 0.125, 0.5), population_model()));
    sim.run_to_end();
    let first = sim.series("births").unwrap();

    sim.reset();
    sim.run_to_end();
    let second = sim.series("births").unwrap();

    assert_eq!(41, first.values.len());
    let bits = |v: &[f64]| v.iter().map(|n| n.to_bits()).collect::<Vec<_>>();
    assert_eq!(bits(&first.values), bits(&second.values));
}

#[test]
fn model_specs_override_project_specs() {
    let models = json!([{
        "name": "main",
        "sim_specs": specs(10.0, 12.0, 1.0, 1.0),
        "variables": [{"type": "aux", "ident": "x", "ast": var("time")}]
    }]);
    let mut sim = compile(&project(specs(0.0, 100.0, 1.0, 1.0), models));
    sim.run_to_end();
    assert_series(&[10.0, 11.0, 12.0], &sim, "x");
}

#[test]
fn stdlib_builtins() {
    let models = json!([{
        "name": "main",
        "variables": [
            {"type": "aux", "ident": "raw", "equation": "10"},
            {"type": "aux", "ident": "delayed", "ast": app("delay1", vec![var("raw"), num(2.0)])},
            {"type": "aux", "ident": "smoothed", "ast": app("smth1", vec![var("raw"), num(2.0), num(0.0)])},
            {"type": "aux", "ident": "ramp", "ast": op2("add", var("time"), num(1.0))},
            {"type": "aux", "ident": "trending", "ast": app("trend", vec![var("ramp"), num(1.0)])}
        ]
    }]);
    let mut sim = compile(&project(specs(0.0, 3.0, 1.0, 1.0), models));
    sim.run_to_end();

    // the delay starts in equilibrium with its input
    assert_series(&[10.0, 10.0, 10.0, 10.0], &sim, "delayed");
    assert_series(&[0.0, 5.0, 7.5, 8.75], &sim, "smoothed");
    assert_series(&[0.0, 1.0, 0.5, 1.0 / 3.0], &sim, "trending");
}

#[test]
fn nested_builtin_calls() {
    let models = json!([{
        "name": "main",
        "variables": [
            {"type": "aux", "ident": "raw", "equation": "4"},
            {
                "type": "aux",
                "ident": "double",
                "ast": app("smth1", vec![app("smth1", vec![var("raw"), num(1.0), num(4.0)]), num(1.0)])
            }
        ]
    }]);
    let mut sim = compile(&project(specs(0.0, 2.0, 1.0, 1.0), models));
    sim.run_to_end();
    assert_series(&[4.0, 4.0, 4.0], &sim, "double");
    assert!(sim.lookup_offset("$·double·0·smth1.output").is_some());
    assert!(sim.lookup_offset("$·double·1·smth1.output").is_some());
}

#[test]
fn absolute_and_relative_module_inputs() {
    let models = json!([
        {
            "name": "main",
            "variables": [
                {"type": "aux", "ident": "rate", "equation": "3"},
                {"type": "module", "ident": "region", "model_name": "region"}
            ]
        },
        {
            "name": "region",
            "variables": [
                {"type": "aux", "ident": "rate", "equation": "5"},
                {
                    "type": "module", "ident": "global", "model_name": "reader",
                    "references": [{"src": ".rate", "dst": "global.input"}]
                },
                {
                    "type": "module", "ident": "local", "model_name": "reader",
                    "references": [{"src": "rate", "dst": "local.input"}]
                },
                {
                    "type": "module", "ident": "broken", "model_name": "reader",
                    "references": [{"src": ".no_such_var", "dst": "broken.input"}]
                }
            ]
        },
        {
            "name": "reader",
            "variables": [
                {"type": "aux", "ident": "input", "equation": "0"},
                {"type": "aux", "ident": "output", "ast": op2("mul", var("input"), num(10.0))}
            ]
        }
    ]);
    let mut sim = compile(&project(specs(0.0, 1.0, 1.0, 1.0), models));
    sim.run_to_end();

    assert_eq!(Some(30.0), sim.value("region.global.output"));
    assert_eq!(Some(50.0), sim.value("region.local.output"));
    // an unresolved input degrades to NaN instead of failing the run
    assert!(sim.value("region.broken.output").unwrap().is_nan());
    assert_eq!(None, sim.value("region.nope.output"));
}

#[test]
fn absolute_inputs_see_current_root_values() {
    // "a_mod" sorts before "x", so only dependency ordering puts x first
    let models = json!([
        {
            "name": "main",
            "variables": [
                {"type": "aux", "ident": "x", "ast": op2("add", var("time"), num(5.0))},
                {"type": "module", "ident": "a_mod", "model_name": "child",
                 "references": [{"src": ".x", "dst": "a_mod.input"}]},
                {"type": "module", "ident": "a_outer", "model_name": "outer"}
            ]
        },
        {
            "name": "outer",
            "variables": [
                {"type": "module", "ident": "inner", "model_name": "child",
                 "references": [{"src": ".x", "dst": "inner.input"}]}
            ]
        },
        {
            "name": "child",
            "variables": [
                {"type": "aux", "ident": "input", "equation": "0"},
                {"type": "stock", "ident": "s", "ast": var("input")},
                {"type": "aux", "ident": "out", "ast": var("input")}
            ]
        }
    ]);
    let mut sim = compile(&project(specs(0.0, 2.0, 1.0, 1.0), models));
    sim.run_to_end();

    assert_series(&[5.0, 6.0, 7.0], &sim, "x");
    for prefix in ["a_mod", "a_outer.inner"] {
        assert_series(&[5.0, 5.0, 5.0], &sim, &format!("{}.s", prefix));
        assert_series(&[5.0, 6.0, 7.0], &sim, &format!("{}.out", prefix));
    }
}

#[test]
fn graphical_functions() {
    let models = json!([{
        "name": "main",
        "variables": [
            {
                "type": "aux", "ident": "scaled",
                "gf": {"y_points": [0.0, 10.0, 20.0], "x_scale": {"min": 0.0, "max": 4.0}}
            },
            {
                "type": "aux", "ident": "invalid", "equation": "3",
                "gf": {"x_points": [2.0, 1.0], "y_points": [0.0, 10.0]}
            },
            {"type": "flow", "ident": "clamped",
             "ast": app("lookup", vec![var("scaled"), op2("sub", var("time"), num(1.0))])}
        ]
    }]);
    let mut sim = compile(&project(specs(0.0, 4.0, 1.0, 1.0), models));
    sim.run_to_end();

    assert_series(&[0.0, 5.0, 10.0, 15.0, 20.0], &sim, "scaled");
    assert_series(&[0.0, 0.0, 5.0, 10.0, 15.0], &sim, "clamped");
    // a table that fails validation falls back to its equation
    assert_series(&[3.0; 5], &sim, "invalid");
}

#[test]
fn definition_order_is_irrelevant() {
    let variables = vec![
        json!({"type": "stock", "ident": "inventory", "equation": "50", "inflows": ["production"], "outflows": ["sales"]}),
        json!({"type": "flow", "ident": "production", "ast": app("smth3", vec![var("sales"), num(3.0)])}),
        json!({"type": "flow", "ident": "sales", "ast": op2("mul", var("demand"), var("price_effect"))}),
        json!({"type": "aux", "ident": "demand", "ast": app("pulse", vec![num(5.0), num(2.0), num(3.0)])}),
        json!({"type": "aux", "ident": "price_effect", "ast": op2("div", var("inventory"), num(50.0))}),
        json!({"type": "aux", "ident": "gap", "ast": op2("sub", num(50.0), var("inventory"))}),
    ];
    let run = |variables: &[Value]| {
        let models = json!([{"name": "main", "variables": variables}]);
        let mut sim = compile(&project(specs(0.0, 12.0, 0.5, 1.0), models));
        sim.run_to_end();
        sim.series("inventory").unwrap().values
    };
    let expected = run(&variables);

    let mut rng = rand::rng();
    for _ in 0..8 {
        let mut shuffled = variables.clone();
        shuffled.shuffle(&mut rng);
        let values = run(&shuffled);
        let bits = |v: &[f64]| v.iter().map(|n| n.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&expected), bits(&values));
    }
}

#[test]
fn fatal_compile_errors() {
    let err = |models: Value| match compile_json(&project(specs(0.0, 1.0, 1.0, 1.0), models)) {
        Ok(_) => panic!("expected an error"),
        Err(err) => err,
    };

    let e = err(json!([{
        "name": "main",
        "variables": [{"type": "aux", "ident": "x", "ast": app("smth9", vec![num(1.0)])}]
    }]));
    assert_eq!(ErrorCode::UnknownBuiltin, e.code);
    assert!(e.get_details().unwrap().contains("smth9"));

    let e = err(json!([{
        "name": "main",
        "variables": [
            {"type": "aux", "ident": "x", "equation": "1"},
            {"type": "aux", "ident": "X", "equation": "2"}
        ]
    }]));
    assert_eq!(ErrorCode::DuplicateIdentifier, e.code);

    let e = err(json!([{
        "name": "main",
        "variables": [{"type": "aux", "ident": "x", "equation": "x + 1"}]
    }]));
    assert_eq!(ErrorCode::EmptyEquation, e.code);

    let e = err(json!([{"name": "main", "variables": [{"type": "aux"}]}]));
    assert_eq!(ErrorCode::Generic, e.code);
}

#[test]
fn compiles_from_datamodel() {
    let json = project(specs(0.0, 1.0, 1.0, 1.0), population_model());
    let x_project: datamodel::Project = serde_json::from_str(&json).unwrap();
    assert_eq!(Some("main"), x_project.get_model("main").map(|m| m.name.as_str()));

    let project = Project::new(x_project).unwrap();
    let sim = Simulation::new(&project).unwrap();
    assert_eq!(
        vec!["time", "birth_rate", "births", "population"],
        sim.var_names()
    );
}
