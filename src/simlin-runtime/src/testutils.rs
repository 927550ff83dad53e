// Copyright 2026 The Simlin Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use crate::ast::{Expr, print_eqn};
use crate::datamodel::{self, GraphicalFunction, ModuleReference, SimSpecs};

fn optional_vec(slice: &[&str]) -> Vec<String> {
    slice.iter().map(|id| id.to_string()).collect()
}

pub(crate) fn x_aux(ident: &str, ast: Expr) -> datamodel::Variable {
    datamodel::Variable::Aux(datamodel::Aux {
        ident: ident.to_string(),
        equation: print_eqn(&ast),
        ast: Some(ast),
        gf: None,
    })
}

pub(crate) fn x_table(ident: &str, ast: Expr, x: &[f64], y: &[f64]) -> datamodel::Variable {
    datamodel::Variable::Aux(datamodel::Aux {
        ident: ident.to_string(),
        equation: print_eqn(&ast),
        ast: Some(ast),
        gf: Some(GraphicalFunction {
            x_points: Some(x.to_vec()),
            y_points: y.to_vec(),
            x_scale: None,
        }),
    })
}

pub(crate) fn x_flow(ident: &str, ast: Expr) -> datamodel::Variable {
    datamodel::Variable::Flow(datamodel::Flow {
        ident: ident.to_string(),
        equation: print_eqn(&ast),
        ast: Some(ast),
        gf: None,
        non_negative: false,
    })
}

pub(crate) fn x_stock(
    ident: &str,
    ast: Expr,
    inflows: &[&str],
    outflows: &[&str],
) -> datamodel::Variable {
    datamodel::Variable::Stock(datamodel::Stock {
        ident: ident.to_string(),
        equation: print_eqn(&ast),
        ast: Some(ast),
        inflows: optional_vec(inflows),
        outflows: optional_vec(outflows),
        non_negative: false,
    })
}

pub(crate) fn x_module(ident: &str, model_name: &str, refs: &[(&str, &str)]) -> datamodel::Variable {
    let references: Vec<ModuleReference> = refs
        .iter()
        .map(|(src, dst)| ModuleReference {
            src: src.to_string(),
            dst: dst.to_string(),
        })
        .collect();

    datamodel::Variable::Module(datamodel::Module {
        ident: ident.to_string(),
        model_name: model_name.to_string(),
        references,
    })
}

pub(crate) fn x_model(name: &str, variables: Vec<datamodel::Variable>) -> datamodel::Model {
    datamodel::Model {
        name: name.to_string(),
        sim_specs: None,
        variables,
    }
}

pub(crate) fn x_specs(start: f64, stop: f64, dt: f64, save_step: f64) -> SimSpecs {
    SimSpecs {
        start,
        stop,
        dt,
        save_step: Some(save_step),
    }
}

pub(crate) fn x_project(sim_specs: SimSpecs, models: Vec<datamodel::Model>) -> datamodel::Project {
    datamodel::Project {
        name: "test".to_string(),
        sim_specs,
        models,
    }
}
