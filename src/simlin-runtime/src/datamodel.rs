// Copyright 2026 The Simlin Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! The variable-definition tree handed to the compiler by an external
//! loader.  Equations arrive as already-built expression trees; the
//! `equation` strings are kept for display and for numeric literals.

use serde::{Deserialize, Serialize};

use crate::ast::Expr;
use crate::common::{Ident, Result};
use crate::sim_err;

fn is_false(b: &bool) -> bool {
    !*b
}

fn is_empty_string(s: &str) -> bool {
    s.is_empty()
}

fn is_empty_vec<T>(v: &[T]) -> bool {
    v.is_empty()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphicalFunctionScale {
    pub min: f64,
    pub max: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphicalFunction {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub x_points: Option<Vec<f64>>,
    pub y_points: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub x_scale: Option<GraphicalFunctionScale>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stock {
    pub ident: Ident,
    #[serde(skip_serializing_if = "is_empty_string", default)]
    pub equation: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ast: Option<Expr>,
    #[serde(skip_serializing_if = "is_empty_vec", default)]
    pub inflows: Vec<Ident>,
    #[serde(skip_serializing_if = "is_empty_vec", default)]
    pub outflows: Vec<Ident>,
    #[serde(skip_serializing_if = "is_false", default)]
    pub non_negative: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub ident: Ident,
    #[serde(skip_serializing_if = "is_empty_string", default)]
    pub equation: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ast: Option<Expr>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub gf: Option<GraphicalFunction>,
    #[serde(skip_serializing_if = "is_false", default)]
    pub non_negative: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Aux {
    pub ident: Ident,
    #[serde(skip_serializing_if = "is_empty_string", default)]
    pub equation: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ast: Option<Expr>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub gf: Option<GraphicalFunction>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleReference {
    pub src: String,
    pub dst: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub ident: Ident,
    pub model_name: String,
    #[serde(skip_serializing_if = "is_empty_vec", default)]
    pub references: Vec<ModuleReference>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Variable {
    Stock(Stock),
    Flow(Flow),
    Aux(Aux),
    Module(Module),
}

impl Variable {
    pub fn get_ident(&self) -> &str {
        match self {
            Variable::Stock(stock) => stock.ident.as_str(),
            Variable::Flow(flow) => flow.ident.as_str(),
            Variable::Aux(aux) => aux.ident.as_str(),
            Variable::Module(module) => module.ident.as_str(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimSpecs {
    pub start: f64,
    pub stop: f64,
    pub dt: f64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub save_step: Option<f64>,
}

impl SimSpecs {
    /// the save interval, defaulting to dt when unset or zero
    pub fn save_step(&self) -> f64 {
        match self.save_step {
            Some(save_step) if save_step != 0.0 => save_step,
            _ => self.dt,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let save_step = self.save_step();
        if !(self.start.is_finite()
            && self.stop.is_finite()
            && self.dt.is_finite()
            && save_step.is_finite())
        {
            return sim_err!(BadSimSpecs, "time specs must be finite".to_owned());
        }
        if self.dt <= 0.0 {
            return sim_err!(BadSimSpecs, format!("dt must be positive, not {}", self.dt));
        }
        if self.stop < self.start {
            return sim_err!(
                BadSimSpecs,
                format!("stop ({}) before start ({})", self.stop, self.start)
            );
        }
        if save_step < self.dt {
            return sim_err!(
                BadSimSpecs,
                format!("save_step ({}) smaller than dt ({})", save_step, self.dt)
            );
        }

        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sim_specs: Option<SimSpecs>,
    #[serde(skip_serializing_if = "is_empty_vec", default)]
    pub variables: Vec<Variable>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Project {
    #[serde(skip_serializing_if = "is_empty_string", default)]
    pub name: String,
    pub sim_specs: SimSpecs,
    pub models: Vec<Model>,
}

impl Project {
    pub fn get_model(&self, model_name: &str) -> Option<&Model> {
        self.models.iter().find(|m| m.name == model_name)
    }
}

#[test]
fn test_sim_specs_defaults() {
    let specs: SimSpecs = serde_json::from_str(r#"{"start": 0, "stop": 10, "dt": 0.25}"#).unwrap();
    assert_eq!(0.25, specs.save_step());
    assert!(specs.validate().is_ok());

    let specs = SimSpecs {
        save_step: Some(0.0),
        ..specs
    };
    assert_eq!(0.25, specs.save_step());

    let bad = vec![
        SimSpecs {
            start: 0.0,
            stop: 10.0,
            dt: 0.0,
            save_step: None,
        },
        SimSpecs {
            start: 10.0,
            stop: 0.0,
            dt: 1.0,
            save_step: None,
        },
        SimSpecs {
            start: 0.0,
            stop: 10.0,
            dt: 1.0,
            save_step: Some(0.5),
        },
        SimSpecs {
            start: 0.0,
            stop: f64::INFINITY,
            dt: 1.0,
            save_step: None,
        },
    ];
    for specs in bad {
        let err = specs.validate().unwrap_err();
        assert_eq!(crate::common::ErrorCode::BadSimSpecs, err.code);
    }
}

#[test]
fn test_variable_json() {
    let json = r#"{
        "type": "module",
        "ident": "smoothed",
        "model_name": "stdlib·smth1",
        "references": [{"src": "raw", "dst": "smoothed.input"}]
    }"#;
    let var: Variable = serde_json::from_str(json).unwrap();
    assert_eq!("smoothed", var.get_ident());
    if let Variable::Module(module) = var {
        assert_eq!(1, module.references.len());
        assert_eq!("smoothed.input", module.references[0].dst);
    } else {
        panic!("expected a module");
    }

    let json = r#"{"type": "aux", "ident": "rate", "equation": "0.1"}"#;
    let var: Variable = serde_json::from_str(json).unwrap();
    assert_eq!(
        Variable::Aux(Aux {
            ident: "rate".to_owned(),
            equation: "0.1".to_owned(),
            ast: None,
            gf: None,
        }),
        var
    );
}
