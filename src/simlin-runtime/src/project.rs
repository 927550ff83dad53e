// Copyright 2026 The Simlin Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use crate::common::{Ident, Result};
use crate::model::Model;
use crate::{datamodel, model_err, stdlib};

pub const MAIN_MODEL: &str = "main";

/// A fully compiled project: every model it references (including the
/// stdlib models builtin calls desugar into), with dependencies
/// computed.  Construction either succeeds completely or fails with
/// the first fatal error; there is no partially built project.
#[derive(Clone, PartialEq, Debug)]
pub struct Project {
    pub name: String,
    pub sim_specs: datamodel::SimSpecs,
    pub models: HashMap<Ident, Rc<Model>>,
}

// orders models so that every model comes after the models it
// instantiates, detecting recursive instantiation along the way.
fn model_order(models: &HashMap<Ident, Model>) -> Result<Vec<Ident>> {
    fn add(
        models: &HashMap<Ident, Model>,
        name: &str,
        processing: &mut BTreeSet<Ident>,
        done: &mut BTreeSet<Ident>,
        result: &mut Vec<Ident>,
    ) -> Result<()> {
        if done.contains(name) {
            return Ok(());
        }
        if processing.contains(name) {
            return model_err!(CircularDependency, name.to_owned());
        }
        let model = match models.get(name) {
            Some(model) => model,
            None => return model_err!(BadModelName, name.to_owned()),
        };
        processing.insert(name.to_owned());
        for dep in model.model_deps().iter() {
            add(models, dep, processing, done, result)?;
        }
        processing.remove(name);
        done.insert(name.to_owned());
        result.push(name.to_owned());
        Ok(())
    }

    let mut names: Vec<&Ident> = models.keys().collect();
    names.sort_unstable();

    let mut processing = BTreeSet::new();
    let mut done = BTreeSet::new();
    let mut result = Vec::with_capacity(names.len());
    for name in names {
        add(models, name, &mut processing, &mut done, &mut result)?;
    }

    Ok(result)
}

impl Project {
    pub fn new(project: datamodel::Project) -> Result<Self> {
        project.sim_specs.validate()?;
        if project.get_model(MAIN_MODEL).is_none() {
            return model_err!(BadModelName, format!("no '{}' model", MAIN_MODEL));
        }

        let mut models: HashMap<Ident, Model> = HashMap::new();

        // first, pull in the models we need from the stdlib
        for name in stdlib::MODEL_NAMES.iter() {
            if let Some(x_model) = stdlib::get(name) {
                let model = Model::new(&x_model, true)?;
                models.insert(model.name.clone(), model);
            }
        }

        for x_model in project.models.iter() {
            if models.contains_key(&x_model.name) {
                return model_err!(DuplicateIdentifier, x_model.name.clone());
            }
            if let Some(sim_specs) = &x_model.sim_specs {
                sim_specs.validate()?;
            }
            let model = Model::new(x_model, false)?;
            models.insert(model.name.clone(), model);
        }

        for name in model_order(&models)? {
            let mut model = match models.remove(&name) {
                Some(model) => model,
                None => return model_err!(BadModelName, name),
            };
            {
                let model_refs: HashMap<Ident, &Model> =
                    models.iter().map(|(k, m)| (k.clone(), m)).collect();
                model.set_dependencies(&model_refs)?;
            }
            models.insert(name, model);
        }

        let models = models
            .into_iter()
            .map(|(name, m)| (name, Rc::new(m)))
            .collect();

        Ok(Project {
            name: project.name,
            sim_specs: project.sim_specs,
            models,
        })
    }

    pub fn main_model(&self) -> Option<&Rc<Model>> {
        self.models.get(MAIN_MODEL)
    }

    /// the time specs of a run: the root model's, falling back to the
    /// project-wide specs
    pub fn run_specs(&self) -> &datamodel::SimSpecs {
        self.main_model()
            .and_then(|model| model.sim_specs.as_ref())
            .unwrap_or(&self.sim_specs)
    }
}

#[cfg(test)]
use crate::ast::Expr;
#[cfg(test)]
use crate::common::ErrorCode;
#[cfg(test)]
use crate::testutils::{x_aux, x_model, x_module, x_project, x_specs};

#[test]
fn test_project_models() {
    let project = Project::new(x_project(
        x_specs(0.0, 10.0, 1.0, 1.0),
        vec![
            x_model(
                "main",
                vec![
                    x_aux("a", Expr::app("smth3", vec![Expr::var("b"), Expr::var("b")])),
                    x_aux("b", Expr::num(2.0)),
                    x_module("sub", "child", &[("b", "sub.input")]),
                ],
            ),
            x_model("child", vec![x_aux("input", Expr::num(0.0))]),
        ],
    ))
    .unwrap();

    for name in ["main", "child", "stdlib·smth1", "stdlib·smth3", "stdlib·trend"] {
        assert!(project.models.contains_key(name), "missing {}", name);
    }
    assert!(project.models["stdlib·smth3"].implicit);
    assert!(!project.models["main"].implicit);
    assert_eq!(10.0, project.run_specs().stop);
}

#[test]
fn test_model_sim_specs_override() {
    let mut main = x_model("main", vec![x_aux("a", Expr::num(1.0))]);
    main.sim_specs = Some(x_specs(5.0, 6.0, 0.5, 0.5));
    let project = Project::new(x_project(x_specs(0.0, 10.0, 1.0, 1.0), vec![main])).unwrap();
    assert_eq!(5.0, project.run_specs().start);
}

#[test]
fn test_project_errors() {
    let specs = || x_specs(0.0, 10.0, 1.0, 1.0);

    let err = Project::new(x_project(specs(), vec![x_model("other", vec![])])).unwrap_err();
    assert_eq!(ErrorCode::BadModelName, err.code);

    let err = Project::new(x_project(
        specs(),
        vec![
            x_model("main", vec![x_module("a", "a", &[])]),
            x_model("a", vec![x_module("b", "b", &[])]),
            x_model("b", vec![x_module("a", "a", &[])]),
        ],
    ))
    .unwrap_err();
    assert_eq!(ErrorCode::CircularDependency, err.code);

    let err = Project::new(x_project(
        specs(),
        vec![
            x_model("main", vec![x_module("a", "missing", &[])]),
        ],
    ))
    .unwrap_err();
    assert_eq!(ErrorCode::BadModelName, err.code);

    let err = Project::new(x_project(
        specs(),
        vec![x_model("main", vec![]), x_model("main", vec![])],
    ))
    .unwrap_err();
    assert_eq!(ErrorCode::DuplicateIdentifier, err.code);

    // a fatal error in any model fails the whole project
    let err = Project::new(x_project(
        specs(),
        vec![
            x_model("main", vec![]),
            x_model(
                "unused",
                vec![x_aux("bad", Expr::app("no_such_fn", vec![]))],
            ),
        ],
    ))
    .unwrap_err();
    assert_eq!(ErrorCode::UnknownBuiltin, err.code);

    let err = Project::new(x_project(x_specs(0.0, 10.0, -1.0, 1.0), vec![])).unwrap_err();
    assert_eq!(ErrorCode::BadSimSpecs, err.code);
}

#[test]
fn test_absolute_inputs_order_root_modules() {
    use crate::ast::BinaryOp;

    let project = Project::new(x_project(
        x_specs(0.0, 10.0, 1.0, 1.0),
        vec![
            x_model(
                "main",
                vec![
                    x_aux("x", Expr::op2(BinaryOp::Add, Expr::var("time"), Expr::num(5.0))),
                    x_module("a_mod", "outer", &[]),
                ],
            ),
            x_model(
                "outer",
                vec![
                    x_module("inner", "leaf", &[(".x", "inner.input"), (".nope", "inner.other")]),
                ],
            ),
            x_model(
                "leaf",
                vec![
                    x_aux("input", Expr::num(0.0)),
                    x_aux("other", Expr::num(0.0)),
                ],
            ),
        ],
    ))
    .unwrap();

    let outer = &project.models["outer"];
    let srcs: Vec<&str> = outer.abs_srcs["inner"].iter().map(|s| s.as_str()).collect();
    assert_eq!(vec!["nope", "x"], srcs);
    // only the root turns them into ordering constraints
    assert!(outer.variables["inner"].direct_deps().is_empty());

    let main = &project.models["main"];
    assert!(main.variables["a_mod"].direct_deps().contains("x"));
    assert!(!main.variables["a_mod"].direct_deps().contains("nope"));
    assert!(main.initial_deps["a_mod"].contains("x"));
    assert!(main.dt_deps["a_mod"].contains("x"));
}

#[test]
fn test_absolute_input_cycle() {
    let err = Project::new(x_project(
        x_specs(0.0, 10.0, 1.0, 1.0),
        vec![
            x_model(
                "main",
                vec![
                    x_aux("x", Expr::var("m.output")),
                    x_module("m", "child", &[(".x", "m.input")]),
                ],
            ),
            x_model(
                "child",
                vec![
                    x_aux("input", Expr::num(0.0)),
                    x_aux("output", Expr::var("input")),
                ],
            ),
        ],
    ))
    .unwrap_err();
    assert_eq!(ErrorCode::CircularDependency, err.code);
}
