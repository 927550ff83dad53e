// Copyright 2026 The Simlin Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::mem;

use crate::builtins_visitor::instantiate_implicit_modules;
use crate::common::{Error, Ident, Result};
use crate::project::MAIN_MODEL;
use crate::variable::{ModuleInputSrc, Variable, parse_var};
use crate::{datamodel, model_err};

#[derive(Clone, PartialEq, Debug)]
pub struct Model {
    pub name: String,
    pub variables: BTreeMap<Ident, Variable>,
    /// idents of the Module variables
    pub modules: BTreeSet<Ident>,
    /// idents of the variables backed by a lookup table
    pub tables: BTreeSet<Ident>,
    /// per module: input name in the sub-model -> symbolic reference
    /// in this model, where a leading '.' marks an absolute path
    pub sym_refs: BTreeMap<Ident, BTreeMap<Ident, String>>,
    /// per module: the root paths (without the leading '.') read by
    /// absolute references anywhere in its subtree
    pub abs_srcs: BTreeMap<Ident, BTreeSet<Ident>>,
    pub sim_specs: Option<datamodel::SimSpecs>,
    pub dt_deps: HashMap<Ident, BTreeSet<Ident>>,
    pub initial_deps: HashMap<Ident, BTreeSet<Ident>>,
    /// implicit is true if this model was implicitly added to the project
    /// by virtue of it being in the stdlib
    pub implicit: bool,
}

// splits "module.rest" into ("module", Some("rest"))
fn split_dep(dep: &str) -> (&str, Option<&str>) {
    match dep.find('.') {
        Some(pos) => (&dep[..pos], Some(&dep[pos + 1..])),
        None => (dep, None),
    }
}

// a reference into a module (e.g. "submodel.output") is a dependency on
// the module itself, unless the referenced variable is a stock and we
// aren't computing initial values.
fn module_deps<'a>(
    output_ident: &str,
    module_ident: &'a str,
    model_name: &str,
    is_initial: bool,
    models: &HashMap<Ident, &Model>,
) -> Result<Option<&'a str>> {
    let model = match models.get(model_name) {
        Some(model) => model,
        None => return model_err!(BadModelName, model_name.to_owned()),
    };

    let (output_ident, _) = split_dep(output_ident);
    match model.variables.get(output_ident) {
        None => model_err!(
            UnknownDependency,
            format!("{}.{}", module_ident, output_ident)
        ),
        Some(var) if var.is_stock() && !is_initial => Ok(None),
        Some(_) => Ok(Some(module_ident)),
    }
}

// to ensure we sort the list of variables in O(n*log(n)) time, we
// need to iterate over the set of variables we have and compute
// their recursive dependencies.
pub(crate) fn all_deps<'a, Iter>(
    vars: Iter,
    is_initial: bool,
    models: &HashMap<Ident, &Model>,
) -> Result<HashMap<Ident, BTreeSet<Ident>>>
where
    Iter: Iterator<Item = &'a Variable>,
{
    let vars = vars.collect::<Vec<_>>();
    let mut processing: BTreeSet<&'a str> = BTreeSet::new();
    let all_vars: HashMap<&'a str, &'a Variable> =
        vars.iter().map(|v| (v.ident(), *v)).collect();
    let mut all_var_deps: HashMap<&'a str, Option<BTreeSet<Ident>>> =
        vars.iter().map(|v| (v.ident(), None)).collect();

    fn all_deps_inner<'a>(
        id: &'a str,
        is_initial: bool,
        processing: &mut BTreeSet<&'a str>,
        all_vars: &HashMap<&'a str, &'a Variable>,
        all_var_deps: &mut HashMap<&'a str, Option<BTreeSet<Ident>>>,
        models: &HashMap<Ident, &Model>,
    ) -> Result<()> {
        let var = all_vars[id];

        // short circuit if we've already figured this out
        if matches!(all_var_deps.get(id), Some(Some(_))) {
            return Ok(());
        }

        // dependency chains break at stocks, as we use their value from the
        // last dt timestep.  BUT if we are calculating dependencies in the
        // initial dt, then we need to treat stocks as ordinary variables.
        if var.is_stock() && !is_initial {
            all_var_deps.insert(id, Some(BTreeSet::new()));
            return Ok(());
        }

        processing.insert(id);

        // all deps start out as the direct deps
        let mut all_deps: BTreeSet<Ident> = BTreeSet::new();

        for dep in var.direct_deps().iter() {
            let dep: &'a str = match split_dep(dep) {
                (module_ident, Some(output_ident)) => {
                    let (module_ident, module_var) = match all_vars.get_key_value(module_ident) {
                        Some((ident, var)) => (*ident, *var),
                        None => return model_err!(UnknownDependency, format!("{}: {}", id, dep)),
                    };
                    let model_name = match module_var {
                        Variable::Module { model_name, .. } => model_name,
                        _ => return model_err!(UnknownDependency, format!("{}: {}", id, dep)),
                    };
                    match module_deps(output_ident, module_ident, model_name, is_initial, models)? {
                        Some(module_ident) => module_ident,
                        None => continue,
                    }
                }
                (dep, None) => match all_vars.get_key_value(dep) {
                    Some((ident, _)) => *ident,
                    None => return model_err!(UnknownDependency, format!("{}: {}", id, dep)),
                },
            };

            if !all_vars[dep].is_stock() || is_initial {
                all_deps.insert(dep.to_string());

                // ensure we don't blow the stack
                if processing.contains(dep) {
                    return model_err!(CircularDependency, id.to_owned());
                }

                if let Some(None) = all_var_deps.get(dep) {
                    all_deps_inner(dep, is_initial, processing, all_vars, all_var_deps, models)?;
                }

                if let Some(Some(dep_deps)) = all_var_deps.get(dep) {
                    all_deps.extend(dep_deps.iter().cloned());
                }
            }
        }

        processing.remove(id);

        all_var_deps.insert(id, Some(all_deps));

        Ok(())
    }

    for var in vars {
        all_deps_inner(
            var.ident(),
            is_initial,
            &mut processing,
            &all_vars,
            &mut all_var_deps,
            models,
        )?;
    }

    // every entry was filled in by the full iteration over vars directly above
    let var_deps: HashMap<Ident, BTreeSet<Ident>> = all_var_deps
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.unwrap_or_default()))
        .collect();

    Ok(var_deps)
}

fn insert_var(variables: &mut BTreeMap<Ident, Variable>, var: Variable) -> Result<()> {
    let ident = var.ident().to_owned();
    if variables.contains_key(&ident) {
        return model_err!(DuplicateIdentifier, ident);
    }
    variables.insert(ident, var);
    Ok(())
}

impl Model {
    pub fn new(x_model: &datamodel::Model, implicit: bool) -> Result<Self> {
        let mut variables: BTreeMap<Ident, Variable> = BTreeMap::new();
        for x_var in x_model.variables.iter() {
            let var =
                parse_var(x_var).map_err(|err| Error::from_equation(x_var.get_ident(), err))?;
            insert_var(&mut variables, var)?;
        }

        // rewrite stateful builtin calls only once every declared
        // variable is registered, then merge what that synthesized.
        let mut implicit_vars: Vec<datamodel::Variable> = Vec::new();
        for (ident, var) in variables.iter_mut() {
            if let Some(ast) = var.ast_mut() {
                let (new_ast, mut new_vars) = instantiate_implicit_modules(ident, mem::take(ast))
                    .map_err(|err| Error::from_equation(ident, err))?;
                *ast = new_ast;
                implicit_vars.append(&mut new_vars);
            }
        }
        for x_var in implicit_vars.iter() {
            let var =
                parse_var(x_var).map_err(|err| Error::from_equation(x_var.get_ident(), err))?;
            insert_var(&mut variables, var)?;
        }

        for var in variables.values_mut() {
            var.update_deps();
        }

        for var in variables.values() {
            if let Variable::Stock {
                ident,
                inflows,
                outflows,
                ..
            } = var
            {
                for flow in inflows.iter().chain(outflows.iter()) {
                    if !variables.contains_key(flow) {
                        return model_err!(UnknownDependency, format!("{}: {}", ident, flow));
                    }
                }
            }
        }

        let mut model = Model {
            name: x_model.name.clone(),
            variables,
            modules: BTreeSet::new(),
            tables: BTreeSet::new(),
            sim_specs: x_model.sim_specs.clone(),
            sym_refs: BTreeMap::new(),
            abs_srcs: BTreeMap::new(),
            dt_deps: HashMap::new(),
            initial_deps: HashMap::new(),
            implicit,
        };
        model.update_refs();

        tracing::debug!(
            model = %model.name,
            variables = model.variables.len(),
            modules = model.modules.len(),
            tables = model.tables.len(),
            "built model"
        );

        Ok(model)
    }

    /// Recomputes the module and table indexes and each module's
    /// symbolic input references.  Must run after anything adds
    /// variables to the model.
    pub fn update_refs(&mut self) {
        self.modules = self
            .variables
            .values()
            .filter(|v| v.is_module())
            .map(|v| v.ident().to_owned())
            .collect();
        self.tables = self
            .variables
            .values()
            .filter(|v| v.table().is_some())
            .map(|v| v.ident().to_owned())
            .collect();
        self.sym_refs = self
            .variables
            .values()
            .filter_map(|v| match v {
                Variable::Module { ident, inputs, .. } => {
                    let refs = inputs
                        .iter()
                        .map(|input| (input.dst.clone(), input.src.path()))
                        .collect();
                    Some((ident.clone(), refs))
                }
                _ => None,
            })
            .collect();
    }

    /// the names of the models this model instantiates as modules
    pub fn model_deps(&self) -> BTreeSet<Ident> {
        self.variables
            .values()
            .filter_map(|v| match v {
                Variable::Module { model_name, .. } => Some(model_name.clone()),
                _ => None,
            })
            .collect()
    }

    // whether an absolute path names something at the root that
    // dependency ordering can see.  Anything else reads as NaN at
    // runtime rather than failing the build.
    fn is_root_path(&self, path: &str, models: &HashMap<Ident, &Model>) -> bool {
        let (head, rest) = split_dep(path);
        match (self.variables.get(head), rest) {
            (Some(_), None) => true,
            (Some(Variable::Module { model_name, .. }), Some(rest)) => {
                let (output, _) = split_dep(rest);
                models
                    .get(model_name)
                    .is_some_and(|model| model.variables.contains_key(output))
            }
            _ => false,
        }
    }

    pub fn set_dependencies(&mut self, models: &HashMap<Ident, &Model>) -> Result<()> {
        let mut abs_srcs: BTreeMap<Ident, BTreeSet<Ident>> = BTreeMap::new();
        for var in self.variables.values() {
            if let Variable::Module {
                ident,
                model_name,
                inputs,
                ..
            } = var
            {
                let model = match models.get(model_name) {
                    Some(model) => model,
                    None => return model_err!(BadModelName, model_name.clone()),
                };
                for input in inputs.iter() {
                    if !model.variables.contains_key(&input.dst) {
                        return model_err!(
                            BadModuleInputDst,
                            format!("{}.{}", ident, input.dst)
                        );
                    }
                }

                // sub-models were compiled first, so theirs are complete
                let mut srcs: BTreeSet<Ident> =
                    model.abs_srcs.values().flatten().cloned().collect();
                srcs.extend(inputs.iter().filter_map(|input| match &input.src {
                    ModuleInputSrc::Absolute(src) => Some(src.clone()),
                    ModuleInputSrc::Relative(_) => None,
                }));
                abs_srcs.insert(ident.clone(), srcs);
            }
        }

        // absolute references always resolve at the root, so only there
        // do they become ordering constraints.  A module reading back
        // into its own subtree can't be ordered at module granularity.
        if self.name == MAIN_MODEL {
            let root_deps: Vec<(Ident, Vec<Ident>)> = abs_srcs
                .iter()
                .map(|(ident, srcs)| {
                    let deps = srcs
                        .iter()
                        .filter(|src| split_dep(src).0 != ident.as_str())
                        .filter(|src| self.is_root_path(src, models))
                        .cloned()
                        .collect();
                    (ident.clone(), deps)
                })
                .collect();
            for (ident, deps) in root_deps.into_iter() {
                if let Some(var) = self.variables.get_mut(&ident) {
                    var.add_module_deps(deps);
                }
            }
        }
        self.abs_srcs = abs_srcs;

        self.dt_deps = all_deps(self.variables.values(), false, models)?;
        self.initial_deps = all_deps(self.variables.values(), true, models)?;

        Ok(())
    }
}

#[cfg(test)]
use crate::testutils::{x_aux, x_flow, x_model, x_module, x_stock};

#[cfg(test)]
use crate::ast::{BinaryOp, Expr};

#[cfg(test)]
fn build(model: &datamodel::Model) -> Result<Model> {
    let mut model = Model::new(model, false)?;
    let stdlib: Vec<Model> = crate::stdlib::MODEL_NAMES
        .iter()
        .filter_map(|name| crate::stdlib::get(name))
        .map(|m| Model::new(&m, true).unwrap())
        .collect();
    let models: HashMap<Ident, &Model> = stdlib.iter().map(|m| (m.name.clone(), m)).collect();
    model.set_dependencies(&models)?;
    Ok(model)
}

#[test]
fn test_all_deps() {
    let model = build(&x_model(
        "main",
        vec![
            x_stock("stock", Expr::num(10.0), &["inflow"], &[]),
            x_flow(
                "inflow",
                Expr::op2(BinaryOp::Mul, Expr::var("stock"), Expr::var("rate")),
            ),
            x_aux(
                "rate",
                Expr::op2(BinaryOp::Div, Expr::var("base"), Expr::num(2.0)),
            ),
            x_aux("base", Expr::num(0.5)),
        ],
    ))
    .unwrap();

    let set = |ids: &[&str]| -> BTreeSet<Ident> { ids.iter().map(|s| s.to_string()).collect() };
    assert_eq!(set(&["base", "rate"]), model.dt_deps["inflow"]);
    assert_eq!(set(&[]), model.dt_deps["stock"]);
    assert_eq!(set(&["base"]), model.dt_deps["rate"]);
    assert_eq!(set(&[]), model.initial_deps["stock"]);
}

#[test]
fn test_duplicate_identifier() {
    let err = Model::new(
        &x_model(
            "main",
            vec![
                x_aux("Birth Rate", Expr::num(1.0)),
                x_aux("birth_rate", Expr::num(2.0)),
            ],
        ),
        false,
    )
    .unwrap_err();
    assert_eq!(crate::common::ErrorCode::DuplicateIdentifier, err.code);
    assert_eq!(Some("birth_rate".to_owned()), err.get_details());
}

#[test]
fn test_synthetic_collision() {
    // a user variable squatting on a synthetic name is caught at merge time
    let err = Model::new(
        &x_model(
            "main",
            vec![
                x_aux("x", Expr::app("smth1", vec![Expr::var("y"), Expr::num(1.0)])),
                x_aux("y", Expr::num(1.0)),
                x_aux("$·x·0·arg1", Expr::num(3.0)),
            ],
        ),
        false,
    )
    .unwrap_err();
    assert_eq!(crate::common::ErrorCode::DuplicateIdentifier, err.code);
}

#[test]
fn test_desugared_model() {
    let model = build(&x_model(
        "main",
        vec![
            x_aux(
                "smoothed",
                Expr::app("smth1", vec![Expr::var("raw"), Expr::num(3.0)]),
            ),
            x_aux("raw", Expr::var("time")),
        ],
    ))
    .unwrap();

    assert_eq!(4, model.variables.len());
    assert!(model.modules.contains("$·smoothed·0·smth1"));
    assert!(model.variables.contains_key("$·smoothed·0·arg1"));

    let set = |ids: &[&str]| -> BTreeSet<Ident> { ids.iter().map(|s| s.to_string()).collect() };
    assert_eq!(
        &set(&["$·smoothed·0·smth1.output"]),
        model.variables["smoothed"].direct_deps()
    );
    assert_eq!(
        &set(&["raw", "$·smoothed·0·arg1"]),
        model.variables["$·smoothed·0·smth1"].direct_deps()
    );

    // smth1's output is a stock, so outside of initials the chain breaks
    assert!(model.dt_deps["smoothed"].is_empty());
    assert!(model.initial_deps["smoothed"].contains("$·smoothed·0·smth1"));
    assert!(model.initial_deps["smoothed"].contains("raw"));

    let refs = &model.sym_refs["$·smoothed·0·smth1"];
    assert_eq!("raw", refs["input"]);
    assert_eq!("$·smoothed·0·arg1", refs["delay_time"]);
}

#[test]
fn test_unknown_dependency() {
    let err = build(&x_model(
        "main",
        vec![x_aux(
            "a",
            Expr::op2(BinaryOp::Add, Expr::var("b"), Expr::num(1.0)),
        )],
    ))
    .unwrap_err();
    assert_eq!(crate::common::ErrorCode::UnknownDependency, err.code);

    let err = Model::new(
        &x_model(
            "main",
            vec![x_stock("s", Expr::num(1.0), &["missing_flow"], &[])],
        ),
        false,
    )
    .unwrap_err();
    assert_eq!(crate::common::ErrorCode::UnknownDependency, err.code);
}

#[test]
fn test_circular_dependency() {
    let err = build(&x_model(
        "main",
        vec![
            x_aux("a", Expr::var("b")),
            x_aux("b", Expr::var("a")),
        ],
    ))
    .unwrap_err();
    assert_eq!(crate::common::ErrorCode::CircularDependency, err.code);

    // a loop through a module connection is a cycle too, as the
    // delay's output is not a stock
    let err = build(&x_model(
        "main",
        vec![
            x_aux("a", Expr::var("m.output")),
            x_module("m", "stdlib·delay1", &[("a", "m.input")]),
        ],
    ))
    .unwrap_err();
    assert_eq!(crate::common::ErrorCode::CircularDependency, err.code);
}

#[test]
fn test_bad_module_input() {
    let err = build(&x_model(
        "main",
        vec![
            x_aux("a", Expr::num(1.0)),
            x_module("m", "stdlib·smth1", &[("a", "m.no_such_input")]),
        ],
    ))
    .unwrap_err();
    assert_eq!(crate::common::ErrorCode::BadModuleInputDst, err.code);

    let err = build(&x_model(
        "main",
        vec![x_module("m", "no_such_model", &[])],
    ))
    .unwrap_err();
    assert_eq!(crate::common::ErrorCode::BadModelName, err.code);
}
