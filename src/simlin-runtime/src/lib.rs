// Copyright 2026 The Simlin Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

#![forbid(unsafe_code)]

#[macro_use]
pub mod common;
pub mod ast;
pub mod builtins;
mod builtins_visitor;
pub mod datamodel;
pub mod model;
pub mod project;
pub mod protocol;
pub mod sim;
pub mod stdlib;
pub mod variable;

#[cfg(test)]
mod sim_proptest;
#[cfg(test)]
mod testutils;

pub use self::common::{Error, ErrorCode, ErrorKind, Ident, Result, canonicalize};
pub use self::project::Project;
pub use self::protocol::{Command, Engine};
pub use self::sim::{Series, Simulation};

/// Deserializes a project from JSON and compiles it into a runnable
/// simulation.
pub fn compile_json(json: &str) -> Result<Simulation> {
    let project: datamodel::Project = match serde_json::from_str(json) {
        Ok(project) => project,
        Err(err) => {
            return Err(Error::new(
                ErrorKind::Model,
                ErrorCode::Generic,
                Some(format!("invalid project: {}", err)),
            ));
        }
    };
    let project = Project::new(project)?;
    Simulation::new(&project)
}
