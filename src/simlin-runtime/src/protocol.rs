// Copyright 2026 The Simlin Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! The command protocol a host uses to drive a simulation.  Requests
//! are JSON arrays of the form `[id, command, ...args]` and every
//! request gets exactly one response, `[id, [result, error]]`, where
//! `error` is null unless the command failed.

use serde_json::{Map, Value, json};

use crate::common::{Error, ErrorKind, Ident, Result};
use crate::protocol_err;
use crate::sim::Simulation;

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Reset,
    SetVal(Ident, f64),
    GetVal(Vec<Ident>),
    GetSeries(Vec<Ident>),
    RunTo(f64),
    RunToEnd,
    SetDesiredSeries(Vec<Ident>),
}

fn names(args: &[Value]) -> Option<Vec<Ident>> {
    args.iter()
        .map(|arg| arg.as_str().map(|s| s.to_owned()))
        .collect()
}

impl Command {
    /// Parses a command and its arguments.  `Ok(None)` means the
    /// command is known but its arguments can't produce a result.
    pub fn parse(cmd: &str, args: &[Value]) -> Result<Option<Command>> {
        let command = match cmd {
            "reset" => Some(Command::Reset),
            "set_val" => match args {
                [name, value, ..] => match (name.as_str(), value.as_f64()) {
                    (Some(name), Some(value)) => Some(Command::SetVal(name.to_owned(), value)),
                    _ => None,
                },
                _ => None,
            },
            "get_val" => names(args).map(Command::GetVal),
            "get_series" => names(args).map(Command::GetSeries),
            "run_to" => args.first().and_then(|t| t.as_f64()).map(Command::RunTo),
            "run_to_end" => Some(Command::RunToEnd),
            "set_desired_series" => match args.first() {
                Some(Value::Array(list)) => names(list).map(Command::SetDesiredSeries),
                // a bare list of names is accepted too
                Some(Value::String(_)) => names(args).map(Command::SetDesiredSeries),
                _ => None,
            },
            _ => return protocol_err!(UnknownCommand, format!("unknown command \"{}\"", cmd)),
        };

        Ok(command)
    }
}

// renders a request the way it appears in "no result for [...]" errors
fn describe(request: &Value) -> String {
    let render = |v: &Value| match v {
        Value::String(s) => s.clone(),
        _ => v.to_string(),
    };
    match request {
        Value::Array(parts) => parts.iter().map(render).collect::<Vec<_>>().join(", "),
        _ => render(request),
    }
}

fn error_message(err: &Error) -> String {
    match (err.kind, err.get_details()) {
        (ErrorKind::Protocol, Some(details)) => details,
        _ => err.to_string(),
    }
}

/// A simulation plus the per-session state the protocol needs.
#[derive(Debug)]
pub struct Engine {
    sim: Simulation,
    desired_series: Option<Vec<Ident>>,
}

impl Engine {
    pub fn new(sim: Simulation) -> Self {
        Engine {
            sim,
            desired_series: None,
        }
    }

    pub fn simulation(&self) -> &Simulation {
        &self.sim
    }

    pub fn desired_series(&self) -> Option<&[Ident]> {
        self.desired_series.as_deref()
    }

    fn series_map(&self, names: &[Ident]) -> Value {
        let mut result = Map::new();
        for name in names.iter() {
            let series = match self.sim.series(name) {
                Some(series) => json!(series),
                None => Value::Null,
            };
            result.insert(name.clone(), series);
        }
        Value::Object(result)
    }

    pub fn execute(&mut self, command: Command) -> Result<Value> {
        let result = match command {
            Command::Reset => {
                self.sim.reset();
                json!("ok")
            }
            Command::SetVal(name, value) => {
                self.sim.set_value(&name, value)?;
                json!("ok")
            }
            Command::GetVal(names) => {
                let mut result = Map::new();
                for name in names.into_iter() {
                    let value = json!(self.sim.value(&name));
                    result.insert(name, value);
                }
                Value::Object(result)
            }
            Command::GetSeries(names) => self.series_map(&names),
            Command::RunTo(time) => json!(self.sim.run_to(time)),
            Command::RunToEnd => {
                let time = self.sim.run_to_end();
                match &self.desired_series {
                    Some(names) => self.series_map(names),
                    None => json!(time),
                }
            }
            Command::SetDesiredSeries(names) => {
                self.desired_series = Some(names);
                json!("ok")
            }
        };

        Ok(result)
    }

    /// handles one `[id, command, ...args]` request, always producing
    /// a `[id, [result, error]]` response
    pub fn handle(&mut self, request: &Value) -> Value {
        let (id, cmd, args) = match request.as_array() {
            Some(parts) if parts.len() >= 2 => (parts[0].clone(), &parts[1], &parts[2..]),
            Some(parts) => {
                let id = parts.first().cloned().unwrap_or(Value::Null);
                let msg = format!("no result for [{}]", describe(request));
                return json!([id, [null, msg]]);
            }
            None => {
                let msg = format!("no result for [{}]", describe(request));
                return json!([null, [null, msg]]);
            }
        };

        let result = match cmd.as_str() {
            Some(cmd) => Command::parse(cmd, args),
            None => protocol_err!(UnknownCommand, format!("unknown command \"{}\"", cmd)),
        };
        let result = result.and_then(|command| match command {
            Some(command) => {
                tracing::debug!(?command, "handling command");
                self.execute(command)
            }
            None => protocol_err!(
                MalformedResult,
                format!("no result for [{}]", describe(request))
            ),
        });

        match result {
            Ok(result) => json!([id, [result, null]]),
            Err(err) => {
                tracing::warn!(error = %err, "command failed");
                json!([id, [null, error_message(&err)]])
            }
        }
    }
}

#[cfg(test)]
use crate::ast::{BinaryOp, Expr};
#[cfg(test)]
use crate::project::Project;
#[cfg(test)]
use crate::testutils::{x_aux, x_flow, x_model, x_project, x_specs, x_stock};

#[cfg(test)]
fn engine() -> Engine {
    let project = Project::new(x_project(
        x_specs(0.0, 2.0, 0.5, 1.0),
        vec![x_model(
            "main",
            vec![
                x_aux("rate", Expr::num(2.0)),
                x_stock("stock", Expr::num(1.0), &["inflow"], &[]),
                x_flow(
                    "inflow",
                    Expr::op2(BinaryOp::Mul, Expr::var("rate"), Expr::num(1.0)),
                ),
            ],
        )],
    ))
    .unwrap();
    Engine::new(Simulation::new(&project).unwrap())
}

#[test]
fn test_basic_commands() {
    let mut engine = engine();

    assert_eq!(json!([1, ["ok", null]]), engine.handle(&json!([1, "reset"])));
    assert_eq!(
        json!([2, [{"stock": 1.0, "missing": null}, null]]),
        engine.handle(&json!([2, "get_val", "stock", "missing"]))
    );
    assert_eq!(
        json!([3, ["ok", null]]),
        engine.handle(&json!([3, "set_val", "rate", 4.0]))
    );
    assert_eq!(json!([4, [0.5, null]]), engine.handle(&json!([4, "run_to", 0.0])));
    assert_eq!(
        json!([5, [{"stock": {"name": "stock", "time": [], "values": []}}, null]]),
        engine.handle(&json!([5, "get_series", "stock"]))
    );
    assert_eq!(json!([6, [1.0, null]]), engine.handle(&json!([6, "run_to", 0.5])));
    assert_eq!(
        json!([7, [{"stock": {"name": "stock", "time": [0.0], "values": [1.0]}}, null]]),
        engine.handle(&json!([7, "get_series", "stock"]))
    );
}

#[test]
fn test_run_to_end() {
    let mut engine = engine();
    assert_eq!(json!([1, [3.0, null]]), engine.handle(&json!([1, "run_to_end"])));

    engine.handle(&json!([2, "reset"]));
    assert_eq!(
        json!([3, ["ok", null]]),
        engine.handle(&json!([3, "set_desired_series", ["stock"]]))
    );
    assert_eq!(Some(&["stock".to_owned()][..]), engine.desired_series());
    assert_eq!(
        json!([4, [{"stock": {"name": "stock", "time": [0.0, 1.0, 2.0], "values": [1.0, 3.0, 5.0]}}, null]]),
        engine.handle(&json!([4, "run_to_end"]))
    );
}

#[test]
fn test_errors() {
    let mut engine = engine();
    assert_eq!(
        json!([1, [null, "unknown command \"frobnicate\""]]),
        engine.handle(&json!([1, "frobnicate"]))
    );
    assert_eq!(
        json!([2, [null, "no result for [2, run_to, soon]"]]),
        engine.handle(&json!([2, "run_to", "soon"]))
    );
    assert_eq!(
        json!([null, [null, "no result for [oops]"]]),
        engine.handle(&json!("oops"))
    );

    engine.handle(&json!([3, "run_to", 1.0]));
    let response = engine.handle(&json!([4, "set_val", "rate", 1.0]));
    assert_eq!(json!(4), response[0]);
    assert!(response[1][0].is_null());
    let msg = response[1][1].as_str().unwrap();
    assert!(msg.contains("already_stepped"), "{}", msg);
}
