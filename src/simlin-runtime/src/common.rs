// Copyright 2026 The Simlin Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use std::fmt;
use std::{error, result};

use lazy_static::lazy_static;
use regex::Regex;

pub type Ident = String;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    NoError, // will never be produced
    DoesNotExist,
    DuplicateIdentifier,
    UnresolvedReference,
    UnknownBuiltin,
    BadBuiltinArgs,
    EmptyEquation,
    InvalidTable,
    BadModuleInputDst,
    BadModelName,
    BadSimSpecs,
    CircularDependency,
    UnknownDependency,
    NotSimulatable,
    AlreadyStepped,
    UnknownCommand,
    MalformedResult,
    Generic,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use ErrorCode::*;
        let name = match self {
            NoError => "no_error",
            DoesNotExist => "does_not_exist",
            DuplicateIdentifier => "duplicate_identifier",
            UnresolvedReference => "unresolved_reference",
            UnknownBuiltin => "unknown_builtin",
            BadBuiltinArgs => "bad_builtin_args",
            EmptyEquation => "empty_equation",
            InvalidTable => "invalid_table",
            BadModuleInputDst => "bad_module_input_dst",
            BadModelName => "bad_model_name",
            BadSimSpecs => "bad_sim_specs",
            CircularDependency => "circular_dependency",
            UnknownDependency => "unknown_dependency",
            NotSimulatable => "not_simulatable",
            AlreadyStepped => "already_stepped",
            UnknownCommand => "unknown_command",
            MalformedResult => "malformed_result",
            Generic => "generic",
        };

        write!(f, "{}", name)
    }
}

/// EquationError describes a problem with a single variable's
/// expression tree, before it is attributed to a model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EquationError {
    pub code: ErrorCode,
    pub details: Option<String>,
}

impl fmt::Display for EquationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.details {
            Some(ref details) => write!(f, "{}: {}", self.code, details),
            None => write!(f, "{}", self.code),
        }
    }
}

#[macro_export]
macro_rules! eqn_err(
    ($code:tt, $str:expr) => {{
        use $crate::common::{EquationError, ErrorCode};
        Err(EquationError{
            code: ErrorCode::$code,
            details: Some($str),
        })
    }}
);

#[macro_export]
macro_rules! model_err(
    ($code:tt, $str:expr) => {{
        use $crate::common::{Error, ErrorCode, ErrorKind};
        Err(Error{
            kind: ErrorKind::Model,
            code: ErrorCode::$code,
            details: Some($str),
        })
    }}
);

#[macro_export]
macro_rules! sim_err(
    ($code:tt, $str:expr) => {{
        use $crate::common::{Error, ErrorCode, ErrorKind};
        Err(Error{
            kind: ErrorKind::Simulation,
            code: ErrorCode::$code,
            details: Some($str),
        })
    }}
);

#[macro_export]
macro_rules! protocol_err(
    ($code:tt, $str:expr) => {{
        use $crate::common::{Error, ErrorCode, ErrorKind};
        Err(Error{
            kind: ErrorKind::Protocol,
            code: ErrorCode::$code,
            details: Some($str),
        })
    }}
);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Model,
    Simulation,
    Variable,
    Protocol,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    pub kind: ErrorKind,
    pub code: ErrorCode,
    pub(crate) details: Option<String>,
}

impl Error {
    pub fn new(kind: ErrorKind, code: ErrorCode, details: Option<String>) -> Self {
        Error {
            kind,
            code,
            details,
        }
    }

    pub fn get_details(&self) -> Option<String> {
        self.details.clone()
    }

    /// attribute a per-variable error to the variable that produced it
    pub fn from_equation(ident: &str, err: EquationError) -> Self {
        let details = match err.details {
            Some(details) => format!("{}: {}", ident, details),
            None => ident.to_owned(),
        };
        Error {
            kind: ErrorKind::Variable,
            code: err.code,
            details: Some(details),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = match self.kind {
            ErrorKind::Model => "ModelError",
            ErrorKind::Simulation => "SimulationError",
            ErrorKind::Variable => "VariableError",
            ErrorKind::Protocol => "ProtocolError",
        };
        match self.details {
            Some(ref details) => write!(f, "{}{{{}: {}}}", kind, self.code, details),
            None => write!(f, "{}{{{}}}", kind, self.code),
        }
    }
}

impl error::Error for Error {}

pub type Result<T> = result::Result<T, Error>;
pub type EquationResult<T> = result::Result<T, EquationError>;

pub fn canonicalize(name: &str) -> String {
    // remove leading and trailing whitespace, do this before testing
    // for quotedness as we should treat a quoted string as sacrosanct
    let name = name.trim();

    let bytes = name.as_bytes();
    let quoted: bool = { bytes.len() >= 2 && bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"' };

    let name = if quoted {
        &name[1..bytes.len() - 1]
    } else {
        name
    };

    lazy_static! {
        static ref UNDERSCORE_RE: Regex = Regex::new(r"\\n|\\r|\n|\r| |\x{00A0}").unwrap();
    }
    let name = name.replace("\\\\", "\\");
    let name = UNDERSCORE_RE.replace_all(&name, "_");

    name.to_lowercase()
}

#[test]
fn test_canonicalize() {
    assert!(canonicalize("\"quoted\"") == "quoted");
    assert!(canonicalize("   a b") == "a_b");
    assert!(canonicalize("Å\nb") == "å_b");
    assert_eq!("$·x·0·smth1", canonicalize("$·x·0·smth1"));
}

#[test]
fn test_error_display() {
    let err = Error::new(
        ErrorKind::Model,
        ErrorCode::DuplicateIdentifier,
        Some("stock_a".to_owned()),
    );
    assert_eq!("ModelError{duplicate_identifier: stock_a}", format!("{}", err));

    let err = Error::new(ErrorKind::Protocol, ErrorCode::UnknownCommand, None);
    assert_eq!("ProtocolError{unknown_command}", format!("{}", err));

    let err = Error::from_equation(
        "flow",
        EquationError {
            code: ErrorCode::UnknownBuiltin,
            details: Some("smth9".to_owned()),
        },
    );
    assert_eq!(ErrorKind::Variable, err.kind);
    assert_eq!(Some("flow: smth9".to_owned()), err.get_details());
}
