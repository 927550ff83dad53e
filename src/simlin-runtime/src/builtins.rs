// Copyright 2026 The Simlin Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use float_cmp::approx_eq;

use crate::common::Ident;

#[derive(PartialEq, Clone, Debug)]
pub enum BuiltinFn<Expr> {
    Lookup(Ident, Box<Expr>),
    Abs(Box<Expr>),
    Arccos(Box<Expr>),
    Arcsin(Box<Expr>),
    Arctan(Box<Expr>),
    Cos(Box<Expr>),
    Exp(Box<Expr>),
    Inf,
    Int(Box<Expr>),
    Ln(Box<Expr>),
    Log10(Box<Expr>),
    Max(Box<Expr>, Box<Expr>),
    Min(Box<Expr>, Box<Expr>),
    Pi,
    Pulse(Box<Expr>, Box<Expr>, Option<Box<Expr>>),
    SafeDiv(Box<Expr>, Box<Expr>, Option<Box<Expr>>),
    Sin(Box<Expr>),
    Sqrt(Box<Expr>),
    Tan(Box<Expr>),
}

pub fn is_builtin_fn_or_time(name: &str) -> bool {
    is_builtin_fn(name) || matches!(name, "time" | "dt" | "initial_time" | "final_time")
}

pub fn is_builtin_fn(name: &str) -> bool {
    matches!(
        name,
        "lookup"
            | "abs"
            | "arccos"
            | "arcsin"
            | "arctan"
            | "cos"
            | "exp"
            | "inf"
            | "int"
            | "ln"
            | "log10"
            | "max"
            | "min"
            | "pi"
            | "pulse"
            | "safediv"
            | "sin"
            | "sqrt"
            | "tan"
    )
}

/// Piecewise-linear interpolation over `table`, whose x values are
/// non-decreasing.  Queries outside the table are clamped to the
/// boundary y values.
pub fn lookup(table: &[(f64, f64)], index: f64) -> f64 {
    if table.is_empty() {
        return f64::NAN;
    }

    if index.is_nan() {
        // things get wonky below if we try to binary search for NaN
        return f64::NAN;
    }

    // check if index is below the start of the table
    {
        let (x, y) = table[0];
        if index <= x {
            return y;
        }
    }

    let size = table.len();
    {
        let (x, y) = table[size - 1];
        if index >= x {
            return y;
        }
    }

    // lower bound: first entry with x >= index.  the clamps above
    // guarantee 0 < i < size.
    let mut low = 0;
    let mut high = size;
    while low < high {
        let mid = low + (high - low) / 2;
        if table[mid].0 < index {
            low = mid + 1;
        } else {
            high = mid;
        }
    }

    let i = low;
    if approx_eq!(f64, table[i].0, index) {
        table[i].1
    } else {
        // slope = deltaY/deltaX
        let slope = (table[i].1 - table[i - 1].1) / (table[i].0 - table[i - 1].0);
        // y = m*x + b
        (index - table[i - 1].0) * slope + table[i - 1].1
    }
}

/// `volume/dt` during the dt-wide window starting at each pulse time,
/// zero otherwise.
pub fn pulse(dt: f64, time: f64, volume: f64, first_pulse: f64, interval: f64) -> f64 {
    if time < first_pulse {
        return 0.0;
    }

    let mut next_pulse = first_pulse;
    while time >= next_pulse {
        if time < next_pulse + dt {
            return volume / dt;
        } else if interval <= 0.0 {
            break;
        } else {
            next_pulse += interval;
        }
    }

    0.0
}

#[test]
fn test_is_builtin_fn() {
    assert!(is_builtin_fn("lookup"));
    assert!(!is_builtin_fn("lookupz"));
    assert!(is_builtin_fn("log10"));
    assert!(!is_builtin_fn("smth1"));
    assert!(is_builtin_fn_or_time("initial_time"));
    assert!(!is_builtin_fn("time"));
}

#[test]
fn test_lookup() {
    let table = &[(0.0, 0.0), (1.0, 10.0), (2.0, 20.0)];
    assert_eq!(0.0, lookup(table, -1.0));
    assert_eq!(20.0, lookup(table, 3.0));
    assert!(approx_eq!(f64, 5.0, lookup(table, 0.5)));
    // breakpoints come back exactly
    assert_eq!(10.0, lookup(table, 1.0));
    assert_eq!(0.0, lookup(table, 0.0));
    assert_eq!(20.0, lookup(table, 2.0));
    assert!(approx_eq!(f64, 17.5, lookup(table, 1.75)));

    assert!(lookup(&[], 1.0).is_nan());
    assert!(lookup(table, f64::NAN).is_nan());
    assert_eq!(7.0, lookup(&[(3.0, 7.0)], 100.0));
}

#[test]
fn test_lookup_uneven_spacing() {
    let table = &[(0.0, 1.0), (0.1, 2.0), (10.0, 3.0)];
    assert!(approx_eq!(f64, 1.5, lookup(table, 0.05)));
    assert!(approx_eq!(f64, 2.5, lookup(table, 5.05)));
    assert_eq!(2.0, lookup(table, 0.1));
}

#[test]
fn test_pulse() {
    // single pulse
    assert_eq!(10.0, pulse(1.0, 5.0, 10.0, 5.0, 0.0));
    assert_eq!(0.0, pulse(1.0, 6.0, 10.0, 5.0, 0.0));
    assert_eq!(0.0, pulse(1.0, 4.0, 10.0, 5.0, 0.0));
    assert_eq!(0.0, pulse(1.0, 7.0, 10.0, 5.0, -1.0));

    // repeating
    assert_eq!(10.0, pulse(1.0, 7.0, 10.0, 5.0, 2.0));
    assert_eq!(0.0, pulse(1.0, 6.0, 10.0, 5.0, 2.0));
    assert_eq!(10.0, pulse(1.0, 9.0, 10.0, 5.0, 2.0));

    // the rate is scaled by dt so a step integrates to `volume`
    assert_eq!(40.0, pulse(0.25, 5.0, 10.0, 5.0, 0.0));
    assert_eq!(40.0, pulse(0.25, 5.2, 10.0, 5.0, 0.0));
    assert_eq!(0.0, pulse(0.25, 5.25, 10.0, 5.0, 0.0));
}
