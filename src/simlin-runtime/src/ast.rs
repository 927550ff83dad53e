// Copyright 2026 The Simlin Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use serde::{Deserialize, Serialize};

use crate::common::Ident;

// we use Boxs here because we may walk and update ASTs a number of times,
// and we want to avoid copying and reallocating subexpressions all over
// the place.
#[derive(PartialEq, Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Const(String, f64),
    Var(Ident),
    App(Ident, Vec<Expr>),
    Paren(Box<Expr>),
    Op1(UnaryOp, Box<Expr>),
    Op2(BinaryOp, Box<Expr>, Box<Expr>),
    If(Box<Expr>, Box<Expr>, Box<Expr>),
}

impl Default for Expr {
    fn default() -> Self {
        Expr::Const("0.0".to_string(), 0.0)
    }
}

// shorthand constructors, used for the stdlib models and by loaders
// that build trees programmatically
impl Expr {
    pub fn var(ident: &str) -> Self {
        Expr::Var(ident.to_owned())
    }

    pub fn num(n: f64) -> Self {
        Expr::Const(format!("{}", n), n)
    }

    pub fn app(func: &str, args: Vec<Expr>) -> Self {
        Expr::App(func.to_owned(), args)
    }

    pub fn op2(op: BinaryOp, l: Expr, r: Expr) -> Self {
        Expr::Op2(op, Box::new(l), Box::new(r))
    }
}

pub trait Visitor<T> {
    fn walk(&mut self, e: &Expr) -> T;
}

#[derive(PartialEq, Eq, Hash, Copy, Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Exp,
    Mul,
    Div,
    Mod,
    Gt,
    Lt,
    Gte,
    Lte,
    Eq,
    Neq,
    And,
    Or,
}

#[derive(PartialEq, Eq, Hash, Copy, Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Positive,
    Negative,
    Not,
}

struct PrintVisitor {}

impl Visitor<String> for PrintVisitor {
    fn walk(&mut self, expr: &Expr) -> String {
        match expr {
            Expr::Const(s, _) => s.clone(),
            Expr::Var(id) => id.clone(),
            Expr::App(func, args) => {
                let args: Vec<String> = args.iter().map(|e| self.walk(e)).collect();
                format!("{}({})", func, args.join(", "))
            }
            Expr::Paren(e) => format!("({})", self.walk(e)),
            Expr::Op1(op, l) => {
                let l = self.walk(l);
                let op: &str = match op {
                    UnaryOp::Positive => "+",
                    UnaryOp::Negative => "-",
                    UnaryOp::Not => "!",
                };
                format!("{}{}", op, l)
            }
            Expr::Op2(op, l, r) => {
                let l = self.walk(l);
                let r = self.walk(r);
                let op: &str = match op {
                    BinaryOp::Add => "+",
                    BinaryOp::Sub => "-",
                    BinaryOp::Exp => "^",
                    BinaryOp::Mul => "*",
                    BinaryOp::Div => "/",
                    BinaryOp::Mod => "%",
                    BinaryOp::Gt => ">",
                    BinaryOp::Lt => "<",
                    BinaryOp::Gte => ">=",
                    BinaryOp::Lte => "<=",
                    BinaryOp::Eq => "=",
                    BinaryOp::Neq => "!=",
                    BinaryOp::And => "&&",
                    BinaryOp::Or => "||",
                };
                format!("({} {} {})", l, op, r)
            }
            Expr::If(cond, t, f) => {
                let cond = self.walk(cond);
                let t = self.walk(t);
                let f = self.walk(f);
                format!("if ({}) then ({}) else ({})", cond, t, f)
            }
        }
    }
}

pub fn print_eqn(expr: &Expr) -> String {
    let mut visitor = PrintVisitor {};
    visitor.walk(expr)
}

#[cfg(test)]
fn var(id: &str) -> Box<Expr> {
    Box::new(Expr::Var(id.to_string()))
}

#[test]
fn test_print_eqn() {
    assert_eq!(
        "(a + b)",
        print_eqn(&Expr::Op2(BinaryOp::Add, var("a"), var("b")))
    );
    assert_eq!("-a", print_eqn(&Expr::Op1(UnaryOp::Negative, var("a"))));
    assert_eq!("!a", print_eqn(&Expr::Op1(UnaryOp::Not, var("a"))));
    assert_eq!("+a", print_eqn(&Expr::Op1(UnaryOp::Positive, var("a"))));
    assert_eq!("4.7", print_eqn(&Expr::Const("4.7".to_string(), 4.7)));
    assert_eq!("3", print_eqn(&Expr::num(3.0)));
    assert_eq!(
        "(a / 3)",
        print_eqn(&Expr::op2(BinaryOp::Div, Expr::var("a"), Expr::num(3.0)))
    );
    assert_eq!("(a)", print_eqn(&Expr::Paren(var("a"))));
    assert_eq!(
        "lookup(a, 1.0)",
        print_eqn(&Expr::App(
            "lookup".to_string(),
            vec![
                Expr::Var("a".to_string()),
                Expr::Const("1.0".to_string(), 1.0)
            ]
        ))
    );
    assert_eq!(
        "if ((a > b)) then (a) else (b)",
        print_eqn(&Expr::If(
            Box::new(Expr::Op2(BinaryOp::Gt, var("a"), var("b"))),
            var("a"),
            var("b"),
        ))
    );
}

#[test]
fn test_expr_json() {
    let expr = Expr::Op2(
        BinaryOp::Mul,
        var("rate"),
        Box::new(Expr::Const("2".to_string(), 2.0)),
    );
    let json = serde_json::to_string(&expr).unwrap();
    assert_eq!(r#"{"op2":["mul",{"var":"rate"},{"const":["2",2.0]}]}"#, json);
    let parsed: Expr = serde_json::from_str(&json).unwrap();
    assert_eq!(expr, parsed);
}
