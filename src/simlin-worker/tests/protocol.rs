// Copyright 2026 The Simlin Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use simlin_worker::WorkerHandle;

fn project() -> String {
    json!({
        "name": "bank",
        "sim_specs": {"start": 0.0, "stop": 4.0, "dt": 0.5, "save_step": 1.0},
        "models": [{
            "name": "main",
            "variables": [
                {"type": "stock", "ident": "balance", "equation": "100", "inflows": ["interest"]},
                {"type": "flow", "ident": "interest",
                 "ast": {"op2": ["mul", {"var": "balance"}, {"var": "rate"}]}},
                {"type": "aux", "ident": "rate", "equation": "0"}
            ]
        }]
    })
    .to_string()
}

async fn start() -> WorkerHandle {
    match WorkerHandle::start(project()).await {
        Ok(worker) => worker,
        Err(err) => panic!("worker failed to start: {:#}", err),
    }
}

#[tokio::test]
async fn drives_a_simulation() {
    let worker = start().await;

    assert_eq!(json!("ok"), worker.request("reset", vec![]).await.unwrap());
    assert_eq!(
        json!("ok"),
        worker
            .request("set_val", vec![json!("rate"), json!(0.5)])
            .await
            .unwrap()
    );
    assert_eq!(
        json!({"rate": 0.5, "balance": 100.0}),
        worker
            .request("get_val", vec![json!("rate"), json!("balance")])
            .await
            .unwrap()
    );

    // 2 half-steps at 25% each per saved row
    assert_eq!(json!(0.5), worker.request("run_to", vec![json!(0.0)]).await.unwrap());
    assert_eq!(json!(1.0), worker.request("run_to", vec![json!(0.5)]).await.unwrap());
    assert_eq!(
        json!({"balance": 156.25}),
        worker.request("get_val", vec![json!("balance")]).await.unwrap()
    );

    assert_eq!(
        json!("ok"),
        worker
            .request("set_desired_series", vec![json!(["balance", "nope"])])
            .await
            .unwrap()
    );
    let result = worker.request("run_to_end", vec![]).await.unwrap();
    assert_eq!(json!([0.0, 1.0, 2.0, 3.0, 4.0]), result["balance"]["time"]);
    assert_eq!(json!(100.0), result["balance"]["values"][0]);
    assert_eq!(Value::Null, result["nope"]);

    let series = worker.request("get_series", vec![json!("rate")]).await.unwrap();
    assert_eq!(json!([0.5, 0.5, 0.5, 0.5, 0.5]), series["rate"]["values"]);
}

#[tokio::test]
async fn reports_errors_as_values() {
    let worker = start().await;

    let err = worker.request("launch", vec![]).await.unwrap_err();
    assert_eq!("unknown command \"launch\"", err.to_string());

    worker.request("run_to", vec![json!(1.0)]).await.unwrap();
    let err = worker
        .request("set_val", vec![json!("rate"), json!(1.0)])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already_stepped"), "{}", err);

    // the worker keeps serving after a failed command
    assert_eq!(json!("ok"), worker.request("reset", vec![]).await.unwrap());
}

#[tokio::test]
async fn json_lines() {
    let worker = start().await;

    assert_eq!(None, worker.handle_line("   ").await.unwrap());
    assert_eq!(
        Some(r#"[7,["ok",null]]"#.to_owned()),
        worker.handle_line(r#"[7, "reset"]"#).await.unwrap()
    );
    assert_eq!(
        Some(r#"["abc",[null,"no result for [abc, run_to]"]]"#.to_owned()),
        worker.handle_line(r#"["abc", "run_to"]"#).await.unwrap()
    );

    let response: Value =
        serde_json::from_str(&worker.handle_line("{not json").await.unwrap().unwrap()).unwrap();
    assert_eq!(Value::Null, response[0]);
    assert_eq!(Value::Null, response[1][0]);
    assert!(response[1][1].is_string());

    let response: Value =
        serde_json::from_str(&worker.handle_line(r#"{"id": 1}"#).await.unwrap().unwrap()).unwrap();
    assert_eq!(json!([null, [null, "request must be a JSON array"]]), response);
}

#[tokio::test]
async fn requests_are_serialized() {
    let worker = Arc::new(start().await);

    let mut tasks = vec![];
    for _ in 0..8 {
        let worker = Arc::clone(&worker);
        tasks.push(tokio::spawn(async move {
            worker.request("get_val", vec![json!("balance")]).await
        }));
    }
    for task in tasks {
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(json!({"balance": 100.0}), result);
    }
}

#[tokio::test]
async fn compile_errors_fail_startup() {
    let bad = json!({
        "sim_specs": {"start": 0.0, "stop": 1.0, "dt": 1.0},
        "models": [{
            "name": "main",
            "variables": [{"type": "aux", "ident": "x", "ast": {"app": ["smth9", []]}}]
        }]
    })
    .to_string();
    let err = match WorkerHandle::start(bad).await {
        Ok(_) => panic!("expected startup to fail"),
        Err(err) => err,
    };
    assert!(err.to_string().contains("unknown_builtin"), "{}", err);
}
