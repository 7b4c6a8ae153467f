//! Unit tests for the request correlator.

use std::time::Duration;

use serde_json::json;

use mcp_sse_client::correlator::Correlator;
use mcp_sse_client::jsonrpc::{RequestId, ResponsePayload, RpcErrorObject};
use mcp_sse_client::AppError;

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn resolve_delivers_result_to_waiter() {
    let correlator = Correlator::new();
    let (id, call) = correlator.register();

    assert!(correlator.resolve(&id, ResponsePayload::Result(json!({"ok": true}))));

    let value = call.wait(WAIT).await.expect("resolved call");
    assert_eq!(value, json!({"ok": true}));
    assert!(correlator.is_empty());
}

#[tokio::test]
async fn error_payload_surfaces_as_rpc_error() {
    let correlator = Correlator::new();
    let (id, call) = correlator.register();

    correlator.resolve(
        &id,
        ResponsePayload::Error(RpcErrorObject {
            code: -32601,
            message: "Method not found".into(),
            data: None,
        }),
    );

    let err = call.wait(WAIT).await.expect_err("error response");
    assert_eq!(
        err,
        AppError::Rpc {
            code: -32601,
            message: "Method not found".into(),
            data: None,
        }
    );
}

#[tokio::test]
async fn duplicate_response_is_ignored_and_first_value_wins() {
    let correlator = Correlator::new();
    let (id, call) = correlator.register();

    assert!(correlator.resolve(&id, ResponsePayload::Result(json!("first"))));
    assert!(!correlator.resolve(&id, ResponsePayload::Result(json!("second"))));

    assert_eq!(call.wait(WAIT).await.expect("first value"), json!("first"));
}

#[test]
fn unknown_identifier_is_a_no_op() {
    let correlator = Correlator::new();
    let (_id, _call) = correlator.register();

    assert!(!correlator.resolve(&RequestId::Number(999), ResponsePayload::Result(json!(null))));
    assert!(!correlator.resolve(
        &RequestId::String("foreign".into()),
        ResponsePayload::Result(json!(null))
    ));
    assert_eq!(correlator.len(), 1, "unrelated pending call must survive");
}

#[tokio::test]
async fn cancel_all_fails_every_pending_call() {
    let correlator = Correlator::new();
    let calls: Vec<_> = (0..3).map(|_| correlator.register().1).collect();
    assert_eq!(correlator.len(), 3);

    let cancelled = correlator.cancel_all(&AppError::Closed("transport stopped".into()));
    assert_eq!(cancelled, 3);
    assert!(correlator.is_empty());

    let waiters: Vec<_> = calls
        .into_iter()
        .map(|call| tokio::spawn(call.wait(WAIT)))
        .collect();
    for waiter in waiters {
        let err = waiter.await.expect("task").expect_err("cancelled call");
        assert!(matches!(err, AppError::Closed(_)), "unexpected error: {err}");
    }
}

#[tokio::test]
async fn cancel_all_wakes_callers_already_waiting() {
    let correlator = Correlator::new();
    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let (_, call) = correlator.register();
            tokio::spawn(call.wait(Duration::from_secs(30)))
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(20)).await;
    correlator.cancel_all(&AppError::Closed("connection closed".into()));

    for waiter in waiters {
        let err = waiter.await.expect("task").expect_err("cancelled call");
        assert!(err.is_terminal());
    }
    assert!(correlator.is_empty());
}

#[tokio::test]
async fn timeout_fails_only_that_call() {
    let correlator = Correlator::new();
    let (slow_id, slow) = correlator.register();
    let (fast_id, fast) = correlator.register();

    let err = slow
        .wait(Duration::from_millis(30))
        .await
        .expect_err("slow call must time out");
    assert!(matches!(err, AppError::RequestTimeout(_)));
    assert!(!correlator.contains(&slow_id));
    assert!(correlator.contains(&fast_id));

    // A late response to the timed-out call is discarded quietly.
    assert!(!correlator.resolve(&slow_id, ResponsePayload::Result(json!(1))));

    correlator.resolve(&fast_id, ResponsePayload::Result(json!(2)));
    assert_eq!(fast.wait(WAIT).await.expect("fast call"), json!(2));
}

#[tokio::test]
async fn cancel_surfaces_cancelled_error() {
    let correlator = Correlator::new();
    let (id, call) = correlator.register();
    assert!(correlator.cancel(&id));

    let err = call.wait(WAIT).await.expect_err("cancelled");
    assert!(matches!(err, AppError::Cancelled(_)));
}

#[test]
fn concurrent_registration_yields_unique_ids() {
    let correlator = Correlator::new();
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let correlator = correlator.clone();
            std::thread::spawn(move || {
                (0..100)
                    .map(|_| {
                        let (id, call) = correlator.register();
                        drop(call);
                        id
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut ids: Vec<RequestId> = handles
        .into_iter()
        .flat_map(|h| h.join().expect("thread"))
        .collect();
    let total = ids.len();
    ids.sort_by_key(|id| match id {
        RequestId::Number(n) => *n,
        RequestId::String(_) => u64::MAX,
    });
    ids.dedup();
    assert_eq!(ids.len(), total);
    assert!(correlator.is_empty());
}
