//! Unit tests for `AppError` display format and classification.

use mcp_sse_client::AppError;
use serde_json::json;

#[test]
fn connection_error_display_includes_message() {
    let err = AppError::Connection("stream closed".into());
    assert_eq!(err.to_string(), "connection: stream closed");
}

#[test]
fn rpc_error_display_includes_code_and_message() {
    let err = AppError::Rpc {
        code: -32601,
        message: "Method not found".into(),
        data: Some(json!({"method": "bogus"})),
    };
    assert_eq!(err.to_string(), "rpc error -32601: Method not found");
}

#[test]
fn every_variant_has_a_distinct_prefix() {
    let errors = [
        AppError::Config("x".into()),
        AppError::Parse("x".into()),
        AppError::Connection("x".into()),
        AppError::SessionTimeout("x".into()),
        AppError::RequestTimeout("x".into()),
        AppError::Cancelled("x".into()),
        AppError::ExhaustedRetries("x".into()),
        AppError::Closed("x".into()),
        AppError::NotStarted("x".into()),
        AppError::Io("x".into()),
    ];
    let mut rendered: Vec<String> = errors.iter().map(ToString::to_string).collect();
    rendered.sort();
    rendered.dedup();
    assert_eq!(rendered.len(), errors.len());
}

#[test]
fn error_messages_have_no_trailing_period() {
    let err = AppError::SessionTimeout("no session announced within 10s".into());
    let s = err.to_string();
    assert!(!s.ends_with('.'), "error message must not end with a period: {s}");
}

#[test]
fn only_transport_wide_failures_are_terminal() {
    assert!(AppError::Closed("stopped".into()).is_terminal());
    assert!(AppError::ExhaustedRetries("gave up".into()).is_terminal());
    assert!(!AppError::RequestTimeout("slow".into()).is_terminal());
    assert!(!AppError::Connection("refused".into()).is_terminal());
}

#[test]
fn json_failure_converts_to_parse_error() {
    let json_err = serde_json::from_str::<serde_json::Value>("{not json").expect_err("invalid");
    let err = AppError::from(json_err);
    assert!(matches!(err, AppError::Parse(_)));
    assert!(err.to_string().starts_with("parse: invalid json"));
}

#[test]
fn io_failure_converts_to_io_error() {
    let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
    assert_eq!(AppError::from(io), AppError::Io("missing".into()));
}

#[test]
fn app_error_implements_std_error_trait() {
    fn assert_error<E: std::error::Error>(_: &E) {}
    assert_error(&AppError::Closed("test".into()));
}
