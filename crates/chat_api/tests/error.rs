use chat_api::error::parse_error_message;
use chat_api::ChatApiError;
use reqwest::StatusCode;

#[test]
fn parse_error_message_joins_message_and_code() {
    let body = r#"{"error":{"message":"Rate limit reached for requests","code":"rate_limit_exceeded"}}"#;
    let message = parse_error_message(StatusCode::TOO_MANY_REQUESTS, body);
    assert_eq!(
        message,
        "Rate limit reached for requests (rate_limit_exceeded)"
    );
}

#[test]
fn parse_error_message_uses_type_when_code_is_missing() {
    let body = r#"{"error":{"message":"bad tool message","type":"invalid_request_error"}}"#;
    let message = parse_error_message(StatusCode::BAD_REQUEST, body);
    assert_eq!(message, "bad tool message (invalid_request_error)");
}

#[test]
fn parse_error_message_falls_back_to_raw_body() {
    let message = parse_error_message(StatusCode::BAD_GATEWAY, "upstream exploded");
    assert_eq!(message, "upstream exploded");
}

#[test]
fn parse_error_message_falls_back_to_reason_for_empty_body() {
    let message = parse_error_message(StatusCode::SERVICE_UNAVAILABLE, "  ");
    assert_eq!(message, "Service Unavailable");
}

#[test]
fn status_error_display_includes_code() {
    let error = ChatApiError::Status(StatusCode::UNAUTHORIZED, "invalid api key".to_string());
    assert_eq!(error.to_string(), "HTTP 401 Unauthorized invalid api key");
    assert_eq!(error.status(), Some(StatusCode::UNAUTHORIZED));
}
