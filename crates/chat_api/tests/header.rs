use chat_api::headers::{
    build_headers, HEADER_AUTHORIZATION, HEADER_ORGANIZATION, HEADER_USER_AGENT,
};
use chat_api::{ChatApiClient, ChatApiConfig, ChatApiError};

#[test]
fn headers_carry_bearer_token_and_defaults() {
    let config = ChatApiConfig::new("  sk-test  ");
    let headers = build_headers(&config).expect("headers");

    assert_eq!(
        headers.get(HEADER_AUTHORIZATION).map(String::as_str),
        Some("Bearer sk-test")
    );
    assert!(headers
        .get(HEADER_USER_AGENT)
        .is_some_and(|agent| agent.starts_with("chat_api/")));
    assert!(!headers.contains_key(HEADER_ORGANIZATION));
}

#[test]
fn headers_include_trimmed_organization() {
    let config = ChatApiConfig::new("sk-test").with_organization(" org-1 ");
    let headers = build_headers(&config).expect("headers");

    assert_eq!(
        headers.get(HEADER_ORGANIZATION).map(String::as_str),
        Some("org-1")
    );
    assert_eq!(headers.len(), 5);
}

#[test]
fn blank_organization_is_omitted() {
    let config = ChatApiConfig::new("sk-test").with_organization("   ");
    let headers = build_headers(&config).expect("headers");

    assert!(!headers.contains_key(HEADER_ORGANIZATION));
}

#[test]
fn headers_reject_blank_api_key() {
    let error = build_headers(&ChatApiConfig::new(" ")).expect_err("blank key must fail");
    assert!(matches!(error, ChatApiError::MissingApiKey));
}

#[test]
fn client_rejects_header_values_that_are_not_representable() {
    let config = ChatApiConfig::new("sk-test").with_organization("org\nsplit");
    let client = ChatApiClient::new(config).expect("client");

    let error = client.build_headers().expect_err("newline must fail");
    assert!(matches!(error, ChatApiError::InvalidHeader(_)));
}
