use super::*;

#[test]
fn test_credentials_anonymous() {
    let creds = Credentials::anonymous();
    assert_eq!(creds, Credentials::default());
    assert_eq!(creds.to_header_value(), None);
}

#[test]
fn test_credentials_basic() {
    let creds = Credentials::basic("testuser", "testpass");
    // base64("testuser:testpass")
    assert_eq!(
        creds.to_header_value().unwrap(),
        "Basic dGVzdHVzZXI6dGVzdHBhc3M="
    );
}

#[test]
fn test_credentials_bearer() {
    let creds = Credentials::bearer("my_token");
    assert_eq!(creds.to_header_value().unwrap(), "Bearer my_token");
}

#[test]
fn test_auth_challenge_parse_bearer() {
    let header = r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:alpine:pull""#;

    let challenge = AuthChallenge::parse(header).unwrap();
    assert!(challenge.is_bearer());
    assert_eq!(challenge.realm, "https://auth.example.com/token");
    assert_eq!(challenge.service, Some("registry.example.com".to_string()));
    assert_eq!(challenge.scope, Some("repository:alpine:pull".to_string()));
}

#[test]
fn test_auth_challenge_scope_with_comma() {
    let header = r#"Bearer realm="https://auth.example.com/token",scope="repository:alpine:pull,push",service="reg""#;

    let challenge = AuthChallenge::parse(header).unwrap();
    assert_eq!(
        challenge.scope,
        Some("repository:alpine:pull,push".to_string())
    );
    assert_eq!(challenge.service, Some("reg".to_string()));
}

#[test]
fn test_auth_challenge_parse_basic() {
    let header = r#"Basic realm="Registry Access""#;

    let challenge = AuthChallenge::parse(header).unwrap();
    assert!(!challenge.is_bearer());
    assert_eq!(challenge.realm, "Registry Access");
    assert_eq!(challenge.scope, None);
}

#[test]
fn test_auth_challenge_parse_missing_realm() {
    assert!(AuthChallenge::parse(r#"Bearer service="registry""#).is_err());
}

#[test]
fn test_auth_challenge_parse_invalid_format() {
    assert!(AuthChallenge::parse("InvalidHeader").is_err());
}

#[test]
fn test_token_query_uses_fallback_scope() {
    let challenge =
        AuthChallenge::parse(r#"Bearer realm="https://auth.example.com/token",service="hub""#)
            .unwrap();

    let query = challenge.token_query("repository:library/hello:pull");
    assert_eq!(
        query,
        vec![
            ("service", "hub".to_string()),
            ("scope", "repository:library/hello:pull".to_string()),
        ]
    );
}

#[test]
fn test_token_response_prefers_token_field() {
    let body: TokenResponse =
        serde_json::from_str(r#"{"token":"abc","access_token":"def"}"#).unwrap();
    assert_eq!(body.into_token().unwrap(), "abc");

    let body: TokenResponse = serde_json::from_str(r#"{"access_token":"def"}"#).unwrap();
    assert_eq!(body.into_token().unwrap(), "def");

    let body: TokenResponse = serde_json::from_str(r#"{}"#).unwrap();
    assert!(body.into_token().is_err());
}

#[test]
fn test_proxy_session_for_service_identity() {
    let identity = Identity::proxy_service("library/hello-world");
    assert!(identity.is_proxy_session("library"));
    assert!(!identity.is_proxy_session("other"));
}

#[test]
fn test_proxy_session_for_scanner_robot() {
    let identity = Identity::robot("robot$library+scanner-8ec3b47a-fd29-11ee-9681-0242c0a87009");
    assert!(identity.is_proxy_session("library"));
    assert!(!identity.is_proxy_session("lib"));
}

#[test]
fn test_proxy_session_rejects_other_robot() {
    let identity = Identity::robot("robot$library+test-8ec3b47a-fd29-11ee-9681-0242c0a87009");
    assert!(!identity.is_proxy_session("library"));
}

#[test]
fn test_proxy_session_rejects_users() {
    assert!(!Identity::user("admin").is_proxy_session("library"));
    assert!(!Identity::Anonymous.is_proxy_session("library"));
}

#[test]
fn test_identity_name() {
    assert_eq!(Identity::user("alice").name(), "alice");
    assert_eq!(Identity::Anonymous.name(), "anonymous");
    assert_eq!(
        Identity::proxy_service("library/hello").name(),
        "proxy-cache-service"
    );
}
