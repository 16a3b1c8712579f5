use super::*;
use std::error::Error;

#[test]
fn test_not_found_error_manifest() {
    let err = DepotError::NotFound {
        resource_type: "manifest".to_string(),
        name: "library/hello:latest".to_string(),
    };

    assert!(err.is_not_found());
    assert!(err.to_string().contains("manifest"));
    assert!(err.to_string().contains("library/hello:latest"));
}

#[test]
fn test_rate_limit_error_keeps_retry_after() {
    let err = DepotError::rate_limit("too many requests", Some(60));

    assert!(err.is_rate_limit());
    assert!(matches!(
        err,
        DepotError::RateLimit {
            retry_after: Some(60),
            ..
        }
    ));
}

#[test]
fn test_size_mismatch_display() {
    let err = DepotError::size_mismatch(100, 42);
    assert_eq!(
        err.to_string(),
        "Size mismatch: expected 100 bytes, got 42"
    );
}

#[test]
fn test_denied_helper_constructor() {
    let err = DepotError::denied("push to proxy project");
    assert!(matches!(err, DepotError::Denied { .. }));
    assert!(err.to_string().contains("push to proxy project"));
}

#[test]
fn test_conflict_helper_constructor() {
    let err = DepotError::conflict("push already in progress");
    assert!(matches!(err, DepotError::Conflict { .. }));
    assert!(err.is_conflict());
    assert!(!DepotError::not_found("blob", "sha256:aa").is_conflict());
}

#[test]
fn test_network_with_source_helper_constructor() {
    let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused");
    let err = DepotError::network_with_source("failed to connect", io_err);
    assert!(matches!(err, DepotError::Network { .. }));
    assert!(err.source().is_some());
}

#[test]
fn test_clone_keeps_source() {
    let io_err = std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid data");
    let err = DepotError::validation_with_source("invalid format", io_err);
    let cloned = err.clone();

    assert!(cloned.source().is_some());
    assert!(cloned.source().unwrap().to_string().contains("invalid data"));
}

#[test]
fn test_config_with_source_helper_constructor() {
    let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
    let err = DepotError::config_with_source(
        "failed to read config",
        Some("/etc/depot/config.yaml"),
        io_err,
    );
    assert!(matches!(err, DepotError::Config { .. }));
    assert!(err.source().is_some());
}

#[test]
fn test_status_codes() {
    assert_eq!(DepotError::not_found("blob", "sha256:aa").status_code(), 404);
    assert_eq!(DepotError::rate_limit("slow down", None).status_code(), 429);
    assert_eq!(DepotError::denied("nope").status_code(), 403);
    assert_eq!(DepotError::conflict("busy").status_code(), 409);
    assert_eq!(DepotError::size_mismatch(1, 2).status_code(), 500);
    assert_eq!(DepotError::network("reset").status_code(), 502);
    assert_eq!(DepotError::server("bad gateway", 502).status_code(), 502);
}

#[test]
fn test_predicates_are_exclusive() {
    let err = DepotError::network("connection reset");
    assert!(!err.is_not_found());
    assert!(!err.is_rate_limit());
}
