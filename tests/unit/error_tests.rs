//! Unit tests for `AppError` display and HTTP status mapping.

use authbridge::AppError;
use axum::http::StatusCode;

#[test]
fn display_carries_category_prefix() {
    assert_eq!(
        AppError::Provisioning("vm create failed".into()).to_string(),
        "provisioning: vm create failed"
    );
    assert_eq!(AppError::Timeout("OAuth timeout".into()).to_string(), "timeout: OAuth timeout");
    assert!(AppError::CredentialTransfer("x".into())
        .to_string()
        .starts_with("credential transfer:"));
}

#[test]
fn only_timeout_maps_to_timeout_status() {
    assert!(AppError::Timeout("t".into()).is_timeout());
    assert!(!AppError::Provisioning("vm not ready".into()).is_timeout());
    assert!(!AppError::NetworkTransient("reset".into()).is_timeout());
}

#[test]
fn client_errors_map_to_4xx() {
    assert_eq!(AppError::Validation("bad".into()).status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(AppError::NotFound("gone".into()).status_code(), StatusCode::NOT_FOUND);
}

#[test]
fn upstream_errors_map_to_gateway_statuses() {
    assert_eq!(AppError::Agent("down".into()).status_code(), StatusCode::BAD_GATEWAY);
    assert_eq!(
        AppError::NetworkTransient("reset".into()).status_code(),
        StatusCode::BAD_GATEWAY
    );
    assert_eq!(AppError::Timeout("slow".into()).status_code(), StatusCode::GATEWAY_TIMEOUT);
}

#[test]
fn internal_errors_map_to_500() {
    for err in [
        AppError::Db("locked".into()),
        AppError::Encryption("tag mismatch".into()),
        AppError::CredentialTransfer("umount".into()),
        AppError::Io("eof".into()),
        AppError::Config("missing".into()),
    ] {
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR, "{err}");
    }
}

#[test]
fn io_errors_convert() {
    let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
    let err: AppError = io.into();
    assert!(matches!(err, AppError::Io(_)));
}
