//! Enrollment against a mock controller

mod common;

use std::sync::atomic::Ordering;

use common::{enrollment_jwt, self_signed, MockController};
use tempfile::TempDir;

use zitirtc::identity::{
    credential_path, enroll_if_needed, parse_certificates, token_path, AuthMethod, EnrollOutcome, Enrollment,
    EnrollmentError, EnrollmentParams, IdentityCredential, IdentityError,
};

fn updb_params() -> EnrollmentParams {
    EnrollmentParams {
        username: Some("device-1".to_string()),
        password: Some("secret".to_string()),
        ..EnrollmentParams::default()
    }
}

/// Token file only -> one run -> credential file only; the next run is a no-op
#[tokio::test]
async fn test_enroll_if_needed_is_idempotent() {
    let controller = MockController::start().await;
    let dir = TempDir::new().unwrap();
    let identity = dir.path().join("device");
    std::fs::write(
        token_path(&identity),
        enrollment_jwt(&controller.url, "updb", "jti-1", None),
    )
    .unwrap();

    let outcome = enroll_if_needed(&identity, updb_params()).await.unwrap();
    assert_eq!(outcome, EnrollOutcome::Enrolled(credential_path(&identity)));
    assert!(credential_path(&identity).exists());
    assert!(!token_path(&identity).exists());

    let credential = IdentityCredential::load(&credential_path(&identity)).unwrap();
    assert_eq!(credential.controller_url, controller.url);
    assert!(matches!(credential.auth_method(), AuthMethod::Password(_)));

    let outcome = enroll_if_needed(&identity, updb_params()).await.unwrap();
    assert_eq!(outcome, EnrollOutcome::AlreadyEnrolled);
    assert_eq!(controller.state.enrollments.lock().len(), 1);
}

#[tokio::test]
async fn test_enrollment_stores_issuer_ca_bundle() {
    let controller = MockController::start().await;
    let token = enrollment_jwt(&controller.url, "updb", "jti-ca", None);

    let json = Enrollment::run_to_string(&token, &updb_params()).await.unwrap();
    let credential = IdentityCredential::from_json(json.as_bytes()).unwrap();

    assert_eq!(controller.state.ca_requests.load(Ordering::SeqCst), 1);
    assert_eq!(
        credential.ca_certificates().unwrap(),
        parse_certificates(&controller.state.ca_pem).unwrap()
    );
}

#[tokio::test]
async fn test_ca_override_skips_bundle_fetch() {
    let controller = MockController::start().await;
    let dir = TempDir::new().unwrap();
    let ca_path = dir.path().join("ca.pem");
    let (own_ca, _) = self_signed("own-ca.test");
    std::fs::write(&ca_path, &own_ca).unwrap();
    let token = enrollment_jwt(&controller.url, "updb", "jti-ca-override", None);

    let params = EnrollmentParams {
        ca_override: Some(ca_path),
        ..updb_params()
    };
    let json = Enrollment::run_to_string(&token, &params).await.unwrap();
    let credential = IdentityCredential::from_json(json.as_bytes()).unwrap();

    assert_eq!(controller.state.ca_requests.load(Ordering::SeqCst), 0);
    assert_eq!(
        credential.ca_certificates().unwrap(),
        parse_certificates(&own_ca).unwrap()
    );
}

#[tokio::test]
async fn test_no_token_is_noop() {
    let dir = TempDir::new().unwrap();
    let outcome = enroll_if_needed(&dir.path().join("device"), EnrollmentParams::default())
        .await
        .unwrap();
    assert_eq!(outcome, EnrollOutcome::AlreadyEnrolled);
}

#[tokio::test]
async fn test_ott_enrollment_writes_certificate_identity() {
    let controller = MockController::start().await;
    let dir = TempDir::new().unwrap();
    let jwt = dir.path().join("camera.jwt");
    std::fs::write(&jwt, enrollment_jwt(&controller.url, "ott", "jti-ott", None)).unwrap();

    let written = Enrollment::from_token_file(&jwt, EnrollmentParams::default())
        .run()
        .await
        .unwrap();
    assert_eq!(written, dir.path().join("camera.json"));
    assert!(!jwt.exists());

    let credential = IdentityCredential::load(&written).unwrap();
    assert_eq!(credential.auth_method(), AuthMethod::Certificate);
    assert_eq!(credential.certificate_chain().unwrap().len(), 1);
    assert_eq!(credential.ca_certificates().unwrap().len(), 1);
    assert!(credential.private_key().is_ok());

    let enrollments = controller.state.enrollments.lock().clone();
    assert_eq!(
        enrollments,
        vec![(
            "ott".to_string(),
            "jti-ott".to_string(),
            "application/x-pem-file".to_string()
        )]
    );
}

#[cfg(unix)]
#[tokio::test]
async fn test_credential_is_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let controller = MockController::start().await;
    let dir = TempDir::new().unwrap();
    let identity = dir.path().join("device");
    std::fs::write(
        token_path(&identity),
        enrollment_jwt(&controller.url, "updb", "jti-perm", None),
    )
    .unwrap();

    enroll_if_needed(&identity, updb_params()).await.unwrap();
    let mode = std::fs::metadata(credential_path(&identity))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[tokio::test]
async fn test_rejected_token_keeps_files_untouched() {
    let controller = MockController::start().await;
    let dir = TempDir::new().unwrap();
    let identity = dir.path().join("device");
    std::fs::write(
        token_path(&identity),
        enrollment_jwt(&controller.url, "updb", "rejected", None),
    )
    .unwrap();

    let result = enroll_if_needed(&identity, updb_params()).await;
    assert!(matches!(
        result,
        Err(IdentityError::Enrollment(EnrollmentError::Rejected { status: 400, .. }))
    ));
    assert!(token_path(&identity).exists());
    assert!(!credential_path(&identity).exists());
}

#[tokio::test]
async fn test_expired_token() {
    let dir = TempDir::new().unwrap();
    let identity = dir.path().join("device");
    std::fs::write(
        token_path(&identity),
        enrollment_jwt("http://127.0.0.1:9", "ott", "jti-old", Some(1_000)),
    )
    .unwrap();

    let result = enroll_if_needed(&identity, EnrollmentParams::default()).await;
    assert!(matches!(
        result,
        Err(IdentityError::Enrollment(EnrollmentError::TokenExpired))
    ));
    assert!(token_path(&identity).exists());
}

#[tokio::test]
async fn test_garbage_token() {
    let dir = TempDir::new().unwrap();
    let identity = dir.path().join("device");
    std::fs::write(token_path(&identity), "not-a-jwt").unwrap();

    let result = enroll_if_needed(&identity, EnrollmentParams::default()).await;
    assert!(matches!(result, Err(IdentityError::Parse(_))));
}

#[tokio::test]
async fn test_updb_requires_credentials() {
    let controller = MockController::start().await;
    let token = enrollment_jwt(&controller.url, "updb", "jti-2", None);

    let result = Enrollment::run_to_string(&token, &EnrollmentParams::default()).await;
    assert!(matches!(
        result,
        Err(IdentityError::Enrollment(EnrollmentError::MissingParameter(
            "username"
        )))
    ));
    assert!(controller.state.enrollments.lock().is_empty());
}

#[tokio::test]
async fn test_run_to_string() {
    let controller = MockController::start().await;
    let token = enrollment_jwt(&controller.url, "updb", "jti-3", None);

    let json = Enrollment::run_to_string(&token, &updb_params()).await.unwrap();
    let credential = IdentityCredential::from_json(json.as_bytes()).unwrap();
    assert_eq!(credential.updb.unwrap().username, "device-1");
}

#[tokio::test]
async fn test_unsupported_method() {
    let dir = TempDir::new().unwrap();
    let jwt = dir.path().join("x.jwt");
    std::fs::write(&jwt, enrollment_jwt("http://127.0.0.1:9", "erott", "jti-4", None)).unwrap();

    let result = Enrollment::from_token_file(&jwt, EnrollmentParams::default())
        .run()
        .await;
    assert!(matches!(
        result,
        Err(IdentityError::Enrollment(EnrollmentError::UnsupportedMethod(_)))
    ));
}
