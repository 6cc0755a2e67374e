mod common;

use anyhow::Result;
use axum::http::StatusCode;
use common::{acquire_db_lock, body_to_vec, TestApp};
use serde::Deserialize;

#[derive(Deserialize)]
struct AuthenticatedUser {
    email: String,
    role: String,
}

#[tokio::test]
async fn login_and_me_roundtrip() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let password = "s3cret";
    app.insert_user("alice@example.com", password, "admin").await?;

    let token = app.login_token("Alice@Example.com ", password).await?;

    let response = app.get("/api/auth/me", Some(&token)).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_to_vec(response.into_body()).await?;
    let user: AuthenticatedUser = serde_json::from_slice(&body)?;

    assert_eq!(user.email, "alice@example.com");
    assert_eq!(user.role, "admin");

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn wrong_password_and_unknown_email_are_unauthorized() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    app.insert_user("bob@example.com", "right", "user").await?;

    let response = app
        .post_json(
            "/api/auth/login",
            &serde_json::json!({ "email": "bob@example.com", "password": "wrong" }),
            None,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .post_json(
            "/api/auth/login",
            &serde_json::json!({ "email": "nobody@example.com", "password": "right" }),
            None,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app.get("/api/auth/me", None).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    app.cleanup().await?;
    Ok(())
}
