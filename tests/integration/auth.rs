use crate::common::{bearer, register_user, test_client};
use rocket::http::{ContentType, Status};

#[test]
fn test_register_returns_api_key_once() {
    let client = test_client();
    let res = client
        .post("/api/v1/auth/register")
        .header(ContentType::JSON)
        .body(r#"{"username": "alice", "displayName": "Alice"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Created);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["username"], "alice");
    assert_eq!(body["verified"], false);
    assert!(body["apiKey"].as_str().unwrap().starts_with("mahilo_"));
    assert!(
        body["verificationCode"]
            .as_str()
            .unwrap()
            .starts_with("mahilo-verify-")
    );
    assert!(!body["userId"].as_str().unwrap().is_empty());
}

#[test]
fn test_register_username_stored_lowercase() {
    let client = test_client();
    let res = client
        .post("/api/v1/auth/register")
        .header(ContentType::JSON)
        .body(r#"{"username": "CarolAgent"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Created);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["username"], "carolagent");
}

#[test]
fn test_register_invalid_usernames() {
    let client = test_client();
    for bad in ["ab", "has space", "dash-name", "x".repeat(31).as_str()] {
        let res = client
            .post("/api/v1/auth/register")
            .header(ContentType::JSON)
            .body(format!(r#"{{"username": "{bad}"}}"#))
            .dispatch();
        assert_eq!(res.status(), Status::BadRequest, "username {bad:?}");
        let body: serde_json::Value = res.into_json().unwrap();
        assert_eq!(body["error"], "VALIDATION");
    }
}

#[test]
fn test_register_duplicate_username_conflict() {
    let client = test_client();
    register_user(&client, "bob");
    let res = client
        .post("/api/v1/auth/register")
        .header(ContentType::JSON)
        .body(r#"{"username": "BOB"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Conflict);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["error"], "CONFLICT");
}

#[test]
fn test_me_requires_auth() {
    let client = test_client();
    let res = client.get("/api/v1/auth/me").dispatch();
    assert_eq!(res.status(), Status::Unauthorized);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["error"], "UNAUTHORIZED");
}

#[test]
fn test_me_returns_principal() {
    let client = test_client();
    let (user_id, api_key) = register_user(&client, "dana");
    let res = client
        .get("/api/v1/auth/me")
        .header(bearer(&api_key))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["userId"], user_id.as_str());
    assert_eq!(body["username"], "dana");
    assert_eq!(body["verified"], false);
}

#[test]
fn test_malformed_keys_are_opaque_401() {
    let client = test_client();
    register_user(&client, "erin");
    for bad in [
        "not-a-key",
        "mahilo_",
        "mahilo_justkeyid",
        "mahilo_deadbeefdeadbeef_",
    ] {
        let res = client
            .get("/api/v1/auth/me")
            .header(bearer(bad))
            .dispatch();
        assert_eq!(res.status(), Status::Unauthorized, "key {bad:?}");
    }
}

#[test]
fn test_rotate_key_invalidates_old() {
    let client = test_client();
    let (_, api_key) = register_user(&client, "frank");

    let res = client
        .post("/api/v1/auth/rotate-key")
        .header(bearer(&api_key))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    let new_key = body["apiKey"].as_str().unwrap().to_string();
    assert_ne!(new_key, api_key);

    // Old key is dead, new key works
    let res = client
        .get("/api/v1/auth/me")
        .header(bearer(&api_key))
        .dispatch();
    assert_eq!(res.status(), Status::Unauthorized);
    let res = client
        .get("/api/v1/auth/me")
        .header(bearer(&new_key))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
}

#[test]
fn test_verification_flow() {
    let client = test_client();
    let (user_id, _) = register_user(&client, "grace");

    // Challenge is readable without auth
    let res = client.get(format!("/api/v1/auth/verify/{user_id}")).dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["verified"], false);
    assert!(
        body["verificationTweet"]
            .as_str()
            .unwrap()
            .contains("mahilo-verify-")
    );

    // Verify with a handle
    let res = client
        .post(format!("/api/v1/auth/verify/{user_id}"))
        .header(ContentType::JSON)
        .body(r#"{"twitterHandle": "@grace_agent"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["verified"], true);
    assert_eq!(body["twitterHandle"], "grace_agent");

    // Second verification conflicts
    let res = client
        .post(format!("/api/v1/auth/verify/{user_id}"))
        .header(ContentType::JSON)
        .body(r#"{"twitterHandle": "grace_agent"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Conflict);
}

#[test]
fn test_verify_unknown_user() {
    let client = test_client();
    let res = client
        .post("/api/v1/auth/verify/nonexistent-user")
        .header(ContentType::JSON)
        .body(r#"{"twitterHandle": "ghost"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::NotFound);
}

#[test]
fn test_health_is_public() {
    let client = test_client();
    let res = client.get("/api/v1/health").dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "mahilo-registry");
}
