use crate::common::{bearer, register_user, test_client};
use rocket::http::{ContentType, Status};

#[test]
fn test_preferences_defaults() {
    let client = test_client();
    let (_, key) = register_user(&client, "alice");

    let res = client
        .get("/api/v1/preferences")
        .header(bearer(&key))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["messageNotifications"], true);
    assert_eq!(body["deliveryNotifications"], true);
    assert!(body.get("defaultLlm").is_none());
}

#[test]
fn test_preferences_partial_update() {
    let client = test_client();
    let (_, key) = register_user(&client, "bob");

    let res = client
        .patch("/api/v1/preferences")
        .header(ContentType::JSON)
        .header(bearer(&key))
        .body(r#"{"messageNotifications": false, "defaultLlm": "claude", "settings": {"tone": "formal"}}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["messageNotifications"], false);
    assert_eq!(body["defaultLlm"], "claude");
    assert_eq!(body["settings"]["tone"], "formal");

    // Untouched fields survive the next partial update
    let res = client
        .patch("/api/v1/preferences")
        .header(ContentType::JSON)
        .header(bearer(&key))
        .body(r#"{"groupNotifications": false}"#)
        .dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["messageNotifications"], false);
    assert_eq!(body["groupNotifications"], false);
    assert_eq!(body["defaultLlm"], "claude");
}

#[test]
fn test_preferences_empty_update_rejected() {
    let client = test_client();
    let (_, key) = register_user(&client, "carol");
    let res = client
        .patch("/api/v1/preferences")
        .header(ContentType::JSON)
        .header(bearer(&key))
        .body(r#"{}"#)
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
}
