use crate::common::{bearer, register_user, test_client};
use rocket::http::{ContentType, Status};

#[test]
fn test_system_roles_seeded() {
    let client = test_client();
    let (_, key) = register_user(&client, "alice");

    let res = client
        .get("/api/v1/roles?type=system")
        .header(bearer(&key))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let roles: Vec<serde_json::Value> = res.into_json().unwrap();
    let names: Vec<&str> = roles.iter().map(|r| r["name"].as_str().unwrap()).collect();
    for expected in ["close_friends", "friends", "acquaintances", "work_contacts", "family"] {
        assert!(names.contains(&expected), "missing {expected}");
    }
    assert!(roles.iter().all(|r| r["isSystem"] == true));
}

#[test]
fn test_create_custom_role() {
    let client = test_client();
    let (_, key) = register_user(&client, "bob");

    let res = client
        .post("/api/v1/roles")
        .header(ContentType::JSON)
        .header(bearer(&key))
        .body(r#"{"name": "book_club", "description": "Reading group"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Created);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["name"], "book_club");
    assert_eq!(body["isSystem"], false);

    let res = client
        .get("/api/v1/roles?type=custom")
        .header(bearer(&key))
        .dispatch();
    let roles: Vec<serde_json::Value> = res.into_json().unwrap();
    assert_eq!(roles.len(), 1);
}

#[test]
fn test_custom_roles_are_per_user() {
    let client = test_client();
    let (_, key_a) = register_user(&client, "alice");
    let (_, key_b) = register_user(&client, "bob");

    client
        .post("/api/v1/roles")
        .header(ContentType::JSON)
        .header(bearer(&key_a))
        .body(r#"{"name": "book_club"}"#)
        .dispatch();

    // Bob doesn't see Alice's custom role, and may reuse the name
    let res = client
        .get("/api/v1/roles?type=custom")
        .header(bearer(&key_b))
        .dispatch();
    let roles: Vec<serde_json::Value> = res.into_json().unwrap();
    assert!(roles.is_empty());

    let res = client
        .post("/api/v1/roles")
        .header(ContentType::JSON)
        .header(bearer(&key_b))
        .body(r#"{"name": "book_club"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Created);
}

#[test]
fn test_role_name_cannot_shadow_system() {
    let client = test_client();
    let (_, key) = register_user(&client, "carol");
    let res = client
        .post("/api/v1/roles")
        .header(ContentType::JSON)
        .header(bearer(&key))
        .body(r#"{"name": "close_friends"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
}

#[test]
fn test_role_name_pattern() {
    let client = test_client();
    let (_, key) = register_user(&client, "dana");
    for bad in ["1starts_with_digit", "has space", "has-dash", "_underscore_first"] {
        let res = client
            .post("/api/v1/roles")
            .header(ContentType::JSON)
            .header(bearer(&key))
            .body(format!(r#"{{"name": "{bad}"}}"#))
            .dispatch();
        assert_eq!(res.status(), Status::BadRequest, "name {bad:?}");
    }
}

#[test]
fn test_duplicate_role_conflict() {
    let client = test_client();
    let (_, key) = register_user(&client, "erin");
    for expected in [Status::Created, Status::Conflict] {
        let res = client
            .post("/api/v1/roles")
            .header(ContentType::JSON)
            .header(bearer(&key))
            .body(r#"{"name": "poker_night"}"#)
            .dispatch();
        assert_eq!(res.status(), expected);
    }
}
