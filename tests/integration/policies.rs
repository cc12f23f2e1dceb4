use crate::common::{bearer, register_user, test_client};
use rocket::http::{ContentType, Status};

#[test]
fn test_create_global_heuristic_policy() {
    let client = test_client();
    let (_, key) = register_user(&client, "alice");

    let res = client
        .post("/api/v1/policies")
        .header(ContentType::JSON)
        .header(bearer(&key))
        .body(
            r#"{"scope": "global", "policyType": "heuristic",
                "policyContent": "{\"maxLength\": 500, \"blockedPatterns\": [\"secret\"]}",
                "priority": 100}"#,
        )
        .dispatch();
    assert_eq!(res.status(), Status::Created);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["scope"], "global");
    assert_eq!(body["priority"], 100);
    assert_eq!(body["enabled"], true);
    assert!(body["targetId"].is_null());
}

#[test]
fn test_global_policy_rejects_target() {
    let client = test_client();
    let (_, key) = register_user(&client, "alice");
    let res = client
        .post("/api/v1/policies")
        .header(ContentType::JSON)
        .header(bearer(&key))
        .body(
            r#"{"scope": "global", "targetId": "someone", "policyType": "heuristic",
                "policyContent": "{}"}"#,
        )
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
}

#[test]
fn test_invalid_regex_rejected_at_create() {
    let client = test_client();
    let (_, key) = register_user(&client, "alice");
    let res = client
        .post("/api/v1/policies")
        .header(ContentType::JSON)
        .header(bearer(&key))
        .body(
            r#"{"scope": "global", "policyType": "heuristic",
                "policyContent": "{\"blockedPatterns\": [\"(invalid\"]}"}"#,
        )
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["error"], "VALIDATION");
}

#[test]
fn test_heuristic_content_must_be_json() {
    let client = test_client();
    let (_, key) = register_user(&client, "alice");
    let res = client
        .post("/api/v1/policies")
        .header(ContentType::JSON)
        .header(bearer(&key))
        .body(r#"{"scope": "global", "policyType": "heuristic", "policyContent": "not json"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
}

#[test]
fn test_llm_policy_requires_prompt() {
    let client = test_client();
    let (_, key) = register_user(&client, "alice");
    let res = client
        .post("/api/v1/policies")
        .header(ContentType::JSON)
        .header(bearer(&key))
        .body(r#"{"scope": "global", "policyType": "llm", "policyContent": "   "}"#)
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);

    let res = client
        .post("/api/v1/policies")
        .header(ContentType::JSON)
        .header(bearer(&key))
        .body(r#"{"scope": "global", "policyType": "llm", "policyContent": "Block anything rude"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Created);
}

#[test]
fn test_user_scope_requires_existing_target() {
    let client = test_client();
    let (_, key) = register_user(&client, "alice");
    let (bob_id, _) = register_user(&client, "bob");

    let res = client
        .post("/api/v1/policies")
        .header(ContentType::JSON)
        .header(bearer(&key))
        .body(r#"{"scope": "user", "targetId": "ghost-user", "policyType": "heuristic", "policyContent": "{}"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::NotFound);

    let res = client
        .post("/api/v1/policies")
        .header(ContentType::JSON)
        .header(bearer(&key))
        .body(format!(
            r#"{{"scope": "user", "targetId": "{bob_id}", "policyType": "heuristic", "policyContent": "{{}}"}}"#
        ))
        .dispatch();
    assert_eq!(res.status(), Status::Created);
}

#[test]
fn test_role_scope_requires_valid_role() {
    let client = test_client();
    let (_, key) = register_user(&client, "alice");

    let res = client
        .post("/api/v1/policies")
        .header(ContentType::JSON)
        .header(bearer(&key))
        .body(r#"{"scope": "role", "targetId": "no_such_role", "policyType": "heuristic", "policyContent": "{}"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);

    let res = client
        .post("/api/v1/policies")
        .header(ContentType::JSON)
        .header(bearer(&key))
        .body(r#"{"scope": "role", "targetId": "close_friends", "policyType": "heuristic", "policyContent": "{}"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Created);
}

#[test]
fn test_group_scope_requires_admin() {
    let client = test_client();
    let (_, key_a) = register_user(&client, "alice");
    let (_, key_b) = register_user(&client, "bob");

    let res = client
        .post("/api/v1/groups")
        .header(ContentType::JSON)
        .header(bearer(&key_a))
        .body(r#"{"name": "policied"}"#)
        .dispatch();
    let group: serde_json::Value = res.into_json().unwrap();
    let group_id = group["id"].as_str().unwrap().to_string();
    client
        .post(format!("/api/v1/groups/{group_id}/join"))
        .header(bearer(&key_b))
        .dispatch();

    // Plain member cannot create a group policy
    let res = client
        .post("/api/v1/policies")
        .header(ContentType::JSON)
        .header(bearer(&key_b))
        .body(format!(
            r#"{{"scope": "group", "targetId": "{group_id}", "policyType": "heuristic", "policyContent": "{{}}"}}"#
        ))
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);

    // Owner can
    let res = client
        .post("/api/v1/policies")
        .header(ContentType::JSON)
        .header(bearer(&key_a))
        .body(format!(
            r#"{{"scope": "group", "targetId": "{group_id}", "policyType": "heuristic", "policyContent": "{{}}"}}"#
        ))
        .dispatch();
    assert_eq!(res.status(), Status::Created);
}

#[test]
fn test_list_filters() {
    let client = test_client();
    let (_, key) = register_user(&client, "alice");
    client
        .post("/api/v1/policies")
        .header(ContentType::JSON)
        .header(bearer(&key))
        .body(r#"{"scope": "global", "policyType": "heuristic", "policyContent": "{}", "priority": 5}"#)
        .dispatch();
    client
        .post("/api/v1/policies")
        .header(ContentType::JSON)
        .header(bearer(&key))
        .body(r#"{"scope": "role", "targetId": "friends", "policyType": "heuristic", "policyContent": "{}", "priority": 9}"#)
        .dispatch();

    let res = client
        .get("/api/v1/policies")
        .header(bearer(&key))
        .dispatch();
    let all: Vec<serde_json::Value> = res.into_json().unwrap();
    assert_eq!(all.len(), 2);
    // Priority DESC ordering
    assert_eq!(all[0]["priority"], 9);

    let res = client
        .get("/api/v1/policies?scope=global")
        .header(bearer(&key))
        .dispatch();
    let globals: Vec<serde_json::Value> = res.into_json().unwrap();
    assert_eq!(globals.len(), 1);
    assert_eq!(globals[0]["scope"], "global");
}

#[test]
fn test_update_policy_validates_content() {
    let client = test_client();
    let (_, key) = register_user(&client, "alice");
    let res = client
        .post("/api/v1/policies")
        .header(ContentType::JSON)
        .header(bearer(&key))
        .body(r#"{"scope": "global", "policyType": "heuristic", "policyContent": "{}"}"#)
        .dispatch();
    let policy: serde_json::Value = res.into_json().unwrap();
    let policy_id = policy["id"].as_str().unwrap().to_string();

    let res = client
        .patch(format!("/api/v1/policies/{policy_id}"))
        .header(ContentType::JSON)
        .header(bearer(&key))
        .body(r#"{"policyContent": "{\"blockedPatterns\": [\"(broken\"]}"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);

    let res = client
        .patch(format!("/api/v1/policies/{policy_id}"))
        .header(ContentType::JSON)
        .header(bearer(&key))
        .body(r#"{"enabled": false, "priority": 42}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["enabled"], false);
    assert_eq!(body["priority"], 42);
}

#[test]
fn test_policy_authz_binds_to_creator() {
    let client = test_client();
    let (_, key_a) = register_user(&client, "alice");
    let (_, key_b) = register_user(&client, "bob");
    let res = client
        .post("/api/v1/policies")
        .header(ContentType::JSON)
        .header(bearer(&key_a))
        .body(r#"{"scope": "global", "policyType": "heuristic", "policyContent": "{}"}"#)
        .dispatch();
    let policy: serde_json::Value = res.into_json().unwrap();
    let policy_id = policy["id"].as_str().unwrap().to_string();

    let res = client
        .delete(format!("/api/v1/policies/{policy_id}"))
        .header(bearer(&key_b))
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);
}

#[test]
fn test_group_policies_shared_administration() {
    let client = test_client();
    let (_, key_a) = register_user(&client, "alice");
    let (bob_id, key_b) = register_user(&client, "bob");

    let res = client
        .post("/api/v1/groups")
        .header(ContentType::JSON)
        .header(bearer(&key_a))
        .body(r#"{"name": "shared_admin"}"#)
        .dispatch();
    let group: serde_json::Value = res.into_json().unwrap();
    let group_id = group["id"].as_str().unwrap().to_string();
    client
        .post(format!("/api/v1/groups/{group_id}/join"))
        .header(bearer(&key_b))
        .dispatch();
    // Promote bob to owner so he is an admin-equivalent of the group
    client
        .post(format!("/api/v1/groups/{group_id}/transfer"))
        .header(ContentType::JSON)
        .header(bearer(&key_a))
        .body(format!(r#"{{"newOwnerUserId": "{bob_id}"}}"#))
        .dispatch();

    // Alice (now plain member) created nothing; bob creates a group policy
    let res = client
        .post("/api/v1/policies")
        .header(ContentType::JSON)
        .header(bearer(&key_b))
        .body(format!(
            r#"{{"scope": "group", "targetId": "{group_id}", "policyType": "heuristic", "policyContent": "{{}}"}}"#
        ))
        .dispatch();
    assert_eq!(res.status(), Status::Created);
    let policy: serde_json::Value = res.into_json().unwrap();
    let policy_id = policy["id"].as_str().unwrap().to_string();

    // Alice, no longer an admin, cannot delete it
    let res = client
        .delete(format!("/api/v1/policies/{policy_id}"))
        .header(bearer(&key_a))
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);
}
