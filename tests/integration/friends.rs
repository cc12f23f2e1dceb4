use crate::common::{bearer, make_friends, register_user, test_client};
use rocket::http::{ContentType, Status};

#[test]
fn test_friend_request_and_accept() {
    let client = test_client();
    let (_, key_a) = register_user(&client, "alice");
    let (_, key_b) = register_user(&client, "bob");

    let res = client
        .post("/api/v1/friends/request")
        .header(ContentType::JSON)
        .header(bearer(&key_a))
        .body(r#"{"username": "bob"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Created);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["status"], "pending");
    let friendship_id = body["friendshipId"].as_str().unwrap().to_string();

    let res = client
        .post(format!("/api/v1/friends/{friendship_id}/accept"))
        .header(bearer(&key_b))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["status"], "accepted");
    assert_eq!(body["username"], "alice");
}

#[test]
fn test_self_request_rejected() {
    let client = test_client();
    let (_, key) = register_user(&client, "alice");
    let res = client
        .post("/api/v1/friends/request")
        .header(ContentType::JSON)
        .header(bearer(&key))
        .body(r#"{"username": "alice"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
}

#[test]
fn test_duplicate_request_conflict() {
    let client = test_client();
    let (_, key_a) = register_user(&client, "alice");
    register_user(&client, "bob");

    for expected in [Status::Created, Status::Conflict] {
        let res = client
            .post("/api/v1/friends/request")
            .header(ContentType::JSON)
            .header(bearer(&key_a))
            .body(r#"{"username": "bob"}"#)
            .dispatch();
        assert_eq!(res.status(), expected);
    }
}

#[test]
fn test_reverse_pending_auto_accepts() {
    let client = test_client();
    let (_, key_a) = register_user(&client, "alice");
    let (_, key_b) = register_user(&client, "bob");

    let res = client
        .post("/api/v1/friends/request")
        .header(ContentType::JSON)
        .header(bearer(&key_a))
        .body(r#"{"username": "bob"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Created);
    let first: serde_json::Value = res.into_json().unwrap();

    // Bob requesting Alice while her request is pending accepts the same row
    let res = client
        .post("/api/v1/friends/request")
        .header(ContentType::JSON)
        .header(bearer(&key_b))
        .body(r#"{"username": "alice"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let second: serde_json::Value = res.into_json().unwrap();
    assert_eq!(second["status"], "accepted");
    assert_eq!(second["autoAccepted"], true);
    assert_eq!(second["friendshipId"], first["friendshipId"]);

    // Exactly one accepted row exists for the pair
    let res = client
        .get("/api/v1/friends?status=accepted")
        .header(bearer(&key_a))
        .dispatch();
    let friends: Vec<serde_json::Value> = res.into_json().unwrap();
    assert_eq!(friends.len(), 1);
}

#[test]
fn test_request_to_already_friends_conflict() {
    let client = test_client();
    let (_, key_a) = register_user(&client, "alice");
    let (_, key_b) = register_user(&client, "bob");
    make_friends(&client, &key_a, &key_b, "bob");

    let res = client
        .post("/api/v1/friends/request")
        .header(ContentType::JSON)
        .header(bearer(&key_b))
        .body(r#"{"username": "alice"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Conflict);
}

#[test]
fn test_only_addressee_accepts() {
    let client = test_client();
    let (_, key_a) = register_user(&client, "alice");
    register_user(&client, "bob");

    let res = client
        .post("/api/v1/friends/request")
        .header(ContentType::JSON)
        .header(bearer(&key_a))
        .body(r#"{"username": "bob"}"#)
        .dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    let friendship_id = body["friendshipId"].as_str().unwrap().to_string();

    let res = client
        .post(format!("/api/v1/friends/{friendship_id}/accept"))
        .header(bearer(&key_a))
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);
}

#[test]
fn test_reject_deletes_row() {
    let client = test_client();
    let (_, key_a) = register_user(&client, "alice");
    let (_, key_b) = register_user(&client, "bob");

    let res = client
        .post("/api/v1/friends/request")
        .header(ContentType::JSON)
        .header(bearer(&key_a))
        .body(r#"{"username": "bob"}"#)
        .dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    let friendship_id = body["friendshipId"].as_str().unwrap().to_string();

    let res = client
        .post(format!("/api/v1/friends/{friendship_id}/reject"))
        .header(bearer(&key_b))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    // Row is gone; a fresh request is possible again
    let res = client
        .post("/api/v1/friends/request")
        .header(ContentType::JSON)
        .header(bearer(&key_a))
        .body(r#"{"username": "bob"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Created);
}

#[test]
fn test_block_hard_blocks_future_requests() {
    let client = test_client();
    let (_, key_a) = register_user(&client, "alice");
    let (_, key_b) = register_user(&client, "bob");
    let friendship_id = make_friends(&client, &key_a, &key_b, "bob");

    let res = client
        .post(format!("/api/v1/friends/{friendship_id}/block"))
        .header(bearer(&key_b))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let res = client
        .post("/api/v1/friends/request")
        .header(ContentType::JSON)
        .header(bearer(&key_a))
        .body(r#"{"username": "bob"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);
}

#[test]
fn test_unfriend() {
    let client = test_client();
    let (_, key_a) = register_user(&client, "alice");
    let (_, key_b) = register_user(&client, "bob");
    let friendship_id = make_friends(&client, &key_a, &key_b, "bob");

    let res = client
        .delete(format!("/api/v1/friends/{friendship_id}"))
        .header(bearer(&key_a))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let res = client
        .get("/api/v1/friends")
        .header(bearer(&key_b))
        .dispatch();
    let friends: Vec<serde_json::Value> = res.into_json().unwrap();
    assert!(friends.is_empty());
}

#[test]
fn test_list_friends_status_filter() {
    let client = test_client();
    let (_, key_a) = register_user(&client, "alice");
    let (_, key_b) = register_user(&client, "bob");
    register_user(&client, "carol");
    make_friends(&client, &key_a, &key_b, "bob");
    client
        .post("/api/v1/friends/request")
        .header(ContentType::JSON)
        .header(bearer(&key_a))
        .body(r#"{"username": "carol"}"#)
        .dispatch();

    let res = client
        .get("/api/v1/friends?status=accepted")
        .header(bearer(&key_a))
        .dispatch();
    let accepted: Vec<serde_json::Value> = res.into_json().unwrap();
    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0]["username"], "bob");

    let res = client
        .get("/api/v1/friends?status=pending")
        .header(bearer(&key_a))
        .dispatch();
    let pending: Vec<serde_json::Value> = res.into_json().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0]["username"], "carol");
    assert_eq!(pending[0]["direction"], "requester");
}

// --- Friend roles ---

#[test]
fn test_assign_system_role_idempotent() {
    let client = test_client();
    let (_, key_a) = register_user(&client, "alice");
    let (_, key_b) = register_user(&client, "bob");
    let friendship_id = make_friends(&client, &key_a, &key_b, "bob");

    for _ in 0..2 {
        let res = client
            .post(format!("/api/v1/friends/{friendship_id}/roles"))
            .header(ContentType::JSON)
            .header(bearer(&key_a))
            .body(r#"{"role": "close_friends"}"#)
            .dispatch();
        assert_eq!(res.status(), Status::Ok);
        let body: serde_json::Value = res.into_json().unwrap();
        assert_eq!(body["roles"].as_array().unwrap().len(), 1);
    }
}

#[test]
fn test_assign_unknown_role_404() {
    let client = test_client();
    let (_, key_a) = register_user(&client, "alice");
    let (_, key_b) = register_user(&client, "bob");
    let friendship_id = make_friends(&client, &key_a, &key_b, "bob");

    let res = client
        .post(format!("/api/v1/friends/{friendship_id}/roles"))
        .header(ContentType::JSON)
        .header(bearer(&key_a))
        .body(r#"{"role": "imaginary"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::NotFound);
}

#[test]
fn test_remove_unassigned_role_404() {
    let client = test_client();
    let (_, key_a) = register_user(&client, "alice");
    let (_, key_b) = register_user(&client, "bob");
    let friendship_id = make_friends(&client, &key_a, &key_b, "bob");

    let res = client
        .delete(format!("/api/v1/friends/{friendship_id}/roles/family"))
        .header(bearer(&key_a))
        .dispatch();
    assert_eq!(res.status(), Status::NotFound);
}

#[test]
fn test_assign_and_remove_custom_role() {
    let client = test_client();
    let (_, key_a) = register_user(&client, "alice");
    let (_, key_b) = register_user(&client, "bob");
    let friendship_id = make_friends(&client, &key_a, &key_b, "bob");

    client
        .post("/api/v1/roles")
        .header(ContentType::JSON)
        .header(bearer(&key_a))
        .body(r#"{"name": "chess_partners"}"#)
        .dispatch();

    let res = client
        .post(format!("/api/v1/friends/{friendship_id}/roles"))
        .header(ContentType::JSON)
        .header(bearer(&key_a))
        .body(r#"{"role": "chess_partners"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let res = client
        .delete(format!("/api/v1/friends/{friendship_id}/roles/chess_partners"))
        .header(bearer(&key_a))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert!(body["roles"].as_array().unwrap().is_empty());
}

#[test]
fn test_roles_require_party_membership() {
    let client = test_client();
    let (_, key_a) = register_user(&client, "alice");
    let (_, key_b) = register_user(&client, "bob");
    let (_, key_c) = register_user(&client, "carol");
    let friendship_id = make_friends(&client, &key_a, &key_b, "bob");

    let res = client
        .post(format!("/api/v1/friends/{friendship_id}/roles"))
        .header(ContentType::JSON)
        .header(bearer(&key_c))
        .body(r#"{"role": "friends"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);
}
