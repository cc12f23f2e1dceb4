use crate::common::{
    CallbackServer, bearer, make_friends, register_agent, register_user, test_client,
};
use rocket::http::{ContentType, Status};
use std::time::Duration;

fn setup_group(
    client: &rocket::local::blocking::Client,
    owner_key: &str,
    name: &str,
    member_keys: &[&str],
) -> String {
    let res = client
        .post("/api/v1/groups")
        .header(ContentType::JSON)
        .header(bearer(owner_key))
        .body(format!(r#"{{"name": "{name}"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Created);
    let body: serde_json::Value = res.into_json().unwrap();
    let group_id = body["id"].as_str().unwrap().to_string();
    for key in member_keys {
        let res = client
            .post(format!("/api/v1/groups/{group_id}/join"))
            .header(bearer(key))
            .dispatch();
        assert_eq!(res.status(), Status::Ok);
    }
    group_id
}

#[test]
fn test_fanout_partial_failure_aggregates_to_failed() {
    let client = test_client();
    let (_, key_a) = register_user(&client, "alice");
    let (_, key_b) = register_user(&client, "bob");
    let (_, key_c) = register_user(&client, "carol");
    setup_group(&client, &key_a, "mixed_crew", &[key_b.as_str(), key_c.as_str()]);

    // Bob answers; carol has no connection at all
    let server = CallbackServer::start(&[200]);
    register_agent(&client, &key_b, "clawdbot", "default", &server.url());

    let res = client
        .post("/api/v1/messages/send")
        .header(ContentType::JSON)
        .header(bearer(&key_a))
        .body(r#"{"recipient": "mixed_crew", "recipientType": "group", "message": "standup in 5"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    // One child delivered, one terminally failed: the aggregate is failed
    assert_eq!(body["status"], "failed");

    // Bob's callback carries the group context and a delivery id
    let captured = server.recv_timeout(Duration::from_secs(5)).expect("callback");
    let envelope: serde_json::Value = serde_json::from_str(&captured.body).unwrap();
    assert_eq!(envelope["groupName"], "mixed_crew");
    assert!(envelope["groupId"].is_string());
    assert!(envelope["deliveryId"].is_string());

    // Bob received it; carol's child failed with the canonical reason
    let res = client
        .get("/api/v1/messages?direction=received")
        .header(bearer(&key_b))
        .dispatch();
    let history: serde_json::Value = res.into_json().unwrap();
    assert_eq!(history["count"], 1);
    assert_eq!(history["messages"][0]["status"], "delivered");
    assert_eq!(history["messages"][0]["recipient"], "mixed_crew");

    let res = client
        .get("/api/v1/messages?direction=received")
        .header(bearer(&key_c))
        .dispatch();
    let history: serde_json::Value = res.into_json().unwrap();
    assert_eq!(history["count"], 1);
    assert_eq!(history["messages"][0]["status"], "failed");
}

#[test]
fn test_fanout_all_delivered() {
    let client = test_client();
    let (_, key_a) = register_user(&client, "alice");
    let (_, key_b) = register_user(&client, "bob");
    let (_, key_c) = register_user(&client, "carol");
    setup_group(&client, &key_a, "full_crew", &[key_b.as_str(), key_c.as_str()]);

    let server = CallbackServer::start(&[200]);
    register_agent(&client, &key_b, "clawdbot", "default", &server.url());
    register_agent(&client, &key_c, "clawdbot", "default", &server.url());

    let res = client
        .post("/api/v1/messages/send")
        .header(ContentType::JSON)
        .header(bearer(&key_a))
        .body(r#"{"recipient": "full_crew", "recipientType": "group", "message": "ship it"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["status"], "delivered");

    // Exactly one callback per recipient connection, sender excluded
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(server.drain().len(), 2);
}

#[test]
fn test_group_send_requires_membership() {
    let client = test_client();
    let (_, key_a) = register_user(&client, "alice");
    let (_, key_b) = register_user(&client, "bob");
    setup_group(&client, &key_a, "private_crew", &[]);

    let res = client
        .post("/api/v1/messages/send")
        .header(ContentType::JSON)
        .header(bearer(&key_b))
        .body(r#"{"recipient": "private_crew", "recipientType": "group", "message": "hi"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);
}

#[test]
fn test_group_send_unknown_group() {
    let client = test_client();
    let (_, key) = register_user(&client, "alice");
    let res = client
        .post("/api/v1/messages/send")
        .header(ContentType::JSON)
        .header(bearer(&key))
        .body(r#"{"recipient": "no_such_crew", "recipientType": "group", "message": "hi"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::NotFound);
}

#[test]
fn test_group_scoped_policy_gates_group_send() {
    let client = test_client();
    let (_, key_a) = register_user(&client, "alice");
    let (_, key_b) = register_user(&client, "bob");
    let group_id = setup_group(&client, &key_a, "policed_crew", &[key_b.as_str()]);
    let server = CallbackServer::start(&[200]);
    register_agent(&client, &key_b, "clawdbot", "default", &server.url());

    client
        .post("/api/v1/policies")
        .header(ContentType::JSON)
        .header(bearer(&key_a))
        .body(format!(
            r#"{{"scope": "group", "targetId": "{group_id}", "policyType": "heuristic",
                 "policyContent": "{{\"blockedPatterns\": [\"spoilers\"]}}"}}"#
        ))
        .dispatch();

    let res = client
        .post("/api/v1/messages/send")
        .header(ContentType::JSON)
        .header(bearer(&key_a))
        .body(r#"{"recipient": "policed_crew", "recipientType": "group", "message": "no spoilers here"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["status"], "rejected");

    // Group policies bind other members' sends too (shared scope)
    let res = client
        .post("/api/v1/messages/send")
        .header(ContentType::JSON)
        .header(bearer(&key_b))
        .body(r#"{"recipient": "policed_crew", "recipientType": "group", "message": "spoilers ahead"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);
}

#[test]
fn test_sender_excluded_from_fanout() {
    let client = test_client();
    let (_, key_a) = register_user(&client, "alice");
    let (_, key_b) = register_user(&client, "bob");
    setup_group(&client, &key_a, "echo_free", &[key_b.as_str()]);

    let alice_server = CallbackServer::start(&[200]);
    let bob_server = CallbackServer::start(&[200]);
    register_agent(&client, &key_a, "clawdbot", "default", &alice_server.url());
    register_agent(&client, &key_b, "clawdbot", "default", &bob_server.url());

    let res = client
        .post("/api/v1/messages/send")
        .header(ContentType::JSON)
        .header(bearer(&key_a))
        .body(r#"{"recipient": "echo_free", "recipientType": "group", "message": "ping"}"#)
        .dispatch();
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["status"], "delivered");

    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(bob_server.drain().len(), 1);
    assert!(alice_server.drain().is_empty());
}
