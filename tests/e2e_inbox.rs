//! E2E tests for the inbox endpoints

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{BOB, CAROL, LOCAL_ACTOR, TestServer, json_body, signed_request, signed_request_at};
use driftwood::data::RelationshipState;
use driftwood::error::{AppError, StateError};
use driftwood::federation::{Activity, ActivityType, DispatchOutcome};

#[tokio::test]
async fn follow_then_accept_approves_the_pair() {
    let server = TestServer::new().await;
    let follow = Activity::follow("https://remote.invalid/follows/1", CAROL, BOB);

    let response = server.post_signed("/inbox", &follow).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(
        server
            .wait_for_state(CAROL, BOB, RelationshipState::Pending)
            .await,
        RelationshipState::Pending
    );

    let accept = Activity::respond(
        ActivityType::Accept,
        "https://remote.invalid/accepts/1",
        BOB,
        &follow,
    );
    let response = server.post_signed("/inbox", &accept).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(
        server
            .wait_for_state(CAROL, BOB, RelationshipState::Approved)
            .await,
        RelationshipState::Approved
    );
}

#[tokio::test]
async fn undo_after_accept_removes_the_pair() {
    let server = TestServer::new().await;
    let follow = Activity::follow("https://remote.invalid/follows/2", CAROL, BOB);
    let accept = Activity::respond(
        ActivityType::Accept,
        "https://remote.invalid/accepts/2",
        BOB,
        &follow,
    );

    server.post_signed("/inbox", &follow).await;
    server.post_signed("/inbox", &accept).await;
    server
        .wait_for_state(CAROL, BOB, RelationshipState::Approved)
        .await;

    let undo = Activity::respond(
        ActivityType::Undo,
        "https://remote.invalid/undos/2",
        CAROL,
        &follow,
    );
    let response = server.post_signed("/inbox", &undo).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(
        server
            .wait_for_state(CAROL, BOB, RelationshipState::Absent)
            .await,
        RelationshipState::Absent
    );
}

#[tokio::test]
async fn undo_by_follow_id_right_after_follow_removes_the_pair() {
    let server = TestServer::new().await;
    let follow = Activity::follow("https://remote.invalid/follows/10", CAROL, BOB);
    let undo = Activity::decode(serde_json::json!({
        "id": "https://remote.invalid/undos/10",
        "type": "Undo",
        "actor": CAROL,
        "object": follow.id
    }))
    .unwrap();

    server.post_signed("/inbox", &follow).await;
    let response = server.post_signed("/inbox", &undo).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(
        server
            .wait_for_state(CAROL, BOB, RelationshipState::Absent)
            .await,
        RelationshipState::Absent
    );
}

#[tokio::test]
async fn mixed_case_query_is_verified() {
    let server = TestServer::new().await;
    let follow = Activity::follow("https://remote.invalid/follows/11", BOB, LOCAL_ACTOR);

    let response = server
        .post_signed("/users/alice/inbox?Source=Remote", &follow)
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(
        server
            .wait_for_state(BOB, LOCAL_ACTOR, RelationshipState::Pending)
            .await,
        RelationshipState::Pending
    );
}

#[tokio::test]
async fn repeated_follow_keeps_one_row() {
    let server = TestServer::new().await;
    let follow = Activity::follow("https://remote.invalid/follows/3", CAROL, BOB);

    server.post_signed("/inbox", &follow).await;
    server.post_signed("/inbox", &follow).await;
    server
        .wait_for_state(CAROL, BOB, RelationshipState::Pending)
        .await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let count = server.state.db.count_relationships(CAROL, BOB).await.unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn personal_inbox_accepts_signed_activities() {
    let server = TestServer::new().await;
    let follow = Activity::follow("https://remote.invalid/follows/4", BOB, LOCAL_ACTOR);

    let response = server.post_signed("/users/alice/inbox", &follow).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(
        server
            .wait_for_state(BOB, LOCAL_ACTOR, RelationshipState::Pending)
            .await,
        RelationshipState::Pending
    );
}

#[tokio::test]
async fn unknown_username_inbox_is_not_found() {
    let server = TestServer::new().await;
    let follow = Activity::follow("https://remote.invalid/follows/5", BOB, LOCAL_ACTOR);

    let response = server.post_signed("/users/nobody/inbox", &follow).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unsigned_request_is_unauthorized() {
    let server = TestServer::new().await;
    let follow = Activity::follow("https://remote.invalid/follows/6", BOB, LOCAL_ACTOR);

    let request = Request::post("/inbox")
        .header("host", "local.example")
        .header("content-type", "application/activity+json")
        .body(Body::from(follow.to_bytes()))
        .unwrap();
    let response = server.send(request).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn invalid_json_is_bad_request() {
    let server = TestServer::new().await;

    let response = server
        .send(signed_request("/inbox", BOB, b"{not json"))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = json_body(response).await;
    assert!(body["error"].as_str().unwrap().contains("Invalid JSON"));
}

#[tokio::test]
async fn unsupported_type_is_bad_request() {
    let server = TestServer::new().await;
    let payload = serde_json::json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": "https://remote.invalid/questions/1",
        "type": "Question",
        "actor": BOB,
        "object": "https://remote.invalid/notes/1"
    })
    .to_string();

    let response = server
        .send(signed_request("/inbox", BOB, payload.as_bytes()))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn forged_actor_is_acknowledged_then_dropped() {
    let server = TestServer::new().await;
    // Signed by bob, claiming to be carol
    let follow = Activity::follow("https://remote.invalid/follows/7", CAROL, LOCAL_ACTOR);

    let response = server
        .send(signed_request("/inbox", BOB, &follow.to_bytes()))
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(
        server
            .wait_for_state(CAROL, LOCAL_ACTOR, RelationshipState::Pending)
            .await,
        RelationshipState::Absent
    );
}

#[tokio::test]
async fn stale_date_is_acknowledged_then_dropped() {
    let server = TestServer::new().await;
    let follow = Activity::follow("https://remote.invalid/follows/8", BOB, LOCAL_ACTOR);
    let ten_minutes_ago = chrono::Utc::now() - chrono::Duration::minutes(10);

    let response = server
        .send(signed_request_at(
            "/inbox",
            BOB,
            &follow.to_bytes(),
            ten_minutes_ago,
        ))
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(
        server
            .wait_for_state(BOB, LOCAL_ACTOR, RelationshipState::Pending)
            .await,
        RelationshipState::Absent
    );
}

#[tokio::test]
async fn local_approval_requires_the_target_actor() {
    let server = TestServer::new().await;
    let follow = Activity::follow("https://remote.invalid/follows/9", BOB, LOCAL_ACTOR);

    server.post_signed("/inbox", &follow).await;
    server
        .wait_for_state(BOB, LOCAL_ACTOR, RelationshipState::Pending)
        .await;

    let denied = server
        .state
        .dispatcher
        .approve_follow_request(CAROL, BOB)
        .await;
    assert!(matches!(
        denied,
        Err(AppError::State(StateError::NotAuthorized))
    ));

    // Accept delivery to remote.invalid fails; the approval stands
    let outcome = server
        .state
        .dispatcher
        .approve_follow_request(LOCAL_ACTOR, BOB)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        DispatchOutcome::Transition {
            from: RelationshipState::Pending,
            to: RelationshipState::Approved,
        }
    );
    assert_eq!(
        server
            .wait_for_state(BOB, LOCAL_ACTOR, RelationshipState::Approved)
            .await,
        RelationshipState::Approved
    );
}
