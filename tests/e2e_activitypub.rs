//! E2E tests for the local actor document

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{LOCAL_ACTOR, TestServer, json_body};

#[tokio::test]
async fn actor_document_advertises_the_signing_key() {
    let server = TestServer::new().await;

    let response = server
        .send(Request::get("/users/alice").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "application/activity+json"
    );

    let document = json_body(response).await;
    assert_eq!(document["id"], LOCAL_ACTOR);
    assert_eq!(document["type"], "Person");
    assert_eq!(document["inbox"], format!("{LOCAL_ACTOR}/inbox"));
    assert_eq!(document["endpoints"]["sharedInbox"], "https://local.example/inbox");
    assert_eq!(document["publicKey"]["id"], format!("{LOCAL_ACTOR}#main-key"));
    assert_eq!(document["publicKey"]["owner"], LOCAL_ACTOR);
    assert_eq!(
        document["publicKey"]["publicKeyPem"],
        common::keys()[0].public_key_pem.as_str()
    );
}

#[tokio::test]
async fn unknown_actor_document_is_not_found() {
    let server = TestServer::new().await;

    let response = server
        .send(Request::get("/users/nobody").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
