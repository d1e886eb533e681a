//! Database tests

use super::*;
use tempfile::TempDir;

const A: &str = "https://a.example/users/ann";
const B: &str = "https://b.example/users/bob";

/// Helper to create a test database
async fn create_test_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let db = Database::connect(&db_path).await.unwrap();
    (db, temp_dir)
}

#[tokio::test]
async fn test_database_connection() {
    let (_db, _temp_dir) = create_test_db().await;
    // Connection successful if we get here without panicking
}

#[tokio::test]
async fn test_insert_pending_follow_is_unique_per_pair() {
    let (db, _temp_dir) = create_test_db().await;

    assert!(db.insert_pending_follow(A, B, Some("https://a.example/follows/1")).await.unwrap());
    assert!(!db.insert_pending_follow(A, B, Some("https://a.example/follows/2")).await.unwrap());
    assert_eq!(db.count_relationships(A, B).await.unwrap(), 1);

    let row = db.get_relationship(A, B).await.unwrap().unwrap();
    assert!(!row.approved);
    assert_eq!(row.state(), RelationshipState::Pending);
    assert_eq!(row.follow_activity_id.as_deref(), Some("https://a.example/follows/1"));
}

#[tokio::test]
async fn test_reverse_pair_is_a_separate_relationship() {
    let (db, _temp_dir) = create_test_db().await;

    db.insert_pending_follow(A, B, None).await.unwrap();
    db.insert_pending_follow(B, A, None).await.unwrap();

    assert_eq!(db.count_relationships(A, B).await.unwrap(), 1);
    assert_eq!(db.count_relationships(B, A).await.unwrap(), 1);
}

#[tokio::test]
async fn test_approve_follow_only_transitions_pending_rows() {
    let (db, _temp_dir) = create_test_db().await;

    assert!(!db.approve_follow(A, B).await.unwrap());

    db.insert_pending_follow(A, B, None).await.unwrap();
    assert!(db.approve_follow(A, B).await.unwrap());
    assert!(!db.approve_follow(A, B).await.unwrap());

    let row = db.get_relationship(A, B).await.unwrap().unwrap();
    assert_eq!(row.state(), RelationshipState::Approved);
}

#[tokio::test]
async fn test_delete_follow_reports_removal() {
    let (db, _temp_dir) = create_test_db().await;

    assert!(!db.delete_follow(A, B).await.unwrap());
    db.insert_pending_follow(A, B, None).await.unwrap();
    assert!(db.delete_follow(A, B).await.unwrap());
    assert!(db.get_relationship(A, B).await.unwrap().is_none());
}

#[tokio::test]
async fn test_delete_pending_follow_keeps_approved_rows() {
    let (db, _temp_dir) = create_test_db().await;

    db.insert_pending_follow(A, B, None).await.unwrap();
    assert!(db.delete_pending_follow(A, B).await.unwrap());
    assert!(!db.delete_pending_follow(A, B).await.unwrap());

    db.insert_pending_follow(A, B, None).await.unwrap();
    db.approve_follow(A, B).await.unwrap();
    assert!(!db.delete_pending_follow(A, B).await.unwrap());
    assert_eq!(
        db.get_relationship(A, B).await.unwrap().unwrap().state(),
        RelationshipState::Approved
    );
}

#[tokio::test]
async fn test_lookup_by_follow_activity_id() {
    let (db, _temp_dir) = create_test_db().await;
    let follow_id = "https://a.example/follows/9";

    db.insert_pending_follow(A, B, Some(follow_id)).await.unwrap();

    let row = db
        .get_relationship_by_follow_id(follow_id, FollowParty::Source(A))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.source_actor_id, A);
    assert_eq!(row.target_actor_id, B);

    let row = db
        .get_relationship_by_follow_id(follow_id, FollowParty::Target(B))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.source_actor_id, A);

    assert!(
        db.get_relationship_by_follow_id("https://a.example/follows/missing", FollowParty::Source(A))
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_follow_id_lookup_is_scoped_to_the_party() {
    let (db, _temp_dir) = create_test_db().await;
    let mallory = "https://m.example/users/mallory";
    let follow_id = "https://a.example/follows/9";

    // Same id claimed by another follower first
    db.insert_pending_follow(mallory, B, Some(follow_id)).await.unwrap();
    db.insert_pending_follow(A, B, Some(follow_id)).await.unwrap();

    let row = db
        .get_relationship_by_follow_id(follow_id, FollowParty::Source(A))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.source_actor_id, A);

    assert!(
        db.get_relationship_by_follow_id(follow_id, FollowParty::Target(A))
            .await
            .unwrap()
            .is_none()
    );
}
