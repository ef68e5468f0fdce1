use super::*;

fn new_call(initiator: UserId, participants: Vec<UserId>, key: Option<&str>) -> NewCall {
    NewCall {
        conversation_id: ConversationId(5),
        channel_name: "conv-5-abc".into(),
        call_type: CallType::Video,
        is_group: participants.len() > 1,
        group_name: None,
        initiator_id: initiator,
        participant_ids: participants,
        idempotency_key: key.map(str::to_string),
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn create_user_is_idempotent_on_username() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let first = storage.create_user("alice").await.expect("user");
    let second = storage.create_user("alice").await.expect("user");
    assert_eq!(first, second);
    assert_eq!(
        storage.username_for_user(first).await.expect("lookup"),
        Some("alice".to_string())
    );
}

#[tokio::test]
async fn inserted_call_starts_ringing_with_pending_participants() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let call_id = storage
        .insert_call(&new_call(UserId(1), vec![UserId(2), UserId(3)], None))
        .await
        .expect("insert");

    let record = storage.load_call(call_id).await.expect("load").expect("exists");
    assert_eq!(record.status, CallStatus::Ringing);
    assert_eq!(record.initiator_id, UserId(1));
    assert_eq!(record.participant_ids(), vec![UserId(2), UserId(3)]);
    assert!(record
        .participants
        .iter()
        .all(|p| p.state == ParticipantState::Pending));
    assert!(record.started_at.is_none());
}

#[tokio::test]
async fn save_call_state_persists_participants_and_timing() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let call_id = storage
        .insert_call(&new_call(UserId(1), vec![UserId(2)], None))
        .await
        .expect("insert");

    let mut record = storage.load_call(call_id).await.expect("load").expect("exists");
    let now = Utc::now();
    record.status = CallStatus::Ended;
    record.started_at = Some(now);
    record.ended_at = Some(now);
    record.duration_seconds = Some(0);
    record.end_reason = Some(EndReason::Hangup);
    record.participants[0].state = ParticipantState::Answered;
    record.participants[0].answered_at = Some(now);
    storage.save_call_state(&record).await.expect("save");

    let reloaded = storage.load_call(call_id).await.expect("load").expect("exists");
    assert_eq!(reloaded.status, CallStatus::Ended);
    assert_eq!(reloaded.duration_seconds, Some(0));
    assert_eq!(reloaded.end_reason, Some(EndReason::Hangup));
    assert_eq!(reloaded.participants[0].state, ParticipantState::Answered);
    assert!(reloaded.participants[0].answered_at.is_some());
}

#[tokio::test]
async fn save_call_state_rejects_unknown_call() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let call_id = storage
        .insert_call(&new_call(UserId(1), vec![UserId(2)], None))
        .await
        .expect("insert");
    let mut record = storage.load_call(call_id).await.expect("load").expect("exists");
    record.call_id = CallId(9_999);
    assert!(storage.save_call_state(&record).await.is_err());
}

#[tokio::test]
async fn idempotency_key_is_unique_per_initiator() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let call_id = storage
        .insert_call(&new_call(UserId(1), vec![UserId(2)], Some("key-1")))
        .await
        .expect("insert");

    let found = storage
        .find_call_by_idempotency_key(UserId(1), "key-1")
        .await
        .expect("lookup")
        .expect("found");
    assert_eq!(found.call_id, call_id);

    assert!(storage
        .insert_call(&new_call(UserId(1), vec![UserId(2)], Some("key-1")))
        .await
        .is_err());
    storage
        .insert_call(&new_call(UserId(3), vec![UserId(2)], Some("key-1")))
        .await
        .expect("other initiator may reuse key");
}

#[tokio::test]
async fn lists_conversation_calls_newest_first_with_paging() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let first = storage
        .insert_call(&new_call(UserId(1), vec![UserId(2)], None))
        .await
        .expect("first");
    let second = storage
        .insert_call(&new_call(UserId(1), vec![UserId(2)], None))
        .await
        .expect("second");
    let third = storage
        .insert_call(&new_call(UserId(2), vec![UserId(1)], None))
        .await
        .expect("third");

    let page = storage
        .list_calls_for_conversation(ConversationId(5), 2, None)
        .await
        .expect("page");
    assert_eq!(
        page.iter().map(|c| c.call_id).collect::<Vec<_>>(),
        vec![third, second]
    );

    let older = storage
        .list_calls_for_conversation(ConversationId(5), 10, Some(second))
        .await
        .expect("older");
    assert_eq!(older.iter().map(|c| c.call_id).collect::<Vec<_>>(), vec![first]);

    let other = storage
        .list_calls_for_conversation(ConversationId(6), 10, None)
        .await
        .expect("other");
    assert!(other.is_empty());
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = std::env::temp_dir().join(format!("primazul_storage_test_{suffix}"));
    let db_path = temp_root.join("nested").join("calls.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );

    std::fs::remove_dir_all(temp_root).expect("cleanup");
}
