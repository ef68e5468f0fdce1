use super::*;
use shared::domain::CallType;

async fn ctx() -> ApiContext {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    ApiContext::new(
        storage,
        LiveKitConfig {
            api_key: "devkey".into(),
            api_secret: "devsecret".into(),
            ttl_seconds: 60,
        },
        CallPolicy::default(),
    )
}

fn request(initiator: i64, participants: &[i64], is_group: bool) -> InitiateCallRequest {
    InitiateCallRequest {
        user_id: UserId(initiator),
        conversation_id: ConversationId(9),
        channel_name: format!("conv-9-{initiator}"),
        call_type: CallType::Audio,
        is_group,
        group_name: is_group.then(|| "Team".to_string()),
        participant_ids: participants.iter().copied().map(UserId).collect(),
        idempotency_key: None,
    }
}

#[tokio::test]
async fn initiate_creates_ringing_call_with_pending_participants() {
    let ctx = ctx().await;
    let record = initiate_call(&ctx, &request(1, &[2], false))
        .await
        .expect("initiate");

    assert_eq!(record.status, CallStatus::Ringing);
    assert_eq!(record.initiator_id, UserId(1));
    assert_eq!(
        record.participant_state(UserId(2)),
        Some(ParticipantState::Pending)
    );
    assert!(record.started_at.is_none());
    assert!(record.duration_seconds.is_none());
}

#[tokio::test]
async fn initiate_validates_participants() {
    let ctx = ctx().await;

    let err = initiate_call(&ctx, &request(1, &[], false))
        .await
        .expect_err("empty");
    assert_eq!(err.code, ErrorCode::Validation);

    let err = initiate_call(&ctx, &request(1, &[1], false))
        .await
        .expect_err("self call");
    assert_eq!(err.code, ErrorCode::Validation);

    let err = initiate_call(&ctx, &request(1, &[2, 3], false))
        .await
        .expect_err("p2p with two callees");
    assert_eq!(err.code, ErrorCode::Validation);

    let mut bad_channel = request(1, &[2], false);
    bad_channel.channel_name = "bad channel".into();
    let err = initiate_call(&ctx, &bad_channel)
        .await
        .expect_err("channel");
    assert_eq!(err.code, ErrorCode::Validation);
}

#[tokio::test]
async fn duplicate_participants_collapse() {
    let ctx = ctx().await;
    let record = initiate_call(&ctx, &request(1, &[2, 3, 2], true))
        .await
        .expect("initiate");
    assert_eq!(record.participant_ids(), vec![UserId(2), UserId(3)]);
}

#[tokio::test]
async fn repeated_idempotency_key_returns_same_call() {
    let ctx = ctx().await;
    let mut req = request(1, &[2], false);
    req.idempotency_key = Some("tap-1".into());

    let first = initiate_call(&ctx, &req).await.expect("first");
    let second = initiate_call(&ctx, &req).await.expect("second");
    assert_eq!(first.call_id, second.call_id);

    req.idempotency_key = Some("tap-2".into());
    let third = initiate_call(&ctx, &req).await.expect("third");
    assert_ne!(first.call_id, third.call_id);
}

#[tokio::test]
async fn idempotency_key_outside_window_conflicts() {
    let mut ctx = ctx().await;
    ctx.policy.initiate_dedup_window = Duration::zero();
    let mut req = request(1, &[2], false);
    req.idempotency_key = Some("tap-1".into());

    initiate_call(&ctx, &req).await.expect("first");
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let err = initiate_call(&ctx, &req).await.expect_err("stale key");
    assert_eq!(err.code, ErrorCode::Conflict);
}

#[tokio::test]
async fn answered_p2p_call_records_duration() {
    let ctx = ctx().await;
    let call = initiate_call(&ctx, &request(1, &[2], false))
        .await
        .expect("initiate");

    let answered = answer_call(&ctx, UserId(2), call.call_id)
        .await
        .expect("answer");
    assert_eq!(answered.status, CallStatus::Ongoing);
    assert!(answered.started_at.is_some());
    assert_eq!(answered.answered_by(), vec![UserId(2)]);

    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    let ended = end_call(&ctx, UserId(1), call.call_id, EndReason::Hangup)
        .await
        .expect("end");
    assert_eq!(ended.status, CallStatus::Ended);
    assert_eq!(ended.end_reason, Some(EndReason::Hangup));
    assert!(ended.duration_seconds.expect("duration") >= 1);
    assert!(ended.ended_at.expect("ended") >= ended.started_at.expect("started"));
}

#[tokio::test]
async fn answer_twice_is_idempotent() {
    let ctx = ctx().await;
    let call = initiate_call(&ctx, &request(1, &[2], false))
        .await
        .expect("initiate");
    let first = answer_call(&ctx, UserId(2), call.call_id)
        .await
        .expect("answer");
    let second = answer_call(&ctx, UserId(2), call.call_id)
        .await
        .expect("answer again");
    assert_eq!(first.started_at, second.started_at);
}

#[tokio::test]
async fn only_parties_may_act() {
    let ctx = ctx().await;
    let call = initiate_call(&ctx, &request(1, &[2], false))
        .await
        .expect("initiate");

    let err = answer_call(&ctx, UserId(3), call.call_id)
        .await
        .expect_err("stranger");
    assert_eq!(err.code, ErrorCode::Forbidden);

    let err = answer_call(&ctx, UserId(1), call.call_id)
        .await
        .expect_err("initiator");
    assert_eq!(err.code, ErrorCode::Validation);

    let err = get_call(&ctx, UserId(3), call.call_id)
        .await
        .expect_err("stranger read");
    assert_eq!(err.code, ErrorCode::Forbidden);

    let err = get_call(&ctx, UserId(1), CallId(999))
        .await
        .expect_err("missing");
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn caller_cancel_while_ringing_is_missed() {
    let ctx = ctx().await;
    let call = initiate_call(&ctx, &request(1, &[2], false))
        .await
        .expect("initiate");

    let ended = end_call(&ctx, UserId(1), call.call_id, EndReason::Cancelled)
        .await
        .expect("cancel");
    assert_eq!(ended.status, CallStatus::Missed);
    assert_eq!(ended.missed_by(), vec![UserId(2)]);
    assert!(ended.duration_seconds.is_none());

    let again = end_call(&ctx, UserId(1), call.call_id, EndReason::Hangup)
        .await
        .expect("end twice");
    assert_eq!(again.status, CallStatus::Missed);
    assert_eq!(again.ended_at, ended.ended_at);
}

#[tokio::test]
async fn p2p_decline_finishes_call() {
    let ctx = ctx().await;
    let call = initiate_call(&ctx, &request(1, &[2], false))
        .await
        .expect("initiate");

    let declined = decline_call(&ctx, UserId(2), call.call_id, DeclineReason::Declined)
        .await
        .expect("decline");
    assert_eq!(declined.status, CallStatus::Declined);
    assert!(declined.ended_at.is_some());
    assert!(declined.duration_seconds.is_none());

    let err = answer_call(&ctx, UserId(2), call.call_id)
        .await
        .expect_err("answer after decline");
    assert_eq!(err.code, ErrorCode::Conflict);
}

#[tokio::test]
async fn busy_decline_marks_call_busy() {
    let ctx = ctx().await;
    let call = initiate_call(&ctx, &request(1, &[2], false))
        .await
        .expect("initiate");
    let busy = decline_call(&ctx, UserId(2), call.call_id, DeclineReason::Busy)
        .await
        .expect("busy");
    assert_eq!(busy.status, CallStatus::Busy);
    assert_eq!(busy.participant_state(UserId(2)), Some(ParticipantState::Busy));
}

#[tokio::test]
async fn callee_end_while_ringing_declines() {
    let ctx = ctx().await;
    let call = initiate_call(&ctx, &request(1, &[2], false))
        .await
        .expect("initiate");
    let record = end_call(&ctx, UserId(2), call.call_id, EndReason::Hangup)
        .await
        .expect("end");
    assert_eq!(record.status, CallStatus::Declined);
}

#[tokio::test]
async fn group_decline_then_answer_keeps_call_alive() {
    let ctx = ctx().await;
    let call = initiate_call(&ctx, &request(1, &[2, 3], true))
        .await
        .expect("initiate");

    let after_decline = decline_call(&ctx, UserId(2), call.call_id, DeclineReason::Declined)
        .await
        .expect("decline");
    assert_eq!(after_decline.status, CallStatus::Ringing);

    let after_answer = answer_call(&ctx, UserId(3), call.call_id)
        .await
        .expect("answer");
    assert_eq!(after_answer.status, CallStatus::Ongoing);
    assert_eq!(after_answer.answered_by(), vec![UserId(3)]);
    assert_eq!(after_answer.missed_by(), vec![UserId(2)]);
}

#[tokio::test]
async fn group_declined_by_everyone_is_declined() {
    let ctx = ctx().await;
    let call = initiate_call(&ctx, &request(1, &[2, 3], true))
        .await
        .expect("initiate");
    decline_call(&ctx, UserId(2), call.call_id, DeclineReason::Declined)
        .await
        .expect("decline 2");
    let record = decline_call(&ctx, UserId(3), call.call_id, DeclineReason::Busy)
        .await
        .expect("decline 3");
    assert_eq!(record.status, CallStatus::Declined);
    assert!(record.ended_at.is_some());
}

#[tokio::test]
async fn group_leave_keeps_call_until_last_party() {
    let ctx = ctx().await;
    let call = initiate_call(&ctx, &request(1, &[2, 3], true))
        .await
        .expect("initiate");
    answer_call(&ctx, UserId(2), call.call_id)
        .await
        .expect("answer 2");
    answer_call(&ctx, UserId(3), call.call_id)
        .await
        .expect("answer 3");

    let record = leave_call(&ctx, UserId(2), call.call_id, EndReason::Hangup)
        .await
        .expect("leave 2");
    assert_eq!(record.status, CallStatus::Ongoing);
    assert_eq!(record.participant_state(UserId(2)), Some(ParticipantState::Left));
    assert_eq!(record.answered_by(), vec![UserId(2), UserId(3)]);

    let record = leave_call(&ctx, UserId(1), call.call_id, EndReason::Hangup)
        .await
        .expect("initiator leaves");
    assert_eq!(record.status, CallStatus::Ongoing);
    assert_eq!(record.left_by(), vec![UserId(1), UserId(2)]);

    let record = leave_call(&ctx, UserId(3), call.call_id, EndReason::Hangup)
        .await
        .expect("last leaves");
    assert_eq!(record.status, CallStatus::Ended);
    assert!(record.duration_seconds.is_some());
}

#[tokio::test]
async fn leave_rejected_for_p2p() {
    let ctx = ctx().await;
    let call = initiate_call(&ctx, &request(1, &[2], false))
        .await
        .expect("initiate");
    let err = leave_call(&ctx, UserId(1), call.call_id, EndReason::Hangup)
        .await
        .expect_err("p2p leave");
    assert_eq!(err.code, ErrorCode::Validation);
}

#[tokio::test]
async fn ring_timeout_marks_unanswered_call_missed() {
    let ctx = ctx().await;
    let call = initiate_call(&ctx, &request(1, &[2], false))
        .await
        .expect("initiate");

    let outcome = expire_call(&ctx, call.call_id).await.expect("expire");
    assert!(outcome.expired);
    assert_eq!(outcome.newly_missed, vec![UserId(2)]);
    assert_eq!(outcome.record.status, CallStatus::Missed);
    assert!(outcome.record.duration_seconds.is_none());

    let again = expire_call(&ctx, call.call_id).await.expect("expire twice");
    assert!(!again.expired);
    assert!(again.newly_missed.is_empty());
}

#[tokio::test]
async fn ring_timeout_on_ongoing_group_only_misses_stragglers() {
    let ctx = ctx().await;
    let call = initiate_call(&ctx, &request(1, &[2, 3], true))
        .await
        .expect("initiate");
    answer_call(&ctx, UserId(3), call.call_id)
        .await
        .expect("answer");

    let outcome = expire_call(&ctx, call.call_id).await.expect("expire");
    assert!(!outcome.expired);
    assert_eq!(outcome.newly_missed, vec![UserId(2)]);
    assert_eq!(outcome.record.status, CallStatus::Ongoing);
}

#[tokio::test]
async fn media_token_checks_call_membership() {
    let ctx = ctx().await;
    let call = initiate_call(&ctx, &request(1, &[2], false))
        .await
        .expect("initiate");

    let token = issue_media_token(
        &ctx,
        &MediaTokenRequest {
            user_id: UserId(2),
            channel_name: call.channel_name.clone(),
            call_id: Some(call.call_id),
        },
    )
    .await
    .expect("token");
    assert_eq!(token.media_uid, UserId(2).media_uid());
    assert!(!token.token.is_empty());

    let err = issue_media_token(
        &ctx,
        &MediaTokenRequest {
            user_id: UserId(5),
            channel_name: call.channel_name.clone(),
            call_id: Some(call.call_id),
        },
    )
    .await
    .expect_err("stranger");
    assert_eq!(err.code, ErrorCode::Forbidden);

    let err = issue_media_token(
        &ctx,
        &MediaTokenRequest {
            user_id: UserId(2),
            channel_name: "other-room".into(),
            call_id: Some(call.call_id),
        },
    )
    .await
    .expect_err("wrong channel");
    assert_eq!(err.code, ErrorCode::Validation);
}

#[tokio::test]
async fn history_only_lists_calls_the_user_joined() {
    let ctx = ctx().await;
    let first = initiate_call(&ctx, &request(1, &[2], false))
        .await
        .expect("first");
    let second = initiate_call(&ctx, &request(3, &[4], false))
        .await
        .expect("second");
    let third = initiate_call(&ctx, &request(2, &[1], false))
        .await
        .expect("third");

    let calls = list_conversation_calls(&ctx, UserId(1), ConversationId(9), 10, None)
        .await
        .expect("list");
    let ids: Vec<_> = calls.iter().map(|c| c.call_id).collect();
    assert_eq!(ids, vec![third.call_id, first.call_id]);
    assert!(!ids.contains(&second.call_id));
}

#[tokio::test]
async fn login_rejects_blank_username() {
    let ctx = ctx().await;
    let err = login(&ctx, "   ").await.expect_err("blank");
    assert_eq!(err.code, ErrorCode::Validation);
    let alice = login(&ctx, "alice").await.expect("alice");
    assert_eq!(login(&ctx, " alice ").await.expect("again"), alice);
}
