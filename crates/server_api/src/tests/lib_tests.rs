use super::*;
use storage::Storage;

async fn setup() -> (ApiContext, UserId, UserId) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let ash = storage.create_user("ash").await.expect("user");
    let mira = storage.create_user("mira").await.expect("user");
    (ApiContext { storage }, ash, mira)
}

#[tokio::test]
async fn send_request_notifies_the_recipient() {
    let (ctx, ash, mira) = setup().await;

    let (request_id, fanout) = send_request(&ctx, ash, mira, Some("gg last night".into()))
        .await
        .expect("send");

    assert_eq!(fanout.len(), 1);
    assert_eq!(fanout[0].target, mira);
    match &fanout[0].event {
        ServerEvent::NewFriendRequest {
            sender,
            message,
            request_id: event_request_id,
            recipient_id,
            ..
        } => {
            assert_eq!(sender.user_id(), ash);
            assert!(matches!(sender, Sender::Populated(s) if s.username == "ash"));
            assert_eq!(message, "gg last night");
            assert_eq!(*event_request_id, request_id);
            assert_eq!(*recipient_id, mira);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn send_request_rejects_self_and_unknown_targets() {
    let (ctx, ash, _mira) = setup().await;

    let err = send_request(&ctx, ash, ash, None).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::Validation);

    let err = send_request(&ctx, ash, UserId(9999), None)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn send_request_caps_the_message_length() {
    let (ctx, ash, mira) = setup().await;
    let long = "x".repeat(MAX_REQUEST_MESSAGE_BYTES + 1);

    let err = send_request(&ctx, ash, mira, Some(long)).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::Validation);

    let exact = "x".repeat(MAX_REQUEST_MESSAGE_BYTES);
    send_request(&ctx, ash, mira, Some(exact))
        .await
        .expect("max-length message is allowed");
}

#[tokio::test]
async fn crossing_requests_leave_exactly_one_pending_pair() {
    let (ctx, ash, mira) = setup().await;

    send_request(&ctx, ash, mira, None).await.expect("first");
    let err = send_request(&ctx, mira, ash, None).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::PreconditionFailed);

    let (_, received) = list_requests(&ctx, mira).await.expect("list");
    assert_eq!(received.len(), 1);
}

// Both sides fire at once against a file-backed store; the in-transaction
// precondition re-check must let exactly one through.
#[tokio::test(flavor = "multi_thread")]
async fn concurrent_crossing_requests_create_exactly_one_pair() {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let path = std::env::temp_dir().join(format!("squadlink_race_{suffix}.db"));
    let url = format!("sqlite://{}", path.display());

    let storage = Storage::new(&url).await.expect("db");
    let ash = storage.create_user("ash").await.expect("user");
    let mira = storage.create_user("mira").await.expect("user");
    let ctx = ApiContext { storage };

    let forward = {
        let ctx = ctx.clone();
        tokio::spawn(async move { send_request(&ctx, ash, mira, None).await })
    };
    let backward = {
        let ctx = ctx.clone();
        tokio::spawn(async move { send_request(&ctx, mira, ash, None).await })
    };
    let outcomes = [forward.await.expect("join"), backward.await.expect("join")];

    assert_eq!(outcomes.iter().filter(|outcome| outcome.is_ok()).count(), 1);
    let refusal = outcomes
        .into_iter()
        .find_map(Result::err)
        .expect("one refusal");
    assert_eq!(refusal.code, ErrorCode::PreconditionFailed);

    let (_, ash_received) = list_requests(&ctx, ash).await.expect("list");
    let (_, mira_received) = list_requests(&ctx, mira).await.expect("list");
    assert_eq!(ash_received.len() + mira_received.len(), 1);

    for leftover in [
        path.clone(),
        path.with_extension("db-wal"),
        path.with_extension("db-shm"),
    ] {
        let _ = std::fs::remove_file(leftover);
    }
}

#[tokio::test]
async fn accept_links_users_and_notifies_the_sender() {
    let (ctx, ash, mira) = setup().await;
    let (request_id, _) = send_request(&ctx, ash, mira, None).await.expect("send");

    let fanout = accept_request(&ctx, request_id, mira).await.expect("accept");
    assert_eq!(fanout.len(), 1);
    assert_eq!(fanout[0].target, ash);
    match &fanout[0].event {
        ServerEvent::FriendRequestAccepted {
            acceptor,
            request_id: event_request_id,
            ..
        } => {
            assert_eq!(acceptor.user_id(), mira);
            assert_eq!(*event_request_id, request_id);
        }
        other => panic!("unexpected event {other:?}"),
    }

    let friends = list_friends(&ctx, ash).await.expect("list");
    assert_eq!(friends.len(), 1);
    assert_eq!(friends[0].user_id, mira);
    let friends = list_friends(&ctx, mira).await.expect("list");
    assert_eq!(friends[0].user_id, ash);
}

#[tokio::test]
async fn only_the_recipient_can_resolve_a_request() {
    let (ctx, ash, mira) = setup().await;
    let (request_id, _) = send_request(&ctx, ash, mira, None).await.expect("send");

    let err = accept_request(&ctx, request_id, ash).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::NotFound);
    let err = reject_request(&ctx, request_id, ash).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn resolved_requests_stay_resolved() {
    let (ctx, ash, mira) = setup().await;
    let (request_id, _) = send_request(&ctx, ash, mira, None).await.expect("send");

    accept_request(&ctx, request_id, mira).await.expect("accept");

    let err = accept_request(&ctx, request_id, mira).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::PreconditionFailed);
    let err = reject_request(&ctx, request_id, mira).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::PreconditionFailed);
}

#[tokio::test]
async fn reject_then_resend_starts_over() {
    let (ctx, ash, mira) = setup().await;
    let (first, _) = send_request(&ctx, ash, mira, None).await.expect("send");

    let fanout = reject_request(&ctx, first, mira).await.expect("reject");
    assert!(matches!(
        fanout[0].event,
        ServerEvent::FriendRequestRejected { .. }
    ));
    assert!(list_friends(&ctx, ash).await.expect("list").is_empty());

    let (second, _) = send_request(&ctx, ash, mira, None).await.expect("resend");
    assert_ne!(first, second);
}

#[tokio::test]
async fn cancel_is_sender_only_and_pending_only() {
    let (ctx, ash, mira) = setup().await;
    let (request_id, _) = send_request(&ctx, ash, mira, None).await.expect("send");

    let err = cancel_request(&ctx, request_id, mira).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::NotFound);

    cancel_request(&ctx, request_id, ash).await.expect("cancel");
    let (sent, received) = list_requests(&ctx, ash).await.expect("list");
    assert!(sent.is_empty() && received.is_empty());

    let (request_id, _) = send_request(&ctx, ash, mira, None).await.expect("send");
    accept_request(&ctx, request_id, mira).await.expect("accept");
    let err = cancel_request(&ctx, request_id, ash).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::PreconditionFailed);
}

#[tokio::test]
async fn remove_friend_notifies_the_other_side() {
    let (ctx, ash, mira) = setup().await;
    let (request_id, _) = send_request(&ctx, ash, mira, None).await.expect("send");
    accept_request(&ctx, request_id, mira).await.expect("accept");

    let fanout = remove_friend(&ctx, ash, mira).await.expect("remove");
    assert_eq!(fanout[0].target, mira);
    assert!(matches!(fanout[0].event, ServerEvent::FriendRemoved { .. }));
    assert!(list_friends(&ctx, ash).await.expect("list").is_empty());

    let err = remove_friend(&ctx, ash, mira).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::PreconditionFailed);
}

#[tokio::test]
async fn sweep_repairs_a_diverged_pair_toward_the_recipient() {
    let (ctx, ash, mira) = setup().await;
    let (request_id, _) = send_request(&ctx, ash, mira, None).await.expect("send");

    // Simulate an external writer that updated only the recipient's copy.
    ctx.storage
        .force_side_status(request_id, mira, RequestStatus::Accepted)
        .await
        .expect("force");

    let repaired = run_consistency_sweep(&ctx).await.expect("sweep");
    assert_eq!(repaired, 1);

    let friends = list_friends(&ctx, ash).await.expect("list");
    assert_eq!(friends.len(), 1);
    assert_eq!(run_consistency_sweep(&ctx).await.expect("sweep"), 0);
}

#[tokio::test]
async fn list_requests_splits_sent_and_received() {
    let (ctx, ash, mira) = setup().await;
    let kai = ctx.storage.create_user("kai").await.expect("user");

    send_request(&ctx, ash, mira, None).await.expect("send");
    send_request(&ctx, kai, ash, None).await.expect("send");

    let (sent, received) = list_requests(&ctx, ash).await.expect("list");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].other_username, "mira");
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].other_username, "kai");
}
