use chrono::Utc;
use shared::{
    domain::{
        FriendRequestRecord, FriendSummary, RequestDirection, RequestId, RequestStatus, Sender,
        UserId, UserSummary,
    },
    error::{ApiError, ErrorCode},
    protocol::{EventSource, ServerEvent},
};
use storage::{InsertRequestOutcome, ResolveOutcome, Storage};
use tracing::{info, warn};

const MAX_REQUEST_MESSAGE_BYTES: usize = 280;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
}

/// A notification owed to one user after a successful transition.
/// Delivery is best-effort; the transition never rolls back on a failed
/// or skipped fanout.
#[derive(Debug, Clone)]
pub struct Fanout {
    pub target: UserId,
    pub event: ServerEvent,
}

pub async fn send_request(
    ctx: &ApiContext,
    sender_id: UserId,
    recipient_id: UserId,
    message: Option<String>,
) -> Result<(RequestId, Vec<Fanout>), ApiError> {
    if sender_id == recipient_id {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "cannot send a friend request to yourself",
        ));
    }
    let message = message.unwrap_or_default();
    if message.len() > MAX_REQUEST_MESSAGE_BYTES {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "request message is too long",
        ));
    }
    if !ctx
        .storage
        .user_exists(recipient_id)
        .await
        .map_err(internal)?
    {
        return Err(ApiError::new(ErrorCode::NotFound, "no such user"));
    }

    let request_id = RequestId::generate();
    let now = Utc::now();
    // The store re-checks both preconditions inside the insert transaction,
    // so the later of two racing senders observes the earlier row and fails
    // here instead of creating a second pending request for the pair.
    let outcome = ctx
        .storage
        .try_insert_request_pair(request_id, sender_id, recipient_id, &message, now)
        .await
        .map_err(internal)?;
    match outcome {
        InsertRequestOutcome::Created => {}
        InsertRequestOutcome::AlreadyFriends => {
            return Err(ApiError::new(
                ErrorCode::PreconditionFailed,
                "you are already friends",
            ));
        }
        InsertRequestOutcome::DuplicatePending(_) => {
            return Err(ApiError::new(
                ErrorCode::PreconditionFailed,
                "a pending request already exists between these users",
            ));
        }
    }

    info!(
        sender_id = sender_id.0,
        recipient_id = recipient_id.0,
        request_id = %request_id,
        "friend request created"
    );

    let fanout = vec![Fanout {
        target: recipient_id,
        event: ServerEvent::NewFriendRequest {
            sender: sender_summary(ctx, sender_id).await,
            message,
            request_id,
            recipient_id,
            timestamp: now,
        },
    }];
    Ok((request_id, fanout))
}

pub async fn accept_request(
    ctx: &ApiContext,
    request_id: RequestId,
    accepter_id: UserId,
) -> Result<Vec<Fanout>, ApiError> {
    let side = received_side(ctx, request_id, accepter_id).await?;
    if side.status.is_terminal() {
        return Err(ApiError::new(
            ErrorCode::PreconditionFailed,
            "request already resolved",
        ));
    }

    let sender_id = side.other_user_id;
    let now = Utc::now();
    let outcome = ctx
        .storage
        .resolve_request_pair(request_id, sender_id, accepter_id, RequestStatus::Accepted, now)
        .await
        .map_err(internal)?;
    if outcome == ResolveOutcome::AlreadyResolved {
        return Err(ApiError::new(
            ErrorCode::PreconditionFailed,
            "request already resolved",
        ));
    }

    info!(
        request_id = %request_id,
        accepter_id = accepter_id.0,
        sender_id = sender_id.0,
        "friend request accepted"
    );

    Ok(vec![Fanout {
        target: sender_id,
        event: ServerEvent::FriendRequestAccepted {
            acceptor: sender_summary(ctx, accepter_id).await,
            request_id,
            timestamp: now,
            source: EventSource::Server,
        },
    }])
}

pub async fn reject_request(
    ctx: &ApiContext,
    request_id: RequestId,
    rejecter_id: UserId,
) -> Result<Vec<Fanout>, ApiError> {
    let side = received_side(ctx, request_id, rejecter_id).await?;
    if side.status.is_terminal() {
        return Err(ApiError::new(
            ErrorCode::PreconditionFailed,
            "request already resolved",
        ));
    }

    let sender_id = side.other_user_id;
    let now = Utc::now();
    let outcome = ctx
        .storage
        .resolve_request_pair(request_id, sender_id, rejecter_id, RequestStatus::Rejected, now)
        .await
        .map_err(internal)?;
    if outcome == ResolveOutcome::AlreadyResolved {
        return Err(ApiError::new(
            ErrorCode::PreconditionFailed,
            "request already resolved",
        ));
    }

    info!(
        request_id = %request_id,
        rejecter_id = rejecter_id.0,
        "friend request rejected"
    );

    Ok(vec![Fanout {
        target: sender_id,
        event: ServerEvent::FriendRequestRejected {
            rejected_by: sender_summary(ctx, rejecter_id).await,
            request_id,
            timestamp: now,
        },
    }])
}

/// Sender-side withdrawal of a still-pending request. No notification:
/// the recipient converges on the next authoritative fetch.
pub async fn cancel_request(
    ctx: &ApiContext,
    request_id: RequestId,
    sender_id: UserId,
) -> Result<(), ApiError> {
    let side = ctx
        .storage
        .request_side(request_id, sender_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "request not found"))?;
    if side.direction != RequestDirection::Sent {
        return Err(ApiError::new(ErrorCode::NotFound, "request not found"));
    }
    if !ctx
        .storage
        .delete_pending_request_pair(request_id)
        .await
        .map_err(internal)?
    {
        return Err(ApiError::new(
            ErrorCode::PreconditionFailed,
            "request already resolved",
        ));
    }
    info!(request_id = %request_id, sender_id = sender_id.0, "friend request cancelled");
    Ok(())
}

pub async fn remove_friend(
    ctx: &ApiContext,
    user_id: UserId,
    friend_id: UserId,
) -> Result<Vec<Fanout>, ApiError> {
    let removed = ctx
        .storage
        .remove_friend_pair(user_id, friend_id)
        .await
        .map_err(internal)?;
    if !removed {
        return Err(ApiError::new(
            ErrorCode::PreconditionFailed,
            "you are not friends with this user",
        ));
    }

    info!(user_id = user_id.0, friend_id = friend_id.0, "friendship removed");

    Ok(vec![Fanout {
        target: friend_id,
        event: ServerEvent::FriendRemoved {
            removed_by: sender_summary(ctx, user_id).await,
            timestamp: Utc::now(),
        },
    }])
}

pub async fn list_friends(ctx: &ApiContext, user_id: UserId) -> Result<Vec<FriendSummary>, ApiError> {
    ctx.storage.list_friends(user_id).await.map_err(internal)
}

pub async fn list_requests(
    ctx: &ApiContext,
    user_id: UserId,
) -> Result<(Vec<FriendRequestRecord>, Vec<FriendRequestRecord>), ApiError> {
    let records = ctx
        .storage
        .list_request_records(user_id)
        .await
        .map_err(internal)?;
    Ok(records
        .into_iter()
        .partition(|record| record.direction == RequestDirection::Sent))
}

/// Repair pass for mirrored-status divergence. A terminal status beats
/// `pending`. When both sides are terminal and disagree, the recipient's
/// copy wins, since only the recipient is authorized to resolve a request.
/// Returns the number of repaired pairs.
pub async fn run_consistency_sweep(ctx: &ApiContext) -> Result<u32, ApiError> {
    let divergent = ctx
        .storage
        .find_divergent_requests()
        .await
        .map_err(internal)?;
    let mut repaired = 0;
    for entry in divergent {
        let winner = if entry.recipient_status.is_terminal() {
            entry.recipient_status
        } else {
            entry.sender_status
        };
        warn!(
            request_id = %entry.request_id,
            sender_status = ?entry.sender_status,
            recipient_status = ?entry.recipient_status,
            resolved_to = ?winner,
            "repairing divergent mirrored request"
        );
        ctx.storage
            .repair_request_status(
                entry.request_id,
                winner,
                entry.sender_id,
                entry.recipient_id,
                Utc::now(),
            )
            .await
            .map_err(internal)?;
        repaired += 1;
    }
    Ok(repaired)
}

async fn received_side(
    ctx: &ApiContext,
    request_id: RequestId,
    owner_id: UserId,
) -> Result<storage::StoredRequestSide, ApiError> {
    let side = ctx
        .storage
        .request_side(request_id, owner_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "request not found"))?;
    // A sender cannot resolve their own request; to them it does not exist
    // as a received record.
    if side.direction != RequestDirection::Received {
        return Err(ApiError::new(ErrorCode::NotFound, "request not found"));
    }
    Ok(side)
}

async fn sender_summary(ctx: &ApiContext, user_id: UserId) -> Sender {
    match ctx.storage.username_for_user(user_id).await {
        Ok(Some(username)) => Sender::Populated(UserSummary { user_id, username }),
        _ => Sender::Id(user_id),
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
