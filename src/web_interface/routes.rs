use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use log::{debug, warn};
use warp::http::StatusCode;
use warp::reply::{self, Response};
use warp::{Filter, Rejection, Reply};

use super::types::{
    ApiError, HealthResponse, HeartbeatRequest, NodeResponse, StartSessionRequest,
    StartSessionResponse, TimeResponse,
};
use crate::error_handling::types::{SessionError, UploadError};
use crate::roster::RosterRegistry;
use crate::session_management::{AssemblerHandle, TriggerBroadcaster};
use crate::status_bus::LivenessAnnouncement;
use crate::storage::types::is_valid_identifier;
use crate::upload_receiver::{UploadReceiver, UploadRequest, ATTEMPT_HEADER, NODE_ID_HEADER};

/// Shared handles every route needs.
#[derive(Clone)]
pub struct WebContext {
    pub broadcaster: Arc<TriggerBroadcaster>,
    pub assembler: AssemblerHandle,
    pub receiver: Arc<UploadReceiver>,
    pub roster: Arc<RosterRegistry>,
    pub freshness: chrono::Duration,
}

fn error_reply(status: StatusCode, message: impl Into<String>) -> Response {
    reply::with_status(
        reply::json(&ApiError {
            message: message.into(),
        }),
        status,
    )
    .into_response()
}

fn session_error_status(err: &SessionError) -> StatusCode {
    match err {
        SessionError::SessionBusy(_) => StatusCode::CONFLICT,
        SessionError::RosterEmpty | SessionError::InvalidNode(_) => StatusCode::BAD_REQUEST,
        SessionError::NotFound(_) => StatusCode::NOT_FOUND,
        SessionError::AssemblerUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        SessionError::StorageError(_) | SessionError::BusError(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn upload_error_status(err: &UploadError) -> StatusCode {
    match err {
        UploadError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        UploadError::EmptyPayload
        | UploadError::InvalidIdentifier(_)
        | UploadError::InvalidAttempt(_) => StatusCode::BAD_REQUEST,
        UploadError::StorageError(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// POST /sessions
pub fn start_session_route(
    ctx: WebContext,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    warp::path!("sessions")
        .and(warp::post())
        .and(warp::body::bytes())
        .and_then(move |body: Bytes| {
            let broadcaster = ctx.broadcaster.clone();
            async move {
                let request = if body.iter().all(u8::is_ascii_whitespace) {
                    StartSessionRequest::default()
                } else {
                    match serde_json::from_slice::<StartSessionRequest>(&body) {
                        Ok(r) => r,
                        Err(e) => {
                            return Ok::<_, Rejection>(error_reply(
                                StatusCode::BAD_REQUEST,
                                format!("Invalid session request: {}", e),
                            ))
                        }
                    }
                };
                match broadcaster.start_session(request.into()).await {
                    Ok(started) => Ok::<_, Rejection>(
                        reply::json(&StartSessionResponse::from(started)).into_response(),
                    ),
                    Err(e) => {
                        warn!("Session start refused: {}", e);
                        Ok::<_, Rejection>(error_reply(session_error_status(&e), e.to_string()))
                    }
                }
            }
        })
}

/// GET /sessions
pub fn list_sessions_route(
    ctx: WebContext,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    warp::path!("sessions")
        .and(warp::get())
        .and_then(move || {
            let assembler = ctx.assembler.clone();
            async move {
                match assembler.list_sessions().await {
                    Ok(list) => Ok::<_, Rejection>(reply::json(&list).into_response()),
                    Err(e) => Ok::<_, Rejection>(error_reply(
                        session_error_status(&e),
                        e.to_string(),
                    )),
                }
            }
        })
}

/// GET /sessions/:id
pub fn get_session_route(
    ctx: WebContext,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    warp::path!("sessions" / String)
        .and(warp::get())
        .and_then(move |session_id: String| {
            let assembler = ctx.assembler.clone();
            async move {
                match assembler.get_session(&session_id).await {
                    Ok(snapshot) => Ok::<_, Rejection>(reply::json(&snapshot).into_response()),
                    Err(e) => Ok::<_, Rejection>(error_reply(
                        session_error_status(&e),
                        e.to_string(),
                    )),
                }
            }
        })
}

/// POST /sessions/:id/upload
///
/// The body is the raw image; node identity and attempt come from the
/// `x-node-id` and `x-attempt` headers.
pub fn upload_route(
    ctx: WebContext,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    let limit = ctx.receiver.max_bytes() as u64;
    warp::path!("sessions" / String / "upload")
        .and(warp::post())
        .and(warp::header::<String>(NODE_ID_HEADER))
        .and(warp::header::<u32>(ATTEMPT_HEADER))
        .and(warp::body::content_length_limit(limit))
        .and(warp::body::bytes())
        .and_then(
            move |session_id: String, node_id: String, attempt: u32, payload: Bytes| {
                let receiver = ctx.receiver.clone();
                async move {
                    let request = UploadRequest {
                        session_id,
                        node_id,
                        attempt,
                        payload,
                    };
                    match receiver.accept(request).await {
                        Ok(receipt) => Ok::<_, Rejection>(reply::json(&receipt).into_response()),
                        Err(e) => {
                            Ok::<_, Rejection>(error_reply(upload_error_status(&e), e.to_string()))
                        }
                    }
                }
            },
        )
}

/// GET /nodes
pub fn list_nodes_route(
    ctx: WebContext,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    warp::path!("nodes")
        .and(warp::get())
        .and_then(move || {
            let roster = ctx.roster.clone();
            let freshness = ctx.freshness;
            async move {
                let nodes: Vec<NodeResponse> = roster
                    .list_known_nodes()
                    .into_iter()
                    .map(|node| {
                        let online = RosterRegistry::is_online(&node, freshness);
                        NodeResponse { node, online }
                    })
                    .collect();
                Ok::<_, Rejection>(reply::json(&nodes).into_response())
            }
        })
}

/// POST /nodes/:id/heartbeat
///
/// Without an `address` in the body the peer address of the request is recorded.
pub fn heartbeat_route(
    ctx: WebContext,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    warp::path!("nodes" / String / "heartbeat")
        .and(warp::post())
        .and(warp::addr::remote())
        .and(warp::body::bytes())
        .and_then(
            move |node_id: String, peer: Option<SocketAddr>, body: Bytes| {
                let roster = ctx.roster.clone();
                async move {
                    if !is_valid_identifier(&node_id) {
                        return Ok::<_, Rejection>(error_reply(
                            StatusCode::BAD_REQUEST,
                            format!("Invalid node identifier {:?}", node_id),
                        ));
                    }
                    let request = if body.is_empty() {
                        HeartbeatRequest::default()
                    } else {
                        match serde_json::from_slice::<HeartbeatRequest>(&body) {
                            Ok(r) => r,
                            Err(e) => {
                                return Ok::<_, Rejection>(error_reply(
                                    StatusCode::BAD_REQUEST,
                                    format!("Invalid heartbeat: {}", e),
                                ))
                            }
                        }
                    };
                    let reported_address = request
                        .address
                        .or_else(|| peer.map(|addr| addr.ip().to_string()));
                    debug!("Heartbeat from {} ({:?})", node_id, reported_address);
                    roster.record_liveness(&LivenessAnnouncement {
                        node_id,
                        reported_address,
                        retrieval_address: None,
                        announced_at: Utc::now(),
                    });
                    Ok::<_, Rejection>(reply::json(&TimeResponse::now()).into_response())
                }
            },
        )
}

/// GET /time, used by nodes to estimate their clock offset.
pub fn time_route() -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    warp::path!("time")
        .and(warp::get())
        .map(|| reply::json(&TimeResponse::now()).into_response())
}

/// GET /healthz
pub fn health_route() -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    warp::path!("healthz").and(warp::get()).map(|| {
        reply::json(&HealthResponse {
            status: "ok".to_string(),
        })
        .into_response()
    })
}

/// Turns unmatched requests and filter rejections into JSON errors.
pub async fn handle_rejection(err: Rejection) -> Result<Response, Infallible> {
    let (status, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not found".to_string())
    } else if let Some(e) = err.find::<warp::reject::PayloadTooLarge>() {
        (StatusCode::PAYLOAD_TOO_LARGE, e.to_string())
    } else if let Some(e) = err.find::<warp::reject::LengthRequired>() {
        (StatusCode::LENGTH_REQUIRED, e.to_string())
    } else if let Some(e) = err.find::<warp::reject::MissingHeader>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if let Some(e) = err.find::<warp::reject::InvalidHeader>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".to_string())
    } else {
        warn!("Unhandled rejection: {:?}", err);
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal error".to_string())
    };
    Ok(error_reply(status, message))
}

/// Full API.
pub fn routes(ctx: WebContext) -> impl Filter<Extract = (Response,), Error = Infallible> + Clone {
    start_session_route(ctx.clone())
        .or(list_sessions_route(ctx.clone()))
        .unify()
        .or(get_session_route(ctx.clone()))
        .unify()
        .or(upload_route(ctx.clone()))
        .unify()
        .or(list_nodes_route(ctx.clone()))
        .unify()
        .or(heartbeat_route(ctx))
        .unify()
        .or(time_route())
        .unify()
        .or(health_route())
        .unify()
        .recover(handle_rejection)
        .unify()
}
