use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use cloudbid_auction::Availability;
use cloudbid_types::{
    Bid, BidId, BidRequest, Credentials, PageDirection, Resource, ResourceId, ResourceSpec,
    UserInfo,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::app::AppState;
use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::streaming::event_response;

#[derive(Debug, Deserialize)]
pub struct AddCreditsRequest {
    pub amount: f64,
}

fn message(text: &str) -> Json<Value> {
    Json(json!({ "message": text }))
}

pub async fn health_check_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn login_handler(
    State(state): State<AppState>,
    payload: Result<Json<Credentials>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(credentials) = payload?;
    let (_, token, _) = state
        .jwt
        .login(state.auction.store().as_ref(), &credentials)
        .await?;
    Ok(Json(json!({ "token": token })))
}

pub async fn logout_handler(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<Value>, ApiError> {
    let revoked = state.auction.store().revoke_tokens_of_user(auth.uid).await?;
    info!(uid = %auth.uid, revoked, "logged out");
    Ok(message("Logged out successfully"))
}

pub async fn list_own_resources_handler(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<Vec<Resource>>, ApiError> {
    Ok(Json(state.auction.store().list_owned_resources(auth.uid).await?))
}

pub async fn create_resource_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    payload: Result<Json<ResourceSpec>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(spec) = payload?;
    spec.validate()?;
    let rid = state.auction.store().create_resource(auth.uid, &spec).await?;
    info!(rid = %rid, uid = %auth.uid, "resource created");
    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": "Resource created successfully", "rid": rid })),
    ))
}

pub async fn delete_resource_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    rid: Result<Path<ResourceId>, PathRejection>,
) -> Result<Json<Value>, ApiError> {
    let Path(rid) = rid?;
    state.auction.delete_resource(auth.uid, rid).await?;
    Ok(message("Resource deleted successfully"))
}

/// Streams the auction outcome to the owner when the resource becomes
/// available; answers plainly when it is withdrawn.
pub async fn toggle_availability_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    rid: Result<Path<ResourceId>, PathRejection>,
) -> Result<Response, ApiError> {
    let Path(rid) = rid?;
    match state.auction.toggle_availability(auth.uid, rid).await? {
        Availability::Opened(events) => Ok(event_response(StatusCode::OK, events)),
        Availability::Closed => Ok(message("Availability changed").into_response()),
    }
}

pub async fn page_available_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    params: Result<Path<(ResourceId, String)>, PathRejection>,
) -> Result<Json<Vec<Resource>>, ApiError> {
    let Path((pivot, direction)) = params?;
    let direction = PageDirection::parse(&direction)?;
    let page = state
        .auction
        .store()
        .page_available_resources(auth.uid, pivot, direction)
        .await?;
    Ok(Json(page))
}

/// Admits the bid and streams its outcome: a rejection, or the start and
/// end of the connection.
pub async fn place_bid_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    payload: Result<Json<BidRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    let (bid, events) = state.auction.place_bid(auth.uid, &request).await?;
    info!(bid = %bid.bid, rid = %bid.rid, uid = %auth.uid, "bid placed");
    Ok(event_response(StatusCode::CREATED, events))
}

pub async fn list_own_bids_handler(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<Vec<Bid>>, ApiError> {
    Ok(Json(state.auction.store().list_user_bids(auth.uid).await?))
}

pub async fn delete_bid_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    bid: Result<Path<BidId>, PathRejection>,
) -> Result<Json<Value>, ApiError> {
    let Path(bid) = bid?;
    state.auction.delete_bid(auth.uid, bid).await?;
    Ok(message("Bid removed successfully"))
}

/// Resource specs are only shown to users bidding on them.
pub async fn get_resource_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    rid: Result<Path<ResourceId>, PathRejection>,
) -> Result<Json<Resource>, ApiError> {
    let Path(rid) = rid?;
    let store = state.auction.store();
    if !store.has_bid_on_resource(auth.uid, rid).await? {
        return Err(ApiError::AuthMismatch);
    }
    Ok(Json(store.get_resource(rid).await?))
}

pub async fn user_info_handler(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<UserInfo>, ApiError> {
    Ok(Json(state.auction.ledger().user_info(auth.uid).await?))
}

pub async fn add_credits_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    payload: Result<Json<AddCreditsRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = payload?;
    state.auction.ledger().top_up(auth.uid, request.amount).await?;
    Ok(message("Credits added successfully"))
}
