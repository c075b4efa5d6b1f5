use axum::{
    http::header,
    routing::{delete, get, post},
    Router,
};
use cloudbid_auction::AuctionService;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::JwtConfig;
use crate::handlers::{
    add_credits_handler, create_resource_handler, delete_bid_handler, delete_resource_handler,
    get_resource_handler, health_check_handler, list_own_bids_handler, list_own_resources_handler,
    login_handler, logout_handler, page_available_handler, place_bid_handler,
    toggle_availability_handler, user_info_handler,
};

/// Shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub auction: AuctionService,
    pub jwt: Arc<JwtConfig>,
}

impl AppState {
    pub fn new(auction: AuctionService, jwt: JwtConfig) -> Self {
        Self {
            auction,
            jwt: Arc::new(jwt),
        }
    }
}

pub fn create_app(state: AppState) -> Router {
    // Configure CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health_check_handler))
        .route("/login", post(login_handler))
        .route("/logout", post(logout_handler))
        .route(
            "/resources",
            get(list_own_resources_handler).post(create_resource_handler),
        )
        .route(
            "/resources/:rid",
            get(get_resource_handler).delete(delete_resource_handler),
        )
        .route(
            "/resources/:rid/availability",
            post(toggle_availability_handler),
        )
        .route("/market/:rid/:direction", get(page_available_handler))
        .route("/bids", get(list_own_bids_handler).post(place_bid_handler))
        .route("/bids/:bid", delete(delete_bid_handler))
        .route("/user", get(user_info_handler))
        .route("/credits", post(add_credits_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
