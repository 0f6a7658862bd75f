use axum::routing::{get, post, put};
use axum::{Json, Router};
use diesel_async::pooled_connection::bb8::Pool;
use diesel_async::AsyncPgConnection;
use serde::Serialize;

use crate::auth::AuthConfig;
use crate::{addresses, auth, cart, catalog, orders, reviews, wishlist};

pub type DbPool = Pool<AsyncPgConnection>;

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub auth: AuthConfig,
}

/// Success envelope shared by every endpoint: `{success, data, message?}`.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            message: None,
            data,
        })
    }

    pub fn with_message(data: T, message: &str) -> Json<Self> {
        Json(Self {
            success: true,
            message: Some(message.to_string()),
            data,
        })
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/auth/refresh-token", post(auth::refresh_token))
        .route("/auth/me", get(auth::me))
        .route("/categories", get(catalog::list_categories))
        .route("/products", get(catalog::list_products))
        .route("/products/featured", get(catalog::featured_products))
        .route("/products/new", get(catalog::new_products))
        .route("/products/search", get(catalog::search_products))
        .route("/products/:id_or_slug", get(catalog::product_detail))
        .route(
            "/cart",
            get(cart::get_cart)
                .post(cart::add_to_cart)
                .delete(cart::clear_cart),
        )
        .route(
            "/cart/:cart_id",
            put(cart::update_quantity).delete(cart::remove_from_cart),
        )
        .route("/orders", post(orders::create_order).get(orders::list_orders))
        .route("/orders/:id", get(orders::order_detail))
        .route("/orders/:id/cancel", put(orders::cancel_order))
        .route(
            "/addresses",
            get(addresses::list_addresses).post(addresses::create_address),
        )
        .route(
            "/addresses/:id",
            put(addresses::update_address).delete(addresses::delete_address),
        )
        .route("/wishlist", get(wishlist::get_wishlist))
        .route(
            "/wishlist/:product_id",
            post(wishlist::add_to_wishlist).delete(wishlist::remove_from_wishlist),
        )
        .route("/wishlist/toggle/:product_id", post(wishlist::toggle_wishlist))
        .route("/reviews/product/:product_id", get(reviews::product_reviews))
        .route("/reviews/my", get(reviews::my_reviews))
        .route("/reviews", post(reviews::create_review))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_includes_message_only_when_set() {
        let Json(body) = ApiResponse::ok(serde_json::json!({"id": 1}));
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["success"], true);
        assert!(json.get("message").is_none());
        assert_eq!(json["data"]["id"], 1);

        let Json(body) = ApiResponse::with_message((), "Order cancelled");
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["message"], "Order cancelled");
    }
}
