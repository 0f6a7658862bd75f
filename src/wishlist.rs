use axum::extract::{Path, State};
use axum::Json;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use serde::Serialize;
use uuid::Uuid;

use crate::api::{ApiResponse, AppState};
use crate::auth::CurrentUser;
use crate::error::{ApiError, ApiResult};
use crate::models::{amount_to_f64, NewWishlistItem, Product, WishlistItem};
use crate::schema::{products, wishlist_items};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WishlistEntry {
    pub product_id: Uuid,
    pub name: String,
    pub slug: String,
    pub base_price: f64,
    pub added_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleResponse {
    pub product_id: Uuid,
    pub wishlisted: bool,
}

pub async fn get_wishlist(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<Json<ApiResponse<Vec<WishlistEntry>>>> {
    let mut conn = state.pool.get().await?;

    let rows = wishlist_items::table
        .inner_join(products::table)
        .filter(wishlist_items::user_id.eq(user.id))
        .order(wishlist_items::created_at.desc())
        .load::<(WishlistItem, Product)>(&mut conn)
        .await?;

    let entries = rows
        .into_iter()
        .map(|(item, product)| WishlistEntry {
            product_id: product.id,
            name: product.name,
            slug: product.slug,
            base_price: amount_to_f64(&product.base_price),
            added_at: item.created_at,
        })
        .collect();
    Ok(ApiResponse::ok(entries))
}

async fn active_product_exists(
    conn: &mut diesel_async::AsyncPgConnection,
    product_id: Uuid,
) -> ApiResult<bool> {
    let found = products::table
        .filter(products::id.eq(product_id))
        .filter(products::is_active.eq(true))
        .select(products::id)
        .first::<Uuid>(conn)
        .await
        .optional()?;
    Ok(found.is_some())
}

async fn find_entry(
    conn: &mut diesel_async::AsyncPgConnection,
    user_id: Uuid,
    product_id: Uuid,
) -> ApiResult<Option<WishlistItem>> {
    let entry = wishlist_items::table
        .filter(wishlist_items::user_id.eq(user_id))
        .filter(wishlist_items::product_id.eq(product_id))
        .first::<WishlistItem>(conn)
        .await
        .optional()?;
    Ok(entry)
}

/// One wishlist entry per (user, product) pair, enforced by check-then-insert.
pub async fn add_to_wishlist(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(product_id): Path<Uuid>,
) -> ApiResult<Json<ApiResponse<ToggleResponse>>> {
    let mut conn = state.pool.get().await?;

    if !active_product_exists(&mut conn, product_id).await? {
        return Err(ApiError::NotFound("Product not found".to_string()));
    }
    if find_entry(&mut conn, user.id, product_id).await?.is_some() {
        return Err(ApiError::Domain("Product is already in wishlist".to_string()));
    }

    let entry = NewWishlistItem {
        id: Uuid::new_v4(),
        user_id: user.id,
        product_id,
    };
    diesel::insert_into(wishlist_items::table)
        .values(&entry)
        .execute(&mut conn)
        .await?;

    Ok(ApiResponse::ok(ToggleResponse {
        product_id,
        wishlisted: true,
    }))
}

pub async fn remove_from_wishlist(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(product_id): Path<Uuid>,
) -> ApiResult<Json<ApiResponse<ToggleResponse>>> {
    let mut conn = state.pool.get().await?;

    let deleted = diesel::delete(
        wishlist_items::table
            .filter(wishlist_items::user_id.eq(user.id))
            .filter(wishlist_items::product_id.eq(product_id)),
    )
    .execute(&mut conn)
    .await?;

    if deleted == 0 {
        return Err(ApiError::NotFound("Wishlist entry not found".to_string()));
    }
    Ok(ApiResponse::ok(ToggleResponse {
        product_id,
        wishlisted: false,
    }))
}

/// Insert-or-delete in one call, for a client heart button.
pub async fn toggle_wishlist(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(product_id): Path<Uuid>,
) -> ApiResult<Json<ApiResponse<ToggleResponse>>> {
    let mut conn = state.pool.get().await?;

    if let Some(entry) = find_entry(&mut conn, user.id, product_id).await? {
        diesel::delete(wishlist_items::table.find(entry.id))
            .execute(&mut conn)
            .await?;
        return Ok(ApiResponse::ok(ToggleResponse {
            product_id,
            wishlisted: false,
        }));
    }

    if !active_product_exists(&mut conn, product_id).await? {
        return Err(ApiError::NotFound("Product not found".to_string()));
    }
    let entry = NewWishlistItem {
        id: Uuid::new_v4(),
        user_id: user.id,
        product_id,
    };
    diesel::insert_into(wishlist_items::table)
        .values(&entry)
        .execute(&mut conn)
        .await?;

    Ok(ApiResponse::ok(ToggleResponse {
        product_id,
        wishlisted: true,
    }))
}
