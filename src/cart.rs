use axum::extract::{Path, State};
use axum::Json;
use diesel::prelude::*;
use diesel_async::{AsyncConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::api::{ApiResponse, AppState};
use crate::auth::CurrentUser;
use crate::error::{ApiError, ApiResult};
use crate::models::{amount_to_f64, CartItem, NewCartItem, ProductVariant};
use crate::schema::{cart_items, product_variants, products};

#[derive(Debug, Error)]
pub enum CartError {
    #[error("Quantity must be at least 1")]
    InvalidQuantity,
    #[error("SKU {0} not found")]
    VariantNotFound(Uuid),
    #[error("{product_name} ({color}/{size}): max {available} in stock")]
    ExceedsStock {
        product_name: String,
        color: String,
        size: String,
        available: i32,
    },
    #[error("Cart item not found")]
    LineNotFound,
    #[error(transparent)]
    Database(#[from] diesel::result::Error),
    #[error(transparent)]
    Pool(#[from] bb8::RunError<diesel_async::pooled_connection::PoolError>),
}

impl From<CartError> for ApiError {
    fn from(err: CartError) -> Self {
        match err {
            CartError::InvalidQuantity => ApiError::validation(err.to_string()),
            err @ (CartError::VariantNotFound(_) | CartError::ExceedsStock { .. }) => {
                ApiError::Domain(err.to_string())
            }
            CartError::LineNotFound => ApiError::NotFound("Cart item not found".to_string()),
            CartError::Database(err) => ApiError::Internal(err.into()),
            CartError::Pool(err) => ApiError::Internal(err.into()),
        }
    }
}

/// Stock ceiling on cart mutation. Advisory only, since the Order Engine
/// re-checks at placement, but a cart line may never record more than the
/// stock that existed when it was written.
fn check_stock_ceiling(
    product_name: &str,
    color: &str,
    size: &str,
    quantity: i32,
    stock: i32,
) -> Result<(), CartError> {
    if quantity > stock {
        return Err(CartError::ExceedsStock {
            product_name: product_name.to_string(),
            color: color.to_string(),
            size: size.to_string(),
            available: stock,
        });
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddToCartRequest {
    pub sku_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateQuantityRequest {
    pub quantity: i32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CartLineResponse {
    pub cart_id: Uuid,
    pub sku_id: Uuid,
    pub product_id: Uuid,
    pub product_name: String,
    pub color: String,
    pub size: String,
    pub unit_price: f64,
    pub quantity: i32,
    pub stock: i32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CartMutationResponse {
    pub cart_id: Uuid,
    pub quantity: i32,
}

pub async fn get_cart(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<Json<ApiResponse<Vec<CartLineResponse>>>> {
    let mut conn = state.pool.get().await?;

    let rows = cart_items::table
        .inner_join(product_variants::table.inner_join(products::table))
        .filter(cart_items::user_id.eq(user.id))
        .order(cart_items::created_at.desc())
        .select((
            cart_items::all_columns,
            product_variants::all_columns,
            products::name,
        ))
        .load::<(CartItem, ProductVariant, String)>(&mut conn)
        .await?;

    let lines = rows
        .into_iter()
        .map(|(line, variant, product_name)| CartLineResponse {
            cart_id: line.id,
            sku_id: variant.id,
            product_id: variant.product_id,
            product_name,
            color: variant.color,
            size: variant.size,
            unit_price: amount_to_f64(&variant.price),
            quantity: line.quantity,
            stock: variant.stock,
        })
        .collect();

    Ok(ApiResponse::ok(lines))
}

/// Adds a SKU to the caller's cart. An existing line for the same SKU merges
/// quantities rather than overwriting; the merged quantity must fit current
/// stock. The variant row stays locked for the duration so a double-submitted
/// add cannot race past the ceiling.
pub async fn add_to_cart(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<AddToCartRequest>,
) -> ApiResult<Json<ApiResponse<CartMutationResponse>>> {
    if request.quantity <= 0 {
        return Err(CartError::InvalidQuantity.into());
    }

    let mut conn = state.pool.get().await?;
    let user_id = user.id;

    let (cart_id, quantity) = conn
        .transaction::<(Uuid, i32), CartError, _>(|conn| {
            Box::pin(async move {
                let variant = product_variants::table
                    .find(request.sku_id)
                    .for_update()
                    .first::<ProductVariant>(conn)
                    .await
                    .optional()?
                    .ok_or(CartError::VariantNotFound(request.sku_id))?;
                let product_name = products::table
                    .find(variant.product_id)
                    .select(products::name)
                    .first::<String>(conn)
                    .await?;

                let existing = cart_items::table
                    .filter(cart_items::user_id.eq(user_id))
                    .filter(cart_items::variant_id.eq(request.sku_id))
                    .first::<CartItem>(conn)
                    .await
                    .optional()?;

                let merged = existing.as_ref().map_or(0, |line| line.quantity) + request.quantity;
                check_stock_ceiling(
                    &product_name,
                    &variant.color,
                    &variant.size,
                    merged,
                    variant.stock,
                )?;

                match existing {
                    Some(line) => {
                        diesel::update(cart_items::table.find(line.id))
                            .set(cart_items::quantity.eq(merged))
                            .execute(conn)
                            .await?;
                        Ok((line.id, merged))
                    }
                    None => {
                        let new_line = NewCartItem {
                            id: Uuid::new_v4(),
                            user_id,
                            variant_id: request.sku_id,
                            quantity: request.quantity,
                        };
                        diesel::insert_into(cart_items::table)
                            .values(&new_line)
                            .execute(conn)
                            .await?;
                        Ok((new_line.id, new_line.quantity))
                    }
                }
            })
        })
        .await?;

    Ok(ApiResponse::ok(CartMutationResponse { cart_id, quantity }))
}

/// Replaces a line's quantity, re-validated against current stock.
pub async fn update_quantity(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(cart_id): Path<Uuid>,
    Json(request): Json<UpdateQuantityRequest>,
) -> ApiResult<Json<ApiResponse<CartMutationResponse>>> {
    if request.quantity <= 0 {
        return Err(CartError::InvalidQuantity.into());
    }

    let mut conn = state.pool.get().await?;
    let user_id = user.id;

    let quantity = conn
        .transaction::<i32, CartError, _>(|conn| {
            Box::pin(async move {
                let line = cart_items::table
                    .filter(cart_items::id.eq(cart_id))
                    .filter(cart_items::user_id.eq(user_id))
                    .first::<CartItem>(conn)
                    .await
                    .optional()?
                    .ok_or(CartError::LineNotFound)?;

                let variant = product_variants::table
                    .find(line.variant_id)
                    .for_update()
                    .first::<ProductVariant>(conn)
                    .await
                    .optional()?
                    .ok_or(CartError::VariantNotFound(line.variant_id))?;
                let product_name = products::table
                    .find(variant.product_id)
                    .select(products::name)
                    .first::<String>(conn)
                    .await?;

                check_stock_ceiling(
                    &product_name,
                    &variant.color,
                    &variant.size,
                    request.quantity,
                    variant.stock,
                )?;

                diesel::update(cart_items::table.find(line.id))
                    .set(cart_items::quantity.eq(request.quantity))
                    .execute(conn)
                    .await?;

                Ok(request.quantity)
            })
        })
        .await?;

    Ok(ApiResponse::ok(CartMutationResponse { cart_id, quantity }))
}

pub async fn remove_from_cart(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(cart_id): Path<Uuid>,
) -> ApiResult<Json<ApiResponse<()>>> {
    let mut conn = state.pool.get().await?;

    let deleted = diesel::delete(
        cart_items::table
            .filter(cart_items::id.eq(cart_id))
            .filter(cart_items::user_id.eq(user.id)),
    )
    .execute(&mut conn)
    .await?;

    if deleted == 0 {
        return Err(CartError::LineNotFound.into());
    }
    Ok(ApiResponse::with_message((), "Removed from cart"))
}

pub async fn clear_cart(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<Json<ApiResponse<()>>> {
    let mut conn = state.pool.get().await?;

    diesel::delete(cart_items::table.filter(cart_items::user_id.eq(user.id)))
        .execute(&mut conn)
        .await?;

    Ok(ApiResponse::with_message((), "Cart cleared"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merging_past_stock_is_rejected_and_names_the_ceiling() {
        // Cart already holds 3; adding 2 against stock 4 must fail.
        let merged = 3 + 2;
        let err = check_stock_ceiling("Canvas Tote", "black", "M", merged, 4).unwrap_err();
        assert!(err.to_string().contains("max 4"));
    }

    #[test]
    fn merging_up_to_stock_is_allowed() {
        assert!(check_stock_ceiling("Canvas Tote", "black", "M", 4, 4).is_ok());
        assert!(check_stock_ceiling("Canvas Tote", "black", "M", 1, 4).is_ok());
    }

    #[test]
    fn ceiling_error_maps_to_domain_rule_violation() {
        let err: ApiError = CartError::ExceedsStock {
            product_name: "Canvas Tote".to_string(),
            color: "black".to_string(),
            size: "M".to_string(),
            available: 4,
        }
        .into();
        assert!(matches!(err, ApiError::Domain(_)));
    }
}
