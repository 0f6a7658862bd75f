use axum::extract::{Path, State};
use axum::Json;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::{ApiResponse, AppState};
use crate::auth::CurrentUser;
use crate::error::{ApiError, ApiResult, FieldError};
use crate::models::{NewReview, OrderStatus, Review};
use crate::schema::{order_details, orders, product_variants, reviews, users};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateReviewRequest {
    pub product_id: Uuid,
    pub order_id: Uuid,
    pub rating: i32,
    pub comment: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewResponse {
    pub id: Uuid,
    pub product_id: Uuid,
    pub rating: i32,
    pub comment: Option<String>,
    pub reviewer_name: String,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MyReviewResponse {
    pub id: Uuid,
    pub product_id: Uuid,
    pub order_id: Uuid,
    pub rating: i32,
    pub comment: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

pub async fn product_reviews(
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
) -> ApiResult<Json<ApiResponse<Vec<ReviewResponse>>>> {
    let mut conn = state.pool.get().await?;

    let rows = reviews::table
        .inner_join(users::table)
        .filter(reviews::product_id.eq(product_id))
        .order(reviews::created_at.desc())
        .select((reviews::all_columns, users::name))
        .load::<(Review, String)>(&mut conn)
        .await?;

    let items = rows
        .into_iter()
        .map(|(review, reviewer_name)| ReviewResponse {
            id: review.id,
            product_id: review.product_id,
            rating: review.rating,
            comment: review.comment,
            reviewer_name,
            created_at: review.created_at,
        })
        .collect();
    Ok(ApiResponse::ok(items))
}

pub async fn my_reviews(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<Json<ApiResponse<Vec<MyReviewResponse>>>> {
    let mut conn = state.pool.get().await?;

    let rows = reviews::table
        .filter(reviews::user_id.eq(user.id))
        .order(reviews::created_at.desc())
        .load::<Review>(&mut conn)
        .await?;

    let items = rows
        .into_iter()
        .map(|review| MyReviewResponse {
            id: review.id,
            product_id: review.product_id,
            order_id: review.order_id,
            rating: review.rating,
            comment: review.comment,
            created_at: review.created_at,
        })
        .collect();
    Ok(ApiResponse::ok(items))
}

/// A review may be created only when the caller has a completed order that
/// contains the product, and only once per (user, product, order).
pub async fn create_review(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<CreateReviewRequest>,
) -> ApiResult<Json<ApiResponse<MyReviewResponse>>> {
    if !(1..=5).contains(&request.rating) {
        return Err(ApiError::invalid_fields(vec![FieldError::new(
            "rating",
            "rating must be between 1 and 5",
        )]));
    }

    let mut conn = state.pool.get().await?;

    let eligible_order = orders::table
        .inner_join(order_details::table.inner_join(product_variants::table))
        .filter(orders::id.eq(request.order_id))
        .filter(orders::user_id.eq(user.id))
        .filter(orders::status.eq(OrderStatus::Completed.as_str()))
        .filter(product_variants::product_id.eq(request.product_id))
        .select(orders::id)
        .first::<Uuid>(&mut conn)
        .await
        .optional()?;
    if eligible_order.is_none() {
        return Err(ApiError::Domain(
            "Reviews are allowed only for products from a completed order".to_string(),
        ));
    }

    let already_reviewed = reviews::table
        .filter(reviews::user_id.eq(user.id))
        .filter(reviews::product_id.eq(request.product_id))
        .filter(reviews::order_id.eq(request.order_id))
        .select(reviews::id)
        .first::<Uuid>(&mut conn)
        .await
        .optional()?;
    if already_reviewed.is_some() {
        return Err(ApiError::Domain(
            "You have already reviewed this product for this order".to_string(),
        ));
    }

    let new_review = NewReview {
        id: Uuid::new_v4(),
        user_id: user.id,
        product_id: request.product_id,
        order_id: request.order_id,
        rating: request.rating,
        comment: request.comment,
    };
    diesel::insert_into(reviews::table)
        .values(&new_review)
        .execute(&mut conn)
        .await?;

    let created = reviews::table
        .find(new_review.id)
        .first::<Review>(&mut conn)
        .await?;

    Ok(ApiResponse::ok(MyReviewResponse {
        id: created.id,
        product_id: created.product_id,
        order_id: created.order_id,
        rating: created.rating,
        comment: created.comment,
        created_at: created.created_at,
    }))
}
