use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::Json;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::dsl::count_star;
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::api::{ApiResponse, AppState};
use crate::auth::CurrentUser;
use crate::error::{ApiError, ApiResult, FieldError};
use crate::models::{
    amount_to_f64, NewOrder, NewOrderDetail, Order, OrderDetail, OrderStatus, PaymentMethod,
    ProductVariant,
};
use crate::schema::{order_details, orders, product_variants, products};

type DbPool = Pool<AsyncPgConnection>;

#[derive(Debug, Error)]
pub enum OrderError {
    #[error("Order must contain at least one item")]
    EmptyOrder,
    #[error("Quantity must be at least 1")]
    InvalidQuantity,
    #[error("SKU {0} not found")]
    VariantNotFound(Uuid),
    #[error("{product_name} ({color}/{size}): only {available} available")]
    InsufficientStock {
        product_name: String,
        color: String,
        size: String,
        available: i32,
    },
    #[error("Order not found")]
    OrderNotFound,
    #[error("Order in status {0} cannot be cancelled")]
    NotCancellable(String),
    #[error("order row carries unrecognized status {0:?}")]
    UnknownStatus(String),
    #[error(transparent)]
    Database(#[from] diesel::result::Error),
    #[error(transparent)]
    Pool(#[from] bb8::RunError<diesel_async::pooled_connection::PoolError>),
}

impl From<OrderError> for ApiError {
    fn from(err: OrderError) -> Self {
        match err {
            err @ (OrderError::EmptyOrder | OrderError::InvalidQuantity) => {
                ApiError::validation(err.to_string())
            }
            err @ (OrderError::VariantNotFound(_)
            | OrderError::InsufficientStock { .. }
            | OrderError::NotCancellable(_)) => ApiError::Domain(err.to_string()),
            OrderError::OrderNotFound => ApiError::NotFound("Order not found".to_string()),
            OrderError::UnknownStatus(status) => {
                ApiError::Internal(anyhow::anyhow!("order row carries unrecognized status {status:?}"))
            }
            OrderError::Database(err) => ApiError::Internal(err.into()),
            OrderError::Pool(err) => ApiError::Internal(err.into()),
        }
    }
}

/// Catalog values copied into an order line at placement time. Later catalog
/// edits must not alter historical orders, so these fields are owned copies
/// taken from the locked variant row, never references to live rows and never
/// client input.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantSnapshot {
    pub variant_id: Uuid,
    pub product_name: String,
    pub color: String,
    pub size: String,
    pub unit_price: BigDecimal,
    pub quantity: i32,
}

impl VariantSnapshot {
    pub fn line_total(&self) -> BigDecimal {
        &self.unit_price * BigDecimal::from(self.quantity)
    }
}

pub fn order_total(lines: &[VariantSnapshot]) -> BigDecimal {
    lines.iter().map(VariantSnapshot::line_total).sum()
}

fn validate_items(items: &[OrderItemRequest]) -> Result<(), OrderError> {
    if items.is_empty() {
        return Err(OrderError::EmptyOrder);
    }
    if items.iter().any(|item| item.quantity <= 0) {
        return Err(OrderError::InvalidQuantity);
    }
    Ok(())
}

fn ensure_available(snapshot: &VariantSnapshot, stock: i32) -> Result<(), OrderError> {
    if snapshot.quantity > stock {
        return Err(OrderError::InsufficientStock {
            product_name: snapshot.product_name.clone(),
            color: snapshot.color.clone(),
            size: snapshot.size.clone(),
            available: stock,
        });
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ShippingInfo {
    pub name: String,
    pub phone: String,
    pub address: String,
    pub note: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub order_id: Uuid,
    pub total_amount: BigDecimal,
    pub item_count: usize,
}

/// The order-placement core: batch validate-then-commit inside a single
/// database transaction. Stock rows are locked for the duration, so two
/// concurrent orders against the same SKU serialize and neither can drive
/// stock negative.
pub struct OrderEngine {
    pool: DbPool,
}

impl OrderEngine {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Places an order for `user_id`. Client-submitted prices are never
    /// trusted: every line is re-read from the variant row inside the
    /// transaction. Any invalid line aborts the whole order: no order row,
    /// no stock mutation.
    pub async fn create_order(
        &self,
        user_id: Uuid,
        items: Vec<OrderItemRequest>,
        shipping: ShippingInfo,
        payment_method: PaymentMethod,
    ) -> Result<PlacedOrder, OrderError> {
        validate_items(&items)?;

        let mut conn = self.pool.get().await?;
        let order_id = Uuid::new_v4();

        let placed = conn
            .transaction::<PlacedOrder, OrderError, _>(|conn| {
                Box::pin(async move {
                    let mut snapshots: Vec<VariantSnapshot> = Vec::with_capacity(items.len());
                    for item in &items {
                        let variant = product_variants::table
                            .find(item.sku_id)
                            .for_update()
                            .first::<ProductVariant>(conn)
                            .await
                            .optional()?
                            .ok_or(OrderError::VariantNotFound(item.sku_id))?;

                        let product_name = products::table
                            .find(variant.product_id)
                            .select(products::name)
                            .first::<String>(conn)
                            .await?;

                        let snapshot = VariantSnapshot {
                            variant_id: variant.id,
                            product_name,
                            color: variant.color,
                            size: variant.size,
                            unit_price: variant.price,
                            quantity: item.quantity,
                        };
                        ensure_available(&snapshot, variant.stock)?;
                        snapshots.push(snapshot);
                    }

                    let total_amount = order_total(&snapshots);

                    // Status and paid flag are forced regardless of what the
                    // client asked for.
                    let new_order = NewOrder {
                        id: order_id,
                        user_id,
                        total_amount: total_amount.clone(),
                        status: OrderStatus::New.as_str().to_string(),
                        payment_method: payment_method.as_str().to_string(),
                        is_paid: false,
                        shipping_name: shipping.name,
                        shipping_phone: shipping.phone,
                        shipping_address: shipping.address,
                        note: shipping.note,
                    };
                    diesel::insert_into(orders::table)
                        .values(&new_order)
                        .execute(conn)
                        .await?;

                    for snapshot in &snapshots {
                        let detail = NewOrderDetail {
                            id: Uuid::new_v4(),
                            order_id,
                            variant_id: snapshot.variant_id,
                            product_name: snapshot.product_name.clone(),
                            color: snapshot.color.clone(),
                            size: snapshot.size.clone(),
                            unit_price: snapshot.unit_price.clone(),
                            quantity: snapshot.quantity,
                        };
                        diesel::insert_into(order_details::table)
                            .values(&detail)
                            .execute(conn)
                            .await?;

                        diesel::update(product_variants::table.find(snapshot.variant_id))
                            .set(
                                product_variants::stock
                                    .eq(product_variants::stock - snapshot.quantity),
                            )
                            .execute(conn)
                            .await?;
                    }

                    Ok(PlacedOrder {
                        order_id,
                        total_amount,
                        item_count: snapshots.len(),
                    })
                })
            })
            .await?;

        info!(
            "Placed order {} for user {} ({} lines)",
            placed.order_id, user_id, placed.item_count
        );
        Ok(placed)
    }

    /// Cancels an order owned by `user_id`, restoring every line's stock and
    /// flipping the status, atomically. An order owned by someone else is
    /// reported as not found.
    pub async fn cancel_order(&self, user_id: Uuid, order_id: Uuid) -> Result<(), OrderError> {
        let mut conn = self.pool.get().await?;

        conn.transaction::<(), OrderError, _>(|conn| {
            Box::pin(async move {
                let order = orders::table
                    .filter(orders::id.eq(order_id))
                    .filter(orders::user_id.eq(user_id))
                    .for_update()
                    .first::<Order>(conn)
                    .await
                    .optional()?
                    .ok_or(OrderError::OrderNotFound)?;

                let status = OrderStatus::parse(&order.status)
                    .ok_or_else(|| OrderError::UnknownStatus(order.status.clone()))?;
                if !status.can_cancel() {
                    return Err(OrderError::NotCancellable(order.status));
                }

                let details = order_details::table
                    .filter(order_details::order_id.eq(order_id))
                    .load::<OrderDetail>(conn)
                    .await?;

                for detail in &details {
                    diesel::update(product_variants::table.find(detail.variant_id))
                        .set(product_variants::stock.eq(product_variants::stock + detail.quantity))
                        .execute(conn)
                        .await?;
                }

                diesel::update(orders::table.find(order_id))
                    .set(orders::status.eq(OrderStatus::Cancelled.as_str()))
                    .execute(conn)
                    .await?;

                Ok(())
            })
        })
        .await?;

        info!("Cancelled order {} for user {}", order_id, user_id);
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItemRequest {
    pub sku_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub items: Vec<OrderItemRequest>,
    pub shipping_name: String,
    pub shipping_phone: String,
    pub shipping_address: String,
    pub payment_method: String,
    pub note: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderResponse {
    pub order_id: Uuid,
    pub total_amount: f64,
    pub item_count: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderSummary {
    pub order_id: Uuid,
    pub total_amount: f64,
    pub status: String,
    pub payment_method: String,
    pub is_paid: bool,
    pub item_count: i64,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLine {
    pub sku_id: Uuid,
    pub product_name: String,
    pub color: String,
    pub size: String,
    pub unit_price: f64,
    pub quantity: i32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderDetailResponse {
    pub order_id: Uuid,
    pub total_amount: f64,
    pub status: String,
    pub payment_method: String,
    pub is_paid: bool,
    pub shipping_name: String,
    pub shipping_phone: String,
    pub shipping_address: String,
    pub note: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub items: Vec<OrderLine>,
}

fn validate_shipping(request: &CreateOrderRequest) -> Vec<FieldError> {
    let mut errors = Vec::new();
    if request.shipping_name.trim().is_empty() {
        errors.push(FieldError::new("shippingName", "shipping name is required"));
    }
    if request.shipping_phone.trim().is_empty() {
        errors.push(FieldError::new("shippingPhone", "shipping phone is required"));
    }
    if request.shipping_address.trim().is_empty() {
        errors.push(FieldError::new(
            "shippingAddress",
            "shipping address is required",
        ));
    }
    errors
}

pub async fn create_order(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<CreateOrderRequest>,
) -> ApiResult<Json<ApiResponse<CreateOrderResponse>>> {
    let errors = validate_shipping(&request);
    if !errors.is_empty() {
        return Err(ApiError::invalid_fields(errors));
    }
    let payment_method = PaymentMethod::parse(&request.payment_method).ok_or_else(|| {
        ApiError::invalid_fields(vec![FieldError::new(
            "paymentMethod",
            "must be one of cod, card, bank_transfer",
        )])
    })?;

    let shipping = ShippingInfo {
        name: request.shipping_name,
        phone: request.shipping_phone,
        address: request.shipping_address,
        note: request.note,
    };

    let engine = OrderEngine::new(state.pool);
    let placed = engine
        .create_order(user.id, request.items, shipping, payment_method)
        .await?;

    Ok(ApiResponse::ok(CreateOrderResponse {
        order_id: placed.order_id,
        total_amount: amount_to_f64(&placed.total_amount),
        item_count: placed.item_count,
    }))
}

pub async fn cancel_order(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(order_id): Path<Uuid>,
) -> ApiResult<Json<ApiResponse<()>>> {
    let engine = OrderEngine::new(state.pool);
    engine.cancel_order(user.id, order_id).await?;
    Ok(ApiResponse::with_message((), "Order cancelled"))
}

pub async fn list_orders(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<Json<ApiResponse<Vec<OrderSummary>>>> {
    let mut conn = state.pool.get().await?;

    let rows = orders::table
        .filter(orders::user_id.eq(user.id))
        .order(orders::created_at.desc())
        .load::<Order>(&mut conn)
        .await?;

    let ids: Vec<Uuid> = rows.iter().map(|order| order.id).collect();
    let counts: HashMap<Uuid, i64> = order_details::table
        .filter(order_details::order_id.eq_any(&ids))
        .group_by(order_details::order_id)
        .select((order_details::order_id, count_star()))
        .load::<(Uuid, i64)>(&mut conn)
        .await?
        .into_iter()
        .collect();

    let summaries = rows
        .into_iter()
        .map(|order| OrderSummary {
            item_count: counts.get(&order.id).copied().unwrap_or(0),
            order_id: order.id,
            total_amount: amount_to_f64(&order.total_amount),
            status: order.status,
            payment_method: order.payment_method,
            is_paid: order.is_paid,
            created_at: order.created_at,
        })
        .collect();

    Ok(ApiResponse::ok(summaries))
}

pub async fn order_detail(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(order_id): Path<Uuid>,
) -> ApiResult<Json<ApiResponse<OrderDetailResponse>>> {
    let mut conn = state.pool.get().await?;

    let order = orders::table
        .filter(orders::id.eq(order_id))
        .filter(orders::user_id.eq(user.id))
        .first::<Order>(&mut conn)
        .await
        .optional()?
        .ok_or_else(|| ApiError::NotFound("Order not found".to_string()))?;

    let details = order_details::table
        .filter(order_details::order_id.eq(order_id))
        .load::<OrderDetail>(&mut conn)
        .await?;

    let items = details
        .into_iter()
        .map(|detail| OrderLine {
            sku_id: detail.variant_id,
            product_name: detail.product_name,
            color: detail.color,
            size: detail.size,
            unit_price: amount_to_f64(&detail.unit_price),
            quantity: detail.quantity,
        })
        .collect();

    Ok(ApiResponse::ok(OrderDetailResponse {
        order_id: order.id,
        total_amount: amount_to_f64(&order.total_amount),
        status: order.status,
        payment_method: order.payment_method,
        is_paid: order.is_paid,
        shipping_name: order.shipping_name,
        shipping_phone: order.shipping_phone,
        shipping_address: order.shipping_address,
        note: order.note,
        created_at: order.created_at,
        items,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::str::FromStr;

    fn snapshot(price: &str, quantity: i32) -> VariantSnapshot {
        VariantSnapshot {
            variant_id: Uuid::new_v4(),
            product_name: "Canvas Tote".to_string(),
            color: "black".to_string(),
            size: "M".to_string(),
            unit_price: BigDecimal::from_str(price).unwrap(),
            quantity,
        }
    }

    #[test]
    fn total_is_sum_of_snapshotted_price_times_quantity() {
        let lines = vec![snapshot("19.99", 2), snapshot("5.50", 3)];
        assert_eq!(order_total(&lines), BigDecimal::from_str("56.48").unwrap());
    }

    #[test]
    fn empty_item_list_is_rejected() {
        assert!(matches!(validate_items(&[]), Err(OrderError::EmptyOrder)));
    }

    #[test]
    fn non_positive_quantities_are_rejected() {
        for quantity in [0, -1] {
            let items = vec![OrderItemRequest {
                sku_id: Uuid::new_v4(),
                quantity,
            }];
            assert!(matches!(
                validate_items(&items),
                Err(OrderError::InvalidQuantity)
            ));
        }
    }

    #[test]
    fn ordering_exactly_remaining_stock_is_allowed() {
        let line = snapshot("10", 5);
        assert!(ensure_available(&line, 5).is_ok());
    }

    #[test]
    fn ordering_more_than_stock_names_the_variant_and_availability() {
        let line = snapshot("10", 6);
        let err = ensure_available(&line, 5).unwrap_err();
        let message = err.to_string();
        assert_eq!(message, "Canvas Tote (black/M): only 5 available");
    }

    #[test]
    fn zero_stock_rejection_reports_zero_available() {
        let line = snapshot("10", 1);
        let err = ensure_available(&line, 0).unwrap_err();
        assert!(err.to_string().contains("only 0 available"));
    }

    proptest! {
        #[test]
        fn total_matches_integer_arithmetic(
            lines in proptest::collection::vec((1i64..10_000, 1i32..50), 1..8)
        ) {
            let snapshots: Vec<VariantSnapshot> = lines
                .iter()
                .map(|(price, quantity)| snapshot(&price.to_string(), *quantity))
                .collect();
            let expected: i64 = lines.iter().map(|(price, quantity)| price * i64::from(*quantity)).sum();
            prop_assert_eq!(order_total(&snapshots), BigDecimal::from(expected));
        }

        #[test]
        fn requests_beyond_stock_never_pass_validation(
            stock in 0i32..100,
            over in 1i32..100
        ) {
            let line = snapshot("1", stock + over);
            prop_assert!(ensure_available(&line, stock).is_err());
        }
    }
}
