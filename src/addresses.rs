use axum::extract::{Path, State};
use axum::Json;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::{ApiResponse, AppState};
use crate::auth::CurrentUser;
use crate::error::{ApiError, ApiResult, FieldError};
use crate::models::{Address, AddressChanges, NewAddress};
use crate::schema::addresses;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAddressRequest {
    pub recipient: String,
    pub phone: String,
    pub address: String,
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAddressRequest {
    pub recipient: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub is_default: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressResponse {
    pub id: Uuid,
    pub recipient: String,
    pub phone: String,
    pub address: String,
    pub is_default: bool,
    pub created_at: Option<DateTime<Utc>>,
}

impl From<Address> for AddressResponse {
    fn from(row: Address) -> Self {
        Self {
            id: row.id,
            recipient: row.recipient,
            phone: row.phone,
            address: row.address,
            is_default: row.is_default,
            created_at: row.created_at,
        }
    }
}

fn validate_create(request: &CreateAddressRequest) -> Vec<FieldError> {
    let mut errors = Vec::new();
    if request.recipient.trim().is_empty() {
        errors.push(FieldError::new("recipient", "recipient is required"));
    }
    if request.phone.trim().is_empty() {
        errors.push(FieldError::new("phone", "phone is required"));
    }
    if request.address.trim().is_empty() {
        errors.push(FieldError::new("address", "address is required"));
    }
    errors
}

pub async fn list_addresses(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<Json<ApiResponse<Vec<AddressResponse>>>> {
    let mut conn = state.pool.get().await?;

    let rows = addresses::table
        .filter(addresses::user_id.eq(user.id))
        .order((addresses::is_default.desc(), addresses::created_at.desc()))
        .load::<Address>(&mut conn)
        .await?;

    Ok(ApiResponse::ok(
        rows.into_iter().map(AddressResponse::from).collect(),
    ))
}

/// Creates an address. Marking it default clears the flag on the owner's
/// other rows in the same transaction, so at most one row per user carries it.
pub async fn create_address(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<CreateAddressRequest>,
) -> ApiResult<Json<ApiResponse<AddressResponse>>> {
    let errors = validate_create(&request);
    if !errors.is_empty() {
        return Err(ApiError::invalid_fields(errors));
    }

    let mut conn = state.pool.get().await?;
    let user_id = user.id;

    let created = conn
        .transaction::<Address, ApiError, _>(|conn| {
            Box::pin(async move {
                if request.is_default {
                    diesel::update(addresses::table.filter(addresses::user_id.eq(user_id)))
                        .set(addresses::is_default.eq(false))
                        .execute(conn)
                        .await?;
                }

                let new_address = NewAddress {
                    id: Uuid::new_v4(),
                    user_id,
                    recipient: request.recipient,
                    phone: request.phone,
                    address: request.address,
                    is_default: request.is_default,
                };
                diesel::insert_into(addresses::table)
                    .values(&new_address)
                    .execute(conn)
                    .await?;

                let created = addresses::table
                    .find(new_address.id)
                    .first::<Address>(conn)
                    .await?;
                Ok(created)
            })
        })
        .await?;

    Ok(ApiResponse::ok(created.into()))
}

pub async fn update_address(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(address_id): Path<Uuid>,
    Json(request): Json<UpdateAddressRequest>,
) -> ApiResult<Json<ApiResponse<AddressResponse>>> {
    // An all-None changeset would render as `UPDATE ... SET` with no columns.
    if request.recipient.is_none()
        && request.phone.is_none()
        && request.address.is_none()
        && request.is_default.is_none()
    {
        return Err(ApiError::validation("No fields to update"));
    }

    let mut conn = state.pool.get().await?;
    let user_id = user.id;

    let updated = conn
        .transaction::<Address, ApiError, _>(|conn| {
            Box::pin(async move {
                let existing = addresses::table
                    .filter(addresses::id.eq(address_id))
                    .filter(addresses::user_id.eq(user_id))
                    .first::<Address>(conn)
                    .await
                    .optional()?
                    .ok_or_else(|| ApiError::NotFound("Address not found".to_string()))?;

                if request.is_default == Some(true) {
                    diesel::update(addresses::table.filter(addresses::user_id.eq(user_id)))
                        .set(addresses::is_default.eq(false))
                        .execute(conn)
                        .await?;
                }

                let changes = AddressChanges {
                    recipient: request.recipient,
                    phone: request.phone,
                    address: request.address,
                    is_default: request.is_default,
                };
                diesel::update(addresses::table.find(existing.id))
                    .set(&changes)
                    .execute(conn)
                    .await?;

                let updated = addresses::table
                    .find(existing.id)
                    .first::<Address>(conn)
                    .await?;
                Ok(updated)
            })
        })
        .await?;

    Ok(ApiResponse::ok(updated.into()))
}

pub async fn delete_address(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(address_id): Path<Uuid>,
) -> ApiResult<Json<ApiResponse<()>>> {
    let mut conn = state.pool.get().await?;

    let deleted = diesel::delete(
        addresses::table
            .filter(addresses::id.eq(address_id))
            .filter(addresses::user_id.eq(user.id)),
    )
    .execute(&mut conn)
    .await?;

    if deleted == 0 {
        return Err(ApiError::NotFound("Address not found".to_string()));
    }
    Ok(ApiResponse::with_message((), "Address deleted"))
}
