use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use diesel::dsl::avg;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::{ApiResponse, AppState};
use crate::error::{ApiError, ApiResult};
use crate::models::{amount_to_f64, Category, Product, ProductSort, ProductVariant};
use crate::schema::{categories, product_variants, products, reviews};

const DEFAULT_PAGE_SIZE: i64 = 20;
const MAX_PAGE_SIZE: i64 = 100;
const CURATED_LIST_SIZE: i64 = 10;

#[derive(Debug, Deserialize)]
pub struct ProductListQuery {
    pub sort: Option<String>,
    pub category: Option<String>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryResponse {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductSummary {
    pub id: Uuid,
    pub category_id: Option<Uuid>,
    pub name: String,
    pub slug: String,
    pub base_price: f64,
    pub sold_count: i32,
    pub created_at: Option<DateTime<Utc>>,
}

impl From<Product> for ProductSummary {
    fn from(product: Product) -> Self {
        Self {
            id: product.id,
            category_id: product.category_id,
            name: product.name,
            slug: product.slug,
            base_price: amount_to_f64(&product.base_price),
            sold_count: product.sold_count,
            created_at: product.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PagedProducts {
    pub items: Vec<ProductSummary>,
    pub page: i64,
    pub limit: i64,
    pub total: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantResponse {
    pub sku_id: Uuid,
    pub color: String,
    pub size: String,
    pub price: f64,
    pub stock: i32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingSummary {
    pub average: f64,
    pub count: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductDetailResponse {
    pub id: Uuid,
    pub category_id: Option<Uuid>,
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub base_price: f64,
    pub sold_count: i32,
    pub variants: Vec<VariantResponse>,
    pub rating: RatingSummary,
}

/// Page/limit normalization: pages start at 1, limits are clamped to the
/// server's ceiling.
fn page_window(page: Option<i64>, limit: Option<i64>) -> (i64, i64) {
    let page = page.unwrap_or(1).max(1);
    let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    ((page - 1) * limit, limit)
}

pub async fn list_categories(
    State(state): State<AppState>,
) -> ApiResult<Json<ApiResponse<Vec<CategoryResponse>>>> {
    let mut conn = state.pool.get().await?;

    let rows = categories::table
        .order(categories::name.asc())
        .load::<Category>(&mut conn)
        .await?;

    let items = rows
        .into_iter()
        .map(|category| CategoryResponse {
            id: category.id,
            name: category.name,
            slug: category.slug,
        })
        .collect();
    Ok(ApiResponse::ok(items))
}

pub async fn list_products(
    State(state): State<AppState>,
    Query(query): Query<ProductListQuery>,
) -> ApiResult<Json<ApiResponse<PagedProducts>>> {
    let sort = match query.sort.as_deref() {
        None => ProductSort::Newest,
        Some(value) => ProductSort::parse(value)
            .ok_or_else(|| ApiError::validation(format!("Unknown sort {value:?}")))?,
    };

    let mut conn = state.pool.get().await?;

    let category_id = match query.category.as_deref() {
        Some(slug) => {
            let id = categories::table
                .filter(categories::slug.eq(slug))
                .select(categories::id)
                .first::<Uuid>(&mut conn)
                .await
                .optional()?;
            match id {
                Some(id) => Some(id),
                None => return Err(ApiError::NotFound("Category not found".to_string())),
            }
        }
        None => None,
    };

    let (offset, limit) = page_window(query.page, query.limit);
    let page = offset / limit + 1;

    let total = match category_id {
        Some(category_id) => {
            products::table
                .filter(products::is_active.eq(true))
                .filter(products::category_id.eq(category_id))
                .count()
                .get_result::<i64>(&mut conn)
                .await?
        }
        None => {
            products::table
                .filter(products::is_active.eq(true))
                .count()
                .get_result::<i64>(&mut conn)
                .await?
        }
    };

    let mut list_query = products::table
        .filter(products::is_active.eq(true))
        .into_boxed();
    if let Some(category_id) = category_id {
        list_query = list_query.filter(products::category_id.eq(category_id));
    }

    // Closed mapping from the sort allowlist to order clauses; user input
    // never reaches the query builder as text.
    list_query = match sort {
        ProductSort::Newest => list_query.order(products::created_at.desc()),
        ProductSort::PriceAsc => list_query.order(products::base_price.asc()),
        ProductSort::PriceDesc => list_query.order(products::base_price.desc()),
        ProductSort::BestSelling => list_query.order(products::sold_count.desc()),
    };

    let rows = list_query
        .offset(offset)
        .limit(limit)
        .load::<Product>(&mut conn)
        .await?;

    Ok(ApiResponse::ok(PagedProducts {
        items: rows.into_iter().map(ProductSummary::from).collect(),
        page,
        limit,
        total,
    }))
}

pub async fn featured_products(
    State(state): State<AppState>,
) -> ApiResult<Json<ApiResponse<Vec<ProductSummary>>>> {
    let mut conn = state.pool.get().await?;

    let rows = products::table
        .filter(products::is_active.eq(true))
        .order(products::sold_count.desc())
        .limit(CURATED_LIST_SIZE)
        .load::<Product>(&mut conn)
        .await?;

    Ok(ApiResponse::ok(
        rows.into_iter().map(ProductSummary::from).collect(),
    ))
}

pub async fn new_products(
    State(state): State<AppState>,
) -> ApiResult<Json<ApiResponse<Vec<ProductSummary>>>> {
    let mut conn = state.pool.get().await?;

    let rows = products::table
        .filter(products::is_active.eq(true))
        .order(products::created_at.desc())
        .limit(CURATED_LIST_SIZE)
        .load::<Product>(&mut conn)
        .await?;

    Ok(ApiResponse::ok(
        rows.into_iter().map(ProductSummary::from).collect(),
    ))
}

pub async fn search_products(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Json<ApiResponse<Vec<ProductSummary>>>> {
    let needle = query.q.trim();
    if needle.is_empty() {
        return Err(ApiError::validation("Search query must not be empty"));
    }

    let mut conn = state.pool.get().await?;

    let pattern = format!("%{}%", needle);
    let rows = products::table
        .filter(products::is_active.eq(true))
        .filter(products::name.ilike(pattern))
        .order(products::sold_count.desc())
        .limit(MAX_PAGE_SIZE)
        .load::<Product>(&mut conn)
        .await?;

    Ok(ApiResponse::ok(
        rows.into_iter().map(ProductSummary::from).collect(),
    ))
}

/// Detail lookup accepts either a UUID or a slug in the same path segment.
pub async fn product_detail(
    State(state): State<AppState>,
    Path(id_or_slug): Path<String>,
) -> ApiResult<Json<ApiResponse<ProductDetailResponse>>> {
    let mut conn = state.pool.get().await?;

    let product = match Uuid::parse_str(&id_or_slug) {
        Ok(id) => {
            products::table
                .filter(products::id.eq(id))
                .filter(products::is_active.eq(true))
                .first::<Product>(&mut conn)
                .await
                .optional()?
        }
        Err(_) => {
            products::table
                .filter(products::slug.eq(&id_or_slug))
                .filter(products::is_active.eq(true))
                .first::<Product>(&mut conn)
                .await
                .optional()?
        }
    }
    .ok_or_else(|| ApiError::NotFound("Product not found".to_string()))?;

    let variants = product_variants::table
        .filter(product_variants::product_id.eq(product.id))
        .order((product_variants::color.asc(), product_variants::size.asc()))
        .load::<ProductVariant>(&mut conn)
        .await?;

    let review_count = reviews::table
        .filter(reviews::product_id.eq(product.id))
        .count()
        .get_result::<i64>(&mut conn)
        .await?;
    let average = reviews::table
        .filter(reviews::product_id.eq(product.id))
        .select(avg(reviews::rating))
        .first::<Option<bigdecimal::BigDecimal>>(&mut conn)
        .await?
        .as_ref()
        .map(amount_to_f64)
        .unwrap_or(0.0);

    Ok(ApiResponse::ok(ProductDetailResponse {
        id: product.id,
        category_id: product.category_id,
        name: product.name,
        slug: product.slug,
        description: product.description,
        base_price: amount_to_f64(&product.base_price),
        sold_count: product.sold_count,
        variants: variants
            .into_iter()
            .map(|variant| VariantResponse {
                sku_id: variant.id,
                color: variant.color,
                size: variant.size,
                price: amount_to_f64(&variant.price),
                stock: variant.stock,
            })
            .collect(),
        rating: RatingSummary {
            average,
            count: review_count,
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_window_defaults() {
        assert_eq!(page_window(None, None), (0, DEFAULT_PAGE_SIZE));
    }

    #[test]
    fn page_window_offsets_from_page_one() {
        assert_eq!(page_window(Some(3), Some(25)), (50, 25));
    }

    #[test]
    fn page_window_clamps_abuse() {
        assert_eq!(page_window(Some(0), Some(0)), (0, 1));
        assert_eq!(page_window(Some(-4), Some(-10)), (0, 1));
        let (_, limit) = page_window(Some(1), Some(100_000));
        assert_eq!(limit, MAX_PAGE_SIZE);
    }
}
