use crate::{
    entities::cart,
    errors::ServiceError,
    services::carts::{AddItemInput, CartWithItems, CreateCartInput},
    services::coupons::ActiveCouponSummary,
    AppState,
};
use axum::{
    extract::{Path, State},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/carts", post(create_cart))
        .route("/carts/:cart_id", get(get_cart))
        .route("/carts/:cart_id/items", post(add_item))
        .route(
            "/carts/:cart_id/items/:item_id",
            put(update_item).delete(remove_item),
        )
        .route(
            "/carts/:cart_id/coupon",
            post(apply_coupon).delete(remove_coupon),
        )
        .route("/carts/:cart_id/clear", post(clear_cart))
        .route("/carts/:cart_id/merge", post(merge_carts))
        .route("/coupons", get(list_active_coupons))
}

#[utoipa::path(
    post,
    path = "/api/v1/carts",
    responses(
        (status = 200, description = "Cart created"),
        (status = 400, description = "Owner missing or ambiguous", body = crate::errors::ErrorResponse)
    ),
    tag = "Carts"
)]
async fn create_cart(
    State(state): State<AppState>,
    Json(input): Json<CreateCartInput>,
) -> Result<Json<cart::Model>, ServiceError> {
    Ok(Json(state.services.carts.create_cart(input).await?))
}

#[utoipa::path(
    get,
    path = "/api/v1/carts/{cart_id}",
    responses(
        (status = 200, description = "Cart with items"),
        (status = 404, description = "Cart not found", body = crate::errors::ErrorResponse)
    ),
    tag = "Carts"
)]
async fn get_cart(
    State(state): State<AppState>,
    Path(cart_id): Path<Uuid>,
) -> Result<Json<CartWithItems>, ServiceError> {
    Ok(Json(state.services.carts.get_cart(cart_id).await?))
}

async fn add_item(
    State(state): State<AppState>,
    Path(cart_id): Path<Uuid>,
    Json(input): Json<AddItemInput>,
) -> Result<Json<cart::Model>, ServiceError> {
    Ok(Json(state.services.carts.add_item(cart_id, input).await?))
}

#[derive(Debug, Deserialize)]
struct UpdateQuantityRequest {
    quantity: i32,
}

async fn update_item(
    State(state): State<AppState>,
    Path((cart_id, item_id)): Path<(Uuid, Uuid)>,
    Json(input): Json<UpdateQuantityRequest>,
) -> Result<Json<cart::Model>, ServiceError> {
    Ok(Json(
        state
            .services
            .carts
            .update_item_quantity(cart_id, item_id, input.quantity)
            .await?,
    ))
}

async fn remove_item(
    State(state): State<AppState>,
    Path((cart_id, item_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<cart::Model>, ServiceError> {
    Ok(Json(
        state.services.carts.remove_item(cart_id, item_id).await?,
    ))
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
struct ApplyCouponRequest {
    code: String,
    customer_id: Option<Uuid>,
}

#[utoipa::path(
    post,
    path = "/api/v1/carts/{cart_id}/coupon",
    responses(
        (status = 200, description = "Coupon attached, totals recomputed"),
        (status = 422, description = "Coupon rejected", body = crate::errors::ErrorResponse)
    ),
    tag = "Carts"
)]
async fn apply_coupon(
    State(state): State<AppState>,
    Path(cart_id): Path<Uuid>,
    Json(input): Json<ApplyCouponRequest>,
) -> Result<Json<cart::Model>, ServiceError> {
    Ok(Json(
        state
            .services
            .carts
            .apply_coupon(cart_id, &input.code, input.customer_id)
            .await?,
    ))
}

async fn remove_coupon(
    State(state): State<AppState>,
    Path(cart_id): Path<Uuid>,
) -> Result<Json<cart::Model>, ServiceError> {
    Ok(Json(state.services.carts.remove_coupon(cart_id).await?))
}

async fn clear_cart(
    State(state): State<AppState>,
    Path(cart_id): Path<Uuid>,
) -> Result<Json<cart::Model>, ServiceError> {
    Ok(Json(state.services.carts.clear_cart(cart_id).await?))
}

#[derive(Debug, Deserialize)]
struct MergeCartsRequest {
    guest_cart_id: Uuid,
}

async fn merge_carts(
    State(state): State<AppState>,
    Path(cart_id): Path<Uuid>,
    Json(input): Json<MergeCartsRequest>,
) -> Result<Json<cart::Model>, ServiceError> {
    Ok(Json(
        state
            .services
            .carts
            .merge_guest_cart(cart_id, input.guest_cart_id)
            .await?,
    ))
}

async fn list_active_coupons(
    State(state): State<AppState>,
) -> Result<Json<Vec<ActiveCouponSummary>>, ServiceError> {
    Ok(Json(state.services.coupons.active_codes().await?))
}
