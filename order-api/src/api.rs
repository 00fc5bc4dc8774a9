use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use serde::{Deserialize, Serialize};
use tracing::error;

use shared::models::{Order, OrderStatus, Product};
use shared::schema::{order_items, orders, products};
use shared::store;
use shared::{DbPool, OrderError};

use crate::reservation::{self, ItemRequest};

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
}

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub user_id: i64,
    pub items: Vec<ItemRequest>,
}

#[derive(Debug, Serialize)]
pub struct CreateOrderResponse {
    pub order_id: i64,
    pub status: OrderStatus,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_id: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ItemView {
    pub product_id: i64,
    pub quantity: i32,
}

#[derive(Debug, Serialize)]
pub struct OrderView {
    pub order: Order,
    pub items: Vec<ItemView>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/orders", post(create_order))
        .route("/orders/:id", get(get_order))
        .route("/products", get(list_products))
        .route("/healthz", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

fn simple_error(status: StatusCode, error: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            product_id: None,
        }),
    )
}

fn internal_error() -> ApiError {
    simple_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
}

fn order_error_response(err: &OrderError) -> ApiError {
    let (status, error) = match err {
        OrderError::InvalidRequest => (StatusCode::BAD_REQUEST, "invalid_request"),
        OrderError::InvalidItems => (StatusCode::BAD_REQUEST, "invalid_items"),
        OrderError::ProductNotFound { .. } => (StatusCode::CONFLICT, "product_not_found"),
        OrderError::InsufficientInventory { .. } => {
            (StatusCode::CONFLICT, "insufficient_inventory")
        }
        OrderError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    };
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            product_id: err.product_id(),
        }),
    )
}

pub async fn create_order(
    State(state): State<AppState>,
    Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<CreateOrderResponse>), ApiError> {
    let mut conn = state.pool.get().await.map_err(|e| {
        error!(error = %e, "failed to check out a connection");
        internal_error()
    })?;

    match reservation::place_order(&mut conn, request.user_id, request.items).await {
        Ok(order_id) => Ok((
            StatusCode::CREATED,
            Json(CreateOrderResponse {
                order_id,
                status: OrderStatus::Pending,
            }),
        )),
        Err(err) => {
            if let OrderError::Database(e) = &err {
                error!(error = %e, "order creation failed");
            }
            Err(order_error_response(&err))
        }
    }
}

pub async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<i64>,
) -> Result<Json<OrderView>, ApiError> {
    if order_id <= 0 {
        return Err(simple_error(StatusCode::BAD_REQUEST, "invalid_id"));
    }

    let mut conn = state.pool.get().await.map_err(|e| {
        error!(error = %e, "failed to check out a connection");
        internal_error()
    })?;

    let order = orders::table
        .find(order_id)
        .first::<Order>(&mut conn)
        .await
        .optional()
        .map_err(|e| {
            error!(error = %e, order_id, "order lookup failed");
            internal_error()
        })?;
    let Some(order) = order else {
        return Err(simple_error(StatusCode::NOT_FOUND, "not_found"));
    };

    let items: Vec<(i64, i32)> = order_items::table
        .filter(order_items::order_id.eq(order_id))
        .select((order_items::product_id, order_items::quantity))
        .order(order_items::product_id.asc())
        .load(&mut conn)
        .await
        .map_err(|e| {
            error!(error = %e, order_id, "order items lookup failed");
            internal_error()
        })?;

    Ok(Json(OrderView {
        order,
        items: items
            .into_iter()
            .map(|(product_id, quantity)| ItemView {
                product_id,
                quantity,
            })
            .collect(),
    }))
}

pub async fn list_products(
    State(state): State<AppState>,
) -> Result<Json<Vec<Product>>, ApiError> {
    let mut conn = state.pool.get().await.map_err(|e| {
        error!(error = %e, "failed to check out a connection");
        internal_error()
    })?;

    let rows = products::table
        .order(products::id.asc())
        .load::<Product>(&mut conn)
        .await
        .map_err(|e| {
            error!(error = %e, "product listing failed");
            internal_error()
        })?;

    Ok(Json(rows))
}

pub async fn health_check(State(state): State<AppState>) -> (StatusCode, &'static str) {
    match state.pool.get().await {
        Ok(mut conn) => match store::ping(&mut conn).await {
            Ok(()) => (StatusCode::OK, "ok"),
            Err(e) => {
                error!(error = %e, "health check query failed");
                (StatusCode::SERVICE_UNAVAILABLE, "db not ready")
            }
        },
        Err(e) => {
            error!(error = %e, "health check checkout failed");
            (StatusCode::SERVICE_UNAVAILABLE, "db not ready")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_map_to_400() {
        let (status, body) = order_error_response(&OrderError::InvalidRequest);
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.error, "invalid_request");
        assert_eq!(body.product_id, None);

        let (status, body) = order_error_response(&OrderError::InvalidItems);
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.error, "invalid_items");
    }

    #[test]
    fn conflict_errors_map_to_409_and_name_the_product() {
        let (status, body) =
            order_error_response(&OrderError::ProductNotFound { product_id: 999 });
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body.error, "product_not_found");
        assert_eq!(body.product_id, Some(999));

        let (status, body) =
            order_error_response(&OrderError::InsufficientInventory { product_id: 4 });
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body.error, "insufficient_inventory");
        assert_eq!(body.product_id, Some(4));
    }

    #[test]
    fn database_errors_map_to_500_without_details() {
        let err = OrderError::Database(diesel::result::Error::NotFound);
        let (status, body) = order_error_response(&err);
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.error, "internal_error");
        assert_eq!(body.product_id, None);
    }
}
