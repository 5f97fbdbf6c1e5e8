use crate::App;
use std::sync::Arc;


/// A product's quoted price.
#[derive(Debug, serde::Serialize)]
pub struct PriceResponse {
    pub product_id: String,
    pub price: f64,
}

/// Total cost accrued against the vendor API, in decimal dollars.
#[derive(Debug, serde::Serialize)]
pub struct CostResponse {
    pub total_cost: String,
}

/// Error that describes a failed request.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to fetch the product's price from the vendor")]
    Fetch(#[source] coalesce::Error<anyhow::Error>),
}

// Build an axum::Router serving the price lookup and cost accounting APIs.
pub fn build_router(app: Arc<App>) -> axum::Router<()> {
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/products/:product_id/price", get(get_product_price))
        .route("/costs", get(get_costs))
        .route("/clear-costs", post(clear_costs))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(app)
}

#[axum::debug_handler]
#[tracing::instrument(skip(app), err(level = tracing::Level::WARN))]
async fn get_product_price(
    axum::extract::State(app): axum::extract::State<Arc<App>>,
    axum::extract::Path(product_id): axum::extract::Path<String>,
) -> Result<axum::Json<PriceResponse>, Error> {
    let (price, shared) = app.fetch_price(&product_id).await.map_err(Error::Fetch)?;
    tracing::debug!(price, shared, "resolved product price");

    Ok(axum::Json(PriceResponse { product_id, price }))
}

#[axum::debug_handler]
#[tracing::instrument(skip_all)]
async fn get_costs(
    axum::extract::State(app): axum::extract::State<Arc<App>>,
) -> axum::Json<CostResponse> {
    axum::Json(CostResponse {
        total_cost: app.meter.total_dollars(),
    })
}

#[axum::debug_handler]
#[tracing::instrument(skip_all)]
async fn clear_costs(
    axum::extract::State(app): axum::extract::State<Arc<App>>,
) -> axum::http::StatusCode {
    app.meter.clear();
    tracing::info!("cleared accrued vendor cost");
    axum::http::StatusCode::NO_CONTENT
}

impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let error = format!("{:?}", anyhow::Error::new(self));
        (axum::http::StatusCode::BAD_GATEWAY, error).into_response()
    }
}
