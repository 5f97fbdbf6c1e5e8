use std::sync::Arc;

pub mod api;
pub mod cost;
pub mod metrics_server;
pub mod vendor;

pub use cost::CostMeter;
pub use vendor::Vendor;

/// Shared state of the price service.
pub struct App {
    /// In-flight price lookups, coalesced by product ID.
    pub flights: coalesce::Group<String, f64, anyhow::Error>,
    /// Simulated vendor pricing API which quotes are fetched from.
    pub vendor: Vendor,
    /// Meter of spend accrued against the vendor API.
    pub meter: Arc<CostMeter>,
    /// When true, lookups bypass coalescing and every request pays for its
    /// own vendor call.
    pub no_coalesce: bool,
}

impl App {
    /// Fetch the quoted price of a product. Concurrent lookups of the same
    /// product are coalesced into a single vendor call, and the returned
    /// flag tells whether this lookup joined a call which another request
    /// initiated.
    pub async fn fetch_price(
        &self,
        product_id: &str,
    ) -> Result<(f64, bool), coalesce::Error<anyhow::Error>> {
        if self.no_coalesce {
            return match self.vendor.fetch_price(product_id).await {
                Ok(price) => Ok((price, false)),
                Err(err) => Err(coalesce::Error::Producer(Arc::new(err))),
            };
        }

        let coalesce::Outcome { result, shared } = self
            .flights
            .run(product_id.to_string(), || {
                self.vendor.fetch_price(product_id)
            })
            .await;

        if shared {
            metrics::counter!("price_lookups_coalesced").increment(1);
        }
        result.map(|price| (*price, shared))
    }
}
