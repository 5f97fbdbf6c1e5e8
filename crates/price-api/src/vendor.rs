use crate::cost::CostMeter;
use std::sync::Arc;
use std::time::Duration;

/// Cost charged by the vendor for one pricing call, in cents.
pub const COST_PER_CALL_CENTS: u64 = 1;

// The simulated vendor quotes one flat price for every product.
const QUOTED_PRICE: f64 = 99.99;

/// Vendor simulates a slow external pricing API which bills per call.
pub struct Vendor {
    meter: Arc<CostMeter>,
    latency: Duration,
}

impl Vendor {
    pub fn new(meter: Arc<CostMeter>, latency: Duration) -> Self {
        Self { meter, latency }
    }

    /// Fetch the current price of a product. Every call takes the vendor's
    /// full round-trip latency and bills the meter once.
    pub async fn fetch_price(&self, product_id: &str) -> anyhow::Result<f64> {
        tracing::info!(
            product_id,
            cost_cents = COST_PER_CALL_CENTS,
            "calling vendor pricing API"
        );
        tokio::time::sleep(self.latency).await;

        self.meter.charge_cents(COST_PER_CALL_CENTS);
        metrics::counter!("vendor_price_fetches").increment(1);

        Ok(QUOTED_PRICE)
    }
}
