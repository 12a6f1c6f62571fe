use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter_vec, register_int_gauge_vec, Encoder, IntCounterVec, IntGaugeVec,
    TextEncoder,
};

/// Credit operations by kind, developer license, and amount bucket.
pub static CREDIT_OPERATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "credit_tracker_operations_total",
        "Total number of credit operations performed by the credit tracker service",
        &["operation", "developer_license", "amount_bucket"]
    )
    .expect("failed to register credit operations counter")
});

/// Last observed credit balance per developer license.
pub static CREDIT_BALANCE: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "credit_tracker_balance",
        "Current credit balance tracked by the credit tracker service",
        &["developer_license"]
    )
    .expect("failed to register credit balance gauge")
});

/// Bucket label keeping the operation counter's cardinality bounded.
pub fn amount_bucket(amount: i64) -> &'static str {
    match amount {
        1 => "1",
        2 => "2",
        3..=5 => "3-5",
        6..=10 => "6-10",
        11..=50 => "11-50",
        51..=100 => "51-100",
        101..=500 => "101-500",
        501..=1000 => "501-1000",
        _ => "1000+",
    }
}

/// Export all registered metrics in Prometheus text format.
pub fn metrics_handler() -> prometheus::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amount_buckets_cover_the_range() {
        assert_eq!(amount_bucket(1), "1");
        assert_eq!(amount_bucket(2), "2");
        assert_eq!(amount_bucket(4), "3-5");
        assert_eq!(amount_bucket(10), "6-10");
        assert_eq!(amount_bucket(50), "11-50");
        assert_eq!(amount_bucket(100), "51-100");
        assert_eq!(amount_bucket(500), "101-500");
        assert_eq!(amount_bucket(1000), "501-1000");
        assert_eq!(amount_bucket(50_000), "1000+");
        assert_eq!(amount_bucket(0), "1000+");
        assert_eq!(amount_bucket(-500), "1000+");
    }
}
