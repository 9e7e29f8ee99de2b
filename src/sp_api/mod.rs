pub mod auth;
pub mod client;
pub mod inventory;
pub mod listings;
pub mod reports;

pub use client::{ApiCall, ApiError, ApiResponse, EndpointCategory, ResilientClient};
pub use inventory::FbaInventory;
pub use listings::ListingsClient;
pub use reports::ReportsCatalog;

use once_cell::sync::Lazy;
use std::collections::HashMap;
use tracing::warn;

const EU_ENDPOINT: &str = "https://sellingpartnerapi-eu.amazon.com";
const NA_ENDPOINT: &str = "https://sellingpartnerapi-na.amazon.com";
const FE_ENDPOINT: &str = "https://sellingpartnerapi-fe.amazon.com";

static REGIONS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    let eu = [
        "A1F83G8C2ARO7P", // UK
        "A1PA6795UKMFR9",
        "A1RKKUPIHCS9HS", // ES
        "A13V1IB3VIYZZH", // FR
        "A1JEUMLCLC2WX2",
        "A1805IZSGTT6HS", // IT
        "A2NODRKZP88ZB9", // SE
        "A1C3SOZRARQ6R3", // PL
        "A17E79C6D8DWNP",
        "AE08WJ6YKNBMC", // BE
    ];
    let na = ["ATVPDKIKX0DER", "A1AM78C64UM0Y8", "A2Q3Y263D00KWC", "APJ6JRA9NG5V4"];
    let fe = [
        "A2EUQ1WTGCTBG2",
        "A1VC38T7YXB528",
        "A39IBJ37TRP1C6",
        "AAHKV2XAUZCBG",
        "A19VAU5U5O7RUS",
        "A2ZV50J4W1RKNI",
    ];
    eu.iter()
        .map(|id| (*id, EU_ENDPOINT))
        .chain(na.iter().map(|id| (*id, NA_ENDPOINT)))
        .chain(fe.iter().map(|id| (*id, FE_ENDPOINT)))
        .collect()
});

/// Regional SP-API host for a marketplace. Unknown ids fall back to EU.
pub fn base_url_for_marketplace(marketplace_id: &str) -> &'static str {
    match REGIONS.get(marketplace_id.trim()) {
        Some(url) => url,
        None => {
            warn!(
                target: "cleanup.sp_api",
                marketplace_id = marketplace_id,
                "unknown marketplace id, defaulting to EU endpoint"
            );
            EU_ENDPOINT
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marketplaces_route_to_regions() {
        assert_eq!(base_url_for_marketplace("A1F83G8C2ARO7P"), EU_ENDPOINT);
        assert_eq!(base_url_for_marketplace("ATVPDKIKX0DER"), NA_ENDPOINT);
        assert_eq!(base_url_for_marketplace("A1VC38T7YXB528"), FE_ENDPOINT);
        assert_eq!(base_url_for_marketplace("NOT-A-MARKETPLACE"), EU_ENDPOINT);
    }
}
