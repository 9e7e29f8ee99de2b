use crate::cleanup::CatalogSource;
use crate::models::RawCatalogRecord;
use crate::sp_api::{ApiCall, ApiError, ApiResponse, ResilientClient};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

const REPORTS_PATH: &str = "/reports/2021-06-30/reports";
const DOCUMENTS_PATH: &str = "/reports/2021-06-30/documents";
const LISTINGS_REPORT: &str = "GET_MERCHANT_LISTINGS_ALL_DATA";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedReport {
    report_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportStatus {
    processing_status: String,
    #[serde(default)]
    report_document_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportDocument {
    url: String,
    #[serde(default)]
    compression_algorithm: Option<String>,
}

fn decode<T: serde::de::DeserializeOwned>(response: ApiResponse) -> Result<T, ApiError> {
    match response {
        ApiResponse::Json(body) => {
            serde_json::from_value(body).map_err(|err| ApiError::Decode(err.to_string()))
        }
        ApiResponse::Expected { status, body } => Err(ApiError::Status {
            status: status.as_u16(),
            body,
        }),
    }
}

/// Parses the tab-separated merchant listings report by header name.
/// Rows keep a missing or blank SKU so the processor can reject them.
pub fn parse_listing_report(text: &str) -> Vec<RawCatalogRecord> {
    let mut lines = text.lines();
    let Some(header) = lines.next() else {
        return Vec::new();
    };
    let columns: Vec<&str> = header
        .trim_start_matches('\u{feff}')
        .split('\t')
        .map(str::trim)
        .collect();
    let position = |name: &str| columns.iter().position(|c| *c == name);
    let sku_col = position("seller-sku");
    let date_col = position("open-date");
    let channel_col = position("fulfillment-channel");
    let quantity_col = position("quantity");

    lines
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let fields: Vec<&str> = line.split('\t').collect();
            let field = |col: Option<usize>| {
                col.and_then(|i| fields.get(i))
                    .map(|v| v.trim())
                    .unwrap_or_default()
            };
            let sku = field(sku_col);
            RawCatalogRecord {
                sku: (!sku.is_empty()).then(|| sku.to_string()),
                created_date: field(date_col).to_string(),
                fulfillment_channel: field(channel_col).to_string(),
                quantity: field(quantity_col).parse().unwrap_or(0),
            }
        })
        .collect()
}

/// Catalog source backed by the merchant listings report.
#[derive(Clone)]
pub struct ReportsCatalog {
    client: ResilientClient,
    poll_interval: Duration,
    max_attempts: u32,
}

impl ReportsCatalog {
    pub fn new(client: ResilientClient) -> Self {
        Self {
            client,
            poll_interval: Duration::from_secs(30),
            max_attempts: 30,
        }
    }

    #[cfg(test)]
    pub fn with_polling(mut self, poll_interval: Duration, max_attempts: u32) -> Self {
        self.poll_interval = poll_interval;
        self.max_attempts = max_attempts.max(1);
        self
    }

    async fn create_report(&self) -> Result<String, ApiError> {
        let body = json!({
            "reportType": LISTINGS_REPORT,
            "marketplaceIds": [self.client.marketplace_id()],
        });
        let response = self.client.call(ApiCall::post(REPORTS_PATH, body)).await?;
        let created: CreatedReport = decode(response)?;
        info!(target: "cleanup.reports", report_id = %created.report_id, "created listings report");
        Ok(created.report_id)
    }

    async fn wait_for_document(&self, report_id: &str) -> Result<String, ApiError> {
        let path = format!("{REPORTS_PATH}/{report_id}");
        for attempt in 1..=self.max_attempts {
            let status: ReportStatus = decode(self.client.call(ApiCall::get(&path)).await?)?;
            match status.processing_status.as_str() {
                "DONE" => {
                    info!(target: "cleanup.reports", attempts = attempt, "report completed");
                    return status.report_document_id.ok_or_else(|| {
                        ApiError::Report("completed report has no document id".into())
                    });
                }
                "FATAL" | "CANCELLED" => {
                    return Err(ApiError::Report(format!(
                        "report {report_id} ended with status {}",
                        status.processing_status
                    )));
                }
                other => debug!(
                    target: "cleanup.reports",
                    status = other,
                    attempt = attempt,
                    max_attempts = self.max_attempts,
                    "report not ready"
                ),
            }
            if attempt < self.max_attempts {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
        Err(ApiError::Report(format!(
            "report {report_id} did not complete after {} polls",
            self.max_attempts
        )))
    }

    async fn download(&self, document_id: &str) -> Result<String, ApiError> {
        let path = format!("{DOCUMENTS_PATH}/{document_id}");
        let document: ReportDocument = decode(self.client.call(ApiCall::get(path)).await?)?;
        if let Some(algorithm) = document.compression_algorithm.as_deref()
            && !algorithm.is_empty()
        {
            return Err(ApiError::Report(format!(
                "unsupported document compression {algorithm}"
            )));
        }
        self.client.fetch_document(&document.url).await
    }
}

#[async_trait]
impl CatalogSource for ReportsCatalog {
    async fn fetch_catalog(&self) -> Result<Vec<RawCatalogRecord>, ApiError> {
        let report_id = self.create_report().await?;
        let document_id = self.wait_for_document(&report_id).await?;
        let text = self.download(&document_id).await?;
        let records = parse_listing_report(&text);
        info!(target: "cleanup.reports", records = records.len(), "parsed listings report");
        Ok(records)
    }
}
