// Booking platform endpoints read by the admin, vendor and explorer surfaces

use crate::descriptor::{Params, ResourceDescriptor};
use crate::error::QueryError;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);
const HOUR: Duration = Duration::from_secs(60 * 60);
const MAX_PAGE_SIZE: u32 = 100;

// Envelope every platform endpoint responds with
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    pub data: T,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Bank {
    pub name: String,
    pub code: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

pub type BanksResponse = ApiResponse<Vec<Bank>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Surface {
    Admin,
    Vendor,
    Explorer,
}

impl Surface {
    pub fn as_str(&self) -> &'static str {
        match self {
            Surface::Admin => "admin",
            Surface::Vendor => "vendor",
            Surface::Explorer => "explorer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformConfig {
    pub currency: String,
    pub service_fee_percent: f64,
    #[serde(default)]
    pub support_email: Option<String>,
    // Bookable categories enabled for the surface, e.g. "movies", "events"
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub features: BTreeMap<String, bool>,
}

pub type PlatformConfigResponse = ApiResponse<PlatformConfig>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Successful,
    Failed,
    Reversed,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    pub reference: String,
    pub amount: f64,
    pub currency: String,
    pub status: TransactionStatus,
    #[serde(default)]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionPage {
    pub transactions: Vec<Transaction>,
    pub page: u32,
    pub total: u64,
}

pub type TransactionsResponse = ApiResponse<TransactionPage>;
pub type TransactionResponse = ApiResponse<Transaction>;

// Typed filter for the transactions listing
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransactionFilter {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub status: Option<TransactionStatus>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl TransactionFilter {
    pub fn to_params(&self) -> Result<Params, QueryError> {
        Params::from_serialize(self)
    }
}

pub fn country_params(country: &str) -> Params {
    Params::new().with("country", country)
}

pub fn surface_params(surface: Surface) -> Params {
    Params::new().with("surface", surface.as_str())
}

pub fn reference_params(reference: &str) -> Params {
    Params::new().with("reference", reference)
}

// Bank lists rarely change
pub fn banks() -> ResourceDescriptor<BanksResponse> {
    ResourceDescriptor::get("banks", "banks")
        .required_query_param("country")
        .freshness(DAY)
        .validate_with(validate_country)
}

pub fn platform_config() -> ResourceDescriptor<PlatformConfigResponse> {
    ResourceDescriptor::get("platform_config", "config/{surface}")
        .freshness(HOUR)
        .idempotent()
        .validate_with(validate_surface)
}

// Balances move with every booking, so always refetch
pub fn transactions() -> ResourceDescriptor<TransactionsResponse> {
    ResourceDescriptor::get("transactions", "transactions")
        .query_param("page")
        .query_param("limit")
        .query_param("status")
        .query_param("from")
        .query_param("to")
        .freshness(Duration::ZERO)
        .validate_with(validate_transaction_filter)
}

pub fn transaction() -> ResourceDescriptor<TransactionResponse> {
    ResourceDescriptor::get("transaction", "transactions/{reference}").freshness(Duration::ZERO)
}

fn validate_country(params: &Params) -> Result<(), String> {
    match params.get("country") {
        Some(country) if !country.is_empty() && country.chars().all(|c| c.is_ascii_lowercase() || c == '-') => {
            Ok(())
        }
        Some(country) => Err(format!("country {:?} must be a lowercase slug", country)),
        None => Err("country is required".to_string()),
    }
}

fn validate_surface(params: &Params) -> Result<(), String> {
    match params.get("surface") {
        Some("admin" | "vendor" | "explorer") => Ok(()),
        Some(other) => Err(format!("unknown surface {:?}", other)),
        None => Err("surface is required".to_string()),
    }
}

fn validate_transaction_filter(params: &Params) -> Result<(), String> {
    for name in ["page", "limit"] {
        if let Some(raw) = params.get(name) {
            let value: u32 = raw
                .parse()
                .map_err(|_| format!("{} must be a positive integer, got {:?}", name, raw))?;
            if value == 0 {
                return Err(format!("{} must be at least 1", name));
            }
            if name == "limit" && value > MAX_PAGE_SIZE {
                return Err(format!("limit must be at most {}", MAX_PAGE_SIZE));
            }
        }
    }

    if let Some(status) = params.get("status") {
        if !matches!(status, "pending" | "successful" | "failed" | "reversed") {
            return Err(format!("unknown status {:?}", status));
        }
    }

    let parse_date = |name: &str| -> Result<Option<NaiveDate>, String> {
        params
            .get(name)
            .map(|raw| {
                NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                    .map_err(|_| format!("{} must be a YYYY-MM-DD date, got {:?}", name, raw))
            })
            .transpose()
    };
    if let (Some(from), Some(to)) = (parse_date("from")?, parse_date("to")?) {
        if from > to {
            return Err(format!("from ({}) is after to ({})", from, to));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::executor::QueryClient;
    use crate::transport::mock_transport::{MockReply, MockTransport};
    use crate::transport::Transport;
    use reqwest::Url;
    use serde_json::json;
    use std::sync::Arc;
    use test_case::test_case;

    fn base() -> Url {
        Url::parse("https://api.example.com/api/v1").unwrap()
    }

    #[test]
    fn test_banks_payload_decodes() {
        let body = json!({
            "success": true,
            "data": [
                {"name": "Access Bank", "code": "044", "slug": "access-bank", "currency": "NGN"},
                {"name": "GTBank", "code": "058"}
            ]
        });

        let parsed = banks().parse(body.to_string().as_bytes()).unwrap();
        assert!(parsed.success);
        assert_eq!(parsed.data.len(), 2);
        assert_eq!(parsed.data[0].slug.as_deref(), Some("access-bank"));
        assert_eq!(parsed.data[1].currency, None);
    }

    #[test]
    fn test_banks_missing_code_is_schema_error() {
        let body = json!({"success": true, "data": [{"name": "Access Bank"}]});
        let err = banks().parse(body.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, QueryError::SchemaError(_)));
    }

    #[test]
    fn test_transactions_decode_timestamps_and_status() {
        let body = json!({
            "success": true,
            "message": "Transactions fetched",
            "data": {
                "transactions": [{
                    "id": "tx_1",
                    "reference": "BK-2026-0001",
                    "amount": 15000.0,
                    "currency": "NGN",
                    "status": "successful",
                    "createdAt": "2026-10-01T09:30:00Z"
                }],
                "page": 1,
                "total": 1
            }
        });

        let parsed = transactions().parse(body.to_string().as_bytes()).unwrap();
        let transaction = &parsed.data.transactions[0];
        assert_eq!(transaction.status, TransactionStatus::Successful);
        assert_eq!(transaction.created_at.to_rfc3339(), "2026-10-01T09:30:00+00:00");
        assert_eq!(parsed.message.as_deref(), Some("Transactions fetched"));
    }

    #[test]
    fn test_transaction_filter_builds_query() {
        let filter = TransactionFilter {
            page: Some(2),
            limit: Some(20),
            status: Some(TransactionStatus::Pending),
            from: NaiveDate::from_ymd_opt(2026, 9, 1),
            to: NaiveDate::from_ymd_opt(2026, 9, 30),
        };

        let request = transactions()
            .build_request(&base(), &filter.to_params().unwrap())
            .unwrap();
        assert_eq!(
            request.url.as_str(),
            "https://api.example.com/api/v1/transactions?from=2026-09-01&limit=20&page=2&status=pending&to=2026-09-30"
        );
    }

    #[test_case("page", "0" ; "zero page")]
    #[test_case("limit", "500" ; "oversized page")]
    #[test_case("status", "refunded" ; "unknown status")]
    #[test_case("from", "01/09/2026" ; "bad date format")]
    fn test_invalid_transaction_filters(name: &str, value: &str) {
        let params = Params::new().with(name, value);
        let err = transactions().build_request(&base(), &params).unwrap_err();
        assert!(matches!(err, QueryError::ValidationError(_)), "{:?}", err);
    }

    #[test]
    fn test_reversed_date_range_is_rejected() {
        let filter = TransactionFilter {
            from: NaiveDate::from_ymd_opt(2026, 10, 1),
            to: NaiveDate::from_ymd_opt(2026, 9, 1),
            ..TransactionFilter::default()
        };
        assert!(transactions()
            .build_request(&base(), &filter.to_params().unwrap())
            .is_err());
    }

    #[test_case("Nigeria", false ; "uppercase")]
    #[test_case("", false ; "empty")]
    #[test_case("cote-divoire", true ; "hyphenated slug")]
    #[test_case("ghana", true ; "plain slug")]
    fn test_country_validation(country: &str, valid: bool) {
        let result = banks().build_request(&base(), &country_params(country));
        assert_eq!(result.is_ok(), valid, "{:?}", result);
    }

    #[test]
    fn test_config_and_transaction_paths() {
        let request = platform_config()
            .build_request(&base(), &surface_params(Surface::Vendor))
            .unwrap();
        assert_eq!(request.url.as_str(), "https://api.example.com/api/v1/config/vendor");
        assert!(platform_config()
            .build_request(&base(), &Params::new().with("surface", "partner"))
            .is_err());

        let request = transaction()
            .build_request(&base(), &reference_params("BK/2026/7"))
            .unwrap();
        assert_eq!(
            request.url.as_str(),
            "https://api.example.com/api/v1/transactions/BK%2F2026%2F7"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_platform_config_retries_server_errors() {
        let config = json!({
            "success": true,
            "data": {"currency": "NGN", "serviceFeePercent": 2.5, "categories": ["movies", "events"]}
        });
        let transport = Arc::new(MockTransport::new().always(MockReply::Json(200, config)));
        transport.push_reply(MockReply::Json(502, json!({})));
        let dyn_transport: Arc<dyn Transport> = transport.clone();
        let client = QueryClient::with_transport(ClientConfig::default(), dyn_transport).unwrap();

        let config = client
            .query(&platform_config(), &surface_params(Surface::Explorer))
            .await
            .unwrap();
        assert_eq!(config.data.service_fee_percent, 2.5);
        assert_eq!(config.data.categories, vec!["movies", "events"]);
        assert_eq!(transport.calls(), 2);
    }
}
