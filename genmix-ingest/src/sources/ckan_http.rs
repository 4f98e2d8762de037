use std::time::Duration;

use reqwest::StatusCode;
use serde_json::{Map, Value};
use time::{format_description::FormatItem, macros::format_description, OffsetDateTime};

use super::paged::{FetchError, PageClient, PageRequest};

/// Public NESO datastore endpoint serving the historic generation mix.
pub const DEFAULT_BASE_URL: &str = "https://api.neso.energy/api/3/action/datastore_search_sql";

const QUERY_TS_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");

#[derive(serde::Deserialize)]
struct DatastoreResponse {
    success: bool,
    #[serde(default)]
    result: Option<DatastoreResult>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(serde::Deserialize)]
struct DatastoreResult {
    #[serde(default)]
    records: Vec<Map<String, Value>>,
}

/// `PageClient` for a CKAN `datastore_search_sql` endpoint.
#[derive(Clone)]
pub struct CkanSqlClient {
    http: reqwest::Client,
    base_url: String,
    resource_id: String,
}

impl CkanSqlClient {
    pub fn new(base_url: &str, resource_id: &str, request_timeout: Duration) -> Result<Self, FetchError> {
        if resource_id.is_empty()
            || !resource_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(FetchError::Rejected(format!("invalid resource id '{resource_id}'")));
        }

        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| FetchError::Rejected(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.to_string(),
            resource_id: resource_id.to_string(),
        })
    }

    fn window_sql(&self, request: &PageRequest) -> Result<String, FetchError> {
        let fmt = |ts: OffsetDateTime| {
            ts.format(QUERY_TS_FORMAT)
                .map_err(|e| FetchError::Rejected(format!("unformattable window bound: {e}")))
        };

        Ok(format!(
            r#"SELECT * FROM "{}" WHERE "DATETIME" >= '{}' AND "DATETIME" < '{}' ORDER BY "DATETIME" ASC, "_id" ASC LIMIT {} OFFSET {}"#,
            self.resource_id,
            fmt(request.window.start)?,
            fmt(request.window.end)?,
            request.limit,
            request.offset,
        ))
    }
}

fn classify_status(status: StatusCode) -> Option<FetchError> {
    if status.is_success() {
        None
    } else if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        Some(FetchError::Transient(format!("upstream returned {status}")))
    } else {
        Some(FetchError::Rejected(format!("upstream returned {status}")))
    }
}

fn classify_transport(e: reqwest::Error) -> FetchError {
    if e.is_decode() || e.is_builder() {
        FetchError::Rejected(e.to_string())
    } else {
        FetchError::Transient(e.to_string())
    }
}

fn unwrap_response(body: DatastoreResponse) -> Result<Vec<Map<String, Value>>, FetchError> {
    if !body.success {
        let detail = body.error.map(|e| e.to_string()).unwrap_or_default();
        return Err(FetchError::Rejected(format!("datastore returned success=false {detail}")));
    }
    Ok(body.result.map(|r| r.records).unwrap_or_default())
}

#[async_trait::async_trait]
impl PageClient for CkanSqlClient {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Vec<Map<String, Value>>, FetchError> {
        let sql = self.window_sql(request)?;

        let response = self
            .http
            .get(&self.base_url)
            .query(&[("sql", sql.as_str())])
            .send()
            .await
            .map_err(classify_transport)?;

        if let Some(err) = classify_status(response.status()) {
            return Err(err);
        }

        let body: DatastoreResponse = response.json().await.map_err(classify_transport)?;
        unwrap_response(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::FetchWindow;
    use time::macros::datetime;

    #[test]
    fn window_query_filters_orders_and_pages() {
        let client = CkanSqlClient::new(DEFAULT_BASE_URL, "f93d1835-75bc", Duration::from_secs(5)).unwrap();
        let request = PageRequest {
            window: FetchWindow {
                start: datetime!(2025-01-01 00:00 UTC),
                end: datetime!(2025-01-01 12:30 UTC),
            },
            offset: 200,
            limit: 100,
        };

        let sql = client.window_sql(&request).unwrap();
        assert_eq!(
            sql,
            r#"SELECT * FROM "f93d1835-75bc" WHERE "DATETIME" >= '2025-01-01T00:00:00' AND "DATETIME" < '2025-01-01T12:30:00' ORDER BY "DATETIME" ASC, "_id" ASC LIMIT 100 OFFSET 200"#
        );
    }

    #[test]
    fn resource_ids_with_quotes_are_refused() {
        let res = CkanSqlClient::new(DEFAULT_BASE_URL, r#"x" OR 1=1"#, Duration::from_secs(5));
        assert!(matches!(res, Err(FetchError::Rejected(_))));
    }

    #[test]
    fn server_errors_are_transient_client_errors_are_not() {
        assert_eq!(classify_status(StatusCode::OK), None);
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY),
            Some(FetchError::Transient(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            Some(FetchError::Transient(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN),
            Some(FetchError::Rejected(_))
        ));
    }

    #[test]
    fn unsuccessful_payload_is_rejected() {
        let body: DatastoreResponse =
            serde_json::from_str(r#"{"success": false, "error": {"message": "bad sql"}}"#).unwrap();
        assert!(matches!(unwrap_response(body), Err(FetchError::Rejected(_))));

        let body: DatastoreResponse =
            serde_json::from_str(r#"{"success": true, "result": {"records": [{"_id": 1}]}}"#).unwrap();
        assert_eq!(unwrap_response(body).unwrap().len(), 1);
    }
}
