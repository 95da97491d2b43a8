//! Google Sheets `values:append` destination.
//!
//! Authentication is handled outside this crate: the destination is given a
//! ready OAuth bearer token.

use super::{AppendFuture, Destination};
use crate::error::DestinationError;
use crate::model::SummaryRow;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Connection settings for the Sheets API.
#[derive(Debug, Clone)]
pub struct SheetsConfig {
    pub endpoint: String,
    pub spreadsheet_id: String,
    pub access_token: String,
    pub request_timeout: Duration,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ValueRange<'a> {
    range: &'a str,
    major_dimension: &'static str,
    values: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct AppendValuesResponse {
    updates: Option<UpdateValuesResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateValuesResponse {
    updated_range: Option<String>,
}

pub struct SheetsDestination {
    client: reqwest::Client,
    config: SheetsConfig,
}

impl SheetsDestination {
    pub fn new(config: SheetsConfig) -> Result<Self, DestinationError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(SheetsDestination { client, config })
    }

    /// `{endpoint}/v4/spreadsheets/{id}/values/{range}:append?valueInputOption=USER_ENTERED`
    fn append_url(&self, range: &str) -> Result<Url, DestinationError> {
        let mut url = Url::parse(&self.config.endpoint).map_err(|e| {
            DestinationError::Unavailable(format!("invalid endpoint {}: {e}", self.config.endpoint))
        })?;

        let action = format!("{range}:append");
        url.path_segments_mut()
            .map_err(|_| {
                let endpoint = &self.config.endpoint;
                DestinationError::Unavailable(format!("endpoint {endpoint} cannot be a base"))
            })?
            .pop_if_empty()
            .extend([
                "v4",
                "spreadsheets",
                self.config.spreadsheet_id.as_str(),
                "values",
                action.as_str(),
            ]);
        url.query_pairs_mut()
            .append_pair("valueInputOption", "USER_ENTERED");
        Ok(url)
    }

    async fn send(&self, range: &str, row: &SummaryRow) -> Result<String, DestinationError> {
        let url = self.append_url(range)?;
        let body = ValueRange {
            range,
            major_dimension: "ROWS",
            values: vec![row.values()],
        };

        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.config.access_token)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DestinationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: AppendValuesResponse = resp.json().await?;
        let updated = parsed
            .updates
            .and_then(|u| u.updated_range)
            .ok_or(DestinationError::MissingRange)?;

        debug!(requested = %range, updated = %updated, "sheets append done");
        Ok(updated)
    }
}

impl Destination for SheetsDestination {
    fn name(&self) -> &str {
        "google-sheets"
    }

    fn append<'a>(&'a self, range: &'a str, row: &'a SummaryRow) -> AppendFuture<'a> {
        Box::pin(self.send(range, row))
    }
}
