use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;

use tally_core::error::{MirrorError, MirrorResult};
use tally_core::sheets::{
    ApiErrorBody, Row, SpreadsheetMeta, ValueRange, Workbook, add_sheet_request,
    delete_row_request,
};

/// Google Sheets v4 REST client.
pub struct GoogleSheetsClient {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl GoogleSheetsClient {
    pub fn new(endpoint: &str, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!(
                "tally-cli/{} (budget ledger)",
                env!("CARGO_PKG_VERSION")
            ))
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.trim().is_empty()),
        })
    }

    fn spreadsheet_url(&self, spreadsheet_id: &str, suffix: &str) -> String {
        format!(
            "{}/{}{suffix}",
            self.endpoint,
            percent_encode_component(spreadsheet_id)
        )
    }

    fn values_url(&self, spreadsheet_id: &str, range: &str, action: &str) -> String {
        self.spreadsheet_url(
            spreadsheet_id,
            &format!("/values/{}{action}", percent_encode_component(range)),
        )
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let request = self.client.request(method, url);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> MirrorResult<Response> {
        let response = request
            .send()
            .await
            .map_err(|e| MirrorError::Connectivity(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiErrorBody>(&body)
            .map(|b| b.error.message)
            .unwrap_or_else(|_| truncate(&body, 200));
        tracing::debug!(status = status.as_u16(), "sheets request failed: {message}");
        Err(match status.as_u16() {
            401 | 403 => MirrorError::Unauthorized(message),
            code => MirrorError::Api {
                status: code,
                message,
            },
        })
    }

    async fn json<T: DeserializeOwned>(response: Response) -> MirrorResult<T> {
        let status = response.status().as_u16();
        response.json().await.map_err(|e| MirrorError::Api {
            status,
            message: format!("unexpected response body: {e}"),
        })
    }

    async fn spreadsheet_meta(&self, spreadsheet_id: &str) -> MirrorResult<SpreadsheetMeta> {
        let url = self.spreadsheet_url(spreadsheet_id, "");
        let response = self
            .send(
                self.request(Method::GET, &url)
                    .query(&[("fields", "sheets.properties")]),
            )
            .await?;
        Self::json(response).await
    }

    async fn batch_update(
        &self,
        spreadsheet_id: &str,
        body: &serde_json::Value,
    ) -> MirrorResult<()> {
        let url = self.spreadsheet_url(spreadsheet_id, ":batchUpdate");
        self.send(self.request(Method::POST, &url).json(body))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Workbook for GoogleSheetsClient {
    async fn sheet_titles(&self, spreadsheet_id: &str) -> MirrorResult<Vec<String>> {
        Ok(self.spreadsheet_meta(spreadsheet_id).await?.titles())
    }

    async fn add_sheet(&self, spreadsheet_id: &str, title: &str) -> MirrorResult<()> {
        self.batch_update(spreadsheet_id, &add_sheet_request(title))
            .await
    }

    async fn read_rows(&self, spreadsheet_id: &str, title: &str) -> MirrorResult<Vec<Row>> {
        let url = self.values_url(spreadsheet_id, &sheet_range(title, "A1:Z"), "");
        let response = self
            .send(
                self.request(Method::GET, &url)
                    .query(&[("majorDimension", "ROWS")]),
            )
            .await?;
        let range: ValueRange = Self::json(response).await?;
        Ok(range.into_rows())
    }

    async fn append_rows(
        &self,
        spreadsheet_id: &str,
        title: &str,
        rows: Vec<Row>,
    ) -> MirrorResult<()> {
        let url = self.values_url(spreadsheet_id, &sheet_range(title, "A1"), ":append");
        self.send(
            self.request(Method::POST, &url)
                .query(&[
                    ("valueInputOption", "RAW"),
                    ("insertDataOption", "INSERT_ROWS"),
                ])
                .json(&ValueRange::from_rows(rows)),
        )
        .await?;
        Ok(())
    }

    async fn update_row(
        &self,
        spreadsheet_id: &str,
        title: &str,
        index: usize,
        row: Row,
    ) -> MirrorResult<()> {
        let url = self.values_url(
            spreadsheet_id,
            &sheet_range(title, &format!("A{}", index + 1)),
            "",
        );
        self.send(
            self.request(Method::PUT, &url)
                .query(&[("valueInputOption", "RAW")])
                .json(&ValueRange::from_rows(vec![row])),
        )
        .await?;
        Ok(())
    }

    async fn delete_row(
        &self,
        spreadsheet_id: &str,
        title: &str,
        index: usize,
    ) -> MirrorResult<()> {
        let meta = self.spreadsheet_meta(spreadsheet_id).await?;
        let sheet_id = meta.sheet_id(title).ok_or_else(|| MirrorError::Api {
            status: 400,
            message: format!("no sheet titled '{title}'"),
        })?;
        self.batch_update(spreadsheet_id, &delete_row_request(sheet_id, index))
            .await
    }

    async fn clear_rows(&self, spreadsheet_id: &str, title: &str, from: usize) -> MirrorResult<()> {
        let url = self.values_url(
            spreadsheet_id,
            &sheet_range(title, &format!("A{}:Z", from + 1)),
            ":clear",
        );
        self.send(
            self.request(Method::POST, &url)
                .json(&serde_json::json!({})),
        )
        .await?;
        Ok(())
    }
}

/// A1 range on a titled sheet, with the title quoted.
fn sheet_range(title: &str, cells: &str) -> String {
    format!("'{}'!{cells}", title.replace('\'', "''"))
}

/// Percent-encode a URL path segment.
///
/// Everything outside the RFC 3986 unreserved set is escaped, which covers
/// the `'`, `!` and `:` that appear in A1 ranges.
fn percent_encode_component(input: &str) -> String {
    let mut encoded = String::with_capacity(input.len() * 3);
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char);
            }
            _ => {
                encoded.push('%');
                encoded.push(char::from(HEX_CHARS[(byte >> 4) as usize]));
                encoded.push(char::from(HEX_CHARS[(byte & 0x0F) as usize]));
            }
        }
    }
    encoded
}

const HEX_CHARS: [u8; 16] = *b"0123456789ABCDEF";

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}...")
    }
}
