//! Google Sheets v4 client, with spreadsheet discovery through Drive v3.

use crate::client::{paginate, ApiClient, Page};
use gridlink::{GridlinkConfig, Provider, RateLimiterRegistry, Result, TokenManager};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

const SPREADSHEET_MIME_TYPE: &str = "application/vnd.google-apps.spreadsheet";
const DRIVE_PAGE_SIZE: usize = 100;

/// A spreadsheet file as listed by Drive.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpreadsheetFile {
    pub id: String,
    pub name: String,
    pub modified_time: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFileList {
    #[serde(default)]
    files: Vec<SpreadsheetFile>,
    next_page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Spreadsheet {
    pub spreadsheet_id: String,
    pub properties: SpreadsheetProperties,
    #[serde(default)]
    pub sheets: Vec<Sheet>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpreadsheetProperties {
    pub title: String,
    pub locale: Option<String>,
    pub time_zone: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Sheet {
    pub properties: SheetProperties,
}

/// Tab-level properties.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetProperties {
    pub sheet_id: i64,
    pub title: String,
    #[serde(default)]
    pub index: i64,
    #[serde(default)]
    pub hidden: bool,
    pub grid_properties: Option<GridProperties>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GridProperties {
    #[serde(default)]
    pub row_count: u32,
    #[serde(default)]
    pub column_count: u32,
    #[serde(default)]
    pub frozen_row_count: u32,
}

/// Cell values for an A1 range, row-major.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueRange {
    pub range: String,
    pub major_dimension: Option<String>,
    #[serde(default)]
    pub values: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateValuesResponse {
    #[serde(default)]
    updated_cells: u64,
}

#[derive(Debug, Deserialize)]
struct AppendValuesResponse {
    updates: Option<AppendUpdates>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppendUpdates {
    #[serde(default)]
    updated_rows: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchUpdateResponse {
    #[serde(default)]
    pub replies: Vec<Value>,
}

/// Zero-based, end-exclusive cell rectangle on one sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridRange {
    pub start_row: u32,
    /// `None` extends to the last row.
    pub end_row: Option<u32>,
    pub start_column: u32,
    pub end_column: u32,
}

/// Data validation applied to a range.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationRule {
    /// Dropdown of fixed options.
    OneOfList(Vec<String>),
    Checkbox,
    NumberBetween { min: f64, max: f64 },
    DateIsValid,
}

impl ValidationRule {
    fn condition(&self) -> Value {
        match self {
            ValidationRule::OneOfList(options) => json!({
                "type": "ONE_OF_LIST",
                "values": options
                    .iter()
                    .map(|o| json!({ "userEnteredValue": o }))
                    .collect::<Vec<_>>(),
            }),
            ValidationRule::Checkbox => json!({ "type": "BOOLEAN" }),
            ValidationRule::NumberBetween { min, max } => json!({
                "type": "NUMBER_BETWEEN",
                "values": [
                    { "userEnteredValue": min.to_string() },
                    { "userEnteredValue": max.to_string() },
                ],
            }),
            ValidationRule::DateIsValid => json!({ "type": "DATE_IS_VALID" }),
        }
    }
}

/// Structural change applied through `spreadsheets.batchUpdate`.
///
/// Column indexes are zero-based; `end` is exclusive.
#[derive(Debug, Clone, PartialEq)]
pub enum SheetMutation {
    AddSheet { title: String },
    InsertColumns { sheet_id: i64, start: u32, count: u32 },
    HideColumns { sheet_id: i64, start: u32, end: u32, hidden: bool },
    ResizeColumns { sheet_id: i64, start: u32, end: u32, pixel_size: u32 },
    SetValidation { sheet_id: i64, range: GridRange, rule: ValidationRule },
}

fn column_span(sheet_id: i64, start: u32, end: u32) -> Value {
    json!({
        "sheetId": sheet_id,
        "dimension": "COLUMNS",
        "startIndex": start,
        "endIndex": end,
    })
}

impl SheetMutation {
    /// The `Request` object for this mutation.
    pub fn to_request(&self) -> Value {
        match self {
            SheetMutation::AddSheet { title } => json!({
                "addSheet": { "properties": { "title": title } }
            }),
            SheetMutation::InsertColumns {
                sheet_id,
                start,
                count,
            } => json!({
                "insertDimension": {
                    "range": column_span(*sheet_id, *start, start.saturating_add(*count)),
                    "inheritFromBefore": *start > 0,
                }
            }),
            SheetMutation::HideColumns {
                sheet_id,
                start,
                end,
                hidden,
            } => json!({
                "updateDimensionProperties": {
                    "range": column_span(*sheet_id, *start, *end),
                    "properties": { "hiddenByUser": hidden },
                    "fields": "hiddenByUser",
                }
            }),
            SheetMutation::ResizeColumns {
                sheet_id,
                start,
                end,
                pixel_size,
            } => json!({
                "updateDimensionProperties": {
                    "range": column_span(*sheet_id, *start, *end),
                    "properties": { "pixelSize": pixel_size },
                    "fields": "pixelSize",
                }
            }),
            SheetMutation::SetValidation {
                sheet_id,
                range,
                rule,
            } => {
                let mut grid = json!({
                    "sheetId": sheet_id,
                    "startRowIndex": range.start_row,
                    "startColumnIndex": range.start_column,
                    "endColumnIndex": range.end_column,
                });
                if let Some(end_row) = range.end_row {
                    grid["endRowIndex"] = json!(end_row);
                }
                json!({
                    "setDataValidation": {
                        "range": grid,
                        "rule": {
                            "condition": rule.condition(),
                            "strict": true,
                            "showCustomUi": true,
                        }
                    }
                })
            }
        }
    }
}

/// Typed Google Sheets operations on behalf of connected users.
pub struct SheetsClient {
    api: ApiClient,
}

impl SheetsClient {
    pub fn new(
        tokens: Arc<TokenManager>,
        limiters: Arc<RateLimiterRegistry>,
        config: &GridlinkConfig,
    ) -> Result<Self> {
        Ok(Self {
            api: ApiClient::new(Provider::GoogleSheets, tokens, limiters, config)?,
        })
    }

    /// Spreadsheets visible to the user, most recently modified first.
    pub async fn list_spreadsheets(
        &self,
        user_id: &str,
        max_results: Option<usize>,
    ) -> Result<Vec<SpreadsheetFile>> {
        let query = format!("mimeType='{}' and trashed=false", SPREADSHEET_MIME_TYPE);
        let page_size = max_results.map_or(DRIVE_PAGE_SIZE, |m| m.clamp(1, DRIVE_PAGE_SIZE));
        let base = self.api.list_url(&format!(
            "/files?q={}&fields={}&orderBy=modifiedTime%20desc&pageSize={}",
            urlencoding::encode(&query),
            urlencoding::encode("nextPageToken,files(id,name,modifiedTime)"),
            page_size
        ));

        paginate(max_results, |cursor| {
            let url = match cursor {
                Some(token) => format!("{}&pageToken={}", base, urlencoding::encode(&token)),
                None => base.clone(),
            };
            self.files_page(user_id, url)
        })
        .await
    }

    async fn files_page(&self, user_id: &str, url: String) -> Result<Page<SpreadsheetFile>> {
        let list: DriveFileList = self.api.get(user_id, &url).await?;
        Ok(Page {
            items: list.files,
            next: list.next_page_token,
        })
    }

    /// Spreadsheet title and the properties of every tab.
    pub async fn get_spreadsheet(&self, user_id: &str, spreadsheet_id: &str) -> Result<Spreadsheet> {
        let url = self.api.api_url(&format!(
            "/spreadsheets/{}?fields={}",
            urlencoding::encode(spreadsheet_id),
            urlencoding::encode("spreadsheetId,properties(title,locale,timeZone),sheets.properties")
        ));
        self.api.get(user_id, &url).await
    }

    pub async fn read_range(&self, user_id: &str, spreadsheet_id: &str, range: &str) -> Result<ValueRange> {
        let url = self.values_url(spreadsheet_id, range, "");
        self.api.get(user_id, &url).await
    }

    /// Overwrites `range` with `values`, parsed as if typed by the user.
    /// Returns the number of updated cells.
    pub async fn write_range(
        &self,
        user_id: &str,
        spreadsheet_id: &str,
        range: &str,
        values: Vec<Vec<Value>>,
    ) -> Result<u64> {
        let url = self.values_url(spreadsheet_id, range, "?valueInputOption=USER_ENTERED");
        let body = json!({
            "range": range,
            "majorDimension": "ROWS",
            "values": values,
        });
        let response: UpdateValuesResponse = self.api.put(user_id, &url, body).await?;
        Ok(response.updated_cells)
    }

    /// Appends rows after the table found in `range`. Returns the number of rows written.
    pub async fn append_rows(
        &self,
        user_id: &str,
        spreadsheet_id: &str,
        range: &str,
        rows: Vec<Vec<Value>>,
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let url = self.values_url(
            spreadsheet_id,
            range,
            ":append?valueInputOption=USER_ENTERED&insertDataOption=INSERT_ROWS",
        );
        let body = json!({ "majorDimension": "ROWS", "values": rows });
        let response: AppendValuesResponse = self.api.post(user_id, &url, body).await?;
        Ok(response.updates.map_or(0, |u| u.updated_rows))
    }

    /// Clears values in `range`; formatting and validation stay.
    pub async fn clear_range(&self, user_id: &str, spreadsheet_id: &str, range: &str) -> Result<()> {
        let url = self.values_url(spreadsheet_id, range, ":clear");
        let _: Value = self.api.post(user_id, &url, json!({})).await?;
        Ok(())
    }

    /// Applies all mutations in one atomic `batchUpdate`.
    pub async fn batch_update(
        &self,
        user_id: &str,
        spreadsheet_id: &str,
        mutations: &[SheetMutation],
    ) -> Result<BatchUpdateResponse> {
        if mutations.is_empty() {
            return Ok(BatchUpdateResponse { replies: Vec::new() });
        }
        let url = self.api.api_url(&format!(
            "/spreadsheets/{}:batchUpdate",
            urlencoding::encode(spreadsheet_id)
        ));
        let requests: Vec<Value> = mutations.iter().map(SheetMutation::to_request).collect();
        self.api
            .post(user_id, &url, json!({ "requests": requests }))
            .await
    }

    fn values_url(&self, spreadsheet_id: &str, range: &str, suffix: &str) -> String {
        self.api.api_url(&format!(
            "/spreadsheets/{}/values/{}{}",
            urlencoding::encode(spreadsheet_id),
            urlencoding::encode(range),
            suffix
        ))
    }
}
