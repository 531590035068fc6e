//! Airtable REST and metadata API client.
//!
//! Record writes are limited to 10 records per request by Airtable; the
//! client splits larger batches and sends the chunks in order.

use crate::client::{paginate, ApiClient, Page};
use gridlink::{GridlinkConfig, Provider, RateLimiterRegistry, Result, TokenManager};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::debug;

/// Maximum records per create/update/delete request.
pub const MAX_RECORDS_PER_REQUEST: usize = 10;

/// Field values keyed by field name.
pub type Fields = Map<String, Value>;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Base {
    pub id: String,
    pub name: String,
    pub permission_level: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BaseList {
    #[serde(default)]
    bases: Vec<Base>,
    offset: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    pub id: String,
    pub name: String,
    pub primary_field_id: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub fields: Vec<Field>,
    #[serde(default)]
    pub views: Vec<View>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Field {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    pub description: Option<String>,
    pub options: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct View {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub view_type: String,
}

#[derive(Debug, Deserialize)]
struct TableList {
    #[serde(default)]
    tables: Vec<Table>,
}

/// Definition of a field to create.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, field_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: field_type.into(),
            description: None,
            options: None,
        }
    }

    pub fn with_options(mut self, options: Value) -> Self {
        self.options = Some(options);
        self
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    pub created_time: Option<String>,
    #[serde(default)]
    pub fields: Fields,
}

#[derive(Debug, Deserialize)]
struct RecordList {
    #[serde(default)]
    records: Vec<Record>,
    offset: Option<String>,
}

/// A partial update of one record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordUpdate {
    pub id: String,
    pub fields: Fields,
}

#[derive(Debug, Deserialize)]
struct DeletedRecord {
    id: String,
    #[serde(default)]
    deleted: bool,
}

#[derive(Debug, Deserialize)]
struct DeleteResponse {
    #[serde(default)]
    records: Vec<DeletedRecord>,
}

/// Query options for [`AirtableClient::list_records`].
#[derive(Debug, Clone, Default)]
pub struct ListRecordsOptions {
    pub view: Option<String>,
    pub filter_by_formula: Option<String>,
    /// Only return these fields.
    pub fields: Vec<String>,
    /// Records per page (Airtable caps this at 100).
    pub page_size: Option<u32>,
    /// Stop after this many records across all pages.
    pub max_records: Option<usize>,
}

impl ListRecordsOptions {
    fn query(&self) -> Vec<(String, String)> {
        let mut query = Vec::new();
        if let Some(view) = &self.view {
            query.push(("view".to_string(), view.clone()));
        }
        if let Some(formula) = &self.filter_by_formula {
            query.push(("filterByFormula".to_string(), formula.clone()));
        }
        for field in &self.fields {
            query.push(("fields[]".to_string(), field.clone()));
        }
        if let Some(page_size) = self.page_size {
            query.push(("pageSize".to_string(), page_size.min(100).to_string()));
        }
        if let Some(max) = self.max_records {
            query.push(("maxRecords".to_string(), max.to_string()));
        }
        query
    }
}

fn encode_query(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn with_offset(base: &str, offset: Option<String>) -> String {
    match offset {
        Some(offset) => {
            let sep = if base.contains('?') { '&' } else { '?' };
            format!("{}{}offset={}", base, sep, urlencoding::encode(&offset))
        }
        None => base.to_string(),
    }
}

/// Typed Airtable operations on behalf of connected users.
pub struct AirtableClient {
    api: ApiClient,
}

impl AirtableClient {
    pub fn new(
        tokens: Arc<TokenManager>,
        limiters: Arc<RateLimiterRegistry>,
        config: &GridlinkConfig,
    ) -> Result<Self> {
        Ok(Self {
            api: ApiClient::new(Provider::Airtable, tokens, limiters, config)?,
        })
    }

    /// Bases the user granted access to.
    pub async fn list_bases(&self, user_id: &str, max_results: Option<usize>) -> Result<Vec<Base>> {
        let base = self.api.list_url("/bases");
        paginate(max_results, |offset| {
            self.bases_page(user_id, with_offset(&base, offset))
        })
        .await
    }

    async fn bases_page(&self, user_id: &str, url: String) -> Result<Page<Base>> {
        let list: BaseList = self.api.get(user_id, &url).await?;
        Ok(Page {
            items: list.bases,
            next: list.offset,
        })
    }

    /// Tables of a base, with their fields and views.
    pub async fn get_base_schema(&self, user_id: &str, base_id: &str) -> Result<Vec<Table>> {
        let url = self
            .api
            .list_url(&format!("/bases/{}/tables", urlencoding::encode(base_id)));
        let list: TableList = self.api.get(user_id, &url).await?;
        Ok(list.tables)
    }

    pub async fn list_records(
        &self,
        user_id: &str,
        base_id: &str,
        table: &str,
        options: &ListRecordsOptions,
    ) -> Result<Vec<Record>> {
        let mut base = self.table_url(base_id, table);
        let query = options.query();
        if !query.is_empty() {
            base = format!("{}?{}", base, encode_query(&query));
        }

        paginate(options.max_records, |offset| {
            self.records_page(user_id, with_offset(&base, offset))
        })
        .await
    }

    async fn records_page(&self, user_id: &str, url: String) -> Result<Page<Record>> {
        let list: RecordList = self.api.get(user_id, &url).await?;
        Ok(Page {
            items: list.records,
            next: list.offset,
        })
    }

    pub async fn get_record(
        &self,
        user_id: &str,
        base_id: &str,
        table: &str,
        record_id: &str,
    ) -> Result<Record> {
        let url = format!(
            "{}/{}",
            self.table_url(base_id, table),
            urlencoding::encode(record_id)
        );
        self.api.get(user_id, &url).await
    }

    /// Creates records, returning them in input order.
    pub async fn create_records(
        &self,
        user_id: &str,
        base_id: &str,
        table: &str,
        records: Vec<Fields>,
    ) -> Result<Vec<Record>> {
        let url = self.table_url(base_id, table);
        let mut created = Vec::with_capacity(records.len());

        for chunk in records.chunks(MAX_RECORDS_PER_REQUEST) {
            let body = json!({
                "records": chunk.iter().map(|fields| json!({ "fields": fields })).collect::<Vec<_>>(),
                "typecast": true,
            });
            let list: RecordList = self.api.post(user_id, &url, body).await?;
            created.extend(list.records);
        }

        debug!(base_id = %base_id, table = %table, count = created.len(), "Created Airtable records");
        Ok(created)
    }

    /// Updates only the given fields of each record.
    pub async fn update_records(
        &self,
        user_id: &str,
        base_id: &str,
        table: &str,
        updates: Vec<RecordUpdate>,
    ) -> Result<Vec<Record>> {
        let url = self.table_url(base_id, table);
        let mut updated = Vec::with_capacity(updates.len());

        for chunk in updates.chunks(MAX_RECORDS_PER_REQUEST) {
            let body = json!({ "records": chunk, "typecast": true });
            let list: RecordList = self.api.patch(user_id, &url, body).await?;
            updated.extend(list.records);
        }

        Ok(updated)
    }

    /// Deletes records; returns the ids Airtable confirmed as deleted.
    pub async fn delete_records(
        &self,
        user_id: &str,
        base_id: &str,
        table: &str,
        record_ids: &[String],
    ) -> Result<Vec<String>> {
        let mut deleted = Vec::with_capacity(record_ids.len());

        for chunk in record_ids.chunks(MAX_RECORDS_PER_REQUEST) {
            let pairs: Vec<(String, String)> = chunk
                .iter()
                .map(|id| ("records[]".to_string(), id.clone()))
                .collect();
            let url = format!("{}?{}", self.table_url(base_id, table), encode_query(&pairs));
            let response: DeleteResponse = self.api.delete(user_id, &url).await?;
            deleted.extend(response.records.into_iter().filter(|r| r.deleted).map(|r| r.id));
        }

        Ok(deleted)
    }

    pub async fn create_table(
        &self,
        user_id: &str,
        base_id: &str,
        name: &str,
        fields: Vec<FieldSpec>,
    ) -> Result<Table> {
        let url = self
            .api
            .list_url(&format!("/bases/{}/tables", urlencoding::encode(base_id)));
        let body = json!({ "name": name, "fields": fields });
        self.api.post(user_id, &url, body).await
    }

    pub async fn create_field(
        &self,
        user_id: &str,
        base_id: &str,
        table_id: &str,
        field: FieldSpec,
    ) -> Result<Field> {
        let url = self.api.list_url(&format!(
            "/bases/{}/tables/{}/fields",
            urlencoding::encode(base_id),
            urlencoding::encode(table_id)
        ));
        self.api.post(user_id, &url, json!(field)).await
    }

    fn table_url(&self, base_id: &str, table: &str) -> String {
        self.api.api_url(&format!(
            "/{}/{}",
            urlencoding::encode(base_id),
            urlencoding::encode(table)
        ))
    }
}
