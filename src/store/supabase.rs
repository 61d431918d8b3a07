//! Supabase REST implementation of [`EntityStore`].

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;

use super::{EntityStore, CREATOR_TABLE, MAGNET_TABLE};
use crate::error::StoreError;
use crate::model::{Creator, MagnetKey, MagnetRecord, OutreachUpdate, Status};
use crate::pipeline::PipelineConfig;

/// Client for the `/rest/v1` table API.
#[derive(Debug, Clone)]
pub struct SupabaseClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl SupabaseClient {
    /// Create a client for `base_url` authenticating with `api_key`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::MissingCredentials` when either value is blank.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let base_url = base_url.into().trim().trim_end_matches('/').to_string();
        let api_key = api_key.into().trim().to_string();
        if base_url.is_empty() || api_key.is_empty() {
            return Err(StoreError::MissingCredentials);
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Request(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }

    /// Create a client from the store settings of `config`.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, StoreError> {
        let (url, key) = config
            .store_credentials()
            .ok_or(StoreError::MissingCredentials)?;
        Self::new(url, key, config.store_timeout)
    }

    fn table_url(&self, table: &str, filters: &[(&str, String)]) -> String {
        let mut url = format!("{}/rest/v1/{}", self.base_url, table);
        for (i, (column, expr)) in filters.iter().enumerate() {
            url.push(if i == 0 { '?' } else { '&' });
            url.push_str(column);
            url.push('=');
            url.push_str(&urlencoding::encode(expr));
        }
        url
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
    }

    async fn send(&self, table: &str, builder: RequestBuilder) -> Result<Response, StoreError> {
        let response = self
            .authorized(builder)
            .send()
            .await
            .map_err(|e| StoreError::Request(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Failed to read error response".to_string());

        if status.as_u16() == 409 {
            return Err(StoreError::Conflict {
                table: table.to_string(),
                body,
            });
        }

        Err(StoreError::Http {
            status: status.as_u16(),
            body,
        })
    }

    async fn get_rows<T: DeserializeOwned>(
        &self,
        table: &str,
        filters: &[(&str, String)],
    ) -> Result<Vec<T>, StoreError> {
        let url = self.table_url(table, filters);
        let response = self.send(table, self.client.get(&url)).await?;
        response
            .json()
            .await
            .map_err(|e| StoreError::Decode(format!("{} rows: {}", table, e)))
    }

    async fn patch_rows<B: serde::Serialize + ?Sized>(
        &self,
        table: &str,
        filters: &[(&str, String)],
        body: &B,
    ) -> Result<(), StoreError> {
        let url = self.table_url(table, filters);
        let builder = self
            .client
            .patch(&url)
            .header("Prefer", "return=representation")
            .json(body);
        self.send(table, builder).await.map(|_| ())
    }
}

fn eq(value: &str) -> String {
    format!("eq.{}", value)
}

fn magnet_filters(key: &MagnetKey) -> Vec<(&'static str, String)> {
    vec![
        ("creator_id", eq(&key.creator_id)),
        ("context_id", eq(&key.context_id)),
        ("type", eq(key.kind.as_str())),
    ]
}

#[async_trait]
impl EntityStore for SupabaseClient {
    async fn fetch_creators(&self) -> Result<Vec<Creator>, StoreError> {
        self.get_rows(CREATOR_TABLE, &[("select", "*".to_string())])
            .await
    }

    async fn creators_with_status(&self, status: Status) -> Result<Vec<Creator>, StoreError> {
        self.get_rows(
            CREATOR_TABLE,
            &[("status", eq(status.as_str())), ("select", "*".to_string())],
        )
        .await
    }

    async fn set_creator_status(&self, creator_id: &str, status: Status) -> Result<(), StoreError> {
        self.patch_rows(
            CREATOR_TABLE,
            &[("creator_id", eq(creator_id))],
            &serde_json::json!({ "status": status }),
        )
        .await
    }

    async fn update_outreach(
        &self,
        creator_id: &str,
        update: &OutreachUpdate,
    ) -> Result<(), StoreError> {
        self.patch_rows(CREATOR_TABLE, &[("creator_id", eq(creator_id))], update)
            .await
    }

    async fn find_magnet(&self, key: &MagnetKey) -> Result<Option<MagnetRecord>, StoreError> {
        let mut filters = magnet_filters(key);
        filters.push(("select", "*".to_string()));
        filters.push(("limit", "1".to_string()));
        let rows: Vec<MagnetRecord> = self.get_rows(MAGNET_TABLE, &filters).await?;
        Ok(rows.into_iter().next())
    }

    async fn insert_magnet(&self, record: &MagnetRecord) -> Result<(), StoreError> {
        let url = self.table_url(MAGNET_TABLE, &[]);
        let builder = self
            .client
            .post(&url)
            .header("Prefer", "return=representation")
            .json(record);
        self.send(MAGNET_TABLE, builder).await.map(|_| ())
    }

    async fn update_magnet(
        &self,
        key: &MagnetKey,
        record: &MagnetRecord,
    ) -> Result<(), StoreError> {
        self.patch_rows(MAGNET_TABLE, &magnet_filters(key), record)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MagnetKind;

    fn client() -> SupabaseClient {
        SupabaseClient::new("https://db.example/", "secret", Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_missing_credentials() {
        let err = SupabaseClient::new("", "key", Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, StoreError::MissingCredentials));

        let config = PipelineConfig::default();
        assert!(matches!(
            SupabaseClient::from_config(&config),
            Err(StoreError::MissingCredentials)
        ));
    }

    #[test]
    fn test_table_url_encodes_filters() {
        let url = client().table_url(
            CREATOR_TABLE,
            &[("creator_id", eq("a b&c")), ("select", "*".to_string())],
        );
        assert_eq!(
            url,
            "https://db.example/rest/v1/creator?creator_id=eq.a%20b%26c&select=%2A"
        );
    }

    #[test]
    fn test_magnet_filters() {
        let key = MagnetKey::new("c1", "m1", MagnetKind::Cover);
        let url = client().table_url(MAGNET_TABLE, &magnet_filters(&key));
        assert_eq!(
            url,
            "https://db.example/rest/v1/magnet_image?creator_id=eq.c1&context_id=eq.m1&type=eq.cover"
        );
    }
}
