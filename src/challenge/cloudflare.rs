use crate::USER_AGENT;
use crate::challenge::dns::{DnsProvider, DnsRecord, RecordType};
use anyhow::Context;
use async_trait::async_trait;
use itertools::Itertools;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

pub const CLOUDFLARE_API_URL: &str = "https://api.cloudflare.com/client/v4";

#[derive(Debug, thiserror::Error)]
pub enum CloudflareError {
    #[error("Cloudflare API reported an error: {0}")]
    Api(String),
    #[error("Cloudflare API response did not contain a result")]
    MissingResult,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    #[serde(default)]
    messages: Vec<ApiMessage>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: i64,
    message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CloudflareRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub ttl: u32,
}

impl CloudflareRecord {
    fn matches(&self, record: &DnsRecord) -> bool {
        self.record_type == record.record_type.to_string()
            && self.name == record.name
            && self.content == record.content
    }
}

async fn send_request<T: DeserializeOwned>(
    request: reqwest::RequestBuilder,
    action: &str,
) -> anyhow::Result<Option<T>> {
    let response = request.send().await.context(format!("{action} failed"))?;
    let status = response.status();
    let envelope: Envelope<T> = response
        .json()
        .await
        .context(format!("{action}: unexpected response (HTTP {status})"))?;
    for message in &envelope.messages {
        debug!("Cloudflare: {}", message.message);
    }
    if !envelope.success {
        let errors = envelope
            .errors
            .iter()
            .map(|error| format!("{} (code {})", error.message, error.code))
            .join(", ");
        return Err(CloudflareError::Api(errors)).context(format!("{action} failed"));
    }
    Ok(envelope.result)
}

pub fn http_client() -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .build()
        .context("Building HTTP client failed")
}

/// Minimal client for the DNS record endpoints of the Cloudflare v4 API, scoped to one zone.
#[cfg_attr(test, faux::create)]
pub struct CloudflareApi {
    base_url: Url,
    zone_id: String,
    api_token: String,
    client: reqwest::Client,
}

#[cfg_attr(test, faux::methods)]
impl CloudflareApi {
    pub fn new(base_url: Url, zone_id: String, api_token: String, client: reqwest::Client) -> Self {
        Self {
            base_url,
            zone_id,
            api_token,
            client,
        }
    }

    fn records_url(&self) -> String {
        format!(
            "{}/zones/{}/dns_records",
            self.base_url.as_str().trim_end_matches('/'),
            self.zone_id
        )
    }

    pub async fn list_dns_records(
        &self,
        record_type: RecordType,
        name: &str,
    ) -> anyhow::Result<Vec<CloudflareRecord>> {
        let request = self
            .client
            .get(self.records_url())
            .bearer_auth(&self.api_token)
            .query(&[("type", record_type.to_string()), ("name", name.to_string())]);
        let records =
            send_request(request, &format!("Listing {record_type} records for {name}")).await?;
        Ok(records.unwrap_or_default())
    }

    pub async fn create_dns_record(&self, record: &DnsRecord) -> anyhow::Result<CloudflareRecord> {
        let request = self
            .client
            .post(self.records_url())
            .bearer_auth(&self.api_token)
            .json(record);
        send_request(
            request,
            &format!("Creating {} record {}", record.record_type, record.name),
        )
        .await?
        .ok_or_else(|| CloudflareError::MissingResult.into())
    }

    pub async fn delete_dns_record(&self, id: &str) -> anyhow::Result<()> {
        let request = self
            .client
            .delete(format!("{}/{id}", self.records_url()))
            .bearer_auth(&self.api_token);
        send_request::<serde_json::Value>(request, &format!("Deleting record {id}")).await?;
        Ok(())
    }
}

#[async_trait]
impl DnsProvider for CloudflareApi {
    async fn add_record(&self, record: &DnsRecord) -> anyhow::Result<String> {
        Ok(self.create_dns_record(record).await?.id)
    }

    async fn find_record(&self, record: &DnsRecord) -> anyhow::Result<Option<String>> {
        let candidates = self
            .list_dns_records(record.record_type, &record.name)
            .await?;
        Ok(candidates
            .into_iter()
            .find(|candidate| candidate.matches(record))
            .map(|candidate| candidate.id))
    }

    async fn delete_record(&self, id: &str) -> anyhow::Result<()> {
        self.delete_dns_record(id).await
    }
}
