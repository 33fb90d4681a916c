//! HTTP client for the vendor cloud

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fanlink_core::{DeviceId, RegistryRecord};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const AUTH_PATH: &str = "v1/userregistration/authenticate";
const MANIFEST_PATH: &str = "v1/provisioningservice/manifest";

#[derive(Error, Debug)]
pub enum CloudError {
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
    #[error("{endpoint} returned status {status}")]
    Status { endpoint: &'static str, status: u16 },
    #[error("Account credentials not configured")]
    MissingAccount,
}

/// Connection settings for the vendor cloud
#[derive(Debug, Clone)]
pub struct CloudConfig {
    pub base_url: String,
    pub email: String,
    pub password: String,
    pub country: String,
    pub accept_invalid_certs: bool,
    pub timeout: Duration,
}

/// One device as listed by the cloud manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CloudDevice {
    pub serial: String,
    pub name: String,
    pub product_type: String,
    pub local_credentials: String,
}

impl CloudDevice {
    pub fn device_id(&self, prefix: &str) -> DeviceId {
        DeviceId::from_serial(prefix, &self.serial)
    }

    /// Registry record for this listing, observed at `now`
    pub fn to_record(&self, prefix: &str, now: DateTime<Utc>) -> RegistryRecord {
        RegistryRecord {
            id: self.device_id(prefix),
            name: self.name.clone(),
            model: self.product_type.clone(),
            local_credentials: self.local_credentials.clone(),
            last_seen: now,
        }
    }
}

/// Source of the authoritative device listing
#[async_trait]
pub trait CloudInventory: Send + Sync {
    /// Authenticate and list every device owned by the account
    async fn list_devices(&self) -> Result<Vec<CloudDevice>, CloudError>;
}

#[derive(Debug, Serialize)]
struct AuthRequest<'a> {
    #[serde(rename = "Email")]
    email: &'a str,
    #[serde(rename = "Password")]
    password: &'a str,
}

/// API credentials handed out by the authenticate endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct ApiCredentials {
    #[serde(rename = "Account")]
    pub account: String,
    #[serde(rename = "Password")]
    pub password: String,
}

pub struct CloudClient {
    client: reqwest::Client,
    config: CloudConfig,
}

impl CloudClient {
    pub fn new(config: CloudConfig) -> Result<Self, CloudError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    pub async fn authenticate(&self) -> Result<ApiCredentials, CloudError> {
        if self.config.email.is_empty() || self.config.password.is_empty() {
            return Err(CloudError::MissingAccount);
        }

        let url = self.url(AUTH_PATH);
        debug!(url = %url, country = %self.config.country, "Authenticating with cloud");

        let response = self
            .client
            .post(&url)
            .query(&[("country", self.config.country.as_str())])
            .json(&AuthRequest {
                email: &self.config.email,
                password: &self.config.password,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(CloudError::Status {
                endpoint: "authenticate",
                status: response.status().as_u16(),
            });
        }

        Ok(response.json().await?)
    }

    pub async fn manifest(&self, credentials: &ApiCredentials) -> Result<Vec<CloudDevice>, CloudError> {
        let url = self.url(MANIFEST_PATH);
        debug!(url = %url, "Fetching device manifest");

        let response = self
            .client
            .get(&url)
            .basic_auth(&credentials.account, Some(&credentials.password))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(CloudError::Status {
                endpoint: "manifest",
                status: response.status().as_u16(),
            });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl CloudInventory for CloudClient {
    async fn list_devices(&self) -> Result<Vec<CloudDevice>, CloudError> {
        let credentials = self.authenticate().await?;
        let devices = self.manifest(&credentials).await?;
        info!(count = devices.len(), "Fetched cloud inventory");
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base_url: &str) -> CloudConfig {
        CloudConfig {
            base_url: base_url.to_string(),
            email: String::new(),
            password: String::new(),
            country: "DE".to_string(),
            accept_invalid_certs: true,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_url_joining() {
        let client = CloudClient::new(config("https://appapi.example.com/")).unwrap();
        assert_eq!(
            client.url(MANIFEST_PATH),
            "https://appapi.example.com/v1/provisioningservice/manifest"
        );
    }

    #[test]
    fn test_manifest_parsing() {
        let body = r#"[{
            "Serial": "NN2-EU-KEA1234A",
            "Name": "Bedroom",
            "ProductType": "475",
            "LocalCredentials": "{\"serial\":\"NN2-EU-KEA1234A\",\"apPasswordHash\":\"x\"}",
            "Version": "21.03.08",
            "AutoUpdate": true
        }]"#;
        let devices: Vec<CloudDevice> = serde_json::from_str(body).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].product_type, "475");

        let now = Utc::now();
        let record = devices[0].to_record("dyson-", now);
        assert_eq!(record.id.as_str(), "dyson-NN2-EU-KEA1234A");
        assert_eq!(record.name, "Bedroom");
        assert_eq!(record.last_seen, now);
    }

    #[test]
    fn test_auth_response_parsing() {
        let creds: ApiCredentials =
            serde_json::from_str(r#"{"Account":"acc-1","Password":"secret"}"#).unwrap();
        assert_eq!(creds.account, "acc-1");
        assert_eq!(creds.password, "secret");
    }

    #[tokio::test]
    async fn test_missing_account_short_circuits() {
        let client = CloudClient::new(config("http://127.0.0.1:9")).unwrap();
        assert!(matches!(
            client.list_devices().await,
            Err(CloudError::MissingAccount)
        ));
    }
}
