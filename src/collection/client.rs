use anyhow::{bail, Context, Result};
use reqwest::{header, Body, Client};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

use super::{CollectionApi, EventRecord, UploadTarget};
use crate::settings::CollectionSettings;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info};

const API_KEY_HEADER: &str = "X-API-Key";
const BLOB_TYPE_HEADER: &str = "x-ms-blob-type";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadUrlRequest<'a> {
    file_name: &'a str,
    container_name: &'a str,
}

/// reqwest-backed client for the SAS broker, blob store and event API.
#[derive(Clone)]
pub struct HttpCollectionClient {
    http: Client,
    base_url: String,
    container: String,
    api_key: String,
    upload_timeout: Duration,
}

impl HttpCollectionClient {
    pub fn new(settings: &CollectionSettings) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            container: settings.container.clone(),
            api_key: settings.api_key.clone(),
            upload_timeout: Duration::from_secs(settings.upload_timeout_secs),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl CollectionApi for HttpCollectionClient {
    async fn generate_upload_url(&self, file_name: &str) -> Result<UploadTarget> {
        let response = self
            .http
            .post(self.endpoint("/api/sas/generate"))
            .header(API_KEY_HEADER, &self.api_key)
            .json(&UploadUrlRequest {
                file_name,
                container_name: &self.container,
            })
            .send()
            .await
            .context("upload url request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("upload url request rejected ({status}): {body}");
        }

        let target: UploadTarget = response
            .json()
            .await
            .context("upload url response was not valid JSON")?;
        log_debug!("[collection] upload target issued for {file_name}");
        Ok(target)
    }

    async fn upload_file(&self, target: &UploadTarget, path: &Path) -> Result<()> {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("failed to open clip {}", path.display()))?;
        let length = file
            .metadata()
            .await
            .with_context(|| format!("failed to stat clip {}", path.display()))?
            .len();

        let response = self
            .http
            .put(&target.upload_url)
            .timeout(self.upload_timeout)
            .header(BLOB_TYPE_HEADER, "BlockBlob")
            .header(header::CONTENT_TYPE, "video/mp4")
            .header(header::CONTENT_LENGTH, length)
            .body(Body::from(file))
            .send()
            .await
            .context("clip upload failed")?;

        let status = response.status();
        if !status.is_success() {
            bail!("clip upload rejected ({status})");
        }
        log_info!("[collection] uploaded {} ({length} bytes)", path.display());
        Ok(())
    }

    async fn report_event(&self, record: &EventRecord) -> Result<()> {
        let response = self
            .http
            .post(self.endpoint("/api/events/bbox/video"))
            .header(API_KEY_HEADER, &self.api_key)
            .json(record)
            .send()
            .await
            .context("event request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("event rejected ({status}): {body}");
        }
        log_info!(
            "[collection] event recorded: {} {}s",
            record.event_type,
            record.duration_seconds
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_join_without_double_slash() {
        let settings = CollectionSettings {
            base_url: "https://collector.example.com/".into(),
            ..CollectionSettings::default()
        };
        let client = HttpCollectionClient::new(&settings).unwrap();
        assert_eq!(
            client.endpoint("/api/sas/generate"),
            "https://collector.example.com/api/sas/generate"
        );
    }

    #[test]
    fn upload_url_request_uses_camel_case() {
        let body = serde_json::to_value(UploadUrlRequest {
            file_name: "u_meal_1.mp4",
            container_name: "video",
        })
        .unwrap();
        assert_eq!(body["fileName"], "u_meal_1.mp4");
        assert_eq!(body["containerName"], "video");
    }
}
