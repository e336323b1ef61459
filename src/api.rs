//! 远端上传接口边界
//!
//! 对核心来说这些都是可能瞬时失败的网络调用：submit_chunk 由
//! 传输层负责重试，complete/cancel 不自动重试，失败直接上抛。

use async_trait::async_trait;
use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;
use crate::errors::{Result, UploadError};
use crate::types::UploadId;

/// 完成上传后服务端返回的附件描述
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AttachmentInfo {
    pub id: String,
    pub file_name: String,
    #[serde(default)]
    pub url: Option<String>,
}

#[async_trait]
pub trait UploadEndpoint: Send + Sync {
    /// 提交一个分块，整体成功或整体失败
    async fn submit_chunk(
        &self,
        upload_id: UploadId,
        file_name: &str,
        chunk_index: u64,
        total_chunks: u64,
        bytes: Bytes,
    ) -> Result<()>;

    /// 所有分块确认后，把它们物化为卡片附件
    async fn complete_upload(
        &self,
        upload_id: UploadId,
        file_name: &str,
        file_size: u64,
        card_id: &str,
    ) -> Result<AttachmentInfo>;

    /// 通知服务端丢弃半成品上传
    async fn cancel_upload(&self, upload_id: UploadId, file_name: &str) -> Result<()>;
}

#[derive(Serialize)]
struct CompleteRequest<'a> {
    file_name: &'a str,
    file_size: u64,
    card_id: &'a str,
}

/// reqwest 实现
#[derive(Debug, Clone)]
pub struct HttpUploadEndpoint {
    client: Client,
    endpoint: String,
    token: String,
}

impl HttpUploadEndpoint {
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let endpoint = endpoint.into();
        // 尽早发现配置里的坏 URL
        Url::parse(&endpoint)
            .map_err(|_| UploadError::Param(format!("Invalid endpoint url: {:?}", endpoint)))?;

        Ok(Self {
            client: Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn create_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {}", self.token))
            .map_err(|err| UploadError::Param(format!("Invalid token: {}", err)))?;
        headers.insert("Authorization", auth);

        Ok(headers)
    }

    /// `filename <base64>`，文件名可能含非 ASCII 字符
    pub fn encode_metadata(file_name: &str) -> String {
        format!("filename {}", BASE64_STANDARD.encode(file_name))
    }

    fn chunk_url(&self, upload_id: UploadId, chunk_index: u64) -> String {
        format!("{}/uploads/{}/chunks/{}", self.endpoint, upload_id, chunk_index)
    }
}

#[async_trait]
impl UploadEndpoint for HttpUploadEndpoint {
    async fn submit_chunk(
        &self,
        upload_id: UploadId,
        file_name: &str,
        chunk_index: u64,
        total_chunks: u64,
        bytes: Bytes,
    ) -> Result<()> {
        let mut headers = self.create_headers()?;
        headers.insert(
            "Content-Type",
            HeaderValue::from_static("application/octet-stream"),
        );
        headers.insert(
            "Upload-Metadata",
            HeaderValue::from_str(&Self::encode_metadata(file_name))
                .map_err(|err| UploadError::Param(err.to_string()))?,
        );
        headers.insert(
            "Total-Chunks",
            HeaderValue::from_str(&total_chunks.to_string())
                .map_err(|err| UploadError::Param(err.to_string()))?,
        );

        let response = self
            .client
            .post(self.chunk_url(upload_id, chunk_index))
            .headers(headers)
            .body(bytes)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(UploadError::server_error(
                status.as_u16(),
                format!("Failed to submit chunk {}", chunk_index),
            ));
        }

        Ok(())
    }

    async fn complete_upload(
        &self,
        upload_id: UploadId,
        file_name: &str,
        file_size: u64,
        card_id: &str,
    ) -> Result<AttachmentInfo> {
        let headers = self.create_headers()?;
        let response = self
            .client
            .post(format!("{}/uploads/{}/complete", self.endpoint, upload_id))
            .headers(headers)
            .json(&CompleteRequest { file_name, file_size, card_id })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(UploadError::server_error(status.as_u16(), "Failed to complete upload"));
        }

        let attachment = response.json::<AttachmentInfo>().await?;

        Ok(attachment)
    }

    async fn cancel_upload(&self, upload_id: UploadId, _file_name: &str) -> Result<()> {
        let headers = self.create_headers()?;
        let response = self
            .client
            .delete(format!("{}/uploads/{}", self.endpoint, upload_id))
            .headers(headers)
            .send()
            .await?;

        // 服务端没见过这个上传也算取消成功
        let status = response.status();
        if !status.is_success() && status != StatusCode::NOT_FOUND {
            return Err(UploadError::server_error(status.as_u16(), "Failed to cancel upload"));
        }

        Ok(())
    }
}
