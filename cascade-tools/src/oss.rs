//! Object storage tool handler (S3-compatible via rust-s3).
//!
//! `oss://<service>/<operation>/<key...>` with operations `upload download
//! delete list presign`. Content crosses the boundary base64-encoded.

use crate::error::{ToolError, ToolResult};
use crate::registry::{ToolHandler, ToolMetadata};
use crate::{HandleCache, InvokeContext};
use async_trait::async_trait;
use base64::Engine;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
pub struct OssConfig {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    #[serde(default)]
    pub path_style: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OssOperation {
    Upload,
    Download,
    Delete,
    List,
    Presign,
}

impl OssOperation {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "upload" | "put" => Some(Self::Upload),
            "download" | "get" => Some(Self::Download),
            "delete" => Some(Self::Delete),
            "list" => Some(Self::List),
            "presign" => Some(Self::Presign),
            _ => None,
        }
    }
}

/// Split `operation/key...` out of the URI path; `key` may also come from
/// args when the path carries only the operation.
pub fn parse_oss_path(path: &str, args: &Value) -> ToolResult<(OssOperation, String)> {
    let (op_str, key) = match path.split_once('/') {
        Some((op, key)) => (op, key.to_string()),
        None => (path, String::new()),
    };
    let op = OssOperation::parse(op_str)
        .ok_or_else(|| ToolError::InvalidArgument(format!("unknown oss operation: {}", op_str)))?;
    let key = if key.is_empty() {
        args.get("key")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string()
    } else {
        key
    };
    Ok((op, key))
}

pub struct OssHandler {
    buckets: HandleCache<Arc<Bucket>>,
}

impl Default for OssHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl OssHandler {
    pub fn new() -> Self {
        Self {
            buckets: HandleCache::default(),
        }
    }

    async fn bucket(
        &self,
        tenant: &str,
        service: &str,
        config: &OssConfig,
    ) -> ToolResult<Arc<Bucket>> {
        let key = HandleCache::<Arc<Bucket>>::key(tenant, service);
        let config = config.clone();
        self.buckets
            .get_or_create(&key, || async move {
                let region = Region::Custom {
                    region: config.region.clone(),
                    endpoint: config.endpoint.clone(),
                };
                let credentials = Credentials::new(
                    Some(&config.access_key),
                    Some(&config.secret_key),
                    None,
                    None,
                    None,
                )
                .map_err(|e| ToolError::Auth(e.to_string()))?;
                let mut bucket = Bucket::new(&config.bucket, region, credentials)
                    .map_err(|e| ToolError::Connection(e.to_string()))?;
                if config.path_style {
                    bucket = bucket.with_path_style();
                }
                Ok(Arc::from(bucket))
            })
            .await
    }
}

#[async_trait]
impl ToolHandler for OssHandler {
    async fn invoke(
        &self,
        service: &str,
        config: &Value,
        path: &str,
        args: Value,
        ctx: &InvokeContext,
    ) -> ToolResult<Value> {
        let config: OssConfig = serde_json::from_value(config.clone())
            .map_err(|e| ToolError::InvalidArgument(format!("invalid oss config: {}", e)))?;
        let (op, key) = parse_oss_path(path, &args)?;
        if key.is_empty() && op != OssOperation::List {
            return Err(ToolError::InvalidArgument(
                "missing object key".to_string(),
            ));
        }

        let bucket = self.bucket(&ctx.tenant_id, service, &config).await?;

        match op {
            OssOperation::Upload => {
                let content = args
                    .get("content")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        ToolError::InvalidArgument("upload requires 'content'".to_string())
                    })?;
                // Content arrives base64 unless marked as plain text.
                let bytes = if args.get("text").and_then(Value::as_bool).unwrap_or(false) {
                    content.as_bytes().to_vec()
                } else {
                    base64::engine::general_purpose::STANDARD
                        .decode(content)
                        .map_err(|e| ToolError::InvalidArgument(e.to_string()))?
                };
                let response = bucket
                    .put_object(&key, &bytes)
                    .await
                    .map_err(|e| ToolError::Execution(e.to_string()))?;
                Ok(serde_json::json!({
                    "key": key,
                    "status": response.status_code(),
                    "bytes": bytes.len(),
                }))
            }
            OssOperation::Download => {
                let response = bucket
                    .get_object(&key)
                    .await
                    .map_err(|e| ToolError::Execution(e.to_string()))?;
                let encoded =
                    base64::engine::general_purpose::STANDARD.encode(response.bytes());
                Ok(serde_json::json!({ "key": key, "content": encoded }))
            }
            OssOperation::Delete => {
                bucket
                    .delete_object(&key)
                    .await
                    .map_err(|e| ToolError::Execution(e.to_string()))?;
                Ok(serde_json::json!({ "key": key, "deleted": true }))
            }
            OssOperation::List => {
                let prefix = if key.is_empty() {
                    args.get("prefix")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string()
                } else {
                    key
                };
                let results = bucket
                    .list(prefix.clone(), None)
                    .await
                    .map_err(|e| ToolError::Execution(e.to_string()))?;
                let objects: Vec<Value> = results
                    .iter()
                    .flat_map(|page| page.contents.iter())
                    .map(|obj| {
                        serde_json::json!({
                            "key": obj.key,
                            "size": obj.size,
                            "lastModified": obj.last_modified,
                        })
                    })
                    .collect();
                Ok(serde_json::json!({ "prefix": prefix, "objects": objects }))
            }
            OssOperation::Presign => {
                let expires = args
                    .get("expires")
                    .and_then(Value::as_u64)
                    .unwrap_or(3600)
                    .min(u32::MAX as u64) as u32;
                let url = bucket
                    .presign_get(&key, expires, None)
                    .await
                    .map_err(|e| ToolError::Execution(e.to_string()))?;
                Ok(serde_json::json!({ "key": key, "url": url, "expires": expires }))
            }
        }
    }

    fn metadata(&self) -> ToolMetadata {
        ToolMetadata {
            name: "oss".to_string(),
            description: "S3-compatible object storage operations".to_string(),
        }
    }

    async fn shutdown(&self) {
        self.buckets.drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_oss_path() {
        let (op, key) = parse_oss_path("upload/reports/a.json", &Value::Null).unwrap();
        assert_eq!(op, OssOperation::Upload);
        assert_eq!(key, "reports/a.json");

        let (op, key) = parse_oss_path("presign", &json!({ "key": "x.png" })).unwrap();
        assert_eq!(op, OssOperation::Presign);
        assert_eq!(key, "x.png");

        assert!(parse_oss_path("explode/x", &Value::Null).is_err());
    }
}
