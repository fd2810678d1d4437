//! S3 remote store.
//!
//! Objects are written at `{prefix}{key}/{index}/{file}`.  Uploads carry
//! `If-None-Match: *`, so saving a key twice fails with a precondition error
//! that is reported as [`StoreError::AlreadyExists`].

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};

use super::{list_files, RemoteStore, StoreError};
use crate::config::S3StoreConfig;

// ---------------------------------------------------------------------------
// Client setup
// ---------------------------------------------------------------------------

pub async fn build_s3_client(config: &S3StoreConfig) -> Result<Client> {
    let mut aws_config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(config.region.clone()));

    if config.use_fips {
        aws_config_loader = aws_config_loader.use_fips(true);
    }
    if let Some(ref endpoint) = config.endpoint_url {
        aws_config_loader = aws_config_loader.endpoint_url(endpoint);
    }

    let aws_config = aws_config_loader.load().await;

    let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
        .force_path_style(config.endpoint_url.is_some())
        .build();

    let client = Client::from_conf(s3_config);
    info!(
        bucket = %config.bucket,
        region = %config.region,
        fips = config.use_fips,
        "S3 client initialised"
    );
    Ok(client)
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// [`RemoteStore`] over an S3 bucket.
pub struct S3Store {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3Store {
    pub fn new(client: Client, bucket: String, prefix: String) -> Self {
        Self {
            client,
            bucket,
            prefix,
        }
    }

    /// Prefix shared by every object of one cache entry, with trailing `/`.
    fn entry_prefix(&self, key: &str) -> String {
        entry_prefix(&self.prefix, key)
    }
}

fn entry_prefix(prefix: &str, key: &str) -> String {
    format!("{prefix}{key}/")
}

/// Split an object key below an entry prefix into `(index, file_name)`.
fn split_object_key<'a>(entry_prefix: &str, object_key: &'a str) -> Option<(usize, &'a str)> {
    let rest = object_key.strip_prefix(entry_prefix)?;
    let (index, name) = rest.split_once('/')?;
    if name.is_empty() || name.contains('/') {
        return None;
    }
    Some((index.parse().ok()?, name))
}

#[async_trait::async_trait]
impl RemoteStore for S3Store {
    #[instrument(skip(self, paths), fields(bucket = %self.bucket))]
    async fn restore(&self, paths: &[PathBuf], key: &str) -> Result<bool, StoreError> {
        let prefix = self.entry_prefix(key);
        let objects = list_objects(&self.client, &self.bucket, &prefix)
            .await
            .map_err(StoreError::Unavailable)?;
        if objects.is_empty() {
            return Ok(false);
        }

        for object_key in &objects {
            let Some((index, name)) = split_object_key(&prefix, object_key) else {
                debug!(%object_key, "ignoring unexpected object under entry prefix");
                continue;
            };
            let Some(dir) = paths.get(index) else {
                continue;
            };
            download_object(&self.client, &self.bucket, object_key, &dir.join(name))
                .await
                .map_err(StoreError::Unavailable)?;
        }
        Ok(true)
    }

    #[instrument(skip(self, paths), fields(bucket = %self.bucket))]
    async fn save(&self, paths: &[PathBuf], key: &str) -> Result<(), StoreError> {
        let prefix = self.entry_prefix(key);
        for (index, dir) in paths.iter().enumerate() {
            for (name, path) in list_files(dir).await? {
                let object_key = format!("{prefix}{index}/{name}");
                upload_object(&self.client, &self.bucket, &object_key, &path, key).await?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Free functions: operate on explicit bucket / key parameters.
// ---------------------------------------------------------------------------

/// Upload a local file to S3 unless the object already exists.
#[instrument(skip(client, cache_key), fields(%bucket, %key))]
async fn upload_object(
    client: &Client,
    bucket: &str,
    key: &str,
    file_path: &Path,
    cache_key: &str,
) -> Result<(), StoreError> {
    let body = ByteStream::from_path(file_path)
        .await
        .with_context(|| format!("open file for upload: {}", file_path.display()))
        .map_err(StoreError::Unavailable)?;

    let result = client
        .put_object()
        .bucket(bucket)
        .key(key)
        .if_none_match("*")
        .content_type("application/octet-stream")
        .body(body)
        .send()
        .await;

    match result {
        Ok(_) => {
            debug!(path = %file_path.display(), "object uploaded");
            Ok(())
        }
        Err(err) if is_precondition_failure(&err) => Err(StoreError::AlreadyExists {
            key: cache_key.to_string(),
        }),
        Err(err) => Err(StoreError::Unavailable(
            anyhow::Error::new(err).context("S3 PutObject"),
        )),
    }
}

fn is_precondition_failure<E: ProvideErrorMetadata>(
    err: &SdkError<E, aws_sdk_s3::config::http::HttpResponse>,
) -> bool {
    let status = err.raw_response().map(|r| r.status().as_u16());
    let code = err.as_service_error().and_then(|e| e.code());
    matches!(status, Some(412) | Some(409))
        || matches!(code, Some("PreconditionFailed") | Some("ConditionalRequestConflict"))
}

/// Stream an S3 object into a local file.
#[instrument(skip(client), fields(%bucket, %key))]
async fn download_object(client: &Client, bucket: &str, key: &str, dest: &Path) -> Result<()> {
    let resp = client
        .get_object()
        .bucket(bucket)
        .key(key)
        .send()
        .await
        .context("S3 GetObject")?;

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create parent dirs for {}", dest.display()))?;
    }

    let mut file = tokio::fs::File::create(dest)
        .await
        .with_context(|| format!("create {}", dest.display()))?;
    let mut body = resp.body.into_async_read();
    let bytes = tokio::io::copy(&mut body, &mut file)
        .await
        .with_context(|| format!("write downloaded object to {}", dest.display()))?;
    file.flush().await?;

    debug!(path = %dest.display(), bytes, "object downloaded");
    Ok(())
}

/// List all object keys under a given prefix.
///
/// Automatically paginates through all results.
#[instrument(skip(client), fields(%bucket, %prefix))]
async fn list_objects(client: &Client, bucket: &str, prefix: &str) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    let mut continuation_token: Option<String> = None;

    loop {
        let mut req = client.list_objects_v2().bucket(bucket).prefix(prefix);

        if let Some(ref token) = continuation_token {
            req = req.continuation_token(token);
        }

        let resp = req.send().await.context("S3 ListObjectsV2")?;

        for obj in resp.contents() {
            if let Some(k) = obj.key() {
                keys.push(k.to_string());
            }
        }

        match resp.next_continuation_token() {
            Some(token) => {
                continuation_token = Some(token.to_string());
            }
            None => break,
        }
    }

    debug!(count = keys.len(), "listed objects");
    Ok(keys)
}
