// Copyright 2024 The NativeLink Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! S3-compatible object store client: bounded-concurrency, retrying
//! blob upload, grounded on the teacher's `S3Store` (same retry/jitter
//! shape, same permanent-vs-transient failure split), adapted from the
//! legacy `rusoto_s3` client to `aws-sdk-s3` to match the stack the
//! teacher's own store crate has since moved to.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use estate_error::{make_err, Code, Error, ResultExt};
use estate_util::retry::{exponential_backoff, RetryResult, Retrier};
use rand::Rng;
use tokio::sync::Semaphore;
use tracing::{event, Level};

/// Result of an upload attempt that the caller can act on without
/// inspecting the underlying driver error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The object's public URL, `https://<host>/file/<bucket>/<key>`.
    Uploaded(String),
}

pub struct ObjectStoreClient {
    client: Client,
    bucket: String,
    public_host: String,
    retry_delay_secs: f32,
    retry_factor: f32,
    retry_max_retries: usize,
    upload_semaphore: Arc<Semaphore>,
}

impl ObjectStoreClient {
    /// Builds a client against a custom S3-compatible endpoint (e.g.
    /// Backblaze B2's S3 API). `permits` bounds process-wide concurrent
    /// uploads (default 3-5, see the concurrency model). Pure local
    /// config assembly — no connection is opened until [`Self::upload`]
    /// is called, so this can be constructed with dummy credentials in
    /// tests.
    pub async fn new(cfg: &estate_config::ObjectStoreConfig, permits: usize) -> Result<Self, Error> {
        let credentials = Credentials::new(&cfg.access_key, &cfg.secret_key, None, None, "estate-config");
        let mut builder = aws_sdk_s3::config::Builder::new()
            .region(Region::new(cfg.region.clone()))
            .credentials_provider(credentials)
            .behavior_version_latest();
        if !cfg.endpoint.is_empty() {
            builder = builder.endpoint_url(&cfg.endpoint).force_path_style(true);
        }
        let client = Client::from_conf(builder.build());
        let public_host = cfg
            .endpoint
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .to_string();

        Ok(ObjectStoreClient {
            client,
            bucket: cfg.bucket.clone(),
            public_host,
            retry_delay_secs: cfg.retry.delay_secs,
            retry_factor: cfg.retry.factor,
            retry_max_retries: cfg.retry.max_retries,
            upload_semaphore: Arc::new(Semaphore::new(permits.max(1) + cfg.additional_permits)),
        })
    }

    /// Uploads `bytes` under `object_name` with `content_type`. Retries
    /// transient failures (network, 5xx) with exponential backoff;
    /// permanent failures (bad bucket, auth, encoding) return
    /// immediately without retrying. Blocks on the process-wide upload
    /// semaphore before attempting the first try.
    pub async fn upload(&self, bytes: Vec<u8>, object_name: &str, content_type: &str) -> Result<UploadOutcome, Error> {
        let _permit = self
            .upload_semaphore
            .acquire()
            .await
            .map_err(|e| make_err!(Code::Internal, "upload semaphore closed: {e}"))?;

        let retrier = Retrier::new(Box::new(|duration: Duration| Box::pin(tokio::time::sleep(duration))));
        let retry_config = exponential_backoff(self.retry_delay_secs, self.retry_factor, self.retry_max_retries);

        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let object_name = object_name.to_string();
        let object_name_for_url = object_name.clone();
        let content_type = content_type.to_string();

        let attempts = futures::stream::repeat_with(move || {
            let bytes = bytes.clone();
            let client = client.clone();
            let bucket = bucket.clone();
            let object_name = object_name.clone();
            let content_type = content_type.clone();
            async move {
                let result = client
                    .put_object()
                    .bucket(&bucket)
                    .key(&object_name)
                    .content_type(&content_type)
                    .body(ByteStream::from(bytes))
                    .send()
                    .await;
                match result {
                    Ok(_) => RetryResult::Ok(()),
                    Err(err) if is_transient_s3_error(&err) => RetryResult::Retry(make_err!(
                        Code::Unavailable,
                        "transient error uploading {object_name}: {err}"
                    )),
                    Err(err) => RetryResult::Err(make_err!(
                        Code::Internal,
                        "permanent error uploading {object_name}: {err}"
                    )),
                }
            }
        })
        .then(|fut| fut);

        Pin::new(&retrier)
            .retry(retry_config, attempts)
            .await
            .err_tip(|| "ObjectStoreClient::upload")?;

        let url = self.public_url(&object_name_for_url);
        event!(Level::DEBUG, %url, "uploaded image to object store");
        Ok(UploadOutcome::Uploaded(url))
    }

    #[must_use]
    pub fn public_url(&self, object_name: &str) -> String {
        format!("https://{}/file/{}/{}", self.public_host, self.bucket, object_name)
    }
}

fn is_transient_s3_error<E: std::fmt::Debug>(err: &aws_sdk_s3::error::SdkError<E>) -> bool {
    use aws_sdk_s3::error::SdkError;
    matches!(
        err,
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_)
    )
}

/// Jittered exponential-backoff iterator building block re-exported so
/// callers (the image processor) can reason about the same schedule
/// without depending on `estate_util` directly.
#[must_use]
pub fn default_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let factor: f32 = rng.gen_range(0.9..1.1);
    Duration::from_secs_f32(delay.as_secs_f32() * factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn public_url_matches_expected_shape() {
        let cfg = estate_config::ObjectStoreConfig {
            bucket: "mybucket".to_string(),
            endpoint: "https://f003.backblazeb2.com".to_string(),
            access_key: "ak".to_string(),
            secret_key: "sk".to_string(),
            region: "us-east-1".to_string(),
            additional_permits: 0,
            retry: estate_config::RetryConfig::default(),
        };
        let client = ObjectStoreClient::new(&cfg, 1).await.unwrap();
        assert_eq!(
            client.public_url("real_estate/L1_0.jpg"),
            "https://f003.backblazeb2.com/file/mybucket/real_estate/L1_0.jpg"
        );
    }

    #[test]
    fn default_jitter_stays_within_tolerance() {
        let base = Duration::from_millis(1000);
        for _ in 0..20 {
            let jittered = default_jitter(base);
            assert!(jittered.as_millis() >= 890 && jittered.as_millis() <= 1110);
        }
    }
}
