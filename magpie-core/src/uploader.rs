//! Resumable multipart uploads to the platform's object store.
//!
//! Each file carries a hidden sibling manifest
//! (`.{basename}_multipart.json`) recording the multipart id and the parts
//! uploaded so far. A restart resumes from `current_part_number`; the
//! manifest is rewritten and flushed after every part so a crash loses at
//! most the part in flight. Completed uploads leave their manifest behind.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use serde::{Deserialize, Serialize};

use crate::api::{PlatformClient, SecurityToken};
use crate::error::{AgentError, Result};
use crate::model::{CompleteOptions, FileInfo};
use crate::names::{ProjectName, RecordName};
use crate::netmeter::NetworkMeter;

/// The object store rejects parts smaller than 5 MB.
pub const PART_MINIMUM: u64 = 5_000_000;
pub const DEFAULT_PART_SIZE: u64 = 6_000_000;
/// All records live in one fixed bucket; keys carry the project/record path.
const BUCKET: &str = "default";
const TOKEN_TTL_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestPart {
    #[serde(rename = "PartNumber")]
    pub part_number: i32,
    #[serde(rename = "ETag")]
    pub etag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UploadManifest {
    pub multipart_id: String,
    pub current_part_number: i32,
    pub total_bytes: u64,
    pub uploaded_bytes: u64,
    pub part_size: u64,
    pub parts: Vec<ManifestPart>,
}

impl UploadManifest {
    pub fn path_for(file_path: &Path) -> PathBuf {
        let base = file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        file_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(format!(".{base}_multipart.json"))
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        crate::model::load_json(path)
    }

    fn save(&self, path: &Path) -> Result<()> {
        crate::model::save_json(path, self)
    }

    fn total_parts(&self) -> i32 {
        (self.total_bytes.div_ceil(self.part_size.max(1))) as i32
    }
}

fn map_sdk_err<E, R>(err: aws_sdk_s3::error::SdkError<E, R>) -> AgentError
where
    E: std::fmt::Debug,
    R: std::fmt::Debug,
{
    use aws_sdk_s3::error::SdkError;
    match &err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => {
            AgentError::Connection(format!("{err:?}"))
        }
        _ => AgentError::Api(format!("{err:?}")),
    }
}

/// Build an S3 client against the security-token endpoint. Retries are kept
/// at one attempt; the sweep loop is the retry mechanism.
pub fn build_store_client(token: &SecurityToken) -> aws_sdk_s3::Client {
    let endpoint = if token.endpoint.starts_with("https://") || token.endpoint.starts_with("http://")
    {
        token.endpoint.clone()
    } else {
        format!("https://{}", token.endpoint)
    };

    let credentials = Credentials::new(
        token.access_key_id.clone(),
        token.access_key_secret.clone(),
        Some(token.session_token.clone()),
        None,
        "security-token",
    );
    let config = aws_sdk_s3::Config::builder()
        .behavior_version(BehaviorVersion::latest())
        .region(Region::new("us-east-1"))
        .endpoint_url(endpoint)
        .credentials_provider(credentials)
        .force_path_style(true)
        .retry_config(aws_sdk_s3::config::retry::RetryConfig::standard().with_max_attempts(1))
        .build();
    aws_sdk_s3::Client::from_conf(config)
}

pub struct MultipartUploader {
    store: aws_sdk_s3::Client,
    key: String,
    file_path: PathBuf,
    manifest_path: PathBuf,
    part_size: u64,
    meter: Arc<NetworkMeter>,
    pause: Arc<AtomicBool>,
}

impl std::fmt::Debug for MultipartUploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultipartUploader")
            .field("key", &self.key)
            .field("file_path", &self.file_path)
            .finish_non_exhaustive()
    }
}

impl MultipartUploader {
    pub fn new(
        store: aws_sdk_s3::Client,
        key: String,
        file_path: PathBuf,
        part_size: u64,
        meter: Arc<NetworkMeter>,
    ) -> Result<Self> {
        if part_size < PART_MINIMUM {
            return Err(AgentError::ConfigValidation(format!(
                "part size {part_size} is below the 5MB minimum"
            )));
        }
        let manifest_path = UploadManifest::path_for(&file_path);
        Ok(Self {
            store,
            key,
            file_path,
            manifest_path,
            part_size,
            meter,
            pause: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Cooperative pause: takes effect before the next part.
    pub fn pause_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.pause)
    }

    async fn create_manifest(&self) -> Result<UploadManifest> {
        let created = self
            .store
            .create_multipart_upload()
            .bucket(BUCKET)
            .key(self.key.clone())
            .send()
            .await
            .map_err(map_sdk_err)?;
        let multipart_id = created
            .upload_id()
            .ok_or_else(|| AgentError::Api("multipart upload without id".into()))?
            .to_string();

        let manifest = UploadManifest {
            multipart_id,
            current_part_number: 1,
            total_bytes: self.file_path.metadata()?.len(),
            uploaded_bytes: 0,
            part_size: self.part_size,
            parts: Vec::new(),
        };
        manifest.save(&self.manifest_path)?;
        Ok(manifest)
    }

    /// Upload the file, resuming from an existing manifest when present.
    /// Returns `true` when the upload reached completion.
    pub async fn upload(&self) -> Result<bool> {
        if !self.file_path.exists() {
            tracing::warn!(path = %self.file_path.display(), "file not found, skipping upload");
            return Ok(true);
        }

        let mut manifest = match UploadManifest::load(&self.manifest_path)? {
            Some(manifest) => manifest,
            None => self.create_manifest().await?,
        };
        let total_parts = manifest.total_parts();

        if manifest.current_part_number > total_parts {
            // a previous run pushed every part; re-issue the completion,
            // tolerating the store having finalized it already
            return match self.complete(&manifest).await {
                Ok(()) => Ok(true),
                Err(AgentError::Connection(err)) => Err(AgentError::Connection(err)),
                Err(err) => {
                    tracing::warn!(key = %self.key, error = %err, "completion retry rejected, assuming finalized");
                    Ok(true)
                }
            };
        }

        let mut file = File::open(&self.file_path)?;
        if manifest.current_part_number > 1 {
            file.seek(SeekFrom::Start(
                (manifest.current_part_number as u64 - 1) * manifest.part_size,
            ))?;
        }

        for part_number in manifest.current_part_number..=total_parts {
            if self.pause.load(Ordering::Relaxed) {
                tracing::info!(key = %self.key, "upload paused");
                return Ok(false);
            }

            let mut chunk = vec![0u8; manifest.part_size as usize];
            let read = read_full(&mut file, &mut chunk)?;
            if read == 0 {
                break;
            }
            chunk.truncate(read);
            let chunk_len = chunk.len() as u64;

            let part = self
                .store
                .upload_part()
                .bucket(BUCKET)
                .key(self.key.clone())
                .upload_id(manifest.multipart_id.clone())
                .part_number(part_number)
                .body(ByteStream::from(chunk))
                .send()
                .await
                .map_err(map_sdk_err)?;

            manifest.parts.push(ManifestPart {
                part_number,
                etag: part.e_tag().unwrap_or_default().to_string(),
            });
            manifest.current_part_number = part_number + 1;
            manifest.uploaded_bytes += chunk_len;
            manifest.save(&self.manifest_path)?;
            self.meter.add_upload(chunk_len);

            tracing::info!(
                key = %self.key,
                part = part_number,
                total_parts,
                uploaded_bytes = manifest.uploaded_bytes,
                "uploaded part"
            );
        }

        if manifest.current_part_number > total_parts {
            self.complete(&manifest).await?;
            tracing::info!(path = %self.file_path.display(), "upload completed");
            return Ok(true);
        }
        Ok(false)
    }

    async fn complete(&self, manifest: &UploadManifest) -> Result<()> {
        let parts: Vec<CompletedPart> = manifest
            .parts
            .iter()
            .map(|p| {
                CompletedPart::builder()
                    .part_number(p.part_number)
                    .e_tag(p.etag.clone())
                    .build()
            })
            .collect();

        self.store
            .complete_multipart_upload()
            .bucket(BUCKET)
            .key(self.key.clone())
            .upload_id(manifest.multipart_id.clone())
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(map_sdk_err)?;

        self.meter
            .add_upload(serde_json::to_string(&manifest.parts)?.len() as u64);
        Ok(())
    }

    /// Cancel the upload on the store side; the manifest stays for
    /// inspection.
    pub async fn abort(&self) -> Result<()> {
        let Some(manifest) = UploadManifest::load(&self.manifest_path)? else {
            return Ok(());
        };
        self.store
            .abort_multipart_upload()
            .bucket(BUCKET)
            .key(self.key.clone())
            .upload_id(manifest.multipart_id.clone())
            .send()
            .await
            .map_err(map_sdk_err)?;
        Ok(())
    }
}

fn read_full(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Upload a record's files resumably, smallest first. Per-file API errors
/// mark the batch incomplete and move on; connection errors abort the batch
/// so the sweep retries it as a whole.
pub async fn resumable_upload_files(
    client: &dyn PlatformClient,
    meter: Arc<NetworkMeter>,
    record_name: &str,
    file_infos: &mut [FileInfo],
    remove_after: bool,
) -> Result<bool> {
    let record = RecordName::parse(record_name)?;
    let project = ProjectName::with_warehouse_and_project_id(
        record.warehouse_id.as_deref(),
        &record.project_id,
    );
    let token = client
        .generate_security_token(&project.name, TOKEN_TTL_SECS)
        .await?;
    let store = build_store_client(&token);

    for info in file_infos.iter_mut() {
        info.complete(CompleteOptions {
            skip_sha256: true,
            ..Default::default()
        })?;
    }
    let mut ordered: Vec<&FileInfo> = file_infos.iter().collect();
    ordered.sort_by_key(|f| f.size.unwrap_or(0));

    let mut all_completed = true;
    for info in ordered {
        let key = format!(
            "{}/files/{}",
            record.simple_record_name(),
            info.filename
        );
        let uploader = MultipartUploader::new(
            store.clone(),
            key,
            info.filepath.clone(),
            DEFAULT_PART_SIZE,
            Arc::clone(&meter),
        )?;

        match uploader.upload().await {
            Ok(true) => {
                if remove_after && info.filepath.exists() {
                    std::fs::remove_file(&info.filepath)?;
                    tracing::info!(path = %info.filepath.display(), "deleted after upload");
                }
            }
            Ok(false) => all_completed = false,
            Err(AgentError::Connection(err)) => {
                return Err(AgentError::Connection(err));
            }
            Err(err) => {
                tracing::error!(
                    path = %info.filepath.display(),
                    error = %err,
                    "failed to upload, will retry later"
                );
                all_completed = false;
            }
        }
    }
    if all_completed {
        tracing::info!(record = record_name, "all files uploaded");
    }
    Ok(all_completed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_path_is_hidden_sibling() {
        let path = UploadManifest::path_for(Path::new("/data/records/key/run.bag"));
        assert_eq!(
            path,
            Path::new("/data/records/key/.run.bag_multipart.json")
        );
    }

    #[test]
    fn part_size_minimum_is_enforced() {
        let token = SecurityToken {
            endpoint: "store.example.com".into(),
            ..Default::default()
        };
        let store = build_store_client(&token);
        let result = MultipartUploader::new(
            store,
            "projects/p/records/r/files/a".into(),
            PathBuf::from("/tmp/a"),
            PART_MINIMUM - 1,
            NetworkMeter::new(),
        );
        assert!(matches!(result, Err(AgentError::ConfigValidation(_))));
    }

    #[test]
    fn total_parts_rounds_up() {
        let manifest = UploadManifest {
            total_bytes: 15_000_000,
            part_size: 6_000_000,
            ..Default::default()
        };
        assert_eq!(manifest.total_parts(), 3);

        let exact = UploadManifest {
            total_bytes: 12_000_000,
            part_size: 6_000_000,
            ..Default::default()
        };
        assert_eq!(exact.total_parts(), 2);
    }

    #[test]
    fn manifest_round_trips_with_wire_field_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".a_multipart.json");
        let manifest = UploadManifest {
            multipart_id: "mp-1".into(),
            current_part_number: 3,
            total_bytes: 15_000_000,
            uploaded_bytes: 12_000_000,
            part_size: 6_000_000,
            parts: vec![
                ManifestPart {
                    part_number: 1,
                    etag: "\"e1\"".into(),
                },
                ManifestPart {
                    part_number: 2,
                    etag: "\"e2\"".into(),
                },
            ],
        };
        manifest.save(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"PartNumber\": 1"));
        assert!(text.contains("\"ETag\""));

        let loaded = UploadManifest::load(&path).unwrap().unwrap();
        assert_eq!(loaded.current_part_number, 3);
        assert_eq!(loaded.parts.len(), 2);
        // parts stay in ascending order without gaps
        for (idx, part) in loaded.parts.iter().enumerate() {
            assert_eq!(part.part_number, idx as i32 + 1);
        }
    }
}
