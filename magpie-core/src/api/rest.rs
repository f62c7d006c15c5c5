//! REST transport for the data platform.
//!
//! Authentication is HTTP basic with the fixed user `apikey` and the device
//! auth token as password. Unauthorized responses surface as
//! [`AgentError::Unauthorized`] so the scheduler can clear the stored token.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};

use super::{PlatformClient, SecurityToken};
use crate::auth::ApiClientState;
use crate::error::{AgentError, Result};
use crate::netmeter::{NetworkMeter, NetworkUsage};
use crate::paths::AgentPaths;
use magpie_config::ApiConfig;

const RPC_TIMEOUT: Duration = Duration::from_secs(10);
/// Single-shot presigned PUTs (thumbnails) get a longer window.
const PUT_TIMEOUT: Duration = Duration::from_secs(600);

pub struct RestClient {
    conf: ApiConfig,
    paths: AgentPaths,
    meter: Arc<NetworkMeter>,
    http: reqwest::Client,
    state: RwLock<ApiClientState>,
    /// Explicit project override (resource name), set per record.
    active_project: RwLock<Option<String>>,
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("server_url", &self.conf.server_url)
            .finish_non_exhaustive()
    }
}

impl RestClient {
    pub fn new(conf: ApiConfig, paths: &AgentPaths, meter: Arc<NetworkMeter>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .build()?;
        let state = ApiClientState::load(paths);
        Ok(Self {
            conf,
            paths: paths.clone(),
            meter,
            http,
            state: RwLock::new(state),
            active_project: RwLock::new(None),
        })
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}/{}", self.conf.server_url.trim_end_matches('/'), suffix)
    }

    /// Execute one platform RPC: basic auth, 10 s deadline, meter accounting,
    /// 401 mapping, JSON body back.
    async fn send(&self, method: Method, url: String, body: Option<Value>) -> Result<Value> {
        let api_key = self.state.read().api_key.clone();
        let mut builder = self
            .http
            .request(method, &url)
            .basic_auth("apikey", Some(api_key))
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(RPC_TIMEOUT);
        if let Some(body) = body {
            builder = builder.json(&body);
        }

        let request = builder.build()?;
        let upload = request
            .body()
            .and_then(|b| b.as_bytes())
            .map(|b| b.len() as u64)
            .unwrap_or(0);
        self.meter.add_upload(upload);

        let response = self.http.execute(request).await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(AgentError::Unauthorized);
        }
        let bytes = response.bytes().await?;
        self.meter.add_download(bytes.len() as u64);

        if !status.is_success() {
            let text: String = String::from_utf8_lossy(&bytes).chars().take(512).collect();
            return Err(AgentError::Api(format!("{url}: {status}: {text}")));
        }
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn get(&self, url: String) -> Result<Value> {
        self.send(Method::GET, url, None).await
    }

    async fn post(&self, url: String, body: Value) -> Result<Value> {
        self.send(Method::POST, url, Some(body)).await
    }

    async fn patch(&self, url: String, body: Value) -> Result<Value> {
        self.send(Method::PATCH, url, Some(body)).await
    }

    /// The organization resource name, cached on disk after first fetch.
    async fn org_name(&self) -> Result<String> {
        if let Some(name) = self.state.read().org_name.clone() {
            return Ok(name);
        }
        let org = self.get_organization().await?;
        let name = org
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AgentError::Api("organization has no name".into()))?
            .to_string();
        if self.conf.use_cache {
            let mut state = self.state.write();
            state.org_name = Some(name.clone());
            state.save(&self.paths)?;
        }
        Ok(name)
    }

    async fn convert_warehouse_slug(&self, wh_slug: &str) -> Result<String> {
        let name = format!("warehouses/{wh_slug}");
        let result = self
            .post(
                self.url(&format!("dataplatform/v1alpha1/{name}:convertWarehouseSlug")),
                json!({"warehouse": name}),
            )
            .await?;
        result
            .get("warehouse")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| AgentError::Api(format!("warehouse not found: {wh_slug}")))
    }

    async fn convert_project_slug(&self, warehouse_id: &str, proj_slug: &str) -> Result<String> {
        let name = format!("warehouses/{warehouse_id}/projects/{proj_slug}");
        let result = self
            .post(
                self.url(&format!("dataplatform/v1alpha1/{name}:convertProjectSlug")),
                json!({"project": name}),
            )
            .await?;
        result
            .get("project")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| AgentError::Api(format!("project not found: {proj_slug}")))
    }

    fn parent_or_org(&self, parent_name: &str) -> Option<String> {
        if parent_name.is_empty() {
            None
        } else {
            Some(parent_name.to_string())
        }
    }

    fn metric_labels(&self) -> Value {
        let state = self.state.read();
        let mut labels = serde_json::Map::new();
        if let Some(slug) = &self.conf.project_slug {
            labels.insert("project".into(), Value::String(slug.clone()));
        }
        if let Some(model) = state.device.get("model").and_then(|v| v.as_str()) {
            labels.insert("device".into(), Value::String(model.to_string()));
        }
        Value::Object(labels)
    }
}

#[async_trait]
impl PlatformClient for RestClient {
    async fn get_organization(&self) -> Result<Value> {
        self.get(self.url("dataplatform/v1alpha1/organizations/current"))
            .await
    }

    async fn get_configmap(&self, config_key: &str, parent_name: &str) -> Result<Value> {
        let parent = match self.parent_or_org(parent_name) {
            Some(p) => p,
            None => self.org_name().await?,
        };
        self.get(self.url(&format!(
            "dataplatform/v1alpha2/{parent}/configMaps/{config_key}"
        )))
        .await
    }

    async fn get_configmap_metadata(&self, config_key: &str, parent_name: &str) -> Result<Value> {
        let parent = match self.parent_or_org(parent_name) {
            Some(p) => p,
            None => self.org_name().await?,
        };
        self.get(self.url(&format!(
            "dataplatform/v1alpha2/{parent}/configMaps/{config_key}/metadata"
        )))
        .await
    }

    async fn list_device_projects(&self, device_name: &str) -> Result<Vec<Value>> {
        let result = self
            .get(self.url(&format!(
                "dataplatform/v1alpha1/{device_name}/projects?pageSize=1000"
            )))
            .await?;
        Ok(result
            .get("deviceProjects")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default())
    }

    async fn project_slug_to_name(&self, project_slug: &str) -> Result<String> {
        // warehouse slugs are deprecating; the platform keeps a single
        // "default" warehouse
        let proj_slug = project_slug
            .rsplit_once('/')
            .map(|(_, p)| p)
            .unwrap_or(project_slug);

        let warehouse = self.convert_warehouse_slug("default").await?;
        let warehouse_id = warehouse
            .split('/')
            .nth(1)
            .ok_or_else(|| AgentError::Api(format!("bad warehouse name: {warehouse}")))?
            .to_string();
        let project = self.convert_project_slug(&warehouse_id, proj_slug).await?;
        let project_id = project
            .split('/')
            .nth(3)
            .ok_or_else(|| AgentError::Api(format!("bad project name: {project}")))?;
        Ok(format!("warehouses/{warehouse_id}/projects/{project_id}"))
    }

    fn set_active_project(&self, project_name: Option<String>) {
        *self.active_project.write() = project_name;
    }

    fn reload_auth(&self) {
        *self.state.write() = ApiClientState::load(&self.paths);
    }

    async fn active_project_name(&self) -> Result<String> {
        if let Some(name) = self.active_project.read().clone() {
            return Ok(name);
        }
        let slug = self
            .conf
            .project_slug
            .clone()
            .ok_or_else(|| AgentError::Api("no project configured".into()))?;

        if let Some(cached) = self.state.read().slug_cache.get(&slug).cloned() {
            return Ok(cached);
        }
        let name = self.project_slug_to_name(&slug).await?;
        if self.conf.use_cache {
            let mut state = self.state.write();
            state.slug_cache.insert(slug, name.clone());
            state.save(&self.paths)?;
        }
        Ok(name)
    }

    async fn create_record<'a>(
        &self,
        title: &str,
        description: &str,
        labels: &[String],
        device_name: Option<&'a str>,
    ) -> Result<Value> {
        let project = self.active_project_name().await?;
        let mut label_objects = Vec::new();
        for label in labels {
            label_objects.push(self.ensure_label(label).await?);
        }
        let mut payload = json!({
            "title": title,
            "description": description,
            "labels": label_objects,
        });
        if let Some(device) = device_name {
            payload["device"] = json!({"name": device});
        }

        let record = self
            .post(
                self.url(&format!("dataplatform/v1alpha2/{project}/records")),
                payload,
            )
            .await?;
        if record.get("name").and_then(|v| v.as_str()).is_none() {
            return Err(AgentError::Api(format!("failed to create record: {record}")));
        }
        tracing::info!(record = %record["name"], "created record");
        Ok(record)
    }

    async fn update_record<'a>(
        &self,
        record_name: &str,
        title: Option<&'a str>,
        description: Option<&'a str>,
        labels: &[String],
    ) -> Result<Value> {
        let mut payload = json!({"name": record_name});
        let mut mask = Vec::new();
        if let Some(title) = title {
            payload["title"] = json!(title);
            mask.push("title");
        }
        if let Some(description) = description {
            payload["description"] = json!(description);
            mask.push("description");
        }
        if !labels.is_empty() {
            let mut label_objects = Vec::new();
            for label in labels {
                label_objects.push(self.ensure_label(label).await?);
            }
            payload["labels"] = Value::Array(label_objects);
            mask.push("labels");
        }

        let record = self
            .patch(
                self.url(&format!(
                    "dataplatform/v1alpha2/{record_name}?updateMask={}",
                    mask.join(",")
                )),
                payload,
            )
            .await?;
        if record.get("name").and_then(|v| v.as_str()).is_none() {
            return Err(AgentError::Api(format!("failed to update record: {record}")));
        }
        Ok(record)
    }

    async fn get_record(&self, record_name: &str) -> Result<Value> {
        let project = self.active_project_name().await?;
        let result = self
            .get(self.url(&format!(
                "dataplatform/v1alpha2/{project}/records:batchGet?parent={project}&names={record_name}"
            )))
            .await?;
        result
            .get("records")
            .and_then(|v| v.as_array())
            .and_then(|records| records.first())
            .cloned()
            .ok_or_else(|| AgentError::Api(format!("record not found: {record_name}")))
    }

    async fn generate_record_thumbnail_upload_url(
        &self,
        record_name: &str,
        expire_secs: i64,
    ) -> Result<Option<String>> {
        let result = self
            .post(
                self.url(&format!(
                    "dataplatform/v1alpha2/{record_name}:generateRecordThumbnailUploadUrl"
                )),
                json!({"expireDuration": {"seconds": expire_secs}}),
            )
            .await?;
        Ok(result
            .get("preSignedUri")
            .and_then(|v| v.as_str())
            .map(str::to_string))
    }

    async fn get_device(&self, device_name: &str) -> Result<Value> {
        self.get(self.url(&format!("dataplatform/v1alpha2/{device_name}")))
            .await
    }

    async fn update_device_tags(
        &self,
        device_name: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<Value> {
        self.patch(
            self.url(&format!(
                "dataplatform/v1alpha2/{device_name}?updateMask=tags"
            )),
            json!({"name": device_name, "tags": tags}),
        )
        .await
    }

    async fn register_device(
        &self,
        serial_number: &str,
        display_name: &str,
        description: &str,
        labels: &[Value],
        tags: &BTreeMap<String, String>,
    ) -> Result<Value> {
        if serial_number.is_empty() {
            return Err(AgentError::DeviceNotFound("empty serial number".into()));
        }
        let display_name = if display_name.is_empty() {
            serial_number
        } else {
            display_name
        };
        let mut payload = json!({
            "device": {
                "display_name": display_name,
                "serial_number": serial_number,
                "description": description,
                "labels": labels,
                "tags": tags,
            },
        });
        if let Some(slug) = &self.conf.project_slug {
            payload["projectSlug"] = json!(slug);
        }
        if let Some(slug) = &self.conf.org_slug {
            payload["organizationSlug"] = json!(slug);
        }

        let result = self
            .post(
                self.url("dataplatform/v1alpha2/devices:registerDevice"),
                payload,
            )
            .await?;
        let ok = result
            .get("device")
            .and_then(|d| d.get("name"))
            .and_then(|v| v.as_str())
            .is_some()
            && result.get("exchangeCode").is_some();
        if !ok {
            return Err(AgentError::Api(format!(
                "failed to register device {serial_number}: {result}"
            )));
        }
        Ok(result)
    }

    async fn exchange_device_auth_token(&self, device_name: &str, code: &str) -> Result<Value> {
        self.post(
            self.url(&format!(
                "dataplatform/v1alpha2/{device_name}/authToken:exchange"
            )),
            json!({"exchange_code": code}),
        )
        .await
    }

    async fn check_device_status(&self, device_name: &str, code: &str) -> Result<Value> {
        self.get(self.url(&format!(
            "dataplatform/v1alpha2/{device_name}:checkDeviceStatus?exchangeCode={code}"
        )))
        .await
    }

    async fn send_heartbeat(
        &self,
        device_name: &str,
        agent_version: &str,
        usage: NetworkUsage,
    ) -> Result<()> {
        self.post(
            self.url(&format!("dataplatform/v1alpha2/{device_name}:heartbeat")),
            json!({
                "cos_version": agent_version,
                "network_usage": {
                    "upload_bytes": usage.upload_bytes,
                    "download_bytes": usage.download_bytes,
                },
            }),
        )
        .await?;
        Ok(())
    }

    async fn create_event<'a>(
        &self,
        record_name: &str,
        display_name: &str,
        trigger_time_secs: f64,
        description: &str,
        customized_fields: &BTreeMap<String, String>,
        device_name: Option<&'a str>,
        duration_secs: f64,
    ) -> Result<Value> {
        let project = self.active_project_name().await?;
        let payload = json!({
            "displayName": display_name,
            "triggerTime": {
                "seconds": trigger_time_secs.trunc() as i64,
                "nanos": (trigger_time_secs.fract() * 1e9) as i64,
            },
            "duration": {
                "seconds": duration_secs.trunc() as i64,
                "nanos": (duration_secs.fract() * 1e9) as i64,
            },
            "description": description,
            "customizedFields": customized_fields,
            "device": {"name": device_name},
        });
        self.post(
            self.url(&format!(
                "dataplatform/v1alpha2/{project}/events?record={record_name}"
            )),
            payload,
        )
        .await
    }

    async fn upload_file(&self, filepath: &Path, upload_url: &str) -> Result<()> {
        let data = tokio::fs::read(filepath).await?;
        let size = data.len() as u64;
        tracing::info!(path = %filepath.display(), size, "uploading file");

        self.meter.add_upload(size);
        let response = self
            .http
            .put(upload_url)
            .header(reqwest::header::CONTENT_LENGTH, size)
            .timeout(PUT_TIMEOUT)
            .body(data)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        self.meter.add_download(text.len() as u64);
        if text.contains("Bad sha256") {
            return Err(AgentError::Sha256Mismatch(text));
        }
        if !status.is_success() {
            return Err(AgentError::Api(format!(
                "failed to upload {}: {status}",
                filepath.display()
            )));
        }
        Ok(())
    }

    async fn generate_security_token(
        &self,
        project_name: &str,
        ttl_secs: i64,
    ) -> Result<SecurityToken> {
        let result = self
            .post(
                self.url("datastorage/v1alpha1/securityTokens:generateSecurityToken"),
                json!({"expireDuration": {"seconds": ttl_secs}, "project": project_name}),
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn get_label_by_display_name(&self, display_name: &str) -> Result<Option<Value>> {
        let project = self.active_project_name().await?;
        let result = self
            .get(self.url(&format!(
                "dataplatform/v1alpha1/{project}/labels?filter=displayName={display_name}"
            )))
            .await?;
        Ok(result
            .get("labels")
            .and_then(|v| v.as_array())
            .and_then(|labels| {
                labels
                    .iter()
                    .find(|l| l.get("displayName").and_then(|v| v.as_str()) == Some(display_name))
            })
            .cloned())
    }

    async fn create_label(&self, display_name: &str) -> Result<Value> {
        let project = self.active_project_name().await?;
        self.post(
            self.url(&format!("dataplatform/v1alpha1/{project}/labels")),
            json!({"displayName": display_name}),
        )
        .await
    }

    async fn ensure_label(&self, display_name: &str) -> Result<Value> {
        if let Some(label) = self.get_label_by_display_name(display_name).await? {
            return Ok(label);
        }
        self.create_label(display_name).await
    }

    async fn counter(&self, name: &str, value: i64) -> Result<()> {
        self.post(
            self.url("dataplatform/v1alpha1/metrics:incCounter"),
            json!({
                "counter": {"name": name, "labels": self.metric_labels()},
                "value": value,
            }),
        )
        .await?;
        Ok(())
    }

    async fn timer(&self, name: &str, value_secs: f64) -> Result<()> {
        tracing::debug!(name, value_secs, "timer metric not supported by transport");
        Ok(())
    }

    async fn gauge(&self, name: &str, value: f64) -> Result<()> {
        tracing::debug!(name, value, "gauge metric not supported by transport");
        Ok(())
    }

    async fn get_diagnosis_rules_metadata(&self, parent_name: &str) -> Result<Value> {
        let parent = if parent_name.is_empty() {
            "warehouses/-/projects/-"
        } else {
            parent_name
        };
        self.get(self.url(&format!(
            "dataplatform/v1alpha2/{parent}/diagnosisRule/metadata"
        )))
        .await
    }

    async fn get_diagnosis_rule(&self, parent_name: &str) -> Result<Value> {
        let parent = if parent_name.is_empty() {
            "warehouses/-/projects/-"
        } else {
            parent_name
        };
        self.get(self.url(&format!("dataplatform/v1alpha2/{parent}/diagnosisRule")))
            .await
    }

    async fn hit_diagnosis_rule(
        &self,
        diagnosis_rule: &Value,
        hit: &Value,
        device_name: &str,
        action_triggered: bool,
    ) -> Result<()> {
        let rule_name = diagnosis_rule
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        self.post(
            self.url(&format!("dataplatform/v1alpha2/{rule_name}:hit")),
            json!({
                "diagnosis_rule": diagnosis_rule,
                "hit": hit,
                "device": device_name,
                "upload": action_triggered,
            }),
        )
        .await?;
        Ok(())
    }

    async fn count_diagnosis_rules_hit(
        &self,
        diagnosis_rule_name: &str,
        hit: &Value,
        device_name: &str,
    ) -> Result<i64> {
        let result = self
            .post(
                self.url(&format!(
                    "dataplatform/v1alpha2/{diagnosis_rule_name}:countDiagnosisRuleHits"
                )),
                json!({
                    "diagnosis_rule": diagnosis_rule_name,
                    "hit": hit,
                    "device": device_name,
                }),
            )
            .await?;
        Ok(result.get("count").and_then(|v| v.as_i64()).unwrap_or(0))
    }

    async fn create_task<'a>(
        &self,
        record_name: &str,
        title: &str,
        description: &str,
        assignee: Option<&'a str>,
    ) -> Result<Value> {
        let project = self.active_project_name().await?;
        self.post(
            self.url(&format!("dataplatform/v1alpha2/{project}/tasks")),
            json!({
                "title": title,
                "description": description,
                "assignee": assignee,
                "record": record_name,
            }),
        )
        .await
    }

    async fn list_device_tasks(&self, device_name: &str, filter_state: &str) -> Result<Vec<Value>> {
        let state = if filter_state.is_empty() {
            "TASK_STATE_UNSPECIFIED"
        } else {
            filter_state
        };
        let result = self
            .get(self.url(&format!(
                "dataplatform/v1alpha3/{device_name}/tasks?parent={device_name}&filter=state=%22{state}%22&pageSize=10"
            )))
            .await?;
        Ok(result
            .get("deviceTasks")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default())
    }

    async fn update_task_state(&self, task_name: &str, state: &str) -> Result<()> {
        self.patch(
            self.url(&format!(
                "dataplatform/v1alpha3/{task_name}?updateMask=state"
            )),
            json!({"name": task_name, "state": state}),
        )
        .await?;
        Ok(())
    }

    async fn put_task_tags(&self, task_name: &str, tags: &BTreeMap<String, String>) -> Result<()> {
        self.post(
            self.url(&format!("dataplatform/v1alpha3/{task_name}:addTaskTags")),
            json!({"tags": tags}),
        )
        .await?;
        Ok(())
    }
}
