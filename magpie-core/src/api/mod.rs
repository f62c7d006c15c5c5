//! Client abstraction over the data-platform API.
//!
//! One trait, two nominal transports. REST over HTTPS ships today; the
//! config still accepts `type: grpc` so existing robot fleets keep their
//! YAML, but the factory rejects it until the platform protos are vendored.
//! Every operation carries a 10 second deadline and reports its request and
//! response sizes to the [`NetworkMeter`](crate::netmeter::NetworkMeter).

mod rest;

pub use rest::RestClient;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{AgentError, Result};
use crate::netmeter::{NetworkMeter, NetworkUsage};
use crate::paths::AgentPaths;
use magpie_config::{ApiConfig, ClientType};

/// Credentials for the object store, returned by
/// [`PlatformClient::generate_security_token`].
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SecurityToken {
    pub endpoint: String,
    pub access_key_id: String,
    pub access_key_secret: String,
    pub session_token: String,
}

/// The semantic operations the core needs from the platform.
///
/// Objects the agent merely passes through (devices, records, tasks, rules)
/// stay as loose JSON: their schema belongs to the platform.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PlatformClient: Send + Sync {
    // organization
    async fn get_organization(&self) -> Result<Value>;

    // config maps
    async fn get_configmap(&self, config_key: &str, parent_name: &str) -> Result<Value>;
    async fn get_configmap_metadata(&self, config_key: &str, parent_name: &str) -> Result<Value>;

    // projects
    async fn list_device_projects(&self, device_name: &str) -> Result<Vec<Value>>;
    async fn project_slug_to_name(&self, project_slug: &str) -> Result<String>;
    /// Narrow subsequent project-scoped calls to `project_name`
    /// (`None` restores the configured default).
    fn set_active_project(&self, project_name: Option<String>);
    /// Re-read the persisted auth state (after registration, token renewal,
    /// or a cleared token).
    fn reload_auth(&self);
    /// The resource name of the active project, resolving the configured
    /// slug on first use.
    async fn active_project_name(&self) -> Result<String>;

    // records
    async fn create_record<'a>(
        &self,
        title: &str,
        description: &str,
        labels: &[String],
        device_name: Option<&'a str>,
    ) -> Result<Value>;
    async fn update_record<'a>(
        &self,
        record_name: &str,
        title: Option<&'a str>,
        description: Option<&'a str>,
        labels: &[String],
    ) -> Result<Value>;
    async fn get_record(&self, record_name: &str) -> Result<Value>;
    async fn generate_record_thumbnail_upload_url(
        &self,
        record_name: &str,
        expire_secs: i64,
    ) -> Result<Option<String>>;

    // devices
    async fn get_device(&self, device_name: &str) -> Result<Value>;
    async fn update_device_tags(
        &self,
        device_name: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<Value>;
    async fn register_device(
        &self,
        serial_number: &str,
        display_name: &str,
        description: &str,
        labels: &[Value],
        tags: &BTreeMap<String, String>,
    ) -> Result<Value>;
    async fn exchange_device_auth_token(&self, device_name: &str, code: &str) -> Result<Value>;
    async fn check_device_status(&self, device_name: &str, code: &str) -> Result<Value>;
    async fn send_heartbeat(
        &self,
        device_name: &str,
        agent_version: &str,
        usage: NetworkUsage,
    ) -> Result<()>;

    // events
    async fn create_event<'a>(
        &self,
        record_name: &str,
        display_name: &str,
        trigger_time_secs: f64,
        description: &str,
        customized_fields: &BTreeMap<String, String>,
        device_name: Option<&'a str>,
        duration_secs: f64,
    ) -> Result<Value>;

    // files
    async fn upload_file(&self, filepath: &Path, upload_url: &str) -> Result<()>;
    async fn generate_security_token(
        &self,
        project_name: &str,
        ttl_secs: i64,
    ) -> Result<SecurityToken>;

    // labels
    async fn get_label_by_display_name(&self, display_name: &str) -> Result<Option<Value>>;
    async fn create_label(&self, display_name: &str) -> Result<Value>;
    async fn ensure_label(&self, display_name: &str) -> Result<Value>;

    // metrics
    async fn counter(&self, name: &str, value: i64) -> Result<()>;
    async fn timer(&self, name: &str, value_secs: f64) -> Result<()>;
    async fn gauge(&self, name: &str, value: f64) -> Result<()>;

    // diagnosis rules
    async fn get_diagnosis_rules_metadata(&self, parent_name: &str) -> Result<Value>;
    async fn get_diagnosis_rule(&self, parent_name: &str) -> Result<Value>;
    async fn hit_diagnosis_rule(
        &self,
        diagnosis_rule: &Value,
        hit: &Value,
        device_name: &str,
        action_triggered: bool,
    ) -> Result<()>;
    async fn count_diagnosis_rules_hit(
        &self,
        diagnosis_rule_name: &str,
        hit: &Value,
        device_name: &str,
    ) -> Result<i64>;

    // tasks
    async fn create_task<'a>(
        &self,
        record_name: &str,
        title: &str,
        description: &str,
        assignee: Option<&'a str>,
    ) -> Result<Value>;
    async fn list_device_tasks(&self, device_name: &str, filter_state: &str) -> Result<Vec<Value>>;
    async fn update_task_state(&self, task_name: &str, state: &str) -> Result<()>;
    async fn put_task_tags(&self, task_name: &str, tags: &BTreeMap<String, String>) -> Result<()>;
}

/// Build the configured transport.
pub fn build_client(
    conf: &ApiConfig,
    paths: &AgentPaths,
    meter: Arc<NetworkMeter>,
) -> Result<Arc<dyn PlatformClient>> {
    if conf.server_url.is_empty() {
        return Err(AgentError::ConfigValidation(
            "api.server_url must not be empty".into(),
        ));
    }
    if conf.project_slug.is_none() && conf.org_slug.is_none() {
        return Err(AgentError::ConfigValidation(
            "api.project_slug and api.org_slug must not both be empty".into(),
        ));
    }
    match conf.client_type {
        ClientType::Rest => Ok(Arc::new(RestClient::new(conf.clone(), paths, meter)?)),
        ClientType::Grpc => Err(AgentError::ConfigValidation(
            "api.type grpc is not shipped in this build, use rest".into(),
        )),
    }
}

/// Create a fresh record, or fetch `record_name` and strip its `head.files`
/// and `head.transformation` so the server computes a new revision for the
/// files about to be uploaded.
pub async fn create_or_get_record(
    client: &dyn PlatformClient,
    title: &str,
    description: &str,
    labels: &[String],
    device_name: Option<&str>,
    record_name: Option<&str>,
) -> Result<Value> {
    let mut record = match record_name {
        None | Some("") => {
            client
                .create_record(title, description, labels, device_name)
                .await?
        }
        Some(name) => client.get_record(name).await?,
    };

    match record.get_mut("head") {
        Some(Value::Object(head)) => {
            head.remove("files");
            head.remove("transformation");
        }
        _ => {
            tracing::warn!(record = ?record.get("name"), "record has no head");
            record["head"] = Value::Object(Default::default());
        }
    }
    Ok(record)
}
