//! Device registration and token exchange.
//!
//! The robot self-registers with its serial number and receives an exchange
//! code. Once an operator approves the device on the platform, the exchange
//! code is traded for a long-lived auth token. The loop re-runs a day before
//! the token expires.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::PlatformClient;
use crate::error::Result;
use crate::model::{load_json, save_json, RawDevice};
use crate::paths::AgentPaths;

/// Re-auth this long before the token expires.
const RENEW_MARGIN_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiClientState {
    pub slug_cache: BTreeMap<String, String>,
    pub device: Value,
    pub org_name: Option<String>,
    pub exchange_code: Option<String>,
    pub api_key: String,
    pub api_key_expires_at: i64,
}

impl ApiClientState {
    pub fn load(paths: &AgentPaths) -> Self {
        load_json(&paths.api_client_state())
            .unwrap_or_default()
            .unwrap_or_default()
    }

    pub fn save(&self, paths: &AgentPaths) -> Result<()> {
        save_json(&paths.api_client_state(), self)
    }

    pub fn is_authed(&self) -> bool {
        !self.api_key.is_empty() && self.api_key_expires_at > Utc::now().timestamp()
    }

    pub fn device_name(&self) -> Option<&str> {
        self.device.get("name").and_then(|v| v.as_str())
    }

    pub fn registered_device(&mut self, device: Value, exchange_code: String) {
        self.device = device;
        self.exchange_code = Some(exchange_code);
        self.api_key = String::new();
        self.api_key_expires_at = 0;
    }

    pub fn authorized_device(&mut self, expires_at: i64, auth_token: String) {
        self.api_key_expires_at = expires_at;
        self.api_key = auth_token;
    }
}

/// Set on first install so the next run re-registers even if stale device
/// state survived.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallState {
    pub init_install: bool,
}

impl InstallState {
    pub fn load(paths: &AgentPaths) -> Self {
        load_json(&paths.install_state())
            .unwrap_or_default()
            .unwrap_or_default()
    }

    pub fn clear(paths: &AgentPaths) -> Result<()> {
        save_json(&paths.install_state(), &InstallState { init_install: false })
    }
}

/// Parse an RFC-3339 / `Z`-suffixed timestamp into epoch seconds.
pub fn iso_to_timestamp(iso: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(iso)
        .ok()
        .map(|dt| dt.timestamp())
}

/// Outcome of one pass over the registration state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Authorized,
    /// Registered (or pending approval); try again next interval.
    NotAuthorizedYet,
    /// The operator rejected the device.
    Rejected,
    /// The device was deleted on the platform; the agent service was asked
    /// to stop.
    DeviceDeleted,
}

pub struct Registrar {
    client: Arc<dyn PlatformClient>,
    paths: AgentPaths,
    /// Host integration hook: a public key stamped as a device tag when the
    /// file exists. No-op otherwise.
    virmesh_pubkey_path: PathBuf,
}

impl Registrar {
    pub fn new(client: Arc<dyn PlatformClient>, paths: AgentPaths) -> Self {
        Self {
            client,
            paths,
            virmesh_pubkey_path: PathBuf::from("/etc/virmesh.pub"),
        }
    }

    #[cfg(test)]
    pub fn with_virmesh_path(mut self, path: PathBuf) -> Self {
        self.virmesh_pubkey_path = path;
        self
    }

    /// One iteration of the registration state machine.
    pub async fn register_and_authorize(&self, raw_device: &RawDevice) -> Result<AuthOutcome> {
        // 0. reload persisted state to pick up external changes
        let mut state = ApiClientState::load(&self.paths);
        let install = InstallState::load(&self.paths);

        // 1. token present and not expiring within the renew margin
        if !state.api_key.is_empty()
            && state.api_key_expires_at - RENEW_MARGIN_SECS > Utc::now().timestamp()
        {
            return Ok(AuthOutcome::Authorized);
        }

        // 2. register when the device is unknown (or a fresh install asked us to)
        if state.device_name().is_none() || state.exchange_code.is_none() || install.init_install {
            let mut tags = BTreeMap::new();
            let pubkey = self.read_virmesh_pubkey();
            if !pubkey.is_empty() {
                tags.insert("virmesh_pubkey".to_string(), pubkey);
            }
            let result = self
                .client
                .register_device(
                    &raw_device.serial_number,
                    &raw_device.display_name,
                    &raw_device.description,
                    &raw_device.labels,
                    &tags,
                )
                .await?;

            let device = result.get("device").cloned().unwrap_or(Value::Null);
            let code = result
                .get("exchangeCode")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            state.registered_device(device, code);
            state.save(&self.paths)?;
            InstallState::clear(&self.paths)?;
            tracing::info!(
                serial_number = %raw_device.serial_number,
                "device registered, waiting for operator authorization"
            );
            return Ok(AuthOutcome::NotAuthorizedYet);
        }

        let device_name = state.device_name().unwrap_or_default().to_string();
        let exchange_code = state.exchange_code.clone().unwrap_or_default();

        // 3. the platform may have deleted or rejected the device
        let status = self
            .client
            .check_device_status(&device_name, &exchange_code)
            .await?;
        if !status.get("exist").and_then(|v| v.as_bool()).unwrap_or(false) {
            tracing::warn!(serial_number = %raw_device.serial_number, "device deleted on platform");
            stop_agent_service();
            return Ok(AuthOutcome::DeviceDeleted);
        }
        if status.get("authorizeState").and_then(|v| v.as_str()) == Some("REJECTED") {
            tracing::info!(serial_number = %raw_device.serial_number, "device rejected");
            return Ok(AuthOutcome::Rejected);
        }

        // 4. trade the exchange code for a token
        let token = self
            .client
            .exchange_device_auth_token(&device_name, &exchange_code)
            .await?;
        let auth_token = token
            .get("deviceAuthToken")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if auth_token.is_empty() {
            tracing::info!(
                serial_number = %raw_device.serial_number,
                "still waiting for operator authorization"
            );
            return Ok(AuthOutcome::NotAuthorizedYet);
        }

        let expires_at = token
            .get("expiresTime")
            .and_then(|v| v.as_str())
            .and_then(iso_to_timestamp)
            .unwrap_or(0);
        state.authorized_device(expires_at, auth_token.to_string());
        state.save(&self.paths)?;
        tracing::info!(serial_number = %raw_device.serial_number, "device authorized");
        Ok(AuthOutcome::Authorized)
    }

    /// After authorization: keep the `cos_version` tag current.
    pub async fn setup_agent_version(&self, version: &str) -> Result<()> {
        let mut state = ApiClientState::load(&self.paths);
        let Some(device_name) = state.device_name().map(str::to_string) else {
            tracing::warn!("device name not found, skipping version tag");
            return Ok(());
        };

        let tags = device_tags(&state.device);
        if tags.get("cos_version").map(String::as_str) == Some(version) {
            return Ok(());
        }

        let mut new_tags = tags;
        new_tags.insert("cos_version".to_string(), version.to_string());
        self.client.update_device_tags(&device_name, &new_tags).await?;

        state.device = self.client.get_device(&device_name).await?;
        state.save(&self.paths)?;
        tracing::info!(device = %device_name, version, "agent version tag updated");
        Ok(())
    }

    /// After authorization: stamp the virmesh pubkey tag once, if the host
    /// carries one.
    pub async fn setup_virmesh_info(&self) -> Result<()> {
        let mut state = ApiClientState::load(&self.paths);
        let Some(device_name) = state.device_name().map(str::to_string) else {
            return Ok(());
        };

        let tags = device_tags(&state.device);
        if tags.contains_key("virmesh_pubkey") {
            return Ok(());
        }
        let pubkey = self.read_virmesh_pubkey();
        if pubkey.is_empty() {
            return Ok(());
        }

        let mut new_tags = tags;
        new_tags.insert("virmesh_pubkey".to_string(), pubkey);
        self.client.update_device_tags(&device_name, &new_tags).await?;

        state.device = self.client.get_device(&device_name).await?;
        state.save(&self.paths)?;
        tracing::info!(device = %device_name, "virmesh pubkey tag added");
        Ok(())
    }

    fn read_virmesh_pubkey(&self) -> String {
        match std::fs::read_to_string(&self.virmesh_pubkey_path) {
            Ok(text) => text
                .strip_prefix("virmesh")
                .unwrap_or(&text)
                .trim()
                .to_string(),
            Err(_) => String::new(),
        }
    }
}

fn device_tags(device: &Value) -> BTreeMap<String, String> {
    device
        .get("tags")
        .and_then(|v| v.as_object())
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Ask the service manager to stop the agent unit. POSIX-only hook; on other
/// platforms the deleted device simply stops authorizing.
fn stop_agent_service() {
    #[cfg(unix)]
    {
        match Command::new("systemctl").args(["stop", "magpie.service"]).output() {
            Ok(out) => tracing::info!(
                status = %out.status,
                "requested agent service stop"
            ),
            Err(err) => tracing::warn!(error = %err, "failed to invoke systemctl"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockPlatformClient;
    use serde_json::json;

    fn paths() -> (tempfile::TempDir, AgentPaths) {
        let dir = tempfile::tempdir().unwrap();
        let paths = AgentPaths::rooted(dir.path());
        (dir, paths)
    }

    fn raw_device() -> RawDevice {
        RawDevice {
            serial_number: "sn-1".into(),
            display_name: "bot@sn-1".into(),
            description: "test".into(),
            labels: vec![],
        }
    }

    #[test]
    fn is_authed_requires_key_and_future_expiry() {
        let mut state = ApiClientState::default();
        assert!(!state.is_authed());

        state.api_key = "k".into();
        state.api_key_expires_at = Utc::now().timestamp() - 10;
        assert!(!state.is_authed());

        state.api_key_expires_at = Utc::now().timestamp() + 10;
        assert!(state.is_authed());
    }

    #[test]
    fn iso_parses_z_suffix() {
        assert_eq!(iso_to_timestamp("2009-02-13T23:31:30Z"), Some(1_234_567_890));
        assert_eq!(iso_to_timestamp("not a time"), None);
    }

    #[tokio::test]
    async fn fresh_device_registers_and_waits() {
        let (_dir, paths) = paths();
        let mut client = MockPlatformClient::new();
        client.expect_register_device().times(1).returning(|sn, _, _, _, tags| {
            assert_eq!(sn, "sn-1");
            assert!(tags.is_empty());
            Ok(json!({"device": {"name": "devices/d1"}, "exchangeCode": "xc"}))
        });

        let registrar = Registrar::new(Arc::new(client), paths.clone())
            .with_virmesh_path(paths.state_dir.join("no-virmesh.pub"));
        let outcome = registrar.register_and_authorize(&raw_device()).await.unwrap();
        assert_eq!(outcome, AuthOutcome::NotAuthorizedYet);

        let state = ApiClientState::load(&paths);
        assert_eq!(state.device_name(), Some("devices/d1"));
        assert_eq!(state.exchange_code.as_deref(), Some("xc"));
        assert!(!state.is_authed());
    }

    #[tokio::test]
    async fn registered_device_exchanges_token() {
        let (_dir, paths) = paths();
        let mut state = ApiClientState::default();
        state.registered_device(json!({"name": "devices/d1"}), "xc".into());
        state.save(&paths).unwrap();

        let mut client = MockPlatformClient::new();
        client
            .expect_check_device_status()
            .returning(|_, _| Ok(json!({"exist": true, "authorizeState": "AUTHORIZED"})));
        client.expect_exchange_device_auth_token().returning(|_, _| {
            Ok(json!({"deviceAuthToken": "tok", "expiresTime": "2099-01-01T00:00:00Z"}))
        });

        let registrar = Registrar::new(Arc::new(client), paths.clone());
        let outcome = registrar.register_and_authorize(&raw_device()).await.unwrap();
        assert_eq!(outcome, AuthOutcome::Authorized);
        assert!(ApiClientState::load(&paths).is_authed());
    }

    #[tokio::test]
    async fn rejected_device_reports_rejection() {
        let (_dir, paths) = paths();
        let mut state = ApiClientState::default();
        state.registered_device(json!({"name": "devices/d1"}), "xc".into());
        state.save(&paths).unwrap();

        let mut client = MockPlatformClient::new();
        client
            .expect_check_device_status()
            .returning(|_, _| Ok(json!({"exist": true, "authorizeState": "REJECTED"})));

        let registrar = Registrar::new(Arc::new(client), paths);
        let outcome = registrar.register_and_authorize(&raw_device()).await.unwrap();
        assert_eq!(outcome, AuthOutcome::Rejected);
    }

    #[tokio::test]
    async fn valid_token_short_circuits() {
        let (_dir, paths) = paths();
        let mut state = ApiClientState::default();
        state.api_key = "tok".into();
        state.api_key_expires_at = Utc::now().timestamp() + 7 * 24 * 3600;
        state.save(&paths).unwrap();

        // no expectations set: any call would panic the mock
        let client = MockPlatformClient::new();
        let registrar = Registrar::new(Arc::new(client), paths);
        let outcome = registrar.register_and_authorize(&raw_device()).await.unwrap();
        assert_eq!(outcome, AuthOutcome::Authorized);
    }

    #[tokio::test]
    async fn expiring_token_triggers_renewal() {
        let (_dir, paths) = paths();
        let mut state = ApiClientState::default();
        state.registered_device(json!({"name": "devices/d1"}), "xc".into());
        // still valid, but inside the 24h renew margin
        state.api_key = "old".into();
        state.api_key_expires_at = Utc::now().timestamp() + 3600;
        state.save(&paths).unwrap();

        let mut client = MockPlatformClient::new();
        client
            .expect_check_device_status()
            .returning(|_, _| Ok(json!({"exist": true})));
        client.expect_exchange_device_auth_token().returning(|_, _| {
            Ok(json!({"deviceAuthToken": "new", "expiresTime": "2099-01-01T00:00:00Z"}))
        });

        let registrar = Registrar::new(Arc::new(client), paths.clone());
        let outcome = registrar.register_and_authorize(&raw_device()).await.unwrap();
        assert_eq!(outcome, AuthOutcome::Authorized);
        assert_eq!(ApiClientState::load(&paths).api_key, "new");
    }
}
