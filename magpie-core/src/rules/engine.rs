//! Evaluator for remote diagnosis rules.
//!
//! The rule surface language belongs to the platform; this module implements
//! the evaluator contract: validate a rule-set spec into compiled rules,
//! stream items through them, enforce upload-limit quotas before firing the
//! upload action, and report every hit back to the platform.
//!
//! Rule evaluation happens on worker threads (file drains, the log tail
//! follower); platform calls made during evaluation block on the runtime
//! handle.

use std::sync::Arc;

use regex::Regex;
use serde_json::{json, Value};

use super::executor::{UploadFn, UploadWindow};
use super::RuleItem;
use crate::api::PlatformClient;

/// Everything a compiled rule needs at fire time.
#[derive(Clone)]
pub struct RuleContext {
    pub client: Arc<dyn PlatformClient>,
    pub device_name: String,
    pub upload_fn: UploadFn,
    pub handle: tokio::runtime::Handle,
}

impl std::fmt::Debug for RuleContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleContext")
            .field("device_name", &self.device_name)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default)]
struct Condition {
    topic: Option<String>,
    msgtype: Option<String>,
    contains: Option<String>,
    regex: Option<Regex>,
    /// Dotted path into the decoded message.
    field: Option<String>,
    equals: Option<Value>,
}

impl Condition {
    fn matches(&self, item: &RuleItem) -> bool {
        if let Some(topic) = &self.topic {
            if item.topic != *topic {
                return false;
            }
        }
        if let Some(msgtype) = &self.msgtype {
            if item.msgtype != *msgtype {
                return false;
            }
        }

        let text = message_text(&item.msg);
        if let Some(needle) = &self.contains {
            if !text.contains(needle.as_str()) {
                return false;
            }
        }
        if let Some(regex) = &self.regex {
            if !regex.is_match(&text) {
                return false;
            }
        }
        if let Some(field) = &self.field {
            let value = lookup_field(&item.msg, field);
            match &self.equals {
                Some(expected) => {
                    if value != Some(expected) {
                        return false;
                    }
                }
                None => {
                    if value.is_none() {
                        return false;
                    }
                }
            }
        } else if let Some(expected) = &self.equals {
            if Value::String(text) != *expected {
                return false;
            }
        }
        true
    }
}

/// The free-text a rule's `contains`/`regex` conditions run against: the
/// conventional `message`/`msg`/`data` field, falling back to the whole
/// payload.
fn message_text(msg: &Value) -> String {
    for key in ["message", "msg", "data"] {
        if let Some(text) = msg.get(key).and_then(|v| v.as_str()) {
            return text.to_string();
        }
    }
    match msg {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn lookup_field<'a>(msg: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = msg;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

#[derive(Debug, Clone)]
enum Action {
    Upload {
        title: String,
        description: String,
        labels: Vec<String>,
        before_minutes: i64,
        after_minutes: i64,
        extra_files: Vec<String>,
    },
    /// Moments are created against existing records by the platform side;
    /// the agent treats the action as a no-op.
    CreateMoment,
}

#[derive(Debug, Clone, Copy, Default)]
struct UploadLimit {
    device_times: Option<i64>,
    global_times: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct CompiledRule {
    project_name: String,
    /// The raw sub-rule spec, reported back as the `hit`.
    raw: Value,
    conditions: Vec<Condition>,
    actions: Vec<Action>,
    upload_limit: UploadLimit,
}

/// Validate one rule-set spec into compiled rules. Returns the compiled
/// rules and the validation errors of the sub-rules that failed.
pub fn validate_rule_set(
    project_name: &str,
    rule_set_spec: &Value,
) -> (Vec<CompiledRule>, Vec<String>) {
    let mut compiled = Vec::new();
    let mut errors = Vec::new();

    let sub_rules = rule_set_spec
        .get("rules")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    for (idx, spec) in sub_rules.iter().enumerate() {
        match compile_rule(project_name, spec) {
            Ok(rule) => compiled.push(rule),
            Err(err) => errors.push(format!("rule[{idx}]: {err}")),
        }
    }
    (compiled, errors)
}

fn compile_rule(project_name: &str, spec: &Value) -> Result<CompiledRule, String> {
    let when = spec
        .get("when")
        .and_then(|v| v.as_array())
        .ok_or("missing when conditions")?;
    if when.is_empty() {
        return Err("empty when conditions".into());
    }

    let mut conditions = Vec::new();
    for raw in when {
        let mut condition = Condition {
            topic: raw.get("topic").and_then(|v| v.as_str()).map(String::from),
            msgtype: raw
                .get("msgtype")
                .and_then(|v| v.as_str())
                .map(String::from),
            contains: raw
                .get("contains")
                .and_then(|v| v.as_str())
                .map(String::from),
            field: raw.get("field").and_then(|v| v.as_str()).map(String::from),
            equals: raw.get("equals").cloned(),
            ..Default::default()
        };
        if let Some(pattern) = raw.get("regex").and_then(|v| v.as_str()) {
            condition.regex =
                Some(Regex::new(pattern).map_err(|err| format!("bad regex {pattern:?}: {err}"))?);
        }
        if condition.topic.is_none()
            && condition.msgtype.is_none()
            && condition.contains.is_none()
            && condition.regex.is_none()
            && condition.field.is_none()
            && condition.equals.is_none()
        {
            return Err("condition matches everything".into());
        }
        conditions.push(condition);
    }

    let action_specs = spec
        .get("actions")
        .and_then(|v| v.as_array())
        .ok_or("missing actions")?;
    if action_specs.is_empty() {
        return Err("empty actions".into());
    }

    let mut actions = Vec::new();
    for raw in action_specs {
        let name = raw.get("name").and_then(|v| v.as_str()).unwrap_or_default();
        match name {
            "upload" => actions.push(Action::Upload {
                title: raw
                    .get("title")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                description: raw
                    .get("description")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                labels: string_array(raw.get("labels")),
                before_minutes: raw.get("before").and_then(|v| v.as_i64()).unwrap_or(1),
                after_minutes: raw.get("after").and_then(|v| v.as_i64()).unwrap_or(0),
                extra_files: string_array(raw.get("extraFiles")),
            }),
            "create_moment" => actions.push(Action::CreateMoment),
            other => return Err(format!("unknown action {other:?}")),
        }
    }

    let upload_limit = spec
        .get("uploadLimit")
        .map(|limit| UploadLimit {
            device_times: limit
                .get("device")
                .and_then(|d| d.get("times"))
                .and_then(|v| v.as_i64()),
            global_times: limit
                .get("global")
                .and_then(|g| g.get("times"))
                .and_then(|v| v.as_i64()),
        })
        .unwrap_or_default();

    Ok(CompiledRule {
        project_name: project_name.to_string(),
        raw: spec.clone(),
        conditions,
        actions,
        upload_limit,
    })
}

fn string_array(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

impl CompiledRule {
    fn matches(&self, item: &RuleItem) -> bool {
        self.conditions.iter().all(|c| c.matches(item))
    }

    fn rule_set_name(&self) -> String {
        format!("{}/diagnosisRule", self.project_name)
    }

    /// The single-rule wrapper reported with hits.
    fn as_project_rule_spec(&self) -> Value {
        json!({
            "name": self.rule_set_name(),
            "rules": [{"rules": [self.raw]}],
        })
    }
}

pub struct Engine {
    rules: Vec<CompiledRule>,
    ctx: RuleContext,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("rules", &self.rules.len())
            .finish_non_exhaustive()
    }
}

/// Build an engine from the per-project rule sets fetched from the platform.
/// Entries whose name does not end in `/diagnosisRule` are skipped, as are
/// disabled rule sets and sub-rules that fail validation.
pub fn build_engine(configs: &[Value], ctx: RuleContext) -> Engine {
    let mut rules = Vec::new();
    for project_rule_set in configs {
        let Some(name) = project_rule_set.get("name").and_then(|v| v.as_str()) else {
            tracing::warn!("found a project rule set without name, skipping");
            continue;
        };
        let Some(project_name) = name.strip_suffix("/diagnosisRule") else {
            tracing::warn!(name, "found an invalid project rule set, skipping");
            continue;
        };

        for rule_set_spec in project_rule_set
            .get("rules")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
        {
            if !rule_set_spec
                .get("enabled")
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
            {
                continue;
            }
            let (compiled, errors) = validate_rule_set(project_name, rule_set_spec);
            for error in errors {
                tracing::error!(project = project_name, error = %error, "failed to build rule, skipping");
            }
            rules.extend(compiled);
        }
    }
    Engine { rules, ctx }
}

impl Engine {
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Evaluate one item against every rule; fire matching rules' actions.
    pub fn consume_next(&self, item: &RuleItem) {
        for rule in &self.rules {
            if !rule.matches(item) {
                continue;
            }

            let action_triggered = self.should_trigger_action(rule);
            if action_triggered {
                self.run_actions(rule, item);
            }
            self.report_hit(rule, action_triggered);
        }
    }

    /// Upload-limit quotas: any count-query failure refuses the action.
    fn should_trigger_action(&self, rule: &CompiledRule) -> bool {
        let limit = rule.upload_limit;
        let name = rule.rule_set_name();

        if let Some(times) = limit.device_times {
            let count = self.ctx.handle.block_on(self.ctx.client.count_diagnosis_rules_hit(
                &name,
                &rule.raw,
                &self.ctx.device_name,
            ));
            match count {
                Ok(count) if count >= times => {
                    tracing::info!(rule = %name, count, times, "device upload limit reached, skipping");
                    return false;
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(rule = %name, error = %err, "failed to count device hits, skipping");
                    return false;
                }
            }
        }

        if let Some(times) = limit.global_times {
            let count = self.ctx.handle.block_on(
                self.ctx
                    .client
                    .count_diagnosis_rules_hit(&name, &rule.raw, ""),
            );
            match count {
                Ok(count) if count >= times => {
                    tracing::info!(rule = %name, count, times, "global upload limit reached, skipping");
                    return false;
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(rule = %name, error = %err, "failed to count global hits, skipping");
                    return false;
                }
            }
        }
        true
    }

    fn run_actions(&self, rule: &CompiledRule, item: &RuleItem) {
        for action in &rule.actions {
            match action {
                Action::Upload {
                    title,
                    description,
                    labels,
                    before_minutes,
                    after_minutes,
                    extra_files,
                } => {
                    let window = UploadWindow {
                        trigger_ts: item.ts,
                        before_minutes: *before_minutes,
                        after_minutes: *after_minutes,
                        title: title.clone(),
                        description: description.clone(),
                        labels: labels.clone(),
                        extra_files: extra_files.clone(),
                        project_name: rule.project_name.clone(),
                    };
                    if let Err(err) = (self.ctx.upload_fn)(window) {
                        tracing::error!(error = %err, "upload action failed");
                    }
                }
                Action::CreateMoment => {}
            }
        }
    }

    /// Failures here are swallowed: hit accounting must never stall the
    /// stream.
    fn report_hit(&self, rule: &CompiledRule, action_triggered: bool) {
        let spec = rule.as_project_rule_spec();
        let result = self.ctx.handle.block_on(self.ctx.client.hit_diagnosis_rule(
            &spec,
            &rule.raw,
            &self.ctx.device_name,
            action_triggered,
        ));
        if let Err(err) = result {
            tracing::warn!(rule = %rule.rule_set_name(), error = %err, "failed to report rule hit, skipping");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockPlatformClient;
    use parking_lot::Mutex;

    fn upload_log() -> (UploadFn, Arc<Mutex<Vec<UploadWindow>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let fun: UploadFn = Arc::new(move |window| {
            sink.lock().push(window);
            Ok(())
        });
        (fun, seen)
    }

    fn rule_set(upload_limit: Value) -> Value {
        json!({
            "enabled": true,
            "rules": [{
                "when": [{"contains": "ERROR"}],
                "actions": [{
                    "name": "upload",
                    "title": "error burst",
                    "before": 2,
                    "after": 1,
                }],
                "uploadLimit": upload_limit,
            }],
        })
    }

    fn configs(upload_limit: Value) -> Vec<Value> {
        vec![json!({
            "name": "warehouses/w/projects/p/diagnosisRule",
            "rules": [rule_set(upload_limit)],
        })]
    }

    fn ctx(client: MockPlatformClient, upload_fn: UploadFn) -> RuleContext {
        RuleContext {
            client: Arc::new(client),
            device_name: "devices/d1".into(),
            upload_fn,
            handle: tokio::runtime::Handle::current(),
        }
    }

    fn item(text: &str) -> RuleItem {
        RuleItem::from_log_line("/var/log/svc.log", text, 1_700_000_000)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn matching_item_fires_upload_and_reports_hit() {
        let (upload_fn, seen) = upload_log();
        let mut client = MockPlatformClient::new();
        client
            .expect_hit_diagnosis_rule()
            .times(1)
            .returning(|_, _, _, triggered| {
                assert!(triggered);
                Ok(())
            });

        let engine = build_engine(&configs(json!(null)), ctx(client, upload_fn));
        assert_eq!(engine.rule_count(), 1);

        let engine = Arc::new(engine);
        let worker = Arc::clone(&engine);
        tokio::task::spawn_blocking(move || {
            worker.consume_next(&item("2024-01-15 ERROR boom"));
            worker.consume_next(&item("2024-01-15 INFO fine"));
        })
        .await
        .unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].title, "error burst");
        assert_eq!(seen[0].project_name, "warehouses/w/projects/p");
        assert_eq!(seen[0].before_minutes, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn device_quota_refuses_action_but_still_reports() {
        let (upload_fn, seen) = upload_log();
        let mut client = MockPlatformClient::new();
        client
            .expect_count_diagnosis_rules_hit()
            .returning(|_, _, device| {
                assert_eq!(device, "devices/d1");
                Ok(5)
            });
        client
            .expect_hit_diagnosis_rule()
            .times(1)
            .returning(|_, _, _, triggered| {
                assert!(!triggered);
                Ok(())
            });

        let engine = Arc::new(build_engine(
            &configs(json!({"device": {"times": 5}})),
            ctx(client, upload_fn),
        ));
        let worker = Arc::clone(&engine);
        tokio::task::spawn_blocking(move || worker.consume_next(&item("ERROR boom")))
            .await
            .unwrap();

        assert!(seen.lock().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn count_failure_is_conservative() {
        let (upload_fn, seen) = upload_log();
        let mut client = MockPlatformClient::new();
        client
            .expect_count_diagnosis_rules_hit()
            .returning(|_, _, _| Err(crate::error::AgentError::Api("down".into())));
        client
            .expect_hit_diagnosis_rule()
            .returning(|_, _, _, _| Ok(()));

        let engine = Arc::new(build_engine(
            &configs(json!({"global": {"times": 10}})),
            ctx(client, upload_fn),
        ));
        let worker = Arc::clone(&engine);
        tokio::task::spawn_blocking(move || worker.consume_next(&item("ERROR boom")))
            .await
            .unwrap();

        assert!(seen.lock().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_rule_sets_are_skipped() {
        let (upload_fn, _) = upload_log();
        let configs = vec![
            json!({"name": "projects/p/notARule", "rules": []}),
            json!({
                "name": "projects/p/diagnosisRule",
                "rules": [
                    {"enabled": false, "rules": [{"when": [{"contains": "x"}], "actions": [{"name": "upload"}]}]},
                    {"enabled": true, "rules": [
                        {"when": [], "actions": [{"name": "upload"}]},
                        {"when": [{"regex": "("}], "actions": [{"name": "upload"}]},
                        {"when": [{"contains": "ok"}], "actions": [{"name": "explode"}]},
                        {"when": [{"contains": "ok"}], "actions": [{"name": "upload"}, {"name": "create_moment"}]},
                    ]},
                ],
            }),
        ];
        let engine = build_engine(&configs, ctx(MockPlatformClient::new(), upload_fn));
        // only the last sub-rule survives validation
        assert_eq!(engine.rule_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn field_conditions_match_decoded_messages() {
        let (upload_fn, seen) = upload_log();
        let mut client = MockPlatformClient::new();
        client.expect_hit_diagnosis_rule().returning(|_, _, _, _| Ok(()));

        let configs = vec![json!({
            "name": "projects/p/diagnosisRule",
            "rules": [{
                "enabled": true,
                "rules": [{
                    "when": [{"topic": "/diagnostics", "field": "level", "equals": 2}],
                    "actions": [{"name": "upload", "title": "level2"}],
                }],
            }],
        })];
        let engine = Arc::new(build_engine(&configs, ctx(client, upload_fn)));

        let matching = RuleItem {
            topic: "/diagnostics".into(),
            msg: json!({"level": 2, "message": "overheat"}),
            ts: 42,
            msgtype: "app/Status".into(),
        };
        let wrong_level = RuleItem {
            msg: json!({"level": 1}),
            ..matching.clone()
        };
        let wrong_topic = RuleItem {
            topic: "/other".into(),
            ..matching.clone()
        };

        let worker = Arc::clone(&engine);
        tokio::task::spawn_blocking(move || {
            worker.consume_next(&matching);
            worker.consume_next(&wrong_level);
            worker.consume_next(&wrong_topic);
        })
        .await
        .unwrap();

        assert_eq!(seen.lock().len(), 1);
    }
}
