// Declarative runtime configuration
//
// One YAML file describes modules, workflow definitions, pipelines,
// triggers, resource handlers and the persistence descriptor. Environment
// references ($NAME / ${NAME}) are expanded exactly once at load; unknown
// variables are left untouched so literal dollar signs survive.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::machine::WorkflowDefinition;
use crate::value::DataMap;

/// Root of the configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
    #[serde(default)]
    pub workflows: Vec<WorkflowDefinition>,
    #[serde(default)]
    pub pipelines: Vec<PipelineConfig>,
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
    #[serde(default)]
    pub resources: Vec<ResourceHandlerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_addr")]
    pub addr: String,
}

fn default_addr() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// sqlx connection URL, e.g. `sqlite://conveyor.db` or `sqlite::memory:`
    #[serde(default = "default_db_url")]
    pub url: String,
    /// Field names whose values are encrypted at rest
    #[serde(default)]
    pub pii_fields: Vec<String>,
    /// Primary encryption key, `key_id:base64` (usually `$PII_KEY`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,
    /// Previous keys kept readable during rotation
    #[serde(default)]
    pub previous_keys: Vec<String>,
}

fn default_db_url() -> String {
    "sqlite://conveyor.db".to_string()
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            url: default_db_url(),
            pii_fields: Vec::new(),
            encryption_key: None,
            previous_keys: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret for claim extraction (token issuance is external)
    pub jwt_secret: String,
}

/// A module instance to construct: factory type plus instance name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    #[serde(rename = "type")]
    pub module_type: String,
    pub name: String,
    #[serde(default)]
    pub settings: DataMap,
}

/// Ordered step list executed as one pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    pub steps: Vec<StepSpec>,
    /// Wrap each step in the tracing decorator
    #[serde(default)]
    pub traced: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    #[serde(rename = "type")]
    pub step_type: String,
    pub name: String,
    #[serde(default)]
    pub config: DataMap,
}

/// Where a trigger dispatches: the state-machine engine or a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetConfig {
    StateMachine {
        workflow: String,
        #[serde(default)]
        action: String,
    },
    Pipeline {
        pipeline: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerConfig {
    Http {
        name: String,
        method: String,
        path: String,
        /// Copy request headers into trigger data
        #[serde(default)]
        include_headers: bool,
        target: TargetConfig,
        #[serde(default)]
        traced: bool,
    },
    Topic {
        name: String,
        topics: Vec<String>,
        /// Drop messages whose `type` differs from this value
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event: Option<String>,
        target: TargetConfig,
        #[serde(default)]
        traced: bool,
    },
    Cron {
        name: String,
        jobs: Vec<CronJobConfig>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJobConfig {
    pub expression: String,
    pub workflow: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub params: DataMap,
}

/// Per-handler block binding a resource type to routes, an optional
/// workflow and the field-mapping / sub-action tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceHandlerConfig {
    /// Resource type, also the URL segment
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
    /// Transition fired asynchronously after create
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_transition: Option<String>,
    /// Correlation key for follow-up semantics on POST
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_field: Option<String>,
    /// Logical field name -> ordered fallback keys in resource data
    #[serde(default)]
    pub field_map: HashMap<String, Vec<String>>,
    /// Sub-action URL segment -> transition name
    #[serde(default)]
    pub sub_actions: HashMap<String, String>,
    /// View handler: read another handler's resource type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_resource: Option<String>,
    /// View handler: keep only resources in these states
    #[serde(default)]
    pub state_filter: Vec<String>,
    /// Logical fields returned by the summary endpoint
    #[serde(default)]
    pub summary_fields: Vec<String>,
}

/// Expand `$NAME` / `${NAME}` once. Unknown variables stay verbatim.
pub fn expand_env(raw: &str) -> String {
    shellexpand::env_with_context_no_errors(raw, |name| std::env::var(name).ok()).into_owned()
}

/// Load and parse the configuration file, expanding env references first.
pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<AppConfig> {
    let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
        anyhow::anyhow!("failed to read config {}: {}", path.as_ref().display(), e)
    })?;
    let expanded = expand_env(&raw);
    let config: AppConfig = serde_yaml::from_str(&expanded)?;
    Ok(config)
}
