//! The resolved description of the machine an agent runs on.
//!
//! Built from the process environment (batch-scheduler variables included)
//! plus explicit overrides, and handed to every task in its environment.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::time::Duration;

use super::resources::{Resource, ResourcePool};
use crate::store::Attributes;
use crate::types::{AgentKey, Error, Result};

/// Environment variable holding the platform JSON inside a task.
pub const PLATFORM_ENV: &str = "JOBMESH_PLATFORM";

const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(240);

/// Environment variables folded into the platform, later entries winning.
const ENV_MAP: &[(&str, &str)] = &[
    ("HOST", "node"),
    ("HOSTNAME", "node"),
    ("USER", "user"),
    ("HOME", "home"),
    ("PWD", "pwd"),
    ("TMPDIR", "tmp"),
    ("PBS_O_WORKDIR", "submit_dir"),
    ("PBS_QUEUE", "queue"),
    ("PBS_JOBID", "id"),
    ("PBS_JOBNAME", "job"),
    ("PBS_NUM_PPN", "cpus"),
    ("SLURM_JOBID", "id"),
    ("SLURM_SUBMIT_DIR", "submit_dir"),
    ("SLURM_SUBMIT_HOST", "host"),
    ("SLURM_JOB_NODELIST", "node"),
    ("SLURM_ARRAY_TASK_ID", "task_id"),
    ("SLURM_JOB_CPUS_PER_NODE", "cpus"),
    ("SLURM_NNODES", "nodes"),
];

fn default_heartbeat() -> Duration {
    DEFAULT_HEARTBEAT
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Platform {
    pub node: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Total allocation for an agent, or the reserved partition inside a task.
    #[serde(default)]
    pub resources: ResourcePool,

    #[serde(default = "default_heartbeat", with = "humantime_serde")]
    pub heartbeat: Duration,

    /// Wall-clock budget of the agent.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,

    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub idle_timeout: Option<Duration>,

    /// Scratch directory of the task this platform was handed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Anything else learned from the environment or overrides.
    #[serde(flatten)]
    pub extra: Attributes,
}

impl Platform {
    pub fn new(node: impl Into<String>, resources: ResourcePool) -> Self {
        Self {
            node: node.into(),
            host: None,
            user: None,
            resources,
            heartbeat: DEFAULT_HEARTBEAT,
            timeout: None,
            idle_timeout: None,
            path: None,
            extra: Attributes::new(),
        }
    }

    /// Detect the current machine, applying `overrides` (a JSON object) last.
    pub fn detect(overrides: Value) -> Result<Self> {
        Self::detect_from(std::env::vars(), overrides)
    }

    pub fn detect_from<I>(vars: I, overrides: Value) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: Vec<(String, String)> = vars.into_iter().collect();
        let mut info = Map::new();
        for (var, field) in ENV_MAP {
            if let Some((_, value)) = vars.iter().find(|(k, _)| k == var) {
                info.insert(field.to_string(), Value::from(value.clone()));
            }
        }
        match overrides {
            Value::Object(overrides) => info.extend(overrides),
            Value::Null => {}
            other => {
                return Err(Error::validation(format!(
                    "platform overrides must be an object, got {}",
                    other
                )))
            }
        }

        info.entry("node").or_insert_with(|| Value::from(hostname()));
        let cpus = info.get("cpus").and_then(count_of).unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });
        let gpus = info.get("gpus").and_then(count_of);

        let mut platform: Platform = serde_json::from_value(Value::Object(info))?;
        platform
            .resources
            .entry("cpus".to_string())
            .or_insert_with(|| Resource::List((0..cpus).map(Value::from).collect()));
        if let Some(gpus) = gpus {
            platform
                .resources
                .entry("gpus".to_string())
                .or_insert_with(|| Resource::List((0..gpus).map(Value::from).collect()));
        }
        Ok(platform)
    }

    /// Registry key: `<host>-<node>` when the host differs from the node.
    pub fn key(&self) -> Result<AgentKey> {
        AgentKey::for_node(&self.node, self.host.as_deref()).map_err(Error::validation)
    }

    /// Copy for a task: the reserved partition in place of the pool, plus its scratch path.
    pub fn for_task(&self, partition: ResourcePool, path: PathBuf) -> Self {
        Self {
            resources: partition,
            path: Some(path),
            ..self.clone()
        }
    }

    /// Read the platform a task was started with.
    pub fn from_env() -> Result<Self> {
        let raw = std::env::var(PLATFORM_ENV)
            .map_err(|_| Error::not_found(format!("environment variable {}", PLATFORM_ENV)))?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Integer count from a number or a numeric string (`"16"`, `"16(x2)"`).
fn count_of(value: &Value) -> Option<usize> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| usize::try_from(n).ok()),
        Value::String(s) => {
            let digits: String = s.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().ok()
        }
        _ => None,
    }
}

#[cfg(unix)]
fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(not(unix))]
fn hostname() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_hostname_is_never_empty() {
        assert!(!hostname().is_empty());
    }

    #[test]
    fn test_detect_from_batch_environment() {
        let platform = Platform::detect_from(
            vars(&[
                ("HOSTNAME", "login1"),
                ("SLURM_JOB_NODELIST", "c042"),
                ("USER", "ann"),
                ("SLURM_JOB_CPUS_PER_NODE", "4(x2)"),
            ]),
            Value::Null,
        )
        .unwrap();
        assert_eq!(platform.node, "c042");
        assert_eq!(platform.user.as_deref(), Some("ann"));
        assert_eq!(platform.resources["cpus"].size(), 4);
        assert_eq!(platform.heartbeat, Duration::from_secs(240));
    }

    #[test]
    fn test_overrides_win() {
        let platform = Platform::detect_from(
            vars(&[("HOSTNAME", "n1")]),
            json!({
                "host": "cluster",
                "heartbeat": "30s",
                "idle_timeout": "5m",
                "gpus": 2,
                "resources": {"ram": 16},
                "queue": "gpu"
            }),
        )
        .unwrap();
        assert_eq!(platform.heartbeat, Duration::from_secs(30));
        assert_eq!(platform.idle_timeout, Some(Duration::from_secs(300)));
        assert_eq!(platform.resources["ram"], Resource::Scalar(16));
        assert_eq!(platform.resources["gpus"].size(), 2);
        assert!(platform.resources.contains_key("cpus"));
        assert_eq!(platform.extra["queue"], json!("gpu"));
        assert_eq!(platform.key().unwrap().as_str(), "cluster-n1");
    }

    #[test]
    fn test_task_copy_round_trips_through_json() {
        let platform = Platform::new("n1", ResourcePool::new());
        let partition = ResourcePool::from([("cpus".to_string(), Resource::List(vec![json!(3)]))]);
        let task = platform.for_task(partition.clone(), PathBuf::from("/tmp/x"));
        let decoded: Platform = serde_json::from_str(&serde_json::to_string(&task).unwrap()).unwrap();
        assert_eq!(decoded.resources, partition);
        assert_eq!(decoded.path, Some(PathBuf::from("/tmp/x")));
        assert_eq!(decoded.key().unwrap().as_str(), "n1");
    }

    #[test]
    fn test_rejects_non_object_overrides() {
        assert!(Platform::detect_from(Vec::new(), json!([1])).is_err());
    }
}
