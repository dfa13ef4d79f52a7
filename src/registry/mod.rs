//! Service descriptor registry
//!
//! Static table of the three local backends. Ports, entry points and
//! dependency steps are fixed here; artifact lists (URLs and digests) are
//! overlaid from the `[artifacts.<service>]` sections of the config file
//! so a release can pin new model files without a rebuild.

use crate::config::Config;
use crate::errors::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Identifier of one backend service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceId {
    Gary,
    Terry,
    Jerry,
}

impl ServiceId {
    /// All services in provisioning order
    pub const ALL: [ServiceId; 3] = [ServiceId::Gary, ServiceId::Terry, ServiceId::Jerry];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceId::Gary => "gary",
            ServiceId::Terry => "terry",
            ServiceId::Jerry => "jerry",
        }
    }

    /// Fixed localhost port consumed by the DAW plugin
    pub fn port(&self) -> u16 {
        match self {
            ServiceId::Gary => 8000,
            ServiceId::Terry => 8002,
            ServiceId::Jerry => 8005,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ServiceId::Gary => "gary (musicgen)",
            ServiceId::Terry => "terry (melodyflow)",
            ServiceId::Jerry => "jerry (stable audio open small)",
        }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceId {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gary" => Ok(ServiceId::Gary),
            "terry" | "melodyflow" => Ok(ServiceId::Terry),
            "jerry" | "stable-audio" => Ok(ServiceId::Jerry),
            other => Err(OrchestratorError::Config(format!("unknown service '{}'", other))),
        }
    }
}

/// One model file that must be present and checksum-valid
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSpec {
    /// Path relative to the environment directory
    pub name: String,
    pub url: String,
    /// Lowercase hex SHA-256 digest
    pub sha256: String,
    #[serde(default)]
    pub size: Option<u64>,
    /// Requires the access token to download
    #[serde(default)]
    pub gated: bool,
}

/// How to ask a running service whether it is serving
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckSpec {
    pub url: String,
    pub expected_status: u16,
    pub timeout: Duration,
}

/// Process entry point inside the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
}

/// Backing service that must accept connections before a service launches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub name: String,
    pub port: u16,
    /// How to start it when nothing listens yet; `None` means use-only
    pub launch: Option<LaunchSpec>,
    pub timeout: Duration,
}

/// Port of the local redis gary hands jobs through
pub const REDIS_PORT: u16 = 6379;

/// One all-or-nothing dependency installation step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyStep {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
    /// Directory this step builds. Removed before the step runs so a
    /// half-finished earlier attempt never blocks a retry.
    pub creates: Option<PathBuf>,
}

impl DependencyStep {
    fn new(name: &str, program: impl Into<String>, args: &[&str], timeout_secs: u64) -> Self {
        Self {
            name: name.to_string(),
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            timeout: Duration::from_secs(timeout_secs),
            creates: None,
        }
    }

    fn creating(mut self, dir: &str) -> Self {
        self.creates = Some(PathBuf::from(dir));
        self
    }

    /// Substitute `{env}`, `{src}` and `{python}` placeholders
    fn resolve(mut self, layout: &EnvironmentLayout) -> Self {
        self.program = layout.expand(&self.program);
        self.args = self.args.iter().map(|a| layout.expand(a)).collect();
        self.creates = self
            .creates
            .map(|dir| PathBuf::from(layout.expand(&dir.to_string_lossy())));
        self
    }
}

/// Immutable description of one service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub id: ServiceId,
    pub port: u16,
    pub environment_id: String,
    pub environment_dir: PathBuf,
    /// Version stamp of the dependency set; a change forces a reinstall
    pub version: String,
    pub launch: LaunchSpec,
    pub health: HealthCheckSpec,
    pub required_disk_bytes: u64,
    pub artifacts: Vec<ArtifactSpec>,
    pub dependencies: Vec<DependencyStep>,
    pub requirements: Vec<Requirement>,
}

impl ServiceDescriptor {
    /// Final on-disk location of an artifact
    pub fn artifact_path(&self, artifact: &ArtifactSpec) -> PathBuf {
        self.environment_dir.join(&artifact.name)
    }

    /// Where child output is mirrored
    pub fn log_path(&self) -> PathBuf {
        self.environment_dir.join("service.log")
    }

    pub fn has_gated_artifacts(&self) -> bool {
        self.artifacts.iter().any(|a| a.gated)
    }

    /// Directories built by dependency steps that are not on disk
    pub fn missing_dependency_dirs(&self) -> Vec<&Path> {
        self.dependencies
            .iter()
            .filter_map(|step| step.creates.as_deref())
            .filter(|dir| !dir.is_dir())
            .collect()
    }
}

/// Directory conventions for one environment
struct EnvironmentLayout {
    env: PathBuf,
    src: PathBuf,
    python: PathBuf,
}

impl EnvironmentLayout {
    fn new(environment_dir: &Path) -> Self {
        let venv = environment_dir.join("venv");
        #[cfg(windows)]
        let python = venv.join("Scripts").join("python.exe");
        #[cfg(not(windows))]
        let python = venv.join("bin").join("python");

        Self {
            env: environment_dir.to_path_buf(),
            src: environment_dir.join("src"),
            python,
        }
    }

    fn expand(&self, value: &str) -> String {
        value
            .replace("{env}", &self.env.to_string_lossy())
            .replace("{src}", &self.src.to_string_lossy())
            .replace("{python}", &self.python.to_string_lossy())
    }
}

/// Static per-service facts
struct ServiceTemplate {
    id: ServiceId,
    environment_id: &'static str,
    repo: &'static str,
    branch: &'static str,
    script: &'static str,
    torch: &'static [&'static str],
    packages: &'static [&'static str],
    extra_env: &'static [(&'static str, &'static str)],
    health_timeout_secs: u64,
    required_disk_bytes: u64,
    needs_redis: bool,
}

const GIB: u64 = 1024 * 1024 * 1024;

const TEMPLATES: [ServiceTemplate; 3] = [
    ServiceTemplate {
        id: ServiceId::Gary,
        environment_id: "gary",
        repo: "https://github.com/betweentwomidnights/gary-backend-combined",
        branch: "localhost-installer",
        script: "g4l_localhost.py",
        torch: &["torch==2.1.0", "torchaudio==2.1.0"],
        packages: &[
            "audiocraft",
            "numpy==1.24.0",
            "transformers==4.39.3",
            "flask",
            "flask-cors",
            "psutil",
        ],
        extra_env: &[],
        health_timeout_secs: 10,
        required_disk_bytes: 12 * GIB,
        needs_redis: true,
    },
    ServiceTemplate {
        id: ServiceId::Terry,
        environment_id: "melodyflow",
        repo: "https://github.com/betweentwomidnights/melodyflow",
        branch: "localhost-installer",
        script: "localhost_melodyflow.py",
        torch: &["torch==2.4.0", "torchaudio==2.4.0"],
        packages: &[
            "einops",
            "numpy==1.25.2",
            "transformers>=4.31.0",
            "huggingface_hub",
            "flask",
            "flask-cors",
            "psutil",
        ],
        extra_env: &[("XFORMERS_DISABLED", "1"), ("FLASH_ATTENTION_DISABLED", "1")],
        health_timeout_secs: 3,
        required_disk_bytes: 10 * GIB,
        needs_redis: false,
    },
    ServiceTemplate {
        id: ServiceId::Jerry,
        environment_id: "stable-audio",
        repo: "https://github.com/betweentwomidnights/stable-audio-api",
        branch: "main",
        script: "api.py",
        torch: &["torch>=2.5.0", "torchaudio>=2.5.0"],
        packages: &["stable-audio-tools", "einops", "flask", "flask-cors"],
        extra_env: &[],
        health_timeout_secs: 3,
        required_disk_bytes: 8 * GIB,
        needs_redis: false,
    },
];

impl ServiceTemplate {
    fn build(&self, services_dir: &Path, config: &Config) -> ServiceDescriptor {
        let environment_dir = services_dir.join(self.environment_id);
        let layout = EnvironmentLayout::new(&environment_dir);
        let port = self.id.port();

        let mut pip_torch: Vec<&str> = vec!["-m", "pip", "install"];
        pip_torch.extend_from_slice(self.torch);
        let mut pip_packages: Vec<&str> = vec!["-m", "pip", "install"];
        pip_packages.extend_from_slice(self.packages);

        let dependencies = vec![
            DependencyStep::new(
                "clone source",
                config.paths.git.clone(),
                &["clone", "--depth", "1", "--branch", self.branch, self.repo, "{src}"],
                600,
            )
            .creating("{src}"),
            DependencyStep::new(
                "create virtualenv",
                config.paths.python.clone(),
                &["-m", "venv", "{env}/venv"],
                300,
            )
            .creating("{env}/venv"),
            DependencyStep::new("upgrade pip", "{python}", &["-m", "pip", "install", "--upgrade", "pip"], 600),
            DependencyStep::new("install torch", "{python}", &pip_torch, 3600),
            DependencyStep::new("install packages", "{python}", &pip_packages, 3600),
        ]
        .into_iter()
        .map(|step| step.resolve(&layout))
        .collect();

        let mut env = vec![("PYTHONIOENCODING".to_string(), "utf-8".to_string())];
        env.extend(
            self.extra_env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        );

        let mut requirements = Vec::new();
        if self.needs_redis {
            let program = config.paths.redis_server.trim();
            requirements.push(Requirement {
                name: "redis".to_string(),
                port: REDIS_PORT,
                launch: (!program.is_empty()).then(|| LaunchSpec {
                    program: PathBuf::from(program),
                    args: vec!["--port".to_string(), REDIS_PORT.to_string()],
                    working_dir: services_dir.to_path_buf(),
                    env: Vec::new(),
                }),
                timeout: config.requirement_timeout(),
            });
        }

        let artifacts = config
            .artifacts
            .get(self.id.as_str())
            .cloned()
            .unwrap_or_default();

        ServiceDescriptor {
            id: self.id,
            port,
            environment_id: self.environment_id.to_string(),
            version: format!("{}@{}", self.branch, self.torch[0]),
            launch: LaunchSpec {
                program: layout.python.clone(),
                args: vec![layout.src.join(self.script).to_string_lossy().into_owned()],
                working_dir: layout.src.clone(),
                env,
            },
            health: HealthCheckSpec {
                url: format!("http://127.0.0.1:{}/health", port),
                expected_status: 200,
                timeout: Duration::from_secs(self.health_timeout_secs),
            },
            required_disk_bytes: self.required_disk_bytes,
            artifacts,
            dependencies,
            requirements,
            environment_dir,
        }
    }
}

/// The set of known services, created once at startup
#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    descriptors: Vec<ServiceDescriptor>,
}

impl ServiceRegistry {
    /// Build the built-in table rooted at the configured services directory
    pub fn builtin(config: &Config) -> Self {
        let services_dir = config.services_dir();
        Self {
            descriptors: TEMPLATES
                .iter()
                .map(|t| t.build(&services_dir, config))
                .collect(),
        }
    }

    /// Registry over an explicit descriptor list
    pub fn from_descriptors(mut descriptors: Vec<ServiceDescriptor>) -> Self {
        descriptors.sort_by_key(|d| d.id);
        Self { descriptors }
    }

    pub fn get(&self, id: ServiceId) -> Option<&ServiceDescriptor> {
        self.descriptors.iter().find(|d| d.id == id)
    }

    /// Look up a descriptor, failing with a configuration error
    pub fn require(&self, id: ServiceId) -> Result<&ServiceDescriptor> {
        self.get(id)
            .ok_or_else(|| OrchestratorError::Config(format!("service '{}' is not registered", id)))
    }

    /// Descriptors in fixed provisioning order
    pub fn iter(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.descriptors.iter()
    }

    pub fn ids(&self) -> Vec<ServiceId> {
        self.descriptors.iter().map(|d| d.id).collect()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.paths.services_dir = "/srv/g4l/services".to_string();
        config
    }

    #[test]
    fn test_fixed_ports() {
        let registry = ServiceRegistry::builtin(&test_config());
        let ports: Vec<u16> = registry.iter().map(|d| d.port).collect();
        assert_eq!(ports, vec![8000, 8002, 8005]);
    }

    #[test]
    fn test_provisioning_order() {
        let registry = ServiceRegistry::builtin(&test_config());
        assert_eq!(registry.ids(), ServiceId::ALL.to_vec());
    }

    #[test]
    fn test_placeholders_resolved() {
        let registry = ServiceRegistry::builtin(&test_config());
        let gary = registry.get(ServiceId::Gary).unwrap();

        for step in &gary.dependencies {
            assert!(!step.program.contains('{'), "unresolved program in {}", step.name);
            assert!(step.args.iter().all(|a| !a.contains("{env}") && !a.contains("{src}")));
        }
        assert!(gary.launch.args[0].ends_with("g4l_localhost.py"));
        assert!(gary.environment_dir.ends_with("gary"));
    }

    #[test]
    fn test_clone_and_venv_steps_own_their_dirs() {
        let registry = ServiceRegistry::builtin(&test_config());
        let jerry = registry.get(ServiceId::Jerry).unwrap();

        let creates: Vec<PathBuf> = jerry
            .dependencies
            .iter()
            .filter_map(|s| s.creates.clone())
            .collect();
        assert_eq!(
            creates,
            vec![jerry.environment_dir.join("src"), jerry.environment_dir.join("venv")]
        );
        // Nothing under /srv exists here
        assert_eq!(jerry.missing_dependency_dirs().len(), 2);
    }

    #[test]
    fn test_only_gary_needs_redis() {
        let registry = ServiceRegistry::builtin(&test_config());
        let gary = registry.get(ServiceId::Gary).unwrap();
        assert_eq!(gary.requirements.len(), 1);
        assert_eq!(gary.requirements[0].port, REDIS_PORT);
        assert!(gary.requirements[0].launch.is_some());
        assert!(registry.get(ServiceId::Terry).unwrap().requirements.is_empty());
        assert!(registry.get(ServiceId::Jerry).unwrap().requirements.is_empty());

        let mut config = test_config();
        config.paths.redis_server = String::new();
        let registry = ServiceRegistry::builtin(&config);
        assert!(registry.get(ServiceId::Gary).unwrap().requirements[0].launch.is_none());
    }

    #[test]
    fn test_terry_launch_env() {
        let registry = ServiceRegistry::builtin(&test_config());
        let terry = registry.get(ServiceId::Terry).unwrap();
        assert!(terry
            .launch
            .env
            .contains(&("XFORMERS_DISABLED".to_string(), "1".to_string())));
        assert!(terry
            .launch
            .env
            .contains(&("PYTHONIOENCODING".to_string(), "utf-8".to_string())));
    }

    #[test]
    fn test_health_url_is_plain_localhost() {
        let registry = ServiceRegistry::builtin(&test_config());
        for descriptor in registry.iter() {
            assert!(descriptor.health.url.starts_with("http://127.0.0.1:"));
            assert!(descriptor.health.url.contains(&descriptor.port.to_string()));
        }
    }

    #[test]
    fn test_artifact_overlay() {
        let mut config = test_config();
        config.artifacts.insert(
            "jerry".to_string(),
            vec![ArtifactSpec {
                name: "models/model.safetensors".to_string(),
                url: "https://huggingface.co/stabilityai/x/resolve/main/model.safetensors".to_string(),
                sha256: "ab".repeat(32),
                size: Some(10),
                gated: true,
            }],
        );

        let registry = ServiceRegistry::builtin(&config);
        let jerry = registry.get(ServiceId::Jerry).unwrap();
        assert_eq!(jerry.artifacts.len(), 1);
        assert!(jerry.has_gated_artifacts());
        assert!(registry.get(ServiceId::Gary).unwrap().artifacts.is_empty());
    }

    #[test]
    fn test_service_id_parse() {
        assert_eq!("gary".parse::<ServiceId>().unwrap(), ServiceId::Gary);
        assert_eq!("MelodyFlow".parse::<ServiceId>().unwrap(), ServiceId::Terry);
        assert_eq!("stable-audio".parse::<ServiceId>().unwrap(), ServiceId::Jerry);
        assert!("redis".parse::<ServiceId>().is_err());
    }
}
