//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use gary4local::config::Config;
use gary4local::provisioner::checksum::sha256_bytes;
use gary4local::provisioner::{
    ArtifactBody, ArtifactSource, EnvironmentProvisioner, HttpArtifactSource, RetryManager, DiskSpace,
    StepRunner,
};
use gary4local::registry::{ArtifactSpec, DependencyStep, ServiceRegistry};
use gary4local::state::StateStore;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Dependency steps succeed without running anything; only the
/// directories a step owns are created
pub struct NoopSteps;

#[async_trait]
impl StepRunner for NoopSteps {
    async fn run(&self, step: &DependencyStep) -> Result<(), String> {
        if let Some(dir) = &step.creates {
            std::fs::create_dir_all(dir).map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}

pub struct PlentyOfSpace;

impl DiskSpace for PlentyOfSpace {
    fn available_bytes(&self, _path: &Path) -> Option<u64> {
        Some(u64::MAX)
    }
}

/// Real file:// source that counts how many artifacts were opened
pub struct CountingSource {
    inner: HttpArtifactSource,
    pub opens: AtomicUsize,
}

impl CountingSource {
    pub fn new() -> Self {
        Self {
            inner: HttpArtifactSource::new(Duration::from_secs(10)).unwrap(),
            opens: AtomicUsize::new(0),
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactSource for CountingSource {
    async fn open(&self, artifact: &ArtifactSpec, credential: Option<&str>) -> Result<ArtifactBody, String> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.inner.open(artifact, credential).await
    }
}

/// Write an origin file and describe it as a file:// artifact
pub fn origin_artifact(origin_dir: &Path, name: &str, contents: &[u8], gated: bool) -> ArtifactSpec {
    std::fs::create_dir_all(origin_dir).unwrap();
    let origin = origin_dir.join(name.replace('/', "_"));
    std::fs::write(&origin, contents).unwrap();
    ArtifactSpec {
        name: name.to_string(),
        url: format!("file://{}", origin.display()),
        sha256: sha256_bytes(contents),
        size: Some(contents.len() as u64),
        gated,
    }
}

/// Config rooted in a temp dir with one artifact per service, three for jerry
pub fn test_config(temp: &TempDir) -> Config {
    let mut config = Config::default();
    config.paths.services_dir = temp.path().join("services").to_string_lossy().into_owned();
    config.paths.state_file = temp.path().join("environments.json").to_string_lossy().into_owned();

    let origin = temp.path().join("origin");
    config.artifacts.insert(
        "gary".to_string(),
        vec![origin_artifact(&origin, "models/musicgen.bin", b"gary weights", true)],
    );
    config.artifacts.insert(
        "terry".to_string(),
        vec![origin_artifact(&origin, "models/melodyflow.bin", b"terry weights", false)],
    );
    config.artifacts.insert(
        "jerry".to_string(),
        vec![
            origin_artifact(&origin, "models/model.safetensors", b"jerry model", true),
            origin_artifact(&origin, "models/model_config.json", b"{\"sample_rate\": 44100}", true),
            origin_artifact(&origin, "models/vae.ckpt", b"jerry vae", false),
        ],
    );
    config
}

pub fn provisioner(
    config: &Config,
    store: Arc<StateStore>,
    source: Arc<CountingSource>,
    credential: Option<&str>,
) -> EnvironmentProvisioner {
    EnvironmentProvisioner::new(store, config)
        .unwrap()
        .with_source(source)
        .with_step_runner(Arc::new(NoopSteps))
        .with_disk_space(Arc::new(PlentyOfSpace))
        .with_retry(RetryManager::with_config(2, 1))
        .with_credential(credential.map(str::to_string))
}

pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Built-in registry moved off 8000/8002/8005 so a host service never interferes
pub async fn registry_on_free_ports(config: &Config) -> ServiceRegistry {
    let mut descriptors = Vec::new();
    for descriptor in ServiceRegistry::builtin(config).iter() {
        let mut descriptor = descriptor.clone();
        descriptor.port = free_port().await;
        descriptors.push(descriptor);
    }
    ServiceRegistry::from_descriptors(descriptors)
}

/// Minimal HTTP responder answering every request with 200
pub async fn health_responder() -> (u16, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let task = tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok")
                    .await;
            });
        }
    });
    (port, task)
}
