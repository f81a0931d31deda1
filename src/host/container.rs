use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow, bail};

/// Port the orchestrator listens on inside the container
pub const CONTAINER_PORT: u16 = 1700;

/// Brings up the container hosting a plugin's orchestrator
pub trait ContainerLifecycle: Send + Sync {
    /// Make sure the container runs; returns the host name to connect to
    fn ensure_running(&self) -> Result<String>;
}

/// An orchestrator somebody else started
#[derive(Debug, Clone)]
pub struct ExternalContainer {
    host: String,
}

impl ExternalContainer {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

impl ContainerLifecycle for ExternalContainer {
    fn ensure_running(&self) -> Result<String> {
        Ok(self.host.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub prefix: String,
    pub plugin: String,
    pub version: String,
    /// Per-submitter container name, without prefix
    pub name: String,
    pub network: Option<String>,
    /// Directory holding the image's Dockerfile
    pub build_context: PathBuf,
}

impl ContainerSpec {
    pub fn image(&self) -> String {
        format!("{}_{}:{}", self.prefix, self.plugin, self.version)
    }

    pub fn container_name(&self) -> String {
        format!("{}_{}", self.prefix, self.name)
    }
}

/// Exclusive `flock` held for the lifetime of the value
pub struct LifecycleLock {
    file: File,
}

impl LifecycleLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            // SAFETY: the descriptor stays open for the lifetime of `file`
            if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } != 0 {
                return Err(std::io::Error::last_os_error())
                    .with_context(|| format!("Failed to lock {}", path.display()));
            }
        }
        Ok(Self { file })
    }

    /// `<runtime dir>/docker.lock`, falling back to the cache directory
    pub fn default_path() -> Result<PathBuf> {
        use directories::ProjectDirs;

        let proj_dirs = ProjectDirs::from("", "", "sct")
            .ok_or_else(|| anyhow!("Unable to find user directory"))?;
        let dir = proj_dirs
            .runtime_dir()
            .unwrap_or_else(|| proj_dirs.cache_dir());
        Ok(dir.join("docker.lock"))
    }
}

impl Drop for LifecycleLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            // SAFETY: see `acquire`
            unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        }
    }
}

/// Lifecycle driven through the `docker` command line
pub struct DockerCli {
    runtime: Vec<String>,
    spec: ContainerSpec,
    lock_path: PathBuf,
}

impl DockerCli {
    pub fn new(spec: ContainerSpec) -> Result<Self> {
        Ok(Self::with_runtime(
            vec!["docker".to_string()],
            spec,
            LifecycleLock::default_path()?,
        ))
    }

    /// `runtime` is the program followed by any arguments placed before each subcommand
    pub fn with_runtime(runtime: Vec<String>, spec: ContainerSpec, lock_path: PathBuf) -> Self {
        Self {
            runtime,
            spec,
            lock_path,
        }
    }

    fn docker(&self, args: &[&str]) -> Result<Output> {
        let (program, leading) = self
            .runtime
            .split_first()
            .ok_or_else(|| anyhow!("No container runtime configured"))?;
        Command::new(program)
            .args(leading)
            .args(args)
            .output()
            .with_context(|| format!("Failed to run {program} {}", args.join(" ")))
    }

    fn docker_checked(&self, args: &[&str]) -> Result<()> {
        let output = self.docker(args)?;
        if !output.status.success() {
            bail!(
                "{} failed with {}: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    fn image_exists(&self) -> Result<bool> {
        Ok(self
            .docker(&["image", "inspect", &self.spec.image()])?
            .status
            .success())
    }

    /// `None` when the container does not exist
    fn container_status(&self) -> Result<Option<String>> {
        let output = self.docker(&[
            "container",
            "inspect",
            "--format",
            "{{.State.Status}}",
            &self.spec.container_name(),
        ])?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string()))
    }

    fn build_image(&self) -> Result<()> {
        let image = self.spec.image();
        log::info!("Building image {image}");
        let context = self.spec.build_context.to_string_lossy();
        self.docker_checked(&["build", "--rm", "-t", &image, &context])
    }

    fn create_container(&self) -> Result<()> {
        let name = self.spec.container_name();
        let image = self.spec.image();
        log::info!("Creating container {name} from {image}");

        let mut args = vec!["create", "--name", name.as_str()];
        if let Some(network) = &self.spec.network {
            args.extend(["--network", network.as_str()]);
        }
        args.push(image.as_str());
        self.docker_checked(&args)
    }

    fn start_container(&self) -> Result<()> {
        let name = self.spec.container_name();
        log::info!("Starting container {name}");
        self.docker_checked(&["start", &name])
    }
}

impl ContainerLifecycle for DockerCli {
    fn ensure_running(&self) -> Result<String> {
        let _lock = LifecycleLock::acquire(&self.lock_path)?;
        let name = self.spec.container_name();

        match self.container_status()?.as_deref() {
            Some("running" | "restarting") => {
                log::debug!("Container {name} is running");
            }
            Some(status) => {
                log::debug!("Container {name} is {status}");
                self.start_container()?;
            }
            None => {
                if !self.image_exists()? {
                    self.build_image()?;
                }
                self.create_container()?;
                self.start_container()?;
            }
        }
        Ok(name)
    }
}
