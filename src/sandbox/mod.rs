//! Isolated execution environments for trials.
//!
//! A [`SandboxProvider`] turns an [`Instance`] into a live [`Sandbox`]; the
//! trial only ever talks to these traits. The Docker backend lives in
//! [`docker`].
//!
//! Every sandbox owns three host directories that are bind-mounted into the
//! environment (see [`SandboxLayout`]). Files are staged on the host side
//! and copied into place from inside the environment, which keeps uploads
//! independent of the container API.

pub mod docker;
pub mod docker_client;

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::SandboxError;
use crate::instance::Instance;

pub use docker::{DockerSandbox, DockerSandboxProvider};
pub use docker_client::DockerClient;

/// Container path of the staging directory.
pub const STAGING_MOUNT: &str = "/swe";

/// Container path of the per-repository cache.
pub const CACHE_MOUNT: &str = "/root/.cache/kwaak";

/// Container path of the log directory.
pub const LOG_MOUNT: &str = "/root/.cache/kwaak/logs";

/// Output of one command run inside a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResult {
    /// Combined stdout and stderr in arrival order.
    pub output: String,
    pub exit_code: i64,
}

impl ExecResult {
    pub fn new(output: impl Into<String>, exit_code: i64) -> Self {
        Self {
            output: output.into(),
            exit_code,
        }
    }

    /// Whether the command exited with status zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A live environment bound to one instance and run id.
///
/// A non-zero exit status is returned as data; only transport failures
/// are errors.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Identifier of the underlying environment (the container name).
    fn name(&self) -> &str;

    /// Runs `bash -c <command>` in the working directory with extra env.
    async fn exec(
        &self,
        command: &str,
        env: &[(String, String)],
    ) -> Result<ExecResult, SandboxError>;

    /// Places raw bytes at an absolute path inside the environment.
    async fn write_bytes(&self, content: &[u8], path: &str) -> Result<(), SandboxError>;

    /// Places text at an absolute path inside the environment.
    async fn write_file(&self, content: &str, path: &str) -> Result<(), SandboxError> {
        self.write_bytes(content.as_bytes(), path).await
    }

    /// Stops and removes the environment. Safe to call more than once.
    async fn teardown(&self);
}

/// Creates sandboxes.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Provisions and starts an environment for one trial run.
    ///
    /// `run_dir` is the trial's results directory; the sandbox's host
    /// directories are derived from it.
    async fn create_and_start(
        &self,
        instance: &Instance,
        run_id: &str,
        run_dir: &Path,
    ) -> Result<Box<dyn Sandbox>, SandboxError>;
}

/// Host directories backing a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxLayout {
    /// Staging directory, mounted at [`STAGING_MOUNT`].
    pub instance_dir: PathBuf,
    /// Cache shared by every run of the same repository version.
    pub cache_dir: PathBuf,
    /// Agent logs, mounted at [`LOG_MOUNT`].
    pub log_dir: PathBuf,
}

impl SandboxLayout {
    /// Derives the layout for a trial directory `<root>/<name>/<id>/<run>`.
    ///
    /// Relative run directories are resolved against the working directory,
    /// since Docker only accepts absolute bind mount sources.
    pub fn for_run(instance: &Instance, run_dir: &Path) -> Self {
        let run_dir = std::path::absolute(run_dir).unwrap_or_else(|_| run_dir.to_path_buf());
        let run_dir = run_dir.as_path();
        let (repo, version) = instance.cache_key();
        let benchmark_dir = run_dir
            .parent()
            .and_then(Path::parent)
            .unwrap_or(run_dir);

        Self {
            instance_dir: run_dir.join("container"),
            cache_dir: benchmark_dir.join("cache").join(repo).join(version),
            log_dir: run_dir.join("logs"),
        }
    }

    /// Creates all three directories.
    pub fn create_dirs(&self) -> Result<(), SandboxError> {
        for dir in [&self.instance_dir, &self.cache_dir, &self.log_dir] {
            std::fs::create_dir_all(dir).map_err(|e| {
                SandboxError::Provision(format!("cannot create {}: {e}", dir.display()))
            })?;
        }
        Ok(())
    }

    /// Bind mounts as `(host path, container path)` pairs.
    ///
    /// The log mount nests inside the cache mount, so order matters.
    pub fn mounts(&self) -> Vec<(PathBuf, String)> {
        vec![
            (self.instance_dir.clone(), STAGING_MOUNT.to_string()),
            (self.cache_dir.clone(), CACHE_MOUNT.to_string()),
            (self.log_dir.clone(), LOG_MOUNT.to_string()),
        ]
    }

    /// Writes `content` into the staging directory under the basename of
    /// `target` and returns the command that copies it into place.
    pub fn stage(&self, content: &[u8], target: &str) -> Result<String, SandboxError> {
        let basename = staging_basename(target)?;
        let host_path = self.instance_dir.join(&basename);
        std::fs::write(&host_path, content).map_err(|e| SandboxError::Staging {
            path: host_path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(copy_into_place_command(&basename, target))
    }
}

fn staging_basename(target: &str) -> Result<String, SandboxError> {
    if !target.starts_with('/') {
        return Err(SandboxError::Staging {
            path: target.to_string(),
            reason: "target path must be absolute".to_string(),
        });
    }
    match Path::new(target).file_name().and_then(|n| n.to_str()) {
        Some(name) if !name.is_empty() => Ok(name.to_string()),
        _ => Err(SandboxError::Staging {
            path: target.to_string(),
            reason: "target path has no file name".to_string(),
        }),
    }
}

fn copy_into_place_command(basename: &str, target: &str) -> String {
    let dir = Path::new(target)
        .parent()
        .and_then(|p| p.to_str())
        .filter(|p| !p.is_empty())
        .unwrap_or("/");
    format!(
        "mkdir -p {} && cp {}/{} {}",
        shell_quote(dir),
        STAGING_MOUNT,
        shell_quote(basename),
        shell_quote(target)
    )
}

/// Quotes a value for `bash -c`.
pub fn shell_quote(value: &str) -> String {
    let plain = |c: char| {
        c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-' | ':' | '=' | '@' | '+' | ',')
    };
    if !value.is_empty() && value.chars().all(plain) {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_for_run() {
        let instance = Instance::new("psf__requests-1142", "psf/requests", "1.1");
        let run_dir = Path::new("/results/bench/psf__requests-1142/1");
        let layout = SandboxLayout::for_run(&instance, run_dir);

        assert_eq!(layout.instance_dir, run_dir.join("container"));
        assert_eq!(layout.log_dir, run_dir.join("logs"));
        assert_eq!(
            layout.cache_dir,
            PathBuf::from("/results/bench/cache/psf_requests/1.1")
        );
        assert_eq!(layout.mounts()[2].1, LOG_MOUNT);
    }

    #[test]
    fn test_layout_mount_sources_are_absolute_for_relative_root() {
        let instance = Instance::new("psf__requests-1142", "psf/requests", "1.1");
        let run_dir = Path::new("./results/swe-bench-agent/psf__requests-1142/1");
        let layout = SandboxLayout::for_run(&instance, run_dir);

        for (host, _) in layout.mounts() {
            assert!(host.is_absolute(), "{} is relative", host.display());
        }
        assert!(layout
            .cache_dir
            .ends_with("swe-bench-agent/cache/psf_requests/1.1"));
    }

    #[test]
    fn test_stage_writes_basename_and_builds_copy_command() {
        let temp = TempDir::new().unwrap();
        let instance = Instance::new("x", "o/r", "1");
        let layout = SandboxLayout::for_run(&instance, &temp.path().join("b/x/1"));
        layout.create_dirs().unwrap();

        let command = layout.stage(b"diff", "/tmp/test.patch").unwrap();
        assert_eq!(command, "mkdir -p /tmp && cp /swe/test.patch /tmp/test.patch");
        assert_eq!(
            std::fs::read_to_string(layout.instance_dir.join("test.patch")).unwrap(),
            "diff"
        );
    }

    #[test]
    fn test_stage_rejects_relative_paths() {
        let temp = TempDir::new().unwrap();
        let instance = Instance::new("x", "o/r", "1");
        let layout = SandboxLayout::for_run(&instance, temp.path());
        let err = layout.stage(b"x", "relative/file.txt").unwrap_err();
        assert!(matches!(err, SandboxError::Staging { .. }));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/tmp/a.txt"), "/tmp/a.txt");
        assert_eq!(shell_quote("it's here"), r"'it'\''s here'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_exec_result_success() {
        assert!(ExecResult::new("ok", 0).success());
        assert!(!ExecResult::new("boom", 2).success());
    }
}
