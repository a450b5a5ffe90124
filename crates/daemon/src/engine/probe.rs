//! Engine availability probing.
//!
//! A probe is always cheap: look the binary up on the search path, check that its
//! runtime files exist and, if configured, run `<binary> <version-arg>`. A probe
//! never runs a real job.

use super::EngineDescriptor;
use crate::config::{Capability, EngineConfig};
use log::{debug, info};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Command;

const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolves `program` the way a shell would, without invoking one.
pub fn find_executable(program: &str, search_path: &[PathBuf]) -> Option<PathBuf> {
    if program.contains('/') {
        let path = PathBuf::from(program);
        return is_executable(&path).then_some(path);
    }
    search_path
        .iter()
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Directories listed in `PATH`.
pub fn env_search_path() -> Vec<PathBuf> {
    std::env::var_os("PATH")
        .map(|p| std::env::split_paths(&p).collect())
        .unwrap_or_default()
}

/// Probes a fixed set of engines and caches the results until [`refresh`](EngineProbe::refresh).
#[derive(Debug)]
pub struct EngineProbe {
    engines: Vec<EngineConfig>,
    search_path: Vec<PathBuf>,
    cache: Mutex<Option<Vec<EngineDescriptor>>>,
}

impl EngineProbe {
    pub fn new(engines: Vec<EngineConfig>) -> Self {
        Self::with_search_path(engines, env_search_path())
    }

    pub fn with_search_path(engines: Vec<EngineConfig>, search_path: Vec<PathBuf>) -> Self {
        Self {
            engines,
            search_path,
            cache: Mutex::new(None),
        }
    }

    /// Cached descriptors, probing on first use.
    pub async fn descriptors(&self) -> Vec<EngineDescriptor> {
        if let Some(cached) = self.cached() {
            return cached;
        }
        self.refresh().await
    }

    /// Descriptors for one capability, best first.
    pub async fn for_capability(&self, capability: Capability) -> Vec<EngineDescriptor> {
        self.descriptors()
            .await
            .into_iter()
            .filter(|d| d.capability == capability)
            .collect()
    }

    /// Re-probes every engine and replaces the cache.
    pub async fn refresh(&self) -> Vec<EngineDescriptor> {
        let mut descriptors = Vec::with_capacity(self.engines.len());
        for engine in &self.engines {
            descriptors.push(self.probe_one(engine).await);
        }
        descriptors.sort_by(|a, b| {
            a.capability
                .cmp(&b.capability)
                .then(a.priority.cmp(&b.priority))
                .then_with(|| a.name.cmp(&b.name))
        });

        let available = descriptors.iter().filter(|d| d.available).count();
        info!(
            "Probed {} engines ({} available)",
            descriptors.len(),
            available
        );
        *self.cache.lock().unwrap_or_else(|e| e.into_inner()) = Some(descriptors.clone());
        descriptors
    }

    fn cached(&self) -> Option<Vec<EngineDescriptor>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn probe_one(&self, engine: &EngineConfig) -> EngineDescriptor {
        let verdict = self.check(engine).await;
        if let Err(reason) = &verdict {
            debug!("Engine {}/{} unavailable: {}", engine.capability, engine.name, reason);
        }
        EngineDescriptor {
            capability: engine.capability,
            name: engine.name.clone(),
            priority: engine.priority,
            available: verdict.is_ok(),
            probe_reason: verdict.err(),
        }
    }

    async fn check(&self, engine: &EngineConfig) -> Result<(), String> {
        if !engine.enabled {
            return Err("disabled in configuration".to_string());
        }

        let binary = match &engine.binary {
            Some(program) => Some(
                find_executable(program, &self.search_path)
                    .ok_or_else(|| format!("binary '{}' not found on PATH", program))?,
            ),
            None => None,
        };

        let base = binary.as_deref().and_then(Path::parent);
        for file in &engine.required_files {
            let resolved = match base {
                Some(dir) if file.is_relative() => dir.join(file),
                _ => file.clone(),
            };
            if !resolved.exists() {
                return Err(format!("required file {} is missing", resolved.display()));
            }
        }

        if let (Some(binary), Some(arg)) = (&binary, &engine.version_arg) {
            run_version_check(binary, arg).await?;
        }
        Ok(())
    }
}

/// Runs `<binary> <arg>` and requires a zero exit within a few seconds.
async fn run_version_check(binary: &Path, arg: &str) -> Result<(), String> {
    let mut command = Command::new(binary);
    command
        .arg(OsString::from(arg))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let status = tokio::time::timeout(VERSION_CHECK_TIMEOUT, command.status())
        .await
        .map_err(|_| format!("{} {} timed out", binary.display(), arg))?
        .map_err(|e| format!("{} {} failed: {}", binary.display(), arg, e))?;

    if status.success() {
        Ok(())
    } else {
        Err(format!("{} {} exited with {}", binary.display(), arg, status))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    pub(crate) fn fake_binary(dir: &Path, name: &str, exit_code: i32) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\nexit {}\n", exit_code)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    pub(crate) fn engine(capability: Capability, name: &str, priority: u32, binary: &str) -> EngineConfig {
        EngineConfig {
            capability,
            name: name.to_string(),
            priority,
            binary: Some(binary.to_string()),
            version_arg: None,
            required_files: Vec::new(),
            enabled: true,
        }
    }

    #[test]
    fn test_find_executable() {
        let dir = TempDir::new().unwrap();
        let bin = fake_binary(dir.path(), "upscaler", 0);
        fs::write(dir.path().join("not-exec"), b"data").unwrap();
        let path = vec![dir.path().to_path_buf()];

        assert_eq!(find_executable("upscaler", &path), Some(bin.clone()));
        assert_eq!(find_executable(bin.to_str().unwrap(), &[]), Some(bin));
        assert_eq!(find_executable("not-exec", &path), None);
        assert_eq!(find_executable("missing", &path), None);
    }

    #[tokio::test]
    async fn test_probe_reports_reasons() {
        let dir = TempDir::new().unwrap();
        fake_binary(dir.path(), "good", 0);
        fake_binary(dir.path(), "broken", 3);

        let mut versioned = engine(Capability::Upscale, "broken", 5, "broken");
        versioned.version_arg = Some("--version".to_string());
        let mut needs_models = engine(Capability::Upscale, "models", 7, "good");
        needs_models.required_files = vec![PathBuf::from("models")];
        let mut disabled = engine(Capability::Upscale, "off", 9, "good");
        disabled.enabled = false;

        let probe = EngineProbe::with_search_path(
            vec![
                engine(Capability::Upscale, "good", 10, "good"),
                engine(Capability::Upscale, "absent", 1, "absent"),
                versioned,
                needs_models,
                disabled,
            ],
            vec![dir.path().to_path_buf()],
        );

        let descriptors = probe.descriptors().await;
        let by_name = |name: &str| descriptors.iter().find(|d| d.name == name).unwrap().clone();

        assert!(by_name("good").available);
        assert!(by_name("absent").probe_reason.unwrap().contains("not found"));
        assert!(by_name("broken").probe_reason.unwrap().contains("exited"));
        assert!(by_name("models").probe_reason.unwrap().contains("missing"));
        assert!(by_name("off").probe_reason.unwrap().contains("disabled"));

        let names: Vec<_> = descriptors.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["absent", "broken", "models", "off", "good"]);
    }

    #[tokio::test]
    async fn test_probe_is_cached_until_refresh() {
        let dir = TempDir::new().unwrap();
        let probe = EngineProbe::with_search_path(
            vec![engine(Capability::Deinterlace, "late", 0, "late")],
            vec![dir.path().to_path_buf()],
        );
        assert!(!probe.descriptors().await[0].available);

        fake_binary(dir.path(), "late", 0);
        assert!(!probe.descriptors().await[0].available);
        assert!(probe.refresh().await[0].available);
        assert!(probe.for_capability(Capability::Deinterlace).await[0].available);
    }
}
