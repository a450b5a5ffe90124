//! Processing engines: the interchangeable external backends for each capability.
//!
//! [`probe`] checks which engines are usable on this machine, [`select`] picks
//! one per capability for a job.

pub mod probe;
pub mod select;

use crate::config::{Capability, Config, EngineConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

pub use probe::EngineProbe;
pub use select::{select, EngineSelector, Selection, SelectionError};

/// Probe result for one engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineDescriptor {
    pub capability: Capability,
    pub name: String,
    /// Lower is preferred.
    pub priority: u32,
    pub available: bool,
    /// Why the engine is unavailable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_reason: Option<String>,
}

impl fmt::Display for EngineDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} (priority {})", self.capability, self.name, self.priority)?;
        match &self.probe_reason {
            Some(reason) if !self.available => write!(f, ": unavailable, {}", reason),
            _ if self.available => write!(f, ": available"),
            _ => write!(f, ": unavailable"),
        }
    }
}

fn builtin(
    capability: Capability,
    name: &str,
    priority: u32,
    binary: &str,
    required_files: &[&str],
) -> EngineConfig {
    EngineConfig {
        capability,
        name: name.to_string(),
        priority,
        binary: Some(binary.to_string()),
        version_arg: None,
        required_files: required_files.iter().map(PathBuf::from).collect(),
        enabled: true,
    }
}

/// Engines known without any configuration.
///
/// Relative `required_files` are resolved against the directory of the engine's binary.
pub fn builtin_engines() -> Vec<EngineConfig> {
    use Capability::*;
    vec![
        builtin(Upscale, "realesrgan", 0, "realesrgan-ncnn-vulkan", &["models"]),
        builtin(Upscale, "video2x", 10, "video2x", &[]),
        builtin(Upscale, "ffmpeg-lanczos", 100, "ffmpeg", &[]),
        builtin(Deinterlace, "qtgmc", 0, "vspipe", &[]),
        builtin(Deinterlace, "ffmpeg-bwdif", 10, "ffmpeg", &[]),
        builtin(Deinterlace, "ffmpeg-yadif", 20, "ffmpeg", &[]),
        builtin(AudioEnhance, "resemble-enhance", 0, "resemble-enhance", &[]),
        builtin(AudioEnhance, "ffmpeg-afftdn", 10, "ffmpeg", &[]),
    ]
}

/// Built-in engines with `[[engines]]` entries applied.
///
/// An entry with the same capability and name replaces the built-in one;
/// anything else is added.
pub fn registry(overrides: &[EngineConfig]) -> Vec<EngineConfig> {
    let mut engines = builtin_engines();
    for entry in overrides {
        match engines
            .iter_mut()
            .find(|e| e.capability == entry.capability && e.name == entry.name)
        {
            Some(existing) => *existing = entry.clone(),
            None => engines.push(entry.clone()),
        }
    }
    engines.sort_by(|a, b| {
        a.capability
            .cmp(&b.capability)
            .then(a.priority.cmp(&b.priority))
            .then_with(|| a.name.cmp(&b.name))
    });
    engines
}

/// Preferred engines that no registry entry for their capability provides.
pub fn unknown_preferred_engines(config: &Config) -> Vec<String> {
    let engines = registry(&config.engines);
    let mut issues = Vec::new();
    for folder in &config.watch_folders {
        for req in &folder.capabilities {
            let Some(name) = &req.preferred_engine else {
                continue;
            };
            let known = engines
                .iter()
                .any(|e| e.capability == req.capability && &e.name == name);
            if !known {
                issues.push(format!(
                    "watch folder '{}': no {} engine named '{}'",
                    folder.name, req.capability, name
                ));
            }
        }
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry_covers_every_capability() {
        let engines = builtin_engines();
        for capability in Capability::ALL {
            assert!(engines.iter().any(|e| e.capability == capability));
        }
    }

    #[test]
    fn test_registry_override_and_extend() {
        let overrides = vec![
            EngineConfig {
                capability: Capability::Upscale,
                name: "video2x".to_string(),
                priority: 1,
                binary: Some("/opt/video2x/bin/video2x".to_string()),
                version_arg: Some("--version".to_string()),
                required_files: vec![],
                enabled: false,
            },
            EngineConfig {
                capability: Capability::Deinterlace,
                name: "nnedi3".to_string(),
                priority: 5,
                binary: Some("nnedi3".to_string()),
                version_arg: None,
                required_files: vec![],
                enabled: true,
            },
        ];
        let engines = registry(&overrides);
        let video2x = engines.iter().find(|e| e.name == "video2x").unwrap();
        assert_eq!(video2x.priority, 1);
        assert!(!video2x.enabled);
        assert_eq!(engines.len(), builtin_engines().len() + 1);

        let deinterlacers: Vec<_> = engines
            .iter()
            .filter(|e| e.capability == Capability::Deinterlace)
            .map(|e| e.name.as_str())
            .collect();
        assert_eq!(deinterlacers, vec!["qtgmc", "nnedi3", "ffmpeg-bwdif", "ffmpeg-yadif"]);
    }

    #[test]
    fn test_unknown_preferred_engines() {
        let config = Config::parse_toml(
            r#"
version = 2
[state]
state_dir = "/var/lib/reelwatch"

[[engines]]
capability = "deinterlace"
name = "nnedi3"
priority = 5

[[watch_folders]]
name = "tapes"
input_dir = "/media/tapes"
output_dir = "/media/out"
capabilities = [
    { capability = "upscale", preferred_engine = "video2x" },
    { capability = "deinterlace", preferred_engine = "nnedi3" },
    { capability = "audio_enhance", preferred_engine = "realesrgan" },
]
"#,
        )
        .unwrap();
        assert_eq!(
            unknown_preferred_engines(&config),
            vec!["watch folder 'tapes': no audio_enhance engine named 'realesrgan'".to_string()]
        );
    }

    #[test]
    fn test_descriptor_display() {
        let d = EngineDescriptor {
            capability: Capability::Upscale,
            name: "video2x".to_string(),
            priority: 10,
            available: false,
            probe_reason: Some("binary 'video2x' not found on PATH".to_string()),
        };
        assert_eq!(
            d.to_string(),
            "upscale/video2x (priority 10): unavailable, binary 'video2x' not found on PATH"
        );
    }
}
