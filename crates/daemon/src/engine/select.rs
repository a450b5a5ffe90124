//! Engine selection with fallback.

use super::{EngineDescriptor, EngineProbe};
use crate::config::{Capability, CapabilityRequest};
use crate::job::SelectedEngine;
use log::warn;
use std::sync::Arc;
use thiserror::Error;

/// No usable engine for a required capability. Permanent; never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error("no available engine for {capability} (tried: {})", format_tried(.tried))]
    NoEngine {
        capability: Capability,
        tried: Vec<(String, String)>,
    },
}

fn format_tried(tried: &[(String, String)]) -> String {
    if tried.is_empty() {
        return "none registered".to_string();
    }
    tried
        .iter()
        .map(|(name, reason)| format!("{}: {}", name, reason))
        .collect::<Vec<_>>()
        .join("; ")
}

/// The engine chosen for one capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub engine: EngineDescriptor,
    /// The engine that should have been used, when it was unavailable.
    pub fallback_from: Option<String>,
}

impl Selection {
    pub fn is_fallback(&self) -> bool {
        self.fallback_from.is_some()
    }

    pub fn to_selected(&self) -> SelectedEngine {
        SelectedEngine {
            capability: self.engine.capability,
            name: self.engine.name.clone(),
            priority: self.engine.priority,
            fallback_from: self.fallback_from.clone(),
        }
    }
}

/// Picks the engine for `request` from probe results.
///
/// A requested engine that is available wins regardless of priority. Otherwise
/// the highest-priority available engine is chosen; if that is not the engine
/// the request named (or, without a preference, not the top-priority engine)
/// the result records what it replaced.
pub fn select(
    descriptors: &[EngineDescriptor],
    request: &CapabilityRequest,
) -> Result<Selection, SelectionError> {
    let mut chain: Vec<&EngineDescriptor> = descriptors
        .iter()
        .filter(|d| d.capability == request.capability)
        .collect();
    chain.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));

    if let Some(preferred) = &request.preferred_engine {
        if let Some(engine) = chain.iter().find(|d| &d.name == preferred && d.available) {
            return Ok(Selection {
                engine: (*engine).clone(),
                fallback_from: None,
            });
        }
    }

    match chain.iter().find(|d| d.available) {
        Some(engine) => {
            let wanted = request
                .preferred_engine
                .clone()
                .or_else(|| chain.first().map(|d| d.name.clone()));
            let fallback_from = wanted.filter(|name| name != &engine.name);
            Ok(Selection {
                engine: (*engine).clone(),
                fallback_from,
            })
        }
        None => Err(SelectionError::NoEngine {
            capability: request.capability,
            tried: chain
                .iter()
                .map(|d| {
                    (
                        d.name.clone(),
                        d.probe_reason.clone().unwrap_or_else(|| "unavailable".to_string()),
                    )
                })
                .collect(),
        }),
    }
}

/// Resolves a job's capability requests against the cached probe results.
#[derive(Debug, Clone)]
pub struct EngineSelector {
    probe: Arc<EngineProbe>,
}

impl EngineSelector {
    pub fn new(probe: Arc<EngineProbe>) -> Self {
        Self { probe }
    }

    pub fn probe(&self) -> &EngineProbe {
        &self.probe
    }

    /// One selection per request, in request order. Fallbacks are logged here;
    /// the caller records them on the job.
    pub async fn resolve(
        &self,
        requests: &[CapabilityRequest],
    ) -> Result<Vec<Selection>, SelectionError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let descriptors = self.probe.descriptors().await;
        let mut selections = Vec::with_capacity(requests.len());
        for request in requests {
            let selection = select(&descriptors, request)?;
            if let Some(from) = &selection.fallback_from {
                warn!(
                    "Engine fallback for {}: {} unavailable, using {}",
                    request.capability, from, selection.engine.name
                );
            }
            selections.push(selection);
        }
        Ok(selections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn d(capability: Capability, name: &str, priority: u32, available: bool) -> EngineDescriptor {
        EngineDescriptor {
            capability,
            name: name.to_string(),
            priority,
            available,
            probe_reason: (!available).then(|| format!("{} missing", name)),
        }
    }

    fn req(capability: Capability, preferred: Option<&str>) -> CapabilityRequest {
        CapabilityRequest {
            capability,
            preferred_engine: preferred.map(str::to_string),
        }
    }

    fn upscalers(realesrgan: bool, video2x: bool, lanczos: bool) -> Vec<EngineDescriptor> {
        vec![
            d(Capability::Upscale, "realesrgan", 0, realesrgan),
            d(Capability::Upscale, "video2x", 10, video2x),
            d(Capability::Upscale, "ffmpeg-lanczos", 100, lanczos),
            d(Capability::Deinterlace, "qtgmc", 0, true),
        ]
    }

    #[test]
    fn test_top_priority_without_preference() {
        let s = select(&upscalers(true, true, true), &req(Capability::Upscale, None)).unwrap();
        assert_eq!(s.engine.name, "realesrgan");
        assert!(!s.is_fallback());
    }

    #[test]
    fn test_available_preference_wins_over_priority() {
        let s = select(
            &upscalers(true, true, true),
            &req(Capability::Upscale, Some("ffmpeg-lanczos")),
        )
        .unwrap();
        assert_eq!(s.engine.name, "ffmpeg-lanczos");
        assert!(!s.is_fallback());
    }

    #[test]
    fn test_unavailable_preference_falls_back() {
        let s = select(
            &upscalers(false, true, true),
            &req(Capability::Upscale, Some("realesrgan")),
        )
        .unwrap();
        assert_eq!(s.engine.name, "video2x");
        assert_eq!(s.fallback_from.as_deref(), Some("realesrgan"));
        assert_eq!(s.to_selected().fallback_from.as_deref(), Some("realesrgan"));
    }

    #[test]
    fn test_unavailable_top_engine_is_recorded() {
        let s = select(&upscalers(false, false, true), &req(Capability::Upscale, None)).unwrap();
        assert_eq!(s.engine.name, "ffmpeg-lanczos");
        assert_eq!(s.fallback_from.as_deref(), Some("realesrgan"));
    }

    #[test]
    fn test_no_engine_is_configuration_error() {
        let err = select(&upscalers(false, false, false), &req(Capability::Upscale, None)).unwrap_err();
        let SelectionError::NoEngine { capability, tried } = &err;
        assert_eq!(*capability, Capability::Upscale);
        assert_eq!(tried.len(), 3);
        assert!(err.to_string().contains("realesrgan: realesrgan missing"));

        let err = select(&upscalers(true, true, true), &req(Capability::AudioEnhance, None)).unwrap_err();
        assert!(err.to_string().contains("none registered"));
    }

    fn descriptors_strategy() -> impl Strategy<Value = Vec<EngineDescriptor>> {
        proptest::collection::vec((0u32..50, any::<bool>()), 0..8).prop_map(|engines| {
            engines
                .into_iter()
                .enumerate()
                .map(|(i, (priority, available))| {
                    d(Capability::Upscale, &format!("e{}", i), priority, available)
                })
                .collect()
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        // Selection returns an available engine of the right capability, the best one
        // unless an available preference was given, and fails only if none is available.
        #[test]
        fn prop_selection_is_best_available(
            descriptors in descriptors_strategy(),
            preferred in proptest::option::of(0usize..10),
        ) {
            let preferred = preferred.map(|i| format!("e{}", i));
            let request = req(Capability::Upscale, preferred.as_deref());
            let any_available = descriptors.iter().any(|d| d.available);

            match select(&descriptors, &request) {
                Ok(selection) => {
                    prop_assert!(selection.engine.available);
                    let preferred_available = descriptors
                        .iter()
                        .any(|d| Some(&d.name) == preferred.as_ref() && d.available);
                    if preferred_available {
                        prop_assert_eq!(Some(&selection.engine.name), preferred.as_ref());
                        prop_assert!(selection.fallback_from.is_none());
                    } else {
                        let best = descriptors
                            .iter()
                            .filter(|d| d.available)
                            .map(|d| d.priority)
                            .min()
                            .unwrap();
                        prop_assert_eq!(selection.engine.priority, best);
                        if preferred.is_some() {
                            prop_assert_eq!(selection.fallback_from, preferred);
                        }
                    }
                }
                Err(_) => prop_assert!(!any_available),
            }
        }
    }
}
