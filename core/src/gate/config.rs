//! Versioned gate configuration: scene policies, scoring rules, budget
//! profiles and runtime overrides.
//!
//! The document is parsed from TOML into an all-optional mirror struct and
//! then merged over hard-coded defaults, so a partial document is always
//! valid. An unknown `version` is rejected at construction. The resulting
//! [`GateConfig`] is an immutable value object; runtime changes replace the
//! whole snapshot (see `config_provider`).

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use serde::Serialize;

use crate::error::CoreErr;
use crate::error::Result;
use crate::gate::types::BudgetLevel;
use crate::gate::types::BudgetSpec;
use crate::gate::types::GateAction;
use crate::gate::types::ModelTier;
use crate::gate::types::ResponsePolicy;
use crate::gate::types::Scene;

pub const GATE_CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DropEscalationConfig {
    pub burst_window_sec: f64,
    pub burst_count_threshold: usize,
    pub consecutive_threshold: usize,
    pub cooldown_suggest_sec: f64,
}

impl Default for DropEscalationConfig {
    fn default() -> Self {
        Self {
            burst_window_sec: 60.0,
            burst_count_threshold: 5,
            consecutive_threshold: 8,
            cooldown_suggest_sec: 300.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverridesConfig {
    pub emergency_mode: bool,
    pub force_low_model: bool,
    pub drop_sessions: Vec<String>,
    pub deliver_sessions: Vec<String>,
    pub drop_actors: Vec<String>,
    pub deliver_actors: Vec<String>,
}

/// Whitelistable override fields the reflex controller may patch at
/// runtime. `None` leaves the field untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverridePatch {
    pub emergency_mode: Option<bool>,
    pub force_low_model: Option<bool>,
}

impl OverridePatch {
    pub fn is_empty(&self) -> bool {
        self.emergency_mode.is_none() && self.force_low_model.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DialogueWeights {
    pub base: f64,
    pub mention: f64,
    pub question_mark: f64,
    pub long_text: f64,
}

impl Default for DialogueWeights {
    fn default() -> Self {
        Self {
            base: 0.10,
            mention: 0.40,
            question_mark: 0.15,
            long_text: 0.10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DialogueRules {
    pub weights: DialogueWeights,
    /// Keyword boosts are configuration-driven; these defaults are the
    /// shipped illustrative set.
    pub keywords: HashMap<String, f64>,
    pub long_text_len: usize,
}

impl Default for DialogueRules {
    fn default() -> Self {
        let mut keywords = HashMap::new();
        keywords.insert("urgent".to_string(), 0.30);
        keywords.insert("error".to_string(), 0.25);
        keywords.insert("help".to_string(), 0.15);
        Self {
            weights: DialogueWeights::default(),
            keywords,
            long_text_len: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupWeights {
    pub base: f64,
    pub mention: f64,
    pub whitelist_actor: f64,
}

impl Default for GroupWeights {
    fn default() -> Self {
        Self {
            base: 0.05,
            mention: 0.60,
            whitelist_actor: 0.25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupRules {
    pub weights: GroupWeights,
    pub sample_rate: f64,
    pub whitelist_actors: Vec<String>,
}

impl Default for GroupRules {
    fn default() -> Self {
        Self {
            weights: GroupWeights::default(),
            sample_rate: 0.02,
            whitelist_actors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemWeights {
    pub base: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemRules {
    pub weights: SystemWeights,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateRules {
    pub dialogue: DialogueRules,
    pub group: GroupRules,
    pub system: SystemRules,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenePolicy {
    pub deliver_threshold: f64,
    pub sink_threshold: f64,
    pub default_action: GateAction,
    pub default_model_tier: ModelTier,
    pub default_response_policy: ResponsePolicy,
    pub dedup_window_sec: f64,
    pub max_reasons: usize,
}

impl Default for ScenePolicy {
    fn default() -> Self {
        Self {
            deliver_threshold: 0.7,
            sink_threshold: 0.3,
            default_action: GateAction::Sink,
            default_model_tier: ModelTier::Low,
            default_response_policy: ResponsePolicy::RespondNow,
            dedup_window_sec: 30.0,
            max_reasons: 6,
        }
    }
}

impl ScenePolicy {
    /// Hard-coded fallback used when the config document does not name the
    /// scene.
    pub fn default_for(scene: Scene) -> Self {
        match scene {
            Scene::Alert => Self {
                deliver_threshold: 0.0,
                sink_threshold: 0.0,
                default_action: GateAction::Deliver,
                ..Default::default()
            },
            Scene::ToolCall => Self {
                default_action: GateAction::Deliver,
                ..Default::default()
            },
            Scene::System | Scene::ToolResult | Scene::Group | Scene::Dialogue => Self::default(),
            Scene::Unknown => Self::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetThresholds {
    pub high_score: f64,
    pub medium_score: f64,
}

impl Default for BudgetThresholds {
    fn default() -> Self {
        Self {
            high_score: 0.75,
            medium_score: 0.50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetProfiles {
    pub tiny: BudgetSpec,
    pub normal: BudgetSpec,
    pub deep: BudgetSpec,
}

impl Default for BudgetProfiles {
    fn default() -> Self {
        Self {
            tiny: BudgetSpec::default(),
            normal: BudgetSpec {
                budget_level: BudgetLevel::Normal,
                time_ms: 1500,
                max_tokens: 512,
                max_parallel: 2,
                evidence_allowed: true,
                max_tool_calls: 1,
                can_search_kb: true,
                can_call_tools: true,
                auto_clarify: false,
            },
            deep: BudgetSpec {
                budget_level: BudgetLevel::Deep,
                time_ms: 3000,
                max_tokens: 1024,
                max_parallel: 4,
                evidence_allowed: true,
                max_tool_calls: 3,
                can_search_kb: true,
                can_call_tools: true,
                auto_clarify: false,
            },
        }
    }
}

impl BudgetProfiles {
    pub fn for_level(&self, level: BudgetLevel) -> &BudgetSpec {
        match level {
            BudgetLevel::Tiny => &self.tiny,
            BudgetLevel::Normal => &self.normal,
            BudgetLevel::Deep => &self.deep,
        }
    }
}

/// The immutable configuration snapshot read once per observation.
#[derive(Debug, Clone, PartialEq)]
pub struct GateConfig {
    pub version: u32,
    pub drop_escalation: DropEscalationConfig,
    pub overrides: OverridesConfig,
    pub rules: GateRules,
    pub scene_policies: HashMap<Scene, ScenePolicy>,
    pub budget_thresholds: BudgetThresholds,
    pub budget_profiles: BudgetProfiles,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            version: GATE_CONFIG_VERSION,
            drop_escalation: DropEscalationConfig::default(),
            overrides: OverridesConfig::default(),
            rules: GateRules::default(),
            scene_policies: HashMap::new(),
            budget_thresholds: BudgetThresholds::default(),
            budget_profiles: BudgetProfiles::default(),
        }
    }
}

impl GateConfig {
    pub fn scene_policy(&self, scene: Scene) -> ScenePolicy {
        self.scene_policies
            .get(&scene)
            .cloned()
            .unwrap_or_else(|| ScenePolicy::default_for(scene))
    }

    /// Apply a runtime override patch, returning the new snapshot, or
    /// `None` when nothing would change.
    pub fn apply_override_patch(&self, patch: OverridePatch) -> Option<GateConfig> {
        let mut overrides = self.overrides.clone();
        if let Some(v) = patch.emergency_mode {
            overrides.emergency_mode = v;
        }
        if let Some(v) = patch.force_low_model {
            overrides.force_low_model = v;
        }
        if overrides == self.overrides {
            return None;
        }
        Some(GateConfig {
            overrides,
            ..self.clone()
        })
    }

    pub fn from_toml_str(raw: &str) -> Result<GateConfig> {
        let doc: GateConfigToml = toml::from_str(raw)?;
        doc.into_config()
    }

    pub fn load(path: &Path) -> Result<GateConfig> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }
}

/// Serde mirror of the on-disk document. Every field is optional so a
/// partial document merges over defaults.
#[derive(Debug, Default, Deserialize)]
struct GateConfigToml {
    version: Option<u32>,
    drop_escalation: Option<DropEscalationConfig>,
    overrides: Option<OverridesConfig>,
    rules: Option<GateRules>,
    scene_policies: Option<HashMap<String, ScenePolicy>>,
    budget_thresholds: Option<BudgetThresholds>,
    budget_profiles: Option<BudgetProfiles>,
}

impl GateConfigToml {
    fn into_config(self) -> Result<GateConfig> {
        let version = self.version.unwrap_or(GATE_CONFIG_VERSION);
        if version != GATE_CONFIG_VERSION {
            return Err(CoreErr::Config(format!(
                "unsupported gate config version: {version}"
            )));
        }

        let mut scene_policies = HashMap::new();
        for (key, policy) in self.scene_policies.unwrap_or_default() {
            match parse_scene(&key) {
                Some(scene) => {
                    scene_policies.insert(scene, policy);
                }
                None => {
                    tracing::warn!(scene = %key, "ignoring unknown scene in config");
                }
            }
        }

        Ok(GateConfig {
            version,
            drop_escalation: self.drop_escalation.unwrap_or_default(),
            overrides: self.overrides.unwrap_or_default(),
            rules: self.rules.unwrap_or_default(),
            scene_policies,
            budget_thresholds: self.budget_thresholds.unwrap_or_default(),
            budget_profiles: self.budget_profiles.unwrap_or_default(),
        })
    }
}

fn parse_scene(key: &str) -> Option<Scene> {
    match key.trim().to_ascii_lowercase().as_str() {
        "dialogue" => Some(Scene::Dialogue),
        "group" => Some(Scene::Group),
        "system" => Some(Scene::System),
        "tool_call" => Some(Scene::ToolCall),
        "tool_result" => Some(Scene::ToolResult),
        "alert" => Some(Scene::Alert),
        "unknown" => Some(Scene::Unknown),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let cfg = GateConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, GateConfig::default());
        assert_eq!(cfg.rules.dialogue.long_text_len, 300);
        assert_eq!(cfg.budget_thresholds.high_score, 0.75);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let err = GateConfig::from_toml_str("version = 2").unwrap_err();
        assert!(matches!(err, CoreErr::Config(_)));
    }

    #[test]
    fn partial_document_merges_over_defaults() {
        let raw = r#"
            version = 1

            [drop_escalation]
            burst_count_threshold = 2

            [overrides]
            deliver_actors = ["vip"]

            [rules.dialogue.keywords]
            urgent = 0.5

            [scene_policies.dialogue]
            deliver_threshold = 0.4

            [scene_policies.nonsense]
            deliver_threshold = 0.9
        "#;
        let cfg = GateConfig::from_toml_str(raw).unwrap();
        assert_eq!(cfg.drop_escalation.burst_count_threshold, 2);
        assert_eq!(cfg.drop_escalation.consecutive_threshold, 8);
        assert_eq!(cfg.overrides.deliver_actors, vec!["vip".to_string()]);
        assert_eq!(cfg.rules.dialogue.keywords["urgent"], 0.5);
        assert_eq!(cfg.scene_policy(Scene::Dialogue).deliver_threshold, 0.4);
        // Unnamed scenes fall back to the hard-coded defaults.
        assert_eq!(
            cfg.scene_policy(Scene::Alert).default_action,
            GateAction::Deliver
        );
        assert_eq!(cfg.scene_policies.len(), 1);
    }

    #[test]
    fn override_patch_replaces_whole_value() {
        let cfg = GateConfig::default();
        let patched = cfg
            .apply_override_patch(OverridePatch {
                force_low_model: Some(true),
                ..Default::default()
            })
            .unwrap();
        assert!(patched.overrides.force_low_model);
        assert!(!cfg.overrides.force_low_model);

        // No-op patches report no change.
        assert!(
            patched
                .apply_override_patch(OverridePatch {
                    force_low_model: Some(true),
                    ..Default::default()
                })
                .is_none()
        );
    }
}
