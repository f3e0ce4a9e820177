//! Voice agent configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Synthesis tuning knobs passed through to the speech provider.
///
/// Values are clamped to [0, 1]. Equality of tunings (after fixed-point
/// encoding) participates in the synthesis cache fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoiceTuning {
    pub stability: f32,
    pub similarity: f32,
    pub style: f32,
    pub speaker_boost: bool,
}

impl Default for VoiceTuning {
    fn default() -> Self {
        Self {
            stability: 0.5,
            similarity: 0.75,
            style: 0.0,
            speaker_boost: true,
        }
    }
}

impl VoiceTuning {
    pub fn clamped(self) -> Self {
        Self {
            stability: self.stability.clamp(0.0, 1.0),
            similarity: self.similarity.clamp(0.0, 1.0),
            style: self.style.clamp(0.0, 1.0),
            speaker_boost: self.speaker_boost,
        }
    }

    /// Stable fixed-point encoding so equal tunings fingerprint equally.
    pub fn encode(&self) -> [u16; 4] {
        let q = |v: f32| (v.clamp(0.0, 1.0) * 10_000.0).round() as u16;
        [
            q(self.stability),
            q(self.similarity),
            q(self.style),
            u16::from(self.speaker_boost),
        ]
    }
}

/// Language model parameters for response generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelParams {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            temperature: 0.7,
            max_tokens: 256,
        }
    }
}

/// Daily working-hours window, local to `timezone`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingHours {
    pub timezone: String,
    /// Minutes from midnight, inclusive start / exclusive end.
    pub open_minutes: u16,
    pub close_minutes: u16,
    /// 0 = Monday .. 6 = Sunday.
    pub days: Vec<u8>,
}

/// Per-tenant voice agent. Tenant ownership is immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceAgent {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub active: bool,
    /// Provider voice identity; must exist at the speech provider.
    pub voice_id: String,
    pub tuning: VoiceTuning,
    pub model_params: ModelParams,
    /// System prompt template with `{placeholder}` substitutions.
    pub system_prompt: String,
    pub greeting: String,
    pub fallback_message: String,
    pub language: String,
    pub transfer_enabled: bool,
    pub scheduling_enabled: bool,
    pub recording_enabled: bool,
    pub working_hours: Option<WorkingHours>,
    pub stats: AgentStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const DEFAULT_FALLBACK_MESSAGE: &str =
    "I'm having trouble processing that — could you repeat?";

impl VoiceAgent {
    pub fn new(tenant_id: impl Into<String>, name: impl Into<String>, voice_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            name: name.into(),
            active: true,
            voice_id: voice_id.into(),
            tuning: VoiceTuning::default(),
            model_params: ModelParams::default(),
            system_prompt: String::new(),
            greeting: "Hello! How can I help you today?".to_string(),
            fallback_message: DEFAULT_FALLBACK_MESSAGE.to_string(),
            language: "en".to_string(),
            transfer_enabled: false,
            scheduling_enabled: false,
            recording_enabled: false,
            working_hours: None,
            stats: AgentStats::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Render the system prompt, substituting `{key}` placeholders.
    pub fn render_prompt(&self, vars: &[(&str, &str)]) -> String {
        let mut out = self.system_prompt.clone();
        for (key, value) in vars {
            out = out.replace(&format!("{{{key}}}"), value);
        }
        out
    }
}

/// Rolling per-agent call statistics, updated on session completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentStats {
    pub total_sessions: u64,
    pub completed_sessions: u64,
    pub total_duration_secs: u64,
}

impl AgentStats {
    pub fn record_session(&mut self, completed: bool, duration_secs: u64) {
        self.total_sessions += 1;
        if completed {
            self.completed_sessions += 1;
        }
        self.total_duration_secs += duration_secs;
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_sessions == 0 {
            0.0
        } else {
            self.completed_sessions as f64 / self.total_sessions as f64
        }
    }

    pub fn average_duration_secs(&self) -> f64 {
        if self.total_sessions == 0 {
            0.0
        } else {
            self.total_duration_secs as f64 / self.total_sessions as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuning_encoding_is_stable() {
        let a = VoiceTuning {
            stability: 0.5,
            similarity: 0.75,
            style: 0.0,
            speaker_boost: true,
        };
        let b = a;
        assert_eq!(a.encode(), b.encode());
        let c = VoiceTuning {
            stability: 0.5001,
            ..a
        };
        assert_ne!(a.encode(), c.encode());
    }

    #[test]
    fn prompt_placeholder_rendering() {
        let mut agent = VoiceAgent::new("t-1", "Front desk", "voice-a");
        agent.system_prompt = "You are {name} for {company}.".to_string();
        let rendered = agent.render_prompt(&[("name", "Ava"), ("company", "Acme")]);
        assert_eq!(rendered, "You are Ava for Acme.");
    }

    #[test]
    fn stats_aggregation() {
        let mut stats = AgentStats::default();
        stats.record_session(true, 120);
        stats.record_session(false, 30);
        assert_eq!(stats.total_sessions, 2);
        assert!((stats.success_rate() - 0.5).abs() < f64::EPSILON);
        assert!((stats.average_duration_secs() - 75.0).abs() < f64::EPSILON);
    }
}
