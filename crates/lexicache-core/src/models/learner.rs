use serde::{Deserialize, Serialize};

/// Learner proficiency, used by the settings-driven preload rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProficiencyLevel {
    #[default]
    Beginner,
    Intermediate,
    Advanced,
}

impl ProficiencyLevel {
    /// Parse a level string. Accepts CEFR bands as well as the plain names.
    pub fn parse(s: &str) -> Option<Self> {
        let lower = s.trim().to_lowercase();
        match lower.as_str() {
            "beginner" | "a1" | "a2" => Some(ProficiencyLevel::Beginner),
            "intermediate" | "b1" | "b2" => Some(ProficiencyLevel::Intermediate),
            "advanced" | "c1" | "c2" => Some(ProficiencyLevel::Advanced),
            _ => None,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ProficiencyLevel::Beginner => "Beginner",
            ProficiencyLevel::Intermediate => "Intermediate",
            ProficiencyLevel::Advanced => "Advanced",
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSettings {
    #[serde(default)]
    pub level: ProficiencyLevel,
    #[serde(default)]
    pub preferred_category: Option<String>,
    #[serde(default = "default_true")]
    pub enable_chunked_loading: bool,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            level: ProficiencyLevel::default(),
            preferred_category: None,
            enable_chunked_loading: true,
        }
    }
}

/// A label category the learner keeps getting wrong.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorCombo {
    pub category: String,
    pub impact: f64,
}

/// How well the learner knows one key, in [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasteryRecord {
    pub key: String,
    pub score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parse() {
        assert_eq!(ProficiencyLevel::parse("B2"), Some(ProficiencyLevel::Intermediate));
        assert_eq!(ProficiencyLevel::parse(" advanced "), Some(ProficiencyLevel::Advanced));
        assert_eq!(ProficiencyLevel::parse("expert"), None);
    }

    #[test]
    fn test_settings_defaults_enable_chunking() {
        let settings: UserSettings = serde_json::from_str("{}").unwrap();
        assert!(settings.enable_chunked_loading);
        assert_eq!(settings.level, ProficiencyLevel::Beginner);
    }
}
