//! Preference domain model.
//!
//! A preference is a remembered operator choice, ranked by confidence
//! and injected into prompts. Keys are unique per agent; an upsert may
//! never lower the stored confidence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Confidence ranking for a stored preference.
///
/// Totally ordered: `Assumed < Inferred < Explicit`. An upsert replaces
/// an existing preference only when the incoming confidence is at least
/// as high.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Assumed,
    Inferred,
    Explicit,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assumed => "assumed",
            Self::Inferred => "inferred",
            Self::Explicit => "explicit",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "assumed" => Some(Self::Assumed),
            "inferred" => Some(Self::Inferred),
            "explicit" => Some(Self::Explicit),
            _ => None,
        }
    }
}

/// A remembered operator choice scoped to one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentPreference {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub category: String,
    /// Unique per agent.
    pub key: String,
    pub value: String,
    /// Where this preference was learned (e.g. "reply", "extraction").
    pub source: String,
    pub confidence: Confidence,
    pub created_at: DateTime<Utc>,
    pub used_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl AgentPreference {
    pub fn new(
        agent_id: Uuid,
        category: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
        source: impl Into<String>,
        confidence: Confidence,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id,
            category: category.into(),
            key: key.into(),
            value: value.into(),
            source: source.into(),
            confidence,
            created_at: Utc::now(),
            used_count: 0,
            last_used_at: None,
        }
    }

    pub fn mark_used(&mut self) {
        self.used_count += 1;
        self.last_used_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_total_order() {
        assert!(Confidence::Assumed < Confidence::Inferred);
        assert!(Confidence::Inferred < Confidence::Explicit);
    }

    #[test]
    fn test_confidence_round_trip() {
        for c in [Confidence::Assumed, Confidence::Inferred, Confidence::Explicit] {
            assert_eq!(Confidence::from_str(c.as_str()), Some(c));
        }
        assert!(Confidence::from_str("certain").is_none());
    }

    #[test]
    fn test_mark_used() {
        let mut pref = AgentPreference::new(
            Uuid::new_v4(),
            "database",
            "db_driver",
            "Postgres",
            "reply",
            Confidence::Explicit,
        );
        assert_eq!(pref.used_count, 0);
        pref.mark_used();
        pref.mark_used();
        assert_eq!(pref.used_count, 2);
        assert!(pref.last_used_at.is_some());
    }
}
