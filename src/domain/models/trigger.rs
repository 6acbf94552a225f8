//! Trigger domain model.
//!
//! Triggers wake a goal's adversary loop, either manually or on a fixed
//! interval. They are destroyed together with their goal or agent.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Interval,
}

/// A time-based or manual activation of `wake` on a goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTrigger {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub goal_id: Uuid,
    pub trigger_type: TriggerType,
    pub interval_ms: Option<u64>,
    pub enabled: bool,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl AgentTrigger {
    /// Create an interval trigger; the first fire is one interval out.
    pub fn interval(agent_id: Uuid, goal_id: Uuid, interval_ms: u64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            agent_id,
            goal_id,
            trigger_type: TriggerType::Interval,
            interval_ms: Some(interval_ms),
            enabled: true,
            last_fired_at: None,
            next_fire_at: Some(now + Duration::milliseconds(interval_ms as i64)),
            created_at: now,
        }
    }

    pub fn manual(agent_id: Uuid, goal_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id,
            goal_id,
            trigger_type: TriggerType::Manual,
            interval_ms: None,
            enabled: true,
            last_fired_at: None,
            next_fire_at: None,
            created_at: Utc::now(),
        }
    }

    /// True when an enabled interval trigger is due to fire.
    pub fn due(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled || self.trigger_type != TriggerType::Interval {
            return false;
        }
        self.next_fire_at.is_some_and(|at| now >= at)
    }

    /// Record a firing and schedule the next one.
    pub fn mark_fired(&mut self, now: DateTime<Utc>) {
        self.last_fired_at = Some(now);
        self.next_fire_at = self
            .interval_ms
            .map(|ms| now + Duration::milliseconds(ms as i64));
    }
}
