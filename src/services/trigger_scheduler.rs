//! Interval trigger scheduler.
//!
//! A tick loop over the goal manager's triggers. Reading live state
//! each tick keeps the timer table and the persistent store from ever
//! drifting apart.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{AgentTrigger, GoalStatus};
use crate::services::adversary::Adversary;
use crate::services::event_bus::{EngineEvent, EnginePayload, EventBus};
use crate::services::goal_manager::GoalManager;

pub struct TriggerScheduler {
    goals: Arc<GoalManager>,
    adversary: Arc<Adversary>,
    bus: Arc<EventBus>,
    tick_interval: Duration,
    running: Arc<AtomicBool>,
}

impl TriggerScheduler {
    pub fn new(
        goals: Arc<GoalManager>,
        adversary: Arc<Adversary>,
        bus: Arc<EventBus>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            goals,
            adversary,
            bus,
            tick_interval,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the tick loop. Returns its JoinHandle.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let scheduler = self.clone();

        tokio::spawn(async move {
            while scheduler.running.load(Ordering::SeqCst) {
                tokio::time::sleep(scheduler.tick_interval).await;

                let now = Utc::now();
                for trigger in scheduler.goals.list_triggers().await {
                    if trigger.due(now) {
                        scheduler.try_fire(&trigger).await;
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Fire a trigger by hand, regardless of its schedule.
    pub async fn fire_manual(&self, trigger_id: uuid::Uuid) -> DomainResult<()> {
        let trigger = self
            .goals
            .get_trigger(trigger_id)
            .await
            .ok_or(DomainError::TriggerNotFound(trigger_id))?;
        if !self.try_fire(&trigger).await {
            return Err(DomainError::ValidationFailed(
                "trigger's goal is not ready to wake".to_string(),
            ));
        }
        Ok(())
    }

    /// Fire one trigger unless its goal is missing, not active, or
    /// already being worked. Returns whether it fired.
    async fn try_fire(&self, trigger: &AgentTrigger) -> bool {
        let Some(goal) = self.goals.get_goal(trigger.goal_id).await else {
            tracing::debug!(trigger_id = %trigger.id, "skipping trigger for missing goal");
            return false;
        };
        if goal.status != GoalStatus::Active {
            return false;
        }
        if self.adversary.is_goal_active(goal.id).await {
            return false;
        }

        let _ = self.goals.mark_trigger_fired(trigger.id, Utc::now()).await;
        self.bus.publish(
            EngineEvent::new(EnginePayload::TriggerFired {
                trigger_id: trigger.id,
                goal_id: goal.id,
            })
            .with_agent(trigger.agent_id)
            .with_goal(goal.id),
        );

        if let Err(e) = self.adversary.wake(goal.id).await {
            tracing::warn!(goal_id = %goal.id, error = %e, "trigger wake failed");
        }
        true
    }
}
