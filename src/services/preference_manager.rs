//! Learned operator preferences, keyed per agent.
//!
//! Preferences are extracted by the oracle from operator replies,
//! ranked by confidence, injected into worker prompts, and
//! usage-counted when a worker reports applying one.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{AgentPreference, Confidence};
use crate::domain::ports::store::StateStore;
use crate::services::event_bus::{EngineEvent, EnginePayload, EventBus};
use crate::services::lenient_json;

/// Owns preferences keyed `(agent_id, key)`.
pub struct PreferenceManager {
    prefs: RwLock<HashMap<Uuid, Vec<AgentPreference>>>,
    store: Arc<dyn StateStore>,
    bus: Arc<EventBus>,
}

impl PreferenceManager {
    pub fn new(store: Arc<dyn StateStore>, bus: Arc<EventBus>) -> Self {
        Self {
            prefs: RwLock::new(HashMap::new()),
            store,
            bus,
        }
    }

    async fn ensure_loaded(&self, agent_id: Uuid) {
        if self.prefs.read().await.contains_key(&agent_id) {
            return;
        }
        let loaded = self.store.load_preferences(agent_id).await.unwrap_or_default();
        self.prefs.write().await.entry(agent_id).or_insert(loaded);
    }

    /// Upsert with confidence ordering: an existing preference is only
    /// replaced when the incoming confidence is at least as high.
    /// Returns false when the upsert was rejected.
    pub async fn add_preference(
        &self,
        agent_id: Uuid,
        category: &str,
        key: &str,
        value: &str,
        source: &str,
        confidence: Confidence,
    ) -> DomainResult<bool> {
        let key = key.trim();
        if key.is_empty() {
            return Err(DomainError::ValidationFailed(
                "preference key cannot be empty".to_string(),
            ));
        }
        self.ensure_loaded(agent_id).await;

        let stored = {
            let mut prefs = self.prefs.write().await;
            let list = prefs.entry(agent_id).or_default();
            match list.iter_mut().find(|p| p.key == key) {
                Some(existing) => {
                    if confidence < existing.confidence {
                        false
                    } else {
                        existing.category = category.to_string();
                        existing.value = value.to_string();
                        existing.source = source.to_string();
                        existing.confidence = confidence;
                        true
                    }
                }
                None => {
                    list.push(AgentPreference::new(
                        agent_id, category, key, value, source, confidence,
                    ));
                    true
                }
            }
        };

        if stored {
            self.persist(agent_id).await;
            self.bus.publish(
                EngineEvent::new(EnginePayload::PreferenceLearned {
                    agent_id,
                    key: key.to_string(),
                    confidence: confidence.as_str().to_string(),
                })
                .with_agent(agent_id),
            );
        }
        Ok(stored)
    }

    /// Remove a preference by key. Returns false when absent.
    pub async fn remove_preference(&self, agent_id: Uuid, key: &str) -> bool {
        self.ensure_loaded(agent_id).await;
        let removed = {
            let mut prefs = self.prefs.write().await;
            let list = prefs.entry(agent_id).or_default();
            let before = list.len();
            list.retain(|p| p.key != key);
            before != list.len()
        };
        if removed {
            self.persist(agent_id).await;
        }
        removed
    }

    pub async fn list(&self, agent_id: Uuid) -> Vec<AgentPreference> {
        self.ensure_loaded(agent_id).await;
        let mut list = self
            .prefs
            .read()
            .await
            .get(&agent_id)
            .cloned()
            .unwrap_or_default();
        list.sort_by(|a, b| a.key.cmp(&b.key));
        list
    }

    /// Bump the usage counter after a worker reported applying a
    /// preference via a `[Used preference: KEY]` marker.
    pub async fn increment_usage(&self, agent_id: Uuid, key: &str) {
        self.ensure_loaded(agent_id).await;
        let found = {
            let mut prefs = self.prefs.write().await;
            match prefs
                .entry(agent_id)
                .or_default()
                .iter_mut()
                .find(|p| p.key.eq_ignore_ascii_case(key))
            {
                Some(pref) => {
                    pref.mark_used();
                    true
                }
                None => false,
            }
        };
        if found {
            self.persist(agent_id).await;
        } else {
            tracing::debug!(agent_id = %agent_id, key, "usage marker for unknown preference");
        }
    }

    /// Drop all of an agent's preferences (fire cascade).
    pub async fn clear_agent(&self, agent_id: Uuid) {
        self.prefs.write().await.remove(&agent_id);
        // On-disk data is removed by the store's clear_agent_data.
    }

    /// Render the agent's preferences as a compact newline list for
    /// injection into prompts. Empty string when none exist.
    pub async fn build_preference_context(&self, agent_id: Uuid) -> String {
        let prefs = self.list(agent_id).await;
        if prefs.is_empty() {
            return String::new();
        }
        prefs
            .iter()
            .map(|p| format!("- [{}] {}: {}", p.category, p.key, p.value))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Build the oracle prompt that extracts new preferences from the
    /// operator's latest reply.
    pub async fn build_extraction_prompt(
        &self,
        agent_id: Uuid,
        user_message: &str,
        agent_message: &str,
        context: &str,
    ) -> String {
        let known = self.build_preference_context(agent_id).await;
        let known = if known.is_empty() {
            "None yet".to_string()
        } else {
            known
        };

        format!(
            r#"You maintain a profile of an operator's durable working preferences.

## Latest exchange
Agent asked: {agent_message}
Operator replied: {user_message}

## Context
{context}

## Known preferences
{known}

## Instructions
Identify durable preferences revealed by the operator's reply: tool and
library choices, style rules, infrastructure decisions, communication
preferences. Ignore one-off instructions that only apply to the current
step. Confidence levels: "explicit" when the operator stated it
outright, "inferred" when it clearly follows from the reply, "assumed"
when it is a plausible default.

## Required output format (JSON)
{{
  "preferences": [
    {{
      "category": "short category",
      "key": "snake_case_key",
      "value": "the preferred choice",
      "confidence": "assumed|inferred|explicit"
    }}
  ]
}}

If the reply reveals nothing durable, output {{"preferences": []}}.
IMPORTANT: Output ONLY the JSON object, no other text."#
        )
    }

    /// Parse an extraction reply and upsert each preference found.
    /// Tolerates prose and fenced code around the JSON. Returns the
    /// number of preferences stored.
    pub async fn parse_and_store_extraction(
        &self,
        agent_id: Uuid,
        oracle_response: &str,
        source: &str,
    ) -> usize {
        let Some(value) = lenient_json::extract_object(oracle_response) else {
            tracing::debug!(agent_id = %agent_id, "no JSON in preference extraction reply");
            return 0;
        };
        let Some(items) = value.get("preferences").and_then(|v| v.as_array()) else {
            return 0;
        };

        let mut stored = 0;
        for item in items {
            let Some(key) = item.get("key").and_then(|v| v.as_str()) else {
                continue;
            };
            let category = item
                .get("category")
                .and_then(|v| v.as_str())
                .unwrap_or("general");
            let value_text = item.get("value").and_then(|v| v.as_str()).unwrap_or_default();
            let confidence = item
                .get("confidence")
                .and_then(|v| v.as_str())
                .and_then(Confidence::from_str)
                .unwrap_or(Confidence::Inferred);

            match self
                .add_preference(agent_id, category, key, value_text, source, confidence)
                .await
            {
                Ok(true) => stored += 1,
                Ok(false) => {}
                Err(e) => tracing::debug!(error = %e, "skipped malformed preference"),
            }
        }
        stored
    }

    async fn persist(&self, agent_id: Uuid) {
        let snapshot = {
            let prefs = self.prefs.read().await;
            prefs.get(&agent_id).cloned().unwrap_or_default()
        };
        if let Err(e) = self.store.save_preferences(agent_id, &snapshot).await {
            tracing::warn!(agent_id = %agent_id, error = %e, "failed to persist preferences");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::store::InMemoryStateStore;
    use proptest::prelude::*;

    fn manager() -> PreferenceManager {
        PreferenceManager::new(Arc::new(InMemoryStateStore::new()), Arc::new(EventBus::default()))
    }

    #[tokio::test]
    async fn test_upsert_respects_confidence_order() {
        let manager = manager();
        let agent_id = Uuid::new_v4();

        assert!(manager
            .add_preference(agent_id, "db", "driver", "MySQL", "guess", Confidence::Inferred)
            .await
            .unwrap());

        // Lower confidence rejected.
        assert!(!manager
            .add_preference(agent_id, "db", "driver", "SQLite", "guess", Confidence::Assumed)
            .await
            .unwrap());

        // Equal confidence overwrites.
        assert!(manager
            .add_preference(agent_id, "db", "driver", "MariaDB", "guess", Confidence::Inferred)
            .await
            .unwrap());

        // Higher confidence overwrites.
        assert!(manager
            .add_preference(agent_id, "db", "driver", "Postgres", "reply", Confidence::Explicit)
            .await
            .unwrap());

        let prefs = manager.list(agent_id).await;
        assert_eq!(prefs.len(), 1);
        assert_eq!(prefs[0].value, "Postgres");
        assert_eq!(prefs[0].confidence, Confidence::Explicit);
    }

    #[tokio::test]
    async fn test_preference_context_rendering() {
        let manager = manager();
        let agent_id = Uuid::new_v4();
        assert_eq!(manager.build_preference_context(agent_id).await, "");

        manager
            .add_preference(agent_id, "db", "driver", "Postgres", "reply", Confidence::Explicit)
            .await
            .unwrap();
        manager
            .add_preference(agent_id, "style", "commit_style", "conventional", "reply", Confidence::Inferred)
            .await
            .unwrap();

        let context = manager.build_preference_context(agent_id).await;
        assert!(context.contains("- [db] driver: Postgres"));
        assert!(context.contains("- [style] commit_style: conventional"));
    }

    #[tokio::test]
    async fn test_extraction_tolerates_prose_and_fences() {
        let manager = manager();
        let agent_id = Uuid::new_v4();

        let response = r#"Sure, here is what I learned:
```json
{"preferences": [
  {"category": "db", "key": "db_driver", "value": "Postgres", "confidence": "explicit"},
  {"category": "style", "key": "error_style", "value": "thiserror", "confidence": "inferred"}
]}
```
Hope that helps!"#;

        let stored = manager
            .parse_and_store_extraction(agent_id, response, "reply")
            .await;
        assert_eq!(stored, 2);
        assert_eq!(manager.list(agent_id).await.len(), 2);
    }

    #[tokio::test]
    async fn test_extraction_handles_garbage() {
        let manager = manager();
        let agent_id = Uuid::new_v4();
        assert_eq!(
            manager
                .parse_and_store_extraction(agent_id, "no json at all", "reply")
                .await,
            0
        );
        assert_eq!(
            manager
                .parse_and_store_extraction(agent_id, r#"{"preferences": "oops"}"#, "reply")
                .await,
            0
        );
    }

    #[tokio::test]
    async fn test_increment_usage() {
        let manager = manager();
        let agent_id = Uuid::new_v4();
        manager
            .add_preference(agent_id, "db", "db_driver", "Postgres", "reply", Confidence::Explicit)
            .await
            .unwrap();

        manager.increment_usage(agent_id, "db_driver").await;
        manager.increment_usage(agent_id, "DB_DRIVER").await;
        manager.increment_usage(agent_id, "unknown_key").await;

        let prefs = manager.list(agent_id).await;
        assert_eq!(prefs[0].used_count, 2);
        assert!(prefs[0].last_used_at.is_some());
    }

    #[tokio::test]
    async fn test_remove_preference() {
        let manager = manager();
        let agent_id = Uuid::new_v4();
        manager
            .add_preference(agent_id, "db", "driver", "Postgres", "reply", Confidence::Explicit)
            .await
            .unwrap();
        assert!(manager.remove_preference(agent_id, "driver").await);
        assert!(!manager.remove_preference(agent_id, "driver").await);
        assert!(manager.list(agent_id).await.is_empty());
    }

    proptest! {
        #[test]
        fn prop_confidence_never_lowered(
            first in 0usize..3,
            second in 0usize..3,
        ) {
            let order = [Confidence::Assumed, Confidence::Inferred, Confidence::Explicit];
            let (first, second) = (order[first], order[second]);

            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("runtime");
            rt.block_on(async {
                let manager = manager();
                let agent_id = Uuid::new_v4();
                manager
                    .add_preference(agent_id, "c", "k", "v1", "s", first)
                    .await
                    .unwrap();
                let _ = manager
                    .add_preference(agent_id, "c", "k", "v2", "s", second)
                    .await
                    .unwrap();
                let stored = manager.list(agent_id).await;
                assert!(stored[0].confidence >= first);
            });
        }
    }
}
