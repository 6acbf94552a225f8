//! Table rendering for REPL listings.

use comfy_table::{presets, Cell, CellAlignment, ContentArrangement, Table};
use console::style;

use crate::domain::models::{Agent, AgentGoal, AgentPlan, AgentPreference, Task};

/// Create a standard list table with the given headers.
///
/// Uses the NOTHING preset (no borders) for a clean CLI aesthetic.
fn list_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::NOTHING)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(
            headers
                .iter()
                .map(|h| Cell::new(h.to_uppercase()).set_alignment(CellAlignment::Left)),
        );
    table
}

/// Render a table with a count header.
fn render_list(entity_name: &str, table: &Table, total: usize) -> String {
    if total == 0 {
        return format!("No {entity_name}s found.");
    }
    let count_line = format!(
        "{} {}:",
        style(total).bold(),
        if total == 1 {
            entity_name.to_string()
        } else {
            format!("{entity_name}s")
        }
    );
    format!("{count_line}\n{table}")
}

pub fn short_id(id: uuid::Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

fn clip(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        let cut: String = text.chars().take(limit).collect();
        format!("{cut}…")
    }
}

pub fn agents_table(agents: &[Agent]) -> String {
    let mut table = list_table(&["name", "state", "tools", "done", "tokens"]);
    for agent in agents {
        table.add_row(vec![
            agent.name.clone(),
            agent.state.as_str().to_string(),
            agent
                .approved_tools
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(","),
            agent.tasks_completed.to_string(),
            agent.tokens_used.to_string(),
        ]);
    }
    render_list("agent", &table, agents.len())
}

pub fn tasks_table(tasks: &[Task]) -> String {
    let mut table = list_table(&["id", "status", "description", "result"]);
    for task in tasks {
        table.add_row(vec![
            short_id(task.id),
            task.status.as_str().to_string(),
            clip(&task.description, 48),
            clip(task.result.as_deref().unwrap_or("-"), 48),
        ]);
    }
    render_list("task", &table, tasks.len())
}

pub fn goals_table(goals: &[AgentGoal]) -> String {
    let mut table = list_table(&["id", "status", "directory", "description"]);
    for goal in goals {
        table.add_row(vec![
            short_id(goal.id),
            goal.status.as_str().to_string(),
            goal.working_directory.display().to_string(),
            clip(&goal.description, 56),
        ]);
    }
    render_list("goal", &table, goals.len())
}

pub fn plan_table(plan: &AgentPlan) -> String {
    let mut table = list_table(&["#", "status", "description", "question"]);
    for step in &plan.steps {
        table.add_row(vec![
            (step.order + 1).to_string(),
            step.status.as_str().to_string(),
            clip(&step.description, 56),
            clip(step.question.as_deref().unwrap_or("-"), 40),
        ]);
    }
    let header = format!(
        "Plan v{} ({}): {}",
        plan.version,
        if plan.recurring { "recurring" } else { "one-shot" },
        clip(&plan.reasoning, 80),
    );
    format!("{header}\n{table}")
}

pub fn prefs_table(prefs: &[AgentPreference]) -> String {
    let mut table = list_table(&["key", "value", "category", "confidence", "used"]);
    for pref in prefs {
        table.add_row(vec![
            pref.key.clone(),
            clip(&pref.value, 40),
            pref.category.clone(),
            pref.confidence.as_str().to_string(),
            pref.used_count.to_string(),
        ]);
    }
    render_list("preference", &table, prefs.len())
}
