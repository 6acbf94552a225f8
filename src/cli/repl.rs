//! Interactive command loop.
//!
//! Each command maps onto one or more core operations. Agents are
//! addressed by name. A background task prints notable engine events
//! (questions, permission requests, step transitions) as they happen.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use console::style;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::domain::models::{Agent, AgentGoal, AgentTrigger};
use crate::domain::ports::store::{LogRange, StateStore};
use crate::services::{
    Adversary, AgentManager, Bridge, EngineEvent, EnginePayload, EventBus, GoalManager,
    PreferenceManager, TaskManager, TriggerScheduler, WorkspaceRegistry,
};

use super::display;

/// Everything the REPL needs to drive the engine.
pub struct ReplContext {
    pub agents: Arc<AgentManager>,
    pub tasks: Arc<TaskManager>,
    pub goals: Arc<GoalManager>,
    pub preferences: Arc<PreferenceManager>,
    pub workspace: Arc<WorkspaceRegistry>,
    pub bridge: Arc<Bridge>,
    pub adversary: Arc<Adversary>,
    pub scheduler: Arc<TriggerScheduler>,
    pub store: Arc<dyn StateStore>,
    pub bus: Arc<EventBus>,
}

const HELP: &str = "\
Commands:
  hire [name]                    Hire an agent
  fire <agent>                   Fire an agent (cascades everything)
  agents | tasks                 Listings
  goals [agent]                  List goals
  plan <agent>                   Show the agent's current plan
  prefs <agent>                  Show learned preferences
  assign <agent> <description>   One-off worker dispatch
  goal <agent> [--dir <path>] <description>
  constrain <agent> <text>       Add a constraint to the active goal
  chdir <agent> <path>           Change the active goal's directory
  wake <agent> | pause <agent>   Drive the orchestration loop
  reply <agent> <answer>         Answer a blocked step
  talk <agent> <message>         Chat with an agent (no worker)
  approve <agent> <tool>         Grant a denied tool permission
  deny <agent>                   Refuse the pending permissions
  schedule <agent> <minutes>     Interval trigger on the active goal
  unschedule <agent>             Remove the agent's triggers
  prompt <agent> <text>          Set the agent's system prompt
  forget <agent> <key>           Drop a learned preference
  workspace [add|remove|list] [path]
  log <agent> [n]                Recent observability events
  quit | exit";

/// Run the REPL until quit or EOF.
pub async fn run(ctx: ReplContext) -> Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    ensure_workspace_roots(&ctx, &mut lines).await?;
    let printer = spawn_event_printer(ctx.bus.clone());

    println!("{}", style("workfarm ready. Type 'help' for commands.").dim());
    loop {
        print!("{} ", style("workfarm>").cyan());
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match handle_command(&ctx, line).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => println!("{} {e:#}", style("error:").red()),
        }
    }

    printer.abort();
    Ok(())
}

/// The engine needs at least one workspace root before anything runs.
async fn ensure_workspace_roots(
    ctx: &ReplContext,
    lines: &mut tokio::io::Lines<BufReader<tokio::io::Stdin>>,
) -> Result<()> {
    while ctx.workspace.roots().await.is_empty() {
        print!("Enter a workspace root path: ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            bail!("no workspace root configured");
        };
        let path = line.trim();
        if !path.is_empty() {
            ctx.workspace.add_root(PathBuf::from(path)).await;
        }
    }
    Ok(())
}

fn spawn_event_printer(bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => break,
            };
            if let Some(line) = render_event(&event) {
                println!("\n{} {line}", style("[event]").magenta());
            }
        }
    })
}

/// Lines worth interrupting the operator for.
fn render_event(event: &EngineEvent) -> Option<String> {
    match &event.payload {
        EnginePayload::QuestionRaised { question, .. } => {
            Some(format!("{} {question}", style("question:").yellow().bold()))
        }
        EnginePayload::PermissionRequested { tool_name, .. } => Some(format!(
            "{} worker wants tool {tool_name} (approve <agent> {tool_name} / deny <agent>)",
            style("permission:").yellow().bold(),
        )),
        EnginePayload::StepStarted { step_id, .. } => {
            Some(format!("step {} started", display::short_id(*step_id)))
        }
        EnginePayload::StepCompleted { step_id, .. } => {
            Some(format!("step {} completed", display::short_id(*step_id)))
        }
        EnginePayload::StepFailed { step_id, .. } => Some(format!(
            "{} step {}",
            style("failed:").red(),
            display::short_id(*step_id)
        )),
        EnginePayload::GoalStatusChanged { goal_id, from, to } => Some(format!(
            "goal {} {from} → {to}",
            display::short_id(*goal_id)
        )),
        EnginePayload::SessionEnded { status, .. } => {
            Some(format!("worker session ended ({status})"))
        }
        EnginePayload::TriggerFired { goal_id, .. } => {
            Some(format!("trigger fired for goal {}", display::short_id(*goal_id)))
        }
        EnginePayload::OracleError { context, error } => Some(format!(
            "{} {context}: {error}",
            style("oracle error:").red()
        )),
        _ => None,
    }
}

/// Dispatch one command line. Returns false to exit.
async fn handle_command(ctx: &ReplContext, line: &str) -> Result<bool> {
    let (command, rest) = split_word(line);

    match command {
        "quit" | "exit" => return Ok(false),
        "help" => println!("{HELP}"),

        "hire" => {
            let name = (!rest.is_empty()).then(|| rest.to_string());
            let agent = ctx.agents.hire(name).await?;
            println!("hired {}", style(&agent.name).green().bold());
        }
        "fire" => {
            let agent = resolve_agent(ctx, rest).await?;
            ctx.bridge.fire_agent(agent.id).await?;
            println!("fired {}", agent.name);
        }
        "agents" => println!("{}", display::agents_table(&ctx.agents.list().await)),
        "tasks" => println!("{}", display::tasks_table(&ctx.tasks.list().await)),
        "goals" => {
            let goals = if rest.is_empty() {
                ctx.goals.list_goals().await
            } else {
                let agent = resolve_agent(ctx, rest).await?;
                ctx.goals.list_goals_for_agent(agent.id).await
            };
            println!("{}", display::goals_table(&goals));
        }
        "plan" => {
            let (agent, goal) = resolve_active_goal(ctx, rest).await?;
            match ctx.goals.get_current_plan(goal.id).await {
                Some(plan) => println!("{}", display::plan_table(&plan)),
                None => println!("{} has no plan yet", agent.name),
            }
        }
        "prefs" => {
            let agent = resolve_agent(ctx, rest).await?;
            println!("{}", display::prefs_table(&ctx.preferences.list(agent.id).await));
        }

        "assign" => {
            let (name, description) = split_word(rest);
            if description.is_empty() {
                bail!("usage: assign <agent> <description>");
            }
            let agent = resolve_agent(ctx, name).await?;
            let task = ctx.tasks.create_task(description, Some(agent.id)).await;
            let dir = default_working_dir(ctx).await;
            ctx.bridge
                .dispatch_worker(agent.id, task.id, None, dir, description.to_string())
                .await?;
            println!("dispatched task {} to {}", display::short_id(task.id), agent.name);
        }

        "goal" => {
            let (name, rest) = split_word(rest);
            let agent = resolve_agent(ctx, name).await?;
            let (dir, description) = parse_goal_args(ctx, rest).await?;
            let goal = ctx.goals.create_goal(agent.id, description, dir).await?;
            println!(
                "created goal {} for {} (wake {} to start)",
                display::short_id(goal.id),
                agent.name,
                agent.name
            );
        }
        "constrain" => {
            let (name, text) = split_word(rest);
            if text.is_empty() {
                bail!("usage: constrain <agent> <text>");
            }
            let (_, goal) = resolve_active_goal(ctx, name).await?;
            ctx.goals.append_constraint(goal.id, text).await?;
            println!("constraint added");
        }
        "chdir" => {
            let (name, path) = split_word(rest);
            if path.is_empty() {
                bail!("usage: chdir <agent> <path>");
            }
            let (_, goal) = resolve_active_goal(ctx, name).await?;
            ctx.goals
                .set_working_directory(goal.id, PathBuf::from(path))
                .await?;
            println!("working directory set to {path}");
        }

        "wake" => {
            let (_, goal) = resolve_active_goal(ctx, rest).await?;
            ctx.adversary.wake(goal.id).await?;
            println!("woke goal {}", display::short_id(goal.id));
        }
        "pause" => {
            let (_, goal) = resolve_active_goal(ctx, rest).await?;
            ctx.adversary.pause(goal.id).await?;
            println!("paused goal {}", display::short_id(goal.id));
        }
        "reply" => {
            let (name, answer) = split_word(rest);
            if answer.is_empty() {
                bail!("usage: reply <agent> <answer>");
            }
            let (_, goal) = resolve_active_goal(ctx, name).await?;
            ctx.adversary.reply(goal.id, answer).await?;
            println!("reply sent; resuming step");
        }
        "talk" => {
            let (name, message) = split_word(rest);
            if message.is_empty() {
                bail!("usage: talk <agent> <message>");
            }
            let agent = resolve_agent(ctx, name).await?;
            let reply = ctx.adversary.talk(agent.id, message, None).await?;
            println!("{}: {reply}", style(&agent.name).green().bold());
        }

        "approve" => {
            let (name, tool) = split_word(rest);
            if tool.is_empty() {
                bail!("usage: approve <agent> <tool>");
            }
            let agent = resolve_agent(ctx, name).await?;
            let resumed = ctx.bridge.approve_tool_permission(agent.id, tool).await?;
            if resumed {
                println!("approved {tool}; session resumed");
            } else {
                println!("approved {tool}; other permissions still pending");
            }
        }
        "deny" => {
            let agent = resolve_agent(ctx, rest).await?;
            ctx.bridge.deny_tool_permission(agent.id).await?;
            println!("denied; session ended");
        }

        "schedule" => {
            let (name, minutes) = split_word(rest);
            let minutes: u64 = minutes
                .parse()
                .map_err(|_| anyhow::anyhow!("usage: schedule <agent> <minutes>"))?;
            if minutes == 0 {
                bail!("interval must be at least one minute");
            }
            let (agent, goal) = resolve_active_goal(ctx, name).await?;
            ctx.goals
                .add_trigger(AgentTrigger::interval(agent.id, goal.id, minutes * 60_000))
                .await;
            println!("scheduled every {minutes} minute(s)");
        }
        "unschedule" => {
            let agent = resolve_agent(ctx, rest).await?;
            let triggers = ctx.goals.triggers_for_agent(agent.id).await;
            if triggers.is_empty() {
                println!("no triggers for {}", agent.name);
            }
            for trigger in triggers {
                ctx.goals.remove_trigger(trigger.id).await?;
            }
        }

        "prompt" => {
            let (name, text) = split_word(rest);
            let agent = resolve_agent(ctx, name).await?;
            let prompt = (!text.is_empty()).then(|| text.to_string());
            ctx.agents.set_system_prompt(agent.id, prompt).await?;
            println!("system prompt updated");
        }
        "forget" => {
            let (name, key) = split_word(rest);
            if key.is_empty() {
                bail!("usage: forget <agent> <key>");
            }
            let agent = resolve_agent(ctx, name).await?;
            if ctx.preferences.remove_preference(agent.id, key).await {
                println!("forgot {key}");
            } else {
                println!("no preference named {key}");
            }
        }

        "workspace" => {
            let (sub, path) = split_word(rest);
            match sub {
                "" | "list" => {
                    let roots = ctx.workspace.roots().await;
                    if roots.is_empty() {
                        println!("no workspace roots configured");
                    }
                    for root in roots {
                        println!("{}", root.display());
                    }
                }
                "add" => {
                    if path.is_empty() {
                        bail!("usage: workspace add <path>");
                    }
                    if ctx.workspace.add_root(PathBuf::from(path)).await {
                        println!("added {path}");
                    } else {
                        println!("{path} already configured");
                    }
                }
                "remove" => {
                    if path.is_empty() {
                        bail!("usage: workspace remove <path>");
                    }
                    if ctx.workspace.remove_root(std::path::Path::new(path)).await {
                        println!("removed {path}");
                    } else {
                        println!("{path} was not configured");
                    }
                }
                other => bail!("unknown workspace subcommand: {other}"),
            }
        }

        "log" => {
            let (name, count) = split_word(rest);
            let agent = resolve_agent(ctx, name).await?;
            let count: usize = if count.is_empty() {
                20
            } else {
                count
                    .parse()
                    .map_err(|_| anyhow::anyhow!("usage: log <agent> [n]"))?
            };
            let events = ctx
                .store
                .read_logs(agent.id, LogRange::default())
                .await
                .map_err(|e| anyhow::anyhow!("failed to read logs: {e}"))?;
            let start = events.len().saturating_sub(count);
            for event in &events[start..] {
                let timestamp = event
                    .get("timestamp")
                    .and_then(|v| v.as_str())
                    .unwrap_or("-");
                let topic = event.get("topic").and_then(|v| v.as_str()).unwrap_or("-");
                println!("{} {topic}", style(timestamp).dim());
            }
        }

        other => bail!("unknown command: {other} (try 'help')"),
    }

    Ok(true)
}

fn split_word(line: &str) -> (&str, &str) {
    match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    }
}

async fn resolve_agent(ctx: &ReplContext, name: &str) -> Result<Agent> {
    if name.is_empty() {
        bail!("an agent name is required");
    }
    match ctx.agents.find_by_name(name).await {
        Some(agent) => Ok(agent),
        None => bail!("no such agent: {name}"),
    }
}

async fn resolve_active_goal(ctx: &ReplContext, name: &str) -> Result<(Agent, AgentGoal)> {
    let agent = resolve_agent(ctx, name).await?;
    match ctx.goals.active_goal_for_agent(agent.id).await {
        Some(goal) => Ok((agent, goal)),
        None => bail!("{} has no goal (create one with: goal {} <description>)", agent.name, agent.name),
    }
}

async fn default_working_dir(ctx: &ReplContext) -> PathBuf {
    ctx.workspace
        .roots()
        .await
        .into_iter()
        .next()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
}

/// `goal` takes an optional `--dir <path>` before the description.
async fn parse_goal_args(ctx: &ReplContext, rest: &str) -> Result<(PathBuf, String)> {
    if rest.is_empty() {
        bail!("usage: goal <agent> [--dir <path>] <description>");
    }
    if let Some(after) = rest.strip_prefix("--dir") {
        let after = after.trim_start();
        let (path, description) = split_word(after);
        if path.is_empty() || description.is_empty() {
            bail!("usage: goal <agent> --dir <path> <description>");
        }
        return Ok((PathBuf::from(path), description.to_string()));
    }
    Ok((default_working_dir(ctx).await, rest.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_word() {
        assert_eq!(split_word("hire Sam"), ("hire", "Sam"));
        assert_eq!(split_word("agents"), ("agents", ""));
        assert_eq!(split_word("reply Sam use Postgres"), ("reply", "Sam use Postgres"));
    }

    #[test]
    fn test_render_event_filters_noise() {
        let event = EngineEvent::new(EnginePayload::TaskLog {
            task_id: uuid::Uuid::new_v4(),
            message: "chatter".to_string(),
        });
        assert!(render_event(&event).is_none());

        let event = EngineEvent::new(EnginePayload::QuestionRaised {
            goal_id: uuid::Uuid::new_v4(),
            step_id: uuid::Uuid::new_v4(),
            agent_id: uuid::Uuid::new_v4(),
            question: "which driver?".to_string(),
        });
        assert!(render_event(&event).unwrap().contains("which driver?"));
    }
}
