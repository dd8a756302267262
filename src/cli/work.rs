use anyhow::{Result, bail};
use console::style;

use super::context::AppContext;
use super::{CommandArgs, format_time};
use crate::core::clock::{Clock, format_duration_ms};
use crate::core::routing::{RoutingRequest, estimate_tokens};
use crate::core::store::{
    DeferredStatus, Intent, IntentStatus, NewIntent, NewProposal, Proposal, RunStatus,
};
use crate::core::terminal::{GuideSection, print_error, print_info, print_success, print_warn};

pub(crate) fn routing_request(args: &CommandArgs) -> Result<RoutingRequest> {
    let Some(query) = args.flag("query").or(args.arg(0)) else {
        bail!("usage: switchyard route --query <text> [--category c] [--urgency u] [--tokens n] [--executor x] [--run]");
    };
    let mut request = RoutingRequest::new(query);
    if let Some(category) = args.flag("category") {
        request = request.category(category.parse()?);
    }
    if let Some(urgency) = args.flag("urgency") {
        request = request.urgency(urgency.parse()?);
    }
    if let Some(tokens) = args.flag("tokens") {
        request = request.estimated_tokens(tokens.parse()?);
    }
    if let Some(executor) = args.flag("executor") {
        request = request.force_executor(executor);
    }
    if let Some(dir) = args.flag("dir") {
        request = request.working_dir(dir);
    }
    Ok(request)
}

pub async fn run_route(ctx: &AppContext, args: &CommandArgs) -> Result<()> {
    let request = routing_request(args)?;
    let decision = ctx.router().decide(&request).await?;
    GuideSection::new("Routing decision")
        .status("Category", &request.category.to_string())
        .status("Urgency", &request.urgency.to_string())
        .status("Tokens (est.)", &request.estimated_tokens.to_string())
        .status("Executor", &style(&decision.executor).green().bold().to_string())
        .status(
            "Fallbacks",
            &if decision.fallbacks.is_empty() {
                "none".to_string()
            } else {
                decision.fallbacks.join(" → ")
            },
        )
        .status("Reason", &decision.reason)
        .status("Est. cost", &format!("${:.4}", decision.estimated_cost_usd))
        .status("Can defer", &decision.can_defer.to_string())
        .print();
    println!();

    if !args.has("run") {
        return Ok(());
    }
    let result = ctx.router().execute(&request).await?;
    let mut section = GuideSection::new("Result");
    for attempt in &result.attempts {
        section = section.status(
            &attempt.executor,
            &format!("{:?} ({})", attempt.outcome, attempt.detail),
        );
    }
    section
        .blank()
        .status("Cost", &format!("${:.4}", result.cost_usd))
        .print();
    println!("\n{}", result.output);
    if !result.success {
        print_error(&format!(
            "No executor succeeded (exit {}{})",
            result.exit_code,
            if result.exhausted { ", exhausted" } else { "" }
        ));
    }
    Ok(())
}

fn print_intents(title: &str, intents: &[Intent]) {
    let mut section = GuideSection::new(title);
    if intents.is_empty() {
        section = section.text("Nothing here.");
    }
    for intent in intents {
        section = section.status(
            &intent.id,
            &format!(
                "[{}] {} ({}, created {})",
                intent.status,
                intent.title,
                intent.priority,
                format_time(intent.created_at)
            ),
        );
    }
    section.print();
    println!();
}

pub async fn run_intent(ctx: &AppContext, args: &CommandArgs) -> Result<()> {
    let runtime = &ctx.runtime;
    match args.arg(0) {
        Some("add") => {
            let Some(title) = args.arg(1) else {
                bail!("usage: switchyard intent add <title> [--query q] [--type t] [--priority p] [--executor x] [--dir d] [--in-minutes n]");
            };
            let scheduled_for = match args.flag("in-minutes") {
                Some(raw) => {
                    let minutes: i64 = raw.parse()?;
                    Some(runtime.router().clock().epoch_ms() + minutes * 60_000)
                }
                None => None,
            };
            let priority = match args.flag("priority") {
                Some(raw) => Some(raw.parse()?),
                None => None,
            };
            let intent = runtime
                .create_intent(NewIntent {
                    title: title.to_string(),
                    query: args.flag("query").unwrap_or_default().to_string(),
                    intent_type: args.flag("type").unwrap_or_default().to_string(),
                    priority,
                    scheduled_for,
                    executor_preference: args.flag("executor").map(str::to_string),
                    working_dir: args.flag("dir").map(str::to_string),
                    ..Default::default()
                })
                .await?;
            print_success(&format!(
                "Intent {} queued (~{} tokens)",
                intent.id,
                estimate_tokens(&intent.query)
            ));
        }
        Some("run") => {
            let Some(id) = args.arg(1) else {
                bail!("usage: switchyard intent run <id>");
            };
            match runtime.execute_intent(id).await? {
                Some(outcome) if outcome.status == RunStatus::Completed => print_success(
                    &format!("Completed on {}", outcome.executor.unwrap_or_default()),
                ),
                Some(outcome) => print_error(&format!(
                    "Run {} ended {}{}",
                    outcome.run_id,
                    outcome.status,
                    if outcome.exhausted { " (all executors exhausted)" } else { "" }
                )),
                None => print_warn("Intent was not started (not pending, or already running)."),
            }
        }
        Some("runs") => {
            let Some(id) = args.arg(1) else {
                bail!("usage: switchyard intent runs <id>");
            };
            let mut section = GuideSection::new(&format!("Runs of {}", id));
            for run in runtime.intent_runs(id).await? {
                let took = run
                    .finished_at
                    .map(|end| format_duration_ms(end - run.started_at))
                    .unwrap_or_else(|| "running".to_string());
                section = section.status(
                    &format!("#{}", run.attempt),
                    &format!(
                        "{} on {} exit={} ({}){}",
                        run.status,
                        run.executor.as_deref().unwrap_or("-"),
                        run.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".into()),
                        took,
                        if run.exhausted { " exhausted" } else { "" }
                    ),
                );
            }
            section.print();
            println!();
        }
        Some("retry") => {
            let Some(id) = args.arg(1) else {
                bail!("usage: switchyard intent retry <id>");
            };
            runtime.retry_intent(id).await?;
            print_success(&format!("Intent {} is pending again", id));
        }
        Some("cancel") => {
            let Some(id) = args.arg(1) else {
                bail!("usage: switchyard intent cancel <id>");
            };
            runtime.cancel_intent(id).await?;
            print_success(&format!("Intent {} cancelled", id));
        }
        Some("list") | None => {
            let status: Option<IntentStatus> = match args.flag("status") {
                Some(raw) => Some(raw.parse()?),
                None => None,
            };
            print_intents("Intents", &runtime.list_intents(status).await?);
        }
        Some(other) => bail!("unknown intent command '{}'", other),
    }
    Ok(())
}

fn print_proposals(title: &str, proposals: &[Proposal]) {
    let mut section = GuideSection::new(title);
    if proposals.is_empty() {
        section = section.text("Nothing waiting for a decision.");
    }
    for proposal in proposals {
        section = section.status(
            &proposal.id,
            &format!("[{}] {} ({})", proposal.stage, proposal.title, proposal.approval_status),
        );
    }
    section.print();
    println!();
}

pub async fn run_proposal(ctx: &AppContext, args: &CommandArgs) -> Result<()> {
    let runtime = &ctx.runtime;
    match args.arg(0) {
        Some("add") => {
            let Some(title) = args.arg(1) else {
                bail!("usage: switchyard proposal add <title> [--summary s] [--content c] [--type t]");
            };
            let proposal = runtime
                .create_proposal(NewProposal {
                    title: title.to_string(),
                    summary: args.flag("summary").unwrap_or_default().to_string(),
                    content: args.flag("content").unwrap_or_default().to_string(),
                    proposal_type: args.flag("type").unwrap_or_default().to_string(),
                    source: Some("cli".to_string()),
                    ..Default::default()
                })
                .await?;
            print_success(&format!("Proposal {} created", proposal.id));
        }
        Some("approve") => {
            let Some(id) = args.arg(1) else {
                bail!("usage: switchyard proposal approve <id>");
            };
            let outcome = runtime.approve_proposal(id).await?;
            print_success(&format!("Proposal is now at {}", outcome.proposal.stage));
            if let Some(intent) = outcome.intent {
                print_info(&format!("Created intent {}", intent.id));
            }
        }
        Some("reject") => {
            let Some(id) = args.arg(1) else {
                bail!("usage: switchyard proposal reject <id> [--reason r]");
            };
            let reason = args.flag("reason").filter(|r| !r.is_empty());
            runtime.reject_proposal(id, reason).await?;
            print_success(&format!("Proposal {} rejected", id));
        }
        Some("snooze") => {
            let Some(id) = args.arg(1) else {
                bail!("usage: switchyard proposal snooze <id> [--minutes n]");
            };
            let minutes: i64 = args.flag("minutes").unwrap_or("1440").parse()?;
            let until = runtime.router().clock().epoch_ms() + minutes * 60_000;
            runtime.snooze_proposal(id, until).await?;
            print_success(&format!("Proposal {} snoozed until {}", id, format_time(until)));
        }
        Some("list") | None => {
            if args.has("all") {
                print_proposals("Proposals", &runtime.store().list_proposals().await?);
            } else {
                print_proposals("Open proposals", &runtime.list_open_proposals().await?);
            }
        }
        Some(other) => bail!("unknown proposal command '{}'", other),
    }
    Ok(())
}

pub async fn run_deferred(ctx: &AppContext, args: &CommandArgs) -> Result<()> {
    let router = ctx.router();
    match args.arg(0) {
        Some("process") => {
            let report = ctx.runtime.process_deferred().await?;
            print_success(&format!(
                "Processed {}: {} succeeded, {} failed, {} dropped, {} removed",
                report.processed, report.succeeded, report.failed, report.dropped, report.removed
            ));
        }
        Some("remove") => {
            let Some(id) = args.arg(1) else {
                bail!("usage: switchyard deferred remove <id>");
            };
            if !router.deferral().remove(id).await? {
                bail!("no deferred task with id {}", id);
            }
            print_success(&format!("Deferred task {} removed", id));
        }
        Some("list") | None => {
            let status: Option<DeferredStatus> = match args.flag("status") {
                Some(raw) => Some(raw.parse()?),
                None => Some(DeferredStatus::Pending),
            };
            let tasks = router.deferral().list(status).await?;
            let mut section = GuideSection::new("Deferred tasks");
            if tasks.is_empty() {
                section = section.text("Queue is empty.");
            }
            for task in tasks {
                let preview: String = task.request.query.chars().take(60).collect();
                section = section.status(
                    &task.id,
                    &format!(
                        "{} due {} attempts={} → {}",
                        preview,
                        format_time(task.scheduled_for),
                        task.attempts,
                        task.decision.executor
                    ),
                );
            }
            section.print();
            println!();
        }
        Some(other) => bail!("unknown deferred command '{}'", other),
    }
    Ok(())
}
