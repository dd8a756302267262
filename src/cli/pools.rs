use anyhow::{Result, bail};
use console::style;

use super::context::AppContext;
use super::{CommandArgs, format_time};
use crate::core::clock::{Clock, date_bucket, format_duration_ms};
use crate::core::store::{AccountStatus, DeferredStatus, IntentStatus};
use crate::core::terminal::{GuideSection, print_info, print_success};

/// Executors worth reporting on: registered adapters plus anything with accounts.
async fn known_executors(ctx: &AppContext) -> Result<Vec<String>> {
    let mut names = ctx.router().executors().names();
    for account in ctx.router().accounts().list_accounts(None).await? {
        if !names.contains(&account.executor) {
            names.push(account.executor);
        }
    }
    names.sort();
    Ok(names)
}

pub async fn run_status(ctx: &AppContext, args: &CommandArgs) -> Result<()> {
    let executors = match args.arg(0) {
        Some(executor) => vec![executor.to_string()],
        None => known_executors(ctx).await?,
    };
    let router = ctx.router();

    let mut pools = GuideSection::new("Executors");
    for executor in &executors {
        let status = router.accounts().get_pool_status(executor).await?;
        let rate = if router.costs().is_free(executor) {
            style("free").green().to_string()
        } else {
            style("metered").yellow().to_string()
        };
        let line = if status.total == 0 {
            format!("{} (no accounts)", rate)
        } else {
            let mut line = format!("{} {}/{} available", rate, status.available, status.total);
            if let Some(ms) = status.next_available_in_ms {
                line.push_str(&format!(", next in {}", format_duration_ms(ms)));
            }
            line
        };
        pools = pools.status(executor, &line);
    }
    pools.print();

    let store = ctx.runtime.store();
    let pending = store.list_intents(Some(IntentStatus::Pending)).await?.len();
    let running = store.list_intents(Some(IntentStatus::Running)).await?.len();
    let failed = store.list_intents(Some(IntentStatus::Failed)).await?.len();
    let deferred = router.deferral().list(Some(DeferredStatus::Pending)).await?.len();
    let today = router.costs().get_daily_cost(None).await?;
    GuideSection::new("Queues")
        .status("Intents", &format!("{} pending, {} running, {} failed", pending, running, failed))
        .status("Deferred", &deferred.to_string())
        .status("Spend today", &format!("${:.4}", today))
        .print();
    println!();
    Ok(())
}

pub async fn run_accounts(ctx: &AppContext, args: &CommandArgs) -> Result<()> {
    let pool = ctx.router().accounts();
    match args.arg(0) {
        Some("add") => {
            let (Some(executor), Some(identity)) = (args.arg(1), args.arg(2)) else {
                bail!("usage: switchyard accounts add <executor> <identity> [--limit <tokens>]");
            };
            let limit = match args.flag("limit") {
                Some(raw) => Some(raw.parse::<i64>()?),
                None => None,
            };
            let id = pool.upsert_account(executor, identity, limit).await?;
            print_success(&format!("Account {} saved for {} (id {})", identity, executor, id));
        }
        Some(action @ ("enable" | "disable")) => {
            let Some(id) = args.arg(1) else {
                bail!("usage: switchyard accounts {} <id>", action);
            };
            let status = if action == "enable" {
                AccountStatus::Active
            } else {
                AccountStatus::Disabled
            };
            if !ctx.runtime.store().set_account_status(id.parse()?, status).await? {
                bail!("no account with id {}", id);
            }
            print_success(&format!("Account {} is now {}", id, status));
        }
        filter => {
            let accounts = pool.list_accounts(filter).await?;
            if accounts.is_empty() {
                print_info("No accounts registered.");
                return Ok(());
            }
            let now = ctx.router().clock().epoch_ms();
            let mut section = GuideSection::new("Accounts");
            for account in accounts {
                let mut line = format!(
                    "{} {} failures={} tokens={}",
                    account.executor, account.status, account.consecutive_failures, account.tokens_used_today
                );
                if let Some(limit) = account.daily_token_limit {
                    line.push_str(&format!("/{}", limit));
                }
                if let Some(until) = account.cooldown_until
                    && until > now
                {
                    line.push_str(&format!(" cooldown {}", format_duration_ms(until - now)));
                }
                if let Some(used) = account.last_used_at {
                    line.push_str(&format!(" last used {}", format_time(used)));
                }
                section = section.status(&format!("#{} {}", account.id, account.identity), &line);
            }
            section.print();
            println!();
        }
    }
    Ok(())
}

pub async fn run_reset_cooldowns(ctx: &AppContext, args: &CommandArgs) -> Result<()> {
    let Some(executor) = args.arg(0) else {
        bail!("usage: switchyard reset-cooldowns <executor>");
    };
    let count = ctx.router().accounts().reset_all_cooldowns(executor).await?;
    print_success(&format!("Reset {} {} accounts", count, executor));
    Ok(())
}

pub async fn run_costs(ctx: &AppContext, args: &CommandArgs) -> Result<()> {
    let costs = ctx.router().costs();
    let date = args
        .arg(0)
        .map(str::to_string)
        .unwrap_or_else(|| date_bucket(ctx.router().clock().epoch_ms()));

    let summary = costs.get_daily_summary(Some(&date)).await?;
    let mut day = GuideSection::new(&format!("Spend on {}", date));
    if summary.is_empty() {
        day = day.text("No executor calls recorded.");
    }
    for row in &summary {
        day = day.status(
            &row.executor,
            &format!(
                "{} calls, {} in / {} out tokens, ${:.4}",
                row.calls, row.input_tokens, row.output_tokens, row.cost_usd
            ),
        );
    }
    day.print();

    let mut week = GuideSection::new("Last 7 days");
    let mut total = 0.0;
    for day in costs.get_weekly_costs().await? {
        total += day.cost_usd;
        week = week.status(&day.date, &format!("{} calls, ${:.4}", day.calls, day.cost_usd));
    }
    week.blank().status("Total", &format!("${:.4}", total)).print();
    println!();
    Ok(())
}
