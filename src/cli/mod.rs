mod context;
mod daemon;
mod pools;
mod work;

use anyhow::Result;
use console::style;
use std::collections::HashMap;

use crate::core::terminal::{self, GuideSection, print_error};
use crate::logging;

use context::AppContext;

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Runtime")
        .command("daemon", "Run the dispatch loops in the foreground")
        .command("logs", "Follow the daemon log")
        .command("status", "Show account pools and queue depth")
        .print();

    GuideSection::new("Executors")
        .command("accounts", "List, add, enable or disable executor accounts")
        .command("reset-cooldowns", "Clear cooldowns for one executor's accounts")
        .command("costs", "Show spend for a day and the last week")
        .command("route", "Show (or run) the routing decision for a query")
        .print();

    GuideSection::new("Work")
        .command("intent", "add | list | run | runs | retry | cancel")
        .command("proposal", "add | list | approve | reject | snooze")
        .command("deferred", "list | process | remove")
        .print();

    println!(
        "\n {} {} <command> [subcommand]\n",
        style("Usage:").bold(),
        style("switchyard").green()
    );
}

/// Positional arguments and `--flag value` pairs after `start`.
/// Flags listed in `switches` take no value.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct CommandArgs {
    pub positional: Vec<String>,
    pub flags: HashMap<String, String>,
}

impl CommandArgs {
    pub fn flag(&self, name: &str) -> Option<&str> {
        self.flags.get(name).map(String::as_str)
    }

    pub fn has(&self, name: &str) -> bool {
        self.flags.contains_key(name)
    }

    pub fn arg(&self, idx: usize) -> Option<&str> {
        self.positional.get(idx).map(String::as_str)
    }
}

pub(crate) fn parse_command_args(args: &[String], start: usize, switches: &[&str]) -> CommandArgs {
    let mut parsed = CommandArgs::default();
    let mut i = start;
    while i < args.len() {
        let arg = &args[i];
        match arg.strip_prefix("--") {
            Some(name) if switches.contains(&name) => {
                parsed.flags.insert(name.to_string(), String::new());
                i += 1;
            }
            Some(name) => {
                if i + 1 < args.len() {
                    parsed.flags.insert(name.to_string(), args[i + 1].clone());
                    i += 2;
                } else {
                    parsed.flags.insert(name.to_string(), String::new());
                    i += 1;
                }
            }
            None => {
                parsed.positional.push(arg.clone());
                i += 1;
            }
        }
    }
    parsed
}

/// Epoch milliseconds as local wall-clock time.
pub(crate) fn format_time(epoch_ms: i64) -> String {
    match chrono::DateTime::from_timestamp_millis(epoch_ms) {
        Some(utc) => utc
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M")
            .to_string(),
        None => epoch_ms.to_string(),
    }
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let Some(cmd) = args.get(1).map(String::as_str) else {
        print_help();
        return Ok(());
    };

    match cmd {
        "daemon" | "daemon-run" => return daemon::run_daemon().await,
        "logs" => return daemon::follow_logs(&AppContext::run_dir()).await,
        "help" | "--help" | "-h" => {
            print_help();
            return Ok(());
        }
        _ => {}
    }

    let config = AppContext::load_config()?;
    logging::init("warn", None, false)?;
    let ctx = AppContext::open(config).await?;
    match cmd {
        "status" => pools::run_status(&ctx, &parse_command_args(&args, 2, &[])).await,
        "accounts" => pools::run_accounts(&ctx, &parse_command_args(&args, 2, &[])).await,
        "reset-cooldowns" => {
            pools::run_reset_cooldowns(&ctx, &parse_command_args(&args, 2, &[])).await
        }
        "costs" => pools::run_costs(&ctx, &parse_command_args(&args, 2, &[])).await,
        "route" => work::run_route(&ctx, &parse_command_args(&args, 2, &["run"])).await,
        "intent" | "intents" => work::run_intent(&ctx, &parse_command_args(&args, 2, &[])).await,
        "proposal" | "proposals" => {
            work::run_proposal(&ctx, &parse_command_args(&args, 2, &["all"])).await
        }
        "deferred" => work::run_deferred(&ctx, &parse_command_args(&args, 2, &[])).await,
        _ => {
            print_error(&format!("Unknown command: {}", cmd));
            print_help();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::parse_command_args;

    fn argv(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_command_args_splits_positionals_and_flags() {
        let args = argv(&[
            "switchyard",
            "intent",
            "add",
            "Weekly digest",
            "--priority",
            "high",
            "--query",
            "summarize merged PRs",
        ]);
        let parsed = parse_command_args(&args, 2, &[]);
        assert_eq!(parsed.arg(0), Some("add"));
        assert_eq!(parsed.arg(1), Some("Weekly digest"));
        assert_eq!(parsed.flag("priority"), Some("high"));
        assert_eq!(parsed.flag("query"), Some("summarize merged PRs"));
        assert_eq!(parsed.flag("type"), None);
    }

    #[test]
    fn switches_take_no_value() {
        let args = argv(&["switchyard", "route", "--run", "--query", "hi"]);
        let parsed = parse_command_args(&args, 2, &["run"]);
        assert!(parsed.has("run"));
        assert_eq!(parsed.flag("query"), Some("hi"));
        assert!(parsed.positional.is_empty());
    }

    #[test]
    fn trailing_flag_without_value_is_present_but_empty() {
        let args = argv(&["switchyard", "proposal", "reject", "p-1", "--reason"]);
        let parsed = parse_command_args(&args, 2, &[]);
        assert_eq!(parsed.positional, vec!["reject", "p-1"]);
        assert_eq!(parsed.flag("reason"), Some(""));
    }
}
