use crate::core::clock::format_duration_ms;
use crate::core::routing::PoolStatus;
use crate::core::store::Intent;

const OUTPUT_PREVIEW_CHARS: usize = 500;

/// Plain-text alert sent once per exhaustion cooldown window.
pub fn exhaustion_alert(
    intent: &Intent,
    tried: &[&str],
    pools: &[PoolStatus],
    cooldown_ms: i64,
) -> String {
    let mut lines = vec![
        "⚠️ All executors exhausted".to_string(),
        format!("Intent: {} ({})", intent.title, intent.id),
        format!(
            "Tried: {}",
            if tried.is_empty() {
                "none".to_string()
            } else {
                tried.join(", ")
            }
        ),
    ];
    if !pools.is_empty() {
        lines.push("Pools:".to_string());
        for pool in pools {
            let mut line = format!(
                " - {}: {}/{} available",
                pool.executor, pool.available, pool.total
            );
            if let Some(ms) = pool.next_available_in_ms {
                line.push_str(&format!(", next in {}", format_duration_ms(ms)));
            }
            lines.push(line);
        }
    }
    lines.push(format!("Cooldown: {}", format_duration_ms(cooldown_ms)));
    lines.join("\n")
}

pub fn failure_alert(intent: &Intent, executor: &str, exit_code: i32, output: &str) -> String {
    let preview: String = output.chars().take(OUTPUT_PREVIEW_CHARS).collect();
    format!(
        "❌ Intent failed\nIntent: {} ({})\nExecutor: {}\nExit: {}\nOutput: {}",
        intent.title, intent.id, executor, exit_code, preview
    )
}
