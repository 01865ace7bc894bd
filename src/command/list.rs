use anyhow::Result;
use tabled::{
    Table, Tabled,
    settings::{Padding, Style, object::Columns},
};

use crate::command::Context;
use crate::docker::discovery::{self, DiscoveredContainer};
use crate::state::LedgerEntry;
use crate::state::ledger::now_unix;

#[derive(Tabled)]
struct InstrumentedRow {
    #[tabled(rename = "CONTAINER")]
    name: String,
    #[tabled(rename = "IMAGE")]
    image: String,
    #[tabled(rename = "INSTRUMENTED")]
    age: String,
    #[tabled(rename = "COMPOSE")]
    compose: String,
    #[tabled(rename = "RESTORE")]
    restore: String,
}

#[derive(Tabled)]
struct DiscoveredRow {
    #[tabled(rename = "CONTAINER")]
    name: String,
    #[tabled(rename = "IMAGE")]
    image: String,
    #[tabled(rename = "COMPOSE")]
    compose: String,
    #[tabled(rename = "INSTRUMENTED")]
    instrumented: String,
}

/// Coarse "how long ago" for a unix timestamp.
fn format_age(then: u64, now: u64) -> String {
    let secs = now.saturating_sub(then);
    match secs {
        0..60 => "just now".to_string(),
        60..3600 => format!("{}m ago", secs / 60),
        3600..86400 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86400),
    }
}

fn instrumented_row(entry: &LedgerEntry, now: u64) -> InstrumentedRow {
    let restore = if entry.is_compose() {
        "backup"
    } else if entry.has_restore_command() {
        "command"
    } else {
        "manual"
    };
    InstrumentedRow {
        name: entry.container_name.clone(),
        image: entry.image.clone(),
        age: format_age(entry.instrumented_at, now),
        compose: entry
            .compose_service
            .clone()
            .unwrap_or_else(|| "-".to_string()),
        restore: restore.to_string(),
    }
}

fn discovered_row(container: DiscoveredContainer) -> DiscoveredRow {
    DiscoveredRow {
        name: container.name,
        image: container.image,
        compose: container.compose_service.unwrap_or_else(|| "-".to_string()),
        instrumented: if container.instrumented { "yes" } else { "no" }.to_string(),
    }
}

fn print_table<T: Tabled>(rows: Vec<T>, columns: usize) {
    let mut table = Table::new(rows);
    table
        .with(Style::blank())
        .modify(Columns::new(0..columns), Padding::new(0, 1, 0, 0));
    println!("{table}");
}

pub fn run(ctx: &Context, discovered: bool) -> Result<()> {
    let ledger = ctx.ledger();

    if discovered {
        let found = discovery::discover(&ctx.runtime(), &ledger)?;
        if found.is_empty() {
            println!("No Java containers found");
            return Ok(());
        }
        print_table(found.into_iter().map(discovered_row).collect::<Vec<_>>(), 4);
        return Ok(());
    }

    let entries = ledger.list()?;
    if entries.is_empty() {
        println!("No instrumented containers");
        return Ok(());
    }
    let now = now_unix();
    print_table(
        entries
            .iter()
            .map(|e| instrumented_row(e, now))
            .collect::<Vec<_>>(),
        5,
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ledger::tests::entry;

    #[test]
    fn ages_are_coarse() {
        assert_eq!(format_age(100, 130), "just now");
        assert_eq!(format_age(0, 600), "10m ago");
        assert_eq!(format_age(0, 7200), "2h ago");
        assert_eq!(format_age(0, 3 * 86400 + 5), "3d ago");
        // clock skew
        assert_eq!(format_age(500, 100), "just now");
    }

    #[test]
    fn restore_column_reflects_entry_kind() {
        let plain = entry("orders");
        assert_eq!(instrumented_row(&plain, plain.instrumented_at).restore, "command");

        let mut degraded = entry("legacy");
        degraded.recreation_command = None;
        assert_eq!(instrumented_row(&degraded, 0).restore, "manual");

        let mut compose = entry("shop-api-1");
        compose.compose_file = Some("/srv/shop/compose.yaml".into());
        compose.compose_service = Some("api".into());
        let row = instrumented_row(&compose, 0);
        assert_eq!(row.restore, "backup");
        assert_eq!(row.compose, "api");
    }
}
