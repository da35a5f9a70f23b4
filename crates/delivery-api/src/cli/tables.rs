//! Styled rendering of registry rows and service counters.

use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use delivery_core::TableKind;
use delivery_core::diagnostics::{ServiceSnapshot, SubscriptionRow};

fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(
        headers
            .iter()
            .map(|h| Cell::new(h).fg(Color::White))
            .collect::<Vec<_>>(),
    );
    table
}

/// Print one registry as a table.
pub fn print_subscriptions(kind: TableKind, rows: &[SubscriptionRow]) {
    println!(
        "  {} {}",
        style(format!("── {kind} ──")).dim(),
        style(format!("({})", rows.len())).dim()
    );
    if rows.is_empty() {
        println!("  {}", style("empty").dim());
        println!();
        return;
    }

    let mut table = new_table(&[
        "ID",
        "Matcher",
        "Owner",
        "Transport",
        "Description",
        "Calls/Found",
        "Expires In",
        "Owner C/T/S",
    ]);

    for row in rows {
        let expires = match row.expires_in_ms {
            Some(ms) if ms <= 0 => Cell::new("expired").fg(Color::Red),
            Some(ms) => Cell::new(format_ms(ms)).fg(Color::Yellow),
            None => Cell::new("never").fg(Color::DarkGrey),
        };
        table.add_row(vec![
            Cell::new(format!("#{}", row.subscription_id)).fg(Color::DarkGrey),
            Cell::new(&row.matcher).fg(Color::Cyan),
            Cell::new(&row.owner_uri).fg(Color::Magenta),
            Cell::new(row.transport_type.to_string()),
            Cell::new(row.description.as_deref().unwrap_or("-")),
            Cell::new(format!("{}/{}", row.match_call_count, row.match_found_count)),
            expires,
            Cell::new(format!(
                "{}/{}/{}",
                row.owner_common, row.owner_transactions, row.owner_sniffers
            ))
            .fg(Color::DarkGrey),
        ]);
    }

    println!("{table}");
    println!();
}

/// Print service counters, registry sizes, and per-transport counters.
pub fn print_snapshot(snapshot: &ServiceSnapshot) {
    println!("  {}", style("── Service ──").dim());
    println!("  URI:           {}", style(&snapshot.service_uri).bold());
    println!(
        "  Subscriptions: {} common, {} transactions, {} sniffers",
        style(snapshot.subscriptions_common).bold(),
        style(snapshot.subscriptions_transactions).bold(),
        style(snapshot.subscriptions_transactions_sniffers).bold()
    );
    println!();

    let mut counters = new_table(&["Counter", "Value"]);
    for (name, value) in &snapshot.counters {
        counters.add_row(vec![Cell::new(name), counter_cell(name, *value)]);
    }
    println!("{counters}");
    println!();

    println!("  {}", style("── Transports ──").dim());
    let mut transports = new_table(&["URI", "Type", "Counters"]);
    for transport in &snapshot.transports {
        let counters = transport
            .counters
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("\n");
        transports.add_row(vec![
            Cell::new(&transport.uri).fg(Color::Magenta),
            Cell::new(transport.transport_type.to_string()),
            Cell::new(if counters.is_empty() { "-".to_string() } else { counters }),
        ]);
    }
    println!("{transports}");
    println!();
}

fn counter_cell(name: &str, value: u64) -> Cell {
    if name.contains("error") && value > 0 {
        Cell::new(value).fg(Color::Red)
    } else if name.contains("dropped") && value > 0 {
        Cell::new(value).fg(Color::Yellow)
    } else {
        Cell::new(value)
    }
}

fn format_ms(ms: i64) -> String {
    if ms >= 60_000 {
        format!("{:.1}m", ms as f64 / 60_000.0)
    } else if ms >= 1_000 {
        format!("{:.1}s", ms as f64 / 1_000.0)
    } else {
        format!("{ms}ms")
    }
}
