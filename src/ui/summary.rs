use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL_CONDENSED;
use comfy_table::{Cell, CellAlignment, Color, ContentArrangement, Table};
use is_terminal::IsTerminal;
use owo_colors::OwoColorize;

use crate::registry::{Service, ServiceStatus};
use crate::supervisor::Outcome;

fn status_cell(status: ServiceStatus, use_color: bool) -> Cell {
    let cell = Cell::new(status.as_str()).set_alignment(CellAlignment::Center);
    if !use_color {
        return cell;
    }
    match status {
        ServiceStatus::Running => cell.fg(Color::Green),
        ServiceStatus::Stopped => cell.fg(Color::DarkGrey),
        ServiceStatus::Error => cell.fg(Color::Red),
    }
}

/// Table of services with their verified status.
pub fn services_table(services: &[Service], use_color: bool) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec![
        Cell::new("Service").set_alignment(CellAlignment::Left),
        Cell::new("ID").set_alignment(CellAlignment::Left),
        Cell::new("PID").set_alignment(CellAlignment::Right),
        Cell::new("URL").set_alignment(CellAlignment::Left),
        Cell::new("Status").set_alignment(CellAlignment::Center),
        Cell::new("Last error").set_alignment(CellAlignment::Left),
    ]);

    for svc in services {
        let url = svc
            .local_url
            .clone()
            .or_else(|| svc.port.map(|p| format!(":{}", p)))
            .unwrap_or_else(|| "-".to_string());
        let pid = svc
            .process_pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        let short_id: String = svc.id.chars().take(8).collect();
        table.add_row(vec![
            Cell::new(&svc.name),
            Cell::new(short_id),
            Cell::new(pid).set_alignment(CellAlignment::Right),
            Cell::new(url),
            status_cell(svc.status, use_color),
            Cell::new(svc.last_error.as_deref().unwrap_or("")),
        ]);
    }
    table
}

/// Print the result of the boot-time auto-start.
pub fn print_outcomes(outcomes: &[Outcome]) {
    if outcomes.is_empty() {
        return;
    }
    let use_color = std::io::stdout().is_terminal();
    println!();
    for outcome in outcomes {
        let mark = if outcome.ok { "ok" } else { "failed" };
        let detail = outcome.error.as_deref().unwrap_or("");
        if use_color {
            let mark = if outcome.ok {
                format!("{}", mark.green())
            } else {
                format!("{}", mark.red())
            };
            println!("  {:<24} {} {}", outcome.name.bold(), mark, detail.dimmed());
        } else {
            println!("  {:<24} {} {}", outcome.name, mark, detail);
        }
    }
    println!();
}
