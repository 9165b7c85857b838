// Output formatting and display for CLI

use crate::config::AppDescriptor;
use crate::control::AppRow;
use crate::process::SupervisionReport;
use colored::*;
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};

/// Print an error message to stderr
pub fn print_error(error: &str) {
    eprintln!("{} {}", "✗ Error:".red().bold(), error);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Print a success message
pub fn print_success_msg(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

#[derive(Tabled)]
struct StartableRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Port")]
    port: u16,
    #[tabled(rename = "Env")]
    environment: String,
    #[tabled(rename = "User")]
    user: String,
    #[tabled(rename = "Entry point")]
    entry_point: String,
}

#[derive(Tabled)]
struct ProcessRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Port")]
    port: String,
    #[tabled(rename = "PID")]
    pid: u32,
    #[tabled(rename = "Supervisor")]
    supervisor: String,
}

#[derive(Tabled)]
struct ReportRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Launches")]
    launches: u32,
    #[tabled(rename = "Exits")]
    exits: u32,
    #[tabled(rename = "Deafened")]
    deafened: u32,
}

/// Print the configured applications
pub fn print_startable(apps: &[AppDescriptor]) {
    if apps.is_empty() {
        println!("{}", "No applications are configured".yellow());
        return;
    }

    let rows: Vec<StartableRow> = apps
        .iter()
        .map(|app| StartableRow {
            name: truncate(&app.name, 24),
            port: app.port,
            environment: app.environment.to_string(),
            user: app
                .user
                .map(|u| u.to_string())
                .unwrap_or_else(|| "-".to_string()),
            entry_point: app.entry_point.display().to_string(),
        })
        .collect();

    print_table(rows);
    print_total(apps.len(), "startable application(s)");
}

/// Print applications with a live child
pub fn print_running(rows: &[AppRow]) {
    println!("\n{}", "Running".green().bold().underline());

    if rows.is_empty() {
        println!("{}", "No applications are currently running".yellow());
        return;
    }

    print_table(process_rows(rows));
    print_total(rows.len(), "running application(s)");
}

/// Print deaf children still waiting to exit
pub fn print_deaf(rows: &[AppRow]) {
    println!("\n{}", "Deaf".red().bold().underline());

    if rows.is_empty() {
        println!("{}", "No deaf processes".dimmed());
        return;
    }

    print_table(process_rows(rows));
    print_total(rows.len(), "deaf process(es)");
}

/// Print what a supervisor run did
pub fn print_report(report: &SupervisionReport) {
    let rows: Vec<ReportRow> = report
        .iter()
        .map(|(name, app)| ReportRow {
            name: truncate(name, 24),
            launches: app.launches,
            exits: app.exits,
            deafened: app.deafened,
        })
        .collect();

    if rows.is_empty() {
        return;
    }

    println!("\n{}", "Supervision finished".bold());
    print_table(rows);
}

fn process_rows(rows: &[AppRow]) -> Vec<ProcessRow> {
    rows.iter()
        .map(|row| ProcessRow {
            name: truncate(&row.app, 24),
            port: row
                .port
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
            pid: row.child_pid,
            supervisor: format_supervisor(row.supervisor_pid),
        })
        .collect()
}

fn print_table<T: Tabled>(rows: Vec<T>) {
    let mut table = Table::new(rows);
    table
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()));

    println!("\n{}\n", table);
}

fn print_total(count: usize, what: &str) {
    println!("{}", format!("Total: {} {}", count, what).dimmed().italic());
}

/// Legacy records carry no supervisor pid
fn format_supervisor(pid: u32) -> String {
    if pid == 0 {
        "-".to_string()
    } else {
        pid.to_string()
    }
}

/// Truncate a string to a maximum length
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
