use std::io::IsTerminal;
use std::time::{Duration, Instant};

use anstyle::{AnsiColor, Effects, Style};
use envforge_core::Manifest;
use envforge_engine::{ModuleReport, ModuleState, RunObserver, RunReport, RunStatus};
use envforge_planner::PlanEntry;
use envforge_upgrade::UpgradeState;
use indicatif::{HumanCount, ProgressBar, ProgressStyle};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

pub(crate) fn resolve_output_style(stdout_is_tty: bool, no_color: bool) -> OutputStyle {
    if stdout_is_tty && !no_color {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

pub(crate) fn current_output_style() -> OutputStyle {
    let no_color = std::env::var_os("NO_COLOR").is_some_and(|value| !value.is_empty());
    resolve_output_style(std::io::stdout().is_terminal(), no_color)
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => format!("{} {message}", status_badge(status)),
    }
}

fn status_badge(status: &str) -> &'static str {
    match status {
        "ok" => "[OK]",
        "warn" => "[WARN]",
        "error" => "[ERR]",
        "step" => "[>>]",
        _ => "[..]",
    }
}

fn module_status(state: ModuleState) -> &'static str {
    match state {
        ModuleState::Success => "ok",
        ModuleState::Warning => "warn",
        ModuleState::Failed | ModuleState::Interrupted => "error",
        ModuleState::Pending
        | ModuleState::Running
        | ModuleState::Skipped
        | ModuleState::NotAttempted => "skip",
    }
}

pub(crate) fn print_section(style: OutputStyle, title: &str) {
    if style == OutputStyle::Rich {
        println!();
        println!("{}", colorize(section_style(), &format!("== {title} ==")));
    }
}

pub(crate) fn print_lines(lines: &[String]) {
    for line in lines {
        println!("{line}");
    }
}

/// One result line per module, followed by the captured output of a failure.
pub(crate) fn format_module_result_lines(report: &ModuleReport, style: OutputStyle) -> Vec<String> {
    let detail = match (report.state, &report.failure, &report.skip_reason) {
        (_, Some(failure), _) => format!("{}: {} {failure}", report.id, report.state),
        (ModuleState::Skipped, None, Some(reason)) => {
            format!("{}: skipped (reason={reason})", report.id)
        }
        (ModuleState::Success, None, _) => format!(
            "{}: success in {}",
            report.id,
            format_elapsed(Duration::from_millis(report.duration_ms))
        ),
        (state, None, _) => format!("{}: {state}", report.id),
    };

    let mut lines = vec![render_status_line(style, module_status(report.state), &detail)];
    if let Some(failure) = &report.failure {
        lines.extend(failure.output_tail.iter().map(|line| format!("    | {line}")));
    }
    lines
}

pub(crate) fn format_run_summary_line(report: &RunReport) -> String {
    format!(
        "run {}: status={} success={} skipped={} warning={} failed={} not-attempted={}",
        report.run_id,
        report.status.as_str(),
        report.count(ModuleState::Success),
        report.count(ModuleState::Skipped),
        report.count(ModuleState::Warning),
        report.count(ModuleState::Failed) + report.count(ModuleState::Interrupted),
        report.count(ModuleState::NotAttempted),
    )
}

pub(crate) fn format_run_outcome_lines(report: &RunReport, style: OutputStyle) -> Vec<String> {
    let status = match report.status {
        RunStatus::Succeeded if report.warnings().next().is_some() => "warn",
        RunStatus::Succeeded => "ok",
        RunStatus::Failed | RunStatus::Interrupted => "error",
    };
    let mut lines = vec![render_status_line(
        style,
        status,
        &format_run_summary_line(report),
    )];
    for warning in report.warnings() {
        lines.push(render_status_line(
            style,
            "warn",
            &format!("optional module '{}' did not install", warning.id),
        ));
    }
    if let Some(halted) = report.halted_by() {
        lines.push(render_status_line(
            style,
            "error",
            &format!("run halted at module '{}' ({})", halted.id, halted.state),
        ));
    }
    lines
}

pub(crate) fn format_module_list_lines(manifest: &Manifest) -> Vec<String> {
    manifest
        .modules
        .iter()
        .map(|module| {
            let mut flags = Vec::new();
            if module.optional {
                flags.push("optional");
            }
            if !module.enabled_by_default {
                flags.push("opt-in");
            }
            let tags = module.tags.iter().cloned().collect::<Vec<_>>().join(",");
            let mut line = format!(
                "{} phase={} category={} run_as={}",
                module.id,
                module.phase,
                module.category(),
                module.run_as.as_str()
            );
            if !tags.is_empty() {
                line.push_str(&format!(" tags={tags}"));
            }
            if !flags.is_empty() {
                line.push_str(&format!(" [{}]", flags.join(" ")));
            }
            if let Some(description) = module.description.as_deref().filter(|d| !d.is_empty()) {
                line.push_str(&format!(" - {description}"));
            }
            line
        })
        .collect()
}

pub(crate) fn format_upgrade_status_lines(
    state: Option<&UpgradeState>,
    lock_pid: Option<u32>,
) -> Vec<String> {
    let Some(state) = state else {
        return vec!["upgrade: none recorded".to_string()];
    };

    let hops = state
        .completed_hops
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>();
    let mut lines = vec![
        format!(
            "upgrade: stage={} current={} target={}",
            state.stage, state.current_version, state.target_version
        ),
        format!(
            "upgrade hops: {}",
            if hops.is_empty() {
                "none".to_string()
            } else {
                hops.join(" -> ")
            }
        ),
    ];
    if state.needs_reboot {
        lines.push("upgrade: reboot required before resuming".to_string());
    }
    if let Some(error) = &state.last_error {
        lines.push(format!("upgrade last error: {error}"));
    }
    if let Some(pid) = lock_pid {
        lines.push(format!("upgrade lock: owner pid={pid}"));
    }
    lines
}

pub(crate) fn format_last_run_lines(report: Option<&RunReport>) -> Vec<String> {
    let Some(report) = report else {
        return vec!["last run: none recorded".to_string()];
    };
    let mut lines = vec![format!("last {}", format_run_summary_line(report))];
    if let Some(halted) = report.halted_by() {
        let detail = halted
            .failure
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| halted.state.to_string());
        lines.push(format!("last run halted at '{}': {detail}", halted.id));
    }
    lines
}

/// Drives per-module progress output while the engine runs.
pub(crate) struct ProgressObserver {
    style: OutputStyle,
    quiet: bool,
    progress_bar: Option<ProgressBar>,
    started_at: Instant,
    finished: u64,
    total: u64,
}

impl ProgressObserver {
    pub fn new(style: OutputStyle, quiet: bool) -> Self {
        Self {
            style,
            quiet,
            progress_bar: None,
            started_at: Instant::now(),
            finished: 0,
            total: 0,
        }
    }

    fn ensure_progress_bar(&mut self, total: u64) -> &ProgressBar {
        self.progress_bar.get_or_insert_with(|| {
            let progress_bar = ProgressBar::new(total.max(1));
            if let Ok(style) = ProgressStyle::with_template(
                "{spinner:.cyan.bold} {msg:<24} [{bar:20.cyan/blue}] {pos:>3}/{len:3} {elapsed_precise}",
            ) {
                progress_bar.set_style(style.tick_chars(".oO@* ").progress_chars("=>-"));
            }
            progress_bar.enable_steady_tick(Duration::from_millis(80));
            progress_bar
        })
    }

    pub fn finish(mut self) {
        if let Some(progress_bar) = self.progress_bar.take() {
            progress_bar.finish_and_clear();
        }
        if self.quiet {
            return;
        }
        if let Some(line) = render_progress_line(
            self.style,
            self.finished,
            self.total,
            Some(self.started_at.elapsed()),
        ) {
            println!("{line}");
        }
    }
}

impl RunObserver for ProgressObserver {
    fn module_started(&mut self, entry: &PlanEntry, position: usize, total: usize) {
        self.total = total as u64;
        if self.quiet {
            return;
        }
        match self.style {
            OutputStyle::Plain => println!("[{}/{}] {}", position + 1, total, entry.id),
            OutputStyle::Rich => {
                let progress_bar = self.ensure_progress_bar(total as u64);
                progress_bar.set_position(position as u64);
                progress_bar.set_message(entry.id.clone());
            }
        }
    }

    fn module_finished(&mut self, report: &ModuleReport) {
        self.finished += 1;
        if self.quiet {
            return;
        }
        let lines = format_module_result_lines(report, self.style);
        match &self.progress_bar {
            Some(progress_bar) => {
                progress_bar.set_position(self.finished);
                for line in lines {
                    progress_bar.println(line);
                }
            }
            None => print_lines(&lines),
        }
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let millis = elapsed.subsec_millis();
    format!("{secs}.{millis:03}s")
}

fn section_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightBlue.into()))
        .effects(Effects::BOLD)
}

fn progress_label_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightCyan.into()))
        .effects(Effects::BOLD)
}

fn progress_bar_style() -> Style {
    Style::new().fg_color(Some(AnsiColor::BrightBlue.into()))
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

fn render_progress_line(
    style: OutputStyle,
    current: u64,
    total: u64,
    elapsed: Option<Duration>,
) -> Option<String> {
    if style == OutputStyle::Plain {
        return None;
    }

    let width = 18_usize;
    let safe_total = total.max(1);
    let bounded_current = current.min(safe_total);
    let filled = ((bounded_current as usize) * width) / (safe_total as usize);
    let bar = format!(
        "{}{}",
        "=".repeat(filled),
        "-".repeat(width.saturating_sub(filled))
    );
    let percent = (bounded_current * 100) / safe_total;
    let counts = format!("{}/{}", HumanCount(current), HumanCount(total));
    let suffix = elapsed
        .map(|value| format!(" complete in {}", format_elapsed(value)))
        .unwrap_or_default();

    Some(format!(
        "{} [{}] {:>3}% {}{}",
        colorize(progress_label_style(), "modules"),
        colorize(progress_bar_style(), &bar),
        percent,
        counts,
        suffix
    ))
}
