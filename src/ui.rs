//! Interface de terminal do kelpie: spinners e saída colorida.
//!
//! Usa as crates `indicatif` para spinners de progresso e `console` para
//! estilização com cores. O [`StageProgress`] acompanha visualmente
//! a supervisão dos estágios de um workflow no terminal.

use std::cell::RefCell;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::breeder::{StageObserver, StageReport, WorkflowOutcome, WorkflowRecord, WorkflowStatus};
use crate::grazer::{GrazerState, Phase, StageOutcome};

/// Indicador visual de progresso para os estágios de um workflow.
///
/// Exibe um spinner animado enquanto um estágio está ativo e mensagens
/// coloridas para sucesso (verde), falha (vermelho) e retentativa (amarelo).
pub struct StageProgress {
    // Spinner do estágio atual, se houver.
    pb: RefCell<Option<ProgressBar>>,
    // Número de tentativas já reportadas no estágio atual.
    seen_attempts: RefCell<usize>,
    green: Style,
    red: Style,
    yellow: Style,
}

impl Default for StageProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl StageProgress {
    pub fn new() -> Self {
        Self {
            pb: RefCell::new(None),
            seen_attempts: RefCell::new(0),
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    fn spinner(message: String) -> ProgressBar {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(message);
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        pb
    }

    // Imprime acima do spinner quando ele existe, para não corrompê-lo.
    fn println(&self, line: String) {
        match self.pb.borrow().as_ref() {
            Some(pb) => pb.println(line),
            None => println!("{line}"),
        }
    }
}

impl StageObserver for StageProgress {
    fn stage_started(&self, stage: &str, resumed: bool) {
        let verb = if resumed { "Resuming" } else { "Starting" };
        *self.seen_attempts.borrow_mut() = 0;
        *self.pb.borrow_mut() = Some(Self::spinner(format!("{verb} {stage}")));
    }

    /// Atualiza o spinner e anuncia cada retentativa com o motivo.
    fn phase_changed(&self, state: &GrazerState) {
        let attempt = state.attempts.len();
        if let Some(pb) = self.pb.borrow().as_ref() {
            pb.set_message(format!("{} attempt {attempt}: {}", state.stage, state.phase));
        }

        let mut seen = self.seen_attempts.borrow_mut();
        if attempt > *seen && *seen > 0 {
            let reason = state.attempts[attempt - 2]
                .diagnosis
                .as_ref()
                .map(|d| d.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            let budget = state.policy.budget;
            self.println(format!(
                "  {} Retry {}/{budget}: {reason}",
                self.yellow.apply_to("↻"),
                attempt - 1
            ));
        }
        *seen = attempt;
    }

    /// Finaliza o spinner e exibe o resultado do estágio.
    fn stage_finished(&self, report: &StageReport) {
        if let Some(pb) = self.pb.borrow_mut().take() {
            pb.finish_and_clear();
        }
        match report.outcome {
            Some(StageOutcome::Converged) => println!(
                "  {} {} converged after {} attempt(s)",
                self.green.apply_to("✓"),
                report.name,
                report.attempts
            ),
            Some(outcome) => println!("  {} {} {outcome}", self.red.apply_to("✗"), report.name),
            None => println!(
                "  {} {} submitted ({})",
                self.yellow.apply_to("…"),
                report.name,
                report.phase.as_ref().map_or_else(|| "-".to_string(), Phase::to_string)
            ),
        }
    }
}

/// Imprime o resumo final do workflow.
pub fn print_outcome(outcome: &WorkflowOutcome) {
    let (style, label) = match outcome.status() {
        WorkflowStatus::Converged => (Style::new().green().bold(), "converged"),
        WorkflowStatus::InProgress => (Style::new().yellow(), "in progress"),
        WorkflowStatus::Exhausted => (Style::new().red().bold(), "exhausted"),
        WorkflowStatus::Aborted => (Style::new().red().bold(), "aborted"),
    };
    println!();
    println!("{}", style.apply_to(format!("─── Workflow {label} ───")));
    println!("run id: {}", outcome.run_id);
    for report in &outcome.stages {
        println!("  {}", report_line(report));
    }
}

/// Imprime o estado de uma execução lido do disco, em formato de tabela.
pub fn print_status(record: &WorkflowRecord, reports: &[StageReport]) {
    let dim = Style::new().dim();
    println!("run id:  {}", record.run_id);
    println!("created: {}", record.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("{}", dim.apply_to(format!("{:<16} {:<24} {:>8}", "STAGE", "STATE", "ATTEMPTS")));
    for report in reports {
        println!("{}", report_line(report));
    }
}

fn report_line(report: &StageReport) -> String {
    let state = match (&report.outcome, &report.phase) {
        (Some(outcome), _) => outcome.to_string(),
        (None, Some(phase)) => phase.to_string(),
        (None, None) => "not started".to_string(),
    };
    format!("{:<16} {:<24} {:>8}", report.name, state, report.attempts)
}
