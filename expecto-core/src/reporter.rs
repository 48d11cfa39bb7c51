use console::{style, Term};
use eyre::WrapErr;
use tokio::sync::broadcast;
use tracing::*;

use crate::{
    event::{self, Event},
    mode::StepMode,
    step::{Attachment, Check, StepId, StepRecord, Status},
};

/// Reporter trait. The trait is based on the "template method" pattern.
/// You can implement on_xxx methods to hook into step events. This way is enough for most usecases.
/// If you need more control, you can override the "run" or "handle" methods.
#[async_trait::async_trait]
pub trait Reporter {
    async fn run(&mut self) -> eyre::Result<()> {
        let mut rx = event::subscribe()?;

        loop {
            match rx.recv().await {
                Ok(msg) => self.handle(msg).await?,
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("event channel has been closed");
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("reporter lagged behind, {n} events dropped");
                    continue;
                }
            }
        }

        Ok(())
    }

    async fn handle(&mut self, msg: Event) -> eyre::Result<()> {
        match msg {
            Event::StepStart {
                id,
                parent,
                name,
                mode,
            } => self.on_step_start(id, parent, name, mode).await,
            Event::Check { id, check } => self.on_check(id, check).await,
            Event::Log { id, message } => self.on_log(id, message).await,
            Event::Attachment { id, attachment } => self.on_attachment(id, attachment).await,
            Event::StepEnd { id, parent, record } => self.on_step_end(id, parent, *record).await,
        }
    }

    /// Called when a step opens.
    async fn on_step_start(
        &mut self,
        _id: StepId,
        _parent: Option<StepId>,
        _name: String,
        _mode: Option<StepMode>,
    ) -> eyre::Result<()> {
        Ok(())
    }

    /// Called when an assertion is recorded.
    async fn on_check(&mut self, _id: StepId, _check: Check) -> eyre::Result<()> {
        Ok(())
    }

    async fn on_log(&mut self, _id: StepId, _message: String) -> eyre::Result<()> {
        Ok(())
    }

    async fn on_attachment(&mut self, _id: StepId, _attachment: Attachment) -> eyre::Result<()> {
        Ok(())
    }

    /// Called when a step closes. `record` holds the whole subtree.
    async fn on_step_end(
        &mut self,
        _id: StepId,
        _parent: Option<StepId>,
        _record: StepRecord,
    ) -> eyre::Result<()> {
        Ok(())
    }
}

pub struct NullReporter;

#[async_trait::async_trait]
impl Reporter for NullReporter {}

/// Prints every finished root step as an indented tree.
pub struct ListReporter {
    terminal: Term,
    show_attachments: bool,
}

impl ListReporter {
    pub fn new(show_attachments: bool) -> ListReporter {
        ListReporter {
            terminal: Term::stdout(),
            show_attachments,
        }
    }

    /// Render a step tree into lines, without terminal styling.
    pub fn render(&self, record: &StepRecord) -> Vec<String> {
        let mut lines = Vec::new();
        self.render_into(record, 0, &mut lines);
        lines
    }

    fn render_into(&self, record: &StepRecord, depth: usize, lines: &mut Vec<String>) {
        let indent = "  ".repeat(depth);
        let glyph = match record.status {
            Status::Passed => "✓",
            Status::Failed => "✘",
            Status::Broken => "!",
        };
        let mode = match record.mode {
            Some(StepMode::Sync) | None => String::new(),
            Some(mode) => format!(" ({mode})"),
        };
        let elapsed = record
            .elapsed
            .map(|d| format!(" [{d:?}]"))
            .unwrap_or_default();
        lines.push(format!("{indent}{glyph} {}{mode}{elapsed}", record.name));

        for check in record.failed_checks() {
            lines.push(format!("{indent}    ✘ {}", check.message));
        }
        for log in &record.logs {
            lines.push(format!("{indent}    | {log}"));
        }
        if self.show_attachments {
            for attachment in &record.attachments {
                lines.push(format!("{indent}    @ {}", attachment.name));
            }
        }
        for child in &record.children {
            self.render_into(child, depth + 1, lines);
        }
    }
}

#[async_trait::async_trait]
impl Reporter for ListReporter {
    async fn on_step_end(
        &mut self,
        _id: StepId,
        parent: Option<StepId>,
        record: StepRecord,
    ) -> eyre::Result<()> {
        if parent.is_some() {
            return Ok(());
        }

        for line in self.render(&record) {
            let styled = if line.trim_start().starts_with('✓') {
                style(line).green()
            } else if line.trim_start().starts_with('✘') {
                style(line).red()
            } else if line.trim_start().starts_with('!') {
                style(line).yellow()
            } else {
                style(line).dim()
            };
            self.terminal
                .write_line(&format!("{styled}"))
                .wrap_err("failed to write character on terminal")?;
        }
        Ok(())
    }
}
