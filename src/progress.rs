use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::model::Condition;

/// Controls how stage output is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Spinners with checkmarks.
    Normal,
    /// No ANSI, plain println output (for piped/non-TTY).
    Plain,
    /// Nothing at all.
    Quiet,
}

/// Numbered pipeline stages with spinners and pass/fail marks.
pub struct StageProgress {
    multi: MultiProgress,
    total: usize,
    current: usize,
    mode: OutputMode,
}

/// A stage that has started but not yet reported its condition.
pub struct Stage {
    bar: ProgressBar,
    prefix: String,
    mode: OutputMode,
}

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

impl StageProgress {
    pub fn new(mode: OutputMode) -> Self {
        let multi = if mode == OutputMode::Normal {
            MultiProgress::new()
        } else {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        };
        Self {
            multi,
            total: 0,
            current: 0,
            mode,
        }
    }

    pub fn quiet() -> Self {
        Self::new(OutputMode::Quiet)
    }

    /// Reset numbering for a pipeline of `total` stages.
    pub fn start(&mut self, total: usize) {
        self.total = total;
        self.current = 0;
    }

    pub fn begin(&mut self, label: &str) -> Stage {
        self.current += 1;
        let prefix = format!("{}/{}", self.current, self.total);

        if self.mode == OutputMode::Plain {
            println!("[{prefix}] {label}");
        }

        let bar = self.multi.add(ProgressBar::new_spinner());
        bar.set_style(style("[{prefix}] {spinner:.cyan} {msg}"));
        bar.set_prefix(prefix.clone());
        bar.set_message(label.to_string());
        if self.mode == OutputMode::Normal {
            bar.enable_steady_tick(Duration::from_millis(80));
        }
        Stage {
            bar,
            prefix,
            mode: self.mode,
        }
    }

    /// Print a line above the managed area.
    pub fn println(&self, text: &str) {
        match self.mode {
            OutputMode::Plain => println!("{text}"),
            OutputMode::Normal => {
                self.multi.println(text).ok();
            }
            OutputMode::Quiet => {}
        }
    }
}

impl Stage {
    /// Mark the stage with its recorded condition.
    pub fn finish(self, condition: &Condition) {
        let label = if condition.message.is_empty() {
            condition.kind.clone()
        } else {
            format!("{}: {}", condition.kind, condition.message)
        };
        let ok = condition.is_true();

        if self.mode == OutputMode::Plain {
            let mark = if ok { "\u{2713}" } else { "\u{2717}" };
            println!("[{}] {mark} {label}", self.prefix);
        }

        let template = if ok {
            "[{prefix}] \u{2713} {msg:.green}"
        } else {
            "[{prefix}] \u{2717} {msg:.red}"
        };
        self.bar.set_style(style(template));
        self.bar.finish_with_message(label);
    }

    /// Finish without a condition, for skipped stages.
    pub fn skip(self, reason: &str) {
        if self.mode == OutputMode::Plain {
            println!("[{}] - {reason}", self.prefix);
        }
        self.bar.set_style(style("[{prefix}] - {msg:.dim}"));
        self.bar.finish_with_message(reason.to_string());
    }
}
