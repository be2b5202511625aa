use quire_core::{ClientError, LoginRedirect, Notice, NoticeLevel, Notifier};
use tracing::warn;

const BAR_WIDTH: usize = 20;

/// Prints notices to stderr, one line each.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalNotifier;

impl Notifier for TerminalNotifier {
    fn notify(&self, notice: Notice) {
        eprintln!("{}", format_notice(&notice));
    }
}

impl LoginRedirect for TerminalNotifier {
    fn redirect_to_login(&self, reason: &ClientError) {
        warn!(%reason, "sign-in required");
        eprintln!("Sign in again with `quire login --email <EMAIL> --password <PASSWORD>`.");
    }
}

pub fn format_notice(notice: &Notice) -> String {
    let label = match notice.level {
        NoticeLevel::Info => "info",
        NoticeLevel::Success => "ok",
        NoticeLevel::Warning => "warning",
        NoticeLevel::Error => "error",
    };
    format!("{label}: {}", notice.message)
}

pub fn progress_line(name: &str, percent: u8) -> String {
    let percent = percent.min(100);
    let filled = usize::from(percent) * BAR_WIDTH / 100;
    format!(
        "{name} [{}{}] {percent:>3}%",
        "#".repeat(filled),
        ".".repeat(BAR_WIDTH - filled)
    )
}

/// Turns cumulative answer snapshots into the text still to be printed.
#[derive(Debug, Default)]
pub struct DeltaPrinter {
    shown: String,
}

impl DeltaPrinter {
    pub fn push(&mut self, text: &str) -> String {
        let out = match text.strip_prefix(self.shown.as_str()) {
            Some(rest) => rest.to_string(),
            // The server rewrote earlier text; start a fresh line with the whole answer.
            None => format!("\n{text}"),
        };
        self.shown = text.to_string();
        out
    }

    pub fn shown(&self) -> &str {
        &self.shown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prints_only_new_text() {
        let mut printer = DeltaPrinter::default();
        assert_eq!(printer.push("H"), "H");
        assert_eq!(printer.push("Hi"), "i");
        assert_eq!(printer.push("Hi"), "");
        assert_eq!(printer.push("Hey"), "\nHey");
        assert_eq!(printer.shown(), "Hey");
    }

    #[test]
    fn renders_progress_bar() {
        assert_eq!(progress_line("a.png", 50), "a.png [##########..........]  50%");
        assert_eq!(progress_line("a.png", 200), "a.png [####################] 100%");
    }

    #[test]
    fn labels_notices() {
        assert_eq!(format_notice(&Notice::error("boom")), "error: boom");
        assert_eq!(format_notice(&Notice::success("done")), "ok: done");
    }
}
