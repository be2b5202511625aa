pub mod terminal;

pub use terminal::{format_notice, progress_line, DeltaPrinter, TerminalNotifier};
