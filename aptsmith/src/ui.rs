use console::style;

/// Sink for human-readable progress output during a provisioning run. Live
/// remote command output also flows through here.
pub trait Ui {
    fn say(&self, message: &str);
    fn error(&self, message: &str);
}

/// Writes progress to the terminal, colorized when supported.
pub struct ConsoleUi;

impl Ui for ConsoleUi {
    fn say(&self, message: &str) {
        println!("{message}");
    }

    fn error(&self, message: &str) {
        eprintln!("{}", style(message).red());
    }
}
