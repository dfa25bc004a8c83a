/// Color support with NO_COLOR and CLICOLOR environment variable handling
///
/// - `NO_COLOR`: if set (to any value), disable colors
/// - `CLICOLOR_FORCE`: if set to non-zero, force colors even when not a TTY
/// - `CLICOLOR`: if set to 0, disable colors
///
/// Otherwise colors follow whether stdout is a terminal.
use colored::control;

pub fn init_colors() {
    let is_tty = std::io::IsTerminal::is_terminal(&std::io::stdout());
    control::set_override(colors_enabled(|key| std::env::var(key).ok(), is_tty));
}

fn colors_enabled(lookup: impl Fn(&str) -> Option<String>, is_tty: bool) -> bool {
    // NO_COLOR takes precedence over everything (https://no-color.org/)
    if lookup("NO_COLOR").is_some() {
        return false;
    }
    if lookup("CLICOLOR_FORCE").is_some_and(|v| v != "0") {
        return true;
    }
    if lookup("CLICOLOR").is_some_and(|v| v == "0") {
        return false;
    }
    is_tty
}
