// Terminal Output
// Colored status lines on stderr for the expgrid commands

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";

const TICK: char = '\u{2713}';
const CROSS: char = '\u{2717}';

fn paint(style: &str, text: impl std::fmt::Display) -> String {
    format!("{}{}{}", style, text, RESET)
}

/// Right-aligned action word, cargo style: "  Generating path"
pub fn status(action: &str, message: &str) {
    let style = format!("{}{}", BOLD, CYAN);
    eprintln!("{} {}", paint(&style, format!("{:>12}", action)), message);
}

pub fn success(message: &str) {
    let style = format!("{}{}", BOLD, GREEN);
    eprintln!("{} {}", paint(&style, format!("  {}", TICK)), message);
}

pub fn failure(message: &str) {
    let style = format!("{}{}", BOLD, RED);
    eprintln!("{} {}", paint(&style, format!("  {}", CROSS)), message);
}

pub fn check(message: &str) {
    eprintln!("{} {}", paint(GREEN, format!("  {}", TICK)), message);
}

pub fn warning(message: &str) {
    eprintln!("{} {}", paint(YELLOW, "  !"), message);
}

pub fn error(message: &str) {
    let style = format!("{}{}", BOLD, RED);
    eprintln!("{} {}", paint(&style, "error:"), message);
}

pub fn info(message: &str) {
    eprintln!("{} {}", paint(CYAN, "  i"), message);
}

pub fn dim(message: &str) {
    eprintln!("{}", paint(DIM, message));
}

pub fn dim_success(message: &str) {
    eprintln!("{}", paint(GREEN, message));
}

pub fn dim_failure(message: &str) {
    eprintln!("{}", paint(RED, message));
}

/// Phase stderr, indented under the phase line
pub fn phase_error(message: &str) {
    for line in message.lines() {
        eprintln!("{}", paint(RED, format!("        | {}", line)));
    }
}

pub fn header(message: &str) {
    eprintln!("{}", paint(BOLD, format!("==> {}", message)));
}
