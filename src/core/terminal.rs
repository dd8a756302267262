use console::{Emoji, style};

pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
pub static INFO_ICON: Emoji<'_, '_> = Emoji("ℹ️  ", "");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
pub static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "");

pub fn print_success(msg: &str) {
    println!("{} {}", SUCCESS_ICON, style(msg).green());
}

pub fn print_info(msg: &str) {
    println!("{} {}", INFO_ICON, style(msg).blue());
}

pub fn print_warn(msg: &str) {
    println!("{} {}", WARN_ICON, style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

enum Line {
    Command(String, String),
    Status(String, String),
    Text(String),
    Hint(String, String),
    Blank,
}

/// A titled block of CLI output, built line by line and printed at once.
pub struct GuideSection {
    title: String,
    lines: Vec<Line>,
}

impl GuideSection {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            lines: Vec::new(),
        }
    }

    pub fn command(mut self, name: &str, about: &str) -> Self {
        self.lines.push(Line::Command(name.to_string(), about.to_string()));
        self
    }

    pub fn status(mut self, label: &str, value: &str) -> Self {
        self.lines.push(Line::Status(label.to_string(), value.to_string()));
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.lines.push(Line::Text(text.to_string()));
        self
    }

    pub fn hint(mut self, example: &str, about: &str) -> Self {
        self.lines.push(Line::Hint(example.to_string(), about.to_string()));
        self
    }

    pub fn blank(mut self) -> Self {
        self.lines.push(Line::Blank);
        self
    }

    pub fn print(&self) {
        println!("\n {}", style(&self.title).bold().underlined());
        let width = self
            .lines
            .iter()
            .filter_map(|l| match l {
                Line::Command(name, _) => Some(name.len()),
                _ => None,
            })
            .max()
            .unwrap_or(0);
        for line in &self.lines {
            match line {
                Line::Command(name, about) => {
                    println!("   {:<width$}  {}", style(name).green(), about, width = width)
                }
                Line::Status(label, value) => {
                    println!("  {} {}: {}", GEAR, style(label).bold().cyan(), value)
                }
                Line::Text(text) => println!("   {}", text),
                Line::Hint(example, about) if about.is_empty() => {
                    println!("   {} {}", style("$").dim(), style(example).cyan())
                }
                Line::Hint(example, about) => println!(
                    "   {} {}  {}",
                    style("$").dim(),
                    style(example).cyan(),
                    style(about).dim()
                ),
                Line::Blank => println!(),
            }
        }
    }
}

pub fn print_banner() {
    println!(
        "\n{} {}\n{}\n",
        SPARKLE,
        style("switchyard").bold().cyan(),
        style("Routes work to the right executor, and says so when it can't.").dim()
    );
}

pub fn print_goodbye() {
    println!("\n{} {}", SPARKLE, style("switchyard stopped.").bold().cyan());
}
