//! Terminal rendering for human-readable (`--format text`) output.
//!
//! Status lines about the outcome go to stdout; warnings and failures go to
//! stderr so that piping `cat` output stays clean.

use std::fmt::Display;
use std::io::IsTerminal;

use nu_ansi_term::{Color, Style};

#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum Theme {
    Auto,
    Light,
    Dark,
    Plain,
}

#[derive(Clone, Copy)]
enum Tone {
    Heading,
    Key,
    Marker,
    Ok,
    Note,
    Warn,
    Fail,
}

pub struct Ui {
    theme: Theme,
    color: bool,
    quiet: bool,
}

impl Ui {
    pub fn new(theme: Theme, quiet: bool) -> Self {
        let color = !quiet && theme != Theme::Plain && std::io::stdout().is_terminal();

        #[cfg(windows)]
        if color {
            let _ = nu_ansi_term::enable_ansi_support();
        }

        Self {
            theme,
            color,
            quiet,
        }
    }

    pub fn spacer(&self) {
        if !self.quiet {
            println!();
        }
    }

    /// Titled block of `key: value` rows with the keys right-aligned.
    pub fn section<'a, I, V>(&self, title: &str, rows: I)
    where
        I: IntoIterator<Item = (&'a str, V)>,
        V: Display,
    {
        let rows: Vec<(&str, String)> = rows.into_iter().map(|(k, v)| (k, v.to_string())).collect();
        if rows.is_empty() {
            return;
        }
        self.heading(title);
        if self.quiet {
            for (key, value) in rows {
                println!("{key}={value}");
            }
            return;
        }
        let width = rows.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
        for (key, value) in rows {
            let key = format!("{key:>width$}:");
            println!("  {} {value}", self.paint(Tone::Key, &key));
        }
    }

    pub fn list<I>(&self, title: &str, entries: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut entries = entries.into_iter().peekable();
        if entries.peek().is_none() {
            return;
        }
        self.heading(title);
        let marker = if self.color { "·" } else { "-" };
        for entry in entries {
            if self.quiet {
                println!("{entry}");
            } else {
                println!("  {} {entry}", self.paint(Tone::Marker, marker));
            }
        }
    }

    pub fn info(&self, message: &str) {
        self.status(Tone::Note, "i", message);
    }

    pub fn success(&self, message: &str) {
        self.status(Tone::Ok, "ok", message);
    }

    pub fn warn(&self, message: &str) {
        self.status(Tone::Warn, "warning", message);
    }

    pub fn fail(&self, message: &str) {
        self.status(Tone::Fail, "error", message);
    }

    fn status(&self, tone: Tone, tag: &str, message: &str) {
        let to_stderr = matches!(tone, Tone::Warn | Tone::Fail);
        let line = if self.quiet {
            message.to_string()
        } else {
            format!("{} {message}", self.paint(tone, &format!("[{tag}]")))
        };
        if to_stderr {
            eprintln!("{line}");
        } else {
            println!("{line}");
        }
    }

    fn heading(&self, title: &str) {
        if self.quiet {
            println!("# {title}");
        } else {
            println!("{}", self.paint(Tone::Heading, title));
        }
    }

    fn paint(&self, tone: Tone, text: &str) -> String {
        if !self.color {
            return text.to_string();
        }
        self.style(tone).paint(text).to_string()
    }

    fn style(&self, tone: Tone) -> Style {
        let light = self.theme == Theme::Light;
        let color = match (tone, light) {
            (Tone::Heading, false) => Color::Purple,
            (Tone::Heading, true) => Color::Blue,
            (Tone::Key | Tone::Marker, false) => Color::LightBlue,
            (Tone::Key | Tone::Marker, true) => Color::Black,
            (Tone::Ok, false) => Color::LightGreen,
            (Tone::Ok, true) => Color::Green,
            (Tone::Note, false) => Color::LightCyan,
            (Tone::Note, true) => Color::Purple,
            (Tone::Warn, false) => Color::Yellow,
            (Tone::Warn, true) => Color::Red,
            (Tone::Fail, _) => Color::Red,
        };
        let style = Style::new().fg(color);
        match tone {
            Tone::Marker | Tone::Note => style,
            _ => style.bold(),
        }
    }
}
