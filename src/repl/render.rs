//! Terminal output for the chat loop.
//!
//! Assistant text goes to stdout; everything else (prompts aside) goes to
//! stderr so `chatrelay chat < questions.txt > answers.txt` stays clean.

use crossterm::style::{Color, Stylize};
use std::io::{self, Write};

const LABEL_ASSISTANT: &str = "assistant";
const LABEL_WARNING: &str = "warning:";
const LABEL_ERROR: &str = "error:";
const PROMPT: &str = "> ";
const INDENT: &str = "  ";

/// Color-aware writer for chat output.
#[derive(Debug, Clone, Copy)]
pub struct Renderer {
    color: bool,
}

impl Renderer {
    pub fn new(color: bool) -> Self {
        Self { color }
    }

    pub fn prompt(&self) {
        if self.color {
            eprint!("{}", PROMPT.with(Color::Cyan).bold());
        } else {
            eprint!("{PROMPT}");
        }
        let _ = io::stderr().flush();
    }

    /// Label printed before a reply starts.
    pub fn assistant_header(&self) {
        if self.color {
            eprintln!("{}", LABEL_ASSISTANT.with(Color::Green).bold());
        } else {
            eprintln!("{LABEL_ASSISTANT}:");
        }
    }

    /// One streamed delta, written as it arrives.
    pub fn fragment(&self, delta: &str) {
        let mut stdout = io::stdout();
        let _ = stdout.write_all(delta.as_bytes());
        let _ = stdout.flush();
    }

    /// Close a streamed reply.
    pub fn end_reply(&self) {
        println!();
        let _ = io::stdout().flush();
    }

    /// A complete, buffered reply.
    pub fn reply(&self, content: &str) {
        println!("{content}");
        let _ = io::stdout().flush();
    }

    pub fn info(&self, msg: &str) {
        if self.color {
            eprintln!("{}", msg.with(Color::DarkGrey));
        } else {
            eprintln!("{msg}");
        }
    }

    pub fn warn(&self, msg: &str) {
        if self.color {
            eprintln!("{} {msg}", LABEL_WARNING.with(Color::Yellow).bold());
        } else {
            eprintln!("{LABEL_WARNING} {msg}");
        }
    }

    pub fn error(&self, msg: &str) {
        if self.color {
            eprintln!("{} {msg}", LABEL_ERROR.with(Color::Red).bold());
        } else {
            eprintln!("{LABEL_ERROR} {msg}");
        }
    }

    pub fn section(&self, title: &str) {
        if self.color {
            eprintln!("{}", title.with(Color::Blue).bold());
        } else {
            eprintln!("{title}:");
        }
    }

    pub fn field(&self, key: &str, value: &str) {
        if self.color {
            eprintln!(
                "{INDENT}{} {}",
                format!("{key}:").with(Color::DarkGrey),
                value.with(Color::White)
            );
        } else {
            eprintln!("{INDENT}{key}: {value}");
        }
    }
}
