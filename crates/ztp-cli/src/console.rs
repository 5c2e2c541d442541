//! Messages for the person running the tool
//!
//! Every line carries a severity prefix (`I:`, `W:` or `E:`), coloured when
//! both output streams are terminals. The same text also goes to the log so
//! a `--log-file` has the full story.

use std::fmt::Display;
use std::io::{IsTerminal, Write};
use std::sync::{Arc, Mutex};

use clap::ValueEnum;
use tracing::debug;
use ztp_hub::ApplierListener;

/// When to colour the prefixes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum ColorChoice {
    /// Colour when writing to a terminal
    #[default]
    Auto,
    /// Always colour
    Always,
    /// Never colour
    Never,
}

struct Prefixes {
    info: &'static str,
    warn: &'static str,
    error: &'static str,
}

const COLOR_PREFIXES: Prefixes = Prefixes {
    info: "\x1b[32;1mI:\x1b[0m ",
    warn: "\x1b[33;1mW:\x1b[0m ",
    error: "\x1b[31;1mE:\x1b[0m ",
};

const MONO_PREFIXES: Prefixes = Prefixes {
    info: "I: ",
    warn: "W: ",
    error: "E: ",
};

type Stream = Mutex<Box<dyn Write + Send>>;

/// Prefixed output to standard output and standard error
pub struct Console {
    prefixes: &'static Prefixes,
    out: Stream,
    err: Stream,
}

impl std::fmt::Debug for Console {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Console")
            .field("colored", &std::ptr::eq(self.prefixes, &COLOR_PREFIXES))
            .finish_non_exhaustive()
    }
}

impl Console {
    /// Console on the process streams
    pub fn stdio(color: ColorChoice) -> Self {
        let colored = match color {
            ColorChoice::Always => true,
            ColorChoice::Never => false,
            ColorChoice::Auto => std::io::stdout().is_terminal() && std::io::stderr().is_terminal(),
        };
        Self::with_writers(Box::new(std::io::stdout()), Box::new(std::io::stderr()), colored)
    }

    /// Console on arbitrary writers
    pub fn with_writers(out: Box<dyn Write + Send>, err: Box<dyn Write + Send>, colored: bool) -> Self {
        Self {
            prefixes: if colored { &COLOR_PREFIXES } else { &MONO_PREFIXES },
            out: Mutex::new(out),
            err: Mutex::new(err),
        }
    }

    pub fn info(&self, text: impl Display) {
        let text = text.to_string();
        write_line(&self.out, self.prefixes.info, &text);
        debug!(text = %text, "Console info");
    }

    pub fn warn(&self, text: impl Display) {
        let text = text.to_string();
        write_line(&self.out, self.prefixes.warn, &text);
        debug!(text = %text, "Console warn");
    }

    pub fn error(&self, text: impl Display) {
        let text = text.to_string();
        write_line(&self.err, self.prefixes.error, &text);
        debug!(text = %text, "Console error");
    }

    /// Applier listener printing through this console
    pub fn applier_listener(self: &Arc<Self>) -> ApplierListener {
        let info = self.clone();
        let error = self.clone();
        ApplierListener::new(move |line| info.info(line), move |line| error.error(line))
    }
}

fn write_line(stream: &Stream, prefix: &str, text: &str) {
    // A poisoned lock only means another line was cut short
    let mut stream = match stream.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    let _ = writeln!(stream, "{}{}", prefix, text);
    let _ = stream.flush();
}
