use owo_colors::OwoColorize;

use crate::logs::{LogEntry, LogLevel, LogStream};

// ---------------------------------------------------------------------------
// Log line rendering for `nexus logs`
// ---------------------------------------------------------------------------

pub struct RenderOptions {
    pub use_color: bool,
    pub timestamps: bool,
}

fn format_level(level: &LogLevel, use_color: bool) -> String {
    if !use_color {
        return format!("{:>5} ", level.as_str());
    }
    match level {
        LogLevel::Trace => format!("{} ", level.as_str().dimmed()),
        LogLevel::Debug => format!("{} ", level.as_str().blue()),
        LogLevel::Info => format!("{} ", level.as_str().green()),
        LogLevel::Warn => format!("{} ", level.as_str().yellow()),
        LogLevel::Error => format!("{} ", level.as_str().red()),
    }
}

/// One log entry as a terminal line.
pub fn render_entry(entry: &LogEntry, opts: &RenderOptions) -> String {
    let mut buf = String::new();

    if opts.timestamps {
        if let Some(ts) = entry.timestamp {
            let ts = ts.format("%H:%M:%S%.3f").to_string();
            if opts.use_color {
                buf.push_str(&format!("{} ", ts.dimmed()));
            } else {
                buf.push_str(&ts);
                buf.push(' ');
            }
        }
    }

    if entry.stream == Some(LogStream::System) {
        let text = format!("-- {}", entry.text);
        if opts.use_color {
            buf.push_str(&format!("{}", text.cyan()));
        } else {
            buf.push_str(&text);
        }
        return buf;
    }

    if let Some(ref level) = entry.level {
        buf.push_str(&format_level(level, opts.use_color));
    }

    if opts.use_color && entry.stream == Some(LogStream::Stderr) {
        buf.push_str(&format!("{}", entry.text.red()));
    } else {
        buf.push_str(&entry.text);
    }
    buf
}
