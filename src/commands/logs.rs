use anyhow::{bail, Context, Result};
use is_terminal::IsTerminal;
use regex::Regex;
use std::io::Write;
use std::path::Path;

use crate::logs::{self, LogEntry, LogLevel};
use crate::ui::logs::{render_entry, RenderOptions};

use super::{find_service, load_context};

pub struct LogsOptions {
    pub lines: usize,
    pub level: Option<String>,
    pub grep: Option<String>,
    pub timestamps: bool,
    pub json: bool,
}

fn parse_level(s: &str) -> Result<LogLevel> {
    match s.to_lowercase().as_str() {
        "trace" => Ok(LogLevel::Trace),
        "debug" => Ok(LogLevel::Debug),
        "info" => Ok(LogLevel::Info),
        "warn" | "warning" => Ok(LogLevel::Warn),
        "error" => Ok(LogLevel::Error),
        _ => bail!(
            "unknown log level '{}' (use trace, debug, info, warn, error)",
            s
        ),
    }
}

struct LineFilter {
    min_level: Option<LogLevel>,
    include: Option<Regex>,
}

impl LineFilter {
    fn matches(&self, entry: &LogEntry) -> bool {
        if let Some(min) = self.min_level {
            if entry.level.map_or(true, |l| l < min) {
                return false;
            }
        }
        if let Some(re) = &self.include {
            if !re.is_match(&entry.text) {
                return false;
            }
        }
        true
    }
}

pub fn run(
    config_file: Option<&Path>,
    data_dir: Option<&Path>,
    service: &str,
    opts: LogsOptions,
) -> Result<()> {
    let ctx = load_context(config_file, data_dir)?;
    let svc = find_service(ctx.registry.as_ref(), service)?;
    let path = svc
        .log_path
        .clone()
        .unwrap_or_else(|| logs::log_path_for(&ctx.config.log_dir(), &svc));

    let filter = LineFilter {
        min_level: opts.level.as_deref().map(parse_level).transpose()?,
        include: opts
            .grep
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| anyhow::anyhow!("invalid grep regex: {}", e))?,
    };

    let tail = logs::tail(&path, opts.lines)
        .with_context(|| format!("reading {}", path.display()))?;
    let entries: Vec<LogEntry> = tail
        .map(|l| LogEntry::parse(&l))
        .filter(|e| filter.matches(e))
        .collect();

    let mut out = std::io::stdout().lock();
    if opts.json {
        for entry in &entries {
            serde_json::to_writer(&mut out, entry)?;
            writeln!(out)?;
        }
    } else {
        let render = RenderOptions {
            use_color: std::io::stdout().is_terminal(),
            timestamps: opts.timestamps,
        };
        for entry in &entries {
            writeln!(out, "{}", render_entry(entry, &render))?;
        }
    }
    out.flush()?;
    Ok(())
}
