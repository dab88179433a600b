use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Result};
use is_terminal::IsTerminal;
use owo_colors::OwoColorize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api;
use crate::config::validate::validate;
use crate::registry::Registry;
use crate::supervisor::Supervisor;
use crate::ui::summary::print_outcomes;

use super::load_context;

#[derive(Debug, Default)]
pub struct ServeOptions {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub no_auto_start: bool,
    pub stop_on_exit: bool,
}

/// Boot the controller and serve until Ctrl-C. Unless `stop_on_exit` is set,
/// services keep running after the controller exits and the next boot
/// adopts them by PID.
pub async fn run(config_file: Option<&Path>, data_dir: Option<&Path>, opts: ServeOptions) -> Result<()> {
    let ctx = load_context(config_file, data_dir)?;
    let mut config = ctx.config;
    if let Some(host) = opts.host {
        config.controller.host = host;
    }
    if let Some(port) = opts.port {
        config.controller.port = port;
    }
    if let Err(errors) = validate(&config) {
        let list: Vec<String> = errors.iter().map(|e| format!("  - {}", e)).collect();
        bail!("Configuration errors:\n{}", list.join("\n"));
    }

    // Bind before touching any service so a second controller fails fast
    let listener = api::bind(&config.controller.host, config.controller.port).await?;
    let addr = listener.local_addr()?;

    let registry: Arc<dyn Registry> = ctx.registry;
    let supervisor = Arc::new(Supervisor::from_config(&config, registry));
    info!(
        data_dir = %config.controller.data_dir.display(),
        log_dir = %config.log_dir().display(),
        "controller starting"
    );

    if config.supervisor.auto_start && !opts.no_auto_start {
        let outcomes = supervisor.auto_start_all().await?;
        print_outcomes(&outcomes);
    }

    if std::io::stdout().is_terminal() {
        println!("  {} listening on {}", "nexus".bold(), format!("http://{}", addr).cyan());
    } else {
        println!("  nexus listening on http://{}", addr);
    }

    let cancel = CancellationToken::new();
    let sweeper = tokio::spawn(supervisor.clone().run_sweeper(cancel.clone()));

    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutting down");
            on_signal.cancel();
        }
    });

    let result = api::serve(listener, supervisor.clone(), cancel.clone()).await;
    cancel.cancel();

    if let Err(e) = sweeper.await {
        warn!(error = %e, "sweep task failed");
    }

    if opts.stop_on_exit {
        match supervisor.stop_all().await {
            Ok(outcomes) => print_outcomes(&outcomes),
            Err(e) => warn!(error = %e, "failed to stop services"),
        }
    }
    result
}
