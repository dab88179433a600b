use clap::{CommandFactory, Parser};
use clap_complete::aot::generate;
use nexus::cli::{Cli, Commands};
use nexus::commands;

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber with env-filter support.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config_file = cli.global.config_file.as_deref();
    let data_dir = cli.global.data_dir.as_deref();

    let result = match cli.command {
        Commands::Serve {
            host,
            port,
            no_auto_start,
            stop_on_exit,
        } => {
            commands::serve::run(
                config_file,
                data_dir,
                commands::serve::ServeOptions {
                    host,
                    port,
                    no_auto_start,
                    stop_on_exit,
                },
            )
            .await
        }
        Commands::Ps { json } => commands::ps::run(config_file, data_dir, json),
        Commands::Logs {
            service,
            lines,
            level,
            grep,
            timestamps,
            json,
        } => commands::logs::run(
            config_file,
            data_dir,
            &service,
            commands::logs::LogsOptions {
                lines,
                level,
                grep,
                timestamps,
                json,
            },
        ),
        Commands::Register(args) => commands::register::run(config_file, data_dir, args),
        Commands::Completions { shell } => {
            generate(shell, &mut Cli::command(), "nexus", &mut std::io::stdout());
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
