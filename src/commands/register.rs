use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

use crate::cli::RegisterArgs;
use crate::registry::{NewService, Registry};
use crate::supervisor::Supervisor;

use super::load_context;

impl From<RegisterArgs> for NewService {
    fn from(args: RegisterArgs) -> Self {
        NewService {
            name: args.name,
            description: args.description,
            category: args.category,
            tags: args.tags,
            dependencies: args.dependencies,
            working_directory: args.cwd,
            start_command: args.command,
            stop_command: args.stop_command.unwrap_or_default(),
            port: args.port,
            local_url: args.url,
            healthcheck_url: args.healthcheck_url,
            env_overrides: args.env.into_iter().collect(),
            ..Default::default()
        }
    }
}

pub fn run(config_file: Option<&Path>, data_dir: Option<&Path>, args: RegisterArgs) -> Result<()> {
    let ctx = load_context(config_file, data_dir)?;
    let registry: Arc<dyn Registry> = ctx.registry;
    let supervisor = Supervisor::from_config(&ctx.config, registry);
    let svc = supervisor.register(args.into())?;
    println!("{}", svc.id);
    Ok(())
}
