use thiserror::Error;

use crate::config::model::{NexusConfig, PortRange};

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("port range {range} is empty (start must not exceed end)")]
    EmptyRange { range: PortRange },

    #[error("port range `{category}` = {range} is empty (start must not exceed end)")]
    EmptyCategoryRange { category: String, range: PortRange },

    #[error("port range `{category}` = {range} overlaps `{other}` = {other_range}")]
    OverlappingRanges {
        category: String,
        range: PortRange,
        other: String,
        other_range: PortRange,
    },

    #[error("supervisor.workers must be at least 1")]
    NoWorkers,

    #[error("controller port {port} lies inside the service port range {range}")]
    ControllerInRange { port: u16, range: PortRange },
}

/// Check the config for inconsistencies. Returns every problem found.
pub fn validate(config: &NexusConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    let default_range = config.ports.default_range();
    if default_range.start() > default_range.end() {
        errors.push(ConfigError::EmptyRange {
            range: default_range,
        });
    }

    let ranges: Vec<(&String, &PortRange)> = config.ports.ranges.iter().collect();
    for (i, (category, range)) in ranges.iter().enumerate() {
        if range.start() > range.end() {
            errors.push(ConfigError::EmptyCategoryRange {
                category: (*category).clone(),
                range: **range,
            });
            continue;
        }
        // Category bands must be disjoint
        for (other, other_range) in ranges.iter().skip(i + 1) {
            if range.start() <= other_range.end() && other_range.start() <= range.end() {
                errors.push(ConfigError::OverlappingRanges {
                    category: (*category).clone(),
                    range: **range,
                    other: (*other).clone(),
                    other_range: **other_range,
                });
            }
        }
    }

    if config.supervisor.workers == 0 {
        errors.push(ConfigError::NoWorkers);
    }

    if default_range.contains(config.controller.port) {
        errors.push(ConfigError::ControllerInRange {
            port: config.controller.port,
            range: default_range,
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
