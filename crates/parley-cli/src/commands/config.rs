//! Configuration management commands.

use parley_core::config::IssueSeverity;
use parley_core::Config;

use crate::ConfigAction;

pub fn handle(action: ConfigAction, config: &Config) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            println!("# Effective configuration");
            println!("# Data directory: {}", config.storage.data_dir().display());
            println!();
            print!("{}", config.to_toml_string()?);
        }
        ConfigAction::Validate => {
            let result = config.validate();
            let errors = result.errors().len();

            for issue in result.errors().into_iter().chain(result.warnings()) {
                let label = match issue.severity {
                    IssueSeverity::Error => "error",
                    IssueSeverity::Warning => "warning",
                };
                println!("{}: {}: {}", label, issue.field, issue.message);
            }

            if errors > 0 {
                anyhow::bail!("configuration has {} error(s)", errors);
            }
            println!("Configuration is valid");
        }
    }
    Ok(())
}
