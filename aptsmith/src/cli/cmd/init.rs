use clap::ValueEnum;
use console::Style;
use dialoguer::{Confirm, Select, theme::ColorfulTheme};
use std::process::ExitCode;
use tracing::error;

use crate::config::{ConfigPath, ProvisionConfig};

/// Get the current theme for prompts.
pub fn theme() -> ColorfulTheme {
    ColorfulTheme {
        values_style: Style::new().yellow().dim(),
        ..ColorfulTheme::default()
    }
}

pub fn run(cmd: super::Commands) -> ExitCode {
    match cmd {
        super::Commands::Init { format } => {
            let config_path = match format {
                Some(format) => format,
                None => {
                    let formats = ConfigPath::value_variants();
                    match Select::with_theme(&theme())
                        .with_prompt("Choose a config format")
                        .items(formats)
                        .default(0)
                        .interact()
                    {
                        Ok(choice) => formats[choice].clone(),
                        Err(err) => {
                            error!(error = %err, "Failed to read selection");
                            return ExitCode::FAILURE;
                        }
                    }
                }
            };

            if let Some(existing) = ConfigPath::from_dir(".") {
                match Confirm::with_theme(&theme())
                    .with_prompt(format!("{existing} already exists. Overwrite?"))
                    .interact()
                {
                    Ok(true) => {}
                    _ => return ExitCode::SUCCESS,
                }
            }

            // A starter config to edit from
            let config = ProvisionConfig {
                packages: vec!["curl".to_string()],
                ..Default::default()
            };

            match config_path.write(&config) {
                Ok(()) => ExitCode::SUCCESS,
                Err(err) => {
                    error!(error = %err, "Failed to write config file");
                    ExitCode::FAILURE
                }
            }
        }
        _ => panic!(),
    }
}
