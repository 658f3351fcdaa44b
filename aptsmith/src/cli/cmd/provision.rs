use std::process::ExitCode;

use tracing::{debug, error};

use crate::{
    comm::ssh::SshConnection,
    config::ConfigPath,
    context::Context,
    provisioner::{Provision, apt::Apt},
    ui::ConsoleUi,
};

pub fn run(cmd: super::Commands) -> ExitCode {
    match cmd {
        super::Commands::Provision {
            host,
            port,
            user,
            key,
            path,
        } => {
            let config_path = match ConfigPath::from_dir(&path) {
                Some(p) => {
                    debug!("Loading config from {}", p);
                    p
                }
                _ => {
                    error!("Failed to find config file");
                    return ExitCode::FAILURE;
                }
            };

            let mut config = match config_path.load() {
                Ok(config) => config,
                Err(err) => {
                    error!(error = %err, "Failed to load config file");
                    return ExitCode::FAILURE;
                }
            };

            if let Err(err) = config.prepare() {
                error!(error = %err, "Failed to prepare config");
                return ExitCode::FAILURE;
            }
            debug!("Loaded: {:#?}", &config);

            // Let ctrl-c interrupt the run between output lines
            let ctx = Context::new();
            if let Err(err) = ctrlc::set_handler({
                let ctx = ctx.clone();
                move || ctx.cancel()
            }) {
                error!(error = %err, "Could not set signal handler");
                return ExitCode::FAILURE;
            }

            let mut ssh = match SshConnection::new(&host, &user, &key, port) {
                Ok(ssh) => ssh,
                Err(err) => {
                    error!(error = %err, "Failed to reach the remote machine");
                    return ExitCode::FAILURE;
                }
            };

            match Apt::new(config).run(&ctx, &ConsoleUi, &mut ssh) {
                Err(err) => {
                    error!(error = %err, "Provisioning failed");
                    ExitCode::FAILURE
                }
                _ => ExitCode::SUCCESS,
            }
        }
        _ => panic!(),
    }
}
