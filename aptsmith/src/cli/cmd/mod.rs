use std::path::PathBuf;

use crate::config::ConfigPath;

pub mod init;
pub mod provision;

#[derive(clap::Subcommand, Debug, Clone)]
pub enum Commands {
    /// Configure APT on a remote machine
    Provision {
        /// Remote host to provision
        #[clap(long)]
        host: String,

        /// SSH port on the remote host
        #[clap(long, default_value_t = 22)]
        port: u16,

        /// SSH username
        #[clap(long, default_value = "root")]
        user: String,

        /// Path to the SSH private key
        #[clap(long)]
        key: PathBuf,

        /// The context directory (containing an aptsmith config file)
        #[clap(index = 1, default_value = ".")]
        path: String,
    },

    /// Initialize the current directory as a new aptsmith project
    Init {
        /// Config file format to generate
        #[clap(long, value_enum)]
        format: Option<ConfigPath>,
    },
}
