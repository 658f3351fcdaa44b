//! Provisioners perform configuration work on the remote machine as part of
//! an image build. Each provisioner is one fixed sequence of operations
//! against the remote.

use crate::{
    comm::{CommError, Communicator},
    context::Context,
    ui::Ui,
};

pub mod apt;

#[derive(thiserror::Error, Debug)]
pub enum ProvisionError {
    #[error("local filesystem failure: `{0}`")]
    LocalIo(#[from] std::io::Error),
    #[error("transfer failed: `{0}`")]
    Transfer(#[source] CommError),
    #[error("remote command `{command}` exited with status {status}")]
    RemoteCommand { command: String, status: i32 },
    #[error("remote command `{command}` failed: `{source}`")]
    Channel { command: String, source: CommError },
    #[error("run cancelled")]
    Cancelled,
}

impl ProvisionError {
    /// Classify a channel error raised during a file transfer.
    fn transfer(err: CommError) -> Self {
        match err {
            CommError::Cancelled => ProvisionError::Cancelled,
            other => ProvisionError::Transfer(other),
        }
    }
}

/// Run a remote command, treating a non-zero exit status as failure.
fn run_remote(
    ctx: &Context,
    ui: &dyn Ui,
    comm: &mut dyn Communicator,
    command: &str,
) -> Result<(), ProvisionError> {
    match comm.exec(ctx, ui, command) {
        Ok(0) => Ok(()),
        Ok(status) => Err(ProvisionError::RemoteCommand {
            command: command.to_string(),
            status,
        }),
        Err(CommError::Cancelled) => Err(ProvisionError::Cancelled),
        Err(source) => Err(ProvisionError::Channel {
            command: command.to_string(),
            source,
        }),
    }
}

pub trait Provision {
    fn run(
        &self,
        ctx: &Context,
        ui: &dyn Ui,
        comm: &mut dyn Communicator,
    ) -> Result<(), ProvisionError>;
}
