//! Abstractions for moving files to and running commands on the remote
//! machine being provisioned.

use regex::Regex;
use std::path::Path;

use crate::{context::Context, ui::Ui};

pub mod ssh;

#[derive(thiserror::Error, Debug)]
pub enum CommError {
    #[error("channel failure: `{0}`")]
    Ssh(#[from] ssh2::Error),
    #[error("local filesystem failure during transfer: `{0}`")]
    Io(#[from] std::io::Error),
    #[error("invalid exclude pattern: `{0}`")]
    Pattern(#[from] regex::Error),
    #[error("gave up connecting to the remote machine")]
    ConnectTimeout,
    #[error("operation cancelled")]
    Cancelled,
}

/// Moves files and runs commands against the remote machine. Provisioners
/// only ever see this trait, so tests can substitute an in-memory fake.
pub trait Communicator {
    /// Upload the given bytes to a remote path with the given permissions.
    fn upload(&mut self, dest: &str, source: &[u8], mode: i32) -> Result<(), CommError>;

    /// Recursively upload a local directory tree to the remote path,
    /// skipping files whose names match any exclude pattern.
    fn upload_dir(&mut self, dest: &str, source: &Path, excludes: &[String])
    -> Result<(), CommError>;

    /// Recursively download a remote directory tree into a local directory,
    /// skipping files whose names match any exclude pattern.
    fn download_dir(
        &mut self,
        source: &str,
        dest: &Path,
        excludes: &[String],
    ) -> Result<(), CommError>;

    /// Run a command on the remote machine, forwarding its output to the
    /// given sink line by line. Returns the command's exit status.
    fn exec(&mut self, ctx: &Context, ui: &dyn Ui, cmdline: &str) -> Result<i32, CommError>;
}

/// Whether a file name matches any of the given exclude patterns.
fn excluded(name: &str, excludes: &[String]) -> Result<bool, CommError> {
    for pattern in excludes {
        if Regex::new(pattern)?.is_match(name) {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_excluded() {
        let excludes = vec!["\\.partial$".to_string()];

        assert!(excluded("curl_8.5.deb.partial", &excludes).unwrap());
        assert!(!excluded("curl_8.5.deb", &excludes).unwrap());
        assert!(!excluded("anything", &[]).unwrap());
    }
}
