use ssh2::{ExtendedData, Session};
use std::{
    io::{BufRead, BufReader, Cursor, Write},
    net::TcpStream,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::debug;
use walkdir::WalkDir;

use super::{CommError, Communicator, excluded};
use crate::{context::Context, ui::Ui};

/// Represents an SSH session to the remote machine being provisioned.
pub struct SshConnection {
    pub host: String,
    pub username: String,
    pub private_key: PathBuf,
    pub port: u16,
    pub session: Session,
}

impl SshConnection {
    pub fn new(
        host: &str,
        username: &str,
        private_key: &Path,
        port: u16,
    ) -> Result<SshConnection, CommError> {
        let mut i = 0;
        Ok(loop {
            i += 1;
            debug!("Trying SSH: {}@{}:{}", username, host, port);

            match Self::connect(host, username, private_key, port) {
                Ok(session) => {
                    break SshConnection {
                        host: host.to_string(),
                        username: username.to_string(),
                        private_key: private_key.to_path_buf(),
                        port,
                        session,
                    };
                }
                Err(error) => debug!("{}", error),
            };

            if i > 25 {
                return Err(CommError::ConnectTimeout);
            }

            std::thread::sleep(Duration::from_secs(5));
        })
    }

    fn connect(
        host: &str,
        username: &str,
        private_key: &Path,
        port: u16,
    ) -> Result<Session, CommError> {
        let mut session = Session::new()?;
        session.set_tcp_stream(TcpStream::connect(format!("{host}:{port}"))?);

        session.handshake()?;
        session.userauth_pubkey_file(username, None, private_key, None)?;
        debug!("Established SSH connection");
        Ok(session)
    }
}

impl Communicator for SshConnection {
    fn upload(&mut self, dest: &str, source: &[u8], mode: i32) -> Result<(), CommError> {
        debug!(bytes = source.len(), dest, "Uploading file with scp");
        let mut channel = self
            .session
            .scp_send(Path::new(dest), mode, source.len() as u64, None)?;
        std::io::copy(&mut Cursor::new(source), &mut channel)?;

        channel.send_eof()?;
        channel.wait_eof()?;
        channel.close()?;
        channel.wait_close()?;

        Ok(())
    }

    fn upload_dir(
        &mut self,
        dest: &str,
        source: &Path,
        excludes: &[String],
    ) -> Result<(), CommError> {
        debug!(?source, dest, "Uploading directory over sftp");
        let sftp = self.session.sftp()?;

        // The destination usually exists already
        _ = sftp.mkdir(Path::new(dest), 0o755);

        for entry in WalkDir::new(source).min_depth(1) {
            let entry = entry.map_err(std::io::Error::from)?;
            let relative = entry
                .path()
                .strip_prefix(source)
                .map_err(|_| std::io::Error::other("entry outside source tree"))?;
            let remote = format!("{}/{}", dest, relative.display());

            if entry.file_type().is_dir() {
                _ = sftp.mkdir(Path::new(&remote), 0o755);
            } else if entry.file_type().is_file() {
                if excluded(&entry.file_name().to_string_lossy(), excludes)? {
                    continue;
                }
                let content = std::fs::read(entry.path())?;
                let mut remote_file = sftp.create(Path::new(&remote))?;
                remote_file.write_all(&content)?;
            }
        }
        Ok(())
    }

    fn download_dir(
        &mut self,
        source: &str,
        dest: &Path,
        excludes: &[String],
    ) -> Result<(), CommError> {
        debug!(source, ?dest, "Downloading directory over sftp");
        let sftp = self.session.sftp()?;
        download_tree(&sftp, Path::new(source), dest, excludes)
    }

    fn exec(&mut self, ctx: &Context, ui: &dyn Ui, cmdline: &str) -> Result<i32, CommError> {
        debug!(cmdline, "Executing command over ssh");

        if ctx.is_cancelled() {
            return Err(CommError::Cancelled);
        }

        let mut channel = self.session.channel_session()?;
        channel.handle_extended_data(ExtendedData::Merge)?;
        channel.exec(cmdline)?;

        let mut output = BufReader::new(&mut channel);
        loop {
            if ctx.is_cancelled() {
                return Err(CommError::Cancelled);
            }

            let mut line = String::new();
            match output.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => ui.say(
                    line.strip_suffix("\r\n")
                        .or(line.strip_suffix("\n"))
                        .unwrap_or(&line),
                ),
                Err(err) => return Err(err.into()),
            }
        }

        channel.wait_close()?;
        let exit = channel.exit_status()?;
        debug!("Exit code: {}", exit);
        Ok(exit)
    }
}

/// Mirror a remote directory into a local one over sftp.
fn download_tree(
    sftp: &ssh2::Sftp,
    remote: &Path,
    local: &Path,
    excludes: &[String],
) -> Result<(), CommError> {
    std::fs::create_dir_all(local)?;

    for (path, stat) in sftp.readdir(remote)? {
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
            continue;
        };

        if stat.is_dir() {
            download_tree(sftp, &path, &local.join(&name), excludes)?;
        } else if stat.is_file() {
            if excluded(&name, excludes)? {
                continue;
            }
            let mut remote_file = sftp.open(&path)?;
            let mut local_file = std::fs::File::create(local.join(&name))?;
            std::io::copy(&mut remote_file, &mut local_file)?;
        }
    }
    Ok(())
}
