use std::path::Path;

use super::{Provision, ProvisionError, run_remote};
use crate::{
    comm::Communicator,
    config::ProvisionConfig,
    context::Context,
    ui::Ui,
};

/// Remote path of the APT package cache.
const REMOTE_CACHE_DIR: &str = "/var/cache/apt/archives";

/// Remote directory holding package trust keys.
const REMOTE_TRUST_DIR: &str = "/etc/apt/trusted.gpg.d";

/// Remote path of the generated source list.
const REMOTE_SOURCES_LIST: &str = "/etc/apt/sources.list.d/packer.list";

/// Freshly booted machines may not have name resolution up yet, which would
/// fail the first index refresh. Poll until the resolver answers.
const DNS_WAIT_COMMAND: &str = "/bin/sh -c 'for i in $(seq 100); do resolvectl query deb.debian.org >/dev/null && break; sleep 0.1; done; resolvectl query deb.debian.org'";

/// Configures the APT package manager on the remote machine: seeds its
/// package cache from the host, installs trust keys and package sources,
/// installs packages, and pulls newly downloaded archives back into the
/// host cache.
#[derive(Debug)]
pub struct Apt {
    config: ProvisionConfig,
}

impl Apt {
    /// Create a provisioner from a prepared config.
    pub fn new(config: ProvisionConfig) -> Self {
        Self { config }
    }

    /// Seed the remote package cache with the host's, so packages already
    /// downloaded on the host aren't fetched again.
    fn upload_host_cache(
        &self,
        ui: &dyn Ui,
        comm: &mut dyn Communicator,
    ) -> Result<(), ProvisionError> {
        let cache = match std::fs::metadata(&self.config.cache_dir) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                ui.say(
                    "Host APT package cache not found, likely not running on a debian based host. Proceeding regardless",
                );
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        if cache.is_dir() {
            comm.upload_dir(REMOTE_CACHE_DIR, Path::new(&self.config.cache_dir), &[])
                .map_err(ProvisionError::transfer)?;
        }
        Ok(())
    }

    /// Upload each configured trust key into the remote keyring directory.
    fn upload_trust_keys(
        &self,
        ui: &dyn Ui,
        comm: &mut dyn Communicator,
    ) -> Result<(), ProvisionError> {
        for key in &self.config.keys {
            let content = match std::fs::read(key) {
                Ok(content) => content,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    ui.say(&format!(
                        "Package trust key '{key}' doesn't exist, likely not running on a debian based host. Skipping transfer."
                    ));
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            let Some(name) = Path::new(key).file_name() else {
                continue;
            };

            if let Err(err) = comm.upload(
                &format!("{}/{}", REMOTE_TRUST_DIR, name.to_string_lossy()),
                &content,
                0o644,
            ) {
                ui.error(&format!("Failed to upload APT key {key}"));
                return Err(ProvisionError::transfer(err));
            }
        }
        Ok(())
    }

    /// Block until the remote machine can resolve package mirrors.
    fn wait_remote_dns(
        &self,
        ctx: &Context,
        ui: &dyn Ui,
        comm: &mut dyn Communicator,
    ) -> Result<(), ProvisionError> {
        run_remote(ctx, ui, comm, DNS_WAIT_COMMAND)
    }

    fn upload_source_list(&self, comm: &mut dyn Communicator) -> Result<(), ProvisionError> {
        let content = self.config.sources.join("\n") + "\n";
        comm.upload(REMOTE_SOURCES_LIST, content.as_bytes(), 0o644)
            .map_err(ProvisionError::transfer)
    }

    fn update_package_index(
        &self,
        ctx: &Context,
        ui: &dyn Ui,
        comm: &mut dyn Communicator,
    ) -> Result<(), ProvisionError> {
        run_remote(ctx, ui, comm, "/usr/bin/apt-get update")
    }

    fn install_packages(
        &self,
        ctx: &Context,
        ui: &dyn Ui,
        comm: &mut dyn Communicator,
    ) -> Result<(), ProvisionError> {
        run_remote(
            ctx,
            ui,
            comm,
            &format!(
                "DEBIAN_FRONTEND=noninteractive /usr/bin/apt-get install -y --no-install-recommends {}",
                self.config.packages.join(" ")
            ),
        )
    }

    /// Pull archives the remote downloaded during install back into the
    /// host cache, so the next build starts warm. Files already present in
    /// the host cache are never overwritten.
    fn update_host_cache(
        &self,
        ui: &dyn Ui,
        comm: &mut dyn Communicator,
    ) -> Result<(), ProvisionError> {
        match std::fs::metadata(&self.config.cache_dir) {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                ui.say("Skipping updating package cache, likely not running on a debian based host.");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }

        // Removed on drop, whatever happens below
        let staging = tempfile::Builder::new()
            .prefix("archives-")
            .tempdir()
            .map_err(|err| {
                ui.error("APT cache update: failed to create tempdir");
                ProvisionError::LocalIo(err)
            })?;

        if let Err(err) = comm.download_dir(REMOTE_CACHE_DIR, staging.path(), &[]) {
            ui.error(&format!(
                "APT cache update: failed to download archives to {}",
                staging.path().display()
            ));
            return Err(ProvisionError::transfer(err));
        }

        if let Err(err) = merge_archives(staging.path(), Path::new(&self.config.cache_dir)) {
            ui.error(&format!("APT cache update: {err}"));
            return Err(err.into());
        }

        Ok(())
    }

    fn clean_remote_cache(
        &self,
        ctx: &Context,
        ui: &dyn Ui,
        comm: &mut dyn Communicator,
    ) -> Result<(), ProvisionError> {
        run_remote(ctx, ui, comm, "/usr/bin/apt-get clean")
    }
}

/// Move `.deb` files out of `staging` into `cache_dir`, skipping any that
/// already exist there.
fn merge_archives(staging: &Path, cache_dir: &Path) -> Result<(), std::io::Error> {
    for entry in std::fs::read_dir(staging)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }

        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "deb") {
            let dest = cache_dir.join(entry.file_name());
            if dest.exists() {
                continue;
            }

            // The staging dir can live on another filesystem, where a plain
            // rename fails
            if std::fs::rename(&path, &dest).is_err() {
                std::fs::copy(&path, &dest)?;
                std::fs::remove_file(&path)?;
            }
        }
    }
    Ok(())
}

impl Provision for Apt {
    fn run(
        &self,
        ctx: &Context,
        ui: &dyn Ui,
        comm: &mut dyn Communicator,
    ) -> Result<(), ProvisionError> {
        ui.say("Provisioning with APT...");

        if let Err(err) = self.upload_host_cache(ui, comm) {
            ui.error(&format!(
                "Failed to upload APT cache from {}",
                self.config.cache_dir
            ));
            return Err(err);
        }

        self.upload_trust_keys(ui, comm)?;

        if let Err(err) = self.wait_remote_dns(ctx, ui, comm) {
            ui.error("Failed waiting for domain name resolution");
            return Err(err);
        }

        if !self.config.sources.is_empty() {
            if let Err(err) = self.upload_source_list(comm) {
                ui.error("Failed to upload APT source list");
                return Err(err);
            }
            if let Err(err) = self.update_package_index(ctx, ui, comm) {
                ui.error("apt-get update failed");
                return Err(err);
            }
        }

        if let Err(err) = self.install_packages(ctx, ui, comm) {
            ui.error("apt-get install failed");
            return Err(err);
        }

        self.update_host_cache(ui, comm)?;

        // A failed cache clean shouldn't sink the whole run
        if let Err(err) = self.clean_remote_cache(ctx, ui, comm) {
            ui.error(&format!("apt-get clean failed, ignoring: {err}"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::CommError;
    use std::{cell::RefCell, collections::HashMap, path::PathBuf};

    #[derive(Default)]
    struct RecordingUi {
        messages: RefCell<Vec<String>>,
        errors: RefCell<Vec<String>>,
    }

    impl Ui for RecordingUi {
        fn say(&self, message: &str) {
            self.messages.borrow_mut().push(message.to_string());
        }

        fn error(&self, message: &str) {
            self.errors.borrow_mut().push(message.to_string());
        }
    }

    /// In-memory communicator that records calls and simulates remote
    /// command results.
    #[derive(Default)]
    struct FakeCommunicator {
        uploads: Vec<(String, Vec<u8>)>,
        upload_dirs: Vec<(String, PathBuf)>,
        download_dirs: Vec<String>,
        commands: Vec<String>,

        /// Exit statuses keyed by command substring; unmatched commands
        /// succeed
        statuses: HashMap<String, i32>,

        /// Files materialized into the destination of a directory download
        download_files: Vec<(String, Vec<u8>)>,
    }

    impl Communicator for FakeCommunicator {
        fn upload(&mut self, dest: &str, source: &[u8], _mode: i32) -> Result<(), CommError> {
            self.uploads.push((dest.to_string(), source.to_vec()));
            Ok(())
        }

        fn upload_dir(
            &mut self,
            dest: &str,
            source: &Path,
            _excludes: &[String],
        ) -> Result<(), CommError> {
            self.upload_dirs.push((dest.to_string(), source.to_path_buf()));
            Ok(())
        }

        fn download_dir(
            &mut self,
            source: &str,
            dest: &Path,
            _excludes: &[String],
        ) -> Result<(), CommError> {
            self.download_dirs.push(source.to_string());
            for (name, content) in &self.download_files {
                std::fs::write(dest.join(name), content).unwrap();
            }
            Ok(())
        }

        fn exec(&mut self, ctx: &Context, _ui: &dyn Ui, cmdline: &str) -> Result<i32, CommError> {
            if ctx.is_cancelled() {
                return Err(CommError::Cancelled);
            }

            self.commands.push(cmdline.to_string());
            for (pattern, status) in &self.statuses {
                if cmdline.contains(pattern.as_str()) {
                    return Ok(*status);
                }
            }
            Ok(0)
        }
    }

    fn config(packages: &[&str], sources: &[&str], cache_dir: &Path) -> ProvisionConfig {
        ProvisionConfig {
            packages: packages.iter().map(|p| p.to_string()).collect(),
            sources: sources.iter().map(|s| s.to_string()).collect(),
            keys: Vec::new(),
            cache_dir: cache_dir.display().to_string(),
        }
    }

    #[test]
    fn test_install_without_sources() {
        let tmp = tempfile::tempdir().unwrap();
        let apt = Apt::new(config(&["curl"], &[], &tmp.path().join("missing")));
        let ui = RecordingUi::default();
        let mut comm = FakeCommunicator::default();

        apt.run(&Context::new(), &ui, &mut comm).unwrap();

        assert_eq!(
            comm.commands[0],
            "/bin/sh -c 'for i in $(seq 100); do resolvectl query deb.debian.org >/dev/null && break; sleep 0.1; done; resolvectl query deb.debian.org'"
        );
        assert!(comm.commands.contains(
            &"DEBIAN_FRONTEND=noninteractive /usr/bin/apt-get install -y --no-install-recommends curl"
                .to_string()
        ));

        // No sources: no source list upload and no index refresh
        assert!(comm.uploads.is_empty());
        assert!(!comm.commands.iter().any(|c| c.contains("apt-get update")));

        // Missing host cache: neither direction of the cache sync runs
        assert!(comm.upload_dirs.is_empty());
        assert!(comm.download_dirs.is_empty());
        assert_eq!(ui.errors.borrow().len(), 0);
    }

    #[test]
    fn test_package_order_preserved() {
        let tmp = tempfile::tempdir().unwrap();
        let apt = Apt::new(config(
            &["zsh", "curl", "git"],
            &[],
            &tmp.path().join("missing"),
        ));
        let ui = RecordingUi::default();
        let mut comm = FakeCommunicator::default();

        apt.run(&Context::new(), &ui, &mut comm).unwrap();

        assert!(
            comm.commands
                .iter()
                .any(|c| c.ends_with("--no-install-recommends zsh curl git"))
        );
    }

    #[test]
    fn test_source_list_upload() {
        let tmp = tempfile::tempdir().unwrap();
        let apt = Apt::new(config(
            &["curl"],
            &[
                "deb http://deb.debian.org/debian bookworm main",
                "deb http://deb.debian.org/debian bookworm-updates main",
            ],
            &tmp.path().join("missing"),
        ));
        let ui = RecordingUi::default();
        let mut comm = FakeCommunicator::default();

        apt.run(&Context::new(), &ui, &mut comm).unwrap();

        assert_eq!(comm.uploads.len(), 1);
        assert_eq!(comm.uploads[0].0, "/etc/apt/sources.list.d/packer.list");
        assert_eq!(
            comm.uploads[0].1,
            b"deb http://deb.debian.org/debian bookworm main\ndeb http://deb.debian.org/debian bookworm-updates main\n"
        );

        // Index refresh runs after the DNS wait and before the install
        let update = comm
            .commands
            .iter()
            .position(|c| c == "/usr/bin/apt-get update")
            .unwrap();
        let install = comm
            .commands
            .iter()
            .position(|c| c.contains("apt-get install"))
            .unwrap();
        assert!(update > 0);
        assert!(update < install);
    }

    #[test]
    fn test_trust_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let key = tmp.path().join("docker.asc");
        std::fs::write(&key, b"-----BEGIN PGP PUBLIC KEY BLOCK-----").unwrap();

        let mut config = config(&["curl"], &[], &tmp.path().join("missing"));
        config.keys = vec![
            key.display().to_string(),
            tmp.path().join("nonexistent.asc").display().to_string(),
        ];
        let apt = Apt::new(config);
        let ui = RecordingUi::default();
        let mut comm = FakeCommunicator::default();

        apt.run(&Context::new(), &ui, &mut comm).unwrap();

        // The existing key lands under the remote keyring by basename; the
        // missing one is skipped with a notice instead of failing the run
        assert_eq!(comm.uploads.len(), 1);
        assert_eq!(comm.uploads[0].0, "/etc/apt/trusted.gpg.d/docker.asc");
        assert_eq!(comm.uploads[0].1, b"-----BEGIN PGP PUBLIC KEY BLOCK-----");
        assert!(
            ui.messages
                .borrow()
                .iter()
                .any(|m| m.contains("nonexistent.asc") && m.contains("Skipping"))
        );
    }

    #[test]
    fn test_cache_merge_no_clobber() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = tmp.path().join("cache");
        std::fs::create_dir(&cache).unwrap();
        std::fs::write(cache.join("curl_8.5.deb"), b"host copy").unwrap();

        let apt = Apt::new(config(&["curl"], &[], &cache));
        let ui = RecordingUi::default();
        let mut comm = FakeCommunicator {
            download_files: vec![
                ("curl_8.5.deb".to_string(), b"remote copy".to_vec()),
                ("git_2.43.deb".to_string(), b"remote copy".to_vec()),
                ("lock".to_string(), b"".to_vec()),
            ],
            ..Default::default()
        };

        apt.run(&Context::new(), &ui, &mut comm).unwrap();

        // The host cache was uploaded and the remote cache pulled back
        assert_eq!(
            comm.upload_dirs,
            vec![("/var/cache/apt/archives".to_string(), cache.clone())]
        );
        assert_eq!(comm.download_dirs, vec!["/var/cache/apt/archives".to_string()]);

        // New archives are merged in, existing ones are never overwritten,
        // and non-deb files stay behind
        assert_eq!(std::fs::read(cache.join("curl_8.5.deb")).unwrap(), b"host copy");
        assert_eq!(std::fs::read(cache.join("git_2.43.deb")).unwrap(), b"remote copy");
        assert!(!cache.join("lock").exists());
    }

    #[test]
    fn test_clean_failure_is_not_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let apt = Apt::new(config(&["curl"], &[], &tmp.path().join("missing")));
        let ui = RecordingUi::default();
        let mut comm = FakeCommunicator {
            statuses: HashMap::from([("apt-get clean".to_string(), 1)]),
            ..Default::default()
        };

        apt.run(&Context::new(), &ui, &mut comm).unwrap();

        assert!(
            ui.errors
                .borrow()
                .iter()
                .any(|m| m.contains("apt-get clean failed"))
        );
    }

    #[test]
    fn test_update_failure_aborts() {
        let tmp = tempfile::tempdir().unwrap();
        let apt = Apt::new(config(
            &["curl"],
            &["deb http://deb.debian.org/debian bookworm main"],
            &tmp.path().join("missing"),
        ));
        let ui = RecordingUi::default();
        let mut comm = FakeCommunicator {
            statuses: HashMap::from([("apt-get update".to_string(), 100)]),
            ..Default::default()
        };

        let err = apt.run(&Context::new(), &ui, &mut comm).unwrap_err();

        assert!(matches!(
            err,
            ProvisionError::RemoteCommand { status: 100, .. }
        ));
        assert!(!comm.commands.iter().any(|c| c.contains("apt-get install")));
        assert!(ui.errors.borrow().contains(&"apt-get update failed".to_string()));
    }

    #[test]
    fn test_install_failure_aborts() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = tmp.path().join("cache");
        std::fs::create_dir(&cache).unwrap();

        let apt = Apt::new(config(&["no-such-package"], &[], &cache));
        let ui = RecordingUi::default();
        let mut comm = FakeCommunicator {
            statuses: HashMap::from([("apt-get install".to_string(), 100)]),
            ..Default::default()
        };

        let err = apt.run(&Context::new(), &ui, &mut comm).unwrap_err();

        assert!(matches!(err, ProvisionError::RemoteCommand { .. }));
        // The cache merge-back never ran
        assert!(comm.download_dirs.is_empty());
    }

    #[test]
    fn test_cancellation() {
        let tmp = tempfile::tempdir().unwrap();
        let apt = Apt::new(config(&["curl"], &[], &tmp.path().join("missing")));
        let ui = RecordingUi::default();
        let mut comm = FakeCommunicator::default();

        let ctx = Context::new();
        ctx.cancel();

        let err = apt.run(&ctx, &ui, &mut comm).unwrap_err();
        assert!(matches!(err, ProvisionError::Cancelled));
    }
}
