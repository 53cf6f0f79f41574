//! End-to-end reconciliation against the in-memory host.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use wslkit::checksum::{self, ChecksumAlgorithm};
use wslkit::desired::{
    FileSpec, InstanceEnsure, InstanceSpec, PackageSpec, Presence, ServiceEnsure, ServiceSpec,
    UserSpec,
};
use wslkit::exec::FakeHost;
use wslkit::fetch::{ArtifactFetcher, Transport};
use wslkit::observed::{InitSystem, PackageManager};
use wslkit::{DesiredState, Error, ReconcileOptions, Reconciler, RetryConfig, Secret};

fn options() -> ReconcileOptions {
    ReconcileOptions {
        start_retry: RetryConfig {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            backoff_factor: 1.0,
            max_delay: Duration::from_millis(1),
        },
        ..ReconcileOptions::default()
    }
}

struct Harness {
    host: Arc<FakeHost>,
    reconciler: Reconciler,
    staging: tempfile::TempDir,
}

impl Harness {
    fn new(host: FakeHost) -> Self {
        let staging = tempfile::tempdir().unwrap();
        let host = Arc::new(host);
        let reconciler = Reconciler::new(
            Box::new(Arc::clone(&host)),
            ArtifactFetcher::new(staging.path()),
        );
        Self {
            host,
            reconciler,
            staging,
        }
    }

    fn with_transport(host: FakeHost, transport: impl Transport + 'static) -> Self {
        let staging = tempfile::tempdir().unwrap();
        let host = Arc::new(host);
        let fetcher = ArtifactFetcher::with_transport(staging.path(), Box::new(transport))
            .with_retry(RetryConfig::no_retry());
        let reconciler = Reconciler::new(Box::new(Arc::clone(&host)), fetcher);
        Self {
            host,
            reconciler,
            staging,
        }
    }

    fn apply(&self, desired: impl Into<DesiredState>) -> wslkit::ReconciliationResult {
        self.reconciler.reconcile(&desired.into(), &options()).unwrap()
    }

    /// Apply twice; the second pass must be a no-op.
    fn converge(&self, desired: impl Into<DesiredState>) -> wslkit::ReconciliationResult {
        let desired = desired.into();
        let first = self.reconciler.reconcile(&desired, &options()).unwrap();
        let second = self.reconciler.reconcile(&desired, &options()).unwrap();
        assert!(!second.changed, "second pass changed: {:?}", second.plan);
        assert!(second.diagnostics.is_empty());
        first
    }
}

fn ubuntu() -> FakeHost {
    FakeHost::new()
        .with_distribution("Ubuntu", 2, true)
        .with_package_manager("Ubuntu", PackageManager::Apt)
}

/// Serves one body for every URL.
struct OneBody(Vec<u8>);

impl Transport for OneBody {
    fn download(&self, _url: &str, dest: &Path) -> wslkit::Result<u64> {
        fs::write(dest, &self.0).map_err(|e| Error::io(dest, e))?;
        Ok(self.0.len() as u64)
    }
}

#[test]
fn test_file_converges() {
    let h = Harness::new(ubuntu().with_file("Ubuntu", "/etc/motd", "Y"));
    let spec = FileSpec::new("Ubuntu", "/etc/motd")
        .content("X")
        .mode("600")
        .owner("root:adm");

    let first = h.converge(spec);
    assert!(first.changed);
    assert_eq!(h.host.file_content("Ubuntu", "/etc/motd").as_deref(), Some(&b"X"[..]));
    assert_eq!(h.host.file_mode("Ubuntu", "/etc/motd").as_deref(), Some("0600"));
    assert_eq!(
        h.host.file_owner("Ubuntu", "/etc/motd"),
        Some(("root".to_string(), "adm".to_string()))
    );
    let fields: Vec<&str> = first.diff.iter().map(|c| c.field.as_str()).collect();
    assert!(fields.contains(&"content"));
    assert!(fields.contains(&"mode"));
}

#[test]
fn test_content_change_is_a_single_write() {
    let h = Harness::new(ubuntu().with_file("Ubuntu", "/etc/motd", "Y"));
    let result = h.apply(FileSpec::new("Ubuntu", "/etc/motd").content("X"));
    assert_eq!(result.diagnostics.len(), 1);
    assert_eq!(result.diagnostics[0].operation, "write content of /etc/motd");
    // Stdin is never part of the recorded command
    assert!(!result.diagnostics[0].command.as_deref().unwrap_or_default().contains('X'));
}

fn appended(path: &str, content: &str) -> FileSpec {
    let mut spec = FileSpec::new("Ubuntu", path).content(content);
    spec.append = true;
    spec
}

#[test]
fn test_append_to_large_file_converges() {
    let mut body = vec![b'#'; 70 * 1024];
    body.extend_from_slice(b"\nmarker\n");
    let len = body.len();
    let h = Harness::new(ubuntu().with_file("Ubuntu", "/var/log/big.log", body));

    let first = h.converge(appended("/var/log/big.log", "marker\n"));
    assert!(!first.changed);
    assert_eq!(h.host.file_content("Ubuntu", "/var/log/big.log").map(|b| b.len()), Some(len));

    let second = h.converge(appended("/var/log/big.log", "extra\n"));
    assert!(second.changed);
    assert_eq!(
        h.host.file_content("Ubuntu", "/var/log/big.log").map(|b| b.len()),
        Some(len + "extra\n".len())
    );
}

#[test]
fn test_append_to_binary_file_converges() {
    let mut body = vec![0xff, 0xfe, 0x00, 0x80];
    body.extend_from_slice(b"header\nmarker\n");
    let len = body.len();
    let h = Harness::new(ubuntu().with_file("Ubuntu", "/opt/blob.dat", body));

    let first = h.converge(appended("/opt/blob.dat", "marker\n"));
    assert!(!first.changed);
    assert_eq!(h.host.file_content("Ubuntu", "/opt/blob.dat").map(|b| b.len()), Some(len));
}

#[test]
fn test_symlinked_file_converges_through_link() {
    let h = Harness::new(
        ubuntu()
            .with_file("Ubuntu", "/etc/real.conf", "old\n")
            .with_symlink("Ubuntu", "/etc/app.conf", "/etc/real.conf"),
    );

    let first = h.converge(FileSpec::new("Ubuntu", "/etc/app.conf").content("new\n").mode("600"));
    assert!(first.changed);
    assert!(h.host.is_symlink("Ubuntu", "/etc/app.conf"));
    assert_eq!(
        h.host.file_content("Ubuntu", "/etc/real.conf").as_deref(),
        Some(&b"new\n"[..])
    );
    assert_eq!(h.host.file_mode("Ubuntu", "/etc/real.conf").as_deref(), Some("0600"));
}

#[test]
fn test_directory_tree_removed() {
    let h = Harness::new(ubuntu().with_file("Ubuntu", "/srv/cache/a.bin", "a"));
    let mut spec = FileSpec::new("Ubuntu", "/srv/cache").state(wslkit::desired::FileEnsure::Absent);
    spec.recursive = true;
    h.converge(spec);
    assert!(!h.host.path_exists("Ubuntu", "/srv/cache"));
    assert!(h.host.path_exists("Ubuntu", "/srv"));
}

#[test]
fn test_package_install_and_remove() {
    let h = Harness::new(ubuntu().with_available_package("Ubuntu", "curl", "8.5.0-2"));

    let installed = h.converge(PackageSpec::new("Ubuntu", "curl"));
    assert!(installed.changed);
    assert_eq!(h.host.package_version("Ubuntu", "curl").as_deref(), Some("8.5.0-2"));

    let removed = h.converge(PackageSpec::new("Ubuntu", "curl").state(Presence::Absent));
    assert!(removed.changed);
    assert!(h.host.package_version("Ubuntu", "curl").is_none());
}

#[test]
fn test_absent_package_that_is_not_installed() {
    let h = Harness::new(ubuntu());
    let result = h.apply(PackageSpec::new("Ubuntu", "telnet").state(Presence::Absent));
    assert!(!result.changed);
    assert!(result.diagnostics.is_empty());
    assert_eq!(h.host.count_invocations(|inv| inv.program == "apt-get"), 0);
}

#[test]
fn test_pinned_version_change() {
    let h = Harness::new(ubuntu().with_package("Ubuntu", "curl", "7.81.0-1"));
    let result = h.converge(PackageSpec::new("Ubuntu", "curl").version("8.5.0-2"));
    assert_eq!(result.diagnostics[0].operation, "change curl from 7.81.0-1 to 8.5.0-2");
    assert_eq!(h.host.package_version("Ubuntu", "curl").as_deref(), Some("8.5.0-2"));
}

#[test]
fn test_cache_refresh_alone_is_not_a_change() {
    let h = Harness::new(ubuntu().with_package("Ubuntu", "git", "2.43.0-1"));
    let mut spec = PackageSpec::new("Ubuntu", "git");
    spec.update_cache = true;

    let result = h.apply(spec);
    assert!(!result.changed);
    assert_eq!(h.host.cache_updates("Ubuntu"), 1);
}

#[test]
fn test_service_enabled_only() {
    let h = Harness::new(ubuntu().with_service("Ubuntu", "nginx", false, false));
    let result = h.converge(ServiceSpec::new("Ubuntu", "nginx").enabled(true));

    assert!(result.changed);
    assert_eq!(result.diff.len(), 1);
    assert_eq!(result.diff[0].field, "enabled");
    assert_eq!(h.host.service_running("Ubuntu", "nginx"), Some(false));
    assert_eq!(h.host.service_enabled("Ubuntu", "nginx"), Some(true));
}

#[test]
fn test_service_stopped_before_disabled() {
    let h = Harness::new(ubuntu().with_service("Ubuntu", "nginx", true, true));
    let result = h.converge(
        ServiceSpec::new("Ubuntu", "nginx")
            .state(ServiceEnsure::Stopped)
            .enabled(false),
    );

    let order: Vec<&str> = result.diagnostics.iter().map(|d| d.operation.as_str()).collect();
    assert_eq!(order, vec!["stop nginx", "disable nginx"]);
    assert_eq!(h.host.service_running("Ubuntu", "nginx"), Some(false));
    assert_eq!(h.host.service_enabled("Ubuntu", "nginx"), Some(false));
}

#[test]
fn test_sysvinit_service() {
    let h = Harness::new(
        FakeHost::new()
            .with_distribution("Devuan", 2, true)
            .with_sysv_service("Devuan", "ssh", false, &[]),
    );
    let spec = ServiceSpec::new("Devuan", "ssh")
        .init(InitSystem::Sysvinit)
        .state(ServiceEnsure::Started)
        .enabled(true);

    h.converge(spec);
    assert_eq!(h.host.service_running("Devuan", "ssh"), Some(true));
    assert_eq!(h.host.service_runlevels("Devuan", "ssh"), vec!["3".to_string()]);
}

#[test]
fn test_user_converges() {
    let h = Harness::new(ubuntu().with_group("Ubuntu", "docker"));
    let mut spec = UserSpec::new("Ubuntu", "alice").groups(["docker"]).sudo(true);
    spec.shell = Some("/bin/bash".into());

    let first = h.converge(spec);
    assert!(first.changed);
    assert!(h.host.user_exists("Ubuntu", "alice"));
    assert_eq!(h.host.user_groups("Ubuntu", "alice"), vec!["docker".to_string()]);
    assert_eq!(h.host.user_shell("Ubuntu", "alice").as_deref(), Some("/bin/bash"));
    assert!(!h.host.user_locked("Ubuntu", "alice"));
    assert_eq!(
        h.host.file_content("Ubuntu", "/etc/sudoers.d/alice").as_deref(),
        Some(&b"alice ALL=(ALL) NOPASSWD:ALL\n"[..])
    );
    assert_eq!(h.host.file_mode("Ubuntu", "/etc/sudoers.d/alice").as_deref(), Some("0440"));

    let revoked = h.apply(UserSpec::new("Ubuntu", "alice").sudo(false));
    assert!(revoked.changed);
    assert!(!h.host.path_exists("Ubuntu", "/etc/sudoers.d/alice"));
}

#[test]
fn test_user_groups_exact_and_append() {
    let h = Harness::new(
        ubuntu()
            .with_group("Ubuntu", "video")
            .with_user("Ubuntu", "bob", 1000, &["docker", "sudo"]),
    );

    let mut append = UserSpec::new("Ubuntu", "bob").groups(["video"]);
    append.append_groups = true;
    h.converge(append);
    assert_eq!(h.host.user_groups("Ubuntu", "bob"), vec!["docker", "sudo", "video"]);

    h.converge(UserSpec::new("Ubuntu", "bob").groups(["video"]));
    assert_eq!(h.host.user_groups("Ubuntu", "bob"), vec!["video"]);
}

#[test]
fn test_password_is_written_every_run() {
    let h = Harness::new(ubuntu());
    let mut spec = UserSpec::new("Ubuntu", "carol");
    spec.password = Some(Secret::new("$6$salt$hash"));
    let desired = DesiredState::from(spec);

    let first = h.reconciler.reconcile(&desired, &options()).unwrap();
    let second = h.reconciler.reconcile(&desired, &options()).unwrap();
    assert!(first.changed);
    assert!(second.changed);
    assert_eq!(h.host.user_password("Ubuntu", "carol").as_deref(), Some("$6$salt$hash"));

    // The hash travels on stdin only
    let chpasswd = h
        .host
        .invocations()
        .into_iter()
        .find(|inv| inv.program == "chpasswd")
        .unwrap();
    assert!(!chpasswd.command_line().contains("hash"));
    assert_eq!(chpasswd.stdin_str().as_deref(), Some("carol:$6$salt$hash\n"));
    assert!(!format!("{:?}", second.diagnostics).contains("$6$"));
}

#[test]
fn test_import_run_then_absent() {
    let h = Harness::new(FakeHost::new());
    let source = h.staging.path().join("rootfs.tar");
    fs::write(&source, b"rootfs").unwrap();
    let sum = checksum::compute_bytes(b"rootfs", ChecksumAlgorithm::Sha256);

    let spec = InstanceSpec::import("Dev", source.to_string_lossy(), "C:\\wsl\\Dev")
        .checksum(sum, ChecksumAlgorithm::Sha256)
        .state(InstanceEnsure::Run);
    let result = h.converge(spec.clone());
    assert!(result.changed);
    assert!(h.host.is_running("Dev"));
    assert_eq!(h.host.version_of("Dev"), Some(2));
    assert_eq!(h.host.install_dir("Dev").as_deref(), Some("C:\\wsl\\Dev"));
    // Local sources are never deleted
    assert!(source.exists());

    let removed = h.converge(spec.state(InstanceEnsure::Absent));
    assert!(removed.changed);
    assert!(!h.host.is_registered("Dev"));
}

#[test]
fn test_checksum_mismatch_leaves_no_distribution() {
    let h = Harness::new(FakeHost::new());
    let source = h.staging.path().join("rootfs.tar");
    fs::write(&source, b"tampered").unwrap();

    let spec = InstanceSpec::import("Dev", source.to_string_lossy(), "C:\\wsl\\Dev")
        .checksum("0".repeat(64), ChecksumAlgorithm::Sha256);
    let err = h
        .reconciler
        .reconcile(&DesiredState::from(spec), &options())
        .unwrap_err();

    assert!(matches!(err.root(), Error::ChecksumMismatch { .. }));
    assert_eq!(err.diagnostics().len(), 1);
    assert!(!h.host.is_registered("Dev"));
    assert_eq!(
        h.host
            .count_invocations(|inv| inv.args.first().is_some_and(|a| a == "--import")),
        0
    );
}

#[test]
fn test_remote_import_cleans_staging() {
    let h = Harness::with_transport(FakeHost::new(), OneBody(b"rootfs".to_vec()));
    let spec = InstanceSpec::import("Dev", "https://example.com/images/dev.tar", "C:\\wsl\\Dev");

    let result = h.apply(spec);
    assert!(result.changed);
    assert!(h.host.is_registered("Dev"));
    assert!(!h.host.is_running("Dev"));
    assert_eq!(result.artifacts.len(), 1);
    assert!(result.artifacts[0].cleaned_up);
    let staged = result.artifacts[0].artifact.staging_dir.clone().unwrap();
    assert!(!staged.exists());
}

#[test]
fn test_install_and_convert_version() {
    let h = Harness::new(FakeHost::new().with_distribution("Legacy", 1, true));
    h.converge(InstanceSpec::new("Legacy").version(2));
    assert_eq!(h.host.version_of("Legacy"), Some(2));

    h.converge(InstanceSpec::new("Debian").state(InstanceEnsure::Stop));
    assert!(h.host.is_registered("Debian"));
    assert!(!h.host.is_running("Debian"));
}

#[test]
fn test_dry_run_leaves_host_untouched() {
    let h = Harness::new(ubuntu().with_service("Ubuntu", "cron", false, false));
    let desired = DesiredState::from(
        ServiceSpec::new("Ubuntu", "cron")
            .state(ServiceEnsure::Started)
            .enabled(true),
    );
    let result = h.reconciler.plan(&desired, &options()).unwrap();

    assert!(result.changed);
    assert_eq!(result.plan.len(), 2);
    assert_eq!(h.host.service_running("Ubuntu", "cron"), Some(false));
    assert_eq!(
        h.host.count_invocations(|inv| inv.program == "systemctl" && inv.args[0] == "start"),
        0
    );
}
