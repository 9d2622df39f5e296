use std::fs;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use envforge_core::ReleaseVersion;
use log::{debug, info};

use crate::error::UpgradeError;

pub const RESUME_UNIT_NAME: &str = "envforge-resume.service";
const RELEASE_UPGRADES_CONFIG: &str = "/etc/update-manager/release-upgrades";
const DEFAULT_MIN_FREE_BYTES: u64 = 5 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HopResult {
    pub needs_reboot: bool,
}

/// Host operations the upgrade state machine depends on.
pub trait UpgradeDriver {
    fn current_version(&mut self) -> Result<ReleaseVersion, UpgradeError>;
    /// Fails with `PreconditionFailed` when the host is not ready.
    fn check_preconditions(&mut self) -> Result<(), UpgradeError>;
    /// Fails with `PreconditionFailed` unless the next upgrade from `from`
    /// lands exactly on `next`. Runs before anything is changed.
    fn check_hop(
        &mut self,
        from: ReleaseVersion,
        next: ReleaseVersion,
    ) -> Result<(), UpgradeError>;
    fn upgrade_to(&mut self, next: ReleaseVersion) -> Result<HopResult, UpgradeError>;
    /// Arranges for `envforge resume` to run after the next boot.
    fn schedule_resume(&mut self) -> Result<(), UpgradeError>;
    fn clear_resume(&mut self) -> Result<(), UpgradeError>;
    fn reboot(&mut self) -> Result<(), UpgradeError>;
}

#[derive(Debug, Clone)]
pub struct SystemDriver {
    pub os_release: PathBuf,
    pub disk_path: PathBuf,
    pub min_free_bytes: u64,
    pub probe_host: String,
    pub probe_timeout: Duration,
    pub unit_dir: PathBuf,
    pub resume_exe: PathBuf,
    /// Written as `Environment=` lines; systemd units start with an empty
    /// environment and no `HOME`.
    pub resume_env: Vec<(String, String)>,
}

impl SystemDriver {
    pub fn new(resume_exe: impl Into<PathBuf>) -> Self {
        Self {
            os_release: PathBuf::from("/etc/os-release"),
            disk_path: PathBuf::from("/"),
            min_free_bytes: DEFAULT_MIN_FREE_BYTES,
            probe_host: "archive.ubuntu.com:80".to_string(),
            probe_timeout: Duration::from_secs(10),
            unit_dir: PathBuf::from("/etc/systemd/system"),
            resume_exe: resume_exe.into(),
            resume_env: Vec::new(),
        }
    }

    pub fn with_resume_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.resume_env.push((key.into(), value.into()));
        self
    }

    pub fn unit_path(&self) -> PathBuf {
        self.unit_dir.join(RESUME_UNIT_NAME)
    }

    pub fn resume_unit(&self) -> String {
        let environment = self
            .resume_env
            .iter()
            .map(|(key, value)| format!("Environment=\"{}={}\"\n", key, escape_unit_value(value)))
            .collect::<String>();
        format!(
            "[Unit]\n\
             Description=Resume envforge release upgrade\n\
             Wants=network-online.target\n\
             After=network-online.target\n\
             \n\
             [Service]\n\
             Type=oneshot\n\
             {environment}\
             ExecStart={} resume\n\
             \n\
             [Install]\n\
             WantedBy=multi-user.target\n",
            self.resume_exe.display()
        )
    }

    fn probe_network(&self) -> Result<(), UpgradeError> {
        let precondition = |reason: String| UpgradeError::PreconditionFailed { reason };
        let addrs = self
            .probe_host
            .to_socket_addrs()
            .map_err(|err| precondition(format!("cannot resolve {}: {err}", self.probe_host)))?
            .collect::<Vec<_>>();
        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.probe_timeout) {
                Ok(_) => return Ok(()),
                Err(err) => last_err = Some(err),
            }
        }
        Err(precondition(match last_err {
            Some(err) => format!("network unreachable: host={} {err}", self.probe_host),
            None => format!("network unreachable: host={} resolved to nothing", self.probe_host),
        }))
    }
}

impl UpgradeDriver for SystemDriver {
    fn current_version(&mut self) -> Result<ReleaseVersion, UpgradeError> {
        let raw = fs::read_to_string(&self.os_release).map_err(|err| UpgradeError::VersionProbe {
            reason: format!("cannot read {}: {err}", self.os_release.display()),
        })?;
        parse_os_release_version(&raw).ok_or_else(|| UpgradeError::VersionProbe {
            reason: format!("no usable VERSION_ID in {}", self.os_release.display()),
        })
    }

    fn check_preconditions(&mut self) -> Result<(), UpgradeError> {
        let available = available_bytes(&self.disk_path).map_err(|err| {
            UpgradeError::PreconditionFailed {
                reason: format!("cannot stat {}: {err}", self.disk_path.display()),
            }
        })?;
        if available < self.min_free_bytes {
            return Err(UpgradeError::PreconditionFailed {
                reason: format!(
                    "insufficient disk space on {}: available={} required={}",
                    self.disk_path.display(),
                    available,
                    self.min_free_bytes
                ),
            });
        }
        debug!("disk check passed: available={available}");
        self.probe_network()
    }

    fn check_hop(
        &mut self,
        from: ReleaseVersion,
        next: ReleaseVersion,
    ) -> Result<(), UpgradeError> {
        let output = Command::new("do-release-upgrade")
            .arg("-c")
            .env("DEBIAN_FRONTEND", "noninteractive")
            .output()
            .map_err(|err| UpgradeError::PreconditionFailed {
                reason: format!("failed to run do-release-upgrade -c: {err}"),
            })?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let offered = parse_offered_release(&stdout);
        debug!("do-release-upgrade -c: from={from} offered={offered:?} expected={next}");
        match offered {
            Some(offered) if offered == next => Ok(()),
            Some(offered) => Err(UpgradeError::PreconditionFailed {
                reason: format!(
                    "release upgrade from {from} offers {offered}, expected {next}; \
                     adjust Prompt= in {RELEASE_UPGRADES_CONFIG} or the manifest's [upgrade] releases"
                ),
            }),
            None => Err(UpgradeError::PreconditionFailed {
                reason: format!(
                    "no release upgrade offered from {from} (expected {next}); \
                     check Prompt= in {RELEASE_UPGRADES_CONFIG}"
                ),
            }),
        }
    }

    fn upgrade_to(&mut self, next: ReleaseVersion) -> Result<HopResult, UpgradeError> {
        let from = self.current_version()?;
        info!("running do-release-upgrade {from} -> {next}");
        let status = Command::new("do-release-upgrade")
            .arg("-f")
            .arg("DistUpgradeViewNonInteractive")
            .env("DEBIAN_FRONTEND", "noninteractive")
            .status()
            .map_err(|err| UpgradeError::HopFailed {
                from,
                to: next,
                message: format!("failed to start do-release-upgrade: {err}"),
            })?;
        if !status.success() {
            return Err(UpgradeError::HopFailed {
                from,
                to: next,
                message: format!("do-release-upgrade exited with {status}"),
            });
        }

        let reached = self.current_version()?;
        if reached != next {
            return Err(UpgradeError::HopFailed {
                from,
                to: next,
                message: format!("system reports {reached} after upgrade"),
            });
        }
        // A release upgrade replaces the kernel and init system.
        Ok(HopResult { needs_reboot: true })
    }

    fn schedule_resume(&mut self) -> Result<(), UpgradeError> {
        let path = self.unit_path();
        fs::write(&path, self.resume_unit()).map_err(|err| {
            UpgradeError::io(format!("failed to write resume unit: {}", path.display()), err)
        })?;
        run_systemctl(&["daemon-reload"])?;
        run_systemctl(&["enable", RESUME_UNIT_NAME])
    }

    fn clear_resume(&mut self) -> Result<(), UpgradeError> {
        let path = self.unit_path();
        if !path.exists() {
            return Ok(());
        }
        run_systemctl(&["disable", RESUME_UNIT_NAME])?;
        fs::remove_file(&path).map_err(|err| {
            UpgradeError::io(format!("failed to remove resume unit: {}", path.display()), err)
        })?;
        run_systemctl(&["daemon-reload"])
    }

    fn reboot(&mut self) -> Result<(), UpgradeError> {
        run_systemctl(&["reboot"])
    }
}

pub fn parse_os_release_version(raw: &str) -> Option<ReleaseVersion> {
    raw.lines().find_map(|line| {
        let value = line.trim().strip_prefix("VERSION_ID=")?;
        let value = value.trim_matches(|ch| ch == '"' || ch == '\'');
        ReleaseVersion::parse(value).ok()
    })
}

fn escape_unit_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('%', "%%")
}

/// Reads the release out of `do-release-upgrade -c` output, e.g.
/// `New release '24.04.1 LTS' available.`
pub fn parse_offered_release(output: &str) -> Option<ReleaseVersion> {
    output.lines().find_map(|line| {
        let (_, rest) = line.split_once("New release '")?;
        let (label, _) = rest.split_once('\'')?;
        let number = label.split_whitespace().next()?;
        let mut parts = number.split('.');
        let major = parts.next()?;
        let minor = parts.next()?;
        ReleaseVersion::parse(&format!("{major}.{minor}")).ok()
    })
}

fn run_systemctl(args: &[&str]) -> Result<(), UpgradeError> {
    let output = Command::new("systemctl").args(args).output().map_err(|err| {
        UpgradeError::io(format!("failed to run systemctl {}", args.join(" ")), err)
    })?;
    if output.status.success() {
        return Ok(());
    }
    Err(UpgradeError::io(
        format!(
            "systemctl {} failed: status={} stderr='{}'",
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ),
        io::Error::other("systemctl failed"),
    ))
}

#[cfg(unix)]
fn available_bytes(path: &Path) -> io::Result<u64> {
    use std::ffi::CString;
    use std::mem::MaybeUninit;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())?;
    let mut stats = MaybeUninit::<libc::statvfs>::uninit();
    // SAFETY: c_path is NUL-terminated and stats points to writable storage.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), stats.as_mut_ptr()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: statvfs returned 0, so the struct is initialized.
    let stats = unsafe { stats.assume_init() };
    Ok((stats.f_bavail as u64).saturating_mul(stats.f_frsize as u64))
}

#[cfg(not(unix))]
fn available_bytes(_path: &Path) -> io::Result<u64> {
    Ok(u64::MAX)
}
