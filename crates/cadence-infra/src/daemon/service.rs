//! Running the daemon outside the foreground: detached spawn and
//! per-user OS service units (systemd on Linux, launchd on macOS).

use std::path::{Path, PathBuf};

use crate::filesystem::{DataDir, DATA_DIR_ENV};

use super::DaemonError;

const SYSTEMD_UNIT: &str = "cadence.service";
const LAUNCHD_LABEL: &str = "dev.cadence.daemon";

/// Which service manager a unit is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    Systemd,
    Launchd,
}

impl ServiceKind {
    /// The service manager of the current platform.
    pub fn current() -> Result<Self, DaemonError> {
        if cfg!(target_os = "macos") {
            Ok(Self::Launchd)
        } else if cfg!(target_os = "linux") {
            Ok(Self::Systemd)
        } else {
            Err(DaemonError::UnsupportedPlatform)
        }
    }

    /// Where the unit file lives for the current user.
    pub fn unit_path(self) -> Result<PathBuf, DaemonError> {
        let home = dirs::home_dir().ok_or(DaemonError::UnsupportedPlatform)?;
        Ok(match self {
            Self::Systemd => home.join(".config/systemd/user").join(SYSTEMD_UNIT),
            Self::Launchd => home
                .join("Library/LaunchAgents")
                .join(format!("{LAUNCHD_LABEL}.plist")),
        })
    }

    /// Command the user runs to activate an installed unit.
    pub fn activate_hint(self, unit_path: &Path) -> String {
        match self {
            Self::Systemd => format!("systemctl --user daemon-reload && systemctl --user enable --now {SYSTEMD_UNIT}"),
            Self::Launchd => format!("launchctl load -w {}", unit_path.display()),
        }
    }

    /// Command the user runs before removing a unit.
    pub fn deactivate_hint(self, unit_path: &Path) -> String {
        match self {
            Self::Systemd => format!("systemctl --user disable --now {SYSTEMD_UNIT}"),
            Self::Launchd => format!("launchctl unload -w {}", unit_path.display()),
        }
    }
}

/// Render the unit that runs `{exe} daemon start --foreground`.
pub fn render_service(kind: ServiceKind, exe: &Path, data_dir: &DataDir) -> String {
    let exe = exe.display();
    let root = data_dir.root().display();
    match kind {
        ServiceKind::Systemd => format!(
            "[Unit]\n\
             Description=Cadence scheduler daemon\n\
             After=network-online.target\n\
             \n\
             [Service]\n\
             Type=simple\n\
             ExecStart={exe} daemon start --foreground\n\
             Environment={DATA_DIR_ENV}={root}\n\
             Restart=on-failure\n\
             RestartSec=10\n\
             \n\
             [Install]\n\
             WantedBy=default.target\n"
        ),
        ServiceKind::Launchd => {
            let log = data_dir.daemon_log();
            let log = log.display();
            format!(
                r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Label</key>
    <string>{LAUNCHD_LABEL}</string>
    <key>ProgramArguments</key>
    <array>
        <string>{exe}</string>
        <string>daemon</string>
        <string>start</string>
        <string>--foreground</string>
    </array>
    <key>EnvironmentVariables</key>
    <dict>
        <key>{DATA_DIR_ENV}</key>
        <string>{root}</string>
    </dict>
    <key>RunAtLoad</key>
    <true/>
    <key>KeepAlive</key>
    <dict>
        <key>SuccessfulExit</key>
        <false/>
    </dict>
    <key>StandardOutPath</key>
    <string>{log}</string>
    <key>StandardErrorPath</key>
    <string>{log}</string>
</dict>
</plist>
"#
            )
        }
    }
}

/// Write the unit for the current platform. Returns its path.
pub fn install_service(kind: ServiceKind, exe: &Path, data_dir: &DataDir) -> Result<PathBuf, DaemonError> {
    let path = kind.unit_path()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| DaemonError::io(parent, e))?;
    }
    std::fs::write(&path, render_service(kind, exe, data_dir)).map_err(|e| DaemonError::io(&path, e))?;
    tracing::info!(path = %path.display(), "service unit written");
    Ok(path)
}

/// Remove the unit. Returns `false` when none was installed.
pub fn uninstall_service(kind: ServiceKind) -> Result<bool, DaemonError> {
    let path = kind.unit_path()?;
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(DaemonError::io(&path, e)),
    }
}

/// Start `{exe} daemon start --foreground` detached, with stdout and stderr
/// appended to the daemon log. Returns the child pid.
pub fn spawn_background(exe: &Path, data_dir: &DataDir) -> Result<u32, DaemonError> {
    let log_path = data_dir.daemon_log();
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| DaemonError::io(parent, e))?;
    }
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| DaemonError::io(&log_path, e))?;
    let log_stderr = log_file.try_clone().map_err(|e| DaemonError::io(&log_path, e))?;

    let child = std::process::Command::new(exe)
        .args(["daemon", "start", "--foreground"])
        .env(DATA_DIR_ENV, data_dir.root())
        .stdin(std::process::Stdio::null())
        .stdout(log_file)
        .stderr(log_stderr)
        .spawn()
        .map_err(|e| DaemonError::io(exe, e))?;

    Ok(child.id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_systemd_unit() {
        let unit = render_service(
            ServiceKind::Systemd,
            Path::new("/usr/local/bin/cadence"),
            &DataDir::new("/home/ada/.cadence"),
        );
        assert!(unit.contains("ExecStart=/usr/local/bin/cadence daemon start --foreground"));
        assert!(unit.contains("Environment=CADENCE_DATA_DIR=/home/ada/.cadence"));
        assert!(unit.contains("WantedBy=default.target"));
    }

    #[test]
    fn test_launchd_plist() {
        let plist = render_service(
            ServiceKind::Launchd,
            Path::new("/opt/cadence"),
            &DataDir::new("/Users/ada/.cadence"),
        );
        assert!(plist.contains("<string>dev.cadence.daemon</string>"));
        assert!(plist.contains("<string>/opt/cadence</string>"));
        assert!(plist.contains("<string>--foreground</string>"));
        assert!(plist.contains("/Users/ada/.cadence/logs/daemon.log"));
    }

    #[test]
    fn test_hints_mention_unit() {
        let path = Path::new("/x/dev.cadence.daemon.plist");
        assert!(ServiceKind::Launchd.activate_hint(path).contains("launchctl load"));
        assert!(ServiceKind::Systemd.activate_hint(path).contains("cadence.service"));
        assert!(ServiceKind::Systemd.deactivate_hint(path).contains("disable"));
    }
}
