//! Embedded terminal display (`term.everything`) and the scripts that host a
//! GUI helper inside it

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::locate::{is_executable, HostProbe};
use super::plan::{sh_quote, FallbackExecutionPlan, PlanStep, StepKind};
use crate::auth::AuthError;

pub const DISPLAY_DIR_NAME: &str = "term.everything";

/// Where X11 servers put their sockets.
pub const X11_SOCKET_DIR: &str = "/tmp/.X11-unix";

const FIRST_DISPLAY: u32 = 5;
const LAST_DISPLAY: u32 = 100;

const XWAYLAND: &str = "Xwayland";
const WINDOW_MANAGER: &str = "matchbox-window-manager";

/// How to start the display helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayLauncher {
    Binary(PathBuf),
    GoRun { dir: PathBuf, go: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayDecision {
    Disabled,
    NotFound,
    Use(DisplayLauncher),
}

impl DisplayDecision {
    /// Short human-readable status shown while a refresh runs.
    pub fn note(&self) -> &'static str {
        match self {
            DisplayDecision::Disabled => "term.everything disabled",
            DisplayDecision::NotFound => "term.everything not found",
            DisplayDecision::Use(DisplayLauncher::Binary(_)) => "term.everything enabled (binary)",
            DisplayDecision::Use(DisplayLauncher::GoRun { .. }) => "term.everything enabled (go run)",
        }
    }
}

/// Decide whether the helper should run inside the embedded display.
pub fn decide(probe: &HostProbe, disabled: bool) -> Result<DisplayDecision, AuthError> {
    if disabled {
        return Ok(DisplayDecision::Disabled);
    }
    let Some(dir) = probe.find_dir(&[DISPLAY_DIR_NAME]) else {
        return Ok(DisplayDecision::NotFound);
    };
    if let Some(binary) = find_display_binary(&dir) {
        return Ok(DisplayDecision::Use(DisplayLauncher::Binary(binary)));
    }
    match probe.which("go") {
        Some(go) => Ok(DisplayDecision::Use(DisplayLauncher::GoRun { dir, go })),
        None => Err(AuthError::unsupported(
            "term.everything is present but no runnable binary found and Go is not installed",
        )),
    }
}

/// First executable matching `dist/*/term.everything*`.
fn find_display_binary(dir: &Path) -> Option<PathBuf> {
    let mut platforms: Vec<PathBuf> = fs::read_dir(dir.join("dist"))
        .ok()?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_dir())
        .collect();
    platforms.sort();

    platforms.iter().find_map(|platform| {
        let mut candidates: Vec<PathBuf> = fs::read_dir(platform)
            .ok()?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(DISPLAY_DIR_NAME))
            })
            .collect();
        candidates.sort();
        candidates.into_iter().find(|path| is_executable(path))
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WrapperMode {
    /// The GUI talks Wayland directly; only log the wrapped command.
    NativeWayland,
    /// Host the GUI on a private Xwayland server with a window manager.
    Xwayland { display: u32 },
}

/// Hosts a plan's run steps inside the embedded display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayWrapper {
    pub launcher: DisplayLauncher,
    pub mode: WrapperMode,
}

impl DisplayWrapper {
    /// Check the host can provide the requested mode.
    pub fn prepare(
        launcher: DisplayLauncher,
        native_wayland: bool,
        probe: &HostProbe,
        socket_dir: &Path,
    ) -> Result<Self, AuthError> {
        if native_wayland {
            return Ok(Self {
                launcher,
                mode: WrapperMode::NativeWayland,
            });
        }

        if probe.which(XWAYLAND).is_none() {
            return Err(AuthError::unsupported(
                "Xwayland not found (install xorg-x11-server-Xwayland)",
            ));
        }
        if probe.which(WINDOW_MANAGER).is_none() {
            return Err(AuthError::unsupported(
                "matchbox-window-manager not found (install matchbox-window-manager)",
            ));
        }
        let display = find_free_x_display(socket_dir)?;
        Ok(Self {
            launcher,
            mode: WrapperMode::Xwayland { display },
        })
    }

    /// Replace the plan's run steps with a single launch of the display helper.
    pub fn wrap(&self, plan: &FallbackExecutionPlan, socket_dir: &Path) -> PlanStep {
        let script = match self.mode {
            WrapperMode::NativeWayland => logging_script(&plan.run_script()),
            WrapperMode::Xwayland { display } => {
                xwayland_script(&plan.run_script(), display, socket_dir)
            }
        };

        let helper_args = ["--support-old-apps", "--"];
        match &self.launcher {
            DisplayLauncher::Binary(path) => {
                PlanStep::new(StepKind::Launch, DISPLAY_DIR_NAME, path, &plan.working_directory)
                    .args(helper_args)
                    .args([script])
            }
            DisplayLauncher::GoRun { dir, go } => {
                PlanStep::new(StepKind::Launch, format!("{} (go run)", DISPLAY_DIR_NAME), go, dir)
                    .args(["run", "."])
                    .args(helper_args)
                    .args([script])
            }
        }
    }
}

/// First `N` in 5..100 with no `<socket_dir>/XN`.
pub fn find_free_x_display(socket_dir: &Path) -> Result<u32, AuthError> {
    for n in FIRST_DISPLAY..LAST_DISPLAY {
        match fs::symlink_metadata(socket_dir.join(format!("X{}", n))) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(n),
            Err(e) => {
                return Err(AuthError::unsupported(format!(
                    "unable to probe X display :{}: {}",
                    n, e
                )))
            }
            Ok(_) => continue,
        }
    }
    Err(AuthError::unsupported(format!(
        "no free X display found in {}",
        socket_dir.display()
    )))
}

/// Start Xwayland and the window manager, wait for the socket, run `command`.
/// Both background processes are killed when the script exits.
pub fn xwayland_script(command: &str, display: u32, socket_dir: &Path) -> String {
    let display_name = format!(":{}", display);
    let socket = socket_dir.join(format!("X{}", display));
    let socket = socket.to_string_lossy();
    let log_path = format!("/tmp/teams-cli-xwayland-{}.log", display);

    [
        format!("exec >{} 2>&1", sh_quote(&log_path)),
        "set -x".to_string(),
        format!("{} {} -retro & xw_pid=$!", XWAYLAND, display_name),
        "trap 'kill $xw_pid $wm_pid' EXIT".to_string(),
        format!(
            "for i in $(seq 1 50); do [ -S {} ] && break; sleep 0.1; done",
            sh_quote(&socket)
        ),
        format!(
            "[ -S {} ] || {{ echo \"Xwayland did not create socket {}\"; exit 1; }}",
            sh_quote(&socket),
            socket
        ),
        format!("export DISPLAY={}", display_name),
        format!("{} -display {} & wm_pid=$!", WINDOW_MANAGER, display_name),
        "export ELECTRON_DISABLE_SANDBOX=1".to_string(),
        command.to_string(),
    ]
    .join("; ")
}

/// Send the wrapped command's output to a per-run log file.
pub fn logging_script(command: &str) -> String {
    [
        "log=/tmp/teams-cli-auth-$$.log",
        "echo \"auth refresh log: $log\"",
        "exec >$log 2>&1",
        "set -x",
        command,
    ]
    .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    #[cfg(unix)]
    use crate::auth::fallback::test_support::write_script;
    use crate::auth::fallback::plan::Strategy;
    use tempfile::TempDir;

    #[test]
    fn test_decide_disabled_and_missing() {
        let root = TempDir::new().unwrap();
        let probe = HostProbe::new(vec![root.path().to_path_buf()], None);
        assert_eq!(decide(&probe, true).unwrap(), DisplayDecision::Disabled);
        assert_eq!(decide(&probe, false).unwrap(), DisplayDecision::NotFound);
        assert_eq!(DisplayDecision::NotFound.note(), "term.everything not found");
    }

    #[cfg(unix)]
    #[test]
    fn test_decide_prefers_binary() {
        let root = TempDir::new().unwrap();
        let platform = root.path().join(DISPLAY_DIR_NAME).join("dist").join("linux-x64");
        fs::create_dir_all(&platform).unwrap();
        fs::write(platform.join("term.everything.txt"), "").unwrap();
        write_script(&platform.join("term.everything-linux"), "exit 0");

        let probe = HostProbe::new(vec![root.path().to_path_buf()], None);
        let decision = decide(&probe, false).unwrap();
        assert_eq!(
            decision,
            DisplayDecision::Use(DisplayLauncher::Binary(platform.join("term.everything-linux")))
        );
        assert_eq!(decision.note(), "term.everything enabled (binary)");
    }

    #[cfg(unix)]
    #[test]
    fn test_decide_go_run_fallback() {
        let root = TempDir::new().unwrap();
        let bin = TempDir::new().unwrap();
        fs::create_dir(root.path().join(DISPLAY_DIR_NAME)).unwrap();
        write_script(&bin.path().join("go"), "exit 0");

        let probe = HostProbe::new(
            vec![root.path().to_path_buf()],
            Some(bin.path().as_os_str().to_owned()),
        );
        let decision = decide(&probe, false).unwrap();
        assert_eq!(decision.note(), "term.everything enabled (go run)");
    }

    #[test]
    fn test_decide_without_binary_or_go_is_unsupported() {
        let root = TempDir::new().unwrap();
        fs::create_dir(root.path().join(DISPLAY_DIR_NAME)).unwrap();
        let probe = HostProbe::new(vec![root.path().to_path_buf()], None);

        let err = decide(&probe, false).unwrap_err();
        assert!(matches!(err, AuthError::EnvironmentUnsupported(_)));
    }

    #[test]
    fn test_find_free_x_display_skips_taken_sockets() {
        let sockets = TempDir::new().unwrap();
        assert_eq!(find_free_x_display(sockets.path()).unwrap(), 5);

        fs::write(sockets.path().join("X5"), "").unwrap();
        fs::write(sockets.path().join("X6"), "").unwrap();
        assert_eq!(find_free_x_display(sockets.path()).unwrap(), 7);
    }

    #[test]
    fn test_find_free_x_display_exhausted() {
        let sockets = TempDir::new().unwrap();
        for n in FIRST_DISPLAY..LAST_DISPLAY {
            fs::write(sockets.path().join(format!("X{}", n)), "").unwrap();
        }
        let err = find_free_x_display(sockets.path()).unwrap_err();
        assert!(err.to_string().contains("no free X display"));
    }

    #[test]
    fn test_prepare_requires_xwayland() {
        let sockets = TempDir::new().unwrap();
        let launcher = DisplayLauncher::Binary(PathBuf::from("/opt/te"));
        let probe = HostProbe::new(vec![], None);

        let err = DisplayWrapper::prepare(launcher.clone(), false, &probe, sockets.path()).unwrap_err();
        assert!(matches!(err, AuthError::EnvironmentUnsupported(ref m) if m.contains("Xwayland")));

        let wrapper = DisplayWrapper::prepare(launcher, true, &probe, sockets.path()).unwrap();
        assert_eq!(wrapper.mode, WrapperMode::NativeWayland);
    }

    #[test]
    fn test_xwayland_script_shape() {
        let script = xwayland_script("cd '/h' && './teams-token'", 7, Path::new("/tmp/.X11-unix"));
        let parts: Vec<&str> = script.split("; ").collect();

        assert_eq!(parts[0], "exec >'/tmp/teams-cli-xwayland-7.log' 2>&1");
        assert_eq!(parts[2], "Xwayland :7 -retro & xw_pid=$!");
        assert_eq!(parts[3], "trap 'kill $xw_pid $wm_pid' EXIT");
        assert_eq!(
            parts[4],
            "for i in $(seq 1 50); do [ -S '/tmp/.X11-unix/X7' ] && break; sleep 0.1; done"
        );
        assert!(parts[5].contains("exit 1"));
        assert_eq!(parts[6], "export DISPLAY=:7");
        assert_eq!(parts[7], "matchbox-window-manager -display :7 & wm_pid=$!");
        assert_eq!(parts.last(), Some(&"cd '/h' && './teams-token'"));

        // Trap goes in before the socket wait so a timeout still reaps Xwayland
        let trap = script.find("trap").unwrap();
        let wait = script.find("seq 1 50").unwrap();
        assert!(trap < wait);
    }

    /// Dead or zombie, i.e. no longer running.
    #[cfg(target_os = "linux")]
    fn process_gone(pid: &str) -> bool {
        match fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Err(_) => true,
            Ok(stat) => stat
                .rsplit_once(')')
                .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_xwayland_script_tears_down_on_failure() {
        use std::os::unix::net::UnixListener;
        use std::process::Command;
        use std::time::{Duration, Instant};

        let bin = TempDir::new().unwrap();
        let sockets = TempDir::new().unwrap();
        let pids = TempDir::new().unwrap();
        let display = 97;

        for (name, pidfile) in [(XWAYLAND, "xw.pid"), (WINDOW_MANAGER, "wm.pid")] {
            write_script(
                &bin.path().join(name),
                &format!("echo $$ > '{}'\nexec sleep 30", pids.path().join(pidfile).display()),
            );
        }
        let _socket = UnixListener::bind(sockets.path().join(format!("X{}", display))).unwrap();

        let command = format!(
            "cd {} && while [ ! -s xw.pid ] || [ ! -s wm.pid ]; do sleep 0.05; done; exit 3",
            sh_quote(&pids.path().to_string_lossy())
        );
        let script = xwayland_script(&command, display, sockets.path());
        let path = format!(
            "{}:{}",
            bin.path().display(),
            std::env::var("PATH").unwrap_or_default()
        );

        let status = Command::new("sh")
            .arg("-c")
            .arg(&script)
            .env("PATH", path)
            .status()
            .unwrap();
        assert_eq!(status.code(), Some(3));

        let xw = fs::read_to_string(pids.path().join("xw.pid")).unwrap();
        let wm = fs::read_to_string(pids.path().join("wm.pid")).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !(process_gone(xw.trim()) && process_gone(wm.trim())) {
            assert!(Instant::now() < deadline, "display processes outlived the script");
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    #[test]
    fn test_wrap_binary_launcher() {
        let dir = Path::new("/h/teams-token");
        let plan = FallbackExecutionPlan {
            strategy: Strategy::NativeBinary,
            steps: vec![PlanStep::new(StepKind::Launch, "./teams-token", dir.join("teams-token"), dir)],
            working_directory: dir.to_path_buf(),
            requires_interactive_io: false,
            display_wrapper: None,
        };
        let wrapper = DisplayWrapper {
            launcher: DisplayLauncher::Binary(PathBuf::from("/opt/te/term.everything")),
            mode: WrapperMode::NativeWayland,
        };

        let step = wrapper.wrap(&plan, Path::new(X11_SOCKET_DIR));
        assert_eq!(step.program, PathBuf::from("/opt/te/term.everything"));
        assert_eq!(&step.args[..2], &["--support-old-apps", "--"]);
        assert!(step.args[2].starts_with("log=/tmp/teams-cli-auth-$$.log; "));
        assert!(step.args[2].ends_with("cd '/h/teams-token' && '/h/teams-token/teams-token'"));
    }
}
