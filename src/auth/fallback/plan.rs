//! Typed execution plans for the external login helper
//!
//! A plan is an ordered list of steps with structured arguments. Shell text
//! is only produced when the whole plan has to be handed to the embedded
//! display helper as a single command string.

use std::fmt;
use std::path::{Path, PathBuf};

use super::display::DisplayWrapper;
use super::locate::{is_executable, HostProbe};
use crate::auth::AuthError;

/// Name of the prebuilt helper executable inside its directory.
pub const HELPER_BINARY: &str = "teams-token";

/// Manifest file, toolchain program and arguments for running from source.
const SOURCE_RUNNERS: &[(&str, &str, &[&str])] = &[
    ("go.mod", "go", &["run", "."]),
    ("Cargo.toml", "cargo", &["run", "--quiet"]),
];

const PACKAGE_MANIFEST: &str = "package.json";
const DEPENDENCY_CACHE: &str = "node_modules";

const ELECTRON_FLAGS: &[&str] = &[
    "--no-sandbox",
    "--disable-setuid-sandbox",
    "--disable-seccomp-filter-sandbox",
    "--disable-gpu",
    "--disable-dev-shm-usage",
];

const ELECTRON_WAYLAND_FLAGS: &[&str] = &["--enable-features=UseOzonePlatform", "--ozone-platform=wayland"];

/// Ways of obtaining credentials, in the order they are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    DeviceCode,
    /// Finding a helper directory
    HelperLookup,
    /// A helper directory was found but nothing in it can be run
    RunnerSelection,
    NativeBinary,
    SourceRun,
    PackageManifest,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::DeviceCode => "device code",
            Strategy::HelperLookup => "helper lookup",
            Strategy::RunnerSelection => "runner selection",
            Strategy::NativeBinary => "native binary",
            Strategy::SourceRun => "source run",
            Strategy::PackageManifest => "package manifest",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Install,
    Build,
    Launch,
}

/// One process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanStep {
    pub kind: StepKind,
    /// Short name used in logs and errors, e.g. `npm install`
    pub label: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_directory: PathBuf,
}

impl PlanStep {
    pub fn new(
        kind: StepKind,
        label: impl Into<String>,
        program: impl Into<PathBuf>,
        working_directory: &Path,
    ) -> Self {
        Self {
            kind,
            label: label.into(),
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_directory: working_directory.to_path_buf(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    /// `KEY='v' 'program' 'arg'...`
    pub fn to_shell(&self) -> String {
        let env = self
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, sh_quote(v)));
        let program = std::iter::once(sh_quote(&self.program.to_string_lossy()));
        let args = self.args.iter().map(|a| sh_quote(a));
        env.chain(program).chain(args).collect::<Vec<_>>().join(" ")
    }
}

/// Single-quote `value` for POSIX shells.
pub fn sh_quote(value: &str) -> String {
    if value.is_empty() {
        return "''".to_string();
    }
    format!("'{}'", value.replace('\'', r#"'"'"'"#))
}

/// How to invoke the helper on this host.
#[derive(Debug, Clone)]
pub struct FallbackExecutionPlan {
    pub strategy: Strategy,
    pub steps: Vec<PlanStep>,
    pub working_directory: PathBuf,
    pub requires_interactive_io: bool,
    pub display_wrapper: Option<DisplayWrapper>,
}

impl FallbackExecutionPlan {
    fn new(strategy: Strategy, working_directory: &Path, steps: Vec<PlanStep>) -> Self {
        Self {
            strategy,
            steps,
            working_directory: working_directory.to_path_buf(),
            requires_interactive_io: false,
            display_wrapper: None,
        }
    }

    /// Steps that run before the helper itself and never go through the display wrapper.
    pub fn setup_steps(&self) -> impl Iterator<Item = &PlanStep> {
        self.steps.iter().filter(|s| s.kind == StepKind::Install)
    }

    pub fn run_steps(&self) -> impl Iterator<Item = &PlanStep> {
        self.steps.iter().filter(|s| s.kind != StepKind::Install)
    }

    /// `cd <dir> && step && step`, for handing to the display wrapper.
    pub fn run_script(&self) -> String {
        std::iter::once(format!(
            "cd {}",
            sh_quote(&self.working_directory.to_string_lossy())
        ))
        .chain(self.run_steps().map(PlanStep::to_shell))
        .collect::<Vec<_>>()
        .join(" && ")
    }
}

/// Outcome of walking the strategy list for one helper directory.
#[derive(Debug)]
pub struct Selection {
    /// Strategies whose prerequisites were missing, with the reason
    pub skipped: Vec<(Strategy, AuthError)>,
    /// The chosen plan, or the strategy that ended the search and why
    pub plan: Result<FallbackExecutionPlan, (Strategy, AuthError)>,
}

/// Pick the first viable strategy for `dir`.
///
/// `needs_install` decides whether the package-manifest strategy includes an
/// install step for this directory.
pub fn select_strategy(
    dir: &Path,
    probe: &HostProbe,
    native_wayland: bool,
    needs_install: impl Fn(&Path) -> bool,
) -> Selection {
    let mut skipped = Vec::new();

    let binary = dir.join(HELPER_BINARY);
    if is_executable(&binary) {
        let step = PlanStep::new(StepKind::Launch, format!("./{}", HELPER_BINARY), binary, dir);
        return Selection {
            skipped,
            plan: Ok(FallbackExecutionPlan::new(Strategy::NativeBinary, dir, vec![step])),
        };
    }
    skipped.push((
        Strategy::NativeBinary,
        AuthError::toolchain_missing(format!("no executable {} binary in {}", HELPER_BINARY, dir.display())),
    ));

    match source_run_step(dir, probe) {
        Ok(step) => {
            return Selection {
                skipped,
                plan: Ok(FallbackExecutionPlan::new(Strategy::SourceRun, dir, vec![step])),
            };
        }
        Err(reason) => skipped.push((Strategy::SourceRun, reason)),
    }

    if !dir.join(PACKAGE_MANIFEST).is_file() {
        skipped.push((
            Strategy::PackageManifest,
            AuthError::toolchain_missing(format!("no {} in {}", PACKAGE_MANIFEST, dir.display())),
        ));
        return Selection {
            skipped,
            plan: Err((
                Strategy::RunnerSelection,
                AuthError::toolchain_missing(format!(
                    "{} exists but has no supported runner (binary/{}/{})",
                    dir.display(),
                    SOURCE_RUNNERS
                        .iter()
                        .map(|(manifest, _, _)| *manifest)
                        .collect::<Vec<_>>()
                        .join("/"),
                    PACKAGE_MANIFEST
                )),
            )),
        };
    }

    let plan = package_manifest_steps(dir, probe, native_wayland, needs_install(dir))
        .map(|steps| FallbackExecutionPlan::new(Strategy::PackageManifest, dir, steps))
        .map_err(|e| (Strategy::PackageManifest, e));
    Selection { skipped, plan }
}

fn source_run_step(dir: &Path, probe: &HostProbe) -> Result<PlanStep, AuthError> {
    let mut missing_toolchains = Vec::new();
    for (manifest, program, args) in SOURCE_RUNNERS {
        if !dir.join(manifest).is_file() {
            continue;
        }
        match probe.which(program) {
            Some(path) => {
                let label = std::iter::once(*program)
                    .chain(args.iter().copied())
                    .collect::<Vec<_>>()
                    .join(" ");
                return Ok(PlanStep::new(StepKind::Launch, label, path, dir).args(args.iter().copied()));
            }
            None => missing_toolchains.push(format!("{} present but {} is not installed", manifest, program)),
        }
    }

    if missing_toolchains.is_empty() {
        Err(AuthError::toolchain_missing(format!(
            "no source manifest ({}) in {}",
            SOURCE_RUNNERS
                .iter()
                .map(|(manifest, _, _)| *manifest)
                .collect::<Vec<_>>()
                .join(", "),
            dir.display()
        )))
    } else {
        Err(AuthError::toolchain_missing(missing_toolchains.join("; ")))
    }
}

fn package_manifest_steps(
    dir: &Path,
    probe: &HostProbe,
    native_wayland: bool,
    needs_install: bool,
) -> Result<Vec<PlanStep>, AuthError> {
    let yarn = dir
        .join("yarn.lock")
        .is_file()
        .then(|| probe.which("yarn"))
        .flatten();

    let (manager, program, install_args): (&str, PathBuf, &[&str]) = match (yarn, probe.which("npm")) {
        (Some(path), _) => ("yarn", path, &["install"]),
        (None, Some(path)) => ("npm", path, &["install", "--no-audit", "--no-fund"]),
        (None, None) => {
            return Err(AuthError::toolchain_missing(format!(
                "{} is a Node project, but neither yarn nor npm is installed",
                dir.display()
            )));
        }
    };

    let mut steps = Vec::new();
    if needs_install {
        steps.push(
            PlanStep::new(StepKind::Install, format!("{} install", manager), program.clone(), dir)
                .args(install_args.iter().copied()),
        );
    }
    steps.push(
        PlanStep::new(StepKind::Build, format!("{} run build", manager), program, dir).args(["run", "build"]),
    );

    let electron = dir.join(DEPENDENCY_CACHE).join(".bin").join("electron");
    let mut launch = PlanStep::new(StepKind::Launch, "electron", electron, dir)
        .args(ELECTRON_FLAGS.iter().copied())
        .env("ELECTRON_DISABLE_SANDBOX", "1");
    if native_wayland {
        launch = launch
            .args(ELECTRON_WAYLAND_FLAGS.iter().copied())
            .env("ELECTRON_OZONE_PLATFORM_HINT", "wayland");
    }
    steps.push(launch.args(["./dist/main.js"]));

    Ok(steps)
}

/// Whether the dependency cache for a package-manifest helper is present.
pub fn has_dependency_cache(dir: &Path) -> bool {
    dir.join(DEPENDENCY_CACHE).exists()
}
