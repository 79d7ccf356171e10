//! Interactive login through an external `teams-token` helper
//!
//! Used when the device code flow is disabled or fails. The helper is found
//! next to the working directory, the executable or the repository root, and
//! run with whatever toolchain the host provides. When the `term.everything`
//! display helper is available the GUI login runs inside the terminal.

pub mod display;
pub mod locate;
pub mod plan;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;

use tokio::process::Command;

use self::display::{DisplayDecision, DisplayWrapper, X11_SOCKET_DIR};
use self::locate::{HostProbe, HELPER_DIR_NAMES};
use self::plan::{has_dependency_cache, select_strategy, FallbackExecutionPlan, PlanStep, Strategy};
use super::coordinator::RefreshObserver;
use super::{AuthConfig, AuthError};

/// Outcome of one strategy considered during a refresh.
#[derive(Debug)]
pub struct AuthAttemptResult {
    pub strategy: Strategy,
    pub succeeded: bool,
    pub error: Option<AuthError>,
}

impl AuthAttemptResult {
    pub fn success(strategy: Strategy) -> Self {
        Self {
            strategy,
            succeeded: true,
            error: None,
        }
    }

    pub fn failure(strategy: Strategy, error: AuthError) -> Self {
        Self {
            strategy,
            succeeded: false,
            error: Some(error),
        }
    }
}

pub struct FallbackAuthRunner {
    probe: HostProbe,
    disable_embedded_display: bool,
    native_wayland: bool,
    x11_socket_dir: PathBuf,
    /// Helper directories whose dependencies were installed by this process
    installed: Mutex<HashSet<PathBuf>>,
}

impl FallbackAuthRunner {
    pub fn new(config: &AuthConfig, probe: HostProbe) -> Self {
        Self {
            probe,
            disable_embedded_display: config.disable_embedded_display,
            native_wayland: config.native_wayland,
            x11_socket_dir: PathBuf::from(X11_SOCKET_DIR),
            installed: Mutex::new(HashSet::new()),
        }
    }

    #[cfg(test)]
    pub fn with_x11_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.x11_socket_dir = dir.into();
        self
    }

    /// Status line describing whether the embedded display will be used.
    pub fn display_note(&self) -> &'static str {
        match display::decide(&self.probe, self.disable_embedded_display) {
            Ok(decision) => decision.note(),
            Err(_) => "term.everything unavailable (no binary and Go missing)",
        }
    }

    fn needs_install(&self, dir: &Path) -> bool {
        if has_dependency_cache(dir) {
            return false;
        }
        match self.installed.lock() {
            Ok(installed) => !installed.contains(dir),
            Err(poisoned) => !poisoned.into_inner().contains(dir),
        }
    }

    fn mark_installed(&self, dir: &Path) {
        let mut installed = match self.installed.lock() {
            Ok(installed) => installed,
            Err(poisoned) => poisoned.into_inner(),
        };
        installed.insert(dir.to_path_buf());
    }

    /// Probe the host and build the execution plan.
    ///
    /// Returns the strategies that were skipped alongside the plan, or the
    /// strategy that ended the search with its reason.
    pub fn plan(
        &self,
    ) -> (
        Vec<AuthAttemptResult>,
        Result<FallbackExecutionPlan, (Strategy, AuthError)>,
    ) {
        let Some(dir) = self.probe.find_dir(HELPER_DIR_NAMES) else {
            let err = AuthError::toolchain_missing(format!(
                "no teams-token directory found (checked {})",
                HELPER_DIR_NAMES.join(", ")
            ));
            return (Vec::new(), Err((Strategy::HelperLookup, err)));
        };
        tracing::debug!("Using login helper at {}", dir.display());

        let selection = select_strategy(&dir, &self.probe, self.native_wayland, |d| self.needs_install(d));
        let skipped = selection
            .skipped
            .into_iter()
            .map(|(strategy, err)| AuthAttemptResult::failure(strategy, err))
            .collect();

        let plan = selection.plan.and_then(|mut plan| {
            let decision = display::decide(&self.probe, self.disable_embedded_display)
                .map_err(|e| (plan.strategy, e))?;
            tracing::info!("Login helper display: {}", decision.note());

            if let DisplayDecision::Use(launcher) = decision {
                let wrapper = DisplayWrapper::prepare(
                    launcher,
                    self.native_wayland,
                    &self.probe,
                    &self.x11_socket_dir,
                )
                .map_err(|e| (plan.strategy, e))?;
                plan.display_wrapper = Some(wrapper);
                plan.requires_interactive_io = true;
            }
            Ok(plan)
        });

        (skipped, plan)
    }

    /// Run the first viable strategy. The last result is the executed one.
    pub async fn run(&self, observer: &dyn RefreshObserver) -> Vec<AuthAttemptResult> {
        let (mut results, plan) = self.plan();
        for skipped in &results {
            if let Some(err) = &skipped.error {
                tracing::debug!("Skipping {} strategy: {}", skipped.strategy, err);
            }
        }

        let plan = match plan {
            Ok(plan) => plan,
            Err((strategy, err)) => {
                tracing::warn!("No runnable login helper: {}", err);
                results.push(AuthAttemptResult::failure(strategy, err));
                return results;
            }
        };

        tracing::info!(
            "Running login helper via {} in {}",
            plan.strategy,
            plan.working_directory.display()
        );
        match self.execute(&plan, observer).await {
            Ok(()) => {
                tracing::info!("Login helper succeeded");
                results.push(AuthAttemptResult::success(plan.strategy));
            }
            Err(err) => {
                tracing::warn!("Login helper failed: {}", err);
                results.push(AuthAttemptResult::failure(plan.strategy, err));
            }
        }
        results
    }

    async fn execute(
        &self,
        plan: &FallbackExecutionPlan,
        observer: &dyn RefreshObserver,
    ) -> Result<(), AuthError> {
        for step in plan.setup_steps() {
            run_captured(step).await?;
            self.mark_installed(&plan.working_directory);
        }

        match &plan.display_wrapper {
            Some(wrapper) => {
                let step = wrapper.wrap(plan, &self.x11_socket_dir);
                run_interactive(&step, observer).await
            }
            None => {
                for step in plan.run_steps() {
                    run_captured(step).await?;
                }
                Ok(())
            }
        }
    }
}

fn command_for(step: &PlanStep) -> Command {
    let mut cmd = Command::new(&step.program);
    cmd.args(&step.args)
        .envs(step.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .current_dir(&step.working_directory);
    cmd
}

/// Run a step with its output captured; a failure carries the combined output.
async fn run_captured(step: &PlanStep) -> Result<(), AuthError> {
    tracing::debug!("Running {}", step.to_shell());

    let output = command_for(step)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| AuthError::Execution {
            step: step.label.clone(),
            status: format!("spawn failed: {}", e),
            output: String::new(),
        })?;

    if output.status.success() {
        return Ok(());
    }

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    Err(AuthError::Execution {
        step: step.label.clone(),
        status: output.status.to_string(),
        output: combined.trim().to_string(),
    })
}

/// Run a step on the real terminal while the UI is suspended.
async fn run_interactive(step: &PlanStep, observer: &dyn RefreshObserver) -> Result<(), AuthError> {
    if let Some(released) = observer.suspend_terminal() {
        // A dropped sender means the UI is gone; the terminal is free either way
        let _ = released.await;
    }

    let status = command_for(step)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await;

    observer.resume_terminal();

    let status = status.map_err(|e| AuthError::Execution {
        step: step.label.clone(),
        status: format!("spawn failed: {}", e),
        output: String::new(),
    })?;
    if status.success() {
        Ok(())
    } else {
        Err(AuthError::Execution {
            step: step.label.clone(),
            status: status.to_string(),
            output: String::new(),
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    #[cfg(unix)]
    use std::path::Path;

    /// Write an executable `/bin/sh` script.
    #[cfg(unix)]
    pub(crate) fn write_script(path: &Path, body: &str) {
        use std::os::unix::fs::PermissionsExt;

        std::fs::write(path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
}
