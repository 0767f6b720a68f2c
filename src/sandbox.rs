use crate::{
    capabilities::CapabilityManager,
    checks,
    context::HostContext,
    environment::{self, Environment},
    error::{LaunchError, Result},
    hardener, identity,
    launch::LaunchSpec,
    log_capability_snapshot,
    mount::{self, MountPlan},
    process::{ChildHandle, ExitOutcome, Forked, ProcessRole, fork_role},
    report::{self, FailureReport, Receiver, Sender},
};
use nix::unistd::Uid;

type ReportSender = Sender<FailureReport>;

/// Drives one launch through the three process roles.
#[derive(Debug)]
pub struct Sandbox<'a> {
    spec: &'a LaunchSpec,
    host: HostContext,
    quiet: bool,
}

impl<'a> Sandbox<'a> {
    pub fn new(spec: &'a LaunchSpec, host: HostContext, quiet: bool) -> Self {
        Self { spec, host, quiet }
    }

    /// Runs the launch and returns the exit code to leave with.
    ///
    /// Only the reporter ever returns from here; the processes forked inside
    /// the namespaces exit on their own.
    pub fn run(&self) -> Result<i32> {
        checks::preflight()?;

        let (receiver, sender) = report::channel::<FailureReport>().map_err(report_error)?;

        identity::enter(self.spec, &self.host)?;

        match fork_role(ProcessRole::NamespaceInit)? {
            Forked::Parent(init) => {
                drop(sender);
                self.reporter(init, receiver)
            }
            Forked::Child => {
                drop(receiver);
                let code = self.namespace_init(&sender);
                drop(sender);
                std::process::exit(code)
            }
        }
    }

    fn reporter(&self, init: ChildHandle, receiver: Receiver<FailureReport>) -> Result<i32> {
        if !self.quiet {
            println!("burrow: init is {} (outside of namespace)", init.pid());
        }

        let outcome = init.wait()?;
        tracing::info!(role = %ProcessRole::Reporter, ?outcome, "namespace init finished");

        let reports = receiver.drain().unwrap_or_else(|error| {
            tracing::warn!("{error:#}");
            Vec::new()
        });

        for report in &reports {
            eprintln!("burrow: {report}");
        }

        Ok(resolve_exit_code(outcome, &reports))
    }

    fn namespace_init(&self, sender: &ReportSender) -> i32 {
        match self.init_main(sender) {
            Ok(code) => code,
            Err(error) => fail(ProcessRole::NamespaceInit, &error, sender),
        }
    }

    fn init_main(&self, sender: &ReportSender) -> Result<i32> {
        tracing::info!(role = %ProcessRole::NamespaceInit, "started");

        mount::isolate()?;
        log_capability_snapshot!("namespace init capabilities");

        MountPlan::new(self.spec).execute()?;
        hardener::change_root(&self.spec.root)?;

        match fork_role(ProcessRole::Workload)? {
            Forked::Parent(workload) => {
                let outcome = workload.wait()?;
                tracing::info!(?outcome, "workload finished");
                Ok(outcome.code())
            }
            Forked::Child => std::process::exit(self.workload(sender)),
        }
    }

    /// Never returns when the command starts; the result is the exit code otherwise.
    fn workload(&self, sender: &ReportSender) -> i32 {
        let error = self.workload_main();
        fail(ProcessRole::Workload, &error, sender)
    }

    fn workload_main(&self) -> LaunchError {
        let env = Environment::from_host(&self.spec.env);
        tracing::debug!(vars = env.len(), "workload environment");

        if self.spec.no_new_privs {
            if let Err(error) = hardener::apply_no_new_privs() {
                return error;
            }
        }

        if drops_capabilities(self.spec.uid) {
            if let Err(error) = CapabilityManager.drop_all() {
                return LaunchError::Capabilities {
                    message: format!("{error:#}"),
                };
            }

            match CapabilityManager::current() {
                Ok(snapshot) if !snapshot.is_empty() => {
                    return LaunchError::Capabilities {
                        message: format!("capabilities survived the drop ({snapshot})"),
                    };
                }
                Ok(_) => {}
                Err(error) => tracing::debug!("{error:#}"),
            }
        }
        log_capability_snapshot!("workload capabilities");

        tracing::info!(role = %ProcessRole::Workload, program = self.spec.program(), "exec");
        environment::exec(&self.spec.command, &env)
    }
}

/// Namespace root keeps its capabilities across exec; everyone else loses them all.
fn drops_capabilities(uid: Uid) -> bool {
    !uid.is_root()
}

fn report_error(error: anyhow::Error) -> LaunchError {
    LaunchError::Report {
        message: format!("{error:#}"),
    }
}

/// Logs `error`, hands it to the reporter and returns the exit code to die with.
fn fail(role: ProcessRole, error: &LaunchError, sender: &ReportSender) -> i32 {
    tracing::error!(%role, "{}", error.diagnostic());

    if let Err(send_error) = sender.send(&FailureReport::from(error)) {
        eprintln!("burrow: {role}: {} ({send_error:#})", error.diagnostic());
    }

    error.exit_code()
}

/// A failure report outranks whatever status happened to come back with it.
pub fn resolve_exit_code(outcome: ExitOutcome, reports: &[FailureReport]) -> i32 {
    match reports.first() {
        Some(report) => report.exit_code,
        None => outcome.code(),
    }
}
