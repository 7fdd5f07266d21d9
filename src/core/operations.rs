// src/core/operations.rs

//! Built-in operations: remote execution (`run`, `sudo`), file transfer
//! (`put`, `download`), local execution (`local`, `local_per_host`) and the
//! composite `upload_project`.

use crate::{
    constants::{DEFAULT_SHELL, keys},
    core::{
        environment::Environment,
        operation::{InvocationContext, Operation, OperationArgs, OperationError, OperationKind},
        output::{Stream, forward_lines, indent},
    },
    models::Outcome,
    system::{
        executor::{self, wait_for_exit},
        prompt::PromptError,
    },
};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

/// Every built-in operation.
pub fn builtins() -> Vec<Arc<dyn Operation>> {
    vec![
        Arc::new(Run),
        Arc::new(Sudo),
        Arc::new(Put),
        Arc::new(Download),
        Arc::new(Local),
        Arc::new(LocalPerHost),
        Arc::new(UploadProject),
    ]
}

/// Wraps `command` in the `fab_shell` template and escapes `$` for the remote shell.
fn wrap_in_shell(shell: &str, command: &str) -> Result<String, OperationError> {
    if !shell.contains("%s") {
        return Err(OperationError::InvalidShell(shell.to_string()));
    }
    Ok(shell.replacen("%s", &command.replace('"', "\\\""), 1))
}

fn escape_specials(command: &str) -> String {
    command.replace('$', "\\$")
}

/// Asks the `confirm=` question, if any. A declined or abandoned prompt returns false.
fn confirm_proceed(ctx: &InvocationContext<'_>, label: &str) -> Result<bool, OperationError> {
    let Some(question) = &ctx.args.confirm else {
        return Ok(true);
    };
    let question = format!(
        "Confirm {} for host {}: {}",
        label,
        ctx.host,
        ctx.scope.lazy_format(question)?
    );
    match ctx.prompter.confirm(&question) {
        Ok(answer) => Ok(answer),
        Err(PromptError::EndOfInput) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Runs `real_command` over a new channel, forwarding its output.
fn execute_remote(
    ctx: &InvocationContext<'_>,
    label: &str,
    shown: &str,
    real_command: &str,
    stdin_line: Option<&str>,
) -> Result<Outcome, OperationError> {
    if !confirm_proceed(ctx, label)? {
        return Ok(Outcome::skipped(format!("{} declined on {}", label, ctx.host)));
    }
    ctx.reporter
        .info(&format!("[{}] {}: {}", ctx.host, label, shown));

    let mut channel = ctx.session()?.open_channel(real_command)?;
    if let Some(mut stdin) = channel.stdin.take() {
        if let Some(line) = stdin_line {
            writeln!(stdin, "{}", line)?;
            stdin.flush()?;
        }
    }

    let out = forward_lines(
        channel.stdout,
        ctx.host.to_string(),
        Stream::Out,
        ctx.reporter.clone(),
    );
    let err = forward_lines(
        channel.stderr,
        ctx.host.to_string(),
        Stream::Err,
        ctx.reporter.clone(),
    );
    let status = wait_for_exit(channel.process.as_mut(), label, ctx.token);
    for forwarder in [out, err] {
        if forwarder.join().is_err() {
            log::warn!("[{}] output forwarder panicked", ctx.host);
        }
    }

    let status = status?;
    log::debug!("[{}] {} exited with {}", ctx.host, label, status);
    Ok(Outcome::from_success(status == 0))
}

/// Runs a shell command on every host.
#[derive(Debug)]
pub struct Run;

impl Operation for Run {
    fn name(&self) -> &'static str {
        "run"
    }

    fn description(&self) -> &'static str {
        "Run a shell command on the current hosts."
    }

    fn kind(&self) -> OperationKind {
        OperationKind::Remote
    }

    fn invoke(&self, ctx: &InvocationContext<'_>) -> Result<Outcome, OperationError> {
        let command = ctx.scope.lazy_format(ctx.args.arg(self.name(), 0, "cmd")?)?;
        let shell = ctx.scope.get_or(keys::SHELL, DEFAULT_SHELL);
        let real_command = escape_specials(&wrap_in_shell(&shell, &command)?);
        execute_remote(ctx, self.name(), &command, &real_command, None)
    }
}

/// Runs a shell command through `sudo` on every host.
#[derive(Debug)]
pub struct Sudo;

impl Operation for Sudo {
    fn name(&self) -> &'static str {
        "sudo"
    }

    fn description(&self) -> &'static str {
        "Run a root privileged command on the current hosts."
    }

    fn kind(&self) -> OperationKind {
        OperationKind::Remote
    }

    fn invoke(&self, ctx: &InvocationContext<'_>) -> Result<Outcome, OperationError> {
        let command = ctx.scope.lazy_format(ctx.args.arg(self.name(), 0, "cmd")?)?;
        let password = ctx.scope.get_str(keys::PASSWORD);
        let prefix = if password.is_some() { "sudo -S " } else { "sudo " };
        let shell = ctx.scope.get_or(keys::SHELL, DEFAULT_SHELL);
        let wrapped = wrap_in_shell(&shell, &format!("{}{}", prefix, command))?;
        let shown = if ctx.scope.flag(keys::PRINT_REAL_SUDO) {
            wrapped.clone()
        } else {
            command
        };
        execute_remote(
            ctx,
            self.name(),
            &shown,
            &escape_specials(&wrapped),
            password.as_deref(),
        )
    }
}

/// Uploads a local file to every host.
#[derive(Debug)]
pub struct Put;

impl Operation for Put {
    fn name(&self) -> &'static str {
        "put"
    }

    fn description(&self) -> &'static str {
        "Upload a file to the current hosts."
    }

    fn kind(&self) -> OperationKind {
        OperationKind::Remote
    }

    fn invoke(&self, ctx: &InvocationContext<'_>) -> Result<Outcome, OperationError> {
        let local = ctx.scope.lazy_format(ctx.args.arg(self.name(), 0, "localpath")?)?;
        let remote = ctx.scope.lazy_format(ctx.args.arg(self.name(), 1, "remotepath")?)?;
        if !Path::new(&local).exists() {
            return Ok(Outcome::failed_with(format!(
                "Local file '{}' does not exist.",
                local
            )));
        }
        let session = ctx.session()?;
        ctx.reporter
            .info(&format!("[{}] put: {} -> {}", ctx.host, local, remote));
        session.put(Path::new(&local), &remote)?;
        Ok(Outcome::succeeded())
    }
}

/// Downloads a file from every host, suffixing the local name with the host.
#[derive(Debug)]
pub struct Download;

impl Operation for Download {
    fn name(&self) -> &'static str {
        "download"
    }

    fn description(&self) -> &'static str {
        "Download a file from the current hosts into <localpath>.<host>."
    }

    fn kind(&self) -> OperationKind {
        OperationKind::Remote
    }

    fn invoke(&self, ctx: &InvocationContext<'_>) -> Result<Outcome, OperationError> {
        let remote = ctx.scope.lazy_format(ctx.args.arg(self.name(), 0, "remotepath")?)?;
        let local = format!(
            "{}.{}",
            ctx.scope.lazy_format(ctx.args.arg(self.name(), 1, "localpath")?)?,
            ctx.host
        );
        let session = ctx.session()?;
        ctx.reporter
            .info(&format!("[{}] download: {} <- {}", ctx.host, local, remote));
        session.get(&remote, Path::new(&local))?;
        Ok(Outcome::succeeded())
    }
}

fn run_locally(ctx: &InvocationContext<'_>, banner_host: &str) -> Result<Outcome, OperationError> {
    let command = ctx.scope.lazy_format(ctx.args.arg("local", 0, "cmd")?)?;
    ctx.reporter
        .info(&format!("[{}] run: {}", banner_host, command));
    let status = executor::execute_shell_command(&command, ctx.token)?;
    if status == 0 {
        Ok(Outcome::succeeded())
    } else {
        Ok(Outcome::failed_with(format!(
            "Local command failed:\n{}",
            indent(&command, 4)
        )))
    }
}

/// Runs a command on this machine.
#[derive(Debug)]
pub struct Local;

impl Operation for Local {
    fn name(&self) -> &'static str {
        "local"
    }

    fn description(&self) -> &'static str {
        "Run a command locally."
    }

    fn kind(&self) -> OperationKind {
        OperationKind::Local
    }

    fn invoke(&self, ctx: &InvocationContext<'_>) -> Result<Outcome, OperationError> {
        run_locally(ctx, "localhost")
    }
}

/// Runs a command on this machine once per host, with `$(fab_host)` bound.
#[derive(Debug)]
pub struct LocalPerHost;

impl Operation for LocalPerHost {
    fn name(&self) -> &'static str {
        "local_per_host"
    }

    fn description(&self) -> &'static str {
        "Run a command locally, once for every host."
    }

    fn kind(&self) -> OperationKind {
        OperationKind::LocalPerHost
    }

    fn invoke(&self, ctx: &InvocationContext<'_>) -> Result<Outcome, OperationError> {
        run_locally(ctx, &format!("localhost/{}", ctx.host))
    }
}

/// Archives the working directory, uploads it to every host and unpacks it
/// in the login directory.
#[derive(Debug)]
pub struct UploadProject;

impl Operation for UploadProject {
    fn name(&self) -> &'static str {
        "upload_project"
    }

    fn description(&self) -> &'static str {
        "Upload the current directory to the hosts and unpack it there."
    }

    fn kind(&self) -> OperationKind {
        OperationKind::Composite
    }

    fn invoke(&self, _ctx: &InvocationContext<'_>) -> Result<Outcome, OperationError> {
        Ok(Outcome::succeeded())
    }

    fn expand(
        &self,
        args: &OperationArgs,
        env: &Environment,
    ) -> Result<Vec<(&'static str, OperationArgs)>, OperationError> {
        let cwd = std::env::current_dir()?;
        let project = cwd
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                OperationError::InvalidArgument(format!(
                    "'{}' has no directory name to upload as",
                    cwd.display()
                ))
            })?;
        let archive = std::env::temp_dir().join(format!(
            "fab.{}.{}.tar.gz",
            env.get_or(keys::TIMESTAMP, "0"),
            uuid::Uuid::new_v4()
        ));
        let archive = archive.display().to_string();
        let remote_archive = format!("{}.tar.gz", project);

        let quote = |s: &str| {
            shlex::try_quote(s)
                .map(|q| q.into_owned())
                .map_err(|e| OperationError::InvalidArgument(e.to_string()))
        };
        let local_archive = quote(&archive)?;
        let remote_quoted = quote(&remote_archive)?;

        let step = |positional: Vec<String>| {
            OperationArgs::new(positional)
                .with_fail(args.fail)
                .with_confirm(args.confirm.clone())
        };
        Ok(vec![
            ("local", step(vec![format!("tar -czf {} .", local_archive)])),
            ("put", step(vec![archive.clone(), remote_archive.clone()])),
            ("local", step(vec![format!("rm -f {}", local_archive)])),
            ("run", step(vec![format!("tar -xzf {}", remote_quoted)])),
            ("run", step(vec![format!("rm -f {}", remote_quoted)])),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        CancellationToken,
        core::environment::Scope,
        core::output::Reporter,
        models::{Layer, OutcomeStatus, Value},
        system::transport::{Session, SessionTransport},
        testing::{FakeTransport, RecordingReporter, ScriptedPrompter},
    };
    use std::sync::atomic::AtomicBool;

    struct Harness {
        scope: Scope,
        reporter: Arc<RecordingReporter>,
        prompter: ScriptedPrompter,
        token: CancellationToken,
        session: Box<dyn Session>,
        transport: Arc<FakeTransport>,
    }

    impl Harness {
        fn new(transport: FakeTransport) -> Self {
            let transport = Arc::new(transport);
            let mut env = Environment::with_defaults();
            env.insert_raw("app", "shop");
            let host: Layer = [
                (keys::HOST.to_string(), Value::from("web1")),
                (keys::CURRENT_OPERATION.to_string(), Value::from("run")),
            ]
            .into();
            let session = transport
                .connect(&crate::system::transport::ConnectParams {
                    hostname: "web1".to_string(),
                    port: 22,
                    user: "alice".to_string(),
                    password: None,
                    key_filename: None,
                    accept_new_host_keys: true,
                })
                .unwrap();
            Self {
                scope: env.merge(&Layer::new(), &host),
                reporter: Arc::new(RecordingReporter::default()),
                prompter: ScriptedPrompter::default(),
                token: Arc::new(AtomicBool::new(false)),
                session,
                transport,
            }
        }

        fn invoke(&self, operation: &dyn Operation, args: OperationArgs) -> Outcome {
            let reporter: Arc<dyn Reporter> = self.reporter.clone();
            let ctx = InvocationContext {
                host: "web1",
                session: Some(self.session.as_ref()),
                scope: &self.scope,
                args: &args,
                reporter: &reporter,
                prompter: &self.prompter,
                token: &self.token,
            };
            crate::core::operation::invoke(operation, &ctx)
        }
    }

    #[test]
    fn test_wrap_in_shell_escapes_quotes_then_dollars() {
        let wrapped = wrap_in_shell(r#"/bin/bash -l -c "%s""#, r#"echo "$HOME""#).unwrap();
        assert_eq!(wrapped, r#"/bin/bash -l -c "echo \"$HOME\"""#);
        assert_eq!(
            escape_specials(&wrapped),
            r#"/bin/bash -l -c "echo \"\$HOME\"""#
        );
        assert!(wrap_in_shell("/bin/sh", "ls").is_err());
    }

    #[test]
    fn test_run_streams_prefixed_output_and_reports_status() {
        let harness = Harness::new(FakeTransport::default().with_output("ls shop", "a\nb\n", "", 0));
        let outcome = harness.invoke(&Run, OperationArgs::new(["ls $(app)"]));

        assert_eq!(outcome.status, OutcomeStatus::Succeeded);
        assert_eq!(
            harness.transport.commands(),
            vec![r#"/bin/bash -l -c "ls shop""#.to_string()]
        );
        assert_eq!(harness.reporter.infos(), vec!["[web1] run: ls shop".to_string()]);
        assert_eq!(
            harness.reporter.lines(),
            vec!["[web1] out: a".to_string(), "[web1] out: b".to_string()]
        );
    }

    #[test]
    fn test_run_non_zero_exit_fails() {
        let harness = Harness::new(FakeTransport::default().with_output("false", "", "nope\n", 1));
        let outcome = harness.invoke(&Run, OperationArgs::new(["false"]));
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert_eq!(harness.reporter.lines(), vec!["[web1] err: nope".to_string()]);
    }

    #[test]
    fn test_sudo_feeds_password_on_stdin() {
        let mut harness = Harness::new(FakeTransport::default());
        harness.scope = harness.scope.clone().with(keys::PASSWORD, "s3cret");
        let outcome = harness.invoke(&Sudo, OperationArgs::new(["whoami"]));

        assert!(!outcome.is_failure());
        assert_eq!(
            harness.transport.commands(),
            vec![r#"/bin/bash -l -c "sudo -S whoami""#.to_string()]
        );
        assert_eq!(harness.transport.stdin_written(), "s3cret\n");
        assert_eq!(harness.reporter.infos(), vec!["[web1] sudo: whoami".to_string()]);
    }

    #[test]
    fn test_declined_confirmation_skips() {
        let mut harness = Harness::new(FakeTransport::default());
        harness.prompter = ScriptedPrompter::default().with_confirms(&[false]);
        let args = OperationArgs::new(["reboot"]).with_confirm(Some("Really reboot?".to_string()));
        let outcome = harness.invoke(&Run, args);

        assert_eq!(outcome.status, OutcomeStatus::Skipped);
        assert!(harness.transport.commands().is_empty());
        assert_eq!(
            harness.prompter.confirm_questions(),
            vec!["Confirm run for host web1: Really reboot?".to_string()]
        );
    }

    #[test]
    fn test_put_requires_existing_local_file() {
        let harness = Harness::new(FakeTransport::default());
        let outcome = harness.invoke(&Put, OperationArgs::new(["/no/such/file", "/tmp/x"]));
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert!(harness.transport.uploads().is_empty());

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("app.tgz");
        std::fs::write(&file, b"payload").unwrap();
        let outcome = harness.invoke(
            &Put,
            OperationArgs::new([file.display().to_string(), "/srv/$(app).tgz".to_string()]),
        );
        assert_eq!(outcome.status, OutcomeStatus::Succeeded);
        assert_eq!(
            harness.transport.uploads(),
            vec![(file.display().to_string(), "/srv/shop.tgz".to_string())]
        );
    }

    #[test]
    fn test_download_suffixes_host() {
        let harness = Harness::new(FakeTransport::default());
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("server.log");
        let outcome = harness.invoke(
            &Download,
            OperationArgs::new(["/var/log/server.log".to_string(), local.display().to_string()]),
        );
        assert_eq!(outcome.status, OutcomeStatus::Succeeded);
        assert_eq!(
            harness.transport.downloads(),
            vec![(
                "/var/log/server.log".to_string(),
                format!("{}.web1", local.display())
            )]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_local_failure_carries_command() {
        let harness = Harness::new(FakeTransport::default());
        let outcome = harness.invoke(&Local, OperationArgs::new(["exit 4"]));
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert_eq!(
            outcome.message.as_deref(),
            Some("Local command failed:\n    exit 4")
        );
    }

    #[test]
    fn test_upload_project_expands_to_five_steps() {
        let env = Environment::with_defaults();
        let steps = UploadProject
            .expand(&OperationArgs::default(), &env)
            .unwrap();
        let names: Vec<&str> = steps.iter().map(|(name, _)| *name).collect();
        assert_eq!(names, vec!["local", "put", "local", "run", "run"]);
        let (_, put_args) = &steps[1];
        assert!(put_args.positional[1].ends_with(".tar.gz"));
    }
}
