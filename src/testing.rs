// src/testing.rs

//! In-memory fakes shared by the unit tests.

use crate::{
    core::output::{Reporter, Stream},
    system::{
        executor::ProcessHandle,
        prompt::{PromptError, Prompter},
        transport::{Channel, ConnectParams, Session, SessionTransport, TransportError},
    },
};
use std::collections::{BTreeMap, VecDeque};
use std::io::{self, Cursor, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, Default)]
struct FakeState {
    handshakes: BTreeMap<String, usize>,
    commands: Vec<(String, String)>,
    stdin: Vec<u8>,
    uploads: Vec<(String, String)>,
    downloads: Vec<(String, String)>,
    closes: usize,
}

#[derive(Debug, Clone)]
struct CannedOutput {
    needle: String,
    stdout: String,
    stderr: String,
    status: i32,
}

/// A transport whose sessions record what they are asked to do.
#[derive(Debug, Default)]
pub struct FakeTransport {
    password: Option<(String, String)>,
    outputs: Vec<CannedOutput>,
    host_status: BTreeMap<String, i32>,
    close_delay: Duration,
    state: Arc<Mutex<FakeState>>,
}

impl FakeTransport {
    /// Logins as `user` succeed only with `password`.
    pub fn with_password(user: &str, password: &str) -> Self {
        Self {
            password: Some((user.to_string(), password.to_string())),
            ..Self::default()
        }
    }

    /// Commands containing `needle` print `stdout`/`stderr` and exit with `status`.
    pub fn with_output(mut self, needle: &str, stdout: &str, stderr: &str, status: i32) -> Self {
        self.outputs.push(CannedOutput {
            needle: needle.to_string(),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            status,
        });
        self
    }

    /// Every command on `host` exits with `status`.
    pub fn with_exit_status_on(mut self, host: &str, status: i32) -> Self {
        self.host_status.insert(host.to_string(), status);
        self
    }

    /// Every session close takes `delay`.
    pub fn with_close_delay(mut self, delay: Duration) -> Self {
        self.close_delay = delay;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Connection attempts made to `host`.
    pub fn handshakes(&self, host: &str) -> usize {
        self.state().handshakes.get(host).copied().unwrap_or(0)
    }

    /// Connection attempts made to any host.
    pub fn total_handshakes(&self) -> usize {
        self.state().handshakes.values().sum()
    }

    /// Every command opened, in order.
    pub fn commands(&self) -> Vec<String> {
        self.state().commands.iter().map(|(_, c)| c.clone()).collect()
    }

    /// Commands opened on `host`.
    pub fn commands_on(&self, host: &str) -> Vec<String> {
        self.state()
            .commands
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// Everything written to channel stdins.
    pub fn stdin_written(&self) -> String {
        String::from_utf8_lossy(&self.state().stdin).into_owned()
    }

    /// `(local, remote)` pairs uploaded.
    pub fn uploads(&self) -> Vec<(String, String)> {
        self.state().uploads.clone()
    }

    /// `(remote, local)` pairs downloaded.
    pub fn downloads(&self) -> Vec<(String, String)> {
        self.state().downloads.clone()
    }

    /// Sessions closed.
    pub fn closes(&self) -> usize {
        self.state().closes
    }
}

impl SessionTransport for FakeTransport {
    fn connect(&self, params: &ConnectParams) -> Result<Box<dyn Session>, TransportError> {
        *self
            .state()
            .handshakes
            .entry(params.hostname.clone())
            .or_default() += 1;
        if let Some((user, password)) = &self.password {
            if *user == params.user && params.password.as_ref() != Some(password) {
                return Err(TransportError::Authentication {
                    target: params.target(),
                    detail: "Permission denied".to_string(),
                });
            }
        }
        Ok(Box::new(FakeSession {
            host: params.hostname.clone(),
            outputs: self.outputs.clone(),
            status: self.host_status.get(&params.hostname).copied(),
            close_delay: self.close_delay,
            state: self.state.clone(),
        }))
    }
}

struct FakeSession {
    host: String,
    outputs: Vec<CannedOutput>,
    status: Option<i32>,
    close_delay: Duration,
    state: Arc<Mutex<FakeState>>,
}

impl Session for FakeSession {
    fn open_channel(&self, command: &str) -> Result<Channel, TransportError> {
        self.state
            .lock()
            .unwrap()
            .commands
            .push((self.host.clone(), command.to_string()));
        let canned = self
            .outputs
            .iter()
            .find(|output| command.contains(&output.needle))
            .cloned();
        let (stdout, stderr, status) = match canned {
            Some(c) => (c.stdout, c.stderr, self.status.unwrap_or(c.status)),
            None => (String::new(), String::new(), self.status.unwrap_or(0)),
        };
        Ok(Channel {
            stdin: Some(Box::new(SharedStdin(self.state.clone()))),
            stdout: Box::new(Cursor::new(stdout.into_bytes())),
            stderr: Box::new(Cursor::new(stderr.into_bytes())),
            process: Box::new(FinishedProcess(status)),
        })
    }

    fn put(&self, local: &Path, remote: &str) -> Result<(), TransportError> {
        self.state
            .lock()
            .unwrap()
            .uploads
            .push((local.display().to_string(), remote.to_string()));
        Ok(())
    }

    fn get(&self, remote: &str, local: &Path) -> Result<(), TransportError> {
        self.state
            .lock()
            .unwrap()
            .downloads
            .push((remote.to_string(), local.display().to_string()));
        Ok(())
    }

    fn close(&self) -> Result<(), TransportError> {
        thread::sleep(self.close_delay);
        self.state.lock().unwrap().closes += 1;
        Ok(())
    }
}

struct SharedStdin(Arc<Mutex<FakeState>>);

impl Write for SharedStdin {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().stdin.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct FinishedProcess(i32);

impl ProcessHandle for FinishedProcess {
    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        Ok(Some(self.0))
    }

    fn kill(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Answers prompts from fixed scripts; an exhausted script means end-of-input.
#[derive(Debug, Default)]
pub struct ScriptedPrompter {
    passwords: Mutex<VecDeque<String>>,
    inputs: Mutex<VecDeque<String>>,
    confirms: Mutex<VecDeque<bool>>,
    password_prompts: Mutex<Vec<String>>,
    input_prompts: Mutex<Vec<String>>,
    confirm_questions: Mutex<Vec<String>>,
}

impl ScriptedPrompter {
    /// Answers password prompts with `passwords`, in order.
    pub fn with_passwords(passwords: &[&str]) -> Self {
        Self {
            passwords: Mutex::new(passwords.iter().map(|p| p.to_string()).collect()),
            ..Self::default()
        }
    }

    /// Answers text prompts with `inputs`, in order.
    pub fn with_inputs(self, inputs: &[&str]) -> Self {
        *self.inputs.lock().unwrap() = inputs.iter().map(|i| i.to_string()).collect();
        self
    }

    /// Answers confirmations with `answers`, in order.
    pub fn with_confirms(self, answers: &[bool]) -> Self {
        *self.confirms.lock().unwrap() = answers.iter().copied().collect();
        self
    }

    /// Password prompts shown so far.
    pub fn password_prompts(&self) -> Vec<String> {
        self.password_prompts.lock().unwrap().clone()
    }

    /// Text prompts shown so far.
    pub fn input_prompts(&self) -> Vec<String> {
        self.input_prompts.lock().unwrap().clone()
    }

    /// Confirmation questions asked so far.
    pub fn confirm_questions(&self) -> Vec<String> {
        self.confirm_questions.lock().unwrap().clone()
    }
}

impl Prompter for ScriptedPrompter {
    fn password(&self, prompt: &str) -> Result<String, PromptError> {
        self.password_prompts.lock().unwrap().push(prompt.to_string());
        self.passwords
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(PromptError::EndOfInput)
    }

    fn input(&self, prompt: &str) -> Result<String, PromptError> {
        self.input_prompts.lock().unwrap().push(prompt.to_string());
        self.inputs
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(PromptError::EndOfInput)
    }

    fn confirm(&self, question: &str) -> Result<bool, PromptError> {
        self.confirm_questions
            .lock()
            .unwrap()
            .push(question.to_string());
        self.confirms
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(PromptError::EndOfInput)
    }
}

/// Captures everything that would have been printed.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    infos: Mutex<Vec<String>>,
    warnings: Mutex<Vec<String>>,
    errors: Mutex<Vec<String>>,
    lines: Mutex<Vec<String>>,
}

impl RecordingReporter {
    pub fn infos(&self) -> Vec<String> {
        self.infos.lock().unwrap().clone()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.warnings.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }

    /// Forwarded lines, rendered as `[host] stream: line`.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

impl Reporter for RecordingReporter {
    fn info(&self, message: &str) {
        self.infos.lock().unwrap().push(message.to_string());
    }

    fn warn(&self, message: &str) {
        self.warnings.lock().unwrap().push(message.to_string());
    }

    fn error(&self, message: &str) {
        self.errors.lock().unwrap().push(message.to_string());
    }

    fn line(&self, host: &str, stream: Stream, line: &str) {
        self.lines
            .lock()
            .unwrap()
            .push(format!("[{}] {}: {}", host, stream, line));
    }
}
