use crate::config::{DebuggerConfig, NetfuzzConfig};
use crate::crash::{CrashRecord, extract_backtrace, inferior_pid};
use crate::ipc::{ControlMessage, ControlSink, IpcError, OutputSink};
use crate::sanitizer::{NoSanitizer, SanitizerLogDirectory, SanitizerReports};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStderr, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DebugServerError {
    #[error("No [debugger] section configured")]
    NotConfigured,
    #[error("Failed to spawn debugger {path:?}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Debugger {0} was not captured")]
    MissingPipe(&'static str),
    #[error("Failed to read debugger output: {0}")]
    Read(#[source] io::Error),
    #[error("Failed to wait for debugger: {0}")]
    Wait(#[source] io::Error),
    #[error("Failed to report to supervisor: {0}")]
    Control(#[from] IpcError),
}

/// Where a single [`DebugServerManager::run_until_crash`] invocation is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugState {
    Idle,
    Launched,
    AwaitingFault,
    Extracting,
    Reported,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Process id announced on the control channel.
    pub debugger_pid: u32,
    /// Process id of the debugged target, when the debugger printed it.
    pub target_pid: Option<u32>,
    /// Whether a crash record was sent.
    pub crashed: bool,
}

/// Everything the debugger printed during one session.
struct Transcript {
    stdout: String,
    stderr: String,
    status: ExitStatus,
}

/// A running debugger. Killed and reaped when dropped, whatever path led there.
struct DebuggerProcess {
    child: Child,
    stderr_reader: Option<JoinHandle<io::Result<Vec<u8>>>>,
}

impl DebuggerProcess {
    fn spawn(
        config: &DebuggerConfig,
        env: &BTreeMap<String, String>,
    ) -> Result<Self, DebugServerError> {
        let mut cmd = Command::new(&config.path);
        cmd.arg(&config.target_bin)
            .args(&config.args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        info!("Start server: {:?}", cmd);
        let mut child = cmd.spawn().map_err(|source| DebugServerError::Spawn {
            path: config.path.clone(),
            source,
        })?;

        // A full stderr pipe would block the debugger while stdout is read.
        let stderr_reader = child.stderr.take().map(|mut stderr: ChildStderr| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                stderr.read_to_end(&mut buf).map(|_| buf)
            })
        });

        Ok(Self {
            child,
            stderr_reader,
        })
    }

    fn id(&self) -> u32 {
        self.child.id()
    }

    /// Writes the command script and closes stdin, which ends the session
    /// once the debugger has worked through it.
    fn submit(&mut self, commands: &str) -> Result<(), DebugServerError> {
        let mut stdin = self
            .child
            .stdin
            .take()
            .ok_or(DebugServerError::MissingPipe("stdin"))?;
        if let Err(e) = stdin.write_all(commands.as_bytes()) {
            // The debugger may already be gone; its output still tells us why.
            warn!("Failed to write debugger commands: {}", e);
        }
        Ok(())
    }

    /// Reads stdout until the pipe closes, handing each line to `on_line`,
    /// then waits for the debugger to exit.
    fn collect_output(
        &mut self,
        mut on_line: impl FnMut(&str),
    ) -> Result<Transcript, DebugServerError> {
        let stdout = self
            .child
            .stdout
            .take()
            .ok_or(DebugServerError::MissingPipe("stdout"))?;
        let mut reader = BufReader::new(stdout);
        let mut transcript = String::new();
        let mut line = Vec::new();
        loop {
            line.clear();
            let read = reader
                .read_until(b'\n', &mut line)
                .map_err(DebugServerError::Read)?;
            if read == 0 {
                break;
            }
            let text = String::from_utf8_lossy(&line);
            on_line(&text);
            transcript.push_str(&text);
        }

        let status = self.child.wait().map_err(DebugServerError::Wait)?;
        let stderr = match self.stderr_reader.take().map(JoinHandle::join) {
            Some(Ok(Ok(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
            Some(Ok(Err(e))) => return Err(DebugServerError::Read(e)),
            Some(Err(_)) => {
                warn!("stderr reader thread panicked");
                String::new()
            }
            None => String::new(),
        };

        Ok(Transcript {
            stdout: transcript,
            stderr,
            status,
        })
    }
}

impl Drop for DebuggerProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            debug!("Killing debugger {}", self.child.id());
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Reproduces a crash by running the target under a debugger and reports
/// the resulting [`CrashRecord`] to the supervising process.
pub struct DebugServerManager<C: ControlSink, O: OutputSink> {
    config: DebuggerConfig,
    env: BTreeMap<String, String>,
    control: C,
    output: O,
    output_closed: bool,
    target_port: u16,
    sanitizer: Box<dyn SanitizerReports>,
    state: DebugState,
}

impl<C: ControlSink, O: OutputSink> DebugServerManager<C, O> {
    /// Creates a manager that reports to the given channels.
    ///
    /// # Arguments
    /// * `config`: How to start the debugger and the target under it. Its
    ///   `env` table becomes the debugger's extra environment.
    /// * `control`: Receives the pid announcement and the crash record.
    /// * `output`: Receives every line the debugger prints, best-effort.
    /// * `target_port`: Substituted for `{port}` in the target arguments.
    ///
    /// Sanitizer reports are not looked up until [`with_sanitizer`] is used.
    ///
    /// [`with_sanitizer`]: DebugServerManager::with_sanitizer
    pub fn new(config: DebuggerConfig, control: C, output: O, target_port: u16) -> Self {
        let env = config.env.clone();
        Self {
            config,
            env,
            control,
            output,
            output_closed: false,
            target_port,
            sanitizer: Box::new(NoSanitizer),
            state: DebugState::Idle,
        }
    }

    /// Builds a manager from the full configuration, including the sanitizer
    /// environment and report lookup.
    pub fn from_config(
        config: &NetfuzzConfig,
        control: C,
        output: O,
        target_port: u16,
    ) -> Result<Self, DebugServerError> {
        let debugger = config
            .debugger
            .clone()
            .ok_or(DebugServerError::NotConfigured)?;
        let mut manager = Self::new(debugger, control, output, target_port)
            .with_environment(config.debugger_environment());
        if let Some(sanitizer) = &config.sanitizer {
            manager = manager.with_sanitizer(Box::new(SanitizerLogDirectory::from_config(sanitizer)));
        }
        Ok(manager)
    }

    /// Replaces the extra environment passed to the debugger.
    pub fn with_environment(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Attaches reports from `sanitizer` to crash records, keyed by the
    /// target's pid.
    pub fn with_sanitizer(mut self, sanitizer: Box<dyn SanitizerReports>) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    /// Where the current or most recent run stopped.
    pub fn state(&self) -> DebugState {
        self.state
    }

    /// The `run` command with the live port substituted, followed by a
    /// request for the stack trace once the target stops.
    pub fn debugger_commands(&self) -> String {
        let args = self
            .config
            .target_args
            .replace("{port}", &self.target_port.to_string());
        format!("r {}\nbt\n", args.trim())
    }

    /// Runs the target under the debugger until it exits or faults.
    ///
    /// The debugger's pid is sent on the control channel as soon as it is
    /// known. A crash record follows only if the transcript contains a
    /// backtrace; a run without one still completes successfully. Failing to
    /// start the debugger is an error and sends nothing.
    pub fn run_until_crash(&mut self) -> Result<RunSummary, DebugServerError> {
        self.state = DebugState::Idle;
        let result = self.drive();
        if result.is_err() {
            self.state = DebugState::Failed;
        }
        result
    }

    fn drive(&mut self) -> Result<RunSummary, DebugServerError> {
        info!("DebugServer: Start Server");
        if !self.config.target_args.is_empty() && !self.config.target_args.contains("{port}") {
            warn!(
                "target-args {:?} has no {{port}} placeholder",
                self.config.target_args
            );
        }

        let mut process = DebuggerProcess::spawn(&self.config, &self.env)?;
        self.state = DebugState::Launched;
        let debugger_pid = process.id();
        info!("Server PID: {}", debugger_pid);
        self.control.send_control(ControlMessage::Pid(debugger_pid))?;

        process.submit(&self.debugger_commands())?;
        self.state = DebugState::AwaitingFault;
        info!("Wait for crash");
        let transcript = {
            let output = &mut self.output;
            let output_closed = &mut self.output_closed;
            process.collect_output(|line| forward_output(output, output_closed, line))?
        };
        drop(process);
        debug!(
            "Debugger exited with {}, {} bytes of output",
            transcript.status,
            transcript.stdout.len()
        );

        self.state = DebugState::Extracting;
        let target_pid = inferior_pid(&transcript.stdout);
        let crashed = match extract_backtrace(&transcript.stdout, &self.config.prompt) {
            Some(backtrace) => {
                info!("Got backtrace with {} frames", backtrace.len());
                let mut raw_output = transcript.stdout;
                raw_output.push_str(&transcript.stderr);
                let mut record = CrashRecord::new(backtrace, raw_output);
                if let Some(report) = self.sanitizer.lookup(target_pid.unwrap_or(debugger_pid)) {
                    record = record.with_sanitizer_output(report);
                }
                self.control.send_control(ControlMessage::Data(record))?;
                true
            }
            None => {
                info!("No backtrace in debugger output, nothing to report");
                false
            }
        };

        self.state = DebugState::Reported;
        Ok(RunSummary {
            debugger_pid,
            target_pid,
            crashed,
        })
    }
}

/// Output goes to a best-effort viewer; losing it must not abort the run.
fn forward_output<O: OutputSink>(output: &mut O, closed: &mut bool, line: &str) {
    if *closed {
        return;
    }
    if let Err(e) = output.send_output(line) {
        warn!("Output channel closed, dropping further debugger output: {}", e);
        *closed = true;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use std::sync::mpsc::{self, Receiver, Sender};
    use tempfile::{TempDir, tempdir};

    const CRASHING_SESSION: &str = r#"read run_cmd
read bt_cmd
echo "Reading symbols from ./server..."
printf '(gdb) Starting program: %s\n' "$run_cmd"
echo "[New Thread 0x7ffff7d8a640 (LWP 31337)]"
echo "Program received signal SIGSEGV, Segmentation fault."
printf '0x0000555555555139 in foo ()\n'
printf '(gdb) #0 foo ()\n#1 bar ()\n#2 main ()\n(gdb) '
echo "warning: Error disabling address space randomization" >&2
"#;

    const CLEAN_SESSION: &str = r#"read run_cmd
read bt_cmd
printf '(gdb) Starting program: %s\n' "$run_cmd"
echo "[Inferior 1 (process 4242) exited normally]"
printf '(gdb) No stack.\n(gdb) '
"#;

    struct Harness {
        _dir: TempDir,
        manager: DebugServerManager<Sender<ControlMessage>, Sender<String>>,
        control: Receiver<ControlMessage>,
        output: Receiver<String>,
    }

    /// `/bin/sh` plays the debugger: it is started with the script in the
    /// target position and reads the commands from stdin like gdb would.
    fn harness(script: &str) -> Harness {
        let dir = tempdir().unwrap();
        let script_path = dir.path().join("fake_gdb.sh");
        fs::write(&script_path, script).unwrap();

        let config = DebuggerConfig {
            path: PathBuf::from("/bin/sh"),
            args: Vec::new(),
            ..DebuggerConfig::for_target(&script_path, "--port {port} --foreground")
        };
        let (control_tx, control) = mpsc::channel();
        let (output_tx, output) = mpsc::channel();
        Harness {
            _dir: dir,
            manager: DebugServerManager::new(config, control_tx, output_tx, 4711),
            control,
            output,
        }
    }

    fn write_report(dir: &Path, name: &str, text: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(name), text).unwrap();
    }

    #[test_log::test]
    fn crash_produces_pid_then_record() {
        let mut h = harness(CRASHING_SESSION);
        let summary = h.manager.run_until_crash().unwrap();
        assert!(summary.crashed);
        assert_eq!(summary.target_pid, None);
        assert_eq!(h.manager.state(), DebugState::Reported);

        let messages: Vec<ControlMessage> = h.control.try_iter().collect();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], ControlMessage::Pid(summary.debugger_pid));
        let ControlMessage::Data(record) = &messages[1] else {
            panic!("expected a crash record, got {:?}", messages[1]);
        };
        assert_eq!(record.backtrace, vec!["#0 foo ()", "#1 bar ()", "#2 main ()"]);
        assert_eq!(record.cause, crate::crash::UNCLASSIFIED_CAUSE);
        assert!(record.sanitizer_output.is_none());
        assert!(record.raw_output.contains("Program received signal SIGSEGV"));
        assert!(record.raw_output.contains("Error disabling address space randomization"));
    }

    #[test]
    fn port_is_substituted_into_the_run_command() {
        let mut h = harness(CRASHING_SESSION);
        assert_eq!(h.manager.debugger_commands(), "r --port 4711 --foreground\nbt\n");
        h.manager.run_until_crash().unwrap();

        let streamed: String = h.output.try_iter().collect();
        assert!(
            streamed.contains("Starting program: r --port 4711 --foreground"),
            "unexpected output: {streamed}"
        );
    }

    #[test]
    fn clean_exit_sends_only_the_pid() {
        let mut h = harness(CLEAN_SESSION);
        let summary = h.manager.run_until_crash().unwrap();
        assert!(!summary.crashed);
        assert_eq!(summary.target_pid, Some(4242));
        assert_eq!(h.manager.state(), DebugState::Reported);

        let messages: Vec<ControlMessage> = h.control.try_iter().collect();
        assert_eq!(messages, vec![ControlMessage::Pid(summary.debugger_pid)]);
    }

    #[test]
    fn target_output_with_hash_digits_is_not_a_backtrace() {
        let noisy = CLEAN_SESSION.replace(
            "echo \"[Inferior 1",
            "echo \"conn #1 accepted\"\necho \"req #5 served\"\necho \"[Inferior 1",
        );
        let mut h = harness(&noisy);
        let summary = h.manager.run_until_crash().unwrap();
        assert!(!summary.crashed);
        let messages: Vec<ControlMessage> = h.control.try_iter().collect();
        assert_eq!(messages, vec![ControlMessage::Pid(summary.debugger_pid)]);

        let noisy = CRASHING_SESSION.replace(
            "echo \"Program received",
            "echo \"conn #1 accepted\"\necho \"Program received",
        );
        let mut h = harness(&noisy);
        assert!(h.manager.run_until_crash().unwrap().crashed);
        let record = h
            .control
            .try_iter()
            .find_map(|m| match m {
                ControlMessage::Data(record) => Some(record),
                ControlMessage::Pid(_) => None,
            })
            .unwrap();
        assert_eq!(record.backtrace, vec!["#0 foo ()", "#1 bar ()", "#2 main ()"]);
    }

    #[test]
    fn sanitizer_report_of_the_target_is_attached() {
        let script = CRASHING_SESSION.replace(
            "echo \"Program received",
            "echo \"process 31337 is executing new program\"\necho \"Program received",
        );
        let mut h = harness(&script);
        let reports = h._dir.path().join("asan");
        write_report(&reports, "asan.31337", "==31337==ERROR: AddressSanitizer: SEGV");
        h.manager = h
            .manager
            .with_sanitizer(Box::new(SanitizerLogDirectory::new(&reports, "asan")));

        let summary = h.manager.run_until_crash().unwrap();
        assert_eq!(summary.target_pid, Some(31337));
        let record = h
            .control
            .try_iter()
            .find_map(|m| match m {
                ControlMessage::Data(record) => Some(record),
                ControlMessage::Pid(_) => None,
            })
            .unwrap();
        assert_eq!(
            record.sanitizer_output.as_deref(),
            Some("==31337==ERROR: AddressSanitizer: SEGV")
        );
    }

    #[test]
    fn environment_reaches_the_debugger() {
        let script = format!("echo \"mark=$NETFUZZ_MARK\"\n{}", CLEAN_SESSION);
        let mut h = harness(&script);
        let mut env = BTreeMap::new();
        env.insert("NETFUZZ_MARK".to_string(), "present".to_string());
        h.manager = h.manager.with_environment(env);

        h.manager.run_until_crash().unwrap();
        let streamed: String = h.output.try_iter().collect();
        assert!(streamed.contains("mark=present"));
    }

    #[test]
    fn missing_debugger_fails_without_messages() {
        let (control_tx, control) = mpsc::channel();
        let (output_tx, _output) = mpsc::channel::<String>();
        let config = DebuggerConfig {
            path: PathBuf::from("/nonexistent/netfuzz/gdb"),
            ..DebuggerConfig::for_target("/bin/true", "{port}")
        };
        let mut manager = DebugServerManager::new(config, control_tx, output_tx, 1);

        let res = manager.run_until_crash();
        assert!(matches!(res, Err(DebugServerError::Spawn { .. })));
        assert_eq!(manager.state(), DebugState::Failed);
        assert!(control.try_iter().next().is_none());
    }

    #[test]
    fn closed_output_channel_does_not_abort_the_run() {
        let mut h = harness(CRASHING_SESSION);
        drop(h.output);
        let summary = h.manager.run_until_crash().unwrap();
        assert!(summary.crashed);
        assert_eq!(h.control.try_iter().count(), 2);
    }

    #[test]
    fn from_config_requires_a_debugger_section() {
        let (control_tx, _control) = mpsc::channel::<ControlMessage>();
        let (output_tx, _output) = mpsc::channel::<String>();
        let res = DebugServerManager::from_config(&NetfuzzConfig::default(), control_tx, output_tx, 1);
        assert!(matches!(res, Err(DebugServerError::NotConfigured)));
    }
}
