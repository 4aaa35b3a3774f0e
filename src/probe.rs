//! Session and activity probing for destructive-operation guards.
//!
//! Four independent read-only probes decide whether the VM is currently in
//! use: the terminal-multiplexer session list, logged-in users, a
//! per-container process scan for a known interactive-assistant process,
//! and a hold marker holding a future timestamp set by an explicit extend
//! action. Signals combine with OR semantics. A probe that cannot run
//! yields no signal rather than failing the guard, but the degradation is
//! surfaced so the operator knows the guard was weakened.

use std::fmt;

use tracing::warn;

use crate::remote::keys::EphemeralKey;
use crate::remote::{RemoteError, RemoteExecutor, RemoteOutput, RemoteTarget};
use crate::runner::CommandRunner;

/// Remote file holding a future epoch timestamp written by `ostriv extend`.
pub const HOLD_MARKER_PATH: &str = "/var/lib/ostriv/hold-until";

const MULTIPLEXER_PROBE: &str = "tmux list-sessions 2>/dev/null";
const USERS_PROBE: &str = "who";

// Probes exit with this code when the subsystem they inspect is absent, so
// absence can be told apart from a clean negative.
const PROBE_UNAVAILABLE_EXIT: i32 = 9;

/// Source of read-only remote command output for probing.
pub trait RemoteReader {
    /// Runs a read-only command on the VM.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError`] when the command cannot be executed.
    fn read(&self, command: &str) -> Result<RemoteOutput, RemoteError>;
}

/// Adapter running probes through a [`RemoteExecutor`] with an issued
/// credential.
#[derive(Debug)]
pub struct ExecutorReader<'a, R: CommandRunner> {
    executor: &'a RemoteExecutor<R>,
    target: RemoteTarget,
    credential: &'a EphemeralKey,
}

impl<'a, R: CommandRunner> ExecutorReader<'a, R> {
    /// Creates a reader for the given target and credential.
    #[must_use]
    pub const fn new(
        executor: &'a RemoteExecutor<R>,
        target: RemoteTarget,
        credential: &'a EphemeralKey,
    ) -> Self {
        Self {
            executor,
            target,
            credential,
        }
    }
}

impl<R: CommandRunner> RemoteReader for ExecutorReader<'_, R> {
    fn read(&self, command: &str) -> Result<RemoteOutput, RemoteError> {
        self.executor.execute(&self.target, self.credential, command)
    }
}

/// A single positive activity signal.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ActivitySignal {
    /// One or more terminal-multiplexer sessions exist.
    MultiplexerSessions {
        /// Number of sessions reported.
        count: usize,
    },
    /// Users are logged in.
    LoggedInUsers {
        /// Number of login entries reported.
        count: usize,
    },
    /// The interactive-assistant process is running inside a container.
    AssistantProcess {
        /// Process name that matched.
        process: String,
    },
    /// An explicit hold marker has not yet expired.
    HoldActive {
        /// Epoch second until which the hold applies.
        until_epoch: u64,
    },
}

impl fmt::Display for ActivitySignal {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MultiplexerSessions { count } => {
                write!(formatter, "{count} tmux session(s) open")
            }
            Self::LoggedInUsers { count } => write!(formatter, "{count} user(s) logged in"),
            Self::AssistantProcess { process } => {
                write!(formatter, "assistant process '{process}' running")
            }
            Self::HoldActive { until_epoch } => {
                write!(formatter, "hold marker active until epoch {until_epoch}")
            }
        }
    }
}

/// Renders signals for inclusion in error messages.
#[must_use]
pub fn format_signals(signals: &[ActivitySignal]) -> String {
    let rendered: Vec<String> = signals.iter().map(ToString::to_string).collect();
    rendered.join(", ")
}

/// Combined outcome of all activity probes.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ActivityReport {
    /// Positive signals observed.
    pub signals: Vec<ActivitySignal>,
    /// Probes that could not run, with the reason each was skipped.
    pub degraded: Vec<String>,
}

impl ActivityReport {
    /// Returns `true` when any probe reported activity.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.signals.is_empty()
    }

    /// Builds a fully degraded report, used when the VM cannot be probed at
    /// all (for example, it has no public address).
    #[must_use]
    pub fn fully_degraded(reason: impl Into<String>) -> Self {
        Self {
            signals: Vec::new(),
            degraded: vec![reason.into()],
        }
    }
}

/// Runs the activity probes and combines their signals.
#[derive(Clone, Debug)]
pub struct ActivityProber {
    assistant_process: String,
}

impl ActivityProber {
    /// Creates a prober that searches container processes for
    /// `assistant_process`.
    #[must_use]
    pub fn new(assistant_process: impl Into<String>) -> Self {
        Self {
            assistant_process: assistant_process.into(),
        }
    }

    /// Runs all four probes. `now_epoch` is the local wall clock in epoch
    /// seconds, compared against the hold marker.
    ///
    /// Probe failures degrade to "no signal" with a warning; this method
    /// itself never fails.
    pub fn assess(&self, reader: &impl RemoteReader, now_epoch: u64) -> ActivityReport {
        let mut report = ActivityReport::default();

        let probes: [(&str, ProbeResult); 4] = [
            ("multiplexer sessions", multiplexer_probe(reader)),
            ("logged-in users", users_probe(reader)),
            (
                "container processes",
                container_probe(reader, &self.assistant_process),
            ),
            ("hold marker", hold_probe(reader, now_epoch)),
        ];

        for (name, outcome) in probes {
            match outcome {
                Ok(Some(signal)) => report.signals.push(signal),
                Ok(None) => {}
                Err(reason) => {
                    warn!(probe = name, %reason, "activity probe degraded; guard weakened");
                    report.degraded.push(format!("{name}: {reason}"));
                }
            }
        }

        report
    }
}

type ProbeResult = Result<Option<ActivitySignal>, String>;

fn multiplexer_probe(reader: &impl RemoteReader) -> ProbeResult {
    let output = reader.read(MULTIPLEXER_PROBE).map_err(|err| err.to_string())?;
    match output.exit_code {
        0 => {
            let count = non_empty_lines(&output.stdout);
            Ok((count > 0).then_some(ActivitySignal::MultiplexerSessions { count }))
        }
        // tmux exits 1 when no server is running.
        1 => Ok(None),
        code => Err(format!("probe exited with status {code}")),
    }
}

fn users_probe(reader: &impl RemoteReader) -> ProbeResult {
    let output = reader.read(USERS_PROBE).map_err(|err| err.to_string())?;
    match output.exit_code {
        0 => {
            let count = non_empty_lines(&output.stdout);
            Ok((count > 0).then_some(ActivitySignal::LoggedInUsers { count }))
        }
        // `who` exits 0 even with nobody logged in; any other status is a
        // broken probe, not a clean negative.
        code => Err(format!("probe exited with status {code}")),
    }
}

fn container_probe(reader: &impl RemoteReader, process: &str) -> ProbeResult {
    let command = format!(
        "if command -v docker >/dev/null 2>&1; then \
         for c in $(docker ps -q); do docker top \"$c\" -eo comm=; done; \
         else exit {PROBE_UNAVAILABLE_EXIT}; fi"
    );
    let output = reader.read(&command).map_err(|err| err.to_string())?;
    match output.exit_code {
        0 => {
            let matched = output
                .stdout
                .lines()
                .map(str::trim)
                .any(|line| line == process);
            Ok(matched.then(|| ActivitySignal::AssistantProcess {
                process: process.to_owned(),
            }))
        }
        PROBE_UNAVAILABLE_EXIT => Err(String::from("container runtime unavailable")),
        code => Err(format!("probe exited with status {code}")),
    }
}

fn hold_probe(reader: &impl RemoteReader, now_epoch: u64) -> ProbeResult {
    let command = format!("cat {HOLD_MARKER_PATH}");
    let output = reader.read(&command).map_err(|err| err.to_string())?;
    match output.exit_code {
        0 => {
            let Ok(until_epoch) = output.stdout.trim().parse::<u64>() else {
                return Err(String::from("hold marker holds a non-numeric timestamp"));
            };
            Ok((until_epoch > now_epoch).then_some(ActivitySignal::HoldActive { until_epoch }))
        }
        // Absent marker file: a clean negative.
        1 => Ok(None),
        code => Err(format!("probe exited with status {code}")),
    }
}

fn non_empty_lines(stdout: &str) -> usize {
    stdout.lines().filter(|line| !line.trim().is_empty()).count()
}
