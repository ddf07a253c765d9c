//! Streaming command runner.
//!
//! Spawns one external command with a hidden window. Its stdout and stderr
//! share a single pipe, so lines are read in the order the child wrote them.
//! Each line is decoded and filtered, and the survivors go to a [`LineSink`].
//! A non-zero exit is reported in the returned [`RunStatus`]; a failure to
//! start is turned into one diagnostic line.

use crate::engine::encoding::EncodingResolver;
use crate::engine::filter::{keep_line, DecodedLine, LineFilter};
use crate::engine::sink::LineSink;
use std::fmt;
use std::io::{BufRead, PipeReader};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandLine {
    /// Opaque OS shell line, e.g. `chkdsk C: /scan /perf`.
    Shell(String),
    Program { program: String, args: Vec<String> },
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandLine::Shell(line) => f.write_str(line),
            CommandLine::Program { program, args } => {
                f.write_str(program)?;
                for arg in args {
                    write!(f, " {arg}")?;
                }
                Ok(())
            }
        }
    }
}

/// An immutable command description owned by the operation that issues it.
#[derive(Clone)]
pub struct Command {
    line: CommandLine,
    description: String,
    filter: Option<Arc<dyn LineFilter>>,
    timeout: Option<Duration>,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("line", &self.line)
            .field("description", &self.description)
            .field("filtered", &self.filter.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Command {
    pub fn shell(line: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            line: CommandLine::Shell(line.into()),
            description: description.into(),
            filter: None,
            timeout: None,
        }
    }

    pub fn program<I, S>(program: impl Into<String>, args: I, description: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            line: CommandLine::Program {
                program: program.into(),
                args: args.into_iter().map(Into::into).collect(),
            },
            description: description.into(),
            filter: None,
            timeout: None,
        }
    }

    pub fn with_filter(mut self, filter: impl LineFilter + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn line(&self) -> &CommandLine {
        &self.line
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn filter(&self) -> Option<&dyn LineFilter> {
        self.filter.as_deref()
    }

    /// The process to spawn plus the read end of the one pipe its stdout and
    /// stderr share. The returned `Command` holds the write ends; drop it
    /// once spawned or the reader never sees EOF.
    fn to_process(&self) -> std::io::Result<(tokio::process::Command, PipeReader)> {
        let mut cmd = match &self.line {
            CommandLine::Shell(line) => shell_process(line),
            CommandLine::Program { program, args } => {
                let mut cmd = tokio::process::Command::new(program);
                cmd.args(args);
                cmd
            }
        };
        let (reader, writer) = std::io::pipe()?;
        cmd.stdin(Stdio::null())
            .stdout(writer.try_clone()?)
            .stderr(writer);
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);
        Ok((cmd, reader))
    }
}

/// Ask the console for UTF-8 output before running the line.
#[cfg(windows)]
fn shell_process(line: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("cmd");
    cmd.raw_arg(format!("/C \"chcp 65001 >NUL & {line}\""));
    cmd
}

#[cfg(not(windows))]
fn shell_process(line: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c").arg(line);
    cmd
}

/// Verdict of one runner invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunStatus {
    /// Exit code was zero.
    pub succeeded: bool,
    /// The process ran and reported an exit code.
    pub exit_reported: bool,
    pub exit_code: Option<i32>,
    pub lines_forwarded: usize,
}

impl RunStatus {
    fn not_run(lines_forwarded: usize) -> Self {
        Self {
            succeeded: false,
            exit_reported: false,
            exit_code: None,
            lines_forwarded,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum RunnerError {
    #[error("Failed to start {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to read output of {command}: {source}")]
    Read {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to wait for {command}: {source}")]
    Wait {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{command} timed out after {timeout:?}")]
    TimedOut { command: String, timeout: Duration },
}

#[derive(Debug, Clone, Default)]
pub struct StreamingProcessRunner {
    resolver: EncodingResolver,
}

impl StreamingProcessRunner {
    pub fn new(resolver: EncodingResolver) -> Self {
        Self { resolver }
    }

    /// Run `command` to completion, forwarding kept lines to `sink` in order.
    ///
    /// Never returns an error: spawn, read and timeout failures become one
    /// diagnostic line and `succeeded == false`.
    pub async fn run(&self, command: &Command, sink: &dyn LineSink) -> RunStatus {
        let spawned = command.to_process().and_then(|(mut process, output)| {
            let child = process.spawn()?;
            Ok((child, output))
        });
        let (mut child, output) = match spawned {
            Ok(spawned) => spawned,
            Err(source) => {
                let err = RunnerError::Spawn {
                    command: command.description().to_string(),
                    source,
                };
                warn!(command = %command.line(), error = %err, "spawn failed");
                sink.on_line(&err.to_string());
                return RunStatus::not_run(0);
            }
        };
        debug!(command = %command.line(), pid = ?child.id(), "spawned");

        // Counted outside the stream so a timeout still reports what got through.
        let forwarded = AtomicUsize::new(0);
        let streamed = self.stream(&mut child, output, command, sink, &forwarded);
        let finished = match command.timeout {
            Some(limit) => tokio::time::timeout(limit, streamed).await.ok(),
            None => Some(streamed.await),
        };
        let result = match finished {
            Some(result) => result,
            None => Err(RunnerError::TimedOut {
                command: command.description().to_string(),
                timeout: command.timeout.unwrap_or_default(),
            }),
        };

        match result {
            Ok(status) => {
                if status.succeeded {
                    info!(command = %command.line(), "exited with code 0");
                } else {
                    warn!(command = %command.line(), code = ?status.exit_code, "exited unsuccessfully");
                }
                status
            }
            Err(err) => {
                warn!(command = %command.line(), error = %err, "command aborted");
                if let Err(kill_err) = child.kill().await {
                    debug!(error = %kill_err, "kill after failure");
                }
                sink.on_line(&err.to_string());
                RunStatus::not_run(forwarded.load(Ordering::Relaxed))
            }
        }
    }

    async fn stream(
        &self,
        child: &mut Child,
        output: PipeReader,
        command: &Command,
        sink: &dyn LineSink,
        forwarded: &AtomicUsize,
    ) -> Result<RunStatus, RunnerError> {
        let read_err = |source| RunnerError::Read {
            command: command.description().to_string(),
            source,
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name("command-output".into())
            .spawn(move || read_lines(output, tx))
            .map_err(read_err)?;

        while let Some(raw) = rx.recv().await {
            let raw = raw.map_err(read_err)?;
            if self.forward(&raw, command.filter(), sink) {
                forwarded.fetch_add(1, Ordering::Relaxed);
            }
        }

        let status = child.wait().await.map_err(|source| RunnerError::Wait {
            command: command.description().to_string(),
            source,
        })?;
        let exit_code = status.code();
        Ok(RunStatus {
            succeeded: status.success(),
            exit_reported: exit_code.is_some(),
            exit_code,
            lines_forwarded: forwarded.load(Ordering::Relaxed),
        })
    }

    fn forward(&self, raw: &[u8], filter: Option<&dyn LineFilter>, sink: &dyn LineSink) -> bool {
        let rendered = rendered_segment(raw);
        let text = self.resolver.decode(rendered).replace('\0', "");
        let text = text.trim();
        if text.is_empty() {
            return false;
        }
        let line = DecodedLine {
            text: text.to_string(),
            raw: rendered.to_vec(),
        };
        if !keep_line(filter, &line) {
            return false;
        }
        sink.on_line(&line.text);
        true
    }
}

/// Blocking reader for the shared output pipe. Reads until EOF, which only
/// arrives after every writer closed its end, so a final line written just
/// before exit is never lost. Stops early once the receiver is gone.
fn read_lines(output: PipeReader, tx: mpsc::UnboundedSender<std::io::Result<Vec<u8>>>) {
    let mut reader = std::io::BufReader::new(output);
    loop {
        let mut buf = Vec::with_capacity(256);
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => return,
            Ok(_) => {
                if tx.send(Ok(buf)).is_err() {
                    return;
                }
            }
            Err(err) => {
                let _ = tx.send(Err(err));
                return;
            }
        }
    }
}

/// What a console would show for a line that rewrites itself with `\r`:
/// the last segment with visible content.
fn rendered_segment(raw: &[u8]) -> &[u8] {
    let mut end = raw.len();
    while end > 0 && matches!(raw[end - 1], b'\n' | b'\r' | 0) {
        end -= 1;
    }
    let line = &raw[..end];
    line.rsplit(|b| *b == b'\r')
        .find(|seg| seg.iter().any(|b| !matches!(b, 0 | b' ' | b'\t')))
        .unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::filter::{FnFilter, PhraseFilter};
    use crate::engine::sink::testing::RecordingSink;

    #[test]
    fn rendered_segment_keeps_last_carriage_rewrite() {
        assert_eq!(rendered_segment(b"10%\r20%\r30%\r\n"), b"30%");
        assert_eq!(rendered_segment(b"plain\n"), b"plain");
        assert_eq!(rendered_segment(b"done\r   \r\n"), b"done");
        assert_eq!(rendered_segment(b"\r\n"), b"");
    }

    #[test]
    fn command_line_display() {
        let cmd = Command::program("defrag", ["C:", "/O"], "Defrag");
        assert_eq!(cmd.line().to_string(), "defrag C: /O");
        assert_eq!(cmd.description(), "Defrag");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn forwards_lines_in_order_and_reports_success() {
        let runner = StreamingProcessRunner::default();
        let sink = RecordingSink::default();
        let cmd = Command::shell("printf 'one\\ntwo\\nthree\\n'", "printf");

        let status = runner.run(&cmd, &sink).await;

        assert!(status.succeeded);
        assert!(status.exit_reported);
        assert_eq!(status.exit_code, Some(0));
        assert_eq!(status.lines_forwarded, 3);
        assert_eq!(sink.texts(), vec!["one", "two", "three"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn filter_is_applied_without_reordering() {
        let runner = StreamingProcessRunner::default();
        let sink = RecordingSink::default();
        let cmd = Command::shell("printf 'keep 1\\ndrop\\nkeep 2\\n\\n   \\nkeep 3\\n'", "printf")
            .with_filter(FnFilter(|l: &str| l.starts_with("keep")));

        let status = runner.run(&cmd, &sink).await;

        assert!(status.succeeded);
        assert_eq!(sink.texts(), vec!["keep 1", "keep 2", "keep 3"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_reported_not_raised() {
        let runner = StreamingProcessRunner::default();
        let sink = RecordingSink::default();
        let cmd = Command::shell("echo warning found; exit 1", "scan");

        let status = runner.run(&cmd, &sink).await;

        assert!(!status.succeeded);
        assert!(status.exit_reported);
        assert_eq!(status.exit_code, Some(1));
        assert_eq!(sink.texts(), vec!["warning found"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_failure_becomes_one_diagnostic_line() {
        let runner = StreamingProcessRunner::default();
        let sink = RecordingSink::default();
        let cmd = Command::program("nonexistent_command_12345", Vec::<String>::new(), "Missing tool");

        let status = runner.run(&cmd, &sink).await;

        assert!(!status.succeeded);
        assert!(!status.exit_reported);
        let lines = sink.texts();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("Failed to start Missing tool"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn final_line_without_newline_is_kept() {
        let runner = StreamingProcessRunner::default();
        let sink = RecordingSink::default();
        let cmd = Command::shell("printf 'first\\nlast'", "printf");

        runner.run(&cmd, &sink).await;

        assert_eq!(sink.texts(), vec!["first", "last"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stderr_is_merged_for_shell_lines() {
        let runner = StreamingProcessRunner::default();
        let sink = RecordingSink::default();
        let cmd = Command::shell("echo out; echo err >&2; echo out2", "mixed");

        runner.run(&cmd, &sink).await;

        assert_eq!(sink.texts(), vec!["out", "err", "out2"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn program_output_keeps_write_order_across_streams() {
        let runner = StreamingProcessRunner::default();
        let sink = RecordingSink::default();
        let cmd = Command::program(
            "sh",
            ["-c", "echo first; sleep 0.1; echo second >&2; sleep 0.1; echo third"],
            "interleaved",
        );

        let status = runner.run(&cmd, &sink).await;

        assert!(status.succeeded);
        assert_eq!(status.lines_forwarded, 3);
        assert_eq!(sink.texts(), vec!["first", "second", "third"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn program_stderr_only_output_is_forwarded() {
        let runner = StreamingProcessRunner::default();
        let sink = RecordingSink::default();
        let cmd = Command::program("sh", ["-c", "echo denied >&2; exit 5"], "failing");

        let status = runner.run(&cmd, &sink).await;

        assert_eq!(status.exit_code, Some(5));
        assert_eq!(sink.texts(), vec!["denied"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn utf16_nul_padding_and_legacy_bytes_are_decoded() {
        let runner = StreamingProcessRunner::default();
        let sink = RecordingSink::default();
        let cmd = Command::shell("printf 'o\\000k\\000\\r\\000\\n\\000'; printf 'Unit\\340\\n'", "bytes");

        runner.run(&cmd, &sink).await;

        assert_eq!(sink.texts(), vec!["ok", "Unità"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn carriage_return_progress_collapses() {
        let runner = StreamingProcessRunner::default();
        let sink = RecordingSink::default();
        let cmd = Command::shell("printf 'Stage 1 10%%\\rStage 1 90%%\\rStage 1 done\\r\\n'", "progress");

        runner.run(&cmd, &sink).await;

        assert_eq!(sink.texts(), vec!["Stage 1 done"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_child_and_reports_failure() {
        let runner = StreamingProcessRunner::default();
        let sink = RecordingSink::default();
        let cmd = Command::shell("echo started; sleep 5", "slow")
            .with_timeout(Some(Duration::from_millis(300)));

        let status = runner.run(&cmd, &sink).await;

        assert!(!status.succeeded);
        assert!(!status.exit_reported);
        let lines = sink.texts();
        assert_eq!(lines.first().map(String::as_str), Some("started"));
        assert!(lines.last().unwrap().contains("timed out"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_keeps_count_of_lines_already_forwarded() {
        let runner = StreamingProcessRunner::default();
        let sink = RecordingSink::default();
        let cmd = Command::shell("echo a; echo b; sleep 5", "slow")
            .with_timeout(Some(Duration::from_millis(300)));

        let status = runner.run(&cmd, &sink).await;

        assert!(!status.succeeded);
        assert_eq!(status.lines_forwarded, 2);
        let lines = sink.texts();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "a");
        assert_eq!(lines[1], "b");
        assert!(lines[2].contains("slow timed out after"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn defrag_filter_applied_to_real_output() {
        let runner = StreamingProcessRunner::default();
        let sink = RecordingSink::default();
        let cmd = Command::shell(
            "printf 'Invoking retrim on (C:)...\\n\\tRetrim:  100%% complete.\\n        Volume size = 100 GB\\nThe operation completed successfully.\\n'",
            "defrag",
        )
        .with_filter(PhraseFilter::defrag());

        runner.run(&cmd, &sink).await;

        assert_eq!(
            sink.texts(),
            vec!["Retrim:  100% complete.", "The operation completed successfully."]
        );
    }
}
