use log::{debug, warn};
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio_util::sync::CancellationToken;

use super::{TransitionSink, WatchSource};
use crate::error::GpioError;

/// One report line from `inotifywait -c`: watched path, event names, file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyEvent {
    pub watched: String,
    pub events: Vec<String>,
    pub file: String,
}

impl NotifyEvent {
    pub fn parse(line: &str) -> Option<Self> {
        let fields = split_fields(line);
        let [watched, events, file]: [String; 3] = fields.try_into().ok()?;

        Some(Self {
            watched,
            events: events.split(',').map(str::to_owned).collect(),
            file,
        })
    }

    pub fn is_modify(&self) -> bool {
        self.events.iter().any(|e| e.eq_ignore_ascii_case("modify"))
    }
}

/// Splits a comma separated line, honouring double-quoted fields in which a
/// doubled quote stands for a literal one.
pub fn split_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                chars.next();
                current.push('"');
            }
            '"' if quoted => quoted = false,
            '"' if current.is_empty() => quoted = true,
            '"' if chars.peek() == Some(&'"') => {
                chars.next();
                current.push('"');
            }
            ',' if !quoted => fields.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    fields.push(current);
    fields
}

/// How long a freshly spawned tool must stay alive to count as started.
const STARTUP_GRACE: Duration = Duration::from_millis(50);

/// Starts `inotifywait` on the value file and returns the task that turns its
/// reports into transitions. A missing value file, or a tool that exits right
/// away, fails the start.
pub(super) async fn spawn(
    source: &WatchSource,
    value_path: PathBuf,
    sink: TransitionSink,
    cancel: CancellationToken,
) -> Result<impl Future<Output = ()> + Send + 'static, GpioError> {
    if !value_path.is_file() {
        return Err(GpioError::WatcherUnavailable(format!(
            "{} does not exist",
            value_path.display()
        )));
    }
    let baseline = source.baseline()?;

    let tool = &source.options.inotifywait_path;
    let mut child = Command::new(tool)
        .args(["-m", "-e", "modify", "-q", "-c"])
        .arg(&value_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| GpioError::WatcherUnavailable(format!("spawn {}: {e}", tool.display())))?;

    match tokio::time::timeout(STARTUP_GRACE, child.wait()).await {
        Err(_still_running) => {}
        Ok(Ok(status)) => {
            return Err(GpioError::WatcherUnavailable(format!(
                "{} exited at startup ({status})",
                tool.display()
            )));
        }
        Ok(Err(e)) => {
            return Err(GpioError::WatcherUnavailable(format!(
                "{} lost at startup: {e}",
                tool.display()
            )));
        }
    }

    let stdout = child.stdout.take().ok_or_else(|| {
        GpioError::WatcherUnavailable(format!("{} has no stdout", tool.display()))
    })?;

    Ok(pump(child, stdout, source.clone(), baseline, sink, cancel))
}

async fn pump(
    mut child: Child,
    stdout: ChildStdout,
    source: WatchSource,
    mut last: bool,
    sink: TransitionSink,
    cancel: CancellationToken,
) {
    let line = source.line;
    let mut reports = BufReader::new(stdout).lines();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = source.nudge.notified() => {}
            report = reports.next_line() => match report {
                Ok(Some(report)) => {
                    let Some(event) = NotifyEvent::parse(&report) else {
                        debug!("ignoring notify report {report:?}");
                        continue;
                    };
                    if !event.is_modify() {
                        continue;
                    }
                }
                // stream closure after a kill is the normal way out
                Ok(None) => {
                    if !cancel.is_cancelled() {
                        warn!("inotifywait for line {line} exited unexpectedly");
                    }
                    break;
                }
                Err(e) => {
                    warn!("reading inotifywait output for line {line}: {e}");
                    break;
                }
            },
        }

        match source.sample() {
            Ok(reading) if reading.value != last => {
                last = reading.value;
                sink(reading.value);
            }
            Ok(_) => {}
            Err(e) => {
                warn!("notify watcher for line {line} stopped: {e}");
                break;
            }
        }
    }

    if let Err(e) = child.kill().await {
        debug!("inotifywait for line {line} already gone: {e}");
    }
}
