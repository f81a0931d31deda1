use std::io::{self, Read};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use tokio_util::sync::CancellationToken;
use wait_timeout::ChildExt;

use super::output::Text;

/// How often a running child is checked for cancellation
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Bytes kept per captured stream; the rest is read and discarded
pub const CAPTURE_LIMIT: usize = 4 * 1024 * 1024;

/// One external program a driver launches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl DriverCommand {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

/// Runs driver commands inside a request directory
#[derive(Debug, Clone)]
pub struct Driver {
    env: Vec<(String, String)>,
    timeout: Duration,
}

impl Driver {
    pub fn new(timeout: Duration) -> Self {
        Self {
            env: vec![
                ("PYTHONHASHSEED".to_string(), "1".to_string()),
                ("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string()),
            ],
            timeout,
        }
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    /// Run `command` in `dir` and capture its output
    ///
    /// A child outliving the driver timeout is killed and reported through
    /// [`ProcessOutput::timed_out`]. Cancelling `cancel` kills the child and
    /// fails the call.
    pub fn execute(
        &self,
        command: &DriverCommand,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput> {
        let program = &command.program;
        log::debug!("Starting {program} {:?}", command.args);

        let mut process = Command::new(program);
        process
            .args(&command.args)
            .current_dir(dir)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            process.process_group(0);
        }
        let mut child = process
            .spawn()
            .with_context(|| format!("Failed to start {program}"))?;

        let stdout = spawn_pipe_reader(child.stdout.take());
        let stderr = spawn_pipe_reader(child.stderr.take());

        let started = Instant::now();
        let mut timed_out = false;
        let mut cancelled = false;
        loop {
            if let Some(status) = child
                .wait_timeout(POLL_INTERVAL)
                .with_context(|| format!("Failed to wait on {program}"))?
            {
                log::debug!("{program} exited with {status}");
                // leftover background processes would keep the pipes open
                kill_group(&child);
                break;
            }
            if cancel.is_cancelled() {
                cancelled = true;
            } else if started.elapsed() >= self.timeout {
                timed_out = true;
            } else {
                continue;
            }

            terminate(&mut child).with_context(|| format!("Failed to terminate {program}"))?;
            child
                .wait()
                .with_context(|| format!("Failed to reap {program}"))?;
            break;
        }

        let stdout = collect_pipe(stdout, "stdout", program)?;
        let stderr = collect_pipe(stderr, "stderr", program)?;

        if cancelled {
            bail!("{program} was cancelled");
        }
        if timed_out {
            log::warn!("{program} killed after {:?}", self.timeout);
        }
        Ok(ProcessOutput {
            stdout,
            stderr,
            timed_out,
        })
    }

    /// Run a plain or test-runner pass: `{error: stderr, text: stdout}`
    pub fn run_text(
        &self,
        command: &DriverCommand,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Text> {
        let output = self.execute(command, dir, cancel)?;
        if output.timed_out {
            return Ok(self.timeout_text(command));
        }
        Ok(Text::new(output.stderr, output.stdout))
    }

    pub fn timeout_text(&self, command: &DriverCommand) -> Text {
        Text::new(
            format!("{}: Timeout({})", command.program, self.timeout.as_secs_f64()),
            "",
        )
    }
}

/// Kill whatever is left in the process group of a child that already exited
fn kill_group(child: &Child) {
    #[cfg(unix)]
    {
        let pgid = child.id() as libc::pid_t;
        // SAFETY: the group id stays reserved while any member is alive
        unsafe { libc::kill(-pgid, libc::SIGKILL) };
    }
    #[cfg(not(unix))]
    let _ = child;
}

/// Kill the child together with everything it started
fn terminate(child: &mut Child) -> io::Result<()> {
    #[cfg(unix)]
    {
        let pgid = child.id() as libc::pid_t;
        // SAFETY: signalling the process group created for this child at spawn
        if unsafe { libc::kill(-pgid, libc::SIGKILL) } == 0 {
            return Ok(());
        }
    }
    child.kill()
}

fn spawn_pipe_reader<R>(pipe: Option<R>) -> Option<thread::JoinHandle<io::Result<Vec<u8>>>>
where
    R: Read + Send + 'static,
{
    pipe.map(|stream| thread::spawn(move || read_capped(stream, CAPTURE_LIMIT)))
}

/// Read `stream` to the end, keeping at most `limit` bytes plus a truncation note
fn read_capped<R: Read>(mut stream: R, limit: usize) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    (&mut stream).take(limit as u64).read_to_end(&mut buf)?;

    let dropped = io::copy(&mut stream, &mut io::sink())?;
    if dropped > 0 {
        buf.extend_from_slice(
            format!("\n[output truncated: {dropped} more bytes after {limit}]\n").as_bytes(),
        );
    }
    Ok(buf)
}

fn collect_pipe(
    handle: Option<thread::JoinHandle<io::Result<Vec<u8>>>>,
    stream: &str,
    program: &str,
) -> Result<String> {
    let Some(handle) = handle else {
        return Ok(String::new());
    };
    let bytes = handle
        .join()
        .map_err(|_| anyhow!("Failed to join {stream} reader of {program}"))?
        .with_context(|| format!("Failed to read {stream} of {program}"))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sh(script: &str) -> DriverCommand {
        DriverCommand::new("sh", ["-c", script])
    }

    #[test]
    fn test_captures_both_streams() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Driver::new(Duration::from_secs(10)).with_env("DELIMITER", "DATA_X");
        let text = driver
            .run_text(
                &sh("echo \"$DELIMITER $PYTHONHASHSEED\"; echo oops >&2"),
                dir.path(),
                &CancellationToken::new(),
            )
            .unwrap();
        assert_eq!(text, Text::new("oops\n", "DATA_X 1\n"));
    }

    #[test]
    fn test_timeout_kills_child() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Driver::new(Duration::from_millis(200));
        let started = Instant::now();
        let text = driver
            .run_text(&sh("sleep 5"), dir.path(), &CancellationToken::new())
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(text, Text::new("sh: Timeout(0.2)", ""));
    }

    #[test]
    fn test_cancel_kills_child() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Driver::new(Duration::from_secs(30));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });

        let started = Instant::now();
        assert!(driver.execute(&sh("sleep 5"), dir.path(), &cancel).is_err());
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_background_child_does_not_hold_output() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Driver::new(Duration::from_secs(30));
        let started = Instant::now();
        let text = driver
            .run_text(&sh("sleep 10 & echo done"), dir.path(), &CancellationToken::new())
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(text, Text::new("", "done\n"));
    }

    #[test]
    fn test_read_capped() {
        let kept = read_capped(io::Cursor::new(b"abcdefgh".to_vec()), 3).unwrap();
        assert_eq!(
            String::from_utf8(kept).unwrap(),
            "abc\n[output truncated: 5 more bytes after 3]\n"
        );

        let kept = read_capped(io::Cursor::new(b"abc".to_vec()), 3).unwrap();
        assert_eq!(kept, b"abc".to_vec());
    }

    #[test]
    fn test_large_output_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Driver::new(Duration::from_secs(30));
        let output = driver
            .execute(
                &sh("head -c 5000000 /dev/zero | tr '\\0' x"),
                dir.path(),
                &CancellationToken::new(),
            )
            .unwrap();

        assert!(output.stdout.starts_with("xxx"));
        assert!(output.stdout.ends_with("more bytes after 4194304]\n"));
        assert!(output.stdout.len() < CAPTURE_LIMIT + 100);
    }

    #[test]
    fn test_missing_program() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Driver::new(Duration::from_secs(1));
        let command = DriverCommand::new("definitely-not-a-real-program", Vec::<String>::new());
        assert!(
            driver
                .execute(&command, dir.path(), &CancellationToken::new())
                .is_err()
        );
    }
}
