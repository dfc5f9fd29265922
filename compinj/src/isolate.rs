//! Sweeps that run every trial in a child process.
//!
//! A fatal signal or a hang inside an engine takes down only the child; the
//! parent records it as [`TrialStatus::Crashed`] or [`TrialStatus::Timeout`]
//! and moves on to the next bit. The child is whatever `command` builds for a
//! `(byte, bit)` pair. It must print the finished [`TrialRecord`] as a single
//! JSON line on stdout, as `compinj trial` does.

use std::{
    io::{self, Read},
    ops::Range,
    process::{Child, Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};

use crate::{
    error::HarnessError,
    harness::Harness,
    sweep::{drive, plan, TrialRecord, TrialStatus},
    tensor::Tensor,
};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct IsolatedSweep<F> {
    harness: Harness,
    command: F,
    timeout: Option<Duration>,
}

impl<F> IsolatedSweep<F>
where
    F: Fn(usize, u8) -> Command + Sync,
{
    /// `harness` compresses once in the parent to size the byte range and
    /// fill rows for children that never report back.
    pub fn new(harness: Harness, command: F) -> IsolatedSweep<F> {
        IsolatedSweep {
            harness,
            command,
            timeout: None,
        }
    }

    /// Kills any trial still running after `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> IsolatedSweep<F> {
        self.timeout = Some(timeout);
        self
    }

    pub fn run(&mut self, original: &Tensor, bytes: Range<usize>) -> Result<Vec<TrialRecord>, HarnessError> {
        let mut records = Vec::new();
        self.run_with(original, bytes, |record| {
            records.push(record);
            Ok::<(), HarnessError>(())
        })?;
        Ok(records)
    }

    /// Hands each row to `sink` as soon as its batch finishes. Returns the
    /// number of rows emitted.
    pub fn run_with<S, E>(&mut self, original: &Tensor, bytes: Range<usize>, sink: S) -> Result<usize, E>
    where
        S: FnMut(TrialRecord) -> Result<(), E>,
        E: From<HarnessError>,
    {
        let (compressed, _) = self.harness.compress(original)?;
        let ratio = self.harness.engine().metrics().compression_ratio();
        let sites = plan(bytes, compressed.len());

        let this = &*self;
        drive(
            &sites,
            |byte, bit| {
                let pending = TrialRecord::pending(original, &this.harness, ratio, byte, bit);
                this.trial(pending)
            },
            sink,
        )
    }

    fn trial(&self, mut record: TrialRecord) -> Result<TrialRecord, HarnessError> {
        let (byte, bit) = (record.byte_location, record.flip_location);
        let mut child = (self.command)(byte, bit)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(HarnessError::Child)?;

        // drain stdout concurrently so a chatty child cannot block on a full pipe
        let mut stdout = child.stdout.take();
        let reader = thread::spawn(move || {
            let mut text = String::new();
            if let Some(out) = stdout.as_mut() {
                let _ = out.read_to_string(&mut text);
            }
            text
        });

        let status = wait_with_timeout(&mut child, self.timeout).map_err(HarnessError::Child)?;

        // a killed child may leave descendants holding the pipe, so the reader is detached
        let Some(status) = status else {
            let limit = self.timeout.unwrap_or_default();
            record.status = TrialStatus::Timeout;
            record.decompression_time = limit.as_secs_f64();
            record.detail = format!("killed after {:.3}s", limit.as_secs_f64());
            tracing::warn!(byte, bit, "trial timed out");
            return Ok(record);
        };

        let stdout = reader.join().unwrap_or_default();
        if status.success() {
            if let Some(reported) = parse_record(&stdout) {
                return Ok(reported);
            }
        }
        if let Some(sig) = fatal_signal(&status) {
            record.status = TrialStatus::Crashed;
            record.detail = format!("signal {sig}");
            tracing::warn!(byte, bit, sig, "trial crashed");
        } else {
            record.status = TrialStatus::EngineError;
            record.detail = format!("trial exited with {status} without a record");
        }
        Ok(record)
    }
}

/// Polls `child` until it exits, killing it once `timeout` passes.
/// `Ok(None)` means the child was killed.
fn wait_with_timeout(child: &mut Child, timeout: Option<Duration>) -> io::Result<Option<ExitStatus>> {
    let Some(timeout) = timeout else {
        return child.wait().map(Some);
    };
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if start.elapsed() >= timeout {
            let _ = child.kill();
            child.wait()?;
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// The last stdout line that parses as a row.
fn parse_record(stdout: &str) -> Option<TrialRecord> {
    stdout
        .lines()
        .rev()
        .find_map(|line| serde_json::from_str(line.trim()).ok())
}

/// Signal that ended the child, either raw or forwarded as the exit status
/// by [`crate::crash`].
#[cfg(unix)]
fn fatal_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;

    status
        .signal()
        .or_else(|| status.code().filter(|&code| code == libc::SIGSEGV || code == libc::SIGBUS))
}

#[cfg(not(unix))]
fn fatal_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::mode::{CompressorKind, ErrorBound};

    fn tensor() -> Tensor {
        Tensor::from_vec((0..16).map(|i| i as f32).collect()).unwrap()
    }

    fn harness() -> Harness {
        Harness::new(CompressorKind::Zfp, ErrorBound::Precision(8)).unwrap()
    }

    fn sh(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        command
    }

    #[test]
    fn signalled_children_are_crashes() {
        let mut sweep = IsolatedSweep::new(harness(), |_, _| sh("kill -SEGV $$"));
        let records = sweep.run(&tensor(), 0..1).unwrap();
        assert_eq!(records.len(), 8);
        for record in &records {
            assert_eq!(record.status, TrialStatus::Crashed);
            assert_eq!(record.detail, format!("signal {}", libc::SIGSEGV));
            assert_eq!(record.incorrect, -1);
        }
    }

    #[test]
    fn forwarded_signal_exit_is_a_crash() {
        let mut sweep = IsolatedSweep::new(harness(), |_, _| sh(&format!("exit {}", libc::SIGBUS)));
        let records = sweep.run(&tensor(), 0..1).unwrap();
        assert!(records.iter().all(|r| r.status == TrialStatus::Crashed));
    }

    #[test]
    fn hung_children_time_out() {
        let mut sweep = IsolatedSweep::new(harness(), |_, _| sh("exec sleep 30")).timeout(Duration::from_millis(200));
        let start = Instant::now();
        let records = sweep.run(&tensor(), 0..1).unwrap();
        assert!(start.elapsed() < Duration::from_secs(20));
        assert!(records.iter().all(|r| r.status == TrialStatus::Timeout));
        assert!(records.iter().all(|r| r.decompression_time == 0.2));
    }

    #[test]
    fn silent_failures_are_engine_errors() {
        let mut sweep = IsolatedSweep::new(harness(), |_, _| sh("exit 5"));
        let records = sweep.run(&tensor(), 0..1).unwrap();
        assert!(records.iter().all(|r| r.status == TrialStatus::EngineError));
    }

    #[test]
    fn reported_rows_are_taken_verbatim() {
        let mut sweep = IsolatedSweep::new(harness(), |byte, bit| {
            sh(&format!(
                "echo noise; echo '{{\"DataSize\":64,\"CompressionRatio\":2.0,\"ErrorInfo\":\"x\",\
                 \"ByteLocation\":{byte},\"FlipLocation\":{bit},\"DecompressionTime\":0.5,\
                 \"Incorrect\":3,\"MaxDifference\":1.5,\"RMSE\":0.25,\"PSNR\":40.0,\
                 \"Status\":\"Completed\",\"Detail\":\"\"}}'"
            ))
        });
        let records = sweep.run(&tensor(), 2..3).unwrap();
        assert_eq!(records.len(), 8);
        for (bit, record) in records.iter().enumerate() {
            assert_eq!(record.byte_location, 2);
            assert_eq!(record.flip_location as usize, bit);
            assert_eq!(record.incorrect, 3);
            assert_eq!(record.status, TrialStatus::Completed);
        }
    }

    #[test]
    fn unstartable_trial_is_an_error() {
        let mut sweep = IsolatedSweep::new(harness(), |_, _| Command::new("/nonexistent/compinj-trial"));
        let err = sweep.run(&tensor(), 0..1).unwrap_err();
        assert!(matches!(err, HarnessError::Child(_)));
        assert_eq!(err.exit_code(), 2);
    }
}
