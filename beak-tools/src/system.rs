//! The process invocation capability.
//!
//! Replication drivers shell out to an external copy tool. They do so
//! through the [`System`] trait so tests can substitute a recording
//! fake, and so output capture and exit status policy live in one place.

use std::io::{BufRead, BufReader, Read};
use std::process::{Command, Stdio};

#[derive(thiserror::Error, Debug)]
pub enum SystemError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("external tool exited with status {0}")]
    ExternalToolFailed(i32),
    #[error("external tool terminated by signal")]
    Terminated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureMode {
    Stdout,
    Both,
}

/// Called once per output line, without the trailing newline.
pub type LineCallback<'a> = dyn FnMut(&str) + 'a;

pub trait System: Send + Sync {
    /// Run `program` with `args`, appending captured output to `output`
    /// and feeding each line to `line_cb` as it arrives. A nonzero exit
    /// maps to [`SystemError::ExternalToolFailed`].
    fn invoke(
        &self,
        program: &str,
        args: &[&str],
        output: &mut Vec<u8>,
        capture: CaptureMode,
        line_cb: Option<&mut LineCallback>,
    ) -> Result<(), SystemError>;
}

/// Runs programs as child processes of this one.
pub struct StdSystem;

fn feed_line(output: &mut Vec<u8>, line_cb: &mut Option<&mut LineCallback>, line: &[u8]) {
    output.extend_from_slice(line);
    if let Some(cb) = line_cb {
        let text = String::from_utf8_lossy(line);
        cb(text.trim_end_matches('\n'));
    }
}

impl System for StdSystem {
    fn invoke(
        &self,
        program: &str,
        args: &[&str],
        output: &mut Vec<u8>,
        capture: CaptureMode,
        mut line_cb: Option<&mut LineCallback>,
    ) -> Result<(), SystemError> {
        log::debug!("invoking {} {:?}", program, args);
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(if capture == CaptureMode::Both {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .spawn()?;

        // Drain stderr on a helper thread so neither pipe can stall the
        // child when it fills its buffer.
        let stderr_thread = child.stderr.take().map(|mut err| {
            std::thread::spawn(move || {
                let mut collected = Vec::new();
                let _ = err.read_to_end(&mut collected);
                collected
            })
        });

        if let Some(stdout) = child.stdout.take() {
            let mut reader = BufReader::new(stdout);
            let mut line = Vec::new();
            loop {
                line.clear();
                if reader.read_until(b'\n', &mut line)? == 0 {
                    break;
                }
                feed_line(output, &mut line_cb, &line);
            }
        }

        let status = child.wait()?;

        if let Some(handle) = stderr_thread {
            let collected = handle.join().unwrap_or_default();
            for line in collected.split_inclusive(|&b| b == b'\n') {
                feed_line(output, &mut line_cb, line);
            }
        }

        match status.code() {
            Some(0) => Ok(()),
            Some(code) => Err(SystemError::ExternalToolFailed(code)),
            None => Err(SystemError::Terminated),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn captures_stdout_lines() {
        let mut output = Vec::new();
        let mut lines = Vec::new();
        let mut cb = |line: &str| lines.push(line.to_string());
        StdSystem
            .invoke(
                "sh",
                &["-c", "echo alpha; echo beta"],
                &mut output,
                CaptureMode::Stdout,
                Some(&mut cb),
            )
            .unwrap();
        assert_eq!(output, b"alpha\nbeta\n".to_vec());
        assert_eq!(lines, vec!["alpha", "beta"]);
    }

    #[test]
    fn nonzero_exit_is_reported() {
        let mut output = Vec::new();
        let err = StdSystem
            .invoke("sh", &["-c", "exit 3"], &mut output, CaptureMode::Stdout, None)
            .unwrap_err();
        match err {
            SystemError::ExternalToolFailed(code) => assert_eq!(code, 3),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn stderr_is_captured_in_both_mode() {
        let mut output = Vec::new();
        StdSystem
            .invoke(
                "sh",
                &["-c", "echo out; echo err 1>&2"],
                &mut output,
                CaptureMode::Both,
                None,
            )
            .unwrap();
        let text = String::from_utf8(output).unwrap();
        assert!(text.contains("out\n"));
        assert!(text.contains("err\n"));
    }
}
