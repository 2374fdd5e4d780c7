//! Child output relay.
//!
//! Each child's stdout and stderr are re-emitted line by line with a
//! role-tagged prefix (`[api]`, `[web]`) so operators can attribute output to
//! the right process. A bounded ring buffer keeps the most recent lines for
//! crash reporting; oldest lines are evicted when the buffer is full.

use super::Role;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

/// Lines of recent child output retained for crash reports.
const MAX_BUFFERED_LINES: usize = 200;

pub struct LogRelay {
    role: Role,
    /// Ring buffer of recent lines (stderr lines carry an extra marker).
    lines: Arc<Mutex<VecDeque<String>>>,
    /// Relay task handles for cleanup.
    /// Uses std::sync::Mutex to allow synchronous access outside async contexts.
    tasks: Arc<StdMutex<Vec<JoinHandle<()>>>>,
    /// Shutdown signal for the relay tasks.
    shutdown: Arc<Notify>,
}

impl LogRelay {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            lines: Arc::new(Mutex::new(VecDeque::new())),
            tasks: Arc::new(StdMutex::new(Vec::new())),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Spawn background tasks relaying the child's stdout and stderr.
    pub fn spawn_relay_tasks(&self, stdout: Option<ChildStdout>, stderr: Option<ChildStderr>) {
        if let Some(stdout) = stdout {
            let handle = self.spawn_reader(stdout, false);
            self.tasks.lock().unwrap().push(handle);
        }
        if let Some(stderr) = stderr {
            let handle = self.spawn_reader(stderr, true);
            self.tasks.lock().unwrap().push(handle);
        }
    }

    fn spawn_reader<R>(&self, reader: R, is_stderr: bool) -> JoinHandle<()>
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let role = self.role;
        let lines = Arc::clone(&self.lines);
        let shutdown = Arc::clone(&self.shutdown);

        tokio::spawn(async move {
            let reader = BufReader::new(reader);
            let mut line_stream = reader.lines();
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.notified() => break,
                    line = line_stream.next_line() => {
                        match line {
                            Ok(Some(line)) => {
                                if is_stderr {
                                    eprintln!("[{}] {}", role, line);
                                } else {
                                    println!("[{}] {}", role, line);
                                }

                                let mut buffer = lines.lock().await;
                                buffer.push_back(if is_stderr {
                                    format!("[stderr] {}", line)
                                } else {
                                    line
                                });
                                if buffer.len() > MAX_BUFFERED_LINES {
                                    buffer.pop_front();
                                }
                            }
                            // EOF or read error: the pipe is gone, we're done.
                            _ => break,
                        }
                    }
                }
            }
        })
    }

    /// Most recent `tail` buffered lines, oldest first.
    pub async fn tail(&self, tail: usize) -> Vec<String> {
        let buffer = self.lines.lock().await;
        buffer
            .iter()
            .skip(buffer.len().saturating_sub(tail))
            .cloned()
            .collect()
    }

    /// Stop the relay tasks and wait for them to drain.
    pub async fn shutdown(&self) {
        self.shutdown.notify_waiters();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap());
        for handle in handles {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(1), handle).await;
        }
    }
}
