//! Pipe-pane supervision: tails a session's raw pane bytes off a named pipe
//! that `tmux pipe-pane` writes into.
//!
//! The reader reopens the pipe whenever the writing end closes (EOF on a
//! FIFO read means "no writer currently attached", not "stream ended") so a
//! multiplexer-side pipe-pane restart doesn't require re-creating the
//! capture.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;

use crate::tmux::Tmux;

pub struct Capture {
    mux_name: String,
    fifo_path: PathBuf,
    tmux: Tmux,
    task: Option<JoinHandle<()>>,
    stopped: Arc<AtomicBool>,
}

impl std::fmt::Debug for Capture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capture").field("mux_name", &self.mux_name).field("fifo_path", &self.fifo_path).finish_non_exhaustive()
    }
}

impl Capture {
    pub async fn start(
        tmux: Tmux,
        mux_name: &str,
        fifo_dir: &Path,
        on_chunk: impl Fn(Vec<u8>) + Send + Sync + 'static,
    ) -> Result<Self> {
        let fifo_path = fifo_path_for(fifo_dir, mux_name);
        let _ = std::fs::remove_file(&fifo_path);

        let mkfifo_path = fifo_path.clone();
        tokio::task::spawn_blocking(move || std::process::Command::new("mkfifo").arg(&mkfifo_path).output())
            .await
            .context("mkfifo task panicked")?
            .context("failed to execute mkfifo")?;

        let pipe_result = tokio::task::spawn_blocking({
            let tmux = tmux.clone();
            let mux_name = mux_name.to_string();
            let fifo_path = fifo_path.clone();
            move || tmux.pipe_pane(&mux_name, Some(&fifo_path))
        })
        .await
        .context("tmux pipe-pane task panicked")?;
        if pipe_result.is_err() {
            let _ = std::fs::remove_file(&fifo_path);
            pipe_result.context("failed to start tmux pipe-pane")?;
        }

        let stopped = Arc::new(AtomicBool::new(false));
        let task = spawn_reader(fifo_path.clone(), Arc::clone(&stopped), on_chunk);

        Ok(Self { mux_name: mux_name.to_string(), fifo_path, tmux, task: Some(task), stopped })
    }

    pub async fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
        let _ = tokio::task::spawn_blocking({
            let tmux = self.tmux.clone();
            let mux_name = self.mux_name.clone();
            move || tmux.pipe_pane(&mux_name, None)
        })
        .await;
        let _ = std::fs::remove_file(&self.fifo_path);
    }
}

fn spawn_reader(
    fifo_path: PathBuf,
    stopped: Arc<AtomicBool>,
    on_chunk: impl Fn(Vec<u8>) + Send + Sync + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while !stopped.load(Ordering::SeqCst) {
            let mut reader = match tokio::fs::File::open(&fifo_path).await {
                Ok(file) => file,
                Err(e) => {
                    log::warn!("failed to open capture pipe {}: {e}", fifo_path.display());
                    return;
                }
            };

            let mut buf = [0u8; 4096];
            loop {
                if stopped.load(Ordering::SeqCst) {
                    return;
                }
                match reader.read(&mut buf).await {
                    // EOF on a FIFO means the writer went away, not that the
                    // stream is done; reopen and wait for the next writer.
                    Ok(0) => break,
                    Ok(n) => on_chunk(buf[..n].to_vec()),
                    Err(e) => {
                        log::warn!("capture pipe read error on {}: {e}", fifo_path.display());
                        return;
                    }
                }
            }
        }
    })
}

fn fifo_path_for(dir: &Path, mux_name: &str) -> PathBuf {
    dir.join(format!("{mux_name}.pipe"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_path_is_namespaced_by_session() {
        let path = fifo_path_for(Path::new("/tmp/rasd"), "ras-bash-abcd");
        assert_eq!(path, Path::new("/tmp/rasd/ras-bash-abcd.pipe"));
    }

    #[tokio::test]
    async fn reader_forwards_bytes_written_to_the_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let fifo_path = fifo_path_for(dir.path(), "test-session");
        let status = std::process::Command::new("mkfifo").arg(&fifo_path).status();
        if status.map(|s| !s.success()).unwrap_or(true) {
            // mkfifo unavailable in this environment; skip rather than fail.
            return;
        }

        let received = Arc::new(std::sync::Mutex::new(Vec::new()));
        let received_clone = Arc::clone(&received);
        let stopped = Arc::new(AtomicBool::new(false));
        let _task = spawn_reader(fifo_path.clone(), Arc::clone(&stopped), move |chunk| {
            received_clone.lock().unwrap().extend(chunk);
        });

        let write_path = fifo_path.clone();
        tokio::task::spawn_blocking(move || {
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new().write(true).open(&write_path).unwrap();
            file.write_all(b"hello from the pane").unwrap();
        })
        .await
        .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        stopped.store(true, Ordering::SeqCst);
        assert_eq!(&received.lock().unwrap()[..], b"hello from the pane");
    }
}
