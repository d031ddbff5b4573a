use std::path::PathBuf;

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::{AuditError, AuditEvent, Result};

enum Command {
    Emit(AuditEvent),
    Flush(oneshot::Sender<()>),
}

/// Handle to the single audit writer task.
///
/// `emit` never blocks (the queue is unbounded); `flush` waits until every
/// previously emitted event has hit the file, which is how the supervisor
/// orders CONNECT before traffic and DISCONNECT after teardown. Dropping
/// the last handle drains the queue and stops the task.
#[derive(Clone)]
pub struct AuditSink {
    tx: mpsc::UnboundedSender<Command>,
}

impl AuditSink {
    /// Start the writer task over `dir`. Files are created on first write.
    pub fn spawn(dir: impl Into<PathBuf>) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(writer_task(dir.into(), rx));
        (Self { tx }, handle)
    }

    pub fn emit(&self, event: AuditEvent) -> Result<()> {
        self.tx
            .send(Command::Emit(event))
            .map_err(|_| AuditError::WriterGone)
    }

    /// Wait for everything emitted so far to be written out.
    pub async fn flush(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Command::Flush(ack))
            .map_err(|_| AuditError::WriterGone)?;
        done.await.map_err(|_| AuditError::WriterGone)
    }
}

struct DayFile {
    day: String,
    file: File,
}

async fn writer_task(dir: PathBuf, mut rx: mpsc::UnboundedReceiver<Command>) {
    let mut current: Option<DayFile> = None;

    while let Some(command) = rx.recv().await {
        match command {
            Command::Emit(event) => {
                if let Err(err) = append(&dir, &mut current, &event).await {
                    // Audit must never take the tunnel down with it.
                    error!(%err, "audit append failed, event dropped");
                }
            }
            Command::Flush(ack) => {
                if let Some(open) = current.as_mut() {
                    let _ = open.file.flush().await;
                }
                let _ = ack.send(());
            }
        }
    }

    if let Some(mut open) = current {
        let _ = open.file.flush().await;
    }
    debug!("audit writer stopped");
}

async fn append(dir: &PathBuf, current: &mut Option<DayFile>, event: &AuditEvent) -> Result<()> {
    let day = event.day();

    let rotate = match current {
        Some(open) => open.day != day,
        None => true,
    };
    if rotate {
        if let Some(open) = current.as_mut() {
            let _ = open.file.flush().await;
        }
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("audit-{day}.jsonl"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        debug!(path = %path.display(), "audit day file opened");
        *current = Some(DayFile { day, file });
    }

    let mut line = serde_json::to_string(event)?;
    line.push('\n');
    let open = current.as_mut().expect("day file was just opened");
    open.file.write_all(line.as_bytes()).await?;
    Ok(())
}
