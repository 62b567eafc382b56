//! Per-session append-only transcript log, rotated into monthly shards:
//! `<LOG_DIR>/sessions/<yyyy>/<mm>/<sessionId>.log`, one `[<stream>]
//! <content>` line per write. Adapted from the daemon's single-file
//! `EventLog`, generalized to pick its path lazily from wall-clock time
//! instead of a fixed path so long-lived sessions roll over at month
//! boundaries.

use chrono::Utc;
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
    User,
}

impl LogStream {
    fn as_str(self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
            LogStream::System => "system",
            LogStream::User => "user",
        }
    }
}

struct OpenFile {
    path: PathBuf,
    file: File,
}

pub struct LogWriter {
    log_dir: PathBuf,
    session_id: String,
    current: Mutex<Option<OpenFile>>,
}

impl LogWriter {
    pub fn new(log_dir: PathBuf, session_id: impl Into<String>) -> Self {
        Self {
            log_dir,
            session_id: session_id.into(),
            current: Mutex::new(None),
        }
    }

    fn path_for(&self, now: chrono::DateTime<Utc>) -> PathBuf {
        self.log_dir
            .join("sessions")
            .join(now.format("%Y").to_string())
            .join(now.format("%m").to_string())
            .join(format!("{}.log", self.session_id))
    }

    /// Current log file path, if one has been opened yet — used to populate
    /// `sessions.log_file_path` after the first write.
    pub async fn current_path(&self) -> Option<PathBuf> {
        self.current.lock().await.as_ref().map(|f| f.path.clone())
    }

    /// Where the next write will land, computed without opening anything —
    /// used to populate `sessions.log_file_path` as soon as a session
    /// starts, before its first log line has actually been appended.
    pub fn expected_path(&self) -> PathBuf {
        self.path_for(Utc::now())
    }

    /// Sibling path for a plan-mode session's plan document, used to
    /// populate `sessions.plan_file_path`. Shares the same monthly shard as
    /// the transcript log.
    pub fn plan_path(&self) -> PathBuf {
        self.expected_path().with_extension("plan.md")
    }

    pub async fn append(&self, stream: LogStream, content: &str) -> anyhow::Result<()> {
        let now = Utc::now();
        let want_path = self.path_for(now);
        let mut guard = self.current.lock().await;

        let needs_open = match guard.as_ref() {
            Some(open) => open.path != want_path,
            None => true,
        };
        if needs_open {
            if let Some(parent) = want_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&want_path)
                .await?;
            *guard = Some(OpenFile {
                path: want_path.clone(),
                file,
            });
        }

        let open = guard.as_mut().expect("just opened above");
        let line = format!("[{}] {}\n", stream.as_str(), content);
        open.file.write_all(line.as_bytes()).await?;
        open.file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_creates_nested_dated_directories() {
        let dir = tempfile::tempdir().unwrap();
        let writer = LogWriter::new(dir.path().to_path_buf(), "sess-1");
        writer.append(LogStream::Stdout, "hello").await.unwrap();

        let path = writer.current_path().await.unwrap();
        assert!(path.exists());
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents, "[stdout] hello\n");
    }

    #[tokio::test]
    async fn multiple_appends_go_to_the_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let writer = LogWriter::new(dir.path().to_path_buf(), "sess-2");
        writer.append(LogStream::User, "one").await.unwrap();
        writer.append(LogStream::Stdout, "two").await.unwrap();

        let path = writer.current_path().await.unwrap();
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents, "[user] one\n[stdout] two\n");
    }
}
