//! The record stream a micro-batcher consumes.

use async_trait::async_trait;
use data_types::ingest::Row;
use std::fmt::Debug;
use tokio::sync::mpsc;

/// Produces the records of one topic/group subscription.
///
/// The real broker client lives outside this service; anything that can
/// yield rows can drive a batcher.
#[async_trait]
pub trait StreamSource: Debug + Send {
    /// The next record, or `None` once the stream ended.
    async fn next_record(&mut self) -> Option<Row>;
}

/// A [`StreamSource`] fed through an in-process channel. Used by tests and
/// by embedding callers that receive records some other way.
#[derive(Debug)]
pub struct ChannelStreamSource {
    rx: mpsc::Receiver<Row>,
}

impl ChannelStreamSource {
    /// Create a source and the sender feeding it.
    pub fn new(buffer: usize) -> (mpsc::Sender<Row>, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (tx, Self { rx })
    }
}

#[async_trait]
impl StreamSource for ChannelStreamSource {
    async fn next_record(&mut self) -> Option<Row> {
        self.rx.recv().await
    }
}

/// A [`StreamSource`] tailing a newline-delimited JSON file of raw rows.
///
/// Stands in for a broker subscription in single-host deployments (broker
/// urls of the form `file:///path/to/rows.ndjson`). Unparseable lines are
/// skipped with a warning.
#[derive(Debug)]
pub struct NdjsonFileSource {
    path: std::path::PathBuf,
    poll_interval: std::time::Duration,
    next_line: usize,
}

impl NdjsonFileSource {
    /// Tail `path`, starting at the head when `start_from_earliest` or the
    /// current end otherwise.
    pub async fn open(
        path: impl Into<std::path::PathBuf>,
        poll_interval: std::time::Duration,
        start_from_earliest: bool,
    ) -> std::io::Result<Self> {
        let path = path.into();
        let next_line = if start_from_earliest {
            0
        } else {
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => content.lines().count(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
                Err(e) => return Err(e),
            }
        };
        Ok(Self {
            path,
            poll_interval,
            next_line,
        })
    }
}

#[async_trait]
impl StreamSource for NdjsonFileSource {
    async fn next_record(&mut self) -> Option<Row> {
        loop {
            let content = match tokio::fs::read_to_string(&self.path).await {
                Ok(content) => content,
                Err(_) => String::new(),
            };
            for (i, line) in content.lines().enumerate().skip(self.next_line) {
                self.next_line = i + 1;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Row>(line) {
                    Ok(row) => return Some(row),
                    Err(e) => {
                        tracing::warn!(path=%self.path.display(), line = i + 1, %e, "skipping unparseable record");
                    }
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_source_ends_when_senders_drop() {
        let (tx, mut source) = ChannelStreamSource::new(2);
        tx.send(Row::new()).await.unwrap();
        drop(tx);

        assert!(source.next_record().await.is_some());
        assert!(source.next_record().await.is_none());
    }

    #[tokio::test]
    async fn ndjson_source_yields_new_lines_in_order() {
        let dir = test_helpers::tmp_dir().unwrap();
        let path = dir.path().join("rows.ndjson");
        std::fs::write(&path, "{\"v\": 1}\nnot json\n{\"v\": 2}\n").unwrap();

        let mut source = NdjsonFileSource::open(
            &path,
            std::time::Duration::from_millis(5),
            true,
        )
        .await
        .unwrap();

        let first = source.next_record().await.unwrap();
        assert_eq!(first["v"], serde_json::json!(1));
        // the invalid line is skipped
        let second = source.next_record().await.unwrap();
        assert_eq!(second["v"], serde_json::json!(2));
    }

    #[tokio::test]
    async fn ndjson_source_seeks_to_the_tail_by_default() {
        let dir = test_helpers::tmp_dir().unwrap();
        let path = dir.path().join("rows.ndjson");
        std::fs::write(&path, "{\"v\": 1}\n").unwrap();

        let mut source =
            NdjsonFileSource::open(&path, std::time::Duration::from_millis(5), false)
                .await
                .unwrap();

        use std::io::Write;
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{\"v\": 2}}").unwrap();

        let record = source.next_record().await.unwrap();
        assert_eq!(record["v"], serde_json::json!(2));
    }
}
