//! Payload sources for the load and auth roles. A configured string that names
//! an existing regular file becomes a file-cycling source; anything else
//! (including a directory path) is treated as a literal template.

use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error};

use crate::template::{MsgContext, SeqRegistry, Template, TemplateError};

/// Bounded queue between the file reader task and the workers draining it.
/// The reader blocks (backpressure) instead of buffering unboundedly.
pub const FILE_QUEUE_CAPACITY: usize = 1000;

/// Files up to this size are loaded whole into memory and cycled from there.
const IN_MEMORY_LIMIT: u64 = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("error while parsing the template: {0}")]
    Template(#[from] TemplateError),
    #[error("error while opening the message file: {0}")]
    Open(#[source] std::io::Error),
    #[error("error while reading the message file: {0}")]
    Read(#[source] std::io::Error),
}

#[async_trait]
pub trait MessageGetter: Send + Sync + std::fmt::Debug {
    /// Next payload for the caller, or `None` when the source cannot produce one.
    async fn get(&self, ctx: &MsgContext) -> Option<Vec<u8>>;
}

/// Builds the right source for `spec`: file-cycling when it points at a
/// regular file, template otherwise.
pub async fn new_message_source(
    spec: &str,
    registry: Arc<SeqRegistry>,
) -> Result<Arc<dyn MessageGetter>, MessageError> {
    match regular_file_size(spec).await {
        Some(size) => Ok(Arc::new(FileMessage::open(Path::new(spec), size).await?)),
        None => Ok(Arc::new(TemplateMessage::new(spec, registry)?)),
    }
}

async fn regular_file_size(spec: &str) -> Option<u64> {
    let meta = tokio::fs::metadata(spec).await.ok()?;
    if meta.is_file() {
        Some(meta.len())
    } else {
        None
    }
}

/// Renders a parsed template on every call.
#[derive(Debug)]
pub struct TemplateMessage {
    template: Template,
    registry: Arc<SeqRegistry>,
}

impl TemplateMessage {
    pub fn new(raw: &str, registry: Arc<SeqRegistry>) -> Result<Self, MessageError> {
        Ok(Self {
            template: Template::parse(raw)?,
            registry,
        })
    }
}

#[async_trait]
impl MessageGetter for TemplateMessage {
    async fn get(&self, ctx: &MsgContext) -> Option<Vec<u8>> {
        Some(self.template.render(&self.registry, ctx).into_bytes())
    }
}

/// Cycles the lines of a file through a bounded queue, restarting from the
/// first line at end-of-file, forever.
#[derive(Debug)]
pub struct FileMessage {
    queue: Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl FileMessage {
    pub async fn open(path: &Path, size: u64) -> Result<Self, MessageError> {
        let mut file = File::open(path).await.map_err(MessageError::Open)?;
        let (tx, rx) = mpsc::channel(FILE_QUEUE_CAPACITY);

        if size <= IN_MEMORY_LIMIT {
            debug!("loading message file in memory");
            let mut data = Vec::with_capacity(size as usize);
            file.read_to_end(&mut data).await.map_err(MessageError::Read)?;
            tokio::spawn(cycle_memory(data, tx));
        } else {
            tokio::spawn(cycle_file(file, tx));
        }

        Ok(Self {
            queue: Mutex::new(rx),
        })
    }
}

#[async_trait]
impl MessageGetter for FileMessage {
    async fn get(&self, _ctx: &MsgContext) -> Option<Vec<u8>> {
        self.queue.lock().await.recv().await
    }
}

async fn cycle_memory(data: Vec<u8>, tx: mpsc::Sender<Vec<u8>>) {
    if data.is_empty() {
        return;
    }

    let mut lines: Vec<Vec<u8>> = data.split(|&b| b == b'\n').map(<[u8]>::to_vec).collect();
    if data.ends_with(b"\n") {
        lines.pop();
    }

    loop {
        for line in &lines {
            if tx.send(line.clone()).await.is_err() {
                return;
            }
        }
    }
}

async fn cycle_file(file: File, tx: mpsc::Sender<Vec<u8>>) {
    let mut reader = BufReader::new(file);
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => {
                // End of file: rewind and replay from the first line.
                if let Err(err) = reader.seek(SeekFrom::Start(0)).await {
                    error!("error while seeking the message file: {err}");
                    return;
                }
            }
            Ok(_) => {
                if line.last() == Some(&b'\n') {
                    line.pop();
                }
                if tx.send(line.clone()).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                error!("error while reading the message file: {err}");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    async fn next(source: &Arc<dyn MessageGetter>) -> String {
        let ctx = MsgContext::default();
        String::from_utf8(source.get(&ctx).await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn file_source_cycles_lines_in_order() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "one").unwrap();
        writeln!(file, "two").unwrap();
        writeln!(file, "three").unwrap();
        file.flush().unwrap();

        let registry = Arc::new(SeqRegistry::new());
        let source = new_message_source(file.path().to_str().unwrap(), registry)
            .await
            .unwrap();

        for _ in 0..3 {
            assert_eq!(next(&source).await, "one");
            assert_eq!(next(&source).await, "two");
            assert_eq!(next(&source).await, "three");
        }
    }

    #[tokio::test]
    async fn file_without_trailing_newline_keeps_last_line() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "a\nb").unwrap();
        file.flush().unwrap();

        let registry = Arc::new(SeqRegistry::new());
        let source = new_message_source(file.path().to_str().unwrap(), registry)
            .await
            .unwrap();

        assert_eq!(next(&source).await, "a");
        assert_eq!(next(&source).await, "b");
        assert_eq!(next(&source).await, "a");
    }

    #[tokio::test]
    async fn streamed_reader_rewinds_at_end_of_file() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp, "one").unwrap();
        writeln!(tmp, "two").unwrap();
        write!(tmp, "three").unwrap();
        tmp.flush().unwrap();

        // Drive the streamed branch directly, regardless of file size.
        let file = File::open(tmp.path()).await.unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        tokio::spawn(cycle_file(file, tx));

        let mut lines = Vec::new();
        for _ in 0..7 {
            lines.push(String::from_utf8(rx.recv().await.unwrap()).unwrap());
        }
        assert_eq!(
            lines,
            vec!["one", "two", "three", "one", "two", "three", "one"]
        );
    }

    #[tokio::test]
    async fn directory_path_is_a_literal_template() {
        let dir = tempfile::tempdir().unwrap();
        let spec = dir.path().to_str().unwrap().to_owned();

        let registry = Arc::new(SeqRegistry::new());
        let source = new_message_source(&spec, registry).await.unwrap();

        assert_eq!(next(&source).await, spec);
    }

    #[tokio::test]
    async fn empty_template_yields_empty_payload() {
        let registry = Arc::new(SeqRegistry::new());
        let source = new_message_source("", registry).await.unwrap();

        let payload = source.get(&MsgContext::default()).await.unwrap();
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn bad_template_is_a_construction_error() {
        let registry = Arc::new(SeqRegistry::new());
        let err = new_message_source("{{Bogus}}", registry).await.unwrap_err();
        assert!(matches!(err, MessageError::Template(_)));
    }
}
