//! Receiving end of a windowed file transfer.

use std::path::{Component, Path, PathBuf};

use jamp_shared::limits::MAX_DOWNLOAD_BLKSIZE;
use jamp_shared::net::DownloadBlock;

/// What the caller should do after a block arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// Duplicate or early block; nothing to acknowledge.
    Ignored,
    /// Acknowledge this block with `nextdl`.
    Ack(i32),
    /// The final block; acknowledge it and write the file.
    Done(i32),
    /// The server refused or aborted.
    Refused(String),
}

#[derive(Debug, Clone)]
pub struct IncomingDownload {
    pub name: String,
    pub data: Vec<u8>,
    pub total_size: Option<u64>,
    expected: i32,
}

impl IncomingDownload {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            data: Vec::new(),
            total_size: None,
            expected: 0,
        }
    }

    /// `CL_ParseDownload`: blocks are taken strictly in order; the server
    /// resends anything skipped.
    pub fn receive(&mut self, block: &DownloadBlock) -> Progress {
        if let Some(err) = &block.error {
            return Progress::Refused(err.clone());
        }
        if block.block != self.expected {
            return Progress::Ignored;
        }
        if block.block == 0 {
            self.total_size = block.total_size;
        }
        self.data.extend_from_slice(&block.data);
        self.expected += 1;
        if block.data.len() < MAX_DOWNLOAD_BLKSIZE {
            Progress::Done(block.block)
        } else {
            Progress::Ack(block.block)
        }
    }

    /// Where the finished file goes under `root`. Names that would leave
    /// `root` are refused.
    pub fn destination(&self, root: &Path) -> Option<PathBuf> {
        let rel = Path::new(&self.name);
        rel.components()
            .all(|c| matches!(c, Component::Normal(_)))
            .then(|| root.join(rel))
    }
}
