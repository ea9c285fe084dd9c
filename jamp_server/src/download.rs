//! Windowed file transfer to a client.
//!
//! Blocks of `MAX_DOWNLOAD_BLKSIZE` bytes are sent ahead of the client's
//! acknowledgements by at most `MAX_DOWNLOAD_WINDOW` blocks. The last block
//! is always shorter than a full block, so a file whose size is a multiple of
//! the block size ends with an empty block.

use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use thiserror::Error;

use jamp_shared::limits::{MAX_DOWNLOAD_BLKSIZE, MAX_DOWNLOAD_WINDOW};
use jamp_shared::net::DownloadBlock;

/// Unacknowledged blocks are sent again after this long.
pub const RESEND_MSEC: i32 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DownloadRefusal {
    #[error("Could not download \"{0}\" because autodownloading is disabled on the server.")]
    Disabled(String),
    #[error("Cannot autodownload \"{0}\": illegal path.")]
    IllegalPath(String),
    #[error("File \"{0}\" not found on server for autodownloading.")]
    NotFound(String),
}

impl DownloadRefusal {
    pub fn block(&self) -> DownloadBlock {
        DownloadBlock {
            block: 0,
            total_size: None,
            data: Vec::new(),
            error: Some(self.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Download {
    pub name: String,
    data: Bytes,
    /// Blocks the client has confirmed.
    acked: i32,
    /// Next block to transmit.
    next: i32,
    last_send: i32,
}

/// Resolves `name` inside `root`, refusing absolute paths and `..`.
pub fn resolve(root: &Path, name: &str) -> Result<PathBuf, DownloadRefusal> {
    let rel = Path::new(name);
    let clean = !name.is_empty()
        && rel
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if !clean {
        return Err(DownloadRefusal::IllegalPath(name.to_string()));
    }
    Ok(root.join(rel))
}

impl Download {
    pub fn open(root: &Path, name: &str) -> Result<Self, DownloadRefusal> {
        let path = resolve(root, name)?;
        let data = std::fs::read(&path).map_err(|_| DownloadRefusal::NotFound(name.to_string()))?;
        Ok(Self::from_bytes(name, Bytes::from(data)))
    }

    pub fn from_bytes(name: &str, data: Bytes) -> Self {
        Self {
            name: name.to_string(),
            data,
            acked: 0,
            next: 0,
            last_send: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Number of blocks including the terminating short block.
    pub fn block_count(&self) -> i32 {
        (self.data.len() / MAX_DOWNLOAD_BLKSIZE + 1) as i32
    }

    /// `nextdl <block>`: the client has `block`. Out-of-order acks are
    /// ignored. Returns true once the final block is confirmed.
    pub fn acknowledge(&mut self, block: i32) -> bool {
        if block == self.acked {
            self.acked += 1;
        }
        self.is_complete()
    }

    pub fn is_complete(&self) -> bool {
        self.acked >= self.block_count()
    }

    /// Next block to send at `now`, if the window allows one.
    pub fn next_block(&mut self, now: i32) -> Option<DownloadBlock> {
        if self.is_complete() {
            return None;
        }
        if self.next > self.acked && now - self.last_send > RESEND_MSEC {
            self.next = self.acked;
        }
        if self.next >= self.block_count() || self.next >= self.acked + MAX_DOWNLOAD_WINDOW as i32 {
            return None;
        }

        let block = self.next;
        let start = (block as usize * MAX_DOWNLOAD_BLKSIZE).min(self.data.len());
        let end = (start + MAX_DOWNLOAD_BLKSIZE).min(self.data.len());
        self.next += 1;
        self.last_send = now;
        Some(DownloadBlock {
            block,
            total_size: (block == 0).then_some(self.data.len() as u64),
            data: self.data[start..end].to_vec(),
            error: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_stay_inside_the_root() {
        let root = Path::new("base");
        assert!(resolve(root, "maps/ffa_bespin.ent").is_ok());
        assert!(resolve(root, "../secret.cfg").is_err());
        assert!(resolve(root, "/etc/passwd").is_err());
        assert!(resolve(root, "").is_err());
    }

    #[test]
    fn window_and_terminating_block() {
        let data = Bytes::from(vec![7u8; MAX_DOWNLOAD_BLKSIZE * 9]);
        let mut d = Download::from_bytes("big.pk3", data);
        assert_eq!(d.block_count(), 10);

        let first: Vec<DownloadBlock> = std::iter::from_fn(|| d.next_block(0)).collect();
        assert_eq!(first.len(), MAX_DOWNLOAD_WINDOW);
        assert_eq!(first[0].total_size, Some((MAX_DOWNLOAD_BLKSIZE * 9) as u64));
        assert_eq!(first[1].total_size, None);

        for b in 0..9 {
            assert!(!d.acknowledge(b));
            while d.next_block(10).is_some() {}
        }
        let last = d.next_block(20);
        assert!(last.is_none());
        assert!(d.acknowledge(9));
        assert!(d.is_complete());
    }

    #[test]
    fn unacknowledged_blocks_are_resent() {
        let mut d = Download::from_bytes("small.txt", Bytes::from_static(b"hello"));
        let b0 = d.next_block(0).unwrap();
        assert_eq!(b0.data, b"hello");
        assert!(d.next_block(10).is_none());
        let again = d.next_block(RESEND_MSEC + 1).unwrap();
        assert_eq!(again.block, 0);
    }
}
