use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::proto::header::Header;
use crate::proto::types::{BlockInfo, BlockRequest, FileInfo};

/// Default upper bound for any single length prefix accepted off the wire, so a corrupt
///  prefix cannot trigger an unbounded allocation.
pub const DEFAULT_MAX_ELEMENT_LEN: usize = 1024 * 1024;

fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) -> anyhow::Result<()> {
    buf.put_u32(u32::try_from(bytes.len())?);
    buf.put_slice(bytes);
    Ok(())
}

fn put_string(buf: &mut BytesMut, s: &str) -> anyhow::Result<()> {
    put_bytes(buf, s.as_bytes())
}

/// Write half of the wire codec. Serializes typed payloads into a scratch buffer with
///  fixed-width, length-prefixed fields and moves them onto the (compressed) stream.
///
/// The codec has a sticky error: once any operation fails, all later operations are
///  no-ops returning an error that carries the first failure. Cumulative bytes processed
///  (as marshalled, before compression) are tracked for throughput accounting.
pub struct WireWriter<W> {
    inner: W,
    buf: BytesMut,
    tot: Arc<AtomicU64>,
    poisoned: Option<String>,
}

impl<W: AsyncWrite + Unpin> WireWriter<W> {
    pub fn new(inner: W) -> WireWriter<W> {
        WireWriter {
            inner,
            buf: BytesMut::new(),
            tot: Arc::new(AtomicU64::new(0)),
            poisoned: None,
        }
    }

    /// monotonically increasing count of marshalled bytes, shared with the caller
    pub fn bytes_processed(&self) -> Arc<AtomicU64> {
        self.tot.clone()
    }

    fn check(&self) -> anyhow::Result<()> {
        match &self.poisoned {
            Some(first) => Err(anyhow!("wire writer failed previously: {}", first)),
            None => Ok(()),
        }
    }

    fn seal<T>(&mut self, res: anyhow::Result<T>) -> anyhow::Result<T> {
        if let Err(e) = &res {
            self.poisoned = Some(e.to_string());
        }
        res
    }

    /// moves the scratch buffer to the stream, recording the first failure permanently
    async fn put(&mut self) -> anyhow::Result<()> {
        let res = self.inner.write_all(&self.buf).await;
        match res {
            Ok(()) => {
                self.tot.fetch_add(self.buf.len() as u64, Ordering::Relaxed);
                self.buf.clear();
                Ok(())
            }
            Err(e) => {
                self.buf.clear();
                self.poisoned = Some(e.to_string());
                Err(anyhow!("writing to peer failed: {}", e))
            }
        }
    }

    pub async fn write_word(&mut self, word: u32) -> anyhow::Result<()> {
        self.check()?;
        self.buf.put_u32(word);
        self.put().await
    }

    pub async fn write_header(&mut self, header: &Header) -> anyhow::Result<()> {
        self.write_word(header.encode()).await
    }

    pub async fn write_index(&mut self, files: &[FileInfo]) -> anyhow::Result<()> {
        self.check()?;
        let encoded = self.encode_index(files);
        if encoded.is_err() {
            return self.seal(encoded);
        }
        self.put().await
    }

    pub async fn write_request(&mut self, request: &BlockRequest) -> anyhow::Result<()> {
        self.check()?;
        let encoded = self.encode_request(request);
        if encoded.is_err() {
            return self.seal(encoded);
        }
        self.put().await
    }

    pub async fn write_response(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.check()?;
        let encoded = put_bytes(&mut self.buf, data);
        if encoded.is_err() {
            return self.seal(encoded);
        }
        self.put().await
    }

    /// Flushes the underlying stream. For a compressed stream this performs a sync flush,
    ///  making everything written so far decodable by the peer.
    pub async fn flush(&mut self) -> anyhow::Result<()> {
        self.check()?;
        match self.inner.flush().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.poisoned = Some(e.to_string());
                Err(anyhow!("flushing stream to peer failed: {}", e))
            }
        }
    }

    fn encode_index(&mut self, files: &[FileInfo]) -> anyhow::Result<()> {
        self.buf.put_u32(u32::try_from(files.len())?);
        for file in files {
            put_string(&mut self.buf, &file.name)?;
            self.buf.put_u32(file.flags);
            self.buf.put_i64(file.modified);
            self.buf.put_u32(u32::try_from(file.blocks.len())?);
            for block in &file.blocks {
                self.buf.put_u32(block.length);
                put_bytes(&mut self.buf, &block.hash)?;
            }
        }
        Ok(())
    }

    fn encode_request(&mut self, request: &BlockRequest) -> anyhow::Result<()> {
        put_string(&mut self.buf, &request.name)?;
        self.buf.put_u64(request.offset);
        self.buf.put_u32(request.size);
        put_bytes(&mut self.buf, &request.hash)?;
        Ok(())
    }
}

/// Read half of the wire codec, with the same sticky-error and byte-counting contract as
///  [WireWriter].
pub struct WireReader<R> {
    inner: R,
    tot: Arc<AtomicU64>,
    poisoned: Option<String>,
    max_element_len: usize,
}

impl<R: AsyncRead + Unpin> WireReader<R> {
    pub fn new(inner: R, max_element_len: usize) -> WireReader<R> {
        WireReader {
            inner,
            tot: Arc::new(AtomicU64::new(0)),
            poisoned: None,
            max_element_len,
        }
    }

    /// monotonically increasing count of unmarshalled bytes, shared with the caller
    pub fn bytes_processed(&self) -> Arc<AtomicU64> {
        self.tot.clone()
    }

    fn check(&self) -> anyhow::Result<()> {
        match &self.poisoned {
            Some(first) => Err(anyhow!("wire reader failed previously: {}", first)),
            None => Ok(()),
        }
    }

    fn seal<T>(&mut self, res: anyhow::Result<T>) -> anyhow::Result<T> {
        if let Err(e) = &res {
            self.poisoned = Some(e.to_string());
        }
        res
    }

    pub async fn read_word(&mut self) -> anyhow::Result<u32> {
        self.check()?;
        let res = self.get_u32().await;
        self.seal(res)
    }

    pub async fn read_index(&mut self) -> anyhow::Result<Vec<FileInfo>> {
        self.check()?;
        let res = self.index_body().await;
        self.seal(res)
    }

    pub async fn read_request(&mut self) -> anyhow::Result<BlockRequest> {
        self.check()?;
        let res = self.request_body().await;
        self.seal(res)
    }

    pub async fn read_response(&mut self) -> anyhow::Result<Vec<u8>> {
        self.check()?;
        let res = self.get_bytes().await;
        self.seal(res)
    }

    async fn index_body(&mut self) -> anyhow::Result<Vec<FileInfo>> {
        let num_files = self.get_len().await?;
        let mut files = Vec::new();
        for _ in 0..num_files {
            let name = self.get_string().await?;
            let flags = self.get_u32().await?;
            let modified = self.get_i64().await?;
            let num_blocks = self.get_len().await?;
            let mut blocks = Vec::new();
            for _ in 0..num_blocks {
                let length = self.get_u32().await?;
                let hash = self.get_bytes().await?;
                blocks.push(BlockInfo { length, hash });
            }
            files.push(FileInfo {
                name,
                flags,
                modified,
                blocks,
            });
        }
        Ok(files)
    }

    async fn request_body(&mut self) -> anyhow::Result<BlockRequest> {
        let name = self.get_string().await?;
        let offset = self.get_u64().await?;
        let size = self.get_u32().await?;
        let hash = self.get_bytes().await?;
        Ok(BlockRequest {
            name,
            offset,
            size,
            hash,
        })
    }

    async fn get_u32(&mut self) -> anyhow::Result<u32> {
        let value = self.inner.read_u32().await?;
        self.tot.fetch_add(4, Ordering::Relaxed);
        Ok(value)
    }

    async fn get_u64(&mut self) -> anyhow::Result<u64> {
        let value = self.inner.read_u64().await?;
        self.tot.fetch_add(8, Ordering::Relaxed);
        Ok(value)
    }

    async fn get_i64(&mut self) -> anyhow::Result<i64> {
        let value = self.inner.read_i64().await?;
        self.tot.fetch_add(8, Ordering::Relaxed);
        Ok(value)
    }

    async fn get_len(&mut self) -> anyhow::Result<usize> {
        let len = self.get_u32().await? as usize;
        if len > self.max_element_len {
            bail!(
                "length prefix {} exceeds the allowed maximum of {}",
                len,
                self.max_element_len
            );
        }
        Ok(len)
    }

    async fn get_bytes(&mut self) -> anyhow::Result<Vec<u8>> {
        let len = self.get_len().await?;
        let mut bytes = vec![0u8; len];
        self.inner.read_exact(&mut bytes).await?;
        self.tot.fetch_add(len as u64, Ordering::Relaxed);
        Ok(bytes)
    }

    async fn get_string(&mut self) -> anyhow::Result<String> {
        Ok(String::from_utf8(self.get_bytes().await?)?)
    }
}
