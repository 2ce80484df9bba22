//! File transfer over the data channel.
//!
//! A transfer is one `offer` followed by `chunk` messages carrying base64
//! slices of the file, all wrapped in file-kind envelopes. The receiver writes
//! chunks into a `.part` file at their offsets, so arrival order does not
//! matter, and verifies the SHA-256 before moving the file into place.

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_FILE_BYTES: u64 = 100 * 1024 * 1024;
/// Raw bytes per chunk, before base64.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;
pub const MAX_FILENAME_BYTES: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileOffer {
    pub file_id: String,
    pub filename: String,
    pub file_size: u64,
    pub checksum_sha256: String,
    pub chunk_size: u32,
    pub total_chunks: u32,
}

/// Payload of a file-kind envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FileMessage {
    Offer(FileOffer),
    #[serde(rename_all = "camelCase")]
    Chunk {
        file_id: String,
        index: u32,
        /// Base64 of the raw bytes.
        data: String,
    },
}

impl FileMessage {
    pub fn chunk(file_id: &str, index: u32, bytes: &[u8]) -> Self {
        FileMessage::Chunk {
            file_id: file_id.to_string(),
            index,
            data: STANDARD.encode(bytes),
        }
    }
}

/// Reads a local file chunk by chunk.
pub struct OutgoingFile {
    offer: FileOffer,
    file: File,
    next_chunk: u32,
}

impl OutgoingFile {
    pub fn from_path(
        path: &Path,
        file_id: impl Into<String>,
        chunk_size: usize,
        max_file_bytes: u64,
    ) -> Result<Self> {
        let file_id = file_id.into();
        if !valid_file_id(&file_id) {
            return Err(anyhow!("invalid file_id: {file_id:?}"));
        }
        if chunk_size == 0 {
            return Err(anyhow!("chunk_size must be non-zero"));
        }

        let metadata =
            fs::metadata(path).with_context(|| format!("failed to stat {}", path.display()))?;
        if !metadata.is_file() {
            return Err(anyhow!("not a regular file: {}", path.display()));
        }
        let file_size = metadata.len();
        if file_size == 0 {
            return Err(anyhow!("empty files are not supported: {}", path.display()));
        }
        if file_size > max_file_bytes {
            return Err(anyhow!(
                "file {} exceeds max size {} bytes (got {})",
                path.display(),
                max_file_bytes,
                file_size
            ));
        }

        let filename = path
            .file_name()
            .and_then(|s| s.to_str())
            .and_then(sanitize_filename)
            .ok_or_else(|| anyhow!("invalid filename: {}", path.display()))?;
        let total_chunks = chunk_count(file_size, chunk_size)?;
        let checksum_sha256 = sha256_file_hex(path)?;
        let file =
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?;

        Ok(Self {
            offer: FileOffer {
                file_id,
                filename,
                file_size,
                checksum_sha256,
                chunk_size: chunk_size as u32,
                total_chunks,
            },
            file,
            next_chunk: 0,
        })
    }

    pub fn offer(&self) -> &FileOffer {
        &self.offer
    }

    pub fn finished(&self) -> bool {
        self.next_chunk >= self.offer.total_chunks
    }

    /// Next chunk as a wire message, or `None` once every chunk was read.
    pub fn next_message(&mut self) -> Result<Option<FileMessage>> {
        if self.finished() {
            return Ok(None);
        }

        let index = self.next_chunk;
        let offset = chunk_offset(&self.offer, index)?;
        let len = expected_chunk_len(&self.offer, index)?;

        self.file
            .seek(SeekFrom::Start(offset))
            .with_context(|| format!("seek failed for {}", self.offer.filename))?;
        let mut bytes = vec![0u8; len];
        self.file
            .read_exact(&mut bytes)
            .with_context(|| format!("read failed for {}", self.offer.filename))?;

        self.next_chunk = self.next_chunk.saturating_add(1);
        Ok(Some(FileMessage::chunk(&self.offer.file_id, index, &bytes)))
    }
}

/// A transfer being reassembled on disk.
pub struct IncomingFile {
    offer: FileOffer,
    part_path: PathBuf,
    final_path: PathBuf,
    file: File,
    received: Vec<bool>,
    received_count: u32,
}

impl IncomingFile {
    pub fn new(output_dir: &Path, offer: FileOffer, max_file_bytes: u64) -> Result<Self> {
        validate_offer(&offer, max_file_bytes)?;
        fs::create_dir_all(output_dir)
            .with_context(|| format!("failed to create {}", output_dir.display()))?;

        let sanitized = sanitize_filename(&offer.filename)
            .ok_or_else(|| anyhow!("invalid filename: {}", offer.filename))?;
        let final_path = output_dir.join(&sanitized);
        let part_path = output_dir.join(format!("{sanitized}.{}.part", offer.file_id));

        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .read(true)
            .open(&part_path)
            .with_context(|| format!("failed to open {}", part_path.display()))?;
        file.set_len(offer.file_size)
            .with_context(|| format!("failed to size {}", part_path.display()))?;

        let received = vec![false; offer.total_chunks as usize];
        Ok(Self {
            offer,
            part_path,
            final_path,
            file,
            received,
            received_count: 0,
        })
    }

    pub fn offer(&self) -> &FileOffer {
        &self.offer
    }

    pub fn is_complete(&self) -> bool {
        self.received_count == self.offer.total_chunks
    }

    pub fn received_count(&self) -> u32 {
        self.received_count
    }

    /// Decodes and stores one chunk. Repeated chunks are ignored.
    pub fn write_chunk(&mut self, index: u32, data_base64: &str) -> Result<bool> {
        let payload = STANDARD
            .decode(data_base64)
            .with_context(|| format!("chunk {index} is not valid base64"))?;
        let expected = expected_chunk_len(&self.offer, index)?;
        if payload.len() != expected {
            return Err(anyhow!(
                "unexpected payload length for chunk {}: expected {}, got {}",
                index,
                expected,
                payload.len()
            ));
        }

        let idx = index as usize;
        if !self.received[idx] {
            let offset = chunk_offset(&self.offer, index)?;
            self.file
                .seek(SeekFrom::Start(offset))
                .with_context(|| format!("seek failed for {}", self.offer.filename))?;
            self.file
                .write_all(&payload)
                .with_context(|| format!("write failed for {}", self.offer.filename))?;
            self.received[idx] = true;
            self.received_count = self.received_count.saturating_add(1);
        }

        Ok(self.is_complete())
    }

    pub fn abort(self) -> Result<()> {
        let IncomingFile {
            part_path, file, ..
        } = self;
        drop(file);
        if part_path.exists() {
            fs::remove_file(&part_path)
                .with_context(|| format!("failed to remove {}", part_path.display()))?;
        }
        Ok(())
    }

    /// Verifies the checksum and moves the file to its final name.
    pub fn finalize(mut self) -> Result<PathBuf> {
        if !self.is_complete() {
            return Err(anyhow!(
                "file {} is incomplete ({}/{})",
                self.offer.filename,
                self.received_count,
                self.offer.total_chunks
            ));
        }

        self.file.flush()?;
        self.file.sync_all()?;
        drop(self.file);

        let checksum = sha256_file_hex(&self.part_path)?;
        if checksum != self.offer.checksum_sha256 {
            let _ = fs::remove_file(&self.part_path);
            return Err(anyhow!(
                "checksum mismatch for {}: expected {}, got {}",
                self.offer.filename,
                self.offer.checksum_sha256,
                checksum
            ));
        }

        let destination = unique_destination_path(&self.final_path);
        fs::rename(&self.part_path, &destination).with_context(|| {
            format!(
                "failed to move {} to {}",
                self.part_path.display(),
                destination.display()
            )
        })?;
        Ok(destination)
    }
}

/// Tracks inbound transfers from every participant.
pub struct FileReceiver {
    output_dir: PathBuf,
    max_file_bytes: u64,
    active: HashMap<(String, String), IncomingFile>,
}

impl FileReceiver {
    pub fn new(output_dir: impl Into<PathBuf>, max_file_bytes: u64) -> Self {
        Self {
            output_dir: output_dir.into(),
            max_file_bytes,
            active: HashMap::new(),
        }
    }

    pub fn in_progress(&self) -> usize {
        self.active.len()
    }

    /// Feeds one message from `sender`. Returns the saved path when a
    /// transfer completes.
    pub fn handle(&mut self, sender: &str, message: FileMessage) -> Result<Option<PathBuf>> {
        match message {
            FileMessage::Offer(offer) => {
                let key = (sender.to_string(), offer.file_id.clone());
                info!(
                    sender,
                    file = %offer.filename,
                    size = offer.file_size,
                    chunks = offer.total_chunks,
                    "incoming file offer"
                );
                let incoming = IncomingFile::new(&self.output_dir, offer, self.max_file_bytes)?;
                if let Some(previous) = self.active.insert(key, incoming) {
                    warn!(sender, file = %previous.offer().filename, "offer replaced an unfinished transfer");
                    previous.abort()?;
                }
                Ok(None)
            }
            FileMessage::Chunk {
                file_id,
                index,
                data,
            } => {
                let key = (sender.to_string(), file_id);
                let incoming = self
                    .active
                    .get_mut(&key)
                    .ok_or_else(|| anyhow!("chunk {index} for unknown transfer {}", key.1))?;
                if let Err(err) = incoming.write_chunk(index, &data) {
                    if let Some(broken) = self.active.remove(&key) {
                        broken.abort()?;
                    }
                    return Err(err);
                }
                if !incoming.is_complete() {
                    debug!(sender, index, "file chunk stored");
                    return Ok(None);
                }
                let Some(done) = self.active.remove(&key) else {
                    return Ok(None);
                };
                let path = done.finalize()?;
                info!(sender, path = %path.display(), "file received");
                Ok(Some(path))
            }
        }
    }

    /// Drops every unfinished transfer from `sender`.
    pub fn abandon_sender(&mut self, sender: &str) {
        let keys: Vec<_> = self
            .active
            .keys()
            .filter(|(s, _)| s == sender)
            .cloned()
            .collect();
        for key in keys {
            if let Some(incoming) = self.active.remove(&key) {
                if let Err(err) = incoming.abort() {
                    warn!(sender, "failed to clean up partial file: {err:#}");
                }
            }
        }
    }
}

pub fn sanitize_filename(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    let base = Path::new(trimmed).file_name()?.to_string_lossy();
    let mut clean = String::with_capacity(base.len().min(MAX_FILENAME_BYTES));
    for ch in base.chars() {
        let safe = ch.is_alphanumeric() || matches!(ch, '.' | '_' | '-' | ' ');
        if clean.len() + ch.len_utf8() > MAX_FILENAME_BYTES {
            break;
        }
        clean.push(if safe { ch } else { '_' });
    }
    let clean = clean.trim().trim_matches('.').to_string();
    if clean.is_empty() {
        return None;
    }
    Some(clean)
}

pub fn sha256_file_hex(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 16 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn sha256_bytes_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn chunk_count(file_size: u64, chunk_size: usize) -> Result<u32> {
    if chunk_size == 0 {
        return Err(anyhow!("chunk_size must be non-zero"));
    }
    let count = file_size.div_ceil(chunk_size as u64);
    if count == 0 {
        return Err(anyhow!("file_size must be non-zero"));
    }
    u32::try_from(count).map_err(|_| anyhow!("chunk count exceeds protocol limits"))
}

/// Transfer ids end up in on-disk part names, so only uuid-like ids pass.
pub fn valid_file_id(file_id: &str) -> bool {
    !file_id.is_empty()
        && file_id.len() <= 64
        && file_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

pub fn validate_offer(offer: &FileOffer, max_file_bytes: u64) -> Result<()> {
    if !valid_file_id(&offer.file_id) {
        return Err(anyhow!("invalid file_id in offer"));
    }
    if sanitize_filename(&offer.filename).is_none() {
        return Err(anyhow!("invalid filename in offer"));
    }
    if offer.file_size == 0 {
        return Err(anyhow!("file_size must be non-zero"));
    }
    if offer.file_size > max_file_bytes {
        return Err(anyhow!("file exceeds configured maximum"));
    }
    let expected = chunk_count(offer.file_size, offer.chunk_size as usize)?;
    if expected != offer.total_chunks {
        return Err(anyhow!(
            "invalid total_chunks: expected {}, got {}",
            expected,
            offer.total_chunks
        ));
    }
    if offer.checksum_sha256.len() != 64
        || !offer.checksum_sha256.chars().all(|c| c.is_ascii_hexdigit())
    {
        return Err(anyhow!("invalid checksum_sha256"));
    }
    Ok(())
}

fn chunk_offset(offer: &FileOffer, index: u32) -> Result<u64> {
    (index as u64)
        .checked_mul(offer.chunk_size as u64)
        .ok_or_else(|| anyhow!("chunk offset overflow"))
}

fn expected_chunk_len(offer: &FileOffer, index: u32) -> Result<usize> {
    if index >= offer.total_chunks {
        return Err(anyhow!(
            "chunk index {} out of range for {} chunks",
            index,
            offer.total_chunks
        ));
    }
    let remaining = offer.file_size.saturating_sub(chunk_offset(offer, index)?);
    Ok(remaining.min(offer.chunk_size as u64) as usize)
}

fn unique_destination_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }

    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("file")
        .to_string();
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    for n in 1..=9_999u32 {
        let candidate = if ext.is_empty() {
            path.with_file_name(format!("{stem} ({n})"))
        } else {
            path.with_file_name(format!("{stem} ({n}).{ext}"))
        };
        if !candidate.exists() {
            return candidate;
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(name: &str) -> PathBuf {
        let unique = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let path = std::env::temp_dir().join(format!("chatforyou-{name}-{unique}"));
        fs::create_dir_all(&path).unwrap();
        path
    }

    fn drain(outgoing: &mut OutgoingFile) -> Vec<FileMessage> {
        let mut out = Vec::new();
        while let Some(msg) = outgoing.next_message().unwrap() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn sanitize_filename_strips_directories() {
        assert_eq!(
            sanitize_filename("../../../../etc/passwd"),
            Some("passwd".to_string())
        );
        assert_eq!(sanitize_filename("보고서 v2.pdf"), Some("보고서 v2.pdf".to_string()));
        assert_eq!(sanitize_filename("a:b?.txt"), Some("a_b_.txt".to_string()));
        assert_eq!(sanitize_filename(""), None);
        assert_eq!(sanitize_filename(".."), None);
    }

    #[test]
    fn offer_describes_the_file() {
        let dir = temp_dir("offer");
        let file_path = dir.join("hello.txt");
        fs::write(&file_path, b"hello chatforyou").unwrap();

        let out = OutgoingFile::from_path(&file_path, "f-1", 4, DEFAULT_MAX_FILE_BYTES).unwrap();
        assert_eq!(out.offer().filename, "hello.txt");
        assert_eq!(out.offer().file_size, 16);
        assert_eq!(out.offer().total_chunks, 4);
        assert_eq!(
            out.offer().checksum_sha256,
            sha256_bytes_hex(b"hello chatforyou")
        );

        let wire = serde_json::to_value(FileMessage::Offer(out.offer().clone())).unwrap();
        assert_eq!(wire["type"], "offer");
        assert_eq!(wire["fileId"], "f-1");
        assert_eq!(wire["totalChunks"], 4);
    }

    #[test]
    fn chunk_count_rejects_zero_values() {
        assert!(chunk_count(0, 1).is_err());
        assert!(chunk_count(1, 0).is_err());
        assert_eq!(chunk_count(10, 3).unwrap(), 4);
    }

    #[test]
    fn receiver_reassembles_out_of_order_chunks() {
        let dir = temp_dir("receiver");
        let send_path = dir.join("payload.bin");
        let payload = (0..10_000u32).map(|v| (v % 251) as u8).collect::<Vec<_>>();
        fs::write(&send_path, &payload).unwrap();

        let mut outgoing =
            OutgoingFile::from_path(&send_path, "t-7", 900, DEFAULT_MAX_FILE_BYTES).unwrap();
        let offer = outgoing.offer().clone();
        let mut chunks = drain(&mut outgoing);
        chunks.reverse();

        let mut receiver = FileReceiver::new(dir.join("recv"), DEFAULT_MAX_FILE_BYTES);
        assert!(receiver.handle("bob", FileMessage::Offer(offer)).unwrap().is_none());
        assert_eq!(receiver.in_progress(), 1);

        let mut saved = None;
        for chunk in chunks {
            if let Some(path) = receiver.handle("bob", chunk).unwrap() {
                saved = Some(path);
            }
        }
        let saved = saved.expect("transfer should complete");
        assert_eq!(fs::read(saved).unwrap(), payload);
        assert_eq!(receiver.in_progress(), 0);
    }

    #[test]
    fn duplicate_chunks_are_ignored() {
        let dir = temp_dir("dup");
        let payload = vec![9u8; 2_400];
        let offer = FileOffer {
            file_id: "d-1".into(),
            filename: "demo.bin".into(),
            file_size: payload.len() as u64,
            checksum_sha256: sha256_bytes_hex(&payload),
            chunk_size: 600,
            total_chunks: 4,
        };
        let mut incoming =
            IncomingFile::new(&dir.join("recv"), offer, DEFAULT_MAX_FILE_BYTES).unwrap();
        let first = STANDARD.encode(&payload[0..600]);
        incoming.write_chunk(0, &first).unwrap();
        incoming.write_chunk(0, &first).unwrap();
        assert_eq!(incoming.received_count(), 1);
        assert!(incoming.write_chunk(4, &first).is_err());
        assert!(incoming.write_chunk(1, "%%%").is_err());
        incoming.abort().unwrap();
    }

    #[test]
    fn checksum_mismatch_is_rejected() {
        let dir = temp_dir("checksum");
        let send_path = dir.join("payload.bin");
        fs::write(&send_path, b"abcdef").unwrap();

        let mut outgoing =
            OutgoingFile::from_path(&send_path, "c-1", 2, DEFAULT_MAX_FILE_BYTES).unwrap();
        let offer = outgoing.offer().clone();
        let mut receiver = FileReceiver::new(dir.join("recv"), DEFAULT_MAX_FILE_BYTES);
        receiver.handle("amy", FileMessage::Offer(offer)).unwrap();

        let mut result = Ok(None);
        for chunk in drain(&mut outgoing) {
            let chunk = match chunk {
                FileMessage::Chunk { file_id, index, .. } if index == 1 => {
                    FileMessage::chunk(&file_id, index, b"zz")
                }
                other => other,
            };
            result = receiver.handle("amy", chunk);
        }
        assert!(result.is_err());
    }

    #[test]
    fn chunk_without_offer_is_an_error() {
        let mut receiver = FileReceiver::new(temp_dir("orphan"), DEFAULT_MAX_FILE_BYTES);
        let err = receiver
            .handle("amy", FileMessage::chunk("nope", 0, b"x"))
            .unwrap_err();
        assert!(err.to_string().contains("unknown transfer"));
    }

    #[test]
    fn rejects_oversized_offer() {
        let offer = FileOffer {
            file_id: "big".into(),
            filename: "big.bin".into(),
            file_size: DEFAULT_MAX_FILE_BYTES + 1,
            checksum_sha256: "0".repeat(64),
            chunk_size: 1024,
            total_chunks: 2,
        };
        assert!(validate_offer(&offer, DEFAULT_MAX_FILE_BYTES).is_err());
    }

    #[test]
    fn offer_ids_cannot_escape_the_output_dir() {
        let dir = temp_dir("file-id");
        let payload = b"abc";
        let offer = |file_id: &str| FileOffer {
            file_id: file_id.into(),
            filename: "note.txt".into(),
            file_size: payload.len() as u64,
            checksum_sha256: sha256_bytes_hex(payload),
            chunk_size: 16,
            total_chunks: 1,
        };

        for bad in ["../../x", "a/b", "a\\b", "..", "", "id with space"] {
            assert!(validate_offer(&offer(bad), DEFAULT_MAX_FILE_BYTES).is_err(), "{bad:?}");
        }
        let mut receiver = FileReceiver::new(dir.join("recv"), DEFAULT_MAX_FILE_BYTES);
        assert!(receiver
            .handle("eve", FileMessage::Offer(offer("../../escape")))
            .is_err());
        assert_eq!(receiver.in_progress(), 0);
        assert!(!dir.join("escape.part").exists());

        assert!(validate_offer(
            &offer("6f1c2a1e-55b0-4a53-9d2e-8f1a3c6b7d90"),
            DEFAULT_MAX_FILE_BYTES
        )
        .is_ok());
    }

    #[test]
    fn abandoning_a_sender_removes_partial_files() {
        let dir = temp_dir("abandon");
        let recv = dir.join("recv");
        let payload = vec![1u8; 1_000];
        let offer = FileOffer {
            file_id: "p-1".into(),
            filename: "part.bin".into(),
            file_size: 1_000,
            checksum_sha256: sha256_bytes_hex(&payload),
            chunk_size: 500,
            total_chunks: 2,
        };
        let mut receiver = FileReceiver::new(&recv, DEFAULT_MAX_FILE_BYTES);
        receiver.handle("carl", FileMessage::Offer(offer)).unwrap();
        receiver
            .handle("carl", FileMessage::chunk("p-1", 0, &payload[..500]))
            .unwrap();
        assert!(recv.join("part.bin.p-1.part").exists());

        receiver.abandon_sender("carl");
        assert_eq!(receiver.in_progress(), 0);
        assert!(!recv.join("part.bin.p-1.part").exists());
    }
}
