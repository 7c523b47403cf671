//! Flat-file storage. The record is encoded with bincode and optionally zstd
//! compressed, then written to a temporary sibling file and renamed into place so a
//! reader never sees a partially written file.
use super::{StorageBackend, StorageError, WriteOutcome};
use crate::config::Compression;
use crate::types::SyncRecord;
use async_trait::async_trait;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

const NAME: &str = "Filesystem";

#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

struct Codec {
    compression: Compression,
    config: bincode::config::Configuration,
}

impl Codec {
    fn new(compression: Compression) -> Self {
        Codec {
            compression,
            // standard defaults to little-endian + varint
            config: bincode::config::standard(),
        }
    }

    fn write<W: Write>(&self, writer: &mut W, record: &SyncRecord) -> Result<usize, CodecError> {
        let level = match self.compression {
            Compression::None => {
                let size = bincode::serde::encode_into_std_write(record, &mut *writer, self.config)?;
                writer.flush()?;
                return Ok(size);
            }
            Compression::Zstd1 => 1,
            Compression::Zstd3 => 3,
        };

        let mut encoder = zstd::stream::write::Encoder::new(writer, level)?;
        let size = bincode::serde::encode_into_std_write(record, &mut encoder, self.config)?;
        encoder.finish()?;
        Ok(size)
    }

    fn read<R: Read>(&self, mut reader: R) -> Result<SyncRecord, CodecError> {
        match self.compression {
            Compression::None => Ok(bincode::serde::decode_from_std_read(
                &mut reader,
                self.config,
            )?),
            Compression::Zstd1 | Compression::Zstd3 => {
                let mut decoder = zstd::stream::read::Decoder::new(reader)?;
                Ok(bincode::serde::decode_from_std_read(
                    &mut decoder,
                    self.config,
                )?)
            }
        }
    }
}

pub struct FilesystemStorage {
    path: PathBuf,
    tmp_path: PathBuf,
    codec: Codec,
    // Serializes compare-and-write within this process.
    write_lock: Mutex<()>,
}

impl FilesystemStorage {
    pub fn new(base_dir: &str, filename: &str, compression: Compression) -> Self {
        let path = Path::new(base_dir).join(filename);
        let tmp_path = Path::new(base_dir).join(format!(".{filename}.tmp"));
        FilesystemStorage {
            path,
            tmp_path,
            codec: Codec::new(compression),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_record(&self) -> Result<SyncRecord, StorageError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::not_found(NAME));
            }
            Err(e) => return Err(StorageError::fetch(NAME, e)),
        };

        self.codec
            .read(bytes.as_slice())
            .map_err(|e| StorageError::malformed(NAME, e))
    }
}

#[async_trait]
impl StorageBackend for FilesystemStorage {
    fn name(&self) -> &str {
        NAME
    }

    async fn get_config(&self) -> Result<SyncRecord, StorageError> {
        self.read_record().await
    }

    async fn set_config(&self, record: &SyncRecord) -> Result<WriteOutcome, StorageError> {
        let _guard = self.write_lock.lock().await;

        match self.read_record().await {
            Ok(existing) if existing.sync_date >= record.sync_date => {
                return Ok(WriteOutcome::Skipped);
            }
            Ok(_) => {}
            Err(StorageError::NotFound { .. }) => {}
            Err(StorageError::MalformedPayload { source, .. }) => {
                tracing::warn!(
                    path = ?self.path,
                    error = %source,
                    "Overwriting unreadable config file"
                );
            }
            Err(e) => return Err(e),
        }

        let mut buffer = Vec::new();
        let size = self
            .codec
            .write(&mut buffer, record)
            .map_err(|e| StorageError::write(NAME, e))?;

        tokio::fs::write(&self.tmp_path, &buffer)
            .await
            .map_err(|e| StorageError::write(NAME, e))?;
        tokio::fs::rename(&self.tmp_path, &self.path)
            .await
            .map_err(|e| StorageError::write(NAME, e))?;

        tracing::debug!(path = ?self.path, bytes = size, "Stored config to file");

        Ok(WriteOutcome::Written)
    }
}
