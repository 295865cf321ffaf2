//! Keyboard-wedge reader subsystem.
//!
//! Reads characters from stdin or a device/pipe path, turns them into key
//! events and feeds a [`BarcodeDecoder`]. Line breaks are the terminator
//! key. Readings go to the orchestrator channel; the reader never waits for
//! a reading to be processed.

use bytes::{Buf, BytesMut};
use futures::StreamExt;
use log::{debug, info, warn};
use std::future::Future;
use std::path::PathBuf;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_graceful_shutdown::SubsystemHandle;
use tokio_util::codec::{Decoder, FramedRead};

use checkpoint_core::{BarcodeDecoder, KeyEvent, ReaderEvent};

use crate::config::ReaderConfig;
use crate::error::CheckpointError;

/// Splits raw UTF-8 input into key events, one per character.
///
/// A character split across reads stays buffered until its remaining bytes
/// arrive. `\n` and `\r` become the terminator key; malformed bytes become
/// U+FFFD.
pub struct KeyCodec {
    terminator: String,
}

impl KeyCodec {
    pub fn new(terminator: &str) -> Self {
        KeyCodec {
            terminator: terminator.to_string(),
        }
    }

    fn key(&self, ch: char) -> KeyEvent {
        match ch {
            '\n' | '\r' => KeyEvent {
                name: self.terminator.clone(),
                ch: None,
            },
            ch => KeyEvent::char(ch),
        }
    }
}

/// Length of the UTF-8 sequence starting with `first`
fn utf8_width(first: u8) -> Option<usize> {
    match first {
        0x00..=0x7F => Some(1),
        0xC2..=0xDF => Some(2),
        0xE0..=0xEF => Some(3),
        0xF0..=0xF4 => Some(4),
        _ => None,
    }
}

impl Decoder for KeyCodec {
    type Item = KeyEvent;
    type Error = CheckpointError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<KeyEvent>, CheckpointError> {
        let Some(&first) = src.first() else {
            return Ok(None);
        };
        let ch = match utf8_width(first) {
            Some(width) if src.len() < width => return Ok(None),
            Some(width) => std::str::from_utf8(&src[..width])
                .ok()
                .and_then(|s| s.chars().next())
                .map(|ch| (ch, width)),
            None => None,
        };
        let (ch, consumed) = ch.unwrap_or((char::REPLACEMENT_CHARACTER, 1));
        src.advance(consumed);
        Ok(Some(self.key(ch)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<KeyEvent>, CheckpointError> {
        match self.decode(src)? {
            Some(key) => Ok(Some(key)),
            None if src.is_empty() => Ok(None),
            None => {
                src.clear();
                Ok(Some(self.key(char::REPLACEMENT_CHARACTER)))
            }
        }
    }
}

pub struct KeyboardReader {
    input: Option<PathBuf>,
    terminator: String,
    decoder: BarcodeDecoder,
    tx: mpsc::Sender<ReaderEvent>,
}

impl KeyboardReader {
    pub fn new(
        config: &ReaderConfig,
        tx: mpsc::Sender<ReaderEvent>,
    ) -> Result<Self, CheckpointError> {
        let decoder =
            BarcodeDecoder::with_terminator(&config.validation_pattern, &config.terminator_key)?;
        let input = config
            .input
            .clone()
            .filter(|p| p.as_os_str() != "-");
        Ok(KeyboardReader {
            input,
            terminator: config.terminator_key.clone(),
            decoder,
            tx,
        })
    }

    pub async fn run(self, subsys: SubsystemHandle) -> Result<(), CheckpointError> {
        match self.input.clone() {
            Some(path) => {
                info!("Reader: reading key events from {}", path.display());
                let file = tokio::fs::File::open(&path).await.map_err(|e| {
                    CheckpointError::DeviceUnavailable(format!("{}: {}", path.display(), e))
                })?;
                self.serve(file, subsys.on_shutdown_requested()).await
            }
            None => {
                info!("Reader: reading key events from stdin");
                self.serve(tokio::io::stdin(), subsys.on_shutdown_requested())
                    .await
            }
        }
    }

    /// Read `input` until `shutdown`. At end of input the reader idles until
    /// shutdown, so a closed pipe does not stop the station.
    pub async fn serve<R: AsyncRead + Unpin>(
        mut self,
        input: R,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), CheckpointError> {
        tokio::pin!(shutdown);
        let mut keys = FramedRead::new(input, KeyCodec::new(&self.terminator));
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    debug!("Reader: shutdown requested");
                    return Ok(());
                }
                key = keys.next() => match key {
                    Some(key) => {
                        if let Some(event) = self.decoder.push(&key?) {
                            self.forward(event).await?;
                        }
                    }
                    None => {
                        info!("Reader: end of input");
                        shutdown.await;
                        return Ok(());
                    }
                },
            }
        }
    }

    async fn forward(&self, event: ReaderEvent) -> Result<(), CheckpointError> {
        match &event {
            ReaderEvent::Valid(r) => info!("Reader: valid code '{}'", r.code),
            ReaderEvent::Invalid(r) => {
                warn!("Reader: {}", CheckpointError::DecodeRejected(r.code.clone()))
            }
        }
        self.tx
            .send(event)
            .await
            .map_err(|_| CheckpointError::Shutdown)
    }
}
