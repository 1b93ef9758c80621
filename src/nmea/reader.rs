// src/nmea/reader.rs
//! Buffered sentence extraction from a live transport

use std::io;
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::{GpsError, Result};
use crate::nmea::sentence::{parse_sentence, verify_checksum, Sentence};
use crate::transport::Transport;

const READ_CHUNK: usize = 512;

/// Longest run of unframed bytes tolerated before the buffer is trimmed.
/// NMEA sentences top out around 82 characters; anything bigger without a
/// newline is line noise or another protocol.
const MAX_PENDING_BYTES: usize = 1024;

/// A framed sentence together with the line it was parsed from, checksum
/// included, so recorders can replay the exact device output.
#[derive(Debug, Clone)]
pub struct RawSentence {
    pub line: String,
    pub sentence: Sentence,
}

/// Pulls checksum-valid sentences out of a transport, discarding garbage
/// between frames.
pub struct SentenceReader {
    transport: Transport,
    buffer: Vec<u8>,
}

impl SentenceReader {
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            buffer: Vec::with_capacity(READ_CHUNK),
        }
    }

    /// Give the underlying transport back, dropping any partial frame.
    pub fn into_transport(self) -> Transport {
        self.transport
    }

    /// Read until one valid sentence is available. Garbage, checksum
    /// failures and unparseable lines are skipped, not surfaced; transport
    /// errors and EOF are.
    pub async fn next_sentence(&mut self) -> Result<RawSentence> {
        loop {
            while let Some(line) = self.extract_frame() {
                if !verify_checksum(&line) {
                    trace!("discarding sentence with bad checksum: {}", line);
                    continue;
                }
                match parse_sentence(&line) {
                    Ok(sentence) => return Ok(RawSentence { line, sentence }),
                    Err(e) => {
                        trace!("discarding unparseable line: {}", e);
                    }
                }
            }
            self.fill().await?;
        }
    }

    /// Watch the stream briefly and succeed on the first valid sentence.
    /// Used by protocol detection to decide whether a device speaks NMEA.
    pub async fn sniff(&mut self, window: Duration) -> Result<()> {
        match tokio::time::timeout(window, self.next_sentence()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(GpsError::timeout("sniffing for NMEA sentences", window)),
        }
    }

    async fn fill(&mut self) -> Result<()> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.transport.read(&mut chunk).await?;
        if n == 0 {
            return Err(GpsError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "transport closed",
            )));
        }
        self.buffer.extend_from_slice(&chunk[..n]);

        if self.buffer.len() > MAX_PENDING_BYTES {
            // Keep at most one partial frame: everything before the last
            // start-of-sentence marker is unrecoverable.
            match self.buffer.iter().rposition(|&b| b == b'$') {
                Some(pos) if self.buffer.len() - pos <= MAX_PENDING_BYTES => {
                    self.buffer.drain(..pos);
                }
                _ => self.buffer.clear(),
            }
            debug!("trimmed unframed input to {} bytes", self.buffer.len());
        }
        Ok(())
    }

    /// Pop the next `$`-to-newline frame off the buffer, dropping any bytes
    /// in front of the `$`. Returns `None` when no complete frame is ready.
    fn extract_frame(&mut self) -> Option<String> {
        let start = self.buffer.iter().position(|&b| b == b'$')?;
        if start > 0 {
            self.buffer.drain(..start);
        }

        let end = self.buffer.iter().position(|&b| b == b'\n')?;
        let frame: Vec<u8> = self.buffer.drain(..=end).collect();
        let line = String::from_utf8_lossy(&frame)
            .trim_end_matches(['\r', '\n'])
            .to_string();
        Some(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    const GGA: &str = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";

    fn reader_pair() -> (SentenceReader, tokio::io::DuplexStream) {
        let (near, far) = tokio::io::duplex(8192);
        (SentenceReader::new(Transport::new(near)), far)
    }

    #[tokio::test]
    async fn test_reads_framed_sentence() {
        let (mut reader, mut far) = reader_pair();
        far.write_all(format!("{}\r\n", GGA).as_bytes())
            .await
            .unwrap();

        let raw = reader.next_sentence().await.unwrap();
        assert_eq!(raw.line, GGA);
        assert!(matches!(raw.sentence, Sentence::Gga { .. }));
    }

    #[tokio::test]
    async fn test_skips_leading_garbage() {
        let (mut reader, mut far) = reader_pair();
        far.write_all(b"\xffnoise without meaning\x00\x07")
            .await
            .unwrap();
        far.write_all(format!("{}\r\n", GGA).as_bytes())
            .await
            .unwrap();

        let raw = reader.next_sentence().await.unwrap();
        assert!(matches!(raw.sentence, Sentence::Gga { .. }));
    }

    #[tokio::test]
    async fn test_reassembles_split_sentence() {
        let (mut reader, mut far) = reader_pair();
        let line = format!("{}\r\n", GGA);
        let (head, tail) = line.split_at(20);

        far.write_all(head.as_bytes()).await.unwrap();
        let pending = tokio::time::timeout(
            Duration::from_millis(50),
            reader.next_sentence(),
        )
        .await;
        assert!(pending.is_err(), "half a sentence must not parse");

        far.write_all(tail.as_bytes()).await.unwrap();
        let raw = reader.next_sentence().await.unwrap();
        assert_eq!(raw.line, GGA);
    }

    #[tokio::test]
    async fn test_skips_bad_checksum_and_recovers() {
        let (mut reader, mut far) = reader_pair();
        far.write_all(b"$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*00\r\n")
            .await
            .unwrap();
        far.write_all(format!("{}\r\n", GGA).as_bytes())
            .await
            .unwrap();

        let raw = reader.next_sentence().await.unwrap();
        assert_eq!(raw.line, GGA);
    }

    #[tokio::test]
    async fn test_eof_surfaces_as_error() {
        let (mut reader, far) = reader_pair();
        drop(far);

        let err = reader.next_sentence().await.unwrap_err();
        assert!(err.is_connection_loss());
    }

    #[tokio::test]
    async fn test_survives_large_garbage_burst() {
        let (mut reader, mut far) = reader_pair();
        far.write_all(&[b'x'; 3000]).await.unwrap();
        far.write_all(format!("{}\r\n", GGA).as_bytes())
            .await
            .unwrap();

        let raw = reader.next_sentence().await.unwrap();
        assert_eq!(raw.line, GGA);
    }

    #[tokio::test]
    async fn test_sniff_accepts_nmea_stream() {
        let (mut reader, mut far) = reader_pair();
        far.write_all(format!("junk{}\r\n", GGA).as_bytes())
            .await
            .unwrap();

        assert!(reader.sniff(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_sniff_times_out_on_non_nmea_stream() {
        let (mut reader, mut far) = reader_pair();
        far.write_all(b"SiRF binary or modem chatter, no dollar frames\n")
            .await
            .unwrap();

        let err = reader.sniff(Duration::from_millis(80)).await.unwrap_err();
        assert!(matches!(err, GpsError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_unsupported_sentences_still_frame() {
        let (mut reader, mut far) = reader_pair();
        far.write_all(b"$PSRF103,00,00,00,01*24\r\n").await.unwrap();

        let raw = reader.next_sentence().await.unwrap();
        assert!(matches!(raw.sentence, Sentence::Unsupported { .. }));
    }
}
