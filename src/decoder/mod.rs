/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! Decoder orchestration.
//!
//! [`FrameDecoder`] sits between the encoded buffer and a host-provided
//! [`DecoderBackend`] (the actual codec).  It handles everything the codec
//! itself should not have to: reconfiguration when the stream changes
//! mid-playback (adaptation), decryption through the CDM, the feed/drain
//! backpressure dance, and reconstructing output timestamps.

pub mod thread;

pub use thread::{DecoderHooks, DecoderThread};

use std::sync::Arc;

use crate::error::{MediaError, Result};
use crate::frame::{DecodedFrame, EncodedFrame, PixelFormat, StreamInfo};

/// Result of handing a packet to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// The packet was accepted.
    Ok,
    /// The backend's input queue is full; drain some output and resend.
    TryAgain,
    /// The backend is mid-flush and accepts no more input.  The decoder
    /// must be reconfigured before it can be used again.
    Flushing,
}

/// Result of asking the backend for a decoded picture.
pub enum ReceiveStatus {
    Frame(RawDecodedFrame),
    /// No picture ready; feed more input (or, during a flush, the backend
    /// is fully drained).
    TryAgain,
}

/// A decoded picture as produced by the backend, before timestamp
/// reconstruction.
pub struct RawDecodedFrame {
    pub format: PixelFormat,
    pub planes: Vec<Vec<u8>>,
    pub strides: Vec<usize>,
    /// The picture's presentation time in offset-free media time, if the
    /// backend tracked it through reordering.
    pub timestamp: Option<f64>,
}

/// A synchronous codec implementation.  Only used from a single worker
/// thread after construction.
pub trait DecoderBackend: Send + 'static {
    /// (Re)configures for the given stream, discarding prior state.
    fn configure(&mut self, info: &StreamInfo) -> Result<()>;

    /// Feeds one compressed packet, or `None` to begin a flush.
    fn send_packet(&mut self, data: Option<&[u8]>) -> Result<SendStatus>;

    /// Pulls the next decoded picture if one is ready.
    fn receive_frame(&mut self) -> Result<ReceiveStatus>;

    /// Drops configuration and any buffered pictures.
    fn reset(&mut self);
}

/// Outcome of a CDM decrypt call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptStatus {
    Success,
    /// The needed key has not arrived yet; the caller may retry later.
    KeyNotFound,
    FatalError,
}

/// A content decryption module.  May be called from the decoder thread.
pub trait Cdm: Send + Sync + 'static {
    /// Decrypts `frame`'s payload into `output`.
    fn decrypt(&self, frame: &EncodedFrame, output: &mut Vec<u8>) -> DecryptStatus;
}

/// Drives a [`DecoderBackend`] one encoded frame at a time.
pub struct FrameDecoder {
    backend: Box<dyn DecoderBackend>,
    /// The stream the backend is currently configured for; `None` when the
    /// backend holds no usable configuration.
    configured_info: Option<Arc<StreamInfo>>,
    /// Timestamp offset of the last fed frame, for reconstructing output
    /// times of pictures that surface during a flush.
    prev_timestamp_offset: f64,
}

impl FrameDecoder {
    pub fn new(backend: Box<dyn DecoderBackend>) -> Self {
        Self {
            backend,
            configured_info: None,
            prev_timestamp_offset: 0.0,
        }
    }

    /// Decodes one encoded frame, or flushes the backend when `frame` is
    /// `None`.  Returns the decoded pictures that became available, which
    /// can be none (codec delay) or several (adaptation drain, flush).
    pub fn decode_frame(
        &mut self,
        frame: Option<&Arc<EncodedFrame>>,
        cdm: Option<&dyn Cdm>,
    ) -> Result<Vec<Arc<DecodedFrame>>> {
        let mut decoded = Vec::new();

        if frame.is_none() && self.configured_info.is_none() {
            // Nothing configured means nothing to flush.
            return Ok(decoded);
        }

        if let Some(frame) = frame {
            if self.configured_info.as_ref() != Some(&frame.stream_info) {
                log::debug!("reconfiguring decoder for {}", frame.stream_info.codec);
                if self.configured_info.is_some() {
                    // Drain the old stream's pictures before dropping its
                    // configuration.  They belong to the previous stream,
                    // so their timestamps use the previous offset.
                    self.backend.send_packet(None)?;
                    self.drain(None, &mut decoded)?;
                }
                self.backend.configure(&frame.stream_info)?;
                self.configured_info = Some(Arc::clone(&frame.stream_info));
            }
            self.prev_timestamp_offset = frame.timestamp_offset;
        }

        // Decrypt into scratch space; the buffered frame stays untouched so
        // a later re-decode (e.g. after seeking back) works the same way.
        let mut scratch = Vec::new();
        let payload: Option<&[u8]> = match frame {
            Some(f) if f.is_encrypted => {
                let Some(cdm) = cdm else {
                    log::warn!("no CDM given for encrypted frame, pts={}", f.pts);
                    return Err(MediaError::KeyNotFound);
                };
                match cdm.decrypt(f, &mut scratch) {
                    DecryptStatus::Success => Some(scratch.as_slice()),
                    DecryptStatus::KeyNotFound => return Err(MediaError::KeyNotFound),
                    DecryptStatus::FatalError => {
                        return Err(MediaError::Unknown("frame decryption failed".to_string()))
                    }
                }
            }
            Some(f) => Some(f.data.as_slice()),
            None => None,
        };

        loop {
            match self.backend.send_packet(payload)? {
                SendStatus::Ok => {
                    self.drain(frame, &mut decoded)?;
                    break;
                }
                SendStatus::TryAgain => {
                    // Input full; make room and resend.
                    self.drain(frame, &mut decoded)?;
                }
                SendStatus::Flushing => {
                    // The flush completed; the backend can't be reused
                    // until it is reconfigured.
                    self.backend.reset();
                    self.configured_info = None;
                    break;
                }
            }
        }

        Ok(decoded)
    }

    /// Discards the backend configuration and buffered pictures, e.g. when
    /// seeking to an unrelated position.
    pub fn reset(&mut self) {
        self.backend.reset();
        self.configured_info = None;
    }

    fn drain(
        &mut self,
        source: Option<&Arc<EncodedFrame>>,
        out: &mut Vec<Arc<DecodedFrame>>,
    ) -> Result<()> {
        loop {
            let raw = match self.backend.receive_frame()? {
                ReceiveStatus::TryAgain => return Ok(()),
                ReceiveStatus::Frame(raw) => raw,
            };

            let offset = source.map_or(self.prev_timestamp_offset, |f| f.timestamp_offset);
            let pts = match raw.timestamp {
                Some(t) => t + offset,
                None => match source {
                    Some(f) => f.pts,
                    None => {
                        log::warn!("flushed picture has no timestamp, using offset {offset}");
                        offset
                    }
                },
            };

            let stream_info = match source {
                Some(f) => Arc::clone(&f.stream_info),
                // Drained pictures belong to the currently configured stream.
                None => Arc::clone(self.configured_info.as_ref().ok_or_else(|| {
                    MediaError::Unknown("picture produced by unconfigured decoder".to_string())
                })?),
            };

            out.push(Arc::new(DecodedFrame {
                stream_info,
                pts,
                duration: source.map_or(0.0, |f| f.duration),
                format: raw.format,
                planes: raw.planes,
                strides: raw.strides,
            }));
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::frame::test_support::stream_info;

    fn encoded(pts: f64, payload_time: u8) -> Arc<EncodedFrame> {
        Arc::new(EncodedFrame {
            stream_info: stream_info(),
            pts,
            dts: pts,
            duration: 0.1,
            is_key_frame: true,
            data: vec![payload_time],
            is_encrypted: false,
            timestamp_offset: 0.0,
        })
    }

    #[test]
    fn configures_backend_on_first_frame() {
        let mut decoder = FrameDecoder::new(Box::new(FakeBackend::new(0)));
        let frame = encoded(0.0, 0);

        let decoded = decoder.decode_frame(Some(&frame), None).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].pts, 0.0);
    }

    #[test]
    fn reconfigures_on_stream_info_change() {
        let mut decoder = FrameDecoder::new(Box::new(FakeBackend::new(0)));
        decoder
            .decode_frame(Some(&encoded(0.0, 0)), None)
            .unwrap();

        let new_info = Arc::new(StreamInfo {
            codec: "vp9".to_string(),
            width: 640,
            height: 480,
            extra_data: vec![],
        });
        let adapted = Arc::new(EncodedFrame {
            stream_info: new_info,
            pts: 0.1,
            dts: 0.1,
            duration: 0.1,
            is_key_frame: true,
            data: vec![1],
            is_encrypted: false,
            timestamp_offset: 0.0,
        });

        let decoded = decoder.decode_frame(Some(&adapted), None).unwrap();
        // No old pictures were pending, so only the new one comes out.
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].stream_info.width, 640);
    }

    #[test]
    fn adaptation_drains_old_stream_first() {
        // Delay of 2 keeps pictures inside the backend until flushed.
        let mut decoder = FrameDecoder::new(Box::new(FakeBackend::new(2)));
        assert!(decoder
            .decode_frame(Some(&encoded(0.0, 0)), None)
            .unwrap()
            .is_empty());
        assert!(decoder
            .decode_frame(Some(&encoded(0.1, 1)), None)
            .unwrap()
            .is_empty());

        let new_info = Arc::new(StreamInfo {
            codec: "vp9".to_string(),
            width: 640,
            height: 480,
            extra_data: vec![],
        });
        let adapted = Arc::new(EncodedFrame {
            stream_info: Arc::clone(&new_info),
            pts: 0.2,
            dts: 0.2,
            duration: 0.1,
            is_key_frame: true,
            data: vec![2],
            is_encrypted: false,
            timestamp_offset: 0.0,
        });

        let decoded = decoder.decode_frame(Some(&adapted), None).unwrap();
        // Both old-stream pictures drain out ahead of the new frame's.
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].pts, 0.0);
        assert_eq!(decoded[1].pts, 0.1);
        assert_eq!(decoded[0].stream_info.width, 320);
    }

    #[test]
    fn flush_emits_pending_and_requires_reconfigure() {
        let mut decoder = FrameDecoder::new(Box::new(FakeBackend::new(2)));
        decoder.decode_frame(Some(&encoded(0.0, 0)), None).unwrap();
        decoder.decode_frame(Some(&encoded(0.1, 1)), None).unwrap();

        let flushed = decoder.decode_frame(None, None).unwrap();
        assert_eq!(flushed.len(), 2);

        // A second flush is a no-op on an unconfigured decoder.
        assert!(decoder.decode_frame(None, None).unwrap().is_empty());
    }

    #[test]
    fn flush_on_empty_decoder_is_noop() {
        let mut decoder = FrameDecoder::new(Box::new(FakeBackend::new(0)));
        assert!(decoder.decode_frame(None, None).unwrap().is_empty());
    }

    #[test]
    fn uses_input_pts_when_backend_loses_timestamp() {
        let mut decoder = FrameDecoder::new(Box::new(FakeBackend::new(0)));
        // A payload of [0] makes the fake report Some(0.0); craft a frame
        // with an empty payload so the backend reports no timestamp.
        let frame = Arc::new(EncodedFrame {
            stream_info: stream_info(),
            pts: 7.5,
            dts: 7.5,
            duration: 0.1,
            is_key_frame: true,
            data: vec![],
            is_encrypted: false,
            timestamp_offset: 0.0,
        });

        let decoded = decoder.decode_frame(Some(&frame), None).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].pts, 7.5);
    }

    #[test]
    fn applies_timestamp_offset_to_backend_times() {
        let mut decoder = FrameDecoder::new(Box::new(FakeBackend::new(0)));
        let frame = Arc::new(EncodedFrame {
            stream_info: stream_info(),
            pts: 10.5,
            dts: 10.5,
            duration: 0.1,
            is_key_frame: true,
            // Backend reports media time 0.5; offset of 10 shifts it.
            data: vec![5],
            is_encrypted: false,
            timestamp_offset: 10.0,
        });

        let decoded = decoder.decode_frame(Some(&frame), None).unwrap();
        assert_eq!(decoded[0].pts, 10.5);
    }

    #[test]
    fn encrypted_frame_without_cdm_is_key_not_found() {
        let mut decoder = FrameDecoder::new(Box::new(FakeBackend::new(0)));
        let frame = Arc::new(EncodedFrame {
            stream_info: stream_info(),
            pts: 0.0,
            dts: 0.0,
            duration: 0.1,
            is_key_frame: true,
            data: vec![0],
            is_encrypted: true,
            timestamp_offset: 0.0,
        });

        let result = decoder.decode_frame(Some(&frame), None);
        assert!(matches!(result, Err(MediaError::KeyNotFound)));
    }

    #[test]
    fn encrypted_frame_decodes_once_key_arrives() {
        use std::sync::Mutex;

        let mut decoder = FrameDecoder::new(Box::new(FakeBackend::new(0)));
        let cdm = FakeCdm {
            known: Mutex::new(false),
        };
        let frame = Arc::new(EncodedFrame {
            stream_info: stream_info(),
            pts: 0.0,
            dts: 0.0,
            duration: 0.1,
            is_key_frame: true,
            data: vec![0],
            is_encrypted: true,
            timestamp_offset: 0.0,
        });

        let result = decoder.decode_frame(Some(&frame), Some(&cdm));
        assert!(matches!(result, Err(MediaError::KeyNotFound)));

        *cdm.known.lock().unwrap() = true;
        let decoded = decoder.decode_frame(Some(&frame), Some(&cdm)).unwrap();
        assert_eq!(decoded.len(), 1);
    }
}
