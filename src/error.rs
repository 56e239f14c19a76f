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

use thiserror::Error;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, MediaError>;

/// Errors that can occur while demuxing, decoding or buffering media.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// The system wasn't able to allocate the required memory.
    #[error("out of memory")]
    OutOfMemory,

    /// The requested action is not supported (e.g. an unknown MIME type).
    #[error("not supported")]
    NotSupported,

    /// The container data was in an invalid format.
    #[error("invalid container data")]
    InvalidContainerData,

    /// There was an error in the codec data.
    #[error("invalid codec data")]
    InvalidCodecData,

    /// The input contained multiplexed content, which isn't supported; each
    /// pipeline handles exactly one elementary stream.
    #[error("multiplexed content found")]
    MultiplexedContentFound,

    /// The input stream didn't have any elementary streams.
    #[error("no streams found")]
    NoStreamsFound,

    /// The media stack this pipeline belonged to has been detached and
    /// destroyed.
    #[error("pipeline detached")]
    Detached,

    /// The demuxer hit the end of its internal stream.  This is expected
    /// during shutdown, but is an internal error otherwise.
    #[error("end of stream")]
    EndOfStream,

    /// Unable to initialize the decoder.
    #[error("decoder failed to initialize")]
    DecoderFailedInit,

    /// The codec in the content didn't match the value the decoder was
    /// initialized with.
    #[error("decoder codec mismatch")]
    DecoderMismatch,

    /// The decryption key for a frame wasn't found.  This error isn't
    /// fatal; once the CDM gets the required key, decoding can continue.
    #[error("decryption key not found")]
    KeyNotFound,

    /// An unknown error occurred; details are in the log.
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl MediaError {
    /// Whether the caller should retry the operation later rather than
    /// tearing the pipeline down.  Only `KeyNotFound` qualifies: the decode
    /// loop retries it once key availability changes.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, MediaError::KeyNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_not_found_is_recoverable() {
        assert!(MediaError::KeyNotFound.is_recoverable());
        assert!(!MediaError::DecoderFailedInit.is_recoverable());
        assert!(!MediaError::Unknown("boom".into()).is_recoverable());
    }

    #[test]
    fn displays_diagnostic_detail() {
        let err = MediaError::Unknown("avcodec returned -22".into());
        assert_eq!(err.to_string(), "unknown error: avcodec returned -22");
    }
}
