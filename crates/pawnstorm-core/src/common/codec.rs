//! Newline-delimited JSON framing for [`Message`]s.
//!
//! TCP has no message boundaries, so every message is written as one compact
//! JSON object followed by `\n`. The decoder yields `Result<Message>` items:
//! a frame that fails to decode (bad JSON, unknown tag, over the size limit)
//! is surfaced as an item-level error and the stream keeps going, while the
//! codec's own error type is reserved for transport failures.

use crate::{Error, Result, messages::Message, types::DEFAULT_MAX_FRAME_BYTES};
use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

#[derive(Debug, Clone)]
pub struct MessageCodec {
    lines: LinesCodec,
    max_frame_bytes: usize,
}

impl MessageCodec {
    /// Creates a codec that discards any frame longer than `max_frame_bytes`.
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_frame_bytes),
            max_frame_bytes,
        }
    }

    pub const fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    fn frame(&self, decoded: core::result::Result<Option<String>, LinesCodecError>) -> Step {
        match decoded {
            Ok(Some(line)) if line.trim().is_empty() => Step::Skip,
            Ok(Some(line)) => Step::Yield(Some(Message::decode(&line))),
            Ok(None) => Step::Yield(None),
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                Step::Yield(Some(Err(Error::FrameTooLarge {
                    max: self.max_frame_bytes,
                })))
            }
            Err(LinesCodecError::Io(e)) => Step::Fail(e.into()),
        }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

enum Step {
    Skip,
    Yield(Option<Result<Message>>),
    Fail(Error),
}

impl Decoder for MessageCodec {
    type Item = Result<Message>;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            let decoded = self.lines.decode(src);
            match self.frame(decoded) {
                Step::Skip => {}
                Step::Yield(item) => return Ok(item),
                Step::Fail(e) => return Err(e),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            let decoded = self.lines.decode_eof(src);
            match self.frame(decoded) {
                Step::Skip => {}
                Step::Yield(item) => return Ok(item),
                Step::Fail(e) => return Err(e),
            }
        }
    }
}

impl Encoder<&Message> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, item: &Message, dst: &mut BytesMut) -> Result<()> {
        let line = item.encode()?;
        if line.len() > self.max_frame_bytes {
            return Err(Error::FrameTooLarge {
                max: self.max_frame_bytes,
            });
        }
        self.lines.encode(line, dst).map_err(|e| match e {
            LinesCodecError::Io(e) => Error::Io(e),
            LinesCodecError::MaxLineLengthExceeded => Error::FrameTooLarge {
                max: self.max_frame_bytes,
            },
        })
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        Encoder::<&Message>::encode(self, &item, dst)
    }
}
