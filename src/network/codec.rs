// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Stream framing for the two transport variants.
//!
//! Binary traffic travels as packages:
//!
//! ```text
//! |type  |length|end  |chunk        |
//! |2bytes|2bytes|1byte|<=65535 bytes|
//! ```
//!
//! `end` is `0x00` on the last package of a message and `0x01` when more
//! packages follow. The decoder glues the chunks back together and yields the
//! frame-codec form `[type:2][payload]`, leaving type validation to
//! [`Data::decode`] so an unknown type only drops that one message.
//!
//! Text traffic is delimited by `\f` or `\n`; outbound lines end with `"\f\n"`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::network::frame::{Data, TYPE_LENGTH};
use crate::{AppError, AppResult};

/// Maximum chunk carried by one package.
pub const MTU: usize = 65535;
/// `type(2) + length(2) + end(1)`
pub const HEADER_LENGTH: usize = 5;
pub const END_PACKAGE: u8 = 0x00;
pub const PACKAGE: u8 = 0x01;

pub const FORM_FEED: u8 = b'\x0c';
pub const NEW_LINE: u8 = b'\n';
pub const LINE_END: &[u8] = b"\x0c\n";

#[derive(Debug)]
pub struct PackageCodec {
    pending: Option<(u16, BytesMut)>,
    max_frame_size: usize,
}

impl PackageCodec {
    pub fn new() -> Self {
        Self::with_max_frame_size(usize::MAX)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        PackageCodec {
            pending: None,
            max_frame_size,
        }
    }
}

impl Default for PackageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PackageCodec {
    type Item = Bytes;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> AppResult<Option<Bytes>> {
        loop {
            if src.len() < HEADER_LENGTH {
                return Ok(None);
            }
            let chunk_length = u16::from_be_bytes([src[2], src[3]]) as usize;
            if src.len() < HEADER_LENGTH + chunk_length {
                src.reserve(HEADER_LENGTH + chunk_length - src.len());
                return Ok(None);
            }

            let type_code = src.get_u16();
            src.advance(2);
            let end = src.get_u8();
            let chunk = src.split_to(chunk_length);

            if end != END_PACKAGE && end != PACKAGE {
                self.pending = None;
                return Err(AppError::MalformedRequest(format!(
                    "invalid end of package flag {end:#04x}"
                )));
            }

            // continuation packages keep the type of the first one
            let (_, body) = self
                .pending
                .get_or_insert_with(|| (type_code, BytesMut::new()));
            body.extend_from_slice(&chunk);
            if body.len() > self.max_frame_size {
                let size = body.len();
                self.pending = None;
                return Err(AppError::FrameTooLarge(format!(
                    "frame of {size} bytes exceeds {}",
                    self.max_frame_size
                )));
            }

            if end == END_PACKAGE {
                if let Some((type_code, body)) = self.pending.take() {
                    let mut frame = BytesMut::with_capacity(TYPE_LENGTH + body.len());
                    frame.put_u16(type_code);
                    frame.extend_from_slice(&body);
                    return Ok(Some(frame.freeze()));
                }
            }
        }
    }
}

impl Encoder<Data> for PackageCodec {
    type Error = AppError;

    fn encode(&mut self, data: Data, dst: &mut BytesMut) -> AppResult<()> {
        encode_packages(&data, dst);
        Ok(())
    }
}

impl Encoder<&Data> for PackageCodec {
    type Error = AppError;

    fn encode(&mut self, data: &Data, dst: &mut BytesMut) -> AppResult<()> {
        encode_packages(data, dst);
        Ok(())
    }
}

/// Splits `data` into MTU sized packages. An empty payload still produces one
/// zero length final package so the peer sees the message.
pub fn encode_packages(data: &Data, dst: &mut BytesMut) {
    let type_code = data.data_type().to_code();
    let payload = data.payload();
    let packages = payload.len().div_ceil(MTU).max(1);
    dst.reserve(packages * HEADER_LENGTH + payload.len());

    let mut chunks = payload.chunks(MTU).peekable();
    if chunks.peek().is_none() {
        dst.put_u16(type_code);
        dst.put_u16(0);
        dst.put_u8(END_PACKAGE);
        return;
    }
    while let Some(chunk) = chunks.next() {
        dst.put_u16(type_code);
        dst.put_u16(chunk.len() as u16);
        dst.put_u8(if chunks.peek().is_some() {
            PACKAGE
        } else {
            END_PACKAGE
        });
        dst.put_slice(chunk);
    }
}

#[derive(Debug)]
pub struct LineCodec {
    // index already scanned for a delimiter
    next_index: usize,
    max_length: usize,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::with_max_length(usize::MAX)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        LineCodec {
            next_index: 0,
            max_length,
        }
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> AppResult<Option<String>> {
        loop {
            let offset = src[self.next_index..]
                .iter()
                .position(|b| *b == NEW_LINE || *b == FORM_FEED);

            let Some(offset) = offset else {
                self.next_index = src.len();
                if src.len() > self.max_length {
                    return Err(AppError::FrameTooLarge(format!(
                        "line of {} bytes exceeds {}",
                        src.len(),
                        self.max_length
                    )));
                }
                return Ok(None);
            };

            let end = self.next_index + offset;
            self.next_index = 0;
            let mut line = src.split_to(end + 1);
            line.truncate(end);
            if line.is_empty() {
                // "\f\n" pairs and blank lines carry nothing
                continue;
            }
            if line.len() > self.max_length {
                return Err(AppError::FrameTooLarge(format!(
                    "line of {} bytes exceeds {}",
                    line.len(),
                    self.max_length
                )));
            }
            return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
        }
    }
}

impl Encoder<String> for LineCodec {
    type Error = AppError;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> AppResult<()> {
        encode_line(line.as_bytes(), dst);
        Ok(())
    }
}

impl Encoder<&str> for LineCodec {
    type Error = AppError;

    fn encode(&mut self, line: &str, dst: &mut BytesMut) -> AppResult<()> {
        encode_line(line.as_bytes(), dst);
        Ok(())
    }
}

pub fn encode_line(line: &[u8], dst: &mut BytesMut) {
    dst.reserve(line.len() + LINE_END.len());
    dst.put_slice(line);
    dst.put_slice(LINE_END);
}
