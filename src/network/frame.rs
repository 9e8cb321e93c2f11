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

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::{AppError, AppResult};

/// Length of the type tag at the head of every binary message.
pub const TYPE_LENGTH: usize = 2;

/// Closed set of binary payload types.
///
/// The numeric codes are part of the wire format and must never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum DataType {
    Text = 0x0000,
    Zip = 0x0010,
}

impl DataType {
    pub const ALL: [DataType; 2] = [DataType::Text, DataType::Zip];

    pub fn to_code(self) -> u16 {
        self as u16
    }

    /// Maps a numeric code back to its type. Codes outside the table are an error,
    /// never coerced.
    pub fn from_code(code: i32) -> AppResult<DataType> {
        match code {
            0x0000 => Ok(DataType::Text),
            0x0010 => Ok(DataType::Zip),
            _ => Err(AppError::FrameDecode(code)),
        }
    }

    /// Reads the big-endian type tag from the first two bytes.
    pub fn from_bytes(header: &[u8]) -> AppResult<DataType> {
        if header.len() < TYPE_LENGTH {
            return Err(AppError::MalformedRequest(format!(
                "frame of {} bytes has no type tag",
                header.len()
            )));
        }
        let code = u16::from_be_bytes([header[0], header[1]]);
        DataType::from_code(code as i32)
    }

    pub fn to_bytes(self) -> [u8; TYPE_LENGTH] {
        self.to_code().to_be_bytes()
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Text => write!(f, "TEXT"),
            DataType::Zip => write!(f, "ZIP"),
        }
    }
}

/// One decoded binary message: its type and the payload that followed the tag.
#[derive(Clone, PartialEq, Eq)]
pub struct Data {
    data_type: DataType,
    payload: Bytes,
}

impl Data {
    pub fn new(data_type: DataType, payload: impl Into<Bytes>) -> Self {
        Data {
            data_type,
            payload: payload.into(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Data::new(DataType::Text, Bytes::from(text.into()))
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// `[type:2 BE][payload]`
    pub fn encode(&self) -> Bytes {
        let mut buffer = BytesMut::with_capacity(TYPE_LENGTH + self.payload.len());
        buffer.put_u16(self.data_type.to_code());
        buffer.put_slice(&self.payload);
        buffer.freeze()
    }

    /// Splits the type tag off `frame`; the remaining bytes become the payload unchanged.
    pub fn decode(frame: &Bytes) -> AppResult<Data> {
        let data_type = DataType::from_bytes(frame)?;
        Ok(Data {
            data_type,
            payload: frame.slice(TYPE_LENGTH..),
        })
    }
}

impl fmt::Debug for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type={}, data={}", self.data_type, self.payload.len())
    }
}
