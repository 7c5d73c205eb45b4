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

//! Compression of a batch's record-bytes region.
//!
//! The codec id is stored in the batch attributes, so a frame can always be
//! decoded without knowing which topic wrote it.

use std::fmt::Debug;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::message::constants::COMPRESSION_CODEC_MASK;
use crate::{AppError, AppResult};

pub trait Compressor: Send + Sync + Debug {
    fn compress(&self, data: Bytes) -> AppResult<Bytes>;
    fn decompress(&self, data: Bytes) -> AppResult<Bytes>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCompressor;

impl Compressor for NoopCompressor {
    fn compress(&self, data: Bytes) -> AppResult<Bytes> {
        Ok(data)
    }

    fn decompress(&self, data: Bytes) -> AppResult<Bytes> {
        Ok(data)
    }
}

/// LZ4 block format with the uncompressed size prepended.
#[derive(Debug, Default, Clone, Copy)]
pub struct Lz4Compressor;

impl Compressor for Lz4Compressor {
    fn compress(&self, data: Bytes) -> AppResult<Bytes> {
        Ok(Bytes::from(lz4_flex::compress_prepend_size(&data)))
    }

    fn decompress(&self, data: Bytes) -> AppResult<Bytes> {
        lz4_flex::decompress_size_prepended(&data)
            .map(Bytes::from)
            .map_err(|e| AppError::CorruptMessage(format!("lz4 decompression failed: {}", e)))
    }
}

static NOOP: NoopCompressor = NoopCompressor;
static LZ4: Lz4Compressor = Lz4Compressor;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    #[default]
    None,
    Lz4,
}

impl CompressionType {
    pub fn codec_id(self) -> u8 {
        match self {
            CompressionType::None => 0,
            CompressionType::Lz4 => 1,
        }
    }

    pub fn from_attributes(attributes: u8) -> AppResult<Self> {
        match attributes & COMPRESSION_CODEC_MASK {
            0 => Ok(CompressionType::None),
            1 => Ok(CompressionType::Lz4),
            other => Err(AppError::CorruptMessage(format!(
                "unknown compression codec id {}",
                other
            ))),
        }
    }

    pub fn compressor(self) -> &'static dyn Compressor {
        match self {
            CompressionType::None => &NOOP,
            CompressionType::Lz4 => &LZ4,
        }
    }

    pub fn is_compressed(self) -> bool {
        self != CompressionType::None
    }
}
