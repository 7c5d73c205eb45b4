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

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("channel recv error: {0}")]
    ChannelRecvError(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// commit log errors
    #[error("premature end of stream: {0}")]
    UnexpectedEof(String),

    #[error("invalid magic number: expected {expected}, got {actual}")]
    InvalidMagic { expected: u8, actual: u8 },

    #[error("CRC mismatch for batch at offset {base_offset}: stored {stored:#010x}, computed {computed:#010x}")]
    CrcMismatch {
        base_offset: u64,
        stored: u32,
        computed: u32,
    },

    #[error("corrupt message: {0}")]
    CorruptMessage(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    #[error("{0} has been disposed")]
    Disposed(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),
}

impl AppError {
    /// Truncation and corruption both mean the bytes on disk can not be trusted.
    pub fn is_data_error(&self) -> bool {
        matches!(
            self,
            AppError::UnexpectedEof(_)
                | AppError::InvalidMagic { .. }
                | AppError::CrcMismatch { .. }
                | AppError::CorruptMessage(_)
        )
    }
}
