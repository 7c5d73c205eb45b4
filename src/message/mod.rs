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

pub use batch_header::BatchHeader;
pub use compressor::{CompressionType, Compressor, Lz4Compressor, NoopCompressor};
pub use offset_assigner::{assign_offsets, validate_encoded_batch};
pub use record::LogRecord;
pub use record_batch::LogRecordBatch;

mod batch_header;
pub mod constants;
mod compressor;
mod offset_assigner;
mod record;
mod record_batch;
