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

use crate::store::{AcquireResultType, StoreResponseType};

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// store errors
    #[error("parameter error: {0}")]
    ParameterError(String),

    #[error("no enough space: {0}")]
    NoSpace(String),

    #[error("offset invalid: {0}")]
    OffsetInvalid(String),

    #[error("offset out of range: {0}")]
    OffsetOutOfRange(String),

    #[error("corruption detected: {0}")]
    CorruptionDetected(String),

    #[error("disk failure: {0}")]
    DiskFailure(String),

    #[error("service not available: {0}")]
    ServiceNotAvailable(String),
}

impl From<std::num::ParseIntError> for AppError {
    fn from(value: std::num::ParseIntError) -> Self {
        AppError::InvalidValue(value.to_string())
    }
}

impl From<&AppError> for StoreResponseType {
    fn from(value: &AppError) -> Self {
        match value {
            AppError::NoSpace(_) | AppError::DiskFailure(_) | AppError::IoError(_) => {
                StoreResponseType::NoEnoughSpace
            }
            _ => StoreResponseType::ParameterError,
        }
    }
}

impl From<&AppError> for AcquireResultType {
    fn from(value: &AppError) -> Self {
        match value {
            AppError::OffsetInvalid(_) | AppError::OffsetOutOfRange(_) => {
                AcquireResultType::OffsetInvalid
            }
            _ => AcquireResultType::Error,
        }
    }
}
