// BSD 2-Clause License
//
// Copyright (c) 2020 Brian Campbell
//
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
// 1. Redistributions of source code must retain the above copyright
// notice, this list of conditions and the following disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright
// notice, this list of conditions and the following disclaimer in the
// documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT
// LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR
// A PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT
// HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT
// LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE,
// DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY
// THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT
// (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
// OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CkptError {
    /// Unrecognised trace record or truncated page data. Fatal for the
    /// whole run.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("cannot reserve {size} bytes near {target:#x}")]
    AllocationFailure { target: u64, size: u64 },

    #[error("jump displacement {offset} is not encodable")]
    EncodingOverflow { offset: i64 },

    /// The observed run of a checkpoint disagreed with the recorded trace.
    #[error("verification mismatch: {0}")]
    VerificationMismatch(String),

    #[error("{tool} failed: {status}")]
    ExternalToolFailure { tool: String, status: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl CkptError {
    pub fn malformed<S: Into<String>>(msg: S) -> Self {
        CkptError::MalformedInput(msg.into())
    }

    pub fn tool<S: Into<String>, T: ToString>(tool: S, status: T) -> Self {
        CkptError::ExternalToolFailure { tool: tool.into(), status: status.to_string() }
    }
}

pub type Result<T> = std::result::Result<T, CkptError>;
