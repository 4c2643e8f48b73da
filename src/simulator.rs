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

use std::ffi::OsString;
use std::io::{self, BufRead, BufReader, Lines};
use std::process::{Child, ChildStdout, Command, Stdio};

use log::debug;

use crate::artifact::Artifact;
use crate::error::{CkptError, Result};

pub type Observation = Box<dyn Iterator<Item = io::Result<String>>>;

pub trait Simulator: Sync {
    /// Start `artifact` with `watch` reported on every execution. The run is
    /// stopped when the returned stream is dropped. Lines are `syscall <value>`,
    /// `execute <value>` or `exit`.
    fn observe(&self, artifact: &Artifact, watch: u64) -> Result<Observation>;

    fn verify(&self, artifact: &Artifact) -> Result<()>;
}

pub struct ExternalSimulator {
    program: OsString,
}

impl ExternalSimulator {
    pub fn new<S: Into<OsString>>(program: S) -> Self {
        ExternalSimulator { program: program.into() }
    }

    fn command(&self, artifact: &Artifact) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg(&artifact.cfg).arg(&artifact.dump);
        cmd
    }

    fn name(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }
}

struct Running {
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
}

impl Iterator for Running {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        self.lines.next()
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Simulator for ExternalSimulator {
    fn observe(&self, artifact: &Artifact, watch: u64) -> Result<Observation> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--watch").arg(format!("{:x}", watch)).arg(&artifact.cfg).arg(&artifact.dump);
        debug!("Observing {} at {:#x}", artifact.cfg.display(), watch);
        let mut child = cmd
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|err| CkptError::tool(self.name(), format!("failed to run: {}", err)))?;
        let stdout = child.stdout.take().ok_or_else(|| CkptError::tool(self.name(), "no stdout"))?;
        Ok(Box::new(Running { child, lines: BufReader::new(stdout).lines() }))
    }

    fn verify(&self, artifact: &Artifact) -> Result<()> {
        let status = self
            .command(artifact)
            .stdout(Stdio::null())
            .status()
            .map_err(|err| CkptError::tool(self.name(), format!("failed to run: {}", err)))?;
        if !status.success() {
            return Err(CkptError::tool(format!("{} {}", self.name(), artifact.cfg.display()), status));
        }
        debug!("Verified {}", artifact.cfg.display());
        Ok(())
    }
}
