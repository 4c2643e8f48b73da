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

use log::{debug, info};

use crate::builder::{BuildReport, Builder};
use crate::checkpoint::{Checkpoint, Repeat};
use crate::error::{CkptError, Result};
use crate::replay_table::SysCall;
use crate::simulator::Simulator;
use crate::trace::retval;

fn value(token: &str) -> Result<u64> {
    retval(token).map_err(CkptError::VerificationMismatch)
}

/// Merge the simulator's event stream with the recorded syscalls.
///
/// Every `syscall` line consumes the next recorded event, whose return value
/// must match. Every `execute` line becomes an event returning the observed
/// value in the repeat register. Observation ends on `exit`, at the end of
/// the stream, or once the repeat count is reached with no recorded syscall
/// left; the last execution is then turned into the exit.
pub fn resolve_syscalls<I>(recorded: &[SysCall], repeat: Repeat, lines: I) -> Result<Vec<SysCall>>
where
    I: IntoIterator<Item = io::Result<String>>,
{
    let mut pending = recorded.iter();
    let mut resolved = Vec::new();
    let mut executed = 0u64;
    let mut last_is_execute = false;

    for line in lines {
        let line = line?;
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens[..] {
            ["syscall", observed] => {
                let observed = value(observed)?;
                let event = pending.next().ok_or_else(|| {
                    CkptError::VerificationMismatch(format!("unrecorded syscall returning {:#x}", observed))
                })?;
                if event.retval() != Some(observed) {
                    return Err(CkptError::VerificationMismatch(format!(
                        "syscall {} observed returning {:#x}",
                        event, observed
                    )));
                }
                resolved.push(event.clone());
                last_is_execute = false
            }
            ["execute", observed] => {
                let mut event = SysCall::ret(repeat.addr, value(observed)?);
                event.alt_rd = Some(repeat.rd);
                resolved.push(event);
                executed += 1;
                last_is_execute = true
            }
            ["exit"] => break,
            _ => {
                debug!("Ignoring simulator output: {}", line);
                continue;
            }
        }
        if executed >= repeat.count && pending.len() == 0 {
            break;
        }
    }

    if executed == 0 {
        return Err(CkptError::VerificationMismatch(format!("{:#x} never executed", repeat.addr)));
    }
    if pending.len() != 0 {
        return Err(CkptError::VerificationMismatch(format!("{} recorded syscall(s) not observed", pending.len())));
    }
    if last_is_execute {
        resolved.pop();
    }
    resolved.push(SysCall::exit(repeat.addr));
    Ok(resolved)
}

/// Build both passes of a repeat checkpoint. Each pass starts from its own
/// copy of the untouched memory image.
pub fn two_pass(
    builder: &mut Builder,
    simulator: &dyn Simulator,
    ckpt: &Checkpoint,
    repeat: Repeat,
) -> Result<BuildReport> {
    let pristine = ckpt.pages.snapshot();
    let recorded = ckpt.events();

    let explore = builder.build(ckpt, pristine.snapshot(), &recorded, true, 1)?;
    let resolved = {
        let observation = simulator.observe(&explore.artifact, repeat.addr)?;
        resolve_syscalls(&recorded, repeat, observation)?
    };
    info!(
        "Checkpoint {}: {:#x} resolved into {} event(s) from {} recorded",
        ckpt.index,
        repeat.addr,
        resolved.len(),
        recorded.len()
    );

    builder.build(ckpt, pristine, &resolved, false, ckpt.final_pass())
}
