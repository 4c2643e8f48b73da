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

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crossbeam::channel;
use log::{debug, error, info};

use crate::bbv::BasicBlockIndex;
use crate::builder::{BuildReport, Builder};
use crate::checkpoint::Checkpoint;
use crate::codegen::Toolchain;
use crate::error::Result;
use crate::page_store::PageStore;
use crate::resolver::two_pass;
use crate::simulator::Simulator;
use crate::trace::TraceReader;

#[derive(Clone, Debug)]
pub struct BatchOpts {
    pub log: PathBuf,
    /// Control-flow instruction index enabling basic block vector output.
    pub exec: Option<PathBuf>,
    pub jobs: usize,
    pub rebuild: bool,
    pub verify: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub built: usize,
    pub skipped: usize,
}

pub struct Batch<'a> {
    opts: &'a BatchOpts,
    toolchain: &'a dyn Toolchain,
    simulator: &'a dyn Simulator,
    blocks: Option<BasicBlockIndex>,
}

impl<'a> Batch<'a> {
    pub fn new(opts: &'a BatchOpts, toolchain: &'a dyn Toolchain, simulator: &'a dyn Simulator) -> Result<Self> {
        let blocks = match &opts.exec {
            Some(path) => {
                let blocks = BasicBlockIndex::load(path)?;
                info!("Loaded {} basic block(s) from {}", blocks.len(), path.display());
                Some(blocks)
            }
            None => None,
        };
        Ok(Batch { opts, toolchain, simulator, blocks })
    }

    fn skip(&self, ckpt: &Checkpoint) -> bool {
        if !self.opts.rebuild && ckpt.is_built() {
            info!("Checkpoint {} already built at {}, skipping", ckpt.index, ckpt.prefix.display());
            true
        } else {
            false
        }
    }

    /// Build every pass of one checkpoint, then verify it and write its
    /// basic block vector if asked to.
    pub fn build(&self, mut ckpt: Checkpoint) -> Result<BuildReport> {
        if let Some(blocks) = &self.blocks {
            blocks.write(&ckpt)?;
        }

        let codegen = self.toolchain.session(&ckpt.prefix)?;
        let mut builder = Builder::new(codegen.as_ref());
        let report = match ckpt.repeat() {
            Some(repeat) => two_pass(&mut builder, self.simulator, &ckpt, repeat)?,
            None => {
                let pages = std::mem::replace(&mut ckpt.pages, PageStore::new());
                builder.build(&ckpt, pages, &ckpt.events(), false, 1)?
            }
        };

        if self.opts.verify {
            self.simulator.verify(&report.artifact)?;
            info!("Checkpoint {} verified", ckpt.index);
        }
        Ok(report)
    }

    pub fn run(&self) -> Result<BatchSummary> {
        let reader = TraceReader::open(&self.opts.log)?;
        if self.opts.jobs <= 1 {
            let mut summary = BatchSummary::default();
            for ckpt in reader {
                let ckpt = ckpt?;
                if self.skip(&ckpt) {
                    summary.skipped += 1;
                    continue;
                }
                self.build(ckpt)?;
                summary.built += 1
            }
            return Ok(summary);
        }

        let failed = AtomicBool::new(false);
        let first_error = Mutex::new(None);
        let (tx, rx) = channel::bounded::<Checkpoint>(self.opts.jobs);

        let dispatched = crossbeam::thread::scope(|scope| -> Result<BatchSummary> {
            for worker in 0..self.opts.jobs {
                let rx = rx.clone();
                let (failed, first_error) = (&failed, &first_error);
                scope.spawn(move |_| {
                    for ckpt in rx.iter() {
                        if failed.load(Ordering::SeqCst) {
                            debug!("Worker {} dropping checkpoint {}", worker, ckpt.index);
                            continue;
                        }
                        let index = ckpt.index;
                        if let Err(err) = self.build(ckpt) {
                            error!("Checkpoint {} failed: {}", index, err);
                            failed.store(true, Ordering::SeqCst);
                            if let Ok(mut slot) = first_error.lock() {
                                slot.get_or_insert(err);
                            }
                        }
                    }
                });
            }
            drop(rx);

            let mut summary = BatchSummary::default();
            for ckpt in reader {
                if failed.load(Ordering::SeqCst) {
                    break;
                }
                let ckpt = ckpt?;
                if self.skip(&ckpt) {
                    summary.skipped += 1;
                    continue;
                }
                debug!("Dispatching checkpoint {}", ckpt.index);
                if tx.send(ckpt).is_err() {
                    break;
                }
                summary.built += 1
            }
            drop(tx);
            Ok(summary)
        })
        .unwrap_or_else(|panic| std::panic::resume_unwind(panic));

        let worker_error = match first_error.into_inner() {
            Ok(err) => err,
            Err(poisoned) => poisoned.into_inner(),
        };
        match worker_error {
            Some(err) => Err(err),
            None => dispatched,
        }
    }
}
