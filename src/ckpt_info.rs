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

use std::env;
use std::path::PathBuf;
use std::process::exit;

use simpoint_ckpt::artifact::Artifact;
use simpoint_ckpt::checkpoint::NUM_REGS;
use simpoint_ckpt::error::Result;
use simpoint_ckpt::page_store::PageStore;

fn print_checkpoint(artifact: &Artifact, regs: bool) -> Result<()> {
    let (runs, data, regs_addr) = artifact.load()?;
    let image = PageStore::load(&runs, &data)?;
    println!("{}: {} run(s), register file at {:#x}", artifact.cfg.display(), runs.len(), regs_addr);
    for run in &runs {
        println!("  {:#x}-{:#x} at offset {:#x}", run.addr, run.addr + run.size, run.offset);
    }
    if regs {
        let words = image.read(regs_addr, NUM_REGS * 8);
        for (i, word) in words.chunks(8).enumerate() {
            let mut le = [0u8; 8];
            le.copy_from_slice(word);
            let name = if i < 32 { format!("x{}", i) } else { format!("f{}", i - 32) };
            println!("  {:>4} {:#018x}", name, u64::from_le_bytes(le));
        }
    }
    Ok(())
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let mut opts = getopts::Options::new();
    opts.optflag("r", "regs", "print the register snapshot");
    let matches = match opts.parse(&args[1..]) {
        Ok(matches) => matches,
        Err(f) => {
            eprintln!("{}", f);
            exit(1)
        }
    };
    if matches.free.is_empty() {
        eprint!("{}", opts.usage(&format!("Usage: {} [options] <config>...", args[0])));
        exit(1)
    }

    for cfg in &matches.free {
        let cfg = PathBuf::from(cfg);
        let artifact = Artifact { dump: cfg.with_extension("dump"), cfg };
        if let Err(err) = print_checkpoint(&artifact, matches.opt_present("regs")) {
            eprintln!("{}: {}", artifact.cfg.display(), err);
            exit(1)
        }
    }
}
