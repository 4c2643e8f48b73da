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

use log::{error, info};

use simpoint_ckpt::batch::{Batch, BatchOpts};
use simpoint_ckpt::codegen::MakeToolchain;
use simpoint_ckpt::simulator::ExternalSimulator;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let code = ckptgen_main();
    exit(code)
}

fn default_codegen_dir() -> PathBuf {
    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("trampolines")))
        .unwrap_or_else(|| PathBuf::from("trampolines"))
}

fn ckptgen_main() -> i32 {
    let args: Vec<String> = env::args().collect();
    let mut opts = getopts::Options::new();
    opts.optopt("", "exec", "control-flow instruction index for basic block vectors", "<file>");
    opts.optopt("j", "jobs", "number of checkpoints built in parallel (1 default)", "<number>");
    opts.optflag("r", "rebuild", "rebuild checkpoints that already exist");
    opts.optflag("v", "verify", "run every finished checkpoint in the simulator");
    opts.optopt("", "codegen-dir", "directory holding the trampoline Makefile (CKPT_CODEGEN_DIR)", "<dir>");
    opts.optopt("", "simulator", "simulator to observe and verify checkpoints with (CKPT_SIMULATOR)", "<program>");
    opts.optflag("h", "help", "print this help message");

    let matches = match opts.parse(&args[1..]) {
        Ok(matches) => matches,
        Err(f) => {
            eprintln!("{}", f);
            return 1;
        }
    };
    if matches.opt_present("help") || matches.free.len() != 1 {
        let brief = format!("Usage: {} [options] <trace log>", args[0]);
        eprint!("{}", opts.usage(&brief));
        return if matches.opt_present("help") { 0 } else { 1 };
    }

    let jobs = match matches.opt_get_default("jobs", 1usize) {
        Ok(jobs) if jobs > 0 => jobs,
        _ => {
            eprintln!("--jobs must be a positive number");
            return 1;
        }
    };
    let codegen_dir = matches
        .opt_str("codegen-dir")
        .or_else(|| env::var("CKPT_CODEGEN_DIR").ok())
        .map(PathBuf::from)
        .unwrap_or_else(default_codegen_dir);
    let simulator = matches
        .opt_str("simulator")
        .or_else(|| env::var("CKPT_SIMULATOR").ok())
        .unwrap_or_else(|| "ckpt-sim".to_string());

    let batch_opts = BatchOpts {
        log: PathBuf::from(&matches.free[0]),
        exec: matches.opt_str("exec").map(PathBuf::from),
        jobs,
        rebuild: matches.opt_present("rebuild"),
        verify: matches.opt_present("verify"),
    };
    info!(
        "Building checkpoints from {} with {} job(s), trampolines from {}",
        batch_opts.log.display(),
        jobs,
        codegen_dir.display()
    );

    let toolchain = MakeToolchain::new(codegen_dir);
    let simulator = ExternalSimulator::new(simulator);
    match Batch::new(&batch_opts, &toolchain, &simulator).and_then(|batch| batch.run()) {
        Ok(summary) => {
            info!("Complete, {} checkpoint(s) built, {} skipped", summary.built, summary.skipped);
            0
        }
        Err(err) => {
            error!("{}", err);
            1
        }
    }
}
