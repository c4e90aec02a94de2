//! The helper the job server interposes between itself and every job.
//!
//! Invocation:
//!
//! ```text
//! bosun-cgexec [<tasks-file> ...] -- <program> [<arg> ...]
//! ```
//!
//! Everything before the first `--` names a cgroup `tasks` file; the helper
//! writes its own pid into each one, placing itself (and therefore the
//! program it is about to become) into those cgroups. Everything after the
//! `--` is the program to exec and its arguments. If there is no `--`, all
//! arguments are treated as the program invocation and no cgroups are
//! joined.
//!
//! The exec inherits this process's environment, which the server clears
//! before spawning the helper.

use anyhow::{bail, Context as _, Result};
use bosun_util::sys::{Sys, SysReal};
use std::convert::Infallible;
use std::ffi::CString;
use std::path::Path;
use std::process;

const TASKS_FILE_MODE: u32 = 0o644;

fn run(sys: &impl Sys, args: &[String]) -> Result<Infallible> {
    let (task_files, command) = match args.iter().position(|arg| arg == "--") {
        Some(split) => (&args[..split], &args[split + 1..]),
        None => (&args[..0], args),
    };

    let pid = sys.getpid().to_string();
    for task_file in task_files {
        sys.write_file(Path::new(task_file), pid.as_bytes(), TASKS_FILE_MODE)
            .with_context(|| format!("joining cgroup via {task_file}"))?;
    }

    if command.is_empty() {
        bail!("no command provided");
    }

    let program = CString::new(command[0].as_str())?;
    let argv = command
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect::<Result<Vec<_>, _>>()?;
    let err = match sys.exec(&program, &argv, &sys.environ()) {
        Ok(never) => match never {},
        Err(err) => err,
    };
    Err(err).with_context(|| format!("executing {}", command[0]))
}

fn main() {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    match run(&SysReal, &args) {
        Ok(never) => match never {},
        Err(err) => eprintln!("bosun-cgexec: {err:#}"),
    }
    process::exit(1);
}
