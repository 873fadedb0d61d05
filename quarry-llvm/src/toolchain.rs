//! Invocation of the external optimizer, code generator and linker.
//!
//! The module is optimized with a fixed pass pipeline, emitted as a
//! position-independent object, then linked into a shared library by the
//! host C compiler. Artifacts live in a scratch directory owned by the
//! backend instance and disappear with it.

use std::path::{Path, PathBuf};
use std::process::Command;

use quarry_khir::BackendError;
use tracing::debug;

const PASSES: &str = "instcombine,reassociate,gvn,simplifycfg,adce,simplifycfg";

/// Whether the host toolchain is present.
pub fn available() -> bool {
    let probe = |cmd: &str, arg: &str| {
        Command::new(cmd)
            .arg(arg)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    };
    probe("opt", "--version") && probe("llc", "--version") && probe("cc", "--version")
}

fn run(cmd: &mut Command) -> Result<(), BackendError> {
    let rendered = format!("{cmd:?}");
    debug!(command = %rendered, "toolchain step");
    let output = cmd
        .output()
        .map_err(|e| BackendError::BackendBuildFailed(format!("{rendered}: {e}")))?;
    if !output.status.success() {
        return Err(BackendError::BackendBuildFailed(format!(
            "{rendered}: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

/// `module.ll` → optimized object → shared library; returns the library
/// path.
pub fn build_dylib(scratch: &Path, module_text: &str) -> Result<PathBuf, BackendError> {
    let ll = scratch.join("module.ll");
    let opt_ll = scratch.join("module.opt.ll");
    let object = scratch.join("module.o");
    let dylib = scratch.join("module.so");

    std::fs::write(&ll, module_text)
        .map_err(|e| BackendError::BackendBuildFailed(format!("write module: {e}")))?;

    run(Command::new("opt")
        .arg("-S")
        .arg(format!("-passes={PASSES}"))
        .arg(&ll)
        .arg("-o")
        .arg(&opt_ll))?;

    run(Command::new("llc")
        .arg("-relocation-model=pic")
        .arg("-filetype=obj")
        .arg(&opt_ll)
        .arg("-o")
        .arg(&object))?;

    run(Command::new("cc").arg("-shared").arg(&object).arg("-o").arg(&dylib))?;

    Ok(dylib)
}
