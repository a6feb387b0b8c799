//! Program identity taken from the argument array.
//!
//! Call [`init`] once at the top of `main()`; the rest of the crate (and
//! the program's own logging) can then name the process without threading
//! strings around. Identity is process-wide by nature, so it lives in a
//! `OnceLock` rather than on any particular reactor instance.

use std::sync::OnceLock;

#[derive(Debug)]
struct Identity {
    program: String,
    package_string: String,
}

static IDENTITY: OnceLock<Identity> = OnceLock::new();

/// Records the program and package identity.
///
/// `argv0` is reduced to its basename; a leading `-` (login shell
/// convention) is stripped when there is no directory part. The first
/// call wins; later calls are ignored.
pub fn init(argv0: &str, package: &str, version: &str) {
    let program = basename(argv0);
    IDENTITY.get_or_init(|| Identity {
        program: program.to_owned(),
        package_string: compose_package_string(program, package, version),
    });
}

/// The program name recorded by [`init`], if any.
pub fn program_name() -> Option<&'static str> {
    IDENTITY.get().map(|identity| identity.program.as_str())
}

/// Human-readable program/version string, `"prog (package version)"`, or
/// just `"package version"` when the program and package names match.
pub fn package_string() -> Option<&'static str> {
    IDENTITY
        .get()
        .map(|identity| identity.package_string.as_str())
}

fn basename(argv0: &str) -> &str {
    match argv0.rsplit_once('/') {
        Some((_, name)) => name,
        None => argv0.strip_prefix('-').unwrap_or(argv0),
    }
}

fn compose_package_string(program: &str, package: &str, version: &str) -> String {
    if program == package {
        format!("{package} {version}")
    } else {
        format!("{program} ({package} {version})")
    }
}
