pub(crate) use anyhow::Error;

pub type Result<T = (), E = Error> = core::result::Result<T, E>;

/// Prints a warning. By routing warnings through our own function, it's easier to find places that
/// issue them and to later add a flag that suppresses them.
pub(crate) fn warning(message: &str) {
    eprintln!("tinyld: warning: {message}");
}

/// Prints the error, including its context chain, then terminates the process with a non-zero
/// exit code.
pub fn report_error_and_exit(error: &Error) -> ! {
    eprintln!("tinyld: error: {error:#}");
    std::process::exit(1);
}
