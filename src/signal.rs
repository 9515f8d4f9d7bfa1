//! Process signal setup.

/// Ignore SIGPIPE process-wide so writes to a closed peer surface as EPIPE
/// through the ordinary error return path instead of killing the process.
pub fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// Run `f` on the first Ctrl-C.
pub fn on_shutdown(f: impl FnMut() + Send + 'static) {
    ctrlc::set_handler(f).expect("failed to set signal handler");
}
