/// Unrecoverable failure: invalid API use, resource exhaustion, transport
/// failure or a dependency-protocol violation. One tagged diagnostic line,
/// then the process dies; the runtime has no partial-state recovery story.
#[cold]
#[track_caller]
pub(crate) fn fatal(component: &str, message: std::fmt::Arguments<'_>) -> ! {
    tracing::error!(component, %message, "fatal runtime error");
    panic!("FATAL: [{component}] {message}");
}
