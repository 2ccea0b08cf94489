use log::error;

use crate::common::Failure;

/// Receives the reason whenever a worker, callback or store fails.
///
/// Called synchronously from the supervisor thread. A panic inside
/// `handle` is caught by the supervisor and logged instead.
pub trait FailureReporter: Send + 'static {
    /// Handles one failure.
    fn handle(&mut self, failure: &Failure);
}

/// Default reporter: writes every failure to the `log` facade at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl FailureReporter for LogReporter {
    fn handle(&mut self, failure: &Failure) {
        error!("{}", failure);
    }
}

impl<F> FailureReporter for F
where
    F: FnMut(&Failure) + Send + 'static,
{
    fn handle(&mut self, failure: &Failure) {
        self(failure)
    }
}
