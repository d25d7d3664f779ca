//! Cancellation and progress reporting for long running requests

use crossbeam_channel::Sender;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);
impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Request phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Chief,
    Pupil,
    Fit,
    Fft,
    Post,
}
impl Phase {
    /// Percent range covered by the phase
    pub fn band(&self) -> (f64, f64) {
        match self {
            Phase::Chief => (0., 5.),
            Phase::Pupil => (5., 80.),
            Phase::Fit => (80., 85.),
            Phase::Fft => (85., 95.),
            Phase::Post => (95., 100.),
        }
    }
}
impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Chief => "chief",
            Phase::Pupil => "pupil",
            Phase::Fit => "fit",
            Phase::Fft => "fft",
            Phase::Post => "post",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub percent: f64,
    pub phase: Phase,
    pub message: String,
}
impl Progress {
    /// Progress at the fraction `fraction` of `phase`
    pub fn new<S: Into<String>>(phase: Phase, fraction: f64, message: S) -> Self {
        let (lo, hi) = phase.band();
        Self {
            percent: lo + (hi - lo) * fraction.clamp(0., 1.),
            phase,
            message: message.into(),
        }
    }
}
impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:5.1}%] {}: {}", self.percent, self.phase, self.message)
    }
}

/// Progress receiver
pub trait ProgressSink: Send + Sync {
    fn report(&self, progress: Progress);
}
impl<F> ProgressSink for F
where
    F: Fn(Progress) + Send + Sync,
{
    fn report(&self, progress: Progress) {
        self(progress)
    }
}
/// Progress forwarded to a channel, dropped if the receiver is gone
pub struct ChannelSink(pub Sender<Progress>);
impl ProgressSink for ChannelSink {
    fn report(&self, progress: Progress) {
        let _ = self.0.try_send(progress);
    }
}

/// Cancellation token and progress sink of one request
#[derive(Clone, Default)]
pub struct Monitor {
    cancel: Option<CancelToken>,
    sink: Option<Arc<dyn ProgressSink>>,
}
impl Monitor {
    pub fn new(cancel: Option<CancelToken>, sink: Option<Arc<dyn ProgressSink>>) -> Self {
        Self { cancel, sink }
    }
    pub fn cancel_token(&self) -> Option<CancelToken> {
        self.cancel.clone()
    }
    pub fn sink(&self) -> Option<Arc<dyn ProgressSink>> {
        self.sink.clone()
    }
    /// Same cancellation token, no progress sink
    pub fn silent(&self) -> Self {
        Self {
            cancel: self.cancel.clone(),
            sink: None,
        }
    }
    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map_or(false, |c| c.is_cancelled())
    }
    /// Fails with [`ErrorKind::Cancelled`](crate::error::ErrorKind::Cancelled) if cancellation was requested
    pub fn check(&self, location: &'static str) -> crate::error::Result<()> {
        if self.is_cancelled() {
            log::info!("{}: cancelled", location);
            Err(crate::error::Error::cancelled(location))
        } else {
            Ok(())
        }
    }
    pub fn report<S: Into<String>>(&self, phase: Phase, fraction: f64, message: S) {
        if let Some(sink) = &self.sink {
            sink.report(Progress::new(phase, fraction, message));
        }
    }
}
impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("cancel", &self.cancel)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn bands() {
        assert_eq!(Progress::new(Phase::Pupil, 0.5, "").percent, 42.5);
        assert_eq!(Progress::new(Phase::Post, 2., "").percent, 100.);
    }

    #[test]
    fn closure_and_channel_sinks() {
        let seen = Arc::new(Mutex::new(vec![]));
        let seen_ = seen.clone();
        let monitor = Monitor::new(
            None,
            Some(Arc::new(move |p: Progress| seen_.lock().unwrap().push(p.percent))),
        );
        monitor.report(Phase::Chief, 1., "chief ray");
        assert_eq!(*seen.lock().unwrap(), vec![5.]);

        let (tx, rx) = crossbeam_channel::unbounded();
        let monitor = Monitor::new(None, Some(Arc::new(ChannelSink(tx))));
        monitor.report(Phase::Fft, 0., "fft");
        assert_eq!(rx.try_recv().unwrap().phase, Phase::Fft);
    }

    #[test]
    fn cancellation() {
        let token = CancelToken::new();
        let monitor = Monitor::new(Some(token.clone()), None);
        assert!(monitor.check("test").is_ok());
        token.cancel();
        assert_eq!(
            monitor.check("test").unwrap_err().kind,
            crate::error::ErrorKind::Cancelled
        );
    }
}
