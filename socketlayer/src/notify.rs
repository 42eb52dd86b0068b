use std::fmt::{Debug, Formatter};
use std::sync::{Arc, OnceLock};

/// What became of a notify packet. Every notify send gets exactly one outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// the peer acknowledged the packet
    Delivered,
    /// the packet was judged lost, or the connection went away before it was acknowledged
    Lost,
}

pub type NotifyCallback = Box<dyn FnOnce(NotifyOutcome) + Send>;

/// Handle to the outcome of a notify send, for callers that poll rather than register a
///  callback
#[derive(Clone)]
pub struct NotifyToken {
    outcome: Arc<OnceLock<NotifyOutcome>>,
}
impl NotifyToken {
    pub fn outcome(&self) -> Option<NotifyOutcome> {
        self.outcome.get().copied()
    }

    pub fn is_resolved(&self) -> bool {
        self.outcome.get().is_some()
    }
}
impl Debug for NotifyToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "NotifyToken({:?})", self.outcome())
    }
}

/// The sending side's end of a notify send. Resolving consumes it, so an outcome can not be
///  reported twice.
pub(crate) struct NotifyResolver {
    outcome: Arc<OnceLock<NotifyOutcome>>,
    callback: Option<NotifyCallback>,
}
impl NotifyResolver {
    pub fn new(callback: Option<NotifyCallback>) -> (NotifyResolver, NotifyToken) {
        let outcome = Arc::new(OnceLock::new());
        let resolver = NotifyResolver {
            outcome: outcome.clone(),
            callback,
        };
        (resolver, NotifyToken { outcome })
    }

    pub fn resolve(mut self, outcome: NotifyOutcome) {
        let _ = self.outcome.set(outcome);
        if let Some(callback) = self.callback.take() {
            callback(outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use rstest::rstest;

    #[rstest]
    #[case::delivered(NotifyOutcome::Delivered)]
    #[case::lost(NotifyOutcome::Lost)]
    fn test_resolve(#[case] outcome: NotifyOutcome) {
        let reported = Arc::new(Mutex::new(Vec::new()));
        let reported_2 = reported.clone();

        let (resolver, token) = NotifyResolver::new(Some(Box::new(move |o| reported_2.lock().unwrap().push(o))));
        assert!(!token.is_resolved());
        assert_eq!(token.outcome(), None);

        resolver.resolve(outcome);

        assert_eq!(token.outcome(), Some(outcome));
        assert_eq!(token.clone().outcome(), Some(outcome));
        assert_eq!(reported.lock().unwrap().as_slice(), &[outcome]);
    }

    #[test]
    fn test_resolve_without_callback() {
        let (resolver, token) = NotifyResolver::new(None);
        resolver.resolve(NotifyOutcome::Lost);
        assert_eq!(token.outcome(), Some(NotifyOutcome::Lost));
    }
}
