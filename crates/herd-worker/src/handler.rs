//! The unit of work run inside each instance.

use thiserror::Error;

/// Why [`Handler::start`] returned early.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Exit the worker with this status, without calling [`Handler::stop`]
    #[error("exit requested with status {0}")]
    Exit(i32),

    /// The handler failed; the worker calls [`Handler::stop`] and exits with 1
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// A long-running piece of work.
///
/// The handler value is built in the supervisor and copied into every forked
/// worker, so state set before [`Service::start`](crate::Service::start) is
/// visible in the child. Nothing flows back.
///
/// [`stop`](Handler::stop) and [`report`](Handler::report) run on the worker's
/// control thread while [`start`](Handler::start) blocks the main thread.
pub trait Handler: Send + Sync + 'static {
    /// Run the work. Returning `Ok` exits the worker with status 0.
    fn start(&self) -> Result<(), HandlerError>;

    /// Make [`start`](Handler::start) return soon.
    fn stop(&self);

    /// Current status, sent to the supervisor on request.
    fn report(&self) -> serde_json::Value;

    /// Label used in reports. Defaults to the type name.
    fn name(&self) -> String {
        let full = std::any::type_name::<Self>();
        let base = full.split('<').next().unwrap_or(full);
        base.rsplit("::").next().unwrap_or(base).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Idle;

    impl Handler for Idle {
        fn start(&self) -> Result<(), HandlerError> {
            Ok(())
        }

        fn stop(&self) {}

        fn report(&self) -> serde_json::Value {
            serde_json::Value::Null
        }
    }

    struct Wrapper<T>(T);

    impl<T: Send + Sync + 'static> Handler for Wrapper<T> {
        fn start(&self) -> Result<(), HandlerError> {
            Err(HandlerError::Exit(3))
        }

        fn stop(&self) {}

        fn report(&self) -> serde_json::Value {
            serde_json::Value::Null
        }
    }

    #[test]
    fn test_default_name() {
        assert_eq!(Idle.name(), "Idle");
        assert_eq!(Wrapper(Idle).name(), "Wrapper");
    }

    #[test]
    fn test_errors() {
        assert!(matches!(Wrapper(1u8).start(), Err(HandlerError::Exit(3))));

        let err: HandlerError = anyhow::anyhow!("disk full").into();
        assert_eq!(err.to_string(), "disk full");
    }
}
