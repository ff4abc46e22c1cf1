//! Named breakpoints for driving interleavings in tests.
//!
//! Code under test calls [`PauseClient::wait`] at interesting points. In
//! production builds the client is a no-op. In tests a [`PauseController`]
//! registers labels up front, blocks until the tested code reaches one of
//! them and then decides when (and how) it resumes, optionally injecting an
//! error through [`PauseGuard::inject_error`].

/// What the tested code should do after resuming from a breakpoint.
#[derive(Default, Debug)]
pub enum Fault {
    #[default]
    Noop,
    Error(anyhow::Error),
}

impl Fault {
    pub fn into_result(self) -> anyhow::Result<()> {
        match self {
            Fault::Noop => Ok(()),
            Fault::Error(e) => Err(e),
        }
    }
}

#[cfg(any(test, feature = "testing"))]
mod test_pause {
    use std::{
        collections::BTreeMap,
        sync::Arc,
    };

    use parking_lot::Mutex;
    use tokio::sync::{
        mpsc,
        oneshot,
    };

    use super::Fault;

    type Resume = oneshot::Sender<Fault>;

    #[derive(Default, Clone)]
    pub struct PauseClient {
        breakpoints: Arc<Mutex<BTreeMap<&'static str, mpsc::Sender<Resume>>>>,
    }

    impl PauseClient {
        /// A client with no registered breakpoints. Every `wait` returns
        /// immediately.
        pub fn new() -> Self {
            Self::default()
        }

        /// Park at `label` until the controller releases it. Unregistered
        /// labels and vanished controllers resume immediately.
        pub async fn wait(&self, label: &'static str) -> Fault {
            let Some(sender) = self.breakpoints.lock().get(label).cloned() else {
                tracing::debug!("Skipping unregistered breakpoint {label:?}");
                return Fault::Noop;
            };
            let (resume_tx, resume_rx) = oneshot::channel();
            if sender.send(resume_tx).await.is_err() {
                tracing::info!("Controller for {label:?} went away, continuing");
                self.close(label);
                return Fault::Noop;
            }
            tracing::info!("Paused at {label}");
            match resume_rx.await {
                Ok(fault) => {
                    tracing::info!("Resumed from {label}");
                    fault
                },
                Err(_) => {
                    tracing::info!("Breakpoint {label:?} dropped without resuming");
                    Fault::Noop
                },
            }
        }

        /// Stop honouring `label`; later `wait`s on it return immediately.
        pub fn close(&self, label: &'static str) {
            self.breakpoints.lock().remove(label);
        }
    }

    pub struct PauseController {
        breakpoints: BTreeMap<&'static str, mpsc::Receiver<Resume>>,
    }

    /// Held while the tested code is parked. Dropping it resumes the code.
    pub struct PauseGuard {
        label: &'static str,
        resume: Option<Resume>,
        fault: Fault,
    }

    impl PauseGuard {
        pub fn label(&self) -> &'static str {
            self.label
        }

        /// Make the parked `wait` return this error once unpaused.
        pub fn inject_error(&mut self, error: anyhow::Error) {
            self.fault = Fault::Error(error);
        }

        pub fn unpause(&mut self) {
            let Some(resume) = self.resume.take() else {
                return;
            };
            let fault = std::mem::take(&mut self.fault);
            if resume.send(fault).is_err() {
                tracing::info!("Waiter on {:?} is gone", self.label);
            }
        }
    }

    impl Drop for PauseGuard {
        fn drop(&mut self) {
            if self.resume.is_some() {
                tracing::info!("Unpausing {:?} on drop", self.label);
                self.unpause();
            }
        }
    }

    impl PauseController {
        pub fn new(labels: impl IntoIterator<Item = &'static str>) -> (Self, PauseClient) {
            let mut breakpoints = BTreeMap::new();
            let client = PauseClient::new();
            for label in labels {
                let (tx, rx) = mpsc::channel(1);
                breakpoints.insert(label, rx);
                client.breakpoints.lock().insert(label, tx);
            }
            (Self { breakpoints }, client)
        }

        /// Block until the tested code parks at `label`. Returns `None` if
        /// the label is unknown or every client has gone away.
        pub async fn wait_for_blocked(&mut self, label: &'static str) -> Option<PauseGuard> {
            let receiver = self.breakpoints.get_mut(label)?;
            let resume = receiver.recv().await?;
            Some(PauseGuard {
                label,
                resume: Some(resume),
                fault: Fault::Noop,
            })
        }
    }

}
#[cfg(any(test, feature = "testing"))]
pub use self::test_pause::{
    PauseClient,
    PauseController,
    PauseGuard,
};

#[cfg(not(any(test, feature = "testing")))]
mod prod_pause {
    use super::Fault;

    #[derive(Default, Clone)]
    pub struct PauseClient;

    impl PauseClient {
        pub fn new() -> Self {
            Self
        }

        pub async fn wait(&self, _label: &'static str) -> Fault {
            Fault::Noop
        }

        pub fn close(&self, _label: &'static str) {}
    }
}
#[cfg(not(any(test, feature = "testing")))]
pub use self::prod_pause::PauseClient;
