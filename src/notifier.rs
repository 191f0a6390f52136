//! A single thread delivering listener callbacks.
//!
//! Every resolution is posted as one [Notification], and its listeners are called one after another in registration
//! order, so listeners never run concurrently with each other and never on a worker thread.
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;
use parking_lot::Mutex;

use crate::error::panic_message;
use crate::*;

pub(crate) enum Outcome<R> {
    Loaded(Arc<R>),
    Failed,
}

pub(crate) struct Notification<R> {
    pub(crate) key: CacheKey,
    pub(crate) outcome: Outcome<R>,
    pub(crate) listeners: Vec<SharedListener<R>>,
    /// Run once every listener has been called.
    pub(crate) then: Option<Box<dyn FnOnce() + Send>>,
}

impl<R> Notification<R> {
    fn deliver(self) {
        let Notification {
            key,
            outcome,
            listeners,
            then,
        } = self;
        let (identifier, width, height) = (key.identifier(), key.width(), key.height());

        for listener in listeners {
            let called = catch_unwind(AssertUnwindSafe(|| match &outcome {
                Outcome::Loaded(resource) => listener.on_loaded(identifier, resource, width, height),
                Outcome::Failed => listener.on_failure(identifier, width, height),
            }));
            if let Err(payload) = called {
                tracing::error!(
                    identifier,
                    width,
                    height,
                    panic = %panic_message(&*payload),
                    "listener panicked"
                );
            }
        }

        if let Some(f) = then {
            f();
        }
    }
}

pub(crate) struct Notifier<R> {
    sender: Mutex<Option<Sender<Notification<R>>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<R: Send + Sync + 'static> Notifier<R> {
    pub(crate) fn spawn(name: String) -> std::io::Result<Notifier<R>> {
        let (tx, rx) = crossbeam_channel::unbounded::<Notification<R>>();
        let thread = thread::Builder::new().name(name).spawn(move || {
            for notification in rx.iter() {
                notification.deliver();
            }
        })?;

        Ok(Notifier {
            sender: Mutex::new(Some(tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Queue a notification.  Returns false if the notifier has been shut down.
    pub(crate) fn post(&self, notification: Notification<R>) -> bool {
        match self.sender.lock().as_ref() {
            Some(tx) => tx.send(notification).is_ok(),
            None => false,
        }
    }

    /// Deliver everything already posted, then stop the thread.
    pub(crate) fn shutdown(&self) {
        self.sender.lock().take();
        let handle = match self.thread.lock().take() {
            Some(h) => h,
            None => return,
        };

        // Shutting down from inside a callback; the thread exits by itself once this callback returns.
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            tracing::error!("notification thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crossbeam_channel::Receiver;

    use super::*;

    struct Recorder {
        name: &'static str,
        tx: Sender<String>,
    }

    impl BucketListener<u32> for Recorder {
        fn on_loaded(&self, identifier: &str, resource: &Arc<u32>, width: u32, height: u32) {
            let _ = self.tx.send(format!(
                "{} loaded {} {} {}x{}",
                self.name, identifier, resource, width, height
            ));
        }

        fn on_failure(&self, identifier: &str, width: u32, height: u32) {
            if self.name == "bad" {
                panic!("listener bug");
            }
            let _ = self.tx.send(format!("{} failed {} {}x{}", self.name, identifier, width, height));
        }
    }

    fn listeners(names: &[&'static str]) -> (Vec<SharedListener<u32>>, Receiver<String>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let ls = names
            .iter()
            .map(|&name| {
                Arc::new(Recorder {
                    name,
                    tx: tx.clone(),
                }) as SharedListener<u32>
            })
            .collect();
        (ls, rx)
    }

    #[test]
    fn delivers_in_registration_order() {
        let notifier = Notifier::<u32>::spawn("test-notify".into()).unwrap();
        let (ls, rx) = listeners(&["first", "second", "third"]);
        assert!(notifier.post(Notification {
            key: CacheKey::scaled("x", 3, 4).unwrap(),
            outcome: Outcome::Loaded(Arc::new(9)),
            listeners: ls,
            then: None,
        }));
        notifier.shutdown();

        let got = rx.try_iter().collect::<Vec<_>>();
        assert_eq!(
            got,
            vec!["first loaded x 9 3x4", "second loaded x 9 3x4", "third loaded x 9 3x4"]
        );
    }

    #[test]
    fn follow_up_runs_after_every_listener() {
        let notifier = Notifier::<u32>::spawn("test-notify".into()).unwrap();
        let (ls, rx) = listeners(&["bad", "good"]);
        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        let count = ls.len();
        notifier.post(Notification {
            key: CacheKey::scaled("x", 1, 1).unwrap(),
            outcome: Outcome::Failed,
            listeners: ls,
            then: Some(Box::new(move || {
                done_tx.send(count).unwrap();
            })),
        });
        notifier.shutdown();

        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec!["good failed x 1x1"]);
        assert_eq!(done_rx.try_recv(), Ok(2));
    }

    #[test]
    fn panicking_listener_does_not_stop_the_rest() {
        let notifier = Notifier::<u32>::spawn("test-notify".into()).unwrap();
        let (ls, rx) = listeners(&["bad", "good"]);
        notifier.post(Notification {
            key: CacheKey::scaled("x", 1, 1).unwrap(),
            outcome: Outcome::Failed,
            listeners: ls,
            then: None,
        });
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            "good failed x 1x1"
        );

        // The thread survived the panic.
        let (ls, rx) = listeners(&["again"]);
        notifier.post(Notification {
            key: CacheKey::scaled("y", 1, 1).unwrap(),
            outcome: Outcome::Failed,
            listeners: ls,
            then: None,
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "again failed y 1x1");
        notifier.shutdown();
        assert!(!notifier.post(Notification {
            key: CacheKey::scaled("z", 1, 1).unwrap(),
            outcome: Outcome::Failed,
            listeners: vec![],
            then: None,
        }));
    }
}
