//! Event emitters: background producers that watch local state and push
//! proactive notifications upstream through the Prime client.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use alfred_protocol::Event;

pub mod filewatcher;
pub mod resource;

/// Callback invoked for every emitted event. Callbacks must not block the
/// emitter: the Prime client's callback enqueues onto a channel and returns.
pub type EventCallback = Arc<dyn Fn(Event) + Send + Sync>;

/// A long-running event producer. `run` observes until the token is
/// cancelled, reporting observations through `Manager::emit`, and must
/// notice cancellation within one tick.
pub trait Emitter: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    fn run(
        self: Arc<Self>,
        manager: Arc<Manager>,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Tracks emitters and callbacks and fans events out between them.
#[derive(Default)]
pub struct Manager {
    emitters: RwLock<Vec<Arc<dyn Emitter>>>,
    callbacks: RwLock<Vec<EventCallback>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Manager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_emitter(&self, emitter: Arc<dyn Emitter>) {
        self.emitters.write().unwrap().push(emitter);
    }

    pub fn on_event<F>(&self, callback: F)
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        self.callbacks.write().unwrap().push(Arc::new(callback));
    }

    /// Fan an event out to every registered callback, one task per callback,
    /// with the callback list copied out from under the lock first.
    pub fn emit(&self, event: Event) {
        let callbacks = self.callbacks.read().unwrap().clone();
        for callback in callbacks {
            let event = event.clone();
            tokio::spawn(async move { callback(event) });
        }
    }

    /// Spawn every registered emitter, driven by children of `cancel`.
    pub fn start(self: Arc<Self>, cancel: &CancellationToken) {
        let emitters = self.emitters.read().unwrap().clone();
        let mut handles = self.handles.lock().unwrap();
        for emitter in emitters {
            info!(emitter = emitter.name(), "starting emitter");
            let fut = emitter.run(self.clone(), cancel.child_token());
            handles.push(tokio::spawn(fut));
        }
    }

    /// Await emitter exit; call after cancelling the token passed to
    /// `start`.
    pub async fn join(&self) {
        let handles: Vec<_> = self.handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}
