//! A dedicated thread that owns a collaborator proxy.
//!
//! The proxy is constructed, used and dropped on the worker thread only.
//! Callers post closures and block until the worker hands back the result.

use std::fmt::Display;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("failed to spawn worker thread `{0}`: {1}")]
    Spawn(String, std::io::Error),
    #[error("worker thread `{0}` failed to create its proxy: {1}")]
    ProxyCreation(String, String),
    #[error("worker thread `{0}` is gone")]
    Disconnected(String),
}

pub type Result<T, E = ServiceError> = core::result::Result<T, E>;

type Job<P> = Box<dyn FnOnce(&mut P) + Send>;

pub struct ServiceThread<P: ?Sized + 'static> {
    name: String,
    sender: Option<mpsc::Sender<Job<P>>>,
    handle: Option<JoinHandle<()>>,
}

impl<P: ?Sized + 'static> ServiceThread<P> {
    /// Starts the worker and builds the proxy on it. Returns once the proxy
    /// exists, or with the factory's error if it could not be built.
    pub fn spawn<F, E>(name: &str, factory: F) -> Result<Self>
    where
        F: FnOnce() -> core::result::Result<Box<P>, E> + Send + 'static,
        E: Display,
    {
        let (sender, receiver) = mpsc::channel::<Job<P>>();
        let (ready_sender, ready_receiver) = mpsc::sync_channel::<Result<(), String>>(1);
        let thread_name = name.to_owned();
        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let span = tracing::debug_span!("service_thread", name = %thread_name);
                let _entered = span.enter();
                let mut proxy = match factory() {
                    Ok(proxy) => proxy,
                    Err(e) => {
                        ready_sender.send(Err(e.to_string())).ok();
                        return;
                    }
                };
                ready_sender.send(Ok(())).ok();
                tracing::debug!("proxy ready");
                for job in receiver {
                    job(&mut *proxy);
                }
                drop(proxy);
                tracing::debug!("proxy released");
            })
            .map_err(|e| ServiceError::Spawn(name.to_owned(), e))?;

        match ready_receiver.recv() {
            Ok(Ok(())) => Ok(Self {
                name: name.to_owned(),
                sender: Some(sender),
                handle: Some(handle),
            }),
            Ok(Err(message)) => {
                handle.join().ok();
                Err(ServiceError::ProxyCreation(name.to_owned(), message))
            }
            Err(_) => {
                handle.join().ok();
                Err(ServiceError::Disconnected(name.to_owned()))
            }
        }
    }

    /// Runs `f` against the proxy on the worker thread and waits for its result.
    pub fn call<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut P) -> R + Send + 'static,
        R: Send + 'static,
    {
        let disconnected = || ServiceError::Disconnected(self.name.clone());
        let sender = self.sender.as_ref().ok_or_else(disconnected)?;
        let (reply_sender, reply_receiver) = mpsc::sync_channel(1);
        sender
            .send(Box::new(move |proxy: &mut P| {
                reply_sender.send(f(proxy)).ok();
            }))
            .map_err(|_| disconnected())?;
        reply_receiver.recv().map_err(|_| disconnected())
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<P: ?Sized + 'static> Drop for ServiceThread<P> {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop, which drops the proxy.
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Worker thread `{}` panicked", self.name);
            }
        }
    }
}
