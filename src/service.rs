use anyhow::Context;
use std::future::Future;
use std::pin::Pin;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{error, info, trace};

type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

enum ServiceMsg {
    Task(Task),
    Shutdown,
}

/// Posting handle for the streaming service. All stream and destination mutation funnels
///  through here: tasks run one at a time, in posting order, on the dedicated service
///  thread - which is what makes the stream tables and the lease-set swap race-free.
#[derive(Clone)]
pub struct Service {
    tx: mpsc::UnboundedSender<ServiceMsg>,
}

impl Service {
    pub fn post(&self, task: impl Future<Output = ()> + Send + 'static) {
        if self.tx.send(ServiceMsg::Task(Box::pin(task))).is_err() {
            trace!("service is stopped - dropping posted task");
        }
    }
}

/// The dedicated thread driving the service queue on a current-thread runtime.
pub struct ServiceThread {
    service: Service,
    handle: Option<JoinHandle<()>>,
}

impl ServiceThread {
    pub fn spawn() -> anyhow::Result<ServiceThread> {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = std::thread::Builder::new()
            .name("streaming-service".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!("cannot build service runtime: {}", e);
                        return;
                    }
                };
                runtime.block_on(async move {
                    info!("streaming service started");
                    while let Some(msg) = rx.recv().await {
                        match msg {
                            ServiceMsg::Task(task) => task.await,
                            ServiceMsg::Shutdown => break,
                        }
                    }
                    info!("streaming service stopped");
                });
            })
            .context("spawning the streaming service thread")?;

        Ok(ServiceThread {
            service: Service { tx },
            handle: Some(handle),
        })
    }

    pub fn service(&self) -> Service {
        self.service.clone()
    }

    /// Stops the service after all previously posted tasks have run, and joins the thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.service.tx.send(ServiceMsg::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("streaming service thread panicked");
            }
        }
    }
}

impl Drop for ServiceThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[test]
    fn test_tasks_run_in_posting_order() {
        let service_thread = ServiceThread::spawn().unwrap();
        let service = service_thread.service();

        let order = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = oneshot::channel();

        for i in 0..100 {
            let order = order.clone();
            service.post(async move {
                order.lock().unwrap().push(i);
            });
        }
        service.post(async move {
            let _ = done_tx.send(());
        });

        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            tokio::time::timeout(Duration::from_secs(5), done_rx).await.unwrap().unwrap();
        });

        assert_eq!(*order.lock().unwrap(), (0..100).collect::<Vec<_>>());
        service_thread.stop();
    }

    #[test]
    fn test_stop_runs_pending_tasks_first() {
        let service_thread = ServiceThread::spawn().unwrap();
        let service = service_thread.service();

        let ran = Arc::new(Mutex::new(false));
        {
            let ran = ran.clone();
            service.post(async move {
                *ran.lock().unwrap() = true;
            });
        }
        service_thread.stop();

        assert!(*ran.lock().unwrap());
    }

    #[test]
    fn test_post_after_stop_is_harmless() {
        let service_thread = ServiceThread::spawn().unwrap();
        let service = service_thread.service();
        service_thread.stop();

        service.post(async {});
    }
}
