use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use flow_runtime::{AdminOptions, Comms};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};
use url::Url;

use super::binder::Binding;
use crate::config::HelperConfig;
use crate::error::{HelperError, Result};

/// A listening admin server.
#[derive(Debug)]
pub(crate) struct ServerHandle {
    pub addr: SocketAddr,
    pub url: Url,
    comms: Arc<dyn Comms>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<io::Result<()>>,
}

pub(crate) async fn start(binding: &Binding, config: &HelperConfig) -> Result<ServerHandle> {
    binding.admin.init(AdminOptions::quiet())?;

    let listener = TcpListener::bind((config.address, config.port)).await?;
    let addr = listener.local_addr()?;
    let url = Url::parse(&format!("http://{addr}/"))
        .map_err(|err| HelperError::Io(io::Error::new(io::ErrorKind::InvalidInput, err)))?;

    binding.comms.start();
    let router = binding.admin.router();
    let (shutdown, signal) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = signal.await;
            })
            .await
    });

    info!(%addr, "admin server listening");
    Ok(ServerHandle {
        addr,
        url,
        comms: binding.comms.clone(),
        shutdown,
        task,
    })
}

/// Stops comms and the listener. A zero grace drops the listener and the
/// serving task at once; otherwise in-flight requests get until `grace` to
/// finish. Errors are logged, never returned.
pub(crate) async fn stop(handle: ServerHandle, grace: Duration) {
    let ServerHandle {
        addr,
        comms,
        shutdown,
        mut task,
        ..
    } = handle;

    comms.stop();
    if shutdown.send(()).is_err() {
        warn!(%addr, "admin server already gone before shutdown");
    }

    let outcome = if grace.is_zero() {
        task.abort();
        task.await
    } else {
        match timeout(grace, &mut task).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(%addr, ?grace, "admin server did not stop in time, aborting");
                task.abort();
                task.await
            }
        }
    };

    match outcome {
        Ok(Ok(())) => info!(%addr, "admin server stopped"),
        Ok(Err(err)) => warn!(%addr, "admin server failed: {err}"),
        Err(err) if err.is_cancelled() => info!(%addr, "admin server aborted"),
        Err(err) => warn!(%addr, "admin server task ended abnormally: {err}"),
    }
}
