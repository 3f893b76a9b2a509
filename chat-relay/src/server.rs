use std::{
    future::Future,
    net::{Ipv4Addr, SocketAddr},
};

use anyhow::{Context, Result};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::oneshot,
};
use tracing::{info, warn};

use crate::{
    dispatcher::{self, DispatcherConfig, DispatcherHandle},
    session::Connection,
    transfer::{FileReceiver, TransferConfig},
};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub chat_addr: SocketAddr,
    pub file_addr: SocketAddr,
    pub dispatcher: DispatcherConfig,
    pub transfer: TransferConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            chat_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080)),
            file_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8008)),
            dispatcher: DispatcherConfig::default(),
            transfer: TransferConfig::default(),
        }
    }
}

/// Both listeners plus the dispatcher, wired together.
pub struct Server {
    chat: TcpListener,
    files: FileReceiver,
    dispatcher: DispatcherConfig,
}

impl Server {
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let chat = TcpListener::bind(config.chat_addr)
            .await
            .with_context(|| format!("failed to bind chat listener on {}", config.chat_addr))?;
        let files = FileReceiver::bind(config.file_addr, config.transfer).await?;
        Ok(Self {
            chat,
            files,
            dispatcher: config.dispatcher,
        })
    }

    pub fn chat_addr(&self) -> std::io::Result<SocketAddr> {
        self.chat.local_addr()
    }

    pub fn file_addr(&self) -> std::io::Result<SocketAddr> {
        self.files.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            chat,
            files,
            dispatcher,
        } = self;
        tokio::pin!(shutdown);

        let (handle, dispatcher_task) = dispatcher::spawn(dispatcher);
        let (stop_files, files_stopped) = oneshot::channel::<()>();
        let files_task = tokio::spawn(files.run_until(async move {
            let _ = files_stopped.await;
        }));

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("server shutting down");
                    break;
                }
                accept_result = chat.accept() => {
                    if !handle_accept_result(accept_result, &handle).await {
                        break;
                    }
                }
            }
        }

        let _ = stop_files.send(());
        match files_task.await {
            Ok(result) => result?,
            Err(err) => warn!(error = ?err, "file listener task failed"),
        }

        if let Err(err) = handle.shutdown().await {
            warn!(error = ?err, "dispatcher already stopped");
        }
        drop(handle);
        if let Err(err) = dispatcher_task.await {
            warn!(error = ?err, "dispatcher task failed");
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

/// Returns `false` once the dispatcher is gone and accepting is pointless.
async fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    handle: &DispatcherHandle,
) -> bool {
    match result {
        Ok((stream, peer)) => {
            if let Err(err) = handle.join(Connection::from_tcp(stream, peer)).await {
                warn!(peer = %peer, error = ?err, "dispatcher rejected connection");
                return false;
            }
        }
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
    true
}
