//! TCP daemon: accept connections and run one blocking session per connection.

use anyhow::{Context, Result};
use std::future::Future;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::activity::ActivityRegistry;
use crate::config::DaemonConfig;
use crate::error::{is_consistency_error, is_protocol_error};
use crate::session::{run_session, SessionOutcome};

/// Shared by every connection of one daemon.
#[derive(Clone)]
pub struct ServerContext {
    pub config: Arc<DaemonConfig>,
    pub activity: ActivityRegistry,
}

impl ServerContext {
    pub fn new(config: DaemonConfig) -> Self {
        Self {
            config: Arc::new(config),
            activity: ActivityRegistry::new(),
        }
    }
}

/// Bind the configured address and serve until Ctrl-C.
pub async fn serve(config: DaemonConfig) -> Result<()> {
    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("bind {}", config.bind))?;
    let ctx = ServerContext::new(config);
    serve_on(listener, ctx, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    })
    .await
}

/// Accept on `listener` until `shutdown` resolves. Sessions already running
/// are left to finish on their blocking threads.
pub async fn serve_on<F>(listener: TcpListener, ctx: ServerContext, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    info!(
        addr = %listener.local_addr()?,
        partitions = ctx.config.partitions.len(),
        "failover daemon listening"
    );
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, ctx).await {
                        error!(%peer, error = %format!("{:#}", e), "connection failed");
                    }
                });
            }
        }
    }
}

async fn handle_connection(stream: tokio::net::TcpStream, peer: SocketAddr, ctx: ServerContext) -> Result<()> {
    debug!(%peer, "connection accepted");
    let stream = stream.into_std()?;
    stream.set_nonblocking(false)?;
    tune_socket(&stream);

    let outcome = tokio::task::spawn_blocking(move || serve_connection(stream, &ctx)).await?;
    match outcome {
        Ok(outcome) => {
            for server in &outcome.restart_servers {
                info!(%peer, source = %outcome.params.source, server = %server, "restart required");
            }
            // .deleted removal keeps running detached
            drop(outcome.removal);
            Ok(())
        }
        Err(e) if is_protocol_error(&e) => {
            warn!(%peer, error = %format!("{:#}", e), "protocol violation, connection closed");
            Ok(())
        }
        Err(e) if is_consistency_error(&e) => {
            error!(%peer, error = %format!("{:#}", e), "inconsistent destination, connection closed");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn serve_connection(stream: TcpStream, ctx: &ServerContext) -> Result<SessionOutcome> {
    let reader = stream.try_clone().context("clone socket")?;
    run_session(reader, stream, &ctx.config, &ctx.activity)
}

/// Nagle off and TCP keepalive on, so a vanished peer eventually fails the session.
#[allow(unused_variables)]
pub(crate) fn tune_socket(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    #[cfg(unix)]
    {
        use std::os::fd::AsRawFd;
        let fd = stream.as_raw_fd();
        let set = |level: libc::c_int, name: libc::c_int, value: libc::c_int| unsafe {
            libc::setsockopt(
                fd,
                level,
                name,
                &value as *const _ as *const libc::c_void,
                std::mem::size_of_val(&value) as libc::socklen_t,
            )
        };
        let _ = set(libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1);
        #[cfg(target_os = "linux")]
        {
            let _ = set(libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, 60);
            let _ = set(libc::IPPROTO_TCP, libc::TCP_KEEPINTVL, 10);
            let _ = set(libc::IPPROTO_TCP, libc::TCP_KEEPCNT, 6);
        }
        let buffer: libc::c_int = 4 * 1024 * 1024;
        let _ = set(libc::SOL_SOCKET, libc::SO_SNDBUF, buffer);
        let _ = set(libc::SOL_SOCKET, libc::SO_RCVBUF, buffer);
    }
}
