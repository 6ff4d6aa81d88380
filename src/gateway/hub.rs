//! 会话管理器：Unix socket 监听循环与会话 worker
//!
//! - 每个连接占用会话表的一个槽位，由独立的 tokio 任务串行处理该连接上的请求
//! - 表满时立即关闭连接，不写任何字节
//! - 关闭时停止 accept，等待所有 worker 完成当前步骤并退出（逐个 join）

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

use super::dispatcher::Dispatcher;
use super::message::Response;
use super::session::{Session, SessionTicket};
use crate::context::PeerIdentity;
use crate::core::{DaemonError, DaemonState};

/// 会话管理器
pub struct SessionManager {
    state: Arc<DaemonState>,
    listener: UnixListener,
    socket_path: PathBuf,
}

impl SessionManager {
    /// 绑定 socket；残留的 socket 文件会被删除
    pub fn bind(state: Arc<DaemonState>, socket_path: impl AsRef<Path>) -> Result<Self, DaemonError> {
        let socket_path = socket_path.as_ref().to_path_buf();
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }
        if let Some(parent) = socket_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let listener = UnixListener::bind(&socket_path)?;
        set_socket_permissions(&socket_path);
        tracing::info!(socket = %socket_path.display(), max_sessions = state.sessions.capacity(), "daemon listening");
        Ok(Self {
            state,
            listener,
            socket_path,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// 运行 accept 循环直到关闭信号，然后 join 所有 worker
    pub async fn serve(self) -> Result<(), DaemonError> {
        let token = self.state.shutdown.token();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => self.accept(stream),
                    Err(e) => {
                        tracing::error!(error = %e, "accept error");
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    }
                },
            }
        }

        let handles = self.state.sessions.drain_handles();
        tracing::info!(workers = handles.len(), "stopping, waiting for session workers");
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "session worker panicked");
            }
        }

        drop(self.listener);
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            tracing::debug!(error = %e, "socket file already gone");
        }
        tracing::info!("session manager stopped");
        Ok(())
    }

    fn accept(&self, stream: UnixStream) {
        let peer = peer_identity(&stream);
        let state = Arc::clone(&self.state);
        let spawned = self.state.sessions.try_spawn(peer, move |ticket| {
            tokio::spawn(run_session(state, stream, ticket))
        });
        match spawned {
            Some(ticket) => {
                tracing::info!(session = %ticket.id, slot = ticket.index, pid = ?peer.pid, uid = ?peer.uid, "session opened");
            }
            None => {
                // 闭包未被调用，stream 随之释放，连接关闭
                self.state.counters.rejected();
                tracing::warn!(pid = ?peer.pid, uid = ?peer.uid, "session table full, connection rejected");
            }
        }
    }
}

fn peer_identity(stream: &UnixStream) -> PeerIdentity {
    match stream.peer_cred() {
        Ok(cred) => PeerIdentity {
            pid: cred.pid(),
            uid: Some(cred.uid()),
        },
        Err(_) => PeerIdentity::default(),
    }
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666)) {
        tracing::warn!(error = %e, "failed to set socket permissions");
    }
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) {}

/// 会话 worker：逐行读取请求，逐个处理并回复
async fn run_session(state: Arc<DaemonState>, stream: UnixStream, ticket: SessionTicket) {
    let token = state.shutdown.token();
    let dispatcher = Dispatcher::new(Arc::clone(&state));
    let mut session = Session::new(
        ticket.id,
        ticket.peer,
        state.settings.history_capacity,
        state.settings.context_ttl,
    );

    let (reader, mut writer) = stream.into_split();
    let mut frames = FramedRead::new(
        reader,
        LinesCodec::new_with_max_length(state.settings.max_request_bytes),
    );

    loop {
        // 只在等待下一条消息时响应关闭；已读到的请求会处理完并回复
        let frame = tokio::select! {
            _ = token.cancelled() => break,
            frame = frames.next() => frame,
        };
        let response = match frame {
            None => break,
            Some(Ok(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                dispatcher.handle_line(&mut session, &line).await
            }
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                state.counters.request();
                Response::error("Request too long")
            }
            Some(Err(LinesCodecError::Io(e))) => {
                tracing::debug!(session = %ticket.id, error = %e, "read error");
                break;
            }
        };
        if let Err(e) = writer.write_all(response.to_line().as_bytes()).await {
            tracing::debug!(session = %ticket.id, error = %e, "write error");
            break;
        }
    }

    let _ = writer.shutdown().await;
    state.sessions.release(&ticket);
    tracing::info!(session = %ticket.id, requests = session.requests, "session closed");
}
