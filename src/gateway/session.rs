//! 会话管理
//!
//! `SessionTable` 是固定容量的槽位表（单锁保护），接受连接时占用一个槽位并在同一临界区内启动 worker；
//! `Session` 是 worker 独占的连接状态（身份、上下文快照、状态机当前步骤）。

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::context::{Context, PeerIdentity};

/// 请求处理状态机的步骤
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchState {
    Received,
    Parsed,
    Routed,
    BackendCalled,
    SafetyChecked,
    Executed,
    ConfirmRequired,
    Blocked,
    Responded,
}

/// 单个连接的会话状态（由其 worker 独占）
pub struct Session {
    pub id: Uuid,
    pub peer: PeerIdentity,
    pub context: Context,
    pub state: DispatchState,
    pub requests: u64,
    pub last_active: Instant,
    pub connected_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: Uuid, peer: PeerIdentity, history_capacity: usize, ttl: Duration) -> Self {
        Self {
            id,
            peer,
            context: Context::gather(peer, history_capacity, ttl),
            state: DispatchState::Responded,
            requests: 0,
            last_active: Instant::now(),
            connected_at: Utc::now(),
        }
    }

    /// 进入状态机的下一步
    pub fn transition(&mut self, next: DispatchState) {
        tracing::trace!(session = %self.id, from = ?self.state, to = ?next, "dispatch transition");
        self.state = next;
        self.last_active = Instant::now();
    }
}

/// 槽位凭证
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTicket {
    pub index: usize,
    pub id: Uuid,
    pub peer: PeerIdentity,
}

struct SessionSlot {
    id: Uuid,
    handle: Option<JoinHandle<()>>,
}

/// 固定容量的会话槽位表
pub struct SessionTable {
    slots: Mutex<Vec<Option<SessionSlot>>>,
}

impl SessionTable {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity.max(1)).map(|_| None).collect();
        Self {
            slots: Mutex::new(slots),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Option<SessionSlot>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.lock().len()
    }

    pub fn active_count(&self) -> usize {
        self.lock().iter().filter(|s| s.is_some()).count()
    }

    /// 占用空闲槽位并启动 worker；表满时返回 None，spawn 不会被调用
    pub fn try_spawn<F>(&self, peer: PeerIdentity, spawn: F) -> Option<SessionTicket>
    where
        F: FnOnce(SessionTicket) -> JoinHandle<()>,
    {
        let mut slots = self.lock();
        let index = slots.iter().position(|s| s.is_none())?;
        let ticket = SessionTicket {
            index,
            id: Uuid::new_v4(),
            peer,
        };
        // worker 的 release 需要同一把锁，因此不会早于句柄登记
        let handle = spawn(ticket);
        slots[index] = Some(SessionSlot {
            id: ticket.id,
            handle: Some(handle),
        });
        Some(ticket)
    }

    /// worker 退出时释放槽位（只释放自己的那一个）
    pub fn release(&self, ticket: &SessionTicket) {
        let mut slots = self.lock();
        if let Some(slot) = slots.get_mut(ticket.index) {
            if slot.as_ref().map_or(false, |s| s.id == ticket.id) {
                *slot = None;
            }
        }
    }

    /// 取出所有仍在运行的 worker 句柄（关闭时 join）
    pub fn drain_handles(&self) -> Vec<JoinHandle<()>> {
        self.lock()
            .iter_mut()
            .filter_map(|slot| slot.as_mut().and_then(|s| s.handle.take()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_table_bounded() {
        let table = SessionTable::new(2);
        let (tx, rx) = tokio::sync::watch::channel(false);

        let spawn_waiting = |_: SessionTicket| {
            let mut rx = rx.clone();
            tokio::spawn(async move {
                let _ = rx.changed().await;
            })
        };
        let a = table.try_spawn(PeerIdentity::default(), spawn_waiting).unwrap();
        let b = table.try_spawn(PeerIdentity::default(), spawn_waiting).unwrap();
        assert_ne!(a.index, b.index);
        assert_eq!(table.active_count(), 2);

        let mut called = false;
        let rejected = table.try_spawn(PeerIdentity::default(), |_| {
            called = true;
            tokio::spawn(async {})
        });
        assert!(rejected.is_none());
        assert!(!called);

        table.release(&a);
        assert_eq!(table.active_count(), 1);
        assert!(table.try_spawn(PeerIdentity::default(), spawn_waiting).is_some());

        tx.send(true).unwrap();
        for handle in table.drain_handles() {
            handle.await.unwrap();
        }
    }

    #[test]
    fn test_release_ignores_stale_ticket() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let table = SessionTable::new(1);
            let first = table
                .try_spawn(PeerIdentity::default(), |_| tokio::spawn(async {}))
                .unwrap();
            table.release(&first);
            let second = table
                .try_spawn(PeerIdentity::default(), |_| tokio::spawn(async {}))
                .unwrap();
            assert_eq!(first.index, second.index);

            // 旧凭证不能释放新会话
            table.release(&first);
            assert_eq!(table.active_count(), 1);
            table.release(&second);
            assert_eq!(table.active_count(), 0);
        });
    }

    #[test]
    fn test_session_transitions() {
        let mut session = Session::new(
            Uuid::new_v4(),
            PeerIdentity::default(),
            10,
            Duration::from_secs(5),
        );
        assert_eq!(session.state, DispatchState::Responded);
        session.transition(DispatchState::Received);
        session.transition(DispatchState::Parsed);
        assert_eq!(session.state, DispatchState::Parsed);
    }
}
