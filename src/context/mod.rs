//! 会话上下文：工作目录、用户、主机、shell 与最近执行的命令
//!
//! 每个会话持有一份快照，超过 TTL 后在下一次解释前刷新；最近命令为有界环形队列。

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use gethostname::gethostname;
use nix::unistd::{Uid, User};
use serde::Serialize;

/// 对端进程身份（来自 Unix socket 凭据）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PeerIdentity {
    pub pid: Option<i32>,
    pub uid: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Context {
    pub current_directory: String,
    pub username: String,
    pub hostname: String,
    pub shell: String,
    pub pid: Option<i32>,
    pub uid: Option<u32>,
    pub recent_commands: VecDeque<String>,
    pub last_update: DateTime<Utc>,
    #[serde(skip)]
    history_capacity: usize,
    #[serde(skip)]
    ttl: Duration,
}

impl Context {
    pub fn gather(peer: PeerIdentity, history_capacity: usize, ttl: Duration) -> Self {
        let mut ctx = Self {
            current_directory: String::new(),
            username: String::new(),
            hostname: String::new(),
            shell: String::new(),
            pid: peer.pid,
            uid: peer.uid,
            recent_commands: VecDeque::with_capacity(history_capacity.min(64)),
            last_update: Utc::now(),
            history_capacity: history_capacity.max(1),
            ttl,
        };
        ctx.refresh();
        ctx
    }

    /// 是否超过 TTL
    pub fn is_stale(&self) -> bool {
        self.is_stale_at(Utc::now())
    }

    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.last_update);
        age.to_std().map_or(false, |age| age > self.ttl)
    }

    /// 过期时刷新，返回是否刷新
    pub fn refresh_if_stale(&mut self) -> bool {
        if self.is_stale() {
            self.refresh();
            true
        } else {
            false
        }
    }

    /// 重新读取系统信息（保留最近命令）
    pub fn refresh(&mut self) {
        self.current_directory = peer_cwd(self.pid)
            .or_else(|| std::env::current_dir().ok())
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "/".to_string());
        // 对端 uid 未知时取守护进程自身的用户
        let uid = self.uid.unwrap_or_else(|| Uid::current().as_raw());
        match lookup_user(uid) {
            Some(user) => {
                self.username = user.name;
                self.shell = user.shell.display().to_string();
            }
            None => {
                self.username = format!("uid:{}", uid);
                self.shell = "/bin/sh".to_string();
            }
        }
        self.hostname = gethostname()
            .into_string()
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "localhost".to_string());
        self.last_update = Utc::now();
    }

    /// 记录一条已执行命令，超出容量时丢弃最旧的
    pub fn push_command(&mut self, command: &str) {
        if self.recent_commands.len() >= self.history_capacity {
            self.recent_commands.pop_front();
        }
        self.recent_commands.push_back(command.to_string());
    }

    /// 提示词使用的一行摘要
    pub fn summary(&self) -> String {
        let mut summary = format!(
            "User: {}@{} in {}",
            self.username, self.hostname, self.current_directory
        );
        if !self.recent_commands.is_empty() {
            let recent: Vec<&str> = self
                .recent_commands
                .iter()
                .rev()
                .take(5)
                .map(String::as_str)
                .collect();
            summary.push_str("; recent: ");
            summary.push_str(&recent.join(" | "));
        }
        summary
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

fn peer_cwd(pid: Option<i32>) -> Option<PathBuf> {
    let pid = pid?;
    std::fs::read_link(format!("/proc/{}/cwd", pid)).ok()
}

/// 经 NSS（getpwuid_r）解析 uid，LDAP / sssd 用户同样可见
fn lookup_user(uid: u32) -> Option<User> {
    match User::from_uid(Uid::from_raw(uid)) {
        Ok(user) => user,
        Err(e) => {
            tracing::debug!(uid, error = %e, "user lookup failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(capacity: usize) -> Context {
        Context::gather(PeerIdentity::default(), capacity, Duration::from_secs(5))
    }

    #[test]
    fn test_history_ring_bounded() {
        let mut ctx = ctx(50);
        for i in 0..60 {
            ctx.push_command(&format!("cmd {}", i));
        }
        assert_eq!(ctx.recent_commands.len(), 50);
        assert_eq!(ctx.recent_commands.front().unwrap(), "cmd 10");
        assert_eq!(ctx.recent_commands.back().unwrap(), "cmd 59");
    }

    #[test]
    fn test_staleness() {
        let ctx = ctx(10);
        assert!(!ctx.is_stale_at(ctx.last_update + chrono::Duration::seconds(4)));
        assert!(ctx.is_stale_at(ctx.last_update + chrono::Duration::seconds(6)));
    }

    #[test]
    fn test_refresh_keeps_history() {
        let mut ctx = ctx(10);
        ctx.push_command("ls");
        ctx.last_update = Utc::now() - chrono::Duration::seconds(60);
        assert!(ctx.refresh_if_stale());
        assert_eq!(ctx.recent_commands.len(), 1);
        assert!(!ctx.refresh_if_stale());
    }

    #[test]
    fn test_summary_format() {
        let mut ctx = ctx(10);
        ctx.username = "bob".into();
        ctx.hostname = "box".into();
        ctx.current_directory = "/srv".into();
        assert_eq!(ctx.summary(), "User: bob@box in /srv");
        ctx.push_command("ls");
        ctx.push_command("pwd");
        assert_eq!(ctx.summary(), "User: bob@box in /srv; recent: pwd | ls");
    }

    #[test]
    fn test_peer_uid_resolved_by_uid_not_environment() {
        let root = Context::gather(
            PeerIdentity { pid: None, uid: Some(0) },
            10,
            Duration::from_secs(5),
        );
        assert_eq!(root.username, "root");
        assert!(!root.shell.is_empty());

        // 没有账户的 uid 不会回落到守护进程自己的用户名
        let ghost = Context::gather(
            PeerIdentity { pid: None, uid: Some(4_000_000_000) },
            10,
            Duration::from_secs(5),
        );
        assert_eq!(ghost.username, "uid:4000000000");
        assert!(!ghost.hostname.is_empty());
    }

    #[test]
    fn test_json_fields() {
        let json = ctx(10).to_json();
        assert!(json.get("current_directory").is_some());
        assert!(json.get("recent_commands").unwrap().is_array());
        assert!(json.get("history_capacity").is_none());
    }
}
