//! aios - 守护进程命令行客户端
//!
//! 用法：
//! ```bash
//! aios "show disk usage"           # 解释；需要确认时询问 y/n 后发送 confirm
//! aios exec "list files"           # 解释并执行（仍经过安全过滤）
//! aios status | models | context
//! aios model mistral:7b-instruct
//! aios classify "ping the gateway"
//! aios chat "what is a symlink?"
//! ```
//! socket 路径取 AIOS_SOCKET，默认 /var/run/aios.sock。

use std::path::{Path, PathBuf};

use aios::gateway::{Action, Request};
use anyhow::{bail, Context};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

const DEFAULT_SOCKET: &str = "/var/run/aios.sock";

fn parse_request(args: &[String]) -> anyhow::Result<Request> {
    let Some(first) = args.first() else {
        bail!("usage: aios <natural language command> | exec|status|models|context|model|classify|chat ...");
    };
    let rest = args[1..].join(" ");
    let request = match first.as_str() {
        "status" => Request::new(Action::Status),
        "models" => Request::new(Action::ListModels),
        "context" => Request::new(Action::GetContext),
        "model" => {
            let mut req = Request::new(Action::SetModel);
            req.model = Some(rest);
            req
        }
        "exec" => Request::new(Action::Execute).with_command(rest),
        "classify" => Request::new(Action::Classify).with_command(rest),
        "chat" => Request::new(Action::Chat).with_command(rest),
        _ => Request::new(Action::Interpret).with_command(args.join(" ")),
    };
    Ok(request)
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Connection {
    async fn open(path: &Path) -> anyhow::Result<Self> {
        let stream = UnixStream::connect(path)
            .await
            .with_context(|| format!("Failed to connect to {}", path.display()))?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    async fn call(&mut self, request: &Request) -> anyhow::Result<serde_json::Value> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;

        let mut reply = String::new();
        if self.reader.read_line(&mut reply).await? == 0 {
            bail!("daemon closed the connection (session table full?)");
        }
        Ok(serde_json::from_str(&reply)?)
    }
}

async fn ask_confirmation(interpreted: &str) -> anyhow::Result<bool> {
    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(format!("Execute `{}`? [y/N] ", interpreted).as_bytes())
        .await?;
    stdout.flush().await?;
    let mut answer = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut answer).await?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let request = parse_request(&args)?;
    let socket = std::env::var_os("AIOS_SOCKET")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET));

    let mut conn = Connection::open(&socket).await?;
    let reply = conn.call(&request).await?;
    println!("{}", serde_json::to_string_pretty(&reply)?);

    let needs_confirm = reply.get("confirmation_required").and_then(|v| v.as_bool()) == Some(true);
    let interpreted = reply
        .get("interpreted_command")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    if let (true, Some(interpreted)) = (needs_confirm, interpreted) {
        let accepted = ask_confirmation(&interpreted).await?;
        let confirm = confirm_request(&request, &reply, interpreted, accepted);
        let outcome = conn.call(&confirm).await?;
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    }
    Ok(())
}

/// 确认请求回传产生解释的后端，切换模型后反馈仍记到正确的后端
fn confirm_request(request: &Request, reply: &serde_json::Value, interpreted: String, accepted: bool) -> Request {
    let mut confirm = Request::new(Action::Confirm).with_command(request.command.clone().unwrap_or_default());
    confirm.interpreted_command = Some(interpreted);
    confirm.accepted = Some(accepted);
    confirm.backend = reply.get("backend").and_then(|v| v.as_str()).map(str::to_string);
    confirm
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_confirm_echoes_backend() {
        let request = Request::new(Action::Interpret).with_command("show disk usage");
        let reply = serde_json::json!({
            "status": "success",
            "interpreted_command": "df -h",
            "backend": "mistral:7b-instruct",
            "confirmation_required": true
        });
        let confirm = confirm_request(&request, &reply, "df -h".into(), false);
        assert_eq!(confirm.action, Action::Confirm);
        assert_eq!(confirm.command.as_deref(), Some("show disk usage"));
        assert_eq!(confirm.backend.as_deref(), Some("mistral:7b-instruct"));
        assert_eq!(confirm.accepted, Some(false));

        let bare = confirm_request(&request, &serde_json::json!({}), "df -h".into(), true);
        assert!(bare.backend.is_none());
    }

    #[test]
    fn test_parse_request() {
        assert_eq!(parse_request(&args(&["status"])).unwrap().action, Action::Status);
        let req = parse_request(&args(&["model", "phi3:mini"])).unwrap();
        assert_eq!(req.action, Action::SetModel);
        assert_eq!(req.model.as_deref(), Some("phi3:mini"));
        let req = parse_request(&args(&["show", "disk", "usage"])).unwrap();
        assert_eq!(req.action, Action::Interpret);
        assert_eq!(req.command.as_deref(), Some("show disk usage"));
        assert!(parse_request(&[]).is_err());
    }
}
