//! 请求调度器：每个会话的请求状态机
//!
//! Received → Parsed → Routed → BackendCalled → {Success | Unsafe | Unclear | BackendFailed}
//! → [SafetyChecked → Executed | ConfirmRequired | Blocked] → Responded
//!
//! 每个终止状态恰好产生一个响应；格式错误的请求返回 error 响应，会话继续。

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::message::{
    Action, InterpretationSource, Request, Response, ResponseStatus, StatusReport,
    BACKEND_REACHABLE, BACKEND_UNREACHABLE,
};
use super::session::{DispatchState, Session};
use crate::core::{BackendError, DaemonState};
use crate::llm::{BackendConfig, InterpretOutcome, TaskClassifier};

/// status 动作探测后端的最长等待
const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);

/// 后端调用方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallMode {
    Interpret,
    Chat,
}

/// 一次解释的结果及其来源
#[derive(Debug, Clone)]
pub struct Resolution {
    pub backend: BackendConfig,
    pub outcome: InterpretOutcome,
    pub source: InterpretationSource,
}

pub struct Dispatcher {
    state: Arc<DaemonState>,
}

impl Dispatcher {
    pub fn new(state: Arc<DaemonState>) -> Self {
        Self { state }
    }

    /// 处理一行原始请求
    pub async fn handle_line(&self, session: &mut Session, line: &str) -> Response {
        session.transition(DispatchState::Received);
        session.requests += 1;
        self.state.counters.request();

        let response = match serde_json::from_str::<Request>(line) {
            Ok(request) => {
                session.transition(DispatchState::Parsed);
                self.handle(session, request).await
            }
            Err(e) => {
                tracing::debug!(session = %session.id, error = %e, "malformed request");
                Response::error(format!("Invalid request: {}", e))
            }
        };

        session.transition(DispatchState::Responded);
        response
    }

    /// 处理已解析的请求
    pub async fn handle(&self, session: &mut Session, request: Request) -> Response {
        tracing::debug!(session = %session.id, action = ?request.action, "request");
        match request.action {
            Action::Interpret => match request.command_text() {
                Some(command) => self.interpret(session, command).await,
                None => Response::error("Missing command"),
            },
            Action::Execute => match request.command_text() {
                Some(command) => self.execute_checked(session, command, None).await,
                None => Response::error("Missing command"),
            },
            Action::Confirm => self.confirm(session, &request).await,
            Action::Status => {
                let mut resp = Response::success().with_backend(self.state.router.current_name());
                resp.status_report = Some(self.status_with_health().await);
                resp.models = Some(self.state.router.snapshot());
                resp
            }
            Action::SetModel => {
                let Some(model) = request.model.as_deref().or(request.command_text()) else {
                    return Response::error("Missing model");
                };
                match self.state.router.set_backend(model) {
                    Ok(()) => {
                        self.persist_registry().await;
                        Response::success()
                            .with_message(format!("Switched to model {}", model))
                            .with_backend(model)
                    }
                    Err(e) => Response::error(e.to_string()),
                }
            }
            Action::GetContext => {
                session.context.refresh_if_stale();
                let mut resp = Response::success();
                resp.context = Some(session.context.to_json());
                resp
            }
            Action::Classify => match request.command_text() {
                Some(command) => {
                    let mut resp = Response::success();
                    resp.classification = Some(TaskClassifier::classify(command));
                    resp
                }
                None => Response::error("Missing command"),
            },
            Action::Chat => match request.command_text() {
                Some(prompt) => self.chat(session, prompt).await,
                None => Response::error("Missing command"),
            },
            Action::ListModels => {
                let mut resp = Response::success().with_backend(self.state.router.current_name());
                resp.models = Some(self.state.router.snapshot());
                resp
            }
        }
    }

    /// 路由并取得解释（反馈捷径或后端调用），不执行
    pub async fn resolve(&self, command: &str, context_summary: &str) -> Resolution {
        self.state.router.maybe_switch(command);
        let backend = self.state.router.current();

        let (outcome, source) = match self.state.feedback.suggest(command) {
            Some(previous) => {
                tracing::debug!(command = %previous, "using accepted interpretation from feedback");
                (InterpretOutcome::Success(previous), InterpretationSource::Feedback)
            }
            None => {
                let started = Instant::now();
                let reply = self
                    .invoke(&backend, CallMode::Interpret, command, context_summary)
                    .await;
                let reached_backend = !matches!(reply, Err(BackendError::Busy(_)));
                let outcome = InterpretOutcome::from_reply(reply);
                if reached_backend {
                    self.record_backend(&backend, outcome.counts_as_success(), started).await;
                }
                (outcome, InterpretationSource::Backend)
            }
        };
        self.state
            .counters
            .interpretation(matches!(outcome, InterpretOutcome::Success(_)));
        Resolution {
            backend,
            outcome,
            source,
        }
    }

    async fn interpret(&self, session: &mut Session, command: &str) -> Response {
        session.context.refresh_if_stale();
        session.transition(DispatchState::Routed);
        let summary = session.context.summary();
        let Resolution {
            backend,
            outcome,
            source,
        } = self.resolve(command, &summary).await;
        session.transition(DispatchState::BackendCalled);

        match outcome {
            InterpretOutcome::Success(interpreted) => {
                tracing::info!(session = %session.id, natural = %command, interpreted = %interpreted, backend = %backend.name, "interpreted");
                if self.state.settings.confirmation_required {
                    session.transition(DispatchState::ConfirmRequired);
                    let mut resp = Response::success()
                        .with_backend(&backend.name)
                        .with_message("Confirmation required before execution");
                    resp.interpreted_command = Some(interpreted);
                    resp.confirmation_required = Some(true);
                    resp.source = Some(source);
                    resp
                } else {
                    // 反馈捷径命中的解释已在日志中，不再重复记录
                    let feedback = (source == InterpretationSource::Backend)
                        .then_some((command, backend.name.as_str()));
                    let mut resp = self.execute_checked(session, &interpreted, feedback).await;
                    resp.source = Some(source);
                    resp.backend = Some(backend.name.clone());
                    resp
                }
            }
            InterpretOutcome::Unsafe => Response::new(ResponseStatus::Unsafe)
                .with_backend(&backend.name)
                .with_message("The request was judged unsafe and will not be executed"),
            InterpretOutcome::Unclear => Response::new(ResponseStatus::Unclear)
                .with_backend(&backend.name)
                .with_message("The request is unclear, please rephrase it"),
            InterpretOutcome::BackendFailed(reason) => {
                tracing::warn!(session = %session.id, backend = %backend.name, %reason, "interpretation failed");
                Response::error(format!("Backend failed: {}", reason)).with_backend(&backend.name)
            }
        }
    }

    /// 安全检查后执行；`feedback` 给出时记录为被接受的解释
    async fn execute_checked(
        &self,
        session: &mut Session,
        command: &str,
        feedback: Option<(&str, &str)>,
    ) -> Response {
        session.transition(DispatchState::SafetyChecked);
        if let Err(violation) = self.state.safety.check(command) {
            self.state.counters.blocked();
            session.transition(DispatchState::Blocked);
            tracing::warn!(session = %session.id, command = %command, reason = %violation, "command blocked");
            return Response::blocked(command, violation);
        }

        let result = self
            .state
            .runner
            .run(command, Some(&session.context.current_directory))
            .await;
        session.context.push_command(command);
        if let Some((natural, backend_name)) = feedback {
            self.record_feedback(natural, command, true, backend_name).await;
        }
        session.transition(DispatchState::Executed);

        let mut resp = Response::success().with_execution(result);
        resp.interpreted_command = Some(command.to_string());
        resp
    }

    /// 客户端对待确认命令的决定
    async fn confirm(&self, session: &mut Session, request: &Request) -> Response {
        let (Some(natural), Some(interpreted), Some(accepted)) = (
            request.command_text(),
            request
                .interpreted_command
                .as_deref()
                .map(str::trim)
                .filter(|c| !c.is_empty()),
            request.accepted,
        ) else {
            return Response::error("confirm requires command, interpreted_command and accepted");
        };
        let backend_name = self.confirmed_backend(request.backend.as_deref());

        if !accepted {
            self.record_feedback(natural, interpreted, false, &backend_name).await;
            return Response::success()
                .with_backend(backend_name)
                .with_message("Rejection recorded");
        }
        let mut resp = self
            .execute_checked(session, interpreted, Some((natural, backend_name.as_str())))
            .await;
        resp.backend = Some(backend_name);
        resp
    }

    /// 产生该解释的后端：客户端回传的名称在注册表中时采用，否则取当前后端
    fn confirmed_backend(&self, claimed: Option<&str>) -> String {
        match claimed.map(str::trim).filter(|name| !name.is_empty()) {
            Some(name) if self.state.router.backends().iter().any(|b| b.name == name) => {
                name.to_string()
            }
            Some(name) => {
                tracing::debug!(backend = %name, "confirm names an unknown backend, using current");
                self.state.router.current_name()
            }
            None => self.state.router.current_name(),
        }
    }

    async fn chat(&self, session: &mut Session, prompt: &str) -> Response {
        session.context.refresh_if_stale();
        let backend = self.state.router.current();
        let summary = session.context.summary();
        let started = Instant::now();
        let reply = self.invoke(&backend, CallMode::Chat, prompt, &summary).await;
        session.transition(DispatchState::BackendCalled);
        if !matches!(reply, Err(BackendError::Busy(_))) {
            self.record_backend(&backend, reply.is_ok(), started).await;
        }
        match reply {
            Ok(text) if !text.trim().is_empty() => {
                let mut resp = Response::success().with_backend(&backend.name);
                resp.chat_response = Some(text.trim().to_string());
                resp
            }
            Ok(_) => Response::error(BackendError::EmptyResponse.to_string()).with_backend(&backend.name),
            Err(e) => Response::error(format!("Backend failed: {}", e)).with_backend(&backend.name),
        }
    }

    /// 获取共享后端并在超时内完成一次调用
    async fn invoke(
        &self,
        backend: &BackendConfig,
        mode: CallMode,
        text: &str,
        context_summary: &str,
    ) -> Result<String, BackendError> {
        let _permit = self.state.acquire_backend().await?;
        let call = async {
            match mode {
                CallMode::Interpret => self.state.backend.interpret(backend, text, context_summary).await,
                CallMode::Chat => self.state.backend.chat(backend, text, context_summary).await,
            }
        };
        match tokio::time::timeout(backend.timeout(), call).await {
            Ok(reply) => reply,
            Err(_) => Err(BackendError::Timeout(backend.timeout_secs)),
        }
    }

    async fn record_backend(&self, backend: &BackendConfig, success: bool, started: Instant) {
        self.state
            .router
            .record_outcome(&backend.name, success, started.elapsed().as_secs_f64());
        self.persist_registry().await;
    }

    /// 注册表写文件放到阻塞线程池
    async fn persist_registry(&self) {
        let state = Arc::clone(&self.state);
        if let Err(e) = tokio::task::spawn_blocking(move || state.router.persist()).await {
            tracing::warn!(error = %e, "registry persist task failed");
        }
    }

    async fn record_feedback(&self, natural: &str, interpreted: &str, accepted: bool, backend_name: &str) {
        let state = Arc::clone(&self.state);
        let (natural, interpreted, backend_name) =
            (natural.to_string(), interpreted.to_string(), backend_name.to_string());
        let task = tokio::task::spawn_blocking(move || {
            state.feedback.record(&natural, &interpreted, accepted, &backend_name)
        });
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "feedback record task failed");
        }
    }

    /// 状态报告附带当前后端的可达性与可用模型
    async fn status_with_health(&self) -> StatusReport {
        let mut report = self.state.status_report();
        let backend = self.state.router.current();
        let checked = tokio::time::timeout(
            backend.timeout().min(HEALTH_TIMEOUT),
            self.state.backend.health(&backend),
        )
        .await;
        match checked {
            Ok(Ok(models)) => {
                report.backend_status = BACKEND_REACHABLE;
                report.available_models = models;
            }
            Ok(Err(e)) => {
                tracing::debug!(backend = %backend.name, error = %e, "backend health check failed");
                report.backend_status = BACKEND_UNREACHABLE;
            }
            Err(_) => report.backend_status = BACKEND_UNREACHABLE,
        }
        report
    }
}
