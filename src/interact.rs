//! 外部协作者接口：用户消息输出、确认对话、密码输入

use async_trait::async_trait;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use tracing::{error, info};

/// 面向用户的消息输出
pub trait Logger: Send + Sync {
    fn message(&self, msg: &str);
    fn error(&self, msg: &str);
}

/// 直接转发到 tracing
#[derive(Debug, Default, Clone)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn message(&self, msg: &str) {
        info!("{}", msg);
    }

    fn error(&self, msg: &str) {
        error!("{}", msg);
    }
}

/// 确认对话的可选动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmAction {
    Ok,
    Retry,
}

impl ConfirmAction {
    pub fn label(&self) -> &'static str {
        match self {
            ConfirmAction::Ok => "OK",
            ConfirmAction::Retry => "Retry",
        }
    }
}

#[async_trait]
pub trait Confirm: Send + Sync {
    /// 返回 `None` 表示用户放弃
    async fn confirm(&self, question: &str, actions: &[ConfirmAction]) -> Option<ConfirmAction>;
}

#[async_trait]
pub trait PasswordPrompt: Send + Sync {
    /// 返回 `None` 表示用户取消输入
    async fn prompt(&self, placeholder: &str) -> Option<String>;
}

/// 总是选择第一个动作（非交互环境）
#[derive(Debug, Default, Clone)]
pub struct AutoConfirm;

#[async_trait]
impl Confirm for AutoConfirm {
    async fn confirm(&self, question: &str, actions: &[ConfirmAction]) -> Option<ConfirmAction> {
        info!("自动确认: {}", question);
        actions.first().copied()
    }
}

/// 从不提供密码
#[derive(Debug, Default, Clone)]
pub struct NoPrompt;

#[async_trait]
impl PasswordPrompt for NoPrompt {
    async fn prompt(&self, _placeholder: &str) -> Option<String> {
        None
    }
}

/// 终端确认：输入动作名（或首字母）选择，空行表示放弃
#[derive(Debug, Default, Clone)]
pub struct ConsoleConfirm;

#[async_trait]
impl Confirm for ConsoleConfirm {
    async fn confirm(&self, question: &str, actions: &[ConfirmAction]) -> Option<ConfirmAction> {
        let question = question.to_string();
        let actions = actions.to_vec();
        tokio::task::spawn_blocking(move || {
            let labels: Vec<_> = actions.iter().map(|a| a.label()).collect();
            print!("{} [{}] ", question, labels.join("/"));
            io::stdout().flush().ok()?;

            let mut line = String::new();
            io::stdin().lock().read_line(&mut line).ok()?;
            let answer = line.trim().to_lowercase();
            if answer.is_empty() {
                return None;
            }
            actions.into_iter().find(|a| {
                let label = a.label().to_lowercase();
                label == answer || label.starts_with(&answer)
            })
        })
        .await
        .ok()
        .flatten()
    }
}

/// 终端密码输入（不回显）
#[derive(Debug, Default, Clone)]
pub struct ConsolePrompt;

#[async_trait]
impl PasswordPrompt for ConsolePrompt {
    async fn prompt(&self, placeholder: &str) -> Option<String> {
        let label = format!("{}: ", placeholder);
        tokio::task::spawn_blocking(move || rpassword::prompt_password(label).ok())
            .await
            .ok()
            .flatten()
            .filter(|p| !p.is_empty())
    }
}

/// 一个服务器缓存器需要的全部外部协作者
#[derive(Clone)]
pub struct Interact {
    pub logger: Arc<dyn Logger>,
    pub confirm: Arc<dyn Confirm>,
    pub prompt: Arc<dyn PasswordPrompt>,
}

impl Interact {
    /// 终端交互
    pub fn console() -> Self {
        Self {
            logger: Arc::new(TracingLogger),
            confirm: Arc::new(ConsoleConfirm),
            prompt: Arc::new(ConsolePrompt),
        }
    }
}

impl Default for Interact {
    /// 非交互：自动确认，从不提示密码
    fn default() -> Self {
        Self {
            logger: Arc::new(TracingLogger),
            confirm: Arc::new(AutoConfirm),
            prompt: Arc::new(NoPrompt),
        }
    }
}
