//! 错误分类
//!
//! 连接层把各协议的原生错误码归一化为 [`ErrorCode`]，上层只按错误码决定是否自动恢复。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 归一化错误码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthFailed,
    ConnectionRefused,
    /// 命令在 block 检测时长内没有返回
    Blocked,
    FileNotFound,
    /// 上级目录不存在，调用方应先 mkdir -p 再重试一次
    RequestMkdir,
    /// mkdir 的父目录不存在，或 rmdir 的目录非空
    RequestRecursive,
    /// 传输层被重置，调用方应重连后重试一次
    ReconnectAndRetryOnce,
    Modified,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::ConnectionRefused => "CONNECTION_REFUSED",
            ErrorCode::Blocked => "BLOCKED",
            ErrorCode::FileNotFound => "FILE_NOT_FOUND",
            ErrorCode::RequestMkdir => "REQUEST_MKDIR",
            ErrorCode::RequestRecursive => "REQUEST_RECURSIVE",
            ErrorCode::ReconnectAndRetryOnce => "RECONNECT_AND_RETRY_ONCE",
            ErrorCode::Modified => "MODIFIED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("connection error [{code}]: {message}")]
    Connection { code: ErrorCode, message: String },

    #[error("{}", protocol_message(.code, .message))]
    Protocol {
        code: Option<ErrorCode>,
        message: String,
    },

    #[error("remote file was modified: {path}")]
    Modified { path: String },

    #[error("cancelled")]
    Cancelled,

    #[error("task `{task}` could not start: scheduler is busy with `{running}`")]
    Busy { task: String, running: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn protocol_message(code: &Option<ErrorCode>, message: &str) -> String {
    match code {
        Some(code) => format!("[{}] {}", code, message),
        None => message.to_string(),
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

impl SyncError {
    pub fn connection(code: ErrorCode, message: impl Into<String>) -> Self {
        SyncError::Connection {
            code,
            message: message.into(),
        }
    }

    pub fn protocol(code: ErrorCode, message: impl Into<String>) -> Self {
        SyncError::Protocol {
            code: Some(code),
            message: message.into(),
        }
    }

    /// 没有对应归一化错误码的协议错误
    pub fn remote(message: impl Into<String>) -> Self {
        SyncError::Protocol {
            code: None,
            message: message.into(),
        }
    }

    pub fn not_found(path: &str) -> Self {
        Self::protocol(ErrorCode::FileNotFound, format!("no such file: {}", path))
    }

    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            SyncError::Connection { code, .. } => Some(*code),
            SyncError::Protocol { code, .. } => *code,
            SyncError::Modified { .. } => Some(ErrorCode::Modified),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }

    pub fn is_not_found(&self) -> bool {
        self.code() == Some(ErrorCode::FileNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_display_and_lookup() {
        let err = SyncError::protocol(ErrorCode::RequestMkdir, "/a/b");
        assert_eq!(err.code(), Some(ErrorCode::RequestMkdir));
        assert_eq!(err.to_string(), "[REQUEST_MKDIR] /a/b");

        let err = SyncError::remote("boom");
        assert_eq!(err.code(), None);
        assert_eq!(err.to_string(), "boom");

        assert!(SyncError::Cancelled.is_cancelled());
        assert_eq!(
            SyncError::Modified { path: "/x".into() }.code(),
            Some(ErrorCode::Modified)
        );
    }
}
