use serde::{Deserialize, Serialize};

/// 远程文件被其他途径修改后再上传时的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModifiedPolicy {
    /// 直接覆盖
    Upload,
    /// 保留远程，跳过
    Ignore,
    /// 报错
    Error,
    /// 下载远程副本供外部比较
    #[default]
    Diff,
}

impl std::fmt::Display for ModifiedPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModifiedPolicy::Upload => write!(f, "upload"),
            ModifiedPolicy::Ignore => write!(f, "ignore"),
            ModifiedPolicy::Error => write!(f, "error"),
            ModifiedPolicy::Diff => write!(f, "diff"),
        }
    }
}

impl std::str::FromStr for ModifiedPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upload" => Ok(ModifiedPolicy::Upload),
            "ignore" => Ok(ModifiedPolicy::Ignore),
            "error" => Ok(ModifiedPolicy::Error),
            "diff" => Ok(ModifiedPolicy::Diff),
            other => Err(format!(
                "unknown policy `{}`, expected one of: upload, ignore, error, diff",
                other
            )),
        }
    }
}

impl ModifiedPolicy {
    /// 批量执行时没有人看 diff，退化为报错
    pub fn for_batch(self) -> Self {
        match self {
            ModifiedPolicy::Diff => ModifiedPolicy::Error,
            other => other,
        }
    }
}

/// diff 时远程副本的临时文件名
pub fn remote_copy_name(path: &str) -> String {
    let base = path.rsplit('/').next().unwrap_or(path);
    format!("{}.remote-{}", base, uuid::Uuid::new_v4().simple())
}
