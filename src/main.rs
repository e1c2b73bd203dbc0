use anyhow::{Context, Result};
use chrono::{Local, TimeZone};
use clap::{Parser, Subcommand};
use ftpsync_lib::core::{FileComparator, ListOptions, TransferOptions};
use ftpsync_lib::logging::{init_logging, log_dir};
use ftpsync_lib::{Interact, ModifiedPolicy, Outcome, SyncCacher, TaskList, Workspace, WorkspaceConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error};

#[derive(Parser)]
#[command(name = "ftpsync")]
#[command(version, about = "Keep a local directory in sync with an FTP/SFTP server")]
struct Cli {
    /// 工作区根目录（包含 .ftpsync/config.json）
    #[arg(short, long, global = true, default_value = ".")]
    workspace: PathBuf,

    /// 输出调试日志
    #[arg(short, long, global = true)]
    verbose: bool,

    /// 使用的服务器（名称或 host uri），默认主服务器
    #[arg(short, long, global = true)]
    server: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a file or directory
    Upload {
        path: String,
        /// Override whenRemoteModified: upload | ignore | error | diff
        #[arg(long)]
        when_modified: Option<ModifiedPolicy>,
    },
    /// Download a file or directory
    Download { path: String },
    /// Delete a remote file or directory (recursive)
    Delete { path: String },
    /// Create a remote directory and its parents
    Mkdir { path: String },
    /// Rename a remote entry
    Rename { from: String, to: String },
    /// List a remote directory
    List {
        #[arg(default_value = "/")]
        path: String,
        /// Ignore the listing cache
        #[arg(short, long)]
        force: bool,
    },
    /// Upload everything newer than the remote copy
    UploadAll {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Download everything missing or changed locally
    DownloadAll {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Delete remote entries that no longer exist locally
    CleanAll {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Drop the cached listing and list again
    Refresh {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Print the remote working directory
    Pwd,
}

fn format_date(ms: i64) -> String {
    match Local.timestamp_millis_opt(ms).single() {
        Some(dt) if ms > 0 => dt.format("%Y-%m-%d %H:%M").to_string(),
        _ => "-".repeat(16),
    }
}

fn print_outcome(path: &str, outcome: &Outcome) {
    match outcome {
        Outcome::Diff { local, remote_copy } => {
            println!("{}: remote was modified", path);
            println!("  local:  {}", local.display());
            println!("  remote: {}", remote_copy.display());
        }
        other => println!("{}: {}", path, other),
    }
}

async fn run_batch(cacher: &Arc<SyncCacher>, list: TaskList) -> Result<()> {
    if list.is_empty() {
        println!("Nothing to do");
        return Ok(());
    }
    println!("{}", FileComparator::summarize(&list));
    let result = cacher.run_task_list(list).await?;
    for (path, err) in &result.errors {
        eprintln!("{}: {}", path, err);
    }
    println!("{} succeeded, {} failed", result.succeeded(), result.failed_tasks.len());
    Ok(())
}

async fn execute(cacher: &Arc<SyncCacher>, command: Commands) -> Result<()> {
    match command {
        Commands::Upload {
            path,
            when_modified,
        } => {
            let opts = TransferOptions {
                when_remote_modified: when_modified,
                ..TransferOptions::default()
            };
            let outcome = cacher.upload(&path, opts).await?;
            print_outcome(&path, &outcome);
        }
        Commands::Download { path } => {
            let outcome = cacher.download(&path, TransferOptions::default()).await?;
            print_outcome(&path, &outcome);
        }
        Commands::Delete { path } => cacher.delete(&path).await?,
        Commands::Mkdir { path } => cacher.mkdir(&path).await?,
        Commands::Rename { from, to } => cacher.rename(&from, &to).await?,
        Commands::List { path, force } => {
            let opts = if force {
                ListOptions::force()
            } else {
                ListOptions::default()
            };
            for node in cacher.list(&path, opts).await? {
                let name = match &node.link {
                    Some(target) => format!("{} -> {}", node.name, target),
                    None => node.name.clone(),
                };
                println!(
                    "{} {:>12} {} {}",
                    node.kind.symbol(),
                    node.size,
                    format_date(node.date),
                    name
                );
            }
        }
        Commands::UploadAll { path } => {
            let list = cacher.upload_all(&path).await?;
            run_batch(cacher, list).await?;
        }
        Commands::DownloadAll { path } => {
            let list = cacher.download_all(&path).await?;
            run_batch(cacher, list).await?;
        }
        Commands::CleanAll { path } => {
            let list = cacher.clean_all(&path).await?;
            run_batch(cacher, list).await?;
        }
        Commands::Refresh { path } => {
            let nodes = cacher.refresh(&path).await?;
            println!("{} entries", nodes.len());
        }
        Commands::Pwd => println!("{}", cacher.pwd().await?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let root = cli
        .workspace
        .canonicalize()
        .with_context(|| format!("工作区不存在: {:?}", cli.workspace))?;

    // 配置无效时仍以默认日志设置启动，以便报告错误
    let log_config = WorkspaceConfig::load(&root)
        .map(|c| c.log)
        .unwrap_or_default();
    let _guard = init_logging(&log_dir(&root), &log_config, cli.verbose);

    let workspace = Workspace::new(&root, Interact::console());
    workspace.load().await?;

    let cacher = match &cli.server {
        Some(name) => workspace
            .server(name)
            .with_context(|| format!("未配置的服务器: {}", name))?,
        None => workspace
            .main_server()
            .context("工作区没有配置服务器")?,
    };
    debug!("使用服务器 {}", cacher.config().display_name());

    let result = execute(&cacher, cli.command).await;
    if let Err(e) = &result {
        error!("{:#}", e);
    }
    workspace.unload().await?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_when_modified_rejects_unknown_policy() {
        let cli = Cli::try_parse_from(["ftpsync", "upload", "a.txt", "--when-modified", "ignore"])
            .unwrap();
        match cli.command {
            Commands::Upload { when_modified, .. } => {
                assert_eq!(when_modified, Some(ModifiedPolicy::Ignore))
            }
            _ => panic!("expected upload"),
        }

        assert!(
            Cli::try_parse_from(["ftpsync", "upload", "a.txt", "--when-modified", "uplaod"]).is_err()
        );
    }
}
