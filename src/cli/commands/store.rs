//! Store command - seed a directory store

use crate::cli::args::{StoreAction, StoreArgs};
use crate::config::Config;
use crate::error::{IsolateError, IsolateResult};
use crate::storage::DirectoryBackend;

/// Execute the store command
pub async fn execute(args: StoreArgs, config: &Config) -> IsolateResult<()> {
    let dir = args
        .dir
        .or_else(|| config.storage.dir.clone())
        .ok_or_else(|| {
            IsolateError::User("No store configured: pass --dir or set storage.dir".to_string())
        })?;
    let store = DirectoryBackend::new(dir);

    match args.action {
        StoreAction::Add { files } => {
            for file in files {
                let content = tokio::fs::read(&file).await.map_err(|e| {
                    IsolateError::io(format!("reading {}", file.display()), e)
                })?;
                let digest = store.put(&content).await?;
                println!("{}  {}", digest, file.display());
            }
        }
    }

    Ok(())
}
