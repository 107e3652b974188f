//! Permission window commands against the local DuckDB engine store

use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use crate::cli::commands::{load_config, runtime};
use crate::cli::error::CliError;
use crate::database::{DuckDBBackend, initialize_schema};
use crate::windows::{HolderId, PermissionWindow, PermissionWindowPeriod, SqlWindowStore, WindowStore};

#[derive(Debug, Clone)]
pub enum WindowAction {
    List,
    Add {
        name: String,
        description: Option<String>,
        periods: Vec<String>,
    },
    /// Report whether the window is open now
    Check { id: String },
    Release { id: String, holder: String },
    ForceRelease { id: String },
}

#[derive(Debug, Clone)]
pub struct WindowArgs {
    pub action: WindowAction,
    pub config_dir: PathBuf,
}

fn parse_id(id: &str) -> Result<Uuid, CliError> {
    Uuid::parse_str(id).map_err(|_| CliError::InvalidArgument(format!("Invalid window id: {id}")))
}

fn describe(window: &PermissionWindow) -> String {
    let periods = if window.periods.is_empty() {
        "always".to_string()
    } else {
        window
            .periods
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    };
    let lock = match (&window.lock.locked_because_running, &window.lock.lock_held_by) {
        (true, Some(holder)) => format!("locked by {holder}"),
        _ => "unlocked".to_string(),
    };
    format!("{}  {}  [{}]  {}", window.id, window.name, periods, lock)
}

pub fn handle_window(args: &WindowArgs) -> Result<(), CliError> {
    let config = load_config(&args.config_dir)?;
    let store_path = config.store_path(&args.config_dir);
    let holder = config.scheduler.holder();

    runtime()?.block_on(async {
        let backend = DuckDBBackend::new(&store_path)
            .map_err(|e| CliError::DatabaseError(format!("Failed to open store: {}", e)))?;
        initialize_schema(&backend)
            .await
            .map_err(|e| CliError::DatabaseError(e.to_string()))?;
        let store = SqlWindowStore::new(Arc::new(backend), config.scheduler.lock_policy());

        match &args.action {
            WindowAction::List => {
                let windows = store.list().await?;
                if windows.is_empty() {
                    println!("No permission windows defined");
                }
                for window in &windows {
                    println!("{}", describe(window));
                }
            }
            WindowAction::Add {
                name,
                description,
                periods,
            } => {
                let mut window = PermissionWindow::new(name);
                window.description = description.clone();
                for period in periods {
                    window = window.with_period(period.parse::<PermissionWindowPeriod>()?);
                }
                store.save(&window).await?;
                println!("{}", window.id);
            }
            WindowAction::Check { id } => {
                let window = store.load(parse_id(id)?).await?;
                let now = Utc::now();
                let within = window.is_within_window(&now.with_timezone(&chrono::Local));
                let admitted = within && window.lock.available_to(&holder, store.policy(), now);
                println!("{}", describe(&window));
                println!(
                    "within period: {}  admits new run: {}",
                    if within { "yes" } else { "no" },
                    if admitted { "yes" } else { "no" }
                );
            }
            WindowAction::Release { id, holder } => {
                store.release(parse_id(id)?, &HolderId::new(holder.as_str())).await?;
                println!("Released");
            }
            WindowAction::ForceRelease { id } => {
                match store.force_release(parse_id(id)?).await? {
                    Some(previous) => println!("Released lock held by {previous}"),
                    None => println!("Window was not locked"),
                }
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_window() {
        let window = PermissionWindow::new("Nightly").with_period("Sat 22:00-06:00".parse().unwrap());
        let line = describe(&window);
        assert!(line.contains("Nightly  [Sat 22:00-06:00]  unlocked"));
    }

    #[test]
    fn test_add_then_list_uses_store_file() {
        let dir = tempfile::tempdir().unwrap();
        let add = WindowArgs {
            action: WindowAction::Add {
                name: "Weekend".into(),
                description: None,
                periods: vec!["Sun 00:00-23:59".into()],
            },
            config_dir: dir.path().to_path_buf(),
        };
        handle_window(&add).unwrap();
        assert!(dir.path().join(crate::config::DEFAULT_STORE_FILENAME).exists());

        let bad = WindowArgs {
            action: WindowAction::Check { id: "not-a-uuid".into() },
            config_dir: dir.path().to_path_buf(),
        };
        assert!(matches!(handle_window(&bad), Err(CliError::InvalidArgument(_))));
    }
}
