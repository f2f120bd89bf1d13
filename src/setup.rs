//! `setup` subcommand — rewrites a client's MCP server config so
//! that launching the server actually launches it through mcpmon.
//!
//! This is a small, self-contained CLI utility, not part of the proxy
//! core: it shares the binary but never touches `Supervisor` or any of
//! its collaborators. Grounded on `agents/claude_config.rs`'s
//! read/modify/write-with-`tokio::fs` shape, and on its timestamped-
//! snapshot convention for anything that mutates a file in place.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};
use tracing::{info, warn};

/// What to operate on when `--list`/`--restore` aren't given.
pub enum Target {
    All,
    Named(String),
}

/// Parsed `setup` invocation (CLI parsing itself lives in `main.rs`).
pub struct SetupOptions {
    pub config: PathBuf,
    pub target: Option<Target>,
    pub restore: bool,
    pub list: bool,
}

/// Run the `setup` subcommand. Returns the process exit code.
pub async fn run(opts: SetupOptions, mcpmon_bin: &str) -> Result<i32> {
    if opts.restore {
        return match restore(&opts.config).await {
            Ok(()) => Ok(0),
            Err(e) => {
                warn!(err = %e, "restore failed");
                Ok(1)
            }
        };
    }

    let raw = match tokio::fs::read_to_string(&opts.config).await {
        Ok(raw) => raw,
        Err(e) => {
            warn!(path = %opts.config.display(), err = %e, "could not read config file");
            return Ok(1);
        }
    };

    let mut doc: Value = match serde_json::from_str(&raw) {
        Ok(doc) => doc,
        Err(e) => {
            warn!(err = %e, "config file is not valid JSON");
            return Ok(1);
        }
    };

    if opts.list {
        list_servers(&doc);
        return Ok(0);
    }

    let servers = match doc.get_mut("mcpServers").and_then(Value::as_object_mut) {
        Some(servers) => servers,
        None => {
            warn!("config file has no mcpServers object");
            return Ok(1);
        }
    };

    let names: Vec<String> = match &opts.target {
        Some(Target::All) => servers.keys().cloned().collect(),
        Some(Target::Named(name)) => {
            if !servers.contains_key(name) {
                warn!(server = %name, "no such server in config");
                return Ok(1);
            }
            vec![name.clone()]
        }
        None => bail!("setup requires --all, a server name, --list, or --restore"),
    };

    let mut converted = 0usize;
    for name in &names {
        let entry = servers.get_mut(name).expect("name came from this map");
        if is_remote_transport(entry) {
            warn!(server = %name, "skipping HTTP/SSE-style server entry");
            continue;
        }
        convert_entry(entry, mcpmon_bin)?;
        converted += 1;
    }

    if converted == 0 {
        warn!("no stdio-style server entries were converted");
        return Ok(1);
    }

    backup(&opts.config, &raw).await?;

    let rewritten = serde_json::to_string_pretty(&doc).context("serializing updated config")?;
    tokio::fs::write(&opts.config, rewritten)
        .await
        .with_context(|| format!("writing {}", opts.config.display()))?;

    info!(count = converted, "converted server entries to run through mcpmon");
    Ok(0)
}

/// Heuristically detect an HTTP/SSE-shaped entry. A stdio entry always names a
/// local executable and argv; remote entries instead carry a `url`/`uri`
/// field or declare their transport explicitly.
fn is_remote_transport(entry: &Value) -> bool {
    if entry.get("url").is_some() || entry.get("uri").is_some() {
        return true;
    }
    matches!(
        entry.get("type").and_then(Value::as_str),
        Some("sse") | Some("http") | Some("streamable-http")
    )
}

/// Rewrite one `mcpServers` entry in place: `command` becomes `mcpmon_bin`,
/// `args` becomes `[old_command, ...old_args]`; `env`/`cwd` are untouched.
fn convert_entry(entry: &mut Value, mcpmon_bin: &str) -> Result<()> {
    let object = entry
        .as_object_mut()
        .context("server entry is not a JSON object")?;

    let old_command = object
        .get("command")
        .and_then(Value::as_str)
        .context("server entry has no string `command`")?
        .to_string();

    if old_command == mcpmon_bin {
        // Already converted; leave it alone.
        return Ok(());
    }

    let mut new_args = vec![Value::String(old_command)];
    if let Some(Value::Array(old_args)) = object.get("args") {
        new_args.extend(old_args.iter().cloned());
    }

    object.insert("command".into(), Value::String(mcpmon_bin.to_string()));
    object.insert("args".into(), Value::Array(new_args));
    Ok(())
}

fn list_servers(doc: &Value) {
    let Some(servers) = doc.get("mcpServers").and_then(Value::as_object) else {
        println!("(no mcpServers entries found)");
        return;
    };
    for (name, entry) in servers {
        let command = entry.get("command").and_then(Value::as_str).unwrap_or("?");
        println!("{name}: {command}");
    }
}

/// Write a timestamped backup of the config file's current contents
/// alongside it, named `<file>.<YYYYMMDDHHMMSS>.bak`.
async fn backup(config: &Path, original_contents: &str) -> Result<()> {
    let stamp = chrono::Local::now().format("%Y%m%d%H%M%S");
    let backup_path = backup_path_for(config, &stamp.to_string());
    tokio::fs::write(&backup_path, original_contents)
        .await
        .with_context(|| format!("writing backup {}", backup_path.display()))?;
    info!(path = %backup_path.display(), "wrote config backup");
    Ok(())
}

fn backup_path_for(config: &Path, stamp: &str) -> PathBuf {
    let file_name = config
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "mcpmon-config".to_string());
    config.with_file_name(format!("{file_name}.{stamp}.bak"))
}

/// Revert `config` from its newest sibling backup.
/// Backup file names are timestamp-suffixed so the lexicographically
/// greatest match is also the most recent.
async fn restore(config: &Path) -> Result<()> {
    let dir = config.parent().unwrap_or_else(|| Path::new("."));
    let file_name = config
        .file_name()
        .context("config path has no file name")?
        .to_string_lossy()
        .to_string();
    let prefix = format!("{file_name}.");

    let mut entries = tokio::fs::read_dir(dir).await.context("listing config directory")?;
    let mut candidates = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(&prefix) && name.ends_with(".bak") {
            candidates.push(name);
        }
    }

    candidates.sort();
    let newest = candidates.into_iter().last().context("no backup found to restore")?;
    let backup_path = dir.join(&newest);

    let contents = tokio::fs::read_to_string(&backup_path)
        .await
        .with_context(|| format!("reading backup {}", backup_path.display()))?;
    tokio::fs::write(config, contents)
        .await
        .with_context(|| format!("restoring {}", config.display()))?;
    info!(from = %backup_path.display(), to = %config.display(), "restored config from backup");
    Ok(())
}

/// Used only to keep `Map`/`Value` imports honest when the object helpers
/// above are exercised from tests that build documents by hand.
#[cfg(test)]
fn empty_map() -> Map<String, Value> {
    Map::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn stdio_entry(command: &str, args: &[&str]) -> Value {
        serde_json::json!({
            "command": command,
            "args": args,
        })
    }

    #[test]
    fn detects_remote_transport_by_url() {
        let entry = serde_json::json!({"url": "https://example.com/mcp"});
        assert!(is_remote_transport(&entry));
    }

    #[test]
    fn detects_remote_transport_by_type() {
        let entry = serde_json::json!({"command": "x", "type": "sse"});
        assert!(is_remote_transport(&entry));
    }

    #[test]
    fn stdio_entry_is_not_remote() {
        let entry = stdio_entry("node", &["server.js"]);
        assert!(!is_remote_transport(&entry));
    }

    #[test]
    fn convert_entry_prepends_original_command() {
        let mut entry = stdio_entry("node", &["server.js", "--flag"]);
        convert_entry(&mut entry, "mcpmon").unwrap();
        assert_eq!(entry["command"], "mcpmon");
        assert_eq!(
            entry["args"],
            serde_json::json!(["node", "server.js", "--flag"])
        );
    }

    #[test]
    fn convert_entry_is_idempotent() {
        let mut entry = stdio_entry("mcpmon", &["node", "server.js"]);
        convert_entry(&mut entry, "mcpmon").unwrap();
        assert_eq!(entry["args"], serde_json::json!(["node", "server.js"]));
    }

    #[tokio::test]
    async fn run_converts_named_server_and_writes_backup() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("mcp.json");
        let doc = serde_json::json!({
            "mcpServers": {
                "demo": stdio_entry("node", &["server.js"]),
            }
        });
        tokio::fs::write(&config_path, serde_json::to_string_pretty(&doc).unwrap())
            .await
            .unwrap();

        let opts = SetupOptions {
            config: config_path.clone(),
            target: Some(Target::Named("demo".into())),
            restore: false,
            list: false,
        };
        let code = run(opts, "mcpmon").await.unwrap();
        assert_eq!(code, 0);

        let updated: Value =
            serde_json::from_str(&tokio::fs::read_to_string(&config_path).await.unwrap()).unwrap();
        assert_eq!(updated["mcpServers"]["demo"]["command"], "mcpmon");
        assert_eq!(
            updated["mcpServers"]["demo"]["args"],
            serde_json::json!(["node", "server.js"])
        );

        let mut backups = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut found_backup = false;
        while let Some(e) = backups.next_entry().await.unwrap() {
            if e.file_name().to_string_lossy().ends_with(".bak") {
                found_backup = true;
            }
        }
        assert!(found_backup, "expected a .bak file to be written");
    }

    #[tokio::test]
    async fn run_refuses_remote_entries() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("mcp.json");
        let doc = serde_json::json!({
            "mcpServers": {
                "remote": {"url": "https://example.com/mcp"},
            }
        });
        tokio::fs::write(&config_path, serde_json::to_string_pretty(&doc).unwrap())
            .await
            .unwrap();

        let opts = SetupOptions {
            config: config_path,
            target: Some(Target::Named("remote".into())),
            restore: false,
            list: false,
        };
        let code = run(opts, "mcpmon").await.unwrap();
        assert_eq!(code, 1);
    }

    #[tokio::test]
    async fn restore_reverts_from_newest_backup() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("mcp.json");
        tokio::fs::write(&config_path, "AFTER").await.unwrap();
        tokio::fs::write(backup_path_for(&config_path, "20200101000000"), "BEFORE-1")
            .await
            .unwrap();
        tokio::fs::write(backup_path_for(&config_path, "20230101000000"), "BEFORE-2")
            .await
            .unwrap();

        restore(&config_path).await.unwrap();
        let contents = tokio::fs::read_to_string(&config_path).await.unwrap();
        assert_eq!(contents, "BEFORE-2");
    }

    #[test]
    fn empty_map_helper_is_empty() {
        assert!(empty_map().is_empty());
    }
}
