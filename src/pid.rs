// PID lock file shared with the external launcher.
//
// The launcher cross-checks `pid` and `startedAt` against /healthz before it
// concludes the gateway it sees is the one it started.

use std::fs;
use std::path::PathBuf;

use anyhow::Result;
use serde_json::json;

use crate::config;

pub fn lock_path() -> PathBuf {
    config::config_dir().join("proxy.pid")
}

pub fn write_lock(started_at_ms: i64) -> Result<PathBuf> {
    let path = lock_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(&json!({
        "pid": std::process::id(),
        "startedAt": started_at_ms,
    }))?;
    fs::write(&path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&path)?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(&path, perms)?;
    }

    Ok(path)
}

pub fn remove_lock() {
    let path = lock_path();
    if path.exists() {
        if let Err(e) = fs::remove_file(&path) {
            tracing::warn!("failed to remove pid lock {:?}: {}", path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        std::env::set_var("CLAUDE_PROXY_DIR", dir.path());

        let path = write_lock(1_700_000_000_000).unwrap();
        let parsed: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["pid"].as_u64(), Some(std::process::id() as u64));
        assert_eq!(parsed["startedAt"].as_i64(), Some(1_700_000_000_000));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        remove_lock();
        assert!(!path.exists());

        std::env::remove_var("CLAUDE_PROXY_DIR");
    }
}
