use anyhow::Context;
use async_trait::async_trait;
use log::debug;
#[cfg(test)]
use mockall::automock;
use nms_shared::config::PingConfig;
use std::collections::HashSet;
use tokio::process::Command;

/// Batch reachability check. Implementations answer with the subset of the
/// supplied addresses that responded.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn alive_hosts(&self, ips: Vec<String>) -> anyhow::Result<HashSet<String>>;
}

/// Shells out to an fping-compatible binary. `-a` prints alive targets one
/// per line on stdout, `-q` silences per-probe chatter.
pub struct FpingProbe {
    binary: String,
    timeout_ms: u64,
    retries: u32,
}

impl FpingProbe {
    pub fn new(config: &PingConfig) -> Self {
        FpingProbe {
            binary: config.binary.clone(),
            timeout_ms: config.timeout_ms,
            retries: config.retries,
        }
    }
}

#[async_trait]
impl ReachabilityProbe for FpingProbe {
    async fn alive_hosts(&self, ips: Vec<String>) -> anyhow::Result<HashSet<String>> {
        let output = Command::new(&self.binary)
            .arg("-a")
            .arg("-q")
            .arg("-t")
            .arg(self.timeout_ms.to_string())
            .arg("-r")
            .arg(self.retries.to_string())
            .args(&ips)
            .output()
            .await
            .context("failed to run reachability probe")?;
        if !output.stderr.is_empty() {
            debug!(
                "alive_hosts - probe stderr: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        // A non-zero exit just means some hosts were down; stdout is
        // authoritative either way.
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn probe_script(dir: &tempfile::TempDir, body: &str) -> FpingProbe {
        let path = dir.path().join("fakeping");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        FpingProbe {
            binary: path.to_str().unwrap().to_string(),
            timeout_ms: 100,
            retries: 1,
        }
    }

    #[tokio::test]
    async fn test_parses_alive_hosts_despite_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        // Mimics fping with one host down: alive hosts on stdout, noise on
        // stderr, exit code 1.
        let probe = probe_script(
            &dir,
            "echo 10.0.0.1\necho 10.0.0.3\necho '10.0.0.2 is unreachable' >&2\nexit 1",
        );
        let alive = probe
            .alive_hosts(vec![
                "10.0.0.1".to_string(),
                "10.0.0.2".to_string(),
                "10.0.0.3".to_string(),
            ])
            .await
            .unwrap();
        assert_eq!(alive.len(), 2);
        assert!(alive.contains("10.0.0.1"));
        assert!(alive.contains("10.0.0.3"));
    }

    #[tokio::test]
    async fn test_empty_stdout_means_nothing_alive() {
        let dir = tempfile::tempdir().unwrap();
        let probe = probe_script(&dir, "exit 1");
        let alive = probe.alive_hosts(vec!["10.0.0.1".to_string()]).await.unwrap();
        assert!(alive.is_empty());
    }

    #[tokio::test]
    async fn test_missing_binary_is_an_error() {
        let probe = FpingProbe {
            binary: "/nonexistent/fping".to_string(),
            timeout_ms: 100,
            retries: 1,
        };
        assert!(probe.alive_hosts(vec!["10.0.0.1".to_string()]).await.is_err());
    }
}
