//! Port Conflict Diagnostics
//!
//! When the list-serving port is already held, the connection table is read
//! through the platform `netstat` utility to tell the operator which process
//! owns it. This is a report-only path: it never retries and never fails.

use regex::Regex;
use std::fmt;
use std::sync::OnceLock;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::Result;
use anyhow::Context;

/// How many rows after a listening row may carry the owner annotation
const OWNER_LOOKAHEAD: usize = 3;

fn owner_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\[(.+?)\]").ok())
        .as_ref()
}

/// A process found listening on the checked port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortOwner {
    pub pid: String,
    pub process: Option<String>,
}

impl fmt::Display for PortOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}",
            self.process.as_deref().unwrap_or("unknown"),
            self.pid
        )
    }
}

/// Output format of the connection-listing utility
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFormat {
    /// `netstat -abno -p TCP`: owner on a bracketed row below the socket row
    Windows,
    /// `netstat -tlnp`: owner in a trailing `pid/name` column
    Unix,
}

impl TableFormat {
    pub fn native() -> Self {
        if cfg!(windows) {
            TableFormat::Windows
        } else {
            TableFormat::Unix
        }
    }
}

/// Parse `netstat -abno -p TCP` output for listeners on `0.0.0.0:<port>`
pub fn parse_windows_table(output: &str, port: u16) -> Vec<PortOwner> {
    let local = format!("0.0.0.0:{}", port);
    let rows: Vec<Vec<&str>> = output
        .split('\n')
        .map(|line| line.split_whitespace().collect())
        .collect();

    let mut owners = Vec::new();
    let mut i = 0;
    while i < rows.len() {
        let row = &rows[i];
        i += 1;

        if row.len() < 5 || row[0] != "TCP" || row[1] != local || row[2] != "0.0.0.0:0" {
            continue;
        }

        let mut process = None;
        for _ in 0..OWNER_LOOKAHEAD {
            // Owner rows are single tokens; anything wider ends the annotation
            match rows.get(i) {
                Some(next) if next.len() <= 1 => {
                    i += 1;
                    let token = next.first().copied().unwrap_or("");
                    if let Some(caps) = owner_pattern().and_then(|re| re.captures(token)) {
                        process = Some(caps[1].to_string());
                        break;
                    }
                }
                _ => break,
            }
        }

        owners.push(PortOwner {
            pid: row[4].to_string(),
            process,
        });
    }

    owners
}

/// Parse `netstat -tlnp` output for listeners on `0.0.0.0:<port>`
pub fn parse_unix_table(output: &str, port: u16) -> Vec<PortOwner> {
    let local = format!("0.0.0.0:{}", port);

    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 6 || !fields[0].starts_with("tcp") || fields[3] != local {
                return None;
            }

            let owner = fields.get(6).copied().unwrap_or("-");
            let (pid, process) = match owner.split_once('/') {
                Some((pid, name)) => (
                    pid.to_string(),
                    Some(name.trim_end_matches(':').to_string()).filter(|n| !n.is_empty()),
                ),
                None => (owner.to_string(), None),
            };

            Some(PortOwner { pid, process })
        })
        .collect()
}

/// Identifies the process holding a TCP port
#[derive(Debug, Clone)]
pub struct PortConflictDiagnostics {
    program: String,
    args: Vec<String>,
    format: TableFormat,
}

impl Default for PortConflictDiagnostics {
    fn default() -> Self {
        Self::new()
    }
}

impl PortConflictDiagnostics {
    /// Diagnostics using the platform `netstat`
    pub fn new() -> Self {
        let args: &[&str] = match TableFormat::native() {
            TableFormat::Windows => &["-abno", "-p", "TCP"],
            TableFormat::Unix => &["-tlnp"],
        };
        Self {
            program: "netstat".to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            format: TableFormat::native(),
        }
    }

    /// Diagnostics using a custom listing command
    pub fn with_command(
        program: impl Into<String>,
        args: Vec<String>,
        format: TableFormat,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            format,
        }
    }

    /// Run the listing utility to completion and return its standard output
    async fn connection_table(&self) -> Result<String> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.program))?;

        debug!(
            "{} exited with {} ({} bytes)",
            self.program,
            output.status,
            output.stdout.len()
        );
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Find every process listening on `port`
    pub async fn diagnose(&self, port: u16) -> Result<Vec<PortOwner>> {
        let table = self.connection_table().await?;
        Ok(match self.format {
            TableFormat::Windows => parse_windows_table(&table, port),
            TableFormat::Unix => parse_unix_table(&table, port),
        })
    }

    /// Print the conflict report for `port`; never fails
    pub async fn report(&self, port: u16) -> Vec<PortOwner> {
        eprintln!("Another process is already using port {}.", port);
        eprintln!("Please close or uninstall the application first:");

        let owners = match self.diagnose(port).await {
            Ok(owners) => owners,
            Err(e) => {
                warn!("Port diagnostics unavailable: {:#}", e);
                Vec::new()
            }
        };

        if owners.is_empty() {
            eprintln!("unknown");
        }
        for owner in &owners {
            eprintln!("{}", owner);
        }

        owners
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOWS_TABLE: &str = "
Active Connections

  Proto  Local Address          Foreign Address        State           PID
  TCP    0.0.0.0:135            0.0.0.0:0              LISTENING       1052
  RpcSs
 [svchost.exe]
  TCP    0.0.0.0:8080           0.0.0.0:0              LISTENING       4321
 [nginx.exe]
  TCP    0.0.0.0:9000           0.0.0.0:0              LISTENING       77
 Can not obtain ownership information
";

    #[test]
    fn test_windows_owner_on_next_row() {
        let owners = parse_windows_table(WINDOWS_TABLE, 8080);
        assert_eq!(
            owners,
            vec![PortOwner {
                pid: "4321".into(),
                process: Some("nginx.exe".into())
            }]
        );
        assert_eq!(owners[0].to_string(), "nginx.exe:4321");
    }

    #[test]
    fn test_windows_owner_after_service_row() {
        let owners = parse_windows_table(WINDOWS_TABLE, 135);
        assert_eq!(owners[0].process.as_deref(), Some("svchost.exe"));
        assert_eq!(owners[0].pid, "1052");
    }

    #[test]
    fn test_windows_owner_unknown() {
        let owners = parse_windows_table(WINDOWS_TABLE, 9000);
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].to_string(), "unknown:77");
    }

    #[test]
    fn test_windows_lookahead_is_bounded() {
        let table = concat!(
            "  TCP    0.0.0.0:8080    0.0.0.0:0    LISTENING    9\n",
            " a\n b\n c\n [late.exe]\n",
        );
        let owners = parse_windows_table(table, 8080);
        assert_eq!(owners[0].process, None);
    }

    #[test]
    fn test_unix_table() {
        let table = "\
Active Internet connections (only servers)
Proto Recv-Q Send-Q Local Address           Foreign Address         State       PID/Program name
tcp        0      0 0.0.0.0:8080            0.0.0.0:*               LISTEN      1234/nginx: master
tcp        0      0 127.0.0.1:5432          0.0.0.0:*               LISTEN      -
";
        let owners = parse_unix_table(table, 8080);
        assert_eq!(owners[0].to_string(), "nginx:1234");
        assert!(parse_unix_table(table, 5432).is_empty());
    }

    #[tokio::test]
    async fn test_missing_utility_reports_unknown() {
        let diagnostics = PortConflictDiagnostics::with_command(
            "definitely-not-a-real-netstat",
            vec![],
            TableFormat::Unix,
        );
        assert!(diagnostics.diagnose(8080).await.is_err());
        assert!(diagnostics.report(8080).await.is_empty());
    }
}
