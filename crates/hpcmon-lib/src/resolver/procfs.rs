//! Process ownership and parentage from procfs
//!
//! Reads:
//! - /proc/<pid>/stat for parent, process group, session and task flags
//! - /proc/<pid>/status for the real uid
//! - /proc/<pid>/environ for scheduler-provided variables

use anyhow::{Context, Result};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

/// Task flag marking kernel threads (PF_KTHREAD)
const PF_KTHREAD: u64 = 0x0020_0000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub ppid: u32,
    pub pgrp: u32,
    pub session: u32,
    pub uid: u32,
    pub comm: String,
    pub state: char,
    pub kernel_thread: bool,
}

/// Fields of interest from a stat line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatFields {
    pub comm: String,
    pub state: char,
    pub ppid: u32,
    pub pgrp: u32,
    pub session: u32,
    pub flags: u64,
}

#[derive(Debug, Clone)]
pub struct ProcessTable {
    proc_path: PathBuf,
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            proc_path: PathBuf::from("/proc"),
        }
    }

    /// Table over a custom proc tree (for testing)
    pub fn with_proc_path(proc_path: impl Into<PathBuf>) -> Self {
        Self {
            proc_path: proc_path.into(),
        }
    }

    pub fn proc_path(&self) -> &Path {
        &self.proc_path
    }

    /// Parse `/proc/<pid>/stat`. The command name may itself contain spaces
    /// and parentheses, so fields are located from the last `)`.
    pub fn parse_stat(content: &str) -> Option<StatFields> {
        let open = content.find('(')?;
        let close = content.rfind(')')?;
        let comm = content.get(open + 1..close)?.to_string();
        let mut rest = content.get(close + 1..)?.split_whitespace();

        let state = rest.next()?.chars().next()?;
        let ppid = rest.next()?.parse().ok()?;
        let pgrp = rest.next()?.parse().ok()?;
        let session = rest.next()?.parse().ok()?;
        // tty_nr, tpgid
        let mut rest = rest.skip(2);
        let flags = rest.next()?.parse().ok()?;

        Some(StatFields {
            comm,
            state,
            ppid,
            pgrp,
            session,
            flags,
        })
    }

    /// Real uid from `/proc/<pid>/status`
    pub fn parse_status_uid(content: &str) -> Option<u32> {
        content
            .lines()
            .find_map(|line| line.strip_prefix("Uid:"))
            .and_then(|ids| ids.split_whitespace().next())
            .and_then(|real| real.parse().ok())
    }

    pub fn read(&self, pid: u32) -> Option<ProcessInfo> {
        let dir = self.proc_path.join(pid.to_string());
        let stat = Self::parse_stat(&fs::read_to_string(dir.join("stat")).ok()?)?;
        let uid = Self::parse_status_uid(&fs::read_to_string(dir.join("status")).ok()?)?;
        Some(ProcessInfo {
            pid,
            ppid: stat.ppid,
            pgrp: stat.pgrp,
            session: stat.session,
            uid,
            comm: stat.comm,
            state: stat.state,
            kernel_thread: stat.flags & PF_KTHREAD != 0 || (pid != 1 && stat.ppid == 2) || pid == 2,
        })
    }

    /// Every readable process, ascending by PID
    pub fn list(&self) -> Result<Vec<ProcessInfo>> {
        let entries = fs::read_dir(&self.proc_path)
            .with_context(|| format!("Failed to read {}", self.proc_path.display()))?;
        let mut pids: Vec<u32> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().and_then(|n| n.parse().ok()))
            .collect();
        pids.sort_unstable();
        // Processes can exit between listing and reading
        Ok(pids.into_iter().filter_map(|pid| self.read(pid)).collect())
    }

    /// A process counts as exited once its directory is gone or it is a zombie
    pub fn is_alive(&self, pid: u32) -> bool {
        let stat = self.proc_path.join(pid.to_string()).join("stat");
        match fs::read_to_string(stat) {
            Ok(content) => Self::parse_stat(&content).map_or(false, |s| s.state != 'Z'),
            Err(_) => false,
        }
    }

    pub fn environ(&self, pid: u32) -> Option<HashMap<String, String>> {
        let raw = fs::read(self.proc_path.join(pid.to_string()).join("environ")).ok()?;
        Some(
            raw.split(|b| *b == 0)
                .filter_map(|entry| {
                    let entry = String::from_utf8_lossy(entry);
                    let (key, value) = entry.split_once('=')?;
                    Some((key.to_string(), value.to_string()))
                })
                .collect(),
        )
    }

    /// Processes whose environment sets any of `keys` to `value`, plus all
    /// of their descendants
    pub fn pids_with_env(&self, keys: &[&str], value: &str) -> Result<BTreeSet<u32>> {
        let processes = self.list()?;
        let roots: BTreeSet<u32> = processes
            .iter()
            .filter(|p| {
                self.environ(p.pid).map_or(false, |env| {
                    keys.iter()
                        .any(|k| env.get(*k).map(String::as_str) == Some(value))
                })
            })
            .map(|p| p.pid)
            .collect();
        Ok(with_descendants(&processes, roots))
    }

    /// Kernel hostname, falling back to "localhost"
    pub fn hostname(&self) -> String {
        fs::read_to_string(self.proc_path.join("sys/kernel/hostname"))
            .map(|h| h.trim().to_string())
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "localhost".to_string())
    }
}

/// Close `roots` under the parent relation
pub fn with_descendants(processes: &[ProcessInfo], roots: BTreeSet<u32>) -> BTreeSet<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for p in processes {
        children.entry(p.ppid).or_default().push(p.pid);
    }

    let mut result = roots.clone();
    let mut stack: Vec<u32> = roots.into_iter().collect();
    while let Some(pid) = stack.pop() {
        for child in children.get(&pid).into_iter().flatten() {
            if result.insert(*child) {
                stack.push(*child);
            }
        }
    }
    result
}

/// Account database parsed from a passwd file
#[derive(Debug, Clone, Default)]
pub struct UserDb {
    by_name: HashMap<String, u32>,
    by_uid: HashMap<u32, String>,
}

impl UserDb {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(Self::parse(&content))
    }

    pub fn parse(content: &str) -> Self {
        let mut db = UserDb::default();
        for line in content.lines() {
            if line.starts_with('#') {
                continue;
            }
            let mut fields = line.split(':');
            let (Some(name), Some(_), Some(uid)) = (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let Ok(uid) = uid.parse::<u32>() else {
                continue;
            };
            db.by_name.insert(name.to_string(), uid);
            db.by_uid.entry(uid).or_insert_with(|| name.to_string());
        }
        db
    }

    pub fn uid_of(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    /// Account name, or the numeric uid when the account is unknown
    pub fn name_of(&self, uid: u32) -> String {
        self.by_uid
            .get(&uid)
            .cloned()
            .unwrap_or_else(|| uid.to_string())
    }
}
