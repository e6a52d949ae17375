//! Process-tree termination: find every descendant of a pid and SIGKILL them, then the root.

use std::collections::{HashMap, HashSet};
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};

fn snapshot() -> System {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    system
}

/// All recursive children of `root`, parents before their children. Does not include `root`.
pub fn descendants(system: &System, root: Pid) -> Vec<Pid> {
    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (pid, process) in system.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent).or_default().push(*pid);
        }
    }

    let mut out = Vec::new();
    let mut seen: HashSet<Pid> = HashSet::new();
    seen.insert(root);
    let mut queue = std::collections::VecDeque::from([root]);
    while let Some(current) = queue.pop_front() {
        if let Some(kids) = children.get(&current) {
            for kid in kids {
                if seen.insert(*kid) {
                    out.push(*kid);
                    queue.push_back(*kid);
                }
            }
        }
    }
    out
}

/// Kill `pid` and all of its descendants. Best-effort: processes that are already
/// gone are skipped. Returns false when `pid` itself no longer exists.
pub fn kill_tree(pid: u32) -> bool {
    let system = snapshot();
    let root = Pid::from_u32(pid);
    if system.process(root).is_none() {
        log::debug!("process {} already gone", pid);
        return false;
    }
    for child in descendants(&system, root) {
        if let Some(process) = system.process(child) {
            if !process.kill() {
                log::debug!("failed to kill descendant {} of {}", child, pid);
            }
        }
    }
    if let Some(process) = system.process(root) {
        if !process.kill() {
            log::debug!("failed to kill process {}", pid);
        }
    }
    true
}

/// True if `pid` exists and has not exited (zombies count as exited).
pub fn is_alive(pid: u32) -> bool {
    let system = snapshot();
    system
        .process(Pid::from_u32(pid))
        .map_or(false, |p| p.status() != ProcessStatus::Zombie)
}
