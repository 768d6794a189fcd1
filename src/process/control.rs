/*!
 * Process Control
 * OS capability interface for signal delivery and process-tree kills
 */

use log::{debug, info};
use std::io;
use std::sync::Arc;

/// Signal classes the escalation sequence steps through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// Ctrl+C equivalent (SIGINT)
    Interrupt,
    /// Termination request (SIGTERM)
    Terminate,
    /// Forced kill (SIGKILL)
    Kill,
}

/// One row of the OS process table
#[derive(Debug, Clone, Copy)]
pub struct ProcessEntry {
    pub pid: u32,
    pub ppid: u32,
}

/// OS-level process control capability.
///
/// One implementation per target OS; the invoker only talks to this trait
/// so escalation logic stays platform-neutral and testable.
pub trait ProcessControl: Send + Sync {
    /// Deliver a signal to a single process.
    fn signal(&self, pid: u32, kind: SignalKind) -> io::Result<()>;

    /// Snapshot of the full process table as (pid, ppid) pairs. May be
    /// empty on platforms without a readable process table; `kill_tree`
    /// then degrades to killing the root pid only.
    fn snapshot(&self) -> Vec<ProcessEntry>;
}

/// POSIX implementation backed by `kill(2)` and the `/proc` filesystem.
#[cfg(unix)]
pub struct UnixProcessControl;

#[cfg(unix)]
impl ProcessControl for UnixProcessControl {
    fn signal(&self, pid: u32, kind: SignalKind) -> io::Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let sig = match kind {
            SignalKind::Interrupt => Signal::SIGINT,
            SignalKind::Terminate => Signal::SIGTERM,
            SignalKind::Kill => Signal::SIGKILL,
        };
        kill(Pid::from_raw(pid as i32), sig).map_err(io::Error::from)
    }

    fn snapshot(&self) -> Vec<ProcessEntry> {
        let mut entries = Vec::new();
        let proc_dir = match std::fs::read_dir("/proc") {
            Ok(dir) => dir,
            Err(_) => return entries,
        };

        for dirent in proc_dir.flatten() {
            let pid: u32 = match dirent.file_name().to_string_lossy().parse() {
                Ok(pid) => pid,
                Err(_) => continue,
            };
            if let Some(ppid) = read_ppid(pid) {
                entries.push(ProcessEntry { pid, ppid });
            }
        }

        entries
    }
}

/// Parse the parent pid out of `/proc/<pid>/stat`. The comm field may
/// contain spaces and parentheses, so fields are located after the last
/// `)` rather than by naive splitting.
#[cfg(unix)]
fn read_ppid(pid: u32) -> Option<u32> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let _state = fields.next()?;
    fields.next()?.parse().ok()
}

/// Default control capability for the build target.
pub fn default_control() -> Arc<dyn ProcessControl> {
    #[cfg(unix)]
    {
        Arc::new(UnixProcessControl)
    }
    #[cfg(not(unix))]
    {
        compile_error!("fleet-agent process control requires a unix target");
    }
}

/// Force-kill `root` and every transitive descendant, children before the
/// parent that spawned them so nothing is orphaned mid-walk.
///
/// Strictly best-effort: this runs during already-failing shutdown paths,
/// so individual kill failures (process already gone, access denied) are
/// swallowed and never surfaced.
pub fn kill_tree(control: &dyn ProcessControl, root: u32) {
    let table = control.snapshot();
    info!(
        "Killing process tree of {} ({} processes scanned)",
        root,
        table.len()
    );

    struct Pending {
        pid: u32,
        children_expanded: bool,
    }

    let mut stack = vec![Pending {
        pid: root,
        children_expanded: false,
    }];

    while let Some(entry) = stack.pop() {
        let children: Vec<u32> = if entry.children_expanded {
            vec![]
        } else {
            table
                .iter()
                .filter(|p| p.ppid == entry.pid && p.pid != entry.pid)
                .map(|p| p.pid)
                .collect()
        };

        if children.is_empty() {
            debug!("Kill process {}", entry.pid);
            if let Err(e) = control.signal(entry.pid, SignalKind::Kill) {
                debug!("Ignoring kill failure for {}: {}", entry.pid, e);
            }
        } else {
            stack.push(Pending {
                pid: entry.pid,
                children_expanded: true,
            });
            for child in children {
                stack.push(Pending {
                    pid: child,
                    children_expanded: false,
                });
            }
        }
    }
}
