//! Reap command implementation.
//!
//! Runs one reaper sweep with the configured patterns, or lists what a sweep
//! would signal.

use varroa_monitor::process::ResourceReaper;
use varroa_monitor::Config;

/// Kills leftover pipeline processes and purges orphaned IPC objects.
pub fn command_reap(dry_run: bool, config: &Config) -> anyhow::Result<()> {
    let reaper = ResourceReaper::new(config.reaper.clone());

    if dry_run {
        let matches = reaper.dry_run();
        println!("🔍 Reaper dry run: {} matching process(es)", matches.len());
        for p in &matches {
            println!("   {:>7}  {:20} {}", p.pid, p.name, p.cmdline);
        }
        return Ok(());
    }

    let report = reaper.sweep();
    println!("🧹 Reaper sweep finished");
    println!("   matched by name:    {}", report.matched_by_name);
    println!("   matched by command: {}", report.matched_by_command);
    if config.reaper.purge_ipc {
        println!("   shm removed:        {}", report.ipc.shm_removed);
        println!("   semaphores removed: {}", report.ipc.sem_removed);
        if report.ipc.failures > 0 {
            println!("   ⚠️  IPC removals failed: {}", report.ipc.failures);
        }
    }
    Ok(())
}
